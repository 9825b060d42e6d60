use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params};
use serde_json::Value;
use tracing::debug;

use crate::domain::{StudyAccession, StudyFamily};
use crate::error::KiraError;
use crate::metadata::MetadataTable;

const ENA_PORTAL_BASE: &str = "https://www.ebi.ac.uk/ena/portal/api";
const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// Fields requested from the ENA portal for every run of a study.
const ENA_RUN_FIELDS: &[&str] = &[
    "run_accession",
    "study_accession",
    "secondary_study_accession",
    "experiment_accession",
    "experiment_alias",
    "experiment_title",
    "sample_accession",
    "secondary_sample_accession",
    "sample_alias",
    "sample_title",
    "run_alias",
    "library_layout",
    "library_strategy",
    "library_source",
    "instrument_model",
    "read_count",
    "base_count",
];

/// Answers "which runs belong to this study" with the study's technical metadata.
pub trait MetadataQueryClient: Send + Sync {
    fn study_metadata(&self, study: &StudyAccession) -> Result<MetadataTable, KiraError>;
}

impl<T: MetadataQueryClient + ?Sized> MetadataQueryClient for Box<T> {
    fn study_metadata(&self, study: &StudyAccession) -> Result<MetadataTable, KiraError> {
        (**self).study_metadata(study)
    }
}

impl<T: MetadataQueryClient + ?Sized> MetadataQueryClient for &T {
    fn study_metadata(&self, study: &StudyAccession) -> Result<MetadataTable, KiraError> {
        (**self).study_metadata(study)
    }
}

#[derive(Clone)]
pub struct EnaHttpClient {
    client: Client,
}

impl EnaHttpClient {
    pub fn new() -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-sra/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::Query(err.to_string()))?,
        );
        if let Ok(api_key) = std::env::var("NCBI_API_KEY") {
            if !api_key.trim().is_empty() {
                headers.insert(
                    "api-key",
                    HeaderValue::from_str(api_key.trim())
                        .map_err(|err| KiraError::Query(err.to_string()))?,
                );
            }
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| KiraError::Query(err.to_string()))?;
        Ok(Self { client })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, KiraError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::Query(err.to_string()));
                }
            }
        }
    }

    fn get_text(&self, url: &str, params: &[(&str, &str)]) -> Result<String, KiraError> {
        let response = self.send_with_retries(|| self.client.get(url).query(params))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "metadata request failed".to_string());
            return Err(KiraError::QueryStatus { status, message });
        }
        response
            .text()
            .map_err(|err| KiraError::Query(err.to_string()))
    }

    fn filereport(&self, accession: &str) -> Result<String, KiraError> {
        let fields = ENA_RUN_FIELDS.join(",");
        self.get_text(
            &format!("{ENA_PORTAL_BASE}/filereport"),
            &[
                ("accession", accession),
                ("result", "read_run"),
                ("fields", fields.as_str()),
                ("format", "tsv"),
            ],
        )
    }

    /// Maps a GEO series onto the SRA study it deposited reads under.
    fn geo_series_to_archive_study(&self, gse: &str) -> Result<Option<String>, KiraError> {
        let term = format!("{gse}[ACCN] AND gse[ETYP]");
        let search = self.get_text(
            &format!("{EUTILS_BASE}/esearch.fcgi"),
            &[("db", "gds"), ("term", term.as_str()), ("retmode", "json")],
        )?;
        let search: Value =
            serde_json::from_str(&search).map_err(|err| KiraError::Query(err.to_string()))?;
        let ids = search["esearchresult"]["idlist"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(None);
        }
        let id_list = ids.join(",");
        let summary = self.get_text(
            &format!("{EUTILS_BASE}/esummary.fcgi"),
            &[("db", "gds"), ("id", id_list.as_str()), ("retmode", "json")],
        )?;
        let summary: Value =
            serde_json::from_str(&summary).map_err(|err| KiraError::Query(err.to_string()))?;
        Ok(extract_sra_study(&summary, &ids))
    }
}

impl MetadataQueryClient for EnaHttpClient {
    fn study_metadata(&self, study: &StudyAccession) -> Result<MetadataTable, KiraError> {
        let accession = match study.family() {
            StudyFamily::GeoSeries => self
                .geo_series_to_archive_study(study.as_str())?
                .ok_or_else(|| {
                    KiraError::Query(format!("no SRA study linked to {}", study.as_str()))
                })?,
            _ => study.as_str().to_string(),
        };
        debug!(study = study.as_str(), accession = %accession, "ena.filereport");
        let text = self.filereport(&accession)?;
        parse_tsv_table(study.clone(), &text)
    }
}

/// Local SRAmetadb SQLite snapshot.
pub struct SraDbClient {
    conn: Mutex<Connection>,
}

impl SraDbClient {
    pub fn open(path: &Path) -> Result<Self, KiraError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|err| KiraError::LocalDb(format!("open {}: {err}", path.display())))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn query_sra(
        conn: &Connection,
        study: &StudyAccession,
        accession: &str,
    ) -> Result<MetadataTable, KiraError> {
        let mut stmt = conn
            .prepare("SELECT * FROM sra WHERE study_accession = ?1")
            .map_err(|err| KiraError::LocalDb(err.to_string()))?;
        let header = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let width = header.len();
        let rows = stmt
            .query_map(params![accession], |row| {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(value_to_text(row.get_ref(idx)?));
                }
                Ok(values)
            })
            .map_err(|err| KiraError::LocalDb(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| KiraError::LocalDb(err.to_string()))?;
        Ok(MetadataTable::from_rows(study.clone(), header, rows))
    }

    fn study_for_alias(conn: &Connection, alias: &str) -> Result<Option<String>, KiraError> {
        let mut stmt = conn
            .prepare("SELECT study_accession FROM study WHERE study_alias = ?1 LIMIT 1")
            .map_err(|err| KiraError::LocalDb(err.to_string()))?;
        let mut rows = stmt
            .query(params![alias])
            .map_err(|err| KiraError::LocalDb(err.to_string()))?;
        match rows.next().map_err(|err| KiraError::LocalDb(err.to_string()))? {
            Some(row) => row
                .get::<_, Option<String>>(0)
                .map_err(|err| KiraError::LocalDb(err.to_string())),
            None => Ok(None),
        }
    }
}

impl MetadataQueryClient for SraDbClient {
    fn study_metadata(&self, study: &StudyAccession) -> Result<MetadataTable, KiraError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| KiraError::LocalDb("connection lock poisoned".to_string()))?;
        let table = Self::query_sra(&conn, study, study.as_str())?;
        if !table.is_empty() || study.family() != StudyFamily::GeoSeries {
            return Ok(table);
        }
        match Self::study_for_alias(&conn, study.as_str())? {
            Some(archive_study) => {
                debug!(study = study.as_str(), archive_study = %archive_study, "sradb.alias");
                Self::query_sra(&conn, study, &archive_study)
            }
            None => Ok(table),
        }
    }
}

pub fn parse_tsv_table(study: StudyAccession, text: &str) -> Result<MetadataTable, KiraError> {
    if text.trim().is_empty() {
        return Ok(MetadataTable::empty(study));
    }
    MetadataTable::from_delimited(study, text.as_bytes(), b'\t')
}

fn extract_sra_study(summary: &Value, ids: &[String]) -> Option<String> {
    for uid in ids {
        let Some(relations) = summary["result"][uid.as_str()]["extrelations"].as_array() else {
            continue;
        };
        for relation in relations {
            let is_sra = relation["relationtype"]
                .as_str()
                .map(|value| value.eq_ignore_ascii_case("SRA"))
                .unwrap_or(false);
            if let (true, Some(target)) = (is_sra, relation["targetobject"].as_str()) {
                if !target.trim().is_empty() {
                    return Some(target.trim().to_string());
                }
            }
        }
    }
    None
}

fn value_to_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        ValueRef::Text(v) | ValueRef::Blob(v) => String::from_utf8_lossy(v).into_owned(),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
