use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::Utf8Path;
use indexmap::IndexSet;
use tracing::warn;

use crate::domain::{RunAccession, StudyAccession};
use crate::error::KiraError;
use crate::layout::Layout;

/// Name of the column holding run accessions.
pub const RUN_COLUMN: &str = "run_accession";

/// One metadata row, every non-empty column kept as the archive returned it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    pub fields: BTreeMap<String, String>,
}

impl MetadataRecord {
    pub fn field(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }
}

/// Technical metadata for one study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTable {
    study: StudyAccession,
    columns: Vec<String>,
    records: Vec<MetadataRecord>,
}

impl MetadataTable {
    pub fn empty(study: StudyAccession) -> Self {
        Self {
            study,
            columns: vec![RUN_COLUMN.to_string()],
            records: Vec::new(),
        }
    }

    /// Builds a table from raw text rows. A missing `run_accession` column is
    /// tolerated and yields no runs.
    pub fn from_rows<I, R>(study: StudyAccession, header: Vec<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = String>,
    {
        let header = header
            .into_iter()
            .map(|name| name.trim().to_string())
            .collect::<Vec<_>>();
        let records = rows
            .into_iter()
            .map(|row| {
                let mut record = MetadataRecord::default();
                for (column, value) in header.iter().zip(row) {
                    if !value.is_empty() {
                        record.fields.insert(column.clone(), value);
                    }
                }
                record
            })
            .collect();
        Self {
            study,
            columns: header,
            records,
        }
    }

    pub fn study(&self) -> &StudyAccession {
        &self.study
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[MetadataRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Run accessions in row order, duplicates kept. Values that are not
    /// path-safe accessions are logged and left out.
    pub fn run_accessions(&self) -> Vec<RunAccession> {
        self.column_values(RUN_COLUMN)
            .filter_map(|value| match value.parse() {
                Ok(run) => Some(run),
                Err(err) => {
                    warn!(study = self.study.as_str(), error = %err, "skipping run");
                    None
                }
            })
            .collect()
    }

    /// Distinct run accessions in first-seen order.
    pub fn unique_runs(&self) -> IndexSet<RunAccession> {
        self.run_accessions().into_iter().collect()
    }

    /// Values of `column` in row order, skipping empty cells.
    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.records
            .iter()
            .filter_map(move |record| record.field(column))
    }

    pub fn to_csv(&self) -> Result<Vec<u8>, KiraError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&self.columns)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for record in &self.records {
            let row = self
                .columns
                .iter()
                .map(|column| record.field(column).unwrap_or(""));
            writer
                .write_record(row)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn from_csv<R: io::Read>(study: StudyAccession, reader: R) -> Result<Self, KiraError> {
        Self::from_delimited(study, reader, b',')
    }

    pub fn from_delimited<R: io::Read>(
        study: StudyAccession,
        reader: R,
        delimiter: u8,
    ) -> Result<Self, KiraError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(reader);
        let header = reader
            .headers()
            .map_err(|err| KiraError::MetadataParse(err.to_string()))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| KiraError::MetadataParse(err.to_string()))?;
            rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }
        Ok(Self::from_rows(study, header, rows))
    }

    /// Replaces whatever table was stored for this study before.
    pub fn persist(&self, path: &Utf8Path) -> Result<(), KiraError> {
        let content = self.to_csv()?;
        Layout::write_bytes_atomic(path, &content)
    }

    pub fn load(study: StudyAccession, path: &Utf8Path) -> Result<Self, KiraError> {
        let file = fs::File::open(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("open {path}: {err}")))?;
        Self::from_csv(study, file)
    }
}
