use std::collections::BTreeSet;

use regex::Regex;

use crate::domain::SampleAccession;
use crate::error::KiraError;
use crate::metadata::MetadataTable;

pub const DEFAULT_SAMPLE_PREFIX: &str = "GSM";

/// Free-text columns where the archive tends to keep the GEO sample name.
pub fn default_scan_columns() -> Vec<String> {
    vec![
        "experiment_alias".to_string(),
        "sample_alias".to_string(),
        "sample_name".to_string(),
        "alias".to_string(),
        "sample_attribute".to_string(),
    ]
}

/// Finds sample accessions (`<prefix><digits>`) mentioned anywhere inside the
/// configured columns of a metadata table.
#[derive(Debug, Clone)]
pub struct CrossReferenceScanner {
    columns: Vec<String>,
    pattern: Regex,
}

impl CrossReferenceScanner {
    pub fn new(prefix: &str, columns: Vec<String>) -> Result<Self, KiraError> {
        let prefix = prefix.trim();
        if prefix.is_empty() || !prefix.chars().all(|ch| ch.is_ascii_alphabetic()) {
            return Err(KiraError::InvalidPattern(prefix.to_string()));
        }
        let pattern = Regex::new(&format!(r"{}\d+", regex::escape(prefix)))
            .map_err(|err| KiraError::InvalidPattern(err.to_string()))?;
        Ok(Self { columns, pattern })
    }

    pub fn scan(&self, table: &MetadataTable) -> BTreeSet<SampleAccession> {
        let mut found = BTreeSet::new();
        for column in &self.columns {
            for value in table.column_values(column) {
                for hit in self.pattern.find_iter(value) {
                    if let Ok(sample) = hit.as_str().parse() {
                        found.insert(sample);
                    }
                }
            }
        }
        found
    }
}

impl Default for CrossReferenceScanner {
    fn default() -> Self {
        Self {
            columns: default_scan_columns(),
            pattern: Regex::new(r"GSM\d+").expect("static sample pattern"),
        }
    }
}
