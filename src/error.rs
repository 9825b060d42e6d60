use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid study accession: {0}")]
    InvalidStudyAccession(String),

    #[error("invalid run accession: {0}")]
    InvalidRunAccession(String),

    #[error("invalid sample accession: {0}")]
    InvalidSampleAccession(String),

    #[error("failed to read study list at {0}")]
    StudyListRead(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("metadata query failed: {0}")]
    Query(String),

    #[error("metadata archive returned status {status}: {message}")]
    QueryStatus { status: u16, message: String },

    #[error("local metadata database error: {0}")]
    LocalDb(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("rename failed: {0}")]
    Rename(String),

    #[error("failed to parse metadata table: {0}")]
    MetadataParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("test mode requires at least one run, but no runs were resolved")]
    #[diagnostic(help("check that the study list contains accessions the archive knows about"))]
    EmptyRunSet,

    #[error("biological metadata script failed: {0}")]
    BiologicalScript(String),

    #[error("invalid cross-reference pattern: {0}")]
    InvalidPattern(String),
}
