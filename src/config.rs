use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::biological::DEFAULT_SCRIPT;
use crate::error::KiraError;
use crate::orchestrator::DEFAULT_WORKERS;
use crate::xref::{CrossReferenceScanner, DEFAULT_SAMPLE_PREFIX, default_scan_columns};

pub const DEFAULT_CONFIG_FILE: &str = "kira-sra.json";

/// Optional `kira-sra.json`; every field may be omitted.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub fetch_threads: Option<usize>,
    #[serde(default)]
    pub compress_threads: Option<usize>,
    #[serde(default)]
    pub scan_columns: Option<Vec<String>>,
    #[serde(default)]
    pub sample_prefix: Option<String>,
    #[serde(default)]
    pub biological_script: Option<PathBuf>,
    #[serde(default)]
    pub tools: ToolPaths,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolPaths {
    #[serde(default)]
    pub fasterq_dump: Option<PathBuf>,
    #[serde(default)]
    pub fastq_dump: Option<PathBuf>,
    #[serde(default)]
    pub pigz: Option<PathBuf>,
    #[serde(default)]
    pub rscript: Option<PathBuf>,
}

/// Values supplied on the command line; `None` defers to the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub sra_db: Option<PathBuf>,
    pub geo_db: Option<PathBuf>,
    pub workers: Option<usize>,
    pub test_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub study_list: PathBuf,
    pub out_root: Utf8PathBuf,
    pub sra_db: Option<PathBuf>,
    pub geo_db: Option<PathBuf>,
    pub workers: usize,
    /// Test/CI mode: one run, at most this many reads.
    pub row_limit: Option<u64>,
    pub fetch_threads: usize,
    pub compress_threads: usize,
    pub scan_columns: Vec<String>,
    pub sample_prefix: String,
    pub biological_script: PathBuf,
    pub tools: ToolPaths,
}

impl PipelineConfig {
    pub fn scanner(&self) -> Result<CrossReferenceScanner, KiraError> {
        CrossReferenceScanner::new(&self.sample_prefix, self.scan_columns.clone())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config file at `path`, or `kira-sra.json` in the working
    /// directory when present. An explicit path that cannot be read is an error.
    pub fn load(path: Option<&str>) -> Result<Config, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| KiraError::ConfigParse(err.to_string()))
    }

    pub fn resolve(
        config: Config,
        study_list: PathBuf,
        out_root: Utf8PathBuf,
        cli: CliOverrides,
    ) -> Result<PipelineConfig, KiraError> {
        let workers = cli.workers.or(config.workers).unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(KiraError::ConfigParse(
                "workers must be at least 1".to_string(),
            ));
        }
        let row_limit = cli.test_limit.filter(|rows| *rows > 0);
        let resolved = PipelineConfig {
            study_list,
            out_root,
            sra_db: cli.sra_db,
            geo_db: cli.geo_db,
            workers,
            row_limit,
            fetch_threads: config.fetch_threads.unwrap_or(4).max(1),
            compress_threads: config.compress_threads.unwrap_or(4).max(1),
            scan_columns: config.scan_columns.unwrap_or_else(default_scan_columns),
            sample_prefix: config
                .sample_prefix
                .unwrap_or_else(|| DEFAULT_SAMPLE_PREFIX.to_string()),
            biological_script: config
                .biological_script
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIPT)),
            tools: config.tools,
        };
        resolved.scanner()?;
        Ok(resolved)
    }
}
