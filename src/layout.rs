use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{RunAccession, SampleAccession, StudyAccession};
use crate::error::KiraError;

/// Extension of raw reads written by the fetch tool.
pub const RAW_EXT: &str = "fastq";
/// Extension of compressed reads, canonical files included.
pub const COMPRESSED_EXT: &str = "fastq.gz";

/// Which mate a canonical file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mate {
    R1,
    R2,
}

impl Mate {
    fn label(self) -> &'static str {
        match self {
            Mate::R1 => "R1",
            Mate::R2 => "R2",
        }
    }
}

/// On-disk layout under one output root:
///
/// ```text
/// <root>/technical_metadata/<study>_metadata.csv
/// <root>/fastq/<run>/<run>_R1.fastq.gz
/// <root>/fastq/<run>/<run>_R2.fastq.gz
/// <root>/biological_metadata/metadata/<sample>_metadata.csv
/// <root>/run_counts.csv
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: Utf8PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn technical_dir(&self) -> Utf8PathBuf {
        self.root.join("technical_metadata")
    }

    pub fn fastq_dir(&self) -> Utf8PathBuf {
        self.root.join("fastq")
    }

    pub fn biological_root(&self) -> Utf8PathBuf {
        self.root.join("biological_metadata")
    }

    /// Directory the biological-metadata script writes into.
    pub fn biological_output_dir(&self) -> Utf8PathBuf {
        self.biological_root().join("metadata")
    }

    pub fn technical_metadata_path(&self, study: &StudyAccession) -> Utf8PathBuf {
        self.technical_dir()
            .join(format!("{}_metadata.csv", study.as_str()))
    }

    pub fn run_dir(&self, run: &RunAccession) -> Utf8PathBuf {
        self.fastq_dir().join(run.as_str())
    }

    pub fn canonical_path(&self, run: &RunAccession, mate: Mate) -> Utf8PathBuf {
        self.run_dir(run).join(canonical_file_name(run, mate))
    }

    pub fn report_path(&self) -> Utf8PathBuf {
        self.root.join("run_counts.csv")
    }

    pub fn outcomes_path(&self) -> Utf8PathBuf {
        self.root.join("download_outcomes.json")
    }

    pub fn ensure_dirs(&self) -> Result<(), KiraError> {
        for dir in [
            self.technical_dir(),
            self.fastq_dir(),
            self.biological_output_dir(),
        ] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| KiraError::Filesystem(format!("create {dir}: {err}")))?;
        }
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
        let parent = path
            .parent()
            .ok_or_else(|| KiraError::Filesystem(format!("invalid destination path: {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".kira-sra")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

pub fn canonical_file_name(run: &RunAccession, mate: Mate) -> String {
    format!("{}_{}.{COMPRESSED_EXT}", run.as_str(), mate.label())
}

pub fn biological_file_name(sample: &SampleAccession) -> String {
    format!("{}_metadata.csv", sample.as_str())
}
