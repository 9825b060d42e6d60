use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::StudyAccession;
use crate::error::KiraError;
use crate::layout::{Layout, Mate, biological_file_name};
use crate::metadata::MetadataTable;
use crate::xref::CrossReferenceScanner;

/// One line of `run_counts.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyCounts {
    pub study_accession: String,
    /// Distinct runs listed in the technical metadata.
    pub n_tech_samples: usize,
    /// Runs with a canonical R1 file on disk.
    pub n_fastq_found: usize,
    /// Sample accessions mentioned in the technical metadata.
    pub n_bio_expected: usize,
    /// Mentioned samples that have a biological metadata file.
    pub n_bio_found: usize,
}

impl StudyCounts {
    fn zero(study: &StudyAccession) -> Self {
        Self {
            study_accession: study.as_str().to_string(),
            n_tech_samples: 0,
            n_fastq_found: 0,
            n_bio_expected: 0,
            n_bio_found: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.n_fastq_found == self.n_tech_samples && self.n_bio_found == self.n_bio_expected
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub rows: Vec<StudyCounts>,
    pub warnings: Vec<String>,
}

impl ReconciliationReport {
    pub fn to_csv(&self) -> Result<Vec<u8>, KiraError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in &self.rows {
            writer
                .serialize(row)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        if self.rows.is_empty() {
            writer
                .write_record([
                    "study_accession",
                    "n_tech_samples",
                    "n_fastq_found",
                    "n_bio_expected",
                    "n_bio_found",
                ])
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }
}

/// Compares what persisted metadata says should exist with what is on disk.
/// Read-only with respect to the download tree.
pub struct ReconciliationReporter {
    layout: Layout,
    scanner: CrossReferenceScanner,
}

impl ReconciliationReporter {
    pub fn new(layout: Layout, scanner: CrossReferenceScanner) -> Self {
        Self { layout, scanner }
    }

    pub fn reconcile(&self, studies: &[StudyAccession]) -> ReconciliationReport {
        let biological_files = self.biological_file_names();
        let mut report = ReconciliationReport::default();
        for study in studies {
            let row = match self.count_study(study, &biological_files) {
                Ok(row) => row,
                Err(message) => {
                    warn!(study = study.as_str(), "{message}");
                    report.warnings.push(message);
                    StudyCounts::zero(study)
                }
            };
            report.rows.push(row);
        }
        report
    }

    /// Reconciles and writes `run_counts.csv`.
    pub fn run(&self, studies: &[StudyAccession]) -> Result<ReconciliationReport, KiraError> {
        let report = self.reconcile(studies);
        Layout::write_bytes_atomic(&self.layout.report_path(), &report.to_csv()?)?;
        Ok(report)
    }

    fn count_study(
        &self,
        study: &StudyAccession,
        biological_files: &HashSet<String>,
    ) -> Result<StudyCounts, String> {
        let path = self.layout.technical_metadata_path(study);
        if !path.exists() {
            return Err(format!("technical metadata missing for {study}"));
        }
        let table = MetadataTable::load(study.clone(), &path)
            .map_err(|err| format!("failed to read metadata for {study}: {err}"))?;

        let runs = table.unique_runs();
        let n_fastq_found = runs
            .iter()
            .filter(|run| self.layout.canonical_path(run, Mate::R1).exists())
            .count();

        let samples = self.scanner.scan(&table);
        let n_bio_found = samples
            .iter()
            .filter(|sample| biological_files.contains(&biological_file_name(sample)))
            .count();

        Ok(StudyCounts {
            study_accession: study.as_str().to_string(),
            n_tech_samples: runs.len(),
            n_fastq_found,
            n_bio_expected: samples.len(),
            n_bio_found,
        })
    }

    /// File names anywhere under `biological_metadata/`.
    fn biological_file_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        let mut stack = vec![self.layout.biological_root().into_std_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path: PathBuf = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    names.insert(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::RunAccession;

    fn layout() -> (tempfile::TempDir, Layout) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let layout = Layout::new(root);
        layout.ensure_dirs().unwrap();
        (temp, layout)
    }

    fn touch_r1(layout: &Layout, run: &str) {
        let run: RunAccession = run.parse().unwrap();
        fs::create_dir_all(layout.run_dir(&run).as_std_path()).unwrap();
        fs::write(layout.canonical_path(&run, Mate::R1), b"").unwrap();
    }

    #[test]
    fn counts_runs_present_on_disk() {
        let (_temp, layout) = layout();
        let study: StudyAccession = "SRP1".parse().unwrap();
        fs::write(
            layout.technical_metadata_path(&study),
            "run_accession,sample_alias\nR1,GSM1\nR2,GSM2\nR3,\nR1,GSM1\n",
        )
        .unwrap();
        touch_r1(&layout, "R1");
        fs::write(layout.biological_output_dir().join("GSM2_metadata.csv"), b"x").unwrap();

        let reporter =
            ReconciliationReporter::new(layout.clone(), CrossReferenceScanner::default());
        let report = reporter.run(&[study]).unwrap();

        assert_eq!(
            report.rows,
            vec![StudyCounts {
                study_accession: "SRP1".to_string(),
                n_tech_samples: 3,
                n_fastq_found: 1,
                n_bio_expected: 2,
                n_bio_found: 1,
            }]
        );
        let csv = fs::read_to_string(layout.report_path()).unwrap();
        assert_eq!(
            csv,
            "study_accession,n_tech_samples,n_fastq_found,n_bio_expected,n_bio_found\n\
             SRP1,3,1,2,1\n"
        );
    }

    #[test]
    fn missing_metadata_counts_zero_with_warning() {
        let (_temp, layout) = layout();
        let missing: StudyAccession = "GSE404".parse().unwrap();
        let reporter = ReconciliationReporter::new(layout, CrossReferenceScanner::default());

        let report = reporter.reconcile(&[missing]);
        assert_eq!(report.rows[0].n_tech_samples, 0);
        assert_eq!(report.rows[0].n_bio_found, 0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("GSE404"));
    }

    #[test]
    fn reconciliation_leaves_download_tree_untouched() {
        let (_temp, layout) = layout();
        let study: StudyAccession = "SRP2".parse().unwrap();
        fs::write(layout.technical_metadata_path(&study), "run_accession\nR9\n").unwrap();
        let reporter =
            ReconciliationReporter::new(layout.clone(), CrossReferenceScanner::default());

        let report = reporter.reconcile(&[study]);
        assert_eq!(report.rows[0].n_fastq_found, 0);
        assert!(!report.rows[0].is_complete());
        let entries = fs::read_dir(layout.fastq_dir().as_std_path()).unwrap().count();
        assert_eq!(entries, 0);
    }
}
