use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::biological::BiologicalMetadataScript;
use crate::config::PipelineConfig;
use crate::domain::StudyAccession;
use crate::error::KiraError;
use crate::layout::Layout;
use crate::orchestrator::{DownloadOrchestrator, DownloadSummary, RunReport, plan_runs};
use crate::query::{EnaHttpClient, MetadataQueryClient, SraDbClient};
use crate::report::{ReconciliationReport, ReconciliationReporter};
use crate::resolver::AccessionResolver;
use crate::tools::{Compressor, FetchTool};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct StudySummary {
    pub study: StudyAccession,
    pub rows: usize,
    pub runs: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub studies: Vec<StudySummary>,
    pub downloads: DownloadSummary,
    pub report: ReconciliationReport,
}

#[derive(Serialize)]
struct OutcomeLog<'a> {
    generated_at: String,
    tool: String,
    runs: &'a [RunReport],
}

/// External collaborators a pipeline run talks to.
pub struct Collaborators<'a, C: MetadataQueryClient> {
    pub query: C,
    pub fetcher: &'a dyn FetchTool,
    pub compressor: &'a dyn Compressor,
    pub biological: Option<&'a BiologicalMetadataScript>,
}

pub struct Pipeline {
    config: PipelineConfig,
    layout: Layout,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let layout = Layout::new(config.out_root.clone());
        Self { config, layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Full run: biological metadata, study resolution, downloads, reconciliation.
    pub fn run<C: MetadataQueryClient>(
        &self,
        collaborators: Collaborators<'_, C>,
        sink: &dyn ProgressSink,
    ) -> Result<PipelineResult, KiraError> {
        let studies = read_study_list(&self.config.study_list)?;
        self.layout.ensure_dirs()?;
        sink.event(ProgressEvent {
            message: format!("=== Starting pipeline for {} studies ===", studies.len()),
            elapsed: None,
        });

        self.biological_step(collaborators.biological, sink);

        sink.event(ProgressEvent {
            message: "[Step 2] Extracting technical metadata".to_string(),
            elapsed: None,
        });
        let start = Instant::now();
        let resolver = AccessionResolver::new(collaborators.query, self.layout.clone());
        let (resolutions, runs) = resolver.resolve_all(&studies);
        let study_summaries = resolutions
            .iter()
            .zip(&studies)
            .map(|(resolution, study)| StudySummary {
                study: study.clone(),
                rows: resolution.table.records().len(),
                runs: resolution.runs.len(),
                error: resolution.error.clone(),
            })
            .collect::<Vec<_>>();
        sink.event(ProgressEvent {
            message: format!("resolved {} run references", runs.len()),
            elapsed: Some(start.elapsed()),
        });

        let planned = plan_runs(runs, self.config.row_limit);
        if self.config.row_limit.is_some() && planned.is_empty() {
            return Err(KiraError::EmptyRunSet);
        }
        sink.event(ProgressEvent {
            message: format!(
                "[Step 3] Downloading {} FASTQ runs with {} workers",
                planned.len(),
                self.config.workers
            ),
            elapsed: None,
        });
        if let Some(rows) = self.config.row_limit {
            sink.event(ProgressEvent {
                message: format!("TEST MODE: processing only 1 run with {rows} rows"),
                elapsed: None,
            });
        }
        let orchestrator = DownloadOrchestrator::new(
            &self.layout,
            collaborators.fetcher,
            collaborators.compressor,
            self.config.workers,
            self.config.row_limit,
        );
        let downloads = orchestrator.execute(planned, sink);
        info!(
            succeeded = downloads.succeeded(),
            skipped = downloads.skipped(),
            failed = downloads.failed(),
            "downloads finished"
        );
        self.write_outcome_log(&downloads)?;

        sink.event(ProgressEvent {
            message: "[Step 4] Validating".to_string(),
            elapsed: None,
        });
        let report = self.reporter()?.run(&studies)?;

        Ok(PipelineResult {
            studies: study_summaries,
            downloads,
            report,
        })
    }

    /// Reconciliation over an existing output tree.
    pub fn validate(&self, sink: &dyn ProgressSink) -> Result<ReconciliationReport, KiraError> {
        let studies = read_study_list(&self.config.study_list)?;
        sink.event(ProgressEvent {
            message: format!("Validating {} studies", studies.len()),
            elapsed: None,
        });
        self.reporter()?.run(&studies)
    }

    fn reporter(&self) -> Result<ReconciliationReporter, KiraError> {
        Ok(ReconciliationReporter::new(
            self.layout.clone(),
            self.config.scanner()?,
        ))
    }

    fn biological_step(&self, script: Option<&BiologicalMetadataScript>, sink: &dyn ProgressSink) {
        let geo_db = self.config.geo_db.as_deref().filter(|path| path.exists());
        let (Some(geo_db), Some(script)) = (geo_db, script) else {
            sink.event(ProgressEvent {
                message: "[Step 1] Skipping GEO metadata (database not provided or missing)"
                    .to_string(),
                elapsed: None,
            });
            return;
        };
        sink.event(ProgressEvent {
            message: "[Step 1] Extracting biological metadata (GEO)".to_string(),
            elapsed: None,
        });
        let start = Instant::now();
        let output_dir = self.layout.biological_output_dir();
        if let Err(err) = script.run(&self.config.study_list, &output_dir, geo_db) {
            warn!(error = %err, "biological metadata step failed");
        }
        sink.event(ProgressEvent {
            message: "biological metadata step finished".to_string(),
            elapsed: Some(start.elapsed()),
        });
    }

    fn write_outcome_log(&self, downloads: &DownloadSummary) -> Result<(), KiraError> {
        let log = OutcomeLog {
            generated_at: chrono::Utc::now().to_rfc3339(),
            tool: format!("kira-sra/{}", env!("CARGO_PKG_VERSION")),
            runs: &downloads.reports,
        };
        let content =
            serde_json::to_vec_pretty(&log).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Layout::write_bytes_atomic(&self.layout.outcomes_path(), &content)
    }
}

/// Picks the local SRAmetadb snapshot when one is configured and opens,
/// the online archive otherwise.
pub fn query_client(config: &PipelineConfig) -> Result<Box<dyn MetadataQueryClient>, KiraError> {
    if let Some(path) = config.sra_db.as_deref().filter(|path| path.exists()) {
        match SraDbClient::open(path) {
            Ok(client) => return Ok(Box::new(client)),
            Err(err) => warn!(error = %err, "falling back to the online archive"),
        }
    }
    Ok(Box::new(EnaHttpClient::new()?))
}

/// One accession per line; blank lines are ignored and malformed ones skipped
/// with a warning. Failing to read the file at all is fatal.
pub fn read_study_list(path: &Path) -> Result<Vec<StudyAccession>, KiraError> {
    let content =
        fs::read_to_string(path).map_err(|_| KiraError::StudyListRead(path.to_path_buf()))?;
    let mut studies = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse() {
            Ok(study) => studies.push(study),
            Err(err) => warn!(error = %err, "skipping study list entry"),
        }
    }
    Ok(studies)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn study_list_skips_blank_and_malformed_lines() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("studies.txt");
        fs::write(&path, "GSE1\n\n  srp2  \nnot/valid\n").unwrap();
        let studies = read_study_list(&path).unwrap();
        let studies = studies.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        assert_eq!(studies, vec!["GSE1", "SRP2"]);
    }

    #[test]
    fn unreadable_study_list_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let err = read_study_list(&temp.path().join("missing.txt")).unwrap_err();
        assert_matches!(err, KiraError::StudyListRead(_));
    }
}
