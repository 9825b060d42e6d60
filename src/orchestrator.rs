use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use indexmap::IndexSet;
use serde::Serialize;
use tracing::{info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::RunAccession;
use crate::layout::Layout;
use crate::tools::{Compressor, FetchTool};
use crate::worker::{DownloadOutcome, RunFetchWorker, Stage};

pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: RunAccession,
    #[serde(flatten)]
    pub outcome: DownloadOutcome,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadSummary {
    pub reports: Vec<RunReport>,
}

impl DownloadSummary {
    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, DownloadOutcome::Skipped))
    }

    pub fn succeeded(&self) -> usize {
        self.count(|outcome| matches!(outcome, DownloadOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(DownloadOutcome::is_failed)
    }

    pub fn outcome(&self, run: &RunAccession) -> Option<&DownloadOutcome> {
        self.reports
            .iter()
            .find(|report| &report.run == run)
            .map(|report| &report.outcome)
    }

    fn count(&self, pred: impl Fn(&DownloadOutcome) -> bool) -> usize {
        self.reports
            .iter()
            .filter(|report| pred(&report.outcome))
            .count()
    }
}

/// Reduces the aggregate run list to the set actually dispatched: each run once,
/// in first-seen order, and only the first one when a row limit is active.
pub fn plan_runs<I>(runs: I, row_limit: Option<u64>) -> Vec<RunAccession>
where
    I: IntoIterator<Item = RunAccession>,
{
    let unique = runs.into_iter().collect::<IndexSet<_>>();
    match row_limit {
        Some(_) => unique.into_iter().take(1).collect(),
        None => unique.into_iter().collect(),
    }
}

/// Runs fetch workers over a bounded pool of threads. Each worker owns its
/// `fastq/<run>/` directory, so the only shared state is the result channel.
pub struct DownloadOrchestrator<'a> {
    layout: &'a Layout,
    fetcher: &'a dyn FetchTool,
    compressor: &'a dyn Compressor,
    workers: usize,
    row_limit: Option<u64>,
}

impl<'a> DownloadOrchestrator<'a> {
    pub fn new(
        layout: &'a Layout,
        fetcher: &'a dyn FetchTool,
        compressor: &'a dyn Compressor,
        workers: usize,
        row_limit: Option<u64>,
    ) -> Self {
        Self {
            layout,
            fetcher,
            compressor,
            workers: workers.max(1),
            row_limit,
        }
    }

    pub fn download<I>(&self, runs: I, sink: &dyn ProgressSink) -> DownloadSummary
    where
        I: IntoIterator<Item = RunAccession>,
    {
        let planned = plan_runs(runs, self.row_limit);
        self.execute(planned, sink)
    }

    /// Dispatches `runs` as given. Returns once every run has an outcome.
    pub fn execute(&self, runs: Vec<RunAccession>, sink: &dyn ProgressSink) -> DownloadSummary {
        let total = runs.len();
        if total == 0 {
            return DownloadSummary::default();
        }
        let pool_size = self.workers.min(total);
        info!(runs = total, workers = pool_size, "dispatching downloads");

        let (job_tx, job_rx) = channel::bounded::<RunAccession>(pool_size);
        let (result_tx, result_rx) = channel::unbounded::<RunReport>();
        let worker =
            RunFetchWorker::new(self.layout, self.fetcher, self.compressor, self.row_limit);
        let worker = &worker;

        let mut reports = Vec::with_capacity(total);
        thread::scope(|scope| {
            for _ in 0..pool_size {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for run in job_rx.iter() {
                        let start = Instant::now();
                        let outcome = run_guarded(worker, &run);
                        let report = RunReport {
                            run,
                            outcome,
                            elapsed_ms: start.elapsed().as_millis(),
                        };
                        if result_tx.send(report).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(result_tx);

            // Blocks while the backlog is full.
            scope.spawn(move || {
                for run in runs {
                    if job_tx.send(run).is_err() {
                        break;
                    }
                }
            });

            for report in result_rx.iter() {
                if let DownloadOutcome::Failed { stage, reason } = &report.outcome {
                    warn!(run = report.run.as_str(), %stage, %reason, "run failed");
                }
                sink.event(ProgressEvent {
                    message: format!(
                        "[{}/{total}] {}: {}",
                        reports.len() + 1,
                        report.run,
                        report.outcome
                    ),
                    elapsed: Some(Duration::from_millis(report.elapsed_ms as u64)),
                });
                reports.push(report);
            }
        });

        DownloadSummary { reports }
    }
}

/// A panic becomes a `Failed` outcome tagged with the stage it happened in.
fn run_guarded(worker: &RunFetchWorker<'_>, run: &RunAccession) -> DownloadOutcome {
    let stage = Cell::new(Stage::CheckExisting);
    match panic::catch_unwind(AssertUnwindSafe(|| worker.run_tracked(run, &stage))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            DownloadOutcome::Failed {
                stage: stage.get(),
                reason,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::error::KiraError;
    use crate::layout::Mate;
    use crate::output::JsonOutput;
    use crate::tools::GzipCompressor;

    struct PanickingCompressor;

    impl Compressor for PanickingCompressor {
        fn compress_in_place(&self, _files: &[Utf8PathBuf]) -> Result<(), KiraError> {
            panic!("encoder bug");
        }
    }

    fn runs(values: &[&str]) -> Vec<RunAccession> {
        values.iter().map(|value| value.parse().unwrap()).collect()
    }

    #[derive(Default)]
    struct RecordingFetch {
        seen: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FetchTool for RecordingFetch {
        fn fetch(
            &self,
            run: &RunAccession,
            out_dir: &Utf8Path,
            _row_limit: Option<u64>,
        ) -> Result<(), KiraError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().unwrap().push(run.to_string());
            if run.as_str() == "BOOM" {
                self.active.fetch_sub(1, Ordering::SeqCst);
                panic!("tool wrapper bug");
            }
            if run.as_str().starts_with("BAD") {
                self.active.fetch_sub(1, Ordering::SeqCst);
                return Err(KiraError::Fetch("exit status: 1".to_string()));
            }
            thread::sleep(Duration::from_millis(20));
            fs::write(out_dir.join(format!("{run}.fastq")), b"@r\nA\n+\nI\n").unwrap();
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn layout() -> (tempfile::TempDir, Layout) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, Layout::new(root))
    }

    #[test]
    fn plan_deduplicates_across_studies() {
        let mut aggregate = runs(&["A", "B", "A", "C"]);
        aggregate.extend(runs(&["B", "D"]));
        let planned = plan_runs(aggregate, None);
        assert_eq!(planned, runs(&["A", "B", "C", "D"]));
    }

    #[test]
    fn row_limit_dispatches_exactly_one_run() {
        let planned = plan_runs(runs(&["C", "A", "B"]), Some(100));
        assert_eq!(planned, runs(&["C"]));
        assert!(plan_runs(Vec::new(), Some(100)).is_empty());
    }

    #[test]
    fn each_unique_run_is_fetched_once() {
        let (_temp, layout) = layout();
        let fetch = RecordingFetch::default();
        let orchestrator = DownloadOrchestrator::new(&layout, &fetch, &GzipCompressor, 2, None);

        let mut aggregate = runs(&["A", "B", "A", "C"]);
        aggregate.extend(runs(&["B", "D"]));
        let summary = orchestrator.download(aggregate, &JsonOutput);

        let mut seen = fetch.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["A", "B", "C", "D"]);
        assert_eq!(summary.reports.len(), 4);
        assert_eq!(summary.succeeded(), 4);
        assert!(fetch.peak.load(Ordering::SeqCst) <= 2);
        for run in runs(&["A", "B", "C", "D"]) {
            assert!(layout.canonical_path(&run, Mate::R1).exists());
        }
    }

    #[test]
    fn failures_and_panics_are_contained() {
        let (_temp, layout) = layout();
        let fetch = RecordingFetch::default();
        let orchestrator = DownloadOrchestrator::new(&layout, &fetch, &GzipCompressor, 3, None);

        let summary = orchestrator.download(runs(&["OK1", "BAD1", "BOOM", "OK2"]), &JsonOutput);

        assert_eq!(summary.reports.len(), 4);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.failed(), 2);
        let boom: RunAccession = "BOOM".parse().unwrap();
        assert!(matches!(
            summary.outcome(&boom),
            Some(DownloadOutcome::Failed { stage: Stage::Fetching, reason })
                if reason.contains("tool wrapper bug")
        ));
    }

    #[test]
    fn panic_records_the_stage_it_happened_in() {
        let (_temp, layout) = layout();
        let fetch = RecordingFetch::default();
        let orchestrator =
            DownloadOrchestrator::new(&layout, &fetch, &PanickingCompressor, 1, None);

        let summary = orchestrator.download(runs(&["OK1"]), &JsonOutput);

        let run: RunAccession = "OK1".parse().unwrap();
        assert!(matches!(
            summary.outcome(&run),
            Some(DownloadOutcome::Failed { stage: Stage::Compressing, reason })
                if reason.contains("encoder bug")
        ));
    }

    #[test]
    fn second_pass_skips_everything() {
        let (_temp, layout) = layout();
        let fetch = RecordingFetch::default();
        let orchestrator = DownloadOrchestrator::new(&layout, &fetch, &GzipCompressor, 2, None);

        orchestrator.download(runs(&["A", "B"]), &JsonOutput);
        let again = orchestrator.download(runs(&["A", "B"]), &JsonOutput);

        assert_eq!(again.skipped(), 2);
        assert_eq!(fetch.seen.lock().unwrap().len(), 2);
    }
}
