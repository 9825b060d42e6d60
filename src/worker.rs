use std::cell::Cell;
use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::debug;

use crate::domain::RunAccession;
use crate::error::KiraError;
use crate::layout::{COMPRESSED_EXT, Layout, Mate, RAW_EXT, canonical_file_name};
use crate::tools::{Compressor, FetchTool, raw_sequence_files};

/// Steps a run goes through; `Failed` outcomes record the one that broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CheckExisting,
    Fetching,
    Compressing,
    Renaming,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::CheckExisting => "check-existing",
            Stage::Fetching => "fetching",
            Stage::Compressing => "compressing",
            Stage::Renaming => "renaming",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadLayout {
    Single,
    Paired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DownloadOutcome {
    Skipped,
    Succeeded { layout: ReadLayout },
    Failed { stage: Stage, reason: String },
}

impl DownloadOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, DownloadOutcome::Failed { .. })
    }
}

impl fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadOutcome::Skipped => write!(f, "Skipped (exists)"),
            DownloadOutcome::Succeeded { layout } => write!(f, "Success ({layout:?})"),
            DownloadOutcome::Failed { stage, reason } => write!(f, "Failed at {stage} ({reason})"),
        }
    }
}

/// Fetches one run into `fastq/<run>/` and leaves it in canonical form.
pub struct RunFetchWorker<'a> {
    layout: &'a Layout,
    fetcher: &'a dyn FetchTool,
    compressor: &'a dyn Compressor,
    row_limit: Option<u64>,
}

impl<'a> RunFetchWorker<'a> {
    pub fn new(
        layout: &'a Layout,
        fetcher: &'a dyn FetchTool,
        compressor: &'a dyn Compressor,
        row_limit: Option<u64>,
    ) -> Self {
        Self {
            layout,
            fetcher,
            compressor,
            row_limit,
        }
    }

    pub fn run(&self, run: &RunAccession) -> DownloadOutcome {
        self.run_tracked(run, &Cell::new(Stage::CheckExisting))
    }

    /// Like [`run`](Self::run), recording each stage in `stage` as it starts.
    pub fn run_tracked(&self, run: &RunAccession, stage: &Cell<Stage>) -> DownloadOutcome {
        let run_dir = self.layout.run_dir(run);

        stage.set(Stage::CheckExisting);
        debug!(run = run.as_str(), stage = %Stage::CheckExisting);
        if self.layout.canonical_path(run, Mate::R1).exists() {
            return DownloadOutcome::Skipped;
        }
        if let Err(err) = prepare_run_dir(&run_dir, run) {
            return failed(Stage::CheckExisting, err);
        }

        stage.set(Stage::Fetching);
        debug!(run = run.as_str(), stage = %Stage::Fetching, row_limit = ?self.row_limit);
        if let Err(err) = self.fetcher.fetch(run, &run_dir, self.row_limit) {
            return failed(Stage::Fetching, err);
        }
        let raw = match raw_sequence_files(&run_dir) {
            Ok(raw) if raw.is_empty() => {
                return failed(
                    Stage::Fetching,
                    KiraError::Fetch("no raw sequence files were produced".to_string()),
                );
            }
            Ok(raw) => raw,
            Err(err) => return failed(Stage::Fetching, err),
        };

        stage.set(Stage::Compressing);
        debug!(run = run.as_str(), stage = %Stage::Compressing, files = raw.len());
        if let Err(err) = self.compressor.compress_in_place(&raw) {
            return failed(Stage::Compressing, err);
        }

        stage.set(Stage::Renaming);
        debug!(run = run.as_str(), stage = %Stage::Renaming);
        match canonicalize_names(&run_dir, run) {
            Ok(layout) => DownloadOutcome::Succeeded { layout },
            Err(err) => failed(Stage::Renaming, err),
        }
    }
}

fn failed(stage: Stage, err: KiraError) -> DownloadOutcome {
    DownloadOutcome::Failed {
        stage,
        reason: err.to_string(),
    }
}

/// Creates the run directory and drops leftovers of an earlier attempt that
/// never reached a canonical R1.
fn prepare_run_dir(run_dir: &Utf8Path, run: &RunAccession) -> Result<(), KiraError> {
    fs::create_dir_all(run_dir.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("create {run_dir}: {err}")))?;
    let raw_suffix = format!(".{RAW_EXT}");
    let compressed_suffix = format!(".{COMPRESSED_EXT}");
    let entries = fs::read_dir(run_dir.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        if path.is_dir() {
            if name.starts_with("fasterq.tmp") {
                fs::remove_dir_all(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
            }
            continue;
        }
        let stale = name.starts_with(run.as_str())
            && (name.ends_with(&raw_suffix) || name.ends_with(&compressed_suffix));
        if stale {
            debug!(run = run.as_str(), file = %name, "removing partial output");
            fs::remove_file(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

/// Renames whichever layout the fetch tool produced:
/// `{run}_1` → R1 and `{run}_2` → R2 for paired data, `{run}` → R1 for single-end.
/// A bare `{run}` file next to `{run}_1` holds unpaired leftovers and is left alone.
/// Nothing is renamed when no R1 source exists.
pub fn canonicalize_names(run_dir: &Utf8Path, run: &RunAccession) -> Result<ReadLayout, KiraError> {
    let produced = |suffix: &str| -> Utf8PathBuf {
        run_dir.join(format!("{}{suffix}.{COMPRESSED_EXT}", run.as_str()))
    };
    let mate_1 = produced("_1");
    let mate_2 = produced("_2");
    let single = produced("");
    let r1 = run_dir.join(canonical_file_name(run, Mate::R1));
    let r2 = run_dir.join(canonical_file_name(run, Mate::R2));

    let r1_source = if mate_1.exists() {
        mate_1
    } else if single.exists() {
        single
    } else {
        return Err(KiraError::Rename(format!(
            "no R1 file could be derived in {run_dir}"
        )));
    };
    rename(&r1_source, &r1)?;
    if mate_2.exists() {
        rename(&mate_2, &r2)?;
    }

    Ok(if r2.exists() {
        ReadLayout::Paired
    } else {
        ReadLayout::Single
    })
}

fn rename(from: &Utf8Path, to: &Utf8Path) -> Result<(), KiraError> {
    fs::rename(from.as_std_path(), to.as_std_path())
        .map_err(|err| KiraError::Rename(format!("{from} -> {to}: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::tools::GzipCompressor;

    /// Writes the given file names into the run directory and counts calls.
    struct ScriptedFetch {
        files: Vec<&'static str>,
        calls: Mutex<usize>,
    }

    impl ScriptedFetch {
        fn new(files: Vec<&'static str>) -> Self {
            Self {
                files,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl FetchTool for ScriptedFetch {
        fn fetch(
            &self,
            _run: &RunAccession,
            out_dir: &Utf8Path,
            _row_limit: Option<u64>,
        ) -> Result<(), KiraError> {
            *self.calls.lock().unwrap() += 1;
            for name in &self.files {
                fs::write(out_dir.join(name), b"@r\nACGT\n+\nIIII\n").unwrap();
            }
            Ok(())
        }
    }

    struct FailingFetch;

    impl FetchTool for FailingFetch {
        fn fetch(
            &self,
            _run: &RunAccession,
            _out_dir: &Utf8Path,
            _row_limit: Option<u64>,
        ) -> Result<(), KiraError> {
            Err(KiraError::Fetch("exit status: 3".to_string()))
        }
    }

    struct FailingCompressor;

    impl Compressor for FailingCompressor {
        fn compress_in_place(&self, _files: &[Utf8PathBuf]) -> Result<(), KiraError> {
            Err(KiraError::Compress("disk full".to_string()))
        }
    }

    fn layout() -> (tempfile::TempDir, Layout) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, Layout::new(root))
    }

    fn dir_names(dir: &Utf8Path) -> Vec<String> {
        let mut names = fs::read_dir(dir.as_std_path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn paired_output_is_renamed() {
        let (_temp, layout) = layout();
        let run: RunAccession = "SRR1".parse().unwrap();
        let fetch = ScriptedFetch::new(vec!["SRR1_1.fastq", "SRR1_2.fastq"]);
        let worker = RunFetchWorker::new(&layout, &fetch, &GzipCompressor, None);

        let outcome = worker.run(&run);
        assert_eq!(
            outcome,
            DownloadOutcome::Succeeded {
                layout: ReadLayout::Paired
            }
        );
        assert_eq!(
            dir_names(&layout.run_dir(&run)),
            vec!["SRR1_R1.fastq.gz", "SRR1_R2.fastq.gz"]
        );
    }

    #[test]
    fn single_end_output_becomes_r1_only() {
        let (_temp, layout) = layout();
        let run: RunAccession = "SRR2".parse().unwrap();
        let fetch = ScriptedFetch::new(vec!["SRR2.fastq"]);
        let worker = RunFetchWorker::new(&layout, &fetch, &GzipCompressor, None);

        let outcome = worker.run(&run);
        assert_eq!(
            outcome,
            DownloadOutcome::Succeeded {
                layout: ReadLayout::Single
            }
        );
        assert_eq!(dir_names(&layout.run_dir(&run)), vec!["SRR2_R1.fastq.gz"]);
        assert!(!layout.canonical_path(&run, Mate::R2).exists());
    }

    #[test]
    fn existing_r1_is_skipped_without_fetching() {
        let (_temp, layout) = layout();
        let run: RunAccession = "SRR3".parse().unwrap();
        fs::create_dir_all(layout.run_dir(&run).as_std_path()).unwrap();
        fs::write(layout.canonical_path(&run, Mate::R1), b"done").unwrap();
        let fetch = ScriptedFetch::new(vec!["SRR3.fastq"]);
        let worker = RunFetchWorker::new(&layout, &fetch, &GzipCompressor, None);

        assert_eq!(worker.run(&run), DownloadOutcome::Skipped);
        assert_eq!(worker.run(&run), DownloadOutcome::Skipped);
        assert_eq!(fetch.calls(), 0);
    }

    #[test]
    fn fetch_error_is_reported_not_raised() {
        let (_temp, layout) = layout();
        let run: RunAccession = "SRR4".parse().unwrap();
        let worker = RunFetchWorker::new(&layout, &FailingFetch, &GzipCompressor, None);

        let outcome = worker.run(&run);
        assert!(matches!(
            outcome,
            DownloadOutcome::Failed {
                stage: Stage::Fetching,
                ..
            }
        ));
        assert!(!layout.canonical_path(&run, Mate::R1).exists());
    }

    #[test]
    fn empty_fetch_fails() {
        let (_temp, layout) = layout();
        let run: RunAccession = "SRR5".parse().unwrap();
        let fetch = ScriptedFetch::new(vec![]);
        let worker = RunFetchWorker::new(&layout, &fetch, &GzipCompressor, None);
        assert!(worker.run(&run).is_failed());
    }

    #[test]
    fn compress_error_is_reported_at_compressing() {
        let (_temp, layout) = layout();
        let run: RunAccession = "SRR7".parse().unwrap();
        let fetch = ScriptedFetch::new(vec!["SRR7_1.fastq", "SRR7_2.fastq"]);
        let worker = RunFetchWorker::new(&layout, &fetch, &FailingCompressor, None);

        let outcome = worker.run(&run);
        assert!(matches!(
            outcome,
            DownloadOutcome::Failed {
                stage: Stage::Compressing,
                ref reason,
            } if reason.contains("disk full")
        ));
        assert!(!layout.canonical_path(&run, Mate::R1).exists());
    }

    #[test]
    fn mate_two_alone_fails_without_renaming() {
        let (_temp, layout) = layout();
        let run: RunAccession = "SRR9".parse().unwrap();
        let fetch = ScriptedFetch::new(vec!["SRR9_2.fastq"]);
        let worker = RunFetchWorker::new(&layout, &fetch, &GzipCompressor, None);

        let stage = Cell::new(Stage::CheckExisting);
        let outcome = worker.run_tracked(&run, &stage);
        assert!(matches!(
            outcome,
            DownloadOutcome::Failed {
                stage: Stage::Renaming,
                ..
            }
        ));
        assert_eq!(stage.get(), Stage::Renaming);
        assert!(!layout.canonical_path(&run, Mate::R2).exists());
        assert_eq!(dir_names(&layout.run_dir(&run)), vec!["SRR9_2.fastq.gz"]);
    }

    #[test]
    fn partial_attempt_is_cleared_before_refetch() {
        let (_temp, layout) = layout();
        let run: RunAccession = "SRR6".parse().unwrap();
        let run_dir = layout.run_dir(&run);
        fs::create_dir_all(run_dir.as_std_path()).unwrap();
        fs::write(run_dir.join("SRR6_2.fastq.gz"), b"stale").unwrap();
        fs::write(run_dir.join("SRR6_1.fastq"), b"stale").unwrap();

        let fetch = ScriptedFetch::new(vec!["SRR6.fastq"]);
        let worker = RunFetchWorker::new(&layout, &fetch, &GzipCompressor, None);
        let outcome = worker.run(&run);

        assert_eq!(
            outcome,
            DownloadOutcome::Succeeded {
                layout: ReadLayout::Single
            }
        );
        assert_eq!(dir_names(&run_dir), vec!["SRR6_R1.fastq.gz"]);
    }

    #[test]
    fn unpaired_leftovers_do_not_replace_mate_one() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let run: RunAccession = "SRR7".parse().unwrap();
        fs::write(dir.join("SRR7_1.fastq.gz"), b"mate1").unwrap();
        fs::write(dir.join("SRR7_2.fastq.gz"), b"mate2").unwrap();
        fs::write(dir.join("SRR7.fastq.gz"), b"orphans").unwrap();

        let layout = canonicalize_names(&dir, &run).unwrap();
        assert_eq!(layout, ReadLayout::Paired);
        assert_eq!(fs::read(dir.join("SRR7_R1.fastq.gz")).unwrap(), b"mate1");
        assert!(dir.join("SRR7.fastq.gz").exists());
    }
}
