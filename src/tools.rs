use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::domain::RunAccession;
use crate::error::KiraError;
use crate::layout::RAW_EXT;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolInfo {
    pub fasterq_dump: Option<String>,
    pub fastq_dump: Option<String>,
    pub pigz: Option<String>,
}

/// Materializes the raw reads of one run into `out_dir` as `{run}_1.fastq`,
/// `{run}_2.fastq` and/or `{run}.fastq`.
pub trait FetchTool: Send + Sync {
    fn fetch(
        &self,
        run: &RunAccession,
        out_dir: &Utf8Path,
        row_limit: Option<u64>,
    ) -> Result<(), KiraError>;
}

/// Compresses files in place, `x.fastq` becoming `x.fastq.gz`.
pub trait Compressor: Send + Sync {
    fn compress_in_place(&self, files: &[Utf8PathBuf]) -> Result<(), KiraError>;
}

#[derive(Debug, Clone)]
pub struct SraToolkit {
    fasterq_dump: Option<PathBuf>,
    fastq_dump: Option<PathBuf>,
    threads: usize,
}

impl SraToolkit {
    pub fn new(threads: usize) -> Self {
        Self {
            fasterq_dump: find_in_path("fasterq-dump"),
            fastq_dump: find_in_path("fastq-dump"),
            threads: threads.max(1),
        }
    }

    pub fn with_paths(
        fasterq_dump: Option<PathBuf>,
        fastq_dump: Option<PathBuf>,
        threads: usize,
    ) -> Self {
        Self {
            fasterq_dump: fasterq_dump.or_else(|| find_in_path("fasterq-dump")),
            fastq_dump: fastq_dump.or_else(|| find_in_path("fastq-dump")),
            threads: threads.max(1),
        }
    }

    /// Arguments for the unlimited tool; the output directory doubles as
    /// scratch space so nothing lands in a shared temp directory.
    pub fn fasterq_dump_args(&self, run: &RunAccession, out_dir: &Utf8Path) -> Vec<String> {
        vec![
            "--split-files".to_string(),
            "--threads".to_string(),
            self.threads.to_string(),
            "--outdir".to_string(),
            out_dir.to_string(),
            "--temp".to_string(),
            out_dir.to_string(),
            run.as_str().to_string(),
        ]
    }

    /// Arguments for the row-capped tool used in test mode.
    pub fn fastq_dump_args(run: &RunAccession, out_dir: &Utf8Path, rows: u64) -> Vec<String> {
        vec![
            "--split-files".to_string(),
            "-X".to_string(),
            rows.to_string(),
            "-O".to_string(),
            out_dir.to_string(),
            run.as_str().to_string(),
        ]
    }

    pub fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            fasterq_dump: self
                .fasterq_dump
                .as_ref()
                .and_then(|path| tool_version(path, &["--version"])),
            fastq_dump: self
                .fastq_dump
                .as_ref()
                .and_then(|path| tool_version(path, &["--version"])),
            pigz: find_in_path("pigz").and_then(|path| tool_version(&path, &["--version"])),
        }
    }
}

impl FetchTool for SraToolkit {
    fn fetch(
        &self,
        run: &RunAccession,
        out_dir: &Utf8Path,
        row_limit: Option<u64>,
    ) -> Result<(), KiraError> {
        match row_limit {
            Some(rows) => {
                let program = self
                    .fastq_dump
                    .as_ref()
                    .ok_or_else(|| KiraError::MissingTool("fastq-dump".to_string()))?;
                run_cmd(program, &Self::fastq_dump_args(run, out_dir, rows))
                    .map_err(KiraError::Fetch)
            }
            None => {
                let program = self
                    .fasterq_dump
                    .as_ref()
                    .ok_or_else(|| KiraError::MissingTool("fasterq-dump".to_string()))?;
                run_cmd(program, &self.fasterq_dump_args(run, out_dir)).map_err(KiraError::Fetch)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PigzCompressor {
    program: PathBuf,
    threads: usize,
}

impl PigzCompressor {
    pub fn new(program: PathBuf, threads: usize) -> Self {
        Self {
            program,
            threads: threads.max(1),
        }
    }
}

impl Compressor for PigzCompressor {
    fn compress_in_place(&self, files: &[Utf8PathBuf]) -> Result<(), KiraError> {
        if files.is_empty() {
            return Ok(());
        }
        let mut args = vec!["-p".to_string(), self.threads.to_string()];
        args.extend(files.iter().map(|file| file.to_string()));
        run_cmd(&self.program, &args).map_err(KiraError::Compress)
    }
}

/// Single-threaded gzip through flate2, for hosts without pigz.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress_in_place(&self, files: &[Utf8PathBuf]) -> Result<(), KiraError> {
        for file in files {
            gzip_file(file).map_err(|err| KiraError::Compress(format!("{file}: {err}")))?;
        }
        Ok(())
    }
}

fn gzip_file(source: &Utf8Path) -> io::Result<()> {
    let target = Utf8PathBuf::from(format!("{source}.gz"));
    let parent = source
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file has no parent"))?;
    let temp = tempfile::Builder::new()
        .prefix(".kira-sra-gz")
        .tempfile_in(parent.as_std_path())?;
    let mut input = fs::File::open(source.as_std_path())?;
    let mut encoder = GzEncoder::new(temp.reopen()?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    // same mode as the source, as pigz does
    temp.as_file().set_permissions(input.metadata()?.permissions())?;
    temp.persist(target.as_std_path()).map_err(|err| err.error)?;
    fs::remove_file(source.as_std_path())
}

/// pigz when it can be found, in-process gzip otherwise.
pub fn default_compressor(pigz: Option<PathBuf>, threads: usize) -> Box<dyn Compressor> {
    match pigz.or_else(|| find_in_path("pigz")) {
        Some(program) => Box::new(PigzCompressor::new(program, threads)),
        None => Box::new(GzipCompressor),
    }
}

/// Raw sequence files directly inside `dir`, sorted by name.
pub fn raw_sequence_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, KiraError> {
    let suffix = format!(".{RAW_EXT}");
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
            continue;
        };
        if path
            .file_name()
            .map(|name| name.ends_with(&suffix))
            .unwrap_or(false)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Runs `program` with an explicit argument vector. On failure the error is
/// the tool's stderr, or a generic message when it printed nothing.
pub fn run_cmd(program: &Path, args: &[String]) -> Result<(), String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| format!("{}: {err}", program.display()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        Err(format!(
            "command failed: {} ({})",
            program.display(),
            output.status
        ))
    } else {
        Err(stderr)
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    // pigz prints its version on stderr
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    let text = String::from_utf8_lossy(&text).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}
