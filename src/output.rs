use std::io::{self, Write};

use serde::Serialize;

use crate::app::{PipelineResult, ProgressEvent, ProgressSink};
use crate::report::ReconciliationReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_pipeline(result: &PipelineResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_report(report: &ReconciliationReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress lines on stderr, keeping stdout for the final summary.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_pipeline(result: &PipelineResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        render_pipeline(&mut stdout, result)
    }

    pub fn print_report(report: &ReconciliationReport) -> io::Result<()> {
        let mut stdout = io::stdout();
        render_report(&mut stdout, report)
    }
}

pub fn render_pipeline(out: &mut impl Write, result: &PipelineResult) -> io::Result<()> {
    let downloads = &result.downloads;
    writeln!(out, "Downloads")?;
    writeln!(
        out,
        "  succeeded: {}  skipped: {}  failed: {}",
        downloads.succeeded(),
        downloads.skipped(),
        downloads.failed()
    )?;
    for report in downloads.reports.iter().filter(|r| r.outcome.is_failed()) {
        writeln!(out, "  {}: {}", report.run, report.outcome)?;
    }
    for study in result.studies.iter().filter(|s| s.error.is_some()) {
        if let Some(error) = &study.error {
            writeln!(out, "  {}: metadata query failed: {error}", study.study)?;
        }
    }
    writeln!(out)?;
    render_report(out, &result.report)
}

pub fn render_report(out: &mut impl Write, report: &ReconciliationReport) -> io::Result<()> {
    writeln!(
        out,
        "{:<14} {:>8} {:>8} {:>8} {:>8}",
        "study", "tech", "fastq", "bio_exp", "bio"
    )?;
    for row in &report.rows {
        let marker = if row.is_complete() { "" } else { "  *" };
        writeln!(
            out,
            "{:<14} {:>8} {:>8} {:>8} {:>8}{marker}",
            row.study_accession,
            row.n_tech_samples,
            row.n_fastq_found,
            row.n_bio_expected,
            row.n_bio_found
        )?;
    }
    for warning in &report.warnings {
        writeln!(out, "warning: {warning}")?;
    }
    Ok(())
}
