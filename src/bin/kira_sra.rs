use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kira_sra_pipeline::app::{Collaborators, Pipeline, query_client};
use kira_sra_pipeline::biological::BiologicalMetadataScript;
use kira_sra_pipeline::config::{CliOverrides, ConfigLoader, PipelineConfig};
use kira_sra_pipeline::error::KiraError;
use kira_sra_pipeline::output::{ConsoleProgress, JsonOutput, OutputMode, TextOutput};
use kira_sra_pipeline::tools::{SraToolkit, default_compressor};

#[derive(Parser)]
#[command(name = "kira-sra")]
#[command(about = "Batch download of SRA runs for GEO/SRA studies, with reconciliation")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Resolve studies, download their runs and reconcile the results")]
    Run(RunArgs),
    #[command(about = "Reconcile an existing output tree without downloading")]
    Validate(ValidateArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    studies: PathBuf,

    #[arg(long)]
    out_dir: Utf8PathBuf,

    #[arg(long)]
    sra_db: Option<PathBuf>,

    #[arg(long)]
    geo_db: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    /// Download only the first run, capped at this many reads.
    #[arg(long)]
    test_limit: Option<u64>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long)]
    studies: PathBuf,

    #[arg(long)]
    out_dir: Utf8PathBuf,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::StudyListRead(_)
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::InvalidStudyAccession(_)
        | KiraError::InvalidPattern(_)
        | KiraError::EmptyRunSet => 2,
        KiraError::Query(_)
        | KiraError::QueryStatus { .. }
        | KiraError::MissingTool(_)
        | KiraError::Fetch(_)
        | KiraError::BiologicalScript(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Validate(args) => run_validate(args),
    }
}

fn run_pipeline(args: RunArgs) -> miette::Result<()> {
    let mode = output_mode(args.json);
    let file = ConfigLoader::load(args.config.as_deref())?;
    let config = ConfigLoader::resolve(
        file,
        args.studies,
        args.out_dir,
        CliOverrides {
            sra_db: args.sra_db,
            geo_db: args.geo_db,
            workers: args.workers,
            test_limit: args.test_limit,
        },
    )?;
    log_tools(&config);

    let fetcher = SraToolkit::with_paths(
        config.tools.fasterq_dump.clone(),
        config.tools.fastq_dump.clone(),
        config.fetch_threads,
    );
    let compressor = default_compressor(config.tools.pigz.clone(), config.compress_threads);
    let biological = BiologicalMetadataScript::new(
        config.tools.rscript.clone(),
        config.biological_script.clone(),
    );
    let query = query_client(&config)?;
    let pipeline = Pipeline::new(config);
    let collaborators = Collaborators {
        query,
        fetcher: &fetcher,
        compressor: compressor.as_ref(),
        biological: Some(&biological),
    };

    match mode {
        OutputMode::Json => {
            let result = pipeline.run(collaborators, &JsonOutput)?;
            JsonOutput::print_pipeline(&result).into_diagnostic()?;
        }
        OutputMode::Text => {
            let result = pipeline.run(collaborators, &ConsoleProgress)?;
            TextOutput::print_pipeline(&result).into_diagnostic()?;
        }
    }
    Ok(())
}

fn run_validate(args: ValidateArgs) -> miette::Result<()> {
    let file = ConfigLoader::load(args.config.as_deref())?;
    let config = ConfigLoader::resolve(
        file,
        args.studies,
        args.out_dir,
        CliOverrides::default(),
    )?;
    let pipeline = Pipeline::new(config);
    match output_mode(args.json) {
        OutputMode::Json => {
            let report = pipeline.validate(&JsonOutput)?;
            JsonOutput::print_report(&report).into_diagnostic()?;
        }
        OutputMode::Text => {
            let report = pipeline.validate(&ConsoleProgress)?;
            TextOutput::print_report(&report).into_diagnostic()?;
        }
    }
    Ok(())
}

fn output_mode(json: bool) -> OutputMode {
    if json {
        OutputMode::Json
    } else {
        OutputMode::Text
    }
}

fn log_tools(config: &PipelineConfig) {
    let toolkit = SraToolkit::with_paths(
        config.tools.fasterq_dump.clone(),
        config.tools.fastq_dump.clone(),
        config.fetch_threads,
    );
    let info = toolkit.tool_info();
    info!(
        fasterq_dump = info.fasterq_dump.as_deref().unwrap_or("missing"),
        fastq_dump = info.fastq_dump.as_deref().unwrap_or("missing"),
        pigz = info.pigz.as_deref().unwrap_or("missing"),
        "external tools"
    );
}
