use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{ArgGroup, Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gpas_uploader::app::{Batch, Services, UploadOutcome};
use gpas_uploader::config::{Environment, FetchOptions, Token, UploadOptions, resolve_processes};
use gpas_uploader::decontam::Toolchain;
use gpas_uploader::domain::{FileType, Targets};
use gpas_uploader::error::UploaderError;
use gpas_uploader::fetcher::Fetcher;
use gpas_uploader::mapping::read_mapping;
use gpas_uploader::output::{
    JsonOutput, OutputMode, StatusFormat, render_status_csv, render_status_table,
};
use gpas_uploader::portal::{PortalClient, PortalHttpClient};
use gpas_uploader::progress::{LogProgress, ProgressSink};
use gpas_uploader::retry::RetryPolicy;
use gpas_uploader::runner::SystemRunner;
use gpas_uploader::validation::{CsvValidator, Validator};

/// Per-call limit for the portal API during an upload; file transfers have their own.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "gpas")]
#[command(about = "Upload sequencing batches to GPAS, then track and download their outputs")]
#[command(version, author)]
struct Cli {
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true, value_enum, default_value_t = Environment::Prod)]
    environment: Environment,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Validate, decontaminate and upload a batch")]
    Upload(UploadArgs),
    #[command(about = "Validate an upload CSV without uploading")]
    Validate(ValidateArgs),
    #[command(about = "Check the processing status of uploaded samples")]
    Status(StatusArgs),
    #[command(about = "Download outputs for uploaded samples")]
    Download(DownloadArgs),
}

#[derive(Args)]
struct UploadArgs {
    upload_csv: Utf8PathBuf,

    /// Access token file from the GPAS portal; without it the run stops after decontamination
    #[arg(long)]
    token: Option<PathBuf>,

    #[arg(long, default_value = "/tmp")]
    working_dir: Utf8PathBuf,

    #[arg(long, default_value = ".")]
    out_dir: Utf8PathBuf,

    /// Stop before uploading anything
    #[arg(long)]
    dry_run: bool,

    /// Emit JSON messages on stdout
    #[arg(long)]
    json_messages: bool,

    /// Concurrent decontamination processes; 0 or unset uses the CPU count
    #[arg(long)]
    processes: Option<usize>,

    /// Concurrent sample uploads
    #[arg(long, default_value_t = 10)]
    connections: usize,
}

#[derive(Args)]
struct ValidateArgs {
    upload_csv: Utf8PathBuf,

    #[arg(long)]
    json_messages: bool,
}

#[derive(Args)]
struct TargetArgs {
    /// Mapping CSV written at upload time
    #[arg(long)]
    mapping_csv: Option<Utf8PathBuf>,

    /// Comma-separated sample identifiers
    #[arg(long)]
    guids: Option<String>,
}

#[derive(Args)]
#[command(group(ArgGroup::new("targets").required(true).args(["mapping_csv", "guids"])))]
struct StatusArgs {
    #[arg(long)]
    token: PathBuf,

    #[command(flatten)]
    targets: TargetArgs,

    #[arg(long, value_enum, default_value_t = StatusFormat::Table)]
    format: StatusFormat,

    #[arg(long, default_value_t = 16)]
    connections: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Args)]
#[command(group(ArgGroup::new("targets").required(true).args(["mapping_csv", "guids"])))]
struct DownloadArgs {
    #[arg(long)]
    token: PathBuf,

    #[command(flatten)]
    targets: TargetArgs,

    /// Comma-separated outputs: json, fasta, bam, vcf
    #[arg(long, default_value = "fasta")]
    file_types: String,

    #[arg(long, default_value = ".")]
    out_dir: Utf8PathBuf,

    /// Name outputs after the local sample names in the mapping CSV
    #[arg(long, requires = "mapping_csv")]
    rename: bool,

    #[arg(long, default_value_t = 16)]
    connections: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 120)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let output_mode = OutputMode::from_flag(match &cli.command {
        Commands::Upload(args) => args.json_messages,
        Commands::Validate(args) => args.json_messages,
        Commands::Status(_) | Commands::Download(_) => false,
    });

    if let Err(report) = run(cli).await {
        let error = report.downcast_ref::<UploaderError>();
        match (output_mode, error) {
            (OutputMode::Json, Some(error)) => {
                let _ = JsonOutput::print_exception(error);
            }
            (OutputMode::Json, None) => {
                let _ = JsonOutput::print_unexpected(&report.to_string());
            }
            (OutputMode::Text, _) => eprintln!("{report:?}"),
        }
        return ExitCode::from(error.map(map_exit_code).unwrap_or(1));
    }
    ExitCode::SUCCESS
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn map_exit_code(error: &UploaderError) -> u8 {
    match error {
        UploaderError::Validation(_)
        | UploaderError::InvalidFileType(_)
        | UploaderError::Token(_)
        | UploaderError::Csv(_) => 2,
        UploaderError::Authentication { .. }
        | UploaderError::Permission(_)
        | UploaderError::Transport(_)
        | UploaderError::Status { .. }
        | UploaderError::Protocol(_)
        | UploaderError::Submission(_)
        | UploaderError::Subprocess { .. }
        | UploaderError::MissingTool(_)
        | UploaderError::MissingData(_) => 3,
        _ => 1,
    }
}

async fn run(cli: Cli) -> miette::Result<()> {
    let environment = cli.environment;
    match cli.command {
        Commands::Upload(args) => run_upload(args, environment).await,
        Commands::Validate(args) => run_validate(args),
        Commands::Status(args) => run_status(args, environment).await,
        Commands::Download(args) => run_download(args, environment).await,
    }
}

async fn run_upload(args: UploadArgs, environment: Environment) -> miette::Result<()> {
    let validated = CsvValidator.validate(&args.upload_csv)?;
    if args.json_messages {
        JsonOutput::print_validation_success(&validated).into_diagnostic()?;
    }

    let client = match &args.token {
        Some(path) => Some(PortalHttpClient::new(
            environment.endpoints(),
            &Token::load(path)?,
            REQUEST_TIMEOUT,
        )?),
        None => None,
    };
    let organism = validated
        .records
        .first()
        .map(|record| record.specimen_organism.clone())
        .unwrap_or_default();
    let tools = Toolchain::discover(&organism, validated.schema.is_alignment())?;
    let options = UploadOptions {
        working_dir: args.working_dir,
        out_dir: args.out_dir,
        processes: resolve_processes(args.processes),
        connections: args.connections,
    };

    let runner = SystemRunner;
    let sink: &dyn ProgressSink = if args.json_messages {
        &JsonOutput
    } else {
        &LogProgress
    };
    let services = Services {
        runner: &runner,
        client: client.as_ref().map(|client| client as &dyn PortalClient),
        sink,
    };
    let mut batch = Batch::new(validated, options, tools, services).await?;
    match batch.upload(args.dry_run).await? {
        UploadOutcome::Submitted { summary, mapping } => {
            if args.json_messages {
                JsonOutput::print_submission(&summary).into_diagnostic()?;
            } else {
                println!(
                    "Uploaded batch {} ({} samples); mapping saved to {mapping}",
                    summary.batch,
                    summary.samples.len()
                );
            }
        }
        UploadOutcome::DryRun { batch_guid, mapping } => {
            info!("Dry run complete for batch {batch_guid}; mapping saved to {mapping}");
        }
        UploadOutcome::NoToken => {
            info!("Decontaminated reads left in {}", batch_working_dir(&batch));
        }
    }
    Ok(())
}

fn batch_working_dir(batch: &Batch<'_>) -> String {
    batch
        .samples()
        .first()
        .and_then(|sample| sample.clean.as_ref())
        .and_then(|clean| clean.paths().first().and_then(|path| path.parent()))
        .map(|dir| dir.to_string())
        .unwrap_or_default()
}

fn run_validate(args: ValidateArgs) -> miette::Result<()> {
    let validated = CsvValidator.validate(&args.upload_csv)?;
    if args.json_messages {
        JsonOutput::print_validation_success(&validated).into_diagnostic()?;
    } else {
        println!(
            "Validation successful: {} sample(s) ({})",
            validated.records.len(),
            validated.schema
        );
    }
    Ok(())
}

fn targets(args: &TargetArgs, rename: bool) -> Result<Targets, UploaderError> {
    if let Some(path) = &args.mapping_csv {
        let names = read_mapping(path)?;
        if rename {
            return Ok(Targets::ByIdentifierWithLocalName(names));
        }
        let mut guids = names.into_keys().collect::<Vec<_>>();
        guids.sort();
        return Ok(Targets::ByIdentifier(guids));
    }
    let guids = args
        .guids
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|guid| !guid.is_empty())
        .map(str::to_string)
        .collect();
    Ok(Targets::ByIdentifier(guids))
}

fn fetch_client(
    token: &Path,
    environment: Environment,
    timeout: Duration,
) -> Result<PortalHttpClient, UploaderError> {
    PortalHttpClient::new(environment.endpoints(), &Token::load(token)?, timeout)
}

async fn run_status(args: StatusArgs, environment: Environment) -> miette::Result<()> {
    let options = FetchOptions {
        connections: args.connections,
        timeout: Duration::from_secs(args.timeout),
        ..FetchOptions::default()
    };
    let client = fetch_client(&args.token, environment, options.timeout)?;
    let targets = targets(&args.targets, true)?;
    let fetcher = Fetcher {
        client: &client,
        connections: options.connections,
        policy: RetryPolicy::transport(),
    };
    let statuses = fetcher.status(&targets).await?;
    match args.format {
        StatusFormat::Table => print!("{}", render_status_table(&statuses)),
        StatusFormat::Csv => print!("{}", render_status_csv(&statuses)?),
        StatusFormat::Json => JsonOutput::print_statuses(&statuses).into_diagnostic()?,
    }
    Ok(())
}

async fn run_download(args: DownloadArgs, environment: Environment) -> miette::Result<()> {
    let file_types = FileType::parse_list(&args.file_types)?;
    let options = FetchOptions {
        connections: args.connections,
        timeout: Duration::from_secs(args.timeout),
        out_dir: args.out_dir,
    };
    let client = fetch_client(&args.token, environment, options.timeout)?;
    let targets = targets(&args.targets, args.rename)?;
    let fetcher = Fetcher {
        client: &client,
        connections: options.connections,
        policy: RetryPolicy::transport(),
    };
    let written = fetcher.download(&targets, &file_types, &options.out_dir).await?;
    info!("Downloaded {} file(s) to {}", written.len(), options.out_dir);
    Ok(())
}
