use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_xnat_uploader::app::{App, Interrupt, ScanOptions, UploadOptions};
use kira_xnat_uploader::config::{ConfigLoader, DEFAULT_CONFIG_FILE, default_config, write_config};
use kira_xnat_uploader::error::KiraError;
use kira_xnat_uploader::extract::NullExtractor;
use kira_xnat_uploader::ledger::Ledger;
use kira_xnat_uploader::output::{
    ConsoleSink, JsonOutput, OutputMode, print_scan_summary, print_upload_summary,
};
use kira_xnat_uploader::transport::{
    ArchiveTransport, ResourceHandle, ResourceSpec, XnatHttpClient,
};

const DEFAULT_FILE_LIST: &str = "kira-xu-files.jsonl";

#[derive(Parser)]
#[command(name = "kira-xu")]
#[command(about = "Match imaging file trees against path recipes and upload them to XNAT")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Log filter used when RUST_LOG is not set (e.g. info, debug).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Match files under a source directory and write the file list")]
    Scan(ScanArgs),
    #[command(about = "Upload selected files from the file list and verify them")]
    Upload(UploadArgs),
    #[command(about = "Write a starter kira-xu.json")]
    Init(InitArgs),
}

#[derive(Args)]
struct ScanArgs {
    source: Utf8PathBuf,

    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value = DEFAULT_FILE_LIST)]
    list: Utf8PathBuf,

    #[arg(long)]
    include_unmatched: bool,
}

#[derive(Args)]
struct UploadArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value = DEFAULT_FILE_LIST)]
    list: Utf8PathBuf,

    #[arg(long)]
    project: Option<String>,

    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    overwrite: bool,

    #[arg(long)]
    strict_scan_ids: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct InitArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[arg(long)]
    force: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(kira) = report.downcast_ref::<KiraError>() {
                return ExitCode::from(map_exit_code(kira));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::Recipe(_)
        | KiraError::Config(_)
        | KiraError::MissingConfig(_)
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_) => 2,
        KiraError::Transport(_)
        | KiraError::TransportStatus { .. }
        | KiraError::TargetUnavailable(_) => 3,
        KiraError::Interrupted => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Scan(args) => run_scan(args, output_mode),
        Commands::Upload(args) => run_upload(args, output_mode),
        Commands::Init(args) => run_init(args),
    }
}

fn run_scan(args: ScanArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let resolved = ConfigLoader::resolve(args.config.as_deref())?;
    let app = App::new(resolved.matcher, NopTransport, NullExtractor);
    let ledger = Ledger::new(args.list);
    let options = ScanOptions {
        include_unmatched: args.include_unmatched,
        skip_image_types: resolved.xnat.skip_image_types,
        ..ScanOptions::default()
    };

    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.scan(&args.source, &ledger, options, &JsonOutput)?;
            JsonOutput::print_scan(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let result = app.scan(&args.source, &ledger, options, &ConsoleSink)?;
            print_scan_summary(&result);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_upload(args: UploadArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let resolved = ConfigLoader::resolve(args.config.as_deref())?;
    let project = args
        .project
        .or(resolved.xnat.project)
        .ok_or_else(|| KiraError::Config("no XNAT project configured".to_string()))?;
    let server = args
        .server
        .or(resolved.xnat.server)
        .ok_or_else(|| KiraError::Config("no XNAT server configured".to_string()))?;

    let ledger = Ledger::new(args.list);
    if !ledger.exists() {
        return Err(KiraError::Ledger(format!(
            "{} not found, run `kira-xu scan` first",
            ledger.path()
        ))
        .into());
    }

    let interrupt = Interrupt::new();
    let handler = interrupt.clone();
    ctrlc::set_handler(move || handler.request()).into_diagnostic()?;

    let client = XnatHttpClient::new(&server)?;
    let app = App::new(resolved.matcher, client, NullExtractor).with_interrupt(interrupt);
    let options = UploadOptions {
        project,
        overwrite: args.overwrite,
        strict_scan_ids: args.strict_scan_ids || resolved.xnat.strict_scan_ids,
        dry_run: args.dry_run,
    };

    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = app.upload(&ledger, options, &JsonOutput)?;
            JsonOutput::print_upload(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = app.upload(&ledger, options, &ConsoleSink)?;
            print_upload_summary(&result);
            result
        }
    };

    if result.interrupted {
        return Ok(ExitCode::from(map_exit_code(&KiraError::Interrupted)));
    }
    if result.failed > 0 {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_init(args: InitArgs) -> miette::Result<ExitCode> {
    write_config(&args.config, &default_config(), args.force)?;
    println!("Wrote {}", args.config.display());
    Ok(ExitCode::SUCCESS)
}

/// Scanning never talks to the archive.
struct NopTransport;

impl ArchiveTransport for NopTransport {
    fn resource(&self, _spec: &ResourceSpec) -> Result<ResourceHandle, KiraError> {
        Err(KiraError::Transport("archive client not configured".to_string()))
    }

    fn list_files(&self, _handle: &ResourceHandle) -> Result<BTreeMap<String, String>, KiraError> {
        Err(KiraError::Transport("archive client not configured".to_string()))
    }

    fn upload_file(
        &self,
        _handle: &ResourceHandle,
        _local: &Utf8Path,
        _remote_name: &str,
        _overwrite: bool,
    ) -> Result<(), KiraError> {
        Err(KiraError::Transport("archive client not configured".to_string()))
    }
}
