use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use load_atoms::api::read_path;
use load_atoms::backend::Backend;
use load_atoms::checksum::digest;
use load_atoms::config::{ConfigLoader, Settings};
use load_atoms::dataset::AtomsDataset;
use load_atoms::download::HttpDownloadClient;
use load_atoms::error::AtomsError;
use load_atoms::io::JsonLinesIo;
use load_atoms::store::utf8_path;

#[derive(Parser)]
#[command(name = "load-atoms")]
#[command(about = "Download, verify and cache atomistic structure datasets")]
#[command(version, author)]
struct Cli {
    /// Settings file (defaults to ./load-atoms.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download and cache a dataset")]
    Fetch(FetchArgs),
    #[command(about = "Summarise a dataset by id or path")]
    Info(InfoArgs),
    #[command(about = "Print the content hash of a file")]
    Checksum(ChecksumArgs),
}

#[derive(Args)]
struct FetchArgs {
    id: String,

    #[arg(long)]
    root: Option<PathBuf>,

    #[arg(long)]
    quiet: bool,
}

#[derive(Args)]
struct InfoArgs {
    target: String,

    #[arg(long)]
    root: Option<PathBuf>,
}

#[derive(Args)]
struct ChecksumArgs {
    file: PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<AtomsError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AtomsError) -> u8 {
    match error {
        AtomsError::UnknownDataset { .. } => 2,
        error if error.is_network_error() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Fetch(args) => {
            let mut settings = settings(cli.config.as_deref(), args.root.as_deref())?;
            if args.quiet {
                settings.verbose = false;
            }
            let backend = Backend::new(settings, HttpDownloadClient::new()?);
            let loaded = backend.load(&args.id)?;
            let artifact = backend
                .layout()
                .artifact_path(&args.id, loaded.manifest.storage_format);
            if backend.settings().verbose {
                eprintln!();
            }
            println!(
                "{}: {} structures cached at {artifact}",
                loaded.manifest.name,
                loaded.dataset.len()
            );
            Ok(())
        }
        Commands::Info(args) => {
            let path = Path::new(&args.target);
            let dataset = if path.exists() {
                read_path(path, &JsonLinesIo)?
            } else {
                let mut settings = settings(cli.config.as_deref(), args.root.as_deref())?;
                settings.verbose = false;
                let backend = Backend::new(settings, HttpDownloadClient::new()?);
                backend.load(&args.target)?.dataset
            };
            println!("{}", dataset.summary()?);
            Ok(())
        }
        Commands::Checksum(args) => {
            println!("{}", digest(&args.file)?);
            Ok(())
        }
    }
}

fn settings(config: Option<&str>, root: Option<&Path>) -> Result<Settings, AtomsError> {
    let mut settings = ConfigLoader::resolve(config)?;
    if let Some(root) = root {
        settings.root = utf8_path(root)?;
    }
    Ok(settings)
}
