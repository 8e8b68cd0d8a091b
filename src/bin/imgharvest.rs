use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use img_dataset_harvester::app::{App, HarvestOptions};
use img_dataset_harvester::config::{ConfigLoader, DEFAULT_CONFIG_FILE, ResolvedConfig, default_config};
use img_dataset_harvester::domain::SourceRequest;
use img_dataset_harvester::error::HarvestError;
use img_dataset_harvester::extract::Extractor;
use img_dataset_harvester::output::{JsonOutput, TracingSink};
use img_dataset_harvester::sources::SourceRegistry;
use img_dataset_harvester::store::DatasetStore;
use img_dataset_harvester::zarr::{ResolutionOverrides, ZarrWalker};

#[derive(Parser)]
#[command(name = "imgharvest")]
#[command(about = "Harvest 3D microscopy datasets and tabulate their image metadata")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download datasets from the configured or given sources")]
    Harvest(HarvestArgs),
    #[command(about = "Build the metadata table from downloaded datasets")]
    Extract(ExtractArgs),
    #[command(about = "Harvest, then extract")]
    Run(HarvestArgs),
    #[command(about = "Print metadata records for one array store")]
    Walk(WalkArgs),
    #[command(about = "Write a default harvest.json")]
    Init(InitArgs),
}

#[derive(Args, Clone)]
struct HarvestArgs {
    /// Source URLs, optionally prefixed with a kind (`zarr-s3:s3://...`).
    sources: Vec<String>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    save_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct ExtractArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    save_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct WalkArgs {
    root: Utf8PathBuf,

    #[arg(long)]
    config: Option<String>,

    /// Do not apply the resolution override table.
    #[arg(long)]
    no_overrides: bool,
}

#[derive(Args)]
struct InitArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    path: Utf8PathBuf,

    #[arg(long)]
    force: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::MissingConfig
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidConfig(_)
        | HarvestError::InvalidSourceUrl(_)
        | HarvestError::UnsupportedSource(_)
        | HarvestError::RootNotFound(_)
        | HarvestError::RootUnreadable { .. } => 2,
        HarvestError::Http(_) | HarvestError::HttpStatus { .. } => 3,
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
        Commands::Harvest(args) => run_harvest(args, false),
        Commands::Run(args) => run_harvest(args, true),
        Commands::Extract(args) => run_extract(args),
        Commands::Walk(args) => run_walk(args),
        Commands::Init(args) => run_init(args),
    }
}

fn run_harvest(args: HarvestArgs, then_extract: bool) -> miette::Result<()> {
    // Sources on the command line make harvest.json optional.
    let mut config = if args.sources.is_empty() {
        ConfigLoader::resolve(args.config.as_deref())?
    } else {
        ConfigLoader::resolve_or_default(args.config.as_deref())?
    };
    if !args.sources.is_empty() {
        config.sources = args
            .sources
            .iter()
            .map(|source| source.parse::<SourceRequest>())
            .collect::<Result<_, _>>()?;
    }
    apply_overrides(&mut config, args.save_dir, args.output, args.workers)?;

    let app = App::from_config(&config)?;
    let options = HarvestOptions {
        save_dir: config.save_directory.clone(),
        workers: config.workers,
    };
    let result = app.harvest(&config.sources, &options, &TracingSink)?;
    if result.failed() > 0 {
        tracing::warn!(failed = result.failed(), "some sources could not be harvested");
    }
    JsonOutput::print_harvest(&result).map_err(|err| HarvestError::Filesystem(err.to_string()))?;

    if then_extract {
        let extracted = app.extract(&config.save_directory, &config.output, &TracingSink)?;
        JsonOutput::print_extract(&extracted)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

fn run_extract(args: ExtractArgs) -> miette::Result<()> {
    let mut config = ConfigLoader::resolve_or_default(args.config.as_deref())?;
    apply_overrides(&mut config, args.save_dir, args.output, None)?;

    let extractor = Extractor::new(ZarrWalker::new(config.overrides.clone()));
    let app = App::new(SourceRegistry::new(), extractor);
    let result = app.extract(&config.save_directory, &config.output, &TracingSink)?;
    JsonOutput::print_extract(&result).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

fn run_walk(args: WalkArgs) -> miette::Result<()> {
    let overrides = if args.no_overrides {
        ResolutionOverrides::none()
    } else {
        ConfigLoader::resolve_or_default(args.config.as_deref())?.overrides
    };
    let app = App::new(
        SourceRegistry::new(),
        Extractor::new(ZarrWalker::new(overrides)),
    );
    let outcome = app.walk(&args.root, &TracingSink)?;
    JsonOutput::print_walk(&outcome).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

fn run_init(args: InitArgs) -> miette::Result<()> {
    if args.path.as_std_path().exists() && !args.force {
        return Err(HarvestError::InvalidConfig(format!(
            "{} already exists (use --force to overwrite)",
            args.path
        ))
        .into());
    }
    let content = serde_json::to_vec_pretty(&default_config())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    DatasetStore::write_bytes_atomic(&args.path, &content)?;
    tracing::info!(path = %args.path, "config written");
    Ok(())
}

fn apply_overrides(
    config: &mut ResolvedConfig,
    save_dir: Option<Utf8PathBuf>,
    output: Option<Utf8PathBuf>,
    workers: Option<usize>,
) -> Result<(), HarvestError> {
    if let Some(save_dir) = save_dir {
        config.save_directory = save_dir;
    }
    if let Some(output) = output {
        config.output = output;
    }
    match workers {
        Some(0) => {
            return Err(HarvestError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        Some(workers) => config.workers = workers,
        None => {}
    }
    Ok(())
}
