use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use storm_impact::config::{ConfigLoader, ResolvedConfig, StorageSettings};
use storm_impact::domain::{CountryCode, StormId};
use storm_impact::error::ImpactError;
use storm_impact::layers::{BaseLayers, DirectorySource, initialize_countries};
use storm_impact::ledger::Ledger;
use storm_impact::output::{JsonOutput, LogProgress};
use storm_impact::pipeline::{CancelToken, Pipeline, PipelineSettings, RunOptions};
use storm_impact::providers::WarehouseClient;
use storm_impact::store::{BlobStore, LocalStore, StoragePort};

/// Exit status when the run completed but at least one unit failed.
const EXIT_FAILED_UNITS: u8 = 4;

#[derive(Parser)]
#[command(name = "storm-impact")]
#[command(about = "Tropical-storm impact analysis for children, schools and health centers")]
#[command(version, author)]
struct Cli {
    /// Path to storm-impact.json (defaults to ./storm-impact.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Comma-separated ISO3 codes overriding the configured country list.
    #[arg(long, global = true, value_delimiter = ',')]
    countries: Vec<String>,

    #[arg(long, global = true)]
    zoom: Option<u8>,

    /// Tracing filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load country base layers into storage")]
    Initialize(InitializeArgs),
    #[command(about = "Process new storm forecasts for every configured country")]
    Update(UpdateArgs),
    #[command(about = "Show processing ledger entries for a storm")]
    Status(StatusArgs),
}

#[derive(Args)]
struct InitializeArgs {
    /// Directory with pre-computed layers laid out as {ISO3}/boundary.json etc.
    #[arg(long)]
    staging: Utf8PathBuf,

    #[arg(long)]
    rewrite: bool,
}

#[derive(Args)]
struct UpdateArgs {
    #[arg(long)]
    rewrite: bool,

    /// Only forecasts issued on this day (YYYY-MM-DD).
    #[arg(long)]
    date: Option<NaiveDate>,

    #[arg(long)]
    storm: Option<StormId>,

    /// Look-back window in days when no date is given.
    #[arg(long)]
    time_delta: Option<i64>,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    storm: StormId,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(impact) = report.downcast_ref::<ImpactError>() {
                return ExitCode::from(map_exit_code(impact));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &ImpactError) -> u8 {
    if error.is_config() {
        return 2;
    }
    match error {
        ImpactError::InvalidStormId(_)
        | ImpactError::InvalidForecastTime(_)
        | ImpactError::InvalidCountryCode(_)
        | ImpactError::InvalidWindThreshold(_) => 2,
        ImpactError::InputUnavailable { .. }
        | ImpactError::WarehouseHttp(_)
        | ImpactError::WarehouseStatus { .. }
        | ImpactError::BlobHttp(_)
        | ImpactError::BlobStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    let cli = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ConfigLoader::resolve(cli.config.as_deref(), |key| std::env::var(key).ok())?;
    apply_overrides(&mut config, &cli.countries, cli.zoom)?;
    let store = open_store(&config.storage)?;

    match cli.command {
        Commands::Initialize(args) => {
            let source = DirectorySource::new(args.staging);
            let outcomes = initialize_countries(
                &store,
                &source,
                &config.countries,
                config.zoom,
                args.rewrite,
            );
            JsonOutput::print_init(&outcomes).into_diagnostic()?;
            if outcomes.iter().any(|outcome| outcome.error.is_some()) {
                return Ok(ExitCode::from(EXIT_FAILED_UNITS));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Update(args) => {
            if let Some(days) = args.time_delta {
                if days < 0 {
                    return Err(ImpactError::InvalidConfig(format!(
                        "time delta must be non-negative, got {days}"
                    ))
                    .into());
                }
                config.time_delta_days = days;
            }
            let source = WarehouseClient::new(config.require_warehouse()?.clone())?;
            let boundaries = BaseLayers::new(store.clone(), config.zoom);
            let pipeline = Pipeline::new(
                store,
                source,
                boundaries,
                PipelineSettings::from_config(&config),
            );
            let options = RunOptions {
                rewrite: args.rewrite,
                storm: args.storm,
                date: args.date,
            };
            let summary = pipeline.run(&options, &interrupt_token()?, &LogProgress)?;
            JsonOutput::print_summary(&summary).into_diagnostic()?;
            if summary.failed > 0 {
                return Ok(ExitCode::from(EXIT_FAILED_UNITS));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status(args) => {
            let ledger = Ledger::new(store);
            let mut entries = Vec::new();
            for country in &config.countries {
                entries.extend(ledger.entries_for(&args.storm, country)?);
            }
            entries.sort_by_key(|entry| entry.key());
            JsonOutput::print_status(&entries).into_diagnostic()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Token cancelled on Ctrl-C: units already persisting finish, the rest stop
/// at their next stage boundary and stay pending for the next run.
fn interrupt_token() -> miette::Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after in-flight stages");
        handler.cancel();
    })
    .into_diagnostic()?;
    Ok(cancel)
}

fn apply_overrides(
    config: &mut ResolvedConfig,
    countries: &[String],
    zoom: Option<u8>,
) -> Result<(), ImpactError> {
    if !countries.is_empty() {
        config.countries = countries
            .iter()
            .map(|code| code.parse())
            .collect::<Result<Vec<CountryCode>, _>>()?;
    }
    if let Some(zoom) = zoom {
        if !(1..=20).contains(&zoom) {
            return Err(ImpactError::InvalidConfig(format!(
                "zoom must be between 1 and 20, got {zoom}"
            )));
        }
        config.zoom = zoom;
    }
    Ok(())
}

fn open_store(settings: &StorageSettings) -> Result<Arc<dyn StoragePort>, ImpactError> {
    match settings {
        StorageSettings::Local { root } => {
            info!(root = %root, "using local storage");
            Ok(Arc::new(LocalStore::new(root.clone())))
        }
        StorageSettings::Blob {
            account_url,
            sas_token,
            container,
            read_only,
        } => {
            info!(container = container.as_str(), read_only, "using blob storage");
            Ok(Arc::new(BlobStore::new(
                account_url,
                sas_token,
                container,
                *read_only,
            )?))
        }
    }
}
