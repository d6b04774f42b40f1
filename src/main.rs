use std::path::PathBuf;

use model_fixtures::catalog::{self, BuildOptions, FixtureOutcome};
use model_fixtures::config::Config;
use model_fixtures::store::ArtifactStore;
use model_fixtures::table::CsvDirectory;
use model_fixtures::utils;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "model-fixtures",
    about = "Train reference models and export them with their predictions",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build fixtures (all of them unless --fixture is given)
    Build {
        /// Fixture to build; repeat to build several
        #[arg(long = "fixture", value_name = "NAME")]
        fixtures: Vec<String>,
        /// JSON catalog replacing the built-in one
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory holding input datasets and prediction CSVs
        #[arg(long)]
        csv_dir: Option<PathBuf>,
        /// Directory receiving exported models
        #[arg(long)]
        savedmodel_dir: Option<PathBuf>,
        /// Training step budget for every fixture
        #[arg(long)]
        steps: Option<u64>,
        /// Continue past failed fixtures
        #[arg(long, default_value_t = false)]
        keep_going: bool,
    },
    /// Reload built fixtures and check they reproduce their prediction CSVs
    Verify {
        /// Fixture to verify; repeat to verify several
        #[arg(long = "fixture", value_name = "NAME")]
        fixtures: Vec<String>,
        /// JSON catalog replacing the built-in one
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory holding input datasets and prediction CSVs
        #[arg(long)]
        csv_dir: Option<PathBuf>,
        /// Directory holding exported models
        #[arg(long)]
        savedmodel_dir: Option<PathBuf>,
        /// Continue past failed fixtures
        #[arg(long, default_value_t = false)]
        keep_going: bool,
    },
    /// List configured fixtures
    List {
        /// JSON catalog replacing the built-in one
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_path(path),
        None => Ok(Config::default()),
    }
}

fn resolve_config(
    path: Option<&std::path::Path>,
    csv_dir: Option<PathBuf>,
    savedmodel_dir: Option<PathBuf>,
) -> Result<Config> {
    let mut config = load_config(path)?;
    if let Some(dir) = csv_dir {
        config.csv_dir = dir;
    }
    if let Some(dir) = savedmodel_dir {
        config.savedmodel_dir = dir;
    }
    Ok(config)
}

fn finish(outcomes: &[FixtureOutcome], done: &str) -> Result<()> {
    utils::print_summary(outcomes, done);
    let failed = outcomes.iter().filter(|o| o.is_failure()).count();
    if failed > 0 {
        warn!(failed, "some fixtures failed");
        bail!("{failed} fixture(s) failed");
    }
    info!(fixtures = outcomes.len(), "all fixtures {done}");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Commands::Build {
            fixtures,
            config,
            csv_dir,
            savedmodel_dir,
            steps,
            keep_going,
        } => {
            let mut config = resolve_config(config.as_deref(), csv_dir, savedmodel_dir)?;
            if let Some(steps) = steps {
                config.override_steps(steps);
            }
            info!(
                csv_dir = %config.csv_dir.display(),
                savedmodel_dir = %config.savedmodel_dir.display(),
                ?fixtures,
                keep_going,
                "starting build"
            );

            let planned = catalog::select(catalog::plan(&config), &fixtures)?;
            let source = CsvDirectory::new(&config.csv_dir);
            let store = ArtifactStore::new(&config.csv_dir, &config.savedmodel_dir);
            let outcomes = catalog::build_all(&planned, &source, &store, BuildOptions { keep_going })?;
            finish(&outcomes, "built")?;
        }
        Commands::Verify {
            fixtures,
            config,
            csv_dir,
            savedmodel_dir,
            keep_going,
        } => {
            let config = resolve_config(config.as_deref(), csv_dir, savedmodel_dir)?;
            info!(
                csv_dir = %config.csv_dir.display(),
                savedmodel_dir = %config.savedmodel_dir.display(),
                ?fixtures,
                "starting verification"
            );

            let planned = catalog::select(catalog::plan(&config), &fixtures)?;
            let source = CsvDirectory::new(&config.csv_dir);
            let store = ArtifactStore::new(&config.csv_dir, &config.savedmodel_dir);
            let outcomes = catalog::verify_all(&planned, &source, &store, BuildOptions { keep_going })?;
            finish(&outcomes, "verified")?;
        }
        Commands::List { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", utils::format_plan(&catalog::plan(&config)));
        }
    }

    Ok(())
}
