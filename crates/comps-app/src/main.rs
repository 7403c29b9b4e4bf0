// comps entry point.
//
// Startup sequence:
// 1. Parse arguments and initialize tracing
// 2. Load config (copying defaults on first run)
// 3. Open the player store
// 4. Run the pipeline or answer a query

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use comps_app::pipeline;
use comps_baseball::savant::build_source;
use comps_core::config::{self, Config};
use comps_core::db::PlayerStore;
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "comps", about = "Group hitters by batted-ball profile")]
struct Args {
    /// Directory holding config/ and defaults/
    #[arg(long, env = "COMPS_BASE_DIR", default_value = ".")]
    base_dir: PathBuf,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch seasons, cluster hitters and write them to the store
    Run {
        /// Download every season even if a cached copy is fresh
        #[arg(long)]
        refresh: bool,
    },
    /// Print one stored player
    Player { player_id: String },
    /// Print players sharing a group with the given player
    Similar {
        player_id: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Print the number of stored players in each group
    Clusters,
}

#[derive(Serialize)]
struct ClusterSize {
    cluster: i64,
    players: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_tracing(args.log_file.as_deref()) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match dispatch(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(args: Args) -> anyhow::Result<()> {
    let config = config::load_config_in(&args.base_dir).context("failed to load configuration")?;
    let store = open_store(&config, &args.base_dir)?;

    match args.command {
        Command::Run { refresh } => {
            let source_config = if refresh {
                config.source.without_cache_reuse()
            } else {
                config.source.clone()
            };
            let source = build_source(&source_config).context("failed to build season source")?;
            let report = pipeline::run(&config, source.as_ref(), &store)
                .await
                .context("pipeline run failed")?;
            print_json(&report)
        }
        Command::Player { player_id } => {
            let record = store
                .get(&player_id)
                .with_context(|| format!("failed to look up player {player_id}"))?
                .with_context(|| format!("player {player_id} not found"))?;
            print_json(&record)
        }
        Command::Similar { player_id, limit } => {
            let similar = store
                .similar_to(&player_id, limit)
                .with_context(|| format!("failed to query players similar to {player_id}"))?
                .with_context(|| format!("player {player_id} not found"))?;
            print_json(&similar)
        }
        Command::Clusters => {
            let sizes: Vec<ClusterSize> = store
                .cluster_sizes()
                .context("failed to count players per group")?
                .into_iter()
                .map(|(cluster, players)| ClusterSize { cluster, players })
                .collect();
            print_json(&sizes)
        }
    }
}

/// Open the store, resolving a relative path against `base_dir`.
fn open_store(config: &Config, base_dir: &Path) -> anyhow::Result<PlayerStore> {
    let path = if config.store.path == ":memory:" || Path::new(&config.store.path).is_absolute() {
        PathBuf::from(&config.store.path)
    } else {
        base_dir.join(&config.store.path)
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let path = path.to_string_lossy();
    let store = PlayerStore::open(&path, &config.store.table, &config.metric_fields())
        .context("failed to open player store")?;
    info!("player store opened at {} (table `{}`)", path, store.table());
    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}

/// Log to stderr, or to `log_file` when given.
fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("comps=info,comps_app=info,comps_baseball=info,comps_core=info,warn")
    });
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            let subscriber = builder
                .with_writer(file)
                .with_ansi(false)
                .with_line_number(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("failed to set tracing subscriber")?;
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("failed to set tracing subscriber")?;
        }
    }
    Ok(())
}
