use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use legisync_adapters::{
    AliasTable, CaliforniaAdapter, IdentityResolver, MemberDirectory, MemberRoster,
    NationalDataDir, OfflineDirectory, SourceAdapter, TexasArchive,
};
use legisync_core::Level;
use legisync_storage::{CacheSnapshotStore, HttpFetcher};
use legisync_sync::{
    build_cache, resolve_session_ids, run_sync, ActionAccumulator, ActionCacheBuilder,
    LegislativeStore, LevelPolicy, PgStore, StatusLedger, SyncConfig, SyncOptions,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "legisync")]
#[command(about = "Legislative action cache builder and database sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one source into a cache snapshot directory.
    BuildCache {
        #[command(subcommand)]
        source: SourceArgs,
    },
    /// Apply a cache snapshot to the database.
    Sync(SyncArgs),
    /// Print the status row of a sync job.
    Status {
        #[arg(long)]
        job: String,
    },
}

#[derive(Debug, Args)]
struct OutputArgs {
    /// Snapshot directory; defaults to LEGISYNC_CACHE_DIR.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Start from the snapshot already in `--out`.
    #[arg(long)]
    seed: bool,
}

#[derive(Debug, Args)]
struct RosterArgs {
    #[arg(long)]
    roster: PathBuf,
    /// Assign missing member ids without consulting the database.
    #[arg(long)]
    offline: bool,
}

#[derive(Debug, Subcommand)]
enum SourceArgs {
    National {
        /// Congress data directory (`{data}/{congress}/votes/...`).
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long, default_value_t = 118)]
        congress: u32,
        /// Legislators file mapping Senate LIS ids to bioguide ids.
        #[arg(long)]
        rep_data: PathBuf,
        #[command(flatten)]
        output: OutputArgs,
    },
    California {
        /// Any year of the two-year session.
        #[arg(long)]
        session: i32,
        #[command(flatten)]
        roster: RosterArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    Texas {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long, default_value = "89R")]
        session: String,
        #[command(flatten)]
        roster: RosterArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LevelArg {
    National,
    State,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Snapshot directory; defaults to LEGISYNC_CACHE_DIR.
    #[arg(long)]
    cache: Option<PathBuf>,
    #[arg(long)]
    job: String,
    #[arg(long, value_enum)]
    level: LevelArg,
    /// Two-letter state code, required for state jobs.
    #[arg(long)]
    state: Option<String>,
    #[arg(long, default_value_t = 24)]
    tolerance_hours: i64,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    init_tracing(&config.log_level);

    match cli.command {
        Commands::BuildCache { source } => {
            build(&config, source).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync(args) => sync(&config, args).await,
        Commands::Status { job } => {
            let store = PgStore::connect(&config.database_url).await?;
            match StatusLedger::new(&store).status(&job).await? {
                Some(row) => println!("{}", serde_json::to_string_pretty(&row)?),
                None => println!("no runs recorded for job {job}"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn build(config: &SyncConfig, source: SourceArgs) -> Result<()> {
    let http = HttpFetcher::new(config.http_client_config())?;

    let (adapter, builder, output): (Box<dyn SourceAdapter>, ActionCacheBuilder, OutputArgs) =
        match source {
            SourceArgs::National {
                data_dir,
                congress,
                rep_data,
                output,
            } => {
                let aliases = AliasTable::from_legislators_file(&rep_data)?;
                info!(aliases = aliases.len(), "loaded senate id aliases");
                let dir = NationalDataDir::new(data_dir, congress);
                let builder = ActionCacheBuilder::new(IdentityResolver::national(aliases))
                    .with_bill_source(Arc::new(dir.clone()));
                let adapter: Box<dyn SourceAdapter> = Box::new(dir);
                (adapter, builder, output)
            }
            SourceArgs::California {
                session,
                roster,
                output,
            } => {
                let roster = load_roster(config, &roster, "CA").await?;
                let adapter: Box<dyn SourceAdapter> = Box::new(CaliforniaAdapter::for_year(session));
                (adapter, ActionCacheBuilder::new(IdentityResolver::state(roster)), output)
            }
            SourceArgs::Texas {
                archive,
                session,
                roster,
                output,
            } => {
                let roster = load_roster(config, &roster, "TX").await?;
                let adapter: Box<dyn SourceAdapter> = Box::new(TexasArchive::new(archive, session));
                (adapter, ActionCacheBuilder::new(IdentityResolver::state(roster)), output)
            }
        };

    let out = CacheSnapshotStore::new(output.out.unwrap_or_else(|| config.cache_dir.clone()));
    let builder = if output.seed {
        builder.with_accumulator(seed_accumulator(&out).await)
    } else {
        builder
    };

    let summary = build_cache(builder, adapter.as_ref(), &http, &out).await?;
    println!(
        "cache built: source={} success={} skipped={} failure={} total={} actions={} digest={}",
        adapter.source_id(),
        summary.tally.success,
        summary.tally.skipped,
        summary.tally.failure,
        summary.tally.total,
        summary.write.actions_written,
        summary.write.digest
    );
    Ok(())
}

/// A missing or unreadable previous snapshot starts the build from scratch.
async fn seed_accumulator(out: &CacheSnapshotStore) -> ActionAccumulator {
    match out.read_snapshot().await {
        Ok(loaded) => {
            let acc = ActionAccumulator::from_loaded(loaded);
            info!(actions = acc.len(), "seeded from previous snapshot");
            acc
        }
        Err(err) => {
            warn!(path = %out.root().display(), error = %err, "no usable seed snapshot, starting empty");
            ActionAccumulator::new()
        }
    }
}

async fn load_roster(config: &SyncConfig, args: &RosterArgs, state: &str) -> Result<MemberRoster> {
    let mut roster = MemberRoster::load(&args.roster, state)?;
    let store;
    let directory: &dyn MemberDirectory = if args.offline {
        &OfflineDirectory
    } else {
        store = PgStore::connect(&config.database_url).await?;
        &store
    };
    let assignments = roster.assign_missing_ids(directory).await?;
    if !assignments.is_empty() {
        info!(state, assigned = assignments.len(), "assigned missing member ids");
    }
    Ok(roster)
}

async fn sync(config: &SyncConfig, args: SyncArgs) -> Result<ExitCode> {
    let (level, policy) = match args.level {
        LevelArg::National => (Level::National, LevelPolicy::National),
        LevelArg::State => (
            Level::State,
            LevelPolicy::State {
                tolerance: chrono::Duration::hours(args.tolerance_hours),
            },
        ),
    };
    let state = args.state.as_deref().map(str::to_ascii_uppercase);
    if level == Level::State && state.is_none() {
        bail!("--state is required for state sync jobs");
    }

    let cache_dir = args.cache.unwrap_or_else(|| config.cache_dir.clone());
    let cache = CacheSnapshotStore::new(&cache_dir);
    ensure_snapshot(&cache, &cache_dir).await?;

    let store: Arc<dyn LegislativeStore> = Arc::new(PgStore::connect(&config.database_url).await?);
    let session_ids = resolve_session_ids(store.as_ref(), level, state.as_deref()).await?;
    let options = SyncOptions::new(args.job, policy).with_session_ids(session_ids);

    let result = run_sync(store, &cache, options).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(ExitCode::from(result.exit_code()))
}

async fn ensure_snapshot(cache: &CacheSnapshotStore, dir: &Path) -> Result<()> {
    cache
        .read_generation()
        .await
        .with_context(|| format!("{} does not hold a complete cache snapshot", dir.display()))?;
    Ok(())
}
