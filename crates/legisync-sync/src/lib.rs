//! Cache building and incremental synchronization for legisync.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use legisync_adapters::{AdapterContext, SourceAdapter};
use legisync_core::Level;
use legisync_storage::{CacheSnapshotStore, HttpFetcher, SnapshotWriteSummary};
use tracing::{info, warn};

pub mod builder;
pub mod config;
pub mod engine;
pub mod ledger;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod store;

pub use builder::{ActionAccumulator, ActionCacheBuilder, IngestOutcome, IngestTally};
pub use config::SyncConfig;
pub use engine::{
    metadata_changed, new_vote_present, ActionOutcome, LevelPolicy, SyncEngine, SyncError,
    SyncOptions, SyncResult,
};
pub use ledger::{StatusLedger, SyncErrorEntry, SyncTallies};
pub use store::{LegislativeStore, OpenSession, PgStore, RunStatus, StoreError, SyncStatusRow};

pub const CRATE_NAME: &str = "legisync-sync";

#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub tally: IngestTally,
    pub write: SnapshotWriteSummary,
}

/// Ingests one source and writes the snapshot. The generation timestamp is the
/// start of the scrape. A source that cannot be listed at all writes nothing.
pub async fn build_cache(
    mut builder: ActionCacheBuilder,
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    out: &CacheSnapshotStore,
) -> Result<BuildSummary> {
    let ctx = AdapterContext::new();
    info!(run_id = %ctx.run_id, source = adapter.source_id(), out = %out.root().display(), "building cache");

    builder
        .ingest_source(adapter, http, &ctx)
        .await
        .with_context(|| format!("listing records from {}", adapter.source_id()))?;

    let (snapshot, tally) = builder.finish(ctx.started_at);
    let write = out
        .write_snapshot(&snapshot)
        .await
        .with_context(|| format!("writing cache snapshot to {}", out.root().display()))?;
    info!(
        digest = %write.digest,
        actions = write.actions_written,
        success = tally.success,
        skipped = tally.skipped,
        failure = tally.failure,
        total = tally.total,
        "cache snapshot written"
    );
    Ok(BuildSummary { tally, write })
}

/// Reads the snapshot at `cache` and applies it for `options.job_id`.
pub async fn run_sync(
    store: Arc<dyn LegislativeStore>,
    cache: &CacheSnapshotStore,
    options: SyncOptions,
) -> Result<SyncResult> {
    let snapshot = cache
        .read_snapshot()
        .await
        .with_context(|| format!("reading cache snapshot {}", cache.root().display()))?;
    let engine = SyncEngine::new(store, options);
    let result = engine.synchronize(snapshot).await?;
    Ok(result)
}

/// `House of Representatives` / `House` -> `h`, `Assembly` -> `a`, `Senate` -> `s`.
pub fn chamber_code(chamber_name: &str) -> Option<&'static str> {
    match chamber_name.trim().to_ascii_lowercase().as_str() {
        "house of representatives" | "house" | "h" => Some("h"),
        "assembly" | "a" => Some("a"),
        "senate" | "s" => Some("s"),
        _ => None,
    }
}

/// Open session row id per chamber code.
pub async fn resolve_session_ids(
    store: &dyn LegislativeStore,
    level: Level,
    state: Option<&str>,
) -> Result<BTreeMap<String, i64>, StoreError> {
    let mut ids = BTreeMap::new();
    for session in store.current_sessions(level, state).await? {
        match chamber_code(&session.chamber) {
            Some(code) => {
                if let Some(previous) = ids.insert(code.to_string(), session.id) {
                    warn!(chamber = code, previous, current = session.id, "several open sessions, using the latest");
                }
            }
            None => warn!(chamber = %session.chamber, "unknown chamber in sessions table"),
        }
    }
    if ids.is_empty() {
        warn!(level = level.as_str(), state = ?state, "no open sessions found");
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, Tables};

    #[test]
    fn chamber_names_map_to_codes() {
        assert_eq!(chamber_code("House of Representatives"), Some("h"));
        assert_eq!(chamber_code(" Senate "), Some("s"));
        assert_eq!(chamber_code("Assembly"), Some("a"));
        assert_eq!(chamber_code("Council"), None);
    }

    #[tokio::test]
    async fn session_ids_come_from_open_sessions() {
        let session = |id, level: &str, state: Option<&str>, chamber: &str| OpenSession {
            id,
            level: level.into(),
            state: state.map(str::to_string),
            chamber: chamber.into(),
            congress: None,
        };
        let store = MemoryStore::with_tables(Tables {
            sessions: vec![
                session(1, "national", None, "House of Representatives"),
                session(2, "national", None, "Senate"),
                session(3, "state", Some("CA"), "Assembly"),
                session(4, "state", Some("CA"), "Senate"),
                session(5, "state", Some("TX"), "House"),
            ],
            ..Tables::default()
        });

        let national = resolve_session_ids(&store, Level::National, None).await.unwrap();
        assert_eq!(national, BTreeMap::from([("h".to_string(), 1), ("s".to_string(), 2)]));

        let ca = resolve_session_ids(&store, Level::State, Some("CA")).await.unwrap();
        assert_eq!(ca, BTreeMap::from([("a".to_string(), 3), ("s".to_string(), 4)]));
    }
}
