//! Cache snapshot storage + HTTP fetch utilities for legisync.

mod fetch;

pub use fetch::{FetchError, FetchedPage, HttpClientConfig, HttpFetcher, RetryPolicy};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use legisync_core::{Action, MemberIndexEntry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "legisync-storage";

/// Generation timestamp artifact; its `updated_at` is the "data as of" marker.
pub const GENERATION_FILE: &str = "cache_updated_at.json";
pub const MEMBER_INDEX_FILE: &str = "representatives.json";

/// Immutable result of one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub generated_at: DateTime<Utc>,
    pub actions: BTreeMap<String, Action>,
    pub members: BTreeMap<String, MemberIndexEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct GenerationStamp {
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("action file {file} holds action {found}")]
    IdMismatch { file: String, found: String },
    #[error("action id {0:?} cannot be used as a file name")]
    UnsafeId(String),
}

/// One `{actionId}.json` file read back from disk. Parse failures stay attached
/// to the file so the caller can isolate them.
#[derive(Debug)]
pub struct SnapshotEntry {
    pub file_name: String,
    pub action: Result<Action, SnapshotError>,
}

#[derive(Debug)]
pub struct LoadedSnapshot {
    pub generated_at: DateTime<Utc>,
    pub members: BTreeMap<String, MemberIndexEntry>,
    pub entries: Vec<SnapshotEntry>,
}

impl From<CacheSnapshot> for LoadedSnapshot {
    fn from(snapshot: CacheSnapshot) -> Self {
        let entries = snapshot
            .actions
            .into_iter()
            .map(|(id, action)| SnapshotEntry {
                file_name: format!("{id}.json"),
                action: Ok(action),
            })
            .collect();
        Self {
            generated_at: snapshot.generated_at,
            members: snapshot.members,
            entries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotWriteSummary {
    pub path: PathBuf,
    pub actions_written: usize,
    pub members_written: usize,
    pub digest: String,
}

#[derive(Debug, Clone)]
pub struct CacheSnapshotStore {
    root: PathBuf,
}

impl CacheSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn action_file_name(action_id: &str) -> Result<String, SnapshotError> {
        let unsafe_id = action_id.is_empty()
            || action_id.starts_with('.')
            || action_id.contains(['/', '\\'])
            || action_id == MEMBER_INDEX_FILE.trim_end_matches(".json")
            || action_id == GENERATION_FILE.trim_end_matches(".json");
        if unsafe_id {
            return Err(SnapshotError::UnsafeId(action_id.to_string()));
        }
        Ok(format!("{action_id}.json"))
    }

    /// Every file of a snapshot, keyed by file name, excluding the generation stamp.
    fn encode_content(snapshot: &CacheSnapshot) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
        let mut files = BTreeMap::new();
        for (id, action) in &snapshot.actions {
            let name = Self::action_file_name(id)?;
            files.insert(name, encode_json(action)?);
        }
        files.insert(MEMBER_INDEX_FILE.to_string(), encode_json(&snapshot.members)?);
        Ok(files)
    }

    /// SHA-256 over every action and member file. Independent of the
    /// generation timestamp, so identical ingestion input yields identical digests.
    pub fn snapshot_digest(snapshot: &CacheSnapshot) -> anyhow::Result<String> {
        Ok(digest_files(&Self::encode_content(snapshot)?))
    }

    /// Writes the snapshot into a private staging directory and swaps it into
    /// place, so readers see either the previous snapshot or the new one.
    /// The generation stamp is written last.
    pub async fn write_snapshot(&self, snapshot: &CacheSnapshot) -> anyhow::Result<SnapshotWriteSummary> {
        let files = Self::encode_content(snapshot)?;
        let digest = digest_files(&files);

        let parent = self
            .root
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let dir_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "cache".to_string());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot parent {}", parent.display()))?;

        let staging = parent.join(format!(".{dir_name}.staging-{}", Uuid::new_v4()));
        fs::create_dir(&staging)
            .await
            .with_context(|| format!("creating staging directory {}", staging.display()))?;

        let staged = async {
            for (name, bytes) in &files {
                write_new_file(&staging.join(name), bytes).await?;
            }
            let stamp = encode_json(&GenerationStamp {
                updated_at: snapshot.generated_at,
            })?;
            write_new_file(&staging.join(GENERATION_FILE), &stamp).await
        }
        .await;
        if let Err(err) = staged {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }

        self.swap_into_place(&parent, &dir_name, &staging).await?;

        info!(
            path = %self.root.display(),
            actions = snapshot.actions.len(),
            members = snapshot.members.len(),
            %digest,
            "cache snapshot written"
        );

        Ok(SnapshotWriteSummary {
            path: self.root.clone(),
            actions_written: snapshot.actions.len(),
            members_written: snapshot.members.len(),
            digest,
        })
    }

    async fn swap_into_place(&self, parent: &Path, dir_name: &str, staging: &Path) -> anyhow::Result<()> {
        let exists = fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking snapshot path {}", self.root.display()))?;

        if !exists {
            return fs::rename(staging, &self.root).await.with_context(|| {
                format!("renaming {} -> {}", staging.display(), self.root.display())
            });
        }

        let previous = parent.join(format!(".{dir_name}.previous-{}", Uuid::new_v4()));
        if let Err(err) = fs::rename(&self.root, &previous).await {
            let _ = fs::remove_dir_all(staging).await;
            return Err(err).with_context(|| {
                format!("moving old snapshot {} aside", self.root.display())
            });
        }

        if let Err(err) = fs::rename(staging, &self.root).await {
            // put the previous snapshot back before reporting
            let _ = fs::rename(&previous, &self.root).await;
            let _ = fs::remove_dir_all(staging).await;
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", staging.display(), self.root.display())
            });
        }

        if let Err(err) = fs::remove_dir_all(&previous).await {
            warn!(path = %previous.display(), error = %err, "failed to remove previous snapshot");
        }
        Ok(())
    }

    pub async fn read_generation(&self) -> Result<DateTime<Utc>, SnapshotError> {
        let path = self.root.join(GENERATION_FILE);
        let stamp: GenerationStamp = read_json(&path).await?;
        Ok(stamp.updated_at)
    }

    /// Reads the generation stamp, the member index and every action file.
    /// Only these artifacts are consulted; other files in the directory are ignored.
    pub async fn read_snapshot(&self) -> Result<LoadedSnapshot, SnapshotError> {
        let generated_at = self.read_generation().await?;

        let member_path = self.root.join(MEMBER_INDEX_FILE);
        let members = match read_json(&member_path).await {
            Ok(members) => members,
            Err(SnapshotError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %member_path.display(), "member index missing from snapshot");
                BTreeMap::new()
            }
            Err(err) => return Err(err),
        };

        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await.map_err(|source| SnapshotError::Io {
            path: self.root.clone(),
            source,
        })?;
        while let Some(entry) = dir.next_entry().await.map_err(|source| SnapshotError::Io {
            path: self.root.clone(),
            source,
        })? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json")
                && !name.starts_with('.')
                && name != GENERATION_FILE
                && name != MEMBER_INDEX_FILE
            {
                names.push(name);
            }
        }
        names.sort();

        let mut entries = Vec::with_capacity(names.len());
        for file_name in names {
            let path = self.root.join(&file_name);
            let action = read_json::<Action>(&path).await.and_then(|action| {
                if file_name.trim_end_matches(".json") == action.id {
                    Ok(action)
                } else {
                    Err(SnapshotError::IdMismatch {
                        file: file_name.clone(),
                        found: action.id,
                    })
                }
            });
            entries.push(SnapshotEntry { file_name, action });
        }

        Ok(LoadedSnapshot {
            generated_at,
            members,
            entries,
        })
    }
}

/// Pretty JSON with a trailing newline; the byte layout of snapshot files.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value).context("serializing snapshot json")?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn digest_files(files: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (name, bytes) in files {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, SnapshotError> {
    let bytes = fs::read(path).await.map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use legisync_core::{ActionKind, Level};
    use tempfile::tempdir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn action(id: &str) -> Action {
        Action {
            id: id.to_string(),
            kind: ActionKind::Nomination,
            level: Level::National,
            state: None,
            chamber: "s".into(),
            bill_type: None,
            congress: Some(118),
            number: Some(3),
            introduced_at: None,
            official_title: Some("PN3 nominee".into()),
            popular_title: None,
            short_title: None,
            sponsor_id: None,
            sponsor_type: None,
            status: "Confirmed".into(),
            status_at: None,
            tags: vec![],
            top_tag: None,
            summary: BTreeMap::new(),
            cache_updated_at: ts("2024-01-02T00:00:00Z"),
            source_url: "https://example.test".into(),
            cosponsors: vec![],
            amendments: vec![],
            votes: vec![],
        }
    }

    fn snapshot(ids: &[&str], generated_at: &str) -> CacheSnapshot {
        CacheSnapshot {
            generated_at: ts(generated_at),
            actions: ids.iter().map(|id| (id.to_string(), action(id))).collect(),
            members: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = CacheSnapshotStore::new(dir.path().join("118"));
        let snap = snapshot(&["sn3-118.2023", "st4-118.2023"], "2024-02-01T12:00:00Z");

        let summary = store.write_snapshot(&snap).await.expect("write");
        assert_eq!(summary.actions_written, 2);

        let loaded = store.read_snapshot().await.expect("read");
        assert_eq!(loaded.generated_at, snap.generated_at);
        let ids: Vec<_> = loaded
            .entries
            .iter()
            .map(|e| e.action.as_ref().expect("action").id.clone())
            .collect();
        assert_eq!(ids, vec!["sn3-118.2023", "st4-118.2023"]);
    }

    #[tokio::test]
    async fn rewrite_replaces_stale_action_files() {
        let dir = tempdir().expect("tempdir");
        let store = CacheSnapshotStore::new(dir.path().join("cache"));
        store
            .write_snapshot(&snapshot(&["a1", "a2"], "2024-02-01T00:00:00Z"))
            .await
            .expect("first");
        store
            .write_snapshot(&snapshot(&["a2"], "2024-02-02T00:00:00Z"))
            .await
            .expect("second");

        assert!(!dir.path().join("cache/a1.json").exists());
        let loaded = store.read_snapshot().await.expect("read");
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.generated_at, ts("2024-02-02T00:00:00Z"));

        let leftovers = std::fs::read_dir(dir.path())
            .expect("list")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_action_file_is_isolated() {
        let dir = tempdir().expect("tempdir");
        let store = CacheSnapshotStore::new(dir.path().join("cache"));
        store
            .write_snapshot(&snapshot(&["a1"], "2024-02-01T00:00:00Z"))
            .await
            .expect("write");
        std::fs::write(dir.path().join("cache/b2.json"), b"{ not json").expect("corrupt");

        let loaded = store.read_snapshot().await.expect("read");
        assert_eq!(loaded.entries.len(), 2);
        assert!(loaded.entries[0].action.is_ok());
        assert!(matches!(
            loaded.entries[1].action,
            Err(SnapshotError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn missing_generation_file_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let store = CacheSnapshotStore::new(dir.path());
        assert!(matches!(
            store.read_snapshot().await,
            Err(SnapshotError::Io { .. })
        ));
    }

    #[test]
    fn digest_ignores_generation_timestamp() {
        let a = snapshot(&["a1", "a2"], "2024-02-01T00:00:00Z");
        let b = snapshot(&["a1", "a2"], "2025-06-01T00:00:00Z");
        let c = snapshot(&["a1"], "2024-02-01T00:00:00Z");
        let da = CacheSnapshotStore::snapshot_digest(&a).expect("digest");
        assert_eq!(da, CacheSnapshotStore::snapshot_digest(&b).expect("digest"));
        assert_ne!(da, CacheSnapshotStore::snapshot_digest(&c).expect("digest"));
    }

    #[test]
    fn unsafe_action_ids_are_rejected() {
        assert!(CacheSnapshotStore::action_file_name("hr1-118").is_ok());
        assert!(CacheSnapshotStore::action_file_name("../etc").is_err());
        assert!(CacheSnapshotStore::action_file_name("representatives").is_err());
        assert!(CacheSnapshotStore::action_file_name("").is_err());
    }
}
