//! In-memory [`LegislativeStore`] for tests, with injectable failures.

use std::collections::BTreeMap;

use async_trait::async_trait;
use legisync_adapters::{DirectoryMember, MemberDirectory};
use legisync_core::{Action, Amendment, Cosponsor, Level, Vote};
use tokio::sync::Mutex;

use crate::store::{LegislativeStore, OpenSession, StoreError, SyncStatusRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    UpsertAction,
    UpsertAmendment,
    UpsertCosponsors,
    UpsertVote,
    VoteRowId,
    UpsertMemberVotes,
    ReadSyncStatus,
    WriteSyncStatus,
}

/// Fails `op` for one key (action id, or job id for ledger operations), or
/// for every key when `key` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFailure {
    pub op: StoreOp,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredVote {
    pub row_id: i64,
    pub action_id: String,
    pub session_id: Option<i64>,
    pub vote: Vote,
}

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub actions: BTreeMap<String, (Action, Option<i64>)>,
    pub amendments: BTreeMap<String, (String, Amendment)>,
    pub cosponsors: BTreeMap<(String, String), Cosponsor>,
    pub votes: BTreeMap<String, StoredVote>,
    pub member_votes: BTreeMap<(String, i64), String>,
    pub sync_status: BTreeMap<String, SyncStatusRow>,
    pub sessions: Vec<OpenSession>,
    pub representatives: Vec<DirectoryMember>,
    /// Successful writes, ledger included.
    pub writes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failures: Mutex<Vec<InjectedFailure>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(tables: Tables) -> Self {
        Self {
            tables: Mutex::new(tables),
            failures: Mutex::default(),
        }
    }

    pub async fn fail_on(&self, op: StoreOp, key: Option<&str>) {
        self.failures.lock().await.push(InjectedFailure {
            op,
            key: key.map(str::to_string),
        });
    }

    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    pub async fn tables(&self) -> Tables {
        self.tables.lock().await.clone()
    }

    async fn check(&self, op: StoreOp, key: &str) -> Result<(), StoreError> {
        let failures = self.failures.lock().await;
        let hit = failures
            .iter()
            .any(|f| f.op == op && f.key.as_deref().map_or(true, |k| k == key));
        if hit {
            Err(StoreError::Backend(format!("injected {op:?} failure for {key}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LegislativeStore for MemoryStore {
    async fn upsert_action(&self, action: &Action, session_id: Option<i64>) -> Result<(), StoreError> {
        self.check(StoreOp::UpsertAction, &action.id).await?;
        let mut row = action.clone();
        row.votes.clear();
        row.amendments.clear();
        row.cosponsors.clear();
        let mut tables = self.tables.lock().await;
        tables.actions.insert(action.id.clone(), (row, session_id));
        tables.writes += 1;
        Ok(())
    }

    async fn upsert_amendment(&self, action_id: &str, amendment: &Amendment) -> Result<(), StoreError> {
        self.check(StoreOp::UpsertAmendment, action_id).await?;
        let mut tables = self.tables.lock().await;
        tables
            .amendments
            .insert(amendment.id.clone(), (action_id.to_string(), amendment.clone()));
        tables.writes += 1;
        Ok(())
    }

    async fn upsert_cosponsors(&self, action_id: &str, cosponsors: &[Cosponsor]) -> Result<(), StoreError> {
        self.check(StoreOp::UpsertCosponsors, action_id).await?;
        let mut tables = self.tables.lock().await;
        for cosponsor in cosponsors {
            tables
                .cosponsors
                .insert((cosponsor.id.clone(), action_id.to_string()), cosponsor.clone());
        }
        tables.writes += 1;
        Ok(())
    }

    async fn upsert_vote(&self, action_id: &str, session_id: Option<i64>, vote: &Vote) -> Result<(), StoreError> {
        self.check(StoreOp::UpsertVote, action_id).await?;
        let mut tables = self.tables.lock().await;
        let row_id = match tables.votes.get(&vote.alternate_id) {
            Some(existing) => existing.row_id,
            None => tables.votes.values().map(|v| v.row_id).max().unwrap_or(0) + 1,
        };
        tables.votes.insert(
            vote.alternate_id.clone(),
            StoredVote {
                row_id,
                action_id: action_id.to_string(),
                session_id,
                vote: vote.clone(),
            },
        );
        tables.writes += 1;
        Ok(())
    }

    async fn vote_row_id(&self, alternate_id: &str) -> Result<Option<i64>, StoreError> {
        let owner = {
            let tables = self.tables.lock().await;
            tables.votes.get(alternate_id).map(|v| (v.action_id.clone(), v.row_id))
        };
        if let Some((action_id, _)) = &owner {
            self.check(StoreOp::VoteRowId, action_id).await?;
        }
        Ok(owner.map(|(_, row_id)| row_id))
    }

    async fn upsert_member_votes(
        &self,
        vote_row_id: i64,
        member_votes: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let owner = {
            let tables = self.tables.lock().await;
            tables
                .votes
                .values()
                .find(|v| v.row_id == vote_row_id)
                .map(|v| v.action_id.clone())
        };
        let owner = owner.ok_or_else(|| StoreError::Backend(format!("no vote row {vote_row_id}")))?;
        self.check(StoreOp::UpsertMemberVotes, &owner).await?;

        let mut tables = self.tables.lock().await;
        for (rep_id, value) in member_votes {
            tables
                .member_votes
                .insert((rep_id.clone(), vote_row_id), value.clone());
        }
        tables.writes += 1;
        Ok(())
    }

    async fn sync_status(&self, job_id: &str) -> Result<Option<SyncStatusRow>, StoreError> {
        self.check(StoreOp::ReadSyncStatus, job_id).await?;
        Ok(self.tables.lock().await.sync_status.get(job_id).cloned())
    }

    async fn upsert_sync_status(&self, row: &SyncStatusRow) -> Result<(), StoreError> {
        self.check(StoreOp::WriteSyncStatus, &row.job_id).await?;
        let mut tables = self.tables.lock().await;
        let mut next = row.clone();
        if let Some(previous) = tables.sync_status.get(&row.job_id) {
            next.last_run = next.last_run.or(previous.last_run);
            next.last_success = next.last_success.or(previous.last_success);
        }
        tables.sync_status.insert(row.job_id.clone(), next);
        tables.writes += 1;
        Ok(())
    }

    async fn current_sessions(&self, level: Level, state: Option<&str>) -> Result<Vec<OpenSession>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .iter()
            .filter(|s| s.level == level.as_str())
            .filter(|s| state.map_or(true, |st| s.state.as_deref() == Some(st)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MemberDirectory for MemoryStore {
    async fn members_with_id_prefix(&self, prefix: &str) -> anyhow::Result<Vec<DirectoryMember>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .representatives
            .iter()
            .filter(|m| m.id.starts_with(prefix))
            .cloned()
            .collect())
    }
}
