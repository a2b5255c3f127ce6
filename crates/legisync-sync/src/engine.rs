//! Synchronization Engine: diffs a cache snapshot against the last successful
//! run of a job and applies the difference, one action at a time.
//!
//! Failures are isolated per action. Rows already written for a failed action
//! stay written; the next run retries it because `last_success` does not move.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use legisync_core::{epoch_watermark, Action};
use legisync_storage::LoadedSnapshot;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ledger::{StatusLedger, SyncErrorEntry, SyncTallies};
use crate::store::{LegislativeStore, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not read watermark for job {job_id}: {source}")]
    Watermark {
        job_id: String,
        #[source]
        source: StoreError,
    },
}

/// How action metadata changes are detected for a jurisdiction level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelPolicy {
    /// Metadata is written when the action watermark or any vote is new.
    National,
    /// Watermarks from state sources drift by timezone; a restamp must clear
    /// the last success by `tolerance` to count as a change.
    State { tolerance: Duration },
}

impl LevelPolicy {
    pub fn state_default() -> Self {
        Self::State {
            tolerance: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub job_id: String,
    pub policy: LevelPolicy,
    /// Chamber code -> open session row id.
    pub session_ids: BTreeMap<String, i64>,
}

impl SyncOptions {
    pub fn new(job_id: impl Into<String>, policy: LevelPolicy) -> Self {
        Self {
            job_id: job_id.into(),
            policy,
            session_ids: BTreeMap::new(),
        }
    }

    pub fn with_session_ids(mut self, session_ids: BTreeMap<String, i64>) -> Self {
        self.session_ids = session_ids;
        self
    }
}

/// The action's own watermark has reached the last successful sync.
pub fn metadata_changed(action: &Action, watermark: DateTime<Utc>, policy: LevelPolicy) -> bool {
    match policy {
        LevelPolicy::National => action.cache_updated_at >= watermark,
        LevelPolicy::State { tolerance } => action.cache_updated_at - tolerance >= watermark,
    }
}

/// At least one vote is newer than the last successful sync.
pub fn new_vote_present(action: &Action, watermark: DateTime<Utc>) -> bool {
    action.newest_vote_date().is_some_and(|newest| newest > watermark)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOutcome {
    Updated,
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub job_id: String,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub watermark: DateTime<Utc>,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub votes_recorded: usize,
    pub errors: Vec<SyncErrorEntry>,
    /// Success time stored after this run; unchanged from before on failure.
    pub last_success: Option<DateTime<Utc>>,
}

impl SyncResult {
    pub fn tallies(&self) -> SyncTallies {
        SyncTallies {
            updated: self.updated,
            unchanged: self.unchanged,
            failed: self.failed,
            votes_recorded: self.votes_recorded,
        }
    }

    pub fn exit_code(&self) -> u8 {
        if self.failed == 0 {
            0
        } else {
            1
        }
    }
}

struct ActionReport {
    outcome: ActionOutcome,
    votes_recorded: usize,
    error: Option<StoreError>,
}

pub struct SyncEngine {
    store: Arc<dyn LegislativeStore>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn LegislativeStore>, options: SyncOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub async fn synchronize(&self, snapshot: LoadedSnapshot) -> Result<SyncResult, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", job_id = %self.options.job_id, %run_id);
        self.synchronize_inner(run_id, snapshot).instrument(span).await
    }

    async fn synchronize_inner(&self, run_id: Uuid, snapshot: LoadedSnapshot) -> Result<SyncResult, SyncError> {
        let job_id = self.options.job_id.as_str();
        let ledger = StatusLedger::new(self.store.as_ref());

        let watermark = match ledger.get_watermark(job_id).await {
            Ok(watermark) => watermark,
            Err(source) => {
                error!(error = %source, "unable to read sync watermark, aborting run");
                ledger.record_abort(job_id, &source.to_string()).await;
                return Err(SyncError::Watermark {
                    job_id: job_id.to_string(),
                    source,
                });
            }
        };
        let previous_success = (watermark != epoch_watermark()).then_some(watermark);
        info!(
            %watermark,
            generated_at = %snapshot.generated_at,
            actions = snapshot.entries.len(),
            "starting sync"
        );

        let mut tallies = SyncTallies::default();
        let mut errors = Vec::new();

        for entry in snapshot.entries {
            let action = match entry.action {
                Ok(action) => action,
                Err(err) => {
                    error!(file = %entry.file_name, error = %err, "unreadable action file");
                    tallies.failed += 1;
                    errors.push(SyncErrorEntry {
                        action_id: None,
                        message: format!("{}: {err}", entry.file_name),
                    });
                    continue;
                }
            };

            let report = self.sync_action(&action, watermark).await;
            tallies.votes_recorded += report.votes_recorded;
            match report.outcome {
                ActionOutcome::Updated => tallies.updated += 1,
                ActionOutcome::Unchanged => tallies.unchanged += 1,
                ActionOutcome::Failed => tallies.failed += 1,
            }
            if let Some(err) = report.error {
                error!(action_id = %action.id, error = %err, "action sync failed");
                errors.push(SyncErrorEntry {
                    action_id: Some(action.id.clone()),
                    message: err.to_string(),
                });
            }
        }

        let last_success = errors.is_empty().then_some(snapshot.generated_at);
        if let Err(err) = ledger
            .record_result(job_id, snapshot.generated_at, last_success, tallies, &errors)
            .await
        {
            warn!(error = %err, "sync finished but status row could not be written");
        }

        info!(
            updated = tallies.updated,
            unchanged = tallies.unchanged,
            failed = tallies.failed,
            votes_recorded = tallies.votes_recorded,
            "sync complete"
        );

        Ok(SyncResult {
            job_id: job_id.to_string(),
            run_id,
            generated_at: snapshot.generated_at,
            watermark,
            updated: tallies.updated,
            unchanged: tallies.unchanged,
            failed: tallies.failed,
            votes_recorded: tallies.votes_recorded,
            errors,
            last_success: last_success.or(previous_success),
        })
    }

    async fn sync_action(&self, action: &Action, watermark: DateTime<Utc>) -> ActionReport {
        let mut votes_recorded = 0;
        let mut metadata_written = false;

        let write_metadata = match self.options.policy {
            LevelPolicy::National => {
                metadata_changed(action, watermark, self.options.policy)
                    || new_vote_present(action, watermark)
            }
            LevelPolicy::State { .. } => metadata_changed(action, watermark, self.options.policy),
        };

        if write_metadata {
            debug!(action_id = %action.id, cache_updated_at = %action.cache_updated_at, "writing action metadata");
            if let Err(err) = self.write_metadata(action, watermark).await {
                return ActionReport {
                    outcome: ActionOutcome::Failed,
                    votes_recorded,
                    error: Some(err),
                };
            }
            metadata_written = true;
        }

        for vote in action.votes.iter().filter(|v| v.date > watermark) {
            let session_id = self.options.session_ids.get(&vote.chamber).copied();
            let written = async {
                self.store.upsert_vote(&action.id, session_id, vote).await?;
                let row_id = self
                    .store
                    .vote_row_id(&vote.alternate_id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Backend(format!("vote {} has no row after upsert", vote.alternate_id))
                    })?;
                if !vote.member_votes.is_empty() {
                    self.store.upsert_member_votes(row_id, &vote.member_votes).await?;
                }
                Ok::<(), StoreError>(())
            }
            .await;

            if let Err(err) = written {
                return ActionReport {
                    outcome: ActionOutcome::Failed,
                    votes_recorded,
                    error: Some(err),
                };
            }
            debug!(action_id = %action.id, vote = %vote.alternate_id, "recorded vote");
            votes_recorded += 1;
        }

        // votes alone do not make an action updated; they are counted separately
        let outcome = if metadata_written {
            info!(action_id = %action.id, votes_recorded, "action updated");
            ActionOutcome::Updated
        } else {
            ActionOutcome::Unchanged
        };
        ActionReport {
            outcome,
            votes_recorded,
            error: None,
        }
    }

    async fn write_metadata(&self, action: &Action, watermark: DateTime<Utc>) -> Result<(), StoreError> {
        let session_id = self.options.session_ids.get(&action.chamber).copied();
        self.store.upsert_action(action, session_id).await?;

        for amendment in action.amendments.iter().filter(|a| a.cache_updated_at > watermark) {
            self.store.upsert_amendment(&action.id, amendment).await?;
        }

        if !action.cosponsors.is_empty() {
            self.store.upsert_cosponsors(&action.id, &action.cosponsors).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use legisync_core::{ActionKind, Level, Vote};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
    }

    fn action(updated: DateTime<Utc>, vote_days: &[u32]) -> Action {
        Action {
            id: "hr1-118".into(),
            kind: ActionKind::Bill,
            level: Level::National,
            state: None,
            chamber: "h".into(),
            bill_type: Some("hr".into()),
            congress: Some(118),
            number: Some(1),
            introduced_at: None,
            official_title: None,
            popular_title: None,
            short_title: None,
            sponsor_id: None,
            sponsor_type: None,
            status: "PASSED:BILL".into(),
            status_at: None,
            tags: vec![],
            top_tag: None,
            summary: BTreeMap::new(),
            cache_updated_at: updated,
            source_url: String::new(),
            cosponsors: vec![],
            amendments: vec![],
            votes: vote_days
                .iter()
                .map(|d| Vote {
                    alternate_id: format!("h{d}-118.2024"),
                    source_url: String::new(),
                    chamber: "h".into(),
                    congress: Some(118),
                    session: Some("2024".into()),
                    requires: None,
                    number: Some(*d),
                    question: "On Passage".into(),
                    result: "Passed".into(),
                    result_text: None,
                    date: at(*d),
                    cache_updated_at: at(*d),
                    vote_type: None,
                    member_votes: BTreeMap::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn predicates_are_independent() {
        let watermark = at(10);
        let stale_with_new_vote = action(at(1), &[5, 12]);
        assert!(!metadata_changed(&stale_with_new_vote, watermark, LevelPolicy::National));
        assert!(new_vote_present(&stale_with_new_vote, watermark));

        let restamped_no_votes = action(at(10), &[]);
        assert!(metadata_changed(&restamped_no_votes, watermark, LevelPolicy::National));
        assert!(!new_vote_present(&restamped_no_votes, watermark));
    }

    #[test]
    fn state_restamps_within_a_day_of_the_watermark_are_not_changes() {
        let watermark = at(10);
        let skewed = action(at(10) + Duration::hours(6), &[]);
        assert!(metadata_changed(&skewed, watermark, LevelPolicy::National));
        assert!(!metadata_changed(&skewed, watermark, LevelPolicy::state_default()));

        let just_before = action(at(10) - Duration::hours(6), &[]);
        assert!(!metadata_changed(&just_before, watermark, LevelPolicy::state_default()));

        let a_day_later = action(at(11), &[]);
        assert!(metadata_changed(&a_day_later, watermark, LevelPolicy::state_default()));
    }

    #[test]
    fn exit_code_follows_failures() {
        let mut result = SyncResult {
            job_id: "j".into(),
            run_id: Uuid::nil(),
            generated_at: at(1),
            watermark: at(1),
            updated: 3,
            unchanged: 1,
            failed: 0,
            votes_recorded: 2,
            errors: vec![],
            last_success: Some(at(1)),
        };
        assert_eq!(result.exit_code(), 0);
        result.failed = 1;
        assert_eq!(result.exit_code(), 1);
    }
}
