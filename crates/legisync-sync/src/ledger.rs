//! Sync Status Ledger: one row per job, written once at the end of a run.

use chrono::{DateTime, Utc};
use legisync_core::epoch_watermark;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::store::{LegislativeStore, RunStatus, StoreError, SyncStatusRow};

/// Serialized into `result_data`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTallies {
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub votes_recorded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    pub message: String,
}

pub struct StatusLedger<'a> {
    store: &'a dyn LegislativeStore,
}

impl<'a> StatusLedger<'a> {
    pub fn new(store: &'a dyn LegislativeStore) -> Self {
        Self { store }
    }

    pub async fn status(&self, job_id: &str) -> Result<Option<SyncStatusRow>, StoreError> {
        self.store.sync_status(job_id).await
    }

    /// Last successful run, or the epoch default so a first run is a full sync.
    pub async fn get_watermark(&self, job_id: &str) -> Result<DateTime<Utc>, StoreError> {
        let row = self.store.sync_status(job_id).await?;
        Ok(row.and_then(|r| r.last_success).unwrap_or_else(epoch_watermark))
    }

    /// `last_success: None` leaves the stored success time as it was.
    pub async fn record_result(
        &self,
        job_id: &str,
        last_run: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
        tallies: SyncTallies,
        errors: &[SyncErrorEntry],
    ) -> Result<(), StoreError> {
        let status = if errors.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Error
        };
        let row = SyncStatusRow {
            job_id: job_id.to_string(),
            last_run: Some(last_run),
            last_success,
            status,
            result_data: serde_json::to_value(tallies)?,
            error_data: json!({ "errors": errors }),
        };
        self.store.upsert_sync_status(&row).await?;
        info!(
            job_id,
            status = status.as_str(),
            advanced = last_success.is_some(),
            "sync status recorded"
        );
        Ok(())
    }

    /// Marks a run that could not start. Timestamps are left untouched.
    pub async fn record_abort(&self, job_id: &str, message: &str) {
        let row = SyncStatusRow {
            job_id: job_id.to_string(),
            last_run: None,
            last_success: None,
            status: RunStatus::Error,
            result_data: serde_json::Value::Null,
            error_data: json!({ "error": message }),
        };
        if let Err(err) = self.store.upsert_sync_status(&row).await {
            warn!(job_id, error = %err, "could not record aborted run");
        }
    }
}
