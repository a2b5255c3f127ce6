//! Persistent store boundary.
//!
//! Every write is an upsert keyed by a conflict column so a retried run with the
//! same input leaves the same rows behind. Reference DDL lives in `sql/schema.sql`.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use legisync_adapters::{DirectoryMember, MemberDirectory};
use legisync_core::{Action, Amendment, Cosponsor, Level, Vote};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(StoreError::Backend(format!("unknown sync status {other:?}"))),
        }
    }
}

/// One `db_updates` row. `None` timestamps leave the stored value untouched
/// on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusRow {
    pub job_id: String,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub result_data: Value,
    pub error_data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSession {
    pub id: i64,
    pub level: String,
    pub state: Option<String>,
    pub chamber: String,
    pub congress: Option<i32>,
}

#[async_trait]
pub trait LegislativeStore: Send + Sync {
    /// Conflict key: action id. Votes, amendments and cosponsors are not written here.
    async fn upsert_action(&self, action: &Action, session_id: Option<i64>) -> Result<(), StoreError>;

    /// Conflict key: amendment id.
    async fn upsert_amendment(&self, action_id: &str, amendment: &Amendment) -> Result<(), StoreError>;

    /// Batch upsert; conflict key `(rep_id, action_id)`.
    async fn upsert_cosponsors(&self, action_id: &str, cosponsors: &[Cosponsor]) -> Result<(), StoreError>;

    /// Conflict key: `alternate_id`. The generated row id is not echoed back;
    /// use [`LegislativeStore::vote_row_id`].
    async fn upsert_vote(&self, action_id: &str, session_id: Option<i64>, vote: &Vote) -> Result<(), StoreError>;

    async fn vote_row_id(&self, alternate_id: &str) -> Result<Option<i64>, StoreError>;

    /// Batch upsert; conflict key `(rep_id, vote_id)`.
    async fn upsert_member_votes(
        &self,
        vote_row_id: i64,
        member_votes: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    async fn sync_status(&self, job_id: &str) -> Result<Option<SyncStatusRow>, StoreError>;

    /// Conflict key: job id.
    async fn upsert_sync_status(&self, row: &SyncStatusRow) -> Result<(), StoreError>;

    /// Sessions with no end date for a level (and state, for state level).
    async fn current_sessions(&self, level: Level, state: Option<&str>) -> Result<Vec<OpenSession>, StoreError>;
}

fn to_i32(value: Option<u32>) -> Option<i32> {
    value.and_then(|v| i32::try_from(v).ok())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LegislativeStore for PgStore {
    async fn upsert_action(&self, action: &Action, session_id: Option<i64>) -> Result<(), StoreError> {
        let summary = serde_json::to_value(&action.summary)?;
        sqlx::query(
            r#"
            INSERT INTO actions (
                id, type, level, state, chamber, session_id, congress, bill_type, number,
                introduced_at, official_title, popular_title, short_title, sponsor_id,
                sponsor_type, status, status_at, tags, top_tag, summary, cache_updated_at,
                source_url
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            ON CONFLICT (id) DO UPDATE SET
                type = EXCLUDED.type,
                level = EXCLUDED.level,
                state = EXCLUDED.state,
                chamber = EXCLUDED.chamber,
                session_id = EXCLUDED.session_id,
                congress = EXCLUDED.congress,
                bill_type = EXCLUDED.bill_type,
                number = EXCLUDED.number,
                introduced_at = EXCLUDED.introduced_at,
                official_title = EXCLUDED.official_title,
                popular_title = EXCLUDED.popular_title,
                short_title = EXCLUDED.short_title,
                sponsor_id = EXCLUDED.sponsor_id,
                sponsor_type = EXCLUDED.sponsor_type,
                status = EXCLUDED.status,
                status_at = EXCLUDED.status_at,
                tags = EXCLUDED.tags,
                top_tag = EXCLUDED.top_tag,
                summary = EXCLUDED.summary,
                cache_updated_at = EXCLUDED.cache_updated_at,
                source_url = EXCLUDED.source_url
            "#,
        )
        .bind(&action.id)
        .bind(action.kind.as_str())
        .bind(action.level.as_str())
        .bind(&action.state)
        .bind(&action.chamber)
        .bind(session_id)
        .bind(to_i32(action.congress))
        .bind(&action.bill_type)
        .bind(to_i32(action.number))
        .bind(action.introduced_at)
        .bind(&action.official_title)
        .bind(&action.popular_title)
        .bind(&action.short_title)
        .bind(&action.sponsor_id)
        .bind(&action.sponsor_type)
        .bind(&action.status)
        .bind(action.status_at)
        .bind(&action.tags)
        .bind(&action.top_tag)
        .bind(summary)
        .bind(action.cache_updated_at)
        .bind(&action.source_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_amendment(&self, action_id: &str, amendment: &Amendment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bill_amendments (
                id, action_id, type, chamber, congress, number, description, introduced_at,
                sponsor_id, status, status_at, cache_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                action_id = EXCLUDED.action_id,
                type = EXCLUDED.type,
                chamber = EXCLUDED.chamber,
                congress = EXCLUDED.congress,
                number = EXCLUDED.number,
                description = EXCLUDED.description,
                introduced_at = EXCLUDED.introduced_at,
                sponsor_id = EXCLUDED.sponsor_id,
                status = EXCLUDED.status,
                status_at = EXCLUDED.status_at,
                cache_updated_at = EXCLUDED.cache_updated_at
            "#,
        )
        .bind(&amendment.id)
        .bind(action_id)
        .bind(&amendment.amendment_type)
        .bind(&amendment.chamber)
        .bind(to_i32(Some(amendment.congress)))
        .bind(to_i32(Some(amendment.number)))
        .bind(&amendment.description)
        .bind(amendment.introduced_at)
        .bind(&amendment.sponsor)
        .bind(&amendment.status)
        .bind(amendment.status_at)
        .bind(amendment.cache_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_cosponsors(&self, action_id: &str, cosponsors: &[Cosponsor]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for cosponsor in cosponsors {
            sqlx::query(
                r#"
                INSERT INTO bill_cosponsors (rep_id, action_id, original_cosponsor, sponsored_at, withdrawn_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (rep_id, action_id) DO UPDATE SET
                    original_cosponsor = EXCLUDED.original_cosponsor,
                    sponsored_at = EXCLUDED.sponsored_at,
                    withdrawn_at = EXCLUDED.withdrawn_at
                "#,
            )
            .bind(&cosponsor.id)
            .bind(action_id)
            .bind(cosponsor.original_cosponsor)
            .bind(cosponsor.sponsored_at)
            .bind(cosponsor.withdrawn_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_vote(&self, action_id: &str, session_id: Option<i64>, vote: &Vote) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO votes (
                alternate_id, action_id, result, result_text, question, type, chamber,
                congress, session, session_id, requires, number, date, source_url,
                cache_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (alternate_id) DO UPDATE SET
                action_id = EXCLUDED.action_id,
                result = EXCLUDED.result,
                result_text = EXCLUDED.result_text,
                question = EXCLUDED.question,
                type = EXCLUDED.type,
                chamber = EXCLUDED.chamber,
                congress = EXCLUDED.congress,
                session = EXCLUDED.session,
                session_id = EXCLUDED.session_id,
                requires = EXCLUDED.requires,
                number = EXCLUDED.number,
                date = EXCLUDED.date,
                source_url = EXCLUDED.source_url,
                cache_updated_at = EXCLUDED.cache_updated_at
            "#,
        )
        .bind(&vote.alternate_id)
        .bind(action_id)
        .bind(&vote.result)
        .bind(&vote.result_text)
        .bind(&vote.question)
        .bind(&vote.vote_type)
        .bind(&vote.chamber)
        .bind(to_i32(vote.congress))
        .bind(&vote.session)
        .bind(session_id)
        .bind(&vote.requires)
        .bind(to_i32(vote.number))
        .bind(vote.date)
        .bind(&vote.source_url)
        .bind(vote.cache_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn vote_row_id(&self, alternate_id: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT id FROM votes WHERE alternate_id = $1")
            .bind(alternate_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("id")?)),
            None => Ok(None),
        }
    }

    async fn upsert_member_votes(
        &self,
        vote_row_id: i64,
        member_votes: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (rep_id, value) in member_votes {
            sqlx::query(
                r#"
                INSERT INTO rep_votes (rep_id, vote_id, vote)
                VALUES ($1, $2, $3)
                ON CONFLICT (rep_id, vote_id) DO UPDATE SET vote = EXCLUDED.vote
                "#,
            )
            .bind(rep_id)
            .bind(vote_row_id)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn sync_status(&self, job_id: &str) -> Result<Option<SyncStatusRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT script_id, last_run, last_success, status, result_data, error_data
            FROM db_updates
            WHERE script_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        let result_data: Option<Value> = row.try_get("result_data")?;
        let error_data: Option<Value> = row.try_get("error_data")?;
        Ok(Some(SyncStatusRow {
            job_id: row.try_get("script_id")?,
            last_run: row.try_get("last_run")?,
            last_success: row.try_get("last_success")?,
            status: RunStatus::parse(&status)?,
            result_data: result_data.unwrap_or(Value::Null),
            error_data: error_data.unwrap_or(Value::Null),
        }))
    }

    async fn upsert_sync_status(&self, row: &SyncStatusRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO db_updates (script_id, last_run, last_success, status, result_data, error_data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (script_id) DO UPDATE SET
                last_run = COALESCE(EXCLUDED.last_run, db_updates.last_run),
                last_success = COALESCE(EXCLUDED.last_success, db_updates.last_success),
                status = EXCLUDED.status,
                result_data = EXCLUDED.result_data,
                error_data = EXCLUDED.error_data
            "#,
        )
        .bind(&row.job_id)
        .bind(row.last_run)
        .bind(row.last_success)
        .bind(row.status.as_str())
        .bind(&row.result_data)
        .bind(&row.error_data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_sessions(&self, level: Level, state: Option<&str>) -> Result<Vec<OpenSession>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, level, state, chamber, congress
            FROM sessions
            WHERE level = $1
              AND ($2::text IS NULL OR state = $2)
              AND end_date IS NULL
            ORDER BY id
            "#,
        )
        .bind(level.as_str())
        .bind(state)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(OpenSession {
                id: row.try_get("id")?,
                level: row.try_get("level")?,
                state: row.try_get("state")?,
                chamber: row.try_get("chamber")?,
                congress: row.try_get("congress")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl MemberDirectory for PgStore {
    async fn members_with_id_prefix(&self, prefix: &str) -> anyhow::Result<Vec<DirectoryMember>> {
        let rows = sqlx::query(
            "SELECT id, full_name FROM representatives WHERE left(id, char_length($1)) = $1 ORDER BY id",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("querying representatives with id prefix {prefix}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DirectoryMember {
                id: row.try_get("id")?,
                full_name: row.try_get("full_name")?,
            });
        }
        Ok(out)
    }
}
