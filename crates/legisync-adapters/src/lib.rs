//! Source adapter contracts + per-jurisdiction adapters that turn native
//! records into canonical raw votes.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use legisync_core::{BillDetail, BillReference, Level, RawVote};
use legisync_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use uuid::Uuid;

pub mod california;
pub mod identity;
pub mod national;
pub mod texas;

pub use california::{CaBillRecord, CaliforniaAdapter};
pub use identity::{
    assign_member_id, AliasTable, DirectoryMember, IdAssignment, IdentityResolver, MatchQuality,
    MemberDirectory, MemberRoster, OfflineDirectory, ResolvedMember,
};
pub use national::{NationalDataDir, NationalVoteRecord};
pub use texas::{TexasArchive, TxBillRecord};

pub const CRATE_NAME: &str = "legisync-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One native record, tagged by the source format it came from.
#[derive(Debug, Clone)]
pub enum SourceRecord {
    National(NationalVoteRecord),
    California(CaBillRecord),
    Texas(TxBillRecord),
}

impl SourceRecord {
    pub fn label(&self) -> String {
        match self {
            Self::National(r) => r.vote_id.clone(),
            Self::California(r) => r.index.display_id.clone(),
            Self::Texas(r) => r.history.bill.clone(),
        }
    }
}

/// Converts a native record into canonical raw votes. Each vote fails on its own.
pub fn adapt_record(record: SourceRecord) -> Vec<Result<RawVote, AdapterError>> {
    match record {
        SourceRecord::National(vote) => vec![national::adapt_vote(vote)],
        SourceRecord::California(bill) => california::adapt_bill(bill),
        SourceRecord::Texas(bill) => texas::adapt_bill(bill),
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn level(&self) -> Level;

    /// Outer error: the whole source is unreachable. Inner errors: one record.
    async fn fetch_records(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<Result<SourceRecord, AdapterError>>, AdapterError>;
}

/// Richer per-bill record used the first time a bill action is materialised.
#[async_trait]
pub trait BillDetailSource: Send + Sync {
    async fn bill_detail(&self, bill: &BillReference) -> Result<BillDetail, AdapterError>;
}

pub(crate) fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Accepts the timestamp shapes seen across sources: RFC 3339, naive
/// date-times, ISO dates and US `m/d/y` dates. Naive values are taken as UTC.
pub fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%m/%d/%Y %I:%M:%S %p",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

pub(crate) fn required_timestamp(raw: &str, what: &str) -> Result<DateTime<Utc>, AdapterError> {
    parse_source_timestamp(raw)
        .ok_or_else(|| AdapterError::Message(format!("invalid {what} timestamp {raw:?}")))
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("bad selector {css}: {e}")))
}

pub(crate) fn element_text(node: ElementRef<'_>) -> Option<String> {
    text_or_none(node.text().collect::<String>())
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

/// Congress data mixes `"815"` and `815` for the same fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub(crate) enum StringOrNumber {
    Text(String),
    Number(u64),
}

impl StringOrNumber {
    pub(crate) fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer).map(StringOrNumber::into_string)
}

pub(crate) fn parse_u32(raw: &str, what: &str) -> Result<u32, AdapterError> {
    raw.trim()
        .parse()
        .map_err(|_| AdapterError::Message(format!("invalid {what} {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_timestamps_accept_every_known_shape() {
        let rfc = parse_source_timestamp("2023-01-09T18:52:00-05:00").expect("rfc3339");
        assert_eq!(rfc.to_rfc3339(), "2023-01-09T23:52:00+00:00");

        let iso = parse_source_timestamp("2023-01-09").expect("date");
        assert_eq!(iso.to_rfc3339(), "2023-01-09T00:00:00+00:00");

        let short = parse_source_timestamp("09/14/23").expect("short us date");
        assert_eq!(short.to_rfc3339(), "2023-09-14T00:00:00+00:00");

        let long = parse_source_timestamp("03/14/2025").expect("long us date");
        assert_eq!(long.to_rfc3339(), "2025-03-14T00:00:00+00:00");

        let tx = parse_source_timestamp("03/14/2025 02:30:00 PM").expect("tx update");
        assert_eq!(tx.to_rfc3339(), "2025-03-14T14:30:00+00:00");

        assert!(parse_source_timestamp("not a date").is_none());
        assert!(parse_source_timestamp("").is_none());
    }

    #[test]
    fn numbers_may_arrive_as_strings() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "string_or_number")]
            number: String,
        }
        let a: Probe = serde_json::from_str(r#"{"number": "815"}"#).expect("string");
        let b: Probe = serde_json::from_str(r#"{"number": 815}"#).expect("number");
        assert_eq!(a.number, b.number);
        assert_eq!(parse_u32(&a.number, "bill number").expect("parse"), 815);
        assert!(parse_u32("PN12", "bill number").is_err());
    }
}
