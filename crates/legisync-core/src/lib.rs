//! Core legislative model and raw-vote hand-off types for legisync.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub mod ids;

pub use ids::{
    bill_action_id, cloture_action_id, nomination_action_id, state_bill_action_id,
    state_vote_alternate_id, treaty_action_id, ActionRef,
};

pub const CRATE_NAME: &str = "legisync-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Bill,
    Nomination,
    Treaty,
    Cloture,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bill => "bill",
            Self::Nomination => "nomination",
            Self::Treaty => "treaty",
            Self::Cloture => "cloture",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    National,
    State,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::National => "national",
            Self::State => "state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cosponsor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_cosponsor: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsored_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawn_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amendment {
    pub id: String,
    pub amendment_type: String,
    pub chamber: String,
    pub congress: u32,
    pub number: u32,
    pub description: Option<String>,
    pub introduced_at: Option<DateTime<Utc>>,
    pub sponsor: Option<String>,
    pub status: String,
    pub status_at: Option<DateTime<Utc>>,
    pub cache_updated_at: DateTime<Utc>,
}

/// One recorded roll call. `alternate_id` is the upsert conflict key and is
/// never the store-generated row id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub alternate_id: String,
    pub source_url: String,
    pub chamber: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congress: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    pub question: String,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    pub date: DateTime<Utc>,
    pub cache_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_type: Option<String>,
    /// Member id -> vote value (`yea`, `nay`, `aye`, `no`, `not voting`, ...).
    pub member_votes: BTreeMap<String, String>,
}

impl Vote {
    /// Content key used to recognise the same roll call when the source has no
    /// stable vote id of its own.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.chamber,
            self.date.to_rfc3339(),
            self.question.trim().to_ascii_lowercase(),
            self.result.trim().to_ascii_lowercase()
        )
    }
}

/// Canonical unit of legislative business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    pub level: Level,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub chamber: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bill_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congress: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introduced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popular_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsor_type: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_tag: Option<String>,
    #[serde(default)]
    pub summary: BTreeMap<String, String>,
    /// Upstream last-modified watermark, never ingestion wall-clock time.
    pub cache_updated_at: DateTime<Utc>,
    pub source_url: String,
    #[serde(default)]
    pub cosponsors: Vec<Cosponsor>,
    #[serde(default)]
    pub amendments: Vec<Amendment>,
    #[serde(default)]
    pub votes: Vec<Vote>,
}

impl Action {
    pub fn newest_vote_date(&self) -> Option<DateTime<Utc>> {
        self.votes.iter().map(|v| v.date).max()
    }

    /// Moves the watermark forward; older timestamps are ignored.
    pub fn raise_watermark(&mut self, candidate: DateTime<Utc>) -> bool {
        if candidate > self.cache_updated_at {
            self.cache_updated_at = candidate;
            true
        } else {
            false
        }
    }
}

/// Entry in the snapshot member index (`representatives.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberIndexEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Chamber-internal id the canonical id was resolved from (e.g. a Senate LIS id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default)]
    pub provisional: bool,
}

/// Vote category as tagged by the source. Missing or unknown tags are kept
/// explicit so the cache builder can count them instead of dropping them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoteCategory {
    Passage,
    Amendment,
    Nomination,
    Treaty,
    Cloture,
    Procedural,
    Quorum,
    Leadership,
    Committee,
    Other(String),
    Unhandled,
}

impl VoteCategory {
    pub fn from_source(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::Unhandled;
        };
        match raw.to_ascii_lowercase().as_str() {
            "passage" | "passage-suspension" => Self::Passage,
            "amendment" => Self::Amendment,
            "nomination" => Self::Nomination,
            "treaty" => Self::Treaty,
            "cloture" => Self::Cloture,
            "procedural" => Self::Procedural,
            "quorum" => Self::Quorum,
            "leadership" => Self::Leadership,
            "committee" => Self::Committee,
            other => Self::Other(other.to_string()),
        }
    }

    /// Categories that never become part of an action.
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            Self::Procedural | Self::Quorum | Self::Leadership | Self::Committee
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillReference {
    pub bill_type: String,
    pub number: u32,
    pub congress: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBillReference {
    pub state: String,
    pub session: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NominationReference {
    pub number: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatyReference {
    pub title: String,
}

/// Richer per-bill record used to materialise a bill action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BillDetail {
    pub chamber: String,
    pub bill_type: Option<String>,
    pub congress: Option<u32>,
    pub number: Option<u32>,
    pub introduced_at: Option<DateTime<Utc>>,
    pub official_title: Option<String>,
    pub popular_title: Option<String>,
    pub short_title: Option<String>,
    pub sponsor_id: Option<String>,
    pub sponsor_type: Option<String>,
    pub status: String,
    pub status_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub top_tag: Option<String>,
    pub summary: BTreeMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub source_url: String,
    pub cosponsors: Vec<Cosponsor>,
    pub amendments: Vec<Amendment>,
}

/// State bills carry their detail inline; the source has already scraped it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBill {
    pub reference: StateBillReference,
    pub detail: BillDetail,
    /// Author as printed by the source. Committees stay unresolved.
    #[serde(default)]
    pub sponsor_name: Option<String>,
    /// Coauthor names as printed by the source; resolved to member ids by the builder.
    #[serde(default)]
    pub author_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVoteMember {
    /// Source-side member id when the source exposes one.
    pub source_id: Option<String>,
    pub name: String,
    pub party: Option<String>,
    pub state: Option<String>,
}

/// Parsed hand-off contract from source adapters into the cache builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVote {
    pub level: Level,
    pub state: Option<String>,
    pub category: VoteCategory,
    pub chamber: String,
    pub congress: Option<u32>,
    pub session: Option<String>,
    pub number: Option<u32>,
    pub date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Upstream vote id; absent for sources that only expose position in a list.
    pub vote_id: Option<String>,
    pub question: String,
    pub result: String,
    pub result_text: Option<String>,
    pub requires: Option<String>,
    pub vote_type: Option<String>,
    pub source_url: String,
    pub bill: Option<BillReference>,
    pub state_bill: Option<Box<StateBill>>,
    pub nomination: Option<NominationReference>,
    pub treaty: Option<TreatyReference>,
    /// Outcome (`Yea`, `Nay`, `aye`, ...) -> members who voted that way.
    pub positions: BTreeMap<String, Vec<RawVoteMember>>,
}

/// Watermark used when a job has never completed successfully.
pub fn epoch_watermark() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1776, 7, 4, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(date: &str) -> Vote {
        let date = DateTime::parse_from_rfc3339(date)
            .unwrap()
            .with_timezone(&Utc);
        Vote {
            alternate_id: "h1-118.2023".into(),
            source_url: String::new(),
            chamber: "h".into(),
            congress: Some(118),
            session: Some("2023".into()),
            requires: None,
            number: Some(1),
            question: "On Passage".into(),
            result: "Passed".into(),
            result_text: None,
            date,
            cache_updated_at: date,
            vote_type: None,
            member_votes: BTreeMap::new(),
        }
    }

    #[test]
    fn category_mapping_keeps_unknowns_explicit() {
        assert_eq!(VoteCategory::from_source(None), VoteCategory::Unhandled);
        assert_eq!(VoteCategory::from_source(Some("  ")), VoteCategory::Unhandled);
        assert_eq!(VoteCategory::from_source(Some("Quorum")), VoteCategory::Quorum);
        assert!(VoteCategory::from_source(Some("leadership")).is_skipped());
        assert_eq!(
            VoteCategory::from_source(Some("veto-override")),
            VoteCategory::Other("veto-override".into())
        );
        assert!(!VoteCategory::from_source(Some("veto-override")).is_skipped());
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut action = Action {
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
            status: "INTRODUCED".into(),
            status_at: None,
            tags: vec![],
            top_tag: None,
            summary: BTreeMap::new(),
            cache_updated_at: vote("2024-02-01T00:00:00Z").date,
            source_url: String::new(),
            cosponsors: vec![],
            amendments: vec![],
            votes: vec![vote("2024-01-10T00:00:00Z"), vote("2024-01-20T00:00:00Z")],
        };

        assert!(!action.raise_watermark(vote("2024-01-01T00:00:00Z").date));
        assert_eq!(action.cache_updated_at, vote("2024-02-01T00:00:00Z").date);
        assert!(action.raise_watermark(vote("2024-03-01T00:00:00Z").date));
        assert_eq!(action.newest_vote_date(), Some(vote("2024-01-20T00:00:00Z").date));
    }

    #[test]
    fn serialized_kinds_are_lowercase() {
        let json = serde_json::to_string(&ActionKind::Cloture).unwrap();
        assert_eq!(json, "\"cloture\"");
        assert_eq!(epoch_watermark().to_rfc3339(), "1776-07-04T00:00:00+00:00");
    }
}
