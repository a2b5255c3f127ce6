//! National congress data directory (`{data}/{congress}/votes|bills|amendments`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use legisync_core::{
    Amendment, BillDetail, BillReference, Cosponsor, Level, NominationReference, RawVote,
    RawVoteMember, TreatyReference, VoteCategory,
};
use legisync_storage::HttpFetcher;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    parse_source_timestamp, parse_u32, read_json_file, required_timestamp, string_or_number,
    AdapterContext, AdapterError, BillDetailSource, SourceAdapter, SourceRecord,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NationalBillRef {
    #[serde(deserialize_with = "string_or_number")]
    pub congress: String,
    #[serde(deserialize_with = "string_or_number")]
    pub number: String,
    #[serde(rename = "type")]
    pub bill_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NationalNomination {
    #[serde(deserialize_with = "string_or_number")]
    pub number: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NationalTreaty {
    #[serde(default)]
    pub title: String,
}

/// Ballot entry. The presiding officer shows up as a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NationalVoteMember {
    Member {
        #[serde(default)]
        id: Option<String>,
        display_name: String,
        #[serde(default)]
        party: Option<String>,
        #[serde(default)]
        state: Option<String>,
    },
    Bare(String),
}

/// `votes/{session}/{vote}/data.json` as written by the congress scraper.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NationalVoteRecord {
    pub vote_id: String,
    #[serde(default)]
    pub category: Option<String>,
    pub chamber: String,
    pub congress: u32,
    pub date: String,
    pub number: u32,
    pub question: String,
    #[serde(default)]
    pub requires: Option<String>,
    pub result: String,
    #[serde(default)]
    pub result_text: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    pub session: String,
    pub source_url: String,
    #[serde(default, rename = "type")]
    pub vote_type: Option<String>,
    #[serde(default)]
    pub bill: Option<NationalBillRef>,
    #[serde(default)]
    pub nomination: Option<NationalNomination>,
    #[serde(default)]
    pub treaty: Option<NationalTreaty>,
    pub updated_at: String,
    #[serde(default)]
    pub votes: BTreeMap<String, Vec<NationalVoteMember>>,
}

pub fn adapt_vote(record: NationalVoteRecord) -> Result<RawVote, AdapterError> {
    let date = required_timestamp(&record.date, "vote date")?;
    let updated_at = required_timestamp(&record.updated_at, "vote updated_at")?;

    let bill = match record.bill {
        Some(bill) => Some(BillReference {
            bill_type: bill.bill_type.to_ascii_lowercase(),
            number: parse_u32(&bill.number, "bill number")?,
            congress: parse_u32(&bill.congress, "bill congress")?,
        }),
        None => None,
    };

    let positions = record
        .votes
        .into_iter()
        .map(|(outcome, members)| {
            let members = members
                .into_iter()
                .map(|member| match member {
                    NationalVoteMember::Member {
                        id,
                        display_name,
                        party,
                        state,
                    } => RawVoteMember {
                        source_id: id,
                        name: display_name,
                        party,
                        state,
                    },
                    NationalVoteMember::Bare(name) => RawVoteMember {
                        source_id: None,
                        name,
                        party: None,
                        state: None,
                    },
                })
                .collect();
            (outcome, members)
        })
        .collect();

    Ok(RawVote {
        level: Level::National,
        state: None,
        category: VoteCategory::from_source(record.category.as_deref()),
        chamber: record.chamber,
        congress: Some(record.congress),
        session: Some(record.session),
        number: Some(record.number),
        date,
        updated_at,
        vote_id: Some(record.vote_id),
        question: record.question,
        result: record.result,
        result_text: record.result_text,
        requires: record.requires,
        vote_type: record.vote_type,
        source_url: record.source_url,
        bill,
        state_bill: None,
        nomination: record.nomination.map(|n| NominationReference {
            number: n.number,
            title: n.title,
        }),
        treaty: record.treaty.map(|t| TreatyReference { title: t.title }),
        positions,
    })
}

#[derive(Debug, Deserialize)]
struct RawSponsor {
    #[serde(default)]
    bioguide_id: Option<String>,
    #[serde(default, rename = "type")]
    sponsor_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCosponsor {
    bioguide_id: String,
    #[serde(default)]
    original_cosponsor: Option<bool>,
    #[serde(default)]
    sponsored_at: Option<String>,
    #[serde(default)]
    withdrawn_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBillAmendmentRef {
    amendment_type: String,
    #[serde(deserialize_with = "string_or_number")]
    number: String,
}

#[derive(Debug, Deserialize)]
struct RawBillData {
    bill_id: String,
    bill_type: String,
    #[serde(deserialize_with = "string_or_number")]
    congress: String,
    #[serde(deserialize_with = "string_or_number")]
    number: String,
    #[serde(default)]
    introduced_at: Option<String>,
    #[serde(default)]
    official_title: Option<String>,
    #[serde(default)]
    popular_title: Option<String>,
    #[serde(default)]
    short_title: Option<String>,
    #[serde(default)]
    sponsor: Option<RawSponsor>,
    status: String,
    #[serde(default)]
    status_at: Option<String>,
    #[serde(default)]
    subjects: Vec<String>,
    #[serde(default)]
    subjects_top_term: Option<String>,
    #[serde(default)]
    summary: Option<BTreeMap<String, String>>,
    updated_at: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    cosponsors: Vec<RawCosponsor>,
    #[serde(default)]
    amendments: Vec<RawBillAmendmentRef>,
}

#[derive(Debug, Deserialize)]
struct RawAmendment {
    amendment_id: String,
    amendment_type: String,
    chamber: String,
    #[serde(deserialize_with = "string_or_number")]
    congress: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    introduced_at: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    number: String,
    #[serde(default)]
    sponsor: Option<RawSponsor>,
    status: String,
    #[serde(default)]
    status_at: Option<String>,
    updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NationalDataDir {
    root: PathBuf,
    congress: u32,
}

impl NationalDataDir {
    pub fn new(root: impl Into<PathBuf>, congress: u32) -> Self {
        Self {
            root: root.into(),
            congress,
        }
    }

    pub fn congress(&self) -> u32 {
        self.congress
    }

    pub fn votes_dir(&self) -> PathBuf {
        self.root.join(self.congress.to_string()).join("votes")
    }

    fn bill_path(&self, bill: &BillReference) -> PathBuf {
        let kind = bill.bill_type.to_ascii_lowercase();
        self.root
            .join(bill.congress.to_string())
            .join("bills")
            .join(&kind)
            .join(format!("{kind}{}", bill.number))
            .join("data.json")
    }

    fn amendment_path(&self, congress: u32, amendment_type: &str, number: &str) -> PathBuf {
        self.root
            .join(congress.to_string())
            .join("amendments")
            .join(amendment_type)
            .join(format!("{amendment_type}{}", number.trim()))
            .join("data.json")
    }

    /// `votes/{session}/{vote}/data.json`, sorted by session then vote directory.
    pub fn vote_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let votes_dir = self.votes_dir();
        let mut files = Vec::new();
        for session in sorted_dirs(&votes_dir)? {
            for vote in sorted_dirs(&session)? {
                let file = vote.join("data.json");
                if file.is_file() {
                    files.push(file);
                } else {
                    debug!(path = %vote.display(), "vote directory without data.json");
                }
            }
        }
        Ok(files)
    }

    pub fn load_vote(path: &Path) -> Result<NationalVoteRecord, AdapterError> {
        Ok(read_json_file(path)?)
    }

    pub fn load_bill(&self, bill: &BillReference) -> Result<BillDetail, AdapterError> {
        let path = self.bill_path(bill);
        let data: RawBillData = read_json_file(&path)?;

        let congress = parse_u32(&data.congress, "bill congress")?;
        let amendments = data
            .amendments
            .iter()
            .filter_map(|a| self.load_amendment(congress, a))
            .collect();
        let cosponsors = data
            .cosponsors
            .into_iter()
            .map(|c| Cosponsor {
                id: c.bioguide_id,
                original_cosponsor: c.original_cosponsor,
                sponsored_at: c.sponsored_at.as_deref().and_then(parse_source_timestamp),
                withdrawn_at: c.withdrawn_at.as_deref().and_then(parse_source_timestamp),
            })
            .collect();
        let (sponsor_id, sponsor_type) = match data.sponsor {
            Some(s) => (s.bioguide_id, s.sponsor_type),
            None => (None, None),
        };

        Ok(BillDetail {
            // bill ids start with the chamber letter
            chamber: data.bill_id.chars().take(1).collect(),
            bill_type: Some(data.bill_type.to_ascii_lowercase()),
            congress: Some(congress),
            number: Some(parse_u32(&data.number, "bill number")?),
            introduced_at: data.introduced_at.as_deref().and_then(parse_source_timestamp),
            official_title: data.official_title,
            popular_title: data.popular_title,
            short_title: data.short_title,
            sponsor_id,
            sponsor_type,
            status: data.status,
            status_at: data.status_at.as_deref().and_then(parse_source_timestamp),
            tags: data.subjects,
            top_tag: data.subjects_top_term,
            summary: data.summary.unwrap_or_default(),
            updated_at: Some(required_timestamp(&data.updated_at, "bill updated_at")?),
            source_url: data.url.unwrap_or_default(),
            cosponsors,
            amendments,
        })
    }

    /// Missing or malformed amendment files are logged and left out.
    fn load_amendment(&self, congress: u32, reference: &RawBillAmendmentRef) -> Option<Amendment> {
        let path = self.amendment_path(congress, &reference.amendment_type, &reference.number);
        let parsed = read_json_file::<RawAmendment>(&path)
            .map_err(AdapterError::from)
            .and_then(|data| {
                Ok(Amendment {
                    id: data.amendment_id,
                    amendment_type: data.amendment_type,
                    chamber: data.chamber,
                    congress: parse_u32(&data.congress, "amendment congress")?,
                    number: parse_u32(&data.number, "amendment number")?,
                    description: data.description,
                    introduced_at: data.introduced_at.as_deref().and_then(parse_source_timestamp),
                    sponsor: data.sponsor.and_then(|s| s.bioguide_id),
                    status: data.status,
                    status_at: data.status_at.as_deref().and_then(parse_source_timestamp),
                    cache_updated_at: required_timestamp(&data.updated_at, "amendment updated_at")?,
                })
            });
        match parsed {
            Ok(amendment) => Some(amendment),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable amendment");
                None
            }
        }
    }
}

fn sorted_dirs(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = fs::read_dir(path)
        .with_context(|| format!("reading {}", path.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    dirs.sort();
    Ok(dirs)
}

#[async_trait]
impl SourceAdapter for NationalDataDir {
    fn source_id(&self) -> &'static str {
        "national"
    }

    fn level(&self) -> Level {
        Level::National
    }

    async fn fetch_records(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<Result<SourceRecord, AdapterError>>, AdapterError> {
        let files = self.vote_files()?;
        debug!(run_id = %ctx.run_id, votes = files.len(), congress = self.congress, "national vote files listed");
        Ok(files
            .iter()
            .map(|path| Self::load_vote(path).map(SourceRecord::National))
            .collect())
    }
}

#[async_trait]
impl BillDetailSource for NationalDataDir {
    async fn bill_detail(&self, bill: &BillReference) -> Result<BillDetail, AdapterError> {
        self.load_bill(bill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/national/data")
    }

    #[test]
    fn vote_files_are_listed_in_order() {
        let dir = NationalDataDir::new(fixture_root(), 118);
        let files = dir.vote_files().expect("list");
        let names: Vec<_> = files
            .iter()
            .map(|p| {
                p.parent()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(names, vec!["h10", "h11", "s5", "s6", "s7"]);
    }

    #[test]
    fn bill_vote_adapts_with_positions_and_reference() {
        let dir = NationalDataDir::new(fixture_root(), 118);
        let path = fixture_root().join("118/votes/2023/h10/data.json");
        let raw = adapt_vote(NationalDataDir::load_vote(&path).expect("load")).expect("adapt");
        assert_eq!(raw.category, VoteCategory::Passage);
        let bill = raw.bill.expect("bill ref");
        assert_eq!(bill.bill_type, "hr");
        assert_eq!(bill.number, 815);
        assert_eq!(raw.positions["Yea"].len(), 2);
        assert_eq!(raw.vote_id.as_deref(), Some("h10-118.2023"));

        let detail = dir.load_bill(&bill).expect("bill");
        assert_eq!(detail.chamber, "h");
        assert_eq!(detail.cosponsors.len(), 1);
        // one amendment file is missing from the fixture set
        assert_eq!(detail.amendments.len(), 1);
        assert_eq!(detail.amendments[0].id, "hamdt5-118");
    }

    #[test]
    fn presiding_officer_ballot_is_a_bare_string() {
        let path = fixture_root().join("118/votes/2023/s6/data.json");
        let raw = adapt_vote(NationalDataDir::load_vote(&path).expect("load")).expect("adapt");
        let yeas = &raw.positions["Yea"];
        assert!(yeas.iter().any(|m| m.source_id.is_none() && m.name == "VP"));
        assert_eq!(raw.nomination.expect("nomination").number, "PN12");
    }

    #[test]
    fn invalid_dates_fail_the_single_vote() {
        let json = r#"{
            "vote_id": "h1-118.2023", "chamber": "h", "congress": 118, "date": "yesterday",
            "number": 1, "question": "Q", "result": "Passed", "session": "2023",
            "source_url": "https://example.test", "updated_at": "2023-01-01T00:00:00Z"
        }"#;
        let record: NationalVoteRecord = serde_json::from_str(json).expect("parse");
        assert!(adapt_vote(record).is_err());
    }
}
