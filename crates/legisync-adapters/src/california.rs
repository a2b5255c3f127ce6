//! California leginfo pages: bill index, bill status page and bill votes page.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use legisync_core::{
    BillDetail, Level, RawVote, RawVoteMember, StateBill, StateBillReference, VoteCategory,
};
use legisync_storage::HttpFetcher;
use scraper::Html;
use tracing::{debug, info, warn};

use crate::{
    element_text, parse_source_timestamp, select_first_text, selector, AdapterContext,
    AdapterError, SourceAdapter, SourceRecord,
};

pub const CA_BILL_ROOT: &str = "https://leginfo.legislature.ca.gov/faces";
const SOURCE_ID: &str = "california";

/// Sessions start on odd years and are encoded by stapling both years together.
pub fn session_id_for_year(year: i32) -> String {
    let start = if year % 2 == 1 { year } else { year - 1 };
    format!("{start}{}", start + 1)
}

pub fn bill_index_url(session_id: &str) -> String {
    format!(
        "{CA_BILL_ROOT}/billSearchClient.xhtml?author=All&lawCode=All&session_year={session_id}&house=Both"
    )
}

pub fn bill_page_url(uid: &str) -> String {
    format!("{CA_BILL_ROOT}/billNavClient.xhtml?bill_id={uid}")
}

pub fn bill_status_url(uid: &str) -> String {
    format!("{CA_BILL_ROOT}/billStatusClient.xhtml?bill_id={uid}")
}

pub fn bill_votes_url(uid: &str) -> String {
    format!("{CA_BILL_ROOT}/billVotesClient.xhtml?bill_id={uid}")
}

pub fn bill_analysis_url(uid: &str) -> String {
    format!("{CA_BILL_ROOT}/billAnalysisClient.xhtml?bill_id={uid}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaBillIndexEntry {
    /// Site-wide bill id, e.g. `202320240AB1`.
    pub uid: String,
    /// Printed id, e.g. `AB-1`.
    pub display_id: String,
    pub subject: String,
    pub author: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaStatusPage {
    pub measure_num: Option<String>,
    pub title: Option<String>,
    pub subject: Option<String>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub authors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaVoteEntry {
    pub date: Option<DateTime<Utc>>,
    pub result: String,
    pub location: String,
    pub motion: String,
    /// `aye` / `no` / `nvr` -> printed member names.
    pub positions: BTreeMap<String, Vec<String>>,
}

impl CaVoteEntry {
    pub fn floor_chamber(&self) -> Option<&'static str> {
        match self.location.trim().to_lowercase().as_str() {
            "assembly floor" => Some("a"),
            "senate floor" => Some("s"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaBillRecord {
    pub session: String,
    pub index: CaBillIndexEntry,
    pub status: CaStatusPage,
    pub votes: Vec<CaVoteEntry>,
}

pub fn parse_bill_index(html: &str) -> Result<Vec<CaBillIndexEntry>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("#bill_results tbody tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a")?;

    let mut entries = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<_> = row.select(&cell_sel).collect();
        let Some(first) = cells.first() else {
            continue;
        };
        let Some(link) = first.select(&link_sel).next() else {
            continue;
        };
        let Some(display_id) = element_text(link) else {
            continue;
        };
        let Some(uid) = link
            .value()
            .attr("href")
            .and_then(|href| href.split_once('='))
            .map(|(_, uid)| uid.trim().to_string())
            .filter(|uid| !uid.is_empty())
        else {
            warn!(%display_id, "bill index row without a bill id link");
            continue;
        };
        let cell = |i: usize| cells.get(i).and_then(|c| element_text(*c)).unwrap_or_default();
        entries.push(CaBillIndexEntry {
            uid,
            display_id,
            subject: cell(1),
            author: cell(2),
            status: cell(3),
        });
    }
    Ok(entries)
}

fn split_authors(raw: Option<String>) -> Vec<String> {
    raw.map(|text| {
        text.split(',')
            .map(|a| match a.find('(') {
                Some(i) => a[..i].trim().to_string(),
                None => a.trim().to_string(),
            })
            .filter(|a| !a.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

pub fn parse_status_page(html: &str) -> Result<CaStatusPage, AdapterError> {
    let document = Html::parse_document(html);
    let mut authors = split_authors(select_first_text(&document, "#leadAuthors")?);
    authors.extend(split_authors(select_first_text(&document, "#principalAuthors")?));
    authors.extend(split_authors(select_first_text(&document, "#coAuthors")?));

    Ok(CaStatusPage {
        measure_num: select_first_text(&document, "#measureNum")?,
        title: select_first_text(&document, "#statusTitle")?,
        subject: select_first_text(&document, "#subject")?
            .map(|s| s.replace('.', "").trim().to_string()),
        last_action_at: select_first_text(&document, "#billhistory tbody tr td[scope=\"row\"]")?
            .as_deref()
            .and_then(parse_source_timestamp),
        authors,
    })
}

fn depluralize(label: &str) -> String {
    match label {
        "ayes" => "aye".to_string(),
        "noes" => "no".to_string(),
        other => other.to_string(),
    }
}

/// Each `.status` block is one vote: labelled rows for date, result, location
/// and motion, closed by three rows listing the members per outcome.
pub fn parse_votes_page(html: &str) -> Result<Vec<CaVoteEntry>, AdapterError> {
    let document = Html::parse_document(html);
    let block_sel = selector(".status")?;
    let row_sel = selector(".statusRow")?;
    let label_sel = selector(".statusCell span")?;
    let data_sel = selector(".statusCellData span")?;

    let mut votes = Vec::new();
    for block in document.select(&block_sel) {
        let rows: Vec<_> = block.select(&row_sel).collect();
        let labelled = |label: &str| {
            rows.iter()
                .find(|row| {
                    row.select(&label_sel)
                        .next()
                        .and_then(element_text)
                        .is_some_and(|l| l.eq_ignore_ascii_case(label))
                })
                .and_then(|row| row.select(&data_sel).next())
                .and_then(element_text)
                .unwrap_or_default()
        };

        let result = labelled("Result");
        let mut positions = BTreeMap::new();
        for row in rows.iter().skip(rows.len().saturating_sub(3)) {
            let Some(kind) = row.select(&label_sel).next().and_then(element_text) else {
                continue;
            };
            let members = row
                .select(&data_sel)
                .next()
                .and_then(element_text)
                .map(|names| {
                    names
                        .split(',')
                        .map(|n| n.trim().to_string())
                        .filter(|n| !n.is_empty())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            positions.insert(depluralize(&kind.to_lowercase()), members);
        }

        votes.push(CaVoteEntry {
            date: parse_source_timestamp(&labelled("Date")),
            result: result
                .trim_matches(|c| matches!(c, '(' | ')' | '[' | ']'))
                .trim()
                .to_lowercase(),
            location: labelled("Location"),
            motion: labelled("Motion"),
            positions,
        });
    }
    Ok(votes)
}

/// `AB-1` -> bill, `ACR-5` -> concurrent resolution, ...
pub fn measure_type(display_id: &str) -> Option<&'static str> {
    let code = display_id.split('-').next()?.get(1..)?.to_ascii_uppercase();
    if code.starts_with('B') {
        Some("bill")
    } else if code.starts_with("CR") {
        Some("concurrent resolution")
    } else if code.starts_with("JR") {
        Some("joint resolution")
    } else if code.starts_with('R') {
        Some("resolution")
    } else {
        None
    }
}

fn bill_detail(record: &CaBillRecord) -> BillDetail {
    let index = &record.index;
    let display = record.status.measure_num.as_deref().unwrap_or(&index.display_id);
    // house resolutions print as HR but belong to the assembly
    let chamber = match index.display_id.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('h') | None => "a".to_string(),
        Some(c) => c.to_string(),
    };
    let number = index
        .display_id
        .split_once('-')
        .and_then(|(_, n)| n.trim().parse().ok());

    BillDetail {
        chamber,
        bill_type: measure_type(display).map(str::to_string),
        congress: None,
        number,
        introduced_at: None,
        official_title: record.status.title.clone(),
        popular_title: None,
        short_title: Some(format!("{} {}", index.display_id, index.subject).trim().to_string()),
        sponsor_id: None,
        sponsor_type: None,
        status: index.status.clone(),
        status_at: record.status.last_action_at,
        tags: Vec::new(),
        top_tag: record.status.subject.clone(),
        summary: BTreeMap::from([("analysis_link".to_string(), bill_analysis_url(&index.uid))]),
        updated_at: record.status.last_action_at,
        source_url: bill_page_url(&index.uid),
        cosponsors: Vec::new(),
        amendments: Vec::new(),
    }
}

pub fn adapt_bill(record: CaBillRecord) -> Vec<Result<RawVote, AdapterError>> {
    let detail = bill_detail(&record);
    let state_bill = StateBill {
        reference: StateBillReference {
            state: "CA".to_string(),
            session: record.session.clone(),
            code: record.index.display_id.replace('-', ""),
        },
        detail: detail.clone(),
        sponsor_name: Some(record.index.author.clone()).filter(|a| !a.is_empty()),
        author_names: record.status.authors.clone(),
    };
    let votes_url = bill_votes_url(&record.index.uid);

    record
        .votes
        .iter()
        .map(|vote| -> Result<RawVote, AdapterError> {
            let (chamber, category) = match vote.floor_chamber() {
                Some(chamber) => (chamber.to_string(), VoteCategory::Passage),
                None => (detail.chamber.clone(), VoteCategory::Committee),
            };
            let date = vote.date.ok_or_else(|| {
                AdapterError::Message(format!(
                    "{} vote at {:?} has no date",
                    record.index.display_id, vote.location
                ))
            })?;
            let positions = vote
                .positions
                .iter()
                .map(|(outcome, names)| {
                    let members = names
                        .iter()
                        .map(|name| RawVoteMember {
                            source_id: None,
                            name: name.clone(),
                            party: None,
                            state: Some("CA".to_string()),
                        })
                        .collect();
                    (outcome.clone(), members)
                })
                .collect();

            Ok(RawVote {
                level: Level::State,
                state: Some("CA".to_string()),
                category,
                chamber,
                congress: None,
                session: Some(record.session.clone()),
                number: None,
                date,
                updated_at: date,
                vote_id: None,
                question: vote.motion.clone(),
                result: vote.result.clone(),
                result_text: None,
                requires: None,
                vote_type: None,
                source_url: votes_url.clone(),
                bill: None,
                state_bill: Some(Box::new(state_bill.clone())),
                nomination: None,
                treaty: None,
                positions,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CaliforniaAdapter {
    session_id: String,
}

impl CaliforniaAdapter {
    pub fn for_year(year: i32) -> Self {
        Self {
            session_id: session_id_for_year(year),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn fetch_bill(
        &self,
        http: &HttpFetcher,
        index: CaBillIndexEntry,
    ) -> Result<SourceRecord, AdapterError> {
        let status_page = http.fetch_page(SOURCE_ID, &bill_status_url(&index.uid)).await?;
        let status = parse_status_page(&status_page.text())?;
        let votes_page = http.fetch_page(SOURCE_ID, &bill_votes_url(&index.uid)).await?;
        let votes = parse_votes_page(&votes_page.text())?;
        debug!(bill = %index.display_id, votes = votes.len(), "california bill pages parsed");
        Ok(SourceRecord::California(CaBillRecord {
            session: self.session_id.clone(),
            index,
            status,
            votes,
        }))
    }
}

#[async_trait]
impl SourceAdapter for CaliforniaAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn level(&self) -> Level {
        Level::State
    }

    async fn fetch_records(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<Result<SourceRecord, AdapterError>>, AdapterError> {
        let index_page = http.fetch_page(SOURCE_ID, &bill_index_url(&self.session_id)).await?;
        let index = parse_bill_index(&index_page.text())?;
        if index.is_empty() {
            return Err(AdapterError::Message(
                "bill index page had no bill results table rows".to_string(),
            ));
        }
        info!(run_id = %ctx.run_id, bills = index.len(), session = %self.session_id, "california bill index loaded");

        let mut records = Vec::with_capacity(index.len());
        for entry in index {
            let display_id = entry.display_id.clone();
            let record = self.fetch_bill(http, entry).await;
            if let Err(err) = &record {
                warn!(bill = %display_id, error = %err, "california bill fetch failed");
            }
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/california")
            .join(name);
        std::fs::read_to_string(&path).expect("fixture")
    }

    fn record() -> CaBillRecord {
        let index = parse_bill_index(&fixture("bill_index.html")).expect("index");
        CaBillRecord {
            session: "20232024".into(),
            index: index[0].clone(),
            status: parse_status_page(&fixture("bill_status.html")).expect("status"),
            votes: parse_votes_page(&fixture("bill_votes.html")).expect("votes"),
        }
    }

    #[test]
    fn sessions_start_on_odd_years() {
        assert_eq!(session_id_for_year(2023), "20232024");
        assert_eq!(session_id_for_year(2024), "20232024");
    }

    #[test]
    fn bill_index_rows_parse() {
        let index = parse_bill_index(&fixture("bill_index.html")).expect("index");
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].uid, "202320240AB1");
        assert_eq!(index[0].display_id, "AB-1");
        assert_eq!(index[0].author, "Rivas");
        assert_eq!(index[1].display_id, "SCR-4");
    }

    #[test]
    fn status_page_fields_parse() {
        let status = parse_status_page(&fixture("bill_status.html")).expect("status");
        assert_eq!(status.measure_num.as_deref(), Some("AB-1"));
        assert_eq!(status.subject.as_deref(), Some("Collective bargaining"));
        assert_eq!(status.authors, vec!["Rivas", "Alvarez", "Smith"]);
        assert!(status.last_action_at.is_some());
    }

    #[test]
    fn votes_page_depluralizes_and_strips_result() {
        let votes = parse_votes_page(&fixture("bill_votes.html")).expect("votes");
        assert_eq!(votes.len(), 3);
        let floor = &votes[0];
        assert_eq!(floor.floor_chamber(), Some("a"));
        assert_eq!(floor.result, "pass");
        assert_eq!(floor.positions["aye"], vec!["Alvarez", "Rivas"]);
        assert_eq!(floor.positions["no"], vec!["Smith"]);
        assert!(votes[1].floor_chamber().is_none());
    }

    #[test]
    fn committee_votes_adapt_to_skip_category() {
        let raws: Vec<_> = adapt_bill(record())
            .into_iter()
            .map(|r| r.expect("raw vote"))
            .collect();
        assert_eq!(raws.len(), 3);
        assert_eq!(raws[0].category, VoteCategory::Passage);
        assert!(raws[1].category.is_skipped());
        let state_bill = raws[0].state_bill.as_ref().expect("state bill");
        assert_eq!(state_bill.reference.code, "AB1");
        assert_eq!(state_bill.detail.chamber, "a");
        assert_eq!(state_bill.detail.bill_type.as_deref(), Some("bill"));
        assert_eq!(state_bill.detail.number, Some(1));
    }

    #[test]
    fn measure_types_follow_the_printed_code() {
        assert_eq!(measure_type("AB-1"), Some("bill"));
        assert_eq!(measure_type("ACR-5"), Some("concurrent resolution"));
        assert_eq!(measure_type("SJR-2"), Some("joint resolution"));
        assert_eq!(measure_type("HR-9"), Some("resolution"));
        assert_eq!(measure_type("X"), None);
    }
}
