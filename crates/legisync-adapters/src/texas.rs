//! Texas bill-history XML from a local mirror of the legislature FTP archive.
//!
//! The XML only says that a record vote happened (`RV#123` in an action
//! comment). Member positions come from journal tallies kept alongside the
//! archive in `journal_votes.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use legisync_core::{
    BillDetail, Level, RawVote, RawVoteMember, StateBill, StateBillReference, VoteCategory,
};
use legisync_storage::HttpFetcher;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    parse_source_timestamp, read_json_file, AdapterContext, AdapterError, SourceAdapter,
    SourceRecord,
};

pub const JOURNAL_FILE: &str = "journal_votes.json";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxCaption {
    #[serde(rename = "@version", default)]
    pub version: Option<String>,
    #[serde(rename = "$text", default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TxSubjects {
    #[serde(rename = "subject", default)]
    pub subject: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxAction {
    #[serde(rename = "actionNumber", default)]
    pub action_number: Option<String>,
    pub date: String,
    pub description: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TxActions {
    #[serde(rename = "action", default)]
    pub action: Vec<TxAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename = "billhistory")]
pub struct TxBillHistory {
    /// `89(R) HB 1`
    #[serde(rename = "@bill")]
    pub bill: String,
    #[serde(rename = "@lastUpdate", default)]
    pub last_update: Option<String>,
    #[serde(default)]
    pub caption: Option<TxCaption>,
    #[serde(default)]
    pub authors: Option<String>,
    #[serde(default)]
    pub coauthors: Option<String>,
    #[serde(default)]
    pub subjects: Option<TxSubjects>,
    #[serde(default)]
    pub actions: Option<TxActions>,
}

pub fn parse_bill_history(xml: &str) -> Result<TxBillHistory, AdapterError> {
    quick_xml::de::from_str(xml)
        .map_err(|e| AdapterError::Message(format!("invalid billhistory xml: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JournalRecordVote {
    pub chamber: String,
    pub number: u32,
    pub date: String,
    #[serde(default)]
    pub question: Option<String>,
    pub result: String,
    /// Outcome (`yea`, `nay`, `present not voting`, ...) -> printed names.
    #[serde(default)]
    pub positions: BTreeMap<String, Vec<String>>,
}

/// Journal tallies keyed by `(chamber, record vote number)`.
#[derive(Debug, Clone, Default)]
pub struct JournalIndex {
    votes: BTreeMap<(String, u32), JournalRecordVote>,
}

impl JournalIndex {
    pub fn new(votes: Vec<JournalRecordVote>) -> Self {
        Self {
            votes: votes
                .into_iter()
                .map(|v| ((v.chamber.to_ascii_lowercase(), v.number), v))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let votes: Vec<JournalRecordVote> = read_json_file(path)?;
        Ok(Self::new(votes))
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn get(&self, chamber: &str, number: u32) -> Option<&JournalRecordVote> {
        self.votes.get(&(chamber.to_ascii_lowercase(), number))
    }
}

#[derive(Debug, Clone)]
pub struct TxBillRecord {
    pub session: String,
    pub source_path: PathBuf,
    pub history: TxBillHistory,
    pub journal: Arc<JournalIndex>,
}

/// `RV#123` anywhere in the text.
pub fn record_vote_number(text: &str) -> Option<u32> {
    let start = text.find("RV#")? + 3;
    let digits: String = text[start..]
        .chars()
        .skip_while(|c| c.is_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// `89(R) HB 1` -> (`89R`, `HB 1`).
pub fn split_bill_label(label: &str) -> Option<(String, String)> {
    let (session, code) = label.trim().split_once(' ')?;
    let session: String = session.chars().filter(|c| !matches!(c, '(' | ')')).collect();
    let code = code.trim();
    if session.is_empty() || code.is_empty() {
        return None;
    }
    Some((session, code.to_string()))
}

fn split_names(raw: Option<&str>) -> Vec<String> {
    raw.map(|names| {
        names
            .split('|')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn action_chamber(action: &TxAction, fallback: &str) -> String {
    match action.action_number.as_deref().and_then(|n| n.chars().next()) {
        Some('H') | Some('h') => "h".to_string(),
        Some('S') | Some('s') => "s".to_string(),
        _ => fallback.to_string(),
    }
}

/// Passage-like actions decided without a record vote.
fn is_unrecorded_decision(description: &str) -> bool {
    let lower = description.to_lowercase();
    ["passed", "adopted", "failed"].iter().any(|w| lower.contains(w))
}

fn bill_detail(history: &TxBillHistory, code: &str, source_url: String) -> BillDetail {
    let actions = history
        .actions
        .as_ref()
        .map(|a| a.action.as_slice())
        .unwrap_or_default();
    let letters: String = code.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let number = code
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .collect::<String>()
        .trim()
        .parse()
        .ok();
    let subjects = history
        .subjects
        .as_ref()
        .map(|s| s.subject.clone())
        .unwrap_or_default();
    let last_action = actions.last();

    BillDetail {
        chamber: letters
            .chars()
            .next()
            .map(|c| c.to_ascii_lowercase().to_string())
            .unwrap_or_default(),
        bill_type: Some(letters.to_ascii_lowercase()).filter(|t| !t.is_empty()),
        congress: None,
        number,
        introduced_at: actions.first().and_then(|a| parse_source_timestamp(&a.date)),
        official_title: history
            .caption
            .as_ref()
            .and_then(|c| c.text.clone())
            .map(|t| t.trim().to_string()),
        popular_title: None,
        short_title: None,
        sponsor_id: None,
        sponsor_type: None,
        status: last_action.map(|a| a.description.clone()).unwrap_or_default(),
        status_at: last_action.and_then(|a| parse_source_timestamp(&a.date)),
        top_tag: subjects.first().cloned(),
        tags: subjects,
        summary: BTreeMap::new(),
        updated_at: history.last_update.as_deref().and_then(parse_source_timestamp),
        source_url,
        cosponsors: Vec::new(),
        amendments: Vec::new(),
    }
}

fn journal_vote(
    bill_label: &str,
    chamber: &str,
    number: u32,
    action: &TxAction,
    journal: &JournalIndex,
) -> Result<(DateTime<Utc>, String, String, BTreeMap<String, Vec<RawVoteMember>>), AdapterError> {
    let tally = journal.get(chamber, number).ok_or_else(|| {
        AdapterError::Message(format!(
            "{bill_label}: record vote {chamber} RV#{number} not found in journal"
        ))
    })?;
    let date = parse_source_timestamp(&tally.date)
        .or_else(|| parse_source_timestamp(&action.date))
        .ok_or_else(|| {
            AdapterError::Message(format!("{bill_label}: RV#{number} has no usable date"))
        })?;
    let positions = tally
        .positions
        .iter()
        .map(|(outcome, names)| {
            let members = names
                .iter()
                .map(|name| RawVoteMember {
                    source_id: None,
                    name: name.clone(),
                    party: None,
                    state: Some("TX".to_string()),
                })
                .collect();
            (outcome.to_lowercase(), members)
        })
        .collect();
    let question = tally
        .question
        .clone()
        .unwrap_or_else(|| action.description.clone());
    Ok((date, question, tally.result.trim().to_lowercase(), positions))
}

pub fn adapt_bill(record: TxBillRecord) -> Vec<Result<RawVote, AdapterError>> {
    let history = &record.history;
    let Some((session, code)) = split_bill_label(&history.bill) else {
        return vec![Err(AdapterError::Message(format!(
            "unrecognised bill label {:?} in {}",
            history.bill,
            record.source_path.display()
        )))];
    };
    if !session.eq_ignore_ascii_case(&record.session) {
        debug!(bill = %history.bill, expected = %record.session, "bill session differs from archive session");
    }

    let source_url = format!("file://{}", record.source_path.display());
    let detail = bill_detail(history, &code, source_url.clone());
    let authors = split_names(history.authors.as_deref());
    let state_bill = StateBill {
        reference: StateBillReference {
            state: "TX".to_string(),
            session: session.clone(),
            code: code.clone(),
        },
        detail: detail.clone(),
        sponsor_name: authors.first().cloned(),
        author_names: authors
            .iter()
            .skip(1)
            .cloned()
            .chain(split_names(history.coauthors.as_deref()))
            .collect(),
    };

    let actions = history
        .actions
        .as_ref()
        .map(|a| a.action.as_slice())
        .unwrap_or_default();

    let mut out = Vec::new();
    for action in actions {
        let comment = action.comment.as_deref().unwrap_or_default();
        let marker = record_vote_number(comment).or_else(|| record_vote_number(&action.description));
        let chamber = action_chamber(action, &detail.chamber);

        let vote = match marker {
            Some(number) => journal_vote(&history.bill, &chamber, number, action, &record.journal)
                .map(|(date, question, result, positions)| {
                    let category = if action.description.to_lowercase().contains("amendment") {
                        VoteCategory::Amendment
                    } else {
                        VoteCategory::Passage
                    };
                    (category, date, question, result, positions)
                }),
            None if is_unrecorded_decision(&action.description) => {
                let Some(date) = parse_source_timestamp(&action.date) else {
                    out.push(Err(AdapterError::Message(format!(
                        "{}: action {:?} has invalid date {:?}",
                        history.bill, action.description, action.date
                    ))));
                    continue;
                };
                // voice votes have no per-member record
                Ok((
                    VoteCategory::Procedural,
                    date,
                    action.description.clone(),
                    action.description.to_lowercase(),
                    BTreeMap::new(),
                ))
            }
            None => continue,
        };

        out.push(vote.map(|(category, date, question, result, positions)| RawVote {
            level: Level::State,
            state: Some("TX".to_string()),
            category,
            chamber,
            congress: None,
            session: Some(session.clone()),
            number: marker,
            date,
            updated_at: date,
            vote_id: None,
            question,
            result,
            result_text: None,
            requires: None,
            vote_type: None,
            source_url: source_url.clone(),
            bill: None,
            state_bill: Some(Box::new(state_bill.clone())),
            nomination: None,
            treaty: None,
            positions,
        }));
    }
    out
}

/// Local mirror: `{archive}/billhistory/**/*.xml` plus `{archive}/journal_votes.json`.
#[derive(Debug, Clone)]
pub struct TexasArchive {
    root: PathBuf,
    session: String,
}

impl TexasArchive {
    pub fn new(root: impl Into<PathBuf>, session: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            session: session.into(),
        }
    }

    pub fn history_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.join("billhistory")];
        while let Some(dir) = pending.pop() {
            let entries =
                fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))?;
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
                {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn load_journal(&self) -> anyhow::Result<JournalIndex> {
        let path = self.root.join(JOURNAL_FILE);
        if !path.exists() {
            warn!(path = %path.display(), "no journal tallies, record votes will fail");
            return Ok(JournalIndex::default());
        }
        JournalIndex::load(&path)
    }

    fn load_bill(&self, path: &Path, journal: &Arc<JournalIndex>) -> Result<SourceRecord, AdapterError> {
        let xml = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(SourceRecord::Texas(TxBillRecord {
            session: self.session.clone(),
            source_path: path.to_path_buf(),
            history: parse_bill_history(&xml)?,
            journal: Arc::clone(journal),
        }))
    }
}

#[async_trait]
impl SourceAdapter for TexasArchive {
    fn source_id(&self) -> &'static str {
        "texas"
    }

    fn level(&self) -> Level {
        Level::State
    }

    async fn fetch_records(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<Result<SourceRecord, AdapterError>>, AdapterError> {
        let journal = Arc::new(self.load_journal()?);
        let files = self.history_files()?;
        info!(
            run_id = %ctx.run_id,
            bills = files.len(),
            journal_votes = journal.len(),
            session = %self.session,
            "texas archive listed"
        );
        Ok(files
            .iter()
            .map(|path| self.load_bill(path, &journal))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> TexasArchive {
        TexasArchive::new(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/texas"),
            "89R",
        )
    }

    fn records() -> Vec<TxBillRecord> {
        let archive = archive();
        let journal = Arc::new(archive.load_journal().expect("journal"));
        archive
            .history_files()
            .expect("files")
            .iter()
            .map(|p| match archive.load_bill(p, &journal).expect("bill") {
                SourceRecord::Texas(r) => r,
                other => panic!("unexpected record {other:?}"),
            })
            .collect()
    }

    #[test]
    fn record_vote_markers_parse() {
        assert_eq!(record_vote_number("Record vote RV#123"), Some(123));
        assert_eq!(record_vote_number("RV# 45 (see journal)"), Some(45));
        assert_eq!(record_vote_number("Voice vote"), None);
        assert_eq!(
            split_bill_label("89(R) HB 1"),
            Some(("89R".to_string(), "HB 1".to_string()))
        );
    }

    #[test]
    fn bill_history_xml_parses() {
        let records = records();
        assert_eq!(records.len(), 2);
        let hb1 = &records[0].history;
        assert_eq!(hb1.bill, "89(R) HB 1");
        let actions = &hb1.actions.as_ref().expect("actions").action;
        assert_eq!(actions.len(), 4);
        assert_eq!(
            hb1.subjects.as_ref().expect("subjects").subject,
            vec!["State Finances--Appropriations", "Education--Finance"]
        );
    }

    #[test]
    fn record_votes_match_journal_tallies() {
        let votes = adapt_bill(records().remove(0));
        assert_eq!(votes.len(), 2);
        let recorded = votes[0].as_ref().expect("recorded vote");
        assert_eq!(recorded.category, VoteCategory::Passage);
        assert_eq!(recorded.chamber, "h");
        assert_eq!(recorded.number, Some(12));
        assert_eq!(recorded.positions["yea"].len(), 2);
        let state_bill = recorded.state_bill.as_ref().expect("state bill");
        assert_eq!(state_bill.reference.code, "HB 1");
        assert_eq!(state_bill.sponsor_name.as_deref(), Some("Bonnen"));
        assert_eq!(state_bill.detail.bill_type.as_deref(), Some("hb"));
        assert_eq!(state_bill.detail.number, Some(1));

        let voice = votes[1].as_ref().expect("voice vote");
        assert!(voice.category.is_skipped());
    }

    #[test]
    fn unmatched_record_vote_fails_only_that_vote() {
        let votes = adapt_bill(records().remove(1));
        assert_eq!(votes.len(), 1);
        assert!(votes[0].is_err());
    }
}
