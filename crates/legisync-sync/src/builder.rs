//! Action Cache Builder: folds canonical raw votes into actions keyed by
//! their derived identity, then freezes the result into a [`CacheSnapshot`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use legisync_adapters::{
    adapt_record, AdapterContext, AdapterError, BillDetailSource, IdentityResolver, SourceAdapter,
    SourceRecord,
};
use legisync_core::{
    bill_action_id, state_bill_action_id, state_vote_alternate_id, Action, ActionKind, ActionRef,
    BillDetail, BillReference, Cosponsor, Level, MemberIndexEntry, RawVote, StateBill, Vote,
    VoteCategory,
};
use legisync_storage::{CacheSnapshot, HttpFetcher, LoadedSnapshot};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Success,
    Skipped,
    Failure(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestTally {
    pub success: usize,
    pub skipped: usize,
    pub failure: usize,
    pub total: usize,
}

impl IngestTally {
    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Success => self.success += 1,
            IngestOutcome::Skipped => self.skipped += 1,
            IngestOutcome::Failure(_) => self.failure += 1,
        }
        self.total += 1;
    }
}

/// Actions and members collected during one ingestion run.
#[derive(Debug, Clone, Default)]
pub struct ActionAccumulator {
    actions: BTreeMap<String, Action>,
    members: BTreeMap<String, MemberIndexEntry>,
}

impl ActionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-opens every action of a previous snapshot.
    pub fn from_snapshot(snapshot: CacheSnapshot) -> Self {
        Self::from_loaded(snapshot.into())
    }

    /// Unreadable action files are left out; the next ingest recreates them.
    pub fn from_loaded(loaded: LoadedSnapshot) -> Self {
        let mut actions = BTreeMap::new();
        for entry in loaded.entries {
            match entry.action {
                Ok(action) => {
                    actions.insert(action.id.clone(), action);
                }
                Err(err) => warn!(file = %entry.file_name, error = %err, "dropping unreadable seed action"),
            }
        }
        Self {
            actions,
            members: loaded.members,
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.get(id)
    }

    pub fn members(&self) -> &BTreeMap<String, MemberIndexEntry> {
        &self.members
    }
}

pub struct ActionCacheBuilder {
    resolver: IdentityResolver,
    bill_source: Option<Arc<dyn BillDetailSource>>,
    acc: ActionAccumulator,
    /// Action ids whose detail was already applied in this run.
    refreshed: BTreeSet<String>,
    tally: IngestTally,
}

impl ActionCacheBuilder {
    pub fn new(resolver: IdentityResolver) -> Self {
        Self {
            resolver,
            bill_source: None,
            acc: ActionAccumulator::new(),
            refreshed: BTreeSet::new(),
            tally: IngestTally::default(),
        }
    }

    pub fn with_bill_source(mut self, source: Arc<dyn BillDetailSource>) -> Self {
        self.bill_source = Some(source);
        self
    }

    pub fn with_accumulator(mut self, acc: ActionAccumulator) -> Self {
        self.acc = acc;
        self
    }

    pub fn tally(&self) -> IngestTally {
        self.tally
    }

    pub fn accumulator(&self) -> &ActionAccumulator {
        &self.acc
    }

    pub async fn ingest_vote(&mut self, raw: RawVote) -> IngestOutcome {
        let label = vote_label(&raw);
        let outcome = if raw.category.is_skipped() {
            debug!(vote = %label, category = ?raw.category, "skipping vote");
            IngestOutcome::Skipped
        } else {
            match self.attach(raw).await {
                Ok(action_id) => {
                    debug!(vote = %label, %action_id, "vote attached");
                    IngestOutcome::Success
                }
                Err(reason) => {
                    warn!(vote = %label, %reason, "vote not ingested");
                    IngestOutcome::Failure(reason)
                }
            }
        };
        self.tally.record(&outcome);
        outcome
    }

    pub async fn ingest_record(&mut self, record: SourceRecord) -> Vec<IngestOutcome> {
        let label = record.label();
        let mut outcomes = Vec::new();
        for raw in adapt_record(record) {
            let outcome = match raw {
                Ok(raw) => self.ingest_vote(raw).await,
                Err(err) => self.record_adapter_failure(&label, &err),
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Pulls every record from `adapter`. Only a whole-source failure is returned
    /// as an error; per-record failures are tallied.
    pub async fn ingest_source(
        &mut self,
        adapter: &dyn SourceAdapter,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<IngestTally, AdapterError> {
        let records = adapter.fetch_records(http, ctx).await?;
        info!(source = adapter.source_id(), records = records.len(), "ingesting source records");
        for record in records {
            match record {
                Ok(record) => {
                    self.ingest_record(record).await;
                }
                Err(err) => {
                    self.record_adapter_failure(adapter.source_id(), &err);
                }
            }
        }
        Ok(self.tally)
    }

    pub fn record_adapter_failure(&mut self, label: &str, err: &AdapterError) -> IngestOutcome {
        warn!(record = label, error = %err, "source record failed");
        let outcome = IngestOutcome::Failure(format!("{label}: {err}"));
        self.tally.record(&outcome);
        outcome
    }

    /// Sorts votes, assigns position ids for state actions and freezes the cache.
    pub fn finish(self, generated_at: DateTime<Utc>) -> (CacheSnapshot, IngestTally) {
        let ActionAccumulator { mut actions, members } = self.acc;
        for action in actions.values_mut() {
            match action.level {
                Level::National => action
                    .votes
                    .sort_by(|a, b| (a.date, &a.alternate_id, &a.question).cmp(&(b.date, &b.alternate_id, &b.question))),
                Level::State => {
                    action.votes.sort_by(|a, b| {
                        (a.date, &a.chamber, &a.question, &a.result)
                            .cmp(&(b.date, &b.chamber, &b.question, &b.result))
                    });
                    for (index, vote) in action.votes.iter_mut().enumerate() {
                        vote.alternate_id = state_vote_alternate_id(&action.id, index);
                    }
                }
            }
        }
        info!(
            actions = actions.len(),
            members = members.len(),
            success = self.tally.success,
            skipped = self.tally.skipped,
            failure = self.tally.failure,
            total = self.tally.total,
            "cache build finished"
        );
        (
            CacheSnapshot {
                generated_at,
                actions,
                members,
            },
            self.tally,
        )
    }

    async fn attach(&mut self, mut raw: RawVote) -> Result<String, String> {
        if raw.category == VoteCategory::Unhandled {
            return Err("vote has no category".to_string());
        }

        let action_id = if let Some(bill) = raw.bill.clone() {
            self.materialize_bill(&bill, &raw).await?
        } else if let Some(state_bill) = raw.state_bill.take() {
            self.materialize_state_bill(*state_bill, &raw)
        } else {
            self.materialize_from_vote(&raw)?
        };

        let vote = vote_from_raw(&self.resolver, &mut self.acc.members, &raw);
        let action = self
            .acc
            .actions
            .get_mut(&action_id)
            .ok_or_else(|| format!("action {action_id} missing after materialization"))?;
        append_vote(action, vote);
        Ok(action_id)
    }

    async fn materialize_bill(&mut self, bill: &BillReference, raw: &RawVote) -> Result<String, String> {
        let id = bill_action_id(&bill.bill_type, bill.number, bill.congress);
        if self.refreshed.contains(&id) {
            return Ok(id);
        }
        let cached = self.acc.actions.contains_key(&id);
        let Some(source) = self.bill_source.clone() else {
            return if cached {
                Ok(id)
            } else {
                Err(format!("no bill detail source for {id}"))
            };
        };

        match source.bill_detail(bill).await {
            Ok(detail) => {
                self.refreshed.insert(id.clone());
                merge_detail(&mut self.acc.actions, &id, Level::National, None, detail, raw.updated_at);
                Ok(id)
            }
            Err(err) if cached => {
                warn!(action_id = %id, error = %err, "bill detail refresh failed, keeping cached action");
                self.refreshed.insert(id.clone());
                Ok(id)
            }
            Err(err) => Err(format!("bill detail for {id}: {err}")),
        }
    }

    fn materialize_state_bill(&mut self, state_bill: StateBill, raw: &RawVote) -> String {
        let reference = &state_bill.reference;
        let id = state_bill_action_id(&reference.state, &reference.session, &reference.code);
        if self.refreshed.insert(id.clone()) {
            let state = reference.state.to_ascii_uppercase();
            let detail = self.resolve_authors(&state_bill);
            merge_detail(&mut self.acc.actions, &id, Level::State, Some(state), detail, raw.updated_at);
        }
        id
    }

    fn resolve_authors(&self, state_bill: &StateBill) -> BillDetail {
        let mut detail = state_bill.detail.clone();
        match state_bill.sponsor_name.as_deref() {
            Some(name) if name.to_lowercase().contains("committee") => {
                detail.sponsor_id = None;
                detail.sponsor_type = Some("committee".to_string());
                detail.cosponsors.clear();
                return detail;
            }
            Some(name) => {
                detail.sponsor_id = self.resolver.resolve_name(name);
                detail.sponsor_type = Some("person".to_string());
            }
            None => {}
        }

        let mut seen: BTreeSet<String> = detail.sponsor_id.iter().cloned().collect();
        for name in &state_bill.author_names {
            let Some(id) = self.resolver.resolve_name(name) else {
                continue;
            };
            if seen.insert(id.clone()) {
                detail.cosponsors.push(Cosponsor {
                    id,
                    original_cosponsor: None,
                    sponsored_at: None,
                    withdrawn_at: None,
                });
            }
        }
        detail
    }

    /// Nominations, treaties and cloture motions exist only through their votes.
    fn materialize_from_vote(&mut self, raw: &RawVote) -> Result<String, String> {
        let congress = raw.congress.ok_or("vote has no congress")?;
        let session = raw.session.clone().ok_or("vote has no session")?;
        let chamber = raw.chamber.clone();

        let (kind, reference, title) = match &raw.category {
            VoteCategory::Nomination => {
                let nomination = raw.nomination.as_ref().ok_or("nomination vote without nomination")?;
                (
                    ActionKind::Nomination,
                    ActionRef::Nomination {
                        chamber,
                        number: nomination.number.clone(),
                        congress,
                        session,
                    },
                    nomination.title.clone(),
                )
            }
            VoteCategory::Treaty => (
                ActionKind::Treaty,
                ActionRef::Treaty {
                    chamber,
                    vote_number: raw.number.ok_or("treaty vote without number")?,
                    congress,
                    session,
                },
                raw.treaty
                    .as_ref()
                    .map(|t| t.title.clone())
                    .unwrap_or_else(|| raw.question.clone()),
            ),
            VoteCategory::Cloture => (
                ActionKind::Cloture,
                ActionRef::Cloture {
                    chamber,
                    vote_number: raw.number.ok_or("cloture vote without number")?,
                    congress,
                    session,
                },
                raw.question.clone(),
            ),
            other => return Err(format!("unhandled vote category {other:?}")),
        };

        let id = reference.action_id();
        match self.acc.actions.get_mut(&id) {
            Some(action) => {
                if raw.updated_at > action.cache_updated_at {
                    if action.status_at.map_or(true, |at| raw.date >= at) {
                        action.status = raw.result.clone();
                        action.status_at = Some(raw.date);
                    }
                    action.official_title = Some(title);
                    action.raise_watermark(raw.updated_at);
                }
            }
            None => {
                self.acc.actions.insert(
                    id.clone(),
                    Action {
                        id: id.clone(),
                        kind,
                        level: raw.level,
                        state: raw.state.clone(),
                        chamber: raw.chamber.clone(),
                        bill_type: None,
                        congress: Some(congress),
                        number: raw.number,
                        introduced_at: Some(raw.date),
                        official_title: Some(title),
                        popular_title: None,
                        short_title: None,
                        sponsor_id: None,
                        sponsor_type: None,
                        status: raw.result.clone(),
                        status_at: Some(raw.date),
                        tags: Vec::new(),
                        top_tag: None,
                        summary: BTreeMap::new(),
                        cache_updated_at: raw.updated_at,
                        source_url: raw.source_url.clone(),
                        cosponsors: Vec::new(),
                        amendments: Vec::new(),
                        votes: Vec::new(),
                    },
                );
            }
        }
        Ok(id)
    }
}

fn vote_label(raw: &RawVote) -> String {
    raw.vote_id
        .clone()
        .unwrap_or_else(|| format!("{} vote on {}", raw.chamber, raw.date.format("%Y-%m-%d")))
}

/// Creates the action from `detail`, or refreshes an existing one when the
/// detail is at least as new. Votes are never touched here.
fn merge_detail(
    actions: &mut BTreeMap<String, Action>,
    id: &str,
    level: Level,
    state: Option<String>,
    detail: BillDetail,
    fallback_updated_at: DateTime<Utc>,
) {
    let updated_at = detail.updated_at.unwrap_or(fallback_updated_at);
    let fresh = Action {
        id: id.to_string(),
        kind: ActionKind::Bill,
        level,
        state,
        chamber: detail.chamber,
        bill_type: detail.bill_type,
        congress: detail.congress,
        number: detail.number,
        introduced_at: detail.introduced_at,
        official_title: detail.official_title,
        popular_title: detail.popular_title,
        short_title: detail.short_title,
        sponsor_id: detail.sponsor_id,
        sponsor_type: detail.sponsor_type,
        status: detail.status,
        status_at: detail.status_at,
        tags: detail.tags,
        top_tag: detail.top_tag,
        summary: detail.summary,
        cache_updated_at: updated_at,
        source_url: detail.source_url,
        cosponsors: detail.cosponsors,
        amendments: detail.amendments,
        votes: Vec::new(),
    };

    match actions.get_mut(id) {
        Some(existing) if updated_at >= existing.cache_updated_at => {
            let votes = std::mem::take(&mut existing.votes);
            *existing = Action { votes, ..fresh };
        }
        Some(existing) => {
            debug!(action_id = id, cached = %existing.cache_updated_at, incoming = %updated_at, "older detail ignored");
        }
        None => {
            actions.insert(id.to_string(), fresh);
        }
    }
}

fn vote_from_raw(
    resolver: &IdentityResolver,
    members: &mut BTreeMap<String, MemberIndexEntry>,
    raw: &RawVote,
) -> Vote {
    let mut member_votes = BTreeMap::new();
    for (outcome, voters) in &raw.positions {
        for voter in voters {
            let Some(resolved) = resolver.resolve_member(&raw.chamber, voter) else {
                debug!(name = %voter.name, "dropping unresolved voter");
                continue;
            };
            if resolved.indexed && !members.contains_key(&resolved.id) {
                members.insert(
                    resolved.id.clone(),
                    MemberIndexEntry {
                        id: resolved.id.clone(),
                        display_name: resolved.display_name.clone(),
                        party: resolved.party.clone(),
                        state: resolved.state.clone(),
                        source_id: resolved.source_id.clone(),
                        provisional: resolved.provisional,
                    },
                );
            }
            member_votes.insert(resolved.id, outcome.clone());
        }
    }

    Vote {
        alternate_id: raw.vote_id.clone().unwrap_or_default(),
        source_url: raw.source_url.clone(),
        chamber: raw.chamber.clone(),
        congress: raw.congress,
        session: raw.session.clone(),
        requires: raw.requires.clone(),
        number: raw.number,
        question: raw.question.clone(),
        result: raw.result.clone(),
        result_text: raw.result_text.clone(),
        date: raw.date,
        cache_updated_at: raw.updated_at,
        vote_type: raw.vote_type.clone(),
        member_votes,
    }
}

/// Votes are append-only: a vote already on the action is never rewritten.
fn append_vote(action: &mut Action, vote: Vote) {
    let duplicate = if vote.alternate_id.is_empty() {
        let fingerprint = vote.fingerprint();
        action.votes.iter().any(|v| v.fingerprint() == fingerprint)
    } else {
        action.votes.iter().any(|v| v.alternate_id == vote.alternate_id)
    };
    if duplicate {
        debug!(action_id = %action.id, vote = %vote.alternate_id, "vote already cached");
        return;
    }
    action.votes.push(vote);
}
