//! Member identity resolution.
//!
//! National votes carry chamber-internal ids that are mapped through an
//! [`AliasTable`]; state scrapes only carry printed names, matched against a
//! [`MemberRoster`]. New state ids are checked against the persistent store
//! through [`MemberDirectory`] before they are handed out.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use legisync_core::{Level, RawVoteMember};
use serde::Deserialize;
use strsim::jaro_winkler;
use tracing::{info, warn};

/// Id recorded for a ballot cast without a member id (the presiding Vice President).
pub const PRESIDING_OFFICER_ID: &str = "VP";

const LIKELY_MATCH_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RosterTerm {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub district: Option<u32>,
    #[serde(default)]
    pub party: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RosterMember {
    /// Empty until an id has been assigned.
    #[serde(default)]
    pub id: String,
    pub full_name: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub alt_name: Option<String>,
    #[serde(default)]
    pub term: Option<RosterTerm>,
}

impl RosterMember {
    pub fn party(&self) -> Option<&str> {
        self.term.as_ref().and_then(|t| t.party.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    members: BTreeMap<String, RosterMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchQuality {
    /// Exact last-name or full-name match on a single member.
    Exact,
    /// Substring match on a single member.
    Partial,
    /// More than one member matched at the deciding stage; the first by id was used.
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberMatch {
    pub id: String,
    pub quality: MatchQuality,
    pub candidates: Vec<String>,
}

/// State legislators for one session, kept sorted by id so tie-breaks are stable.
#[derive(Debug, Clone)]
pub struct MemberRoster {
    state: String,
    members: Vec<RosterMember>,
}

impl MemberRoster {
    pub fn new(state: impl Into<String>, mut members: Vec<RosterMember>) -> Self {
        members.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.full_name.cmp(&b.full_name)));
        Self {
            state: state.into().to_ascii_uppercase(),
            members,
        }
    }

    /// Reads a `{ "members": { key: member } }` roster file.
    pub fn load(path: impl AsRef<Path>, state: &str) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file: RosterFile = crate::read_json_file(path)
            .with_context(|| format!("loading member roster {}", path.display()))?;
        Ok(Self::new(state, file.members.into_values().collect()))
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn members(&self) -> &[RosterMember] {
        &self.members
    }

    pub fn get(&self, id: &str) -> Option<&RosterMember> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Last name, then full name, then full-name substring, then alt-name substring.
    pub fn resolve_name(&self, name: &str) -> Option<MemberMatch> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }

        let stages: [(MatchQuality, &dyn Fn(&RosterMember) -> bool); 4] = [
            (MatchQuality::Exact, &|m: &RosterMember| m.last_name.to_lowercase() == needle),
            (MatchQuality::Exact, &|m: &RosterMember| m.full_name.to_lowercase() == needle),
            (MatchQuality::Partial, &|m: &RosterMember| {
                m.full_name.to_lowercase().contains(&needle)
            }),
            (MatchQuality::Partial, &|m: &RosterMember| {
                m.alt_name
                    .as_deref()
                    .is_some_and(|alt| alt.to_lowercase().contains(&needle))
            }),
        ];

        for (quality, matches) in stages {
            let candidates: Vec<String> = self
                .members
                .iter()
                .filter(|m| !m.id.is_empty() && matches(*m))
                .map(|m| m.id.clone())
                .collect();
            let Some(first) = candidates.first().cloned() else {
                continue;
            };
            if candidates.len() > 1 {
                warn!(
                    name,
                    chosen = %first,
                    candidates = ?candidates,
                    "member name matched several ids, verification needed"
                );
                return Some(MemberMatch {
                    id: first,
                    quality: MatchQuality::Ambiguous,
                    candidates,
                });
            }
            return Some(MemberMatch {
                id: first,
                quality,
                candidates,
            });
        }

        warn!(name, state = %self.state, "unable to resolve member id for name");
        None
    }

    /// Gives every member without an id a unique one. Runs sequentially so ids
    /// assigned earlier in the same call count as local collisions.
    pub async fn assign_missing_ids(
        &mut self,
        directory: &dyn MemberDirectory,
    ) -> anyhow::Result<Vec<IdAssignment>> {
        let mut local: BTreeSet<String> = self
            .members
            .iter()
            .filter(|m| !m.id.is_empty())
            .map(|m| m.id.clone())
            .collect();
        let mut assignments = Vec::new();

        for member in self.members.iter_mut().filter(|m| m.id.is_empty()) {
            let provisional = state_member_id(&self.state, &member.first_name, &member.last_name);
            let assignment =
                assign_member_id(&provisional, &member.full_name, &local, directory).await?;
            member.id = assignment.id().to_string();
            local.insert(member.id.clone());
            assignments.push(assignment);
        }

        self.members
            .sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.full_name.cmp(&b.full_name)));
        Ok(assignments)
    }
}

/// `{STATE}-{first initial}{last name}`, e.g. `TX-JSmith`.
pub fn state_member_id(state: &str, first_name: &str, last_name: &str) -> String {
    let initial: String = first_name
        .trim()
        .chars()
        .next()
        .map(|c| c.to_uppercase().collect())
        .unwrap_or_default();
    let last: String = last_name.chars().filter(|c| !c.is_whitespace()).collect();
    format!("{}-{initial}{last}", state.trim().to_ascii_uppercase())
}

#[derive(Debug, Deserialize)]
struct LegislatorIds {
    #[serde(default)]
    bioguide: Option<String>,
    #[serde(default)]
    lis: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegislatorRecord {
    id: LegislatorIds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAlias {
    pub id: String,
    pub provisional: bool,
}

/// Chamber-internal id (Senate LIS) to bioguide id.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn new(aliases: BTreeMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Builds the table from a legislators file (`[{ "id": { "bioguide", "lis" } }]`).
    pub fn from_legislators_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let records: Vec<LegislatorRecord> = crate::read_json_file(path)
            .with_context(|| format!("loading legislator ids {}", path.display()))?;
        let aliases = records
            .into_iter()
            .filter_map(|r| Some((r.id.lis?, r.id.bioguide?)))
            .collect();
        Ok(Self { aliases })
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    pub fn resolve(&self, raw_id: &str) -> ResolvedAlias {
        match self.aliases.get(raw_id) {
            Some(id) => ResolvedAlias {
                id: id.clone(),
                provisional: false,
            },
            None => ResolvedAlias {
                id: raw_id.to_string(),
                provisional: true,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMember {
    pub id: String,
    pub display_name: String,
    pub party: Option<String>,
    pub state: Option<String>,
    pub source_id: Option<String>,
    pub provisional: bool,
    /// False for placeholder ids that do not belong in the member index.
    pub indexed: bool,
}

/// Maps raw vote members to canonical member ids for one jurisdiction.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    level: Level,
    aliases: AliasTable,
    roster: Option<MemberRoster>,
}

impl IdentityResolver {
    pub fn national(aliases: AliasTable) -> Self {
        Self {
            level: Level::National,
            aliases,
            roster: None,
        }
    }

    pub fn state(roster: MemberRoster) -> Self {
        Self {
            level: Level::State,
            aliases: AliasTable::default(),
            roster: Some(roster),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn roster(&self) -> Option<&MemberRoster> {
        self.roster.as_ref()
    }

    pub fn resolve_member(&self, chamber: &str, member: &RawVoteMember) -> Option<ResolvedMember> {
        match self.level {
            Level::National => Some(self.resolve_national(chamber, member)),
            Level::State => self.resolve_state(member),
        }
    }

    fn resolve_national(&self, chamber: &str, member: &RawVoteMember) -> ResolvedMember {
        let Some(raw_id) = member.source_id.as_deref().filter(|id| !id.is_empty()) else {
            return ResolvedMember {
                id: PRESIDING_OFFICER_ID.to_string(),
                display_name: member.name.clone(),
                party: None,
                state: None,
                source_id: None,
                provisional: false,
                indexed: false,
            };
        };

        if chamber != "s" {
            return ResolvedMember {
                id: raw_id.to_string(),
                display_name: member.name.clone(),
                party: member.party.clone(),
                state: member.state.clone(),
                source_id: None,
                provisional: false,
                indexed: true,
            };
        }

        let alias = self.aliases.resolve(raw_id);
        if alias.provisional {
            warn!(lis_id = raw_id, name = %member.name, "no bioguide alias for senate id, keeping raw id");
        }
        ResolvedMember {
            id: alias.id,
            display_name: member.name.clone(),
            party: member.party.clone(),
            state: member.state.clone(),
            source_id: Some(raw_id.to_string()),
            provisional: alias.provisional,
            indexed: true,
        }
    }

    fn resolve_state(&self, member: &RawVoteMember) -> Option<ResolvedMember> {
        let roster = self.roster.as_ref()?;
        let entry = member
            .source_id
            .as_deref()
            .and_then(|id| roster.get(id))
            .or_else(|| {
                roster
                    .resolve_name(&member.name)
                    .and_then(|found| roster.get(&found.id))
            })?;

        Some(ResolvedMember {
            id: entry.id.clone(),
            display_name: entry.full_name.clone(),
            party: entry.party().map(str::to_string).or_else(|| member.party.clone()),
            state: Some(roster.state().to_string()),
            source_id: None,
            provisional: false,
            indexed: true,
        })
    }

    /// Sponsor and author lookups; national records already carry ids.
    pub fn resolve_name(&self, name: &str) -> Option<String> {
        self.roster
            .as_ref()
            .and_then(|roster| roster.resolve_name(name))
            .map(|found| found.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryMember {
    pub id: String,
    pub full_name: String,
}

/// Remote view of already-persisted member ids.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn members_with_id_prefix(&self, prefix: &str) -> anyhow::Result<Vec<DirectoryMember>>;
}

/// Directory with no remote members, for offline cache builds.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineDirectory;

#[async_trait]
impl MemberDirectory for OfflineDirectory {
    async fn members_with_id_prefix(&self, _prefix: &str) -> anyhow::Result<Vec<DirectoryMember>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdAssignment {
    /// Same id and same name already stored.
    Existing(String),
    /// A stored member with a near-identical name; needs manual verification.
    Likely(String),
    /// Collision with other members; suffixed with the collision count.
    Suffixed(String),
    Provisional(String),
}

impl IdAssignment {
    pub fn id(&self) -> &str {
        match self {
            Self::Existing(id) | Self::Likely(id) | Self::Suffixed(id) | Self::Provisional(id) => id,
        }
    }
}

fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read-then-compute: two concurrent callers can hand out the same suffix.
/// Callers serialize assignment; see [`MemberRoster::assign_missing_ids`].
pub async fn assign_member_id(
    provisional_id: &str,
    full_name: &str,
    local_ids: &BTreeSet<String>,
    directory: &dyn MemberDirectory,
) -> anyhow::Result<IdAssignment> {
    let remote = directory
        .members_with_id_prefix(provisional_id)
        .await
        .with_context(|| format!("looking up stored members like {provisional_id}"))?;

    if let Some(exact) = remote
        .iter()
        .find(|m| m.id == provisional_id && m.full_name.eq_ignore_ascii_case(full_name))
    {
        info!(id = %exact.id, full_name, "exact member match");
        return Ok(IdAssignment::Existing(exact.id.clone()));
    }

    let wanted = normalize_name(full_name);
    let likely = remote
        .iter()
        .map(|m| (jaro_winkler(&wanted, &normalize_name(&m.full_name)), m))
        .filter(|(score, _)| *score >= LIKELY_MATCH_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0));
    if let Some((score, found)) = likely {
        warn!(
            id = %found.id,
            full_name,
            stored_name = %found.full_name,
            score,
            "likely member match, verification needed"
        );
        return Ok(IdAssignment::Likely(found.id.clone()));
    }

    let local_dupes = local_ids
        .iter()
        .filter(|id| id.starts_with(provisional_id))
        .count();
    let dup_count = local_dupes + remote.len();
    if dup_count > 0 {
        let taken = |candidate: &str| {
            local_ids.contains(candidate) || remote.iter().any(|m| m.id == candidate)
        };
        let id = (dup_count + 1..)
            .map(|n| format!("{provisional_id}{n}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| format!("{provisional_id}{}", dup_count + 1));
        info!(from = provisional_id, to = %id, "member id conflict, adjusting");
        return Ok(IdAssignment::Suffixed(id));
    }

    Ok(IdAssignment::Provisional(provisional_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, first: &str, last: &str, alt: Option<&str>) -> RosterMember {
        RosterMember {
            id: id.to_string(),
            full_name: format!("{first} {last}"),
            first_name: first.to_string(),
            last_name: last.to_string(),
            alt_name: alt.map(str::to_string),
            term: None,
        }
    }

    fn roster() -> MemberRoster {
        MemberRoster::new(
            "ca",
            vec![
                member("CA-JSmith", "Jane", "Smith", None),
                member("CA-BSmith", "Bob", "Smith", None),
                member("CA-MRivas", "Maria", "Rivas", Some("Robert Rivas")),
                member("CA-DAlvarez", "David", "Alvarez", None),
            ],
        )
    }

    struct FixedDirectory(Vec<DirectoryMember>);

    #[async_trait]
    impl MemberDirectory for FixedDirectory {
        async fn members_with_id_prefix(&self, prefix: &str) -> anyhow::Result<Vec<DirectoryMember>> {
            Ok(self
                .0
                .iter()
                .filter(|m| m.id.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    fn stored(id: &str, name: &str) -> DirectoryMember {
        DirectoryMember {
            id: id.to_string(),
            full_name: name.to_string(),
        }
    }

    #[test]
    fn name_resolution_follows_match_order() {
        let roster = roster();
        let hit = roster.resolve_name("alvarez").expect("last name");
        assert_eq!(hit.id, "CA-DAlvarez");
        assert_eq!(hit.quality, MatchQuality::Exact);

        let hit = roster.resolve_name("Maria Rivas").expect("full name");
        assert_eq!(hit.quality, MatchQuality::Exact);

        let hit = roster.resolve_name("Robert").expect("alt name");
        assert_eq!(hit.id, "CA-MRivas");
        assert_eq!(hit.quality, MatchQuality::Partial);

        assert!(roster.resolve_name("Nobody").is_none());
        assert!(roster.resolve_name("  ").is_none());
    }

    #[test]
    fn ambiguous_names_pick_first_id_and_report_candidates() {
        let hit = roster().resolve_name("Smith").expect("match");
        assert_eq!(hit.quality, MatchQuality::Ambiguous);
        assert_eq!(hit.id, "CA-BSmith");
        assert_eq!(hit.candidates, vec!["CA-BSmith", "CA-JSmith"]);
    }

    #[test]
    fn senate_ids_map_through_aliases() {
        let aliases = AliasTable::new(BTreeMap::from([("S354".to_string(), "B001230".to_string())]));
        let resolver = IdentityResolver::national(aliases);
        let raw = |id: Option<&str>| RawVoteMember {
            source_id: id.map(str::to_string),
            name: "Member".into(),
            party: Some("D".into()),
            state: Some("WI".into()),
        };

        let known = resolver.resolve_member("s", &raw(Some("S354"))).expect("known");
        assert_eq!(known.id, "B001230");
        assert_eq!(known.source_id.as_deref(), Some("S354"));
        assert!(!known.provisional);

        let unknown = resolver.resolve_member("s", &raw(Some("S999"))).expect("unknown");
        assert_eq!(unknown.id, "S999");
        assert!(unknown.provisional);

        let vp = resolver.resolve_member("s", &raw(None)).expect("vp");
        assert_eq!(vp.id, PRESIDING_OFFICER_ID);
        assert!(!vp.indexed);

        let house = resolver.resolve_member("h", &raw(Some("A000370"))).expect("house");
        assert_eq!(house.id, "A000370");
    }

    #[test]
    fn provisional_state_ids_use_initial_and_last_name() {
        assert_eq!(state_member_id("tx", "jane", "Smith"), "TX-JSmith");
        assert_eq!(state_member_id("TX", "Ana", "De La Cruz"), "TX-ADeLaCruz");
    }

    #[tokio::test]
    async fn exact_stored_member_is_reused() {
        let dir = FixedDirectory(vec![stored("TX-JSmith", "Jane Smith")]);
        let got = assign_member_id("TX-JSmith", "jane smith", &BTreeSet::new(), &dir)
            .await
            .expect("assign");
        assert_eq!(got, IdAssignment::Existing("TX-JSmith".into()));
    }

    #[tokio::test]
    async fn near_identical_name_is_a_likely_match() {
        let dir = FixedDirectory(vec![stored("TX-JSmith2", "Jane  Smith.")]);
        let got = assign_member_id("TX-JSmith", "Jane Smith", &BTreeSet::new(), &dir)
            .await
            .expect("assign");
        assert_eq!(got, IdAssignment::Likely("TX-JSmith2".into()));
    }

    #[tokio::test]
    async fn collisions_are_suffixed_from_local_and_remote_counts() {
        let dir = FixedDirectory(vec![stored("TX-JSmith", "John Smith")]);
        let local = BTreeSet::from(["TX-JSmith2".to_string(), "TX-BJones".to_string()]);
        let got = assign_member_id("TX-JSmith", "Jenna Smithers", &local, &dir)
            .await
            .expect("assign");
        assert_eq!(got, IdAssignment::Suffixed("TX-JSmith3".into()));

        let got = assign_member_id("TX-KLee", "Kim Lee", &local, &OfflineDirectory)
            .await
            .expect("assign");
        assert_eq!(got, IdAssignment::Provisional("TX-KLee".into()));
    }

    #[tokio::test]
    async fn suffix_skips_ids_already_taken() {
        let dir = FixedDirectory(vec![stored("TX-JSmith2", "Ximena Smith")]);
        let got = assign_member_id("TX-JSmith", "John Smith", &BTreeSet::new(), &dir)
            .await
            .expect("assign");
        assert_eq!(got, IdAssignment::Suffixed("TX-JSmith3".into()));

        let local = BTreeSet::from(["TX-JSmith".to_string(), "TX-JSmith3".to_string()]);
        let got = assign_member_id("TX-JSmith", "John Smith", &local, &dir)
            .await
            .expect("assign");
        assert_eq!(got, IdAssignment::Suffixed("TX-JSmith4".into()));
    }

    #[tokio::test]
    async fn roster_assigns_missing_ids_sequentially() {
        let mut roster = MemberRoster::new(
            "tx",
            vec![
                member("", "Jane", "Smith", None),
                member("", "Joe", "Smith", None),
            ],
        );
        let assigned = roster
            .assign_missing_ids(&OfflineDirectory)
            .await
            .expect("assign");
        let ids: Vec<_> = assigned.iter().map(|a| a.id().to_string()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"TX-JSmith".to_string()));
        assert!(ids.contains(&"TX-JSmith2".to_string()));
        assert!(roster.get("TX-JSmith2").is_some());
    }
}
