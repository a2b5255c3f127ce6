//! Canonical action and vote identities.
//!
//! Every id here is a pure function of its inputs so repeated ingestion of the
//! same upstream data lands on the same key.

/// Reference to one piece of legislative business, resolvable to its action id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRef {
    Bill {
        bill_type: String,
        number: u32,
        congress: u32,
    },
    StateBill {
        state: String,
        session: String,
        code: String,
    },
    Nomination {
        chamber: String,
        number: String,
        congress: u32,
        session: String,
    },
    Treaty {
        chamber: String,
        vote_number: u32,
        congress: u32,
        session: String,
    },
    Cloture {
        chamber: String,
        vote_number: u32,
        congress: u32,
        session: String,
    },
}

impl ActionRef {
    pub fn action_id(&self) -> String {
        match self {
            Self::Bill {
                bill_type,
                number,
                congress,
            } => bill_action_id(bill_type, *number, *congress),
            Self::StateBill {
                state,
                session,
                code,
            } => state_bill_action_id(state, session, code),
            Self::Nomination {
                chamber,
                number,
                congress,
                session,
            } => nomination_action_id(chamber, number, *congress, session),
            Self::Treaty {
                chamber,
                vote_number,
                congress,
                session,
            } => treaty_action_id(chamber, *vote_number, *congress, session),
            Self::Cloture {
                chamber,
                vote_number,
                congress,
                session,
            } => cloture_action_id(chamber, *vote_number, *congress, session),
        }
    }
}

fn compact_lower(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// `{bill_type}{number}-{congress}`. Bill type codes carry the chamber letter
/// (`hr`, `s`, `hjres`, `sconres`, ...).
pub fn bill_action_id(bill_type: &str, number: u32, congress: u32) -> String {
    format!("{}{number}-{congress}", compact_lower(bill_type))
}

/// `{state}-{session}-{code}`, e.g. `tx-89r-hb1`.
pub fn state_bill_action_id(state: &str, session: &str, code: &str) -> String {
    format!(
        "{}-{}-{}",
        compact_lower(state),
        compact_lower(session),
        compact_lower(code)
    )
}

pub fn nomination_action_id(chamber: &str, number: &str, congress: u32, session: &str) -> String {
    format!(
        "{}n{}-{congress}.{}",
        compact_lower(chamber),
        number.trim(),
        session.trim()
    )
}

pub fn treaty_action_id(chamber: &str, vote_number: u32, congress: u32, session: &str) -> String {
    format!("{}t{vote_number}-{congress}.{}", compact_lower(chamber), session.trim())
}

pub fn cloture_action_id(chamber: &str, vote_number: u32, congress: u32, session: &str) -> String {
    format!("{}c{vote_number}-{congress}.{}", compact_lower(chamber), session.trim())
}

/// Position-derived vote id for sources without a stable vote id. Only valid
/// once the action's votes are sorted by date ascending.
pub fn state_vote_alternate_id(action_id: &str, index: usize) -> String {
    format!("state-{action_id}-v{index}")
}
