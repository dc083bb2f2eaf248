//! Log entries.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::membership::Membership;
use crate::LogId;
use crate::MessageSummary;

/// A Raft log entry.
///
/// Entries are immutable once created. An entry beyond a divergence point may be replaced on a
/// follower before it is committed, never after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,

    /// This entry's payload.
    pub payload: EntryPayload,
}

impl Entry {
    /// Create an entry which only asserts a leader's term.
    pub fn new_blank(log_id: LogId) -> Self {
        Entry {
            log_id,
            payload: EntryPayload::Blank,
        }
    }

    pub fn new_normal(log_id: LogId, data: Vec<u8>) -> Self {
        Entry {
            log_id,
            payload: EntryPayload::Normal(data),
        }
    }

    pub fn new_membership(log_id: LogId, membership: Membership) -> Self {
        Entry {
            log_id,
            payload: EntryPayload::Membership(membership),
        }
    }

    pub fn index(&self) -> u64 {
        self.log_id.index
    }

    pub fn term(&self) -> u64 {
        self.log_id.term
    }

    pub fn kind(&self) -> EntryKind {
        self.payload.kind()
    }

    /// The config carried by this entry, if it is a config entry.
    pub fn membership(&self) -> Option<&Membership> {
        match &self.payload {
            EntryPayload::Membership(m) => Some(m),
            _ => None,
        }
    }
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

/// Log entry payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A command for the application state machine.
    Normal(Vec<u8>),
    /// A change-membership log entry.
    Membership(Membership),
}

impl EntryPayload {
    pub fn kind(&self) -> EntryKind {
        match self {
            EntryPayload::Blank => EntryKind::NoOp,
            EntryPayload::Normal(_) => EntryKind::Command,
            EntryPayload::Membership(_) => EntryKind::Configuration,
        }
    }
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(data) => format!("normal({}B)", data.len()),
            EntryPayload::Membership(c) => format!("membership: {}", c.summary()),
        }
    }
}

/// The kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Command,
    Configuration,
    NoOp,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
