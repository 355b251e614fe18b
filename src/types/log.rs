use serde::{Deserialize, Serialize};

use super::primitives::{LogIndex, Term};

/// A single entry in the replicated log.
///
/// `command` is `None` for the no-op a new leader appends at the start of its term;
/// those entries are never handed to the state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: Option<Vec<u8>>,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: Vec<u8>) -> Self {
        Self {
            index,
            term,
            command: Some(command),
        }
    }

    pub fn noop(index: LogIndex, term: Term) -> Self {
        Self {
            index,
            term,
            command: None,
        }
    }
}

/// A compacted log prefix: everything up to and including `last_included_index`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}
