use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonically increasing term number.
///
/// Terms act as logical clocks in Raft and are used to detect stale information.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term {
    value: u64,
}

impl Term {
    pub const ZERO: Term = Term { value: 0 };

    pub fn get(self) -> u64 {
        self.value
    }

    pub fn increment(self) -> Term {
        Term {
            value: self.value.saturating_add(1),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.value)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term { value }
    }
}

/// 1-based log index.
///
/// LogIndex 0 represents "no entries" or "before the first entry".
/// Valid log entries start at index 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogIndex {
    value: u64,
}

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex { value: 0 };

    pub fn get(self) -> u64 {
        self.value
    }

    pub fn next(self) -> LogIndex {
        LogIndex {
            value: self.value.saturating_add(1),
        }
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.value == 0 {
            None
        } else {
            Some(LogIndex {
                value: self.value - 1,
            })
        }
    }

    /// Index `n` positions after this one.
    pub fn plus(self, n: u64) -> LogIndex {
        LogIndex {
            value: self.value.saturating_add(n),
        }
    }

    /// Number of positions from `earlier` up to this index, zero if `earlier` is ahead.
    pub fn distance_from(self, earlier: LogIndex) -> u64 {
        self.value.saturating_sub(earlier.value)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.value)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        LogIndex { value }
    }
}

/// Unique server identifier, as it appears in the cluster member list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId {
    value: String,
}

impl NodeId {
    pub fn new(value: impl Into<String>) -> NodeId {
        NodeId {
            value: value.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId { value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_increment() {
        assert_eq!(Term::ZERO.increment(), Term::from(1));
    }

    #[test]
    fn log_index_prev_stops_at_zero() {
        assert_eq!(LogIndex::from(1).prev(), Some(LogIndex::ZERO));
        assert_eq!(LogIndex::ZERO.prev(), None);
    }

    #[test]
    fn log_index_distance_saturates() {
        assert_eq!(LogIndex::from(10).distance_from(LogIndex::from(4)), 6);
        assert_eq!(LogIndex::from(4).distance_from(LogIndex::from(10)), 0);
    }

    #[test]
    fn node_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&NodeId::from("n1")).unwrap();
        assert_eq!(json, "\"n1\"");
        assert!(NodeId::from("  ").is_empty());
    }
}
