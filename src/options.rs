//! Node configuration and its one-time startup validation.

use std::collections::HashSet;
use std::ops::Deref;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Every way a `RaftOptions` can be rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("node_id must not be empty")]
    EmptyNodeId,
    #[error("node_id {0} is not one of cluster_members")]
    NodeNotMember(NodeId),
    #[error("cluster_members contains {0} more than once")]
    DuplicateMember(NodeId),
    #[error("cluster_members must list at least 3 nodes, got {0}")]
    TooFewMembers(usize),
    #[error("heartbeat_interval_ms must be > 0")]
    ZeroHeartbeat,
    #[error("election_timeout_min_ms ({min}) must be greater than heartbeat_interval_ms ({heartbeat})")]
    ElectionMinNotAboveHeartbeat { min: u64, heartbeat: u64 },
    #[error("election_timeout_max_ms ({max}) must be greater than election_timeout_min_ms ({min})")]
    ElectionMaxNotAboveMin { min: u64, max: u64 },
    #[error("max_entries_per_append must be >= 1")]
    ZeroMaxEntries,
    #[error("snapshot_threshold ({threshold}) must be >= max_entries_per_append ({max_entries})")]
    SnapshotThresholdTooSmall { threshold: u64, max_entries: u64 },
    #[error("rpc_timeout_ms must be > 0")]
    ZeroRpcTimeout,
    #[error("max_inflight_per_peer must be >= 1")]
    ZeroInflight,
    #[error("snapshot_chunk_bytes must be >= 1")]
    ZeroSnapshotChunk,
}

/// Configuration surface for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftOptions {
    pub node_id: NodeId,
    /// Every voting member, this node included.
    pub cluster_members: Vec<NodeId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_entries_per_append: u64,
    /// Take a snapshot once this many applied entries sit above the last one.
    pub snapshot_threshold: u64,
    pub enable_pre_vote: bool,
    /// Upper bound on a single outbound RPC, retries included.
    pub rpc_timeout_ms: u64,
    /// Outbound requests allowed in flight to one peer before new ones are dropped.
    pub max_inflight_per_peer: usize,
    /// Chunk size used by transports that stream snapshots.
    pub snapshot_chunk_bytes: usize,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(""),
            cluster_members: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_entries_per_append: 100,
            snapshot_threshold: 10_000,
            enable_pre_vote: true,
            rpc_timeout_ms: 500,
            max_inflight_per_peer: 2,
            snapshot_chunk_bytes: 64 * 1024,
        }
    }
}

impl RaftOptions {
    /// Defaults for `node_id` in a cluster of `members`.
    pub fn new(node_id: impl Into<NodeId>, members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            cluster_members: members.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Check every rule once. The runtime only ever sees the validated form.
    pub fn validate(self) -> Result<ValidatedOptions, OptionsError> {
        if self.node_id.is_empty() {
            return Err(OptionsError::EmptyNodeId);
        }

        let mut seen = HashSet::new();
        for member in &self.cluster_members {
            if !seen.insert(member) {
                return Err(OptionsError::DuplicateMember(member.clone()));
            }
        }
        if self.cluster_members.len() < 3 {
            return Err(OptionsError::TooFewMembers(self.cluster_members.len()));
        }
        if !seen.contains(&self.node_id) {
            return Err(OptionsError::NodeNotMember(self.node_id.clone()));
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(OptionsError::ZeroHeartbeat);
        }
        if self.election_timeout_min_ms <= self.heartbeat_interval_ms {
            return Err(OptionsError::ElectionMinNotAboveHeartbeat {
                min: self.election_timeout_min_ms,
                heartbeat: self.heartbeat_interval_ms,
            });
        }
        if self.election_timeout_max_ms <= self.election_timeout_min_ms {
            return Err(OptionsError::ElectionMaxNotAboveMin {
                min: self.election_timeout_min_ms,
                max: self.election_timeout_max_ms,
            });
        }
        if self.max_entries_per_append == 0 {
            return Err(OptionsError::ZeroMaxEntries);
        }
        if self.snapshot_threshold < self.max_entries_per_append {
            return Err(OptionsError::SnapshotThresholdTooSmall {
                threshold: self.snapshot_threshold,
                max_entries: self.max_entries_per_append,
            });
        }
        if self.rpc_timeout_ms == 0 {
            return Err(OptionsError::ZeroRpcTimeout);
        }
        if self.max_inflight_per_peer == 0 {
            return Err(OptionsError::ZeroInflight);
        }
        if self.snapshot_chunk_bytes == 0 {
            return Err(OptionsError::ZeroSnapshotChunk);
        }

        Ok(ValidatedOptions(self))
    }
}

/// `RaftOptions` that passed `validate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedOptions(RaftOptions);

impl ValidatedOptions {
    /// Members other than this node, in configuration order.
    pub fn peers(&self) -> Vec<NodeId> {
        self.0
            .cluster_members
            .iter()
            .filter(|m| **m != self.0.node_id)
            .cloned()
            .collect()
    }

    pub fn cluster_size(&self) -> usize {
        self.0.cluster_members.len()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.0.heartbeat_interval_ms)
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.0.election_timeout_min_ms),
            Duration::from_millis(self.0.election_timeout_max_ms),
        )
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.0.rpc_timeout_ms)
    }

    pub fn max_entries_per_append(&self) -> usize {
        usize::try_from(self.0.max_entries_per_append).unwrap_or(usize::MAX)
    }
}

impl Deref for ValidatedOptions {
    type Target = RaftOptions;

    fn deref(&self) -> &RaftOptions {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<NodeId> {
        vec!["n1".into(), "n2".into(), "n3".into()]
    }

    fn options() -> RaftOptions {
        RaftOptions::new("n1", members())
    }

    #[test]
    fn defaults_validate() {
        let validated = options().validate().unwrap();
        assert_eq!(validated.cluster_size(), 3);
        assert_eq!(validated.peers(), vec![NodeId::from("n2"), NodeId::from("n3")]);
        assert_eq!(validated.election_timeout_min_ms, 150);
        assert!(validated.enable_pre_vote);
    }

    #[test]
    fn rejects_empty_node_id() {
        let err = RaftOptions::new("", members()).validate().unwrap_err();
        assert_eq!(err, OptionsError::EmptyNodeId);
    }

    #[test]
    fn rejects_node_outside_members() {
        let err = RaftOptions::new("n9", members()).validate().unwrap_err();
        assert_eq!(err, OptionsError::NodeNotMember("n9".into()));
    }

    #[test]
    fn rejects_small_or_duplicated_cluster() {
        let err = RaftOptions::new("n1", vec!["n1".into(), "n2".into()])
            .validate()
            .unwrap_err();
        assert_eq!(err, OptionsError::TooFewMembers(2));

        let err = RaftOptions::new("n1", vec!["n1".into(), "n2".into(), "n2".into()])
            .validate()
            .unwrap_err();
        assert_eq!(err, OptionsError::DuplicateMember("n2".into()));
    }

    #[test]
    fn rejects_bad_timing() {
        let mut o = options();
        o.heartbeat_interval_ms = 0;
        assert_eq!(o.validate().unwrap_err(), OptionsError::ZeroHeartbeat);

        let mut o = options();
        o.election_timeout_min_ms = 50;
        assert!(matches!(
            o.validate().unwrap_err(),
            OptionsError::ElectionMinNotAboveHeartbeat { .. }
        ));

        let mut o = options();
        o.election_timeout_max_ms = 150;
        assert!(matches!(
            o.validate().unwrap_err(),
            OptionsError::ElectionMaxNotAboveMin { .. }
        ));
    }

    #[test]
    fn rejects_bad_batching() {
        let mut o = options();
        o.max_entries_per_append = 0;
        assert_eq!(o.validate().unwrap_err(), OptionsError::ZeroMaxEntries);

        let mut o = options();
        o.snapshot_threshold = 10;
        assert!(matches!(
            o.validate().unwrap_err(),
            OptionsError::SnapshotThresholdTooSmall { .. }
        ));
    }

    #[test]
    fn error_messages_name_the_fields() {
        let mut o = options();
        o.election_timeout_max_ms = 100;
        let message = o.validate().unwrap_err().to_string();
        assert!(message.contains("election_timeout_max_ms"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let o: RaftOptions =
            serde_json::from_str(r#"{"node_id":"a","cluster_members":["a","b","c"]}"#).unwrap();
        assert_eq!(o.heartbeat_interval_ms, 50);
        assert!(o.validate().is_ok());
    }
}
