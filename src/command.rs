use crate::types::{Message, NodeId, Snapshot};

/// Commands that the node issues to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send a message to a specific peer.
    Send { to: NodeId, message: Message },
    /// Re-roll and restart the election timer.
    ResetElectionTimer,
    /// Restart the heartbeat ticker (leader only).
    ResetHeartbeatTimer,
    /// Replace the state machine's contents with an installed snapshot.
    RestoreSnapshot(Snapshot),
}
