//! Error types shared across the crate.

use crate::options::OptionsError;
use crate::storage::StorageError;
use crate::transport::TransportError;
use crate::types::NodeId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A durable write or read failed. The node stops participating.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("state machine: {0}")]
    StateMachine(String),
    #[error("options: {0}")]
    Options(#[from] OptionsError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("not the leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    /// A previous persistence failure stopped this node.
    #[error("node halted after a persistence failure")]
    Halted,
    #[error("node is shutting down")]
    Shutdown,
}
