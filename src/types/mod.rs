mod log;
mod message;
mod primitives;

pub use log::{LogEntry, Snapshot};
pub use message::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, Message,
    RequestVote, RequestVoteResponse,
};
pub use primitives::{LogIndex, NodeId, Term};
