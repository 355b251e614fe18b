//! Raft consensus algorithm implementation.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation
//! - The TLA+ specification at github.com/ongardie/raft.tla
//!
//! `node` is the protocol core and does no I/O beyond its stores. `runtime` adds timers
//! and the state machine, `server` runs that as a tokio actor, and `transport` moves its
//! RPCs between processes.

pub mod backoff;
pub mod client_api;
pub mod cluster;
pub mod command;
pub mod error;
pub mod file_storage;
pub mod health;
pub mod kv;
pub mod log;
pub mod node;
pub mod options;
pub mod runtime;
pub mod server;
pub mod state;
pub mod storage;
pub mod transport;
pub mod types;

pub use command::Command;
pub use error::{Error, Result};
pub use node::{Node, NodeStatus, RoleKind};
pub use options::{RaftOptions, ValidatedOptions};
pub use runtime::{Applied, Event, Runtime, StateMachine};
pub use server::RaftHandle;
pub use storage::{LogStore, SnapshotStore, StateStore, Stores};
pub use types::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, LogEntry,
    LogIndex, Message, NodeId, RequestVote, RequestVoteResponse, Snapshot, Term,
};
