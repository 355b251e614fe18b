use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::primitives::{LogIndex, NodeId, Term};

/// RequestVote RPC arguments.
///
/// With `is_pre_vote` set the request is a non-binding poll: `term` is the term the
/// candidate would campaign in, and neither side persists anything.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    #[serde(default)]
    pub is_pre_vote: bool,
}

/// RequestVote RPC response. `is_pre_vote` echoes the request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
    #[serde(default)]
    pub is_pre_vote: bool,
}

/// AppendEntries RPC arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
///
/// On a consistency-check failure the follower may fill in the conflict hint:
/// `conflict_term` is the term it holds at `prev_log_index` and `conflict_index` the first
/// index it stores for that term, or its last index + 1 when the entry is missing entirely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
    #[serde(default)]
    pub conflict_index: Option<LogIndex>,
    #[serde(default)]
    pub conflict_term: Option<Term>,
}

impl AppendEntriesResponse {
    pub fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            match_index: LogIndex::ZERO,
            conflict_index: None,
            conflict_term: None,
        }
    }
}

/// InstallSnapshot RPC arguments, always carrying the fully reassembled payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

/// All possible Raft messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
            Message::InstallSnapshot(m) => m.term,
            Message::InstallSnapshotResponse(m) => m.term,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::RequestVoteResponse(_)
                | Message::AppendEntriesResponse(_)
                | Message::InstallSnapshotResponse(_)
        )
    }

    /// The node that originated a request. Responses carry no sender.
    pub fn sender(&self) -> Option<&NodeId> {
        match self {
            Message::RequestVote(m) => Some(&m.candidate_id),
            Message::AppendEntries(m) => Some(&m.leader_id),
            Message::InstallSnapshot(m) => Some(&m.leader_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(m) if m.is_pre_vote => "PreVote",
            Message::RequestVote(_) => "RequestVote",
            Message::RequestVoteResponse(_) => "RequestVoteResponse",
            Message::AppendEntries(_) => "AppendEntries",
            Message::AppendEntriesResponse(_) => "AppendEntriesResponse",
            Message::InstallSnapshot(_) => "InstallSnapshot",
            Message::InstallSnapshotResponse(_) => "InstallSnapshotResponse",
        }
    }
}

macro_rules! response_from_message {
    ($($variant:ident),*) => {$(
        impl TryFrom<Message> for $variant {
            type Error = Message;

            fn try_from(message: Message) -> Result<Self, Message> {
                match message {
                    Message::$variant(m) => Ok(m),
                    other => Err(other),
                }
            }
        }
    )*};
}

response_from_message!(RequestVoteResponse, AppendEntriesResponse, InstallSnapshotResponse);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_responses_without_conflict_hint_still_decode() {
        let json = r#"{"term":3,"success":false,"match_index":0}"#;
        let resp: AppendEntriesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp, AppendEntriesResponse::rejected(Term::from(3)));
    }

    #[test]
    fn sender_is_only_known_for_requests() {
        let req = Message::AppendEntries(AppendEntries {
            term: Term::from(1),
            leader_id: NodeId::from("n1"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        });
        assert_eq!(req.sender(), Some(&NodeId::from("n1")));
        assert!(!req.is_response());

        let resp = Message::InstallSnapshotResponse(InstallSnapshotResponse {
            term: Term::from(1),
            success: true,
        });
        assert_eq!(resp.sender(), None);
        assert!(resp.is_response());
    }
}
