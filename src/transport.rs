//! Moving RPCs between nodes.
//!
//! `Transport` is the outbound seam used by the server actor. `TcpTransport` speaks
//! length-prefixed JSON frames (4-byte big-endian length, then the JSON body) over one
//! short-lived connection per call; `serve` is its inbound half. `LocalNetwork` wires
//! handles together in-process for tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::Error;
use crate::server::RaftHandle;
use crate::types::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, LogIndex,
    Message, NodeId, RequestVote, RequestVoteResponse, Term,
};

/// Frames larger than this are rejected before allocating a buffer for them.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Tries per outbound RPC when connecting or writing fails.
const CONNECT_ATTEMPTS: u32 = 3;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),
    #[error("rpc to {0} timed out")]
    Timeout(NodeId),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("peer {0} is unavailable")]
    Unavailable(NodeId),
}

/// Outbound RPCs, one typed method per kind.
///
/// A returned error means "no answer": the caller drops the request and relies on the
/// next timer tick, exactly as for a rejection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        to: &NodeId,
        req: RequestVote,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn append_entries(
        &self,
        to: &NodeId,
        req: AppendEntries,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn install_snapshot(
        &self,
        to: &NodeId,
        req: InstallSnapshot,
    ) -> Result<InstallSnapshotResponse, TransportError>;

    /// Route a request message to the matching typed call.
    async fn send(&self, to: &NodeId, message: Message) -> Result<Message, TransportError> {
        match message {
            Message::RequestVote(req) => self
                .request_vote(to, req)
                .await
                .map(Message::RequestVoteResponse),
            Message::AppendEntries(req) => self
                .append_entries(to, req)
                .await
                .map(Message::AppendEntriesResponse),
            Message::InstallSnapshot(req) => self
                .install_snapshot(to, req)
                .await
                .map(Message::InstallSnapshotResponse),
            other => Err(TransportError::Protocol(format!(
                "{} is not a request",
                other.kind()
            ))),
        }
    }
}

/// One piece of an `InstallSnapshot` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Byte offset of `data` within the full snapshot.
    pub offset: u64,
    pub data: Vec<u8>,
    pub is_last_chunk: bool,
}

/// Split a snapshot request into chunks of at most `chunk_bytes`. An empty payload still
/// yields one (last) chunk.
pub fn split_snapshot(req: InstallSnapshot, chunk_bytes: usize) -> Vec<SnapshotChunk> {
    let chunk_bytes = chunk_bytes.max(1);
    let pieces: Vec<&[u8]> = if req.data.is_empty() {
        vec![&req.data[..]]
    } else {
        req.data.chunks(chunk_bytes).collect()
    };
    let count = pieces.len();

    let mut offset = 0u64;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let chunk = SnapshotChunk {
                term: req.term,
                leader_id: req.leader_id.clone(),
                last_included_index: req.last_included_index,
                last_included_term: req.last_included_term,
                offset,
                data: piece.to_vec(),
                is_last_chunk: i + 1 == count,
            };
            offset += piece.len() as u64;
            chunk
        })
        .collect()
}

/// Reassembles chunks into one `InstallSnapshot`. Chunks must arrive in order; a chunk at
/// offset 0 starts over.
#[derive(Debug, Default)]
pub struct SnapshotAssembler {
    pending: Option<InstallSnapshot>,
}

impl SnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk. Returns the complete request once the last chunk is in.
    pub fn push(&mut self, chunk: SnapshotChunk) -> Result<Option<InstallSnapshot>, TransportError> {
        if chunk.offset == 0 {
            self.pending = Some(InstallSnapshot {
                term: chunk.term,
                leader_id: chunk.leader_id.clone(),
                last_included_index: chunk.last_included_index,
                last_included_term: chunk.last_included_term,
                data: Vec::new(),
            });
        }

        let Some(pending) = self.pending.as_mut() else {
            return Err(TransportError::Protocol(format!(
                "snapshot chunk at offset {} without a first chunk",
                chunk.offset
            )));
        };
        if pending.term != chunk.term
            || pending.leader_id != chunk.leader_id
            || pending.last_included_index != chunk.last_included_index
            || pending.last_included_term != chunk.last_included_term
        {
            self.pending = None;
            return Err(TransportError::Protocol(
                "snapshot chunk belongs to a different snapshot".into(),
            ));
        }
        if chunk.offset != pending.data.len() as u64 {
            let expected = pending.data.len();
            self.pending = None;
            return Err(TransportError::Protocol(format!(
                "snapshot chunk at offset {}, expected {expected}",
                chunk.offset
            )));
        }

        pending.data.extend_from_slice(&chunk.data);
        if chunk.is_last_chunk {
            return Ok(self.pending.take());
        }
        Ok(None)
    }
}

/// Everything that travels over a connection.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Request { from: NodeId, message: Message },
    SnapshotChunk(SnapshotChunk),
    Response { message: Message },
    Error { reason: String },
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(frame)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| TransportError::Protocol("frame exceeds 4 GiB".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, TransportError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Protocol(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// TCP transport for Raft RPCs.
///
/// Each call dials the peer, writes its frames and waits for one response frame. I/O
/// failures are retried with backoff; the caller bounds the whole call with its RPC
/// timeout.
pub struct TcpTransport {
    local_id: NodeId,
    peers: HashMap<NodeId, SocketAddr>,
    backoff: Backoff,
    chunk_bytes: usize,
}

impl TcpTransport {
    pub fn new(local_id: NodeId, peers: HashMap<NodeId, SocketAddr>, chunk_bytes: usize) -> Self {
        Self {
            local_id,
            peers,
            backoff: Backoff::default(),
            chunk_bytes,
        }
    }

    async fn call(&self, to: &NodeId, frames: &[Frame]) -> Result<Message, TransportError> {
        let addr = self
            .peers
            .get(to)
            .copied()
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?;

        let mut attempt = 0;
        loop {
            match exchange(addr, frames).await {
                Err(TransportError::Io(e)) if attempt + 1 < CONNECT_ATTEMPTS => {
                    let delay = self.backoff.delay(attempt);
                    debug!(peer = %to, attempt, error = %e, ?delay, "rpc failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn request(&self, message: Message) -> [Frame; 1] {
        [Frame::Request {
            from: self.local_id.clone(),
            message,
        }]
    }
}

/// Connect, write `frames`, read one response.
async fn exchange(addr: SocketAddr, frames: &[Frame]) -> Result<Message, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    for frame in frames {
        write_frame(&mut stream, frame).await?;
    }
    match read_frame(&mut stream).await? {
        Frame::Response { message } => Ok(message),
        Frame::Error { reason } => Err(TransportError::Protocol(reason)),
        other => Err(TransportError::Protocol(format!(
            "unexpected frame in response: {other:?}"
        ))),
    }
}

fn expect_response<T: TryFrom<Message, Error = Message>>(
    message: Message,
) -> Result<T, TransportError> {
    T::try_from(message).map_err(|other| {
        TransportError::Protocol(format!("unexpected response {}", other.kind()))
    })
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        to: &NodeId,
        req: RequestVote,
    ) -> Result<RequestVoteResponse, TransportError> {
        let response = self.call(to, &self.request(Message::RequestVote(req))).await?;
        expect_response(response)
    }

    async fn append_entries(
        &self,
        to: &NodeId,
        req: AppendEntries,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let response = self
            .call(to, &self.request(Message::AppendEntries(req)))
            .await?;
        expect_response(response)
    }

    async fn install_snapshot(
        &self,
        to: &NodeId,
        req: InstallSnapshot,
    ) -> Result<InstallSnapshotResponse, TransportError> {
        let frames: Vec<Frame> = split_snapshot(req, self.chunk_bytes)
            .into_iter()
            .map(Frame::SnapshotChunk)
            .collect();
        let response = self.call(to, &frames).await?;
        expect_response(response)
    }
}

/// Accept Raft connections on `listener` and feed them to `handle` until the listener fails.
pub async fn serve(listener: TcpListener, handle: RaftHandle) -> Result<(), TransportError> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handle).await {
                debug!(peer = %peer_addr, error = %e, "raft connection closed with error");
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, handle: RaftHandle) -> Result<(), TransportError> {
    let mut assembler = SnapshotAssembler::new();
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let request = match frame {
            Frame::Request { message, .. } => message,
            Frame::SnapshotChunk(chunk) => match assembler.push(chunk) {
                Ok(Some(req)) => Message::InstallSnapshot(req),
                Ok(None) => continue,
                Err(e) => {
                    let reason = e.to_string();
                    write_frame(&mut stream, &Frame::Error { reason }).await?;
                    return Err(e);
                }
            },
            other => {
                return Err(TransportError::Protocol(format!(
                    "unexpected frame from client: {other:?}"
                )));
            }
        };

        let reply = match dispatch(&handle, request).await {
            Ok(message) => Frame::Response { message },
            Err(e) => Frame::Error {
                reason: e.to_string(),
            },
        };
        write_frame(&mut stream, &reply).await?;
    }
}

/// Hand an inbound request to the local node.
async fn dispatch(handle: &RaftHandle, request: Message) -> Result<Message, Error> {
    match request {
        Message::RequestVote(req) => handle
            .request_vote(req)
            .await
            .map(Message::RequestVoteResponse),
        Message::AppendEntries(req) => handle
            .append_entries(req)
            .await
            .map(Message::AppendEntriesResponse),
        Message::InstallSnapshot(req) => handle
            .install_snapshot(req)
            .await
            .map(Message::InstallSnapshotResponse),
        other => Err(TransportError::Protocol(format!("{} is not a request", other.kind())).into()),
    }
}

#[derive(Default)]
struct Switchboard {
    nodes: HashMap<NodeId, RaftHandle>,
    isolated: HashSet<NodeId>,
}

/// In-process network connecting node handles directly. Clones share the same wiring.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<RwLock<Switchboard>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: NodeId, handle: RaftHandle) {
        self.inner.write().nodes.insert(id, handle);
    }

    /// Drop every request to or from `id` until `heal`.
    pub fn isolate(&self, id: &NodeId) {
        self.inner.write().isolated.insert(id.clone());
    }

    pub fn heal(&self, id: &NodeId) {
        self.inner.write().isolated.remove(id);
    }

    /// Transport for the node `id`.
    pub fn transport(&self, id: NodeId) -> LocalTransport {
        LocalTransport {
            id,
            network: self.clone(),
        }
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<RaftHandle, TransportError> {
        let board = self.inner.read();
        if board.isolated.contains(from) || board.isolated.contains(to) {
            return Err(TransportError::Unavailable(to.clone()));
        }
        board
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))
    }
}

/// `Transport` over a `LocalNetwork`.
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
}

fn unavailable(to: &NodeId, e: Error) -> TransportError {
    warn!(peer = %to, error = %e, "local peer failed to answer");
    TransportError::Unavailable(to.clone())
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        to: &NodeId,
        req: RequestVote,
    ) -> Result<RequestVoteResponse, TransportError> {
        let handle = self.network.route(&self.id, to)?;
        handle.request_vote(req).await.map_err(|e| unavailable(to, e))
    }

    async fn append_entries(
        &self,
        to: &NodeId,
        req: AppendEntries,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let handle = self.network.route(&self.id, to)?;
        handle.append_entries(req).await.map_err(|e| unavailable(to, e))
    }

    async fn install_snapshot(
        &self,
        to: &NodeId,
        req: InstallSnapshot,
    ) -> Result<InstallSnapshotResponse, TransportError> {
        let handle = self.network.route(&self.id, to)?;
        handle
            .install_snapshot(req)
            .await
            .map_err(|e| unavailable(to, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(data: Vec<u8>) -> InstallSnapshot {
        InstallSnapshot {
            term: Term::from(3),
            leader_id: NodeId::from("n1"),
            last_included_index: LogIndex::from(40),
            last_included_term: Term::from(2),
            data,
        }
    }

    #[test]
    fn chunks_reassemble_to_original() {
        let req = snapshot((0..=255u8).cycle().take(1000).collect());
        let chunks = split_snapshot(req.clone(), 64);
        assert_eq!(chunks.len(), 16);
        assert!(chunks.last().unwrap().is_last_chunk);
        assert!(chunks[..15].iter().all(|c| !c.is_last_chunk));

        let mut assembler = SnapshotAssembler::new();
        let mut done = None;
        for chunk in chunks {
            assert!(done.is_none());
            done = assembler.push(chunk).unwrap();
        }
        assert_eq!(done, Some(req));
    }

    #[test]
    fn empty_snapshot_is_one_chunk() {
        let chunks = split_snapshot(snapshot(vec![]), 64);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last_chunk);

        let mut assembler = SnapshotAssembler::new();
        let req = assembler.push(chunks[0].clone()).unwrap().unwrap();
        assert!(req.data.is_empty());
    }

    #[test]
    fn out_of_order_chunk_rejected() {
        let mut chunks = split_snapshot(snapshot(vec![7; 100]), 10);
        let mut assembler = SnapshotAssembler::new();
        assembler.push(chunks.remove(0)).unwrap();
        chunks.remove(0);

        let err = assembler.push(chunks.remove(0)).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn chunk_without_start_rejected() {
        let chunks = split_snapshot(snapshot(vec![1; 30]), 10);
        let mut assembler = SnapshotAssembler::new();
        assert!(assembler.push(chunks[1].clone()).is_err());
    }

    #[test]
    fn frames_are_tagged_json() {
        let frame = Frame::Error {
            reason: "nope".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"error","reason":"nope"}"#);
    }

    #[tokio::test]
    async fn frame_roundtrip_over_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let sent = Frame::Request {
            from: NodeId::from("n2"),
            message: Message::RequestVote(RequestVote {
                term: Term::from(3),
                candidate_id: NodeId::from("n2"),
                last_log_index: LogIndex::from(9),
                last_log_term: Term::from(2),
                is_pre_vote: true,
            }),
        };
        write_frame(&mut client, &sent).await.unwrap();

        let Frame::Request { from, message } = read_frame(&mut server).await.unwrap() else {
            panic!("wrong frame")
        };
        assert_eq!(from, NodeId::from("n2"));
        assert_eq!(message.kind(), "PreVote");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_BYTES as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn unknown_peer_fails_fast() {
        let transport = TcpTransport::new(NodeId::from("n1"), HashMap::new(), 1024);
        let err = transport
            .request_vote(
                &NodeId::from("n9"),
                RequestVote {
                    term: Term::from(1),
                    candidate_id: NodeId::from("n1"),
                    last_log_index: LogIndex::ZERO,
                    last_log_term: Term::ZERO,
                    is_pre_vote: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_retried_then_reported() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let transport = TcpTransport::new(
            NodeId::from("n1"),
            HashMap::from([(NodeId::from("n2"), addr)]),
            1024,
        );

        let started = std::time::Instant::now();
        let err = transport
            .append_entries(
                &NodeId::from("n2"),
                AppendEntries {
                    term: Term::from(1),
                    leader_id: NodeId::from("n1"),
                    prev_log_index: LogIndex::ZERO,
                    prev_log_term: Term::ZERO,
                    entries: vec![],
                    leader_commit: LogIndex::ZERO,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Io(_)));
        // Two backoff sleeps of at least the 10ms floor.
        assert!(started.elapsed() >= std::time::Duration::from_millis(20));
    }

    #[tokio::test]
    async fn chunked_snapshot_reaches_a_served_node() {
        use crate::kv::{KvCommand, KvStore};
        use crate::options::RaftOptions;
        use crate::runtime::StateMachine;
        use crate::storage::Stores;

        let mut options = RaftOptions::new("n2", ["n1", "n2", "n3"].map(NodeId::from));
        options.election_timeout_min_ms = 5_000;
        options.election_timeout_max_ms = 6_000;
        let (handle, _task) = crate::server::spawn(
            options.validate().unwrap(),
            Stores::memory(),
            KvStore::new(),
            Arc::new(LocalNetwork::new().transport(NodeId::from("n2"))),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, handle.clone()));

        let mut source = KvStore::new();
        source.execute(KvCommand::Set {
            key: "k".into(),
            value: "v".repeat(100),
        });
        let transport = TcpTransport::new(
            NodeId::from("n1"),
            HashMap::from([(NodeId::from("n2"), addr)]),
            16,
        );
        let resp = transport
            .install_snapshot(
                &NodeId::from("n2"),
                InstallSnapshot {
                    term: Term::from(2),
                    leader_id: NodeId::from("n1"),
                    last_included_index: LogIndex::from(10),
                    last_included_term: Term::from(2),
                    data: source.snapshot().unwrap(),
                },
            )
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.term, Term::from(2));
        let status = handle
            .subscribe()
            .wait_for(|s| s.snapshot_index == LogIndex::from(10))
            .await
            .unwrap()
            .clone();
        assert_eq!(status.last_applied, LogIndex::from(10));
        assert_eq!(status.leader_id, Some(NodeId::from("n1")));
    }
}
