use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::node::{Node, NodeStatus};
use crate::options::ValidatedOptions;
use crate::runtime::{Event, Runtime, StateMachine};
use crate::storage::Stores;
use crate::transport::{Transport, TransportError};
use crate::types::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, LogIndex,
    Message, NodeId, RequestVote, RequestVoteResponse, Term,
};

const INBOUND_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Work fed into the node actor. Each request carries the channel its answer goes to.
enum Inbound {
    RequestVote(RequestVote, Reply<RequestVoteResponse>),
    AppendEntries(AppendEntries, Reply<AppendEntriesResponse>),
    InstallSnapshot(InstallSnapshot, Reply<InstallSnapshotResponse>),
    Propose(Vec<u8>, Reply<Vec<u8>>),
    Shutdown,
}

/// Cloneable front door to a running node.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<Inbound>,
    status: watch::Receiver<NodeStatus>,
}

impl RaftHandle {
    pub async fn request_vote(&self, req: RequestVote) -> Result<RequestVoteResponse> {
        self.call(|reply| Inbound::RequestVote(req, reply)).await
    }

    pub async fn append_entries(&self, req: AppendEntries) -> Result<AppendEntriesResponse> {
        self.call(|reply| Inbound::AppendEntries(req, reply)).await
    }

    pub async fn install_snapshot(&self, req: InstallSnapshot) -> Result<InstallSnapshotResponse> {
        self.call(|reply| Inbound::InstallSnapshot(req, reply)).await
    }

    /// Replicate `command` and wait until it is applied. Resolves with the state machine's
    /// output, or `NotLeader` if this node cannot (or can no longer) commit it.
    pub async fn propose(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.call(|reply| Inbound::Propose(command, reply)).await
    }

    /// Latest published status.
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Whether the actor is still accepting work.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Ask the actor to stop. In-flight RPCs are abandoned and pending proposals fail.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Inbound::Shutdown).await;
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Inbound) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }
}

/// Start a node actor on the current tokio runtime.
///
/// The join handle resolves when the actor stops: `Ok` after `shutdown`, or the error that
/// halted it (a persistence failure, typically).
pub fn spawn<S: StateMachine + 'static>(
    options: ValidatedOptions,
    stores: Stores,
    state_machine: S,
    transport: Arc<dyn Transport>,
) -> Result<(RaftHandle, JoinHandle<Result<()>>)> {
    let rpc_timeout = options.rpc_timeout();
    let heartbeat = options.heartbeat_interval();
    let inflight = options
        .peers()
        .into_iter()
        .map(|peer| (peer, Arc::new(Semaphore::new(options.max_inflight_per_peer))))
        .collect();

    let node = Node::new(options, stores)?;
    let runtime = Runtime::new(node, state_machine)?;
    let flush_interval = runtime.flush_interval().unwrap_or(heartbeat);

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let (status_tx, status_rx) = watch::channel(runtime.node().status());
    info!(node = %runtime.node().id, "raft node started");

    let actor = Actor {
        runtime,
        transport,
        inbound: rx,
        outbound: JoinSet::new(),
        inflight,
        pending: BTreeMap::new(),
        status: status_tx,
        rpc_timeout,
        flush_interval,
    };
    let task = tokio::spawn(actor.run());

    Ok((
        RaftHandle {
            tx,
            status: status_rx,
        },
        task,
    ))
}

/// Single owner of the runtime. Inbound RPCs, timer firings and outbound responses are
/// folded into it one at a time.
struct Actor<S> {
    runtime: Runtime<S>,
    transport: Arc<dyn Transport>,
    inbound: mpsc::Receiver<Inbound>,
    outbound: JoinSet<Option<(NodeId, Message)>>,
    inflight: HashMap<NodeId, Arc<Semaphore>>,
    pending: BTreeMap<LogIndex, (Term, Reply<Vec<u8>>)>,
    status: watch::Sender<NodeStatus>,
    rpc_timeout: Duration,
    flush_interval: Duration,
}

impl<S: StateMachine + 'static> Actor<S> {
    async fn run(mut self) -> Result<()> {
        let result = self.run_loop().await;

        self.outbound.abort_all();
        let halted = result.is_err();
        self.fail_pending(|| if halted { Error::Halted } else { Error::Shutdown });
        self.publish_status();
        info!(node = %self.runtime.node().id, "raft node stopped");
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut flush = tokio::time::interval(self.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = tokio::time::Instant::from_std(self.runtime.next_deadline());

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    // Drain fired timers; back-to-back timeouts must not be skipped.
                    while let Some(event) = self.runtime.poll_timers() {
                        self.step(event)?;
                    }
                }
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Shutdown) | None => return Ok(()),
                    Some(request) => self.on_inbound(request)?,
                },
                Some(joined) = self.outbound.join_next(), if !self.outbound.is_empty() => {
                    if let Ok(Some((from, message))) = joined {
                        self.step(Event::Message { from, message })?;
                    }
                }
                _ = flush.tick() => self.runtime.flush()?,
            }

            self.publish_status();
        }
    }

    fn step(&mut self, event: Event) -> Result<()> {
        let commands = self.runtime.handle(event)?;
        self.dispatch(commands);
        self.resolve_outputs();
        Ok(())
    }

    fn on_inbound(&mut self, request: Inbound) -> Result<()> {
        match request {
            Inbound::RequestVote(req, reply) => {
                let from = req.candidate_id.clone();
                let result = self.answer(from, Message::RequestVote(req));
                respond(reply, result)
            }
            Inbound::AppendEntries(req, reply) => {
                let from = req.leader_id.clone();
                let result = self.answer(from, Message::AppendEntries(req));
                respond(reply, result)
            }
            Inbound::InstallSnapshot(req, reply) => {
                let from = req.leader_id.clone();
                let result = self.answer(from, Message::InstallSnapshot(req));
                respond(reply, result)
            }
            Inbound::Propose(command, reply) => self.propose(command, reply),
            Inbound::Shutdown => Ok(()),
        }
    }

    /// Run an inbound request through the runtime and pull out the reply the node queued
    /// for its sender.
    fn answer(&mut self, from: NodeId, request: Message) -> Result<Message> {
        let commands = self.runtime.handle(Event::Message {
            from: from.clone(),
            message: request,
        })?;

        let mut reply = None;
        let mut outbound = Vec::with_capacity(commands.len());
        for command in commands {
            match command {
                Command::Send { to, message }
                    if reply.is_none() && to == from && message.is_response() =>
                {
                    reply = Some(message);
                }
                other => outbound.push(other),
            }
        }
        self.dispatch(outbound);
        self.resolve_outputs();

        reply.ok_or_else(|| TransportError::Protocol("request produced no reply".into()).into())
    }

    fn propose(&mut self, command: Vec<u8>, reply: Reply<Vec<u8>>) -> Result<()> {
        match self.runtime.submit(command) {
            Ok(Some(index)) => {
                let term = self.runtime.node().current_term();
                debug!(node = %self.runtime.node().id, index = %index, "proposal appended");
                self.pending.insert(index, (term, reply));
                Ok(())
            }
            Ok(None) => {
                let _ = reply.send(Err(self.not_leader()));
                Ok(())
            }
            Err(e) => {
                let _ = reply.send(Err(Error::Halted));
                Err(e)
            }
        }
    }

    fn not_leader(&self) -> Error {
        Error::NotLeader {
            leader: self.runtime.node().leader_id().cloned(),
        }
    }

    /// Hand applied outputs to their proposers. Proposals whose index was applied with a
    /// different term, or skipped over by a snapshot, were overwritten and fail.
    fn resolve_outputs(&mut self) {
        for applied in self.runtime.take_outputs() {
            if let Some((term, reply)) = self.pending.remove(&applied.index) {
                let result = if term == applied.term {
                    Ok(applied.output)
                } else {
                    Err(self.not_leader())
                };
                let _ = reply.send(result);
            }
        }

        let last_applied = self.runtime.node().volatile.last_applied;
        let waiting = self.pending.split_off(&last_applied.next());
        for (_, (_, reply)) in std::mem::replace(&mut self.pending, waiting) {
            let _ = reply.send(Err(self.not_leader()));
        }
    }

    fn fail_pending(&mut self, error: impl Fn() -> Error) {
        for (_, (_, reply)) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(error()));
        }
    }

    /// Start an outbound task per `Send`, bounded per peer. Requests over the bound are
    /// dropped; the next heartbeat or election round retries them.
    fn dispatch(&mut self, commands: Vec<Command>) {
        for command in commands {
            let Command::Send { to, message } = command else {
                continue;
            };
            let Some(semaphore) = self.inflight.get(&to) else {
                warn!(peer = %to, "no route to peer");
                continue;
            };
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                debug!(peer = %to, kind = message.kind(), "too many requests in flight, dropping");
                continue;
            };

            let transport = Arc::clone(&self.transport);
            let timeout = self.rpc_timeout;
            self.outbound.spawn(async move {
                let _permit = permit;
                let kind = message.kind();
                match tokio::time::timeout(timeout, transport.send(&to, message)).await {
                    Ok(Ok(response)) => Some((to, response)),
                    Ok(Err(e)) => {
                        warn!(peer = %to, kind, error = %e, "rpc failed");
                        None
                    }
                    Err(_) => {
                        warn!(peer = %to, kind, error = %TransportError::Timeout(to.clone()), "rpc failed");
                        None
                    }
                }
            });
        }
    }

    fn publish_status(&self) {
        let current = self.runtime.node().status();
        self.status.send_if_modified(|status| {
            if *status == current {
                return false;
            }
            *status = current;
            true
        });
    }
}

/// Send the typed reply to the caller. A runtime failure also stops the actor.
fn respond<T>(reply: Reply<T>, result: Result<Message>) -> Result<()>
where
    T: TryFrom<Message, Error = Message>,
{
    match result {
        Ok(message) => {
            let typed = T::try_from(message).map_err(|other| {
                Error::from(TransportError::Protocol(format!(
                    "unexpected reply {}",
                    other.kind()
                )))
            });
            let _ = reply.send(typed);
            Ok(())
        }
        Err(e) => {
            let _ = reply.send(Err(Error::Halted));
            Err(e)
        }
    }
}
