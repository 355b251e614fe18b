use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::backoff;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::node::{Node, Role};
use crate::types::{LogIndex, Message, NodeId, Term};

/// The replicated application. Only committed entries reach `apply`, in log order, once each.
pub trait StateMachine: Send {
    /// Apply a committed command. The output is handed back to whoever proposed it.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8>;

    /// Serialize the state reached by everything applied so far.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace all state with a snapshot produced by `snapshot`.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// Events that drive the runtime.
#[derive(Debug, Clone)]
pub enum Event {
    ElectionTimeout,
    HeartbeatTimeout,
    Message { from: NodeId, message: Message },
}

/// Output of one applied command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    pub output: Vec<u8>,
}

/// Runtime that wraps a Raft node with timer management and the state machine.
///
/// The first error out of `handle` or `submit` halts the runtime: the node's in-memory
/// state can no longer be trusted to match what is on disk, so every later call returns
/// `Error::Halted`.
pub struct Runtime<S> {
    node: Node,
    state_machine: S,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    outputs: Vec<Applied>,
    halted: bool,
}

impl<S: StateMachine> Runtime<S> {
    /// Wrap `node`, loading its stored snapshot (if any) into `state_machine`.
    pub fn new(node: Node, mut state_machine: S) -> Result<Self> {
        if let Some(snapshot) = node.load_snapshot()? {
            state_machine.restore(&snapshot.data)?;
            info!(node = %node.id, last_included = %snapshot.last_included_index, "state machine restored from snapshot");
        }

        let now = Instant::now();
        let (min, max) = node.options().election_timeout_range();
        Ok(Self {
            election_deadline: now + backoff::election_timeout(min, max),
            heartbeat_deadline: now + node.options().heartbeat_interval(),
            node,
            state_machine,
            outputs: Vec::new(),
            halted: false,
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Process an event and return the commands the caller must carry out.
    ///
    /// Only `Send` needs action from the caller; timers and snapshot restores are handled
    /// here before returning.
    pub fn handle(&mut self, event: Event) -> Result<Vec<Command>> {
        if self.halted {
            return Err(Error::Halted);
        }
        let result = self.step(event);
        self.halt_on_error(result)
    }

    fn step(&mut self, event: Event) -> Result<Vec<Command>> {
        match event {
            Event::ElectionTimeout => self.node.election_timeout()?,
            Event::HeartbeatTimeout => self.node.heartbeat_timeout()?,
            Event::Message { from, message } => self.node.handle_message(from, message)?,
        }

        let commands = self.node.drain_commands();
        self.process_commands(&commands)?;
        self.apply_committed()?;
        Ok(commands)
    }

    fn halt_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!(node = %self.node.id, error = %e, "halting node");
            self.halted = true;
            self.node.drain_commands();
        }
        result
    }

    /// §5.2: if election timeout elapses without receiving AppendEntries or granting a vote,
    /// the server starts an election. Leaders suppress elections by sending heartbeats
    /// within each interval.
    pub fn poll_timers(&self) -> Option<Event> {
        let now = Instant::now();

        if self.is_leader() {
            return (now >= self.heartbeat_deadline).then_some(Event::HeartbeatTimeout);
        }

        (now >= self.election_deadline).then_some(Event::ElectionTimeout)
    }

    /// When the next timer fires.
    pub fn next_deadline(&self) -> Instant {
        if self.is_leader() {
            self.heartbeat_deadline
        } else {
            self.election_deadline
        }
    }

    fn is_leader(&self) -> bool {
        matches!(self.node.role, Role::Leader(_))
    }

    /// Submit a client command. Returns log index if leader, None otherwise.
    pub fn submit(&mut self, command: Vec<u8>) -> Result<Option<LogIndex>> {
        if self.halted {
            return Err(Error::Halted);
        }
        let result = self.node.submit_command(command);
        self.halt_on_error(result)
    }

    /// Sync log appends the fsync policy has batched.
    pub fn flush(&mut self) -> Result<()> {
        if self.halted {
            return Err(Error::Halted);
        }
        let result = self.node.flush_log();
        self.halt_on_error(result)
    }

    /// How often `flush` has to run for the log store's fsync policy.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.node.log_flush_interval()
    }

    /// Outputs of the commands applied since the last call, in log order.
    pub fn take_outputs(&mut self) -> Vec<Applied> {
        std::mem::take(&mut self.outputs)
    }

    fn process_commands(&mut self, commands: &[Command]) -> Result<()> {
        for command in commands {
            match command {
                Command::ResetElectionTimer => {
                    let (min, max) = self.node.options().election_timeout_range();
                    self.election_deadline = Instant::now() + backoff::election_timeout(min, max);
                }
                Command::ResetHeartbeatTimer => {
                    self.heartbeat_deadline =
                        Instant::now() + self.node.options().heartbeat_interval();
                }
                Command::RestoreSnapshot(snapshot) => {
                    self.state_machine.restore(&snapshot.data)?;
                    info!(node = %self.node.id, last_included = %snapshot.last_included_index, "state machine restored from leader snapshot");
                }
                Command::Send { .. } => {
                    // Sending is handled by caller.
                }
            }
        }
        Ok(())
    }

    // Figure 2, Rules for Servers (All Servers): if commitIndex > lastApplied, apply the
    // next entry to the state machine. §5.3: state machines process entries in log order.
    fn apply_committed(&mut self) -> Result<()> {
        while let Some(entry) = self.node.take_entry_to_apply() {
            let Some(command) = &entry.command else {
                continue;
            };
            let output = self.state_machine.apply(entry.index, command);
            self.outputs.push(Applied {
                index: entry.index,
                term: entry.term,
                output,
            });
        }

        if self.node.should_snapshot() {
            let data = self.state_machine.snapshot()?;
            self.node.compact(data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::kv::{KvCommand, KvResult, KvStore};
    use crate::options::RaftOptions;
    use crate::storage::{
        MemoryLogStore, MemorySnapshotStore, MemoryStateStore, SnapshotStore, StateStore,
        StorageError, Stores,
    };
    use crate::types::{
        AppendEntriesResponse, InstallSnapshot, RequestVoteResponse, Snapshot,
    };

    fn options(id: &str) -> RaftOptions {
        let mut o = RaftOptions::new(id, ["n1", "n2", "n3"].map(NodeId::from));
        o.enable_pre_vote = false;
        o
    }

    fn runtime_with(options: RaftOptions, stores: Stores) -> Runtime<KvStore> {
        let node = Node::new(options.validate().unwrap(), stores).unwrap();
        Runtime::new(node, KvStore::new()).unwrap()
    }

    fn runtime(id: &str) -> Runtime<KvStore> {
        runtime_with(options(id), Stores::memory())
    }

    fn set(key: &str, value: &str) -> Vec<u8> {
        KvCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
        .encode()
    }

    fn make_leader(rt: &mut Runtime<KvStore>) {
        rt.handle(Event::ElectionTimeout).unwrap();
        let term = rt.node().current_term();
        rt.handle(Event::Message {
            from: NodeId::from("n2"),
            message: Message::RequestVoteResponse(RequestVoteResponse {
                term,
                vote_granted: true,
                is_pre_vote: false,
            }),
        })
        .unwrap();
        assert!(rt.node().is_leader());
    }

    fn ack(rt: &mut Runtime<KvStore>, from: &str, match_index: u64) {
        let term = rt.node().current_term();
        rt.handle(Event::Message {
            from: NodeId::from(from),
            message: Message::AppendEntriesResponse(AppendEntriesResponse {
                term,
                success: true,
                match_index: LogIndex::from(match_index),
                conflict_index: None,
                conflict_term: None,
            }),
        })
        .unwrap();
    }

    #[test]
    fn election_timeout_starts_election() {
        let mut rt = runtime("n1");

        let commands = rt.handle(Event::ElectionTimeout).unwrap();

        assert!(matches!(rt.node().role, Role::Candidate(_)));
        assert!(commands.iter().any(|c| matches!(c, Command::Send { .. })));
    }

    #[test]
    fn leader_applies_committed_entries() {
        let mut rt = runtime("n1");
        make_leader(&mut rt);

        // The no-op sits at index 1.
        let index = rt.submit(set("foo", "bar")).unwrap();
        assert_eq!(index, Some(LogIndex::from(2)));

        ack(&mut rt, "n2", 2);

        let outputs = rt.take_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].index, LogIndex::from(2));
        assert_eq!(KvResult::decode(&outputs[0].output).unwrap(), KvResult::Ok);
        assert_eq!(rt.state_machine().get("foo"), Some("bar"));
        assert_eq!(rt.node().volatile.last_applied, LogIndex::from(2));
    }

    #[test]
    fn follower_does_not_accept_submissions() {
        let mut rt = runtime("n2");
        assert_eq!(rt.submit(set("a", "1")).unwrap(), None);
    }

    #[test]
    fn timer_reset_on_election_timeout() {
        let mut rt = runtime("n1");
        let initial_deadline = rt.election_deadline;

        std::thread::sleep(Duration::from_millis(10));
        rt.handle(Event::ElectionTimeout).unwrap();

        assert!(rt.election_deadline > initial_deadline);
    }

    #[test]
    fn leader_polls_heartbeat_not_election() {
        let mut rt = runtime("n1");
        make_leader(&mut rt);
        assert_eq!(rt.next_deadline(), rt.heartbeat_deadline);

        rt.heartbeat_deadline = Instant::now() - Duration::from_millis(1);
        assert!(matches!(rt.poll_timers(), Some(Event::HeartbeatTimeout)));
    }

    #[test]
    fn snapshot_taken_at_threshold() {
        let mut o = options("n1");
        o.max_entries_per_append = 100;
        o.snapshot_threshold = 1000;
        let log = MemoryLogStore::new();
        let snapshots = MemorySnapshotStore::new();
        let stores = Stores::new(MemoryStateStore::new(), log.clone(), snapshots.clone());
        let mut rt = runtime_with(o, stores);
        make_leader(&mut rt);

        for i in 0..999 {
            rt.submit(set(&format!("k{i}"), "v")).unwrap();
        }
        ack(&mut rt, "n2", 1000);

        assert_eq!(rt.node().volatile.last_applied, LogIndex::from(1000));
        let snapshot = snapshots.snapshot().unwrap();
        assert_eq!(snapshot.last_included_index, LogIndex::from(1000));
        assert_eq!(rt.node().log.first_index(), LogIndex::from(1001));
        assert!(log.entries().is_empty());

        let mut restored = KvStore::new();
        restored.restore(&snapshot.data).unwrap();
        assert_eq!(restored.len(), 999);
    }

    #[test]
    fn installed_snapshot_reaches_state_machine() {
        let mut source = KvStore::new();
        source.apply(LogIndex::from(1), &set("x", "42"));
        let data = source.snapshot().unwrap();

        let mut rt = runtime("n2");
        rt.handle(Event::Message {
            from: NodeId::from("n1"),
            message: Message::InstallSnapshot(InstallSnapshot {
                term: Term::from(1),
                leader_id: NodeId::from("n1"),
                last_included_index: LogIndex::from(100),
                last_included_term: Term::from(1),
                data,
            }),
        })
        .unwrap();

        assert_eq!(rt.state_machine().get("x"), Some("42"));
        assert_eq!(rt.node().volatile.last_applied, LogIndex::from(100));
    }

    #[test]
    fn stored_snapshot_is_loaded_on_start() {
        let mut source = KvStore::new();
        source.apply(LogIndex::from(1), &set("k", "v"));
        let mut snapshots = MemorySnapshotStore::new();
        snapshots
            .save(&Snapshot {
                last_included_index: LogIndex::from(7),
                last_included_term: Term::from(2),
                data: source.snapshot().unwrap(),
            })
            .unwrap();

        let rt = runtime_with(
            options("n1"),
            Stores::new(MemoryStateStore::new(), MemoryLogStore::new(), snapshots),
        );

        assert_eq!(rt.state_machine().get("k"), Some("v"));
        assert_eq!(rt.node().volatile.last_applied, LogIndex::from(7));
    }

    struct BrokenDisk;

    impl StateStore for BrokenDisk {
        fn load(&self) -> std::result::Result<crate::storage::HardState, StorageError> {
            Ok(Default::default())
        }

        fn save(&mut self, _: Term, _: Option<&NodeId>) -> std::result::Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("no space left on device")))
        }
    }

    #[test]
    fn persistence_failure_halts() {
        let mut rt = runtime_with(
            options("n1"),
            Stores::new(BrokenDisk, MemoryLogStore::new(), MemorySnapshotStore::new()),
        );

        assert!(matches!(
            rt.handle(Event::ElectionTimeout),
            Err(Error::Storage(_))
        ));
        assert!(rt.is_halted());
        assert!(matches!(rt.handle(Event::HeartbeatTimeout), Err(Error::Halted)));
        assert!(matches!(rt.submit(vec![1]), Err(Error::Halted)));
    }
}
