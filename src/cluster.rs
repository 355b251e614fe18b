use std::collections::{HashSet, VecDeque};

use tracing::warn;

use crate::command::Command;
use crate::error::Result;
use crate::node::{Node, Role};
use crate::options::RaftOptions;
use crate::runtime::{Event, Runtime, StateMachine};
use crate::storage::Stores;
use crate::types::{LogIndex, Message, NodeId};

/// A message in flight between nodes.
struct InFlight {
    from: NodeId,
    to: NodeId,
    message: Message,
}

/// Simulated cluster for testing.
///
/// Nodes are named `n1..=nN` and addressed by 0-based position. Messages queue until
/// `deliver_all`; anything to or from an isolated node is dropped. Timers never fire on
/// their own.
pub struct Cluster<S> {
    runtimes: Vec<Runtime<S>>,
    messages: VecDeque<InFlight>,
    isolated: HashSet<NodeId>,
}

impl<S: StateMachine + Default> Cluster<S> {
    /// Create a cluster with the given number of nodes and default options.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_options(size, |_| {})
    }

    /// Create a cluster, letting `configure` adjust each node's options before validation.
    pub fn with_options(size: usize, configure: impl Fn(&mut RaftOptions)) -> Result<Self> {
        let ids: Vec<NodeId> = (1..=size).map(|i| NodeId::new(format!("n{i}"))).collect();

        let runtimes = ids
            .iter()
            .map(|id| {
                let mut options = RaftOptions::new(id.clone(), ids.iter().cloned());
                configure(&mut options);
                let node = Node::new(options.validate()?, Stores::memory())?;
                Runtime::new(node, S::default())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            runtimes,
            messages: VecDeque::new(),
            isolated: HashSet::new(),
        })
    }

    /// Get a reference to a node's runtime by index (0-based).
    pub fn runtime(&self, index: usize) -> &Runtime<S> {
        &self.runtimes[index]
    }

    /// Get a mutable reference to a node's runtime by index (0-based).
    pub fn runtime_mut(&mut self, index: usize) -> &mut Runtime<S> {
        &mut self.runtimes[index]
    }

    pub fn size(&self) -> usize {
        self.runtimes.len()
    }

    pub fn id(&self, index: usize) -> &NodeId {
        &self.runtimes[index].node().id
    }

    /// Cut a node off from every other node until `heal`.
    pub fn isolate(&mut self, index: usize) {
        let id = self.id(index).clone();
        self.isolated.insert(id);
    }

    pub fn heal(&mut self, index: usize) {
        let id = self.id(index).clone();
        self.isolated.remove(&id);
    }

    /// Trigger election timeout on a specific node.
    pub fn election_timeout(&mut self, index: usize) {
        self.handle(index, Event::ElectionTimeout);
    }

    /// Trigger heartbeat timeout on a specific node.
    pub fn heartbeat_timeout(&mut self, index: usize) {
        self.handle(index, Event::HeartbeatTimeout);
    }

    /// Submit a command to a node. `None` unless it is the leader.
    pub fn submit(&mut self, index: usize, command: Vec<u8>) -> Option<LogIndex> {
        match self.runtimes[index].submit(command) {
            Ok(result) => result,
            Err(e) => {
                warn!(node = %self.id(index), error = %e, "submit failed");
                None
            }
        }
    }

    /// Deliver all pending messages, including the ones sent in response.
    pub fn deliver_all(&mut self) {
        while let Some(msg) = self.messages.pop_front() {
            self.deliver(msg);
        }
    }

    /// Drop every queued message.
    pub fn drop_all(&mut self) {
        self.messages.clear();
    }

    fn deliver(&mut self, inflight: InFlight) {
        if self.isolated.contains(&inflight.to) || self.isolated.contains(&inflight.from) {
            return;
        }
        if let Some(index) = self.node_index(&inflight.to) {
            self.handle(
                index,
                Event::Message {
                    from: inflight.from,
                    message: inflight.message,
                },
            );
        }
    }

    /// A halted node keeps its place in the cluster but stops participating.
    fn handle(&mut self, index: usize, event: Event) {
        match self.runtimes[index].handle(event) {
            Ok(commands) => self.queue_commands(index, commands),
            Err(e) => warn!(node = %self.id(index), error = %e, "event failed"),
        }
    }

    /// Queue outgoing commands from a node.
    fn queue_commands(&mut self, from_index: usize, commands: Vec<Command>) {
        let from = self.id(from_index).clone();
        for command in commands {
            if let Command::Send { to, message } = command {
                self.messages.push_back(InFlight {
                    from: from.clone(),
                    to,
                    message,
                });
            }
        }
    }

    fn node_index(&self, id: &NodeId) -> Option<usize> {
        self.runtimes.iter().position(|rt| rt.node().id == *id)
    }

    /// Find the current leader, if any. With several (a deposed leader that has not heard
    /// of the new term yet), the one with the highest term.
    pub fn leader(&self) -> Option<usize> {
        self.runtimes
            .iter()
            .enumerate()
            .filter(|(_, rt)| rt.node().is_leader())
            .max_by_key(|(_, rt)| rt.node().current_term())
            .map(|(i, _)| i)
    }

    /// Count nodes in each role.
    pub fn role_counts(&self) -> (usize, usize, usize) {
        let mut followers = 0;
        let mut candidates = 0;
        let mut leaders = 0;

        for rt in &self.runtimes {
            match rt.node().role {
                Role::Follower(_) => followers += 1,
                Role::Candidate(_) => candidates += 1,
                Role::Leader(_) => leaders += 1,
            }
        }

        (followers, candidates, leaders)
    }
}
