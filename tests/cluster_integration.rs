use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use raft::file_storage::{open_stores, FsyncPolicy};
use raft::kv::{KvCommand, KvResult, KvStore};
use raft::transport::LocalNetwork;
use raft::{server, NodeId, RaftHandle, RaftOptions, RoleKind, Stores, Term};

const IDS: [&str; 3] = ["n1", "n2", "n3"];

fn options(id: &str) -> RaftOptions {
    let mut o = RaftOptions::new(id, IDS.map(NodeId::from));
    o.election_timeout_min_ms = 100;
    o.election_timeout_max_ms = 200;
    o.heartbeat_interval_ms = 20;
    o.rpc_timeout_ms = 100;
    o
}

struct TestCluster {
    network: LocalNetwork,
    handles: Vec<RaftHandle>,
    tasks: Vec<JoinHandle<raft::Result<()>>>,
}

impl TestCluster {
    fn start(mut stores: impl FnMut(&str) -> Stores) -> Self {
        let network = LocalNetwork::new();
        let (handles, tasks) = IDS
            .iter()
            .map(|&id| {
                let (handle, task) = server::spawn(
                    options(id).validate().unwrap(),
                    stores(id),
                    KvStore::new(),
                    Arc::new(network.transport(NodeId::from(id))),
                )
                .unwrap();
                network.register(NodeId::from(id), handle.clone());
                (handle, task)
            })
            .unzip();
        Self {
            network,
            handles,
            tasks,
        }
    }

    fn in_memory() -> Self {
        Self::start(|_| Stores::memory())
    }

    /// Wait for a leader among the reachable nodes with a term above `after`.
    async fn leader(&self, after: Term, skip: Option<&NodeId>) -> RaftHandle {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let found = self.handles.iter().find(|h| {
                    let s = h.status();
                    s.role == RoleKind::Leader && s.term > after && Some(&s.id) != skip
                });
                if let Some(h) = found {
                    return h.clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no leader elected")
    }

    async fn shutdown(self) {
        for h in &self.handles {
            h.shutdown().await;
        }
        for task in self.tasks {
            task.await.unwrap().unwrap();
        }
    }
}

async fn set(handle: &RaftHandle, key: &str, value: &str) -> KvResult {
    let command = KvCommand::Set {
        key: key.into(),
        value: value.into(),
    };
    KvResult::decode(&handle.propose(command.encode()).await.unwrap()).unwrap()
}

async fn get(handle: &RaftHandle, key: &str) -> KvResult {
    let command = KvCommand::Get { key: key.into() };
    KvResult::decode(&handle.propose(command.encode()).await.unwrap()).unwrap()
}

#[tokio::test]
async fn elects_a_leader_and_replicates_writes() {
    let cluster = TestCluster::in_memory();
    let leader = cluster.leader(Term::ZERO, None).await;

    assert_eq!(set(&leader, "color", "blue").await, KvResult::Ok);
    assert_eq!(
        get(&leader, "color").await,
        KvResult::Value(Some("blue".into()))
    );

    let target = leader.status().commit_index;
    for h in &cluster.handles {
        h.subscribe()
            .wait_for(|s| s.last_applied >= target)
            .await
            .unwrap();
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn followers_point_proposals_at_the_leader() {
    let cluster = TestCluster::in_memory();
    let leader = cluster.leader(Term::ZERO, None).await;
    let leader_id = leader.status().id;

    let follower = cluster
        .handles
        .iter()
        .find(|h| h.status().id != leader_id)
        .unwrap();
    follower
        .subscribe()
        .wait_for(|s| s.leader_id.as_ref() == Some(&leader_id))
        .await
        .unwrap();

    match follower.propose(KvCommand::Get { key: "x".into() }.encode()).await {
        Err(raft::Error::NotLeader { leader }) => assert_eq!(leader, Some(leader_id)),
        other => panic!("expected NotLeader, got {other:?}"),
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn isolated_leader_is_replaced() {
    let cluster = TestCluster::in_memory();
    let old = cluster.leader(Term::ZERO, None).await;
    let old_status = old.status();
    assert_eq!(set(&old, "k", "1").await, KvResult::Ok);

    cluster.network.isolate(&old_status.id);
    let new = cluster.leader(old_status.term, Some(&old_status.id)).await;
    assert_eq!(get(&new, "k").await, KvResult::Value(Some("1".into())));
    assert_eq!(set(&new, "k", "2").await, KvResult::Ok);

    cluster.network.heal(&old_status.id);
    let new_term = new.status().term;
    old.subscribe()
        .wait_for(|s| s.role == RoleKind::Follower && s.term >= new_term)
        .await
        .unwrap();

    cluster.shutdown().await;
}

fn file_stores(root: &Path, id: &str) -> Stores {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    open_stores(&dir, FsyncPolicy::Batch { interval_ms: 5 }).unwrap()
}

#[tokio::test]
async fn writes_survive_a_full_restart() {
    let dir = tempfile::tempdir().unwrap();

    let cluster = TestCluster::start(|id| file_stores(dir.path(), id));
    let leader = cluster.leader(Term::ZERO, None).await;
    let first_term = leader.status().term;
    assert_eq!(set(&leader, "durable", "yes").await, KvResult::Ok);
    cluster.shutdown().await;

    let cluster = TestCluster::start(|id| file_stores(dir.path(), id));
    let leader = cluster.leader(first_term, None).await;
    assert_eq!(
        get(&leader, "durable").await,
        KvResult::Value(Some("yes".into()))
    );
    cluster.shutdown().await;
}
