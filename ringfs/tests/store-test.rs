use ringfs::core::{NetTransport, Role, Socket};
use ringfs::store::{Accept, Decline, DeleteOutcome, Prompter, PutOutcome, StoreError};
use ringfs::testkit::{fast_config, init_logging, LogLevel, NeverAnswer};
use ringfs::{Node, NodeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

const SETTLE: Duration = Duration::from_secs(15);

async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
  let deadline = Instant::now() + SETTLE;
  while !check() {
    if Instant::now() > deadline {
      panic!("timed out waiting for {}", what);
    }
    sleep(Duration::from_millis(25)).await;
  }
}

struct TestCluster {
  base: u16,
  nodes: Vec<Node>,
  dirs: Vec<TempDir>,
}
impl TestCluster {
  /// Starts one node per prompter. The first is the introducer and coordinator.
  async fn start(base: u16, prompters: Vec<Arc<dyn Prompter>>) -> TestCluster {
    init_logging(LogLevel::Warn);
    let mut cluster = TestCluster {
      base: base,
      nodes: Vec::new(),
      dirs: Vec::new(),
    };
    for prompter in prompters {
      cluster.spawn(prompter).await;
    }
    cluster.converge().await;
    cluster
  }

  async fn spawn(&mut self, prompter: Arc<dyn Prompter>) -> Node {
    let index = self.dirs.len() as u16;
    let role = if index == 0 {
      Role::Introducer
    } else {
      Role::Member {
        introducer: Socket::localhost(self.base),
      }
    };
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(self.base + index * 10, role, dir.path());
    let node = Node::start_with(config, Arc::new(NetTransport), prompter)
      .await
      .unwrap();
    self.nodes.push(node.clone());
    self.dirs.push(dir);
    node
  }

  async fn converge(&self) {
    let ids: BTreeSet<NodeId> = self.nodes.iter().map(|n| n.id()).collect();
    let nodes = self.nodes.clone();
    eventually("membership convergence", || {
      nodes.iter().all(|n| n.online_node_ids() == ids)
    })
    .await;
  }

  fn declining(size: usize) -> Vec<Arc<dyn Prompter>> {
    (0..size).map(|_| Arc::new(Decline) as Arc<dyn Prompter>).collect()
  }

  fn coordinator(&self) -> &Node {
    self.nodes.iter().find(|n| n.is_coordinator()).unwrap()
  }

  fn node(&self, id: NodeId) -> &Node {
    self.nodes.iter().find(|n| n.id() == id).unwrap()
  }

  fn write_scratch(&self, index: usize, file: &str, contents: &str) {
    let path = self.nodes[index].config.scratch_dir.join(file);
    std::fs::write(path, contents).unwrap();
  }

  fn stored_on(&self, id: NodeId, name: &str) -> bool {
    self.node(id).config.store_dir.join(name).is_file()
  }

  /// Waits until the coordinator has `count` holders for `name` and every one of them has the
  /// file. Returns the holders.
  async fn replicated(&self, name: &str, count: usize) -> Vec<NodeId> {
    let coordinator = self.coordinator().clone();
    eventually("placement", || {
      coordinator
        .replica_holders(name)
        .map_or(false, |h| h.len() == count)
    })
    .await;
    let holders = coordinator.replica_holders(name).unwrap();
    eventually("replicas on disk", || {
      holders.iter().all(|id| self.stored_on(*id, name))
    })
    .await;
    holders
  }
}

impl Drop for TestCluster {
  fn drop(&mut self) {
    for node in &self.nodes {
      node.shutdown();
    }
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_test_put_get_from_every_node() {
  let cluster = TestCluster::start(7500, TestCluster::declining(4)).await;
  cluster.write_scratch(1, "a.txt", "alpha contents");
  let outcome = cluster.nodes[1].put("a.txt", "alpha", false).await.unwrap();
  assert_eq!(outcome, PutOutcome::Forwarded);

  let holders = cluster.replicated("alpha", 4).await;
  assert!(holders.contains(&cluster.nodes[1].id()));

  for (i, node) in cluster.nodes.iter().enumerate() {
    let path = node.get("alpha", &format!("copy-{}", i)).await.unwrap();
    assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "alpha contents");
  }

  let missing = cluster.nodes[2].get("no-such-object", "x").await;
  assert!(matches!(missing, Err(StoreError::NotFound(_))));
  let invalid = cluster.nodes[2].put("a.txt", "../escape", false).await;
  assert!(invalid.is_err());
  let absent = cluster.nodes[2].put("not-there.txt", "beta", false).await;
  assert!(matches!(absent, Err(StoreError::MissingSource(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_test_delete() {
  let cluster = TestCluster::start(7600, TestCluster::declining(4)).await;
  cluster.write_scratch(0, "d.txt", "short lived");
  let outcome = cluster.nodes[0].put("d.txt", "doomed", false).await.unwrap();
  assert!(matches!(outcome, PutOutcome::Placed(ref h) if h.len() == 4));
  let holders = cluster.replicated("doomed", 4).await;

  let deleted = cluster.nodes[3].delete("doomed").await.unwrap();
  assert_eq!(deleted, DeleteOutcome::Forwarded);
  let nodes = cluster.nodes.clone();
  eventually("delete to reach every table", || {
    nodes.iter().all(|n| n.replica_holders("doomed").is_none())
  })
  .await;
  eventually("replicas removed", || {
    holders.iter().all(|id| !cluster.stored_on(*id, "doomed"))
  })
  .await;

  let again = cluster.coordinator().delete("doomed").await;
  assert!(matches!(again, Err(StoreError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_test_recent_overwrite_needs_confirmation() {
  let prompters: Vec<Arc<dyn Prompter>> = vec![
    Arc::new(Decline),
    Arc::new(NeverAnswer),
    Arc::new(Accept),
    Arc::new(Decline),
  ];
  let cluster = TestCluster::start(7700, prompters).await;
  cluster.write_scratch(1, "v1.txt", "first version");
  cluster.write_scratch(1, "v2.txt", "second version");
  cluster.nodes[1].put("v1.txt", "doc", false).await.unwrap();
  let holders = cluster.replicated("doc", 4).await;

  // The submitter never answers, so the coordinator's question times out as a no.
  cluster.nodes[1].put("v2.txt", "doc", false).await.unwrap();
  sleep(Duration::from_secs(1)).await;
  assert_eq!(cluster.coordinator().replica_holders("doc"), Some(holders));
  let path = cluster.nodes[3].get("doc", "check-1").await.unwrap();
  assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "first version");

  // The coordinator asks itself and declines.
  cluster.write_scratch(0, "v3.txt", "third version");
  let outcome = cluster.nodes[0].put("v3.txt", "doc", false).await.unwrap();
  assert_eq!(outcome, PutOutcome::Declined);

  // An explicit overwrite goes through.
  cluster.nodes[1].put("v2.txt", "doc", true).await.unwrap();
  read_until(&cluster.nodes[3], "doc", "second version").await;

  // A submitter that agrees to the question overwrites too.
  cluster.write_scratch(2, "v4.txt", "fourth version");
  let outcome = cluster.nodes[2].put("v4.txt", "doc", false).await.unwrap();
  assert_eq!(outcome, PutOutcome::Forwarded);
  read_until(&cluster.nodes[3], "doc", "fourth version").await;
}

/// Reads `name` through `node` until it has the expected contents.
async fn read_until(node: &Node, name: &str, expected: &str) {
  let deadline = Instant::now() + SETTLE;
  loop {
    let path = node.get(name, "check-2").await.unwrap();
    if tokio::fs::read_to_string(path).await.unwrap() == expected {
      return;
    }
    assert!(Instant::now() < deadline, "{:?} never became {:?}", name, expected);
    sleep(Duration::from_millis(100)).await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_test_failed_holder_is_replaced() {
  let mut cluster = TestCluster::start(7800, TestCluster::declining(6)).await;
  cluster.write_scratch(0, "r.txt", "resilient");
  cluster.nodes[0].put("r.txt", "kept", false).await.unwrap();
  let holders = cluster.replicated("kept", 4).await;

  let victim = *holders.iter().find(|id| **id != 0).unwrap();
  let index = cluster.nodes.iter().position(|n| n.id() == victim).unwrap();
  cluster.nodes.remove(index).shutdown();

  let coordinator = cluster.coordinator().clone();
  eventually("re-replication", || {
    coordinator
      .replica_holders("kept")
      .map_or(false, |h| h.len() == 4 && !h.contains(&victim))
  })
  .await;
  let repaired = cluster.replicated("kept", 4).await;
  assert!(!repaired.contains(&victim));

  let last = cluster.nodes.len() - 1;
  let path = cluster.nodes[last].get("kept", "after-repair").await.unwrap();
  assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "resilient");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_test_joiners_are_backfilled() {
  let mut cluster = TestCluster::start(7950, TestCluster::declining(2)).await;
  cluster.write_scratch(1, "b.txt", "backfilled");
  cluster.nodes[1].put("b.txt", "early", false).await.unwrap();
  let mut holders = cluster.replicated("early", 2).await;
  holders.sort_unstable();
  assert_eq!(holders, vec![0, 1]);

  // Every joiner takes an empty slot until all four are filled.
  for expected in [3, 4] {
    cluster.spawn(Arc::new(Decline)).await;
    cluster.converge().await;
    cluster.replicated("early", expected).await;
  }

  // A fifth node has nothing to fill.
  let fifth = cluster.spawn(Arc::new(Decline)).await;
  cluster.converge().await;
  sleep(Duration::from_millis(500)).await;
  let holders = cluster.coordinator().replica_holders("early").unwrap();
  assert_eq!(holders.len(), 4);
  assert!(!holders.contains(&fifth.id()));
  let path = fifth.get("early", "from-fifth").await.unwrap();
  assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "backfilled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_test_missing_replica_is_fetched_again() {
  let cluster = TestCluster::start(8000, TestCluster::declining(4)).await;
  cluster.write_scratch(0, "m.txt", "mended");
  cluster.nodes[0].put("m.txt", "mended", false).await.unwrap();
  let holders = cluster.replicated("mended", 4).await;

  // Every node learns the table from the coordinator's broadcasts.
  let nodes = cluster.nodes.clone();
  eventually("replica table everywhere", || {
    nodes
      .iter()
      .all(|n| n.replica_holders("mended").as_ref() == Some(&holders))
  })
  .await;

  let holder = *holders.iter().find(|id| **id != 0).unwrap();
  let lost = cluster.node(holder).config.store_dir.join("mended");
  std::fs::remove_file(&lost).unwrap();
  eventually("replica fetched again", || lost.is_file()).await;
  assert_eq!(std::fs::read_to_string(&lost).unwrap(), "mended");
  assert_eq!(cluster.coordinator().replica_holders("mended"), Some(holders));
}
