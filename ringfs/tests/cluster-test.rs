use maplit::{btreemap, btreeset};
use ringfs::cluster::{ClusterEvent, Endpoint};
use ringfs::core::{Envelope, Message, NetTransport, Role, Socket, Transport};
use ringfs::store::Decline;
use ringfs::testkit::{
  fast_config, init_logging, FailureConfig, FailureConfigMap, LogLevel, UnreliableTransport,
};
use ringfs::{Node, NodeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout, Instant};

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
  transport: Arc<dyn Transport>,
  nodes: Vec<Node>,
  dirs: Vec<TempDir>,
}
impl TestCluster {
  async fn start(base: u16, size: usize) -> TestCluster {
    TestCluster::start_with(base, size, Arc::new(NetTransport)).await
  }

  async fn start_with(base: u16, size: usize, transport: Arc<dyn Transport>) -> TestCluster {
    init_logging(LogLevel::Warn);
    let mut cluster = TestCluster {
      base: base,
      transport: transport,
      nodes: Vec::new(),
      dirs: Vec::new(),
    };
    for _ in 0..size {
      cluster.spawn().await;
    }
    cluster.converge().await;
    cluster
  }

  async fn spawn(&mut self) -> Node {
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
    let node = Node::start_with(config, self.transport.clone(), Arc::new(Decline))
      .await
      .unwrap();
    self.nodes.push(node.clone());
    self.dirs.push(dir);
    node
  }

  fn ids(&self) -> BTreeSet<NodeId> {
    self.nodes.iter().map(|n| n.id()).collect()
  }

  async fn converge(&self) {
    let ids = self.ids();
    let nodes = self.nodes.clone();
    eventually("membership convergence", || {
      nodes.iter().all(|n| n.online_node_ids() == ids)
    })
    .await;
  }

  /// Starts the introducer again on its old port and directory, so it reloads its snapshot.
  async fn restart_introducer(&mut self) -> Node {
    let config = fast_config(self.base, Role::Introducer, self.dirs[0].path());
    let node = Node::start_with(config, self.transport.clone(), Arc::new(Decline))
      .await
      .unwrap();
    self.nodes.insert(0, node.clone());
    node
  }

  async fn agree_on_coordinator(&self, id: NodeId) {
    let nodes = self.nodes.clone();
    eventually("coordinator agreement", || {
      nodes.iter().all(|n| n.coordinator_id() == Some(id))
    })
    .await;
  }

  fn kill(&mut self, id: NodeId) -> Node {
    let index = self.nodes.iter().position(|n| n.id() == id).unwrap();
    let node = self.nodes.remove(index);
    node.shutdown();
    node
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
async fn cluster_test_join_convergence() {
  let cluster = TestCluster::start(7100, 5).await;
  let ids = cluster.ids();
  assert_eq!(ids.len(), 5);
  assert!(ids.contains(&0));

  for node in &cluster.nodes {
    assert_eq!(node.coordinator_id(), Some(0));
    assert_eq!(node.is_coordinator(), node.id() == 0);
    assert_eq!(node.members().len(), 5);
    let targets = node.heartbeat_targets();
    assert!(!targets.is_empty());
    assert!(!targets.contains(&node.id()));
  }

  // Everyone is watched by someone.
  let nodes = cluster.nodes.clone();
  eventually("every node monitored", || {
    ids.iter().all(|id| {
      nodes
        .iter()
        .any(|n| n.id() != *id && n.monitored().contains(id))
    })
  })
  .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_test_failure_detection() {
  let mut cluster = TestCluster::start(7200, 5).await;
  let mut events = cluster.nodes[0].subscribe();
  let victim = cluster.nodes[2].id();
  cluster.kill(victim);

  let expected = cluster.ids();
  let nodes = cluster.nodes.clone();
  eventually("failure to spread", || {
    nodes.iter().all(|n| n.online_node_ids() == expected)
  })
  .await;

  let failed = timeout(SETTLE, async {
    loop {
      match events.recv().await {
        Ok(ClusterEvent::Failed(id)) if id == victim => return true,
        Ok(_) | Err(RecvError::Lagged(_)) => continue,
        Err(RecvError::Closed) => return false,
      }
    }
  })
  .await;
  assert_eq!(failed, Ok(true));

  // The survivors still agree on the introducer as coordinator.
  for node in &cluster.nodes {
    assert_eq!(node.coordinator_id(), Some(0));
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_test_coordinator_failure_elects_highest() {
  let mut cluster = TestCluster::start(7300, 4).await;
  cluster.kill(0);

  let highest = *cluster.ids().iter().max().unwrap();
  let nodes = cluster.nodes.clone();
  eventually("a new coordinator", || {
    nodes.iter().all(|n| n.coordinator_id() == Some(highest))
  })
  .await;
  let coordinators = cluster
    .nodes
    .iter()
    .filter(|n| n.is_coordinator())
    .map(|n| n.id())
    .collect::<Vec<_>>();
  assert_eq!(coordinators, vec![highest]);
  for node in &cluster.nodes {
    assert!(!node.online_node_ids().contains(&0));
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_test_leave_and_rejoin() {
  let mut cluster = TestCluster::start(7400, 4).await;
  let leaver = cluster.nodes[3].id();
  let index = cluster.nodes.iter().position(|n| n.id() == leaver).unwrap();
  let node = cluster.nodes.remove(index);
  node.leave().await;
  cluster.converge().await;
  assert!(!cluster.ids().contains(&leaver));

  // A fresh node gets a new id and everyone learns about it.
  let joined = cluster.spawn().await;
  assert!(joined.id() > leaver);
  cluster.converge().await;
  assert_eq!(joined.coordinator_id(), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_test_lossy_network_keeps_members() {
  let mut failures = FailureConfigMap::default();
  failures.cluster_wide.delay = Some((Duration::from_millis(5), Duration::from_millis(40)));
  let transport = UnreliableTransport::new(failures.clone());
  let cluster = TestCluster::start_with(7900, 5, Arc::new(transport.clone())).await;
  let ids = cluster.ids();

  // One heartbeat in five is lost. Nobody stays silent for a whole failure timeout.
  failures.cluster_wide = FailureConfig {
    drop_prob: 0.2,
    ..failures.cluster_wide
  };
  transport.set(failures);
  sleep(Duration::from_secs(3)).await;
  for node in &cluster.nodes {
    assert_eq!(node.online_node_ids(), ids);
    assert_eq!(node.coordinator_id(), Some(0));
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_test_introducer_restart_drops_unreachable() {
  let mut cluster = TestCluster::start(8100, 3).await;
  cluster.kill(0);
  cluster.kill(2);
  let survivor = cluster.nodes[0].clone();
  eventually("survivor alone", || {
    survivor.online_node_ids() == btreeset! {1} && survivor.coordinator_id() == Some(1)
  })
  .await;

  // The snapshot still names node 2, which no longer answers.
  let introducer = cluster.restart_introducer().await;
  assert_eq!(introducer.id(), 0);
  cluster.converge().await;
  cluster.agree_on_coordinator(1).await;
  sleep(Duration::from_secs(1)).await;
  for node in &cluster.nodes {
    assert_eq!(node.online_node_ids(), btreeset! {0, 1});
  }

  // Ids keep counting past everything in the snapshot.
  let joined = cluster.spawn().await;
  assert_eq!(joined.id(), 3);
  cluster.converge().await;
  assert_eq!(cluster.ids(), btreeset! {0, 1, 3});
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_test_coordinator_leave_hands_off() {
  let mut cluster = TestCluster::start(8200, 4).await;
  let mut events = cluster.nodes[1].subscribe();
  let coordinator = cluster.nodes.remove(0);
  assert!(coordinator.is_coordinator());
  coordinator.leave().await;

  cluster.converge().await;
  cluster.agree_on_coordinator(3).await;
  let coordinators = cluster
    .nodes
    .iter()
    .filter(|n| n.is_coordinator())
    .map(|n| n.id())
    .collect::<Vec<_>>();
  assert_eq!(coordinators, vec![3]);

  let left = timeout(SETTLE, async {
    loop {
      match events.recv().await {
        Ok(ClusterEvent::Left(0)) => return true,
        Ok(ClusterEvent::Failed(0)) | Err(RecvError::Closed) => return false,
        Ok(_) | Err(RecvError::Lagged(_)) => continue,
      }
    }
  })
  .await;
  assert_eq!(left, Ok(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_test_election_with_gaps_in_ids() {
  // Make node 5 coordinator while the introducer is still around to admit more nodes.
  let mut cluster = TestCluster::start(8300, 6).await;
  cluster.kill(0);
  cluster.agree_on_coordinator(5).await;
  cluster.restart_introducer().await;
  cluster.converge().await;
  cluster.agree_on_coordinator(5).await;
  for _ in 0..4 {
    cluster.spawn().await;
  }
  cluster.converge().await;
  assert_eq!(cluster.ids(), (0..10).collect::<BTreeSet<_>>());
  cluster.agree_on_coordinator(5).await;

  for id in [0, 1, 4, 6, 8] {
    cluster.kill(id);
    cluster.converge().await;
  }
  cluster.agree_on_coordinator(5).await;

  cluster.kill(5);
  cluster.converge().await;
  assert_eq!(cluster.ids(), btreeset! {2, 3, 7, 9});
  cluster.agree_on_coordinator(9).await;
  let coordinators = cluster
    .nodes
    .iter()
    .filter(|n| n.is_coordinator())
    .map(|n| n.id())
    .collect::<Vec<_>>();
  assert_eq!(coordinators, vec![9]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_test_late_update_keeps_failed_node_out() {
  let mut cluster = TestCluster::start(8400, 4).await;
  let gone = cluster.kill(3);
  cluster.converge().await;

  let late = Envelope::new(
    1,
    Message::UpdateList(btreemap! {
      3 => Endpoint {
        host: "late".to_string(),
        socket: gone.socket().clone(),
      },
    }),
  );
  NetTransport
    .stream(cluster.nodes[2].socket(), &late)
    .await
    .unwrap();
  sleep(Duration::from_millis(500)).await;
  for node in &cluster.nodes {
    assert_eq!(node.online_node_ids(), btreeset! {0, 1, 2});
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_test_duplicate_envelope_handled_once() {
  let cluster = TestCluster::start(8500, 3).await;
  let receiver = cluster.nodes[2].clone();
  let mut events = receiver.subscribe();
  let before = (receiver.online_node_ids(), receiver.coordinator_id());

  let task = Envelope::new(1, Message::Task("job-17".to_string()));
  NetTransport.stream(receiver.socket(), &task).await.unwrap();
  NetTransport.stream(receiver.socket(), &task).await.unwrap();
  // Same payload, new id.
  let again = Envelope::new(1, Message::Task("job-17".to_string()));
  NetTransport.stream(receiver.socket(), &again).await.unwrap();
  let known = cluster.nodes[0]
    .members()
    .iter()
    .map(|m| (m.id, m.endpoint()))
    .collect();
  let members = Envelope::new(0, Message::UpdateList(known));
  NetTransport.stream(receiver.socket(), &members).await.unwrap();
  NetTransport.stream(receiver.socket(), &members).await.unwrap();

  let mut tasks = 0;
  while let Ok(Ok(event)) = timeout(Duration::from_millis(500), events.recv()).await {
    match event {
      ClusterEvent::Task { from, payload, .. } => {
        assert_eq!((from, payload.as_str()), (1, "job-17"));
        tasks += 1;
      }
      other => panic!("unexpected event {:?}", other),
    }
  }
  assert_eq!(tasks, 2);
  assert_eq!((receiver.online_node_ids(), receiver.coordinator_id()), before);
}
