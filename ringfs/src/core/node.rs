use crate::cluster::{
  introduce, join, ClusterEvent, Departure, Directory, Election, Endpoint, Member, Monitor,
  NodeRing, Phase,
};
use crate::core::{
  Channel, DedupCache, Envelope, Error, Message, MsgType, NetTransport, NodeConfig, NodeId, Role,
  Socket, Transport, TransportError,
};
use crate::store::{
  Decline, Dir, LocalStore, Prompter, ReadMiss, ReplicaTable, StoreError,
};
use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::io;
use std::ops::Deref;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use validator::Validate;

const EVENT_BUFFER: usize = 256;

/// A running cluster node. Cloning gives another handle to the same node.
#[derive(Clone)]
pub struct Node {
  inner: Arc<NodeInner>,
}

/// The state shared by every task of a [`Node`].
pub struct NodeInner {
  pub config: NodeConfig,
  pub(crate) directory: Directory,
  pub(crate) ring: RwLock<NodeRing>,
  pub(crate) monitor: Monitor,
  pub(crate) dedup: Mutex<DedupCache>,
  pub(crate) election: Election,
  pub(crate) replicas: Mutex<ReplicaTable>,
  pub(crate) store: LocalStore,
  pub(crate) leader: AtomicCell<Option<NodeId>>,
  pub(crate) coordinator: AtomicCell<bool>,
  pub(crate) transport: Arc<dyn Transport>,
  pub(crate) prompter: Arc<dyn Prompter>,
  events: broadcast::Sender<ClusterEvent>,
  inbox: mpsc::UnboundedSender<Envelope>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Deref for Node {
  type Target = NodeInner;

  fn deref(&self) -> &NodeInner {
    &self.inner
  }
}

struct Listeners {
  control: UdpSocket,
  bulk: TcpListener,
  scratch: TcpListener,
  store: TcpListener,
}

fn bind_error(what: &'static str) -> impl FnOnce(io::Error) -> Error {
  move |e| Error::Bind {
    what: what,
    source: e,
  }
}

async fn listen(socket: &Socket, chan: Channel, what: &'static str) -> Result<TcpListener, Error> {
  let addr = socket.resolve(chan).await.map_err(bind_error(what))?;
  TcpListener::bind(addr).await.map_err(bind_error(what))
}

async fn bind(socket: &Socket) -> Result<Listeners, Error> {
  let addr = socket
    .resolve(Channel::Control)
    .await
    .map_err(bind_error("control"))?;
  Ok(Listeners {
    control: UdpSocket::bind(addr).await.map_err(bind_error("control"))?,
    bulk: listen(socket, Channel::Bulk, "bulk").await?,
    scratch: listen(socket, Channel::Scratch, "scratch").await?,
    store: listen(socket, Channel::Store, "store").await?,
  })
}

impl Node {
  /// Starts a node on real sockets. Overwrites are never confirmed.
  pub async fn start(config: NodeConfig) -> Result<Node, Error> {
    Node::start_with(config, Arc::new(NetTransport), Arc::new(Decline)).await
  }

  /// Validates the config, prepares the directories, binds every listener, joins the cluster
  /// (or reloads it, on the introducer) and spawns the background tasks.
  pub async fn start_with(
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    prompter: Arc<dyn Prompter>,
  ) -> Result<Node, Error> {
    config.validate()?;
    let store = LocalStore::open(config.scratch_dir.clone(), config.store_dir.clone())
      .await
      .map_err(|e| Error::Directory {
        path: config.store_dir.display().to_string(),
        source: e,
      })?;
    let listeners = bind(&config.socket).await?;

    let endpoint = Endpoint {
      host: config.hostname.clone(),
      socket: config.socket.clone(),
    };
    let boot = match &config.role {
      Role::Introducer => introduce(endpoint, &config.snapshot_path).await?,
      Role::Member { introducer } => {
        join(introducer, endpoint, config.cluster.join_timeout).await?
      }
    };
    let snapshot = match config.role {
      Role::Introducer => Some(config.snapshot_path.clone()),
      Role::Member { .. } => None,
    };
    let directory = Directory::new(boot.me.clone(), snapshot);
    for (id, endpoint) in boot.members {
      directory.insert(Member::new(id, endpoint));
    }

    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let (inbox, inbox_rx) = mpsc::unbounded_channel();
    let me = boot.me.id;
    let node = Node {
      inner: Arc::new(NodeInner {
        dedup: Mutex::new(DedupCache::new(config.cluster.dedup_capacity)),
        config: config,
        directory: directory,
        ring: RwLock::new(NodeRing::default()),
        monitor: Monitor::default(),
        election: Election::new(),
        replicas: Mutex::new(ReplicaTable::new()),
        store: store,
        leader: AtomicCell::new(boot.leader),
        coordinator: AtomicCell::new(boot.leader == Some(me)),
        transport: transport,
        prompter: prompter,
        events: events,
        inbox: inbox,
        tasks: Mutex::new(Vec::new()),
      }),
    };
    node.retopologize();
    {
      let mut table = node.replicas.lock();
      for id in node.directory.online() {
        table.register_node(id);
      }
    }
    node.spawn_tasks(listeners, inbox_rx);
    info!(
      node = me,
      socket = %node.config.socket,
      members = ?node.directory.peers(),
      coordinator = ?node.coordinator_id(),
      "node started"
    );
    if boot.restored {
      node.recover().await;
    } else {
      node.persist_directory().await;
    }
    Ok(node)
  }

  fn spawn_tasks(&self, listeners: Listeners, inbox: mpsc::UnboundedReceiver<Envelope>) {
    let Listeners {
      control,
      bulk,
      scratch,
      store,
    } = listeners;
    let handles = vec![
      tokio::spawn(self.clone().udp_receiver(Arc::new(control))),
      tokio::spawn(self.clone().tcp_receiver(bulk)),
      tokio::spawn(self.clone().transfer_listener(scratch, Dir::Scratch)),
      tokio::spawn(self.clone().transfer_listener(store, Dir::Store)),
      tokio::spawn(self.clone().inbox_loop(inbox)),
      tokio::spawn(self.clone().heartbeat_sender()),
      tokio::spawn(self.clone().failure_detector()),
      tokio::spawn(self.clone().replica_broadcaster()),
    ];
    self.tasks.lock().extend(handles);
  }

  /// Stops every background task. The node no longer answers anyone afterwards.
  pub fn shutdown(&self) {
    let tasks = std::mem::take(&mut *self.tasks.lock());
    debug!(node = self.id(), tasks = tasks.len(), "shutting down");
    for task in tasks {
      task.abort();
    }
  }

  pub fn id(&self) -> NodeId {
    self.directory.id()
  }

  pub fn socket(&self) -> &Socket {
    &self.config.socket
  }

  pub fn is_coordinator(&self) -> bool {
    self.coordinator.load()
  }

  pub fn coordinator_id(&self) -> Option<NodeId> {
    self.leader.load()
  }

  /// Every node in the local directory, this one included.
  pub fn online_node_ids(&self) -> BTreeSet<NodeId> {
    self.directory.online()
  }

  /// Every member, this one included, ordered by id.
  pub fn members(&self) -> Vec<Member> {
    let mut members: Vec<Member> = self
      .directory
      .snapshot()
      .values()
      .map(|m| Member::clone(m))
      .collect();
    members.push(Member::clone(self.directory.me()));
    members.sort_by_key(|m| m.id);
    members
  }

  /// The nodes this one heartbeats.
  pub fn heartbeat_targets(&self) -> Vec<NodeId> {
    self.ring.read().targets().to_vec()
  }

  /// The nodes this one watches for failure.
  pub fn monitored(&self) -> Vec<NodeId> {
    self.monitor.monitored()
  }

  pub fn election_phase(&self) -> Phase {
    self.election.phase()
  }

  /// Membership, coordinator and task notifications. A subscriber that falls behind misses
  /// events.
  pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
    self.events.subscribe()
  }

  pub(crate) fn publish(&self, event: ClusterEvent) {
    trace!(node = self.id(), ?event, "publishing");
    let _ = self.events.send(event);
  }

  /// Wraps a message for sending. Its id is remembered so gossip coming back around the ring is
  /// dropped.
  pub(crate) fn envelope(&self, msg: Message) -> Envelope {
    let env = Envelope::new(self.id(), msg);
    if env.kind() != MsgType::Heartbeat {
      self.dedup.lock().observe(&env.unique_id);
    }
    env
  }

  /// Sends a message to one node. Table snapshots, batches and tasks go over the bulk channel,
  /// everything else in a datagram. Messages to this node are handled locally.
  pub(crate) async fn send_to(&self, id: NodeId, msg: Message) -> Result<(), TransportError> {
    if id == self.id() {
      return self
        .inbox
        .send(Envelope::new(id, msg))
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "node stopped").into());
    }
    let member = self
      .directory
      .get(id)
      .ok_or(TransportError::UnknownNode(id))?;
    let env = self.envelope(msg);
    match env.kind() {
      MsgType::ReplicaList | MsgType::WriteBatch | MsgType::Task | MsgType::TaskDone => {
        self.transport.stream(&member.socket, &env).await
      }
      _ => match self.transport.datagram(&member.socket, &env).await {
        Err(TransportError::TooLarge(_)) => self.transport.stream(&member.socket, &env).await,
        sent => sent,
      },
    }
  }

  /// Hands a batch-layer payload to another node.
  pub async fn send_task(
    &self,
    to: NodeId,
    payload: String,
    done: bool,
  ) -> Result<(), TransportError> {
    let msg = if done {
      Message::TaskDone(payload)
    } else {
      Message::Task(payload)
    };
    self.send_to(to, msg).await
  }

  /// Entry point for every envelope received from the network.
  pub(crate) fn deliver(&self, env: Envelope) {
    if env.kind() == MsgType::Heartbeat {
      self.receive_heartbeat(env.sender, env.timestamp);
      return;
    }
    if !self.dedup.lock().observe(&env.unique_id) {
      trace!(node = self.id(), kind = %env.kind(), "duplicate dropped");
      return;
    }
    self.spawn_handler(env);
  }

  fn spawn_handler(&self, env: Envelope) {
    let node = self.clone();
    tokio::spawn(async move {
      let forward = env.kind().disseminated().then(|| env.clone());
      node.handle(env).await;
      if let Some(env) = forward {
        node.disseminate(&env, Some(env.sender)).await;
      }
    });
  }

  async fn inbox_loop(self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(env) = inbox.recv().await {
      self.spawn_handler(env);
    }
  }

  async fn handle(&self, env: Envelope) {
    let from = env.sender;
    trace!(node = self.id(), peer = from, kind = %env.kind(), "handling");
    match env.msg {
      Message::Heartbeat => self.receive_heartbeat(from, env.timestamp),
      Message::Fail(id) => {
        self.drop_member(id, Departure::Failed).await;
      }
      Message::Leave(id) => {
        self.drop_member(id, Departure::Left).await;
      }
      Message::UpdateList(entries) => self.merge_members(from, entries).await,
      Message::JoinReq(_) | Message::JoinAck(_) => {
        warn!(node = self.id(), peer = from, "join message outside of a join");
      }
      Message::WriteReq(req) => {
        if !self.is_coordinator() {
          warn!(node = self.id(), peer = from, name = %req.name, "write sent to a non-coordinator");
          return;
        }
        match self.coordinate_put(from, req).await {
          Ok(outcome) => debug!(node = self.id(), peer = from, ?outcome, "write coordinated"),
          Err(e) => warn!(node = self.id(), peer = from, "write failed: {}", e),
        }
      }
      Message::Write(order) => self.execute_order(order).await,
      Message::WriteBatch(batch) => self.execute_batch(batch).await,
      Message::ReadReq(req) => {
        if !self.is_coordinator() {
          warn!(node = self.id(), peer = from, name = %req.name, "read sent to a non-coordinator");
          return;
        }
        let requester = req.requester;
        let dest = req.dest.name.clone();
        match self.coordinate_get(req).await {
          Ok(()) => {}
          Err(StoreError::NotFound(name)) => {
            let miss = ReadMiss {
              name: name,
              dest: Some(dest),
            };
            self.report_miss(requester, miss).await;
          }
          Err(e) => warn!(node = self.id(), peer = requester, "read failed: {}", e),
        }
      }
      Message::ErrorRead(miss) => self.read_missed(miss),
      Message::DeleteReq(name) => {
        if !self.is_coordinator() {
          warn!(node = self.id(), peer = from, name = %name, "delete sent to a non-coordinator");
          return;
        }
        match self.coordinate_delete(&name).await {
          Ok(_) => {}
          Err(StoreError::NotFound(name)) => {
            self.report_miss(from, ReadMiss { name: name, dest: None }).await;
          }
          Err(e) => warn!(node = self.id(), peer = from, "delete failed: {}", e),
        }
      }
      Message::Delete(name) => self.delete_local(&name).await,
      Message::Overwrite(prompt) => self.answer_overwrite(from, prompt).await,
      Message::ReplicaList(snapshot) => self.adopt_snapshot(from, snapshot).await,
      Message::Election(failed) => self.answer_election(from, failed).await,
      Message::Ok => self.election.ok_received(),
      Message::Coordinator => self.adopt_coordinator(from),
      Message::NewElection => self.run_election(Some(from)).await,
      Message::Task(payload) => self.publish(ClusterEvent::Task {
        from: from,
        done: false,
        payload: payload,
      }),
      Message::TaskDone(payload) => self.publish(ClusterEvent::Task {
        from: from,
        done: true,
        payload: payload,
      }),
    }
  }
}
