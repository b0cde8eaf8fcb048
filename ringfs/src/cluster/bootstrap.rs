use crate::cluster::{ClusterEvent, Directory, Endpoint, JoinAck, Member, MemberMap, SnapshotError};
use crate::core::{
  Channel, Envelope, EnvelopeError, Host, Message, Node, NodeId, Socket, INTRODUCER,
  MAX_DATAGRAM, UNASSIGNED,
};
use maplit::btreemap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum JoinError {
  #[error("introducer {addr} is unreachable: {source}")]
  Unreachable { addr: Socket, source: io::Error },
  #[error("introducer {0} did not answer")]
  Timeout(Socket),
  #[error("introducer sent a malformed answer: {0}")]
  Malformed(#[from] EnvelopeError),
  #[error("introducer answered with {0} instead of JOINACK")]
  Unexpected(String),
}

/// Everything a node knows about the cluster when it starts.
#[derive(Clone, Debug)]
pub struct Bootstrap {
  pub me: Member,
  pub members: MemberMap,
  pub leader: Option<NodeId>,
  /// Set when the introducer reloaded a previous directory.
  pub restored: bool,
}

/// Asks the introducer for an id and the current directory.
pub async fn join(
  introducer: &Socket,
  me: Endpoint,
  limit: Duration,
) -> Result<Bootstrap, JoinError> {
  let unreachable = |e| JoinError::Unreachable {
    addr: introducer.clone(),
    source: e,
  };
  let addr = introducer.resolve(Channel::Control).await.map_err(unreachable)?;
  let udp = UdpSocket::bind(crate::core::unspecified(&addr))
    .await
    .map_err(unreachable)?;
  let request = Envelope::new(UNASSIGNED, Message::JoinReq(me.clone()));
  udp.send_to(&request.encode()?, addr).await.map_err(unreachable)?;

  let mut buf = vec![0u8; MAX_DATAGRAM];
  let (len, _) = match timeout(limit, udp.recv_from(&mut buf)).await {
    Ok(res) => res.map_err(unreachable)?,
    Err(_) => return Err(JoinError::Timeout(introducer.clone())),
  };
  let reply = Envelope::decode(&buf[..len])?;
  match reply.msg {
    Message::JoinAck(ack) => {
      let mut members = ack.members;
      members.remove(&ack.assigned);
      info!(node = ack.assigned, members = members.len(), "joined the cluster");
      Ok(Bootstrap {
        me: Member::new(ack.assigned, me),
        members: members,
        leader: ack.leader,
        restored: false,
      })
    }
    other => Err(JoinError::Unexpected(other.kind().to_string())),
  }
}

/// Starts the introducer, reloading its previous directory if a snapshot exists.
pub async fn introduce(me: Endpoint, snapshot: &Path) -> Result<Bootstrap, SnapshotError> {
  let mut members = Directory::load_snapshot(snapshot).await?;
  members.remove(&INTRODUCER);
  let restored = !members.is_empty();
  if restored {
    info!(members = members.len(), "reloaded directory snapshot");
  }
  Ok(Bootstrap {
    me: Member::new(INTRODUCER, me),
    members: members,
    leader: if restored { None } else { Some(INTRODUCER) },
    restored: restored,
  })
}

/// A joiner bound to a wildcard address is reached at the address its request came from.
fn routable(mut endpoint: Endpoint, observed: SocketAddr) -> Endpoint {
  if let Host::IP(ip) = &endpoint.socket.host {
    if ip.is_unspecified() {
      endpoint.socket.host = Host::IP(observed.ip());
    }
  }
  endpoint
}

impl Node {
  /// Admits a joining node. Only the introducer does this.
  pub(crate) async fn admit(&self, endpoint: Endpoint, reply: Arc<UdpSocket>, to: SocketAddr) {
    if !self.config.is_introducer() {
      warn!(node = self.id(), from = %to, "join request sent to a non-introducer");
      return;
    }
    let endpoint = routable(endpoint, to);
    let member = self.directory.admit(endpoint.clone());
    info!(node = self.id(), peer = %member, "admitting");
    let ack = JoinAck {
      assigned: member.id,
      leader: self.coordinator_id(),
      members: self.directory.member_map(true),
    };
    let sent = match Envelope::new(self.id(), Message::JoinAck(ack)).encode() {
      Ok(bytes) => reply.send_to(&bytes, to).await.map(|_| ()),
      Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
    };
    if let Err(e) = sent {
      warn!(node = self.id(), peer = member.id, "join answer not sent: {}", e);
    }

    let update = self.envelope(Message::UpdateList(btreemap! { member.id => endpoint }));
    self.disseminate(&update, Some(member.id)).await;
    self.retopologize();
    self.persist_directory().await;
    self.publish(ClusterEvent::Added(member.id));
    if self.is_coordinator() {
      self.welcome(member.id).await;
    }
  }

  /// Re-contacts every node of a reloaded directory after an introducer restart. Nodes that
  /// cannot be reached are dropped, and only then is the pruned directory sent to the rest. If
  /// anyone is left, an election settles who coordinates.
  pub(crate) async fn recover(&self) {
    let me = btreemap! { self.id() => self.directory.me().endpoint() };
    let hello = self.envelope(Message::UpdateList(me));
    let reloaded = self.directory.snapshot();
    for (id, member) in reloaded.iter() {
      if let Err(e) = self.transport.stream(&member.socket, &hello).await {
        warn!(node = self.id(), peer = id, "dropping unreachable member: {}", e);
        self.directory.remove(*id);
      }
    }
    self.retopologize();
    self.persist_directory().await;
    let survivors = self.directory.peers();
    let announce = self.envelope(Message::UpdateList(self.directory.member_map(true)));
    for (id, member) in self.directory.snapshot().iter() {
      if let Err(e) = self.transport.stream(&member.socket, &announce).await {
        warn!(node = self.id(), peer = id, "directory not re-announced: {}", e);
      }
    }
    info!(node = self.id(), survivors = ?survivors, "directory recovered");
    if survivors.is_empty() {
      self.leader.store(Some(self.id()));
      self.coordinator.store(true);
      self.publish(ClusterEvent::Coordinator(self.id()));
    } else {
      self.spawn_election(None);
    }
  }
}

#[test]
fn test_routable_replaces_wildcard() {
  let observed: SocketAddr = "10.0.0.7:50123".parse().unwrap();
  let wildcard = Endpoint {
    host: "vm-07".to_string(),
    socket: "0.0.0.0:7000".parse().unwrap(),
  };
  assert_eq!(routable(wildcard, observed).socket, "10.0.0.7:7000".parse::<Socket>().unwrap());
  let named = Endpoint {
    host: "vm-08".to_string(),
    socket: "vm-08.local:7000".parse().unwrap(),
  };
  assert_eq!(routable(named.clone(), observed), named);
}

#[tokio::test]
async fn test_introduce_fresh_and_restored() {
  let tmp = tempfile::tempdir().unwrap();
  let path = tmp.path().join("critical.json");
  let me = Endpoint {
    host: "intro".to_string(),
    socket: Socket::localhost(7000),
  };
  let fresh = introduce(me.clone(), &path).await.unwrap();
  assert_eq!(fresh.me.id, INTRODUCER);
  assert_eq!(fresh.leader, Some(INTRODUCER));
  assert!(!fresh.restored);

  let previous = btreemap! {
    3 => Endpoint { host: "a".to_string(), socket: Socket::localhost(7030) },
    8 => Endpoint { host: "b".to_string(), socket: Socket::localhost(7080) },
  };
  std::fs::write(&path, serde_json::to_vec(&previous).unwrap()).unwrap();
  let restored = introduce(me, &path).await.unwrap();
  assert!(restored.restored);
  assert_eq!(restored.leader, None);
  assert_eq!(restored.members, previous);
}
