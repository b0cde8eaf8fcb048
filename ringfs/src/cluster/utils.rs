use crate::core::{NodeId, Socket};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Configures membership, the heartbeat ring and failure detection.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_timing"))]
pub struct ClusterConfig {
  /// How often heartbeats are sent to each heartbeat target.
  ///
  /// default: `100 milliseconds`
  pub heartbeat_interval: Duration,
  /// How often the monitor set is scanned for expired heartbeats.
  ///
  /// default: `25 milliseconds`
  pub detect_interval: Duration,
  /// Silence after which a monitored node is declared failed. Must exceed two heartbeat
  /// intervals.
  ///
  /// default: `2 seconds`
  pub failure_timeout: Duration,
  /// The number of predecessors each node heartbeats to, and successors it monitors. THIS VALUE
  /// MUST BE THE SAME FOR EVERY NODE IN THE CLUSTER.
  ///
  /// default: `3`
  #[validate(range(min = 1))]
  pub fanout: usize,
  /// The number of recent message ids remembered for deduplication.
  ///
  /// default: `60`
  #[validate(range(min = 1))]
  pub dedup_capacity: usize,
  /// How long a joining node waits for the introducer's answer.
  ///
  /// default: `2 seconds`
  pub join_timeout: Duration,
}
impl Default for ClusterConfig {
  #[inline]
  fn default() -> Self {
    ClusterConfig {
      heartbeat_interval: Duration::from_millis(100),
      detect_interval: Duration::from_millis(25),
      failure_timeout: Duration::from_secs(2),
      fanout: 3,
      dedup_capacity: crate::core::RECENT_MESSAGES,
      join_timeout: Duration::from_secs(2),
    }
  }
}

fn validate_timing(config: &ClusterConfig) -> Result<(), ValidationError> {
  if config.heartbeat_interval.is_zero() || config.detect_interval.is_zero() {
    return Err(ValidationError::new("zero_interval"));
  }
  if config.failure_timeout <= config.heartbeat_interval * 2 {
    return Err(ValidationError::new("failure_timeout_too_short"));
  }
  Ok(())
}

/// Configures the bully election.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ElectionConfig {
  /// How long an elector waits for any higher node to answer OK before taking over.
  ///
  /// default: `2 seconds`
  pub ok_timeout: Duration,
  /// How long an elector that got an OK waits for the coordinator announcement before it starts
  /// another round.
  ///
  /// default: `5 seconds`
  pub coordinator_timeout: Duration,
  /// The number of rounds before the elector gives up waiting and takes over.
  ///
  /// default: `5`
  #[validate(range(min = 1))]
  pub max_rounds: u32,
  /// Pause before round `n + 1`, multiplied by `n`.
  ///
  /// default: `100 milliseconds`
  pub backoff: Duration,
}
impl Default for ElectionConfig {
  #[inline]
  fn default() -> Self {
    ElectionConfig {
      ok_timeout: Duration::from_secs(2),
      coordinator_timeout: Duration::from_secs(5),
      max_rounds: 5,
      backoff: Duration::from_millis(100),
    }
  }
}

/// Where to reach a node, as carried in directory updates. Serializes as `"host\naddress"`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(into = "String", try_from = "String")]
pub struct Endpoint {
  pub host: String,
  pub socket: Socket,
}
impl From<Endpoint> for String {
  fn from(e: Endpoint) -> String {
    format!("{}\n{}", e.host, e.socket)
  }
}
impl TryFrom<String> for Endpoint {
  type Error = String;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    let (host, addr) = s
      .split_once('\n')
      .ok_or_else(|| format!("directory entry {:?} lacks an address", s))?;
    let socket = addr.parse::<Socket>().map_err(|e| e.to_string())?;
    Ok(Endpoint {
      host: host.to_string(),
      socket: socket,
    })
  }
}

/// Directory entries keyed by id, the form used on the wire and in the snapshot file.
pub type MemberMap = BTreeMap<NodeId, Endpoint>;

/// A node in the directory.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Member {
  pub id: NodeId,
  pub host: String,
  pub socket: Socket,
}
impl Member {
  pub fn new(id: NodeId, endpoint: Endpoint) -> Member {
    Member {
      id: id,
      host: endpoint.host,
      socket: endpoint.socket,
    }
  }

  pub fn endpoint(&self) -> Endpoint {
    Endpoint {
      host: self.host.clone(),
      socket: self.socket.clone(),
    }
  }
}
impl fmt::Display for Member {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({}, {})", self.id, self.host, self.socket)
  }
}

/// The introducer's answer to a join request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JoinAck {
  /// The id given to the joining node.
  pub assigned: NodeId,
  /// The coordinator, if the introducer knows one.
  pub leader: Option<NodeId>,
  /// The whole directory, including the introducer and the joining node.
  pub members: MemberMap,
}

/// Notifications published by a [`Node`](crate::core::Node) to its subscribers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClusterEvent {
  Added(NodeId),
  /// A node was declared failed, either locally or by gossip.
  Failed(NodeId),
  Left(NodeId),
  /// A coordinator was adopted. The id may be the local node.
  Coordinator(NodeId),
  /// A batch-layer payload arrived.
  Task {
    from: NodeId,
    done: bool,
    payload: String,
  },
}

#[test]
fn test_endpoint_wire_form() {
  let e = Endpoint {
    host: "vm-03".to_string(),
    socket: Socket::localhost(7010),
  };
  let json = serde_json::to_string(&e).unwrap();
  assert_eq!(json, "\"vm-03\\n127.0.0.1:7010\"");
  assert_eq!(serde_json::from_str::<Endpoint>(&json).unwrap(), e);
  assert!(serde_json::from_str::<Endpoint>("\"no-newline\"").is_err());
}

#[test]
fn test_cluster_config_timing() {
  let mut config = ClusterConfig::default();
  assert!(config.validate().is_ok());
  config.failure_timeout = config.heartbeat_interval;
  assert!(config.validate().is_err());
}
