use crate::cluster::{ClusterConfig, ElectionConfig};
use crate::core::{Channel, Host, Socket};
use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::{Validate, ValidationError};

/// How a [`Node`](crate::core::Node) enters the cluster.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
  /// Runs as node 0, admits other nodes and keeps the directory snapshot. Restarting an
  /// introducer with an existing snapshot recovers the previous directory.
  Introducer,
  /// Joins through the introducer at the given address. Failing to reach it is fatal.
  Member { introducer: Socket },
}

/// Configures a [`Node`](crate::core::Node).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
  /// The address this node listens on. Every channel's port is derived from it.
  ///
  /// default: `0.0.0.0:7000`
  #[validate(custom = "validate_socket")]
  pub socket: Socket,
  /// The host name other nodes see in the directory.
  ///
  /// default: `localhost`
  pub hostname: String,
  /// default: `Role::Introducer`
  pub role: Role,
  /// Where `put` reads its sources from and `get` writes its results to.
  ///
  /// default: `local`
  pub scratch_dir: PathBuf,
  /// Holds this node's replicas. Wiped at startup and on leave.
  ///
  /// default: `sdfs`
  pub store_dir: PathBuf,
  /// The directory snapshot written by the introducer.
  ///
  /// default: `critical.json`
  pub snapshot_path: PathBuf,
  #[validate]
  pub cluster: ClusterConfig,
  #[validate]
  pub election: ElectionConfig,
  #[validate]
  pub store: StoreConfig,
}
impl NodeConfig {
  /// A config with every directory placed under `root`.
  pub fn rooted<P: AsRef<Path>>(socket: Socket, role: Role, root: P) -> NodeConfig {
    let root = root.as_ref();
    NodeConfig {
      hostname: socket.host.to_string(),
      socket: socket,
      role: role,
      scratch_dir: root.join("local"),
      store_dir: root.join("sdfs"),
      snapshot_path: root.join("critical.json"),
      ..NodeConfig::default()
    }
  }

  pub fn is_introducer(&self) -> bool {
    self.role == Role::Introducer
  }
}
impl Default for NodeConfig {
  fn default() -> Self {
    NodeConfig {
      socket: Socket::default(),
      hostname: Host::from("localhost").to_string(),
      role: Role::Introducer,
      scratch_dir: PathBuf::from("local"),
      store_dir: PathBuf::from("sdfs"),
      snapshot_path: PathBuf::from("critical.json"),
      cluster: ClusterConfig::default(),
      election: ElectionConfig::default(),
      store: StoreConfig::default(),
    }
  }
}

fn validate_socket(socket: &Socket) -> Result<(), ValidationError> {
  if socket.port.checked_add(Channel::Store.offset()).is_none() {
    return Err(ValidationError::new("port_overflow"));
  }
  Ok(())
}

#[test]
fn test_node_config_validation() {
  let mut config = NodeConfig::default();
  assert!(config.validate().is_ok());

  config.socket.port = u16::MAX - 1;
  assert!(config.validate().is_err());

  let mut config = NodeConfig::default();
  config.cluster.fanout = 0;
  assert!(config.validate().is_err());
}
