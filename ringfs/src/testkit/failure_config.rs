use crate::core::Socket;
use im::HashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How unreliable the network to one node is.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FailureConfig {
  /// Chance that a datagram is silently dropped.
  pub drop_prob: f64,
  /// Datagrams are held back for a random time in this range.
  pub delay: Option<(Duration, Duration)>,
  /// Stream sends fail as if the node were unreachable.
  pub unreachable: bool,
}

#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<Socket, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, socket: &Socket) -> &FailureConfig {
    self.node_wide.get(socket).unwrap_or(&self.cluster_wide)
  }
}

#[test]
fn test_failure_config_lookup() {
  let mut map = FailureConfigMap::default();
  map.cluster_wide.drop_prob = 0.1;
  let cut_off = FailureConfig {
    unreachable: true,
    ..FailureConfig::default()
  };
  map.node_wide.insert(Socket::localhost(7100), cut_off);
  assert!(map.get(&Socket::localhost(7100)).unreachable);
  assert_eq!(map.get(&Socket::localhost(7200)).drop_prob, 0.1);
}
