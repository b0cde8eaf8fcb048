//! Helpers for running nodes in tests: logging setup, lossy transports and configurations with
//! timings short enough for a test to wait on.

mod failure_config;
mod logging;
mod unreliable_transport;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  logging::init_logging,
  logging::LogLevel,
  unreliable_transport::UnreliableTransport,
};

use crate::cluster::{ClusterConfig, ElectionConfig};
use crate::core::{NodeConfig, Role, Socket};
use crate::store::{Prompter, StoreConfig};
use async_trait::async_trait;
use std::future::pending;
use std::path::Path;
use std::time::Duration;

/// A config on `127.0.0.1:port` with every directory under `root` and timings scaled down so
/// failures are detected and elections settle within a few seconds.
pub fn fast_config<P: AsRef<Path>>(port: u16, role: Role, root: P) -> NodeConfig {
  let mut config = NodeConfig::rooted(Socket::localhost(port), role, root);
  config.cluster = ClusterConfig {
    heartbeat_interval: Duration::from_millis(50),
    detect_interval: Duration::from_millis(20),
    failure_timeout: Duration::from_millis(600),
    join_timeout: Duration::from_secs(2),
    ..ClusterConfig::default()
  };
  config.election = ElectionConfig {
    ok_timeout: Duration::from_millis(400),
    coordinator_timeout: Duration::from_millis(1200),
    max_rounds: 3,
    backoff: Duration::from_millis(50),
  };
  config.store = StoreConfig {
    conflict_window: Duration::from_secs(60),
    prompt_timeout: Duration::from_millis(300),
    snapshot_interval: Duration::from_millis(200),
    read_timeout: Duration::from_secs(5),
  };
  config
}

/// A prompter that never answers, so every prompt runs into its timeout.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverAnswer;

#[async_trait]
impl Prompter for NeverAnswer {
  async fn confirm(&self, _: &str) -> bool {
    pending::<bool>().await
  }
}

#[test]
fn test_fast_config_is_valid() {
  use validator::Validate;
  let config = fast_config(7400, Role::Introducer, "/tmp/ringfs");
  assert!(config.validate().is_ok());
  assert_eq!(config.socket, Socket::localhost(7400));
}
