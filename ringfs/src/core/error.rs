use crate::cluster::{JoinError, SnapshotError};
use std::io;
use thiserror::Error;

/// Reasons a [`Node`](crate::core::Node) fails to start. All of them are fatal.
#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid configuration: {0}")]
  Config(#[from] validator::ValidationErrors),
  #[error("could not bind {what}: {source}")]
  Bind {
    what: &'static str,
    source: io::Error,
  },
  #[error("could not prepare {path}: {source}")]
  Directory {
    path: String,
    source: io::Error,
  },
  #[error(transparent)]
  Join(#[from] JoinError),
  #[error(transparent)]
  Snapshot(#[from] SnapshotError),
}
