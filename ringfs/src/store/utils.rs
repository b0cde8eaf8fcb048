use crate::core::{Channel, NodeId, TransportError};
use crate::store::TransferError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

/// Configures the replicated object store.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct StoreConfig {
  /// A second write to the same name within this window needs confirmation from the submitter.
  ///
  /// default: `60 seconds`
  pub conflict_window: Duration,
  /// How long the submitter is given to confirm an overwrite. No answer means no.
  ///
  /// default: `30 seconds`
  pub prompt_timeout: Duration,
  /// How often the coordinator broadcasts its replica table.
  ///
  /// default: `2 seconds`
  pub snapshot_interval: Duration,
  /// How long `get` waits for the bytes to arrive.
  ///
  /// default: `10 seconds`
  pub read_timeout: Duration,
}
impl Default for StoreConfig {
  #[inline]
  fn default() -> Self {
    StoreConfig {
      conflict_window: Duration::from_secs(60),
      prompt_timeout: Duration::from_secs(30),
      snapshot_interval: Duration::from_secs(2),
      read_timeout: Duration::from_secs(10),
    }
  }
}

/// The two directories objects live in on each node.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Dir {
  /// Files the user puts from and gets into.
  Scratch,
  /// Replicas held for the store.
  Store,
}
impl Dir {
  /// The listener that receives transfers into this directory.
  pub fn channel(self) -> Channel {
    match self {
      Dir::Scratch => Channel::Scratch,
      Dir::Store => Channel::Store,
    }
  }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct FileRef {
  pub dir: Dir,
  pub name: String,
}
impl FileRef {
  pub fn new<S: Into<String>>(dir: Dir, name: S) -> FileRef {
    FileRef {
      dir: dir,
      name: name.into(),
    }
  }
}

/// Sent by a non-coordinator to have the coordinator place a new object.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WriteRequest {
  /// Path of the source file under the submitter's scratch directory.
  pub source: String,
  pub name: String,
  pub overwrite: bool,
}

/// Tells the receiver to copy `source` to `dest` on every target. Targets equal to the receiver
/// get a local copy.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TransferOrder {
  pub source: FileRef,
  pub dest: FileRef,
  pub targets: Vec<NodeId>,
}

/// Several objects moving from the receiver to one target, sent one after another over the same
/// listener.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TransferBatch {
  pub from: Dir,
  pub to: Dir,
  pub names: Vec<String>,
  pub target: NodeId,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReadRequest {
  pub name: String,
  pub dest: FileRef,
  pub requester: NodeId,
  /// Whether the requester already has a replica of `name`.
  pub local_copy: bool,
}

/// The coordinator does not know the object.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReadMiss {
  pub name: String,
  /// The pending read to fail, if the miss answers a read.
  pub dest: Option<String>,
}

/// Asks a submitter whether to overwrite a recently written object.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OverwritePrompt {
  pub source: String,
  pub name: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PutOutcome {
  /// Placed by this node, which is the coordinator.
  Placed(Vec<NodeId>),
  /// Handed to the coordinator.
  Forwarded,
  /// The submitter, another node, has been asked to confirm an overwrite.
  AwaitingConfirmation,
  /// A recent write exists and the overwrite was not confirmed.
  Declined,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeleteOutcome {
  Deleted,
  Forwarded,
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("{0} does not exist")]
  NotFound(String),
  #[error("local file {0} does not exist")]
  MissingSource(PathBuf),
  #[error("no coordinator is known")]
  NoCoordinator,
  #[error("timed out waiting for {0}")]
  Timeout(String),
  #[error(transparent)]
  Transfer(#[from] TransferError),
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),
}

/// Asks the local user whether a recent object may be overwritten.
#[async_trait]
pub trait Prompter: Send + Sync + 'static {
  async fn confirm(&self, name: &str) -> bool;
}

/// Never overwrites.
#[derive(Clone, Copy, Debug, Default)]
pub struct Decline;

#[async_trait]
impl Prompter for Decline {
  async fn confirm(&self, _: &str) -> bool {
    false
  }
}

/// Always overwrites.
#[derive(Clone, Copy, Debug, Default)]
pub struct Accept;

#[async_trait]
impl Prompter for Accept {
  async fn confirm(&self, _: &str) -> bool {
    true
  }
}
