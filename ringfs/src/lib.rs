//! Control and storage plane for a small peer-to-peer cluster.
//!
//! Each process runs a [`Node`](crate::core::Node), which joins the cluster through a well known
//! introducer, watches its ring neighbors for missed heartbeats, takes part in bully elections
//! and serves its share of a replicated object store. All object writes, reads and deletes are
//! mediated by the current coordinator.
//!
//! The crate is split into:
//! - [`core`]: the node itself, message envelopes, transports and the receive loops.
//! - [`cluster`]: membership directory, heartbeat ring, failure detection and election.
//! - [`store`]: replica placement, the coordinator protocol and the file transfer protocol.
//! - [`batch`]: task partitioning for the batch layer that runs on top of the store.
//! - [`testkit`]: logging setup, lossy transports and fast configurations for tests.

pub mod batch;
pub mod cluster;
pub mod core;
pub mod store;
pub mod testkit;

#[rustfmt::skip]
pub use {
  crate::core::Error,
  crate::core::Node,
  crate::core::NodeConfig,
  crate::core::NodeId,
};
