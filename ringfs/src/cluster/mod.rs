//! Membership, failure detection and leader election.
//!
//! # Membership
//! Node 0 is the introducer. A starting node sends it a `JOINREQ` and gets back its id, the
//! coordinator and the whole [`Directory`]. The introducer then gossips the new entry around the
//! ring with `UPDATELIST` and rewrites its snapshot file. Ids are handed out in increasing order
//! and never reused. If the introducer cannot be reached, the joining node gives up.
//!
//! The introducer keeps the directory on disk as a JSON map from id to `"host\naddress"`. When it
//! restarts with a snapshot, it re-contacts every node in it, drops the ones that do not answer,
//! and runs an election for an unknown coordinator if anyone survived.
//!
//! # Heartbeat ring
//! Sorted by id, the nodes form a ring ([`NodeRing`]). Each node heartbeats its 3 nearest
//! predecessors and monitors its 3 nearest successors, fewer when the cluster is small. The ring
//! is recomputed whenever the directory changes. A [`Monitor`] entry only moves forward in time,
//! so a delayed heartbeat cannot revive a stale entry.
//!
//! A charge that stays silent longer than
//! [`ClusterConfig.failure_timeout`](ClusterConfig#structfield.failure_timeout) is declared
//! failed. The detecting node removes it, recomputes its ring, sends `FAIL` to its heartbeat
//! targets and, if the failed node was the coordinator, starts an election. `FAIL`, `LEAVE` and
//! `UPDATELIST` are forwarded by every receiver to its own targets, minus the sender, unless the
//! receiver has already seen the message id.
//!
//! # Election
//! A bully election: the elector sends `ELECTION` to every higher id and waits for an `OK`. No
//! answer means it is the highest live node and it announces itself with `COORDINATOR`. An `OK`
//! means it waits for a higher node's announcement, and starts another round if none comes.
//! Receiving `COORDINATOR` always wins: the sender is adopted and any running election on the
//! receiver is cancelled. See [`Election`].

mod bootstrap;
mod directory;
mod election;
mod gossip;
mod heartbeat;
mod node_ring;
mod utils;

#[rustfmt::skip]
pub use {
  bootstrap::Bootstrap,
  bootstrap::introduce,
  bootstrap::join,
  bootstrap::JoinError,
  directory::Directory,
  directory::SnapshotError,
  election::Election,
  election::Phase,
  election::Tally,
  gossip::Departure,
  heartbeat::Beat,
  heartbeat::Liveness,
  heartbeat::Monitor,
  node_ring::FANOUT,
  node_ring::NodeRing,
  utils::ClusterConfig,
  utils::ClusterEvent,
  utils::ElectionConfig,
  utils::Endpoint,
  utils::JoinAck,
  utils::Member,
  utils::MemberMap,
};
