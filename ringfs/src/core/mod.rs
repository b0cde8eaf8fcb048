//! The [`Node`] and the plumbing every other module sends its messages through.
//!
//! A node owns four listeners, all derived from the base port of its [`Socket`]:
//!
//! | [`Channel`] | Offset | Protocol | Carries                                        |
//! |-------------|--------|----------|------------------------------------------------|
//! | `Control`   | +0     | UDP      | small [`Envelope`]s, fire-and-forget           |
//! | `Bulk`      | +1     | TCP      | one large [`Envelope`] per connection          |
//! | `Scratch`   | +2     | TCP      | object bytes bound for the scratch directory   |
//! | `Store`     | +3     | TCP      | object bytes bound for the replicated store    |
//!
//! Every control message is wrapped in an [`Envelope`] with a random unique id. Receivers keep a
//! [`DedupCache`] of recently seen ids and drop anything they have already processed, which is
//! what keeps ring gossip from circulating forever.

mod config;
mod dedup;
mod error;
mod node;
mod packets;
mod remoting;
mod tcp_receiver;
mod transport;
mod udp_receiver;

/// Identifies a node in the cluster. Ids are assigned by the introducer and never reused within a
/// run of the introducer.
pub type NodeId = u64;

/// The id the introducer always runs under.
pub const INTRODUCER: NodeId = 0;

/// Sender id used before the introducer has assigned one.
pub const UNASSIGNED: NodeId = NodeId::MAX;

#[rustfmt::skip]
pub use {
  config::NodeConfig,
  config::Role,
  dedup::DedupCache,
  dedup::RECENT_MESSAGES,
  error::Error,
  node::Node,
  node::NodeInner,
  packets::Envelope,
  packets::EnvelopeError,
  packets::Message,
  packets::MsgType,
  remoting::Channel,
  remoting::Host,
  remoting::ParseSocketError,
  remoting::Socket,
  transport::MAX_DATAGRAM,
  transport::NetTransport,
  transport::Transport,
  transport::TransportError,
};

pub(crate) use transport::{connect, unspecified};
