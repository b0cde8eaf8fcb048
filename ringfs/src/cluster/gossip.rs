use crate::cluster::{ClusterEvent, Member, MemberMap, NodeRing};
use crate::core::{Envelope, Message, Node, NodeId, INTRODUCER};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a node left the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Departure {
  Failed,
  Left,
}

impl Node {
  /// Sends an envelope around the ring: to every heartbeat target except `exclude`.
  ///
  /// Failure, leave and directory-update messages travel this way. Each receiver forwards to its
  /// own targets unless the message id is already in its dedup cache.
  pub(crate) async fn disseminate(&self, env: &Envelope, exclude: Option<NodeId>) {
    let targets = self.heartbeat_targets();
    for target in targets.into_iter().filter(|t| Some(*t) != exclude) {
      let member = match self.directory.get(target) {
        Some(m) => m,
        None => continue,
      };
      if let Err(e) = self.transport.datagram(&member.socket, env).await {
        warn!(node = self.id(), peer = target, "could not forward {}: {}", env.kind(), e);
      }
    }
  }

  /// Recomputes the heartbeat ring from the directory and moves the monitor to the new charges.
  pub(crate) fn retopologize(&self) {
    let ring = NodeRing::new(self.id(), self.directory.peers(), self.config.cluster.fanout);
    self.monitor.retarget(ring.charges(), Instant::now());
    debug!(
      node = self.id(),
      targets = ?ring.targets(),
      charges = ?ring.charges(),
      "ring recomputed"
    );
    *self.ring.write() = ring;
  }

  pub(crate) async fn persist_directory(&self) {
    if let Err(e) = self.directory.persist().await {
      error!(node = self.id(), "could not write directory snapshot: {}", e);
    }
  }

  /// Handles a locally detected failure.
  pub(crate) async fn declare_failed(&self, id: NodeId) {
    warn!(node = self.id(), peer = id, "heartbeats stopped, declaring failure");
    if !self.drop_member(id, Departure::Failed).await {
      self.monitor.forget(id);
      return;
    }
    let env = self.envelope(Message::Fail(id));
    self.disseminate(&env, None).await;
    if self.coordinator_id() == Some(id) {
      self.spawn_election(Some(id));
    }
  }

  /// Removes a departed node and runs everything that depends on membership. Returns `false` if
  /// the node was not in the directory.
  pub(crate) async fn drop_member(&self, id: NodeId, why: Departure) -> bool {
    if id == self.id() {
      warn!(node = self.id(), "a peer reported this node as {:?}", why);
      return false;
    }
    let member = match self.directory.remove(id) {
      Some(m) => m,
      None => return false,
    };
    info!(node = self.id(), peer = %member, "member removed ({:?})", why);
    self.retopologize();
    self.persist_directory().await;
    let event = match why {
      Departure::Failed => ClusterEvent::Failed(id),
      Departure::Left => ClusterEvent::Left(id),
    };
    self.publish(event);
    if self.is_coordinator() {
      self.repair_after(id).await;
    }
    true
  }

  /// Merges directory entries received from a peer. Departed ids are skipped, except for a
  /// restarted introducer announcing itself.
  pub(crate) async fn merge_members(&self, from: NodeId, entries: MemberMap) {
    let mut added = Vec::new();
    for (id, endpoint) in entries {
      let member = Member::new(id, endpoint);
      let inserted = if id == INTRODUCER && from == INTRODUCER {
        self.directory.rejoin(member)
      } else {
        self.directory.insert(member)
      };
      if inserted {
        added.push(id);
      } else if self.directory.has_departed(id) {
        debug!(node = self.id(), peer = id, "ignoring departed member");
      }
    }
    if added.is_empty() {
      return;
    }
    info!(node = self.id(), added = ?added, "members added");
    self.retopologize();
    self.persist_directory().await;
    for id in added {
      self.publish(ClusterEvent::Added(id));
      if self.is_coordinator() {
        self.welcome(id).await;
      }
    }
  }

  /// Announces this node's departure to the nodes monitoring it, hands off the coordinator role
  /// and stops every task.
  pub async fn leave(&self) {
    let targets = self.heartbeat_targets();
    info!(node = self.id(), targets = ?targets, "leaving the cluster");
    let env = self.envelope(Message::Leave(self.id()));
    self.disseminate(&env, None).await;
    if self.is_coordinator() {
      if let Some(heir) = targets.last() {
        if let Err(e) = self.send_to(*heir, Message::NewElection).await {
          warn!(node = self.id(), peer = heir, "could not hand off coordination: {}", e);
        }
      }
    }
    if let Err(e) = self.store.wipe().await {
      warn!(node = self.id(), "could not clear the store: {}", e);
    }
    self.shutdown();
  }
}
