use crate::core::{Message, Node, NodeId};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// What the monitor knows about one of its charges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Liveness {
  /// The newest heartbeat timestamp the charge has sent, if any.
  pub claimed: Option<DateTime<Utc>>,
  /// When the newest heartbeat arrived, or when monitoring started.
  pub received: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Beat {
  Accepted,
  /// Older than a heartbeat already recorded.
  Stale,
  /// From a node this node does not monitor.
  Unmonitored,
}

/// Heartbeat state for the nodes this node monitors.
#[derive(Default)]
pub struct Monitor {
  table: Mutex<HashMap<NodeId, Liveness>>,
}
impl Monitor {
  /// Replaces the monitor set. Charges that stay keep their state; new charges start their clock
  /// at `now`.
  pub fn retarget(&self, charges: &[NodeId], now: Instant) {
    let mut table = self.table.lock();
    table.retain(|id, _| charges.contains(id));
    for id in charges {
      table.entry(*id).or_insert(Liveness {
        claimed: None,
        received: now,
      });
    }
  }

  pub fn record(&self, from: NodeId, claimed: DateTime<Utc>, now: Instant) -> Beat {
    let mut table = self.table.lock();
    match table.get_mut(&from) {
      None => Beat::Unmonitored,
      Some(l) if l.claimed.map_or(false, |c| claimed < c) => Beat::Stale,
      Some(l) => {
        l.claimed = Some(claimed);
        l.received = now;
        Beat::Accepted
      }
    }
  }

  /// Charges that have been silent for longer than `timeout`.
  pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<NodeId> {
    let table = self.table.lock();
    let mut ids: Vec<_> = table
      .iter()
      .filter(|(_, l)| now.saturating_duration_since(l.received) > timeout)
      .map(|(id, _)| *id)
      .collect();
    ids.sort_unstable();
    ids
  }

  pub fn forget(&self, id: NodeId) {
    self.table.lock().remove(&id);
  }

  pub fn get(&self, id: NodeId) -> Option<Liveness> {
    self.table.lock().get(&id).copied()
  }

  pub fn monitored(&self) -> Vec<NodeId> {
    let mut ids: Vec<_> = self.table.lock().keys().copied().collect();
    ids.sort_unstable();
    ids
  }
}

impl Node {
  pub(crate) async fn heartbeat_sender(self) {
    let mut ticks = interval(self.config.cluster.heartbeat_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
      ticks.tick().await;
      let targets = self.heartbeat_targets();
      for target in targets {
        if let Err(e) = self.send_to(target, Message::Heartbeat).await {
          trace!(node = self.id(), peer = target, "heartbeat not sent: {}", e);
        }
      }
    }
  }

  pub(crate) async fn failure_detector(self) {
    let timeout = self.config.cluster.failure_timeout;
    let mut ticks = interval(self.config.cluster.detect_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
      ticks.tick().await;
      for id in self.monitor.expired(Instant::now(), timeout) {
        self.declare_failed(id).await;
      }
    }
  }

  pub(crate) fn receive_heartbeat(&self, from: NodeId, claimed: DateTime<Utc>) {
    match self.monitor.record(from, claimed, Instant::now()) {
      Beat::Accepted => {}
      Beat::Stale => debug!(node = self.id(), peer = from, "stale heartbeat dropped"),
      Beat::Unmonitored => trace!(node = self.id(), peer = from, "heartbeat from non-charge"),
    }
  }
}

#[cfg(test)]
use chrono::Duration as ChronoDuration;

#[test]
fn test_monitor_rejects_stale_heartbeats() {
  let monitor = Monitor::default();
  let start = Instant::now();
  monitor.retarget(&[1, 2], start);
  let t0 = Utc::now();
  let later = start + Duration::from_millis(50);
  assert_eq!(monitor.record(1, t0, later), Beat::Accepted);
  assert_eq!(
    monitor.record(1, t0 - ChronoDuration::milliseconds(5), later + Duration::from_millis(10)),
    Beat::Stale
  );
  assert_eq!(monitor.get(1).unwrap().received, later);
  assert_eq!(monitor.record(1, t0, later), Beat::Accepted);
  assert_eq!(monitor.record(7, t0, later), Beat::Unmonitored);
}

#[test]
fn test_monitor_expiry_and_retarget() {
  let monitor = Monitor::default();
  let start = Instant::now();
  monitor.retarget(&[1, 2, 3], start);
  monitor.record(2, Utc::now(), start + Duration::from_millis(1500));
  let now = start + Duration::from_millis(2100);
  assert_eq!(monitor.expired(now, Duration::from_secs(2)), vec![1, 3]);

  // Node 2 stays and keeps its clock, node 4 starts fresh.
  monitor.retarget(&[2, 4], now);
  assert_eq!(monitor.monitored(), vec![2, 4]);
  assert_eq!(monitor.get(2).unwrap().received, start + Duration::from_millis(1500));
  let much_later = start + Duration::from_millis(3600);
  assert_eq!(monitor.expired(much_later, Duration::from_secs(2)), vec![2]);

  monitor.forget(2);
  assert_eq!(monitor.monitored(), vec![4]);
}
