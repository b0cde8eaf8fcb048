use crate::cluster::{ClusterEvent, ElectionConfig};
use crate::core::{Message, Node, NodeId};
use itertools::Itertools;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
  Idle,
  Electing,
  WaitingForOk,
  WaitingForCoordinator,
}

/// Running counts of election replies. Waiters compare against the counts they started with, so
/// one announcement releases every waiter at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
  pub oks: u64,
  pub announcements: u64,
}

struct State {
  phase: Phase,
  generation: u64,
}

/// Bully election state of one node.
///
/// At most one election runs at a time. Each election gets a ticket; an announcement ends the
/// election by returning to [`Phase::Idle`] and bumping the generation, which makes every
/// outstanding ticket stale.
pub struct Election {
  state: Mutex<State>,
  tally: watch::Sender<Tally>,
}
impl Election {
  pub fn new() -> Election {
    let (tally, _) = watch::channel(Tally::default());
    Election {
      state: Mutex::new(State {
        phase: Phase::Idle,
        generation: 0,
      }),
      tally: tally,
    }
  }

  pub fn phase(&self) -> Phase {
    self.state.lock().phase
  }

  pub fn in_progress(&self) -> bool {
    self.phase() != Phase::Idle
  }

  /// Starts an election unless one is already running.
  pub fn begin(&self) -> Option<u64> {
    let mut state = self.state.lock();
    if state.phase != Phase::Idle {
      return None;
    }
    state.generation += 1;
    state.phase = Phase::Electing;
    Some(state.generation)
  }

  /// Moves the election holding `ticket` to `phase`. Returns `false` if it was superseded.
  pub fn enter(&self, ticket: u64, phase: Phase) -> bool {
    let mut state = self.state.lock();
    if state.generation != ticket || state.phase == Phase::Idle {
      return false;
    }
    state.phase = phase;
    true
  }

  /// Ends the election holding `ticket`. Returns `false` if it was superseded.
  pub fn conclude(&self, ticket: u64) -> bool {
    let mut state = self.state.lock();
    if state.generation != ticket || state.phase == Phase::Idle {
      return false;
    }
    state.phase = Phase::Idle;
    true
  }

  pub fn ok_received(&self) {
    self.tally.send_modify(|t| t.oks += 1);
  }

  /// Cancels any running election and releases everything waiting on it.
  pub fn announcement_received(&self) {
    {
      let mut state = self.state.lock();
      state.phase = Phase::Idle;
      state.generation += 1;
    }
    self.tally.send_modify(|t| t.announcements += 1);
  }

  pub fn watch(&self) -> watch::Receiver<Tally> {
    self.tally.subscribe()
  }
}
impl Default for Election {
  fn default() -> Self {
    Election::new()
  }
}

/// Waits until `done` holds for the tally or `limit` passes.
async fn await_tally<F>(rx: &mut watch::Receiver<Tally>, limit: Duration, done: F) -> Option<Tally>
where
  F: Fn(&Tally) -> bool,
{
  let wait = async {
    loop {
      let tally = *rx.borrow();
      if done(&tally) {
        return Some(tally);
      }
      if rx.changed().await.is_err() {
        return None;
      }
    }
  };
  timeout(limit, wait).await.ok().flatten()
}

impl Node {
  pub(crate) fn spawn_election(&self, failed: Option<NodeId>) {
    let node = self.clone();
    tokio::spawn(async move { node.run_election(failed).await });
  }

  /// Runs the bully election to replace `failed`, the coordinator this node last knew, or an
  /// unknown coordinator when `failed` is `None`.
  pub(crate) async fn run_election(&self, failed: Option<NodeId>) {
    if failed.is_some() && failed != self.coordinator_id() {
      debug!(node = self.id(), ?failed, "coordinator already replaced");
      return;
    }
    let ticket = match self.election.begin() {
      Some(ticket) => ticket,
      None => return,
    };
    info!(node = self.id(), ?failed, "starting election");
    let config: &ElectionConfig = &self.config.election;
    let mut rx = self.election.watch();
    for round in 1..=config.max_rounds {
      if !self.election.enter(ticket, Phase::Electing) {
        return;
      }
      let base = *rx.borrow();
      let me = self.id();
      let higher = self
        .directory
        .peers()
        .into_iter()
        .filter(|id| *id > me && Some(*id) != failed)
        .collect_vec();
      if higher.is_empty() {
        self.become_coordinator(ticket, failed).await;
        return;
      }
      for id in &higher {
        if let Err(e) = self.send_to(*id, Message::Election(failed)).await {
          debug!(node = me, peer = id, "election message not sent: {}", e);
        }
      }
      if !self.election.enter(ticket, Phase::WaitingForOk) {
        return;
      }
      let answered = await_tally(&mut rx, config.ok_timeout, |t| {
        t.oks > base.oks || t.announcements > base.announcements
      })
      .await;
      match answered {
        None => {
          self.become_coordinator(ticket, failed).await;
          return;
        }
        Some(t) if t.announcements > base.announcements => return,
        Some(_) => {}
      }
      if !self.election.enter(ticket, Phase::WaitingForCoordinator) {
        return;
      }
      let announced = await_tally(&mut rx, config.coordinator_timeout, |t| {
        t.announcements > base.announcements
      })
      .await;
      if announced.is_some() {
        return;
      }
      warn!(node = me, round, "no coordinator announced, restarting election");
      sleep(config.backoff * round).await;
    }
    warn!(node = self.id(), "election rounds exhausted, taking over");
    self.become_coordinator(ticket, failed).await;
  }

  async fn become_coordinator(&self, ticket: u64, failed: Option<NodeId>) {
    if !self.election.conclude(ticket) {
      return;
    }
    let me = self.id();
    self.leader.store(Some(me));
    self.coordinator.store(true);
    info!(node = me, ?failed, "became coordinator");
    self.publish(ClusterEvent::Coordinator(me));
    self.take_over_replicas(failed).await;
    for id in self.directory.peers() {
      if let Err(e) = self.send_to(id, Message::Coordinator).await {
        warn!(node = me, peer = id, "announcement not sent: {}", e);
      }
    }
  }

  /// Handles an election message from a lower node.
  pub(crate) async fn answer_election(&self, from: NodeId, failed: Option<NodeId>) {
    if let Err(e) = self.send_to(from, Message::Ok).await {
      debug!(node = self.id(), peer = from, "OK not sent: {}", e);
    }
    if self.is_coordinator() {
      if let Err(e) = self.send_to(from, Message::Coordinator).await {
        debug!(node = self.id(), peer = from, "announcement not sent: {}", e);
      }
    } else {
      self.spawn_election(failed);
    }
  }

  pub(crate) fn adopt_coordinator(&self, id: NodeId) {
    let me = self.id();
    self.leader.store(Some(id));
    self.coordinator.store(id == me);
    self.election.announcement_received();
    info!(node = me, coordinator = id, "coordinator adopted");
    self.publish(ClusterEvent::Coordinator(id));
  }
}

#[test]
fn test_election_single_flight() {
  let election = Election::new();
  let ticket = election.begin().unwrap();
  assert_eq!(election.begin(), None);
  assert!(election.enter(ticket, Phase::WaitingForOk));
  assert_eq!(election.phase(), Phase::WaitingForOk);
  assert!(election.conclude(ticket));
  assert!(!election.in_progress());
  assert!(election.begin().is_some());
}

#[test]
fn test_announcement_supersedes_ticket() {
  let election = Election::new();
  let stale = election.begin().unwrap();
  election.announcement_received();
  assert_eq!(election.phase(), Phase::Idle);
  assert!(!election.enter(stale, Phase::WaitingForCoordinator));

  let fresh = election.begin().unwrap();
  assert_ne!(fresh, stale);
  assert!(!election.conclude(stale));
  assert!(election.in_progress());
  assert!(election.conclude(fresh));
}

#[tokio::test]
async fn test_announcement_releases_waiters() {
  let election = std::sync::Arc::new(Election::new());
  let mut waiters = Vec::new();
  for _ in 0..3 {
    let mut rx = election.watch();
    let base = *rx.borrow();
    waiters.push(tokio::spawn(async move {
      await_tally(&mut rx, Duration::from_secs(5), |t| {
        t.announcements > base.announcements
      })
      .await
    }));
  }
  election.ok_received();
  election.announcement_received();
  for w in waiters {
    let tally = w.await.unwrap().unwrap();
    assert_eq!(tally.announcements, 1);
  }
}
