use crate::core::NodeId;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// The most replicas an object can have.
pub const REPLICAS: usize = 4;

/// Where one object's replicas live.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReplicaRecord {
  pub slots: [Option<NodeId>; REPLICAS],
  /// When the object was last written.
  pub updated: DateTime<Utc>,
}
impl ReplicaRecord {
  pub fn new(updated: DateTime<Utc>) -> ReplicaRecord {
    ReplicaRecord {
      slots: [None; REPLICAS],
      updated: updated,
    }
  }

  pub fn holders(&self) -> impl Iterator<Item = NodeId> + '_ {
    self.slots.iter().flatten().copied()
  }

  pub fn holds(&self, id: NodeId) -> bool {
    self.slots.contains(&Some(id))
  }

  pub fn len(&self) -> usize {
    self.holders().count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn vacate(&mut self, id: NodeId) -> bool {
    match self.slots.iter_mut().find(|s| **s == Some(id)) {
      Some(slot) => {
        *slot = None;
        true
      }
      None => false,
    }
  }

  fn fill(&mut self, id: NodeId) -> bool {
    if self.holds(id) {
      return false;
    }
    match self.slots.iter_mut().find(|s| s.is_none()) {
      Some(slot) => {
        *slot = Some(id);
        true
      }
      None => false,
    }
  }
}

/// The replica table as the coordinator broadcasts it.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReplicaSnapshot {
  pub records: BTreeMap<String, ReplicaRecord>,
  pub loads: BTreeMap<NodeId, usize>,
}

/// One object to copy from a surviving holder to a new one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Repair {
  pub name: String,
  pub source: NodeId,
  pub target: NodeId,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RepairPlan {
  pub moves: Vec<Repair>,
  /// Objects whose only replica was on the failed node. They are gone.
  pub lost: Vec<String>,
}

/// Replica records of every object and the number of replicas assigned to each node.
///
/// Only the coordinator changes this table. Everyone else holds the last broadcast copy.
#[derive(Clone, Debug, Default)]
pub struct ReplicaTable {
  records: BTreeMap<String, ReplicaRecord>,
  loads: HashMap<NodeId, usize>,
}
impl ReplicaTable {
  pub fn new() -> ReplicaTable {
    ReplicaTable::default()
  }

  pub fn register_node(&mut self, id: NodeId) {
    self.loads.entry(id).or_insert(0);
  }

  pub fn load(&self, id: NodeId) -> usize {
    self.loads.get(&id).copied().unwrap_or(0)
  }

  pub fn get(&self, name: &str) -> Option<&ReplicaRecord> {
    self.records.get(name)
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
    self
      .records
      .keys()
      .filter(|name| name.starts_with(prefix))
      .cloned()
      .collect()
  }

  /// Objects this node is supposed to hold.
  pub fn held_by(&self, id: NodeId) -> Vec<String> {
    self
      .records
      .iter()
      .filter(|(_, r)| r.holds(id))
      .map(|(name, _)| name.clone())
      .collect()
  }

  /// Whether `name` was written less than `window` before `now`.
  pub fn written_within(&self, name: &str, now: DateTime<Utc>, window: Duration) -> bool {
    match self.records.get(name) {
      Some(r) => match now.signed_duration_since(r.updated).to_std() {
        Ok(age) => age < window,
        Err(_) => true,
      },
      None => false,
    }
  }

  /// Places a new object: the submitter first, then the least loaded other nodes. The
  /// coordinator is only used when a submitter other than itself leaves too few other choices.
  pub fn place(
    &mut self,
    name: &str,
    submitter: NodeId,
    coordinator: NodeId,
    online: &BTreeSet<NodeId>,
    now: DateTime<Utc>,
  ) -> ReplicaRecord {
    let mut record = ReplicaRecord::new(now);
    record.fill(submitter);
    let others = online
      .iter()
      .copied()
      .filter(|id| *id != submitter)
      .sorted_by_key(|id| (*id == coordinator, self.load(*id), *id))
      .take(REPLICAS - 1)
      .collect_vec();
    for id in others {
      record.fill(id);
    }
    for id in record.holders() {
      *self.loads.entry(id).or_insert(0) += 1;
    }
    self.records.insert(name.to_string(), record.clone());
    record
  }

  /// Drops an object's record and releases its slots.
  pub fn remove(&mut self, name: &str) -> Option<ReplicaRecord> {
    let record = self.records.remove(name)?;
    for id in record.holders() {
      if let Some(load) = self.loads.get_mut(&id) {
        *load = load.saturating_sub(1);
      }
    }
    Some(record)
  }

  /// Clears every slot held by `failed` and picks a replacement from the online nodes that do
  /// not hold the object yet.
  pub fn repair(&mut self, failed: NodeId, online: &BTreeSet<NodeId>) -> RepairPlan {
    let ReplicaTable { records, loads } = self;
    loads.remove(&failed);
    let mut plan = RepairPlan::default();
    for (name, record) in records.iter_mut() {
      if !record.vacate(failed) {
        continue;
      }
      let source = match record.holders().next() {
        Some(source) => source,
        None => {
          plan.lost.push(name.clone());
          continue;
        }
      };
      let replacement = online
        .iter()
        .copied()
        .filter(|id| *id != failed && !record.holds(*id))
        .min_by_key(|id| (loads.get(id).copied().unwrap_or(0), *id));
      if let Some(target) = replacement {
        record.fill(target);
        *loads.entry(target).or_insert(0) += 1;
        plan.moves.push(Repair {
          name: name.clone(),
          source: source,
          target: target,
        });
      }
    }
    for name in &plan.lost {
      records.remove(name);
    }
    plan
  }

  /// Gives `joined` a replica of every under-replicated object, as long as the cluster is small
  /// enough that every node should hold everything.
  pub fn backfill(&mut self, joined: NodeId, online: &BTreeSet<NodeId>) -> Vec<Repair> {
    let mut moves = Vec::new();
    if online.len() > REPLICAS {
      return moves;
    }
    let ReplicaTable { records, loads } = self;
    for (name, record) in records.iter_mut() {
      let source = match record.holders().find(|id| *id != joined) {
        Some(source) => source,
        None => continue,
      };
      if record.fill(joined) {
        *loads.entry(joined).or_insert(0) += 1;
        moves.push(Repair {
          name: name.clone(),
          source: source,
          target: joined,
        });
      }
    }
    moves
  }

  /// Picks the node that should send `name` to `requester`: the requester itself if it has a
  /// copy, otherwise any other holder.
  pub fn read_source(&self, name: &str, requester: NodeId, local_copy: bool) -> Option<NodeId> {
    let record = self.records.get(name)?;
    if local_copy && record.holds(requester) {
      return Some(requester);
    }
    record.holders().find(|id| *id != requester)
  }

  /// Nodes that hold replicas or have a load counter but are not online.
  pub fn departed(&self, online: &BTreeSet<NodeId>) -> Vec<NodeId> {
    self
      .records
      .values()
      .flat_map(|r| r.holders())
      .chain(self.loads.keys().copied())
      .filter(|id| !online.contains(id))
      .sorted()
      .dedup()
      .collect()
  }

  pub fn snapshot(&self) -> ReplicaSnapshot {
    ReplicaSnapshot {
      records: self.records.clone(),
      loads: self.loads.iter().map(|(k, v)| (*k, *v)).collect(),
    }
  }

  pub fn restore(&mut self, snapshot: ReplicaSnapshot) {
    self.records = snapshot.records;
    self.loads = snapshot.loads.into_iter().collect();
  }
}

#[cfg(test)]
use maplit::btreeset;

#[cfg(test)]
fn now() -> DateTime<Utc> {
  Utc::now()
}

#[test]
fn test_place_prefers_least_loaded() {
  let mut table = ReplicaTable::new();
  let online = btreeset! {0, 1, 2, 3, 4, 5};
  let first = table.place("a", 2, 0, &online, now());
  assert_eq!(first.holders().collect_vec(), vec![2, 1, 3, 4]);
  let second = table.place("b", 3, 0, &online, now());
  assert_eq!(second.holders().collect_vec(), vec![3, 5, 1, 4]);
  assert_eq!(table.load(1), 2);
  assert_eq!(table.load(5), 1);
  assert_eq!(table.load(0), 0);
}

#[test]
fn test_place_falls_back_to_coordinator() {
  let mut table = ReplicaTable::new();
  let online = btreeset! {0, 1, 2, 3};
  let record = table.place("f", 2, 0, &online, now());
  assert_eq!(record.holders().collect_vec(), vec![2, 1, 3, 0]);

  let pair = btreeset! {0, 2};
  let record = table.place("g", 2, 0, &pair, now());
  assert_eq!(record.holders().collect_vec(), vec![2, 0]);

  let record = table.place("h", 0, 0, &online, now());
  assert_eq!(record.len(), 4);
  assert_eq!(record.slots[0], Some(0));
}

#[test]
fn test_repair_reassigns_failed_slot() {
  let mut table = ReplicaTable::new();
  let online = btreeset! {0, 1, 2, 3, 4};
  let record = table.place("f", 2, 0, &online, now());
  assert_eq!(record.holders().collect_vec(), vec![2, 1, 3, 4]);

  let online = btreeset! {0, 2, 3, 4};
  let plan = table.repair(1, &online);
  assert_eq!(
    plan.moves,
    vec![Repair {
      name: "f".to_string(),
      source: 2,
      target: 0
    }]
  );
  assert!(plan.lost.is_empty());
  let record = table.get("f").unwrap();
  assert_eq!(record.holders().sorted().collect_vec(), vec![0, 2, 3, 4]);
  assert_eq!(table.load(1), 0);
  assert_eq!(table.load(0), 1);
}

#[test]
fn test_repair_reports_lost_objects() {
  let mut table = ReplicaTable::new();
  table.place("solo", 7, 7, &btreeset! {7}, now());
  let plan = table.repair(7, &btreeset! {8});
  assert_eq!(plan.lost, vec!["solo".to_string()]);
  assert!(table.get("solo").is_none());
}

#[test]
fn test_backfill_only_small_clusters() {
  let mut table = ReplicaTable::new();
  table.place("f", 0, 0, &btreeset! {0, 1}, now());
  let moves = table.backfill(2, &btreeset! {0, 1, 2});
  assert_eq!(moves.len(), 1);
  assert_eq!(moves[0].target, 2);
  assert_eq!(table.get("f").unwrap().len(), 3);
  // Nothing to do twice.
  assert!(table.backfill(2, &btreeset! {0, 1, 2}).is_empty());
  assert!(table.backfill(9, &btreeset! {0, 1, 2, 3, 9}).is_empty());
}

#[test]
fn test_read_source_preference() {
  let mut table = ReplicaTable::new();
  table.place("f", 1, 0, &btreeset! {0, 1, 2}, now());
  assert_eq!(table.read_source("f", 1, true), Some(1));
  assert_eq!(table.read_source("f", 1, false), Some(2));
  assert_eq!(table.read_source("f", 5, false), Some(1));
  assert_eq!(table.read_source("missing", 1, true), None);
}

#[test]
fn test_remove_and_written_within() {
  let mut table = ReplicaTable::new();
  let then = now() - chrono::Duration::seconds(90);
  table.place("old", 1, 0, &btreeset! {0, 1}, then);
  table.place("new", 1, 0, &btreeset! {0, 1}, now());
  let window = Duration::from_secs(60);
  assert!(!table.written_within("old", now(), window));
  assert!(table.written_within("new", now(), window));
  assert!(!table.written_within("none", now(), window));
  assert_eq!(table.load(1), 2);
  assert!(table.remove("old").is_some());
  assert_eq!(table.load(1), 1);
  assert!(table.remove("old").is_none());
}

#[test]
fn test_replica_invariant_under_churn() {
  use rand::rngs::SmallRng;
  use rand::{Rng, SeedableRng};

  let mut rng = SmallRng::seed_from_u64(425);
  let mut table = ReplicaTable::new();
  let coordinator: NodeId = 0;
  let mut online = btreeset! {0, 1, 2};
  let mut next_id: NodeId = 3;
  let mut names = Vec::new();

  for step in 0..500 {
    match rng.gen_range(0..10) {
      0..=3 => {
        let submitter = *online.iter().nth(rng.gen_range(0..online.len())).unwrap();
        let name = format!("obj-{}", step);
        table.place(&name, submitter, coordinator, &online, now());
        names.push(name);
      }
      4..=5 if !names.is_empty() => {
        let name = names.swap_remove(rng.gen_range(0..names.len()));
        table.remove(&name);
      }
      6..=7 if online.len() > 1 => {
        let victims = online.iter().copied().filter(|id| *id != coordinator).collect_vec();
        let victim = victims[rng.gen_range(0..victims.len())];
        online.remove(&victim);
        let plan = table.repair(victim, &online);
        assert!(plan.lost.is_empty());
      }
      _ => {
        online.insert(next_id);
        table.register_node(next_id);
        table.backfill(next_id, &online);
        next_id += 1;
      }
    }

    let mut counts = HashMap::<NodeId, usize>::new();
    for (name, record) in table.snapshot().records {
      let holders = record.holders().collect_vec();
      assert_eq!(holders.len(), REPLICAS.min(online.len()), "{} at step {}", name, step);
      assert_eq!(holders.iter().unique().count(), holders.len());
      assert!(holders.iter().all(|id| online.contains(id)));
      for id in holders {
        *counts.entry(id).or_insert(0) += 1;
      }
    }
    for id in &online {
      assert_eq!(table.load(*id), counts.get(id).copied().unwrap_or(0));
    }
  }
}
