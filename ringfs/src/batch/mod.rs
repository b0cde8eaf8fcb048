//! Task scheduling for batch jobs over stored objects.
//!
//! The batch layer itself runs outside this crate. It uses a [`TaskBoard`] on the coordinator to
//! split the input objects of a job into tasks and hand them out, one task per node at a time.
//! Assignments travel as `TASK` payloads and come back as `TASKDONE` payloads; both show up as
//! [`ClusterEvent::Task`] on the receiving node. Work held by a node that fails or leaves goes
//! back to the queue.

use crate::cluster::ClusterEvent;
use crate::core::{Node, NodeId, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tracing::{debug, info, warn};
use wyhash::WyHash;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum JobKind {
  Map,
  Reduce,
}

/// How input objects are split between tasks.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Partition {
  /// By a hash of the object name.
  Hash,
  /// Sorted by name and cut into contiguous runs.
  Range,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
  #[error("a job needs at least one task")]
  NoTasks,
  #[error("malformed task payload: {0}")]
  Payload(String),
}

/// One task handed to one node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Assignment {
  pub node: NodeId,
  pub task: usize,
  pub kind: JobKind,
  pub inputs: Vec<String>,
}
impl Assignment {
  pub fn to_payload(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }

  pub fn from_payload(payload: &str) -> Result<Assignment, BatchError> {
    serde_json::from_str(payload).map_err(|e| BatchError::Payload(e.to_string()))
  }
}

fn name_hash(name: &str) -> u64 {
  let mut hasher = WyHash::with_seed(0);
  name.hash(&mut hasher);
  hasher.finish()
}

fn partition(mut inputs: Vec<String>, count: usize, how: Partition) -> Vec<Vec<String>> {
  let mut tasks = vec![Vec::new(); count];
  inputs.sort();
  inputs.dedup();
  match how {
    Partition::Hash => {
      for name in inputs {
        tasks[(name_hash(&name) % count as u64) as usize].push(name);
      }
    }
    Partition::Range => {
      let per_task = inputs.len() / count + 1;
      for (i, name) in inputs.into_iter().enumerate() {
        tasks[i / per_task].push(name);
      }
    }
  }
  tasks
}

/// Tracks which node runs which task of one job.
#[derive(Clone, Debug)]
pub struct TaskBoard {
  kind: JobKind,
  inputs: Vec<Vec<String>>,
  queue: VecDeque<usize>,
  running: BTreeMap<NodeId, Option<usize>>,
  done: Vec<bool>,
}
impl TaskBoard {
  /// Splits `inputs` into `count` tasks. Tasks that get no input are finished from the start.
  pub fn new(
    kind: JobKind,
    inputs: Vec<String>,
    count: usize,
    how: Partition,
  ) -> Result<TaskBoard, BatchError> {
    if count == 0 {
      return Err(BatchError::NoTasks);
    }
    let inputs = partition(inputs, count, how);
    let done = inputs.iter().map(|i| i.is_empty()).collect::<Vec<_>>();
    let queue = (0..count).filter(|t| !done[*t]).collect();
    Ok(TaskBoard {
      kind: kind,
      inputs: inputs,
      queue: queue,
      running: BTreeMap::new(),
      done: done,
    })
  }

  pub fn kind(&self) -> JobKind {
    self.kind
  }

  pub fn inputs(&self, task: usize) -> &[String] {
    self.inputs.get(task).map(|i| i.as_slice()).unwrap_or(&[])
  }

  pub fn running(&self, node: NodeId) -> Option<usize> {
    self.running.get(&node).copied().flatten()
  }

  pub fn queued(&self) -> usize {
    self.queue.len()
  }

  /// Returns the task of a departed node to the front of the queue.
  pub fn release(&mut self, node: NodeId) -> Option<usize> {
    let task = self.running.remove(&node).flatten()?;
    self.queue.push_front(task);
    Some(task)
  }

  /// Releases the work of nodes that are no longer online and gives queued tasks to idle online
  /// nodes in id order. Returns the new assignments.
  pub fn arrange(&mut self, online: &BTreeSet<NodeId>) -> Vec<Assignment> {
    let departed: Vec<NodeId> = self
      .running
      .keys()
      .filter(|id| !online.contains(id))
      .copied()
      .collect();
    for id in departed {
      self.release(id);
    }
    let mut assigned = Vec::new();
    for id in online {
      let slot = self.running.entry(*id).or_insert(None);
      if slot.is_some() {
        continue;
      }
      let task = match self.queue.pop_front() {
        Some(task) => task,
        None => break,
      };
      *slot = Some(task);
      assigned.push(Assignment {
        node: *id,
        task: task,
        kind: self.kind,
        inputs: self.inputs[task].clone(),
      });
    }
    assigned
  }

  /// Marks `task` finished by `node`. A report for a task the node no longer holds is ignored.
  pub fn complete(&mut self, node: NodeId, task: usize) -> bool {
    match self.running.get_mut(&node) {
      Some(slot) if *slot == Some(task) => {
        *slot = None;
        self.done[task] = true;
        true
      }
      _ => false,
    }
  }

  pub fn is_complete(&self) -> bool {
    self.queue.is_empty()
      && self.running.values().all(|t| t.is_none())
      && self.done.iter().all(|d| *d)
  }

  /// Applies a node event: completions from `TASKDONE` payloads and departures. Returns whether
  /// the board changed.
  pub fn observe(&mut self, event: &ClusterEvent) -> bool {
    match event {
      ClusterEvent::Failed(id) | ClusterEvent::Left(id) => self.release(*id).is_some(),
      ClusterEvent::Task {
        from,
        done: true,
        payload,
      } => match Assignment::from_payload(payload) {
        Ok(a) => self.complete(*from, a.task),
        Err(e) => {
          warn!(peer = from, "ignoring task report: {}", e);
          false
        }
      },
      _ => false,
    }
  }
}

impl Node {
  /// Hands queued tasks of `board` to idle online nodes. Returns the assignments sent.
  pub async fn dispatch_tasks(&self, board: &mut TaskBoard) -> Vec<Assignment> {
    let assigned = board.arrange(&self.online_node_ids());
    let mut sent = Vec::with_capacity(assigned.len());
    for a in assigned {
      match self.send_task(a.node, a.to_payload(), false).await {
        Ok(()) => {
          debug!(node = self.id(), peer = a.node, task = a.task, "task dispatched");
          sent.push(a);
        }
        Err(e) => {
          warn!(node = self.id(), peer = a.node, task = a.task, "task not sent: {}", e);
          board.release(a.node);
        }
      }
    }
    if board.is_complete() {
      info!(node = self.id(), kind = ?board.kind(), "job complete");
    }
    sent
  }

  /// Reports a finished assignment back to the node that handed it out.
  pub async fn finish_task(
    &self,
    to: NodeId,
    assignment: &Assignment,
  ) -> Result<(), TransportError> {
    self.send_task(to, assignment.to_payload(), true).await
  }
}

#[cfg(test)]
use maplit::btreeset;

#[cfg(test)]
fn names(n: usize) -> Vec<String> {
  (0..n).map(|i| format!("part-{:03}", i)).collect()
}

#[test]
fn test_hash_partition_covers_inputs_once() {
  let board = TaskBoard::new(JobKind::Map, names(40), 6, Partition::Hash).unwrap();
  let mut all: Vec<String> = (0..6).flat_map(|t| board.inputs(t).to_vec()).collect();
  all.sort();
  assert_eq!(all, names(40));
  let none = TaskBoard::new(JobKind::Map, names(3), 0, Partition::Hash);
  assert_eq!(none.err(), Some(BatchError::NoTasks));
}

#[test]
fn test_range_partition_is_contiguous() {
  let board = TaskBoard::new(JobKind::Reduce, names(10), 3, Partition::Range).unwrap();
  assert_eq!(board.inputs(0), &names(10)[0..4]);
  assert_eq!(board.inputs(1), &names(10)[4..8]);
  assert_eq!(board.inputs(2), &names(10)[8..10]);
}

#[test]
fn test_empty_tasks_start_done() {
  let mut board = TaskBoard::new(JobKind::Map, names(1), 3, Partition::Range).unwrap();
  assert_eq!(board.queued(), 1);
  let assigned = board.arrange(&btreeset! {1, 2});
  assert_eq!(assigned.len(), 1);
  assert!(board.complete(1, 0));
  assert!(board.is_complete());
}

#[test]
fn test_arrange_and_rebalance() {
  let mut board = TaskBoard::new(JobKind::Map, names(9), 3, Partition::Range).unwrap();
  let first = board.arrange(&btreeset! {0, 4});
  let pairs = |a: &[Assignment]| a.iter().map(|a| (a.node, a.task)).collect::<Vec<_>>();
  assert_eq!(pairs(&first), vec![(0, 0), (4, 1)]);
  assert_eq!(board.queued(), 1);

  // Node 4 fails and a new node joins.
  let second = board.arrange(&btreeset! {0, 7});
  assert_eq!(pairs(&second), vec![(7, 1)]);
  assert!(!board.complete(4, 1));

  assert!(board.complete(0, 0));
  let third = board.arrange(&btreeset! {0, 7});
  assert_eq!(pairs(&third), vec![(0, 2)]);
  assert!(board.complete(7, 1));
  assert!(!board.is_complete());
  assert!(board.complete(0, 2));
  assert!(board.is_complete());
}

#[test]
fn test_observe_events() {
  let mut board = TaskBoard::new(JobKind::Reduce, names(4), 2, Partition::Range).unwrap();
  let assigned = board.arrange(&btreeset! {1, 2});
  assert!(board.observe(&ClusterEvent::Failed(2)));
  assert_eq!(board.running(2), None);
  assert_eq!(board.queued(), 1);

  let report = ClusterEvent::Task {
    from: 1,
    done: true,
    payload: assigned[0].to_payload(),
  };
  assert!(board.observe(&report));
  assert!(!board.observe(&report));
  assert!(!board.observe(&ClusterEvent::Added(9)));
}
