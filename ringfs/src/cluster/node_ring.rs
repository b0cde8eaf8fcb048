use crate::core::NodeId;
use itertools::Itertools;
use smallvec::SmallVec;
use std::iter;

/// The default number of neighbors on each side.
pub const FANOUT: usize = 3;

type Neighbors = SmallVec<[NodeId; FANOUT]>;

/// One node's view of the heartbeat ring.
///
/// Ids are sorted into a ring. A node sends heartbeats to its nearest predecessors (its
/// `targets`) and monitors its nearest successors (its `charges`), up to `fanout` of each. A node
/// therefore monitors exactly the nodes that heartbeat to it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeRing {
  me: NodeId,
  targets: Neighbors,
  charges: Neighbors,
}
impl NodeRing {
  pub fn new<I>(me: NodeId, members: I, fanout: usize) -> NodeRing
  where
    I: IntoIterator<Item = NodeId>,
  {
    let ring = members
      .into_iter()
      .chain(iter::once(me))
      .sorted()
      .dedup()
      .collect_vec();
    let n = ring.len();
    let k = fanout.min(n - 1);
    let pos = ring.iter().position(|id| *id == me).unwrap_or(0);
    NodeRing {
      me: me,
      targets: (1..=k).map(|i| ring[(pos + n - i) % n]).collect(),
      charges: (1..=k).map(|i| ring[(pos + i) % n]).collect(),
    }
  }

  pub fn me(&self) -> NodeId {
    self.me
  }

  /// The nodes this node heartbeats to, nearest first.
  pub fn targets(&self) -> &[NodeId] {
    &self.targets
  }

  /// The nodes this node monitors, nearest first.
  pub fn charges(&self) -> &[NodeId] {
    &self.charges
  }

  pub fn is_charge(&self, id: NodeId) -> bool {
    self.charges.contains(&id)
  }

  pub fn is_target(&self, id: NodeId) -> bool {
    self.targets.contains(&id)
  }
}

#[test]
fn test_node_ring_large() {
  let ids = vec![2, 3, 5, 7, 9, 11];
  for me in ids.iter().copied() {
    let ring = NodeRing::new(me, ids.iter().copied().filter(|x| *x != me), FANOUT);
    assert_eq!(ring.charges().len(), 3);
    assert_eq!(ring.targets().len(), 3);
  }
  let ring = NodeRing::new(3, vec![2, 5, 7, 9, 11], FANOUT);
  assert_eq!(ring.charges(), &[5, 7, 9]);
  assert_eq!(ring.targets(), &[2, 11, 9]);
}

#[test]
fn test_node_ring_symmetry() {
  let ids: Vec<NodeId> = vec![0, 1, 4, 6, 10, 12, 13];
  let rings = ids
    .iter()
    .map(|me| (*me, NodeRing::new(*me, ids.clone(), FANOUT)))
    .collect::<std::collections::BTreeMap<_, _>>();
  for a in &ids {
    for b in &ids {
      assert_eq!(rings[b].is_charge(*a), rings[a].is_target(*b), "a={} b={}", a, b);
    }
  }
}

#[test]
fn test_node_ring_small() {
  let alone = NodeRing::new(4, vec![], FANOUT);
  assert!(alone.targets().is_empty() && alone.charges().is_empty());

  let pair = NodeRing::new(4, vec![1], FANOUT);
  assert_eq!(pair.targets(), &[1]);
  assert_eq!(pair.charges(), &[1]);

  let three = NodeRing::new(4, vec![1, 8], FANOUT);
  assert_eq!(three.targets(), &[1, 8]);
  assert_eq!(three.charges(), &[8, 1]);

  let four = NodeRing::new(4, vec![1, 8, 9], FANOUT);
  assert_eq!(four.charges(), &[8, 9, 1]);
}
