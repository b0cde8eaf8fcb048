use crate::cluster::{Endpoint, Member, MemberMap};
use crate::core::NodeId;
use hashbrown::HashSet;
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum SnapshotError {
  #[error("snapshot {path}: {source}")]
  Io { path: PathBuf, source: io::Error },
  #[error("snapshot {path} is corrupt: {source}")]
  Corrupt {
    path: PathBuf,
    source: serde_json::Error,
  },
}

/// The local view of cluster membership.
///
/// The local node is tracked separately and never appears among the members. Readers get cheap
/// copies of the member map; writers hold the lock only for the update itself.
///
/// Ids are never reused, so a removed id stays out for good. Late or repeated directory updates
/// naming it are ignored.
pub struct Directory {
  me: Arc<Member>,
  members: RwLock<OrdMap<NodeId, Arc<Member>>>,
  departed: Mutex<HashSet<NodeId>>,
  next_id: Mutex<NodeId>,
  snapshot: Option<PathBuf>,
  persisting: tokio::sync::Mutex<()>,
}
impl Directory {
  /// `snapshot` is set only on the introducer, which persists every membership change.
  pub fn new(me: Member, snapshot: Option<PathBuf>) -> Directory {
    Directory {
      next_id: Mutex::new(me.id + 1),
      me: Arc::new(me),
      members: RwLock::new(OrdMap::new()),
      departed: Mutex::new(HashSet::new()),
      snapshot: snapshot,
      persisting: tokio::sync::Mutex::new(()),
    }
  }

  pub fn me(&self) -> &Arc<Member> {
    &self.me
  }

  pub fn id(&self) -> NodeId {
    self.me.id
  }

  /// Looks up a node, including the local one.
  pub fn get(&self, id: NodeId) -> Option<Arc<Member>> {
    if id == self.me.id {
      return Some(self.me.clone());
    }
    self.members.read().get(&id).cloned()
  }

  pub fn contains(&self, id: NodeId) -> bool {
    id == self.me.id || self.members.read().contains_key(&id)
  }

  /// Adds a node. Returns `false` if it was already known, has departed or is the local node.
  pub fn insert(&self, member: Member) -> bool {
    if member.id == self.me.id || self.departed.lock().contains(&member.id) {
      return false;
    }
    let id = member.id;
    let added = {
      let mut members = self.members.write();
      if members.contains_key(&id) {
        false
      } else {
        members.insert(id, Arc::new(member));
        true
      }
    };
    if added {
      let mut next = self.next_id.lock();
      if id >= *next {
        *next = id + 1;
      }
    }
    added
  }

  /// Removes a node and keeps it from being inserted again, even if it was not known yet.
  pub fn remove(&self, id: NodeId) -> Option<Arc<Member>> {
    if id != self.me.id {
      self.departed.lock().insert(id);
    }
    self.members.write().remove(&id)
  }

  /// Adds a node that announced its own return under its old id. Only a restarted introducer does
  /// this.
  pub fn rejoin(&self, member: Member) -> bool {
    self.departed.lock().remove(&member.id);
    self.insert(member)
  }

  pub fn has_departed(&self, id: NodeId) -> bool {
    self.departed.lock().contains(&id)
  }

  /// Assigns the next unused id to a joining node and records it.
  pub fn admit(&self, endpoint: Endpoint) -> Arc<Member> {
    let id = {
      let mut next = self.next_id.lock();
      let id = *next;
      *next += 1;
      id
    };
    let member = Arc::new(Member::new(id, endpoint));
    self.members.write().insert(id, member.clone());
    member
  }

  pub fn next_id(&self) -> NodeId {
    *self.next_id.lock()
  }

  /// Every other node.
  pub fn snapshot(&self) -> OrdMap<NodeId, Arc<Member>> {
    self.members.read().clone()
  }

  pub fn peers(&self) -> Vec<NodeId> {
    self.members.read().keys().copied().collect()
  }

  /// Every online node, the local one included.
  pub fn online(&self) -> BTreeSet<NodeId> {
    let mut ids: BTreeSet<_> = self.members.read().keys().copied().collect();
    ids.insert(self.me.id);
    ids
  }

  pub fn len_online(&self) -> usize {
    self.members.read().len() + 1
  }

  pub fn member_map(&self, include_me: bool) -> MemberMap {
    let mut map: MemberMap = self
      .snapshot()
      .values()
      .map(|m| (m.id, m.endpoint()))
      .collect();
    if include_me {
      map.insert(self.me.id, self.me.endpoint());
    }
    map
  }

  pub fn persists(&self) -> bool {
    self.snapshot.is_some()
  }

  /// Rewrites the snapshot file, if this directory keeps one. The file is replaced atomically.
  /// Concurrent calls are serialized and each writes the directory as of its turn.
  pub async fn persist(&self) -> Result<(), SnapshotError> {
    let path = match &self.snapshot {
      Some(path) => path,
      None => return Ok(()),
    };
    let _turn = self.persisting.lock().await;
    let json = serde_json::to_vec_pretty(&self.member_map(false)).map_err(|e| {
      SnapshotError::Corrupt {
        path: path.clone(),
        source: e,
      }
    })?;
    let tmp = path.with_extension("tmp");
    let io_err = |e| SnapshotError::Io {
      path: path.clone(),
      source: e,
    };
    fs::write(&tmp, json).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)
  }

  /// Reads a snapshot written by [`persist`](Self::persist). A missing file is an empty
  /// directory.
  pub async fn load_snapshot(path: &Path) -> Result<MemberMap, SnapshotError> {
    let bytes = match fs::read(path).await {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MemberMap::new()),
      Err(e) => {
        return Err(SnapshotError::Io {
          path: path.to_path_buf(),
          source: e,
        })
      }
    };
    serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Corrupt {
      path: path.to_path_buf(),
      source: e,
    })
  }
}

#[cfg(test)]
use crate::core::Socket;

#[cfg(test)]
fn endpoint(port: u16) -> Endpoint {
  Endpoint {
    host: format!("vm-{}", port),
    socket: Socket::localhost(port),
  }
}

#[test]
fn test_directory_admit_monotonic() {
  let dir = Directory::new(Member::new(0, endpoint(7000)), None);
  let a = dir.admit(endpoint(7010));
  let b = dir.admit(endpoint(7020));
  assert_eq!((a.id, b.id), (1, 2));
  assert!(dir.remove(1).is_some());
  // Ids are never reused.
  assert_eq!(dir.admit(endpoint(7030)).id, 3);
  assert!(dir.insert(Member::new(9, endpoint(7090))));
  assert_eq!(dir.admit(endpoint(7040)).id, 10);
  assert_eq!(
    dir.online().into_iter().collect::<Vec<_>>(),
    vec![0, 2, 3, 9, 10]
  );
}

#[test]
fn test_directory_ignores_self_and_duplicates() {
  let dir = Directory::new(Member::new(4, endpoint(7000)), None);
  assert!(!dir.insert(Member::new(4, endpoint(7000))));
  assert!(dir.insert(Member::new(1, endpoint(7010))));
  assert!(!dir.insert(Member::new(1, endpoint(7010))));
  assert_eq!(dir.peers(), vec![1]);
  assert_eq!(dir.len_online(), 2);
  assert!(dir.contains(4));
  assert_eq!(dir.get(4).unwrap().id, 4);
}

#[test]
fn test_directory_refuses_departed() {
  let dir = Directory::new(Member::new(1, endpoint(7010)), None);
  assert!(dir.insert(Member::new(0, endpoint(7000))));
  assert!(dir.insert(Member::new(2, endpoint(7020))));
  assert!(dir.remove(2).is_some());
  assert!(!dir.insert(Member::new(2, endpoint(7020))));

  // A failure reported before the node was ever heard of still counts.
  assert!(dir.remove(5).is_none());
  assert!(!dir.insert(Member::new(5, endpoint(7050))));
  assert!(dir.has_departed(5));
  assert!(!dir.has_departed(1));
  assert_eq!(dir.peers(), vec![0]);

  assert!(dir.remove(0).is_some());
  assert!(!dir.insert(Member::new(0, endpoint(7000))));
  assert!(dir.rejoin(Member::new(0, endpoint(7000))));
  assert!(!dir.has_departed(0));
  assert_eq!(dir.peers(), vec![0]);
}

#[tokio::test]
async fn test_directory_snapshot_round_trip() {
  let tmp = tempfile::tempdir().unwrap();
  let path = tmp.path().join("critical.json");
  assert!(Directory::load_snapshot(&path).await.unwrap().is_empty());

  let dir = Directory::new(Member::new(0, endpoint(7000)), Some(path.clone()));
  dir.admit(endpoint(7010));
  dir.admit(endpoint(7020));
  dir.persist().await.unwrap();

  let raw: serde_json::Value =
    serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
  assert_eq!(raw["1"], serde_json::json!("vm-7010\n127.0.0.1:7010"));
  assert!(raw.get("0").is_none());

  let loaded = Directory::load_snapshot(&path).await.unwrap();
  assert_eq!(loaded, dir.member_map(false));
}
