use crate::store::{Dir, FileRef, StoreError};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::oneshot;
use tracing::debug;

type PendingRead = oneshot::Sender<Result<PathBuf, StoreError>>;

/// The scratch and store directories of one node, and the reads waiting on the scratch
/// directory.
pub struct LocalStore {
  scratch: PathBuf,
  store: PathBuf,
  pending: Mutex<HashMap<String, PendingRead>>,
}
impl LocalStore {
  /// Creates both directories. Replicas left over from a previous run are discarded, since
  /// the coordinator no longer counts them.
  pub async fn open(scratch: PathBuf, store: PathBuf) -> io::Result<LocalStore> {
    fs::create_dir_all(&scratch).await?;
    fs::create_dir_all(&store).await?;
    let local = LocalStore {
      scratch: scratch,
      store: store,
      pending: Mutex::new(HashMap::new()),
    };
    local.wipe().await?;
    Ok(local)
  }

  pub fn dir(&self, dir: Dir) -> &Path {
    match dir {
      Dir::Scratch => &self.scratch,
      Dir::Store => &self.store,
    }
  }

  pub fn path(&self, file: &FileRef) -> PathBuf {
    self.dir(file.dir).join(&file.name)
  }

  /// Whether this node has a replica of `name`.
  pub async fn has_local(&self, name: &str) -> bool {
    fs::metadata(self.store.join(name))
      .await
      .map(|m| m.is_file())
      .unwrap_or(false)
  }

  /// Names of the replicas in the store directory, sorted.
  pub async fn local_objects(&self) -> io::Result<Vec<String>> {
    list(&self.store).await
  }

  /// Removes every replica.
  pub async fn wipe(&self) -> io::Result<()> {
    let mut entries = fs::read_dir(&self.store).await?;
    while let Some(entry) = entries.next_entry().await? {
      if entry.file_type().await?.is_file() {
        fs::remove_file(entry.path()).await?;
      }
    }
    Ok(())
  }

  /// Removes one replica. Returns `false` if there was none.
  pub async fn remove(&self, name: &str) -> io::Result<bool> {
    match fs::remove_file(self.store.join(name)).await {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(e),
    }
  }

  /// Copies between the two directories without going through a listener.
  pub async fn copy_local(&self, from: &FileRef, to: &FileRef) -> io::Result<PathBuf> {
    let dest = self.path(to);
    let partial = self
      .dir(to.dir)
      .join(format!(".{}.{}", to.name, uuid::Uuid::new_v4()));
    if let Err(e) = fs::copy(self.path(from), &partial).await {
      let _ = fs::remove_file(&partial).await;
      return Err(e);
    }
    fs::rename(&partial, &dest).await?;
    Ok(dest)
  }

  /// Registers a read whose bytes will arrive in the scratch directory as `dest`. A newer read
  /// for the same destination replaces an older one.
  pub fn expect(&self, dest: &str) -> oneshot::Receiver<Result<PathBuf, StoreError>> {
    let (tx, rx) = oneshot::channel();
    self.pending.lock().insert(dest.to_string(), tx);
    rx
  }

  pub fn arrived(&self, dest: &str, path: PathBuf) {
    let waiter = self.pending.lock().remove(dest);
    match waiter {
      Some(tx) => {
        let _ = tx.send(Ok(path));
      }
      None => debug!(dest, "no read was waiting for this file"),
    }
  }

  pub fn missed(&self, dest: &str, err: StoreError) {
    let waiter = self.pending.lock().remove(dest);
    if let Some(tx) = waiter {
      let _ = tx.send(Err(err));
    }
  }

  /// Drops a read that timed out.
  pub fn abandon(&self, dest: &str) {
    self.pending.lock().remove(dest);
  }
}

async fn list(dir: &Path) -> io::Result<Vec<String>> {
  let mut names = Vec::new();
  let mut entries = fs::read_dir(dir).await?;
  while let Some(entry) = entries.next_entry().await? {
    if !entry.file_type().await?.is_file() {
      continue;
    }
    if let Some(name) = entry.file_name().to_str() {
      if !name.starts_with('.') {
        names.push(name.to_string());
      }
    }
  }
  names.sort();
  Ok(names)
}

#[cfg(test)]
async fn open_in(root: &Path) -> LocalStore {
  LocalStore::open(root.join("local"), root.join("sdfs"))
    .await
    .unwrap()
}

#[tokio::test]
async fn test_open_discards_old_replicas() {
  let tmp = tempfile::tempdir().unwrap();
  std::fs::create_dir_all(tmp.path().join("sdfs")).unwrap();
  std::fs::write(tmp.path().join("sdfs/old"), b"x").unwrap();
  let store = open_in(tmp.path()).await;
  assert!(store.local_objects().await.unwrap().is_empty());
  assert!(tmp.path().join("local").is_dir());
}

#[tokio::test]
async fn test_copy_and_list() {
  let tmp = tempfile::tempdir().unwrap();
  let store = open_in(tmp.path()).await;
  std::fs::write(tmp.path().join("local/input"), b"data").unwrap();
  std::fs::write(tmp.path().join("sdfs/.b.partial"), b"half").unwrap();
  let from = FileRef::new(Dir::Scratch, "input");
  for name in ["b", "a"] {
    store.copy_local(&from, &FileRef::new(Dir::Store, name)).await.unwrap();
  }
  assert_eq!(store.local_objects().await.unwrap(), vec!["a", "b"]);
  assert!(store.has_local("a").await);
  assert!(store.remove("a").await.unwrap());
  assert!(!store.remove("a").await.unwrap());
  assert!(!store.has_local("a").await);
}

#[tokio::test]
async fn test_pending_reads() {
  let tmp = tempfile::tempdir().unwrap();
  let store = open_in(tmp.path()).await;
  let found = store.expect("out");
  let missing = store.expect("gone");
  store.arrived("out", tmp.path().join("local/out"));
  store.missed("gone", StoreError::NotFound("gone".to_string()));
  assert_eq!(found.await.unwrap().unwrap(), tmp.path().join("local/out"));
  assert!(matches!(missing.await.unwrap(), Err(StoreError::NotFound(_))));

  let abandoned = store.expect("late");
  store.abandon("late");
  assert!(abandoned.await.is_err());
}
