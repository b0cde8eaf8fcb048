use crate::core::{Message, Node, NodeId};
use crate::store::{
  send_file, validate_name, DeleteOutcome, Dir, FileRef, OverwritePrompt, PutOutcome, ReadMiss,
  ReadRequest, StoreError, TransferBatch, TransferOrder, WriteRequest,
};
use std::path::PathBuf;
use tokio::fs;
use tokio::time::timeout;
use tracing::{debug, info, warn};

impl Node {
  fn require_coordinator(&self) -> Result<NodeId, StoreError> {
    self.coordinator_id().ok_or(StoreError::NoCoordinator)
  }

  /// Stores the scratch file `source` as `name`.
  ///
  /// On the coordinator this places the object right away. Elsewhere the request is forwarded
  /// and `Ok(PutOutcome::Forwarded)` only means the coordinator was sent it.
  pub async fn put(
    &self,
    source: &str,
    name: &str,
    overwrite: bool,
  ) -> Result<PutOutcome, StoreError> {
    validate_name(name)?;
    let path = self.store.path(&FileRef::new(Dir::Scratch, source));
    if !fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
      return Err(StoreError::MissingSource(path));
    }
    let req = WriteRequest {
      source: source.to_string(),
      name: name.to_string(),
      overwrite: overwrite,
    };
    if self.is_coordinator() {
      return self.coordinate_put(self.id(), req).await;
    }
    let coordinator = self.require_coordinator()?;
    self.send_to(coordinator, Message::WriteReq(req)).await?;
    Ok(PutOutcome::Forwarded)
  }

  /// Puts every file of the scratch sub-directory `dir` as `prefix` followed by the file name.
  pub async fn put_dir(
    &self,
    dir: &str,
    prefix: &str,
  ) -> Result<Vec<(String, PutOutcome)>, StoreError> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(self.store.path(&FileRef::new(Dir::Scratch, dir))).await?;
    while let Some(entry) = entries.next_entry().await? {
      if !entry.file_type().await?.is_file() {
        continue;
      }
      if let Some(file) = entry.file_name().to_str() {
        if !file.starts_with('.') {
          files.push(file.to_string());
        }
      }
    }
    files.sort();
    let mut outcomes = Vec::with_capacity(files.len());
    for file in files {
      let name = format!("{}{}", prefix, file);
      let outcome = self.put(&format!("{}/{}", dir, file), &name, false).await?;
      outcomes.push((name, outcome));
    }
    Ok(outcomes)
  }

  /// Fetches `name` into the scratch directory as `dest` and waits for it to arrive.
  pub async fn get(&self, name: &str, dest: &str) -> Result<PathBuf, StoreError> {
    validate_name(name)?;
    validate_name(dest)?;
    let req = ReadRequest {
      name: name.to_string(),
      dest: FileRef::new(Dir::Scratch, dest),
      requester: self.id(),
      local_copy: self.store.has_local(name).await,
    };
    let arrival = self.store.expect(dest);
    let requested = if self.is_coordinator() {
      self.coordinate_get(req).await
    } else {
      match self.require_coordinator() {
        Ok(coordinator) => self
          .send_to(coordinator, Message::ReadReq(req))
          .await
          .map_err(StoreError::from),
        Err(e) => Err(e),
      }
    };
    if let Err(e) = requested {
      self.store.abandon(dest);
      return Err(e);
    }
    match timeout(self.config.store.read_timeout, arrival).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) | Err(_) => {
        self.store.abandon(dest);
        Err(StoreError::Timeout(name.to_string()))
      }
    }
  }

  pub async fn delete(&self, name: &str) -> Result<DeleteOutcome, StoreError> {
    if self.is_coordinator() {
      self.coordinate_delete(name).await?;
      return Ok(DeleteOutcome::Deleted);
    }
    let coordinator = self.require_coordinator()?;
    self
      .send_to(coordinator, Message::DeleteReq(name.to_string()))
      .await?;
    Ok(DeleteOutcome::Forwarded)
  }

  /// Deletes every object whose name starts with `prefix`, as far as this node's copy of the
  /// replica table knows. Returns the names deleted or forwarded.
  pub async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
    let names = self.replicas.lock().names_with_prefix(prefix);
    for name in &names {
      self.delete(name).await?;
    }
    Ok(names)
  }

  /// Holders of `name` according to this node's copy of the replica table.
  pub fn replica_holders(&self, name: &str) -> Option<Vec<NodeId>> {
    self
      .replicas
      .lock()
      .get(name)
      .map(|record| record.holders().collect())
  }

  /// Replicas stored on this node.
  pub async fn local_objects(&self) -> Result<Vec<String>, StoreError> {
    Ok(self.store.local_objects().await?)
  }

  /// Asks the local user whether to overwrite, and resubmits the write if they agree.
  pub(crate) async fn answer_overwrite(&self, coordinator: NodeId, prompt: OverwritePrompt) {
    if !self.confirm_overwrite(&prompt.name).await {
      info!(node = self.id(), name = %prompt.name, "overwrite declined");
      return;
    }
    let req = WriteRequest {
      source: prompt.source,
      name: prompt.name,
      overwrite: true,
    };
    if let Err(e) = self.send_to(coordinator, Message::WriteReq(req)).await {
      warn!(node = self.id(), peer = coordinator, "confirmed write not sent: {}", e);
    }
  }

  /// Copies `order.source` to every target: locally for this node, over the target's listener
  /// otherwise.
  pub(crate) async fn execute_order(&self, order: TransferOrder) {
    let source = self.store.path(&order.source);
    if fs::metadata(&source).await.is_err() {
      warn!(node = self.id(), name = %order.source.name, "cannot send a file this node lacks");
      if order.dest.dir == Dir::Scratch {
        let miss = ReadMiss {
          name: order.source.name.clone(),
          dest: Some(order.dest.name.clone()),
        };
        for target in &order.targets {
          self.report_miss(*target, miss.clone()).await;
        }
      }
      return;
    }
    for target in order.targets {
      self.copy_to(target, &order.source, &order.dest).await;
    }
  }

  pub(crate) async fn execute_batch(&self, batch: TransferBatch) {
    debug!(node = self.id(), target = batch.target, objects = ?batch.names, "sending batch");
    for name in batch.names {
      let source = FileRef::new(batch.from, name.clone());
      let dest = FileRef::new(batch.to, name);
      self.copy_to(batch.target, &source, &dest).await;
    }
  }

  async fn copy_to(&self, target: NodeId, source: &FileRef, dest: &FileRef) {
    if target == self.id() {
      match self.store.copy_local(source, dest).await {
        Ok(path) => {
          debug!(node = self.id(), name = %dest.name, "copied locally");
          if dest.dir == Dir::Scratch {
            self.store.arrived(&dest.name, path);
          }
        }
        Err(e) => warn!(node = self.id(), name = %source.name, "local copy failed: {}", e),
      }
      return;
    }
    let member = match self.directory.get(target) {
      Some(member) => member,
      None => {
        warn!(node = self.id(), peer = target, "transfer target is not a member");
        return;
      }
    };
    let path = self.store.path(source);
    if let Err(e) = send_file(&member.socket, dest.dir, &path, &dest.name).await {
      warn!(node = self.id(), peer = target, name = %source.name, "transfer failed: {}", e);
    }
  }

  pub(crate) async fn report_miss(&self, to: NodeId, miss: ReadMiss) {
    if to == self.id() {
      self.read_missed(miss);
      return;
    }
    if let Err(e) = self.send_to(to, Message::ErrorRead(miss)).await {
      debug!(node = self.id(), peer = to, "miss not reported: {}", e);
    }
  }

  pub(crate) fn read_missed(&self, miss: ReadMiss) {
    match miss.dest {
      Some(dest) => self.store.missed(&dest, StoreError::NotFound(miss.name)),
      None => warn!(node = self.id(), name = %miss.name, "object does not exist"),
    }
  }

  pub(crate) async fn delete_local(&self, name: &str) {
    match self.store.remove(name).await {
      Ok(true) => info!(node = self.id(), name, "replica removed"),
      Ok(false) => debug!(node = self.id(), name, "no replica to remove"),
      Err(e) => warn!(node = self.id(), name, "could not remove replica: {}", e),
    }
  }
}
