use crate::core::{Message, Node, NodeId};
use crate::store::{
  Dir, FileRef, OverwritePrompt, PutOutcome, ReadRequest, Repair, ReplicaSnapshot, StoreError,
  TransferBatch, TransferOrder, WriteRequest, REPLICAS,
};
use chrono::Utc;
use itertools::Itertools;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

impl Node {
  /// Places an object written by `submitter` and tells the submitter where to copy it.
  pub(crate) async fn coordinate_put(
    &self,
    submitter: NodeId,
    req: WriteRequest,
  ) -> Result<PutOutcome, StoreError> {
    let window = self.config.store.conflict_window;
    let recent = self.replicas.lock().written_within(&req.name, Utc::now(), window);
    if recent && !req.overwrite {
      if submitter != self.id() {
        info!(node = self.id(), peer = submitter, name = %req.name, "asking to confirm overwrite");
        let prompt = OverwritePrompt {
          source: req.source,
          name: req.name,
        };
        self.send_to(submitter, Message::Overwrite(prompt)).await?;
        return Ok(PutOutcome::AwaitingConfirmation);
      }
      if !self.confirm_overwrite(&req.name).await {
        info!(node = self.id(), name = %req.name, "overwrite declined");
        return Ok(PutOutcome::Declined);
      }
    }

    let online = self.directory.online();
    let (previous, record) = {
      let mut table = self.replicas.lock();
      let previous = table.remove(&req.name);
      let record = table.place(&req.name, submitter, self.id(), &online, Utc::now());
      (previous, record)
    };
    let holders = record.holders().collect_vec();
    info!(node = self.id(), name = %req.name, holders = ?holders, "object placed");

    if let Some(previous) = previous {
      for stale in previous.holders().filter(|id| !record.holds(*id)) {
        if let Err(e) = self.send_to(stale, Message::Delete(req.name.clone())).await {
          warn!(node = self.id(), peer = stale, name = %req.name, "delete not sent: {}", e);
        }
      }
    }
    let order = TransferOrder {
      source: FileRef::new(Dir::Scratch, req.source),
      dest: FileRef::new(Dir::Store, req.name),
      targets: holders.clone(),
    };
    self.send_to(submitter, Message::Write(order)).await?;
    Ok(PutOutcome::Placed(holders))
  }

  /// Asks the local prompter. No answer within the prompt timeout is a no.
  pub(crate) async fn confirm_overwrite(&self, name: &str) -> bool {
    let limit = self.config.store.prompt_timeout;
    match timeout(limit, self.prompter.confirm(name)).await {
      Ok(answer) => answer,
      Err(_) => {
        info!(node = self.id(), name, "overwrite prompt timed out");
        false
      }
    }
  }

  /// Has a holder of `req.name` send it to the requester.
  pub(crate) async fn coordinate_get(&self, req: ReadRequest) -> Result<(), StoreError> {
    let source = self
      .replicas
      .lock()
      .read_source(&req.name, req.requester, req.local_copy);
    let source = match source {
      Some(source) => source,
      None => return Err(StoreError::NotFound(req.name)),
    };
    debug!(
      node = self.id(),
      name = %req.name,
      requester = req.requester,
      source,
      "serving read"
    );
    let order = TransferOrder {
      source: FileRef::new(Dir::Store, req.name),
      dest: req.dest,
      targets: vec![req.requester],
    };
    self.send_to(source, Message::Write(order)).await?;
    Ok(())
  }

  /// Forgets an object and tells every holder to delete it. Returns the holders.
  pub(crate) async fn coordinate_delete(&self, name: &str) -> Result<Vec<NodeId>, StoreError> {
    let record = match self.replicas.lock().remove(name) {
      Some(record) => record,
      None => return Err(StoreError::NotFound(name.to_string())),
    };
    let holders = record.holders().collect_vec();
    info!(node = self.id(), name, holders = ?holders, "object deleted");
    for id in &holders {
      if let Err(e) = self.send_to(*id, Message::Delete(name.to_string())).await {
        warn!(node = self.id(), peer = id, name, "delete not sent: {}", e);
      }
    }
    Ok(holders)
  }

  /// Moves the replicas of a departed node to other online nodes.
  pub(crate) async fn repair_after(&self, departed: NodeId) {
    let online = self.directory.online();
    let plan = self.replicas.lock().repair(departed, &online);
    for name in &plan.lost {
      error!(node = self.id(), peer = departed, name = %name, "only replica lost");
    }
    if !plan.moves.is_empty() {
      info!(node = self.id(), peer = departed, repairs = plan.moves.len(), "re-replicating");
    }
    self.dispatch_repairs(plan.moves).await;
  }

  /// Counts a new node for placement and fills empty slots with it while the cluster is small.
  pub(crate) async fn welcome(&self, joined: NodeId) {
    let online = self.directory.online();
    let moves = {
      let mut table = self.replicas.lock();
      table.register_node(joined);
      table.backfill(joined, &online)
    };
    if !moves.is_empty() {
      info!(node = self.id(), peer = joined, objects = moves.len(), "backfilling");
    }
    self.dispatch_repairs(moves).await;
  }

  /// Reconciles the last replica table received from the old coordinator with the nodes that are
  /// still online.
  pub(crate) async fn take_over_replicas(&self, failed: Option<NodeId>) {
    let online = self.directory.online();
    let departed = {
      let mut table = self.replicas.lock();
      for id in &online {
        table.register_node(*id);
      }
      table.departed(&online)
    };
    info!(node = self.id(), ?failed, departed = ?departed, "taking over the replica table");
    let mut moves = Vec::new();
    for id in departed {
      let plan = self.replicas.lock().repair(id, &online);
      for name in &plan.lost {
        error!(node = self.id(), peer = id, name = %name, "only replica lost");
      }
      moves.extend(plan.moves);
    }
    if online.len() <= REPLICAS {
      let mut table = self.replicas.lock();
      for id in &online {
        moves.extend(table.backfill(*id, &online));
      }
    }
    self.dispatch_repairs(moves).await;
  }

  /// Sends the copies one batch per source and target pair.
  async fn dispatch_repairs(&self, moves: Vec<Repair>) {
    let batches = moves
      .into_iter()
      .map(|m| ((m.source, m.target), m.name))
      .into_group_map();
    for ((source, target), names) in batches {
      let batch = TransferBatch {
        from: Dir::Store,
        to: Dir::Store,
        names: names,
        target: target,
      };
      if let Err(e) = self.send_to(source, Message::WriteBatch(batch)).await {
        warn!(node = self.id(), peer = source, target, "repair not sent: {}", e);
      }
    }
  }

  /// Broadcasts the replica table while this node coordinates.
  pub(crate) async fn replica_broadcaster(self) {
    let mut ticks = interval(self.config.store.snapshot_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
      ticks.tick().await;
      if !self.is_coordinator() {
        continue;
      }
      let snapshot = self.replicas.lock().snapshot();
      for id in self.directory.peers() {
        if let Err(e) = self.send_to(id, Message::ReplicaList(snapshot.clone())).await {
          debug!(node = self.id(), peer = id, "replica table not sent: {}", e);
        }
      }
    }
  }

  /// Takes in a replica table broadcast by `from`.
  pub(crate) async fn adopt_snapshot(&self, from: NodeId, snapshot: ReplicaSnapshot) {
    if self.is_coordinator() {
      if from < self.id() {
        warn!(node = self.id(), peer = from, "lower node is coordinating, re-announcing");
        if let Err(e) = self.send_to(from, Message::Coordinator).await {
          debug!(node = self.id(), peer = from, "announcement not sent: {}", e);
        }
        return;
      }
      warn!(node = self.id(), peer = from, "higher node is coordinating, stepping down");
      self.adopt_coordinator(from);
    } else if self.coordinator_id().is_none() && !self.election.in_progress() {
      self.adopt_coordinator(from);
    }
    self.replicas.lock().restore(snapshot);
    self.check_consistency().await;
  }

  /// Fetches any object the table says this node holds but the store directory lacks.
  pub(crate) async fn check_consistency(&self) {
    let coordinator = match self.coordinator_id() {
      Some(id) if id != self.id() => id,
      _ => return,
    };
    let assigned = self.replicas.lock().held_by(self.id());
    for name in assigned {
      if self.store.has_local(&name).await {
        continue;
      }
      info!(node = self.id(), name = %name, "replica missing, requesting a copy");
      let req = ReadRequest {
        name: name.clone(),
        dest: FileRef::new(Dir::Store, name),
        requester: self.id(),
        local_copy: false,
      };
      if let Err(e) = self.send_to(coordinator, Message::ReadReq(req)).await {
        debug!(node = self.id(), "read repair not sent: {}", e);
      }
    }
  }
}
