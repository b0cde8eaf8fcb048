//! The replicated object store.
//!
//! Each node has a scratch directory, where users put files from and get files into, and a store
//! directory holding the replicas assigned to it. The coordinator owns the [`ReplicaTable`] and
//! is the only node that changes it. Other nodes forward their puts, gets and deletes to it and
//! receive a copy of the table every
//! [`StoreConfig.snapshot_interval`](StoreConfig#structfield.snapshot_interval).
//!
//! A new object goes to its submitter and the [`REPLICAS`]` - 1` least loaded other nodes. The
//! coordinator then sends each holder the instructions to copy the bytes; no object bytes ever
//! travel through the coordinator unless it is a holder itself.
//!
//! When a holder disappears, the coordinator gives its slots to other online nodes and has a
//! surviving holder send them the bytes. An object whose only holder disappears is lost.

mod client;
mod coordinator;
mod local;
mod replica;
mod transfer;
mod utils;

#[rustfmt::skip]
pub use {
  local::LocalStore,
  replica::REPLICAS,
  replica::Repair,
  replica::RepairPlan,
  replica::ReplicaRecord,
  replica::ReplicaSnapshot,
  replica::ReplicaTable,
  transfer::COPY_BUFFER,
  transfer::NAME_FIELD,
  transfer::PADDING,
  transfer::Received,
  transfer::SIZE_FIELD,
  transfer::TransferError,
  transfer::receive,
  transfer::send,
  transfer::send_file,
  transfer::send_path,
  transfer::validate_name,
  utils::Accept,
  utils::Decline,
  utils::DeleteOutcome,
  utils::Dir,
  utils::FileRef,
  utils::OverwritePrompt,
  utils::Prompter,
  utils::PutOutcome,
  utils::ReadMiss,
  utils::ReadRequest,
  utils::StoreConfig,
  utils::StoreError,
  utils::TransferBatch,
  utils::TransferOrder,
  utils::WriteRequest,
};
