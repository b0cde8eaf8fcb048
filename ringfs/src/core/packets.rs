use crate::cluster::{Endpoint, JoinAck, MemberMap};
use crate::core::NodeId;
use crate::store::{
  OverwritePrompt, ReadMiss, ReadRequest, ReplicaSnapshot, TransferBatch, TransferOrder,
  WriteRequest,
};
use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Numeric codes of every message kind, as they appear on the wire.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MsgType {
  Heartbeat = 0,
  Fail = 1,
  Leave = 2,
  JoinAck = 3,
  JoinReq = 4,
  UpdateList = 5,
  WriteReq = 6,
  Write = 7,
  WriteBatch = 8,
  ReadReq = 9,
  ErrorRead = 10,
  DeleteReq = 11,
  Delete = 12,
  Overwrite = 13,
  ReplicaList = 14,
  Election = 15,
  Ok = 16,
  Coordinator = 17,
  NewElection = 18,
  Task = 19,
  TaskDone = 20,
}
impl MsgType {
  /// Kinds that are gossiped around the ring instead of sent point to point.
  pub fn disseminated(self) -> bool {
    matches!(self, MsgType::Fail | MsgType::Leave | MsgType::UpdateList)
  }
}
impl fmt::Display for MsgType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      MsgType::Heartbeat => "HEARTBEAT",
      MsgType::Fail => "FAIL",
      MsgType::Leave => "LEAVE",
      MsgType::JoinAck => "JOINACK",
      MsgType::JoinReq => "JOINREQ",
      MsgType::UpdateList => "UPDATELIST",
      MsgType::WriteReq => "WRITEREQ",
      MsgType::Write => "WRITE",
      MsgType::WriteBatch => "WRITEBATCH",
      MsgType::ReadReq => "READREQ",
      MsgType::ErrorRead => "ERRORREAD",
      MsgType::DeleteReq => "DELETEREQ",
      MsgType::Delete => "DELETE",
      MsgType::Overwrite => "OVERWRITE",
      MsgType::ReplicaList => "REPLICALIST",
      MsgType::Election => "ELECTION",
      MsgType::Ok => "OK",
      MsgType::Coordinator => "COORDINATOR",
      MsgType::NewElection => "NEWELECTION",
      MsgType::Task => "TASK",
      MsgType::TaskDone => "TASKDONE",
    };
    f.write_str(name)
  }
}

/// The typed body of an [`Envelope`].
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
  Heartbeat,
  /// A node was declared failed by one of its monitors.
  Fail(NodeId),
  /// A node is leaving gracefully.
  Leave(NodeId),
  JoinAck(JoinAck),
  JoinReq(Endpoint),
  /// Directory entries the receiver should merge.
  UpdateList(MemberMap),
  WriteReq(WriteRequest),
  Write(TransferOrder),
  WriteBatch(TransferBatch),
  ReadReq(ReadRequest),
  ErrorRead(ReadMiss),
  DeleteReq(String),
  /// Remove the local replica of the named object.
  Delete(String),
  Overwrite(OverwritePrompt),
  ReplicaList(ReplicaSnapshot),
  /// Carries the id of the coordinator being replaced, or `None` when it is unknown.
  Election(Option<NodeId>),
  Ok,
  Coordinator,
  NewElection,
  /// Opaque payloads of the batch layer.
  Task(String),
  TaskDone(String),
}
impl Message {
  pub fn kind(&self) -> MsgType {
    match self {
      Message::Heartbeat => MsgType::Heartbeat,
      Message::Fail(_) => MsgType::Fail,
      Message::Leave(_) => MsgType::Leave,
      Message::JoinAck(_) => MsgType::JoinAck,
      Message::JoinReq(_) => MsgType::JoinReq,
      Message::UpdateList(_) => MsgType::UpdateList,
      Message::WriteReq(_) => MsgType::WriteReq,
      Message::Write(_) => MsgType::Write,
      Message::WriteBatch(_) => MsgType::WriteBatch,
      Message::ReadReq(_) => MsgType::ReadReq,
      Message::ErrorRead(_) => MsgType::ErrorRead,
      Message::DeleteReq(_) => MsgType::DeleteReq,
      Message::Delete(_) => MsgType::Delete,
      Message::Overwrite(_) => MsgType::Overwrite,
      Message::ReplicaList(_) => MsgType::ReplicaList,
      Message::Election(_) => MsgType::Election,
      Message::Ok => MsgType::Ok,
      Message::Coordinator => MsgType::Coordinator,
      Message::NewElection => MsgType::NewElection,
      Message::Task(_) => MsgType::Task,
      Message::TaskDone(_) => MsgType::TaskDone,
    }
  }

  fn content(&self) -> Result<String, serde_json::Error> {
    use Message::*;
    match self {
      Heartbeat | Ok | Coordinator | NewElection => Result::Ok(String::new()),
      DeleteReq(s) | Delete(s) | Task(s) | TaskDone(s) => Result::Ok(s.clone()),
      Fail(id) | Leave(id) => serde_json::to_string(id),
      JoinAck(x) => serde_json::to_string(x),
      JoinReq(x) => serde_json::to_string(x),
      UpdateList(x) => serde_json::to_string(x),
      WriteReq(x) => serde_json::to_string(x),
      Write(x) => serde_json::to_string(x),
      WriteBatch(x) => serde_json::to_string(x),
      ReadReq(x) => serde_json::to_string(x),
      ErrorRead(x) => serde_json::to_string(x),
      Overwrite(x) => serde_json::to_string(x),
      ReplicaList(x) => serde_json::to_string(x),
      Election(x) => serde_json::to_string(x),
    }
  }

  fn parse(kind: MsgType, content: &str) -> Result<Message, serde_json::Error> {
    let msg = match kind {
      MsgType::Heartbeat => Message::Heartbeat,
      MsgType::Ok => Message::Ok,
      MsgType::Coordinator => Message::Coordinator,
      MsgType::NewElection => Message::NewElection,
      MsgType::DeleteReq => Message::DeleteReq(content.to_string()),
      MsgType::Delete => Message::Delete(content.to_string()),
      MsgType::Task => Message::Task(content.to_string()),
      MsgType::TaskDone => Message::TaskDone(content.to_string()),
      MsgType::Fail => Message::Fail(serde_json::from_str(content)?),
      MsgType::Leave => Message::Leave(serde_json::from_str(content)?),
      MsgType::JoinAck => Message::JoinAck(serde_json::from_str(content)?),
      MsgType::JoinReq => Message::JoinReq(serde_json::from_str(content)?),
      MsgType::UpdateList => Message::UpdateList(serde_json::from_str(content)?),
      MsgType::WriteReq => Message::WriteReq(serde_json::from_str(content)?),
      MsgType::Write => Message::Write(serde_json::from_str(content)?),
      MsgType::WriteBatch => Message::WriteBatch(serde_json::from_str(content)?),
      MsgType::ReadReq => Message::ReadReq(serde_json::from_str(content)?),
      MsgType::ErrorRead => Message::ErrorRead(serde_json::from_str(content)?),
      MsgType::Overwrite => Message::Overwrite(serde_json::from_str(content)?),
      MsgType::ReplicaList => Message::ReplicaList(serde_json::from_str(content)?),
      MsgType::Election => Message::Election(serde_json::from_str(content)?),
    };
    Ok(msg)
  }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
  #[error("malformed envelope: {0}")]
  Json(#[from] serde_json::Error),
  #[error("unknown message type {0:?}")]
  UnknownType(String),
  #[error("bad sender id {0:?}")]
  BadSender(String),
  #[error("bad timestamp {0:?}")]
  BadTimestamp(String),
  #[error("bad {kind} content: {source}")]
  BadContent {
    kind: MsgType,
    source: serde_json::Error,
  },
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
  #[serde(rename = "0")]
  unique_id: String,
  #[serde(rename = "1")]
  timestamp: String,
  #[serde(rename = "2")]
  sender: String,
  #[serde(rename = "3")]
  kind: String,
  #[serde(rename = "4")]
  content: String,
}

/// A control message as it travels between nodes.
///
/// On the wire this is a JSON object keyed by `"0"` through `"4"`: unique id, timestamp, sender,
/// type code and content. The timestamp is the sender's wall clock truncated to milliseconds; for
/// heartbeats it doubles as the logical timestamp monitors compare against.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
  pub unique_id: String,
  pub timestamp: DateTime<Utc>,
  pub sender: NodeId,
  pub msg: Message,
}
impl Envelope {
  pub fn new(sender: NodeId, msg: Message) -> Envelope {
    Envelope {
      unique_id: Uuid::new_v4().to_string(),
      timestamp: Utc::now().trunc_subsecs(3),
      sender: sender,
      msg: msg,
    }
  }

  pub fn kind(&self) -> MsgType {
    self.msg.kind()
  }

  pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
    let wire = WireEnvelope {
      unique_id: self.unique_id.clone(),
      timestamp: self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
      sender: self.sender.to_string(),
      kind: u8::from(self.kind()).to_string(),
      content: self.msg.content()?,
    };
    Ok(serde_json::to_vec(&wire)?)
  }

  pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes)?;
    let kind = wire
      .kind
      .parse::<u8>()
      .ok()
      .and_then(|code| MsgType::try_from(code).ok())
      .ok_or_else(|| EnvelopeError::UnknownType(wire.kind.clone()))?;
    let sender = wire
      .sender
      .parse::<NodeId>()
      .map_err(|_| EnvelopeError::BadSender(wire.sender.clone()))?;
    let timestamp = NaiveDateTime::parse_from_str(&wire.timestamp, TIMESTAMP_FORMAT)
      .map(|naive| Utc.from_utc_datetime(&naive))
      .map_err(|_| EnvelopeError::BadTimestamp(wire.timestamp.clone()))?;
    let msg = Message::parse(kind, &wire.content)
      .map_err(|source| EnvelopeError::BadContent { kind, source })?;
    Ok(Envelope {
      unique_id: wire.unique_id,
      timestamp: timestamp,
      sender: sender,
      msg: msg,
    })
  }
}

#[cfg(test)]
use crate::store::{FileRef, Dir};

#[test]
fn test_envelope_wire_keys() {
  let env = Envelope::new(3, Message::Fail(7));
  let bytes = env.encode().unwrap();
  let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
  assert_eq!(raw["0"], serde_json::json!(env.unique_id));
  assert_eq!(raw["2"], serde_json::json!("3"));
  assert_eq!(raw["3"], serde_json::json!("1"));
  assert_eq!(raw["4"], serde_json::json!("7"));
  assert!(raw["1"].as_str().unwrap().ends_with('Z'));
  assert_eq!(Envelope::decode(&bytes).unwrap(), env);
}

#[test]
fn test_envelope_structured_content() {
  let order = TransferOrder {
    source: FileRef::new(Dir::Scratch, "input.txt"),
    dest: FileRef::new(Dir::Store, "f"),
    targets: vec![2, 5, 9],
  };
  let env = Envelope::new(0, Message::Write(order));
  let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
  assert_eq!(decoded, env);

  let env = Envelope::new(4, Message::Election(None));
  let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
  assert_eq!(decoded.msg, Message::Election(None));
}

#[test]
fn test_envelope_rejects_garbage() {
  let raw = br#"{"0":"x","1":"2021-01-01T00:00:00.000Z","2":"1","3":"99","4":""}"#;
  assert!(matches!(
    Envelope::decode(raw),
    Err(EnvelopeError::UnknownType(_))
  ));
  let raw = br#"{"0":"x","1":"2021-01-01T00:00:00.000Z","2":"1","3":"1","4":"abc"}"#;
  assert!(matches!(
    Envelope::decode(raw),
    Err(EnvelopeError::BadContent { kind: MsgType::Fail, .. })
  ));
  assert!(Envelope::decode(b"not json").is_err());
}
