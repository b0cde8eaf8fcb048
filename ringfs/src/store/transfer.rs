//! Framing of object bytes on the scratch and store listeners.
//!
//! ```text
//! +------------+------------------+------------------------+-----------------+
//! | size (10)  | name (64)        | `size` bytes of object | zero padding    |
//! +------------+------------------+------------------------+-----------------+
//! ```
//!
//! Both header fields are right-padded with `:`. The object is followed by zeros up to the next
//! multiple of [`COPY_BUFFER`], which the receiver reads and throws away. A receiver tolerates a
//! sender that closes the connection without the padding.

use crate::core::{connect, Node, Socket, TransportError};
use crate::store::Dir;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub const SIZE_FIELD: usize = 10;
pub const NAME_FIELD: usize = 64;
pub const PADDING: u8 = b':';
pub const COPY_BUFFER: u64 = 4096;

const MAX_SIZE: u64 = 9_999_999_999;

#[derive(Debug, Error)]
pub enum TransferError {
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),
  #[error("invalid object name {0:?}")]
  InvalidName(String),
  #[error("{0} bytes do not fit in the size field")]
  TooLarge(u64),
  #[error("malformed header: {0}")]
  BadHeader(String),
  #[error(transparent)]
  Connect(#[from] TransportError),
}

/// An object written to disk by [`receive`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
  pub name: String,
  pub path: PathBuf,
  pub len: u64,
}

/// Object names are flat file names that fit the name field.
pub fn validate_name(name: &str) -> Result<(), TransferError> {
  let invalid = name.is_empty()
    || name.len() > NAME_FIELD
    || name.starts_with('.')
    || name.contains(|c: char| c == '/' || c == '\\' || c == ':' || c.is_control());
  if invalid {
    Err(TransferError::InvalidName(name.to_string()))
  } else {
    Ok(())
  }
}

fn padded_field(value: &str, width: usize) -> Vec<u8> {
  let mut field = value.as_bytes().to_vec();
  field.resize(width, PADDING);
  field
}

fn padding_after(len: u64) -> u64 {
  (COPY_BUFFER - len % COPY_BUFFER) % COPY_BUFFER
}

/// Writes the header and exactly `len` bytes of `source`, followed by the padding.
pub async fn send<W, R>(
  conn: &mut W,
  source: &mut R,
  len: u64,
  dest_name: &str,
) -> Result<(), TransferError>
where
  W: AsyncWrite + Unpin,
  R: AsyncRead + Unpin,
{
  validate_name(dest_name)?;
  if len > MAX_SIZE {
    return Err(TransferError::TooLarge(len));
  }
  conn
    .write_all(&padded_field(&len.to_string(), SIZE_FIELD))
    .await?;
  conn.write_all(&padded_field(dest_name, NAME_FIELD)).await?;
  let copied = tokio::io::copy(&mut source.take(len), conn).await?;
  if copied != len {
    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "source shrank while sending").into());
  }
  let zeros = vec![0u8; padding_after(len) as usize];
  conn.write_all(&zeros).await?;
  conn.flush().await?;
  Ok(())
}

pub async fn send_path<W>(conn: &mut W, path: &Path, dest_name: &str) -> Result<(), TransferError>
where
  W: AsyncWrite + Unpin,
{
  let mut file = File::open(path).await?;
  let len = file.metadata().await?.len();
  send(conn, &mut file, len, dest_name).await
}

/// Sends a local file to the `dir` listener of `to`.
pub async fn send_file(
  to: &Socket,
  dir: Dir,
  path: &Path,
  dest_name: &str,
) -> Result<(), TransferError> {
  let mut conn = connect(to, dir.channel()).await?;
  send_path(&mut conn, path, dest_name).await?;
  conn.shutdown().await?;
  Ok(())
}

async fn read_field<R: AsyncRead + Unpin>(
  conn: &mut R,
  width: usize,
) -> Result<String, TransferError> {
  let mut buf = vec![0u8; width];
  conn.read_exact(&mut buf).await?;
  let text = String::from_utf8(buf).map_err(|e| TransferError::BadHeader(e.to_string()))?;
  Ok(text.trim_end_matches(PADDING as char).to_string())
}

/// Reads one object from `conn` into `dir`. The bytes land in a hidden temporary file first and
/// replace any existing object of the same name only once complete.
pub async fn receive<R>(conn: &mut R, dir: &Path) -> Result<Received, TransferError>
where
  R: AsyncRead + Unpin,
{
  let size = read_field(conn, SIZE_FIELD).await?;
  let len: u64 = size
    .parse()
    .map_err(|_| TransferError::BadHeader(format!("size {:?}", size)))?;
  let name = read_field(conn, NAME_FIELD).await?;
  validate_name(&name)?;

  let path = dir.join(&name);
  let partial = dir.join(format!(".{}.{}", name, uuid::Uuid::new_v4()));
  let mut file = File::create(&partial).await?;
  let copied = match tokio::io::copy(&mut (&mut *conn).take(len), &mut file).await {
    Ok(copied) => copied,
    Err(e) => {
      drop(file);
      let _ = fs::remove_file(&partial).await;
      return Err(e.into());
    }
  };
  file.sync_all().await?;
  drop(file);
  if copied != len {
    let _ = fs::remove_file(&partial).await;
    return Err(
      io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{} ended after {} of {} bytes", name, copied, len),
      )
      .into(),
    );
  }
  fs::rename(&partial, &path).await?;
  let pad = padding_after(len);
  if pad > 0 {
    tokio::io::copy(&mut (&mut *conn).take(pad), &mut tokio::io::sink()).await?;
  }
  Ok(Received {
    name: name,
    path: path,
    len: len,
  })
}

impl Node {
  /// Accepts transfers bound for `dir` until the node shuts down.
  pub(crate) async fn transfer_listener(self, listener: TcpListener, dir: Dir) {
    loop {
      let (mut conn, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
          warn!(node = self.id(), ?dir, "accept failed: {}", e);
          continue;
        }
      };
      let node = self.clone();
      tokio::spawn(async move {
        let target = node.store.dir(dir).to_path_buf();
        match receive(&mut conn, &target).await {
          Ok(received) => {
            debug!(
              node = node.id(),
              from = %peer,
              name = %received.name,
              bytes = received.len,
              "received {:?} object",
              dir
            );
            if dir == Dir::Scratch {
              node.store.arrived(&received.name, received.path);
            } else {
              info!(node = node.id(), name = %received.name, "replica stored");
            }
          }
          Err(e) => warn!(node = node.id(), from = %peer, "transfer failed: {}", e),
        }
      });
    }
  }
}

#[cfg(test)]
use tokio_test::io::Builder;

#[test]
fn test_validate_name() {
  assert!(validate_name("wordcount.txt").is_ok());
  assert!(validate_name(&"x".repeat(NAME_FIELD)).is_ok());
  assert!(validate_name(&"x".repeat(NAME_FIELD + 1)).is_err());
  for bad in ["", ".hidden", "a/b", "..", "c:d", "tab\there"] {
    assert!(validate_name(bad).is_err(), "{:?}", bad);
  }
}

#[test]
fn test_padding_after() {
  assert_eq!(padding_after(0), 0);
  assert_eq!(padding_after(1), 4095);
  assert_eq!(padding_after(4096), 0);
  assert_eq!(padding_after(5000), 3192);
}

#[tokio::test]
async fn test_send_frames_header_and_padding() {
  let body = b"hello";
  let mut expected = b"5:::::::::".to_vec();
  expected.extend_from_slice(&padded_field("greeting", NAME_FIELD));
  expected.extend_from_slice(body);
  let mut mock = Builder::new()
    .write(&expected)
    .write(&vec![0u8; 4091])
    .build();
  send(&mut mock, &mut &body[..], body.len() as u64, "greeting")
    .await
    .unwrap();
}

#[tokio::test]
async fn test_receive_discards_padding() {
  let tmp = tempfile::tempdir().unwrap();
  let mut header = padded_field("3", SIZE_FIELD);
  header.extend_from_slice(&padded_field("abc", NAME_FIELD));
  let mut mock = Builder::new()
    .read(&header)
    .read(b"xyz")
    .read(&vec![0u8; 4093])
    .build();
  let received = receive(&mut mock, tmp.path()).await.unwrap();
  assert_eq!(received.name, "abc");
  assert_eq!(received.len, 3);
  assert_eq!(std::fs::read(tmp.path().join("abc")).unwrap(), b"xyz");
}

#[tokio::test]
async fn test_send_receive_over_duplex() {
  let tmp = tempfile::tempdir().unwrap();
  let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
  std::fs::write(tmp.path().join("abc"), b"stale").unwrap();
  let (mut client, mut server) = tokio::io::duplex(1024);
  let sent = body.clone();
  let sender = tokio::spawn(async move {
    send(&mut client, &mut &sent[..], sent.len() as u64, "abc").await
  });
  let received = receive(&mut server, tmp.path()).await.unwrap();
  sender.await.unwrap().unwrap();
  assert_eq!(received.len, 10_000);
  assert_eq!(std::fs::read(&received.path).unwrap(), body);
  let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
    .unwrap()
    .map(|e| e.unwrap().file_name())
    .collect();
  assert_eq!(leftovers, vec![std::ffi::OsString::from("abc")]);
}

#[tokio::test]
async fn test_receive_rejects_truncated_body() {
  let tmp = tempfile::tempdir().unwrap();
  let mut header = padded_field("10", SIZE_FIELD);
  header.extend_from_slice(&padded_field("short", NAME_FIELD));
  let mut mock = Builder::new().read(&header).read(b"1234").build();
  assert!(receive(&mut mock, tmp.path()).await.is_err());
  assert!(!tmp.path().join("short").exists());
  assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_receive_rejects_bad_size() {
  let tmp = tempfile::tempdir().unwrap();
  let mut mock = Builder::new().read(b"12ab::::::").build();
  match receive(&mut mock, tmp.path()).await {
    Err(TransferError::BadHeader(_)) => {}
    other => panic!("unexpected {:?}", other),
  }
}
