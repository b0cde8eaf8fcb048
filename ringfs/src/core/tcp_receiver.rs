use crate::core::{Envelope, Host, Node, Socket, TransportError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Largest envelope accepted on the bulk channel.
const MAX_ENVELOPE: u64 = 64 * 1024 * 1024;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

async fn read_envelope(
  conn: &mut TcpStream,
  peer: SocketAddr,
  limit: Duration,
) -> Result<Vec<u8>, TransportError> {
  let mut bytes = Vec::new();
  let mut limited = conn.take(MAX_ENVELOPE);
  match timeout(limit, limited.read_to_end(&mut bytes)).await {
    Ok(read) => {
      read?;
      Ok(bytes)
    }
    Err(_) => Err(TransportError::Timeout(Socket::new(
      Host::IP(peer.ip()),
      peer.port(),
    ))),
  }
}

impl Node {
  /// Receives one envelope per bulk connection. The sender closes the connection to mark the
  /// end of the envelope.
  pub(crate) async fn tcp_receiver(self, listener: TcpListener) {
    loop {
      let (mut conn, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
          warn!(node = self.id(), "bulk accept failed: {}", e);
          continue;
        }
      };
      let node = self.clone();
      tokio::spawn(async move {
        let bytes = match read_envelope(&mut conn, peer, READ_TIMEOUT).await {
          Ok(bytes) => bytes,
          Err(e) => {
            warn!(node = node.id(), from = %peer, "bulk read failed: {}", e);
            return;
          }
        };
        match Envelope::decode(&bytes) {
          Ok(env) => node.deliver(env),
          Err(e) => debug!(node = node.id(), from = %peer, "malformed envelope dropped: {}", e),
        }
      });
    }
  }
}

#[tokio::test]
async fn test_read_envelope_until_close_or_timeout() {
  use tokio::io::AsyncWriteExt;

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  let mut closed = TcpStream::connect(addr).await.unwrap();
  let (mut conn, peer) = listener.accept().await.unwrap();
  closed.write_all(b"{\"whole\":true}").await.unwrap();
  closed.shutdown().await.unwrap();
  let bytes = read_envelope(&mut conn, peer, Duration::from_secs(5)).await.unwrap();
  assert_eq!(bytes, b"{\"whole\":true}".to_vec());

  // A sender that never closes its end runs into the limit.
  let mut open = TcpStream::connect(addr).await.unwrap();
  let (mut conn, peer) = listener.accept().await.unwrap();
  open.write_all(b"{\"partial\"").await.unwrap();
  let res = read_envelope(&mut conn, peer, Duration::from_millis(100)).await;
  assert!(matches!(res, Err(TransportError::Timeout(_))));
}
