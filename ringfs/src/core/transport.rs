use crate::core::{Channel, Envelope, EnvelopeError, Socket};
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// Largest payload a control datagram may carry.
pub const MAX_DATAGRAM: usize = 65_507;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),
  #[error(transparent)]
  Envelope(#[from] EnvelopeError),
  #[error("{0} byte envelope does not fit in a datagram")]
  TooLarge(usize),
  #[error("connection to {0} timed out")]
  Timeout(Socket),
  #[error("node {0} is not in the directory")]
  UnknownNode(u64),
}

/// How a [`Node`](crate::core::Node) puts envelopes on the network.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  /// Sends a datagram to the control port of `to`. Delivery is not confirmed.
  async fn datagram(&self, to: &Socket, env: &Envelope) -> Result<(), TransportError>;

  /// Opens a connection to the bulk port of `to`, writes the envelope and closes it. Fails if the
  /// peer cannot be reached.
  async fn stream(&self, to: &Socket, env: &Envelope) -> Result<(), TransportError>;
}

/// Sends over real sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetTransport;

#[async_trait]
impl Transport for NetTransport {
  async fn datagram(&self, to: &Socket, env: &Envelope) -> Result<(), TransportError> {
    let bytes = env.encode()?;
    if bytes.len() > MAX_DATAGRAM {
      return Err(TransportError::TooLarge(bytes.len()));
    }
    let addr = to.resolve(Channel::Control).await?;
    let udp = UdpSocket::bind(unspecified(&addr)).await?;
    udp.send_to(&bytes, addr).await?;
    Ok(())
  }

  async fn stream(&self, to: &Socket, env: &Envelope) -> Result<(), TransportError> {
    let bytes = env.encode()?;
    let mut conn = connect(to, Channel::Bulk).await?;
    conn.write_all(&bytes).await?;
    conn.shutdown().await?;
    Ok(())
  }
}

/// Connects to one of the stream channels of `to`, bounded by a fixed timeout.
pub(crate) async fn connect(to: &Socket, chan: Channel) -> Result<TcpStream, TransportError> {
  let addr = to.resolve(chan).await?;
  match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
    Ok(conn) => Ok(conn?),
    Err(_) => Err(TransportError::Timeout(to.clone())),
  }
}

pub(crate) fn unspecified(peer: &SocketAddr) -> SocketAddr {
  match peer {
    SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
    SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
  }
}
