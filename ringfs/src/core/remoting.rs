use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::{fmt, str::FromStr};
use thiserror::Error;
use tokio::net::lookup_host;

/// The DNS name or IP address of the machine hosting a [`Node`](crate::core::Node).
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize)]
pub enum Host {
  DNS(String),
  IP(IpAddr),
}
impl From<String> for Host {
  fn from(s: String) -> Self {
    match IpAddr::from_str(s.as_str()) {
      Ok(ip) => Host::IP(ip),
      Err(_) => Host::DNS(s),
    }
  }
}
impl From<&str> for Host {
  fn from(s: &str) -> Self {
    Host::from(s.to_string())
  }
}
impl fmt::Display for Host {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Host::DNS(s) => write!(f, "{}", s),
      Host::IP(ip) => write!(f, "{}", ip),
    }
  }
}

/// One of the four listeners a [`Node`](crate::core::Node) runs.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Channel {
  /// Datagrams carrying control envelopes.
  Control,
  /// Streams carrying one large envelope each.
  Bulk,
  /// File transfers landing in the scratch directory.
  Scratch,
  /// File transfers landing in the replicated store directory.
  Store,
}
impl Channel {
  pub const ALL: [Channel; 4] =
    [Channel::Control, Channel::Bulk, Channel::Scratch, Channel::Store];

  /// Distance of this channel's port from the node's base port.
  pub fn offset(self) -> u16 {
    match self {
      Channel::Control => 0,
      Channel::Bulk => 1,
      Channel::Scratch => 2,
      Channel::Store => 3,
    }
  }
}

/// The remote address of a [`Node`](crate::core::Node). The `port` is the control port; the other
/// channels sit at fixed offsets above it.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd)]
pub struct Socket {
  /// The DNS name or IP address of the machine hosting the [`Node`](crate::core::Node).
  pub host: Host,
  /// The base port. Must leave room for [`Channel::Store`]'s offset.
  pub port: u16,
}
impl Socket {
  /// Creates a new [`Socket`]
  pub fn new(host: Host, port: u16) -> Socket {
    Socket {
      host: host,
      port: port,
    }
  }

  pub fn localhost(port: u16) -> Socket {
    Socket::new(Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST)), port)
  }

  pub fn port(&self, chan: Channel) -> u16 {
    self.port.saturating_add(chan.offset())
  }

  /// Resolves the address of one channel of this [`Socket`]. If the [`Host`] is a DNS name, this
  /// performs a lookup and picks the first IPv4 answer.
  pub async fn resolve(&self, chan: Channel) -> io::Result<SocketAddr> {
    let port = self.port(chan);
    match &self.host {
      Host::IP(ip) => Ok(SocketAddr::new(*ip, port)),
      Host::DNS(s) => lookup_host((s.as_str(), port))
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| {
          io::Error::new(
            io::ErrorKind::NotFound,
            format!("no IPv4 resolution for {}", s),
          )
        }),
    }
  }
}
impl fmt::Display for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}
impl Default for Socket {
  fn default() -> Self {
    Socket::new(Host::IP(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), 7000)
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseSocketError {
  #[error("address {0:?} has no port")]
  MissingPort(String),
  #[error("address {0:?} has an invalid port")]
  BadPort(String),
}

impl FromStr for Socket {
  type Err = ParseSocketError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (host, port) = s
      .rsplit_once(':')
      .ok_or_else(|| ParseSocketError::MissingPort(s.to_string()))?;
    let port = port
      .parse::<u16>()
      .map_err(|_| ParseSocketError::BadPort(s.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(Socket::new(Host::from(host), port))
  }
}

#[test]
fn test_socket_display_parse() {
  let socket = Socket::localhost(7000);
  assert_eq!(socket.to_string(), "127.0.0.1:7000");
  assert_eq!("127.0.0.1:7000".parse::<Socket>(), Ok(socket.clone()));
  assert_eq!(socket.port(Channel::Store), 7003);

  let dns = "vm-01.cluster:7100".parse::<Socket>().unwrap();
  assert_eq!(dns.host, Host::DNS("vm-01.cluster".to_string()));
  assert_eq!(dns.port(Channel::Bulk), 7101);

  assert!("no-port".parse::<Socket>().is_err());
  assert!("host:99999".parse::<Socket>().is_err());
}
