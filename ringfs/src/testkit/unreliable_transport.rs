use crate::core::{Envelope, NetTransport, Socket, Transport, TransportError};
use crate::testkit::FailureConfigMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

/// A [`Transport`] that drops and delays datagrams and cuts off streams according to a
/// [`FailureConfigMap`], which can be changed while the nodes run.
#[derive(Clone, Default)]
pub struct UnreliableTransport {
  failures: Arc<RwLock<FailureConfigMap>>,
  inner: NetTransport,
}
impl UnreliableTransport {
  pub fn new(failures: FailureConfigMap) -> UnreliableTransport {
    UnreliableTransport {
      failures: Arc::new(RwLock::new(failures)),
      inner: NetTransport,
    }
  }

  pub fn set(&self, failures: FailureConfigMap) {
    *self.failures.write() = failures;
  }
}

#[async_trait]
impl Transport for UnreliableTransport {
  async fn datagram(&self, to: &Socket, env: &Envelope) -> Result<(), TransportError> {
    let fail_cfg = *self.failures.read().get(to);
    let mut rng = SmallRng::from_entropy();
    if rng.gen::<f64>() < fail_cfg.drop_prob {
      trace!(to = %to, kind = %env.kind(), "datagram dropped");
      return Ok(());
    }
    let delay = fail_cfg.delay.map(|(min, max)| {
      let range = min.as_millis()..=max.as_millis().max(min.as_millis());
      Duration::from_millis(rng.gen_range(range) as u64)
    });
    match delay {
      Some(delay) => {
        let to = to.clone();
        let env = env.clone();
        let inner = self.inner;
        tokio::spawn(async move {
          sleep(delay).await;
          let _ = inner.datagram(&to, &env).await;
        });
        Ok(())
      }
      None => self.inner.datagram(to, env).await,
    }
  }

  async fn stream(&self, to: &Socket, env: &Envelope) -> Result<(), TransportError> {
    if self.failures.read().get(to).unreachable {
      return Err(
        io::Error::new(io::ErrorKind::ConnectionRefused, format!("{} cut off", to)).into(),
      );
    }
    self.inner.stream(to, env).await
  }
}

#[tokio::test]
async fn test_dropped_and_cut_off() {
  use crate::core::Message;
  use crate::testkit::FailureConfig;
  use tokio::net::UdpSocket;
  use tokio::time::timeout;

  let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  let to = Socket::localhost(listener.local_addr().unwrap().port());
  let mut failures = FailureConfigMap::default();
  failures.node_wide.insert(
    to.clone(),
    FailureConfig {
      drop_prob: 1.0,
      delay: None,
      unreachable: true,
    },
  );
  let transport = UnreliableTransport::new(failures);
  let env = Envelope::new(0, Message::Heartbeat);

  transport.datagram(&to, &env).await.unwrap();
  assert!(transport.stream(&to, &env).await.is_err());
  let mut buf = [0u8; 1024];
  let recv = timeout(Duration::from_millis(200), listener.recv_from(&mut buf)).await;
  assert!(recv.is_err());

  transport.set(FailureConfigMap::default());
  transport.datagram(&to, &env).await.unwrap();
  let recv = timeout(Duration::from_secs(2), listener.recv_from(&mut buf)).await;
  assert!(recv.is_ok());
}
