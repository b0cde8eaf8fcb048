use crate::core::{Envelope, Message, Node, MAX_DATAGRAM};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

impl Node {
  /// Receives control datagrams. Join requests are answered through the same socket, since the
  /// joining node does not have a listener yet.
  pub(crate) async fn udp_receiver(self, udp: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
      let (len, src) = match udp.recv_from(&mut buf).await {
        Ok(received) => received,
        Err(e) => {
          warn!(node = self.id(), "control receive failed: {}", e);
          continue;
        }
      };
      let env = match Envelope::decode(&buf[..len]) {
        Ok(env) => env,
        Err(e) => {
          debug!(node = self.id(), from = %src, "malformed datagram dropped: {}", e);
          continue;
        }
      };
      match &env.msg {
        Message::JoinReq(endpoint) => {
          let node = self.clone();
          let endpoint = endpoint.clone();
          let reply = udp.clone();
          tokio::spawn(async move { node.admit(endpoint, reply, src).await });
        }
        _ => self.deliver(env),
      }
    }
  }
}
