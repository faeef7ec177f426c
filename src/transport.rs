use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::identity::Identity;

/// This is an abstraction for handing a framed packet to the underlying message
///  transport, introduced to facilitate mocking the I/O part away for testing.
///
/// Delivery is best effort: a `true` return value means the transport accepted the
///  message, not that the peer received it - loss recovery lives entirely in this
///  crate's retransmission machinery. A `false` return value means the transport
///  could not even accept the message locally, which is fatal for the connection.
///
/// The inbound direction is push-based: the embedder wires the transport's
///  per-message callback to [`ConnectionManager::on_message`](crate::ConnectionManager::on_message).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: &Identity, payload: &[u8], local_port: u16, remote_port: u16) -> bool;
}
