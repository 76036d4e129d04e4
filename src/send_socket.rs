use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a datagram, introduced to decouple the protocol logic from
///  actual network I/O and to facilitate mocking the I/O part away for testing.
///
/// Sending is best effort: a successful send does not imply delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        let num_sent = self.send_to(buf, to).await?;
        if num_sent != buf.len() {
            anyhow::bail!("UDP socket sent only {} of {} bytes", num_sent, buf.len());
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}
