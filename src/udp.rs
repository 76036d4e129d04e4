use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tracing::{error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::client::ReliableDatagramClient;
use crate::config::ReliableDatagramConfig;

/// Binds a [ReliableDatagramClient] to a UDP socket: datagrams received on the socket are passed
///  to the client, and the client sends through the same socket.
pub struct UdpEndPoint {
    socket: Arc<UdpSocket>,
    client: Arc<ReliableDatagramClient>,
}

impl UdpEndPoint {
    pub async fn bind(config: Arc<ReliableDatagramConfig>) -> anyhow::Result<UdpEndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        let client = Arc::new(ReliableDatagramClient::new(config, Arc::new(socket.clone()))?);
        Ok(UdpEndPoint {
            socket,
            client,
        })
    }

    pub fn client(&self) -> Arc<ReliableDatagramClient> {
        self.client.clone()
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs the receive loop and the resend loop until the future is dropped
    pub async fn run(&self) {
        select! {
            _ = self.recv_loop() => {}
            _ = self.client.run_resend_loop() => {}
        }
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        // one extra byte to notice datagrams that exceed the maximum size
        let mut buf = vec![0u8; self.client.config().max_datagram_size + 1];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

            async {
                trace!("received {} bytes from {:?}", num_read, from);
                if num_read > self.client.config().max_datagram_size {
                    // truncated by the receive buffer
                    trace!("datagram from {:?} exceeds the maximum datagram size - dropping", from);
                    return;
                }
                self.client.on_datagram_received(&buf[..num_read], from).await;
            }
                .instrument(span)
                .await;
        }
    }
}
