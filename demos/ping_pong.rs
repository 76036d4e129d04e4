use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use reliable_datagram::config::ReliableDatagramConfig;
use reliable_datagram::delivery::DeliveryFailureListener;
use reliable_datagram::resend_tracker::DeliveryFailure;
use reliable_datagram::udp::UdpEndPoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, span, warn, Instrument, Level};

/// Two endpoints on localhost exchanging ping and pong messages
#[derive(Parser, Debug)]
struct Args {
    #[clap(long, default_value_t = 9100)]
    port_a: u16,
    #[clap(long, default_value_t = 9101)]
    port_b: u16,
    /// number of ping / pong exchanges
    #[clap(long, default_value_t = 5)]
    rounds: u32,
    /// size of each ping; anything above a single datagram is split into fragments
    #[clap(long, default_value_t = 4000)]
    message_size: usize,
    #[clap(long, default_value_t = false)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::TRACE } else { Level::INFO })
        .with_thread_ids(true)
        .try_init()
        .ok();
}

struct LoggingFailureListener {}
#[async_trait]
impl DeliveryFailureListener for LoggingFailureListener {
    async fn on_delivery_failed(&self, failure: DeliveryFailure) {
        warn!("message #{} to {:?} could not be delivered", failure.sequence_number, failure.destination);
    }
}

async fn start(self_addr: SocketAddr, peer_addr: SocketAddr, name: &'static str) -> anyhow::Result<Arc<UdpEndPoint>> {
    let mut config = ReliableDatagramConfig::default_ipv4(self_addr);
    config.default_destination = Some(peer_addr);

    let end_point = Arc::new(UdpEndPoint::bind(Arc::new(config))
        .instrument(span!(Level::INFO, "node", name))
        .await?);
    end_point.client().add_delivery_failure_listener(Arc::new(LoggingFailureListener {})).await;

    let cloned = end_point.clone();
    tokio::spawn(async move {
        cloned.run()
            .instrument(span!(Level::INFO, "node", name))
            .await
    });
    Ok(end_point)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let addr_a = SocketAddr::from(([127, 0, 0, 1], args.port_a));
    let addr_b = SocketAddr::from(([127, 0, 0, 1], args.port_b));

    let a = start(addr_a, addr_b, "a").await?;
    let b = start(addr_b, addr_a, "b").await?;

    let b_client = b.client();
    tokio::spawn(async move {
        loop {
            let Ok(ping) = b_client.receive().await else {
                return;
            };
            info!("b: received ping #{} with {} bytes", ping.sequence_number, ping.payload.len());
            let pong = format!("pong {}", ping.payload.len());
            if let Err(e) = b_client.send(pong.as_bytes(), None).await {
                warn!("b: error sending pong: {}", e);
            }
        }
    });

    let a_client = a.client();
    for round in 1..=args.rounds {
        let ping = (0..args.message_size).map(|i| b'a' + (i % 26) as u8).collect::<Vec<_>>();
        let sequence_number = a_client.send(&ping, None).await?;
        info!("a: sent ping #{} (round {})", sequence_number, round);

        let pong = a_client.receive_timeout(Duration::from_secs(2)).await?;
        info!("a: received {:?}", String::from_utf8_lossy(&pong.payload));
    }

    Ok(())
}
