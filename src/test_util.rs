//! Utilities for testing code built on top of this crate. They are part of the regular
//!  (non-#[cfg(test)]) code so application tests can use them as well.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::send_socket::DatagramSocket;
use crate::wire_message::WireMessage;

/// convenience function for test code: create an address based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], number))
}

/// A [DatagramSocket] that does no I/O but records all datagrams sent through it
pub struct TrackingDatagramSocket {
    myself: SocketAddr,
    sent: Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>,
    fail_sends: AtomicBool,
}

impl TrackingDatagramSocket {
    pub fn new(myself: SocketAddr) -> TrackingDatagramSocket {
        TrackingDatagramSocket {
            myself,
            sent: Default::default(),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Sends still get recorded, but they report an error to the caller
    pub fn set_fail_sends(&self, fail_sends: bool) {
        self.fail_sends.store(fail_sends, Ordering::Release);
    }

    /// returns sent datagrams, clearing the internal buffer
    pub async fn sent_datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut lock = self.sent.lock().await;
        std::mem::take(&mut *lock)
    }

    /// returns sent datagrams decoded, clearing the internal buffer
    pub async fn sent_messages(&self) -> Vec<(SocketAddr, WireMessage)> {
        self.sent_datagrams().await
            .into_iter()
            .map(|(to, buf)| (to, WireMessage::deser(&buf).expect("only valid datagrams should be sent")))
            .collect()
    }

    pub async fn assert_nothing_sent(&self) {
        let sent = self.sent.lock().await;
        assert!(sent.is_empty(), "expected no datagrams, found {:?}", sent);
    }
}

#[async_trait]
impl DatagramSocket for TrackingDatagramSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.sent.lock().await.push((to, buf.to_vec()));
        if self.fail_sends.load(Ordering::Acquire) {
            anyhow::bail!("simulated send failure");
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.myself
    }
}
