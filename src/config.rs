use std::cmp::max;
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

use crate::wire_message::MAX_FRAGMENT_HEADER_LEN;

pub struct ReliableDatagramConfig {
    /// The address that the UDP socket is bound to. This is used by [crate::udp::UdpEndPoint]
    ///  only, the client itself does not care about its own address.
    pub self_addr: SocketAddr,

    /// This is the maximum size of a single datagram, including the fragment header. No datagram
    ///  bigger than this is ever sent, and bigger messages are split into several fragments.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. Choosing this value too big causes
    ///  datagrams to be fragmented on the IP level or dropped altogether.
    pub max_datagram_size: usize,

    /// The destination for messages that are sent without an explicit destination
    pub default_destination: Option<SocketAddr>,

    /// Interval for checking unacknowledged fragments. Each fragment that is still
    ///  unacknowledged when this timer fires is sent again.
    pub resend_interval: Duration,

    /// The maximum number of times a fragment is sent (including the initial send) before the
    ///  message is given up
    pub resend_limit: u32,

    /// The number of delivered messages that are remembered to suppress duplicates. Messages
    ///  are evicted in the order they were delivered.
    pub duplicate_cache_capacity: usize,

    /// The largest message that can be sent
    pub max_message_size: usize,

    /// Incomplete incoming messages are discarded if no fragment arrived for this duration
    pub reassembly_timeout: Duration,

    /// The maximum number of incomplete incoming messages. Fragments starting another message
    ///  beyond that are dropped without acknowledgement, so their senders re-send them later.
    pub max_pending_inbound_streams: usize,

    /// Received messages are buffered until the application picks them up, up to this number.
    ///  Beyond that, the oldest buffered message is discarded.
    pub inbox_capacity: usize,

    pub event_channel_capacity: usize,
}

impl ReliableDatagramConfig {
    /// ipv4 with end-to-end full Ethernet MTU, without optional headers
    pub fn default_ipv4(self_addr: SocketAddr) -> ReliableDatagramConfig {
        ReliableDatagramConfig {
            self_addr,
            max_datagram_size: 1472,
            default_destination: None,
            resend_interval: Duration::from_millis(50),
            resend_limit: 50,
            duplicate_cache_capacity: 1000,
            max_message_size: 16*1024*1024,
            reassembly_timeout: Duration::from_secs(10),
            max_pending_inbound_streams: 1024,
            inbox_capacity: 1024,
            event_channel_capacity: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= MAX_FRAGMENT_HEADER_LEN {
            bail!("max datagram size of {} does not leave room for payload after a fragment header of up to {} bytes", self.max_datagram_size, MAX_FRAGMENT_HEADER_LEN);
        }
        if self.resend_interval.is_zero() {
            bail!("resend interval must be positive");
        }
        if self.resend_limit == 0 {
            bail!("resend limit must allow at least one send attempt");
        }
        if self.duplicate_cache_capacity == 0 {
            bail!("duplicate cache capacity must be positive");
        }
        if self.max_message_size > u32::MAX as usize {
            bail!("max message size must fit into u32");
        }
        if self.max_pending_inbound_streams == 0 {
            bail!("max pending inbound streams must be positive");
        }
        if self.inbox_capacity == 0 {
            bail!("inbox capacity must be positive");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must be positive");
        }
        Ok(())
    }

    /// The highest fragment count of a message up to [ReliableDatagramConfig::max_message_size],
    ///  assuming the smallest possible payload per fragment. Incoming fragments claiming more
    ///  are rejected, which relies on peers sharing the message size limit.
    pub fn max_fragment_count(&self) -> u32 {
        let min_payload_len = max(self.max_datagram_size.saturating_sub(MAX_FRAGMENT_HEADER_LEN), 1);
        let count = max(self.max_message_size.div_ceil(min_payload_len), 1);
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}
