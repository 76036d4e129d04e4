use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::ReliableDatagramConfig;
use crate::delivery::{DatagramEvent, DatagramEventNotifier, DeliveryFailureListener, Inbox, ReceivedMessage};
use crate::duplicate_cache::DuplicateCache;
use crate::error::DatagramError;
use crate::fragmentation::{split_into_fragments, Reassembler};
use crate::random::{RandomSequenceNumbers, SequenceNumberSource};
use crate::resend_tracker::ResendTracker;
use crate::send_socket::DatagramSocket;
use crate::stream_id::{SequenceNumber, StreamId};
use crate::wire_message::{max_fragment_payload_len, AckMessage, FragmentMessage, WireMessage};

/// The application facing API. It is independent of the actual transport: outgoing datagrams
///  go through a [DatagramSocket], and incoming datagrams are passed in through
///  [ReliableDatagramClient::on_datagram_received]. See [crate::udp::UdpEndPoint] for the
///  wiring with a UDP socket.
///
/// The client does not run any background tasks by itself: [ReliableDatagramClient::run_resend_loop]
///  must be running for re-sends to happen (or [ReliableDatagramClient::on_resend_tick] must
///  be called periodically).
pub struct ReliableDatagramClient {
    config: Arc<ReliableDatagramConfig>,
    socket: Arc<dyn DatagramSocket>,
    tracker: ResendTracker,
    reassembler: Mutex<Reassembler>,
    duplicates: Mutex<DuplicateCache<StreamId>>,
    inbox: Inbox,
    event_notifier: DatagramEventNotifier,
    failure_listeners: RwLock<Vec<Arc<dyn DeliveryFailureListener>>>,
}

impl ReliableDatagramClient {
    pub fn new(config: Arc<ReliableDatagramConfig>, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<ReliableDatagramClient> {
        Self::with_sequence_numbers(config, socket, Arc::new(RandomSequenceNumbers {}))
    }

    pub fn with_sequence_numbers(
        config: Arc<ReliableDatagramConfig>,
        socket: Arc<dyn DatagramSocket>,
        sequence_numbers: Arc<dyn SequenceNumberSource>,
    ) -> anyhow::Result<ReliableDatagramClient> {
        config.validate()?;

        Ok(ReliableDatagramClient {
            tracker: ResendTracker::new(config.resend_limit, socket.clone(), sequence_numbers),
            reassembler: Mutex::new(Reassembler::new(config.max_fragment_count(), config.max_pending_inbound_streams)),
            duplicates: Mutex::new(DuplicateCache::new(config.duplicate_cache_capacity)),
            inbox: Inbox::new(config.inbox_capacity),
            event_notifier: DatagramEventNotifier::new(config.event_channel_capacity),
            failure_listeners: Default::default(),
            socket,
            config,
        })
    }

    pub fn config(&self) -> &ReliableDatagramConfig {
        self.config.as_ref()
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Sends a message, returning its sequence number once all fragments were handed to the
    ///  socket. This does *not* wait for acknowledgements: delivery is pursued in the
    ///  background, and a failure to deliver is reported to failure listeners and through
    ///  [DatagramEvent::DeliveryFailed].
    ///
    /// Without an explicit destination, the configured default destination is used.
    pub async fn send(&self, payload: &[u8], destination: Option<SocketAddr>) -> Result<SequenceNumber, DatagramError> {
        let destination = destination
            .or(self.config.default_destination)
            .ok_or(DatagramError::NoDestination)?;

        let max_message_size = self.config.max_message_size;
        if payload.len() > max_message_size {
            return Err(DatagramError::MessageTooLarge { len: payload.len(), max: max_message_size });
        }

        let max_datagram_size = self.config.max_datagram_size;
        self.tracker.send_new_stream(destination, |sequence_number| {
            let fragment_len = max_fragment_payload_len(max_datagram_size, sequence_number, payload.len());
            let chunks = split_into_fragments(payload, fragment_len);
            let fragment_count = u32::try_from(chunks.len())
                .map_err(|_| DatagramError::MessageTooLarge { len: payload.len(), max: max_message_size })?;

            Ok(chunks.into_iter()
                .zip(1..)
                .map(|(chunk, fragment_index)| FragmentMessage::ser(sequence_number, fragment_index, fragment_count, chunk))
                .collect())
        }).await
    }

    /// Waits for the next message without a time limit
    pub async fn receive(&self) -> Result<ReceivedMessage, DatagramError> {
        self.inbox.receive(None).await
    }

    /// Waits for the next message, returning [DatagramError::Timeout] if none arrives in time
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<ReceivedMessage, DatagramError> {
        self.inbox.receive(Some(timeout)).await
    }

    /// Events are sent in addition to handing messages to receivers and failures to listeners,
    ///  so subscribing does not take anything away from them
    pub fn subscribe(&self) -> broadcast::Receiver<DatagramEvent> {
        self.event_notifier.subscribe()
    }

    pub async fn add_delivery_failure_listener(&self, listener: Arc<dyn DeliveryFailureListener>) {
        self.failure_listeners.write().await
            .push(listener);
    }

    pub async fn pending_outbound_streams(&self) -> usize {
        self.tracker.num_pending().await
    }

    pub async fn pending_inbound_streams(&self) -> usize {
        self.reassembler.lock().await.num_pending()
    }

    /// Entry point for all datagrams received by the transport. Unparsable datagrams are
    ///  logged and dropped.
    pub async fn on_datagram_received(&self, buf: &[u8], from: SocketAddr) {
        let message = match WireMessage::deser(buf) {
            Ok(message) => message,
            Err(e) => {
                warn!("received unparsable datagram from {:?} - dropping: {}", from, e);
                return;
            }
        };

        match message {
            WireMessage::Ack(ack) => self.tracker.acknowledge(from, ack).await,
            WireMessage::Fragment(fragment) => self.on_fragment_received(fragment, from).await,
        }
    }

    async fn on_fragment_received(&self, fragment: FragmentMessage, from: SocketAddr) {
        trace!("received fragment {}/{} of message #{} from {:?}", fragment.fragment_index, fragment.fragment_count, fragment.sequence_number, from);

        let stream_id = StreamId::new(from, fragment.sequence_number);

        // the duplicate cache stays locked until a completed message is remembered, so a
        //  fragment arriving concurrently can not start a second reassembly of the same message
        let complete = {
            let mut duplicates = self.duplicates.lock().await;
            if duplicates.seen(&stream_id) {
                debug!("fragment {} of already delivered message {:?} - ignoring", fragment.fragment_index, stream_id);
                None
            }
            else {
                let mut reassembler = self.reassembler.lock().await;
                if !reassembler.admits(&stream_id, fragment.fragment_count) {
                    // no acknowledgement: the fragment was not stored
                    return;
                }

                let complete = reassembler.accept_fragment(stream_id, fragment.fragment_index, fragment.fragment_count, &fragment.payload, Instant::now());
                if complete.is_some() {
                    duplicates.remember(stream_id);
                }
                complete
            }
        };

        // acknowledge duplicates too: the sender keeps re-sending until it gets an ack
        let ack = AckMessage {
            sequence_number: fragment.sequence_number,
            fragment_index: fragment.fragment_index,
        };
        if let Err(e) = self.socket.send_datagram(from, &ack.ser()).await {
            warn!("error sending acknowledgement to {:?}: {}", from, e);
        }

        let Some(payload) = complete else {
            return;
        };

        debug!("delivering message {:?} ({} bytes)", stream_id, payload.len());
        let message = ReceivedMessage {
            sender: from,
            sequence_number: fragment.sequence_number,
            payload: Bytes::from(payload),
        };
        self.event_notifier.send_event(DatagramEvent::MessageArrived(message.clone()));
        self.inbox.deliver(message).await;
    }

    /// Performs a single resend sweep: re-sends unacknowledged fragments, reports messages that
    ///  exceeded the resend limit and discards incomplete incoming messages that went stale.
    pub async fn on_resend_tick(&self) {
        let failures = self.tracker.on_resend_tick().await;
        if !failures.is_empty() {
            let listeners = self.failure_listeners.read().await.clone();
            for failure in failures {
                warn!("giving up on message #{} to {:?}: no acknowledgement after {} attempts", failure.sequence_number, failure.destination, self.config.resend_limit);
                for listener in &listeners {
                    listener.on_delivery_failed(failure).await;
                }
                self.event_notifier.send_event(DatagramEvent::DeliveryFailed(failure));
            }
        }

        let num_purged = self.reassembler.lock().await
            .purge_stale(Instant::now(), self.config.reassembly_timeout);
        if num_purged > 0 {
            debug!("discarded {} stale incomplete message(s)", num_purged);
        }
    }

    /// Calls [ReliableDatagramClient::on_resend_tick] every `resend_interval`. This never
    ///  returns, it is meant to be spawned or raced against other loops.
    pub async fn run_resend_loop(&self) {
        let mut resend_ticks = time::interval(self.config.resend_interval);
        resend_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // the first tick completes immediately, and there is nothing to re-send yet
        resend_ticks.tick().await;
        loop {
            resend_ticks.tick().await;
            self.on_resend_tick().await;
        }
    }
}
