use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::error::DatagramError;
use crate::random::SequenceNumberSource;
use crate::send_socket::DatagramSocket;
use crate::stream_id::SequenceNumber;
use crate::wire_message::AckMessage;

/// The number of random draws for an unused sequence number before giving up. With sequence
///  numbers drawn from the full i64 range, a single collision is already highly unlikely.
const MAX_SEQUENCE_NUMBER_DRAWS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub destination: SocketAddr,
    pub sequence_number: SequenceNumber,
}

struct OutboundFragment {
    datagram: Bytes,
    acknowledged: bool,
    /// the initial send counts as the first attempt
    send_count: u32,
}

struct OutboundStream {
    destination: SocketAddr,
    fragments: Vec<OutboundFragment>,
}
impl OutboundStream {
    fn is_complete(&self) -> bool {
        self.fragments.iter().all(|f| f.acknowledged)
    }
}

/// Keeps every sent fragment until it is acknowledged, re-sending unacknowledged fragments
///  on each tick. If a fragment reaches the resend limit without being acknowledged, the entire
///  message is given up.
///
/// A message is tracked under its sequence number only: sequence numbers are unique among the
///  messages in flight, and acknowledgements are checked against the message's destination.
pub struct ResendTracker {
    resend_limit: u32,
    socket: Arc<dyn DatagramSocket>,
    sequence_numbers: Arc<dyn SequenceNumberSource>,
    streams: RwLock<FxHashMap<SequenceNumber, OutboundStream>>,
}

impl ResendTracker {
    pub fn new(resend_limit: u32, socket: Arc<dyn DatagramSocket>, sequence_numbers: Arc<dyn SequenceNumberSource>) -> ResendTracker {
        ResendTracker {
            resend_limit,
            socket,
            sequence_numbers,
            streams: Default::default(),
        }
    }

    pub async fn num_pending(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Picks an unused sequence number, has `encode` create the message's fragments for it,
    ///  registers them and sends them. Send failures are logged, and they count as the first
    ///  send attempt.
    pub async fn send_new_stream<F>(&self, destination: SocketAddr, encode: F) -> Result<SequenceNumber, DatagramError>
    where F: FnOnce(SequenceNumber) -> Result<Vec<Bytes>, DatagramError>
    {
        let (sequence_number, datagrams) = {
            let mut streams = self.streams.write().await;

            let mut sequence_number = None;
            for _ in 0..MAX_SEQUENCE_NUMBER_DRAWS {
                let candidate = self.sequence_numbers.next_sequence_number();
                if streams.contains_key(&candidate) {
                    debug!("sequence number {} is in use, drawing again", candidate);
                    continue;
                }
                sequence_number = Some(candidate);
                break;
            }
            let sequence_number = sequence_number.ok_or(DatagramError::SequenceNumbersExhausted)?;

            let datagrams = encode(sequence_number)?;
            streams.insert(sequence_number, OutboundStream {
                destination,
                fragments: datagrams.iter()
                    .map(|datagram| OutboundFragment {
                        datagram: datagram.clone(),
                        acknowledged: false,
                        send_count: 1,
                    })
                    .collect(),
            });
            (sequence_number, datagrams)
        };

        debug!("sending message #{} to {:?} in {} fragment(s)", sequence_number, destination, datagrams.len());
        for datagram in datagrams {
            if let Err(e) = self.socket.send_datagram(destination, &datagram).await {
                warn!("error sending fragment of message #{} to {:?}, leaving it to the resend timer: {}", sequence_number, destination, e);
            }
        }
        Ok(sequence_number)
    }

    /// Marks a fragment as acknowledged. Acknowledgements for messages that are no longer
    ///  tracked (because they completed or failed) are ignored, and so are repeated
    ///  acknowledgements.
    pub async fn acknowledge(&self, from: SocketAddr, ack: AckMessage) {
        let mut streams = self.streams.write().await;

        let Some(stream) = streams.get_mut(&ack.sequence_number) else {
            trace!("acknowledgement from {:?} for message #{} which is not in flight (anymore) - ignoring", from, ack.sequence_number);
            return;
        };
        if stream.destination != from {
            warn!("acknowledgement for message #{} from {:?}, but it was sent to {:?} - ignoring", ack.sequence_number, from, stream.destination);
            return;
        }

        let num_fragments = stream.fragments.len();
        let Some(fragment) = usize::try_from(ack.fragment_index).ok()
            .and_then(|index| index.checked_sub(1))
            .and_then(|offset| stream.fragments.get_mut(offset))
        else {
            warn!("acknowledgement from {:?} for fragment {} of message #{} which has only {} fragments - ignoring", from, ack.fragment_index, ack.sequence_number, num_fragments);
            return;
        };

        trace!("fragment {} of message #{} acknowledged by {:?}", ack.fragment_index, ack.sequence_number, from);
        fragment.acknowledged = true;

        if stream.is_complete() {
            debug!("message #{} to {:?}: all fragments acknowledged", ack.sequence_number, from);
            streams.remove(&ack.sequence_number);
        }
    }

    /// Re-sends all unacknowledged fragments that have attempts left, and gives up messages
    ///  with a fragment that has none left, returning those.
    ///
    /// Re-sends are collected while holding the lock and sent afterwards, so acknowledgements
    ///  and new messages are never blocked by network I/O.
    pub async fn on_resend_tick(&self) -> Vec<DeliveryFailure> {
        let mut resends = Vec::new();
        let mut failures = Vec::new();

        {
            let mut streams = self.streams.write().await;
            streams.retain(|&sequence_number, stream| {
                if stream.is_complete() {
                    return false;
                }

                if stream.fragments.iter().any(|f| !f.acknowledged && f.send_count >= self.resend_limit) {
                    debug!("message #{} to {:?} exceeded the resend limit of {} - giving up", sequence_number, stream.destination, self.resend_limit);
                    failures.push(DeliveryFailure {
                        destination: stream.destination,
                        sequence_number,
                    });
                    return false;
                }

                for fragment in stream.fragments.iter_mut().filter(|f| !f.acknowledged) {
                    fragment.send_count += 1;
                    resends.push((stream.destination, fragment.datagram.clone()));
                }
                true
            });
        }

        if !resends.is_empty() {
            trace!("re-sending {} unacknowledged fragment(s)", resends.len());
        }
        for (destination, datagram) in resends {
            if let Err(e) = self.socket.send_datagram(destination, &datagram).await {
                warn!("error re-sending fragment to {:?}: {}", destination, e);
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::fixed_sequence_numbers;
    use crate::send_socket::MockDatagramSocket;
    use crate::test_util::{test_addr_from_number, TrackingDatagramSocket};
    use crate::wire_message::{FragmentMessage, WireMessage};
    use rstest::rstest;

    fn encode_fragments(payloads: Vec<&'static str>) -> impl FnOnce(SequenceNumber) -> Result<Vec<Bytes>, DatagramError> {
        move |seq| {
            let count = payloads.len() as u32;
            Ok(payloads.iter()
                .enumerate()
                .map(|(i, p)| FragmentMessage::ser(seq, i as u32 + 1, count, p.as_bytes()))
                .collect())
        }
    }

    fn tracker(resend_limit: u32, socket: Arc<TrackingDatagramSocket>, sequence_numbers: Vec<SequenceNumber>) -> ResendTracker {
        ResendTracker::new(resend_limit, socket, fixed_sequence_numbers(sequence_numbers))
    }

    fn ack(sequence_number: SequenceNumber, fragment_index: u32) -> AckMessage {
        AckMessage { sequence_number, fragment_index }
    }

    #[tokio::test]
    async fn test_send_new_stream() {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        let tracker = tracker(3, socket.clone(), vec![17]);

        let seq = tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["ab", "c"])).await.unwrap();
        assert_eq!(seq, 17);
        assert_eq!(tracker.num_pending().await, 1);
        assert_eq!(socket.sent_datagrams().await, vec![
            (test_addr_from_number(2), b"17/1/2\0ab".to_vec()),
            (test_addr_from_number(2), b"17/2/2\0c".to_vec()),
        ]);
    }

    #[tokio::test]
    async fn test_send_failure_is_not_fatal() {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        socket.set_fail_sends(true);
        let tracker = tracker(3, socket.clone(), vec![17]);

        assert_eq!(tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["ab"])).await, Ok(17));
        assert_eq!(tracker.num_pending().await, 1);

        // a failed send counts as an attempt
        assert!(tracker.on_resend_tick().await.is_empty());
        assert!(tracker.on_resend_tick().await.is_empty());
        assert_eq!(tracker.on_resend_tick().await, vec![DeliveryFailure { destination: test_addr_from_number(2), sequence_number: 17 }]);
        assert_eq!(socket.sent_datagrams().await.len(), 3);
    }

    #[tokio::test]
    async fn test_sequence_number_collision() {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        let tracker = tracker(3, socket.clone(), vec![5, 5, 5, 6]);

        assert_eq!(tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["a"])).await, Ok(5));
        assert_eq!(tracker.send_new_stream(test_addr_from_number(3), encode_fragments(vec!["b"])).await, Ok(6));
        assert_eq!(tracker.num_pending().await, 2);
    }

    #[tokio::test]
    async fn test_sequence_numbers_exhausted() {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        let tracker = tracker(3, socket.clone(), vec![5; MAX_SEQUENCE_NUMBER_DRAWS + 1]);

        assert_eq!(tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["a"])).await, Ok(5));
        socket.sent_datagrams().await;

        assert_eq!(tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["b"])).await, Err(DatagramError::SequenceNumbersExhausted));
        assert_eq!(tracker.num_pending().await, 1);
        socket.assert_nothing_sent().await;
    }

    #[tokio::test]
    async fn test_encode_failure_registers_nothing() {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        let tracker = tracker(3, socket.clone(), vec![5]);

        let result = tracker.send_new_stream(test_addr_from_number(2), |_| Err(DatagramError::MessageTooLarge { len: 10, max: 5 })).await;
        assert_eq!(result, Err(DatagramError::MessageTooLarge { len: 10, max: 5 }));
        assert_eq!(tracker.num_pending().await, 0);
        socket.assert_nothing_sent().await;
    }

    #[rstest]
    #[case::all_in_order(vec![1, 2, 3], 0)]
    #[case::all_reversed(vec![3, 2, 1], 0)]
    #[case::all_repeated(vec![1, 1, 2, 3, 3, 2], 0)]
    #[case::partial(vec![1, 3], 1)]
    #[case::wrong_indices(vec![0, 4, 99], 1)]
    #[case::none(vec![], 1)]
    #[tokio::test]
    async fn test_acknowledge(#[case] acked: Vec<u32>, #[case] expected_pending: usize) {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        let tracker = tracker(3, socket.clone(), vec![8]);
        tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["a", "b", "c"])).await.unwrap();

        for index in acked {
            tracker.acknowledge(test_addr_from_number(2), ack(8, index)).await;
        }
        assert_eq!(tracker.num_pending().await, expected_pending);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_or_foreign() {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        let tracker = tracker(3, socket.clone(), vec![8]);
        tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["a"])).await.unwrap();

        tracker.acknowledge(test_addr_from_number(2), ack(9, 1)).await;
        tracker.acknowledge(test_addr_from_number(3), ack(8, 1)).await;
        assert_eq!(tracker.num_pending().await, 1);

        tracker.acknowledge(test_addr_from_number(2), ack(8, 1)).await;
        assert_eq!(tracker.num_pending().await, 0);

        // acknowledging a completed message is a no-op
        tracker.acknowledge(test_addr_from_number(2), ack(8, 1)).await;
        assert_eq!(tracker.num_pending().await, 0);
    }

    #[tokio::test]
    async fn test_resend_only_unacknowledged() {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        let tracker = tracker(5, socket.clone(), vec![4]);
        tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["a", "b", "c"])).await.unwrap();
        socket.sent_datagrams().await;

        tracker.acknowledge(test_addr_from_number(2), ack(4, 2)).await;
        assert!(tracker.on_resend_tick().await.is_empty());

        let resent = socket.sent_messages().await
            .into_iter()
            .map(|(to, msg)| match msg {
                WireMessage::Fragment(f) => (to, f.fragment_index),
                other => panic!("unexpected {:?}", other),
            })
            .collect::<Vec<_>>();
        assert_eq!(resent, vec![(test_addr_from_number(2), 1), (test_addr_from_number(2), 3)]);

        tracker.acknowledge(test_addr_from_number(2), ack(4, 1)).await;
        tracker.acknowledge(test_addr_from_number(2), ack(4, 3)).await;
        assert!(tracker.on_resend_tick().await.is_empty());
        socket.assert_nothing_sent().await;
        assert_eq!(tracker.num_pending().await, 0);
    }

    #[rstest]
    #[case::limit_1(1)]
    #[case::limit_2(2)]
    #[case::limit_3(3)]
    #[case::limit_50(50)]
    #[tokio::test]
    async fn test_resend_bound(#[case] resend_limit: u32) {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        let tracker = tracker(resend_limit, socket.clone(), vec![4]);
        tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["a"])).await.unwrap();
        assert_eq!(socket.sent_datagrams().await.len(), 1);

        for _ in 1..resend_limit {
            assert!(tracker.on_resend_tick().await.is_empty());
        }
        assert_eq!(socket.sent_datagrams().await.len() as u32, resend_limit - 1);

        assert_eq!(tracker.on_resend_tick().await, vec![DeliveryFailure { destination: test_addr_from_number(2), sequence_number: 4 }]);
        socket.assert_nothing_sent().await;
        assert_eq!(tracker.num_pending().await, 0);

        // reported exactly once
        assert!(tracker.on_resend_tick().await.is_empty());
    }

    #[tokio::test]
    async fn test_two_fragments_one_never_acknowledged() {
        let socket = Arc::new(TrackingDatagramSocket::new(test_addr_from_number(1)));
        let tracker = tracker(3, socket.clone(), vec![4]);
        tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["a", "b"])).await.unwrap();
        tracker.acknowledge(test_addr_from_number(2), ack(4, 1)).await;

        assert!(tracker.on_resend_tick().await.is_empty());
        assert!(tracker.on_resend_tick().await.is_empty());
        let failures = tracker.on_resend_tick().await;
        assert_eq!(failures, vec![DeliveryFailure { destination: test_addr_from_number(2), sequence_number: 4 }]);

        // a late acknowledgement after giving up is ignored
        tracker.acknowledge(test_addr_from_number(2), ack(4, 2)).await;
        assert_eq!(tracker.num_pending().await, 0);
    }

    #[tokio::test]
    async fn test_resend_uses_socket() {
        let mut socket = MockDatagramSocket::new();
        let expected = FragmentMessage::ser(4, 1, 1, b"x").to_vec();
        socket.expect_send_datagram()
            .times(2)
            .withf(move |to, buf| to == &test_addr_from_number(2) && buf == expected.as_slice())
            .returning(|_, _| Ok(()));

        let tracker = ResendTracker::new(5, Arc::new(socket), fixed_sequence_numbers(vec![4]));
        tracker.send_new_stream(test_addr_from_number(2), encode_fragments(vec!["x"])).await.unwrap();
        assert!(tracker.on_resend_tick().await.is_empty());
    }
}
