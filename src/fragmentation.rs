use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::stream_id::StreamId;

/// Splits a message into chunks of at most `max_fragment_size` bytes, preserving order.
///
/// An empty message results in a single empty fragment, so there is always at least one
///  fragment to be acknowledged.
pub fn split_into_fragments(message: &[u8], max_fragment_size: usize) -> Vec<&[u8]> {
    assert!(max_fragment_size > 0, "fragment size must be positive");

    if message.is_empty() {
        return vec![message];
    }
    message.chunks(max_fragment_size).collect()
}

struct ReassemblyRecord {
    /// one slot per fragment, `None` until that fragment arrived
    slots: Vec<Option<Vec<u8>>>,
    num_missing: usize,
    last_update: Instant,
}

impl ReassemblyRecord {
    fn new(fragment_count: usize, now: Instant) -> ReassemblyRecord {
        ReassemblyRecord {
            slots: vec![None; fragment_count],
            num_missing: fragment_count,
            last_update: now,
        }
    }

    fn concat(self) -> Vec<u8> {
        let total_len = self.slots.iter()
            .map(|s| s.as_ref().map_or(0, |s| s.len()))
            .sum();

        let mut result = Vec::with_capacity(total_len);
        for slot in self.slots.into_iter().flatten() {
            result.extend_from_slice(&slot);
        }
        result
    }
}

/// Collects fragments of incoming messages until they are complete. Fragments may arrive in
///  any order, and duplicate fragments are ignored.
///
/// Fragment counts come from the wire, so they are checked against `max_fragment_count` before
///  anything is allocated, and there are at most `max_pending` incomplete messages at any time.
///
/// NB: This is not thread safe by itself - callers are expected to hold a lock while calling
///      into it
pub struct Reassembler {
    max_fragment_count: u32,
    max_pending: usize,
    records: FxHashMap<StreamId, ReassemblyRecord>,
}

impl Reassembler {
    pub fn new(max_fragment_count: u32, max_pending: usize) -> Reassembler {
        Reassembler {
            max_fragment_count,
            max_pending,
            records: FxHashMap::default(),
        }
    }

    pub fn num_pending(&self) -> usize {
        self.records.len()
    }

    /// Checks if a fragment with the given fragment count can be stored without exceeding the
    ///  configured limits. Rejections are logged.
    pub fn admits(&self, stream_id: &StreamId, fragment_count: u32) -> bool {
        if fragment_count > self.max_fragment_count {
            warn!("fragment of {:?} claims a fragment count of {}, the maximum is {} - dropping", stream_id, fragment_count, self.max_fragment_count);
            return false;
        }
        if self.records.len() >= self.max_pending && !self.records.contains_key(stream_id) {
            warn!("{} incomplete messages pending, not starting another one for {:?} - dropping", self.records.len(), stream_id);
            return false;
        }
        true
    }

    /// Stores a fragment, returning the full message if it was the last missing fragment.
    ///  `fragment_index` is 1-based.
    #[must_use]
    pub fn accept_fragment(&mut self, stream_id: StreamId, fragment_index: u32, fragment_count: u32, payload: &[u8], now: Instant) -> Option<Vec<u8>> {
        if !self.admits(&stream_id, fragment_count) {
            return None;
        }

        let (Ok(index), Ok(count)) = (usize::try_from(fragment_index), usize::try_from(fragment_count)) else {
            warn!("fragment {}/{} of {:?} does not fit the address space - dropping", fragment_index, fragment_count, stream_id);
            return None;
        };
        if index == 0 || index > count {
            warn!("fragment index {} of {:?} is outside 1..={} - dropping", index, stream_id, count);
            return None;
        }

        let record = match self.records.entry(stream_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                trace!("first fragment of {:?}: expecting {} fragments", stream_id, count);
                e.insert(ReassemblyRecord::new(count, now))
            }
        };

        if record.slots.len() != count {
            warn!("fragment {} of {:?} claims a fragment count of {}, previous fragments had {} - dropping", index, stream_id, count, record.slots.len());
            return None;
        }

        record.last_update = now;

        let slot = &mut record.slots[index - 1];
        if slot.is_some() {
            trace!("duplicate fragment {} of {:?}", index, stream_id);
        }
        else {
            *slot = Some(payload.to_vec());
            record.num_missing -= 1;
        }

        if record.num_missing > 0 {
            return None;
        }

        self.records.remove(&stream_id)
            .map(|record| {
                debug!("all {} fragments of {:?} received", count, stream_id);
                record.concat()
            })
    }

    /// Discards incomplete messages that did not receive a fragment for at least `max_idle`,
    ///  returning the number of discarded messages
    pub fn purge_stale(&mut self, now: Instant, max_idle: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|stream_id, record| {
            let keep = now.saturating_duration_since(record.last_update) < max_idle;
            if !keep {
                debug!("discarding incomplete message {:?}: {} of {} fragments missing", stream_id, record.num_missing, record.slots.len());
            }
            keep
        });
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::SocketAddr;

    fn stream_id(seq: i64) -> StreamId {
        StreamId::new(SocketAddr::from(([1, 2, 3, 4], 9)), seq)
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(1000, 100)
    }

    #[rstest]
    #[case::empty(b"", 4, vec![b"".to_vec()])]
    #[case::shorter(b"AB", 4, vec![b"AB".to_vec()])]
    #[case::exact(b"ABCD", 4, vec![b"ABCD".to_vec()])]
    #[case::remainder(b"ABCDEFGHIJ", 4, vec![b"ABCD".to_vec(), b"EFGH".to_vec(), b"IJ".to_vec()])]
    #[case::multiple(b"ABCDEFGH", 4, vec![b"ABCD".to_vec(), b"EFGH".to_vec()])]
    #[case::single_bytes(b"ABC", 1, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()])]
    fn test_split_into_fragments(#[case] message: &[u8], #[case] max_fragment_size: usize, #[case] expected: Vec<Vec<u8>>) {
        let actual = split_into_fragments(message, max_fragment_size)
            .into_iter()
            .map(|f| f.to_vec())
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3])]
    #[case::reversed(vec![3, 2, 1])]
    #[case::scrambled(vec![2, 3, 1])]
    #[case::with_duplicates(vec![2, 2, 3, 3, 1])]
    fn test_reassemble_abcdefghij(#[case] order: Vec<u32>) {
        let fragments = split_into_fragments(b"ABCDEFGHIJ", 4);
        let mut reassembler = reassembler();
        let now = Instant::now();

        let mut results = Vec::new();
        for index in order {
            if let Some(message) = reassembler.accept_fragment(stream_id(1), index, 3, fragments[index as usize - 1], now) {
                results.push(message);
            }
        }

        assert_eq!(results, vec![b"ABCDEFGHIJ".to_vec()]);
        assert_eq!(reassembler.num_pending(), 0);
    }

    #[test]
    fn test_reassemble_all_lengths() {
        let now = Instant::now();
        for len in 0..40usize {
            let message = (0..len).map(|i| i as u8).collect::<Vec<_>>();
            let fragments = split_into_fragments(&message, 7);
            let count = fragments.len() as u32;

            let mut reassembler = reassembler();
            let mut result = None;
            // feed back to front to make sure order does not matter
            for (i, fragment) in fragments.iter().enumerate().rev() {
                assert!(result.is_none());
                result = reassembler.accept_fragment(stream_id(len as i64), i as u32 + 1, count, fragment, now);
            }
            assert_eq!(result, Some(message));
        }
    }

    #[test]
    fn test_empty_message() {
        let mut reassembler = reassembler();
        assert_eq!(reassembler.accept_fragment(stream_id(1), 1, 1, b"", Instant::now()), Some(vec![]));
        assert_eq!(reassembler.num_pending(), 0);
    }

    #[test]
    fn test_streams_are_separate() {
        let mut reassembler = reassembler();
        let now = Instant::now();
        let other_peer = StreamId::new(SocketAddr::from(([1, 2, 3, 4], 10)), 1);

        assert_eq!(reassembler.accept_fragment(stream_id(1), 1, 2, b"a", now), None);
        assert_eq!(reassembler.accept_fragment(stream_id(2), 2, 2, b"B", now), None);
        assert_eq!(reassembler.accept_fragment(other_peer, 2, 2, b"y", now), None);
        assert_eq!(reassembler.num_pending(), 3);

        assert_eq!(reassembler.accept_fragment(other_peer, 1, 2, b"x", now), Some(b"xy".to_vec()));
        assert_eq!(reassembler.accept_fragment(stream_id(1), 2, 2, b"b", now), Some(b"ab".to_vec()));
        assert_eq!(reassembler.num_pending(), 1);
    }

    #[rstest]
    #[case::index_zero(0, 2)]
    #[case::index_above_count(3, 2)]
    #[case::count_mismatch(1, 3)]
    fn test_invalid_fragment_is_dropped(#[case] index: u32, #[case] count: u32) {
        let mut reassembler = reassembler();
        let now = Instant::now();

        assert_eq!(reassembler.accept_fragment(stream_id(1), 2, 2, b"b", now), None);
        assert_eq!(reassembler.accept_fragment(stream_id(1), index, count, b"x", now), None);
        assert_eq!(reassembler.accept_fragment(stream_id(1), 1, 2, b"a", now), Some(b"ab".to_vec()));
    }

    #[rstest]
    #[case::at_limit(8, true)]
    #[case::above_limit(9, false)]
    #[case::huge(u32::MAX, false)]
    fn test_fragment_count_limit(#[case] fragment_count: u32, #[case] expected_admitted: bool) {
        let mut reassembler = Reassembler::new(8, 10);

        assert_eq!(reassembler.admits(&stream_id(1), fragment_count), expected_admitted);
        assert_eq!(reassembler.accept_fragment(stream_id(1), 1, fragment_count, b"a", Instant::now()), None);
        assert_eq!(reassembler.num_pending(), if expected_admitted { 1 } else { 0 });
    }

    #[test]
    fn test_pending_limit() {
        let mut reassembler = Reassembler::new(10, 2);
        let now = Instant::now();

        assert_eq!(reassembler.accept_fragment(stream_id(1), 1, 2, b"a", now), None);
        assert_eq!(reassembler.accept_fragment(stream_id(2), 1, 2, b"a", now), None);
        assert!(!reassembler.admits(&stream_id(3), 2));
        assert_eq!(reassembler.accept_fragment(stream_id(3), 1, 1, b"x", now), None);
        assert_eq!(reassembler.num_pending(), 2);

        // messages that are already pending can still complete, making room for others
        assert!(reassembler.admits(&stream_id(1), 2));
        assert_eq!(reassembler.accept_fragment(stream_id(1), 2, 2, b"b", now), Some(b"ab".to_vec()));
        assert_eq!(reassembler.accept_fragment(stream_id(3), 1, 1, b"x", now), Some(b"x".to_vec()));
    }

    #[test]
    fn test_purge_stale() {
        let mut reassembler = reassembler();
        let start = Instant::now();

        assert_eq!(reassembler.accept_fragment(stream_id(1), 1, 2, b"a", start), None);
        assert_eq!(reassembler.accept_fragment(stream_id(2), 1, 2, b"a", start + Duration::from_secs(5)), None);

        assert_eq!(reassembler.purge_stale(start + Duration::from_secs(9), Duration::from_secs(10)), 0);
        assert_eq!(reassembler.purge_stale(start + Duration::from_secs(10), Duration::from_secs(10)), 1);
        assert_eq!(reassembler.num_pending(), 1);

        // the purged message starts from scratch
        assert_eq!(reassembler.accept_fragment(stream_id(1), 2, 2, b"b", start + Duration::from_secs(10)), None);
        assert_eq!(reassembler.accept_fragment(stream_id(2), 2, 2, b"b", start + Duration::from_secs(10)), Some(b"ab".to_vec()));
    }
}
