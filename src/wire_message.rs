use std::cmp::max;
use std::str::FromStr;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DatagramError;
use crate::stream_id::SequenceNumber;

/// terminates a fragment's header, the payload starts immediately after it
pub const HEADER_SEPARATOR: u8 = 0;
const FIELD_SEPARATOR: u8 = b'/';
const ACK_MARKER: &[u8] = b"ACK/";

/// sign and 19 digits for the sequence number, up to 10 digits each for fragment index and
///  count, two field separators and the header separator
pub const MAX_FRAGMENT_HEADER_LEN: usize = 20 + 10 + 10 + 2 + 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Fragment(FragmentMessage),
    Ack(AckMessage),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentMessage {
    pub sequence_number: SequenceNumber,
    /// 1-based
    pub fragment_index: u32,
    pub fragment_count: u32,
    pub payload: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckMessage {
    pub sequence_number: SequenceNumber,
    pub fragment_index: u32,
}

impl FragmentMessage {
    pub fn header_len(sequence_number: SequenceNumber, fragment_index: u32, fragment_count: u32) -> usize {
        signed_decimal_len(sequence_number)
            + decimal_len(fragment_index.into())
            + decimal_len(fragment_count.into())
            + 3
    }

    pub fn ser(sequence_number: SequenceNumber, fragment_index: u32, fragment_count: u32, payload: &[u8]) -> Bytes {
        debug_assert!(fragment_index >= 1 && fragment_index <= fragment_count);

        let mut buf = BytesMut::with_capacity(Self::header_len(sequence_number, fragment_index, fragment_count) + payload.len());
        buf.put_slice(format!("{}/{}/{}", sequence_number, fragment_index, fragment_count).as_bytes());
        buf.put_u8(HEADER_SEPARATOR);
        buf.put_slice(payload);
        buf.freeze()
    }
}

impl AckMessage {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_MARKER.len() + 2 + 30);
        buf.put_slice(ACK_MARKER);
        buf.put_slice(format!("{}/{}", self.sequence_number, self.fragment_index).as_bytes());
        buf.freeze()
    }
}

impl WireMessage {
    /// Parses a received datagram. Only the first [HEADER_SEPARATOR] (which must occur within
    ///  [MAX_FRAGMENT_HEADER_LEN] bytes) terminates a fragment header - header bytes are
    ///  restricted to digits, '-' and '/', so separator bytes in the payload are never mistaken
    ///  for header structure.
    pub fn deser(buf: &[u8]) -> Result<WireMessage, DatagramError> {
        if buf.is_empty() {
            return Err(DatagramError::malformed("empty datagram"));
        }

        if let Some(ack_body) = buf.strip_prefix(ACK_MARKER) {
            let fields = split_fields::<2>(ack_body)?;
            let sequence_number = parse_field(fields[0], "sequence number")?;
            let fragment_index: u32 = parse_field(fields[1], "fragment index")?;
            if fragment_index == 0 {
                return Err(DatagramError::malformed("acknowledged fragment index is 0"));
            }
            return Ok(WireMessage::Ack(AckMessage {
                sequence_number,
                fragment_index,
            }));
        }

        let header_len = buf.iter()
            .take(MAX_FRAGMENT_HEADER_LEN)
            .position(|&b| b == HEADER_SEPARATOR)
            .ok_or_else(|| DatagramError::malformed("no header separator"))?;

        let fields = split_fields::<3>(&buf[..header_len])?;
        let sequence_number = parse_field(fields[0], "sequence number")?;
        let fragment_index: u32 = parse_field(fields[1], "fragment index")?;
        let fragment_count: u32 = parse_field(fields[2], "fragment count")?;

        if fragment_count == 0 {
            return Err(DatagramError::malformed("fragment count is 0"));
        }
        if fragment_index == 0 || fragment_index > fragment_count {
            return Err(DatagramError::malformed(format!("fragment index {} is outside 1..={}", fragment_index, fragment_count)));
        }

        Ok(WireMessage::Fragment(FragmentMessage {
            sequence_number,
            fragment_index,
            fragment_count,
            payload: Bytes::copy_from_slice(&buf[header_len+1..]),
        }))
    }
}

/// The number of payload bytes per fragment for a message of a given length, taking into
///  account that the header length depends on the number of digits in the fragment count, which
///  in turn depends on the payload per fragment.
///
/// NB: This relies on a validated config, i.e. a datagram size leaving room for at least one
///      byte of payload after a header of maximum length
pub fn max_fragment_payload_len(max_datagram_size: usize, sequence_number: SequenceNumber, message_len: usize) -> usize {
    let mut count_digits = 1;
    loop {
        let header_len = signed_decimal_len(sequence_number) + 2*count_digits + 3;
        let payload_len = max(max_datagram_size.saturating_sub(header_len), 1);
        let num_fragments = max(message_len.div_ceil(payload_len), 1);
        if decimal_len(num_fragments as u64) <= count_digits {
            return payload_len;
        }
        count_digits += 1;
    }
}

fn decimal_len(n: u64) -> usize {
    n.checked_ilog10().map_or(1, |l| l as usize + 1)
}

fn signed_decimal_len(n: i64) -> usize {
    if n < 0 {
        1 + decimal_len(n.unsigned_abs())
    }
    else {
        decimal_len(n.unsigned_abs())
    }
}

fn split_fields<const N: usize>(header: &[u8]) -> Result<[&[u8]; N], DatagramError> {
    let fields = header.split(|&b| b == FIELD_SEPARATOR).collect::<Vec<_>>();
    fields.try_into()
        .map_err(|fields: Vec<&[u8]>| DatagramError::malformed(format!("expected {} header fields, found {}", N, fields.len())))
}

fn parse_field<T: FromStr>(field: &[u8], name: &str) -> Result<T, DatagramError> {
    let digits = field.strip_prefix(b"-").unwrap_or(field);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(DatagramError::malformed(format!("{} is not numeric: {:?}", name, String::from_utf8_lossy(field))));
    }

    std::str::from_utf8(field).ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DatagramError::malformed(format!("{} is out of range: {:?}", name, String::from_utf8_lossy(field))))
}
