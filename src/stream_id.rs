use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

/// Chosen randomly by the sender of a message, unique among the sender's messages that are
///  currently in flight
pub type SequenceNumber = i64;

/// Identifies a message (which may be split into several fragments) globally: the address of
///  the peer that sent it, plus the sequence number the sender picked.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct StreamId {
    pub peer_addr: SocketAddr,
    pub sequence_number: SequenceNumber,
}

impl StreamId {
    pub fn new(peer_addr: SocketAddr, sequence_number: SequenceNumber) -> StreamId {
        StreamId {
            peer_addr,
            sequence_number,
        }
    }
}

impl Debug for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}#{}]", self.peer_addr, self.sequence_number)
    }
}
