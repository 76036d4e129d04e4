//! Reliable message delivery on top of an unreliable, unordered, size-limited datagram
//!  transport (typically UDP).
//!
//! ## Guarantees
//!
//! * at-least-once delivery on the wire, exactly-once hand-off to the application (within the
//!   capacity of the duplicate suppression cache)
//! * messages of arbitrary size (up to a configured limit) are split into fragments that fit
//!   into a single datagram, and they are reassembled on the receiving side
//! * every fragment is acknowledged individually. Unacknowledged fragments are re-sent
//!   periodically, up to a configured number of attempts - after that, the message is given up
//!   and registered listeners are notified
//!
//! There is explicitly *no* ordering between messages, no congestion or flow control and no
//!  encryption.
//!
//! ## Wire format
//!
//! A fragment is an ASCII header followed by a single zero byte and the raw payload:
//!
//! ```ascii
//! <sequence number>/<fragment index>/<fragment count>\0<payload bytes>
//! ```
//!
//! The sequence number is a signed 64-bit decimal, chosen randomly by the sender per message.
//!  Fragment indices are 1-based.
//!
//! An acknowledgement confirms a single fragment and has no payload:
//!
//! ```ascii
//! ACK/<sequence number>/<fragment index>
//! ```
//!
//! ## Structure
//!
//! * [wire_message] encodes and decodes datagrams
//! * [fragmentation] splits payloads and reassembles them
//! * [resend_tracker] keeps track of unacknowledged fragments and re-sends them
//! * [duplicate_cache] remembers recently delivered messages
//! * [delivery] hands complete messages to receivers, and reports failures
//! * [client] ties it all together, [udp] binds it to a UDP socket

pub mod client;
pub mod config;
pub mod delivery;
pub mod duplicate_cache;
pub mod error;
pub mod fragmentation;
pub mod random;
pub mod resend_tracker;
pub mod send_socket;
pub mod stream_id;
pub mod test_util;
pub mod udp;
pub mod wire_message;
