use std::time::Duration;

/// Failures that are visible to application code.
///
/// NB: Most failures are *not* surfaced through return values: malformed datagrams are logged
///      and dropped, and failed deliveries are reported asynchronously as
///      [crate::resend_tracker::DeliveryFailure] to listeners and subscribers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatagramError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("no destination: neither an explicit destination nor a default destination is configured")]
    NoDestination,

    #[error("message of {len} bytes exceeds the maximum message size of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    #[error("no message received within {0:?}")]
    Timeout(Duration),

    #[error("no unused sequence number found")]
    SequenceNumbersExhausted,

    #[error("shut down while waiting for a message")]
    Closed,
}

impl DatagramError {
    pub(crate) fn malformed(msg: impl Into<String>) -> DatagramError {
        DatagramError::MalformedMessage(msg.into())
    }
}
