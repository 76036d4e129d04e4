use crate::stream_id::SequenceNumber;

/// Source for the sequence numbers of outgoing messages. This is an abstraction to allow tests
///  to force collisions.
#[cfg_attr(test, mockall::automock)]
pub trait SequenceNumberSource: Send + Sync + 'static {
    fn next_sequence_number(&self) -> SequenceNumber;
}

/// Draws sequence numbers uniformly from the full `i64` range, making collisions between
///  messages in flight practically impossible
pub struct RandomSequenceNumbers {}

impl SequenceNumberSource for RandomSequenceNumbers {
    fn next_sequence_number(&self) -> SequenceNumber {
        rand::random()
    }
}

/// test helper: a source returning exactly the given sequence numbers, in order
#[cfg(test)]
pub(crate) fn fixed_sequence_numbers(numbers: Vec<SequenceNumber>) -> std::sync::Arc<MockSequenceNumberSource> {
    let mut source = MockSequenceNumberSource::new();
    let mut sequence = mockall::Sequence::new();
    for n in numbers {
        source.expect_next_sequence_number()
            .once()
            .in_sequence(&mut sequence)
            .return_const(n);
    }
    std::sync::Arc::new(source)
}
