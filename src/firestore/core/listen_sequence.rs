use crate::firestore::model::ListenSequenceNumber;

pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Monotonic source of listen sequence numbers. Numbers written by other
/// clients are folded in through [`observe`](Self::observe) so all clients
/// sharing a cache keep a single ordering.
#[derive(Clone, Debug)]
pub struct ListenSequence {
    previous: ListenSequenceNumber,
}

impl ListenSequence {
    pub fn new(previous: ListenSequenceNumber) -> Self {
        Self { previous }
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous += 1;
        self.previous
    }

    pub fn current(&self) -> ListenSequenceNumber {
        self.previous
    }

    pub fn observe(&mut self, sequence_number: ListenSequenceNumber) {
        self.previous = self.previous.max(sequence_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_in_foreign_numbers() {
        let mut sequence = ListenSequence::new(0);
        assert_eq!(sequence.next(), 1);
        sequence.observe(10);
        sequence.observe(4);
        assert_eq!(sequence.next(), 11);
    }
}
