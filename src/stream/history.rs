//! Bounded receipt-ordered message history.

use std::collections::VecDeque;

/// Default number of messages retained by [`MessageHistory`].
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Ring of the most recently received messages.
///
/// Entries are kept in receipt order; once `capacity` is reached the oldest
/// entry is evicted on every push.
#[derive(Clone, Debug)]
pub struct MessageHistory<M> {
    entries: VecDeque<M>,
    capacity: usize,
}

impl<M> MessageHistory<M> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a message, evicting the oldest entry when at capacity.
    pub fn push(&mut self, message: M) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn latest(&self) -> Option<&M> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &M> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<M: Clone> MessageHistory<M> {
    /// Copies the entries out, oldest first.
    pub fn snapshot(&self) -> Vec<M> {
        self.entries.iter().cloned().collect()
    }
}

impl<M> Default for MessageHistory<M> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageHistory, DEFAULT_HISTORY_CAPACITY};

    #[test]
    fn keeps_last_hundred_in_receipt_order() {
        let mut history = MessageHistory::default();
        for value in 0..250u32 {
            history.push(value);
        }

        assert_eq!(history.len(), DEFAULT_HISTORY_CAPACITY);
        let expected: Vec<u32> = (150..250).collect();
        assert_eq!(history.snapshot(), expected);
        assert_eq!(history.latest(), Some(&249));
    }

    #[test]
    fn push_at_capacity_evicts_oldest() {
        let mut history = MessageHistory::new(2);
        history.push("a");
        history.push("b");
        history.push("c");
        assert_eq!(history.snapshot(), vec!["b", "c"]);
    }

    #[test]
    fn below_capacity_retains_everything() {
        let mut history = MessageHistory::default();
        for value in 0..100u32 {
            history.push(value);
        }
        assert_eq!(history.len(), 100);
        assert_eq!(history.iter().next(), Some(&0));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut history = MessageHistory::new(0);
        history.push(1);
        history.push(2);
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.snapshot(), vec![2]);

        history.clear();
        assert!(history.is_empty());
    }
}
