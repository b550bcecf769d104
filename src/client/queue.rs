//! Bounded outgoing queue with byte-budget admission control

use crate::types::QueuedMessage;
use std::collections::VecDeque;

/// Default byte budget of the outgoing queue
pub const DEFAULT_MAX_QUEUE_BYTES: usize = 8 * 1024 * 1024;

/// FIFO staging area for outgoing messages.
///
/// Admission is drop-newest: a push that would take the running size
/// estimate past the budget is rejected and the message discarded.
#[derive(Debug)]
pub struct LogQueue {
    buffer: VecDeque<QueuedMessage>,
    byte_estimate: usize,
    max_bytes: usize,
}

impl LogQueue {
    /// Create a queue with the given byte budget
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            byte_estimate: 0,
            max_bytes,
        }
    }

    /// Approximate in-memory size of a serialised message
    pub fn estimate_size(message: &QueuedMessage) -> usize {
        serde_json::to_vec(message).map_or(0, |bytes| bytes.len()) * 2
    }

    /// Push a message; returns `false` if it was dropped
    pub fn push(&mut self, message: QueuedMessage) -> bool {
        let size = Self::estimate_size(&message);
        if self.byte_estimate + size > self.max_bytes {
            return false;
        }
        self.buffer.push_back(message);
        self.byte_estimate += size;
        true
    }

    /// Remove up to `max_count` messages from the front, or all when `None`
    pub fn drain(&mut self, max_count: Option<usize>) -> Vec<QueuedMessage> {
        let count = max_count.map_or(self.buffer.len(), |n| n.min(self.buffer.len()));
        if count == 0 {
            return Vec::new();
        }

        let drained: Vec<QueuedMessage> = self.buffer.drain(..count).collect();
        // recomputed rather than decremented so rounding never accumulates
        self.byte_estimate = self.buffer.iter().map(Self::estimate_size).sum();
        drained
    }

    /// Remove all messages
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.byte_estimate = 0;
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Estimated total size of queued messages
    pub fn byte_estimate(&self) -> usize {
        self.byte_estimate
    }

    /// Configured byte budget
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

impl Default for LogQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApplicationInfo, LogEntry, Severity};

    fn message(text: &str) -> QueuedMessage {
        QueuedMessage::Event(LogEntry::text(
            "session",
            Severity::Info,
            ApplicationInfo::named("queue-test"),
            text,
        ))
    }

    fn texts(messages: &[QueuedMessage]) -> Vec<String> {
        messages
            .iter()
            .map(|m| m.entry().text.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_drain_preserves_push_order() {
        let mut queue = LogQueue::default();
        for i in 0..5 {
            assert!(queue.push(message(&format!("m{}", i))));
        }

        let drained = queue.drain(None);
        assert_eq!(texts(&drained), vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(queue.is_empty());
        assert_eq!(queue.byte_estimate(), 0);
    }

    #[test]
    fn test_partial_drain_leaves_remainder() {
        let mut queue = LogQueue::default();
        for i in 0..5 {
            queue.push(message(&format!("m{}", i)));
        }

        let first = queue.drain(Some(2));
        assert_eq!(texts(&first), vec!["m0", "m1"]);
        assert_eq!(queue.len(), 3);

        // asking for more than is queued returns what is there
        let rest = queue.drain(Some(10));
        assert_eq!(texts(&rest), vec!["m2", "m3", "m4"]);
        assert!(queue.drain(Some(1)).is_empty());
    }

    #[test]
    fn test_push_rejected_over_budget() {
        let sample = message("fits");
        let size = LogQueue::estimate_size(&sample);
        let mut queue = LogQueue::new(size + size / 2);

        assert!(queue.push(sample));
        let before = (queue.len(), queue.byte_estimate());

        assert!(!queue.push(message("fits")));
        assert_eq!((queue.len(), queue.byte_estimate()), before);
    }

    #[test]
    fn test_one_byte_budget_rejects_everything() {
        let mut queue = LogQueue::new(1);
        assert!(!queue.push(message("")));
        assert!(!queue.push(message("x")));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.byte_estimate(), 0);
    }

    #[test]
    fn test_byte_estimate_tracks_contents() {
        let mut queue = LogQueue::default();
        let messages: Vec<_> = (0..6).map(|i| message(&"x".repeat(i * 10))).collect();
        for m in &messages {
            queue.push(m.clone());
        }
        let expected: usize = messages.iter().map(LogQueue::estimate_size).sum();
        assert_eq!(queue.byte_estimate(), expected);

        queue.drain(Some(4));
        let expected: usize = messages[4..].iter().map(LogQueue::estimate_size).sum();
        assert_eq!(queue.byte_estimate(), expected);

        queue.clear();
        assert_eq!(queue.byte_estimate(), 0);
        assert_eq!(queue.len(), 0);
    }
}
