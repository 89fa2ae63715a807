//! Source read positions
//!
//! Offsets are tracked by the engine as records are processed and stored in
//! checkpoints; on restore the source seeks to them. The stored value is the
//! next offset to read, matching Kafka's committed-offset convention.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Represents a topic-partition pair
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Kafka topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new TopicPartition
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// Next offset to read per topic-partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOffsets {
    next: BTreeMap<TopicPartition, i64>,
}

impl SourceOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `offset` as processed; positions never move backwards
    pub fn record(&mut self, topic: &str, partition: i32, offset: i64) {
        let next = offset.saturating_add(1);
        let tp = TopicPartition::new(topic, partition);
        self.next
            .entry(tp)
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
    }

    /// Next offset to read for the partition, if any record was processed
    pub fn next_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.next
            .get(&TopicPartition::new(topic, partition))
            .copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicPartition, i64)> {
        self.next.iter().map(|(tp, offset)| (tp, *offset))
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("clicks", 3);
        assert_eq!(tp.to_string(), "clicks:3");
    }

    #[test]
    fn test_record_advances_next_offset() {
        let mut offsets = SourceOffsets::new();
        assert_eq!(offsets.next_offset("wins", 0), None);

        offsets.record("wins", 0, 41);
        assert_eq!(offsets.next_offset("wins", 0), Some(42));

        // replayed record does not move the position back
        offsets.record("wins", 0, 10);
        assert_eq!(offsets.next_offset("wins", 0), Some(42));

        offsets.record("wins", 1, 0);
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets.next_offset("wins", 1), Some(1));
    }
}
