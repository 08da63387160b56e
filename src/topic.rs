//! Wire types for the per-pool statistics topic.
//!
//! Every coordinator publishes one item per dirty pool, keyed
//! `"<pool_name>!<coordinator_id>"`, and consumes the items published by
//! its peers. Payloads are JSON-serialized [`LocalPoolStats`] records;
//! deletions carry the key only.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Topic carrying admission statistics between coordinators.
pub const REQUEST_QUEUE_TOPIC: &str = "nimbus-request-queue";

/// Separates pool name and coordinator id in topic keys.
pub const TOPIC_KEY_DELIMITER: char = '!';

/// One coordinator's contribution to a pool's cluster-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPoolStats {
    /// Queries admitted by this coordinator and still running.
    pub num_admitted_running: i64,

    /// Requests waiting in this coordinator's queue.
    pub num_queued: i64,

    /// Memory reserved on this backend by fragments of the pool.
    pub backend_mem_reserved: i64,

    /// Memory consumed on this backend by fragments of the pool.
    /// Informational only; not used in admission decisions.
    pub backend_mem_usage: i64,
}

/// A single topic entry, either an update or a deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicItem {
    pub key: String,
    pub payload: Vec<u8>,
    pub deleted: bool,
}

impl TopicItem {
    /// Serializes `stats` into an update item for `key`.
    pub fn update(key: String, stats: &LocalPoolStats) -> Result<Self, serde_json::Error> {
        Ok(Self { key, payload: serde_json::to_vec(stats)?, deleted: false })
    }

    pub fn deletion(key: String) -> Self {
        Self { key, payload: Vec::new(), deleted: true }
    }
}

/// A batch of topic items delivered by the messaging bus. A non-delta
/// batch replaces all previously known remote state.
#[derive(Debug, Clone, Default)]
pub struct TopicDelta {
    pub is_delta: bool,
    pub items: Vec<TopicItem>,
}

/// Topic name to delta, as handed to the bus callback.
pub type TopicDeltaMap = HashMap<String, TopicDelta>;

/// Builds the topic key for a pool at a coordinator.
pub fn make_pool_topic_key(pool_name: &str, coordinator_id: &str) -> String {
    format!("{pool_name}{TOPIC_KEY_DELIMITER}{coordinator_id}")
}

/// Splits a topic key into `(pool_name, coordinator_id)`.
///
/// Pool names may themselves contain the delimiter, coordinator ids may
/// not, so the split happens at the last occurrence.
pub fn parse_pool_topic_key(key: &str) -> Option<(&str, &str)> {
    let pos = key.rfind(TOPIC_KEY_DELIMITER)?;
    let (pool, rest) = key.split_at(pos);
    let coordinator = &rest[TOPIC_KEY_DELIMITER.len_utf8()..];
    if pool.is_empty() || coordinator.is_empty() {
        return None;
    }
    Some((pool, coordinator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_key_round_trip() {
        let key = make_pool_topic_key("root.q1", "coord-1:25000");
        assert_eq!(key, "root.q1!coord-1:25000");
        assert_eq!(parse_pool_topic_key(&key), Some(("root.q1", "coord-1:25000")));
    }

    #[test]
    fn key_with_delimiter_in_pool_name_splits_at_last() {
        assert_eq!(
            parse_pool_topic_key("odd!pool!coord-1:25000"),
            Some(("odd!pool", "coord-1:25000"))
        );
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert_eq!(parse_pool_topic_key("no-delimiter"), None);
        assert_eq!(parse_pool_topic_key("!coord"), None);
        assert_eq!(parse_pool_topic_key("pool!"), None);
    }

    #[test]
    fn pool_stats_payload_round_trip() {
        let stats = LocalPoolStats {
            num_admitted_running: 3,
            num_queued: 2,
            backend_mem_reserved: 40 << 30,
            backend_mem_usage: 10 << 30,
        };
        let item = TopicItem::update("q1!coord-1".to_string(), &stats).unwrap();
        let decoded: LocalPoolStats = serde_json::from_slice(&item.payload).unwrap();
        assert_eq!(decoded, stats);
    }
}
