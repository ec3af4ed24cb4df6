//! Domain types shared across the storage and delivery layers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::replication::AckMode;
use crate::storage::IndexRecord;

/// Per consumer group topic that redelivered messages are appended to.
pub const RETRY_TOPIC_PREFIX: &str = "%RETRY%";
/// Terminal destination for messages that exhausted their retry budget.
pub const DLQ_TOPIC_PREFIX: &str = "%DLQ%";
/// Internal topic backing the delay scheduler's write-ahead journal.
pub const DELAY_JOURNAL_TOPIC: &str = "__delay";

pub fn retry_topic(group: &str) -> String {
    format!("{}{}", RETRY_TOPIC_PREFIX, group)
}

pub fn dlq_topic(group: &str) -> String {
    format!("{}{}", DLQ_TOPIC_PREFIX, group)
}

/// Reserved names are created by the engine itself, never by a
/// topic-creation request.
pub fn is_reserved_topic(name: &str) -> bool {
    name.starts_with("__")
        || name.starts_with(RETRY_TOPIC_PREFIX)
        || name.starts_with(DLQ_TOPIC_PREFIX)
}

/// Topic metadata persisted in the meta db. The queue count is fixed at
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicMeta {
    pub name: String,
    pub queue_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TopicMeta {
    pub fn new(name: impl Into<String>, queue_count: u32) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            queue_count,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A consumption-retry pointer back into the commit log of the topic the
/// message was originally produced to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryOrigin {
    pub topic: String,
    pub group: String,
    pub commit_segment_id: u32,
    pub msg_index: u32,
    pub msg_length: u32,
    pub retry_times: u32,
}

/// A produce request as delivered by the connection layer.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub topic: String,
    /// Explicit destination queue; `None` lets the dispatcher choose.
    pub queue_id: Option<u32>,
    pub payload: Bytes,
    /// Nonzero routes the message through the delay scheduler.
    pub delay_secs: u32,
    /// Present when the request re-injects a failed consumption.
    pub retry_of: Option<RetryOrigin>,
    /// Per-request override of the configured replication policy.
    pub send_mode: Option<AckMode>,
}

impl ProduceRequest {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            queue_id: None,
            payload,
            delay_secs: 0,
            retry_of: None,
            send_mode: None,
        }
    }

    pub fn with_queue(mut self, queue_id: u32) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    pub fn with_delay(mut self, delay_secs: u32) -> Self {
        self.delay_secs = delay_secs;
        self
    }
}

/// Outcome of a produce request reported to the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceAck {
    pub topic: String,
    /// The queue the dispatcher selected; `None` for scheduled messages,
    /// which reach a queue only when they fire.
    pub queue_id: Option<u32>,
    pub segment_id: u32,
    pub offset: u64,
    /// True when the message entered the delay wheel instead of a queue.
    pub scheduled: bool,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub topic: String,
    pub group: String,
    pub queue_id: u32,
    pub batch_size: u32,
}

/// An index record resolved back to its commit log bytes.
#[derive(Debug, Clone)]
pub struct PulledMessage {
    pub queue_id: u32,
    pub index: IndexRecord,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct AckRequest {
    pub topic: String,
    pub group: String,
    pub queue_id: u32,
    pub count: u32,
}
