//! Dispatch of commit-log appends into consume queue indexes.

use std::sync::Arc;

use rand::Rng;
use tracing::trace;

use crate::{AppError, AppResult};

use super::{AppendPosition, ConsumeQueue, IndexRecord};

/// Invoked exactly once per successful commit-log append, while the
/// append lock is still held, so index order matches log order within a
/// queue.
///
/// Queue selection is uniform random when the producer supplied no
/// explicit id. There is deliberately no key-based partitioning: callers
/// that need per-key ordering pass an explicit queue id.
#[derive(Debug, Default)]
pub struct Dispatcher;

impl Dispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Builds the 16-byte index record for `position` and appends it to
    /// the selected queue. Returns the queue id used.
    pub fn dispatch(
        &self,
        topic: &str,
        queues: &[Arc<ConsumeQueue>],
        explicit_queue: Option<u32>,
        position: &AppendPosition,
        retry_times: u32,
    ) -> AppResult<u32> {
        if queues.is_empty() {
            return Err(AppError::QueueNotFound(topic.to_string(), 0));
        }
        let queue_id = match explicit_queue {
            Some(id) => {
                if id as usize >= queues.len() {
                    return Err(AppError::QueueNotFound(topic.to_string(), id));
                }
                id
            }
            None => rand::thread_rng().gen_range(0..queues.len()) as u32,
        };

        let record = IndexRecord {
            commit_segment_id: position.segment_id,
            msg_index: position.offset as u32,
            msg_length: position.payload_len,
            retry_times,
        };
        queues[queue_id as usize].append(record)?;
        trace!(
            "dispatched {}/{} -> queue {} ({:?})",
            topic,
            position.offset,
            queue_id,
            record
        );
        Ok(queue_id)
    }
}
