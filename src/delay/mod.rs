// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Delay scheduling: time-wheel placement, the one-second scan task and
//! the write-ahead journal that lets scheduled state survive a restart.
//!
//! The scheduler never executes handlers itself. Due records go out
//! through an unbounded channel and are processed as ordinary units of
//! work on the shared request pool.

mod journal;
mod wheel;

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::message::RetryOrigin;
use crate::{AppError, AppResult, Shutdown};

pub use journal::DelayJournal;
pub use wheel::{TimeWheel, WHEEL_SLOTS};

/// Redelivery backoff steps in seconds, bounded by the wheel span. A
/// message whose retry count walks off the end goes to the dead-letter
/// topic instead.
pub const RETRY_BACKOFF_SECS: [u32; 17] = [
    1, 5, 10, 30, 60, 120, 180, 240, 300, 360, 420, 480, 540, 600, 1200, 1800, 3600,
];

/// Backoff for the given retry count; `None` means the retry budget is
/// exhausted.
pub fn retry_backoff(retry_times: u32) -> Option<u32> {
    RETRY_BACKOFF_SECS.get(retry_times as usize).copied()
}

/// What a delay record does when it fires, matched exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelayPayload {
    /// A plain delayed message: re-appended with its delay cleared.
    Message {
        topic: String,
        queue_id: Option<u32>,
        payload: Bytes,
    },
    /// A failed consumption pointing back at the original bytes.
    RetryPointer(RetryOrigin),
    /// A transaction half-message awaiting commit or rollback.
    TxCheck { msg_id: String },
}

/// One scheduled unit living in the wheel until due.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelayRecord {
    pub id: String,
    pub payload: DelayPayload,
    pub delay_secs: u32,
    /// Absolute due time, unix seconds; only used for journal recovery.
    pub fire_at: i64,
}

impl DelayRecord {
    pub fn new(payload: DelayPayload, delay_secs: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            delay_secs,
            fire_at: Utc::now().timestamp() + delay_secs as i64,
        }
    }
}

#[derive(Debug)]
pub struct DelayScheduler {
    max_delay_secs: u32,
    wheel: TimeWheel,
    due_tx: async_channel::Sender<DelayRecord>,
    due_rx: async_channel::Receiver<DelayRecord>,
}

impl DelayScheduler {
    pub fn new(max_delay_secs: u32) -> Self {
        let (due_tx, due_rx) = async_channel::unbounded();
        Self {
            max_delay_secs,
            wheel: TimeWheel::new(),
            due_tx,
            due_rx,
        }
    }

    /// Rejects a delay before it is journaled or enters the wheel.
    pub fn validate_delay(&self, delay_secs: u32) -> AppResult<()> {
        if delay_secs == 0 || delay_secs > self.max_delay_secs {
            return Err(AppError::DelayOutOfRange(delay_secs));
        }
        Ok(())
    }

    /// Inserts `record` to drain `delay_secs` ticks from now. The delay
    /// is passed separately so recovery can re-schedule with the
    /// remaining, not the original, delay.
    pub fn schedule(&self, record: DelayRecord, delay_secs: u32) -> AppResult<()> {
        self.validate_delay(delay_secs)?;
        self.wheel.insert(record, delay_secs);
        Ok(())
    }

    /// Bypasses the wheel: hands `record` straight to the due channel.
    /// Used for records found overdue during journal replay.
    pub fn fire_now(&self, record: DelayRecord) {
        if self.due_tx.try_send(record).is_err() {
            warn!("due channel closed, dropping overdue record");
        }
    }

    /// The channel the broker wires into the shared request pool.
    pub fn due_receiver(&self) -> async_channel::Receiver<DelayRecord> {
        self.due_rx.clone()
    }

    pub fn pending(&self) -> usize {
        self.wheel.pending()
    }

    /// Single scanning task: one wheel tick per second, due batches
    /// published without ever blocking on their handlers.
    pub async fn run_scan_task(&self, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        // the first interval tick completes immediately; the wheel must
        // only advance on elapsed seconds
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for record in self.wheel.tick() {
                        debug!("delay record {} due", record.id);
                        if self.due_tx.try_send(record).is_err() {
                            warn!("due channel closed, stopping scan task");
                            return;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("delay scan task received shutdown signal");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    fn message_record(delay: u32) -> DelayRecord {
        DelayRecord::new(
            DelayPayload::Message {
                topic: "orders".to_string(),
                queue_id: None,
                payload: Bytes::from_static(b"later"),
            },
            delay,
        )
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_max_delay_accepted_and_above_rejected() {
        let scheduler = DelayScheduler::new(3600);
        scheduler
            .schedule(message_record(3600), 3600)
            .unwrap();
        assert_eq!(scheduler.pending(), 1);
        assert!(matches!(
            scheduler.schedule(message_record(3601), 3601),
            Err(AppError::DelayOutOfRange(3601))
        ));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_zero_delay_rejected() {
        let scheduler = DelayScheduler::new(3600);
        assert!(matches!(
            scheduler.schedule(message_record(0), 0),
            Err(AppError::DelayOutOfRange(0))
        ));
    }

    #[test]
    fn test_backoff_table_exhaustion() {
        assert_eq!(retry_backoff(0), Some(1));
        assert_eq!(retry_backoff(5), Some(120));
        assert_eq!(retry_backoff(16), Some(3600));
        assert_eq!(retry_backoff(17), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_task_fires_in_window_and_never_early() {
        let scheduler = Arc::new(DelayScheduler::new(3600));
        let (notify_shutdown, _) = broadcast::channel(1);
        let task_scheduler = scheduler.clone();
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move { task_scheduler.run_scan_task(shutdown).await });
        settle().await;

        let record = message_record(2);
        let id = record.id.clone();
        scheduler.schedule(record, 2).unwrap();
        let due_rx = scheduler.due_receiver();

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(due_rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        let due = due_rx.try_recv().unwrap();
        assert_eq!(due.id, id);
        let _ = notify_shutdown.send(());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_task_cascades_minute_delays() {
        let scheduler = Arc::new(DelayScheduler::new(3600));
        let (notify_shutdown, _) = broadcast::channel(1);
        let task_scheduler = scheduler.clone();
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move { task_scheduler.run_scan_task(shutdown).await });
        settle().await;

        scheduler.schedule(message_record(90), 90).unwrap();
        let due_rx = scheduler.due_receiver();

        tokio::time::advance(Duration::from_secs(89)).await;
        settle().await;
        assert!(due_rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(due_rx.try_recv().is_ok());
        let _ = notify_shutdown.send(());
    }
}
