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

//! Replication acknowledgement aggregation for a single append.
//!
//! Slave transports are out of scope: each attached slave is a bounded
//! channel of [`ReplicationEvent`]s that the connection layer drains,
//! acknowledging through the event's oneshot. The coordinator only
//! aggregates those acknowledgements under the configured policy.

use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::service::ReplicationConfig;
use crate::{AppError, AppResult};

/// Durability policy for one produce request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Fire-and-forget fan-out; success right after the local append.
    Async,
    /// Wait for every slave within the acknowledgement timeout.
    Sync,
    /// Wait for a configured fraction of slaves.
    SemiSync,
}

/// The bytes of one local append, shipped to every connected slave.
#[derive(Debug, Clone)]
pub struct ReplicationFrame {
    pub topic: String,
    pub segment_id: u32,
    pub offset: u64,
    pub payload: Bytes,
}

/// One transfer unit handed to a slave transport.
#[derive(Debug)]
pub struct ReplicationEvent {
    pub frame: ReplicationFrame,
    pub ack: oneshot::Sender<AppResult<()>>,
}

#[derive(Debug)]
pub struct ReplicationCoordinator {
    slaves: DashMap<i32, async_channel::Sender<ReplicationEvent>>,
    ack_timeout: Duration,
    quorum_ratio: f64,
    channel_capacity: usize,
}

impl ReplicationCoordinator {
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            slaves: DashMap::new(),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            quorum_ratio: config.quorum_ratio,
            channel_capacity: config.channel_capacity,
        }
    }

    /// Registers a slave connection and returns the receiver its
    /// transport drains.
    pub fn attach_slave(&self, slave_id: i32) -> async_channel::Receiver<ReplicationEvent> {
        let (tx, rx) = async_channel::bounded(self.channel_capacity);
        self.slaves.insert(slave_id, tx);
        debug!("attached slave {}", slave_id);
        rx
    }

    pub fn detach_slave(&self, slave_id: i32) {
        self.slaves.remove(&slave_id);
        debug!("detached slave {}", slave_id);
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    /// Fans `frame` out to the currently connected slaves under `mode`.
    ///
    /// With no slaves connected the append is reported successful:
    /// availability wins over consistency when the replication topology is
    /// degraded.
    pub async fn replicate(&self, frame: ReplicationFrame, mode: AckMode) -> AppResult<()> {
        let senders: Vec<(i32, async_channel::Sender<ReplicationEvent>)> = self
            .slaves
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        let total = senders.len();
        if total == 0 {
            debug!(
                "no slaves connected; reporting append to {} as locally successful",
                frame.topic
            );
            return Ok(());
        }

        match mode {
            AckMode::Async => {
                for (slave_id, sender) in senders {
                    let (ack, _) = oneshot::channel();
                    let event = ReplicationEvent {
                        frame: frame.clone(),
                        ack,
                    };
                    if sender.try_send(event).is_err() {
                        warn!("slave {} transfer channel full or closed, dropping", slave_id);
                    }
                }
                Ok(())
            }
            AckMode::Sync => self.await_acks(frame, senders, total).await,
            AckMode::SemiSync => {
                let required = ((total as f64) * self.quorum_ratio).ceil().max(1.0) as usize;
                self.await_acks(frame, senders, required).await
            }
        }
    }

    /// Fans out and blocks until `required` acknowledgements arrive, all
    /// under one acknowledgement timeout. Acks are gathered concurrently
    /// so one dead slave cannot starve an already-achieved quorum.
    async fn await_acks(
        &self,
        frame: ReplicationFrame,
        senders: Vec<(i32, async_channel::Sender<ReplicationEvent>)>,
        required: usize,
    ) -> AppResult<()> {
        let total = senders.len();
        let gather = async {
            let mut pending = JoinSet::new();
            for (slave_id, sender) in senders {
                let (ack, ack_rx) = oneshot::channel();
                let event = ReplicationEvent {
                    frame: frame.clone(),
                    ack,
                };
                let sent = sender.send(event).await.is_ok();
                pending.spawn(async move {
                    if !sent {
                        return (slave_id, false);
                    }
                    let acked = matches!(ack_rx.await, Ok(Ok(())));
                    (slave_id, acked)
                });
            }

            let mut acked = 0usize;
            let mut failed = Vec::new();
            while let Some(joined) = pending.join_next().await {
                match joined {
                    Ok((slave_id, true)) => {
                        trace!("slave {} acknowledged {}", slave_id, frame.topic);
                        acked += 1;
                        if acked >= required {
                            return Ok(());
                        }
                    }
                    Ok((slave_id, false)) => failed.push(slave_id),
                    Err(_) => {}
                }
            }
            Err(AppError::ReplicationTimeout(format!(
                "only {}/{} slaves acknowledged (required {}), failed slaves: {:?}",
                acked, total, required, failed
            )))
        };

        match tokio::time::timeout(self.ack_timeout, gather).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ReplicationTimeout(format!(
                "waited {:?} for {} of {} slave acknowledgements",
                self.ack_timeout, required, total
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(timeout_ms: u64, ratio: f64) -> ReplicationCoordinator {
        ReplicationCoordinator::new(&ReplicationConfig {
            mode: AckMode::Sync,
            ack_timeout_ms: timeout_ms,
            quorum_ratio: ratio,
            channel_capacity: 16,
        })
    }

    fn frame() -> ReplicationFrame {
        ReplicationFrame {
            topic: "orders".to_string(),
            segment_id: 0,
            offset: 0,
            payload: Bytes::from_static(b"hello"),
        }
    }

    fn spawn_acking_slave(rx: async_channel::Receiver<ReplicationEvent>) {
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let _ = event.ack.send(Ok(()));
            }
        });
    }

    #[tokio::test]
    async fn test_sync_with_zero_slaves_succeeds() {
        let coordinator = coordinator(3000, 0.5);
        assert!(coordinator.replicate(frame(), AckMode::Sync).await.is_ok());
    }

    #[tokio::test]
    async fn test_sync_waits_for_all_slaves() {
        let coordinator = coordinator(3000, 0.5);
        spawn_acking_slave(coordinator.attach_slave(1));
        spawn_acking_slave(coordinator.attach_slave(2));
        assert!(coordinator.replicate(frame(), AckMode::Sync).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_times_out_on_silent_slave() {
        let coordinator = coordinator(100, 0.5);
        spawn_acking_slave(coordinator.attach_slave(1));
        // slave 2 never drains its channel
        let _silent = coordinator.attach_slave(2);
        let result = coordinator.replicate(frame(), AckMode::Sync).await;
        assert!(matches!(result, Err(AppError::ReplicationTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_semi_sync_needs_only_majority() {
        let coordinator = coordinator(100, 0.5);
        spawn_acking_slave(coordinator.attach_slave(1));
        spawn_acking_slave(coordinator.attach_slave(2));
        let _silent = coordinator.attach_slave(3);
        let result = coordinator.replicate(frame(), AckMode::SemiSync).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_async_never_blocks_on_undrained_slave() {
        let coordinator = coordinator(3000, 0.5);
        let _undrained = coordinator.attach_slave(1);
        assert!(coordinator.replicate(frame(), AckMode::Async).await.is_ok());
    }

    #[tokio::test]
    async fn test_detached_slave_is_not_awaited() {
        let coordinator = coordinator(3000, 0.5);
        let _rx = coordinator.attach_slave(1);
        coordinator.detach_slave(1);
        assert_eq!(coordinator.slave_count(), 0);
        assert!(coordinator.replicate(frame(), AckMode::Sync).await.is_ok());
    }
}
