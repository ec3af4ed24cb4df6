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

//! The storage and delivery engine.
//!
//! `Engine` explicitly owns every registry: topic metadata, commit logs,
//! consume queues, consumption offsets, the delay scheduler and pending
//! transactions. Nothing here is process-global, so independent engines
//! can coexist in one test process.
//!
//! # Lifecycle
//!
//! [`Engine::bootstrap`] loads topic metadata, remaps every segment,
//! rebuilds write cursors, reloads the offset snapshot and replays the
//! delay journal. Recovery is attempted once; any failure aborts startup
//! rather than running with partial state. [`Engine::start_tasks`] spawns
//! the offset snapshot and delay scan loops; [`Engine::close`] flushes
//! everything and writes final snapshots.

mod produce;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::delay::{DelayJournal, DelayPayload, DelayRecord, DelayScheduler};
use crate::message::{
    is_reserved_topic, AckRequest, ProduceAck, ProduceRequest, PullRequest, PulledMessage,
    TopicMeta, DELAY_JOURNAL_TOPIC,
};
use crate::offset::{GroupKey, OffsetTracker};
use crate::replication::{ReplicationCoordinator, ReplicationEvent};
use crate::service::BrokerConfig;
use crate::storage::{CommitLog, ConsumeQueue, Dispatcher, COMMIT_LOG_DIR, CONSUME_QUEUE_DIR};
use crate::utils::MetaDb;
use crate::{AppError, AppResult, Shutdown};

/// Client callback hook for transaction half-message checks. The
/// transport registers an implementation; the engine only needs the
/// interaction point.
pub trait TransactionCheckListener: Send + Sync {
    fn on_check(&self, msg_id: &str);
}

/// A provisionally-sent message awaiting commit or rollback.
#[derive(Debug)]
pub(crate) struct PendingTransaction {
    pub topic: String,
    pub queue_id: Option<u32>,
    pub payload: Bytes,
    pub check_times: u32,
}

pub struct Engine {
    pub(crate) config: Arc<BrokerConfig>,
    base_dir: PathBuf,
    topics: DashMap<String, TopicMeta>,
    commit_logs: DashMap<String, Arc<CommitLog>>,
    consume_queues: DashMap<String, Arc<Vec<Arc<ConsumeQueue>>>>,
    pub(crate) dispatcher: Dispatcher,
    offsets: Arc<OffsetTracker>,
    pub(crate) scheduler: Arc<DelayScheduler>,
    pub(crate) delay_journal: DelayJournal,
    pub(crate) replication: ReplicationCoordinator,
    pub(crate) pending_transactions: DashMap<String, PendingTransaction>,
    pub(crate) tx_listener: RwLock<Option<Arc<dyn TransactionCheckListener>>>,
    meta_db: Mutex<MetaDb>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("base_dir", &self.base_dir)
            .field("topics", &self.topics.len())
            .finish()
    }
}

/// Remaps one topic's stores during bootstrap.
fn open_topic_storage(
    config: &BrokerConfig,
    base_dir: &Path,
    meta: &TopicMeta,
) -> AppResult<(Arc<CommitLog>, Arc<Vec<Arc<ConsumeQueue>>>)> {
    let storage = &config.storage;
    let topic_dir = base_dir.join(&meta.name);
    let log = CommitLog::open(
        meta.name.clone(),
        topic_dir.join(COMMIT_LOG_DIR),
        storage.commit_segment_size,
        storage.flush_on_append,
    )?;
    let mut queues = Vec::with_capacity(meta.queue_count as usize);
    for queue_id in 0..meta.queue_count {
        queues.push(Arc::new(ConsumeQueue::open(
            meta.name.clone(),
            queue_id,
            topic_dir.join(CONSUME_QUEUE_DIR).join(queue_id.to_string()),
            storage.queue_segment_size,
            storage.flush_on_append,
        )?));
    }
    debug!("reopened topic {}", meta.name);
    Ok((Arc::new(log), Arc::new(queues)))
}

impl Engine {
    /// Builds the engine from its on-disk state. Every registered topic
    /// is remapped and its cursors rebuilt; the offset snapshot is
    /// reloaded and the delay journal replayed. Fails fast on any
    /// recovery error.
    pub async fn bootstrap(config: Arc<BrokerConfig>) -> AppResult<Arc<Engine>> {
        let base_dir = PathBuf::from(&config.storage.base_dir);
        std::fs::create_dir_all(&base_dir)?;

        let mut meta_db = MetaDb::open(base_dir.join("topics.json"))?;

        // the delay journal topic is registered and provisioned on first
        // start; later starts remap it like any other topic
        if !meta_db.contains(DELAY_JOURNAL_TOPIC) {
            let log = CommitLog::create(
                DELAY_JOURNAL_TOPIC,
                base_dir.join(DELAY_JOURNAL_TOPIC).join(COMMIT_LOG_DIR),
                config.storage.commit_segment_size,
                config.storage.flush_on_append,
            )?;
            drop(log);
            meta_db.put(TopicMeta::new(DELAY_JOURNAL_TOPIC, 0));
            meta_db.save()?;
        }

        let topics: DashMap<String, TopicMeta> = DashMap::new();
        let commit_logs: DashMap<String, Arc<CommitLog>> = DashMap::new();
        let consume_queues: DashMap<String, Arc<Vec<Arc<ConsumeQueue>>>> = DashMap::new();
        for meta in meta_db.topics() {
            let (log, queues) = open_topic_storage(&config, &base_dir, meta)?;
            commit_logs.insert(meta.name.clone(), log);
            consume_queues.insert(meta.name.clone(), queues);
            topics.insert(meta.name.clone(), meta.clone());
        }

        let delay_log = commit_logs
            .get(DELAY_JOURNAL_TOPIC)
            .map(|log| log.clone())
            .ok_or_else(|| AppError::IllegalState("delay journal topic missing".to_string()))?;

        let engine = Engine {
            base_dir: base_dir.clone(),
            topics,
            commit_logs,
            consume_queues,
            dispatcher: Dispatcher::new(),
            offsets: Arc::new(OffsetTracker::new(base_dir.join("offsets.json"))),
            scheduler: Arc::new(DelayScheduler::new(config.delay.max_delay_secs)),
            delay_journal: DelayJournal::new(delay_log),
            replication: ReplicationCoordinator::new(&config.replication),
            pending_transactions: DashMap::new(),
            tx_listener: RwLock::new(None),
            meta_db: Mutex::new(meta_db),
            config,
        };

        engine.offsets.load().await?;
        engine.replay_delay_journal()?;

        info!(
            "engine bootstrapped at {} with {} topics",
            base_dir.display(),
            engine.topics.len()
        );
        Ok(Arc::new(engine))
    }

    /// Spawns the background loops: periodic offset snapshots and the
    /// one-second delay wheel scan.
    pub fn start_tasks(
        self: &Arc<Self>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: &mpsc::Sender<()>,
    ) {
        let engine = self.clone();
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        let complete_tx = shutdown_complete_tx.clone();
        tokio::spawn(async move {
            let interval = tokio::time::interval(Duration::from_millis(
                engine.config.offset.snapshot_interval_ms,
            ));
            engine.offsets.run_snapshot_task(interval, shutdown).await;
            drop(complete_tx);
        });

        let engine = self.clone();
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        let complete_tx = shutdown_complete_tx.clone();
        tokio::spawn(async move {
            engine.scheduler.run_scan_task(shutdown).await;
            drop(complete_tx);
        });
    }

    /// Creates a topic with a fixed queue count. Reserved names are the
    /// engine's own and are rejected here.
    pub fn create_topic(&self, name: &str, queue_count: u32) -> AppResult<()> {
        if name.is_empty() || name.contains('/') || name.contains('#') {
            return Err(AppError::InvalidValue(format!("topic name: {:?}", name)));
        }
        if is_reserved_topic(name) {
            return Err(AppError::InvalidValue(format!(
                "topic name {} is reserved",
                name
            )));
        }
        if queue_count == 0 {
            return Err(AppError::InvalidValue(
                "topic needs at least one queue".to_string(),
            ));
        }
        if self.topics.contains_key(name) {
            return Err(AppError::InvalidOperation(format!(
                "topic {} already exists",
                name
            )));
        }
        self.create_topic_inner(TopicMeta::new(name, queue_count))
    }

    /// Creates storage for `meta` and registers it. Also used for the
    /// engine's own reserved topics (retry, dead-letter), where an
    /// existing topic is fine.
    pub(crate) fn create_topic_inner(&self, meta: TopicMeta) -> AppResult<()> {
        let mut meta_db = self.meta_db.lock();
        if self.topics.contains_key(&meta.name) {
            return Ok(());
        }
        let storage = &self.config.storage;
        let topic_dir = self.base_dir.join(&meta.name);
        let log = CommitLog::create(
            meta.name.clone(),
            topic_dir.join(COMMIT_LOG_DIR),
            storage.commit_segment_size,
            storage.flush_on_append,
        )?;
        let mut queues = Vec::with_capacity(meta.queue_count as usize);
        for queue_id in 0..meta.queue_count {
            queues.push(Arc::new(ConsumeQueue::create(
                meta.name.clone(),
                queue_id,
                topic_dir.join(CONSUME_QUEUE_DIR).join(queue_id.to_string()),
                storage.queue_segment_size,
                storage.flush_on_append,
            )?));
        }
        self.commit_logs.insert(meta.name.clone(), Arc::new(log));
        self.consume_queues
            .insert(meta.name.clone(), Arc::new(queues));
        self.topics.insert(meta.name.clone(), meta.clone());
        meta_db.put(meta.clone());
        meta_db.save()?;
        debug!("created topic {} with {} queues", meta.name, meta.queue_count);
        Ok(())
    }

    /// Replays the delay journal: overdue records go straight to the due
    /// channel, the rest re-enter the wheel with their remaining delay.
    fn replay_delay_journal(&self) -> AppResult<()> {
        let now = Utc::now().timestamp();
        let pending = self.delay_journal.replay()?;
        let total = pending.len();
        let mut overdue = 0usize;
        for record in pending {
            let remaining = record.fire_at - now;
            if remaining <= 0 {
                overdue += 1;
                self.scheduler.fire_now(record);
            } else {
                let remaining = (remaining as u32).min(self.config.delay.max_delay_secs);
                self.scheduler.schedule(record, remaining)?;
            }
        }
        if total > 0 {
            info!(
                "delay journal replay: {} pending, {} overdue re-injected",
                total, overdue
            );
        }
        Ok(())
    }

    pub fn topic_meta(&self, topic: &str) -> AppResult<TopicMeta> {
        self.topics
            .get(topic)
            .map(|meta| meta.clone())
            .ok_or_else(|| AppError::TopicNotFound(topic.to_string()))
    }

    pub(crate) fn commit_log(&self, topic: &str) -> AppResult<Arc<CommitLog>> {
        self.commit_logs
            .get(topic)
            .map(|log| log.clone())
            .ok_or_else(|| AppError::TopicNotFound(topic.to_string()))
    }

    pub(crate) fn queues(&self, topic: &str) -> AppResult<Arc<Vec<Arc<ConsumeQueue>>>> {
        self.consume_queues
            .get(topic)
            .map(|queues| queues.clone())
            .ok_or_else(|| AppError::TopicNotFound(topic.to_string()))
    }

    fn queue(&self, topic: &str, queue_id: u32) -> AppResult<Arc<ConsumeQueue>> {
        let queues = self.queues(topic)?;
        queues
            .get(queue_id as usize)
            .cloned()
            .ok_or_else(|| AppError::QueueNotFound(topic.to_string(), queue_id))
    }

    /// Reads up to `batch_size` messages at the group's cursor without
    /// advancing it. No new data is an empty result, not an error.
    pub fn pull(&self, request: &PullRequest) -> AppResult<Vec<PulledMessage>> {
        let queue = self.queue(&request.topic, request.queue_id)?;
        let key = GroupKey::new(&request.topic, &request.group, request.queue_id);
        let position = self.offsets.position(&key);
        let records = queue.read_batch(position, request.batch_size as usize)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let log = self.commit_log(&request.topic)?;
        let mut messages = Vec::with_capacity(records.len());
        for index in records {
            let payload = log.read(index.commit_segment_id, index.msg_index, index.msg_length)?;
            messages.push(PulledMessage {
                queue_id: request.queue_id,
                index,
                payload,
            });
        }
        Ok(messages)
    }

    /// Advances the group's cursor by `count` acknowledged records.
    /// Forward-only and clamped at the queue's live write position, so
    /// over-acking cannot overrun. Returns false for unknown
    /// topics/queues.
    pub fn ack(&self, request: &AckRequest) -> bool {
        let queue = match self.queue(&request.topic, request.queue_id) {
            Ok(queue) => queue,
            Err(e) => {
                warn!("ack rejected: {}", e);
                return false;
            }
        };
        let key = GroupKey::new(&request.topic, &request.group, request.queue_id);
        let position = self.offsets.position(&key);
        let advanced = queue.advance(position, request.count as u64);
        self.offsets.advance_to(&key, advanced);
        true
    }

    /// Registers a slave connection; the returned receiver is drained by
    /// the replication transport.
    pub fn attach_slave(&self, slave_id: i32) -> async_channel::Receiver<ReplicationEvent> {
        self.replication.attach_slave(slave_id)
    }

    pub fn detach_slave(&self, slave_id: i32) {
        self.replication.detach_slave(slave_id)
    }

    /// Channel of due delay records, wired into the shared request pool
    /// by the broker.
    pub fn due_receiver(&self) -> async_channel::Receiver<DelayRecord> {
        self.scheduler.due_receiver()
    }

    pub fn set_transaction_check_listener(&self, listener: Arc<dyn TransactionCheckListener>) {
        *self.tx_listener.write() = Some(listener);
    }

    /// Opens a transaction half-message: the payload is held back from
    /// every queue until commit, while periodic checks query the producer
    /// for the outcome.
    pub fn begin_transaction(
        &self,
        topic: &str,
        queue_id: Option<u32>,
        payload: Bytes,
    ) -> AppResult<String> {
        self.topic_meta(topic)?;
        let msg_id = uuid::Uuid::new_v4().to_string();
        self.pending_transactions.insert(
            msg_id.clone(),
            PendingTransaction {
                topic: topic.to_string(),
                queue_id,
                payload,
                check_times: 0,
            },
        );
        let record = DelayRecord::new(
            DelayPayload::TxCheck {
                msg_id: msg_id.clone(),
            },
            self.config.delay.tx_check_interval_secs,
        );
        self.schedule_delay(record)?;
        debug!("opened transaction {} on {}", msg_id, topic);
        Ok(msg_id)
    }

    /// Commits a half-message: removes the pending entry (suppressing
    /// further checks) and appends the held payload.
    pub async fn commit_transaction(&self, msg_id: &str) -> AppResult<ProduceAck> {
        let (_, pending) = self.pending_transactions.remove(msg_id).ok_or_else(|| {
            AppError::InvalidOperation(format!("no pending transaction {}", msg_id))
        })?;
        let request = ProduceRequest {
            topic: pending.topic,
            queue_id: pending.queue_id,
            payload: pending.payload,
            delay_secs: 0,
            retry_of: None,
            send_mode: None,
        };
        self.produce(request).await
    }

    /// Rolls a half-message back; the next check finds no pending entry
    /// and the record dies quietly.
    pub fn rollback_transaction(&self, msg_id: &str) -> AppResult<()> {
        self.pending_transactions
            .remove(msg_id)
            .map(|_| ())
            .ok_or_else(|| AppError::InvalidOperation(format!("no pending transaction {}", msg_id)))
    }

    /// Journals then schedules a delay record. Validation happens before
    /// the journal write so rejected delays leave no trace.
    pub fn schedule_delay(&self, record: DelayRecord) -> AppResult<()> {
        let delay_secs = record.delay_secs;
        self.scheduler.validate_delay(delay_secs)?;
        self.delay_journal.record_scheduled(&record)?;
        self.scheduler.schedule(record, delay_secs)
    }

    /// Flushes every store and writes final snapshots.
    pub async fn close(&self) -> AppResult<()> {
        for entry in self.commit_logs.iter() {
            entry.value().flush()?;
        }
        for entry in self.consume_queues.iter() {
            for queue in entry.value().iter() {
                queue.flush()?;
            }
        }
        self.offsets.snapshot().await?;
        self.meta_db.lock().save()?;
        info!("engine closed");
        Ok(())
    }
}
