//! Produce-side operations: the direct append path, delayed and retry
//! scheduling, dead-letter routing and the execution of due delay
//! records.

use tracing::{debug, error, trace, warn};

use crate::delay::{retry_backoff, DelayPayload, DelayRecord};
use crate::message::{dlq_topic, retry_topic, ProduceAck, ProduceRequest, RetryOrigin, TopicMeta};
use crate::replication::ReplicationFrame;
use crate::storage::AppendPosition;
use crate::{AppError, AppResult};

use super::Engine;

impl Engine {
    /// Handles one produce request end to end: local append with
    /// synchronous dispatch, then replication fan-out under the
    /// requested (or configured) acknowledgement policy.
    ///
    /// A nonzero delay routes the message through the scheduler instead;
    /// it reaches a queue only when it fires. A retry request schedules a
    /// redelivery pointer, or dead-letters the message once its retry
    /// budget is exhausted.
    pub async fn produce(&self, request: ProduceRequest) -> AppResult<ProduceAck> {
        if let Some(origin) = request.retry_of {
            return self.schedule_retry(origin).await;
        }
        if request.payload.is_empty() {
            return Err(AppError::InvalidValue("empty payload".to_string()));
        }
        if request.payload.len() > self.config.general.max_msg_size {
            return Err(AppError::InvalidValue(format!(
                "payload of {} bytes exceeds max_msg_size {}",
                request.payload.len(),
                self.config.general.max_msg_size
            )));
        }
        self.topic_meta(&request.topic)?;

        if request.delay_secs > 0 {
            let record = DelayRecord::new(
                DelayPayload::Message {
                    topic: request.topic.clone(),
                    queue_id: request.queue_id,
                    payload: request.payload,
                },
                request.delay_secs,
            );
            self.schedule_delay(record)?;
            debug!(
                "scheduled delayed message for {} in {}s",
                request.topic, request.delay_secs
            );
            return Ok(ProduceAck {
                topic: request.topic,
                queue_id: None,
                segment_id: 0,
                offset: 0,
                scheduled: true,
            });
        }

        let (queue_id, position) =
            self.append_local(&request.topic, request.queue_id, &request.payload, 0)?;

        let mode = request.send_mode.unwrap_or(self.config.replication.mode);
        let frame = ReplicationFrame {
            topic: request.topic.clone(),
            segment_id: position.segment_id,
            offset: position.offset,
            payload: request.payload,
        };
        self.replication.replicate(frame, mode).await?;

        Ok(ProduceAck {
            topic: request.topic,
            queue_id: Some(queue_id),
            segment_id: position.segment_id,
            offset: position.offset,
            scheduled: false,
        })
    }

    /// Appends to the topic's commit log and dispatches the index record
    /// while the append lock is held. Returns the selected queue and the
    /// append position.
    pub(crate) fn append_local(
        &self,
        topic: &str,
        explicit_queue: Option<u32>,
        payload: &[u8],
        retry_times: u32,
    ) -> AppResult<(u32, AppendPosition)> {
        let log = self.commit_log(topic)?;
        let queues = self.queues(topic)?;
        let (position, queue_id) = log.append(payload, |position| {
            self.dispatcher
                .dispatch(topic, &queues, explicit_queue, position, retry_times)
        })?;
        Ok((queue_id, position))
    }

    /// Schedules a redelivery for a failed consumption, or dead-letters
    /// it once the backoff table is exhausted. Dead-lettering is silent
    /// to the producer by design; it only shows up in the logs.
    async fn schedule_retry(&self, origin: RetryOrigin) -> AppResult<ProduceAck> {
        self.commit_log(&origin.topic)?;
        match retry_backoff(origin.retry_times) {
            Some(delay_secs) => {
                let group = origin.group.clone();
                let record =
                    DelayRecord::new(DelayPayload::RetryPointer(origin), delay_secs);
                self.schedule_delay(record)?;
                debug!(
                    "scheduled redelivery for group {} in {}s",
                    group, delay_secs
                );
                Ok(ProduceAck {
                    topic: retry_topic(&group),
                    queue_id: None,
                    segment_id: 0,
                    offset: 0,
                    scheduled: true,
                })
            }
            None => self.route_to_dead_letter(&origin),
        }
    }

    fn route_to_dead_letter(&self, origin: &RetryOrigin) -> AppResult<ProduceAck> {
        let payload = self.commit_log(&origin.topic)?.read(
            origin.commit_segment_id,
            origin.msg_index,
            origin.msg_length,
        )?;
        let topic = dlq_topic(&origin.group);
        self.create_topic_inner(TopicMeta::new(topic.clone(), 1))?;
        let (queue_id, position) = self.append_local(&topic, None, &payload, origin.retry_times)?;
        warn!(
            "retry budget exhausted after {} attempts; message from {} routed to {}",
            origin.retry_times, origin.topic, topic
        );
        Ok(ProduceAck {
            topic,
            queue_id: Some(queue_id),
            segment_id: position.segment_id,
            offset: position.offset,
            scheduled: false,
        })
    }

    /// Executes one due delay record. Runs as an ordinary unit of work on
    /// the shared request pool; failures are logged, never retried. The
    /// journal keeps the record pending for the next startup replay.
    pub async fn fire_due(&self, record: DelayRecord) {
        let id = record.id.clone();
        if let Err(e) = self.fire_due_inner(record).await {
            error!("firing delay record {} failed: {}", id, e);
        }
    }

    async fn fire_due_inner(&self, record: DelayRecord) -> AppResult<()> {
        match &record.payload {
            DelayPayload::Message {
                topic,
                queue_id,
                payload,
            } => {
                let (queue, position) = self.append_local(topic, *queue_id, payload, 0)?;
                trace!(
                    "fired delayed message into {}/{} at {}",
                    topic,
                    queue,
                    position.offset
                );
                let frame = ReplicationFrame {
                    topic: topic.clone(),
                    segment_id: position.segment_id,
                    offset: position.offset,
                    payload: payload.clone(),
                };
                // the local append stands regardless; there is no producer
                // left to report a replication failure to
                if let Err(e) = self
                    .replication
                    .replicate(frame, self.config.replication.mode)
                    .await
                {
                    warn!("replication of fired message failed: {}", e);
                }
            }
            DelayPayload::RetryPointer(origin) => {
                let payload = self.commit_log(&origin.topic)?.read(
                    origin.commit_segment_id,
                    origin.msg_index,
                    origin.msg_length,
                )?;
                let topic = retry_topic(&origin.group);
                self.create_topic_inner(TopicMeta::new(topic.clone(), 1))?;
                let next_retry = origin.retry_times + 1;
                self.append_local(&topic, None, &payload, next_retry)?;
                debug!(
                    "redelivered message from {} to {} (attempt {})",
                    origin.topic, topic, next_retry
                );
            }
            DelayPayload::TxCheck { msg_id } => self.fire_tx_check(msg_id)?,
        }
        self.delay_journal.record_fired(&record.id)
    }

    /// One transaction check firing: if the half-message is still
    /// pending, query the registered listener and schedule the next
    /// check; a commit/rollback in the meantime suppresses both.
    fn fire_tx_check(&self, msg_id: &str) -> AppResult<()> {
        let reschedule = match self.pending_transactions.get_mut(msg_id) {
            None => {
                trace!("transaction {} already resolved, check suppressed", msg_id);
                return Ok(());
            }
            Some(mut pending) => {
                pending.check_times += 1;
                pending.check_times <= self.config.delay.tx_max_check_times
            }
        };
        if !reschedule {
            self.pending_transactions.remove(msg_id);
            warn!(
                "transaction {} unresolved after {} checks, discarding",
                msg_id, self.config.delay.tx_max_check_times
            );
            return Ok(());
        }

        let listener = self.tx_listener.read().clone();
        if let Some(listener) = listener {
            listener.on_check(msg_id);
        } else {
            warn!("no transaction check listener registered for {}", msg_id);
        }
        let record = DelayRecord::new(
            DelayPayload::TxCheck {
                msg_id: msg_id.to_string(),
            },
            self.config.delay.tx_check_interval_secs,
        );
        self.schedule_delay(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckRequest, PullRequest};
    use crate::service::{BrokerConfig, StorageConfig};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn test_engine(dir: &TempDir) -> Arc<Engine> {
        let config = BrokerConfig {
            storage: StorageConfig {
                base_dir: dir.path().join("store").to_string_lossy().to_string(),
                commit_segment_size: 64 * 1024,
                queue_segment_size: 16 * 64,
                flush_on_append: false,
            },
            ..Default::default()
        };
        Engine::bootstrap(Arc::new(config)).await.unwrap()
    }

    fn pull_request(topic: &str, group: &str, queue_id: u32) -> PullRequest {
        PullRequest {
            topic: topic.to_string(),
            group: group.to_string(),
            queue_id,
            batch_size: 10,
        }
    }

    #[tokio::test]
    async fn test_produce_to_unknown_topic_fails() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        let result = engine
            .produce(ProduceRequest::new("missing", Bytes::from_static(b"x")))
            .await;
        assert!(matches!(result, Err(AppError::TopicNotFound(_))));
    }

    #[tokio::test]
    async fn test_produce_dispatches_to_exactly_one_queue() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 3).unwrap();

        let ack = engine
            .produce(ProduceRequest::new("orders", Bytes::from_static(b"hello")))
            .await
            .unwrap();
        assert!(!ack.scheduled);
        let queue_id = ack.queue_id.unwrap();

        let queues = engine.queues("orders").unwrap();
        for queue in queues.iter() {
            let expected = if queue.queue_id() == queue_id { 16 } else { 0 };
            assert_eq!(queue.write_position().offset, expected);
        }

        let messages = engine.pull(&pull_request("orders", "g1", queue_id)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_pull_without_data_is_empty_not_error() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 3).unwrap();
        let messages = engine.pull(&pull_request("orders", "g1", 0)).unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_pull_is_stable_until_ack() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 1).unwrap();
        for n in 0..3 {
            engine
                .produce(
                    ProduceRequest::new("orders", Bytes::from(format!("m{}", n))).with_queue(0),
                )
                .await
                .unwrap();
        }

        let first = engine.pull(&pull_request("orders", "g1", 0)).unwrap();
        let second = engine.pull(&pull_request("orders", "g1", 0)).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(
            first.iter().map(|m| m.payload.clone()).collect::<Vec<_>>(),
            second.iter().map(|m| m.payload.clone()).collect::<Vec<_>>()
        );

        assert!(engine.ack(&AckRequest {
            topic: "orders".to_string(),
            group: "g1".to_string(),
            queue_id: 0,
            count: 2,
        }));
        let after_ack = engine.pull(&pull_request("orders", "g1", 0)).unwrap();
        assert_eq!(after_ack.len(), 1);
        assert_eq!(after_ack[0].payload.as_ref(), b"m2");
    }

    #[tokio::test]
    async fn test_independent_groups_have_independent_cursors() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 1).unwrap();
        engine
            .produce(ProduceRequest::new("orders", Bytes::from_static(b"x")).with_queue(0))
            .await
            .unwrap();

        assert!(engine.ack(&AckRequest {
            topic: "orders".to_string(),
            group: "g1".to_string(),
            queue_id: 0,
            count: 1,
        }));
        assert!(engine.pull(&pull_request("orders", "g1", 0)).unwrap().is_empty());
        assert_eq!(engine.pull(&pull_request("orders", "g2", 0)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delayed_produce_is_scheduled_not_queued() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 1).unwrap();

        let ack = engine
            .produce(
                ProduceRequest::new("orders", Bytes::from_static(b"later")).with_delay(30),
            )
            .await
            .unwrap();
        assert!(ack.scheduled);
        assert_eq!(engine.scheduler.pending(), 1);
        assert!(engine.pull(&pull_request("orders", "g1", 0)).unwrap().is_empty());
        assert_eq!(engine.delay_journal.replay().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delay_beyond_wheel_span_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 1).unwrap();

        let accepted = engine
            .produce(
                ProduceRequest::new("orders", Bytes::from_static(b"later")).with_delay(3600),
            )
            .await
            .unwrap();
        assert!(accepted.scheduled);

        let rejected = engine
            .produce(
                ProduceRequest::new("orders", Bytes::from_static(b"later")).with_delay(3601),
            )
            .await;
        assert!(matches!(rejected, Err(AppError::DelayOutOfRange(3601))));
        // the rejected delay never reached the wheel or the journal
        assert_eq!(engine.scheduler.pending(), 1);
        assert_eq!(engine.delay_journal.replay().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fired_message_reaches_queue() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 1).unwrap();

        let record = DelayRecord::new(
            DelayPayload::Message {
                topic: "orders".to_string(),
                queue_id: Some(0),
                payload: Bytes::from_static(b"due"),
            },
            5,
        );
        engine.schedule_delay(record.clone()).unwrap();
        engine.fire_due(record).await;

        let messages = engine.pull(&pull_request("orders", "g1", 0)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_ref(), b"due");
        // fired records do not survive a replay
        assert!(engine.delay_journal.replay().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_fires_into_group_retry_topic() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 1).unwrap();
        let ack = engine
            .produce(ProduceRequest::new("orders", Bytes::from_static(b"flaky")).with_queue(0))
            .await
            .unwrap();

        let origin = RetryOrigin {
            topic: "orders".to_string(),
            group: "g1".to_string(),
            commit_segment_id: ack.segment_id,
            msg_index: ack.offset as u32,
            msg_length: 5,
            retry_times: 0,
        };
        let mut request = ProduceRequest::new("orders", Bytes::new());
        request.retry_of = Some(origin.clone());
        let ack = engine.produce(request).await.unwrap();
        assert!(ack.scheduled);

        // drive the pointer as if its backoff elapsed
        let record = DelayRecord::new(DelayPayload::RetryPointer(origin), 1);
        engine.fire_due(record).await;

        let retry = retry_topic("g1");
        let messages = engine.pull(&pull_request(&retry, "g1", 0)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_ref(), b"flaky");
        assert_eq!(messages[0].index.retry_times, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retry_goes_to_dead_letter() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 1).unwrap();
        let ack = engine
            .produce(ProduceRequest::new("orders", Bytes::from_static(b"doomed")).with_queue(0))
            .await
            .unwrap();

        let origin = RetryOrigin {
            topic: "orders".to_string(),
            group: "g1".to_string(),
            commit_segment_id: ack.segment_id,
            msg_index: ack.offset as u32,
            msg_length: 6,
            retry_times: crate::delay::RETRY_BACKOFF_SECS.len() as u32,
        };
        let mut request = ProduceRequest::new("orders", Bytes::new());
        request.retry_of = Some(origin);
        let ack = engine.produce(request).await.unwrap();
        assert!(!ack.scheduled);
        assert_eq!(ack.topic, dlq_topic("g1"));

        let messages = engine.pull(&pull_request(&dlq_topic("g1"), "g1", 0)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_ref(), b"doomed");
    }

    struct CountingListener {
        checks: AtomicUsize,
    }

    impl crate::engine::TransactionCheckListener for CountingListener {
        fn on_check(&self, _msg_id: &str) {
            self.checks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_tx_check_fires_listener_until_commit() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 1).unwrap();
        let listener = Arc::new(CountingListener {
            checks: AtomicUsize::new(0),
        });
        engine.set_transaction_check_listener(listener.clone());

        let msg_id = engine
            .begin_transaction("orders", Some(0), Bytes::from_static(b"half"))
            .unwrap();
        // half message is invisible
        assert!(engine.pull(&pull_request("orders", "g1", 0)).unwrap().is_empty());

        let record = DelayRecord::new(DelayPayload::TxCheck { msg_id: msg_id.clone() }, 1);
        engine.fire_due(record).await;
        assert_eq!(listener.checks.load(Ordering::SeqCst), 1);

        let ack = engine.commit_transaction(&msg_id).await.unwrap();
        assert!(!ack.scheduled);
        assert_eq!(engine.pull(&pull_request("orders", "g1", 0)).unwrap().len(), 1);

        // after commit a late check is suppressed
        let record = DelayRecord::new(DelayPayload::TxCheck { msg_id: msg_id.clone() }, 1);
        engine.fire_due(record).await;
        assert_eq!(listener.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_half_message() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        engine.create_topic("orders", 1).unwrap();
        let msg_id = engine
            .begin_transaction("orders", Some(0), Bytes::from_static(b"half"))
            .unwrap();
        engine.rollback_transaction(&msg_id).unwrap();
        assert!(engine.commit_transaction(&msg_id).await.is_err());
        assert!(engine.pull(&pull_request("orders", "g1", 0)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_restart_recovers_state() {
        let dir = TempDir::new().unwrap();
        {
            let engine = test_engine(&dir).await;
            engine.create_topic("orders", 2).unwrap();
            engine
                .produce(ProduceRequest::new("orders", Bytes::from_static(b"durable")).with_queue(1))
                .await
                .unwrap();
            engine
                .produce(
                    ProduceRequest::new("orders", Bytes::from_static(b"later")).with_delay(600),
                )
                .await
                .unwrap();
            engine.ack(&AckRequest {
                topic: "orders".to_string(),
                group: "g1".to_string(),
                queue_id: 1,
                count: 1,
            });
            engine.close().await.unwrap();
        }

        let engine = test_engine(&dir).await;
        assert_eq!(engine.topic_meta("orders").unwrap().queue_count, 2);
        // the pending delayed message re-entered the wheel
        assert_eq!(engine.scheduler.pending(), 1);
        // the acked cursor survived the restart
        assert!(engine.pull(&pull_request("orders", "g1", 1)).unwrap().is_empty());
        // the stored message is still resolvable for a fresh group
        let messages = engine.pull(&pull_request("orders", "g2", 1)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_ref(), b"durable");
    }
}
