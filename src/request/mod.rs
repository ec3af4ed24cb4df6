//! Typed request dispatch.
//!
//! Every unit of work the engine performs (produce, pull, ack, admin,
//! delayed-fire) is a [`RequestTask`] drained from the bounded worker
//! pool and routed by one exhaustive `match`. There is no dynamic handler
//! registration; the task enum is the dispatch table.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::delay::DelayRecord;
use crate::engine::Engine;
use crate::message::{AckRequest, ProduceAck, ProduceRequest, PullRequest, PulledMessage};
use crate::utils::{MultipleChannelWorkerPool, PoolHandler};
use crate::{AppResult, Shutdown};

/// One unit of work for the request pool. Replies travel back over
/// oneshots to whatever transport submitted the task.
#[derive(Debug)]
pub enum RequestTask {
    Produce {
        request: ProduceRequest,
        reply: oneshot::Sender<AppResult<ProduceAck>>,
    },
    Pull {
        request: PullRequest,
        reply: oneshot::Sender<AppResult<Vec<PulledMessage>>>,
    },
    Ack {
        request: AckRequest,
        reply: oneshot::Sender<bool>,
    },
    CreateTopic {
        name: String,
        queue_count: u32,
        reply: oneshot::Sender<AppResult<()>>,
    },
    /// A due delay record published by the scan task.
    FireDelayed { record: DelayRecord },
}

impl RequestTask {
    /// Topic the task concerns; used to pin same-topic work to one pool
    /// channel.
    fn topic(&self) -> &str {
        match self {
            RequestTask::Produce { request, .. } => &request.topic,
            RequestTask::Pull { request, .. } => &request.topic,
            RequestTask::Ack { request, .. } => &request.topic,
            RequestTask::CreateTopic { name, .. } => name,
            RequestTask::FireDelayed { record } => &record.id,
        }
    }
}

/// Deterministic topic-to-channel assignment so appends to one topic stay
/// ordered on a single pool worker.
pub fn channel_for(task: &RequestTask, channel_count: usize) -> i8 {
    let mut hasher = DefaultHasher::new();
    task.topic().hash(&mut hasher);
    (hasher.finish() % channel_count as u64) as i8
}

#[derive(Clone)]
pub struct EngineRequestHandler {
    engine: Arc<Engine>,
}

impl EngineRequestHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl PoolHandler<RequestTask> for EngineRequestHandler {
    fn handle(&self, task: RequestTask) -> impl Future<Output = ()> + Send {
        let engine = self.engine.clone();
        async move {
            match task {
                RequestTask::Produce { request, reply } => {
                    let result = engine.produce(request).await;
                    let _ = reply.send(result);
                }
                RequestTask::Pull { request, reply } => {
                    let _ = reply.send(engine.pull(&request));
                }
                RequestTask::Ack { request, reply } => {
                    let _ = reply.send(engine.ack(&request));
                }
                RequestTask::CreateTopic {
                    name,
                    queue_count,
                    reply,
                } => {
                    let _ = reply.send(engine.create_topic(&name, queue_count));
                }
                RequestTask::FireDelayed { record } => {
                    engine.fire_due(record).await;
                }
            }
        }
    }
}

/// Forwards due delay records from the scheduler into the shared request
/// pool, so firing runs as ordinary pool work and the scan task never
/// blocks on handlers.
pub fn spawn_delay_forwarder(
    engine: Arc<Engine>,
    pool: Arc<MultipleChannelWorkerPool<RequestTask>>,
    notify_shutdown: &broadcast::Sender<()>,
) {
    let due_rx = engine.due_receiver();
    let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
    let channel_count = pool.channel_count();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = due_rx.recv() => {
                    let record = match received {
                        Ok(record) => record,
                        Err(_) => {
                            warn!("due channel closed, stopping delay forwarder");
                            break;
                        }
                    };
                    let task = RequestTask::FireDelayed { record };
                    let channel = channel_for(&task, channel_count);
                    if pool.send(task, channel).await.is_err() {
                        warn!("request pool closed, stopping delay forwarder");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("delay forwarder received shutdown signal");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{BrokerConfig, StorageConfig};
    use crate::utils::WorkerPoolConfig;
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

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

    fn test_pool(
        engine: Arc<Engine>,
        notify_shutdown: &broadcast::Sender<()>,
    ) -> Arc<MultipleChannelWorkerPool<RequestTask>> {
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        Arc::new(MultipleChannelWorkerPool::new(
            notify_shutdown.clone(),
            shutdown_complete_tx,
            EngineRequestHandler::new(engine),
            WorkerPoolConfig {
                channel_capacity: 16,
                num_channels: 2,
                monitor_interval: Duration::from_secs(5),
                worker_check_timeout: Duration::from_millis(50),
            },
        ))
    }

    #[test]
    fn test_channel_assignment_is_stable_per_topic() {
        let task = |topic: &str| RequestTask::CreateTopic {
            name: topic.to_string(),
            queue_count: 1,
            reply: oneshot::channel().0,
        };
        let a1 = channel_for(&task("orders"), 4);
        let a2 = channel_for(&task("orders"), 4);
        assert_eq!(a1, a2);
        assert!((0..4).contains(&(channel_for(&task("audit"), 4) as i32)));
    }

    #[tokio::test]
    async fn test_pool_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        let (notify_shutdown, _) = broadcast::channel(1);
        let pool = test_pool(engine.clone(), &notify_shutdown);

        let (reply, reply_rx) = oneshot::channel();
        let task = RequestTask::CreateTopic {
            name: "orders".to_string(),
            queue_count: 3,
            reply,
        };
        let channel = channel_for(&task, pool.channel_count());
        pool.send(task, channel).await.unwrap();
        reply_rx.await.unwrap().unwrap();

        let (reply, reply_rx) = oneshot::channel();
        let task = RequestTask::Produce {
            request: ProduceRequest::new("orders", Bytes::from_static(b"via pool")),
            reply,
        };
        let channel = channel_for(&task, pool.channel_count());
        pool.send(task, channel).await.unwrap();
        let ack = reply_rx.await.unwrap().unwrap();
        assert!(!ack.scheduled);

        let (reply, reply_rx) = oneshot::channel();
        let task = RequestTask::Pull {
            request: PullRequest {
                topic: "orders".to_string(),
                group: "g1".to_string(),
                queue_id: ack.queue_id.unwrap(),
                batch_size: 10,
            },
            reply,
        };
        let channel = channel_for(&task, pool.channel_count());
        pool.send(task, channel).await.unwrap();
        let messages = reply_rx.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_ref(), b"via pool");

        let _ = notify_shutdown.send(());
    }
}
