//! Delay scheduling end to end: the scan task, the shared request pool
//! and the delay-fire forwarder, driven deterministically under paused
//! tokio time.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use flintmq::{
    spawn_delay_forwarder, BrokerConfig, Engine, EngineRequestHandler, MultipleChannelWorkerPool,
    ProduceRequest, PullRequest, RequestTask, StorageConfig, WorkerPoolConfig,
};

struct Harness {
    engine: Arc<Engine>,
    notify_shutdown: broadcast::Sender<()>,
    _pool: Arc<MultipleChannelWorkerPool<RequestTask>>,
}

async fn start_harness(dir: &TempDir) -> Harness {
    let config = BrokerConfig {
        storage: StorageConfig {
            base_dir: dir.path().join("store").to_string_lossy().to_string(),
            commit_segment_size: 64 * 1024,
            queue_segment_size: 16 * 64,
            flush_on_append: false,
        },
        ..Default::default()
    };
    let engine = Engine::bootstrap(Arc::new(config)).await.unwrap();

    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, _) = mpsc::channel(1);
    engine.start_tasks(&notify_shutdown, &shutdown_complete_tx);

    let pool = Arc::new(MultipleChannelWorkerPool::new(
        notify_shutdown.clone(),
        shutdown_complete_tx,
        EngineRequestHandler::new(engine.clone()),
        WorkerPoolConfig {
            channel_capacity: 64,
            num_channels: 2,
            monitor_interval: Duration::from_secs(60),
            worker_check_timeout: Duration::from_millis(10),
        },
    ));
    spawn_delay_forwarder(engine.clone(), pool.clone(), &notify_shutdown);

    Harness {
        engine,
        notify_shutdown,
        _pool: pool,
    }
}

/// Lets spawned tasks make progress on the current-thread test runtime.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

async fn advance(secs: u64) {
    for _ in 0..secs {
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
    }
}

fn pull(topic: &str, queue_id: u32) -> PullRequest {
    PullRequest {
        topic: topic.to_string(),
        group: "g1".to_string(),
        queue_id,
        batch_size: 10,
    }
}

#[tokio::test(start_paused = true)]
async fn delayed_message_fires_within_one_tick_and_never_early() {
    let dir = TempDir::new().unwrap();
    let harness = start_harness(&dir).await;
    let engine = &harness.engine;
    engine.create_topic("orders", 1).unwrap();
    settle().await;

    let ack = engine
        .produce(
            ProduceRequest::new("orders", Bytes::from_static(b"in 5s"))
                .with_queue(0)
                .with_delay(5),
        )
        .await
        .unwrap();
    assert!(ack.scheduled);

    advance(4).await;
    assert!(engine.pull(&pull("orders", 0)).unwrap().is_empty());

    advance(2).await;
    let messages = engine.pull(&pull("orders", 0)).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload.as_ref(), b"in 5s");

    let _ = harness.notify_shutdown.send(());
}

#[tokio::test(start_paused = true)]
async fn ninety_second_delay_cascades_from_minutes_to_seconds_wheel() {
    let dir = TempDir::new().unwrap();
    let harness = start_harness(&dir).await;
    let engine = &harness.engine;
    engine.create_topic("orders", 1).unwrap();
    settle().await;

    engine
        .produce(
            ProduceRequest::new("orders", Bytes::from_static(b"in 90s"))
                .with_queue(0)
                .with_delay(90),
        )
        .await
        .unwrap();

    // still waiting after the minute boundary: the record moved to the
    // seconds wheel with a 30s remainder
    advance(60).await;
    assert!(engine.pull(&pull("orders", 0)).unwrap().is_empty());

    advance(29).await;
    assert!(engine.pull(&pull("orders", 0)).unwrap().is_empty());

    advance(2).await;
    let messages = engine.pull(&pull("orders", 0)).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload.as_ref(), b"in 90s");

    let _ = harness.notify_shutdown.send(());
}

#[tokio::test(start_paused = true)]
async fn multiple_delayed_messages_all_fire() {
    let dir = TempDir::new().unwrap();
    let harness = start_harness(&dir).await;
    let engine = &harness.engine;
    engine.create_topic("orders", 1).unwrap();
    settle().await;

    for delay in [1u32, 2, 3] {
        engine
            .produce(
                ProduceRequest::new("orders", Bytes::from(format!("d{}", delay)))
                    .with_queue(0)
                    .with_delay(delay),
            )
            .await
            .unwrap();
    }

    advance(5).await;
    let messages = engine.pull(&pull("orders", 0)).unwrap();
    assert_eq!(messages.len(), 3);

    let _ = harness.notify_shutdown.send(());
}
