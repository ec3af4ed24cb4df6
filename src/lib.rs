mod delay;
mod engine;
mod message;
mod offset;
mod replication;
mod request;
mod service;
mod storage;
mod utils;

pub use delay::{
    DelayJournal, DelayPayload, DelayRecord, DelayScheduler, RETRY_BACKOFF_SECS, WHEEL_SLOTS,
};
pub use engine::{Engine, TransactionCheckListener};
pub use message::{
    dlq_topic, is_reserved_topic, retry_topic, AckRequest, ProduceAck, ProduceRequest, PullRequest,
    PulledMessage, RetryOrigin, TopicMeta, DELAY_JOURNAL_TOPIC, DLQ_TOPIC_PREFIX,
    RETRY_TOPIC_PREFIX,
};
pub use offset::{GroupKey, OffsetTracker};
pub use replication::{
    AckMode, ReplicationCoordinator, ReplicationEvent, ReplicationFrame,
};
pub use request::{channel_for, spawn_delay_forwarder, EngineRequestHandler, RequestTask};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Broker, BrokerConfig, DelayConfig,
    GeneralConfig, OffsetConfig, ReplicationConfig, RequestHandlerPool, Shutdown, StorageConfig,
};
pub use storage::{
    segment_file_name, AppendPosition, CommitLog, ConsumeQueue, IndexRecord, OffsetPosition,
    FRAME_HEADER_SIZE, INDEX_RECORD_SIZE,
};
pub use utils::{MultipleChannelWorkerPool, PoolHandler, WorkerPoolConfig};
