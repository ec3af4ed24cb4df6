use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::replication::AckMode;
use crate::storage::INDEX_RECORD_SIZE;
use crate::utils::WorkerPoolConfig;

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    /// broker node id, used in logs and replication frames
    pub id: i32,
    /// maximum accepted message payload size in bytes
    pub max_msg_size: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            id: 0,
            max_msg_size: 4 * 1024 * 1024,
        }
    }
}

/// Configuration for the commit log and consume queue stores.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all topic data.
    pub base_dir: String,
    /// The capacity of each commit log segment.
    pub commit_segment_size: u64,
    /// The capacity of each consume queue segment, a multiple of the
    /// 16-byte index record size.
    pub queue_segment_size: u64,
    /// Force each append to stable storage before acknowledging.
    pub flush_on_append: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: "store".to_string(),
            commit_segment_size: 64 * 1024 * 1024,
            queue_segment_size: 16 * 100_000,
            flush_on_append: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OffsetConfig {
    /// The interval at which the consumption offset table is snapshotted.
    pub snapshot_interval_ms: u64,
}

impl Default for OffsetConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Upper bound on a raw delay request; requests above it are rejected
    /// before entering the wheel.
    pub max_delay_secs: u32,
    /// Interval between transaction half-message checks.
    pub tx_check_interval_secs: u32,
    /// Checks performed before an unresolved half-message is discarded.
    pub tx_max_check_times: u32,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            max_delay_secs: 3600,
            tx_check_interval_secs: 30,
            tx_max_check_times: 15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Default acknowledgement policy for produce requests.
    pub mode: AckMode,
    /// How long a sync/semi-sync append waits for slave acknowledgements.
    pub ack_timeout_ms: u64,
    /// Fraction of slaves whose acknowledgement satisfies semi-sync mode.
    pub quorum_ratio: f64,
    /// Capacity of each slave transfer channel.
    pub channel_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: AckMode::Async,
            ack_timeout_ms: 3000,
            quorum_ratio: 0.5,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHandlerPool {
    pub channel_capacity: usize,
    /// `0` derives the channel count from the number of cpus.
    pub num_channels: i8,
    /// monitor interval in seconds
    pub monitor_interval: u64,
    /// worker liveness check timeout in milliseconds
    pub worker_check_timeout: u64,
}

impl Default for RequestHandlerPool {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: 0,
            monitor_interval: 5,
            worker_check_timeout: 200,
        }
    }
}

impl RequestHandlerPool {
    pub fn to_pool_config(&self) -> WorkerPoolConfig {
        let num_channels = if self.num_channels <= 0 {
            num_cpus::get().min(i8::MAX as usize) as i8
        } else {
            self.num_channels
        };
        WorkerPoolConfig {
            channel_capacity: self.channel_capacity,
            num_channels,
            monitor_interval: Duration::from_secs(self.monitor_interval),
            worker_check_timeout: Duration::from_millis(self.worker_check_timeout),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    pub storage: StorageConfig,
    pub offset: OffsetConfig,
    pub delay: DelayConfig,
    pub replication: ReplicationConfig,
    pub request_handler_pool: RequestHandlerPool,
}

impl BrokerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.validate()?;

        Ok(broker_config)
    }

    /// Rejects configurations the stores cannot operate on. Run once at
    /// load time so the engine never has to re-check.
    pub fn validate(&self) -> AppResult<()> {
        if self.storage.commit_segment_size < 64 {
            return Err(AppError::InvalidValue(format!(
                "commit_segment_size too small: {}",
                self.storage.commit_segment_size
            )));
        }
        if self.storage.queue_segment_size == 0
            || self.storage.queue_segment_size % INDEX_RECORD_SIZE as u64 != 0
        {
            return Err(AppError::InvalidValue(format!(
                "queue_segment_size must be a nonzero multiple of {}: {}",
                INDEX_RECORD_SIZE, self.storage.queue_segment_size
            )));
        }
        if self.offset.snapshot_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "offset snapshot_interval_ms must be nonzero".to_string(),
            ));
        }
        if self.delay.max_delay_secs == 0 || self.delay.max_delay_secs > 3600 {
            return Err(AppError::InvalidValue(format!(
                "max_delay_secs must be within the wheel span (1..=3600): {}",
                self.delay.max_delay_secs
            )));
        }
        if !(self.replication.quorum_ratio > 0.0 && self.replication.quorum_ratio <= 1.0) {
            return Err(AppError::InvalidValue(format!(
                "quorum_ratio must be in (0, 1]: {}",
                self.replication.quorum_ratio
            )));
        }
        Ok(())
    }
}
