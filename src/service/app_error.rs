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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// storage errors
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("queue not found: {0}/{1}")]
    QueueNotFound(String, u32),

    #[error("segment not found: {0}")]
    SegmentNotFound(String),

    #[error("segment I/O error: {0}")]
    SegmentIo(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// delivery errors
    #[error("replication timeout: {0}")]
    ReplicationTimeout(String),

    #[error("delay out of range: {0}s")]
    DelayOutOfRange(u32),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl AppError {
    /// Status code reported at the request boundary, paired with the
    /// human-readable reason from `Display`.
    pub fn status(&self) -> &'static str {
        match self {
            AppError::TopicNotFound(_) => "TOPIC_NOT_FOUND",
            AppError::QueueNotFound(_, _) => "QUEUE_NOT_FOUND",
            AppError::SegmentNotFound(_) | AppError::SegmentIo(_) => "SEGMENT_IO_FAILURE",
            AppError::CorruptRecord(_) => "CORRUPT_RECORD",
            AppError::ReplicationTimeout(_) => "REPLICATION_TIMEOUT",
            AppError::DelayOutOfRange(_) => "DELAY_OUT_OF_RANGE",
            _ => "INTERNAL_ERROR",
        }
    }
}
