//! Storage layer: segmented commit log, per-queue index store and the
//! append-to-index dispatcher.
//!
//! This module provides:
//! - Memory-mapped segment file management
//! - Commit log append/read with roll-on-full segments
//! - Fixed 16-byte consume queue index records
//! - Dispatch of every append into exactly one queue index

mod codec;
mod commit_log;
mod consume_queue;
mod dispatcher;
mod segment_file;

pub use codec::{decode_frame_header, encode_frame, FrameHeader, IndexRecord};
pub use commit_log::{AppendPosition, CommitLog};
pub use consume_queue::{ConsumeQueue, OffsetPosition};
pub use dispatcher::Dispatcher;
pub use segment_file::{provision_segment, ReadOnlySegmentFile, WritableSegmentFile};

/// Size of one consume-queue index record.
pub const INDEX_RECORD_SIZE: usize = 16;

/// Length prefix plus CRC32C, prepended to every commit-log record.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Directory holding a topic's commit log segments.
pub const COMMIT_LOG_DIR: &str = "commitlog";
/// Directory holding a topic's consume queue index segments.
pub const CONSUME_QUEUE_DIR: &str = "consumequeue";

/// Decimal segment id, zero-padded to 8 digits.
pub fn segment_file_name(segment_id: u32) -> String {
    format!("{:08}", segment_id)
}

/// Inverse of [`segment_file_name`]; `None` for anything that is not an
/// 8-digit decimal name.
pub fn parse_segment_file_name(name: &str) -> Option<u32> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_file_name_padding() {
        assert_eq!(segment_file_name(0), "00000000");
        assert_eq!(segment_file_name(1), "00000001");
        assert_eq!(segment_file_name(12345678), "12345678");
    }

    #[test]
    fn test_parse_segment_file_name() {
        assert_eq!(parse_segment_file_name("00000000"), Some(0));
        assert_eq!(parse_segment_file_name("00000042"), Some(42));
        assert_eq!(parse_segment_file_name("0000042"), None);
        assert_eq!(parse_segment_file_name("0000004x"), None);
        assert_eq!(parse_segment_file_name(".recovery"), None);
    }
}
