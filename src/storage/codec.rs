//! Fixed-width encode/decode helpers for the on-disk record formats.
//!
//! Every multi-byte integer on disk is little-endian. Two formats live
//! here: the commit-log record frame (`[len][crc][payload]`) and the
//! 16-byte consume-queue index record.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

use super::{FRAME_HEADER_SIZE, INDEX_RECORD_SIZE};

/// Header of a commit-log record frame: payload length plus CRC32C over
/// the payload. A zero length marks the unwritten tail of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub crc: u32,
}

/// Encodes a payload into a full record frame.
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32c::crc32c(payload));
    buf.put_slice(payload);
    buf
}

/// Decodes a frame header from the start of `buf`.
pub fn decode_frame_header(mut buf: &[u8]) -> AppResult<FrameHeader> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(AppError::CorruptRecord(format!(
            "frame header truncated: {} bytes",
            buf.len()
        )));
    }
    let len = buf.get_u32_le();
    let crc = buf.get_u32_le();
    Ok(FrameHeader { len, crc })
}

impl FrameHeader {
    /// Validates the payload the header claims to describe.
    pub fn check(&self, payload: &[u8]) -> AppResult<()> {
        if payload.len() != self.len as usize {
            return Err(AppError::CorruptRecord(format!(
                "frame length mismatch: header {} payload {}",
                self.len,
                payload.len()
            )));
        }
        let crc = crc32c::crc32c(payload);
        if crc != self.crc {
            return Err(AppError::CorruptRecord(format!(
                "frame crc mismatch: header {:#010x} payload {:#010x}",
                self.crc, crc
            )));
        }
        Ok(())
    }
}

/// One consume-queue index record: four little-endian u32 fields in fixed
/// order, pointing back into a commit log segment. Never mutated once
/// written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub commit_segment_id: u32,
    /// Byte offset of the record frame start within the commit segment.
    pub msg_index: u32,
    /// Payload length of the referenced record.
    pub msg_length: u32,
    pub retry_times: u32,
}

impl IndexRecord {
    pub fn encode(&self) -> [u8; INDEX_RECORD_SIZE] {
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.commit_segment_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.msg_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.msg_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.retry_times.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> AppResult<Self> {
        if buf.len() < INDEX_RECORD_SIZE {
            return Err(AppError::CorruptRecord(format!(
                "index record truncated: {} bytes",
                buf.len()
            )));
        }
        let mut buf = &buf[..INDEX_RECORD_SIZE];
        Ok(Self {
            commit_segment_id: buf.get_u32_le(),
            msg_index: buf.get_u32_le(),
            msg_length: buf.get_u32_le(),
            retry_times: buf.get_u32_le(),
        })
    }

    /// An all-zero record marks the unwritten tail of a queue segment;
    /// live records always reference a nonzero payload length.
    pub fn is_blank(&self) -> bool {
        self.commit_segment_id == 0
            && self.msg_index == 0
            && self.msg_length == 0
            && self.retry_times == 0
    }
}
