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

//! Per-topic append-only commit log over a sequence of fixed-capacity
//! memory-mapped segments.
//!
//! Appends serialize behind a per-topic mutex and roll to a freshly
//! provisioned segment when the active one cannot hold the next record.
//! Reads never take the append lock: they resolve any segment, including
//! the active one, through cached read-only mappings and only touch bytes
//! below the published write position.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{AppError, AppResult};

use super::{
    codec, provision_segment, segment_file_name, parse_segment_file_name, ReadOnlySegmentFile,
    WritableSegmentFile, FRAME_HEADER_SIZE,
};

/// Position of one record within a topic's commit log, handed to the
/// dispatcher so index entries point at the record frame start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendPosition {
    pub segment_id: u32,
    /// Byte offset of the record frame start within the segment.
    pub offset: u64,
    /// Payload length, excluding the frame header.
    pub payload_len: u32,
}

#[derive(Debug)]
struct ActiveSegment {
    id: u32,
    cursor: u64,
    file: WritableSegmentFile,
}

#[derive(Debug)]
pub struct CommitLog {
    topic: String,
    dir: PathBuf,
    segment_capacity: u64,
    flush_on_append: bool,
    active: Mutex<ActiveSegment>,
    readers: DashMap<u32, Arc<ReadOnlySegmentFile>>,
    /// Published (segment id, cursor) pair; stored after every append so
    /// readers can bound themselves without taking the append lock.
    write_position: AtomicCell<(u32, u64)>,
}

impl CommitLog {
    /// Creates a fresh commit log: provisions segment `00000000` under
    /// `dir` and maps it for writing.
    pub fn create(
        topic: impl Into<String>,
        dir: impl AsRef<Path>,
        segment_capacity: u64,
        flush_on_append: bool,
    ) -> AppResult<Self> {
        let topic = topic.into();
        let dir = PathBuf::from(dir.as_ref());
        std::fs::create_dir_all(&dir).map_err(|e| {
            AppError::SegmentIo(format!("create commit log dir {}: {}", dir.display(), e))
        })?;
        let path = provision_segment(&dir, 0, segment_capacity)?;
        let file = WritableSegmentFile::open(path)?;
        Ok(Self {
            topic,
            dir,
            segment_capacity,
            flush_on_append,
            active: Mutex::new(ActiveSegment {
                id: 0,
                cursor: 0,
                file,
            }),
            readers: DashMap::new(),
            write_position: AtomicCell::new((0, 0)),
        })
    }

    /// Reopens an existing commit log, rebuilding the write cursor by
    /// scanning the newest segment. Any corrupt frame fails the open:
    /// recovery is all-or-nothing.
    pub fn open(
        topic: impl Into<String>,
        dir: impl AsRef<Path>,
        segment_capacity: u64,
        flush_on_append: bool,
    ) -> AppResult<Self> {
        let topic = topic.into();
        let dir = PathBuf::from(dir.as_ref());
        let ids = Self::segment_ids_in(&dir)?;
        let active_id = *ids.last().ok_or_else(|| {
            AppError::SegmentNotFound(format!("no segments under {}", dir.display()))
        })?;

        let active_path = dir.join(segment_file_name(active_id));
        let reader = ReadOnlySegmentFile::open(&active_path)?;
        let cursor = scan_frames(&reader, |_, _| Ok(()))?;
        drop(reader);

        let file = WritableSegmentFile::open(&active_path)?;
        debug!(
            "recovered commit log {}: active segment {} cursor {}",
            topic,
            segment_file_name(active_id),
            cursor
        );
        Ok(Self {
            topic,
            dir,
            segment_capacity,
            flush_on_append,
            active: Mutex::new(ActiveSegment {
                id: active_id,
                cursor,
                file,
            }),
            readers: DashMap::new(),
            write_position: AtomicCell::new((active_id, cursor)),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Published (active segment id, cursor) pair.
    pub fn write_position(&self) -> (u32, u64) {
        self.write_position.load()
    }

    /// All segment ids currently on disk, ascending.
    pub fn segment_ids(&self) -> AppResult<Vec<u32>> {
        Self::segment_ids_in(&self.dir)
    }

    fn segment_ids_in(dir: &Path) -> AppResult<Vec<u32>> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| AppError::SegmentIo(format!("read dir {}: {}", dir.display(), e)))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| AppError::SegmentIo(format!("read dir {}: {}", dir.display(), e)))?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_segment_file_name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Appends one record and, while still holding the append lock, hands
    /// the record-start position to `on_append` (the dispatcher). The
    /// cursor only advances after `on_append` succeeds, so a failed
    /// dispatch leaves no committed record behind.
    pub fn append<R>(
        &self,
        payload: &[u8],
        on_append: impl FnOnce(&AppendPosition) -> AppResult<R>,
    ) -> AppResult<(AppendPosition, R)> {
        let frame = codec::encode_frame(payload);
        let frame_len = frame.len() as u64;
        if frame_len > self.segment_capacity {
            return Err(AppError::InvalidValue(format!(
                "record of {} bytes exceeds segment capacity {}",
                frame_len, self.segment_capacity
            )));
        }

        let mut active = self.active.lock();
        if self.segment_capacity - active.cursor < frame_len {
            self.roll(&mut active)?;
        }

        let position = AppendPosition {
            segment_id: active.id,
            offset: active.cursor,
            payload_len: payload.len() as u32,
        };
        let cursor = active.cursor;
        active.file.write_at(cursor, &frame)?;

        let dispatched = on_append(&position)?;

        active.cursor += frame_len;
        if self.flush_on_append {
            active.file.flush()?;
        }
        self.write_position.store((active.id, active.cursor));
        trace!(
            "appended {} bytes to {} at {}/{}",
            payload.len(),
            self.topic,
            segment_file_name(position.segment_id),
            position.offset
        );
        Ok((position, dispatched))
    }

    /// Rolls to the next segment: flush, provision `id + 1`, remap, reset
    /// the cursor.
    fn roll(&self, active: &mut ActiveSegment) -> AppResult<()> {
        active.file.flush()?;
        let next_id = active.id + 1;
        let path = provision_segment(&self.dir, next_id, self.segment_capacity)?;
        let file = WritableSegmentFile::open(path)?;
        debug!(
            "rolled commit log {}: {} -> {} (cursor was {})",
            self.topic,
            segment_file_name(active.id),
            segment_file_name(next_id),
            active.cursor
        );
        active.id = next_id;
        active.cursor = 0;
        active.file = file;
        Ok(())
    }

    /// Resolves the payload bytes of a record previously appended at
    /// `(segment_id, msg_index)`. The stored frame header is validated
    /// against the caller's `msg_length` and its CRC.
    pub fn read(&self, segment_id: u32, msg_index: u32, msg_length: u32) -> AppResult<Bytes> {
        let reader = self.reader(segment_id)?;
        let header_buf = reader.read_at(msg_index as u64, FRAME_HEADER_SIZE)?;
        let header = codec::decode_frame_header(&header_buf)?;
        if header.len != msg_length {
            return Err(AppError::CorruptRecord(format!(
                "index length {} does not match stored frame length {} at {}/{}",
                msg_length,
                header.len,
                segment_file_name(segment_id),
                msg_index
            )));
        }
        let payload = reader.read_at(msg_index as u64 + FRAME_HEADER_SIZE as u64, msg_length as usize)?;
        header.check(&payload)?;
        Ok(payload)
    }

    /// Sequentially decodes every record in one segment; used by the
    /// delay-journal replay. The active segment is bounded by the
    /// published cursor, sealed segments by their content.
    pub fn scan_segment(&self, segment_id: u32) -> AppResult<Vec<(AppendPosition, Bytes)>> {
        let reader = self.reader(segment_id)?;
        let mut records = Vec::new();
        scan_frames(&reader, |offset, payload| {
            records.push((
                AppendPosition {
                    segment_id,
                    offset,
                    payload_len: payload.len() as u32,
                },
                Bytes::copy_from_slice(payload),
            ));
            Ok(())
        })?;
        Ok(records)
    }

    fn reader(&self, segment_id: u32) -> AppResult<Arc<ReadOnlySegmentFile>> {
        if let Some(reader) = self.readers.get(&segment_id) {
            return Ok(reader.clone());
        }
        let path = self.dir.join(segment_file_name(segment_id));
        let reader = Arc::new(ReadOnlySegmentFile::open(path)?);
        self.readers.insert(segment_id, reader.clone());
        Ok(reader)
    }

    /// Forces the active segment to stable storage.
    pub fn flush(&self) -> AppResult<()> {
        self.active.lock().file.flush()
    }
}

/// Walks record frames from the start of a segment until the zero-length
/// tail, validating each CRC, and returns the byte cursor one past the
/// last record. `visit` sees every (offset, payload) pair.
fn scan_frames(
    reader: &ReadOnlySegmentFile,
    mut visit: impl FnMut(u64, &[u8]) -> AppResult<()>,
) -> AppResult<u64> {
    let capacity = reader.len();
    let mut cursor = 0u64;
    while cursor + FRAME_HEADER_SIZE as u64 <= capacity {
        let header = codec::decode_frame_header(reader.slice_at(cursor, FRAME_HEADER_SIZE)?)?;
        if header.len == 0 {
            break;
        }
        let payload_start = cursor + FRAME_HEADER_SIZE as u64;
        if payload_start + header.len as u64 > capacity {
            return Err(AppError::CorruptRecord(format!(
                "frame at {} overruns segment {}",
                cursor,
                reader.path().display()
            )));
        }
        let payload = reader.slice_at(payload_start, header.len as usize)?;
        header.check(payload)?;
        visit(cursor, payload)?;
        cursor = payload_start + header.len as u64;
    }
    Ok(cursor)
}
