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

//! Per-(topic, queue) index store: fixed 16-byte records pointing back
//! into the commit log, appended under a per-queue lock with the same
//! roll-on-full policy as the commit log (queue-local capacity, always a
//! multiple of the record size).

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{AppError, AppResult};

use super::{
    parse_segment_file_name, provision_segment, segment_file_name, IndexRecord,
    ReadOnlySegmentFile, WritableSegmentFile, INDEX_RECORD_SIZE,
};

/// A position inside a consume queue: segment id plus byte offset. The
/// on-disk text rendering `"<8-digit-segment>#<offset>"` exists only at
/// the snapshot serialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OffsetPosition {
    pub segment_id: u32,
    pub offset: u64,
}

impl OffsetPosition {
    pub const START: OffsetPosition = OffsetPosition {
        segment_id: 0,
        offset: 0,
    };
}

impl Display for OffsetPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", segment_file_name(self.segment_id), self.offset)
    }
}

impl FromStr for OffsetPosition {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, offset) = s
            .split_once('#')
            .ok_or_else(|| AppError::InvalidValue(format!("offset position: {}", s)))?;
        let segment_id = parse_segment_file_name(name)
            .ok_or_else(|| AppError::InvalidValue(format!("offset position segment: {}", s)))?;
        let offset = offset
            .parse()
            .map_err(|_| AppError::InvalidValue(format!("offset position offset: {}", s)))?;
        Ok(Self { segment_id, offset })
    }
}

#[derive(Debug)]
struct ActiveSegment {
    id: u32,
    cursor: u64,
    file: WritableSegmentFile,
}

#[derive(Debug)]
pub struct ConsumeQueue {
    topic: String,
    queue_id: u32,
    dir: PathBuf,
    segment_capacity: u64,
    flush_on_append: bool,
    active: Mutex<ActiveSegment>,
    readers: DashMap<u32, Arc<ReadOnlySegmentFile>>,
    /// Published write cursor (`latest_offset` in descriptor terms).
    write_position: AtomicCell<OffsetPosition>,
    /// Cursor value the queue last rolled away from.
    last_offset: AtomicCell<u64>,
}

impl ConsumeQueue {
    pub fn create(
        topic: impl Into<String>,
        queue_id: u32,
        dir: impl AsRef<Path>,
        segment_capacity: u64,
        flush_on_append: bool,
    ) -> AppResult<Self> {
        debug_assert_eq!(segment_capacity % INDEX_RECORD_SIZE as u64, 0);
        let dir = PathBuf::from(dir.as_ref());
        std::fs::create_dir_all(&dir).map_err(|e| {
            AppError::SegmentIo(format!("create consume queue dir {}: {}", dir.display(), e))
        })?;
        let path = provision_segment(&dir, 0, segment_capacity)?;
        let file = WritableSegmentFile::open(path)?;
        Ok(Self {
            topic: topic.into(),
            queue_id,
            dir,
            segment_capacity,
            flush_on_append,
            active: Mutex::new(ActiveSegment {
                id: 0,
                cursor: 0,
                file,
            }),
            readers: DashMap::new(),
            write_position: AtomicCell::new(OffsetPosition::START),
            last_offset: AtomicCell::new(0),
        })
    }

    /// Reopens an existing queue, scanning the newest segment for the
    /// first blank record to rebuild the cursor. A record with a zero
    /// `msg_length` terminates the scan: live records always reference a
    /// nonzero payload.
    pub fn open(
        topic: impl Into<String>,
        queue_id: u32,
        dir: impl AsRef<Path>,
        segment_capacity: u64,
        flush_on_append: bool,
    ) -> AppResult<Self> {
        let topic = topic.into();
        let dir = PathBuf::from(dir.as_ref());
        let mut ids: Vec<u32> = std::fs::read_dir(&dir)
            .map_err(|e| AppError::SegmentIo(format!("read dir {}: {}", dir.display(), e)))?
            .filter_map(|entry| {
                entry
                    .ok()
                    .and_then(|e| e.file_name().to_str().and_then(parse_segment_file_name))
            })
            .collect();
        ids.sort_unstable();
        let active_id = *ids.last().ok_or_else(|| {
            AppError::SegmentNotFound(format!("no segments under {}", dir.display()))
        })?;

        let active_path = dir.join(segment_file_name(active_id));
        let reader = ReadOnlySegmentFile::open(&active_path)?;
        let mut cursor = 0u64;
        while cursor + INDEX_RECORD_SIZE as u64 <= reader.len() {
            let record = IndexRecord::decode(reader.slice_at(cursor, INDEX_RECORD_SIZE)?)?;
            if record.msg_length == 0 {
                break;
            }
            cursor += INDEX_RECORD_SIZE as u64;
        }
        drop(reader);

        let file = WritableSegmentFile::open(&active_path)?;
        debug!(
            "recovered consume queue {}/{}: active segment {} cursor {}",
            topic,
            queue_id,
            segment_file_name(active_id),
            cursor
        );
        Ok(Self {
            topic,
            queue_id,
            dir,
            segment_capacity,
            flush_on_append,
            active: Mutex::new(ActiveSegment {
                id: active_id,
                cursor,
                file,
            }),
            readers: DashMap::new(),
            write_position: AtomicCell::new(OffsetPosition {
                segment_id: active_id,
                offset: cursor,
            }),
            last_offset: AtomicCell::new(if active_id == 0 { 0 } else { segment_capacity }),
        })
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn segment_capacity(&self) -> u64 {
        self.segment_capacity
    }

    /// Published write cursor.
    pub fn write_position(&self) -> OffsetPosition {
        self.write_position.load()
    }

    /// Cursor value before the most recent roll.
    pub fn last_offset(&self) -> u64 {
        self.last_offset.load()
    }

    /// Appends one index record at the queue's cursor and returns the
    /// position it was written at.
    pub fn append(&self, record: IndexRecord) -> AppResult<OffsetPosition> {
        if record.msg_length == 0 {
            return Err(AppError::InvalidOperation(format!(
                "blank index record for {}/{}",
                self.topic, self.queue_id
            )));
        }
        let mut active = self.active.lock();
        if self.segment_capacity - active.cursor < INDEX_RECORD_SIZE as u64 {
            self.roll(&mut active)?;
        }
        let position = OffsetPosition {
            segment_id: active.id,
            offset: active.cursor,
        };
        let cursor = active.cursor;
        active.file.write_at(cursor, &record.encode())?;
        active.cursor += INDEX_RECORD_SIZE as u64;
        if self.flush_on_append {
            active.file.flush()?;
        }
        self.write_position.store(OffsetPosition {
            segment_id: active.id,
            offset: active.cursor,
        });
        trace!(
            "indexed {}/{} at {}: {:?}",
            self.topic,
            self.queue_id,
            position,
            record
        );
        Ok(position)
    }

    fn roll(&self, active: &mut ActiveSegment) -> AppResult<()> {
        active.file.flush()?;
        self.last_offset.store(active.cursor);
        let next_id = active.id + 1;
        let path = provision_segment(&self.dir, next_id, self.segment_capacity)?;
        let file = WritableSegmentFile::open(path)?;
        debug!(
            "rolled consume queue {}/{}: {} -> {}",
            self.topic,
            self.queue_id,
            segment_file_name(active.id),
            segment_file_name(next_id)
        );
        active.id = next_id;
        active.cursor = 0;
        active.file = file;
        Ok(())
    }

    /// Moves a position sitting exactly at the end of a sealed segment to
    /// the start of the next one.
    pub fn normalize(&self, mut position: OffsetPosition) -> OffsetPosition {
        let current = self.write_position.load();
        while position.offset >= self.segment_capacity && position.segment_id < current.segment_id {
            position.segment_id += 1;
            position.offset = 0;
        }
        position
    }

    /// True when records exist at or beyond `position`.
    pub fn has_records_at(&self, position: OffsetPosition) -> bool {
        self.normalize(position) < self.write_position.load()
    }

    /// Reads up to `count` consecutive records starting at `position`,
    /// bounded by the published write cursor. Callers never see blank
    /// records.
    pub fn read_batch(
        &self,
        position: OffsetPosition,
        count: usize,
    ) -> AppResult<Vec<IndexRecord>> {
        let position = self.normalize(position);
        let current = self.write_position.load();
        if position >= current {
            return Ok(Vec::new());
        }
        let boundary = if position.segment_id < current.segment_id {
            self.segment_capacity
        } else {
            current.offset
        };
        let available = (boundary.saturating_sub(position.offset)) / INDEX_RECORD_SIZE as u64;
        let n = available.min(count as u64) as usize;
        if n == 0 {
            return Ok(Vec::new());
        }

        let reader = self.reader(position.segment_id)?;
        let bytes = reader.read_at(position.offset, n * INDEX_RECORD_SIZE)?;
        let mut records = Vec::with_capacity(n);
        for chunk in bytes.chunks_exact(INDEX_RECORD_SIZE) {
            records.push(IndexRecord::decode(chunk)?);
        }
        Ok(records)
    }

    /// Advances `position` by `count` records, rolling across sealed
    /// segment boundaries and clamping at the live write cursor. Never
    /// moves backwards.
    pub fn advance(&self, position: OffsetPosition, count: u64) -> OffsetPosition {
        let mut position = self.normalize(position);
        let mut remaining = count;
        while remaining > 0 {
            let current = self.write_position.load();
            if position >= current {
                break;
            }
            let boundary = if position.segment_id < current.segment_id {
                self.segment_capacity
            } else {
                current.offset
            };
            let room = (boundary.saturating_sub(position.offset)) / INDEX_RECORD_SIZE as u64;
            let step = room.min(remaining);
            position.offset += step * INDEX_RECORD_SIZE as u64;
            remaining -= step;
            position = self.normalize(position);
            if step == 0 {
                break;
            }
        }
        position
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

    pub fn flush(&self) -> AppResult<()> {
        self.active.lock().file.flush()
    }
}
