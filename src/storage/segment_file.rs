use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::trace;

use crate::{AppError, AppResult};

use super::segment_file_name;

/// Creates the zero-filled segment file `dir/<8-digit-id>` with the given
/// capacity. Provisioning is the only place segment files come from;
/// [`WritableSegmentFile::open`] never creates.
pub fn provision_segment(dir: impl AsRef<Path>, segment_id: u32, capacity: u64) -> AppResult<PathBuf> {
    let path = dir.as_ref().join(segment_file_name(segment_id));
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| AppError::SegmentIo(format!("provision {}: {}", path.display(), e)))?;
    file.set_len(capacity)
        .map_err(|e| AppError::SegmentIo(format!("size {}: {}", path.display(), e)))?;
    trace!("provisioned segment {} ({} bytes)", path.display(), capacity);
    Ok(path)
}

/// The active, writable end of a segment sequence. Backed by a mutable
/// mapping of a pre-provisioned file; the caller's descriptor cursor is
/// the only source of truth for valid bounds.
#[derive(Debug)]
pub struct WritableSegmentFile {
    path: PathBuf,
    mmap: MmapMut,
    capacity: u64,
}

impl WritableSegmentFile {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = PathBuf::from(path.as_ref());
        let file = match File::options().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::SegmentNotFound(path.display().to_string()));
            }
            Err(e) => {
                return Err(AppError::SegmentIo(format!("open {}: {}", path.display(), e)));
            }
        };
        let capacity = file
            .metadata()
            .map_err(|e| AppError::SegmentIo(format!("stat {}: {}", path.display(), e)))?
            .len();

        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| AppError::SegmentIo(format!("map {}: {}", path.display(), e)))?;

        Ok(Self {
            path,
            mmap,
            capacity,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies `data` into the mapping at `offset`. Callers guarantee the
    /// write fits; a violation is a programming error surfaced as
    /// `SegmentIo` rather than a panic.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> AppResult<()> {
        let end = offset + data.len() as u64;
        if end > self.capacity {
            return Err(AppError::SegmentIo(format!(
                "write past segment end: {}..{} > {} in {}",
                offset,
                end,
                self.capacity,
                self.path.display()
            )));
        }
        self.mmap[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Forces mapped bytes to stable storage.
    pub fn flush(&self) -> AppResult<()> {
        self.mmap
            .flush()
            .map_err(|e| AppError::SegmentIo(format!("flush {}: {}", self.path.display(), e)))
    }

    /// Seals the segment: flushes and downgrades to a read-only mapping.
    pub fn into_readonly(self) -> AppResult<ReadOnlySegmentFile> {
        self.flush()?;
        let mmap = self
            .mmap
            .make_read_only()
            .map_err(|e| AppError::SegmentIo(format!("seal {}: {}", self.path.display(), e)))?;
        Ok(ReadOnlySegmentFile {
            path: self.path,
            mmap,
        })
    }
}

/// A sealed (or concurrently written) segment mapped for reading. Bytes
/// below the writer's published cursor are stable; reads are plain copies
/// out of the mapping.
#[derive(Debug)]
pub struct ReadOnlySegmentFile {
    path: PathBuf,
    mmap: Mmap,
}

impl ReadOnlySegmentFile {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = PathBuf::from(path.as_ref());
        let file = match File::options().read(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::SegmentNotFound(path.display().to_string()));
            }
            Err(e) => {
                return Err(AppError::SegmentIo(format!("open {}: {}", path.display(), e)));
            }
        };
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .map_err(|e| AppError::SegmentIo(format!("map {}: {}", path.display(), e)))?;
        Ok(Self { path, mmap })
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a copy of `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> AppResult<Bytes> {
        let end = offset + len as u64;
        if end > self.mmap.len() as u64 {
            return Err(AppError::SegmentIo(format!(
                "read past segment end: {}..{} > {} in {}",
                offset,
                end,
                self.mmap.len(),
                self.path.display()
            )));
        }
        Ok(Bytes::copy_from_slice(
            &self.mmap[offset as usize..end as usize],
        ))
    }

    /// Borrows `len` bytes at `offset` without copying; used by the
    /// recovery scanners.
    pub fn slice_at(&self, offset: u64, len: usize) -> AppResult<&[u8]> {
        let end = offset + len as u64;
        if end > self.mmap.len() as u64 {
            return Err(AppError::SegmentIo(format!(
                "read past segment end: {}..{} > {} in {}",
                offset,
                end,
                self.mmap.len(),
                self.path.display()
            )));
        }
        Ok(&self.mmap[offset as usize..end as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_missing_segment_fails() {
        let dir = TempDir::new().unwrap();
        let result = WritableSegmentFile::open(dir.path().join("00000000"));
        assert!(matches!(result, Err(AppError::SegmentNotFound(_))));
    }

    #[test]
    fn test_provision_then_write_and_read() {
        let dir = TempDir::new().unwrap();
        let path = provision_segment(dir.path(), 0, 1024).unwrap();

        let mut segment = WritableSegmentFile::open(&path).unwrap();
        assert_eq!(segment.capacity(), 1024);
        segment.write_at(100, b"hello").unwrap();
        segment.flush().unwrap();

        let reader = ReadOnlySegmentFile::open(&path).unwrap();
        assert_eq!(reader.read_at(100, 5).unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_provision_twice_fails() {
        let dir = TempDir::new().unwrap();
        provision_segment(dir.path(), 0, 1024).unwrap();
        assert!(provision_segment(dir.path(), 0, 1024).is_err());
    }

    #[test]
    fn test_write_past_capacity_fails() {
        let dir = TempDir::new().unwrap();
        let path = provision_segment(dir.path(), 0, 16).unwrap();
        let mut segment = WritableSegmentFile::open(&path).unwrap();
        assert!(segment.write_at(10, b"0123456789").is_err());
    }

    #[test]
    fn test_into_readonly_preserves_content() {
        let dir = TempDir::new().unwrap();
        let path = provision_segment(dir.path(), 1, 64).unwrap();
        let mut segment = WritableSegmentFile::open(&path).unwrap();
        segment.write_at(0, b"sealed").unwrap();
        let reader = segment.into_readonly().unwrap();
        assert_eq!(reader.read_at(0, 6).unwrap().as_ref(), b"sealed");
    }
}
