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

//! Consumption offset tracking.
//!
//! One cursor per (topic, consumer group, queue), lazily created on first
//! pull and advanced only by acknowledgement. The whole table is
//! snapshotted to JSON on a fixed timer and reloaded at startup; cursors
//! created after the last snapshot before a crash are lost.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tokio::time::Interval;
use tracing::{debug, info, trace, warn};

use crate::storage::OffsetPosition;
use crate::{AppResult, Shutdown};

/// Identity of one consumption cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub topic: String,
    pub group: String,
    pub queue_id: u32,
}

impl GroupKey {
    pub fn new(topic: impl Into<String>, group: impl Into<String>, queue_id: u32) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            queue_id,
        }
    }
}

type SnapshotMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

#[derive(Debug)]
pub struct OffsetTracker {
    entries: DashMap<GroupKey, OffsetPosition>,
    snapshot_path: PathBuf,
}

impl OffsetTracker {
    pub fn new(snapshot_path: impl AsRef<Path>) -> Self {
        Self {
            entries: DashMap::new(),
            snapshot_path: PathBuf::from(snapshot_path.as_ref()),
        }
    }

    /// Rebuilds the in-memory table from the last snapshot. A missing
    /// file is a first start, not an error.
    pub async fn load(&self) -> AppResult<()> {
        let contents = match tokio::fs::read_to_string(&self.snapshot_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "offset snapshot {} not found; starting with an empty table",
                    self.snapshot_path.display()
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: SnapshotMap = serde_json::from_str(&contents)?;
        for (topic, groups) in snapshot {
            for (group, queues) in groups {
                for (queue_id, position) in queues {
                    let queue_id = queue_id.parse().map_err(|_| {
                        crate::AppError::InvalidValue(format!("offset queue id: {}", queue_id))
                    })?;
                    let position: OffsetPosition = position.parse()?;
                    self.entries
                        .insert(GroupKey::new(topic.clone(), group.clone(), queue_id), position);
                }
            }
        }
        info!(
            "loaded {} consumption offsets from {}",
            self.entries.len(),
            self.snapshot_path.display()
        );
        Ok(())
    }

    /// Cursor for `key`, created at the first segment / offset 0 on first
    /// touch.
    pub fn position(&self, key: &GroupKey) -> OffsetPosition {
        *self
            .entries
            .entry(key.clone())
            .or_insert(OffsetPosition::START)
    }

    /// Cursor for `key` without creating one.
    pub fn peek(&self, key: &GroupKey) -> Option<OffsetPosition> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Forward-only move: the stored cursor never goes backwards.
    pub fn advance_to(&self, key: &GroupKey, position: OffsetPosition) {
        let mut entry = self.entries.entry(key.clone()).or_insert(OffsetPosition::START);
        if position > *entry {
            trace!("advance {:?}: {} -> {}", key, *entry, position);
            *entry = position;
        }
    }

    /// Serializes the full table as the nested
    /// `topic -> group -> queue -> "segment#offset"` mapping.
    pub async fn snapshot(&self) -> AppResult<()> {
        let mut snapshot: SnapshotMap = BTreeMap::new();
        for entry in self.entries.iter() {
            let key = entry.key();
            snapshot
                .entry(key.topic.clone())
                .or_default()
                .entry(key.group.clone())
                .or_default()
                .insert(key.queue_id.to_string(), entry.value().to_string());
        }
        let contents = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&self.snapshot_path, contents).await?;
        trace!(
            "snapshotted {} offsets to {}",
            self.entries.len(),
            self.snapshot_path.display()
        );
        Ok(())
    }

    /// Periodic snapshot loop; writes a final snapshot on shutdown.
    pub async fn run_snapshot_task(&self, mut interval: Interval, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => {
                    debug!("offset snapshot task received shutdown signal");
                }
            }
            if let Err(e) = self.snapshot().await {
                warn!("offset snapshot failed: {}", e);
            }
            if shutdown.is_shutdown() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lazy_creation_starts_at_zero() {
        let dir = TempDir::new().unwrap();
        let tracker = OffsetTracker::new(dir.path().join("offsets.json"));
        let key = GroupKey::new("orders", "g1", 0);
        assert!(tracker.peek(&key).is_none());
        assert_eq!(tracker.position(&key), OffsetPosition::START);
        assert!(tracker.peek(&key).is_some());
    }

    #[tokio::test]
    async fn test_advance_is_forward_only() {
        let dir = TempDir::new().unwrap();
        let tracker = OffsetTracker::new(dir.path().join("offsets.json"));
        let key = GroupKey::new("orders", "g1", 0);
        tracker.advance_to(
            &key,
            OffsetPosition {
                segment_id: 0,
                offset: 48,
            },
        );
        tracker.advance_to(
            &key,
            OffsetPosition {
                segment_id: 0,
                offset: 16,
            },
        );
        assert_eq!(tracker.position(&key).offset, 48);
    }

    #[tokio::test]
    async fn test_snapshot_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.json");
        {
            let tracker = OffsetTracker::new(&path);
            tracker.advance_to(
                &GroupKey::new("orders", "g1", 2),
                OffsetPosition {
                    segment_id: 1,
                    offset: 160,
                },
            );
            tracker.advance_to(
                &GroupKey::new("audit", "g2", 0),
                OffsetPosition {
                    segment_id: 0,
                    offset: 16,
                },
            );
            tracker.snapshot().await.unwrap();
        }
        let tracker = OffsetTracker::new(&path);
        tracker.load().await.unwrap();
        assert_eq!(
            tracker.peek(&GroupKey::new("orders", "g1", 2)),
            Some(OffsetPosition {
                segment_id: 1,
                offset: 160
            })
        );
        assert_eq!(
            tracker.peek(&GroupKey::new("audit", "g2", 0)),
            Some(OffsetPosition {
                segment_id: 0,
                offset: 16
            })
        );
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_is_empty_table() {
        let dir = TempDir::new().unwrap();
        let tracker = OffsetTracker::new(dir.path().join("offsets.json"));
        tracker.load().await.unwrap();
        assert!(tracker.peek(&GroupKey::new("orders", "g1", 0)).is_none());
    }

    #[tokio::test]
    async fn test_snapshot_text_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.json");
        let tracker = OffsetTracker::new(&path);
        tracker.advance_to(
            &GroupKey::new("orders", "g1", 0),
            OffsetPosition {
                segment_id: 0,
                offset: 32,
            },
        );
        tracker.snapshot().await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["orders"]["g1"]["0"], "00000000#32");
    }
}
