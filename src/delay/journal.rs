//! Write-ahead journal for scheduled delay records.
//!
//! The wheel itself is memory-only; every accepted schedule is first
//! appended to an internal commit-log topic, and every fire appends a
//! tombstone. Startup replays the journal (scheduled minus fired) to
//! rebuild pending state.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::storage::CommitLog;
use crate::AppResult;

use super::DelayRecord;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum JournalEntry {
    Scheduled(DelayRecord),
    Fired { id: String },
}

#[derive(Debug)]
pub struct DelayJournal {
    log: Arc<CommitLog>,
}

impl DelayJournal {
    pub fn new(log: Arc<CommitLog>) -> Self {
        Self { log }
    }

    /// Synchronously persists a freshly scheduled record. The journal
    /// topic has no consume queues, so the append dispatches to nothing.
    pub fn record_scheduled(&self, record: &DelayRecord) -> AppResult<()> {
        let entry = serde_json::to_vec(&JournalEntry::Scheduled(record.clone()))?;
        self.log.append(&entry, |_| Ok(()))?;
        trace!("journaled schedule {} (fire_at {})", record.id, record.fire_at);
        Ok(())
    }

    /// Appends the tombstone that marks `id` as executed.
    pub fn record_fired(&self, id: &str) -> AppResult<()> {
        let entry = serde_json::to_vec(&JournalEntry::Fired { id: id.to_string() })?;
        self.log.append(&entry, |_| Ok(()))?;
        trace!("journaled fire {}", id);
        Ok(())
    }

    /// Replays every journal segment and returns the records that were
    /// scheduled but never fired, ordered by due time. Malformed entries
    /// fail the replay: recovery is all-or-nothing.
    pub fn replay(&self) -> AppResult<Vec<DelayRecord>> {
        let mut pending: HashMap<String, DelayRecord> = HashMap::new();
        for segment_id in self.log.segment_ids()? {
            for (_, payload) in self.log.scan_segment(segment_id)? {
                match serde_json::from_slice(&payload)? {
                    JournalEntry::Scheduled(record) => {
                        pending.insert(record.id.clone(), record);
                    }
                    JournalEntry::Fired { id } => {
                        pending.remove(&id);
                    }
                }
            }
        }
        let mut records: Vec<DelayRecord> = pending.into_values().collect();
        records.sort_by_key(|record| record.fire_at);
        debug!("delay journal replay found {} pending records", records.len());
        Ok(records)
    }
}
