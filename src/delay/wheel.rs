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

//! Two-level time wheel: a 60-slot seconds wheel cascaded under a 60-slot
//! minutes wheel.
//!
//! Sub-minute delays go straight into the seconds wheel. Longer delays
//! land in the minutes wheel with their sub-minute remainder attached;
//! when their minute slot drains, a nonzero remainder re-enters the
//! seconds wheel instead of firing. Placement accounts for the current
//! sub-minute phase, so a record scheduled with delay `k` fires exactly
//! `k` ticks later regardless of when within a minute it arrived.
//!
//! Each wheel has its own lock; a tick never holds both at once.

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;

use super::DelayRecord;

pub const WHEEL_SLOTS: usize = 60;

#[derive(Debug)]
struct SecondsWheel {
    slots: Vec<Vec<DelayRecord>>,
    pos: usize,
}

#[derive(Debug)]
struct MinuteEntry {
    record: DelayRecord,
    /// Seconds still to wait after this entry's minute slot drains.
    remainder: u32,
}

#[derive(Debug)]
struct MinutesWheel {
    slots: Vec<Vec<MinuteEntry>>,
    pos: usize,
}

#[derive(Debug)]
pub struct TimeWheel {
    seconds: Mutex<SecondsWheel>,
    minutes: Mutex<MinutesWheel>,
    /// Ticks since the minutes wheel last advanced (0..60).
    phase: AtomicCell<u32>,
}

impl Default for TimeWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeWheel {
    pub fn new() -> Self {
        Self {
            seconds: Mutex::new(SecondsWheel {
                slots: (0..WHEEL_SLOTS).map(|_| Vec::new()).collect(),
                pos: 0,
            }),
            minutes: Mutex::new(MinutesWheel {
                slots: (0..WHEEL_SLOTS).map(|_| Vec::new()).collect(),
                pos: 0,
            }),
            phase: AtomicCell::new(0),
        }
    }

    /// Places `record` so that it drains exactly `delay_secs` ticks from
    /// now. Callers validate `1..=3600` before reaching the wheel.
    pub fn insert(&self, record: DelayRecord, delay_secs: u32) {
        debug_assert!(delay_secs >= 1 && delay_secs as usize <= WHEEL_SLOTS * WHEEL_SLOTS);
        if (delay_secs as usize) < WHEEL_SLOTS {
            let mut seconds = self.seconds.lock();
            let slot = (seconds.pos + delay_secs as usize) % WHEEL_SLOTS;
            seconds.slots[slot].push(record);
        } else {
            // the minutes pointer is phase ticks into its current slot
            let total = delay_secs + self.phase.load();
            let lap = (total as usize) / WHEEL_SLOTS;
            let remainder = total % WHEEL_SLOTS as u32;
            let mut minutes = self.minutes.lock();
            let slot = (minutes.pos + lap) % WHEEL_SLOTS;
            minutes.slots[slot].push(MinuteEntry { record, remainder });
        }
    }

    /// One scanning-thread tick: advance and drain the seconds slot, and
    /// on every 60th tick advance and drain the minutes slot, splitting
    /// its entries into due records and seconds-wheel push-backs. Returns
    /// the due batch.
    pub fn tick(&self) -> Vec<DelayRecord> {
        let mut due = {
            let mut seconds = self.seconds.lock();
            seconds.pos = (seconds.pos + 1) % WHEEL_SLOTS;
            let pos = seconds.pos;
            std::mem::take(&mut seconds.slots[pos])
        };

        let phase = self.phase.load() + 1;
        if phase as usize >= WHEEL_SLOTS {
            self.phase.store(0);
            let drained = {
                let mut minutes = self.minutes.lock();
                minutes.pos = (minutes.pos + 1) % WHEEL_SLOTS;
                let pos = minutes.pos;
                std::mem::take(&mut minutes.slots[pos])
            };
            for entry in drained {
                if entry.remainder == 0 {
                    due.push(entry.record);
                } else {
                    let mut seconds = self.seconds.lock();
                    let slot = (seconds.pos + entry.remainder as usize) % WHEEL_SLOTS;
                    seconds.slots[slot].push(entry.record);
                }
            }
        } else {
            self.phase.store(phase);
        }

        due
    }

    /// Records currently waiting in either wheel.
    pub fn pending(&self) -> usize {
        let seconds = self.seconds.lock().slots.iter().map(Vec::len).sum::<usize>();
        let minutes = self.minutes.lock().slots.iter().map(Vec::len).sum::<usize>();
        seconds + minutes
    }
}
