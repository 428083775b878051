//! Per-function aggregates, one row per stat slot.

use crate::error::Error;
use crate::selector::Slot;

/// Aggregates for one tracked function. Fields the session did not measure
/// stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsRow {
    pub call_count: u64,
    pub wall_time_us: f64,
    pub cpu_time_us: u64,
    pub mem_delta: i64,
    pub peak_mem_delta: i64,
}

/// Deltas for one completed call. `None` means "not measured" and leaves the
/// row's field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub wall_us: f64,
    pub cpu_us: Option<u64>,
    pub mem_delta: Option<i64>,
    pub peak_mem_delta: Option<i64>,
}

/// Dense table indexed by slot. Sized once when the session starts.
#[derive(Debug, Clone)]
pub struct StatsTable {
    /// `rows[slot - 1]`; slot 0 is never stored.
    rows: Vec<StatsRow>,
}

impl StatsTable {
    /// A zeroed table for slots `1..=slots`.
    pub fn new(slots: usize) -> Self {
        Self {
            rows: vec![StatsRow::default(); slots],
        }
    }

    #[inline]
    pub fn record(&mut self, slot: Slot, sample: &Sample) -> Result<(), Error> {
        let len = self.rows.len();
        let row = (slot as usize)
            .checked_sub(1)
            .and_then(|i| self.rows.get_mut(i))
            .ok_or(Error::SlotOutOfRange { slot, len })?;

        row.call_count += 1;
        // A counter read on another core can trail the start value by a few
        // ticks; never let that subtract from the total.
        row.wall_time_us += sample.wall_us.max(0.0);
        if let Some(cpu) = sample.cpu_us {
            row.cpu_time_us += cpu;
        }
        if let Some(mem) = sample.mem_delta {
            row.mem_delta += mem;
        }
        if let Some(peak) = sample.peak_mem_delta {
            row.peak_mem_delta += peak;
        }
        Ok(())
    }

    pub fn get(&self, slot: Slot) -> Option<&StatsRow> {
        (slot as usize).checked_sub(1).and_then(|i| self.rows.get(i))
    }

    /// Every row with its slot, slot-ascending.
    pub fn snapshot(&self) -> Vec<(Slot, StatsRow)> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| (i as Slot + 1, *row))
            .collect()
    }

    pub fn total_calls(&self) -> u64 {
        self.rows.iter().map(|r| r.call_count).sum()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
