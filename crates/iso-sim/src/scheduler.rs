//! Virtual scheduler
//!
//! Keeps reservations in a list ordered by start time and rejects any
//! request that overlaps an existing reservation or a blocked window.

use iso_mux::{Activity, SchedConflict, ScheduleItem, Scheduler};
use tracing::trace;

/// Reservation calendar of one simulated controller
#[derive(Debug, Default)]
pub struct VirtualScheduler {
    /// Pending reservations, ordered by start time
    items: Vec<ScheduleItem>,
    /// Air time taken by activities outside the simulation
    blocked: Vec<(u64, u64)>,
    /// Requests rejected so far
    conflicts: usize,
}

fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `[start_us, end_us)` for something the engine does not know about
    pub fn block(&mut self, start_us: u64, end_us: u64) {
        self.blocked.push((start_us, end_us));
    }

    /// Drop all blocked windows
    pub fn unblock(&mut self) {
        self.blocked.clear();
    }

    /// Start of the earliest reservation
    pub fn next_start(&self) -> Option<u64> {
        self.items.first().map(|i| i.start_us)
    }

    /// Remove and return the earliest reservation
    pub fn pop_next(&mut self) -> Option<ScheduleItem> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    pub fn items(&self) -> &[ScheduleItem] {
        &self.items
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule(&mut self, item: ScheduleItem) -> Result<(), SchedConflict> {
        let span = (item.start_us, item.end_us);
        let busy = self
            .items
            .iter()
            .filter(|other| other.activity != item.activity)
            .any(|other| overlaps(span, (other.start_us, other.end_us)))
            || self.blocked.iter().any(|&window| overlaps(span, window));
        if busy {
            self.conflicts += 1;
            trace!(?item, "reservation rejected");
            return Err(SchedConflict);
        }

        let pos = self
            .items
            .partition_point(|other| other.start_us <= item.start_us);
        self.items.insert(pos, item);
        Ok(())
    }

    fn cancel(&mut self, activity: Activity) {
        self.items.retain(|i| i.activity != activity);
    }
}
