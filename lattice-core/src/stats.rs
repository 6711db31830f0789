//! Insertion counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared by every insert on one index.
#[derive(Debug, Default)]
pub struct InsertStats {
    inserts: AtomicU64,
    duplicate_merges: AtomicU64,
    duplicate_fallbacks: AtomicU64,
    free_slot_reuses: AtomicU64,
    pages_allocated: AtomicU64,
    updates_applied: AtomicU64,
    updates_dropped: AtomicU64,
    cursor_advances: AtomicU64,
    entry_point_updates: AtomicU64,
}

/// Point-in-time copy of [`InsertStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful inserts, merged duplicates included
    pub inserts: u64,
    /// Inserts folded into an existing element
    pub duplicate_merges: u64,
    /// Duplicates that had to become a separate node
    pub duplicate_fallbacks: u64,
    /// Placements that overwrote a deleted pair
    pub free_slot_reuses: u64,
    /// Pages added to the store
    pub pages_allocated: u64,
    /// Back-links written
    pub updates_applied: u64,
    /// Back-links skipped because the stored list no longer matched
    pub updates_dropped: u64,
    /// Insertion cursor moves
    pub cursor_advances: u64,
    /// Entry point replacements
    pub entry_point_updates: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    if by > 0 {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

impl InsertStats {
    pub(crate) fn record_insert(&self) {
        bump(&self.inserts, 1);
    }

    pub(crate) fn record_merge(&self) {
        bump(&self.duplicate_merges, 1);
    }

    pub(crate) fn record_fallback(&self) {
        bump(&self.duplicate_fallbacks, 1);
    }

    pub(crate) fn record_placement(&self, reused: bool, pages_allocated: u32) {
        bump(&self.free_slot_reuses, u64::from(reused));
        bump(&self.pages_allocated, u64::from(pages_allocated));
    }

    pub(crate) fn record_patch(&self, applied: u32, dropped: u32) {
        bump(&self.updates_applied, u64::from(applied));
        bump(&self.updates_dropped, u64::from(dropped));
    }

    pub(crate) fn record_sync(&self, cursor_advanced: bool, entry_point_updated: bool) {
        bump(&self.cursor_advances, u64::from(cursor_advanced));
        bump(&self.entry_point_updates, u64::from(entry_point_updated));
    }

    /// Copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            inserts: load(&self.inserts),
            duplicate_merges: load(&self.duplicate_merges),
            duplicate_fallbacks: load(&self.duplicate_fallbacks),
            free_slot_reuses: load(&self.free_slot_reuses),
            pages_allocated: load(&self.pages_allocated),
            updates_applied: load(&self.updates_applied),
            updates_dropped: load(&self.updates_dropped),
            cursor_advances: load(&self.cursor_advances),
            entry_point_updates: load(&self.entry_point_updates),
        }
    }
}
