//! Back-link patching: pointing existing neighbor lists at a new node.

use crate::hnsw::tuple::{NeighborSlot, NeighborTuple, TupleId, neighbor_slot_index};
use crate::page::SlottedPage;
use crate::storage::PageStore;
use anyhow::Result;
use tracing::{debug, warn};

/// An already stored node, as the candidate search observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredNode {
    /// Element tuple of the node
    pub element: TupleId,
    /// Its level when it was read
    pub level: u8,
    /// Its neighbor tuple
    pub neighbors: TupleId,
}

/// One back-link to write into an existing neighbor list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborUpdate {
    /// Node whose neighbor list changes
    pub target: StoredNode,
    /// Level of the list to change
    pub level: u8,
    /// Position within that level
    pub index: usize,
    /// Distance between the target and the new node
    pub distance: f32,
}

/// Outcome of [`apply_updates`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Updates written
    pub applied: u32,
    /// Updates skipped because the stored list no longer matches
    pub dropped: u32,
}

/// Writes `new_element` into every target slot named by `updates`.
///
/// Each update is its own staged update on the target's neighbor page. An
/// update whose slot falls outside the stored tuple's capacity (or whose
/// target slot no longer holds a neighbor tuple) is aborted and counted as
/// dropped; the rest still apply.
///
/// # Errors
///
/// Returns an error if a page cannot be locked or a commit fails.
pub fn apply_updates(
    store: &PageStore,
    new_element: TupleId,
    updates: &[NeighborUpdate],
    m: u16,
) -> Result<PatchOutcome> {
    let mut outcome = PatchOutcome::default();

    for update in updates {
        let target = update.target.neighbors;
        let mut scope = store.begin();
        let h = scope.register(store.lock_exclusive(target.page)?);

        let written = neighbor_slot_index(update.target.level, update.level, update.index, m)
            .is_some_and(|idx| {
                SlottedPage::new(scope.page_mut(h))
                    .item_mut(target.slot)
                    .is_some_and(|item| {
                        NeighborTuple::write_slot(item, idx, NeighborSlot::new(new_element, update.distance))
                    })
            });

        if written {
            scope.commit()?;
            outcome.applied += 1;
        } else {
            scope.abort();
            outcome.dropped += 1;
            warn!(
                target = %update.target.element,
                level = update.level,
                index = update.index,
                "patch.update_dropped"
            );
        }
    }

    debug!(applied = outcome.applied, dropped = outcome.dropped, "patch.done");
    Ok(outcome)
}
