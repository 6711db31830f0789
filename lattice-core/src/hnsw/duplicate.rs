//! Folding exact duplicates into an existing element.

use crate::error::StoreError;
use crate::hnsw::tuple::{ElementTuple, HEAP_REFS, INVALID_ROW_REF, RowRef, TupleId};
use crate::page::SlottedPage;
use crate::storage::PageStore;
use anyhow::{Context, Result};
use tracing::debug;

/// Adds `row` to the row list of the element at `dup`.
///
/// Returns `false` without changing anything if the list is full or its first
/// entry is empty (the element is being deleted). The caller then inserts a
/// separate node.
///
/// # Errors
///
/// Returns an error if `dup` does not name an element tuple or the commit fails.
pub fn merge_duplicate(store: &PageStore, dup: TupleId, row: RowRef) -> Result<bool> {
    let mut scope = store.begin();
    let h = scope.register(store.lock_exclusive(dup.page)?);

    let mut element = {
        let page = SlottedPage::new(scope.page(h));
        let item = page.item(dup.slot).ok_or(StoreError::MissingSlot { page: dup.page, slot: dup.slot })?;
        ElementTuple::from_bytes(item)
            .map_err(|reason| StoreError::Corrupted { page: dup.page, reason: reason.into() })?
    };

    let free = element.rows.iter().position(|&r| r == INVALID_ROW_REF).unwrap_or(HEAP_REFS);
    if free == 0 || free == HEAP_REFS {
        scope.abort();
        debug!(element = %dup, used = free, "duplicate.refused");
        return Ok(false);
    }

    element.rows[free] = row;
    SlottedPage::new(scope.page_mut(h))
        .overwrite_item(dup.slot, &element.to_bytes())
        .map_err(|e| e.on_page(dup.page))
        .with_context(|| format!("Failed to rewrite element {dup}"))?;
    scope.commit()?;

    debug!(element = %dup, position = free, "duplicate.merged");
    Ok(true)
}
