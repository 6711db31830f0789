//! Metadata access: the entry point and insertion cursor on page 0.

use crate::error::StoreError;
use crate::header::{EntryPoint, META_PAGE, MetaPage, ROOT_PAGE};
use crate::hnsw::placer::Placement;
use crate::hnsw::tuple::{
    ELEMENT_KIND, ElementTuple, HEAP_REFS, INVALID_ROW_REF, TupleId, element_is_deleted, element_level, tuple_kind,
};
use crate::page::{PageId, PageKind, SlottedPage};
use crate::storage::PageStore;
use anyhow::{Context, Result, bail};
use std::collections::HashSet;
use tracing::{debug, info};

/// Reads the metadata record under a shared lock.
///
/// # Errors
///
/// Returns an error if page 0 does not hold a valid metadata record.
pub fn read_meta(store: &PageStore) -> Result<MetaPage> {
    let guard = store.lock_shared(META_PAGE)?;
    Ok(MetaPage::read_from(&guard)?)
}

/// Formats a new index: metadata page plus an empty root graph page.
///
/// A root page left zeroed by an interrupted earlier attempt is handed out
/// again by the allocator.
///
/// # Errors
///
/// Returns an error if allocation or the commit fails, or if the root page is
/// already formatted.
pub fn initialize(store: &PageStore, meta: &MetaPage) -> Result<()> {
    let mut scope = store.begin();
    let mh = scope.register(store.lock_exclusive(META_PAGE)?);
    let root = store.allocate_page()?;
    if root.page_id() != ROOT_PAGE {
        return Err(StoreError::Corrupted {
            page: ROOT_PAGE,
            reason: "root page is formatted but the metadata page is not".into(),
        }
        .into());
    }
    let rh = scope.register(root);

    SlottedPage::new(scope.page_mut(mh)).init(PageKind::Meta);
    meta.write_to(scope.page_mut(mh))?;
    SlottedPage::new(scope.page_mut(rh)).init(PageKind::Graph);

    scope.commit().context("Failed to write initial metadata")?;
    info!(dimensions = meta.dimensions, m = meta.m, "meta.initialize");
    Ok(())
}

/// What [`sync_after_insert`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Insertion cursor moved
    pub cursor_advanced: bool,
    /// Entry point replaced
    pub entry_point_updated: bool,
}

/// Advances the insertion cursor and entry point after a node was placed.
///
/// The cursor moves to the new node's neighbor page when that differs from
/// `cursor_at_start`, unless a reused slot pair sat behind a different page
/// than the first free pair seen. The entry point is replaced when the node's
/// level is above the one read at start; under the metadata lock it is only
/// written if the stored entry point is still lower.
///
/// # Errors
///
/// Returns an error if the metadata page cannot be read or committed.
pub fn sync_after_insert(
    store: &PageStore,
    placement: &Placement,
    level: u8,
    cursor_at_start: PageId,
    entry_at_start: Option<EntryPoint>,
) -> Result<SyncOutcome> {
    let new_page = placement.neighbors.page;
    let advance = new_page != cursor_at_start
        && (!placement.reused || placement.first_free_page == Some(new_page));
    let promote = entry_at_start.is_none_or(|ep| level > ep.level);

    if !advance && !promote {
        return Ok(SyncOutcome::default());
    }

    let mut scope = store.begin();
    let h = scope.register(store.lock_exclusive(META_PAGE)?);
    let mut meta = MetaPage::read_from(scope.page(h))?;
    let mut outcome = SyncOutcome::default();

    if advance {
        meta.insert_page = new_page;
        outcome.cursor_advanced = true;
    }

    if promote && meta.entry_point.is_none_or(|ep| level > ep.level) {
        meta.entry_point = Some(EntryPoint { element: placement.element, level });
        outcome.entry_point_updated = true;
    }

    if outcome == SyncOutcome::default() {
        scope.abort();
        return Ok(outcome);
    }

    meta.write_to(scope.page_mut(h))?;
    scope.commit()?;

    debug!(
        cursor = meta.insert_page,
        entry = %meta.entry_point.map_or(TupleId::INVALID, |ep| ep.element),
        "meta.sync"
    );
    Ok(outcome)
}

/// What [`delete_element`] changed in the metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Insertion cursor moved back to the element's page
    pub cursor_rewound: bool,
    /// The element was the entry point and has been replaced
    pub entry_point_replaced: bool,
}

/// Marks an element deleted and clears its row references.
///
/// Runs under the metadata page lock, in one staged update with the element's
/// page:
/// - if the element is the entry point, the live element with the highest
///   level becomes the entry point (none if the index has no other live
///   element), so a later insert reusing the slot pair never inherits it;
/// - if the element's page comes before the insertion cursor in the chain,
///   the cursor moves back to it, so the freed pair is found by the next walk.
///
/// Holding the metadata lock serializes deletes, so the replacement cannot be
/// deleted or reused before the commit.
///
/// # Errors
///
/// Returns an error if `tid` does not name an element tuple, the chain has a
/// cycle, or the commit fails.
pub fn delete_element(store: &PageStore, tid: TupleId) -> Result<DeleteOutcome> {
    if tid.page == META_PAGE {
        bail!("{tid} is on the metadata page, not an element tuple");
    }

    let mut scope = store.begin();
    let mh = scope.register(store.lock_exclusive(META_PAGE)?);
    let mut meta = MetaPage::read_from(scope.page(mh))?;

    let cursor = meta.insert_page;
    let replace = meta.entry_point.is_some_and(|ep| ep.element == tid);
    let mut successor: Option<EntryPoint> = None;
    let mut settled = false;
    let mut rewind = false;

    walk_chain(store, |page_id, page| {
        if !settled {
            if page_id == cursor {
                settled = true;
            } else if page_id == tid.page {
                rewind = true;
                settled = true;
            }
        }
        if replace {
            for slot in 0..page.slot_count() {
                let candidate = TupleId::new(page_id, slot);
                let Some(item) = page.item(slot) else { continue };
                if candidate == tid || tuple_kind(item) != Some(ELEMENT_KIND) || element_is_deleted(item) {
                    continue;
                }
                let Some(level) = element_level(item) else { continue };
                if successor.is_none_or(|ep| level > ep.level) {
                    successor = Some(EntryPoint { element: candidate, level });
                }
            }
        }
        replace || !settled
    })?;

    let eh = scope.register(store.lock_exclusive(tid.page)?);
    let mut element = {
        let page = SlottedPage::new(scope.page(eh));
        let item = page.item(tid.slot).ok_or(StoreError::MissingSlot { page: tid.page, slot: tid.slot })?;
        ElementTuple::from_bytes(item).map_err(|reason| StoreError::Corrupted { page: tid.page, reason: reason.into() })?
    };
    element.deleted = true;
    element.rows = [INVALID_ROW_REF; HEAP_REFS];
    SlottedPage::new(scope.page_mut(eh))
        .overwrite_item(tid.slot, &element.to_bytes())
        .map_err(|e| e.on_page(tid.page))?;

    let mut outcome = DeleteOutcome::default();
    if replace {
        meta.entry_point = successor;
        outcome.entry_point_replaced = true;
    }
    if rewind {
        meta.insert_page = tid.page;
        outcome.cursor_rewound = true;
    }
    if outcome != DeleteOutcome::default() {
        meta.write_to(scope.page_mut(mh))?;
    }
    scope.commit()?;

    debug!(
        element = %tid,
        cursor = meta.insert_page,
        entry = %meta.entry_point.map_or(TupleId::INVALID, |ep| ep.element),
        "meta.delete_element"
    );
    Ok(outcome)
}

/// Visits chain pages from the root under shared locks until `visit` returns
/// false or the chain ends.
fn walk_chain<F>(store: &PageStore, mut visit: F) -> Result<()>
where
    F: FnMut(PageId, &SlottedPage<&[u8]>) -> bool,
{
    let mut seen = HashSet::new();
    let mut current = Some(ROOT_PAGE);

    while let Some(page_id) = current {
        if !seen.insert(page_id) {
            return Err(StoreError::ChainCycle { page: page_id }.into());
        }
        let guard = store.lock_shared(page_id)?;
        let page = SlottedPage::new(&guard[..]);
        if !visit(page_id, &page) {
            break;
        }
        current = page.next_page();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::placer::place_element;
    use crate::hnsw::tuple::NeighborTuple;
    use crate::storage::StoreOptions;
    use tempfile::TempDir;

    fn new_store(dir: &TempDir) -> PageStore {
        let store = PageStore::open(dir.path().join("meta.lattice"), StoreOptions::default()).unwrap();
        initialize(&store, &MetaPage::new(4, 8)).unwrap();
        store
    }

    fn placed(element: TupleId, neighbors: TupleId) -> Placement {
        Placement { element, neighbors, reused: false, first_free_page: None, pages_allocated: 0 }
    }

    #[test]
    fn test_initialize_formats_meta_and_root() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        let meta = read_meta(&store).unwrap();
        assert_eq!(meta.insert_page, ROOT_PAGE);
        assert_eq!(meta.entry_point, None);

        let root = store.lock_shared(ROOT_PAGE).unwrap();
        assert_eq!(SlottedPage::new(&root[..]).kind(), Some(PageKind::Graph));
    }

    #[test]
    fn test_first_node_becomes_entry_point() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let node = TupleId::new(1, 0);

        let outcome = sync_after_insert(&store, &placed(node, TupleId::new(1, 1)), 0, 1, None).unwrap();
        assert_eq!(outcome, SyncOutcome { cursor_advanced: false, entry_point_updated: true });
        assert_eq!(read_meta(&store).unwrap().entry_point, Some(EntryPoint { element: node, level: 0 }));
    }

    #[test]
    fn test_higher_stored_entry_point_is_kept() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let high = TupleId::new(1, 0);
        sync_after_insert(&store, &placed(high, TupleId::new(1, 1)), 3, 1, None).unwrap();

        // A racing insert that read "no entry point" must not demote it
        let low = TupleId::new(1, 2);
        let outcome = sync_after_insert(&store, &placed(low, TupleId::new(1, 3)), 1, 1, None).unwrap();
        assert!(!outcome.entry_point_updated);
        assert_eq!(read_meta(&store).unwrap().entry_point.unwrap().element, high);
    }

    #[test]
    fn test_cursor_follows_new_neighbor_page() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let entry = Some(EntryPoint { element: TupleId::new(1, 0), level: 5 });

        let outcome = sync_after_insert(&store, &placed(TupleId::new(1, 4), TupleId::new(2, 0)), 0, 1, entry).unwrap();
        assert!(outcome.cursor_advanced);
        assert_eq!(read_meta(&store).unwrap().insert_page, 2);
    }

    #[test]
    fn test_cursor_stays_for_reuse_behind_other_page() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let entry = Some(EntryPoint { element: TupleId::new(1, 0), level: 5 });

        let mut placement = placed(TupleId::new(3, 0), TupleId::new(3, 1));
        placement.reused = true;
        placement.first_free_page = Some(2);

        let outcome = sync_after_insert(&store, &placement, 0, 1, entry).unwrap();
        assert_eq!(outcome, SyncOutcome::default());
        assert_eq!(read_meta(&store).unwrap().insert_page, 1);

        placement.first_free_page = Some(3);
        let outcome = sync_after_insert(&store, &placement, 0, 1, entry).unwrap();
        assert!(outcome.cursor_advanced);
    }

    fn place_node(store: &PageStore, level: u8) -> Placement {
        let meta = read_meta(store).unwrap();
        let mut element = ElementTuple::new(level, 1, &[0.5; 4]);
        let neighbors = NeighborTuple::empty(level, 8);
        let placement = place_element(store, &mut element, &neighbors, meta.insert_page).unwrap();
        sync_after_insert(store, &placement, level, meta.insert_page, meta.entry_point).unwrap();
        placement
    }

    #[test]
    fn test_deleting_entry_point_promotes_highest_live_element() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let low = place_node(&store, 1);
        let mid = place_node(&store, 2);
        let top = place_node(&store, 4);
        assert_eq!(read_meta(&store).unwrap().entry_point.unwrap().element, top.element);

        let outcome = delete_element(&store, top.element).unwrap();
        assert!(outcome.entry_point_replaced);
        assert_eq!(read_meta(&store).unwrap().entry_point, Some(EntryPoint { element: mid.element, level: 2 }));

        delete_element(&store, mid.element).unwrap();
        assert_eq!(read_meta(&store).unwrap().entry_point, Some(EntryPoint { element: low.element, level: 1 }));

        delete_element(&store, low.element).unwrap();
        assert_eq!(read_meta(&store).unwrap().entry_point, None);
    }

    #[test]
    fn test_deleting_other_element_keeps_entry_point() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let top = place_node(&store, 3);
        let other = place_node(&store, 0);

        let outcome = delete_element(&store, other.element).unwrap();
        assert_eq!(outcome, DeleteOutcome::default());
        assert_eq!(read_meta(&store).unwrap().entry_point, Some(EntryPoint { element: top.element, level: 3 }));

        let guard = store.lock_shared(other.element.page).unwrap();
        let page = SlottedPage::new(&guard[..]);
        let item = page.item(other.element.slot).unwrap();
        assert!(element_is_deleted(item));
    }

    #[test]
    fn test_delete_rejects_non_element() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let node = place_node(&store, 0);

        assert!(delete_element(&store, TupleId::new(META_PAGE, 0)).is_err());
        assert!(delete_element(&store, node.neighbors).is_err());
        assert!(delete_element(&store, TupleId::new(ROOT_PAGE, 40)).is_err());
        assert_eq!(read_meta(&store).unwrap().entry_point.unwrap().element, node.element);
    }
}
