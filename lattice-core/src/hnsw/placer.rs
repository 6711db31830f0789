//! Element placement: choosing where a new node's two tuples live.
//!
//! The walk starts at the insertion cursor and applies, per page:
//!
//! 1. Both tuples fit: place them side by side.
//! 2. Only the element fits and this is the tail: allocate a page for the
//!    neighbor tuple and link it.
//! 3. A deleted element on this page has a neighbor page with room: reuse the
//!    pair in place.
//! 4. Move on. At the end of the chain, allocate and link a fresh page and
//!    continue on it.
//!
//! Every page is mutated inside a staged update; pages that are looked at and
//! rejected are released unchanged before the next one is locked.

use crate::error::StoreError;
use crate::hnsw::tuple::{
    ElementTuple, NEIGHBOR_KIND, NeighborTuple, TupleId, element_is_deleted, element_neighbor_tid,
    tuple_kind,
};
use crate::page::{PageId, PageKind, SLOT_SIZE, SlotId, SlottedPage, align8};
use crate::storage::{PageStore, PageWriteGuard};
use crate::wal::{StageHandle, StagedUpdate};
use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Where a new node ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Element tuple address
    pub element: TupleId,

    /// Neighbor tuple address
    pub neighbors: TupleId,

    /// True if a deleted element's slots were overwritten
    pub reused: bool,

    /// Neighbor page of the first deleted element seen while scanning
    pub first_free_page: Option<PageId>,

    /// Pages added to the store by this placement
    pub pages_allocated: u32,
}

/// Reusable slot pair found by [`find_free_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSlot {
    /// Deleted element to overwrite
    pub element: TupleId,

    /// Its neighbor tuple
    pub neighbors: TupleId,

    /// Stage handle of the neighbor page when it is not the scanned page
    pub neighbor_handle: Option<StageHandle>,
}

/// Stores a new node's element and neighbor tuples.
///
/// `element.neighbors` is overwritten with the chosen neighbor address.
///
/// # Arguments
///
/// * `store` - Page store
/// * `element` - Element tuple to write
/// * `neighbors` - Neighbor tuple to write
/// * `insert_page` - Page the walk starts from (the insertion cursor)
///
/// # Errors
///
/// Returns an error if:
/// - A page in the chain is not a formatted graph page
/// - A tuple that was checked to fit does not (structural corruption)
/// - Allocating or committing a page fails
pub fn place_element(
    store: &PageStore,
    element: &mut ElementTuple,
    neighbors: &NeighborTuple,
    insert_page: PageId,
) -> Result<Placement> {
    let neighbor_bytes = neighbors.to_bytes();
    let etup_size = align8(element.to_bytes().len());
    let ntup_size = align8(neighbor_bytes.len());
    let combined = etup_size + ntup_size + SLOT_SIZE;

    let mut current = insert_page;
    let mut held: Option<PageWriteGuard> = None;
    let mut first_free_page = None;
    let mut pages_allocated = 0;

    loop {
        let fresh = held.is_some();
        let guard = match held.take() {
            Some(guard) => guard,
            None => store.lock_exclusive(current)?,
        };

        let mut scope = store.begin();
        let h = scope.register(guard);

        let (free, next) = {
            let page = SlottedPage::new(scope.page(h));
            if !page.is_initialized() || page.kind() != Some(PageKind::Graph) {
                return Err(StoreError::Corrupted {
                    page: current,
                    reason: "page in the element chain is not a graph page".into(),
                }
                .into());
            }
            (page.free_space(), page.next_page())
        };

        if free >= combined {
            let e_slot = SlottedPage::new(scope.page(h)).slot_count();
            let neighbor_tid = TupleId::new(current, e_slot + 1);
            element.neighbors = neighbor_tid;

            add_tuple(&mut scope, h, &element.to_bytes(), e_slot)?;
            add_tuple(&mut scope, h, &neighbor_bytes, neighbor_tid.slot)?;
            scope.commit()?;

            debug!(page = current, slot = e_slot, "placer.same_page");
            return Ok(Placement {
                element: TupleId::new(current, e_slot),
                neighbors: neighbor_tid,
                reused: false,
                first_free_page,
                pages_allocated,
            });
        }

        if free >= etup_size && next.is_none() {
            let new_guard = store.allocate_page()?;
            pages_allocated += 1;
            let nh = scope.register(new_guard);
            let new_page = scope.page_id(nh);

            SlottedPage::new(scope.page_mut(nh)).init(PageKind::Graph);
            add_tuple(&mut scope, nh, &neighbor_bytes, 0)?;
            SlottedPage::new(scope.page_mut(h)).set_next_page(new_page);

            let e_slot = SlottedPage::new(scope.page(h)).slot_count();
            element.neighbors = TupleId::new(new_page, 0);
            add_tuple(&mut scope, h, &element.to_bytes(), e_slot)?;
            scope.commit()?;

            debug!(page = current, neighbor_page = new_page, "placer.split_tail");
            return Ok(Placement {
                element: TupleId::new(current, e_slot),
                neighbors: element.neighbors,
                reused: false,
                first_free_page,
                pages_allocated,
            });
        }

        if fresh {
            return Err(StoreError::PageFull { needed: etup_size + SLOT_SIZE, available: free })
                .with_context(|| format!("Element tuple does not fit on empty page {current}"));
        }

        if let Some(slot) = find_free_slot(store, &mut scope, h, ntup_size, &mut first_free_page)? {
            element.neighbors = slot.neighbors;
            let neighbor_handle = slot.neighbor_handle.unwrap_or(h);

            overwrite_tuple(&mut scope, neighbor_handle, slot.neighbors.slot, &neighbor_bytes)?;
            overwrite_tuple(&mut scope, h, slot.element.slot, &element.to_bytes())?;
            scope.commit()?;

            debug!(element = %slot.element, neighbors = %slot.neighbors, "placer.reuse_free_slot");
            return Ok(Placement {
                element: slot.element,
                neighbors: slot.neighbors,
                reused: true,
                first_free_page,
                pages_allocated,
            });
        }

        match next {
            Some(next) => {
                scope.abort();
                current = next;
            }
            None => {
                let new_guard = store.allocate_page()?;
                pages_allocated += 1;
                let nh = scope.register(new_guard);
                let new_page = scope.page_id(nh);

                SlottedPage::new(scope.page_mut(nh)).init(PageKind::Graph);
                SlottedPage::new(scope.page_mut(h)).set_next_page(new_page);

                held = Some(scope.commit_retaining(nh)?);
                debug!(from = current, page = new_page, "placer.extend_chain");
                current = new_page;
            }
        }
    }
}

/// Looks for a deleted element on the staged page whose neighbor page can hold
/// a neighbor tuple of `ntup_size` bytes.
///
/// A neighbor page other than the scanned one is locked without waiting; if
/// another worker holds it the pair is skipped. A page that passes the check
/// stays locked, registered in `scope`.
///
/// # Errors
///
/// Returns an error only if locking a neighbor page fails for reasons other
/// than contention.
pub fn find_free_slot(
    store: &PageStore,
    scope: &mut StagedUpdate<'_>,
    h: StageHandle,
    ntup_size: usize,
    first_free_page: &mut Option<PageId>,
) -> Result<Option<FreeSlot>> {
    let page_id = scope.page_id(h);
    let slot_count = SlottedPage::new(scope.page(h)).slot_count();

    for slot in 0..slot_count {
        let neighbor_tid = {
            let page = SlottedPage::new(scope.page(h));
            let Some(item) = page.item(slot) else { continue };
            if !element_is_deleted(item) {
                continue;
            }
            match element_neighbor_tid(item) {
                Some(tid) => tid,
                None => continue,
            }
        };

        if first_free_page.is_none() {
            *first_free_page = Some(neighbor_tid.page);
        }

        let element = TupleId::new(page_id, slot);

        if neighbor_tid.page == page_id {
            if has_room_for(scope.page(h), neighbor_tid.slot, ntup_size, page_id) {
                return Ok(Some(FreeSlot { element, neighbors: neighbor_tid, neighbor_handle: None }));
            }
            continue;
        }

        if neighbor_tid.page >= store.page_count() {
            warn!(element = %element, neighbors = %neighbor_tid, "placer.dangling_back_pointer");
            continue;
        }

        let Some(guard) = store.try_lock_exclusive(neighbor_tid.page)? else {
            debug!(page = neighbor_tid.page, "placer.free_slot_contended");
            continue;
        };

        if has_room_for(guard.image(), neighbor_tid.slot, ntup_size, neighbor_tid.page) {
            let nh = scope.register(guard);
            return Ok(Some(FreeSlot { element, neighbors: neighbor_tid, neighbor_handle: Some(nh) }));
        }
    }

    Ok(None)
}

fn has_room_for(image: &[u8], slot: SlotId, ntup_size: usize, page_id: PageId) -> bool {
    let page = SlottedPage::new(image);
    match page.item(slot) {
        Some(item) if tuple_kind(item) == Some(NEIGHBOR_KIND) => {
            (page.free_space() + align8(item.len())).saturating_sub(SLOT_SIZE) >= ntup_size
        }
        _ => {
            warn!(page = page_id, slot, "placer.back_pointer_not_a_neighbor_tuple");
            false
        }
    }
}

fn add_tuple(scope: &mut StagedUpdate<'_>, h: StageHandle, bytes: &[u8], expected: SlotId) -> Result<()> {
    let page_id = scope.page_id(h);
    let slot = SlottedPage::new(scope.page_mut(h))
        .add_item(bytes)
        .with_context(|| format!("Failed to add tuple to page {page_id}"))?;

    if slot != expected {
        return Err(StoreError::Corrupted {
            page: page_id,
            reason: format!("tuple landed in slot {slot}, expected {expected}"),
        }
        .into());
    }
    Ok(())
}

fn overwrite_tuple(scope: &mut StagedUpdate<'_>, h: StageHandle, slot: SlotId, bytes: &[u8]) -> Result<()> {
    let page_id = scope.page_id(h);
    SlottedPage::new(scope.page_mut(h))
        .overwrite_item(slot, bytes)
        .map_err(|e| e.on_page(page_id))
        .with_context(|| format!("Failed to overwrite tuple ({page_id},{slot})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::tuple::{NeighborSlot, element_tuple_size, neighbor_tuple_size};
    use crate::page::PAGE_SIZE;
    use crate::storage::StoreOptions;
    use tempfile::TempDir;

    const M: u16 = 4;

    fn store_with_root(dir: &TempDir) -> PageStore {
        let store = PageStore::open(dir.path().join("placer.lattice"), StoreOptions::default()).unwrap();
        let guard = store.allocate_page().unwrap();
        let mut scope = store.begin();
        let h = scope.register(guard);
        SlottedPage::new(scope.page_mut(h)).init(PageKind::Graph);
        scope.commit().unwrap();
        store
    }

    fn place(store: &PageStore, level: u8, dims: usize, start: PageId) -> Placement {
        let mut element = ElementTuple::new(level, 1, &vec![0.5; dims]);
        let neighbors = NeighborTuple::empty(level, M);
        place_element(store, &mut element, &neighbors, start).unwrap()
    }

    fn mark_deleted(store: &PageStore, tid: TupleId) {
        let mut scope = store.begin();
        let h = scope.register(store.lock_exclusive(tid.page).unwrap());
        let bytes = SlottedPage::new(scope.page(h)).item(tid.slot).unwrap().to_vec();
        let mut element = ElementTuple::from_bytes(&bytes).unwrap();
        element.deleted = true;
        SlottedPage::new(scope.page_mut(h)).overwrite_item(tid.slot, &element.to_bytes()).unwrap();
        scope.commit().unwrap();
    }

    #[test]
    fn test_first_node_shares_root_page() {
        let dir = TempDir::new().unwrap();
        let store = store_with_root(&dir);

        let placement = place(&store, 0, 8, 1);
        assert_eq!(placement.element, TupleId::new(1, 0));
        assert_eq!(placement.neighbors, TupleId::new(1, 1));
        assert!(!placement.reused);
        assert_eq!(placement.pages_allocated, 0);
    }

    #[test]
    fn test_element_back_pointer_is_written() {
        let dir = TempDir::new().unwrap();
        let store = store_with_root(&dir);
        let placement = place(&store, 1, 8, 1);

        let guard = store.lock_shared(1).unwrap();
        let page = SlottedPage::new(&guard[..]);
        let element = ElementTuple::from_bytes(page.item(placement.element.slot).unwrap()).unwrap();
        assert_eq!(element.neighbors, placement.neighbors);
        assert_eq!(
            NeighborTuple::from_bytes(page.item(placement.neighbors.slot).unwrap()).unwrap().capacity(),
            8
        );
    }

    #[test]
    fn test_split_tail_puts_neighbors_on_new_page() {
        let dir = TempDir::new().unwrap();
        let store = store_with_root(&dir);

        // Leave room for one element but not element + neighbors
        let etup = element_tuple_size(8);
        let filler = {
            let guard = store.lock_shared(1).unwrap();
            SlottedPage::new(&guard[..]).free_space() - etup - SLOT_SIZE - 8
        };
        let mut scope = store.begin();
        let h = scope.register(store.lock_exclusive(1).unwrap());
        SlottedPage::new(scope.page_mut(h)).add_item(&vec![0u8; filler & !7]).unwrap();
        scope.commit().unwrap();

        let placement = place(&store, 0, 8, 1);
        assert_eq!(placement.element, TupleId::new(1, 1));
        assert_eq!(placement.neighbors, TupleId::new(2, 0));
        assert_eq!(placement.pages_allocated, 1);

        let guard = store.lock_shared(1).unwrap();
        assert_eq!(SlottedPage::new(&guard[..]).next_page(), Some(2));
    }

    #[test]
    fn test_full_chain_is_extended() {
        let dir = TempDir::new().unwrap();
        let store = store_with_root(&dir);

        let per_page = (PAGE_SIZE - 16) / (element_tuple_size(64) + neighbor_tuple_size(0, M) + 2 * SLOT_SIZE);
        let mut last = None;
        for _ in 0..=per_page {
            last = Some(place(&store, 0, 64, 1));
        }

        let last = last.unwrap();
        assert!(last.element.page > 1);
        assert!(store.page_count() >= 3);
    }

    #[test]
    fn test_reuses_deleted_pair_in_place() {
        let dir = TempDir::new().unwrap();
        let store = store_with_root(&dir);

        let victim = place(&store, 0, 8, 1);
        let survivor = place(&store, 0, 8, 1);
        mark_deleted(&store, victim.element);

        // Fill the root so neither a new pair nor a lone element fits
        let mut scope = store.begin();
        let h = scope.register(store.lock_exclusive(1).unwrap());
        let free = SlottedPage::new(scope.page(h)).free_space();
        SlottedPage::new(scope.page_mut(h)).add_item(&vec![0u8; (free & !7) - 8]).unwrap();
        scope.commit().unwrap();

        let placement = place(&store, 0, 8, 1);
        assert!(placement.reused);
        assert_eq!(placement.element, victim.element);
        assert_eq!(placement.neighbors, victim.neighbors);
        assert_eq!(placement.first_free_page, Some(1));
        assert_ne!(placement.element, survivor.element);
    }

    #[test]
    fn test_contended_neighbor_page_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store_with_root(&dir);

        // Element on page 1, its neighbors on page 2
        let etup = element_tuple_size(8);
        let filler = {
            let guard = store.lock_shared(1).unwrap();
            SlottedPage::new(&guard[..]).free_space() - etup - SLOT_SIZE - 8
        };
        let mut scope = store.begin();
        let h = scope.register(store.lock_exclusive(1).unwrap());
        SlottedPage::new(scope.page_mut(h)).add_item(&vec![0u8; filler & !7]).unwrap();
        scope.commit().unwrap();

        let victim = place(&store, 0, 8, 1);
        assert_eq!(victim.neighbors.page, 2);
        mark_deleted(&store, victim.element);

        let held = store.lock_exclusive(2).unwrap();
        let mut scope = store.begin();
        let h = scope.register(store.lock_exclusive(1).unwrap());
        let mut first_free = None;
        let found =
            find_free_slot(&store, &mut scope, h, neighbor_tuple_size(0, M), &mut first_free).unwrap();
        assert_eq!(found, None);
        assert_eq!(first_free, Some(2));
        drop(scope);
        drop(held);

        let mut scope = store.begin();
        let h = scope.register(store.lock_exclusive(1).unwrap());
        let found =
            find_free_slot(&store, &mut scope, h, neighbor_tuple_size(0, M), &mut None).unwrap().unwrap();
        assert_eq!(found.element, victim.element);
        assert!(found.neighbor_handle.is_some());
    }

    #[test]
    fn test_uninitialized_chain_page_is_corruption() {
        let dir = TempDir::new().unwrap();
        let store = PageStore::open(dir.path().join("raw.lattice"), StoreOptions::default()).unwrap();
        drop(store.allocate_page().unwrap());

        let mut element = ElementTuple::new(0, 1, &[0.0; 4]);
        let err = place_element(&store, &mut element, &NeighborTuple::empty(0, M), 1).unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Corrupted { page: 1, .. })));
    }

    #[test]
    fn test_neighbor_slot_written_on_placement() {
        let dir = TempDir::new().unwrap();
        let store = store_with_root(&dir);
        let edge = NeighborSlot::new(TupleId::new(1, 0), 0.25);

        let mut element = ElementTuple::new(0, 7, &[1.0; 8]);
        let neighbors = NeighborTuple::for_node(0, M, &[vec![edge]]);
        let placement = place_element(&store, &mut element, &neighbors, 1).unwrap();

        let guard = store.lock_shared(placement.neighbors.page).unwrap();
        let stored =
            NeighborTuple::from_bytes(SlottedPage::new(&guard[..]).item(placement.neighbors.slot).unwrap())
                .unwrap();
        assert_eq!(stored.level_neighbors(0, 0, M), vec![edge]);
    }
}
