//! Property tests for neighbor patching bounds.

mod common;

use common::{Scripted, open_index, stored, vector};
use lattice_core::hnsw::patch::apply_updates;
use lattice_core::hnsw::tuple::neighbor_slot_index;
use lattice_core::page::SlottedPage;
use lattice_core::{NeighborUpdate, StoredNode, TupleId};
use proptest::prelude::*;
use tempfile::TempDir;

const DIMS: u32 = 8;
const M: u16 = 4;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_out_of_range_patches_never_touch_other_bytes(
        stored_level in 0u8..3,
        believed_level in 0u8..4,
        patches in prop::collection::vec((0u8..5, 0usize..8), 1..12),
    ) {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir.path().join("prop.lattice"), DIMS, M);

        // Neighbors on both sides so any stray write would be visible
        index.insert(&vector(1, DIMS), 1, &Scripted::isolated(2)).unwrap();
        let target = index.insert(&vector(2, DIMS), 2, &Scripted::isolated(stored_level)).unwrap();
        index.insert(&vector(3, DIMS), 3, &Scripted::isolated(2)).unwrap();

        let mut node = stored(&index, &target);
        let neighbor_tid = node.neighbors;
        node.level = believed_level;

        let store = index.store();
        let before = store.lock_shared(neighbor_tid.page).unwrap().to_vec();
        let (start, len) = item_range(&before, neighbor_tid.slot);

        let updates: Vec<NeighborUpdate> = patches
            .iter()
            .map(|&(level, index)| NeighborUpdate { target: node, level, index, distance: 0.5 })
            .collect();
        let new_element = TupleId::new(9, 9);
        let outcome = apply_updates(store, new_element, &updates, M).unwrap();

        let capacity = M as usize * (stored_level as usize + 1);
        let expected_applied = patches
            .iter()
            .filter(|&&(level, i)| {
                neighbor_slot_index(believed_level, level, i, M).is_some_and(|idx| idx < capacity)
            })
            .count() as u32;
        prop_assert_eq!(outcome.applied, expected_applied);
        prop_assert_eq!(outcome.applied + outcome.dropped, patches.len() as u32);

        let after = store.lock_shared(neighbor_tid.page).unwrap().to_vec();
        prop_assert_eq!(&before[..start], &after[..start]);
        prop_assert_eq!(&before[start + len..], &after[start + len..]);

        let list = index.read_neighbors(target.element).unwrap();
        prop_assert_eq!(list.capacity(), capacity);
        let written = list.slots().iter().filter(|s| s.element == new_element).count();
        prop_assert!(written as u32 <= expected_applied);
        prop_assert_eq!(written == 0, expected_applied == 0);
    }
}

fn item_range(image: &[u8], slot: u16) -> (usize, usize) {
    let page = SlottedPage::new(image);
    let item = page.item(slot).unwrap();
    let start = item.as_ptr() as usize - image.as_ptr() as usize;
    (start, item.len())
}

#[test]
fn test_exact_drop_condition() {
    let dir = TempDir::new().unwrap();
    let index = open_index(&dir.path().join("drop.lattice"), DIMS, M);
    let target = index.insert(&vector(1, DIMS), 1, &Scripted::isolated(0)).unwrap();
    let node = stored(&index, &target);

    let stale = StoredNode { level: 1, ..node };
    let updates = [
        NeighborUpdate { target: node, level: 0, index: M as usize - 1, distance: 0.1 },
        NeighborUpdate { target: stale, level: 0, index: 0, distance: 0.1 },
        NeighborUpdate { target: stale, level: 1, index: 0, distance: 0.1 },
    ];
    let outcome = apply_updates(index.store(), TupleId::new(5, 0), &updates, M).unwrap();

    // A level-1 view of a level-0 tuple: level 0 lands past the end, level 1 fits
    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.dropped, 1);
}
