//! The insertion pipeline: merge, place, patch, sync.

use crate::header::EntryPoint;
use crate::hnsw::duplicate::merge_duplicate;
use crate::hnsw::meta::{read_meta, sync_after_insert};
use crate::hnsw::patch::{NeighborUpdate, apply_updates};
use crate::hnsw::placer::place_element;
use crate::hnsw::tuple::{ElementTuple, NeighborSlot, NeighborTuple, RowRef, TupleId};
use crate::hnsw::max_level;
use crate::storage::PageStore;
use crate::stats::InsertStats;
use anyhow::{Result, bail};
use tracing::debug;

/// Graph position chosen for a new point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewNode {
    /// Top level of the node
    pub level: u8,
    /// Outgoing edges per level, index 0 = level 0
    pub neighbors: Vec<Vec<NeighborSlot>>,
}

/// Everything the candidate search decided for one point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateGraph {
    /// The new node and its outgoing edges
    pub node: NewNode,
    /// Back-links to write into existing nodes
    pub updates: Vec<NeighborUpdate>,
    /// Existing element holding the exact same vector
    pub duplicate: Option<TupleId>,
}

/// Neighbor selection, supplied by the caller.
///
/// Implementations search the stored graph starting from `entry_point` and
/// decide the new node's level, its edges, and the back-links it needs.
pub trait CandidateBuilder {
    /// Plans the insertion of `vector`
    ///
    /// # Errors
    ///
    /// Any error aborts the insert before anything is written.
    fn build_candidate_graph(&self, vector: &[f32], entry_point: Option<EntryPoint>) -> Result<CandidateGraph>;
}

/// What one insert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertReport {
    /// Element now holding the row
    pub element: TupleId,
    /// Neighbor tuple written for a new node; `None` for a merged duplicate
    pub neighbors: Option<TupleId>,
    /// Row was folded into an existing element
    pub merged_duplicate: bool,
    /// A deleted slot pair was overwritten
    pub reused_free_slot: bool,
    /// Pages added to the store
    pub pages_allocated: u32,
    /// Back-links written
    pub applied_updates: u32,
    /// Back-links skipped because the stored list no longer matched
    pub dropped_updates: u32,
    /// Insertion cursor moved
    pub cursor_advanced: bool,
    /// The new node became the entry point
    pub entry_point_updated: bool,
}

impl InsertReport {
    fn merged(element: TupleId) -> Self {
        Self {
            element,
            neighbors: None,
            merged_duplicate: true,
            reused_free_slot: false,
            pages_allocated: 0,
            applied_updates: 0,
            dropped_updates: 0,
            cursor_advanced: false,
            entry_point_updated: false,
        }
    }
}

/// Runs one insertion end to end.
///
/// # Errors
///
/// Returns an error if the builder fails, its plan is invalid for this index,
/// or any storage step fails. A failure before placement commits leaves no
/// trace of the new node.
pub fn insert_element<B: CandidateBuilder + ?Sized>(
    store: &PageStore,
    stats: &InsertStats,
    m: u16,
    vector: &[f32],
    row: RowRef,
    builder: &B,
) -> Result<InsertReport> {
    let meta = read_meta(store)?;
    let cursor = meta.insert_page;
    let entry = meta.entry_point;

    let graph = builder.build_candidate_graph(vector, entry)?;
    let level = graph.node.level;
    if level > max_level(m) {
        bail!("Node level {} exceeds the maximum of {} for m = {}", level, max_level(m), m);
    }

    if let Some(dup) = graph.duplicate {
        if merge_duplicate(store, dup, row)? {
            stats.record_merge();
            stats.record_insert();
            return Ok(InsertReport::merged(dup));
        }
        stats.record_fallback();
        debug!(duplicate = %dup, "insert.duplicate_fallback");
    }

    let mut element = ElementTuple::new(level, row, vector);
    let neighbors = NeighborTuple::for_node(level, m, &graph.node.neighbors);
    let placement = place_element(store, &mut element, &neighbors, cursor)?;
    stats.record_placement(placement.reused, placement.pages_allocated);

    let patch = apply_updates(store, placement.element, &graph.updates, m)?;
    stats.record_patch(patch.applied, patch.dropped);

    let sync = sync_after_insert(store, &placement, level, cursor, entry)?;
    stats.record_sync(sync.cursor_advanced, sync.entry_point_updated);
    stats.record_insert();

    debug!(element = %placement.element, level, "insert.done");
    Ok(InsertReport {
        element: placement.element,
        neighbors: Some(placement.neighbors),
        merged_duplicate: false,
        reused_free_slot: placement.reused,
        pages_allocated: placement.pages_allocated,
        applied_updates: patch.applied,
        dropped_updates: patch.dropped,
        cursor_advanced: sync.cursor_advanced,
        entry_point_updated: sync.entry_point_updated,
    })
}
