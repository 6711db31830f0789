#![allow(dead_code)]

use anyhow::Result;
use lattice_core::hnsw::tuple::{ELEMENT_KIND, tuple_kind};
use lattice_core::page::SlottedPage;
use lattice_core::{
    CandidateBuilder, CandidateGraph, ElementTuple, EntryPoint, IndexOptions, InsertReport, NeighborSlot,
    NeighborUpdate, NewNode, StoredNode, TupleId, VectorIndex,
};
use parking_lot::Mutex;
use std::path::Path;

/// Builder that returns a prepared plan and remembers the entry point it saw.
pub struct Scripted {
    pub graph: CandidateGraph,
    pub seen_entry: Mutex<Option<Option<EntryPoint>>>,
}

impl Scripted {
    pub fn new(graph: CandidateGraph) -> Self {
        Self { graph, seen_entry: Mutex::new(None) }
    }

    /// Node with no edges
    pub fn isolated(level: u8) -> Self {
        Self::new(CandidateGraph { node: NewNode { level, neighbors: vec![] }, ..Default::default() })
    }

    /// Node linked to `targets` on level 0, with back-links into each of them
    pub fn linked(level: u8, targets: &[(StoredNode, usize)]) -> Self {
        let edges = targets.iter().map(|(t, _)| NeighborSlot::new(t.element, 1.0)).collect();
        let updates = targets
            .iter()
            .map(|&(target, index)| NeighborUpdate { target, level: 0, index, distance: 1.0 })
            .collect();
        Self::new(CandidateGraph { node: NewNode { level, neighbors: vec![edges] }, updates, duplicate: None })
    }

    /// Exact duplicate of `dup`
    pub fn duplicate_of(dup: TupleId) -> Self {
        Self::new(CandidateGraph { node: NewNode::default(), updates: vec![], duplicate: Some(dup) })
    }

    pub fn seen_entry(&self) -> Option<EntryPoint> {
        let seen = *self.seen_entry.lock();
        seen.flatten()
    }
}

impl CandidateBuilder for Scripted {
    fn build_candidate_graph(&self, _vector: &[f32], entry_point: Option<EntryPoint>) -> Result<CandidateGraph> {
        *self.seen_entry.lock() = Some(entry_point);
        Ok(self.graph.clone())
    }
}

pub fn open_index(path: &Path, dims: u32, m: u16) -> VectorIndex {
    VectorIndex::open(path, dims, IndexOptions { m, ..IndexOptions::default() }).unwrap()
}

pub fn vector(seed: u64, dims: u32) -> Vec<f32> {
    (0..dims).map(|i| ((seed * 31 + u64::from(i)) % 97) as f32 / 97.0).collect()
}

/// Stored-node view of an insert result, as a search would report it
pub fn stored(index: &VectorIndex, report: &InsertReport) -> StoredNode {
    let element = index.read_element(report.element).unwrap();
    StoredNode { element: report.element, level: element.level, neighbors: element.neighbors }
}

/// Every element tuple reachable through the page chain
pub fn all_elements(index: &VectorIndex) -> Vec<(TupleId, ElementTuple)> {
    let mut out = Vec::new();
    for page_id in index.chain().unwrap() {
        let guard = index.store().lock_shared(page_id).unwrap();
        let page = SlottedPage::new(&guard[..]);
        for slot in 0..page.slot_count() {
            let item = page.item(slot).unwrap();
            if tuple_kind(item) == Some(ELEMENT_KIND) {
                out.push((TupleId::new(page_id, slot), ElementTuple::from_bytes(item).unwrap()));
            }
        }
    }
    out
}

/// Live (not deleted) elements
pub fn live_elements(index: &VectorIndex) -> Vec<(TupleId, ElementTuple)> {
    all_elements(index).into_iter().filter(|(_, e)| !e.deleted).collect()
}
