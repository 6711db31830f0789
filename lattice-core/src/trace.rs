//! Graph traversal dumps for debugging.
//!
//! A [`GraphTrace`] collects the nodes and edges a traversal touched and writes
//! them as `{"nodes": [...], "edges": [...]}`. The file is written next to its
//! destination and renamed into place, so readers never see a partial dump.

use crate::hnsw::tuple::TupleId;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// A visited node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TraceNode {
    /// Element page
    pub page: u32,
    /// Element slot
    pub slot: u16,
    /// Level it was visited on
    pub level: u8,
    /// Distance to the query
    pub distance: f32,
}

/// A traversed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEdge {
    /// Source element page
    pub src_page: u32,
    /// Source element slot
    pub src_slot: u16,
    /// Destination element page
    pub dst_page: u32,
    /// Destination element slot
    pub dst_slot: u16,
}

/// Ordered record of one traversal.
#[derive(Debug, Default, Serialize)]
pub struct GraphTrace {
    nodes: Vec<TraceNode>,
    edges: Vec<TraceEdge>,
    #[serde(skip)]
    seen: HashSet<TupleId>,
}

impl GraphTrace {
    /// Empty trace
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a visit; repeated visits to the same element are ignored.
    pub fn record_node(&mut self, element: TupleId, level: u8, distance: f32) {
        if self.seen.insert(element) {
            self.nodes.push(TraceNode { page: element.page, slot: element.slot, level, distance });
        }
    }

    /// Records a traversed edge.
    pub fn record_edge(&mut self, src: TupleId, dst: TupleId) {
        self.edges.push(TraceEdge {
            src_page: src.page,
            src_slot: src.slot,
            dst_page: dst.page,
            dst_slot: dst.slot,
        });
    }

    /// Visited nodes in visit order
    #[must_use]
    pub fn nodes(&self) -> &[TraceNode] {
        &self.nodes
    }

    /// Traversed edges in order
    #[must_use]
    pub fn edges(&self) -> &[TraceEdge] {
        &self.edges
    }

    /// Writes the trace as JSON to `path`, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The trace has no nodes
    /// - The temporary file cannot be written or renamed
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if self.nodes.is_empty() {
            bail!("no elements found");
        }

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = Path::new(&tmp_name);

        {
            let file = File::create(tmp)
                .with_context(|| format!("Failed to create trace file: {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(tmp, path)
            .with_context(|| format!("Failed to move trace into place: {}", path.display()))?;
        Ok(())
    }
}
