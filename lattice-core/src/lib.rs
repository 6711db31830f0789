//! Lattice - crash-safe HNSW node insertion over a fixed-size page store
//!
//! Lattice stores a graph-based approximate nearest neighbor index in 4KB
//! slotted pages and takes care of the write side of inserting a node: finding
//! room for it, writing it atomically, patching existing neighbor lists, reusing
//! space left by deleted nodes, and keeping the entry point and insertion
//! cursor current. Choosing neighbors is left to a [`CandidateBuilder`].
//!
//! # Features
//!
//! - Memory-mapped page store with per-page locks
//! - Copy-on-write staged updates backed by a checksummed write-ahead log
//! - Many concurrent writers, no whole-graph lock
//! - Free slot reuse for deleted nodes
//! - Best-effort back-link patching with observable drop counts
//!
//! # Example
//!
//! ```no_run
//! use lattice_core::{CandidateBuilder, CandidateGraph, EntryPoint, IndexOptions, NewNode, VectorIndex};
//!
//! struct Isolated;
//!
//! impl CandidateBuilder for Isolated {
//!     fn build_candidate_graph(
//!         &self,
//!         _vector: &[f32],
//!         _entry_point: Option<EntryPoint>,
//!     ) -> anyhow::Result<CandidateGraph> {
//!         Ok(CandidateGraph { node: NewNode { level: 0, neighbors: vec![] }, ..Default::default() })
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let index = VectorIndex::open("embeddings.lattice", 3, IndexOptions::default())?;
//!
//! let report = index.insert(&[0.1, 0.2, 0.3], 42, &Isolated)?;
//! println!("stored at {}", report.element);
//!
//! index.flush()?;
//! # Ok(())
//! # }
//! ```

pub mod error;
#[cfg(feature = "internals")]
pub mod header;
#[cfg(not(feature = "internals"))]
pub(crate) mod header;

#[cfg(feature = "internals")]
pub mod hnsw;
#[cfg(not(feature = "internals"))]
pub(crate) mod hnsw;

#[cfg(feature = "internals")]
pub mod page;
#[cfg(not(feature = "internals"))]
pub(crate) mod page;

pub mod stats;

#[cfg(feature = "internals")]
pub mod storage;
#[cfg(not(feature = "internals"))]
pub(crate) mod storage;

pub mod trace;

#[cfg(feature = "internals")]
pub mod wal;
#[cfg(not(feature = "internals"))]
pub(crate) mod wal;

pub use error::StoreError;
pub use header::{EntryPoint, MetaPage};
pub use hnsw::{
    CandidateBuilder, CandidateGraph, ElementTuple, InsertReport, MAX_DIMENSIONS, NeighborSlot, NeighborTuple,
    NeighborUpdate, NewNode, RowRef, StoredNode, TupleId, level_multiplier, random_level,
};
pub use hnsw::tuple::{HEAP_REFS, INVALID_ROW_REF};
pub use page::{PAGE_SIZE, PageId, SlotId};
pub use stats::StatsSnapshot;
pub use trace::GraphTrace;
pub use wal::SyncMode;

use anyhow::{Context, Result, bail};
use header::{META_PAGE, ROOT_PAGE};
use page::SlottedPage;
use stats::InsertStats;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use storage::{PageStore, StoreOptions};
use tracing::info;

/// Configuration options for VectorIndex
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Neighbor slots per level (M parameter)
    pub m: u16,

    /// When the write-ahead log is forced to disk
    pub sync: SyncMode,

    /// Log size that triggers a checkpoint
    pub wal_checkpoint_bytes: u64,

    /// How long page allocation waits for the extension lock
    pub extension_lock_timeout: Duration,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            m: 16,
            sync: SyncMode::Full,
            wal_checkpoint_bytes: 4 * 1024 * 1024,
            extension_lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Public facade for a Lattice index
///
/// All operations take `&self`; share the index between threads with an `Arc`
/// or scoped threads. Writers coordinate through page locks.
#[derive(Debug)]
pub struct VectorIndex {
    /// Page store (owns the file lock)
    store: PageStore,

    /// Vector dimensions
    dims: u32,

    /// Neighbor slots per level
    m: u16,

    stats: InsertStats,
}

impl VectorIndex {
    /// Open or create an index
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the index file (the log lives next to it with a `-wal` suffix)
    /// * `dims` - Number of dimensions per vector
    /// * `options` - Index configuration options
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `m` or `dims` is out of range
    /// - The file cannot be opened, is locked, or is corrupted
    /// - Dimensions or `m` differ from the existing index
    pub fn open<P: AsRef<Path>>(path: P, dims: u32, options: IndexOptions) -> Result<Self> {
        if !(2..=100).contains(&options.m) {
            bail!("Invalid m: {} (must be between 2 and 100)", options.m);
        }
        if dims == 0 || dims > MAX_DIMENSIONS {
            bail!("Invalid dimensions: {} (must be between 1 and {})", dims, MAX_DIMENSIONS);
        }

        let store = PageStore::open(
            path,
            StoreOptions {
                sync: options.sync,
                wal_checkpoint_bytes: options.wal_checkpoint_bytes,
                extension_lock_timeout: options.extension_lock_timeout,
            },
        )?;

        let initialized = SlottedPage::new(&store.lock_shared(META_PAGE)?[..]).is_initialized();
        if initialized {
            let meta = hnsw::meta::read_meta(&store).context("Failed to read index metadata")?;
            if meta.dimensions != dims {
                bail!("Dimension mismatch: index has {}, requested {}", meta.dimensions, dims);
            }
            if meta.m != options.m {
                bail!("M mismatch: index has {}, requested {}", meta.m, options.m);
            }
        } else {
            hnsw::meta::initialize(&store, &MetaPage::new(dims, options.m))?;
        }

        info!(dims, m = options.m, pages = store.page_count(), "index.open");
        Ok(Self { store, dims, m: options.m, stats: InsertStats::default() })
    }

    /// Insert a vector for an external row
    ///
    /// # Arguments
    ///
    /// * `vector` - Vector to insert (must match index dimensions)
    /// * `row` - External row reference stored with it
    /// * `builder` - Neighbor selection for the new node
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The vector is empty or has the wrong dimensions
    /// - `row` is `INVALID_ROW_REF`
    /// - The builder fails or plans a level above [`max_level`](Self::max_level)
    /// - A storage step fails
    pub fn insert<B: CandidateBuilder + ?Sized>(&self, vector: &[f32], row: RowRef, builder: &B) -> Result<InsertReport> {
        if vector.is_empty() {
            bail!("Cannot insert an empty vector");
        }
        if vector.len() != self.dims as usize {
            bail!("Vector dimension mismatch: expected {}, got {}", self.dims, vector.len());
        }
        if row == INVALID_ROW_REF {
            bail!("Row reference {row:#x} is reserved");
        }

        hnsw::insert::insert_element(&self.store, &self.stats, self.m, vector, row, builder)
    }

    /// Current metadata: entry point and insertion cursor
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata page is damaged
    pub fn meta(&self) -> Result<MetaPage> {
        hnsw::meta::read_meta(&self.store)
    }

    /// Counters since open
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Reads an element tuple
    ///
    /// # Errors
    ///
    /// Returns an error if `tid` does not name an element tuple
    pub fn read_element(&self, tid: TupleId) -> Result<ElementTuple> {
        let guard = self.store.lock_shared(tid.page)?;
        let page = SlottedPage::new(&guard[..]);
        let item = page.item(tid.slot).ok_or(StoreError::MissingSlot { page: tid.page, slot: tid.slot })?;
        ElementTuple::from_bytes(item)
            .map_err(|reason| StoreError::Corrupted { page: tid.page, reason: reason.into() }.into())
    }

    /// Reads the neighbor tuple of an element
    ///
    /// # Errors
    ///
    /// Returns an error if the element or its back-pointer does not resolve
    pub fn read_neighbors(&self, element: TupleId) -> Result<NeighborTuple> {
        let tid = self.read_element(element)?.neighbors;
        let guard = self.store.lock_shared(tid.page)?;
        let page = SlottedPage::new(&guard[..]);
        let item = page.item(tid.slot).ok_or(StoreError::MissingSlot { page: tid.page, slot: tid.slot })?;
        NeighborTuple::from_bytes(item)
            .map_err(|reason| StoreError::Corrupted { page: tid.page, reason: reason.into() }.into())
    }

    /// Page ids of the element chain, starting at the root
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ChainCycle` if a page is reached twice
    pub fn chain(&self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(ROOT_PAGE);

        while let Some(page) = current {
            if !seen.insert(page) {
                return Err(StoreError::ChainCycle { page }.into());
            }
            pages.push(page);
            let guard = self.store.lock_shared(page)?;
            current = SlottedPage::new(&guard[..]).next_page();
        }

        Ok(pages)
    }

    /// Marks an element deleted and clears its row references
    ///
    /// Its slot pair becomes available to later inserts. If the element sits
    /// before the insertion cursor, the cursor is moved back to its page. If it
    /// is the entry point, the live element with the highest level takes over.
    ///
    /// # Errors
    ///
    /// Returns an error if `tid` does not name an element tuple
    pub fn mark_deleted(&self, tid: TupleId) -> Result<()> {
        hnsw::meta::delete_element(&self.store, tid)?;
        Ok(())
    }

    /// Flush all changes to disk
    ///
    /// Syncs the data file and truncates the write-ahead log.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Get the dimensionality of vectors in this index
    pub fn dimensions(&self) -> u32 {
        self.dims
    }

    /// Neighbor slots per level
    pub fn m(&self) -> u16 {
        self.m
    }

    /// Highest level a node may have in this index
    pub fn max_level(&self) -> u8 {
        hnsw::max_level(self.m)
    }

    /// Underlying page store
    #[cfg(feature = "internals")]
    pub fn store(&self) -> &PageStore {
        &self.store
    }
}
