//! On-page record layouts for graph nodes.
//!
//! Every node is stored as two slotted-page items: an element tuple (level,
//! vector, duplicate row references) and a neighbor tuple (per-level adjacency).
//! Both are addressed by [`TupleId`], never by pointer.
//!
//! # Layout Invariants
//!
//! - A neighbor tuple's capacity is `m * (level + 1)` slots and never changes
//! - Level `l` occupies slots `(level - l) * m .. (level - l + 1) * m`
//! - Empty neighbor slots hold `TupleId::INVALID`

use crate::page::{INVALID_PAGE, INVALID_SLOT, PageId, SlotId, align8};

/// Row reference type (external row identifier)
pub type RowRef = u64;

/// Sentinel for an empty row reference slot
pub const INVALID_ROW_REF: RowRef = RowRef::MAX;

/// Duplicate row references an element can hold
pub const HEAP_REFS: usize = 10;

/// Item kind tag of an element tuple
pub const ELEMENT_KIND: u8 = 1;

/// Item kind tag of a neighbor tuple
pub const NEIGHBOR_KIND: u8 = 2;

/// Fixed part of an element tuple
pub const ELEMENT_HEADER_SIZE: usize = 16 + HEAP_REFS * 8;

/// Fixed part of a neighbor tuple
pub const NEIGHBOR_HEADER_SIZE: usize = 8;

/// Encoded size of one neighbor slot
pub const NEIGHBOR_SLOT_SIZE: usize = 12;

/// Address of a tuple: page plus line pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleId {
    /// Page holding the tuple
    pub page: PageId,
    /// Line pointer on that page
    pub slot: SlotId,
}

impl TupleId {
    /// Address that names no tuple
    pub const INVALID: Self = Self { page: INVALID_PAGE, slot: INVALID_SLOT };

    /// Create a tuple address
    #[must_use]
    pub const fn new(page: PageId, slot: SlotId) -> Self {
        Self { page, slot }
    }

    /// True unless this is `TupleId::INVALID`
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.page != INVALID_PAGE
    }
}

impl std::fmt::Display for TupleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.page, self.slot)
    }
}

/// Stored size of an element tuple, aligned as it sits on a page.
#[must_use]
pub const fn element_tuple_size(dims: usize) -> usize {
    align8(ELEMENT_HEADER_SIZE + dims * 4)
}

/// Stored size of a neighbor tuple for a node of `level`, aligned.
#[must_use]
pub const fn neighbor_tuple_size(level: u8, m: u16) -> usize {
    align8(NEIGHBOR_HEADER_SIZE + neighbor_capacity(level, m) * NEIGHBOR_SLOT_SIZE)
}

/// Neighbor slots reserved for a node of `level`
#[must_use]
pub const fn neighbor_capacity(level: u8, m: u16) -> usize {
    m as usize * (level as usize + 1)
}

/// Flat slot index of position `index` at `level` in the list of a node whose
/// top level is `owner_level`.
///
/// Returns `None` when `level` is above the owner or `index` is not a valid
/// position within one level. The result still has to be checked against the
/// capacity of the stored tuple.
#[must_use]
pub fn neighbor_slot_index(owner_level: u8, level: u8, index: usize, m: u16) -> Option<usize> {
    let depth = owner_level.checked_sub(level)?;
    if index >= m as usize {
        return None;
    }
    Some(depth as usize * m as usize + index)
}

/// Kind tag of an encoded tuple
#[must_use]
pub fn tuple_kind(item: &[u8]) -> Option<u8> {
    item.first().copied()
}

fn read_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn read_u64(b: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Graph node payload.
///
/// # Layout
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       1     kind (ELEMENT_KIND)
/// 1       1     level
/// 2       1     deleted (0/1)
/// 3       1     reserved
/// 4       2     neighbor tuple slot
/// 6       2     reserved
/// 8       4     neighbor tuple page
/// 12      4     dimensions
/// 16      80    row references [u64; HEAP_REFS]
/// 96      4*d   vector (f32, little endian)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ElementTuple {
    /// Top graph level of the node
    pub level: u8,

    /// Set by vacuum; the slots may be reused
    pub deleted: bool,

    /// Rows sharing this vector; unused entries are `INVALID_ROW_REF`
    pub rows: [RowRef; HEAP_REFS],

    /// Back-pointer to this node's neighbor tuple
    pub neighbors: TupleId,

    /// Vector payload
    pub vector: Vec<f32>,
}

impl ElementTuple {
    /// Create a live element holding one row reference
    #[must_use]
    pub fn new(level: u8, row: RowRef, vector: &[f32]) -> Self {
        let mut rows = [INVALID_ROW_REF; HEAP_REFS];
        rows[0] = row;
        Self { level, deleted: false, rows, neighbors: TupleId::INVALID, vector: vector.to_vec() }
    }

    /// Row references in use, in insertion order
    pub fn row_refs(&self) -> impl Iterator<Item = RowRef> + '_ {
        self.rows.iter().copied().take_while(|&r| r != INVALID_ROW_REF)
    }

    /// Encode the tuple (unaligned length)
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; ELEMENT_HEADER_SIZE + self.vector.len() * 4];
        out[0] = ELEMENT_KIND;
        out[1] = self.level;
        out[2] = u8::from(self.deleted);
        out[4..6].copy_from_slice(&self.neighbors.slot.to_le_bytes());
        out[8..12].copy_from_slice(&self.neighbors.page.to_le_bytes());
        out[12..16].copy_from_slice(&(self.vector.len() as u32).to_le_bytes());
        for (i, row) in self.rows.iter().enumerate() {
            let at = 16 + i * 8;
            out[at..at + 8].copy_from_slice(&row.to_le_bytes());
        }
        for (i, value) in self.vector.iter().enumerate() {
            let at = ELEMENT_HEADER_SIZE + i * 4;
            out[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Decode an element tuple
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The item is not tagged as an element
    /// - The item is shorter than its declared vector
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() < ELEMENT_HEADER_SIZE {
            return Err("Buffer too small for element tuple");
        }
        if bytes[0] != ELEMENT_KIND {
            return Err("Item is not an element tuple");
        }

        let dims = read_u32(bytes, 12) as usize;
        if bytes.len() < ELEMENT_HEADER_SIZE + dims * 4 {
            return Err("Element tuple truncated before end of vector");
        }

        let mut rows = [INVALID_ROW_REF; HEAP_REFS];
        for (i, row) in rows.iter_mut().enumerate() {
            *row = read_u64(bytes, 16 + i * 8);
        }

        let vector = bytes[ELEMENT_HEADER_SIZE..ELEMENT_HEADER_SIZE + dims * 4]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            level: bytes[1],
            deleted: bytes[2] != 0,
            rows,
            neighbors: TupleId::new(read_u32(bytes, 8), read_u16(bytes, 4)),
            vector,
        })
    }
}

/// Deleted flag of an encoded element, without decoding the vector
#[must_use]
pub fn element_is_deleted(item: &[u8]) -> bool {
    item.len() >= ELEMENT_HEADER_SIZE && item[0] == ELEMENT_KIND && item[2] != 0
}

/// Neighbor back-pointer of an encoded element
#[must_use]
pub fn element_neighbor_tid(item: &[u8]) -> Option<TupleId> {
    (item.len() >= ELEMENT_HEADER_SIZE && item[0] == ELEMENT_KIND)
        .then(|| TupleId::new(read_u32(item, 8), read_u16(item, 4)))
}

/// Level of an encoded element
#[must_use]
pub fn element_level(item: &[u8]) -> Option<u8> {
    (item.len() >= ELEMENT_HEADER_SIZE && item[0] == ELEMENT_KIND).then(|| item[1])
}

/// One adjacency entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborSlot {
    /// Element the edge points at
    pub element: TupleId,
    /// Cached distance to it
    pub distance: f32,
}

impl NeighborSlot {
    /// Unused slot
    pub const EMPTY: Self = Self { element: TupleId::INVALID, distance: 0.0 };

    /// Create an edge entry
    #[must_use]
    pub const fn new(element: TupleId, distance: f32) -> Self {
        Self { element, distance }
    }

    /// True for an unused slot
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.element.is_valid()
    }

    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.element.page.to_le_bytes());
        out[4..6].copy_from_slice(&self.element.slot.to_le_bytes());
        out[6..8].fill(0);
        out[8..12].copy_from_slice(&self.distance.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            element: TupleId::new(read_u32(bytes, 0), read_u16(bytes, 4)),
            distance: f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

/// Per-level adjacency list of one node.
///
/// # Layout
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       1     kind (NEIGHBOR_KIND)
/// 1       1     reserved
/// 2       2     slot count
/// 4       4     reserved
/// 8       12*n  slots (page u32, slot u16, pad u16, distance f32)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborTuple {
    slots: Vec<NeighborSlot>,
}

impl NeighborTuple {
    /// Empty list sized for a node of `level`
    #[must_use]
    pub fn empty(level: u8, m: u16) -> Self {
        Self { slots: vec![NeighborSlot::EMPTY; neighbor_capacity(level, m)] }
    }

    /// List for a new node from its per-level neighbors (index 0 = level 0)
    ///
    /// Levels above `level` and entries past `m` per level are ignored.
    #[must_use]
    pub fn for_node(level: u8, m: u16, neighbors: &[Vec<NeighborSlot>]) -> Self {
        let mut tuple = Self::empty(level, m);
        for (lc, list) in neighbors.iter().enumerate().take(level as usize + 1) {
            let base = (level as usize - lc) * m as usize;
            for (i, slot) in list.iter().take(m as usize).enumerate() {
                tuple.slots[base + i] = *slot;
            }
        }
        tuple
    }

    /// Number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// All slots, empty ones included
    #[must_use]
    pub fn slots(&self) -> &[NeighborSlot] {
        &self.slots
    }

    /// Occupied slots of one level for an owner of `owner_level`
    #[must_use]
    pub fn level_neighbors(&self, owner_level: u8, level: u8, m: u16) -> Vec<NeighborSlot> {
        let Some(start) = neighbor_slot_index(owner_level, level, 0, m) else {
            return Vec::new();
        };
        self.slots
            .iter()
            .skip(start)
            .take(m as usize)
            .filter(|s| !s.is_empty())
            .copied()
            .collect()
    }

    /// Encode the tuple
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; NEIGHBOR_HEADER_SIZE + self.slots.len() * NEIGHBOR_SLOT_SIZE];
        out[0] = NEIGHBOR_KIND;
        out[2..4].copy_from_slice(&(self.slots.len() as u16).to_le_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let at = NEIGHBOR_HEADER_SIZE + i * NEIGHBOR_SLOT_SIZE;
            slot.write_to(&mut out[at..at + NEIGHBOR_SLOT_SIZE]);
        }
        out
    }

    /// Decode a neighbor tuple
    ///
    /// # Errors
    ///
    /// Returns an error if the item is not a neighbor tuple or its slot count
    /// exceeds what its length can hold.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        let capacity = Self::capacity_of(bytes).ok_or("Item is not a neighbor tuple")?;
        let slots = bytes[NEIGHBOR_HEADER_SIZE..]
            .chunks_exact(NEIGHBOR_SLOT_SIZE)
            .take(capacity)
            .map(NeighborSlot::read_from)
            .collect();
        Ok(Self { slots })
    }

    /// Capacity of an encoded neighbor tuple, derived from its byte length
    #[must_use]
    pub fn capacity_of(bytes: &[u8]) -> Option<usize> {
        if bytes.len() < NEIGHBOR_HEADER_SIZE || bytes[0] != NEIGHBOR_KIND {
            return None;
        }
        let by_len = (bytes.len() - NEIGHBOR_HEADER_SIZE) / NEIGHBOR_SLOT_SIZE;
        let declared = read_u16(bytes, 2) as usize;
        Some(declared.min(by_len))
    }

    /// Overwrite slot `index` of an encoded tuple in place
    ///
    /// Returns false, leaving the bytes untouched, if the index is outside the
    /// tuple's capacity.
    pub fn write_slot(bytes: &mut [u8], index: usize, slot: NeighborSlot) -> bool {
        match Self::capacity_of(bytes) {
            Some(capacity) if index < capacity => {
                let at = NEIGHBOR_HEADER_SIZE + index * NEIGHBOR_SLOT_SIZE;
                slot.write_to(&mut bytes[at..at + NEIGHBOR_SLOT_SIZE]);
                true
            }
            _ => false,
        }
    }
}
