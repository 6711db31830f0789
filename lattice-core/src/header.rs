use crate::error::StoreError;
use crate::hnsw::tuple::TupleId;
use crate::page::{INVALID_PAGE, PageId, SlotId, SlottedPage};

/// Magic bytes identifying a Lattice index file
pub const MAGIC: &[u8; 8] = b"LATTICE\0";

/// Current file format version
pub const VERSION: u32 = 1;

/// Page holding the metadata record
pub const META_PAGE: PageId = 0;

/// First page of the element/neighbor chain
pub const ROOT_PAGE: PageId = 1;

/// Size of the encoded metadata record
pub const META_SIZE: usize = 32;

/// Item slot of the metadata record on page 0
pub const META_SLOT: SlotId = 0;

const MAGIC_AT: usize = 0;
const VERSION_AT: usize = MAGIC_AT + 8;
const DIMS_AT: usize = VERSION_AT + 4;
const M_AT: usize = DIMS_AT + 4;
const ENTRY_LEVEL_AT: usize = M_AT + 2;
const HAS_ENTRY_AT: usize = ENTRY_LEVEL_AT + 1;
const ENTRY_PAGE_AT: usize = HAS_ENTRY_AT + 1;
const ENTRY_SLOT_AT: usize = ENTRY_PAGE_AT + 4;
const INSERT_PAGE_AT: usize = ENTRY_SLOT_AT + 4;

/// Graph entry point: the element searches start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    /// Element tuple of the entry node
    pub element: TupleId,
    /// Its graph level
    pub level: u8,
}

/// Metadata record stored as item 0 of page 0.
///
/// # Layout (within the item)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     magic
/// 8       4     version
/// 12      4     dimensions
/// 16      2     m
/// 18      1     entry level
/// 19      1     has entry point (0/1)
/// 20      4     entry page
/// 24      2     entry slot
/// 26      2     reserved
/// 28      4     insert page
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPage {
    /// Magic bytes for file type identification
    pub magic: [u8; 8],

    /// File format version
    pub version: u32,

    /// Number of dimensions per vector
    pub dimensions: u32,

    /// Neighbor slots per layer
    pub m: u16,

    /// Current graph entry point
    pub entry_point: Option<EntryPoint>,

    /// Page new insertions start scanning from
    pub insert_page: PageId,
}

impl MetaPage {
    /// Creates a metadata record for an empty index
    pub fn new(dimensions: u32, m: u16) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            dimensions,
            m,
            entry_point: None,
            insert_page: ROOT_PAGE,
        }
    }

    /// Validates the record for correctness and compatibility
    pub fn is_valid(&self) -> bool {
        self.magic == *MAGIC
            && self.version > 0
            && self.version <= VERSION
            && self.dimensions > 0
            && self.dimensions <= crate::hnsw::MAX_DIMENSIONS
            && self.m >= 2
            && self.insert_page != INVALID_PAGE
            && self.insert_page != META_PAGE
    }

    /// Writes the record into a formatted metadata page image
    ///
    /// The first write adds the record as item 0; later writes overwrite it
    /// in place.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corrupted` if item 0 exists with a different size.
    pub fn write_to(&self, page: &mut [u8]) -> Result<(), StoreError> {
        let record = self.to_bytes();
        let mut page = SlottedPage::new(page);

        if page.slot_count() == 0 {
            page.add_item(&record)?;
            return Ok(());
        }
        match page.item_mut(META_SLOT) {
            Some(item) if item.len() == META_SIZE => {
                item.copy_from_slice(&record);
                Ok(())
            }
            _ => Err(StoreError::Corrupted { page: META_PAGE, reason: "metadata item has the wrong size".into() }),
        }
    }

    /// Encodes the record
    #[must_use]
    pub fn to_bytes(&self) -> [u8; META_SIZE] {
        let mut page = [0u8; META_SIZE];
        page[MAGIC_AT..MAGIC_AT + 8].copy_from_slice(&self.magic);
        page[VERSION_AT..VERSION_AT + 4].copy_from_slice(&self.version.to_le_bytes());
        page[DIMS_AT..DIMS_AT + 4].copy_from_slice(&self.dimensions.to_le_bytes());
        page[M_AT..M_AT + 2].copy_from_slice(&self.m.to_le_bytes());

        let (level, has_entry, entry_page, entry_slot) = match self.entry_point {
            Some(ep) => (ep.level, 1u8, ep.element.page, ep.element.slot),
            None => (0, 0u8, INVALID_PAGE, SlotId::MAX),
        };
        page[ENTRY_LEVEL_AT] = level;
        page[HAS_ENTRY_AT] = has_entry;
        page[ENTRY_PAGE_AT..ENTRY_PAGE_AT + 4].copy_from_slice(&entry_page.to_le_bytes());
        page[ENTRY_SLOT_AT..ENTRY_SLOT_AT + 2].copy_from_slice(&entry_slot.to_le_bytes());
        page[ENTRY_SLOT_AT + 2..ENTRY_SLOT_AT + 4].fill(0);
        page[INSERT_PAGE_AT..INSERT_PAGE_AT + 4].copy_from_slice(&self.insert_page.to_le_bytes());
        page
    }

    /// Reads the record from a metadata page image
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corrupted` if the record is missing or its magic
    /// bytes or fields are invalid.
    pub fn read_from(page: &[u8]) -> Result<Self, StoreError> {
        let corrupted = |reason: &str| StoreError::Corrupted { page: META_PAGE, reason: reason.into() };

        let view = SlottedPage::new(page);
        let page = view
            .item(META_SLOT)
            .filter(|item| item.len() == META_SIZE)
            .ok_or_else(|| corrupted("file is not a valid Lattice index"))?;

        let u32_at = |at: usize| u32::from_le_bytes([page[at], page[at + 1], page[at + 2], page[at + 3]]);
        let u16_at = |at: usize| u16::from_le_bytes([page[at], page[at + 1]]);

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&page[MAGIC_AT..MAGIC_AT + 8]);
        if &magic != MAGIC {
            return Err(corrupted("file is not a valid Lattice index"));
        }

        let entry_point = (page[HAS_ENTRY_AT] == 1).then(|| EntryPoint {
            element: TupleId::new(u32_at(ENTRY_PAGE_AT), u16_at(ENTRY_SLOT_AT)),
            level: page[ENTRY_LEVEL_AT],
        });

        let meta = Self {
            magic,
            version: u32_at(VERSION_AT),
            dimensions: u32_at(DIMS_AT),
            m: u16_at(M_AT),
            entry_point,
            insert_page: u32_at(INSERT_PAGE_AT),
        };

        if !meta.is_valid() {
            return Err(corrupted("incompatible or damaged metadata record"));
        }

        Ok(meta)
    }
}
