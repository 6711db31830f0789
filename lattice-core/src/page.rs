//! Slotted page layout shared by the metadata page and every graph page.
//!
//! # Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     next_page: PageId (INVALID_PAGE at the tail of the chain)
//! 4       2     lower: end of the line pointer array
//! 6       2     upper: start of item data
//! 8       2     kind: PageKind
//! 10      6     reserved
//! 16      4*n   line pointers (offset: u16, len: u16)
//! ...           free space
//! upper..       item data, 8-byte aligned, grows toward the header
//! ```
//!
//! Slot numbers are stable: overwriting an item with one of a different size
//! re-packs the item area but keeps every line pointer pointing at its own item.

use crate::error::StoreError;

/// Page size for the data file (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Bytes reserved at the start of every page
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of one line pointer
pub const SLOT_SIZE: usize = 4;

/// Page number within the data file
pub type PageId = u32;

/// Line pointer index within a page
pub type SlotId = u16;

/// Sentinel for "no page" (end of chain, empty neighbor slot)
pub const INVALID_PAGE: PageId = PageId::MAX;

/// Sentinel for "no slot"
pub const INVALID_SLOT: SlotId = SlotId::MAX;

const NEXT_OFFSET: usize = 0;
const LOWER_OFFSET: usize = 4;
const UPPER_OFFSET: usize = 6;
const KIND_OFFSET: usize = 8;

/// What a page is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PageKind {
    /// Singleton metadata page (page 0)
    Meta = 1,
    /// Page in the element/neighbor chain
    Graph = 2,
}

/// Rounds `len` up to the 8-byte item alignment.
#[inline]
#[must_use]
pub const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

/// View over a page image.
///
/// Read accessors work on any `AsRef<[u8]>`; mutation needs `AsMut<[u8]>`.
#[derive(Debug)]
pub struct SlottedPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    /// Wraps a page image.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not exactly one page.
    pub fn new(buf: B) -> Self {
        assert_eq!(buf.as_ref().len(), PAGE_SIZE, "page image must be PAGE_SIZE bytes");
        Self { buf }
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// True once `init` has run on this image.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.lower() as usize >= PAGE_HEADER_SIZE
    }

    /// Page kind, if the header carries a known one.
    #[must_use]
    pub fn kind(&self) -> Option<PageKind> {
        match read_u16(self.bytes(), KIND_OFFSET) {
            1 => Some(PageKind::Meta),
            2 => Some(PageKind::Graph),
            _ => None,
        }
    }

    /// Forward link to the next page of the chain.
    #[must_use]
    pub fn next_page(&self) -> Option<PageId> {
        let b = self.bytes();
        let next = PageId::from_le_bytes([
            b[NEXT_OFFSET],
            b[NEXT_OFFSET + 1],
            b[NEXT_OFFSET + 2],
            b[NEXT_OFFSET + 3],
        ]);
        (next != INVALID_PAGE).then_some(next)
    }

    fn lower(&self) -> u16 {
        read_u16(self.bytes(), LOWER_OFFSET)
    }

    fn upper(&self) -> u16 {
        read_u16(self.bytes(), UPPER_OFFSET)
    }

    /// Number of line pointers on the page.
    #[must_use]
    pub fn slot_count(&self) -> u16 {
        let lower = self.lower() as usize;
        (lower.saturating_sub(PAGE_HEADER_SIZE) / SLOT_SIZE) as u16
    }

    /// Bytes available for one new item, its line pointer already paid for.
    #[must_use]
    pub fn free_space(&self) -> usize {
        let gap = (self.upper() as usize).saturating_sub(self.lower() as usize);
        gap.saturating_sub(SLOT_SIZE)
    }

    fn line_pointer(&self, slot: SlotId) -> Option<(usize, usize)> {
        if slot >= self.slot_count() {
            return None;
        }
        let at = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        let offset = read_u16(self.bytes(), at) as usize;
        let len = read_u16(self.bytes(), at + 2) as usize;
        (offset + len <= PAGE_SIZE && offset >= PAGE_HEADER_SIZE).then_some((offset, len))
    }

    /// Stored length of an item.
    #[must_use]
    pub fn item_len(&self, slot: SlotId) -> Option<usize> {
        self.line_pointer(slot).map(|(_, len)| len)
    }

    /// Bytes of an item.
    #[must_use]
    pub fn item(&self, slot: SlotId) -> Option<&[u8]> {
        let (offset, len) = self.line_pointer(slot)?;
        self.bytes().get(offset..offset + len)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Formats the image as an empty page of the given kind.
    pub fn init(&mut self, kind: PageKind) {
        let b = self.bytes_mut();
        b.fill(0);
        b[NEXT_OFFSET..NEXT_OFFSET + 4].copy_from_slice(&INVALID_PAGE.to_le_bytes());
        write_u16(b, LOWER_OFFSET, PAGE_HEADER_SIZE as u16);
        write_u16(b, UPPER_OFFSET, PAGE_SIZE as u16);
        write_u16(b, KIND_OFFSET, kind as u16);
    }

    /// Sets the forward link.
    pub fn set_next_page(&mut self, next: PageId) {
        self.bytes_mut()[NEXT_OFFSET..NEXT_OFFSET + 4].copy_from_slice(&next.to_le_bytes());
    }

    fn set_lower(&mut self, value: usize) {
        write_u16(self.bytes_mut(), LOWER_OFFSET, value as u16);
    }

    fn set_upper(&mut self, value: usize) {
        write_u16(self.bytes_mut(), UPPER_OFFSET, value as u16);
    }

    fn set_line_pointer(&mut self, slot: SlotId, offset: usize, len: usize) {
        let at = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        let b = self.bytes_mut();
        write_u16(b, at, offset as u16);
        write_u16(b, at + 2, len as u16);
    }

    /// Mutable bytes of an item, for same-size in-place updates.
    pub fn item_mut(&mut self, slot: SlotId) -> Option<&mut [u8]> {
        let (offset, len) = self.line_pointer(slot)?;
        self.bytes_mut().get_mut(offset..offset + len)
    }

    /// Appends an item under a new line pointer and returns its slot.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PageFull` if the aligned item does not fit.
    pub fn add_item(&mut self, item: &[u8]) -> Result<SlotId, StoreError> {
        let aligned = align8(item.len());
        let available = self.free_space();
        if aligned > available {
            return Err(StoreError::PageFull { needed: aligned + SLOT_SIZE, available });
        }

        let slot = self.slot_count();
        let offset = self.upper() as usize - aligned;
        let lower = self.lower() as usize;

        self.bytes_mut()[offset..offset + item.len()].copy_from_slice(item);
        self.bytes_mut()[offset + item.len()..offset + aligned].fill(0);
        self.set_upper(offset);
        self.set_lower(lower + SLOT_SIZE);
        self.set_line_pointer(slot, offset, item.len());

        Ok(slot)
    }

    /// Replaces the item in `slot`, keeping its slot number.
    ///
    /// Same aligned size is written in place; anything else re-packs the item
    /// area so the freed or extra bytes come out of the page's free space.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PageFull` if the replacement does not fit, and
    /// `StoreError::MissingSlot` (page 0 placeholder, caller adds context) if the
    /// slot does not exist. The image is untouched on error.
    pub fn overwrite_item(&mut self, slot: SlotId, item: &[u8]) -> Result<(), StoreError> {
        let Some((offset, old_len)) = self.line_pointer(slot) else {
            return Err(StoreError::MissingSlot { page: INVALID_PAGE, slot });
        };

        if align8(old_len) == align8(item.len()) {
            let b = self.bytes_mut();
            b[offset..offset + item.len()].copy_from_slice(item);
            b[offset + item.len()..offset + align8(old_len)].fill(0);
            self.set_line_pointer(slot, offset, item.len());
            return Ok(());
        }

        let raw_gap = (self.upper() as usize).saturating_sub(self.lower() as usize);
        let available = raw_gap + align8(old_len);
        if align8(item.len()) > available {
            return Err(StoreError::PageFull { needed: align8(item.len()), available });
        }

        let mut items: Vec<Vec<u8>> = (0..self.slot_count())
            .map(|s| self.item(s).map(<[u8]>::to_vec).unwrap_or_default())
            .collect();
        items[slot as usize] = item.to_vec();
        self.repack(&items);
        Ok(())
    }

    fn repack(&mut self, items: &[Vec<u8>]) {
        let mut upper = PAGE_SIZE;
        let lower = PAGE_HEADER_SIZE + items.len() * SLOT_SIZE;
        self.bytes_mut()[lower..PAGE_SIZE].fill(0);

        for (slot, item) in items.iter().enumerate() {
            upper -= align8(item.len());
            self.bytes_mut()[upper..upper + item.len()].copy_from_slice(item);
            self.set_line_pointer(slot as SlotId, upper, item.len());
        }

        self.set_upper(upper);
        self.set_lower(lower);
    }
}
