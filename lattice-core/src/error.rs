//! Typed storage failures.
//!
//! Public operations return `anyhow::Result`; these variants travel inside the
//! `anyhow::Error` so callers can tell structural corruption apart from plain
//! I/O trouble with `downcast_ref::<StoreError>()`.

use crate::page::{PageId, SlotId};
use thiserror::Error;

/// Failures raised by the page store and the record codecs.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A page id past the end of the store was requested.
    #[error("page {page} is out of range (store has {page_count} pages)")]
    PageOutOfRange {
        /// Requested page
        page: PageId,
        /// Pages currently allocated
        page_count: u32,
    },

    /// An item did not fit on a page that was expected to hold it.
    #[error("page is full: {needed} bytes requested, {available} available")]
    PageFull {
        /// Bytes the item needs, including its line pointer
        needed: usize,
        /// Bytes the page could offer
        available: usize,
    },

    /// A slot id does not name an item on the page.
    #[error("slot {slot} does not exist on page {page}")]
    MissingSlot {
        /// Page that was searched
        page: PageId,
        /// Slot that was requested
        slot: SlotId,
    },

    /// On-disk bytes violate the page or record format.
    #[error("corrupted page {page}: {reason}")]
    Corrupted {
        /// Page holding the damaged bytes
        page: PageId,
        /// What was wrong
        reason: String,
    },

    /// The page chain loops back onto itself.
    #[error("page chain revisits page {page}")]
    ChainCycle {
        /// First page seen twice
        page: PageId,
    },

    /// The store cannot grow any further.
    #[error("store cannot grow past {max} pages")]
    StoreFull {
        /// Maximum number of addressable pages
        max: u32,
    },

    /// The relation-extension lock could not be taken in time.
    #[error("timed out after {millis}ms waiting for the extension lock")]
    ExtensionLockTimeout {
        /// Configured timeout
        millis: u128,
    },

    /// A commit was failed on purpose by the fault injector.
    #[error("injected commit failure")]
    InjectedFailure,
}

impl StoreError {
    /// Fills in the page of a `MissingSlot` raised by a page view.
    #[must_use]
    pub fn on_page(self, page: PageId) -> Self {
        match self {
            Self::MissingSlot { slot, .. } => Self::MissingSlot { page, slot },
            other => other,
        }
    }

    /// Returns true for failures that mean on-disk state cannot be trusted.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::PageFull { .. } | Self::Corrupted { .. } | Self::ChainCycle { .. }
        )
    }
}
