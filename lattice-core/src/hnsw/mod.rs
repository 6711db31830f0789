pub mod duplicate;
pub mod insert;
pub mod meta;
pub mod patch;
pub mod placer;
pub mod tuple;

pub use insert::{CandidateBuilder, CandidateGraph, InsertReport, NewNode};
pub use patch::{NeighborUpdate, StoredNode};
pub use placer::Placement;
pub use tuple::{ElementTuple, NeighborSlot, NeighborTuple, RowRef, TupleId};

use crate::page::{PAGE_HEADER_SIZE, PAGE_SIZE, SLOT_SIZE};
use rand::Rng;
use tuple::{ELEMENT_HEADER_SIZE, NEIGHBOR_HEADER_SIZE, NEIGHBOR_SLOT_SIZE};

/// Largest item an empty page can take (aligned)
const MAX_ITEM_SIZE: usize = (PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE) & !7;

/// Largest vector whose element tuple fits on an empty page
pub const MAX_DIMENSIONS: u32 = ((MAX_ITEM_SIZE - ELEMENT_HEADER_SIZE) / 4) as u32;

/// Highest level whose neighbor tuple still fits on an empty page.
///
/// Returns 0 for an `m` so large that only level 0 fits.
#[must_use]
pub const fn max_level(m: u16) -> u8 {
    let per_level = NEIGHBOR_SLOT_SIZE * m as usize;
    if per_level == 0 {
        return 0;
    }
    let levels = (MAX_ITEM_SIZE - NEIGHBOR_HEADER_SIZE) / per_level;
    if levels == 0 {
        0
    } else if levels > 256 {
        u8::MAX
    } else {
        (levels - 1) as u8
    }
}

/// Layer multiplier `1 / ln(m)` for [`random_level`]
#[must_use]
pub fn level_multiplier(m: u16) -> f64 {
    1.0 / f64::from(m).ln()
}

/// Draws a node level from the usual exponential distribution, capped at `cap`.
pub fn random_level<R: Rng + ?Sized>(ml: f64, cap: u8, rng: &mut R) -> u8 {
    let uniform: f64 = rng.random();
    let level = (-(1.0 - uniform).ln() * ml).floor();
    if level >= f64::from(cap) { cap } else { level as u8 }
}
