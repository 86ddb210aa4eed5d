//! Sector trees: the copy-on-write Merkle structure every logical file is
//! stored as, plus the math for navigating it.

pub mod layout;
pub mod lut;
pub mod mt;
pub mod seq;
mod walker;

pub use layout::{RootSectorInfo, SectorReference};
pub use mt::{SectorTreeMt, TreeReadHandle};
pub use seq::{AccessMode, SectorTreeSeq};
pub use walker::{TreePath, TreePosition};
