//! Sector and block allocation.

mod block_manager;
mod cow;
mod sector_alloc;

pub use block_manager::{BlockIndex, BlockManager};
pub use cow::{
    ArchiveTreeAllocator, CowTreeAllocator, NodeAllocation, TreeAllocator,
};
pub use sector_alloc::ArchiveSectorAllocator;
