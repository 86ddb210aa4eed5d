//! On-disk engine of the vefs encrypted archive format.
//!
//! An archive is a single host file that contains many logical files. Every
//! logical file is stored as a copy-on-write Merkle tree of fixed-size
//! encrypted sectors; this crate owns everything below the directory layer:
//! the sector device with its double-buffered headers, the sector allocators,
//! the pinning sector cache and the two sector tree implementations.
//!
//! The archive surface (virtual files, the path directory, the public API)
//! lives in the `vefs` crate on top of these primitives.

pub mod alloc;
pub mod cache;
pub mod constants;
pub mod crypto;
pub mod device;
pub mod error;
pub mod id;
pub mod tree;
pub mod util;

pub use constants::{SECTOR_PAYLOAD_SIZE, SECTOR_SIZE};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use id::{FileId, SectorId};
