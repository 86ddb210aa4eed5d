//! An authenticated, encrypted virtual file system in a single file.
//!
//! A host file holds an archive containing many logical files, each
//! identified by a UTF-8 path. Reads and writes are transparently
//! encrypted, integrity-checked and striped across fixed-size sectors;
//! metadata updates are crash-tolerant through header double-buffering, and
//! leaked sectors are recoverable.
//!
//! ```no_run
//! use vefs::{Archive, CreationMode, OpenMode};
//!
//! # fn main() -> vefs::Result<()> {
//! let user_prk = [0u8; 32];
//! let archive = Archive::open("data.vefs", &user_prk, CreationMode::IfNeeded)?;
//! let file = archive.open_file("notes.txt", OpenMode::read_write() | OpenMode::CREATE)?;
//! archive.write(&file, b"hello", 0)?;
//! archive.commit()?;
//! # Ok(())
//! # }
//! ```

mod archive;
mod descriptor;
mod vfile;
mod vfilesystem;
mod workers;

pub use archive::{Archive, BackupMode, CreationMode};
pub use vfile::{VFile, VFileHandle};
pub use vfilesystem::{FileQueryResult, OpenMode, VFilesystem};
pub use workers::WorkerPool;

pub use vefs_storage::error::{Error, ErrorKind, Result};
pub use vefs_storage::id::{FileId, SectorId};
pub use vefs_storage::{SECTOR_PAYLOAD_SIZE, SECTOR_SIZE};
