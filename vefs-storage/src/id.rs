//! Identifiers for physical sectors and logical files.

use std::fmt;

use uuid::Uuid;

use crate::constants::SECTOR_SIZE;

/// Identifies a physical sector within the host file. Id `0` is the master
/// sector holding the archive headers; payload sectors start at id `1`.
///
/// A zero id doubles as the "unallocated" marker inside sector references.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SectorId(u64);

impl SectorId {
    pub const MASTER: SectorId = SectorId(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        SectorId(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_master(self) -> bool {
        self.0 == 0
    }

    /// Byte offset of this sector within the host file.
    #[inline]
    pub const fn byte_offset(self) -> u64 {
        self.0 * SECTOR_SIZE as u64
    }
}

impl fmt::Debug for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIDX:{:04x}", self.0)
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIDX:{:04x}", self.0)
    }
}

/// Identifies a logical file within the archive.
///
/// Regular files carry random version-4 UUIDs; the directory and the
/// free-sector index use the two reserved identifiers below.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Uuid);

impl FileId {
    pub const ARCHIVE_INDEX: FileId = FileId(Uuid::from_bytes([
        0xba, 0x22, 0xb0, 0x33, 0x4b, 0xa8, 0x4e, 0x5b, 0x83, 0x0c, 0xbf, 0x48,
        0x94, 0xaf, 0x53, 0xf8,
    ]));
    pub const FREE_SECTOR_INDEX: FileId = FileId(Uuid::from_bytes([
        0x33, 0x38, 0xbe, 0x54, 0x6b, 0x02, 0x49, 0x24, 0x9f, 0xcc, 0x56, 0x3d,
        0x7e, 0xe6, 0x81, 0xe6,
    ]));

    /// Mints a fresh random file id.
    pub fn generate() -> Self {
        FileId(Uuid::new_v4())
    }

    pub const fn from_bytes(raw: [u8; 16]) -> Self {
        FileId(Uuid::from_bytes(raw))
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
