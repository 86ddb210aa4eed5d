//! Fixed parameters of the on-disk format.

/// Size of one archive sector in bytes, including the in-sector salt prefix.
pub const SECTOR_SIZE: usize = 1 << 15;

/// Number of payload bytes per sector; the first 32 bytes of every sector on
/// disk hold the encryption salt.
pub const SECTOR_PAYLOAD_SIZE: usize = SECTOR_SIZE - (1 << 5);

/// Size of the per-sector salt prefix.
pub const SECTOR_SALT_SIZE: usize = 32;

/// Size of an AEAD authentication tag.
pub const MAC_SIZE: usize = 16;

/// Size of a derived AEAD key + nonce bundle (32 byte key, 12 byte nonce).
pub const KEY_NONCE_SIZE: usize = 44;

/// Byte offset of the first rotating archive header slot within the master
/// sector.
pub const ARCHIVE_HEADER_OFFSET: usize = 1 << 13;

/// Size of the plaintext personalization area at the end of the master
/// sector.
pub const PERSONALIZATION_AREA_SIZE: usize = 1 << 12;

/// Size of one rotating archive header slot. Both slots live between the
/// static header region and the personalization area.
pub const ARCHIVE_HEADER_SIZE: usize =
    (SECTOR_SIZE - ARCHIVE_HEADER_OFFSET - PERSONALIZATION_AREA_SIZE) / 2;

/// The four magic bytes every archive starts with.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"vefs";
