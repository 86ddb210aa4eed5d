//! The archive key derivation function.
//!
//! Keyed BLAKE2b with a fixed format personalisation; domain separation
//! happens through the input strings listed in [`domains`].

use crate::error::{ErrorKind, Result};

/// BLAKE2b personalisation shared by every derivation in the format.
const PERSONALIZATION: [u8; 16] = [
    0x76, 0x65, 0x66, 0x73, 0xa4, 0xa1, 0x5f, 0x44, 0xac, 0x08, 0x45, 0x31,
    0x8d, 0x08, 0xd1, 0x33,
];

/// Domain separation strings baked into the format.
pub(crate) mod domains {
    pub const STATIC_HEADER_PRK: &[u8] = b"vefs/prk/StaticArchiveHeaderPRK";
    pub const STATIC_HEADER_SALT: &[u8] =
        b"vefs/salt/StaticArchiveHeaderWriteCounter";
    pub const ARCHIVE_HEADER_PRK: &[u8] = b"vefs/prk/ArchiveHeaderPRK";
    pub const ARCHIVE_HEADER_SALT: &[u8] = b"vefs/salt/ArchiveSecretCounter";
    pub const ARCHIVE_SECRET_COUNTER_SEED: &[u8] =
        b"vefs/seed/ArchiveSecretCounter";
    pub const JOURNAL_COUNTER_SEED: &[u8] = b"vefs/seed/JournalCounter";
    pub const SECTOR_PRK: &[u8] = b"vefs/prk/SectorPRK";
    pub const SECTOR_SALT: &[u8] = b"vefs/salt/Sector-Salt";
    pub const SECTOR_ERASE: &[u8] = b"vefs/erase/Sector";
    pub const FILE_SECRET_SEED: &[u8] = b"vefs/seed/FileSecret";
    pub const FILE_COUNTER_SEED: &[u8] = b"vefs/seed/FileSecretCounter";
}

/// Derives `out.len()` bytes from `input_key` and the given domain parts.
///
/// `out` must be between 1 and 64 bytes, `input_key` at most 64 bytes.
pub fn kdf(out: &mut [u8], input_key: &[u8], parts: &[&[u8]]) -> Result<()> {
    if out.is_empty() || out.len() > blake2b_simd::OUTBYTES {
        return Err(ErrorKind::InvalidArgument.into());
    }
    if input_key.len() > blake2b_simd::KEYBYTES {
        return Err(ErrorKind::InvalidArgument.into());
    }

    let mut params = blake2b_simd::Params::new();
    params
        .hash_length(out.len())
        .key(input_key)
        .personal(&PERSONALIZATION);

    let mut state = params.to_state();
    for part in parts {
        state.update(part);
    }
    out.copy_from_slice(state.finalize().as_bytes());
    Ok(())
}
