//! Per-file encryption state.

use crate::constants::{
    KEY_NONCE_SIZE, MAC_SIZE, SECTOR_PAYLOAD_SIZE, SECTOR_SALT_SIZE,
    SECTOR_SIZE,
};
use crate::crypto::counter::{AtomicCounter, Counter};
use crate::crypto::kdf::{domains, kdf};
use crate::crypto::provider::CryptoProvider;
use crate::error::{ErrorKind, Result};
use crate::util::SecretBytes;

/// Secret and write counter of one logical file.
///
/// The counter provides the unique per-sector nonce; it is advanced on every
/// sector seal and persisted alongside the file so reopening the archive can
/// never reuse a nonce.
pub struct FileCryptoCtx {
    secret: SecretBytes<32>,
    write_counter: AtomicCounter,
}

impl FileCryptoCtx {
    pub fn new(secret: [u8; 32], counter: Counter) -> Self {
        FileCryptoCtx {
            secret: SecretBytes::new(secret),
            write_counter: AtomicCounter::new(counter),
        }
    }

    pub fn zeroed() -> Self {
        FileCryptoCtx {
            secret: SecretBytes::zeroed(),
            write_counter: AtomicCounter::default(),
        }
    }

    /// Snapshot of the secret and the current counter, for serialization
    /// into headers and directory entries.
    pub fn state(&self) -> ([u8; 32], Counter) {
        (*self.secret, self.write_counter.load())
    }

    /// Encrypts one sector payload into `ciphertext` (salt prefix followed
    /// by the sealed payload) and emits the tag.
    pub fn seal_sector(
        &self,
        ciphertext: &mut [u8],
        mac: &mut [u8; MAC_SIZE],
        provider: &dyn CryptoProvider,
        session_salt: &[u8; 16],
        data: &[u8],
    ) -> Result<()> {
        if ciphertext.len() != SECTOR_SIZE || data.len() != SECTOR_PAYLOAD_SIZE
        {
            return Err(ErrorKind::InvalidArgument.into());
        }

        let nonce = self.write_counter.fetch_increment();
        let (salt, body) = ciphertext.split_at_mut(SECTOR_SALT_SIZE);
        kdf(
            salt,
            &nonce.to_le_bytes(),
            &[domains::SECTOR_SALT, session_salt],
        )?;

        let mut key_nonce = SecretBytes::<KEY_NONCE_SIZE>::zeroed();
        kdf(&mut *key_nonce, &*self.secret, &[domains::SECTOR_PRK, salt])?;

        body.copy_from_slice(data);
        provider.seal_in_place(body, mac, &key_nonce)
    }

    /// Decrypts one sector read from disk (`ciphertext` is the full sector,
    /// salt prefix included) into `data`.
    pub fn unseal_sector(
        &self,
        data: &mut [u8],
        provider: &dyn CryptoProvider,
        ciphertext: &[u8],
        mac: &[u8; MAC_SIZE],
    ) -> Result<()> {
        if ciphertext.len() != SECTOR_SIZE || data.len() != SECTOR_PAYLOAD_SIZE
        {
            return Err(ErrorKind::InvalidArgument.into());
        }

        let (salt, body) = ciphertext.split_at(SECTOR_SALT_SIZE);
        let mut key_nonce = SecretBytes::<KEY_NONCE_SIZE>::zeroed();
        kdf(&mut *key_nonce, &*self.secret, &[domains::SECTOR_PRK, salt])?;

        data.copy_from_slice(body);
        provider.open_in_place(data, &key_nonce, mac)
    }
}

impl std::fmt::Debug for FileCryptoCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCryptoCtx").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::provider::only_mac_crypto_provider;

    #[test]
    fn sealed_sector_unseals_with_stored_salt() {
        let ctx = FileCryptoCtx::new([7u8; 32], Counter::ZERO);
        let provider = only_mac_crypto_provider();
        let session_salt = [3u8; 16];

        let mut payload = vec![0u8; SECTOR_PAYLOAD_SIZE];
        payload[..4].copy_from_slice(b"data");

        let mut sector = vec![0u8; SECTOR_SIZE];
        let mut mac = [0u8; MAC_SIZE];
        ctx.seal_sector(&mut sector, &mut mac, provider, &session_salt, &payload)
            .unwrap();

        let mut recovered = vec![0u8; SECTOR_PAYLOAD_SIZE];
        ctx.unseal_sector(&mut recovered, provider, &sector, &mac)
            .unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn every_seal_advances_the_nonce_counter() {
        let ctx = FileCryptoCtx::new([7u8; 32], Counter::ZERO);
        let provider = only_mac_crypto_provider();
        let payload = vec![0u8; SECTOR_PAYLOAD_SIZE];

        let mut first = vec![0u8; SECTOR_SIZE];
        let mut second = vec![0u8; SECTOR_SIZE];
        let mut mac = [0u8; MAC_SIZE];
        ctx.seal_sector(&mut first, &mut mac, provider, &[0; 16], &payload)
            .unwrap();
        ctx.seal_sector(&mut second, &mut mac, provider, &[0; 16], &payload)
            .unwrap();
        // identical payloads must never share a salt
        assert_ne!(first[..32], second[..32]);
        let (_, counter) = ctx.state();
        assert_eq!(counter, Counter::ZERO.incremented().incremented());
    }
}
