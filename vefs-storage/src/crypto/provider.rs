//! AEAD provider abstraction and its two implementations.

use std::cmp::Ordering;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::constants::{KEY_NONCE_SIZE, MAC_SIZE};
use crate::error::{Error, ErrorKind, Result};

/// Sealed-box primitive used for sectors and headers.
///
/// `key_nonce` is a derived 44-byte bundle: a 32-byte key followed by a
/// 12-byte nonce. Sealing and opening operate in place on the data buffer;
/// the 16-byte tag travels separately (it is stored in the parent reference
/// or the header prefix, never inside the sealed payload).
pub trait CryptoProvider: Send + Sync {
    fn seal_in_place(
        &self,
        data: &mut [u8],
        tag_out: &mut [u8; MAC_SIZE],
        key_nonce: &[u8; KEY_NONCE_SIZE],
    ) -> Result<()>;

    fn open_in_place(
        &self,
        data: &mut [u8],
        key_nonce: &[u8; KEY_NONCE_SIZE],
        tag: &[u8; MAC_SIZE],
    ) -> Result<()>;

    fn random_bytes(&self, out: &mut [u8]) -> Result<()>;
}

/// Production provider: AES-256-GCM with detached tags.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmProvider;

impl CryptoProvider for AesGcmProvider {
    fn seal_in_place(
        &self,
        data: &mut [u8],
        tag_out: &mut [u8; MAC_SIZE],
        key_nonce: &[u8; KEY_NONCE_SIZE],
    ) -> Result<()> {
        let (key, nonce) = key_nonce.split_at(32);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), &[], data)
            .map_err(|_| ErrorKind::InvalidArgument)?;
        tag_out.copy_from_slice(&tag);
        Ok(())
    }

    fn open_in_place(
        &self,
        data: &mut [u8],
        key_nonce: &[u8; KEY_NONCE_SIZE],
        tag: &[u8; MAC_SIZE],
    ) -> Result<()> {
        let (key, nonce) = key_nonce.split_at(32);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &[],
                data,
                Tag::from_slice(tag),
            )
            .map_err(|_| ErrorKind::TagMismatch)?;
        Ok(())
    }

    fn random_bytes(&self, out: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(out)
            .map_err(|err| Error::new(ErrorKind::Io).with_source(err))
    }
}

/// Deterministic test provider: authenticates but does not encrypt.
///
/// The tag is a keyed BLAKE2b MAC over nonce and payload; the payload is
/// stored verbatim. Only reachable from test code, never selected by the
/// archive API.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnlyMacProvider;

impl OnlyMacProvider {
    fn mac(
        data: &[u8],
        key_nonce: &[u8; KEY_NONCE_SIZE],
    ) -> [u8; MAC_SIZE] {
        let (key, nonce) = key_nonce.split_at(32);
        let mut params = blake2b_simd::Params::new();
        params.hash_length(MAC_SIZE).key(key);
        let mut state = params.to_state();
        state.update(nonce);
        state.update(data);
        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(state.finalize().as_bytes());
        tag
    }
}

impl CryptoProvider for OnlyMacProvider {
    fn seal_in_place(
        &self,
        data: &mut [u8],
        tag_out: &mut [u8; MAC_SIZE],
        key_nonce: &[u8; KEY_NONCE_SIZE],
    ) -> Result<()> {
        *tag_out = Self::mac(data, key_nonce);
        Ok(())
    }

    fn open_in_place(
        &self,
        data: &mut [u8],
        key_nonce: &[u8; KEY_NONCE_SIZE],
        tag: &[u8; MAC_SIZE],
    ) -> Result<()> {
        let expected = Self::mac(data, key_nonce);
        let mut diff = 0u8;
        for (a, b) in expected.iter().zip(tag.iter()) {
            diff |= a ^ b;
        }
        if diff != 0 {
            return Err(ErrorKind::TagMismatch.into());
        }
        Ok(())
    }

    fn random_bytes(&self, out: &mut [u8]) -> Result<()> {
        AesGcmProvider.random_bytes(out)
    }
}

/// The deterministic test provider as a shared reference.
pub fn only_mac_crypto_provider() -> &'static dyn CryptoProvider {
    static PROVIDER: OnlyMacProvider = OnlyMacProvider;
    &PROVIDER
}

/// Constant-time comparison of two little-endian 128-bit counter images.
pub fn ct_compare(lhs: &[u8; 16], rhs: &[u8; 16]) -> Ordering {
    let mut gt: u32 = 0;
    let mut lt: u32 = 0;
    let mut eq: u32 = 1;
    for i in (0..16).rev() {
        let a = lhs[i] as i32;
        let b = rhs[i] as i32;
        // 1 iff a > b / a < b, without data-dependent branches
        let a_gt_b = (((b - a) >> 31) & 1) as u32;
        let a_lt_b = (((a - b) >> 31) & 1) as u32;
        gt |= eq & a_gt_b;
        lt |= eq & a_lt_b;
        let equal = ((((a ^ b) - 1) >> 31) & 1) as u32;
        eq &= equal;
    }
    if eq == 1 {
        Ordering::Equal
    } else if gt == 1 && lt == 0 {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}
