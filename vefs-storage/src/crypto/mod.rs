//! Cryptographic plumbing: key derivation, nonce counters and the AEAD
//! provider abstraction.

mod counter;
mod file_ctx;
mod kdf;
mod provider;

pub use counter::{AtomicCounter, Counter};
pub use file_ctx::FileCryptoCtx;
pub use kdf::kdf;
pub(crate) use kdf::domains;
pub use provider::{
    ct_compare, only_mac_crypto_provider, AesGcmProvider, CryptoProvider,
    OnlyMacProvider,
};
