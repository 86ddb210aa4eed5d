//! Shared helpers for the vefs command line tools.

/// Derives the 32-byte user PRK from a passphrase.
///
/// Tooling convenience only; API consumers are expected to provide a
/// properly derived key themselves.
pub fn user_prk_from_passphrase(passphrase: &str) -> [u8; 32] {
    let hash = blake2b_simd::Params::new()
        .hash_length(32)
        .personal(b"vefsctl/userprk!")
        .to_state()
        .update(passphrase.as_bytes())
        .finalize();
    let mut prk = [0u8; 32];
    prk.copy_from_slice(hash.as_bytes());
    prk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prk_derivation_is_stable_and_keyed() {
        let a = user_prk_from_passphrase("correct horse");
        let b = user_prk_from_passphrase("correct horse");
        let c = user_prk_from_passphrase("battery staple");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
