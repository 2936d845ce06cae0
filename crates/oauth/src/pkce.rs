//! PKCE (Proof Key for Code Exchange) helpers.
//!
//! RFC 7636: https://tools.ietf.org/html/rfc7636

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    rand::RngCore,
    sha2::{Digest, Sha256},
};

use crate::types::PkceChallenge;

const ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Verifier length; RFC 7636 allows 43 to 128 characters.
pub const VERIFIER_LENGTH: usize = 64;

/// Random alphanumeric string of exactly `length` characters.
///
/// Each byte from the thread-local CSPRNG is reduced modulo 62, so the first
/// eight symbols are very slightly more likely than the rest.
pub fn generate_random_string(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::rng().fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| char::from(ALPHABET[usize::from(*b) % ALPHABET.len()]))
        .collect()
}

/// SHA-256 of the UTF-8 bytes of `plain`.
pub fn sha256(plain: &str) -> [u8; 32] {
    Sha256::digest(plain.as_bytes()).into()
}

/// Base64url without padding.
pub fn base64_url_encode(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

pub fn generate_verifier() -> String {
    generate_random_string(VERIFIER_LENGTH)
}

impl PkceChallenge {
    /// Derive the S256 challenge for an existing verifier.
    pub fn from_verifier(verifier: impl Into<String>) -> Self {
        let verifier = verifier.into();
        let challenge = base64_url_encode(&sha256(&verifier));
        Self {
            verifier,
            challenge,
        }
    }

    pub fn generate() -> Self {
        Self::from_verifier(generate_verifier())
    }
}
