//! One-time session nonce
//!
//! The reverse 9p listener lives on the remote host's loopback interface,
//! where any local process could reach it. The nonce restricts the listener
//! to the one remote process we started: the client generates it, passes it
//! to the remote command through the environment, and the namespace gate
//! refuses every connection that does not present it.
//!
//! # Security Model
//!
//! - 16 bytes from the OS random source, hex-encoded (32 chars)
//! - generated exactly once per session, never reused, never persisted
//! - redacted from `Debug` output so it cannot leak into logs

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::SecretError;

/// Length of the nonce in raw bytes (before hex encoding).
pub const NONCE_BYTES: usize = 16;

/// Length of the printable nonce in characters.
pub const NONCE_LEN: usize = NONCE_BYTES * 2;

/// A one-time printable token authenticating the reverse tunnel's users.
#[derive(Clone, PartialEq, Eq)]
pub struct Nonce(String);

impl Nonce {
    /// Generate a fresh nonce from the OS random source.
    ///
    /// Fails if the random source fails; there is no weaker fallback.
    pub fn generate() -> Result<Self, SecretError> {
        let mut bytes = [0u8; NONCE_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(SecretError::RandomSource)?;
        Ok(Self(hex::encode(bytes)))
    }

    /// The printable nonce value, for transmission to the remote process.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check a value presented by a peer against this nonce.
    pub fn matches(&self, presented: &[u8]) -> bool {
        // Both sides are fixed-length; compare without early exit on length.
        presented.len() == NONCE_LEN && presented == self.0.as_bytes()
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Nonce(..)")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn nonce_is_fixed_length_hex() {
        let n = Nonce::generate().unwrap();
        assert_eq!(n.expose().len(), NONCE_LEN);
        assert!(n.expose().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(n
            .expose()
            .chars()
            .all(|c| !c.is_ascii_uppercase() && !c.is_whitespace() && !c.is_control()));
    }

    #[test]
    fn nonces_do_not_repeat() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let n = Nonce::generate().unwrap();
            assert!(seen.insert(n.expose().to_string()), "duplicate nonce");
        }
    }

    #[test]
    fn matches_exact_value_only() {
        let n = Nonce::generate().unwrap();
        assert!(n.matches(n.expose().as_bytes()));
        assert!(!n.matches(b""));
        assert!(!n.matches(&n.expose().as_bytes()[..NONCE_LEN - 1]));
        let mut flipped = n.expose().as_bytes().to_vec();
        flipped[0] = if flipped[0] == b'0' { b'1' } else { b'0' };
        assert!(!n.matches(&flipped));
    }

    #[test]
    fn debug_output_is_redacted() {
        let n = Nonce::generate().unwrap();
        let dbg = format!("{:?}", n);
        assert_eq!(dbg, "Nonce(..)");
        assert!(!dbg.contains(n.expose()));
    }
}
