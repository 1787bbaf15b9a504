//! Nonce generation for the authentication challenge.

use crate::protocol::{HexDigest, nonce_from_seed};

/// Source of 32-bit seeds from which nonces are derived.
pub trait NonceSource: Send {
    /// Next seed, or `None` if no randomness is available.
    fn next_seed(&mut self) -> Option<u32>;

    fn next_nonce(&mut self) -> Option<HexDigest> {
        self.next_seed().map(nonce_from_seed)
    }
}

/// Seeds from the operating system's random source.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNonce;

impl NonceSource for RandomNonce {
    fn next_seed(&mut self) -> Option<u32> {
        let mut bytes = [0u8; 4];
        getrandom::fill(&mut bytes).ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

/// Always returns the same seed.
#[derive(Debug, Clone, Copy)]
pub struct FixedNonce(pub u32);

impl NonceSource for FixedNonce {
    fn next_seed(&mut self) -> Option<u32> {
        Some(self.0)
    }
}
