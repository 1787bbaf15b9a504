//! MD5 helpers for the OTA protocol.
//!
//! The wire never carries raw digests: nonces, challenge results and the
//! firmware checksum are all 32 lowercase ASCII hex characters.

use std::fmt;

use md5::{Digest, Md5};

use super::constants::HEX_DIGEST_LEN;

/// A 32-character ASCII hex digest as it travels on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HexDigest([u8; HEX_DIGEST_LEN]);

impl HexDigest {
    /// Wrap 32 bytes received from a peer. No validation is done here so
    /// that a malformed peer response still compares byte-for-byte.
    pub fn from_wire(bytes: [u8; HEX_DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a hex string of exactly 32 characters.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes: [u8; HEX_DIGEST_LEN] = s.as_bytes().try_into().ok()?;
        Some(Self(bytes))
    }

    fn from_raw(raw: &[u8]) -> Self {
        let mut out = [0u8; HEX_DIGEST_LEN];
        // hex::encode_to_slice only fails on a length mismatch, which the
        // 16-byte MD5 output rules out.
        let _ = hex::encode_to_slice(raw, &mut out);
        Self(out)
    }

    /// Wire bytes.
    pub fn as_bytes(&self) -> &[u8; HEX_DIGEST_LEN] {
        &self.0
    }

    /// Hex text, if the bytes are ASCII.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("<non-ascii>")
    }

    /// Decode into the 16 raw digest bytes. Accepts either case.
    pub fn to_raw(&self) -> Option<[u8; 16]> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(self.0, &mut out).ok()?;
        Some(out)
    }
}

impl fmt::Debug for HexDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexDigest({})", self.as_str())
    }
}

impl fmt::Display for HexDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MD5 of `data`, hex encoded.
pub fn md5_hex(data: &[u8]) -> HexDigest {
    HexDigest::from_raw(&Md5::digest(data))
}

/// Expected answer to an authentication challenge:
/// `MD5(password ‖ server_nonce ‖ client_nonce)`.
pub fn challenge_response(password: &str, nonce: &HexDigest, cnonce: &HexDigest) -> HexDigest {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(cnonce.as_bytes());
    HexDigest::from_raw(&hasher.finalize())
}

/// Nonce derived from a 32-bit seed: the MD5 of its 8-digit uppercase hex form.
pub fn nonce_from_seed(seed: u32) -> HexDigest {
    md5_hex(format!("{:08X}", seed).as_bytes())
}

/// Incremental MD5 used while firmware bytes stream in.
#[derive(Clone, Default)]
pub struct RunningMd5 {
    hasher: Md5,
}

impl RunningMd5 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish and return the raw digest, resetting the state.
    pub fn finalize_reset(&mut self) -> [u8; 16] {
        self.hasher.finalize_reset().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex_known_vector() {
        assert_eq!(md5_hex(b"").as_str(), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"abc").as_str(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_challenge_is_md5_of_concatenation() {
        let nonce = md5_hex(b"n");
        let cnonce = md5_hex(b"c");
        let mut joined = b"secret".to_vec();
        joined.extend_from_slice(nonce.as_bytes());
        joined.extend_from_slice(cnonce.as_bytes());

        assert_eq!(challenge_response("secret", &nonce, &cnonce), md5_hex(&joined));
    }

    #[test]
    fn test_to_raw_accepts_uppercase() {
        let lower = md5_hex(b"abc");
        let upper = HexDigest::parse(&lower.as_str().to_uppercase()).unwrap();
        assert_eq!(lower.to_raw(), upper.to_raw());
        assert!(HexDigest::parse("zz").is_none());
        assert!(HexDigest::from_wire([b'g'; 32]).to_raw().is_none());
    }

    #[test]
    fn test_nonce_from_seed_is_deterministic() {
        assert_eq!(nonce_from_seed(0xDEADBEEF), md5_hex(b"DEADBEEF"));
    }

    #[test]
    fn test_running_md5_matches_one_shot() {
        let mut running = RunningMd5::new();
        running.update(b"hello ");
        running.update(b"world");
        assert_eq!(Some(running.finalize_reset()), md5_hex(b"hello world").to_raw());
    }
}
