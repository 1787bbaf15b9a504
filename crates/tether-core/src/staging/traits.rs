use thiserror::Error;

use crate::protocol::{HexDigest, RunningMd5};

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Update size must be non-zero")]
    ZeroSize,

    #[error("Update of {size} bytes exceeds available space ({max} bytes)")]
    TooLarge { size: u32, max: u64 },

    #[error("Staged write already in progress")]
    AlreadyStarted,

    #[error("No staged write in progress")]
    NotStarted,

    #[error("Invalid checksum {0:?}")]
    InvalidChecksum(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Incomplete image: {written} of {size} bytes")]
    Incomplete { written: u64, size: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A flash-like target that stages an update and commits it atomically.
pub trait UpdateTarget {
    /// Prepare to receive `size` bytes.
    fn begin(&mut self, size: u32) -> Result<(), StagingError>;

    /// Register the checksum the finished image must have.
    fn set_expected_md5(&mut self, md5: &HexDigest) -> Result<(), StagingError>;

    /// Write a chunk. Returns how many bytes were accepted; fewer than
    /// `data.len()` means the write was short.
    fn write(&mut self, data: &[u8]) -> Result<usize, StagingError>;

    /// All declared bytes have been written.
    fn is_finished(&self) -> bool;

    /// Validate and commit the staged image.
    fn end(&mut self) -> Result<(), StagingError>;

    /// Discard the staged image. Safe to call at any time.
    fn abort(&mut self);

    /// Bytes written so far in the current staged write.
    fn written(&self) -> u64;
}

/// Size and checksum bookkeeping shared by the target implementations.
#[derive(Default)]
pub struct StageTracker {
    size: Option<u32>,
    written: u64,
    md5: RunningMd5,
    expected: Option<[u8; 16]>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new image, checking it against `max` bytes of space.
    pub fn begin(&mut self, size: u32, max: u64) -> Result<(), StagingError> {
        if self.size.is_some() {
            return Err(StagingError::AlreadyStarted);
        }
        if size == 0 {
            return Err(StagingError::ZeroSize);
        }
        if u64::from(size) > max {
            return Err(StagingError::TooLarge { size, max });
        }
        *self = Self {
            size: Some(size),
            ..Self::default()
        };
        Ok(())
    }

    pub fn set_expected(&mut self, md5: &HexDigest) -> Result<(), StagingError> {
        self.size.ok_or(StagingError::NotStarted)?;
        let raw = md5
            .to_raw()
            .ok_or_else(|| StagingError::InvalidChecksum(md5.as_str().to_string()))?;
        self.expected = Some(raw);
        Ok(())
    }

    /// How many bytes of `len` fit in the remaining declared size.
    pub fn accept(&self, len: usize) -> Result<usize, StagingError> {
        let size = self.size.ok_or(StagingError::NotStarted)?;
        let remaining = u64::from(size).saturating_sub(self.written);
        Ok(len.min(remaining as usize))
    }

    /// Record bytes that were durably written.
    pub fn record(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.written += data.len() as u64;
    }

    pub fn is_started(&self) -> bool {
        self.size.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.size
            .is_some_and(|size| self.written == u64::from(size))
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Check completeness and checksum. Leaves the tracker reset.
    pub fn finish(&mut self) -> Result<(), StagingError> {
        let size = self.size.ok_or(StagingError::NotStarted)?;
        let written = self.written;
        let expected = self.expected;
        let actual = self.md5.finalize_reset();
        self.reset();

        if written != u64::from(size) {
            return Err(StagingError::Incomplete { written, size });
        }
        if let Some(expected) = expected {
            if expected != actual {
                return Err(StagingError::ChecksumMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::md5_hex;

    #[test]
    fn test_tracker_limits_and_checksum() {
        let mut t = StageTracker::new();
        assert!(matches!(t.begin(0, 100), Err(StagingError::ZeroSize)));
        assert!(matches!(t.begin(101, 100), Err(StagingError::TooLarge { .. })));

        t.begin(4, 100).unwrap();
        t.set_expected(&md5_hex(b"abcd")).unwrap();
        assert_eq!(t.accept(10).unwrap(), 4);
        t.record(b"abcd");
        assert!(t.is_finished());
        assert_eq!(t.accept(1).unwrap(), 0);
        t.finish().unwrap();
        assert!(!t.is_started());
    }

    #[test]
    fn test_tracker_mismatch() {
        let mut t = StageTracker::new();
        t.begin(3, 100).unwrap();
        t.set_expected(&md5_hex(b"xyz")).unwrap();
        t.record(b"abc");
        assert!(matches!(
            t.finish(),
            Err(StagingError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_tracker_rejects_non_hex_checksum() {
        let mut t = StageTracker::new();
        t.begin(3, 100).unwrap();
        let bad = HexDigest::from_wire([b'q'; 32]);
        assert!(matches!(
            t.set_expected(&bad),
            Err(StagingError::InvalidChecksum(_))
        ));
    }

    #[test]
    fn test_tracker_incomplete() {
        let mut t = StageTracker::new();
        t.begin(8, 100).unwrap();
        t.record(b"abc");
        assert!(matches!(
            t.finish(),
            Err(StagingError::Incomplete { written: 3, size: 8 })
        ));
    }
}
