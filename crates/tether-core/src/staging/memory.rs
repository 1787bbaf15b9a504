//! In-memory staging target for testing.

use super::traits::{StageTracker, StagingError, UpdateTarget};
use crate::protocol::HexDigest;

/// Staging target backed by a `Vec`, with injectable failures.
pub struct MemoryTarget {
    capacity: u64,
    buffer: Vec<u8>,
    tracker: StageTracker,
    committed: Option<Vec<u8>>,
    aborts: usize,
    /// Accept at most this many bytes in total before writes go short.
    flash_limit: Option<u64>,
    fail_end: bool,
}

impl MemoryTarget {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            buffer: Vec::new(),
            tracker: StageTracker::new(),
            committed: None,
            aborts: 0,
            flash_limit: None,
            fail_end: false,
        }
    }

    /// Simulate a flash failure after `bytes` have been written.
    pub fn fail_writes_after(mut self, bytes: u64) -> Self {
        self.flash_limit = Some(bytes);
        self
    }

    /// Make `end()` fail even for a valid image.
    pub fn fail_end(mut self) -> Self {
        self.fail_end = true;
        self
    }

    /// Last committed image.
    pub fn committed(&self) -> Option<&[u8]> {
        self.committed.as_deref()
    }

    /// Number of times a staged write was discarded.
    pub fn aborts(&self) -> usize {
        self.aborts
    }

    /// Whether a staged write is currently open.
    pub fn in_progress(&self) -> bool {
        self.tracker.is_started()
    }
}

impl UpdateTarget for MemoryTarget {
    fn begin(&mut self, size: u32) -> Result<(), StagingError> {
        self.tracker.begin(size, self.capacity)?;
        self.buffer.clear();
        Ok(())
    }

    fn set_expected_md5(&mut self, md5: &HexDigest) -> Result<(), StagingError> {
        self.tracker.set_expected(md5)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StagingError> {
        let mut n = self.tracker.accept(data.len())?;
        if let Some(limit) = self.flash_limit {
            let room = limit.saturating_sub(self.tracker.written());
            n = n.min(room as usize);
        }
        self.buffer.extend_from_slice(&data[..n]);
        self.tracker.record(&data[..n]);
        Ok(n)
    }

    fn is_finished(&self) -> bool {
        self.tracker.is_finished()
    }

    fn end(&mut self) -> Result<(), StagingError> {
        if self.fail_end {
            self.abort();
            return Err(StagingError::Io(std::io::Error::other("simulated commit failure")));
        }
        match self.tracker.finish() {
            Ok(()) => {
                self.committed = Some(std::mem::take(&mut self.buffer));
                Ok(())
            }
            Err(e) => {
                self.buffer.clear();
                Err(e)
            }
        }
    }

    fn abort(&mut self) {
        if self.tracker.is_started() {
            self.aborts += 1;
        }
        self.tracker.reset();
        self.buffer.clear();
    }

    fn written(&self) -> u64 {
        self.tracker.written()
    }
}
