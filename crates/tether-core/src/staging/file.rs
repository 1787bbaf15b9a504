//! Filesystem staging target for host deployments.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::traits::{StageTracker, StagingError, UpdateTarget};
use crate::protocol::HexDigest;

const PART_FILE: &str = "firmware.bin.part";
const IMAGE_FILE: &str = "firmware.bin";

/// Writes the image to `<dir>/firmware.bin.part` and renames it to
/// `<dir>/firmware.bin` once it validates.
pub struct FileTarget {
    dir: PathBuf,
    max_size: u64,
    file: Option<File>,
    tracker: StageTracker,
}

impl FileTarget {
    pub fn new<P: AsRef<Path>>(dir: P, max_size: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_size,
            file: None,
            tracker: StageTracker::new(),
        }
    }

    /// Path of the last committed image.
    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE_FILE)
    }

    fn part_path(&self) -> PathBuf {
        self.dir.join(PART_FILE)
    }
}

impl UpdateTarget for FileTarget {
    fn begin(&mut self, size: u32) -> Result<(), StagingError> {
        self.tracker.begin(size, self.max_size)?;
        let opened = fs::create_dir_all(&self.dir).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.part_path())
        });
        match opened {
            Ok(file) => {
                debug!(path = %self.part_path().display(), size = size, "Staging file opened");
                self.file = Some(file);
                Ok(())
            }
            Err(e) => {
                self.tracker.reset();
                Err(e.into())
            }
        }
    }

    fn set_expected_md5(&mut self, md5: &HexDigest) -> Result<(), StagingError> {
        self.tracker.set_expected(md5)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StagingError> {
        let n = self.tracker.accept(data.len())?;
        let file = self.file.as_mut().ok_or(StagingError::NotStarted)?;
        file.write_all(&data[..n])?;
        self.tracker.record(&data[..n]);
        Ok(n)
    }

    fn is_finished(&self) -> bool {
        self.tracker.is_finished()
    }

    fn end(&mut self) -> Result<(), StagingError> {
        let file = self.file.take().ok_or(StagingError::NotStarted)?;
        let result = file
            .sync_all()
            .map_err(StagingError::from)
            .and_then(|_| self.tracker.finish());
        drop(file);

        match result {
            Ok(()) => {
                fs::rename(self.part_path(), self.image_path())?;
                info!(path = %self.image_path().display(), "Staged image committed");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(self.part_path());
                Err(e)
            }
        }
    }

    fn abort(&mut self) {
        self.tracker.reset();
        if self.file.take().is_some() {
            if let Err(e) = fs::remove_file(self.part_path()) {
                warn!(error = %e, "Failed to remove partial image");
            } else {
                debug!("Partial image discarded");
            }
        }
    }

    fn written(&self) -> u64 {
        self.tracker.written()
    }
}
