//! Host-side switch outputs.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::warn;

use super::SwitchHardware;

/// Writes `1` or `0` to a file, e.g. a sysfs GPIO `value` or LED
/// `brightness` attribute.
#[derive(Debug, Clone)]
pub struct FileOutput {
    path: PathBuf,
}

impl FileOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SwitchHardware for FileOutput {
    fn write_state(&mut self, state: bool) {
        let value = if state { "1\n" } else { "0\n" };
        if let Err(e) = std::fs::write(&self.path, value) {
            warn!(path = %self.path.display(), error = %e, "Writing output failed");
        }
    }
}

/// Output that only remembers its level. Clones share it.
#[derive(Debug, Clone, Default)]
pub struct VirtualOutput {
    level: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl VirtualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SwitchHardware for VirtualOutput {
    fn write_state(&mut self, state: bool) {
        self.level.store(state, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_output_writes_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        let mut out = FileOutput::new(&path);
        out.write_state(true);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n");
        out.write_state(false);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0\n");
    }
}
