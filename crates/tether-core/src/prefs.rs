//! Small persisted key/value store for state that must survive a reboot.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreferenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt preference file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Encoding preferences failed: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Preference store unavailable")]
    Unavailable,
}

/// Byte-sized values keyed by a fixed identifier.
pub trait PreferenceStore: Send {
    fn load(&mut self, key: u32) -> Result<Option<u8>, PreferenceError>;

    /// Persist `value`. Returns only once the value is durable.
    fn save(&mut self, key: u32, value: u8) -> Result<(), PreferenceError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PreferenceFile {
    #[serde(default)]
    values: BTreeMap<String, u8>,
}

/// Preferences kept in a TOML file, rewritten atomically on every save.
#[derive(Debug, Clone)]
pub struct FilePreferences {
    path: PathBuf,
}

impl FilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<PreferenceFile, PreferenceError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PreferenceFile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl PreferenceStore for FilePreferences {
    fn load(&mut self, key: u32) -> Result<Option<u8>, PreferenceError> {
        Ok(self.read()?.values.get(&key.to_string()).copied())
    }

    fn save(&mut self, key: u32, value: u8) -> Result<(), PreferenceError> {
        let mut file = self.read()?;
        file.values.insert(key.to_string(), value);
        let content = toml::to_string_pretty(&file)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(content.as_bytes())?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: HashMap<u32, u8>,
    fail: bool,
    saves: usize,
}

/// In-memory store. Clones share values, so a clone handed to a second
/// guard behaves like storage that survived a reboot.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferences {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent load and save fail.
    pub fn set_failing(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail = fail;
        }
    }

    pub fn get(&self, key: u32) -> Option<u8> {
        self.inner.lock().ok()?.values.get(&key).copied()
    }

    pub fn saves(&self) -> usize {
        self.inner.lock().map(|i| i.saves).unwrap_or_default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn load(&mut self, key: u32) -> Result<Option<u8>, PreferenceError> {
        let inner = self.inner.lock().map_err(|_| PreferenceError::Unavailable)?;
        if inner.fail {
            return Err(PreferenceError::Unavailable);
        }
        Ok(inner.values.get(&key).copied())
    }

    fn save(&mut self, key: u32, value: u8) -> Result<(), PreferenceError> {
        let mut inner = self.inner.lock().map_err(|_| PreferenceError::Unavailable)?;
        if inner.fail {
            return Err(PreferenceError::Unavailable);
        }
        inner.values.insert(key, value);
        inner.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_preferences_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/prefs.toml");

        let mut prefs = FilePreferences::new(&path);
        assert_eq!(prefs.load(7).unwrap(), None);
        prefs.save(7, 3).unwrap();
        prefs.save(8, 200).unwrap();

        let mut reopened = FilePreferences::new(&path);
        assert_eq!(reopened.load(7).unwrap(), Some(3));
        assert_eq!(reopened.load(8).unwrap(), Some(200));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");
        fs::write(&path, "values = 12").unwrap();
        let mut prefs = FilePreferences::new(&path);
        assert!(matches!(prefs.load(1), Err(PreferenceError::Parse(_))));
    }

    #[test]
    fn test_memory_clones_share_values() {
        let prefs = MemoryPreferences::new();
        let mut a = prefs.clone();
        a.save(1, 5).unwrap();
        assert_eq!(prefs.get(1), Some(5));

        prefs.set_failing(true);
        assert!(a.load(1).is_err());
    }
}
