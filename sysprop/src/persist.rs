//! Persistent backing store for `persist.` properties
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  PropertyStore                      │
//! │  - loads persisted values at init   │
//! │  - mirrors later `persist.` writes  │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ PersistentStore trait
//!          ▼
//!      DirStore          MemStore
//!   (one file per      (in-process,
//!    property)          for tests)
//! ```
//!
//! Failures here never fail a `set`; the store logs them.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PropertyError;
use crate::prop_info::PROP_VALUE_MAX;

/// Prefix of properties that survive a restart
pub const PERSIST_PREFIX: &str = "persist.";

/// Name of the shared temporary file inside the persist directory
pub const TEMP_FILE_NAME: &str = ".temp";

/// Durable storage for `persist.` properties
pub trait PersistentStore: Send + Sync {
    /// All persisted `(name, value)` pairs.
    ///
    /// Unreadable individual entries are logged and skipped; only a failure
    /// to enumerate at all is an error.
    fn load_all(&self) -> Result<Vec<(String, String)>, PropertyError>;

    /// Durably replace the value of `name`
    fn write(&self, name: &str, value: &str) -> Result<(), PropertyError>;
}

// ============================================================================
// Directory store
// ============================================================================

/// One file per property; file name is the property name
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_error(path: &Path, source: std::io::Error) -> PropertyError {
        PropertyError::PersistIo {
            path: path.to_path_buf(),
            source,
        }
    }

    fn read_value(path: &Path) -> Result<Option<String>, PropertyError> {
        let file = File::open(path).map_err(|e| Self::io_error(path, e))?;
        let mut data = Vec::with_capacity(PROP_VALUE_MAX - 1);
        #[allow(clippy::cast_possible_truncation)]
        file.take((PROP_VALUE_MAX - 1) as u64)
            .read_to_end(&mut data)
            .map_err(|e| Self::io_error(path, e))?;
        Ok(String::from_utf8(data).ok())
    }

    fn create_temp(path: &Path) -> std::io::Result<File> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)
    }
}

/// Whether `name` can be used as a file name inside the persist directory
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && name != TEMP_FILE_NAME && !name.contains(['/', '\\'])
}

impl PersistentStore for DirStore {
    fn load_all(&self) -> Result<Vec<(String, String)>, PropertyError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Self::io_error(&self.dir, e))?;

        let mut values = BTreeMap::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!("unable to scan {}: {e}", self.dir.display());
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.starts_with(PERSIST_PREFIX) {
                continue;
            }
            if !entry.file_type().is_ok_and(|t| t.is_file()) {
                continue;
            }

            let path = entry.path();
            match Self::read_value(&path) {
                Ok(Some(value)) => {
                    values.insert(name, value);
                }
                Ok(None) => {
                    tracing::warn!("persistent property file {} is not UTF-8, skipped", path.display());
                }
                Err(e) => {
                    tracing::error!("unable to read persistent property: {e}");
                }
            }
        }

        Ok(values.into_iter().collect())
    }

    fn write(&self, name: &str, value: &str) -> Result<(), PropertyError> {
        let path = self.dir.join(name);
        if !is_safe_file_name(name) {
            return Err(Self::io_error(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a plain file name"),
            ));
        }

        let temp_path = self.dir.join(TEMP_FILE_NAME);
        let written = Self::create_temp(&temp_path).and_then(|mut file| {
            file.write_all(value.as_bytes())?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(Self::io_error(&temp_path, e));
        }

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(Self::io_error(&path, e));
        }

        tracing::debug!("persisted {name} to {}", path.display());
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory implementation of `PersistentStore`
///
/// Clones share the same map, so a test can keep one handle and give
/// another to a `PropertyStore`, or hand the same map to a second store to
/// simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    values: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemStore {
    /// Create a new empty MemStore
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far
    #[must_use]
    pub fn entries(&self) -> Vec<(String, String)> {
        self.values
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.values.lock().get(name).cloned()
    }
}

impl PersistentStore for MemStore {
    fn load_all(&self) -> Result<Vec<(String, String)>, PropertyError> {
        Ok(self
            .values
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(PERSIST_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, name: &str, value: &str) -> Result<(), PropertyError> {
        self.values.lock().insert(name.to_string(), value.to_string());
        Ok(())
    }
}
