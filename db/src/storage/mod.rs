use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

pub mod catalog;
pub mod ledger;

pub use catalog::IdentityCatalog;
pub use ledger::{ProgressLedger, Recorded, short_code};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed document {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Identity {0} already exists")]
    DuplicateId(u32),
}

impl StoreError {
    /// Short, stable name for structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Read { .. } => "read",
            StoreError::Write { .. } => "write",
            StoreError::Malformed { .. } => "malformed",
            StoreError::DuplicateId(_) => "duplicate_id",
        }
    }
}

/// Load a JSON document, treating a missing file as `T::default()`.
pub(crate) fn read_document<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_slice(&raw).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Serialize `doc` and replace `path` with it atomically: the previous file is
/// either fully replaced or left untouched.
pub(crate) fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    // Write to temp file first, then rename for atomicity
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json).map_err(write_err)?;
    fs::rename(&temp_path, path).map_err(|source| {
        let _ = fs::remove_file(&temp_path);
        write_err(source)
    })
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
