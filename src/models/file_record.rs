use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Folder label for files that sit directly under the watched root.
pub const ROOT_FOLDER: &str = ".";

/// The natural key of a catalog entry.
///
/// `folder` is the `/`-separated directory path relative to the root,
/// or [`ROOT_FOLDER`]. `name` is the file's base name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub folder: String,
    pub name: String,
}

impl FileKey {
    pub fn new(folder: impl Into<String>, name: impl Into<String>) -> Self {
        Self { folder: folder.into(), name: name.into() }
    }

    /// Record key used by the catalog. Derived from the natural key so that
    /// two inserts of the same file address the same record.
    pub fn record_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.folder.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.name.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Path of the file relative to the watched root.
    pub fn relative_path(&self) -> PathBuf {
        if self.folder == ROOT_FOLDER {
            PathBuf::from(&self.name)
        } else {
            PathBuf::from(&self.folder).join(&self.name)
        }
    }

    /// Whether this key lives in `folder` or anywhere below it.
    pub fn is_within(&self, folder: &str) -> bool {
        folder == ROOT_FOLDER
            || self.folder == folder
            || self
                .folder
                .strip_prefix(folder)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.folder, self.name)
    }
}

/// One catalog entry: a file the scanner found, and who may read it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub id: String,
    pub folder: String,
    pub name: String,
    pub owner: String,
    pub discovered_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn key(&self) -> FileKey {
        FileKey::new(self.folder.clone(), self.name.clone())
    }
}
