use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{FileKey, FileRecord};

#[derive(Debug, Error)]
pub enum CatalogError {
	#[error("catalog store unavailable: {0}")]
	Unavailable(String),

	#[error("malformed catalog row: {0}")]
	Decode(String),
}

/// The persisted set of file records.
///
/// Every mutation is idempotent and keyed by `(folder, name)`; the store is
/// the only place concurrent writers meet, so implementations must enforce
/// key uniqueness themselves rather than rely on callers checking first.
#[async_trait]
pub trait CatalogStore: Send + Sync {
	/// Insert a record for `key` unless one exists. A duplicate is not an error.
	async fn insert_if_absent(&self, key: &FileKey, owner: &str) -> Result<(), CatalogError>;

	/// Delete the record for `key` if there is one. A missing record is not an error.
	async fn delete_if_present(&self, key: &FileKey) -> Result<(), CatalogError>;

	async fn list_all(&self) -> Result<BTreeSet<FileKey>, CatalogError>;

	async fn find_owner(&self, key: &FileKey) -> Result<Option<String>, CatalogError>;

	/// Records owned by `owner`, newest first.
	async fn list_owned(&self, owner: &str) -> Result<Vec<FileRecord>, CatalogError>;

	/// Every record, ordered by folder then name.
	async fn list_records(&self) -> Result<Vec<FileRecord>, CatalogError>;
}

/// Names grouped under their folder, both in sorted order.
pub fn group_by_folder(records: &[FileRecord]) -> BTreeMap<&str, Vec<&str>> {
	let mut tree: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
	for record in records {
		tree.entry(record.folder.as_str()).or_default().push(record.name.as_str());
	}
	for names in tree.values_mut() {
		names.sort_unstable();
	}
	tree
}
