use std::{
	collections::BTreeSet,
	path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::models::{FileKey, ROOT_FOLDER};

#[derive(Debug, Error)]
pub enum ScanError {
	#[error("root path does not exist: {0}")]
	RootMissing(String),

	#[error("root path is not a directory: {0}")]
	RootNotDir(String),

	#[error("scan cancelled")]
	Cancelled,

	#[error("scan task failed: {0}")]
	Join(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
	pub follow_symlinks: bool,
	/// Recursion bound, counted in directory levels below the root.
	pub max_depth: usize,
}

impl Default for ScanOptions {
	fn default() -> Self {
		Self { follow_symlinks: false, max_depth: 32 }
	}
}

/// What a walk saw on disk.
///
/// Anything the walk could not enumerate is recorded as unknown so the
/// reconciler leaves the matching catalog entries alone.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
	pub files: BTreeSet<FileKey>,
	pub unknown_folders: BTreeSet<String>,
	pub unknown_files: BTreeSet<FileKey>,
	pub skipped_entries: u64,
}

impl Snapshot {
	pub fn is_partial(&self) -> bool {
		!self.unknown_folders.is_empty() || !self.unknown_files.is_empty()
	}

	/// Whether the walk can vouch for the presence or absence of `key`.
	pub fn covers(&self, key: &FileKey) -> bool {
		!self.unknown_files.contains(key) && !self.unknown_folders.iter().any(|f| key.is_within(f))
	}
}

/// Walk `root` on the blocking pool.
pub async fn scan(root: PathBuf, options: ScanOptions, cancel: CancellationToken) -> Result<Snapshot, ScanError> {
	tokio::task::spawn_blocking(move || walk_root(&root, &options, &cancel))
		.await
		.map_err(|e| ScanError::Join(e.to_string()))?
}

pub fn walk_root(root: &Path, options: &ScanOptions, cancel: &CancellationToken) -> Result<Snapshot, ScanError> {
	if !root.exists() {
		return Err(ScanError::RootMissing(root.display().to_string()));
	}
	if !root.is_dir() {
		return Err(ScanError::RootNotDir(root.display().to_string()));
	}
	let canonical_root = root
		.canonicalize()
		.map_err(|_| ScanError::RootMissing(root.display().to_string()))?;

	let mut snapshot = Snapshot::default();
	let follow = options.follow_symlinks;

	let walker = WalkDir::new(root)
		.follow_links(follow)
		.max_depth(options.max_depth)
		.into_iter()
		.filter_entry(|entry| !follow || !escapes_root(entry, &canonical_root));

	for result in walker {
		if cancel.is_cancelled() {
			return Err(ScanError::Cancelled);
		}

		let entry = match result {
			Ok(e) => e,
			Err(err) => {
				record_walk_error(root, &err, &mut snapshot);
				continue;
			}
		};

		if entry.depth() == 0 {
			continue;
		}

		let file_type = entry.file_type();
		if file_type.is_dir() {
			if entry.depth() >= options.max_depth {
				if let Some(folder) = folder_label(root, entry.path()) {
					debug!(%folder, "depth limit reached, subtree left unknown");
					snapshot.unknown_folders.insert(folder);
				}
			}
			continue;
		}

		if file_type.is_symlink() || !file_type.is_file() {
			snapshot.skipped_entries += 1;
			continue;
		}

		match key_for(root, entry.path()) {
			Some(key) => {
				snapshot.files.insert(key);
			}
			None => {
				warn!(path = %entry.path().display(), "skipping file with unrepresentable name");
				snapshot.skipped_entries += 1;
			}
		}
	}

	Ok(snapshot)
}

fn record_walk_error(root: &Path, err: &walkdir::Error, snapshot: &mut Snapshot) {
	snapshot.skipped_entries += 1;

	if err.loop_ancestor().is_some() {
		debug!(error = %err, "symlink cycle skipped");
		return;
	}

	warn!(error = %err, "could not read entry, treating it as unknown");
	match err.path() {
		Some(path) => {
			if let Some(folder) = folder_label(root, path) {
				snapshot.unknown_folders.insert(folder);
			}
			if let Some(key) = key_for(root, path) {
				snapshot.unknown_files.insert(key);
			}
		}
		None => {
			snapshot.unknown_folders.insert(ROOT_FOLDER.to_string());
		}
	}
}

fn escapes_root(entry: &DirEntry, canonical_root: &Path) -> bool {
	if !entry.path_is_symlink() {
		return false;
	}
	match entry.path().canonicalize() {
		Ok(target) => !target.starts_with(canonical_root),
		Err(_) => true,
	}
}

/// Folder label for a directory under `root`.
pub fn folder_label(root: &Path, dir: &Path) -> Option<String> {
	let relative = dir.strip_prefix(root).ok()?;
	let mut segments = Vec::new();
	for component in relative.components() {
		match component {
			Component::Normal(s) => segments.push(s.to_str()?),
			Component::CurDir => {}
			_ => return None,
		}
	}
	if segments.is_empty() {
		Some(ROOT_FOLDER.to_string())
	} else {
		Some(segments.join("/"))
	}
}

/// Catalog key for a file path under `root`.
pub fn key_for(root: &Path, path: &Path) -> Option<FileKey> {
	let name = path.file_name()?.to_str()?;
	let folder = folder_label(root, path.parent()?)?;
	Some(FileKey::new(folder, name))
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;

	fn setup_tree(dir: &Path) {
		fs::create_dir_all(dir.join("subdir/deep")).unwrap();
		fs::write(dir.join("root.txt"), "hello").unwrap();
		fs::write(dir.join("subdir/mid.txt"), "ab").unwrap();
		fs::write(dir.join("subdir/deep/bottom.txt"), "abcdefghij").unwrap();
	}

	fn walk(dir: &Path, options: ScanOptions) -> Result<Snapshot, ScanError> {
		walk_root(dir, &options, &CancellationToken::new())
	}

	fn labels(snapshot: &Snapshot) -> Vec<String> {
		snapshot.files.iter().map(|k| k.to_string()).collect()
	}

	#[test]
	fn walks_nested_dirs() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());

		let snapshot = walk(tmp.path(), ScanOptions::default()).unwrap();

		assert_eq!(snapshot.skipped_entries, 0);
		assert!(!snapshot.is_partial());
		assert_eq!(labels(&snapshot), vec!["./root.txt", "subdir/mid.txt", "subdir/deep/bottom.txt"]);
	}

	#[test]
	fn empty_dirs_produce_no_entries() {
		let tmp = tempfile::tempdir().unwrap();
		fs::create_dir_all(tmp.path().join("a/b/c")).unwrap();

		let snapshot = walk(tmp.path(), ScanOptions::default()).unwrap();

		assert!(snapshot.files.is_empty());
		assert_eq!(snapshot.skipped_entries, 0);
	}

	#[test]
	fn skips_symlinks_by_default() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		std::os::unix::fs::symlink(tmp.path().join("root.txt"), tmp.path().join("link.txt")).unwrap();

		let snapshot = walk(tmp.path(), ScanOptions::default()).unwrap();

		assert_eq!(snapshot.files.len(), 3); // symlink not counted as a file
		assert_eq!(snapshot.skipped_entries, 1);
	}

	#[test]
	fn follows_only_contained_symlinks() {
		let outside = tempfile::tempdir().unwrap();
		fs::write(outside.path().join("secret.txt"), "nope").unwrap();

		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		std::os::unix::fs::symlink(tmp.path().join("subdir"), tmp.path().join("alias")).unwrap();
		std::os::unix::fs::symlink(outside.path(), tmp.path().join("escape")).unwrap();
		std::os::unix::fs::symlink(outside.path().join("secret.txt"), tmp.path().join("secret.txt")).unwrap();

		let options = ScanOptions { follow_symlinks: true, max_depth: 32 };
		let snapshot = walk(tmp.path(), options).unwrap();

		assert!(snapshot.files.contains(&FileKey::new("alias", "mid.txt")));
		assert!(snapshot.files.contains(&FileKey::new("alias/deep", "bottom.txt")));
		assert!(!snapshot.files.iter().any(|k| k.name == "secret.txt"));
		assert!(!snapshot.files.iter().any(|k| k.folder.starts_with("escape")));
	}

	#[test]
	fn symlink_cycle_terminates() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		std::os::unix::fs::symlink(tmp.path(), tmp.path().join("subdir/back")).unwrap();

		let options = ScanOptions { follow_symlinks: true, max_depth: 32 };
		let snapshot = walk(tmp.path(), options).unwrap();

		assert!(snapshot.files.contains(&FileKey::new("subdir", "mid.txt")));
		assert!(snapshot.skipped_entries >= 1);
	}

	#[test]
	fn depth_limit_marks_subtree_unknown() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());

		let options = ScanOptions { follow_symlinks: false, max_depth: 2 };
		let snapshot = walk(tmp.path(), options).unwrap();

		assert_eq!(labels(&snapshot), vec!["./root.txt", "subdir/mid.txt"]);
		assert!(snapshot.is_partial());
		assert!(!snapshot.covers(&FileKey::new("subdir/deep", "bottom.txt")));
		assert!(snapshot.covers(&FileKey::new("subdir", "mid.txt")));
	}

	#[test]
	fn unreadable_subdir_is_unknown_not_missing() {
		use std::os::unix::fs::PermissionsExt;

		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		let locked = tmp.path().join("subdir/deep");
		fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

		if fs::read_dir(&locked).is_ok() {
			// running with CAP_DAC_OVERRIDE; nothing to observe
			fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
			return;
		}

		let snapshot = walk(tmp.path(), ScanOptions::default()).unwrap();
		fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

		assert!(snapshot.unknown_folders.contains("subdir/deep"));
		assert!(!snapshot.covers(&FileKey::new("subdir/deep", "bottom.txt")));
		assert!(snapshot.files.contains(&FileKey::new("subdir", "mid.txt")));
	}

	#[test]
	fn cancelled_walk_stops() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		let cancel = CancellationToken::new();
		cancel.cancel();

		let err = walk_root(tmp.path(), &ScanOptions::default(), &cancel).unwrap_err();
		assert!(matches!(err, ScanError::Cancelled));
	}

	#[test]
	fn nonexistent_path_errors() {
		let err = walk(Path::new("/tmp/stash_definitely_not_real"), ScanOptions::default()).unwrap_err();
		assert!(matches!(err, ScanError::RootMissing(_)));
	}

	#[test]
	fn file_not_dir_errors() {
		let tmp = tempfile::tempdir().unwrap();
		let file = tmp.path().join("afile.txt");
		fs::write(&file, "x").unwrap();

		let err = walk(&file, ScanOptions::default()).unwrap_err();
		assert!(matches!(err, ScanError::RootNotDir(_)));
	}

	#[test]
	fn keys_for_paths() {
		let root = Path::new("/srv/files");
		assert_eq!(key_for(root, Path::new("/srv/files/a.txt")), Some(FileKey::new(ROOT_FOLDER, "a.txt")));
		assert_eq!(key_for(root, Path::new("/srv/files/x/y/z.bin")), Some(FileKey::new("x/y", "z.bin")));
		assert_eq!(key_for(root, Path::new("/elsewhere/a.txt")), None);
	}
}
