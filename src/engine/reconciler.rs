use std::{
	collections::BTreeSet,
	path::{Path, PathBuf},
	sync::Arc,
	time::Instant,
};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	catalog::{CatalogError, CatalogStore},
	engine::scanner::{self, ScanError, ScanOptions, Snapshot},
	models::FileKey,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error(transparent)]
	Scan(#[from] ScanError),

	#[error(transparent)]
	Catalog(#[from] CatalogError),
}

/// Outcome of one full pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
	pub added: Vec<FileKey>,
	pub removed: Vec<FileKey>,
	/// Catalog or disk entries the walk could not judge this pass.
	pub unknown: usize,
	pub partial: bool,
}

impl ReconcileReport {
	pub fn is_noop(&self) -> bool {
		self.added.is_empty() && self.removed.is_empty()
	}
}

/// A single change reported by a filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
	Created(FileKey),
	Removed(FileKey),
}

/// Keeps the catalog in step with the watched root.
///
/// Full passes are serialized by `pass`; single events skip it and lean on
/// the store's idempotent insert/delete instead.
pub struct Reconciler {
	store: Arc<dyn CatalogStore>,
	root: PathBuf,
	options: ScanOptions,
	default_owner: String,
	pass: Mutex<()>,
	cancel: CancellationToken,
}

impl Reconciler {
	pub fn new(store: Arc<dyn CatalogStore>, root: PathBuf, options: ScanOptions, default_owner: impl Into<String>) -> Self {
		Self {
			store,
			root,
			options,
			default_owner: default_owner.into(),
			pass: Mutex::new(()),
			cancel: CancellationToken::new(),
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn options(&self) -> &ScanOptions {
		&self.options
	}

	/// Token that aborts in-flight walks once cancelled.
	pub fn cancellation(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Run a full pass, waiting for any pass already in flight.
	pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
		let _guard = self.pass.lock().await;
		self.run_pass().await
	}

	/// Run a full pass unless one is already running, in which case `None`.
	pub async fn try_reconcile(&self) -> Option<Result<ReconcileReport, ReconcileError>> {
		let _guard = self.pass.try_lock().ok()?;
		Some(self.run_pass().await)
	}

	/// Apply one notification as an idempotent insert or delete.
	pub async fn apply(&self, change: &FsChange) -> Result<(), CatalogError> {
		match change {
			FsChange::Created(key) => {
				self.store.insert_if_absent(key, &self.default_owner).await?;
				debug!(%key, "catalogued from event");
			}
			FsChange::Removed(key) => {
				self.store.delete_if_present(key).await?;
				debug!(%key, "dropped from event");
			}
		}
		Ok(())
	}

	async fn run_pass(&self) -> Result<ReconcileReport, ReconcileError> {
		let started = Instant::now();

		// Catalog first: a file that appears mid-pass is then seen as added
		// rather than removed.
		let catalog = self.store.list_all().await?;
		let snapshot = scanner::scan(self.root.clone(), self.options, self.cancel.child_token()).await?;

		let report = plan(&snapshot, &catalog);
		if report.partial {
			warn!(unknown = report.unknown, "partial walk, unreadable entries left untouched");
		}

		for key in &report.added {
			self.store.insert_if_absent(key, &self.default_owner).await?;
		}
		for key in &report.removed {
			self.store.delete_if_present(key).await?;
		}

		info!(
			added = report.added.len(),
			removed = report.removed.len(),
			on_disk = snapshot.files.len(),
			elapsed_ms = started.elapsed().as_millis() as u64,
			"reconciliation pass complete"
		);
		Ok(report)
	}
}

/// Diff a disk snapshot against the catalog's keys.
///
/// Keys inside a subtree the walk could not read are neither added nor
/// removed.
pub fn plan(snapshot: &Snapshot, catalog: &BTreeSet<FileKey>) -> ReconcileReport {
	let mut report = ReconcileReport { partial: snapshot.is_partial(), ..Default::default() };

	for key in snapshot.files.difference(catalog) {
		if snapshot.covers(key) {
			report.added.push(key.clone());
		} else {
			report.unknown += 1;
		}
	}
	for key in catalog.difference(&snapshot.files) {
		if snapshot.covers(key) {
			report.removed.push(key.clone());
		} else {
			report.unknown += 1;
		}
	}

	report
}
