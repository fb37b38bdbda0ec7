use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use notify::{
	event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
	Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{
	reconciler::{FsChange, Reconciler},
	scanner::{key_for, ScanOptions},
};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum WatchError {
	#[error("watcher init failed: {0}")]
	Init(String),

	#[error("failed to watch {path}: {reason}")]
	Watch { path: String, reason: String },
}

/// What one notification means for the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
	Change(FsChange),
	/// Something happened that single events cannot describe, such as a
	/// directory moved in or out. Only a full pass can settle it.
	Rescan,
}

/// Lives as long as the notification source should.
pub struct FsWatcher {
	_watcher: RecommendedWatcher,
	events: mpsc::Receiver<notify::Result<Event>>,
	context: EventContext,
}

/// Start receiving change notifications for everything under `root`.
pub fn watch(root: &Path, options: ScanOptions) -> Result<FsWatcher, WatchError> {
	let (sender, events) = mpsc::channel(EVENT_BUFFER);
	let mut watcher = RecommendedWatcher::new(
		move |res| {
			let _ = sender.blocking_send(res);
		},
		NotifyConfig::default(),
	)
	.map_err(|e| WatchError::Init(e.to_string()))?;

	watcher.watch(root, RecursiveMode::Recursive).map_err(|e| WatchError::Watch {
		path: root.display().to_string(),
		reason: e.to_string(),
	})?;

	Ok(FsWatcher { _watcher: watcher, events, context: EventContext::new(root, options) })
}

impl FsWatcher {
	/// Feed notifications to `reconciler` until cancelled or the source closes.
	pub async fn run(mut self, reconciler: Arc<Reconciler>, rescan: Arc<Notify>, cancel: CancellationToken) {
		info!(root = %self.context.root.display(), "watching for changes");
		loop {
			let received = tokio::select! {
				_ = cancel.cancelled() => break,
				received = self.events.recv() => received,
			};

			let event = match received {
				Some(Ok(event)) => event,
				Some(Err(e)) => {
					warn!(error = %e, "notification error, requesting full rescan");
					rescan.notify_one();
					continue;
				}
				None => break,
			};

			for signal in self.context.translate(&event) {
				match signal {
					Signal::Change(change) => {
						if let Err(e) = reconciler.apply(&change).await {
							// the next full pass picks it up
							warn!(?change, error = %e, "failed to apply change");
						}
					}
					Signal::Rescan => rescan.notify_one(),
				}
			}
		}
		debug!("watcher stopped");
	}
}

/// Turns raw notifications into catalog signals for one root.
#[derive(Debug, Clone)]
pub struct EventContext {
	root: PathBuf,
	canonical_root: PathBuf,
	options: ScanOptions,
}

impl EventContext {
	pub fn new(root: &Path, options: ScanOptions) -> Self {
		let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
		Self { root: root.to_path_buf(), canonical_root, options }
	}

	pub fn translate(&self, event: &Event) -> Vec<Signal> {
		let mut signals = Vec::new();
		match &event.kind {
			EventKind::Create(CreateKind::Folder) => signals.push(Signal::Rescan),
			EventKind::Create(_) => {
				for path in &event.paths {
					self.appeared(path, &mut signals);
				}
			}
			EventKind::Remove(RemoveKind::File) => {
				for path in &event.paths {
					self.vanished(path, &mut signals);
				}
			}
			EventKind::Remove(RemoveKind::Folder) => signals.push(Signal::Rescan),
			EventKind::Remove(_) => {
				for path in &event.paths {
					self.vanished(path, &mut signals);
				}
				signals.push(Signal::Rescan);
			}
			EventKind::Modify(ModifyKind::Name(mode)) => match mode {
				RenameMode::From => {
					for path in &event.paths {
						self.vanished(path, &mut signals);
					}
				}
				RenameMode::To => {
					for path in &event.paths {
						self.appeared(path, &mut signals);
					}
				}
				RenameMode::Both => {
					if let [from, to] = event.paths.as_slice() {
						self.vanished(from, &mut signals);
						self.appeared(to, &mut signals);
					}
				}
				_ => {
					for path in &event.paths {
						if path.exists() {
							self.appeared(path, &mut signals);
						} else {
							self.vanished(path, &mut signals);
						}
					}
				}
			},
			_ => {}
		}
		signals
	}

	fn appeared(&self, path: &Path, signals: &mut Vec<Signal>) {
		if path.is_dir() {
			signals.push(Signal::Rescan);
			return;
		}
		if !self.is_catalogable(path) {
			return;
		}
		if let Some(key) = key_for(&self.root, path) {
			signals.push(Signal::Change(FsChange::Created(key)));
		}
	}

	fn vanished(&self, path: &Path, signals: &mut Vec<Signal>) {
		if let Some(key) = key_for(&self.root, path) {
			signals.push(Signal::Change(FsChange::Removed(key)));
		}
	}

	/// Same rules the scanner applies: regular files within the depth
	/// bound, symlinks only when followed and contained.
	fn is_catalogable(&self, path: &Path) -> bool {
		let Ok(relative) = path.strip_prefix(&self.root) else {
			return false;
		};
		if relative.components().count() > self.options.max_depth {
			return false;
		}
		let Ok(meta) = std::fs::symlink_metadata(path) else {
			return false;
		};
		if meta.file_type().is_symlink() {
			if !self.options.follow_symlinks {
				return false;
			}
			return match path.canonicalize() {
				Ok(target) => target.starts_with(&self.canonical_root) && target.is_file(),
				Err(_) => false,
			};
		}
		meta.is_file()
	}
}
