use std::{sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{
	reconciler::{ReconcileError, Reconciler},
	scanner::ScanError,
	watcher,
};

#[derive(Debug, Clone, Copy)]
pub struct DaemonSettings {
	pub rescan_interval: Duration,
	pub watch: bool,
}

impl Default for DaemonSettings {
	fn default() -> Self {
		Self { rescan_interval: Duration::from_secs(60), watch: true }
	}
}

/// Background reconciliation for one root.
///
/// Created once at startup and torn down with [`Daemon::shutdown`]. Owns the
/// periodic loop (whose first tick is the startup pass) and, when enabled,
/// the change watcher.
pub struct Daemon {
	reconciler: Arc<Reconciler>,
	rescan: Arc<Notify>,
	cancel: CancellationToken,
	tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
	pub fn start(reconciler: Arc<Reconciler>, settings: DaemonSettings) -> Self {
		let cancel = reconciler.cancellation();
		let rescan = Arc::new(Notify::new());

		let mut tasks = vec![tokio::spawn(periodic_loop(
			reconciler.clone(),
			settings.rescan_interval,
			rescan.clone(),
			cancel.clone(),
		))];

		if settings.watch {
			match watcher::watch(reconciler.root(), *reconciler.options()) {
				Ok(fs_watcher) => {
					tasks.push(tokio::spawn(fs_watcher.run(reconciler.clone(), rescan.clone(), cancel.clone())));
				}
				Err(e) => warn!(error = %e, "change notifications unavailable, relying on periodic rescans"),
			}
		}

		Daemon { reconciler, rescan, cancel, tasks }
	}

	pub fn reconciler(&self) -> &Arc<Reconciler> {
		&self.reconciler
	}

	/// Ask for a full pass as soon as the current one (if any) finishes.
	pub fn request_rescan(&self) {
		self.rescan.notify_one();
	}

	/// Handle for callers that outlive a borrow of the daemon.
	pub fn rescan_handle(&self) -> RescanHandle {
		RescanHandle(self.rescan.clone())
	}

	/// Stop the loops, abandoning any walk in progress.
	pub async fn shutdown(self) {
		self.cancel.cancel();
		for task in self.tasks {
			let _ = task.await;
		}
		info!("reconciliation stopped");
	}
}

#[derive(Clone)]
pub struct RescanHandle(Arc<Notify>);

impl RescanHandle {
	pub fn request(&self) {
		self.0.notify_one();
	}
}

impl From<Arc<Notify>> for RescanHandle {
	fn from(notify: Arc<Notify>) -> Self {
		RescanHandle(notify)
	}
}

async fn periodic_loop(reconciler: Arc<Reconciler>, interval: Duration, rescan: Arc<Notify>, cancel: CancellationToken) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = ticker.tick() => {}
			_ = rescan.notified() => debug!("rescan requested"),
		}

		let outcome = tokio::select! {
			_ = cancel.cancelled() => break,
			outcome = reconciler.try_reconcile() => outcome,
		};

		match outcome {
			None => debug!("pass already running, tick skipped"),
			Some(Ok(_)) => {}
			Some(Err(ReconcileError::Scan(ScanError::Cancelled))) => break,
			Some(Err(e)) => error!(error = %e, "reconciliation pass failed, retrying next tick"),
		}
	}
}
