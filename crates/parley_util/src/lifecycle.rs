#![forbid(unsafe_code)]

//! Process lifecycle: one cancellation token, a task group that propagates the
//! first fatal error, and a bounded drain window on shutdown.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "failed to listen for ctrl-c");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				warn!(error = %e, "failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => info!("received ctrl-c"),
		_ = terminate => info!("received SIGTERM"),
	}
}

/// Tasks sharing one cancellation token. The first task to fail records its
/// error and cancels the token for everyone else.
#[derive(Clone)]
pub struct TaskGroup {
	token: CancellationToken,
	tracker: TaskTracker,
	first_error: Arc<Mutex<Option<anyhow::Error>>>,
}

impl TaskGroup {
	pub fn new(token: CancellationToken) -> Self {
		Self {
			token,
			tracker: TaskTracker::new(),
			first_error: Arc::new(Mutex::new(None)),
		}
	}

	pub fn token(&self) -> CancellationToken {
		self.token.clone()
	}

	pub fn cancel(&self) {
		self.token.cancel();
	}

	pub fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Number of tasks still running.
	pub fn len(&self) -> usize {
		self.tracker.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tracker.is_empty()
	}

	pub fn spawn<F>(&self, name: &'static str, fut: F)
	where
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let token = self.token.clone();
		let first_error = Arc::clone(&self.first_error);
		self.tracker.spawn(async move {
			match fut.await {
				Ok(()) => debug!(task = name, "task finished"),
				Err(e) => {
					error!(task = name, error = %format!("{e:#}"), "task failed");
					if let Ok(mut slot) = first_error.lock()
						&& slot.is_none()
					{
						*slot = Some(e.context(format!("task {name} failed")));
					}
					token.cancel();
				}
			}
		});
	}

	/// Wait for every task (including ones spawned while waiting) and return
	/// the first recorded error.
	pub async fn wait(&self) -> anyhow::Result<()> {
		self.tracker.close();
		self.tracker.wait().await;
		let err = match self.first_error.lock() {
			Ok(mut slot) => slot.take(),
			Err(poisoned) => poisoned.into_inner().take(),
		};
		match err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}
}

/// Owns the process task group and runs the shutdown sequence.
///
/// Shutdown order: wait for a signal or the first fatal error, cancel the
/// drain token so listeners stop accepting, give drainable tasks up to
/// `grace` to finish, cancel everything, then wait for all tasks.
pub struct Supervisor {
	group: TaskGroup,
	drain: CancellationToken,
	drainable: TaskTracker,
}

impl Default for Supervisor {
	fn default() -> Self {
		Self::new()
	}
}

impl Supervisor {
	pub fn new() -> Self {
		let root = CancellationToken::new();
		let drain = root.child_token();
		Self {
			group: TaskGroup::new(root),
			drain,
			drainable: TaskTracker::new(),
		}
	}

	pub fn group(&self) -> &TaskGroup {
		&self.group
	}

	pub fn token(&self) -> CancellationToken {
		self.group.token()
	}

	/// Cancelled when shutdown starts; also cancelled by the root token.
	pub fn drain_token(&self) -> CancellationToken {
		self.drain.clone()
	}

	pub fn spawn<F>(&self, name: &'static str, fut: F)
	where
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		self.group.spawn(name, fut);
	}

	/// Spawn a task that must finish within the drain window (listeners).
	pub fn spawn_drainable<F>(&self, name: &'static str, fut: F)
	where
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		self.group.spawn(name, self.drainable.track_future(fut));
	}

	pub async fn run_until_shutdown(self, grace: Duration) -> anyhow::Result<()> {
		self.run_until(shutdown_signal(), grace).await
	}

	/// Same as `run_until_shutdown` with an arbitrary trigger instead of OS signals.
	pub async fn run_until<S>(self, trigger: S, grace: Duration) -> anyhow::Result<()>
	where
		S: Future<Output = ()>,
	{
		let root = self.group.token();
		tokio::select! {
			_ = trigger => info!("shutdown requested"),
			_ = root.cancelled() => warn!("supervised task failed; shutting down"),
		}

		self.drain.cancel();
		self.drainable.close();
		if tokio::time::timeout(grace, self.drainable.wait()).await.is_err() {
			warn!(grace_ms = grace.as_millis() as u64, "drain window elapsed; forcing shutdown");
		}

		self.group.cancel();
		let res = self.group.wait().await;
		info!("all tasks stopped");
		res
	}
}
