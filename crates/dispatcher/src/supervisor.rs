use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::transport::{Endpoint, WorkerTransport};

const READY_POLL: Duration = Duration::from_millis(25);

/// Polls the health endpoint of a freshly spawned worker until it answers or
/// `timeout` runs out.
async fn wait_ready(transport: &dyn WorkerTransport, endpoint: &Endpoint, timeout: Duration) -> bool {
	let deadline = Instant::now() + timeout;
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			return false;
		}
		if let Ok(Ok(())) = tokio::time::timeout(remaining, transport.health(endpoint, remaining)).await {
			return true;
		}
		tokio::time::sleep(READY_POLL.min(deadline.saturating_duration_since(Instant::now()))).await;
	}
}

/// A restartable worker process.
#[async_trait::async_trait]
pub trait Worker: Send {
	fn endpoint(&self) -> &Endpoint;

	async fn spawn(&mut self) -> anyhow::Result<()>;

	/// True when the process is gone or was never started.
	fn has_exited(&mut self) -> bool;

	async fn kill(&mut self);
}

/// Runs the gating worker binary on a fixed port.
pub struct ProcessWorker {
	binary: PathBuf,
	assets: PathBuf,
	endpoint: Endpoint,
	child: Option<Child>,
}

impl ProcessWorker {
	#[must_use]
	pub fn new(binary: impl Into<PathBuf>, assets: impl Into<PathBuf>, endpoint: Endpoint) -> Self {
		Self { binary: binary.into(), assets: assets.into(), endpoint, child: None }
	}
}

#[async_trait::async_trait]
impl Worker for ProcessWorker {
	fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	async fn spawn(&mut self) -> anyhow::Result<()> {
		let child = Command::new(&self.binary)
			.arg("--host")
			.arg(&self.endpoint.host)
			.arg("--port")
			.arg(self.endpoint.port.to_string())
			.arg("--assets")
			.arg(&self.assets)
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.with_context(|| format!("Failed to spawn {} on {}", self.binary.display(), self.endpoint))?;

		info!(endpoint = %self.endpoint, pid = child.id(), "Spawned worker");
		self.child = Some(child);
		Ok(())
	}

	fn has_exited(&mut self) -> bool {
		match self.child.as_mut().map(Child::try_wait) {
			Some(Ok(None)) => false,
			Some(Ok(Some(status))) => {
				warn!(endpoint = %self.endpoint, %status, "Worker exited");
				true
			},
			Some(Err(err)) => {
				warn!(endpoint = %self.endpoint, "Failed to poll worker: {err}");
				true
			},
			None => true,
		}
	}

	async fn kill(&mut self) {
		if let Some(mut child) = self.child.take() {
			if let Err(err) = child.kill().await {
				warn!(endpoint = %self.endpoint, "Failed to kill worker: {err}");
			}
		}
	}
}

struct Supervised {
	worker: Box<dyn Worker>,
	last_healthy: Option<DateTime<Utc>>,
	restarts: usize,
}

/// Keeps a set of workers alive: every heartbeat, a worker that exited or did
/// not answer its health check in time is killed and started again.
pub struct Supervisor {
	workers: Vec<Supervised>,
	transport: Arc<dyn WorkerTransport>,
	interval: Duration,
	timeout: Duration,
}

impl Supervisor {
	#[must_use]
	pub fn new(workers: Vec<Box<dyn Worker>>, transport: Arc<dyn WorkerTransport>, interval: Duration, timeout: Duration) -> Self {
		let workers = workers.into_iter().map(|worker| Supervised { worker, last_healthy: None, restarts: 0 }).collect();
		Self { workers, transport, interval, timeout }
	}

	#[must_use]
	pub fn endpoints(&self) -> Vec<Endpoint> {
		self.workers.iter().map(|supervised| supervised.worker.endpoint().clone()).collect()
	}

	/// Spawns every worker and waits, up to the heartbeat timeout each, for
	/// them to answer health checks. A worker that stays silent is left to
	/// the heartbeat to restart.
	pub async fn start_all(&mut self) -> anyhow::Result<()> {
		for supervised in &mut self.workers {
			supervised.worker.spawn().await?;
		}
		for supervised in &mut self.workers {
			let endpoint = supervised.worker.endpoint().clone();
			if wait_ready(self.transport.as_ref(), &endpoint, self.timeout).await {
				supervised.last_healthy = Some(Utc::now());
			} else {
				warn!(endpoint = %endpoint, "Worker did not become ready in time");
			}
		}
		Ok(())
	}

	/// One heartbeat round. Returns how many workers were restarted.
	pub async fn check(&mut self) -> usize {
		let mut restarted = 0;
		for supervised in &mut self.workers {
			let endpoint = supervised.worker.endpoint().clone();
			let healthy = !supervised.worker.has_exited()
				&& match tokio::time::timeout(self.timeout, self.transport.health(&endpoint, self.timeout)).await {
					Ok(Ok(())) => true,
					Ok(Err(err)) => {
						warn!(endpoint = %endpoint, "Heartbeat failed: {err:#}");
						false
					},
					Err(_) => {
						warn!(endpoint = %endpoint, "Heartbeat timed out");
						false
					},
				};

			if healthy {
				supervised.last_healthy = Some(Utc::now());
				continue;
			}

			supervised.worker.kill().await;
			match supervised.worker.spawn().await {
				Ok(()) => {
					supervised.restarts += 1;
					restarted += 1;
					if wait_ready(self.transport.as_ref(), &endpoint, self.timeout).await {
						supervised.last_healthy = Some(Utc::now());
					}
				},
				Err(err) => error!(endpoint = %endpoint, "Failed to restart worker: {err:#}"),
			}
		}
		restarted
	}

	#[must_use]
	pub fn last_healthy(&self, index: usize) -> Option<DateTime<Utc>> {
		self.workers.get(index).and_then(|supervised| supervised.last_healthy)
	}

	#[must_use]
	pub fn restarts(&self, index: usize) -> usize {
		self.workers.get(index).map_or(0, |supervised| supervised.restarts)
	}

	/// Heartbeats until `shutdown` flips, then kills every worker.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
		let mut interval = tokio::time::interval(self.interval);
		interval.tick().await;

		loop {
			tokio::select! {
				_ = interval.tick() => {
					self.check().await;
				},
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						break;
					}
				},
			}
		}

		for supervised in &mut self.workers {
			supervised.worker.kill().await;
		}
		info!("Supervisor stopped");
	}
}
