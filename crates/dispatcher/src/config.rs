use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
	#[serde(default)]
	pub pool: PoolConfig,
	pub worker: WorkerConfig,
	#[serde(default)]
	pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
	/// Worker slots; defaults to two less than the logical CPU count.
	#[serde(default)]
	pub slots: Option<usize>,
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self { slots: None, poll_interval_ms: default_poll_interval_ms() }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
	pub binary: PathBuf,
	#[serde(default = "default_host")]
	pub host: String,
	pub base_port: u16,
	pub assets: PathBuf,
	#[serde(default = "default_request_timeout_ms")]
	pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
	#[serde(default = "default_heartbeat_interval_ms")]
	pub interval_ms: u64,
	#[serde(default = "default_heartbeat_timeout_ms")]
	pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
	fn default() -> Self {
		Self { interval_ms: default_heartbeat_interval_ms(), timeout_ms: default_heartbeat_timeout_ms() }
	}
}

const fn default_poll_interval_ms() -> u64 {
	100
}

fn default_host() -> String {
	"127.0.0.1".to_string()
}

const fn default_request_timeout_ms() -> u64 {
	120_000
}

const fn default_heartbeat_interval_ms() -> u64 {
	5_000
}

const fn default_heartbeat_timeout_ms() -> u64 {
	2_000
}

/// `max(logical CPUs - 2, 1)`.
#[must_use]
pub fn default_slot_count() -> usize {
	std::thread::available_parallelism().map_or(1, |cpus| cpus.get().saturating_sub(2).max(1))
}

impl DispatcherConfig {
	pub fn load(path: &str) -> Result<Self> {
		let content = fs::read_to_string(path).with_context(|| format!("Failed to read config file: {path}"))?;
		Self::parse(&content)
	}

	pub fn parse(content: &str) -> Result<Self> {
		let config: Self = toml::from_str(content).with_context(|| "Failed to parse config file")?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<()> {
		if self.pool.slots == Some(0) {
			anyhow::bail!("pool.slots must be greater than 0");
		}

		if self.pool.poll_interval_ms == 0 {
			anyhow::bail!("pool.poll_interval_ms must be greater than 0");
		}

		if self.worker.base_port == 0 {
			anyhow::bail!("worker.base_port must be a fixed port");
		}

		if usize::from(self.worker.base_port) + self.slot_count() > usize::from(u16::MAX) + 1 {
			anyhow::bail!("worker.base_port leaves no room for {} workers", self.slot_count());
		}

		if self.worker.request_timeout_ms == 0 {
			anyhow::bail!("worker.request_timeout_ms must be greater than 0");
		}

		if self.heartbeat.timeout_ms == 0 || self.heartbeat.timeout_ms >= self.heartbeat.interval_ms {
			anyhow::bail!("heartbeat.timeout_ms must be positive and shorter than heartbeat.interval_ms");
		}

		Ok(())
	}

	#[must_use]
	pub fn slot_count(&self) -> usize {
		self.pool.slots.unwrap_or_else(default_slot_count)
	}

	#[must_use]
	pub const fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.pool.poll_interval_ms)
	}

	#[must_use]
	pub const fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.worker.request_timeout_ms)
	}

	#[must_use]
	pub const fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.heartbeat.interval_ms)
	}

	#[must_use]
	pub const fn heartbeat_timeout(&self) -> Duration {
		Duration::from_millis(self.heartbeat.timeout_ms)
	}
}
