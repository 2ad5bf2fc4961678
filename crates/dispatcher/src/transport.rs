use std::fmt;
use std::time::Duration;

use anyhow::Context;
use gating::{JobRequest, JobResponse};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
	pub host: String,
	pub port: u16,
}

impl Endpoint {
	#[must_use]
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self { host: host.into(), port }
	}

	#[must_use]
	pub fn url(&self, path: &str) -> String {
		format!("http://{}:{}{path}", self.host, self.port)
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

#[async_trait::async_trait]
pub trait WorkerTransport: Send + Sync {
	/// Sends one job to the worker behind `endpoint`. Job-level failures come
	/// back as `JobResponse::Fail`; only transport problems are errors.
	async fn execute(&self, endpoint: &Endpoint, request: &JobRequest) -> anyhow::Result<JobResponse>;

	async fn health(&self, endpoint: &Endpoint, timeout: Duration) -> anyhow::Result<()>;
}

pub struct HttpTransport {
	client: reqwest::Client,
}

impl HttpTransport {
	pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(request_timeout)
			.build()
			.context("Failed to build worker HTTP client")?;
		Ok(Self { client })
	}
}

#[async_trait::async_trait]
impl WorkerTransport for HttpTransport {
	async fn execute(&self, endpoint: &Endpoint, request: &JobRequest) -> anyhow::Result<JobResponse> {
		self.client
			.post(endpoint.url("/jobs"))
			.json(request)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await
			.context(format!("Failed to run {} on {endpoint}", request.kind()))
	}

	async fn health(&self, endpoint: &Endpoint, timeout: Duration) -> anyhow::Result<()> {
		let health: serde_json::Value = self
			.client
			.get(endpoint.url("/health"))
			.timeout(timeout)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await
			.context(format!("Failed to read health of {endpoint}"))?;

		if health.get("status").and_then(serde_json::Value::as_str) != Some("ok") {
			anyhow::bail!("Worker {endpoint} reported {health}");
		}
		Ok(())
	}
}
