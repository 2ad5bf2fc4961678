use std::sync::Arc;

use chrono::{DateTime, Utc};
use gating::{MatrixProvider, Pipeline};

#[derive(Clone)]
pub struct AppState {
	pipeline: Arc<Pipeline>,
	started_at: DateTime<Utc>,
}

impl AppState {
	#[must_use]
	pub fn new(provider: Arc<dyn MatrixProvider>) -> Self {
		Self { pipeline: Arc::new(Pipeline::new(provider)), started_at: Utc::now() }
	}

	#[must_use]
	pub fn pipeline(&self) -> Arc<Pipeline> {
		Arc::clone(&self.pipeline)
	}

	#[must_use]
	pub const fn started_at(&self) -> DateTime<Utc> {
		self.started_at
	}
}
