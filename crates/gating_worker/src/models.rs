use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
	pub status: String,
	pub pid: u32,
	pub started_at: DateTime<Utc>,
}

impl HealthResponse {
	#[must_use]
	pub fn ok(started_at: DateTime<Utc>) -> Self {
		Self { status: "ok".to_string(), pid: std::process::id(), started_at }
	}
}
