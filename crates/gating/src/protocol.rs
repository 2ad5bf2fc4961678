//! JSON messages exchanged between the dispatcher and gating workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatingError;
use crate::gate::{Gate, PeakRecord};
use crate::options::GatingOptions;
use crate::provider::SampleRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeaksPayload {
	pub sample: SampleRef,
	pub options: GatingOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatesPayload {
	pub sample: SampleRef,
	pub gates: Vec<Gate>,
	pub options: GatingOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsamplePayload {
	pub sample: SampleRef,
	pub child_sample_id: String,
	pub gate: Gate,
	/// Sibling polygon gates for a negative gate, children for a combo gate.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub related_gates: Vec<Gate>,
	pub options: GatingOptions,
}

/// Cached populations to forget: every gate of the sample, or only the listed
/// gates and whatever was derived from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidatePayload {
	pub sample: SampleRef,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gate_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum JobRequest {
	FindPeaks(PeaksPayload),
	FindPeaksWithTemplate(PeaksPayload),
	GetExpandedGates(GatesPayload),
	GetGatePopulationCounts(GatesPayload),
	SaveNewSubsample(SubsamplePayload),
	InvalidatePopulations(InvalidatePayload),
}

impl JobRequest {
	#[must_use]
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::FindPeaks(_) => "find-peaks",
			Self::FindPeaksWithTemplate(_) => "find-peaks-with-template",
			Self::GetExpandedGates(_) => "get-expanded-gates",
			Self::GetGatePopulationCounts(_) => "get-gate-population-counts",
			Self::SaveNewSubsample(_) => "save-new-subsample",
			Self::InvalidatePopulations(_) => "invalidate-populations",
		}
	}

	#[must_use]
	pub const fn sample(&self) -> &SampleRef {
		match self {
			Self::FindPeaks(payload) | Self::FindPeaksWithTemplate(payload) => &payload.sample,
			Self::GetExpandedGates(payload) | Self::GetGatePopulationCounts(payload) => &payload.sample,
			Self::SaveNewSubsample(payload) => &payload.sample,
			Self::InvalidatePopulations(payload) => &payload.sample,
		}
	}

	/// Requests with equal keys compute the same result.
	#[must_use]
	pub fn dedup_key(&self) -> String {
		serde_json::to_string(self).unwrap_or_else(|_| format!("{}:{:?}", self.kind(), self.sample()))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundPeaks {
	pub peaks: Vec<PeakRecord>,
	/// Reconciled polygon gates followed by the derived gates, with counts.
	pub gates: Vec<Gate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSubsample {
	pub sample_id: String,
	pub event_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invalidated {
	pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
	pub kind: String,
	pub message: String,
}

impl From<&GatingError> for JobFailure {
	fn from(err: &GatingError) -> Self {
		Self { kind: err.kind().to_string(), message: err.to_string() }
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum JobResponse {
	Success { data: Value },
	Fail { error: JobFailure },
}

impl JobResponse {
	#[must_use]
	pub const fn is_success(&self) -> bool {
		matches!(self, Self::Success { .. })
	}

	/// Decodes the success payload.
	pub fn data<T: serde::de::DeserializeOwned>(&self) -> Result<T, JobFailure> {
		match self {
			Self::Success { data } => serde_json::from_value(data.clone())
				.map_err(|err| JobFailure { kind: "parse".into(), message: err.to_string() }),
			Self::Fail { error } => Err(error.clone()),
		}
	}
}
