use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Polygon};
use crate::options::ScaleKind;

/// Cross-sample identity of a gate, matched against new peaks by axis group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateTemplate {
	pub id: String,
	pub x_group: usize,
	pub y_group: usize,
	#[serde(default)]
	pub bonus_iterations: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomologyParameters {
	pub bonus_iterations: u32,
}

/// A confirmed density peak, in pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeakRecord {
	pub polygon: Polygon,
	/// Polygon center at the level the peak was confirmed.
	pub nucleus: Point,
	pub x_group: usize,
	pub y_group: usize,
	pub homology_parameters: HomologyParameters,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gate_template_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GateShape {
	/// `polygon` is in raw channel units. Cutoffs are the raw intervals on the
	/// other channel within which zero-valued events are included: `x_cutoffs`
	/// bounds the y value of events with x == 0, `y_cutoffs` the x value of
	/// events with y == 0.
	Polygon {
		polygon: Polygon,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		x_cutoffs: Option<[f64; 2]>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		y_cutoffs: Option<[f64; 2]>,
	},
	Negative,
	DoubleZero,
	Combo {
		child_gate_ids: Vec<String>,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gate {
	pub id: String,
	#[serde(flatten)]
	pub shape: GateShape,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub x_group: Option<usize>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub y_group: Option<usize>,
	pub parameters: [usize; 2],
	pub scales: [ScaleKind; 2],
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gate_template_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub population_count: Option<usize>,
}

impl Gate {
	#[must_use]
	pub fn new(id: impl Into<String>, shape: GateShape, parameters: [usize; 2], scales: [ScaleKind; 2]) -> Self {
		Self {
			id: id.into(),
			shape,
			x_group: None,
			y_group: None,
			parameters,
			scales,
			gate_template_id: None,
			population_count: None,
		}
	}

	#[must_use]
	pub const fn polygon(&self) -> Option<&Polygon> {
		match &self.shape {
			GateShape::Polygon { polygon, .. } => Some(polygon),
			_ => None,
		}
	}

	#[must_use]
	pub const fn is_polygon(&self) -> bool {
		matches!(self.shape, GateShape::Polygon { .. })
	}

	#[must_use]
	pub fn with_count(mut self, count: usize) -> Self {
		self.population_count = Some(count);
		self
	}
}
