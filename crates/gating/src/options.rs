use serde::{Deserialize, Serialize};

use crate::error::{GatingError, Result};
use crate::gate::GateTemplate;

const MIN_PLOT_SIDE: usize = 16;
const MAX_PLOT_SIDE: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScaleKind {
	#[default]
	Linear,
	Log,
	Biexponential,
	Arcsinh,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineType {
	#[default]
	Flow,
	MassCytometry,
}

const fn default_plot_side() -> usize {
	500
}

/// Plot context and tuning knobs shared by every gating job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatingOptions {
	pub selected_x_parameter_index: usize,
	pub selected_y_parameter_index: usize,
	#[serde(default)]
	pub selected_x_scale: ScaleKind,
	#[serde(default)]
	pub selected_y_scale: ScaleKind,
	#[serde(default)]
	pub machine_type: MachineType,
	#[serde(default = "default_plot_side")]
	pub plot_width: usize,
	#[serde(default = "default_plot_side")]
	pub plot_height: usize,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub min_x_value: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_x_value: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub min_y_value: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_y_value: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub edge_distance: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub min_peak_height: Option<u32>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub gate_templates: Vec<GateTemplate>,
}

impl GatingOptions {
	#[must_use]
	pub fn new(x_index: usize, y_index: usize) -> Self {
		Self {
			selected_x_parameter_index: x_index,
			selected_y_parameter_index: y_index,
			selected_x_scale: ScaleKind::Linear,
			selected_y_scale: ScaleKind::Linear,
			machine_type: MachineType::Flow,
			plot_width: default_plot_side(),
			plot_height: default_plot_side(),
			min_x_value: None,
			max_x_value: None,
			min_y_value: None,
			max_y_value: None,
			edge_distance: None,
			min_peak_height: None,
			gate_templates: Vec::new(),
		}
	}

	#[must_use]
	pub fn is_mass_cytometry(&self) -> bool {
		self.machine_type == MachineType::MassCytometry
	}

	#[must_use]
	pub const fn parameters(&self) -> [usize; 2] {
		[self.selected_x_parameter_index, self.selected_y_parameter_index]
	}

	#[must_use]
	pub const fn scales(&self) -> [ScaleKind; 2] {
		[self.selected_x_scale, self.selected_y_scale]
	}

	/// Rejects options that cannot describe a plot over a matrix with
	/// `channel_count` channels.
	pub fn validate(&self, channel_count: usize) -> Result<()> {
		for (axis, index) in [("x", self.selected_x_parameter_index), ("y", self.selected_y_parameter_index)] {
			if index >= channel_count {
				return Err(GatingError::InvalidParameter(format!(
					"{axis} parameter index {index} is out of range for {channel_count} channels"
				)));
			}
		}

		for (axis, side) in [("width", self.plot_width), ("height", self.plot_height)] {
			if !(MIN_PLOT_SIDE..=MAX_PLOT_SIDE).contains(&side) {
				return Err(GatingError::InvalidParameter(format!(
					"plot {axis} {side} must be between {MIN_PLOT_SIDE} and {MAX_PLOT_SIDE}"
				)));
			}
		}

		if let Some(edge_distance) = self.edge_distance {
			if !edge_distance.is_finite() || edge_distance <= 0.0 {
				return Err(GatingError::InvalidParameter(format!("edgeDistance must be positive, got {edge_distance}")));
			}
		}

		for (name, min, max) in
			[("x", self.min_x_value, self.max_x_value), ("y", self.min_y_value, self.max_y_value)]
		{
			if let (Some(min), Some(max)) = (min, max) {
				if min > max {
					return Err(GatingError::InvalidParameter(format!("{name} domain is inverted: {min} > {max}")));
				}
			}
		}

		Ok(())
	}
}
