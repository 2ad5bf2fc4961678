//! Raw channel value <-> pixel mapping.

use crate::error::Result;
use crate::events::EventMatrix;
use crate::geometry::{Point, Polygon};
use crate::options::{GatingOptions, MachineType, ScaleKind};

const ARCSINH_COFACTOR: f64 = 5.0;
const BIEXPONENTIAL_WIDTH: f64 = 150.0;
const MASS_CYTOMETRY_STRIP: f64 = 0.07;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisScale {
	kind: ScaleKind,
	floor: f64,
	low: f64,
	high: f64,
}

impl AxisScale {
	#[must_use]
	pub fn new(kind: ScaleKind, min: f64, max: f64) -> Self {
		// log axes cannot start at or below zero
		let floor = if kind == ScaleKind::Log && min <= 0.0 { 1.0 } else { min };
		let mut scale = Self { kind, floor, low: 0.0, high: 0.0 };
		scale.low = scale.transform(min);
		scale.high = scale.transform(max);
		scale
	}

	#[must_use]
	pub const fn kind(&self) -> ScaleKind {
		self.kind
	}

	#[must_use]
	pub fn transform(&self, value: f64) -> f64 {
		match self.kind {
			ScaleKind::Linear => value,
			ScaleKind::Log => value.max(self.floor).ln(),
			ScaleKind::Arcsinh => (value / ARCSINH_COFACTOR).asinh(),
			ScaleKind::Biexponential => value.signum() * (value.abs() / BIEXPONENTIAL_WIDTH).ln_1p(),
		}
	}

	#[must_use]
	pub fn inverse(&self, transformed: f64) -> f64 {
		match self.kind {
			ScaleKind::Linear => transformed,
			ScaleKind::Log => transformed.exp(),
			ScaleKind::Arcsinh => transformed.sinh() * ARCSINH_COFACTOR,
			ScaleKind::Biexponential => transformed.signum() * transformed.abs().exp_m1() * BIEXPONENTIAL_WIDTH,
		}
	}

	/// Position of a raw value within the domain, 0 at the minimum and 1 at
	/// the maximum. Values outside the domain fall outside `[0, 1]`.
	#[must_use]
	pub fn normalize(&self, value: f64) -> f64 {
		let span = self.high - self.low;
		if span.abs() <= f64::EPSILON {
			return 0.5;
		}
		(self.transform(value) - self.low) / span
	}

	#[must_use]
	pub fn denormalize(&self, position: f64) -> f64 {
		self.inverse(position.mul_add(self.high - self.low, self.low))
	}
}

/// Both axes of a plot plus its pixel geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotScales {
	pub x: AxisScale,
	pub y: AxisScale,
	pub width: usize,
	pub height: usize,
	pub machine_type: MachineType,
	strip: usize,
}

impl PlotScales {
	#[must_use]
	pub fn new(x: AxisScale, y: AxisScale, width: usize, height: usize, machine_type: MachineType) -> Self {
		let strip = match machine_type {
			MachineType::Flow => 0,
			MachineType::MassCytometry => (width.min(height) as f64 * MASS_CYTOMETRY_STRIP).round() as usize,
		};
		Self { x, y, width, height, machine_type, strip }
	}

	/// Builds the mapping for a plot over `matrix`; missing domain bounds come
	/// from the channel statistics (the positive minimum on log axes).
	pub fn for_options(options: &GatingOptions, matrix: &EventMatrix) -> Result<Self> {
		options.validate(matrix.channel_count())?;

		let axis = |index: usize, kind: ScaleKind, min: Option<f64>, max: Option<f64>| -> Result<AxisScale> {
			let statistics = matrix.statistics(index)?;
			let default_min = if kind == ScaleKind::Log { statistics.positive_min } else { statistics.min };
			Ok(AxisScale::new(kind, min.unwrap_or(default_min), max.unwrap_or(statistics.max)))
		};

		let x = axis(options.selected_x_parameter_index, options.selected_x_scale, options.min_x_value, options.max_x_value)?;
		let y = axis(options.selected_y_parameter_index, options.selected_y_scale, options.min_y_value, options.max_y_value)?;
		Ok(Self::new(x, y, options.plot_width, options.plot_height, options.machine_type))
	}

	/// Width of the zero-event strip along the left and bottom edges.
	#[must_use]
	pub const fn strip(&self) -> usize {
		self.strip
	}

	fn span_x(&self) -> f64 {
		self.width.saturating_sub(1 + self.strip) as f64
	}

	fn span_y(&self) -> f64 {
		self.height.saturating_sub(1 + self.strip) as f64
	}

	#[must_use]
	pub fn x_pixel(&self, value: f64) -> f64 {
		self.x.normalize(value).mul_add(self.span_x(), self.strip as f64)
	}

	#[must_use]
	pub fn y_pixel(&self, value: f64) -> f64 {
		self.span_y() * (1.0 - self.y.normalize(value))
	}

	#[must_use]
	pub fn to_pixel(&self, raw: [f64; 2]) -> Point {
		[self.x_pixel(raw[0]), self.y_pixel(raw[1])]
	}

	#[must_use]
	pub fn to_raw(&self, pixel: Point) -> [f64; 2] {
		let span_x = self.span_x();
		let span_y = self.span_y();
		let tx = if span_x > 0.0 { (pixel[0] - self.strip as f64) / span_x } else { 0.5 };
		let ty = if span_y > 0.0 { 1.0 - pixel[1] / span_y } else { 0.5 };
		[self.x.denormalize(tx), self.y.denormalize(ty)]
	}

	#[must_use]
	pub fn column(&self, value: f64) -> usize {
		clamp_cell(self.x_pixel(value), self.width)
	}

	#[must_use]
	pub fn row(&self, value: f64) -> usize {
		clamp_cell(self.y_pixel(value), self.height)
	}

	/// Grid cell `(row, column)` of a raw point, clamped into the plot.
	#[must_use]
	pub fn cell(&self, raw: [f64; 2]) -> (usize, usize) {
		(self.row(raw[1]), self.column(raw[0]))
	}

	#[must_use]
	pub fn polygon_to_raw(&self, polygon: &[Point]) -> Polygon {
		polygon.iter().map(|&point| self.to_raw(point)).collect()
	}

	#[must_use]
	pub fn polygon_to_pixels(&self, polygon: &[Point]) -> Polygon {
		polygon.iter().map(|&point| self.to_pixel(point)).collect()
	}
}

fn clamp_cell(pixel: f64, size: usize) -> usize {
	if pixel.is_nan() {
		return 0;
	}
	pixel.round().clamp(0.0, size.saturating_sub(1) as f64) as usize
}

#[cfg(test)]
mod tests {
	use super::*;

	fn linear_plot(machine_type: MachineType) -> PlotScales {
		PlotScales::new(
			AxisScale::new(ScaleKind::Linear, 0.0, 1000.0),
			AxisScale::new(ScaleKind::Linear, 0.0, 1000.0),
			501,
			501,
			machine_type,
		)
	}

	#[test]
	fn linear_axes_map_corners() {
		let plot = linear_plot(MachineType::Flow);
		assert_eq!(plot.to_pixel([0.0, 0.0]), [0.0, 500.0]);
		assert_eq!(plot.to_pixel([1000.0, 1000.0]), [500.0, 0.0]);
		assert_eq!(plot.cell([250.0, 750.0]), (125, 125));
	}

	#[test]
	fn pixels_round_trip_to_raw() {
		for kind in [ScaleKind::Linear, ScaleKind::Log, ScaleKind::Arcsinh, ScaleKind::Biexponential] {
			let scale = AxisScale::new(kind, 1.0, 10_000.0);
			let plot = PlotScales::new(scale, scale, 400, 300, MachineType::Flow);
			let raw = [42.0, 3_000.0];
			let back = plot.to_raw(plot.to_pixel(raw));
			assert!((back[0] - raw[0]).abs() < 1e-6 * raw[0], "{kind:?}");
			assert!((back[1] - raw[1]).abs() < 1e-6 * raw[1], "{kind:?}");
		}
	}

	#[test]
	fn mass_cytometry_reserves_strip() {
		let plot = linear_plot(MachineType::MassCytometry);
		assert_eq!(plot.strip(), 35);
		assert!((plot.x_pixel(0.0) - 35.0).abs() < 1e-9);
		assert!((plot.y_pixel(0.0) - 465.0).abs() < 1e-9);
	}

	#[test]
	fn cells_are_clamped_into_the_grid() {
		let plot = linear_plot(MachineType::Flow);
		assert_eq!(plot.cell([-50.0, 5000.0]), (0, 0));
		assert_eq!(plot.cell([5000.0, -50.0]), (500, 500));
	}

	#[test]
	fn log_axis_clamps_to_floor() {
		let scale = AxisScale::new(ScaleKind::Log, 10.0, 1000.0);
		assert!((scale.normalize(1.0) - 0.0).abs() < 1e-12);
		assert!((scale.normalize(100.0) - 0.5).abs() < 1e-12);
	}
}
