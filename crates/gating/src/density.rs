//! Sweep-based density estimation over the pixel grid of a plot.
//!
//! Every occupied cell casts a linearly decaying "influence" along its row and
//! column in both directions. Summing those four sweeps, the raw counts and a
//! diagonal averaging pass gives a smooth surface without a full 2-D
//! convolution: each sweep costs one pass over the grid regardless of how many
//! events were binned.

use std::collections::VecDeque;

use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Zip, s};
use tracing::debug;

use crate::options::MachineType;
use crate::scale::PlotScales;

/// Upper bound of the display scale produced by [`DensityMap::log_normalized`].
pub const NORMALIZED_MAX: f64 = 100.0;
const NORMALIZED_FLOOR: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct DensityMap {
	grid: Array2<f64>,
	max: f64,
}

impl DensityMap {
	/// Wraps a `height x width` grid, computing its maximum.
	#[must_use]
	pub fn from_grid(grid: Array2<f64>) -> Self {
		let max = grid.iter().copied().fold(0.0, f64::max);
		Self { grid, max }
	}

	#[must_use]
	pub fn zeros(width: usize, height: usize) -> Self {
		Self { grid: Array2::zeros((height, width)), max: 0.0 }
	}

	#[must_use]
	pub const fn grid(&self) -> &Array2<f64> {
		&self.grid
	}

	#[must_use]
	pub const fn max(&self) -> f64 {
		self.max
	}

	#[must_use]
	pub fn width(&self) -> usize {
		self.grid.ncols()
	}

	#[must_use]
	pub fn height(&self) -> usize {
		self.grid.nrows()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.max <= 0.0
	}

	/// Log-scaled copy on `0..=100`. `ceiling` is the density that maps to 100
	/// (it may exceed this grid's own maximum); zero cells stay zero.
	#[must_use]
	pub fn log_normalized(&self, ceiling: f64) -> Self {
		Self::from_grid(self.grid.mapv(|value| normalize(value, ceiling)))
	}
}

fn normalize(value: f64, ceiling: f64) -> f64 {
	if value <= 0.0 || ceiling <= 0.0 {
		return 0.0;
	}

	let scaled = if ceiling > 1.0 { NORMALIZED_MAX * value.ln() / ceiling.ln() } else { NORMALIZED_MAX * value / ceiling };
	scaled.clamp(NORMALIZED_FLOOR, NORMALIZED_MAX)
}

/// One-dimensional density of the events sitting exactly on zero for one
/// channel, indexed along the other axis.
#[derive(Debug, Clone, PartialEq)]
pub struct ZeroDensity {
	values: Array1<f64>,
	max: f64,
}

impl ZeroDensity {
	pub(crate) fn from_counts(counts: &Array1<f64>, width: usize) -> Self {
		let mut values = Array1::<f64>::zeros(counts.len());
		sweep_lane(counts.view(), values.view_mut(), width);
		values.zip_mut_with(counts, |value, &count| *value += count / 2.0);

		let max = values.iter().copied().fold(0.0, f64::max);
		Self { values, max }
	}

	#[must_use]
	pub const fn values(&self) -> &Array1<f64> {
		&self.values
	}

	#[must_use]
	pub const fn max(&self) -> f64 {
		self.max
	}

	/// Largest density over the inclusive index range, clamped to the grid.
	#[must_use]
	pub fn peak_within(&self, start: usize, end: usize) -> f64 {
		if self.values.is_empty() || start > end {
			return 0.0;
		}
		let end = end.min(self.values.len() - 1);
		if start > end {
			return 0.0;
		}
		self.values.slice(s![start..=end]).iter().copied().fold(0.0, f64::max)
	}
}

/// Everything the estimator produces for one sample and channel pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDensity {
	pub density: DensityMap,
	/// Events with x exactly zero, by pixel row (mass cytometry only).
	pub x_zero: Option<ZeroDensity>,
	/// Events with y exactly zero, by pixel column (mass cytometry only).
	pub y_zero: Option<ZeroDensity>,
	pub double_zero_count: usize,
	pub density_width: usize,
	pub event_count: usize,
}

impl SampleDensity {
	/// Largest density over the grid, both zero densities and a quarter of the
	/// double-zero population.
	#[must_use]
	pub fn ceiling(&self) -> f64 {
		let zero_max = |zero: &Option<ZeroDensity>| zero.as_ref().map_or(0.0, ZeroDensity::max);
		self.density
			.max()
			.max(zero_max(&self.x_zero))
			.max(zero_max(&self.y_zero))
			.max(self.double_zero_count as f64 / 4.0)
	}

	/// The display-scale grid peak extraction runs on.
	#[must_use]
	pub fn normalized(&self) -> DensityMap {
		self.density.log_normalized(self.ceiling())
	}
}

/// Smoothing radius in cells: wider for larger plots and for sparse samples.
#[must_use]
pub fn density_width(width: usize, height: usize, events: usize) -> usize {
	let base = ((width + height) as f64 * 0.012).floor() as usize;
	let sparse = if events == 0 { 0 } else { 300_000 / events * 5 };
	(base + sparse).clamp(1, ((width + height) / 10).max(1))
}

/// Linear decay of injected counts along one sweep direction.
struct Influence {
	width: usize,
	position: usize,
	total: f64,
	slope: f64,
	live: VecDeque<(usize, f64, f64)>,
}

impl Influence {
	fn new(width: usize) -> Self {
		Self { width, position: 0, total: 0.0, slope: 0.0, live: VecDeque::new() }
	}

	/// Advances one cell and returns the influence arriving at it before the
	/// cell's own count is injected.
	fn step(&mut self, count: f64) -> f64 {
		self.position += 1;
		self.total -= self.slope;

		while let Some(&(expires, value, decrement)) = self.live.front() {
			if expires > self.position {
				break;
			}
			self.live.pop_front();
			self.total -= (self.width as f64).mul_add(-decrement, value);
			self.slope -= decrement;
		}

		if self.live.is_empty() {
			self.total = 0.0;
			self.slope = 0.0;
		}

		let arriving = self.total.max(0.0);

		if count > 0.0 {
			let decrement = count / self.width as f64;
			self.live.push_back((self.position + self.width, count, decrement));
			self.total += count;
			self.slope += decrement;
		}

		arriving
	}
}

fn sweep_lane(counts: ArrayView1<'_, f64>, mut lane: ArrayViewMut1<'_, f64>, width: usize) {
	let mut forward = Influence::new(width);
	for (count, cell) in counts.iter().zip(lane.iter_mut()) {
		*cell += forward.step(*count);
	}

	let mut backward = Influence::new(width);
	for (count, cell) in counts.iter().rev().zip(lane.iter_mut().rev()) {
		*cell += backward.step(*count);
	}
}

fn smooth(counts: &Array2<f64>, width: usize) -> Array2<f64> {
	let mut grid = Array2::<f64>::zeros(counts.raw_dim());

	Zip::from(grid.rows_mut()).and(counts.rows()).par_for_each(|lane, row| sweep_lane(row, lane, width));
	Zip::from(grid.columns_mut()).and(counts.columns()).par_for_each(|lane, column| sweep_lane(column, lane, width));
	grid += counts;

	let (height, cols) = grid.dim();
	if height >= 3 && cols >= 3 {
		let snapshot = grid.clone();
		let diagonal = (&snapshot.slice(s![..-2, ..-2])
			+ &snapshot.slice(s![..-2, 2..])
			+ &snapshot.slice(s![2.., ..-2])
			+ &snapshot.slice(s![2.., 2..]))
			/ 4.0;
		let mut interior = grid.slice_mut(s![1..-1, 1..-1]);
		interior += &diagonal;
	}

	grid
}

/// Bins raw `[x, y]` pairs into the plot grid and smooths them.
///
/// For mass cytometry, events exactly zero on one channel go to the matching
/// 1-D zero density and events zero on both are only counted.
pub fn estimate(points: impl IntoIterator<Item = [f64; 2]>, scales: &PlotScales) -> SampleDensity {
	let (width, height) = (scales.width, scales.height);
	let separate_zeroes = scales.machine_type == MachineType::MassCytometry;

	let mut counts = Array2::<f64>::zeros((height, width));
	let mut x_zero_counts = Array1::<f64>::zeros(height);
	let mut y_zero_counts = Array1::<f64>::zeros(width);
	let mut double_zero_count = 0;
	let mut event_count = 0;

	for [x, y] in points {
		if !x.is_finite() || !y.is_finite() {
			continue;
		}
		event_count += 1;

		if separate_zeroes {
			match (x == 0.0, y == 0.0) {
				(true, true) => {
					double_zero_count += 1;
					continue;
				},
				(true, false) => {
					x_zero_counts[scales.row(y)] += 1.0;
					continue;
				},
				(false, true) => {
					y_zero_counts[scales.column(x)] += 1.0;
					continue;
				},
				(false, false) => {},
			}
		}

		counts[scales.cell([x, y])] += 1.0;
	}

	let density_width = density_width(width, height, event_count);
	debug!(events = event_count, width = density_width, double_zero = double_zero_count, "Estimating density");

	let density =
		if event_count == 0 { DensityMap::zeros(width, height) } else { DensityMap::from_grid(smooth(&counts, density_width)) };

	SampleDensity {
		density,
		x_zero: separate_zeroes.then(|| ZeroDensity::from_counts(&x_zero_counts, density_width)),
		y_zero: separate_zeroes.then(|| ZeroDensity::from_counts(&y_zero_counts, density_width)),
		double_zero_count,
		density_width,
		event_count,
	}
}
