//! Turns extracted peaks into gates: separates overlapping siblings, widens
//! gates over the zero-value populations of mass cytometry data and converts
//! pixel polygons to channel units.

use tracing::debug;

use crate::density::{SampleDensity, ZeroDensity};
use crate::gate::{Gate, GateShape, PeakRecord};
use crate::geometry::{self, Axis, Bounds, Point, Polygon, Side};
use crate::options::GatingOptions;
use crate::scale::PlotScales;

/// A zero population is included when its density along the gate reaches
/// this share of the zero density maximum.
const ZERO_INCLUSION_SHARE: f64 = 0.1;

/// Pixel intervals of the zero-valued events a gate includes. `x` runs along
/// pixel rows (events with x == 0), `y` along pixel columns (y == 0).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ZeroCutoffs {
	pub x: Option<[f64; 2]>,
	pub y: Option<[f64; 2]>,
}

/// Separates intersecting polygons pairwise by clipping both to either side
/// of a shared axis-aligned cutoff. Clipping only shrinks polygons, so pairs
/// already handled stay apart.
pub fn zipper(polygons: &mut [Polygon]) {
	for i in 0..polygons.len() {
		for j in (i + 1)..polygons.len() {
			if !geometry::polygons_intersect(&polygons[i], &polygons[j]) {
				continue;
			}

			let center_i = geometry::center(&polygons[i]);
			let center_j = geometry::center(&polygons[j]);
			let axis = if (center_i[0] - center_j[0]).abs() >= (center_i[1] - center_j[1]).abs() { Axis::X } else { Axis::Y };
			let k = axis.index();
			let (lower, upper, low_center, high_center) =
				if center_i[k] <= center_j[k] { (i, j, center_i[k], center_j[k]) } else { (j, i, center_j[k], center_i[k]) };

			let (Some(lower_bounds), Some(upper_bounds)) = (Bounds::of(&polygons[lower]), Bounds::of(&polygons[upper])) else {
				continue;
			};
			let (lower_min, lower_max) = lower_bounds.range(axis);
			let (upper_min, upper_max) = upper_bounds.range(axis);
			let overlap_middle = f64::midpoint(lower_min.max(upper_min), lower_max.min(upper_max));
			// centers closer than two pixels leave no room between them
			let cutoff = if high_center - low_center < 2.0 {
				overlap_middle
			} else {
				overlap_middle.clamp(low_center + 1.0, high_center - 1.0)
			};

			debug!(lower, upper, ?axis, cutoff, "Zipping overlapping gates");
			polygons[lower] = geometry::clip_half_plane(&polygons[lower], axis, cutoff - 0.5, Side::Below);
			polygons[upper] = geometry::clip_half_plane(&polygons[upper], axis, cutoff + 0.5, Side::Above);
		}
	}
}

fn includes_zeroes(zero: &ZeroDensity, start: f64, end: f64) -> bool {
	if zero.max() <= 0.0 {
		return false;
	}
	let start = start.floor().max(0.0) as usize;
	let end = end.ceil().max(0.0) as usize;
	zero.peak_within(start, end) >= zero.max() * ZERO_INCLUSION_SHARE
}

const fn overlaps(a: [f64; 2], b: [f64; 2]) -> bool {
	a[0] <= b[1] && b[0] <= a[1]
}

/// True when `near` lies entirely between `far` and the axis holding the zero
/// events of a band along `band`: left of it for x-zero, below it for y-zero.
fn shadows(near: &Bounds, far: &Bounds, band: Axis) -> bool {
	match band {
		Axis::Y => near.max_x < far.min_x,
		Axis::X => near.min_y > far.max_y,
	}
}

/// Splits overlapping sibling intervals at their rounded midpoint.
fn split_overlaps(intervals: &mut [(usize, [f64; 2])]) {
	intervals.sort_by(|a, b| a.1[0].total_cmp(&b.1[0]));
	for k in 1..intervals.len() {
		let previous_end = intervals[k - 1].1[1];
		let start = intervals[k].1[0];
		if previous_end >= start {
			let middle = f64::midpoint(previous_end, start).round();
			intervals[k - 1].1[1] = middle - 1.0;
			intervals[k].1[0] = middle + 1.0;
		}
	}
}

/// Decides per polygon whether it takes in the x-zero and y-zero events and
/// over which pixel interval. A zero band goes to the gate nearest its axis
/// only, so no gate is swept across a sibling to reach it.
#[must_use]
pub fn zero_cutoffs(polygons: &[Polygon], density: &SampleDensity) -> Vec<ZeroCutoffs> {
	let mut cutoffs = vec![ZeroCutoffs::default(); polygons.len()];
	let bounds: Vec<Option<Bounds>> = polygons.iter().map(|polygon| Bounds::of(polygon)).collect();

	for (zero, axis) in [(&density.x_zero, Axis::Y), (&density.y_zero, Axis::X)] {
		let Some(zero) = zero else {
			continue;
		};

		let candidates: Vec<(usize, Bounds, [f64; 2])> = bounds
			.iter()
			.enumerate()
			.filter_map(|(index, bounds)| {
				let bounds = (*bounds)?;
				let (start, end) = bounds.range(axis);
				includes_zeroes(zero, start, end).then_some((index, bounds, [start.round(), end.round()]))
			})
			.collect();

		let mut intervals: Vec<(usize, [f64; 2])> = Vec::with_capacity(candidates.len());
		for (index, far, interval) in &candidates {
			let shadowed = candidates.iter().any(|(other, near, other_interval)| {
				other != index && overlaps(*interval, *other_interval) && shadows(near, far, axis)
			});
			if shadowed {
				debug!(gate = index, ?axis, "Zero band belongs to a gate nearer the axis");
			} else {
				intervals.push((*index, *interval));
			}
		}
		split_overlaps(&mut intervals);

		for (index, interval) in intervals {
			match axis {
				Axis::Y => cutoffs[index].x = Some(interval),
				Axis::X => cutoffs[index].y = Some(interval),
			}
		}
	}

	cutoffs
}

/// Vertex to connect to `target`: the closest along `along` whose connecting
/// segment misses every other polygon, else simply the nearest vertex.
fn anchor_vertex(polygon: &[Point], target: Point, along: Axis, others: &[&Polygon]) -> usize {
	let k = along.index();
	polygon
		.iter()
		.enumerate()
		.filter(|(_, vertex)| {
			!others.iter().any(|other| geometry::segment_intersects_polygon(**vertex, target, other))
		})
		.min_by(|a, b| (a.1[k] - target[k]).abs().total_cmp(&(b.1[k] - target[k]).abs()))
		.or_else(|| {
			polygon
				.iter()
				.enumerate()
				.min_by(|a, b| geometry::distance(*a.1, target).total_cmp(&geometry::distance(*b.1, target)))
		})
		.map_or(0, |(index, _)| index)
}

/// Sweeps a polygon to the axis: the arc between the two anchors that faces
/// the axis is replaced by the axis points and the hull recomputed.
fn extend_polygon(
	polygon: &[Point],
	axis_points: [Point; 2],
	along: Axis,
	axis_distance: impl Fn(Point) -> f64,
	others: &[&Polygon],
) -> Polygon {
	if polygon.is_empty() {
		return geometry::convex_hull(&axis_points);
	}

	let first = anchor_vertex(polygon, axis_points[0], along, others);
	let second = anchor_vertex(polygon, axis_points[1], along, others);
	let count = polygon.len();

	let arc = |from: usize, to: usize| -> Vec<Point> {
		let length = (to + count - from) % count;
		(0..=length).map(|step| polygon[(from + step) % count]).collect()
	};
	let interior_distance = |arc: &[Point]| -> f64 {
		if arc.len() <= 2 {
			return f64::INFINITY;
		}
		let interior = &arc[1..arc.len() - 1];
		interior.iter().map(|&point| axis_distance(point)).sum::<f64>() / interior.len() as f64
	};

	let mut points = if first == second {
		polygon.to_vec()
	} else {
		let forward = arc(first, second);
		let backward = arc(second, first);
		if interior_distance(&forward) >= interior_distance(&backward) { forward } else { backward }
	};
	points.extend(axis_points);
	geometry::convex_hull(&points)
}

/// Extends every polygon that includes zero events out to the matching plot
/// edge, then separates any siblings the extension made overlap.
pub fn extend_to_zeroes(polygons: &mut [Polygon], cutoffs: &[ZeroCutoffs], scales: &PlotScales) {
	let bottom = scales.height.saturating_sub(1) as f64;

	for index in 0..polygons.len() {
		let Some(cutoff) = cutoffs.get(index).copied() else {
			continue;
		};

		if let Some([start, end]) = cutoff.x {
			let others: Vec<&Polygon> = polygons.iter().enumerate().filter(|(i, _)| *i != index).map(|(_, p)| p).collect();
			let extended = extend_polygon(&polygons[index], [[0.0, start], [0.0, end]], Axis::Y, |point| point[0], &others);
			polygons[index] = extended;
		}

		if let Some([start, end]) = cutoff.y {
			let others: Vec<&Polygon> = polygons.iter().enumerate().filter(|(i, _)| *i != index).map(|(_, p)| p).collect();
			let extended =
				extend_polygon(&polygons[index], [[start, bottom], [end, bottom]], Axis::X, |point| bottom - point[1], &others);
			polygons[index] = extended;
		}

		if cutoff.x.is_some() && cutoff.y.is_some() {
			let mut points = std::mem::take(&mut polygons[index]);
			points.push([0.0, bottom]);
			polygons[index] = geometry::convex_hull(&points);
		}
	}

	zipper(polygons);
}

fn raw_interval(values: [f64; 2]) -> [f64; 2] {
	if values[0] <= values[1] { values } else { [values[1], values[0]] }
}

/// Pixel cutoffs to the raw intervals stored on gates.
#[must_use]
pub fn cutoffs_to_raw(cutoffs: ZeroCutoffs, scales: &PlotScales) -> (Option<[f64; 2]>, Option<[f64; 2]>) {
	let strip = scales.strip() as f64;
	let x = cutoffs.x.map(|[start, end]| raw_interval([scales.to_raw([strip, start])[1], scales.to_raw([strip, end])[1]]));
	let y = cutoffs.y.map(|[start, end]| raw_interval([scales.to_raw([start, 0.0])[0], scales.to_raw([end, 0.0])[0]]));
	(x, y)
}

/// Raw gate cutoffs back to pixel intervals.
#[must_use]
pub fn cutoffs_to_pixels(x_cutoffs: Option<[f64; 2]>, y_cutoffs: Option<[f64; 2]>, scales: &PlotScales) -> ZeroCutoffs {
	ZeroCutoffs {
		x: x_cutoffs.map(|[start, end]| raw_interval([scales.y_pixel(start), scales.y_pixel(end)])),
		y: y_cutoffs.map(|[start, end]| raw_interval([scales.x_pixel(start), scales.x_pixel(end)])),
	}
}

fn separate_and_expand(polygons: &mut [Polygon], density: &SampleDensity, scales: &PlotScales) -> Vec<ZeroCutoffs> {
	zipper(polygons);
	if density.x_zero.is_none() && density.y_zero.is_none() {
		return vec![ZeroCutoffs::default(); polygons.len()];
	}

	let cutoffs = zero_cutoffs(polygons, density);
	extend_to_zeroes(polygons, &cutoffs, scales);
	cutoffs
}

/// Polygon gates for freshly extracted peaks, ids `"{sample}-peak-{n}"`.
#[must_use]
pub fn gates_from_peaks(
	sample_id: &str,
	peaks: &[PeakRecord],
	density: &SampleDensity,
	scales: &PlotScales,
	options: &GatingOptions,
) -> Vec<Gate> {
	let mut polygons: Vec<Polygon> = peaks.iter().map(|peak| peak.polygon.clone()).collect();
	let cutoffs = separate_and_expand(&mut polygons, density, scales);

	peaks
		.iter()
		.zip(polygons)
		.zip(cutoffs)
		.enumerate()
		.map(|(index, ((peak, polygon), cutoff))| {
			let (x_cutoffs, y_cutoffs) = cutoffs_to_raw(cutoff, scales);
			let mut gate = Gate::new(
				format!("{sample_id}-peak-{index}"),
				GateShape::Polygon { polygon: scales.polygon_to_raw(&polygon), x_cutoffs, y_cutoffs },
				options.parameters(),
				options.scales(),
			);
			gate.x_group = Some(peak.x_group);
			gate.y_group = Some(peak.y_group);
			gate.gate_template_id.clone_from(&peak.gate_template_id);
			gate
		})
		.collect()
}

/// Re-applies zero-population expansion to existing gates. Non-polygon gates
/// pass through untouched.
#[must_use]
pub fn expand_gates(gates: &[Gate], density: &SampleDensity, scales: &PlotScales) -> Vec<Gate> {
	let polygon_indices: Vec<usize> = gates.iter().enumerate().filter(|(_, gate)| gate.is_polygon()).map(|(i, _)| i).collect();
	let mut polygons: Vec<Polygon> = polygon_indices
		.iter()
		.filter_map(|&index| gates[index].polygon())
		.map(|polygon| scales.polygon_to_pixels(polygon))
		.collect();

	let cutoffs = separate_and_expand(&mut polygons, density, scales);

	let mut expanded = gates.to_vec();
	for ((index, polygon), cutoff) in polygon_indices.into_iter().zip(polygons).zip(cutoffs) {
		let (x_cutoffs, y_cutoffs) = cutoffs_to_raw(cutoff, scales);
		expanded[index].shape = GateShape::Polygon { polygon: scales.polygon_to_raw(&polygon), x_cutoffs, y_cutoffs };
		expanded[index].population_count = None;
	}
	expanded
}

/// The negative gate for a channel pair and, for mass cytometry, the
/// double-zero gate.
#[must_use]
pub fn derived_gates(sample_id: &str, options: &GatingOptions) -> Vec<Gate> {
	let mut gates = vec![Gate::new(format!("{sample_id}-negative"), GateShape::Negative, options.parameters(), options.scales())];
	if options.is_mass_cytometry() {
		gates.push(Gate::new(
			format!("{sample_id}-double-zero"),
			GateShape::DoubleZero,
			options.parameters(),
			options.scales(),
		));
	}
	gates
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use ndarray::Array1;

	use super::*;
	use crate::density::{DensityMap, estimate};
	use crate::events::{Channel, EventMatrix, SampleEvents};
	use crate::population::PopulationResolver;
	use crate::options::{MachineType, ScaleKind};
	use crate::scale::AxisScale;

	fn square(x: f64, y: f64, size: f64) -> Polygon {
		vec![[x, y], [x + size, y], [x + size, y + size], [x, y + size]]
	}

	fn plot(machine_type: MachineType) -> PlotScales {
		PlotScales::new(
			AxisScale::new(ScaleKind::Linear, 0.0, 100.0),
			AxisScale::new(ScaleKind::Linear, 0.0, 100.0),
			101,
			101,
			machine_type,
		)
	}

	#[test]
	fn zipper_separates_overlapping_siblings() {
		let mut polygons = vec![square(10.0, 10.0, 40.0), square(35.0, 15.0, 40.0), square(80.0, 80.0, 10.0)];
		zipper(&mut polygons);

		assert!(!geometry::polygons_intersect(&polygons[0], &polygons[1]));
		assert!(polygons.iter().all(|polygon| geometry::area(polygon) > 0.0));
		assert!(polygons[0].iter().all(|point| point[0] <= 42.0));
		assert!(polygons[1].iter().all(|point| point[0] >= 43.0));
		assert_eq!(polygons[2], square(80.0, 80.0, 10.0));
	}

	#[test]
	fn zipper_separates_gates_sharing_a_center() {
		let mut polygons = vec![square(30.0, 30.0, 40.0), square(40.0, 40.0, 20.0)];
		zipper(&mut polygons);

		assert!(!geometry::polygons_intersect(&polygons[0], &polygons[1]));
		assert!(polygons.iter().all(|polygon| geometry::area(polygon) > 0.0));
	}

	#[test]
	fn zipper_cuts_along_dominant_axis() {
		let mut polygons = vec![square(20.0, 10.0, 30.0), square(25.0, 30.0, 30.0)];
		zipper(&mut polygons);

		assert!(!geometry::polygons_intersect(&polygons[0], &polygons[1]));
		assert!(polygons[0].iter().all(|point| point[1] <= 34.5));
		assert!(polygons[1].iter().all(|point| point[1] >= 35.5));
	}

	#[test]
	fn overlapping_intervals_split_at_midpoint() {
		let mut intervals = vec![(1, [40.0, 70.0]), (0, [10.0, 50.0])];
		split_overlaps(&mut intervals);
		assert_eq!(intervals, vec![(0, [10.0, 44.0]), (1, [46.0, 70.0])]);
	}

	#[test]
	fn anchor_falls_back_to_nearest_vertex() {
		let polygon = square(50.0, 40.0, 20.0);
		let wall = vec![[0.0, 0.0], [45.0, 0.0], [45.0, 100.0], [0.0, 100.0]];
		let index = anchor_vertex(&polygon, [0.0, 45.0], Axis::Y, &[&wall]);
		assert_eq!(polygon[index], [50.0, 40.0]);

		let index = anchor_vertex(&polygon, [0.0, 58.0], Axis::Y, &[]);
		assert_eq!(polygon[index][1], 60.0);
	}

	#[test]
	fn x_zero_population_extends_gate_to_left_edge() {
		let scales = plot(MachineType::MassCytometry);
		let mut x_zero_counts = Array1::<f64>::zeros(101);
		x_zero_counts[30] = 50.0;
		let density = SampleDensity {
			density: DensityMap::zeros(101, 101),
			x_zero: Some(ZeroDensity::from_counts(&x_zero_counts, 5)),
			y_zero: None,
			double_zero_count: 0,
			density_width: 5,
			event_count: 50,
		};

		let mut polygons = vec![square(40.0, 20.0, 20.0), square(40.0, 70.0, 10.0)];
		let cutoffs = zero_cutoffs(&polygons, &density);
		assert_eq!(cutoffs[0].x, Some([20.0, 40.0]));
		assert_eq!(cutoffs[1], ZeroCutoffs::default());

		extend_to_zeroes(&mut polygons, &cutoffs, &scales);
		assert!(geometry::contains(&polygons[0], [0.0, 30.0]));
		assert!(geometry::contains(&polygons[0], [50.0, 30.0]));
		assert_eq!(polygons[1], square(40.0, 70.0, 10.0));
	}

	#[test]
	fn stacked_gates_split_a_shared_zero_band() {
		let mut x_zero_counts = Array1::<f64>::zeros(101);
		for row in 20..=65 {
			x_zero_counts[row] = 5.0;
		}
		let density = SampleDensity {
			density: DensityMap::zeros(101, 101),
			x_zero: Some(ZeroDensity::from_counts(&x_zero_counts, 5)),
			y_zero: None,
			double_zero_count: 0,
			density_width: 5,
			event_count: 230,
		};

		let cutoffs = zero_cutoffs(&[square(40.0, 20.0, 20.0), square(40.0, 45.0, 20.0)], &density);
		assert_eq!(cutoffs[0].x, Some([20.0, 40.0]));
		assert_eq!(cutoffs[1].x, Some([45.0, 65.0]));
	}

	fn block(origin: [f64; 2], side: u32) -> Vec<Vec<f64>> {
		(0..side * side).map(|i| vec![origin[0] + f64::from(i % side), origin[1] + f64::from(i / side)]).collect()
	}

	#[test]
	fn zero_band_goes_to_the_gate_nearest_its_axis() {
		let mut rows = block([25.0, 45.0], 11);
		rows.extend(block([65.0, 45.0], 11));
		rows.extend((0..55).map(|i| vec![0.0, 45.0 + f64::from(i % 11)]));
		let matrix = EventMatrix::from_rows(vec![Channel::new("a"), Channel::new("b")], rows).unwrap();
		let events = SampleEvents::new(Arc::new(matrix));

		let mut options = GatingOptions::new(0, 1);
		options.machine_type = MachineType::MassCytometry;
		options.plot_width = 101;
		options.plot_height = 101;
		options.min_x_value = Some(0.0);
		options.max_x_value = Some(100.0);
		options.min_y_value = Some(0.0);
		options.max_y_value = Some(100.0);

		let scales = PlotScales::for_options(&options, events.matrix()).unwrap();
		let points = events.project(options.parameters()).unwrap();
		let density = estimate(points.iter().map(|(_, point)| *point), &scales);

		let peak = |polygon: Polygon, x_group: usize| PeakRecord {
			nucleus: geometry::center(&polygon),
			polygon,
			x_group,
			y_group: 0,
			homology_parameters: crate::gate::HomologyParameters::default(),
			gate_template_id: None,
		};
		// both clusters share the rows of the x-zero events
		let peaks = vec![peak(square(28.0, 40.0, 12.0), 0), peak(square(65.0, 40.0, 14.0), 1)];

		let mut gates = gates_from_peaks("s", &peaks, &density, &scales, &options);
		let GateShape::Polygon { x_cutoffs, .. } = &gates[1].shape else { panic!("expected polygon") };
		assert_eq!(*x_cutoffs, None);

		gates.extend(derived_gates("s", &options));
		let counted = PopulationResolver::new().count_gates("s", &events, &gates, &options).unwrap();
		let counts: Vec<Option<usize>> = counted.iter().map(|gate| gate.population_count).collect();
		assert_eq!(counts, vec![Some(176), Some(121), Some(0), Some(0)]);
	}

	#[test]
	fn gates_carry_raw_polygons_and_groups() {
		let scales = plot(MachineType::Flow);
		let options = GatingOptions::new(0, 1);
		let density = estimate(Vec::new(), &scales);
		let peaks = vec![PeakRecord {
			polygon: vec![[10.0, 90.0], [30.0, 90.0], [30.0, 70.0]],
			nucleus: [20.0, 80.0],
			x_group: 0,
			y_group: 1,
			homology_parameters: crate::gate::HomologyParameters::default(),
			gate_template_id: Some("tpl".into()),
		}];

		let gates = gates_from_peaks("sample", &peaks, &density, &scales, &options);
		assert_eq!(gates.len(), 1);
		assert_eq!(gates[0].id, "sample-peak-0");
		assert_eq!(gates[0].gate_template_id.as_deref(), Some("tpl"));
		assert_eq!((gates[0].x_group, gates[0].y_group), (Some(0), Some(1)));

		let polygon = gates[0].polygon().unwrap();
		assert!((polygon[0][0] - 10.0).abs() < 1e-9);
		assert!((polygon[0][1] - 10.0).abs() < 1e-9);
	}

	#[test]
	fn derived_gates_follow_machine_type() {
		let mut options = GatingOptions::new(0, 1);
		assert_eq!(derived_gates("s", &options).len(), 1);
		options.machine_type = MachineType::MassCytometry;
		let gates = derived_gates("s", &options);
		assert_eq!(gates[1].shape, GateShape::DoubleZero);
	}
}
