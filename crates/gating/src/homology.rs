//! Peak extraction by a persistent-homology style threshold sweep.
//!
//! The density threshold is lowered one level at a time. Cells entering the
//! current band either grow the nearest peak or seed a new one; small peaks
//! that touch a neighbour are absorbed into it. A peak that outgrows the noise
//! area becomes a true peak and, once it has persisted long enough, is
//! confirmed as a population.

use tracing::{debug, info};

use crate::density::DensityMap;
use crate::error::{GatingError, Result};
use crate::gate::{GateTemplate, HomologyParameters, PeakRecord};
use crate::geometry::{self, Bounds, Point, Polygon};
use crate::options::GatingOptions;

/// More confirmed peaks than this means the sweep is mis-tuned for the data.
pub const MAX_PEAKS: usize = 5;
const AXIS_GROUP_SPAN: f64 = 0.3;
const TEMPLATE_MATCH_DISTANCE: f64 = 0.04;

#[derive(Debug, Clone, PartialEq)]
pub struct HomologyOptions {
	/// Cells closer than this to a peak's boundary join that peak.
	pub edge_distance: f64,
	/// Levels a true peak must have existed before it can be confirmed.
	pub min_peak_height: u32,
	/// Extra levels a true peak must survive before confirmation.
	pub max_iterations: u32,
	/// Peaks below this area (px²) are absorbed when they touch a neighbour.
	pub noise_area: f64,
	pub levels: u32,
}

impl HomologyOptions {
	#[must_use]
	pub fn for_plot(width: usize, height: usize) -> Self {
		Self {
			edge_distance: width as f64 * 0.03,
			min_peak_height: 4,
			max_iterations: 0,
			noise_area: (width * height) as f64 * 0.02,
			levels: 100,
		}
	}

	#[must_use]
	pub fn from_gating(options: &GatingOptions) -> Self {
		let mut homology = Self::for_plot(options.plot_width, options.plot_height);
		if let Some(edge_distance) = options.edge_distance {
			homology.edge_distance = edge_distance;
		}
		if let Some(min_peak_height) = options.min_peak_height {
			homology.min_peak_height = min_peak_height;
		}
		homology
	}
}

#[derive(Debug, Clone)]
struct HomologyPeak {
	id: usize,
	polygon: Polygon,
	bounds: Bounds,
	area: f64,
	pending: Vec<Point>,
	height: u32,
	true_peak: bool,
	bonus_iterations: u32,
	max_iterations: u32,
	anchor: Option<Point>,
	template: Option<usize>,
}

impl HomologyPeak {
	fn seed(id: usize, point: Point, max_iterations: u32) -> Self {
		Self {
			id,
			polygon: vec![point],
			bounds: Bounds { min_x: point[0], min_y: point[1], max_x: point[0], max_y: point[1] },
			area: 0.0,
			pending: Vec::new(),
			height: 0,
			true_peak: false,
			bonus_iterations: 0,
			max_iterations,
			anchor: None,
			template: None,
		}
	}

	fn reshape(&mut self, points: Vec<Point>) {
		self.polygon = geometry::convex_hull(&points);
		if let Some(bounds) = Bounds::of(&self.polygon) {
			self.bounds = bounds;
		}
		self.area = geometry::area(&self.polygon);
	}

	fn grow(&mut self) {
		if self.pending.is_empty() {
			return;
		}
		let mut points = std::mem::take(&mut self.polygon);
		points.append(&mut self.pending);
		self.reshape(points);
	}

	fn absorb(&mut self, other: &Self) {
		let mut points = std::mem::take(&mut self.polygon);
		points.extend_from_slice(&other.polygon);
		self.reshape(points);
	}

	const fn is_confirmed(&self) -> bool {
		self.anchor.is_some()
	}
}

#[derive(Debug, Clone)]
struct TemplateAnchor {
	template: usize,
	center: Point,
	bonus_iterations: u32,
	bound: bool,
}

/// One full descent through the levels.
struct Sweep<'a> {
	density: &'a DensityMap,
	options: &'a HomologyOptions,
	peaks: Vec<HomologyPeak>,
	next_id: usize,
	confirmed: Vec<usize>,
	anchors: Vec<TemplateAnchor>,
	anchor_distance: f64,
}

impl<'a> Sweep<'a> {
	fn new(density: &'a DensityMap, options: &'a HomologyOptions, anchors: Vec<TemplateAnchor>) -> Self {
		let anchor_distance = density.width().max(density.height()) as f64 * TEMPLATE_MATCH_DISTANCE;
		Self { density, options, peaks: Vec::new(), next_id: 0, confirmed: Vec::new(), anchors, anchor_distance }
	}

	fn run(&mut self, progress: &mut dyn FnMut(u32, u32)) {
		let levels = self.options.levels;
		for level in (1..=levels).rev() {
			self.claim_band(level);
			for peak in &mut self.peaks {
				peak.grow();
			}
			self.merge();
			self.advance();
			progress(levels - level + 1, levels);
		}
	}

	fn claim_band(&mut self, level: u32) {
		let density = self.density;
		let levels = f64::from(self.options.levels);
		let max = density.max();
		let low = f64::from(level) / levels * max;
		let high = f64::from(level + 2) / levels * max;
		let edge_distance = self.options.edge_distance;

		for ((row, column), &value) in density.grid().indexed_iter() {
			if value <= 0.0 || value < low || value >= high {
				continue;
			}

			let point = [column as f64, row as f64];
			if self.peaks.iter().any(|peak| peak.bounds.contains(point) && geometry::contains(&peak.polygon, point)) {
				continue;
			}

			let mut nearest: Option<(usize, f64)> = None;
			for (index, peak) in self.peaks.iter().enumerate() {
				if peak.bounds.distance_to(point) >= edge_distance {
					continue;
				}
				let distance = geometry::distance_to_polygon(point, &peak.polygon);
				if nearest.is_none_or(|(_, best)| distance < best) {
					nearest = Some((index, distance));
				}
			}

			match nearest {
				Some((index, distance)) if distance < edge_distance => self.peaks[index].pending.push(point),
				_ => {
					self.peaks.push(HomologyPeak::seed(self.next_id, point, self.options.max_iterations));
					self.next_id += 1;
				},
			}
		}
	}

	fn touching(&self, i: usize, j: usize) -> bool {
		let (a, b) = (&self.peaks[i], &self.peaks[j]);
		let edge_distance = self.options.edge_distance;
		if a.bounds.gap(&b.bounds) >= edge_distance {
			return false;
		}

		geometry::polygons_intersect(&a.polygon, &b.polygon)
			|| a.polygon.iter().any(|&vertex| geometry::distance_to_polygon(vertex, &b.polygon) < edge_distance)
	}

	fn merge(&mut self) {
		let noise_area = self.options.noise_area;
		let mut i = 0;
		while i < self.peaks.len() {
			let mut j = 0;
			while j < self.peaks.len() {
				if i != j && self.peaks[j].area < noise_area && self.touching(i, j) {
					let absorbed = self.peaks.swap_remove(j);
					// the last peak moved into slot j
					if i == self.peaks.len() {
						i = j;
					}
					self.peaks[i].absorb(&absorbed);
					continue;
				}
				j += 1;
			}
			i += 1;
		}
	}

	fn advance(&mut self) {
		let noise_area = self.options.noise_area;
		let min_peak_height = self.options.min_peak_height;
		let anchor_distance = self.anchor_distance;

		for peak in &mut self.peaks {
			if !peak.true_peak && peak.area > noise_area {
				peak.true_peak = true;
				let center = geometry::center(&peak.polygon);
				let nearest = self
					.anchors
					.iter_mut()
					.filter(|anchor| !anchor.bound)
					.map(|anchor| (geometry::distance(anchor.center, center), anchor))
					.filter(|(distance, _)| *distance <= anchor_distance)
					.min_by(|a, b| a.0.total_cmp(&b.0));
				if let Some((_, anchor)) = nearest {
					anchor.bound = true;
					peak.template = Some(anchor.template);
					peak.max_iterations = anchor.bonus_iterations;
				}
			}

			peak.height += 1;

			if peak.true_peak && !peak.is_confirmed() && peak.height >= min_peak_height {
				peak.bonus_iterations += 1;
				if peak.bonus_iterations > peak.max_iterations {
					peak.anchor = Some(geometry::center(&peak.polygon));
					self.confirmed.push(peak.id);
				}
			}
		}
	}

	fn finish(self, templates: &[GateTemplate]) -> Result<Vec<PeakRecord>> {
		let confirmed: Vec<&HomologyPeak> =
			self.confirmed.iter().filter_map(|id| self.peaks.iter().find(|peak| peak.id == *id)).collect();

		if confirmed.len() > MAX_PEAKS {
			return Err(GatingError::ExtractionAmbiguous(format!(
				"found {} peaks, at most {MAX_PEAKS} are supported",
				confirmed.len()
			)));
		}

		let centers: Vec<Point> = confirmed.iter().map(|peak| geometry::center(&peak.polygon)).collect();
		let x_groups = axis_groups(&centers.iter().map(|center| center[0]).collect::<Vec<_>>());
		let y_groups = axis_groups(&centers.iter().map(|center| center[1]).collect::<Vec<_>>());

		Ok(confirmed
			.into_iter()
			.zip(x_groups.into_iter().zip(y_groups))
			.map(|(peak, (x_group, y_group))| PeakRecord {
				polygon: peak.polygon.clone(),
				nucleus: peak.anchor.unwrap_or_else(|| geometry::center(&peak.polygon)),
				x_group,
				y_group,
				homology_parameters: HomologyParameters { bonus_iterations: peak.max_iterations },
				gate_template_id: peak.template.and_then(|index| templates.get(index)).map(|template| template.id.clone()),
			})
			.collect())
	}
}

/// Greedy single-link grouping along one axis. A position joins every
/// existing group whose founding position lies within 30% of the observed
/// range, otherwise it founds a new group. Groups are numbered by position and
/// each input gets the first group that holds it.
#[must_use]
pub fn axis_groups(positions: &[f64]) -> Vec<usize> {
	let (min, max) =
		positions.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &value| (min.min(value), max.max(value)));
	let threshold = (max - min) * AXIS_GROUP_SPAN;

	let mut groups: Vec<(f64, Vec<usize>)> = Vec::new();
	for (index, &position) in positions.iter().enumerate() {
		let mut found = false;
		for (founder, members) in &mut groups {
			if (*founder - position).abs() <= threshold {
				members.push(index);
				found = true;
			}
		}
		if !found {
			groups.push((position, vec![index]));
		}
	}

	groups.sort_by(|a, b| a.0.total_cmp(&b.0));
	(0..positions.len())
		.map(|index| groups.iter().position(|(_, members)| members.contains(&index)).unwrap_or(0))
		.collect()
}

/// Runs the sweep over a (normalized) density map.
pub struct PeakExtractor<'a> {
	options: HomologyOptions,
	progress: Box<dyn FnMut(u32, u32) + Send + 'a>,
}

impl<'a> PeakExtractor<'a> {
	#[must_use]
	pub fn new(options: HomologyOptions) -> Self {
		Self { options, progress: Box::new(|_, _| {}) }
	}

	/// Called with `(levels done, levels)` after every level of every sweep.
	#[must_use]
	pub fn on_progress(mut self, progress: impl FnMut(u32, u32) + Send + 'a) -> Self {
		self.progress = Box::new(progress);
		self
	}

	#[must_use]
	pub const fn options(&self) -> &HomologyOptions {
		&self.options
	}

	fn sweep(
		&mut self,
		density: &DensityMap,
		options: &HomologyOptions,
		anchors: Vec<TemplateAnchor>,
		templates: &[GateTemplate],
	) -> Result<Vec<PeakRecord>> {
		let mut sweep = Sweep::new(density, options, anchors);
		sweep.run(&mut *self.progress);
		debug!(peaks = sweep.peaks.len(), confirmed = sweep.confirmed.len(), "Sweep finished");
		sweep.finish(templates)
	}

	/// Free mode. An empty density map yields no peaks.
	pub fn find_peaks(&mut self, density: &DensityMap) -> Result<Vec<PeakRecord>> {
		if density.is_empty() {
			return Ok(Vec::new());
		}

		let options = self.options.clone();
		let peaks = self.sweep(density, &options, Vec::new(), &[])?;
		info!(peaks = peaks.len(), "Found peaks");
		Ok(peaks)
	}

	/// Re-identifies the populations described by `templates`.
	///
	/// A free sweep must find exactly one peak per template, matched by axis
	/// group. Its peak centers then anchor a second sweep in which each
	/// template's recorded bonus iterations apply to the peak that binds to it.
	pub fn find_peaks_with_templates(
		&mut self,
		density: &DensityMap,
		templates: &[GateTemplate],
	) -> Result<Vec<PeakRecord>> {
		if templates.is_empty() {
			return self.find_peaks(density);
		}
		if density.is_empty() {
			return Err(GatingError::ExtractionAmbiguous(format!("no peaks found for {} templates", templates.len())));
		}

		let options = HomologyOptions { max_iterations: 0, ..self.options.clone() };
		let free = self.sweep(density, &options, Vec::new(), &[])?;
		if free.len() != templates.len() {
			return Err(GatingError::ExtractionAmbiguous(format!(
				"found {} peaks for {} templates",
				free.len(),
				templates.len()
			)));
		}

		let anchors = templates
			.iter()
			.enumerate()
			.map(|(index, template)| {
				free.iter()
					.find(|peak| peak.x_group == template.x_group && peak.y_group == template.y_group)
					.map(|peak| TemplateAnchor {
						template: index,
						center: peak.nucleus,
						bonus_iterations: template.bonus_iterations,
						bound: false,
					})
					.ok_or_else(|| {
						GatingError::ExtractionAmbiguous(format!(
							"no peak in group ({}, {}) for template {}",
							template.x_group, template.y_group, template.id
						))
					})
			})
			.collect::<Result<Vec<_>>>()?;

		let anchored = self.sweep(density, &options, anchors, templates)?;
		if anchored.len() != templates.len() {
			return Err(GatingError::ExtractionAmbiguous(format!(
				"anchored sweep found {} peaks for {} templates",
				anchored.len(),
				templates.len()
			)));
		}

		info!(peaks = anchored.len(), "Matched peaks to templates");
		Ok(anchored)
	}
}
