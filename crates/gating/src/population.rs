use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::error::{GatingError, Result};
use crate::events::SampleEvents;
use crate::gate::{Gate, GateShape};
use crate::geometry::{self, Bounds, Point};
use crate::options::{GatingOptions, MachineType};
use crate::reconcile::{ZeroCutoffs, cutoffs_to_pixels};
use crate::scale::PlotScales;

/// Cache key of one gate's membership on one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

#[derive(Serialize)]
struct FingerprintSource<'a> {
	sample_id: &'a str,
	gate: Gate,
	dependencies: Vec<Gate>,
	parameters: [usize; 2],
	scales: [crate::options::ScaleKind; 2],
	machine_type: MachineType,
	plot: [usize; 2],
	domain: [Option<f64>; 4],
}

fn strip_count(gate: &Gate) -> Gate {
	Gate { population_count: None, ..gate.clone() }
}

impl Fingerprint {
	fn of(sample_id: &str, gate: &Gate, dependencies: &[&Gate], options: &GatingOptions) -> Self {
		let mut dependencies: Vec<Gate> = dependencies.iter().map(|gate| strip_count(gate)).collect();
		dependencies.sort_by(|a, b| a.id.cmp(&b.id));

		let source = FingerprintSource {
			sample_id,
			gate: strip_count(gate),
			dependencies,
			parameters: options.parameters(),
			scales: options.scales(),
			machine_type: options.machine_type,
			plot: [options.plot_width, options.plot_height],
			domain: [options.min_x_value, options.max_x_value, options.min_y_value, options.max_y_value],
		};

		let mut hasher = DefaultHasher::new();
		serde_json::to_string(&source).unwrap_or_default().hash(&mut hasher);
		Self(hasher.finish())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePopulation {
	pub gate_id: String,
	/// Sorted member event ids.
	pub members: Arc<[usize]>,
	/// For combo gates, the sum of the child counts.
	pub count: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry {
	sample_id: String,
	gate_ids: Vec<String>,
	population: GatePopulation,
}

impl CacheEntry {
	fn depends_on(&self, gate_id: &str) -> bool {
		self.gate_ids.iter().any(|id| id == gate_id)
	}
}

/// Computes and caches gate memberships. Entries live until removed with one
/// of the invalidation methods.
#[derive(Debug, Default)]
pub struct PopulationResolver {
	cache: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

struct PolygonTest {
	polygon: Vec<Point>,
	bounds: Option<Bounds>,
	cutoffs: ZeroCutoffs,
}

impl PolygonTest {
	fn new(gate: &Gate, scales: &PlotScales) -> Option<Self> {
		let GateShape::Polygon { polygon, x_cutoffs, y_cutoffs } = &gate.shape else {
			return None;
		};
		let polygon = scales.polygon_to_pixels(polygon);
		let bounds = Bounds::of(&polygon);
		Some(Self { polygon, bounds, cutoffs: cutoffs_to_pixels(*x_cutoffs, *y_cutoffs, scales) })
	}

	fn includes(&self, raw: [f64; 2], scales: &PlotScales) -> bool {
		if scales.machine_type == MachineType::MassCytometry {
			let within = |interval: Option<[f64; 2]>, pixel: f64| interval.is_some_and(|[start, end]| pixel >= start && pixel <= end);
			match (raw[0] == 0.0, raw[1] == 0.0) {
				(true, true) => return false,
				(true, false) => return within(self.cutoffs.x, scales.y_pixel(raw[1])),
				(false, true) => return within(self.cutoffs.y, scales.x_pixel(raw[0])),
				(false, false) => {},
			}
		}

		let pixel = scales.to_pixel(raw);
		self.bounds.is_some_and(|bounds| bounds.contains(pixel)) && geometry::contains(&self.polygon, pixel)
	}
}

// Negative gates need the polygon memberships, combos need all of their children.
const fn resolution_rank(gate: &Gate) -> u8 {
	match gate.shape {
		GateShape::Polygon { .. } | GateShape::DoubleZero => 0,
		GateShape::Negative => 1,
		GateShape::Combo { .. } => 2,
	}
}

fn is_double_zero(raw: [f64; 2]) -> bool {
	raw[0] == 0.0 && raw[1] == 0.0
}

impl PopulationResolver {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.cache.read().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.cache.read().is_empty()
	}

	/// Each invalidation returns the number of entries it removed.
	pub fn invalidate_sample(&self, sample_id: &str) -> usize {
		self.remove_where(|entry| entry.sample_id == sample_id)
	}

	/// Drops every entry computed from `gate_id`, including negative and combo
	/// gates that depended on it.
	pub fn invalidate_gate(&self, gate_id: &str) -> usize {
		self.remove_where(|entry| entry.depends_on(gate_id))
	}

	/// [`Self::invalidate_gate`] restricted to one sample.
	pub fn invalidate_sample_gates(&self, sample_id: &str, gate_ids: &[String]) -> usize {
		self.remove_where(|entry| entry.sample_id == sample_id && gate_ids.iter().any(|gate_id| entry.depends_on(gate_id)))
	}

	pub fn clear(&self) -> usize {
		let mut cache = self.cache.write();
		let removed = cache.len();
		cache.clear();
		removed
	}

	fn remove_where(&self, matches: impl Fn(&CacheEntry) -> bool) -> usize {
		let mut cache = self.cache.write();
		let before = cache.len();
		cache.retain(|_, entry| !matches(entry));
		before - cache.len()
	}

	/// Memberships for `gates`, in the same order. Negative gates are computed
	/// against the polygon gates of the same request; combo children must be
	/// part of the request too.
	pub fn resolve(
		&self,
		sample_id: &str,
		events: &SampleEvents,
		gates: &[Gate],
		options: &GatingOptions,
	) -> Result<Vec<GatePopulation>> {
		let scales = PlotScales::for_options(options, events.matrix())?;
		let mut points: Option<Vec<(usize, [f64; 2])>> = None;
		let mut resolved: HashMap<&str, GatePopulation> = HashMap::new();

		let polygon_gates: Vec<&Gate> = gates.iter().filter(|gate| gate.is_polygon()).collect();
		let mut ordered: Vec<&Gate> = gates.iter().collect();
		ordered.sort_by_key(|gate| resolution_rank(gate));

		for gate in ordered {
			let dependencies: Vec<&Gate> = match &gate.shape {
				GateShape::Negative => polygon_gates.clone(),
				GateShape::Combo { child_gate_ids } => child_gate_ids
					.iter()
					.map(|id| {
						gates.iter().find(|candidate| candidate.id == *id).ok_or_else(|| {
							GatingError::InvalidParameter(format!("combo gate {} references unknown gate {id}", gate.id))
						})
					})
					.collect::<Result<_>>()?,
				_ => Vec::new(),
			};

			let fingerprint = Fingerprint::of(sample_id, gate, &dependencies, options);
			if let Some(entry) = self.cache.read().get(&fingerprint) {
				resolved.insert(gate.id.as_str(), entry.population.clone());
				continue;
			}

			if points.is_none() {
				points = Some(events.project(options.parameters())?);
			}
			let points = points.as_deref().unwrap_or_default();

			let population = match &gate.shape {
				GateShape::Polygon { .. } => {
					let test = PolygonTest::new(gate, &scales);
					let members = collect_members(points, |raw| test.as_ref().is_some_and(|test| test.includes(raw, &scales)));
					GatePopulation { gate_id: gate.id.clone(), count: members.len(), members }
				},
				GateShape::DoubleZero => {
					let members = collect_members(points, is_double_zero);
					GatePopulation { gate_id: gate.id.clone(), count: members.len(), members }
				},
				GateShape::Negative => {
					let tests: Vec<PolygonTest> =
						dependencies.iter().filter_map(|gate| PolygonTest::new(gate, &scales)).collect();
					let skip_double_zero = scales.machine_type == MachineType::MassCytometry;
					let members = collect_members(points, |raw| {
						!(skip_double_zero && is_double_zero(raw)) && !tests.iter().any(|test| test.includes(raw, &scales))
					});
					GatePopulation { gate_id: gate.id.clone(), count: members.len(), members }
				},
				GateShape::Combo { child_gate_ids } => {
					let children: Vec<&GatePopulation> =
						child_gate_ids.iter().filter_map(|id| resolved.get(id.as_str())).collect();
					let count = children.iter().map(|child| child.count).sum();
					let mut members: Vec<usize> = children.iter().flat_map(|child| child.members.iter().copied()).collect();
					members.sort_unstable();
					members.dedup();
					GatePopulation { gate_id: gate.id.clone(), members: members.into(), count }
				},
			};

			debug!(sample = sample_id, gate = %gate.id, count = population.count, "Resolved gate population");
			self.cache.write().insert(
				fingerprint,
				CacheEntry {
					sample_id: sample_id.to_string(),
					gate_ids: std::iter::once(gate.id.clone()).chain(dependencies.iter().map(|gate| gate.id.clone())).collect(),
					population: population.clone(),
				},
			);
			resolved.insert(gate.id.as_str(), population);
		}

		Ok(gates.iter().filter_map(|gate| resolved.get(gate.id.as_str()).cloned()).collect())
	}

	/// Same as [`Self::resolve`], returning the gates with `populationCount`
	/// filled in.
	pub fn count_gates(
		&self,
		sample_id: &str,
		events: &SampleEvents,
		gates: &[Gate],
		options: &GatingOptions,
	) -> Result<Vec<Gate>> {
		let populations = self.resolve(sample_id, events, gates, options)?;
		Ok(gates
			.iter()
			.zip(populations)
			.map(|(gate, population)| gate.clone().with_count(population.count))
			.collect())
	}
}

fn collect_members(points: &[(usize, [f64; 2])], include: impl Fn([f64; 2]) -> bool + Sync) -> Arc<[usize]> {
	points.par_iter().filter(|(_, raw)| include(*raw)).map(|(id, _)| *id).collect::<Vec<_>>().into()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::{Channel, EventMatrix};

	fn events() -> SampleEvents {
		let mut rows = Vec::new();
		for i in 0..50 {
			rows.push(vec![10.0 + f64::from(i % 10), 10.0 + f64::from(i / 10)]);
		}
		for i in 0..30 {
			rows.push(vec![70.0 + f64::from(i % 10), 70.0 + f64::from(i / 10)]);
		}
		rows.push(vec![50.0, 50.0]);
		rows.push(vec![0.0, 0.0]);
		rows.push(vec![0.0, 15.0]);
		let matrix = EventMatrix::from_rows(vec![Channel::new("a"), Channel::new("b")], rows).unwrap();
		SampleEvents::new(Arc::new(matrix))
	}

	fn options(machine_type: MachineType) -> GatingOptions {
		let mut options = GatingOptions::new(0, 1);
		options.machine_type = machine_type;
		options.plot_width = 101;
		options.plot_height = 101;
		options.min_x_value = Some(0.0);
		options.max_x_value = Some(100.0);
		options.min_y_value = Some(0.0);
		options.max_y_value = Some(100.0);
		options
	}

	fn square_gate(id: &str, x: f64, y: f64, size: f64) -> Gate {
		Gate::new(
			id,
			GateShape::Polygon {
				polygon: vec![[x, y], [x + size, y], [x + size, y + size], [x, y + size]],
				x_cutoffs: None,
				y_cutoffs: None,
			},
			[0, 1],
			[crate::options::ScaleKind::Linear; 2],
		)
	}

	fn gates() -> Vec<Gate> {
		let combo = Gate::new(
			"both",
			GateShape::Combo { child_gate_ids: vec!["low".into(), "high".into()] },
			[0, 1],
			[crate::options::ScaleKind::Linear; 2],
		);
		let negative = Gate::new("rest", GateShape::Negative, [0, 1], [crate::options::ScaleKind::Linear; 2]);
		vec![combo, square_gate("low", 5.0, 5.0, 20.0), negative, square_gate("high", 65.0, 65.0, 20.0)]
	}

	#[test]
	fn resolves_polygon_negative_and_combo_gates() {
		let resolver = PopulationResolver::new();
		let populations = resolver.resolve("s1", &events(), &gates(), &options(MachineType::Flow)).unwrap();

		let counts: Vec<(&str, usize)> =
			populations.iter().map(|population| (population.gate_id.as_str(), population.count)).collect();
		assert_eq!(counts, vec![("both", 80), ("low", 50), ("rest", 3), ("high", 30)]);
		assert_eq!(populations[2].members.as_ref(), &[80, 81, 82]);
	}

	#[test]
	fn mass_cytometry_uses_zero_cutoffs_and_double_zero() {
		let mut gates = gates();
		if let GateShape::Polygon { x_cutoffs, .. } = &mut gates[1].shape {
			*x_cutoffs = Some([5.0, 25.0]);
		}
		gates.push(Gate::new("dz", GateShape::DoubleZero, [0, 1], [crate::options::ScaleKind::Linear; 2]));

		let resolver = PopulationResolver::new();
		let populations = resolver.resolve("s1", &events(), &gates, &options(MachineType::MassCytometry)).unwrap();
		let by_id = |id: &str| populations.iter().find(|population| population.gate_id == id).unwrap().clone();

		assert!(by_id("low").members.contains(&82));
		assert_eq!(by_id("dz").members.as_ref(), &[81]);
		assert_eq!(by_id("rest").members.as_ref(), &[80]);
	}

	#[test]
	fn repeated_resolution_hits_the_cache() {
		let resolver = PopulationResolver::new();
		let options = options(MachineType::Flow);
		let first = resolver.resolve("s1", &events(), &gates(), &options).unwrap();
		let second = resolver.resolve("s1", &events(), &gates(), &options).unwrap();

		assert_eq!(resolver.len(), 4);
		for (a, b) in first.iter().zip(&second) {
			assert!(Arc::ptr_eq(&a.members, &b.members));
		}
	}

	#[test]
	fn invalidation_drops_dependent_entries() {
		let resolver = PopulationResolver::new();
		let options = options(MachineType::Flow);
		resolver.resolve("s1", &events(), &gates(), &options).unwrap();
		resolver.resolve("s2", &events(), &gates()[1..2], &options).unwrap();
		assert_eq!(resolver.len(), 5);

		assert_eq!(resolver.invalidate_gate("high"), 3);
		assert_eq!(resolver.len(), 2);

		assert_eq!(resolver.invalidate_sample("s1"), 1);
		assert_eq!(resolver.len(), 1);

		assert_eq!(resolver.clear(), 1);
		assert!(resolver.is_empty());
	}

	#[test]
	fn gate_invalidation_can_target_one_sample() {
		let resolver = PopulationResolver::new();
		let options = options(MachineType::Flow);
		resolver.resolve("s1", &events(), &gates(), &options).unwrap();
		resolver.resolve("s2", &events(), &gates(), &options).unwrap();
		assert_eq!(resolver.len(), 8);

		// low itself, the negative gate and the combo all depend on it
		assert_eq!(resolver.invalidate_sample_gates("s1", &["low".to_string()]), 3);
		assert_eq!(resolver.len(), 5);
		assert_eq!(resolver.invalidate_sample_gates("s1", &["missing".to_string()]), 0);
	}

	#[test]
	fn unknown_combo_child_is_rejected() {
		let combo = Gate::new(
			"combo",
			GateShape::Combo { child_gate_ids: vec!["missing".into()] },
			[0, 1],
			[crate::options::ScaleKind::Linear; 2],
		);
		let result = PopulationResolver::new().resolve("s1", &events(), &[combo], &options(MachineType::Flow));
		assert!(matches!(result, Err(GatingError::InvalidParameter(_))));
	}

	#[test]
	fn edited_gate_changes_fingerprint() {
		let options = options(MachineType::Flow);
		let gate = square_gate("low", 5.0, 5.0, 20.0);
		let edited = square_gate("low", 5.0, 5.0, 25.0);
		let counted = gate.clone().with_count(12);

		assert_ne!(Fingerprint::of("s1", &gate, &[], &options), Fingerprint::of("s1", &edited, &[], &options));
		assert_eq!(Fingerprint::of("s1", &gate, &[], &options), Fingerprint::of("s1", &counted, &[], &options));
	}
}
