use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::density::{SampleDensity, estimate};
use crate::error::{GatingError, Result};
use crate::events::SampleEvents;
use crate::gate::Gate;
use crate::homology::{HomologyOptions, PeakExtractor};
use crate::options::GatingOptions;
use crate::population::PopulationResolver;
use crate::protocol::{
	FoundPeaks, GatesPayload, InvalidatePayload, Invalidated, JobFailure, JobRequest, JobResponse, PeaksPayload, SavedSubsample,
	SubsamplePayload,
};
use crate::provider::{MatrixProvider, SampleRef};
use crate::reconcile::{derived_gates, expand_gates, gates_from_peaks};
use crate::scale::PlotScales;

const PROGRESS_STEP: u32 = 25;

/// Runs job requests against a matrix provider, caching gate populations
/// across requests.
pub struct Pipeline {
	provider: Arc<dyn MatrixProvider>,
	resolver: PopulationResolver,
}

fn cache_key(sample: &SampleRef) -> String {
	format!("{}/{}/{}", sample.workspace_id, sample.file_id, sample.sample_id)
}

fn to_value(data: impl Serialize) -> Result<Value> {
	serde_json::to_value(data).map_err(|err| GatingError::InvalidParameter(format!("unserializable result: {err}")))
}

impl Pipeline {
	#[must_use]
	pub fn new(provider: Arc<dyn MatrixProvider>) -> Self {
		Self { provider, resolver: PopulationResolver::new() }
	}

	#[must_use]
	pub const fn resolver(&self) -> &PopulationResolver {
		&self.resolver
	}

	pub fn run(&self, request: &JobRequest) -> JobResponse {
		match self.execute(request) {
			Ok(data) => JobResponse::Success { data },
			Err(err) => {
				warn!(job = request.kind(), sample = %request.sample().sample_id, "Job failed: {err}");
				JobResponse::Fail { error: JobFailure::from(&err) }
			},
		}
	}

	pub fn execute(&self, request: &JobRequest) -> Result<Value> {
		debug!(job = request.kind(), sample = %request.sample().sample_id, "Running job");
		match request {
			JobRequest::FindPeaks(payload) => to_value(self.find_peaks(payload, false)?),
			JobRequest::FindPeaksWithTemplate(payload) => to_value(self.find_peaks(payload, true)?),
			JobRequest::GetExpandedGates(payload) => to_value(self.expanded_gates(payload)?),
			JobRequest::GetGatePopulationCounts(payload) => to_value(self.population_counts(payload)?),
			JobRequest::SaveNewSubsample(payload) => to_value(self.save_subsample(payload)?),
			JobRequest::InvalidatePopulations(payload) => to_value(self.invalidate(payload)),
		}
	}

	fn density(events: &SampleEvents, options: &GatingOptions) -> Result<(PlotScales, SampleDensity)> {
		let scales = PlotScales::for_options(options, events.matrix())?;
		let points = events.project(options.parameters())?;
		let density = estimate(points.iter().map(|(_, point)| *point), &scales);
		Ok((scales, density))
	}

	/// Extracts peaks, turns them into reconciled gates, appends the derived
	/// gates and counts every gate's population. A sample without events
	/// yields no peaks and no gates.
	pub fn find_peaks(&self, payload: &PeaksPayload, with_templates: bool) -> Result<FoundPeaks> {
		match self.gate_sample(payload, with_templates) {
			Err(GatingError::EmptyInput) => {
				info!(sample = %payload.sample.sample_id, "Sample has no events, nothing to gate");
				Ok(FoundPeaks { peaks: Vec::new(), gates: Vec::new() })
			},
			found => found,
		}
	}

	fn gate_sample(&self, payload: &PeaksPayload, with_templates: bool) -> Result<FoundPeaks> {
		let PeaksPayload { sample, options } = payload;
		let events = self.provider.sample_events(sample)?;
		if events.is_empty() {
			return Err(GatingError::EmptyInput);
		}

		let (scales, density) = Self::density(&events, options)?;
		let normalized = density.normalized();

		let mut extractor = PeakExtractor::new(HomologyOptions::from_gating(options)).on_progress(|level, levels| {
			if level % PROGRESS_STEP == 0 {
				debug!(level, levels, "Homology sweep progress");
			}
		});
		let peaks = if with_templates {
			extractor.find_peaks_with_templates(&normalized, &options.gate_templates)?
		} else {
			extractor.find_peaks(&normalized)?
		};

		let mut gates = gates_from_peaks(&sample.sample_id, &peaks, &density, &scales, options);
		gates.extend(derived_gates(&sample.sample_id, options));
		let gates = self.resolver.count_gates(&cache_key(sample), &events, &gates, options)?;

		info!(sample = %sample.sample_id, peaks = peaks.len(), gates = gates.len(), "Gated sample");
		Ok(FoundPeaks { peaks, gates })
	}

	pub fn expanded_gates(&self, payload: &GatesPayload) -> Result<Vec<Gate>> {
		let events = self.provider.sample_events(&payload.sample)?;
		let (scales, density) = Self::density(&events, &payload.options)?;
		Ok(expand_gates(&payload.gates, &density, &scales))
	}

	pub fn population_counts(&self, payload: &GatesPayload) -> Result<Vec<Gate>> {
		let events = self.provider.sample_events(&payload.sample)?;
		self.resolver.count_gates(&cache_key(&payload.sample), &events, &payload.gates, &payload.options)
	}

	/// Persists the members of `gate` as the included events of a new sample.
	pub fn save_subsample(&self, payload: &SubsamplePayload) -> Result<SavedSubsample> {
		let events = self.provider.sample_events(&payload.sample)?;
		let gates: Vec<Gate> = std::iter::once(payload.gate.clone()).chain(payload.related_gates.iter().cloned()).collect();
		let populations = self.resolver.resolve(&cache_key(&payload.sample), &events, &gates, &payload.options)?;
		let members = populations
			.into_iter()
			.next()
			.map(|population| population.members)
			.ok_or_else(|| GatingError::InvalidParameter(format!("gate {} has no population", payload.gate.id)))?;

		let child = payload.sample.child(payload.child_sample_id.clone());
		self.provider.save_included_events(&child, &members)?;
		self.resolver.invalidate_sample(&cache_key(&child));

		info!(parent = %payload.sample.sample_id, child = %child.sample_id, events = members.len(), "Saved subsample");
		Ok(SavedSubsample { sample_id: child.sample_id, event_count: members.len() })
	}

	/// Forgets cached populations of a sample after its gates changed.
	pub fn invalidate(&self, payload: &InvalidatePayload) -> Invalidated {
		let key = cache_key(&payload.sample);
		let removed = match &payload.gate_ids {
			Some(gate_ids) => self.resolver.invalidate_sample_gates(&key, gate_ids),
			None => self.resolver.invalidate_sample(&key),
		};
		debug!(sample = %payload.sample.sample_id, removed, "Invalidated cached populations");
		Invalidated { removed }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::{Channel, EventMatrix};
	use crate::gate::GateShape;
	use crate::options::ScaleKind;
	use crate::provider::InMemoryProvider;

	fn pipeline() -> (Pipeline, SampleRef) {
		let provider = InMemoryProvider::new();
		let rows = (0..100).map(|i| vec![f64::from(i % 10) * 10.0, f64::from(i / 10) * 10.0]).collect();
		let matrix = EventMatrix::from_rows(vec![Channel::new("a"), Channel::new("b")], rows).unwrap();
		provider.insert("ws", "f", matrix);
		(Pipeline::new(Arc::new(provider)), SampleRef::new("ws", "f", "f"))
	}

	fn options() -> GatingOptions {
		let mut options = GatingOptions::new(0, 1);
		options.plot_width = 100;
		options.plot_height = 100;
		options
	}

	fn left_half() -> Gate {
		Gate::new(
			"left",
			GateShape::Polygon { polygon: vec![[-1.0, -1.0], [45.0, -1.0], [45.0, 91.0], [-1.0, 91.0]], x_cutoffs: None, y_cutoffs: None },
			[0, 1],
			[ScaleKind::Linear; 2],
		)
	}

	#[test]
	fn counts_gates_through_requests() {
		let (pipeline, sample) = pipeline();
		let negative = Gate::new("rest", GateShape::Negative, [0, 1], [ScaleKind::Linear; 2]);
		let request = JobRequest::GetGatePopulationCounts(GatesPayload {
			sample,
			gates: vec![left_half(), negative],
			options: options(),
		});

		let gates: Vec<Gate> = pipeline.run(&request).data().unwrap();
		assert_eq!(gates[0].population_count, Some(50));
		assert_eq!(gates[1].population_count, Some(50));
	}

	#[test]
	fn saved_subsample_restricts_later_requests() {
		let (pipeline, sample) = pipeline();
		let saved = pipeline
			.save_subsample(&SubsamplePayload {
				sample: sample.clone(),
				child_sample_id: "left".into(),
				gate: left_half(),
				related_gates: Vec::new(),
				options: options(),
			})
			.unwrap();
		assert_eq!(saved, SavedSubsample { sample_id: "left".into(), event_count: 50 });

		let negative = Gate::new("rest", GateShape::Negative, [0, 1], [ScaleKind::Linear; 2]);
		let counted = pipeline
			.population_counts(&GatesPayload { sample: sample.child("left"), gates: vec![left_half(), negative], options: options() })
			.unwrap();
		assert_eq!(counted[0].population_count, Some(50));
		assert_eq!(counted[1].population_count, Some(0));
	}

	#[test]
	fn invalidation_requests_reach_the_population_cache() {
		let (pipeline, sample) = pipeline();
		let negative = Gate::new("rest", GateShape::Negative, [0, 1], [ScaleKind::Linear; 2]);
		let counts = GatesPayload { sample: sample.clone(), gates: vec![left_half(), negative], options: options() };
		pipeline.population_counts(&counts).unwrap();
		pipeline.population_counts(&GatesPayload { sample: sample.child("other"), ..counts.clone() }).unwrap();
		assert_eq!(pipeline.resolver().len(), 4);

		let request = JobRequest::InvalidatePopulations(InvalidatePayload {
			sample: sample.clone(),
			gate_ids: Some(vec!["rest".into()]),
		});
		let invalidated: Invalidated = pipeline.run(&request).data().unwrap();
		assert_eq!(invalidated.removed, 1);

		let request = JobRequest::InvalidatePopulations(InvalidatePayload { sample, gate_ids: None });
		let invalidated: Invalidated = pipeline.run(&request).data().unwrap();
		assert_eq!(invalidated.removed, 1);
		assert_eq!(pipeline.resolver().len(), 2);
	}

	#[test]
	fn invalid_channel_fails_with_kind() {
		let (pipeline, sample) = pipeline();
		let request = JobRequest::FindPeaks(PeaksPayload { sample, options: GatingOptions::new(0, 7) });

		let JobResponse::Fail { error } = pipeline.run(&request) else { panic!("expected failure") };
		assert_eq!(error.kind, "invalid-parameter");
	}

	#[test]
	fn empty_sample_has_no_peaks() {
		let provider = InMemoryProvider::new();
		let matrix = EventMatrix::from_rows(vec![Channel::new("a"), Channel::new("b")], Vec::new()).unwrap();
		provider.insert("ws", "empty", matrix);
		let pipeline = Pipeline::new(Arc::new(provider));
		let payload = PeaksPayload { sample: SampleRef::new("ws", "empty", "empty"), options: options() };

		assert!(matches!(pipeline.gate_sample(&payload, false), Err(GatingError::EmptyInput)));

		let response = pipeline.run(&JobRequest::FindPeaks(payload));
		let found: FoundPeaks = response.data().unwrap();
		assert!(found.peaks.is_empty());
		assert!(found.gates.is_empty());
	}

	#[test]
	fn flow_gates_are_not_expanded() {
		let (pipeline, sample) = pipeline();
		let gates = pipeline.expanded_gates(&GatesPayload { sample, gates: vec![left_half()], options: options() }).unwrap();
		let GateShape::Polygon { x_cutoffs, y_cutoffs, .. } = &gates[0].shape else { panic!("expected polygon") };
		assert_eq!((x_cutoffs, y_cutoffs), (&None, &None));
	}
}
