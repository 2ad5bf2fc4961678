use std::time::Instant;

use actix_web::{Error, HttpResponse, Responder, web};
use gating::JobRequest;
use tracing::info;

use crate::models::HealthResponse;
use crate::state::AppState;

pub async fn health(state: web::Data<AppState>) -> impl Responder {
	HttpResponse::Ok().json(HealthResponse::ok(state.started_at()))
}

/// Runs one job on the blocking pool. Job-level failures are part of the
/// response body; only a crashed computation is an HTTP error.
pub async fn run_job(state: web::Data<AppState>, request: web::Json<JobRequest>) -> Result<impl Responder, Error> {
	let request = request.into_inner();
	let kind = request.kind();
	let sample_id = request.sample().sample_id.clone();
	let pipeline = state.pipeline();
	let started = Instant::now();

	let response = web::block(move || pipeline.run(&request))
		.await
		.map_err(|err| actix_web::error::ErrorInternalServerError(err.to_string()))?;

	info!(
		job = kind,
		sample = %sample_id,
		success = response.is_success(),
		elapsed_ms = started.elapsed().as_millis(),
		"Finished job"
	);
	Ok(HttpResponse::Ok().json(response))
}

#[cfg(test)]
mod tests {
	use std::f64::consts::PI;
	use std::sync::Arc;

	use actix_web::{App, http::StatusCode, test};
	use gating::gate::GateShape;
	use gating::protocol::FoundPeaks;
	use gating::{Channel, EventMatrix, GateTemplate, GatingOptions, InMemoryProvider, JobResponse};
	use serde_json::json;

	use super::*;

	/// Evenly filled disc of `count` events.
	fn disc(center: [f64; 2], radius: f64, count: usize) -> Vec<Vec<f64>> {
		let golden_angle = PI * (3.0 - 5.0_f64.sqrt());
		(0..count)
			.map(|i| {
				let r = radius * ((i as f64 + 0.5) / count as f64).sqrt();
				let theta = i as f64 * golden_angle;
				vec![center[0] + r * theta.cos(), center[1] + r * theta.sin()]
			})
			.collect()
	}

	fn state() -> AppState {
		let mut rows = disc([250.0, 250.0], 100.0, 5_000);
		rows.extend(disc([750.0, 750.0], 100.0, 5_000));
		let matrix = EventMatrix::from_rows(vec![Channel::new("CD3"), Channel::new("CD19")], rows).unwrap();

		let provider = InMemoryProvider::new();
		provider.insert("ws", "f1", matrix);
		AppState::new(Arc::new(provider))
	}

	fn options() -> GatingOptions {
		GatingOptions::new(0, 1)
	}

	fn sample() -> serde_json::Value {
		json!({"workspaceId": "ws", "fileId": "f1", "sampleId": "f1"})
	}

	macro_rules! app {
		($state:expr) => {
			test::init_service(
				App::new()
					.app_data(web::Data::new($state))
					.route("/health", web::get().to(health))
					.route("/jobs", web::post().to(run_job)),
			)
			.await
		};
	}

	#[actix_web::test]
	async fn health_reports_ok() {
		let app = app!(state());
		let req = test::TestRequest::get().uri("/health").to_request();
		let body: HealthResponse = test::call_and_read_body_json(&app, req).await;

		assert_eq!(body.status, "ok");
		assert_eq!(body.pid, std::process::id());
	}

	#[actix_web::test]
	async fn unknown_job_type_is_rejected() {
		let app = app!(state());
		let req = test::TestRequest::post()
			.uri("/jobs")
			.set_json(json!({"type": "render-plot", "payload": {}}))
			.to_request();

		let resp = test::call_service(&app, req).await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	}

	#[actix_web::test]
	async fn finds_two_populations() {
		let app = app!(state());
		let req = test::TestRequest::post()
			.uri("/jobs")
			.set_json(json!({"type": "find-peaks", "payload": {"sample": sample(), "options": options()}}))
			.to_request();

		let response: JobResponse = test::call_and_read_body_json(&app, req).await;
		let found: FoundPeaks = response.data().unwrap();
		assert_eq!(found.peaks.len(), 2);

		let polygons: Vec<_> = found.gates.iter().filter(|gate| gate.is_polygon()).collect();
		assert_eq!(polygons.len(), 2);
		assert_ne!(
			(polygons[0].x_group, polygons[0].y_group),
			(polygons[1].x_group, polygons[1].y_group)
		);

		let counts: Vec<usize> = polygons.iter().filter_map(|gate| gate.population_count).collect();
		assert_eq!(counts.iter().sum::<usize>(), 10_000);
		for count in counts {
			assert!(count.abs_diff(5_000) <= 250, "unbalanced population: {count}");
		}

		let negative = found.gates.iter().find(|gate| gate.shape == GateShape::Negative).unwrap();
		assert_eq!(negative.population_count, Some(0));
	}

	#[actix_web::test]
	async fn template_count_mismatch_fails() {
		let app = app!(state());
		let mut options = options();
		options.gate_templates = (0..3)
			.map(|i| GateTemplate { id: format!("t{i}"), x_group: i, y_group: i, bonus_iterations: 0 })
			.collect();

		let req = test::TestRequest::post()
			.uri("/jobs")
			.set_json(json!({"type": "find-peaks-with-template", "payload": {"sample": sample(), "options": options}}))
			.to_request();

		let response: JobResponse = test::call_and_read_body_json(&app, req).await;
		let JobResponse::Fail { error } = response else { panic!("expected failure") };
		assert_eq!(error.kind, "extraction-ambiguous");
	}

	#[actix_web::test]
	async fn subsample_then_count() {
		let state = state();
		let app = app!(state.clone());
		let gate = json!({
			"id": "low",
			"type": "polygon",
			"polygon": [[0.0, 0.0], [500.0, 0.0], [500.0, 500.0], [0.0, 500.0]],
			"parameters": [0, 1],
			"scales": ["linear", "linear"],
		});

		let req = test::TestRequest::post()
			.uri("/jobs")
			.set_json(json!({
				"type": "save-new-subsample",
				"payload": {"sample": sample(), "childSampleId": "low-cells", "gate": gate, "options": options()},
			}))
			.to_request();
		let response: JobResponse = test::call_and_read_body_json(&app, req).await;
		assert!(response.is_success());

		let req = test::TestRequest::post()
			.uri("/jobs")
			.set_json(json!({
				"type": "get-gate-population-counts",
				"payload": {
					"sample": {"workspaceId": "ws", "fileId": "f1", "sampleId": "low-cells"},
					"gates": [gate],
					"options": options(),
				},
			}))
			.to_request();
		let response: JobResponse = test::call_and_read_body_json(&app, req).await;
		let gates: Vec<gating::Gate> = response.data().unwrap();
		assert_eq!(gates[0].population_count, Some(5_000));
	}
}
