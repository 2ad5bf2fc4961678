use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use anyhow::Context;
use clap::Parser;
use gating::FileMatrixProvider;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::{health, run_job};
use crate::state::AppState;

mod api;
mod models;
mod state;

// Gate lists and subsample payloads can carry large polygons.
const JSON_LIMIT: usize = 16 * 1024 * 1024;

/// Long-lived gating worker serving jobs over HTTP.
#[derive(Debug, Parser)]
#[command(name = "gating_worker", version)]
struct Args {
	#[arg(long, default_value_t = 8500)]
	port: u16,

	#[arg(long, default_value = "127.0.0.1")]
	host: String,

	/// Directory holding `workspaces/<workspace>/<file>/...`.
	#[arg(long, default_value = "assets")]
	assets: PathBuf,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let args = Args::parse();
	let state = AppState::new(Arc::new(FileMatrixProvider::new(&args.assets)));
	info!(host = %args.host, port = args.port, assets = %args.assets.display(), "Starting gating worker");

	HttpServer::new(move || {
		App::new()
			.app_data(web::Data::new(state.clone()))
			.app_data(web::JsonConfig::default().limit(JSON_LIMIT))
			.route("/health", web::get().to(health))
			.route("/jobs", web::post().to(run_job))
	})
	.bind((args.host.as_str(), args.port))
	.with_context(|| format!("Failed to bind {}:{}", args.host, args.port))?
	.run()
	.await?;

	Ok(())
}
