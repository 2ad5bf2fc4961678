use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dispatcher::{Dispatcher, DispatcherConfig, Endpoint, HttpTransport, Job, Priority, ProcessWorker, Supervisor, Worker, WorkerTransport};
use gating::JobRequest;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Starts the worker pool and runs JSON job requests read line by line from
/// stdin, printing one JSON outcome per line.
#[derive(Debug, Parser)]
#[command(name = "dispatcher", version)]
struct Args {
	#[arg(long, default_value = "config.toml")]
	config: String,
}

/// One stdin line: a job request, optionally with its own dedup key and
/// priority.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Submission {
	#[serde(default)]
	key: Option<String>,
	#[serde(default)]
	priority: bool,
	request: JobRequest,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let args = Args::parse();
	let config = DispatcherConfig::load(&args.config).context("Failed to load configuration")?;
	info!(slots = config.slot_count(), "Configuration loaded");

	let transport: Arc<dyn WorkerTransport> = Arc::new(HttpTransport::new(config.request_timeout())?);
	let workers: Vec<Box<dyn Worker>> = (0..config.slot_count())
		.map(|slot| {
			let port = config.worker.base_port + u16::try_from(slot).unwrap_or(u16::MAX);
			let endpoint = Endpoint::new(config.worker.host.clone(), port);
			Box::new(ProcessWorker::new(&config.worker.binary, &config.worker.assets, endpoint)) as Box<dyn Worker>
		})
		.collect();

	let mut supervisor =
		Supervisor::new(workers, Arc::clone(&transport), config.heartbeat_interval(), config.heartbeat_timeout());
	supervisor.start_all().await?;
	let endpoints = supervisor.endpoints();

	let (shutdown, shutdown_rx) = watch::channel(false);
	let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));
	let dispatcher = Dispatcher::start(transport, endpoints, config.poll_interval());

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		tokio::select! {
			line = lines.next_line() => {
				match line.context("Failed to read stdin")? {
					Some(line) if line.trim().is_empty() => {},
					Some(line) => submit(&dispatcher, &line),
					None => break,
				}
			},
			_ = tokio::signal::ctrl_c() => {
				info!("Interrupted");
				break;
			},
		}
	}

	dispatcher.shutdown().await;
	let _ = shutdown.send(true);
	if let Err(err) = supervisor_task.await {
		error!("Supervisor task failed: {err}");
	}

	Ok(())
}

fn submit(dispatcher: &Dispatcher, line: &str) {
	let submission: Submission = match serde_json::from_str(line) {
		Ok(submission) => submission,
		Err(err) => {
			warn!("Ignoring malformed submission: {err}");
			return;
		},
	};

	let mut job = Job::new(submission.request);
	if let Some(key) = submission.key {
		job = job.with_key(key);
	}
	let key = job.key.clone();
	let priority = if submission.priority { Priority::High } else { Priority::Normal };
	let subscription = dispatcher.submit(job, priority);

	tokio::spawn(async move {
		let line = match subscription.outcome().await {
			Some(Ok(response)) => json!({"key": key, "response": response}),
			Some(Err(err)) => json!({"key": key, "error": err.to_string()}),
			None => return,
		};
		println!("{line}");
	});
}
