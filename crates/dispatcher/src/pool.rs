use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use gating::JobRequest;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::job::{Job, Outcome, Priority, Subscription};
use crate::queue::JobQueue;
use crate::transport::{Endpoint, WorkerTransport};

/// Polls the shared queue from one task per worker endpoint.
pub struct Dispatcher {
	queue: Arc<JobQueue>,
	shutdown: watch::Sender<bool>,
	slots: Vec<JoinHandle<()>>,
}

impl Dispatcher {
	/// Starts one slot per endpoint. Must be called inside a tokio runtime.
	#[must_use]
	pub fn start(transport: Arc<dyn WorkerTransport>, endpoints: Vec<Endpoint>, poll_interval: Duration) -> Self {
		let queue = Arc::new(JobQueue::new());
		let (shutdown, _) = watch::channel(false);

		let slots = endpoints
			.into_iter()
			.enumerate()
			.map(|(slot, endpoint)| {
				let slot = Slot {
					index: slot,
					endpoint,
					queue: Arc::clone(&queue),
					transport: Arc::clone(&transport),
					poll_interval,
				};
				tokio::spawn(slot.run(shutdown.subscribe()))
			})
			.collect::<Vec<_>>();

		info!(slots = slots.len(), "Dispatcher started");
		Self { queue, shutdown, slots }
	}

	pub fn submit(&self, job: Job, priority: Priority) -> Subscription {
		self.queue.submit(job, priority)
	}

	#[must_use]
	pub fn queue(&self) -> &JobQueue {
		&self.queue
	}

	/// Stops every slot after its current job.
	pub async fn shutdown(self) {
		let _ = self.shutdown.send(true);
		for result in join_all(self.slots).await {
			if let Err(err) = result {
				error!("Worker slot ended abnormally: {err}");
			}
		}
		info!("Dispatcher stopped");
	}
}

struct Slot {
	index: usize,
	endpoint: Endpoint,
	queue: Arc<JobQueue>,
	transport: Arc<dyn WorkerTransport>,
	poll_interval: Duration,
}

impl Slot {
	async fn run(self, mut shutdown: watch::Receiver<bool>) {
		debug!(slot = self.index, endpoint = %self.endpoint, "Worker slot polling");
		loop {
			if *shutdown.borrow() {
				break;
			}

			let Some(entry) = self.queue.take() else {
				tokio::select! {
					() = tokio::time::sleep(self.poll_interval) => {},
					changed = shutdown.changed() => {
						if changed.is_err() {
							break;
						}
					},
				}
				continue;
			};

			let outcome = self.execute(&entry.request).await;
			let delivered = self.queue.complete(entry, &outcome);
			debug!(slot = self.index, delivered, "Job completed");
		}
	}

	/// One attempt plus one retry, one poll interval later.
	async fn execute(&self, request: &JobRequest) -> Outcome {
		match self.transport.execute(&self.endpoint, request).await {
			Ok(response) => Ok(response),
			Err(first) => {
				warn!(slot = self.index, job = request.kind(), "Worker request failed, retrying: {first:#}");
				tokio::time::sleep(self.poll_interval).await;
				self.transport.execute(&self.endpoint, request).await.map_err(|second| {
					error!(slot = self.index, job = request.kind(), "Worker request failed twice: {second:#}");
					DispatchError::TransportFailure(second.to_string())
				})
			},
		}
	}
}
