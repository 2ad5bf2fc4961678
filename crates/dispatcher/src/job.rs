use std::fmt;
use std::sync::Arc;

use gating::{JobRequest, JobResponse};
use tokio::sync::oneshot;

use crate::error::DispatchError;

pub type Outcome = Result<JobResponse, DispatchError>;

/// Whether the caller still wants the result. Checked when the job is
/// dequeued and again before delivery.
pub type Validity = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
	#[default]
	Normal,
	High,
}

pub struct Job {
	pub key: String,
	pub request: JobRequest,
	validity: Validity,
}

impl Job {
	/// A job keyed by its request, valid until told otherwise.
	#[must_use]
	pub fn new(request: JobRequest) -> Self {
		Self { key: request.dedup_key(), request, validity: Arc::new(|| true) }
	}

	#[must_use]
	pub fn with_key(mut self, key: impl Into<String>) -> Self {
		self.key = key.into();
		self
	}

	#[must_use]
	pub fn with_validity(mut self, validity: impl Fn() -> bool + Send + Sync + 'static) -> Self {
		self.validity = Arc::new(validity);
		self
	}

	pub(crate) fn into_parts(self) -> (String, JobRequest, Validity) {
		(self.key, self.request, self.validity)
	}
}

impl fmt::Debug for Job {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Job").field("key", &self.key).field("kind", &self.request.kind()).finish_non_exhaustive()
	}
}

pub(crate) struct Subscriber {
	validity: Validity,
	sender: oneshot::Sender<Outcome>,
}

impl Subscriber {
	pub(crate) fn new(validity: Validity) -> (Self, Subscription) {
		let (sender, receiver) = oneshot::channel();
		(Self { validity, sender }, Subscription { receiver })
	}

	pub(crate) fn is_valid(&self) -> bool {
		(self.validity)()
	}

	/// Returns false when the subscriber was skipped.
	pub(crate) fn deliver(self, outcome: Outcome) -> bool {
		if !self.is_valid() {
			return false;
		}
		self.sender.send(outcome).is_ok()
	}
}

/// Receives the outcome of one submission.
#[derive(Debug)]
pub struct Subscription {
	receiver: oneshot::Receiver<Outcome>,
}

impl Subscription {
	/// `None` when the job was dropped without delivering to this subscriber.
	pub async fn outcome(self) -> Option<Outcome> {
		self.receiver.await.ok()
	}
}
