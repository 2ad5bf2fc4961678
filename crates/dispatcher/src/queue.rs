use std::collections::{HashMap, VecDeque};

use gating::JobRequest;
use parking_lot::Mutex;
use tracing::debug;

use crate::job::{Job, Outcome, Priority, Subscriber, Subscription};

/// A job taken off the queue, owned by one worker slot until completed.
pub struct Entry {
	pub key: String,
	pub request: JobRequest,
	subscribers: Vec<Subscriber>,
}

impl Entry {
	fn any_valid(&self) -> bool {
		self.subscribers.iter().any(Subscriber::is_valid)
	}
}

#[derive(Default)]
struct Inner {
	priority: VecDeque<Entry>,
	normal: VecDeque<Entry>,
	/// Subscribers that joined a key while it was running.
	in_flight: HashMap<String, Vec<Subscriber>>,
}

fn position(queue: &VecDeque<Entry>, key: &str) -> Option<usize> {
	queue.iter().position(|entry| entry.key == key)
}

/// Two-level job queue. At most one entry per key is pending or running at
/// any time; later submissions of the same key subscribe to it.
#[derive(Default)]
pub struct JobQueue {
	inner: Mutex<Inner>,
}

impl JobQueue {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn submit(&self, job: Job, priority: Priority) -> Subscription {
		let (key, request, validity) = job.into_parts();
		let (subscriber, subscription) = Subscriber::new(validity);
		let mut inner = self.inner.lock();

		if let Some(subscribers) = inner.in_flight.get_mut(&key) {
			debug!(key = %key, "Joined running job");
			subscribers.push(subscriber);
			return subscription;
		}

		if let Some(index) = position(&inner.priority, &key) {
			inner.priority[index].subscribers.push(subscriber);
			return subscription;
		}

		if let Some(index) = position(&inner.normal, &key) {
			if priority == Priority::High {
				if let Some(mut entry) = inner.normal.remove(index) {
					debug!(key = %key, "Promoted pending job");
					entry.subscribers.push(subscriber);
					inner.priority.push_back(entry);
				}
			} else {
				inner.normal[index].subscribers.push(subscriber);
			}
			return subscription;
		}

		let entry = Entry { key, request, subscribers: vec![subscriber] };
		match priority {
			Priority::High => inner.priority.push_back(entry),
			Priority::Normal => inner.normal.push_back(entry),
		}
		subscription
	}

	/// Next job to run, priority queue first. Jobs nobody wants any more are
	/// dropped on the way.
	pub fn take(&self) -> Option<Entry> {
		let mut inner = self.inner.lock();
		loop {
			let entry = inner.priority.pop_front().or_else(|| inner.normal.pop_front())?;
			if entry.any_valid() {
				inner.in_flight.insert(entry.key.clone(), Vec::new());
				return Some(entry);
			}
			debug!(key = %entry.key, kind = entry.request.kind(), "Dropped stale job");
		}
	}

	/// Delivers `outcome` to every still-valid subscriber of the entry, in the
	/// order they subscribed. Returns the number of deliveries.
	pub fn complete(&self, entry: Entry, outcome: &Outcome) -> usize {
		let late = self.inner.lock().in_flight.remove(&entry.key).unwrap_or_default();
		entry
			.subscribers
			.into_iter()
			.chain(late)
			.map(|subscriber| subscriber.deliver(outcome.clone()))
			.filter(|delivered| *delivered)
			.count()
	}

	#[must_use]
	pub fn pending(&self) -> usize {
		let inner = self.inner.lock();
		inner.priority.len() + inner.normal.len()
	}

	#[must_use]
	pub fn in_flight(&self) -> usize {
		self.inner.lock().in_flight.len()
	}
}
