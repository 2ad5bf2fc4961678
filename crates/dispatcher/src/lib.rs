mod config;
mod error;
mod job;
mod pool;
mod queue;
mod supervisor;
mod transport;

pub use config::{DispatcherConfig, HeartbeatConfig, PoolConfig, WorkerConfig, default_slot_count};
pub use error::DispatchError;
pub use job::{Job, Outcome, Priority, Subscription, Validity};
pub use pool::Dispatcher;
pub use queue::{Entry, JobQueue};
pub use supervisor::{ProcessWorker, Supervisor, Worker};
pub use transport::{Endpoint, HttpTransport, WorkerTransport};
