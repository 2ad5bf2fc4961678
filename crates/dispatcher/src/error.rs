use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
	/// Both the first attempt and the retry failed.
	#[error("worker transport failed after retry: {0}")]
	TransportFailure(String),
}
