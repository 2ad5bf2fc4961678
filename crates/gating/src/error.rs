use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatingError {
	#[error("sample has no events")]
	EmptyInput,

	#[error("peak extraction is ambiguous: {0}")]
	ExtractionAmbiguous(String),

	#[error("invalid parameter: {0}")]
	InvalidParameter(String),

	#[error("failed to read {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse {path}: {source}")]
	Parse {
		path: String,
		#[source]
		source: serde_json::Error,
	},
}

impl GatingError {
	/// Stable machine-readable name used on the wire.
	#[must_use]
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::EmptyInput => "empty-input",
			Self::ExtractionAmbiguous(_) => "extraction-ambiguous",
			Self::InvalidParameter(_) => "invalid-parameter",
			Self::Io { .. } => "io",
			Self::Parse { .. } => "parse",
		}
	}
}

pub type Result<T> = std::result::Result<T, GatingError>;
