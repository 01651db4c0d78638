pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Invalid pipeline state: {message}")]
	InvalidState { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Retrieval error: {message}")]
	Retrieval { message: String },
	#[error("{operation} timed out after {timeout_ms} ms.")]
	Timeout { operation: String, timeout_ms: u64 },
}
impl From<larder_domain::Error> for Error {
	fn from(err: larder_domain::Error) -> Self {
		match err {
			larder_domain::Error::InvalidConfig { message } => Self::InvalidRequest { message },
		}
	}
}

impl From<larder_providers::Error> for Error {
	fn from(err: larder_providers::Error) -> Self {
		Self::Provider { message: err.to_string() }
	}
}
