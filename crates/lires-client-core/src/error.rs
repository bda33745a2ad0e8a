//! Error type shared by every component of the data layer.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A REST call returned a non-success status.
    #[error("request to {endpoint} failed with status {status}")]
    Status { status: u16, endpoint: String },

    /// The request never produced a response (connect, TLS, body read).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Only raised when the ingestor runs with [`MalformedPolicy::Fail`](crate::stream::MalformedPolicy::Fail).
    #[error("malformed record #{index} in stream: {reason}")]
    MalformedRecord { index: u64, reason: String },

    #[error("length mismatch: {records} records but {scores} scores")]
    LengthMismatch { records: usize, scores: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// HTTP status carried by the error, if it came from a server response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
