use shared::protocol::ChannelStatus;
use thiserror::Error;

/// Failure of a single backend request.
#[derive(Debug, Error)]
pub enum ApiFailure {
    /// The request never produced a response (connect failure, decode
    /// failure, timeout).
    #[error("request failed: {0}")]
    Transport(String),
    /// The backend answered non-2xx with an `{"error": ...}` body.
    #[error("server rejected request ({status}): {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for ApiFailure {
    fn from(err: reqwest::Error) -> Self {
        ApiFailure::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network failure: {0}")]
    Network(#[from] ApiFailure),
    #[error("live channel degraded: {0:?}")]
    ChannelDegraded(ChannelStatus),
    #[error("view is closed")]
    Closed,
}
