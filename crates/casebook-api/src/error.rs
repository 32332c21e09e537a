use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    /// The caller lacks a valid approval for the client (HTTP 403).
    #[error("missing approval: {message}")]
    MissingApproval { message: String },
    #[error("{resource} not found")]
    NotFound { resource: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Access denials are expected while an approval is pending and are
    /// treated as "no data yet" by pollers.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, ApiError::MissingApproval { .. })
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
