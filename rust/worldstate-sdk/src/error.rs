use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Transport unreachable, reset or closed. Safe to retry.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Response of {size} bytes exceeds max message size of {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ClientError {
    pub(crate) fn connection(reason: impl Into<String>) -> Self {
        ClientError::Connection(reason.into())
    }

    pub(crate) fn closed() -> Self {
        ClientError::Connection("client closed".to_string())
    }

    /// Only transport failures are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Connection(format!("WebSocket error: {}", e))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Model {model} could not be decoded: {reason}")]
    Model { model: String, reason: String },

    #[error("Entity {hashed_keys} has created_at {created_at} after updated_at {updated_at}")]
    Timestamps {
        hashed_keys: String,
        created_at: u64,
        updated_at: u64,
    },

    #[error("Unexpected message: {0}")]
    Unexpected(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_retryable() {
        assert!(ClientError::closed().is_retryable());
        assert!(!ClientError::InvalidQuery("limit".into()).is_retryable());
        assert!(!ClientError::ResponseTooLarge { size: 2, max: 1 }.is_retryable());
        assert!(!ClientError::Decode(DecodeError::Malformed("x".into())).is_retryable());
    }
}
