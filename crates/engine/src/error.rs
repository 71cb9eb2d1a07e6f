//! Engine-wide error classification.
//!
//! Every failure a caller can see maps onto one of these kinds; the HTTP
//! layer turns them into status codes with [`EngineError::http_status`].

use thiserror::Error;

use mailfleet_adapters::GraphError;
use mailfleet_storage::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("throttled; retry after {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// HTTP status the REST layer responds with for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::AuthFailed(_) => 401,
            EngineError::PermissionDenied(_) => 403,
            EngineError::NotFound(_) => 404,
            EngineError::Timeout(_) => 408,
            EngineError::Conflict(_) => 409,
            EngineError::Throttled { .. } => 429,
            EngineError::Validation(_) => 400,
            EngineError::Transient(_) | EngineError::Storage(_) => 500,
            EngineError::Permanent(_) => 502,
        }
    }
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::AuthFailed(msg) => EngineError::AuthFailed(msg),
            GraphError::Throttled { retry_after_secs } => {
                EngineError::Throttled { retry_after_secs }
            }
            GraphError::NotFound(msg) => EngineError::NotFound(msg),
            GraphError::Transient(msg) | GraphError::Network(msg) => EngineError::Transient(msg),
            GraphError::Permanent(msg) | GraphError::Decode(msg) => EngineError::Permanent(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_align_with_kinds() {
        assert_eq!(EngineError::AuthFailed("x".into()).http_status(), 401);
        assert_eq!(EngineError::PermissionDenied("x".into()).http_status(), 403);
        assert_eq!(EngineError::NotFound("x".into()).http_status(), 404);
        assert_eq!(EngineError::Timeout("x".into()).http_status(), 408);
        assert_eq!(EngineError::Conflict("x".into()).http_status(), 409);
        assert_eq!(
            EngineError::Throttled { retry_after_secs: 30 }.http_status(),
            429
        );
    }

    #[test]
    fn graph_errors_map_to_engine_kinds() {
        let err: EngineError = GraphError::Throttled { retry_after_secs: 9 }.into();
        assert!(matches!(err, EngineError::Throttled { retry_after_secs: 9 }));

        let err: EngineError = GraphError::AuthFailed("bad token".into()).into();
        assert!(matches!(err, EngineError::AuthFailed(_)));
    }
}
