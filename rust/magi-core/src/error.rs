use std::time::Duration;

use thiserror::Error;

use crate::events::ErrorCode;
use crate::persona::PersonaName;

/// Core error type for the MAGI deliberation runtime.
#[derive(Error, Debug)]
pub enum MagiError {
    /// Prompt rejected before the pipeline started.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A guardrail provider denied the prompt.
    #[error("prompt denied by guardrail '{provider}': {reason}")]
    GuardrailDenied { provider: String, reason: String },

    /// Transient transport failure on an LLM call (network, 5xx).
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider signalled rate limiting (429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Authentication failure; never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A single LLM call exceeded its deadline.
    #[error("LLM call timed out after {seconds}s")]
    LlmTimeout { seconds: u64 },

    /// A payload failed JSON schema validation.
    #[error("schema validation failed: {0}")]
    SchemaInvalid(String),

    /// Vote regeneration attempts are exhausted; the persona is excluded.
    #[error("schema retries exceeded after {attempts} attempts: {}", .reasons.join("; "))]
    SchemaRetryExceeded { attempts: u32, reasons: Vec<String> },

    /// Fewer personas alive than the quorum floor.
    #[error("quorum loss: [{}]", .excluded.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", "))]
    QuorumLoss { excluded: Vec<PersonaName> },

    /// Semaphore acquisition timed out.
    #[error("concurrency limit reached: no permit within {waited_ms}ms")]
    ConcurrencyLimit { waited_ms: u64 },

    /// Backpressure emit did not complete within the configured window.
    #[error("streaming emit timed out after {0:?}")]
    StreamingTimeout(Duration),

    /// The whole session exceeded its deadline.
    #[error("session timed out after {seconds}s")]
    SessionTimeout { seconds: u64 },

    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,

    /// Template staging failed.
    #[error("template '{name}' load failed: {reason}")]
    TemplateLoad { name: String, reason: String },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invariant violation; detail stays server-side.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for runtime operations.
pub type MagiResult<T> = Result<T, MagiError>;

impl From<std::io::Error> for MagiError {
    fn from(err: std::io::Error) -> Self {
        MagiError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for MagiError {
    fn from(err: serde_json::Error) -> Self {
        MagiError::SchemaInvalid(err.to_string())
    }
}

impl MagiError {
    /// Whether a retry at the `LLMClient` layer can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MagiError::Transport(_) | MagiError::RateLimited(_) | MagiError::LlmTimeout { .. }
        )
    }

    /// Wire-level error code for the observer event stream.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MagiError::SessionTimeout { .. } => ErrorCode::Timeout,
            MagiError::Cancelled => ErrorCode::Cancelled,
            MagiError::Internal(_) | MagiError::Other(_) => ErrorCode::Internal,
            _ => ErrorCode::MagiCoreError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_loss_message_lists_excluded_set() {
        let err = MagiError::QuorumLoss {
            excluded: vec![PersonaName::Melchior, PersonaName::Balthasar],
        };
        assert_eq!(err.to_string(), "quorum loss: [MELCHIOR-1, BALTHASAR-2]");
    }

    #[test]
    fn test_retry_classification() {
        assert!(MagiError::Transport("reset".into()).is_retryable());
        assert!(MagiError::RateLimited("429".into()).is_retryable());
        assert!(!MagiError::Auth("bad key".into()).is_retryable());
        assert!(!MagiError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            MagiError::SessionTimeout { seconds: 120 }.error_code(),
            ErrorCode::Timeout
        );
        assert_eq!(
            MagiError::QuorumLoss { excluded: vec![] }.error_code(),
            ErrorCode::MagiCoreError
        );
    }
}
