//! Error types for pa-core.

use thiserror::Error;

use crate::llm::Provider;

/// Result type alias using pa-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Kinds of provider-level failures, used by the gateway to classify
/// errors as transient (retryable) or permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// 429 / provider-side rate limiting
    RateLimited,
    /// Network-level connection failure
    ConnectionFailed,
    /// Request-level timeout
    Timeout,
    /// 5xx from the provider
    ServerError,
    /// Provider reported itself unavailable
    ServiceUnavailable,
    /// Provider-side deadline exceeded
    DeadlineExceeded,
    /// Invalid or missing credentials
    Authentication,
    /// Malformed request rejected by the provider
    BadRequest,
    /// Unknown model or deployment
    ModelNotFound,
    /// Caller lacks permission for the model/operation
    PermissionDenied,
    /// Provider rejected a request argument
    InvalidArgument,
    /// Provider returned output that could not be parsed in the
    /// requested response format
    MalformedResponse,
}

impl ProviderErrorKind {
    /// Whether this failure class is worth retrying on the same provider.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ConnectionFailed
                | Self::Timeout
                | Self::ServerError
                | Self::ServiceUnavailable
                | Self::DeadlineExceeded
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::ConnectionFailed => "connection_failed",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Authentication => "authentication",
            Self::BadRequest => "bad_request",
            Self::ModelNotFound => "model_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidArgument => "invalid_argument",
            Self::MalformedResponse => "malformed_response",
        };
        write!(f, "{}", s)
    }
}

/// A typed error from a single provider call.
///
/// Wrapper errors keep this as their `#[source]` so classification can
/// walk the cause chain and find the original failure kind.
#[derive(Error, Debug)]
#[error("{provider} provider error ({kind}): {message}")]
pub struct ProviderError {
    pub provider: Provider,
    pub kind: ProviderErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    pub fn new(provider: Provider, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// Errors that can occur during case orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad intake data; the case is not created
    #[error("Validation error: {0}")]
    Validation(String),

    /// No structured or textual policy for a payer/medication pair
    #[error("No policy found for {payer}/{medication}")]
    PolicyNotFound { payer: String, medication: String },

    /// Prompt file missing or path escaped the prompt root
    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    /// Unknown case id
    #[error("Case not found: {0}")]
    CaseNotFound(String),

    /// Concurrent update lost the version race; retry from a fresh read
    #[error("Optimistic lock failed for case {case_id}: expected version {expected}, found {found}")]
    OptimisticLockFailed {
        case_id: String,
        expected: i64,
        found: i64,
    },

    /// LLM returned output missing the fields an assessment requires
    #[error("Malformed assessment from LLM for payer {payer}: {message}")]
    MalformedAssessment { payer: String, message: String },

    /// Every routed provider failed; wraps the last cause
    #[error("All providers exhausted for task {task}")]
    GatewayExhausted {
        task: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A single provider call failed (classified by the gateway)
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Wall-clock timeout on an operation
    #[error("Operation timed out after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// SQLite-level failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a policy-not-found error.
    pub fn policy_not_found(payer: impl Into<String>, medication: impl Into<String>) -> Self {
        Self::PolicyNotFound {
            payer: payer.into(),
            medication: medication.into(),
        }
    }

    /// Create a malformed-assessment error.
    pub fn malformed_assessment(payer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedAssessment {
            payer: payer.into(),
            message: message.into(),
        }
    }

    /// Create a gateway-exhausted error wrapping the last provider failure.
    pub fn gateway_exhausted(
        task: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::GatewayExhausted {
            task: task.into(),
            source,
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_secs: u64) -> Self {
        Self::Timeout { duration_secs }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Classify an error chain as transient (retryable) or permanent.
///
/// Walks the `source()` chain looking for a [`ProviderError`] or a
/// [`Error::Timeout`]; wrapper layers added by clients or the gateway do
/// not hide the original classification. Unknown error types are treated
/// as transient (safer to retry once).
pub fn is_transient_error(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(provider_err) = err.downcast_ref::<ProviderError>() {
            return provider_err.kind.is_transient();
        }
        if let Some(core_err) = err.downcast_ref::<Error>() {
            match core_err {
                // `#[error(transparent)]` forwards source() past the
                // ProviderError itself, so match it here directly
                Error::Provider(provider_err) => return provider_err.kind.is_transient(),
                Error::Timeout { .. } => return true,
                // Parse failures in the requested response format are not
                // retryable on the same provider
                Error::Serialization(_) => return false,
                _ => {}
            }
        }
        current = err.source();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_kind_classification() {
        assert!(ProviderErrorKind::RateLimited.is_transient());
        assert!(ProviderErrorKind::Timeout.is_transient());
        assert!(ProviderErrorKind::ServerError.is_transient());
        assert!(ProviderErrorKind::ServiceUnavailable.is_transient());
        assert!(ProviderErrorKind::DeadlineExceeded.is_transient());
        assert!(ProviderErrorKind::ConnectionFailed.is_transient());

        assert!(!ProviderErrorKind::Authentication.is_transient());
        assert!(!ProviderErrorKind::BadRequest.is_transient());
        assert!(!ProviderErrorKind::ModelNotFound.is_transient());
        assert!(!ProviderErrorKind::PermissionDenied.is_transient());
        assert!(!ProviderErrorKind::InvalidArgument.is_transient());
        assert!(!ProviderErrorKind::MalformedResponse.is_transient());
    }

    #[test]
    fn test_classification_walks_cause_chain() {
        // A permanent auth error wrapped in a gateway-level error must
        // still classify as permanent.
        let inner = ProviderError::new(
            Provider::Claude,
            ProviderErrorKind::Authentication,
            "bad api key",
        );
        let wrapped = Error::gateway_exhausted("policy_reasoning", Some(Box::new(inner)));
        assert!(!is_transient_error(&wrapped));

        let inner = ProviderError::new(Provider::Gemini, ProviderErrorKind::RateLimited, "429");
        let wrapped = Error::gateway_exhausted("summary_generation", Some(Box::new(inner)));
        assert!(is_transient_error(&wrapped));
    }

    #[test]
    fn test_unknown_errors_are_transient() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "mystery");
        assert!(is_transient_error(&err));
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = Error::timeout(180);
        assert!(is_transient_error(&err));
    }

    #[test]
    fn test_optimistic_lock_message() {
        let err = Error::OptimisticLockFailed {
            case_id: "CASE-1".to_string(),
            expected: 3,
            found: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version 3"));
        assert!(msg.contains("found 4"));
    }
}
