use thiserror::Error;

/// Typed error hierarchy for the MXF substrate, covering the error kind
/// families of the error taxonomy (schema/authz/validation/execution/
/// external-server/storage/consistency/fatal).
///
/// Use at component boundaries (dispatcher, validation pipeline,
/// scheduler, memory layer, coordinator). Leaf/internal functions keep
/// using `anyhow::Result` — `Internal` lets them convert with `?`.
#[derive(Debug, Error)]
pub enum MxfError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("input error: {0}")]
    Input(String),

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    #[error("execution error ({kind:?}): {message}")]
    Execution { kind: ExecutionErrorKind, message: String },

    #[error("external tool-server error: {0}")]
    ExternalServer(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    Network,
    Timeout,
    ProviderRateLimit,
    ProviderError,
    InternalBug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

pub type MxfResult<T> = std::result::Result<T, MxfError>;

impl MxfError {
    /// Whether the error kind is retryable with backoff (timeouts, rate limits).
    pub fn is_retryable(&self) -> bool {
        match self {
            MxfError::Execution { kind, .. } => matches!(
                kind,
                ExecutionErrorKind::Timeout | ExecutionErrorKind::ProviderRateLimit
            ),
            MxfError::ExternalServer(_) => true,
            _ => false,
        }
    }

    /// The stable error `kind` string exposed in client-facing payloads.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            MxfError::UnknownTool(_) => "unknown_tool",
            MxfError::Input(_) => "input",
            MxfError::Authorization(_) => "authorization",
            MxfError::ValidationRejected(_) => "validation",
            MxfError::Execution { .. } => "execution",
            MxfError::ExternalServer(_) => "external_server",
            MxfError::Storage(_) => "storage",
            MxfError::Consistency(_) => "consistency",
            MxfError::Cancelled => "cancelled",
            MxfError::Timeout(_) => "timeout",
            MxfError::Fatal(_) => "fatal",
            MxfError::Internal(_) => "internal",
        }
    }

    /// Client-facing structured error payload: {kind, code, message, request_id}.
    pub fn to_payload(&self, request_id: &str) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind_tag().to_string(),
            code: self.kind_tag().to_uppercase(),
            message: self.to_string(),
            request_id: request_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub code: String,
    pub message: String,
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_timeout_is_retryable() {
        let err = MxfError::Execution {
            kind: ExecutionErrorKind::Timeout,
            message: "slow".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn authorization_not_retryable() {
        let err = MxfError::Authorization("tool not in allow-list".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn payload_carries_request_id() {
        let err = MxfError::UnknownTool("frobnicate".into());
        let payload = err.to_payload("r1");
        assert_eq!(payload.request_id, "r1");
        assert_eq!(payload.kind, "unknown_tool");
    }
}
