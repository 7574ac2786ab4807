//! Error types for Lattice operations

use std::time::Duration;
use thiserror::Error;

/// Input validation errors (4xx class).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Disallowed identifier for {field}: {value:?} (must match [a-zA-Z0-9][a-zA-Z0-9._-]{{0,252}})")]
    DisallowedIdentifier { field: String, value: String },

    #[error("Disallowed edge reference for {field}: {value:?} (non-empty, <= 512 chars, no quotes/braces/semicolons/backslashes/backticks/NUL)")]
    DisallowedEdgeReference { field: String, value: String },

    #[error("Unknown entity type: {type_name}")]
    UnknownEntityType { type_name: String },

    #[error("tenant_id must be non-empty on every persisted entity")]
    EmptyTenant,

    #[error("Invalid value for {field}: {value} - {reason}")]
    OutOfRange {
        field: String,
        value: String,
        reason: String,
    },
}

/// Tenant-scope and content-safety violations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SecurityError {
    #[error("Tenant scope violation: {reason}")]
    TenantScopeViolation { reason: String },

    #[error("Security violation: {reason}")]
    SecurityViolation { reason: String },

    #[error("Ingest rejected: {reason}")]
    IngestRejection { reason: String },

    #[error("Sanitization budget exceeded: {size} bytes > {limit} byte cap")]
    SanitizationBudgetExceeded { size: usize, limit: usize },

    #[error("Path traversal detected: {path}")]
    PathTraversal { path: String },
}

/// Circuit breaker, lock, and backpressure errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResilienceError {
    #[error("Circuit is open; retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Half-open call limit reached")]
    HalfOpenExhausted,

    #[error("Lock unavailable for {key}")]
    LockUnavailable { key: String },

    #[error("Lock ownership lost for {key}")]
    LockLost { key: String },

    #[error("Bounded task set at capacity; task rejected")]
    TaskSetOverflow,
}

/// Context assembly errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContextError {
    #[error("Context budget exceeded: {needed} tokens > {limit} ceiling")]
    BudgetExceeded { needed: usize, limit: usize },

    #[error("Context block delimiter failed validation")]
    DelimiterInvalid,
}

/// Ingestion pipeline errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IngestionError {
    #[error("AST worker fleet unavailable; retry after {retry_after_seconds}s")]
    Degraded { retry_after_seconds: u64 },

    #[error("Commit failed: {reason}")]
    CommitFailed { reason: String },

    #[error("Workspace exceeds byte cap: {bytes} > {limit}")]
    WorkspaceTooLarge { bytes: u64, limit: u64 },

    #[error("Staged file unreadable: {path}")]
    StagingFileUnreadable { path: String },
}

/// Errors surfaced by external stores (graph driver, vector store, Redis).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Driver-reported failure with unclassified message text.
    #[error("Driver error: {message}")]
    Driver { message: String },

    /// Network-class failure (connection refused, reset, OS error).
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Store request timed out")]
    Timeout,

    /// Provider rate limiting (HTTP 429, RESOURCE_EXHAUSTED, quota).
    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

/// Master error type for all Lattice operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LatticeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Resilience error: {0}")]
    Resilience(#[from] ResilienceError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for Lattice operations.
pub type LatticeResult<T> = Result<T, LatticeError>;

// ============================================================================
// FAILURE CLASSIFICATION
// ============================================================================

const RATE_LIMIT_MARKERS: [&str; 4] = ["429", "resource_exhausted", "quota exceeded", "quota"];

const NETWORK_MARKERS: [&str; 6] = [
    "connection refused",
    "connection reset",
    "broken pipe",
    "timed out",
    "timeout",
    "os error",
];

/// Classify whether a failure should trip the global provider breaker.
///
/// Only network-class failures are global: connection refused/reset, OS
/// errors, timeouts. Provider rate limiting (HTTP 429, RESOURCE_EXHAUSTED,
/// quota exhaustion) is tenant-local by definition and must never
/// short-circuit other tenants.
pub fn is_global_failure(err: &LatticeError) -> bool {
    match err {
        LatticeError::Store(StoreError::Unavailable { .. })
        | LatticeError::Store(StoreError::Timeout) => true,
        LatticeError::Store(StoreError::RateLimited { .. }) => false,
        LatticeError::Store(StoreError::Driver { message }) => {
            let text = message.to_ascii_lowercase();
            if RATE_LIMIT_MARKERS.iter().any(|m| text.contains(m)) {
                return false;
            }
            NETWORK_MARKERS.iter().any(|m| text.contains(m))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_global() {
        let err = LatticeError::Store(StoreError::Unavailable {
            message: "connection refused".to_string(),
        });
        assert!(is_global_failure(&err));
        assert!(is_global_failure(&LatticeError::Store(StoreError::Timeout)));
    }

    #[test]
    fn test_rate_limits_are_tenant_local() {
        let explicit = LatticeError::Store(StoreError::RateLimited {
            message: "429 Too Many Requests".to_string(),
        });
        assert!(!is_global_failure(&explicit));

        let textual = LatticeError::Store(StoreError::Driver {
            message: "RESOURCE_EXHAUSTED: quota exceeded for tenant".to_string(),
        });
        assert!(!is_global_failure(&textual));
    }

    #[test]
    fn test_driver_text_classification_falls_back_to_network_markers() {
        let err = LatticeError::Store(StoreError::Driver {
            message: "write failed: Connection refused (os error 111)".to_string(),
        });
        assert!(is_global_failure(&err));

        let err = LatticeError::Store(StoreError::Driver {
            message: "constraint violation on Service.id".to_string(),
        });
        assert!(!is_global_failure(&err));
    }

    #[test]
    fn test_validation_errors_never_trip_global() {
        let err = LatticeError::Validation(ValidationError::EmptyTenant);
        assert!(!is_global_failure(&err));
    }
}
