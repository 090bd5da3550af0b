//! Structured error types for steward
//!
//! Mirrors the error taxonomy of spec.md §7: every subsystem failure is a
//! variant here, never a bare `String` or a swallowed `Result`.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for steward-core operations
#[derive(Error, Debug)]
pub enum StewardError {
    // =====================================================================
    // Validation (§7.1) — bad input, never retried
    // =====================================================================
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("missing required configuration: {key}")]
    MissingConfig { key: String },

    // =====================================================================
    // Policy denial (§7.2) — never silently retried
    // =====================================================================
    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    // =====================================================================
    // Conflict (§7.3) — optimistic concurrency, retried with backoff
    // =====================================================================
    #[error("version conflict on {entity} {id}: expected {expected}, found {found}")]
    Conflict {
        entity: String,
        id: String,
        expected: u64,
        found: u64,
    },

    // =====================================================================
    // Store failure modes (§4.1)
    // =====================================================================
    #[error("not found: {entity} {id}")]
    NotFound { entity: String, id: String },

    #[error("constraint violation: {message}")]
    ConstraintViolation { message: String },

    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    // =====================================================================
    // Transient I/O (§7.4) — retried with backoff, then circuit-broken
    // =====================================================================
    #[error("connector {name} unhealthy: {reason}")]
    ConnectorUnhealthy { name: String, reason: String },

    // =====================================================================
    // Timeout (§7.5)
    // =====================================================================
    #[error("operation timed out after {duration:?}: {what}")]
    Timeout { what: String, duration: Duration },

    // =====================================================================
    // Invariant violation (§7.6) — treated as a bug, raises an incident
    // =====================================================================
    #[error("invariant violated: {message}")]
    InvariantViolation { message: String },

    // =====================================================================
    // Incident (§7.7)
    // =====================================================================
    #[error("incident: {message}")]
    Incident { message: String },

    // =====================================================================
    // Approval / gate specifics
    // =====================================================================
    #[error("approval {id} not found")]
    ApprovalNotFound { id: String },

    #[error("approval {id} already resolved")]
    ApprovalAlreadyResolved { id: String },

    #[error("approval {id} expired")]
    ApprovalExpired { id: String },

    // =====================================================================
    // Safe-edit specifics
    // =====================================================================
    #[error("edit rejected: {reasons:?}")]
    EditRejected { reasons: Vec<String> },

    #[error("backup {id} not found")]
    BackupNotFound { id: String },

    // =====================================================================
    // Bus specifics
    // =====================================================================
    #[error("bus overflow on topic {topic}")]
    BusOverflow { topic: String },

    // =====================================================================
    // External error wrappers (transparent)
    // =====================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("serialization error: {0}")]
    Serialization { message: String },

    // =====================================================================
    // Internal
    // =====================================================================
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("not implemented: {feature}")]
    NotImplemented { feature: String },
}

impl StewardError {
    /// Check if error is retryable (transient) per spec.md §7
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::StorageUnavailable { .. }
                | Self::ConnectorUnhealthy { .. }
                | Self::Timeout { .. }
        )
    }

    /// Suggested retry delay, matching the `retry_after` hint of spec.md §7.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Conflict { .. } => Some(Duration::from_millis(50)),
            Self::StorageUnavailable { .. } => Some(Duration::from_millis(200)),
            Self::ConnectorUnhealthy { .. } => Some(Duration::from_secs(5)),
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    /// Structured `{code, message, details}` triple for the API/CLI surface.
    pub fn structured(&self) -> (&'static str, String, Option<String>) {
        let code = match self {
            Self::Validation { .. } | Self::InvalidConfig { .. } | Self::MissingConfig { .. } => {
                "validation"
            }
            Self::PolicyDenied { .. } => "policy_denied",
            Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } | Self::ApprovalNotFound { .. } | Self::BackupNotFound { .. } => {
                "not_found"
            }
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::ConnectorUnhealthy { .. } => "connector_unhealthy",
            Self::Timeout { .. } => "timeout",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::Incident { .. } => "incident",
            Self::ApprovalAlreadyResolved { .. } => "approval_already_resolved",
            Self::ApprovalExpired { .. } => "approval_expired",
            Self::EditRejected { .. } => "edit_rejected",
            Self::BusOverflow { .. } => "bus_overflow",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
            Self::NotImplemented { .. } => "not_implemented",
        };
        (code, self.to_string(), None)
    }

    /// Exit code for the CLI surface per spec.md §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } | Self::InvalidConfig { .. } | Self::MissingConfig { .. } => 2,
            Self::PolicyDenied { .. } => 3,
            Self::StorageUnavailable { .. } => 4,
            _ => 1,
        }
    }
}

impl From<anyhow::Error> for StewardError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return Self::Io(std::io::Error::new(io_err.kind(), io_err.to_string()));
        }
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StewardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<toml::de::Error> for StewardError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StewardError>;

/// Extension trait mirroring the teacher's `OptionExt`.
pub trait OptionExt<T> {
    fn ok_or_not_found(self, entity: &str, id: impl Into<String>) -> Result<T>;
    fn ok_or_missing(self, key: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, entity: &str, id: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| StewardError::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        })
    }

    fn ok_or_missing(self, key: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| StewardError::MissingConfig { key: key.into() })
    }
}
