//! Error types for the convergence engine
//!
//! Provides structured error types for every stage of a reconciliation
//! cycle: desired-state validation, normalization, identity resolution,
//! diffing, and the remote management API.

use thiserror::Error;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Remote State Errors
    // =========================================================================
    /// Expected signal for the `Absent` state, never a cycle failure on fetch
    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Cannot delete {kind}/{name}: still referenced by {}", .dependents.join(", "))]
    DependencyExists {
        kind: String,
        name: String,
        dependents: Vec<String>,
    },

    #[error("Modification of {} is not supported for {kind}/{name}", .fields.join(", "))]
    UnsupportedModification {
        kind: String,
        name: String,
        fields: Vec<String>,
    },

    // =========================================================================
    // Desired State Errors
    // =========================================================================
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown value '{value}' for {field}, expected one of: {}", .allowed.join(", "))]
    UnknownEnumValue {
        field: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("Invalid file matching criteria: {0}")]
    InvalidCriteria(String),

    #[error("Parameter validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Identity Errors
    // =========================================================================
    #[error("{kind} '{name}' not found{}", .provider.as_ref().map(|p| format!(" in provider {}", p)).unwrap_or_default())]
    IdentityNotFound {
        kind: String,
        name: String,
        provider: Option<String>,
    },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("{operation} failed{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Transport {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad class of an error, used for reporting and process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Remote object does not exist
    NotFound,
    /// Desired state rejected before any remote mutation
    InvalidInput,
    /// A referenced trustee, provider or certificate does not exist
    Identity,
    /// Desired change is not allowed against the current remote state
    Conflict,
    /// Remote call failed
    Transport,
    /// Local setup or engine fault
    Internal,
}

impl ErrorClass {
    /// Process exit code for this class
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorClass::InvalidInput => 2,
            ErrorClass::Identity => 3,
            ErrorClass::Conflict => 4,
            ErrorClass::NotFound => 5,
            ErrorClass::Transport => 6,
            ErrorClass::Internal => 1,
        }
    }
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotFound { .. } => ErrorClass::NotFound,

            Error::InvalidValue { .. }
            | Error::UnknownEnumValue { .. }
            | Error::InvalidCriteria(_)
            | Error::Validation(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorClass::InvalidInput,

            Error::IdentityNotFound { .. } => ErrorClass::Identity,

            Error::DependencyExists { .. } | Error::UnsupportedModification { .. } => {
                ErrorClass::Conflict
            }

            Error::Transport { .. } | Error::Http(_) => ErrorClass::Transport,

            Error::Internal(_) | Error::Configuration(_) | Error::Io(_) => ErrorClass::Internal,
        }
    }

    /// Check if this error was raised before anything was sent to the appliance
    pub fn is_input_error(&self) -> bool {
        matches!(self.class(), ErrorClass::InvalidInput | ErrorClass::Identity)
    }

    /// Build an `InvalidValue` error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Build a `Transport` error for a failed remote operation
    pub fn transport(operation: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Transport {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = Error::UnsupportedModification {
            kind: "smb_share".into(),
            name: "finance".into(),
            fields: vec!["path".into()],
        };
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(err.class().exit_code(), 4);

        let err = Error::invalid("directory_create_mask", "not octal");
        assert_eq!(err.class(), ErrorClass::InvalidInput);
        assert!(err.is_input_error());

        let err = Error::transport("update nfs_export", Some(500), "internal error");
        assert_eq!(err.class(), ErrorClass::Transport);
        assert!(!err.is_input_error());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::IdentityNotFound {
            kind: "user".into(),
            name: "alice".into(),
            provider: Some("lsa-local-provider:System".into()),
        };
        assert_eq!(
            err.to_string(),
            "user 'alice' not found in provider lsa-local-provider:System"
        );

        let err = Error::transport("get smb_share", Some(401), "Authorization required");
        assert_eq!(
            err.to_string(),
            "get smb_share failed (HTTP 401): Authorization required"
        );

        let err = Error::DependencyExists {
            kind: "filesystem".into(),
            name: "/ifs/data".into(),
            dependents: vec!["nfs_export 3".into(), "smb_share data".into()],
        };
        assert!(err.to_string().contains("nfs_export 3, smb_share data"));
    }
}
