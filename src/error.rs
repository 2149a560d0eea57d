//! Error types for the NFS volume provisioner
//!
//! Provides structured error types for parameter validation, volume
//! identifier decoding, storage array calls and the API surface.

use thiserror::Error;

/// Unified error type for the provisioner
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
    // Request Validation Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Fail to validate {protocol} parameters, missing: {}", missing.join(", "))]
    MissingParameters {
        protocol: String,
        missing: Vec<String>,
    },

    #[error("Invalid volume ID {volume_id:?}: {reason}")]
    MalformedVolumeId { volume_id: String, reason: String },

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    // =========================================================================
    // Storage Array Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Filesystem limit reached: {count} of {max} filesystems in use")]
    FilesystemLimitReached { count: u64, max: u64 },

    #[error("Backend operation failed: {operation}: {reason}")]
    BackendOperationFailed { operation: String, reason: String },

    #[error("Storage array API error: {status} {code}: {message}")]
    ArrayApi {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Storage array connection error: {0}")]
    ArrayConnection(#[from] reqwest::Error),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Unsupported storage protocol: {0}")]
    UnsupportedProtocol(String),

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

/// Coarse classification of an error, used by the provisioners to decide
/// whether a failure is surfaced, tolerated or converted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed input; surfaced immediately
    InvalidArgument,
    /// A storage array call failed
    BackendFailure,
    /// The array reports the target is already gone
    AlreadyAbsent,
    /// The operation is not offered by this strategy
    Unimplemented,
    /// Local configuration or runtime fault
    Internal,
}

/// Status codes reported across the transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    NotFound,
    ResourceExhausted,
    Unimplemented,
    Unavailable,
    Internal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_)
            | Error::MissingParameters { .. }
            | Error::MalformedVolumeId { .. }
            | Error::CapacityParse(_)
            | Error::UnsupportedProtocol(_) => ErrorKind::InvalidArgument,

            Error::ResourceNotFound { .. } => ErrorKind::AlreadyAbsent,

            Error::Unimplemented(_) => ErrorKind::Unimplemented,

            Error::Internal(_) | Error::Configuration(_) | Error::Io(_) | Error::YamlParse(_) => {
                ErrorKind::Internal
            }

            Error::FilesystemLimitReached { .. }
            | Error::BackendOperationFailed { .. }
            | Error::ArrayApi { .. }
            | Error::ArrayConnection(_)
            | Error::JsonParse(_) => ErrorKind::BackendFailure,
        }
    }

    /// Status code for this error at the transport boundary
    pub fn code(&self) -> Code {
        match self {
            Error::FilesystemLimitReached { .. } => Code::ResourceExhausted,
            Error::ArrayConnection(_) => Code::Unavailable,
            _ => match self.kind() {
                ErrorKind::InvalidArgument => Code::InvalidArgument,
                ErrorKind::AlreadyAbsent => Code::NotFound,
                ErrorKind::Unimplemented => Code::Unimplemented,
                ErrorKind::BackendFailure | ErrorKind::Internal => Code::Internal,
            },
        }
    }

    /// Check if the array reported the target as already gone
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::AlreadyAbsent
    }
}

impl Code {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "invalid_argument",
            Code::NotFound => "not_found",
            Code::ResourceExhausted => "resource_exhausted",
            Code::Unimplemented => "unimplemented",
            Code::Unavailable => "unavailable",
            Code::Internal => "internal",
        }
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::MissingParameters {
            protocol: "nfs".into(),
            missing: vec!["pool_name".into(), "nfs_networkspace".into()],
        };
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = Error::ResourceNotFound {
            kind: "filesystem".into(),
            name: "42".into(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.code(), Code::NotFound);

        let err = Error::BackendOperationFailed {
            operation: "create_export".into(),
            reason: "boom".into(),
        };
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn test_error_codes() {
        let err = Error::FilesystemLimitReached {
            count: 4000,
            max: 4000,
        };
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
        assert_eq!(err.code(), Code::ResourceExhausted);

        let err = Error::Unimplemented("snapshots".into());
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[test]
    fn test_missing_parameters_message_lists_keys() {
        let err = Error::MissingParameters {
            protocol: "nfs".into(),
            missing: vec!["pool_name".into(), "nfs_networkspace".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("pool_name"));
        assert!(msg.contains("nfs_networkspace"));
    }
}
