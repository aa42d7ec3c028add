//! Unified error handling for NOCTUA
//!
//! This module provides a centralized error type for the entire NOCTUA
//! system, ensuring consistent error handling across all components. Every
//! variant maps to a stable small integer so that errors can travel inside
//! request/response frames.

use thiserror::Error;

/// Main error type for NOCTUA operations
#[derive(Debug, Error)]
pub enum NoctuaError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Resource not found errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Already exists errors (for creation operations)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Permission/Access errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Out of memory or out of table slots
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Per-node descriptor table overflow
    #[error("Descriptor table full: {0}")]
    TableFull(String),

    /// Resource is busy errors
    #[error("Resource busy: {0}")]
    Busy(String),

    /// Operation not supported on this endpoint
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Bad remote address errors
    #[error("Fault: {0}")]
    Faulted(String),

    /// Transient failures; the caller may retry
    #[error("Try again: {0}")]
    Again(String),

    /// Name exceeds the maximum length
    #[error("Name too long: {0}")]
    NameTooLong(String),

    /// Generic internal errors (use sparingly)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using NoctuaError
pub type NoctuaResult<T> = Result<T, NoctuaError>;

/// Stable wire codes, errno-flavoured.
mod code {
    pub const EPERM: i32 = -1;
    pub const ENOENT: i32 = -2;
    pub const EAGAIN: i32 = -11;
    pub const ENOMEM: i32 = -12;
    pub const EFAULT: i32 = -14;
    pub const EBUSY: i32 = -16;
    pub const EEXIST: i32 = -17;
    pub const EINVAL: i32 = -22;
    pub const ENFILE: i32 = -23;
    pub const ENAMETOOLONG: i32 = -36;
    pub const ENOTSUP: i32 = -95;
}

impl NoctuaError {
    /// Stable negative integer used when the error crosses the NoC.
    pub fn code(&self) -> i32 {
        match self {
            NoctuaError::PermissionDenied(_) => code::EPERM,
            NoctuaError::NotFound(_) => code::ENOENT,
            NoctuaError::Again(_) => code::EAGAIN,
            NoctuaError::ResourceExhausted(_) => code::ENOMEM,
            NoctuaError::Faulted(_) => code::EFAULT,
            NoctuaError::Busy(_) => code::EBUSY,
            NoctuaError::AlreadyExists(_) => code::EEXIST,
            NoctuaError::TableFull(_) => code::ENFILE,
            NoctuaError::NameTooLong(_) => code::ENAMETOOLONG,
            NoctuaError::NotSupported(_) => code::ENOTSUP,
            // Local-only errors degrade to EINVAL on the wire.
            _ => code::EINVAL,
        }
    }

    /// Rebuilds an error from a wire code received in a response frame.
    pub fn from_code(errcode: i32) -> Self {
        match errcode {
            code::EPERM => NoctuaError::PermissionDenied("remote".to_string()),
            code::ENOENT => NoctuaError::NotFound("remote".to_string()),
            code::EAGAIN => NoctuaError::Again("remote".to_string()),
            code::ENOMEM => NoctuaError::ResourceExhausted("remote".to_string()),
            code::EFAULT => NoctuaError::Faulted("remote".to_string()),
            code::EBUSY => NoctuaError::Busy("remote".to_string()),
            code::EEXIST => NoctuaError::AlreadyExists("remote".to_string()),
            code::ENFILE => NoctuaError::TableFull("remote".to_string()),
            code::ENAMETOOLONG => NoctuaError::NameTooLong("remote".to_string()),
            code::ENOTSUP => NoctuaError::NotSupported("remote".to_string()),
            _ => NoctuaError::Invalid(format!("remote error {errcode}")),
        }
    }
}

// Implement conversions from common error types
impl From<toml::de::Error> for NoctuaError {
    fn from(err: toml::de::Error) -> Self {
        NoctuaError::Config(format!("TOML parse error: {}", err))
    }
}

// Helper methods
impl NoctuaError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        NoctuaError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        NoctuaError::Invalid(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        NoctuaError::NotFound(resource.into())
    }

    /// Create an already exists error
    pub fn already_exists<S: Into<String>>(resource: S) -> Self {
        NoctuaError::AlreadyExists(resource.into())
    }

    /// Create a busy error
    pub fn busy<S: Into<String>>(msg: S) -> Self {
        NoctuaError::Busy(msg.into())
    }

    /// Create a try-again error
    pub fn again<S: Into<String>>(msg: S) -> Self {
        NoctuaError::Again(msg.into())
    }

    /// Create a fault error
    pub fn faulted<S: Into<String>>(msg: S) -> Self {
        NoctuaError::Faulted(msg.into())
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, NoctuaError::NotFound(_))
    }

    /// Check if this is an already exists error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, NoctuaError::AlreadyExists(_))
    }

    /// Check if this is a permission error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, NoctuaError::PermissionDenied(_))
    }

    /// Check if this is a fault error
    pub fn is_faulted(&self) -> bool {
        matches!(self, NoctuaError::Faulted(_))
    }
}
