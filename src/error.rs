//! Error types for the XenStore client
//!
//! Centralized error handling using thiserror. Wire-level `ERROR` replies are
//! mapped through [`WireError`] onto the specific variants below.

use thiserror::Error;

/// All error types that can occur while talking to XenStore
#[derive(Debug, Error)]
pub enum XsError {
    /// Transport broken, closed or never established
    #[error("Connection error: {0}")]
    Connection(String),

    /// Frame or reply that does not match the wire protocol
    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(String),

    /// Payload too large or containing disallowed bytes
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Path rejected locally or by the server
    #[error("Invalid path: {message}")]
    InvalidPath {
        message: String,
        code: Option<String>,
    },

    /// Permission string rejected locally, or access denied by the server
    #[error("Invalid permission: {message}")]
    InvalidPermission {
        message: String,
        code: Option<String>,
    },

    /// Operation not valid in the current state
    #[error("Invalid operation: {message}")]
    InvalidOperation {
        message: String,
        code: Option<String>,
    },

    /// Wire error code with no specific mapping
    #[error("XenStore error {code}: {message}")]
    Store { code: String, message: String },
}

impl XsError {
    /// Locally detected path problem.
    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath {
            message: message.into(),
            code: None,
        }
    }

    /// Locally detected permission problem.
    pub fn invalid_permission(message: impl Into<String>) -> Self {
        Self::InvalidPermission {
            message: message.into(),
            code: None,
        }
    }

    /// Locally detected state problem.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
            code: None,
        }
    }

    /// Build an error from the ASCII code carried by an `ERROR` reply.
    pub fn from_wire(code: &str) -> Self {
        let known = WireError::from_code(code);
        let message = known.map_or("unknown error code", WireError::description).to_string();
        let code_owned = Some(code.to_string());

        match known {
            Some(
                WireError::NoEntry
                | WireError::IsDirectory
                | WireError::NotEmpty
                | WireError::NameTooLong,
            ) => Self::InvalidPath {
                message,
                code: code_owned,
            },
            Some(WireError::Access | WireError::Permission | WireError::ReadOnly) => {
                Self::InvalidPermission {
                    message,
                    code: code_owned,
                }
            }
            Some(
                WireError::Invalid
                | WireError::Exists
                | WireError::Busy
                | WireError::IsConnected
                | WireError::Already,
            ) => Self::InvalidOperation {
                message,
                code: code_owned,
            },
            _ => Self::Store {
                code: code.to_string(),
                message,
            },
        }
    }

    /// The raw wire code, if this error came from the server.
    pub fn wire_code(&self) -> Option<&str> {
        match self {
            Self::InvalidPath { code, .. }
            | Self::InvalidPermission { code, .. }
            | Self::InvalidOperation { code, .. } => code.as_deref(),
            Self::Store { code, .. } => Some(code),
            _ => None,
        }
    }

    /// True when the server answered `ENOENT`.
    pub fn is_not_found(&self) -> bool {
        self.wire_code() == Some(WireError::NoEntry.code())
    }

    /// True for failures that poison the whole connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<std::io::Error> for XsError {
    fn from(err: std::io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Result type alias for XenStore operations
pub type Result<T> = std::result::Result<T, XsError>;

/// Error codes a XenStore daemon may put in an `ERROR` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireError {
    Invalid,
    Access,
    Exists,
    IsDirectory,
    NoEntry,
    NoMemory,
    NoSpace,
    Io,
    NotEmpty,
    NotImplemented,
    ReadOnly,
    Busy,
    Again,
    IsConnected,
    TooBig,
    Permission,
    Already,
    NameTooLong,
    Quota,
}

const WIRE_ERRORS: &[(WireError, &str, &str)] = &[
    (WireError::Invalid, "EINVAL", "Invalid argument"),
    (WireError::Access, "EACCES", "Permission denied"),
    (WireError::Exists, "EEXIST", "File exists"),
    (WireError::IsDirectory, "EISDIR", "Is a directory"),
    (WireError::NoEntry, "ENOENT", "No such file or directory"),
    (WireError::NoMemory, "ENOMEM", "Cannot allocate memory"),
    (WireError::NoSpace, "ENOSPC", "No space left on device"),
    (WireError::Io, "EIO", "Input/output error"),
    (WireError::NotEmpty, "ENOTEMPTY", "Directory not empty"),
    (WireError::NotImplemented, "ENOSYS", "Function not implemented"),
    (WireError::ReadOnly, "EROFS", "Read-only file system"),
    (WireError::Busy, "EBUSY", "Device or resource busy"),
    (WireError::Again, "EAGAIN", "Resource temporarily unavailable"),
    (WireError::IsConnected, "EISCONN", "Transport endpoint is already connected"),
    (WireError::TooBig, "E2BIG", "Argument list too long"),
    (WireError::Permission, "EPERM", "Operation not permitted"),
    (WireError::Already, "EALREADY", "Operation already in progress"),
    (WireError::NameTooLong, "ENAMETOOLONG", "File name too long"),
    (WireError::Quota, "EQUOTA", "Quota exceeded"),
];

impl WireError {
    /// Look up a wire code string such as `"ENOENT"`.
    pub fn from_code(code: &str) -> Option<Self> {
        WIRE_ERRORS
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(e, _, _)| *e)
    }

    fn entry(self) -> &'static (WireError, &'static str, &'static str) {
        // every variant has exactly one row
        WIRE_ERRORS
            .iter()
            .find(|(e, _, _)| *e == self)
            .unwrap_or(&WIRE_ERRORS[0])
    }

    /// The ASCII code as sent on the wire.
    pub fn code(self) -> &'static str {
        self.entry().1
    }

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        self.entry().2
    }
}
