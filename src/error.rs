//! Error types and handling for the MAD engine

use thiserror::Error;

/// Result type alias for MAD operations
pub type MadResult<T> = Result<T, MadError>;

/// Error taxonomy shared by both transports and both query protocols
#[derive(Error, Debug)]
pub enum MadError {
    /// Malformed caller input
    #[error("Invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    /// Target device, port or record absent
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Required partition key missing from the local key table
    #[error("Protection: partition key 0x{pkey:04x} not available on this port")]
    Protection { pkey: u16 },

    /// No reply within the configured window
    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The transport or the TLS peer refused the exchange
    #[error("Rejected: {reason}")]
    Reject { reason: String },

    /// The remote service is not reachable or reports itself unavailable
    #[error("Service unavailable: {service}")]
    Unavailable { service: String },

    /// The remote service is known to be down
    #[error("Service down: {service}")]
    Down { service: String },

    /// The local interface refused a send; may succeed on retry
    #[error("Send not done: {reason}")]
    NotDone { reason: String },

    /// A response was larger than the receive buffer could hold
    #[error("Receive overrun: response of {length} bytes could not be received")]
    Overrun { length: usize },

    /// Operation not valid in the session's current mode or state
    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    /// TLS configuration or handshake failure
    #[error("TLS error: {reason}")]
    Tls { reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all unexpected failure
    #[error("Error: {reason}")]
    Error { reason: String },
}

impl MadError {
    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::InvalidParameter { reason: reason.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject { reason: reason.into() }
    }

    pub fn unavailable(service: impl Into<String>) -> Self {
        Self::Unavailable { service: service.into() }
    }

    pub fn down(service: impl Into<String>) -> Self {
        Self::Down { service: service.into() }
    }

    pub fn not_done(reason: impl Into<String>) -> Self {
        Self::NotDone { reason: reason.into() }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState { reason: reason.into() }
    }

    pub fn tls(reason: impl Into<String>) -> Self {
        Self::Tls { reason: reason.into() }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error { reason: reason.into() }
    }

    /// Whether the session retry loop may issue the request again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NotDone { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidParameter { .. } => "request",
            Self::NotFound { .. } => "lookup",
            Self::Protection { .. } => "security",
            Self::Timeout { .. } | Self::NotDone { .. } => "transient",
            Self::Reject { .. } | Self::Tls { .. } => "refused",
            Self::Unavailable { .. } | Self::Down { .. } => "service",
            Self::Overrun { .. } => "capacity",
            Self::InvalidState { .. } => "state",
            Self::Io(_) => "io",
            Self::Error { .. } => "internal",
        }
    }
}

/// Convert errno values reported by the management interface
impl From<i32> for MadError {
    fn from(errno: i32) -> Self {
        match errno {
            libc::ETIMEDOUT => Self::Timeout { timeout_ms: 0 },
            libc::ENOMEM | libc::EAGAIN | libc::ENOBUFS => Self::NotDone {
                reason: format!("interface busy (errno {})", errno),
            },
            libc::EPERM | libc::EACCES => Self::reject(format!("permission denied (errno {})", errno)),
            libc::ENODEV | libc::ENOENT => Self::not_found(format!("device (errno {})", errno)),
            libc::EINVAL => Self::invalid_parameter(format!("rejected by interface (errno {})", errno)),
            _ => Self::error(format!("System error: {}", errno)),
        }
    }
}
