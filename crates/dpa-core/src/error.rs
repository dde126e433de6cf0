use thiserror::Error;

/// Main error type for the peer agent
#[derive(Error, Debug)]
pub enum DpaError {
    // ========================================
    // Protocol Errors
    // ========================================
    #[error("Invalid Diameter packet: {0}")]
    InvalidPacket(String),

    #[error("Missing required AVP: {0}")]
    MissingAvp(u32),

    #[error("Invalid AVP value for code {code}: {reason}")]
    InvalidAvpValue { code: u32, reason: String },

    /// An event arrived in a state that defines no transition for it
    #[error("Unexpected event {event} in state {state}")]
    UnexpectedEvent { state: String, event: String },

    // ========================================
    // Peer Errors
    // ========================================
    #[error("Application {0} is not supported")]
    ApplicationUnsupported(u32),

    #[error("Peer {0} is not open")]
    PeerNotOpen(String),

    #[error("Connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("Host already set to {0}")]
    HostAlreadySet(String),

    #[error("Host not set")]
    HostNotSet,

    // ========================================
    // System Errors
    // ========================================
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    // ========================================
    // Network Errors
    // ========================================
    #[error("Transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    NetworkError(String),
}

impl DpaError {
    /// Convert error to Diameter Result-Code
    pub fn to_result_code(&self) -> u32 {
        match self {
            Self::InvalidPacket(_) => 3008, // DIAMETER_INVALID_HDR_BITS
            Self::MissingAvp(_) => 5005,    // DIAMETER_MISSING_AVP
            Self::InvalidAvpValue { .. } => 5004, // DIAMETER_INVALID_AVP_VALUE
            Self::ApplicationUnsupported(_) => 3007, // DIAMETER_APPLICATION_UNSUPPORTED
            Self::PeerNotOpen(_) | Self::ConnectionClosed(_) => 3002, // DIAMETER_UNABLE_TO_DELIVER
            Self::Io(_) | Self::NetworkError(_) => 3002,
            _ => 5012, // DIAMETER_UNABLE_TO_COMPLY
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::InvalidPacket(_) | Self::MissingAvp(_) => ErrorSeverity::Warning,
            Self::UnexpectedEvent { .. } => ErrorSeverity::Warning,
            Self::PeerNotOpen(_) | Self::ConnectionClosed(_) => ErrorSeverity::Error,
            Self::HostAlreadySet(_) | Self::HostNotSet => ErrorSeverity::Error,
            Self::ConfigError(_) => ErrorSeverity::Critical,
            Self::InternalError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::NetworkError(_) | Self::ConnectionClosed(_) | Self::PeerNotOpen(_)
        )
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Result type alias for peer agent operations
pub type Result<T> = std::result::Result<T, DpaError>;
