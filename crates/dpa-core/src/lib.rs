// Error types module
pub mod error;

// Diameter protocol module
pub mod diameter;

// Transport abstraction module
pub mod transport;

// Re-export commonly used types
pub use error::{DpaError, ErrorSeverity, Result};
pub use diameter::{
    check_frame_len, encoded_len, DiameterAvp, DiameterCodec, DiameterHeader, DiameterPacket,
    MAX_FRAME_LEN,
};
pub use transport::Transport;
