//! Error types for the FluxGate client library

use fluxgate::flow::FlowError;
use fluxgate::frame::FrameCodecError;

/// Main error type for FluxGate client operations
#[derive(Debug, thiserror::Error)]
pub enum FluxgateClientError {
    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame decoding errors
    #[error("Frame error: {0}")]
    Frame(#[from] FrameCodecError),

    /// The gateway violated the credit window of a stream
    #[error("Flow control error: {0}")]
    Flow(#[from] FlowError),

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The gateway reset the stream, carrying a Kafka error code
    #[error("Stream rejected with Kafka error {error_code}")]
    Rejected { error_code: i32 },

    /// The stream was closed before the operation completed
    #[error("Stream closed: {message}")]
    Closed { message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl FluxgateClientError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn closed<S: Into<String>>(message: S) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn rejected(error_code: i32) -> Self {
        Self::Rejected { error_code }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::Io(_) => true,
            // error 0 means the gateway could not reach a broker
            Self::Rejected { error_code } => *error_code == 0 || is_retriable_code(*error_code),
            _ => false,
        }
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

fn is_retriable_code(error_code: i32) -> bool {
    i16::try_from(error_code)
        .map(|code| fluxgate::protocol::kafka::KafkaErrorCode::from_i16(code).is_retriable())
        .unwrap_or(false)
}
