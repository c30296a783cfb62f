use thiserror::Error;

/// Core error types for logship
#[derive(Debug, Error)]
pub enum ShipError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by input adapters
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("Watched path {0} is gone")]
    Gone(String),

    #[error("Malformed record dropped: {0}")]
    Corrupt(String),

    #[error("Listener on {addr} failed: {message}")]
    Listener { addr: String, message: String },

    #[error("Channel closed")]
    ChannelClosed,
}

impl InputError {
    /// Fatal errors mark the input for destruction on the next pipeline tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InputError::Gone(_) | InputError::ChannelClosed)
    }
}

/// Errors raised by output adapters. All of these are treated as transient
/// by the pipeline: the un-pushed events go to the stash and are retried.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Connect to {addr} failed: {message}")]
    Connect { addr: String, message: String },

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Expected ack for sequence {expected}, got {got}")]
    AckMismatch { expected: u32, got: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for logship operations
pub type Result<T> = std::result::Result<T, ShipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_input_errors() {
        assert!(InputError::Gone("/var/log/app.log".to_string()).is_fatal());
        assert!(InputError::ChannelClosed.is_fatal());
        assert!(!InputError::Read {
            path: "/var/log/app.log".to_string(),
            message: "interrupted".to_string(),
        }
        .is_fatal());
        assert!(!InputError::Corrupt("not json".to_string()).is_fatal());
    }
}
