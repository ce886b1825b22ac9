use std::error::Error as StdError;

/// Errors raised by channels, connectors and the failure protocol
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transient transport unavailability; retry against a fresh channel
    #[error("Connection unavailable: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    #[error("Object disposed: {0}")]
    Disposed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown channel group: {0}")]
    UnknownGroup(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unit of work already completed")]
    TransactionCompleted,

    #[error("Serialization failed ({format}): {message}")]
    Serialization { format: String, message: String },

    /// Handler failure; the inner error keeps its full cause chain
    #[error("Message processing failed: {0}")]
    Processing(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Create a connection error without an underlying cause
    pub fn connection(msg: impl Into<String>) -> Self {
        ChannelError::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error wrapping the transport failure
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        ChannelError::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn disposed(what: impl Into<String>) -> Self {
        ChannelError::Disposed(what.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ChannelError::InvalidArgument(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        ChannelError::InvalidConfig(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        ChannelError::InvalidOperation(msg.into())
    }

    pub fn serialization(format: impl Into<String>, msg: impl Into<String>) -> Self {
        ChannelError::Serialization {
            format: format.into(),
            message: msg.into(),
        }
    }

    /// Wrap any handler failure as a processing error
    pub fn processing(err: impl Into<anyhow::Error>) -> Self {
        ChannelError::Processing(err.into())
    }

    /// Check if this is a transient transport error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ChannelError::Connection { .. })
    }

    /// Check if the failed operation may be retried against a new channel
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChannelError::Connection { .. } | ChannelError::Io(_)
        )
    }

    /// Check if the error belongs to the poison/retry protocol
    pub fn is_processing_error(&self) -> bool {
        matches!(
            self,
            ChannelError::Processing(_) | ChannelError::Serialization { .. }
        )
    }
}

impl From<anyhow::Error> for ChannelError {
    fn from(err: anyhow::Error) -> Self {
        ChannelError::Processing(err)
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::serialization("application/json", err.to_string())
    }
}
