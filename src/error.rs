//! Error types for the pipeline.

use std::time::Duration;

/// The main error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The broker client failed to poll, send or confirm delivery
    #[error("Broker error: {0}")]
    Broker(String),

    /// Delivery confirmation did not arrive in time
    #[error("Delivery not confirmed after {duration_ms}ms")]
    DeliveryTimeout { duration_ms: u64 },

    /// The external processing call returned a failure status
    #[error("Processing call to {endpoint} failed with status {status}: {body}")]
    Processing {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The external processing call succeeded but carried no output image
    #[error("Processing call to {endpoint} returned no output image")]
    MissingOutput { endpoint: String },

    /// Transport failure talking to the processing service
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The HTTP session was closed during teardown
    #[error("HTTP session is closed")]
    SessionClosed,

    /// A message arrived on a topic with no registered stage
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// A payload or value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The offload pool was shut down
    #[error("Offload pool is shut down")]
    PoolShutdown,

    /// A blocking task on the offload pool panicked or was cancelled
    #[error("Offloaded task failed: {0}")]
    Offload(#[from] tokio::task::JoinError),

    /// The consumer has already been stopped
    #[error("Consumer is stopped")]
    Stopped,

    /// Configuration was invalid or could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a broker error from anything displayable
    pub fn broker<E: std::fmt::Display>(error: E) -> Self {
        Error::Broker(error.to_string())
    }

    /// Create a processing error for a failed status
    pub fn processing(endpoint: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Error::Processing {
            endpoint: endpoint.into(),
            status,
            body: body.into(),
        }
    }

    /// Create a delivery timeout error
    pub fn delivery_timeout(duration: Duration) -> Self {
        Error::DeliveryTimeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config(message.into())
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Whether the error came from the broker transport
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Broker(_) | Error::DeliveryTimeout { .. } | Error::PoolShutdown
        )
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_timeout_reports_millis() {
        let err = Error::delivery_timeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "Delivery not confirmed after 10000ms");
        assert!(err.is_transport());
    }

    #[test]
    fn test_processing_error_is_not_transport() {
        let err = Error::processing("fal-ai/aura-sr", 502, "bad gateway");
        assert!(!err.is_transport());
        assert!(err.to_string().contains("502"));
    }
}
