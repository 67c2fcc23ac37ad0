use std::time::Duration;
use thiserror::Error;

/// Failures of a physical communication link.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link could not be opened.
    #[error("Failed to connect to '{resource}': {reason}")]
    Connect {
        /// Address or device path
        resource: String,
        /// Why it failed
        reason: String,
    },

    /// An operation exceeded its budget.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// `connect`, `read` or `write`
        operation: &'static str,
        /// Budget that ran out
        after: Duration,
    },

    /// Every read attempt failed.
    #[error("Read failed after {attempts} attempt(s): {last}")]
    ReadFailure {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        #[source]
        last: Box<TransportError>,
    },

    /// The link is not open.
    #[error("Not connected")]
    NotConnected,

    /// The interface or device is missing a setting it needs.
    #[error("Interface has not been configured")]
    NotConfigured,

    /// The interface is disabled.
    #[error("Interface '{0}' is disabled")]
    Disabled(String),

    /// Another interface holds the physical resource.
    #[error("Physical resource '{resource}' is already held by interface '{owner}'")]
    ResourceInUse {
        /// Port or address
        resource: String,
        /// Interface holding it
        owner: String,
    },

    /// Settings cannot change on an open link.
    #[error("Cannot configure while connected")]
    AlreadyConnected,

    /// The interface cannot perform the operation.
    #[error("Operation '{0}' is not supported by this interface")]
    Unsupported(&'static str),

    /// A response could not be parsed.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Outgoing text the requested encoding cannot represent.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The build lacks the feature the interface needs.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(&'static str),
}

impl TransportError {
    /// Errors a retried read may recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::MalformedResponse(_)
        )
    }

    pub(crate) fn connect(resource: impl Into<String>, reason: impl ToString) -> Self {
        TransportError::Connect {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }
}
