use crate::transport::ResponseCode;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the AMQP connection and token management layer.
///
/// Every variant is cheap to clone so the same error can be delivered to the
/// awaiting caller, republished on the connection state stream, and pushed to
/// authorization outcome subscribers.
///
/// # Error Categories
///
/// ## Authorization
/// - [`Authentication`] - the claims-based-security node rejected the token
///
/// ## Transport
/// - [`Transport`] - the exchange could not complete; may be flagged transient
/// - [`Timeout`] - an operation did not finish within its configured duration
///
/// ## Lifecycle
/// - [`Disposed`] - the resource has been closed
/// - [`ConnectionClosed`] - the owning connection is closed or failed
///
/// # Examples
///
/// ```no_run
/// use amqp::common::AmqpError;
///
/// fn should_retry(error: &AmqpError) -> bool {
///     match error {
///         AmqpError::Authentication { .. } => false,
///         other => other.is_transient(),
///     }
/// }
/// ```
///
/// [`Authentication`]: AmqpError::Authentication
/// [`Transport`]: AmqpError::Transport
/// [`Timeout`]: AmqpError::Timeout
/// [`Disposed`]: AmqpError::Disposed
/// [`ConnectionClosed`]: AmqpError::ConnectionClosed
#[derive(Debug, Clone, Error)]
pub enum AmqpError {
    /// The broker rejected the token for the given audience.
    #[error("Authorization rejected for '{audience}': {code} - {description}")]
    Authentication {
        audience: String,
        code: ResponseCode,
        description: String,
    },

    /// The underlying exchange failed.
    ///
    /// `transient` is set by the transport layer when the failure is safe to
    /// retry without escalating.
    #[error("Transport error: {reason}")]
    Transport { reason: String, transient: bool },

    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Cannot perform operation on disposed {resource}")]
    Disposed { resource: String },

    #[error("Connection '{connection_id}' is closed")]
    ConnectionClosed { connection_id: String },

    /// A management request completed with a non-success status.
    #[error("Management operation '{operation}' failed: {code} - {description}")]
    Management {
        operation: String,
        code: ResponseCode,
        description: String,
    },

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl AmqpError {
    /// Create a transport error that callers may retry.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
            transient: true,
        }
    }

    /// Create a transport error that must not be retried.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
            transient: false,
        }
    }

    pub fn disposed(resource: impl Into<String>) -> Self {
        Self::Disposed {
            resource: resource.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Whether the transport layer marked this error as safe to retry.
    ///
    /// Only [`AmqpError::Transport`] errors carry the flag; every other
    /// category is treated as non-transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::Transport {
                transient: true,
                ..
            }
        )
    }

    /// Check if this error came from a rejected authorization
    pub fn is_authentication_error(&self) -> bool {
        matches!(self, AmqpError::Authentication { .. })
    }

    /// Get the broker response code if the error carries one
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            AmqpError::Authentication { code, .. } | AmqpError::Management { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::Configuration(err.to_string())
    }
}

// Result type alias for convenience
pub type AmqpResult<T> = Result<T, AmqpError>;
