//! Error types for Noteping Core
//!
//! Provides the failure taxonomy for:
//! - Subscription activation (user-facing, actionable)
//! - Backend registration (soft, degrades to local-only notifications)
//! - Platform gateway calls
//! - Job-status fetches during polling (swallowed by the poller)
//! - Local flag storage and configuration

use std::path::PathBuf;

/// Failure of `SubscriptionReconciler::activate`
///
/// Each variant corresponds to exactly one step of the activation sequence,
/// so a caller can tell how far activation got.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivationError {
    /// No authentication context is present
    #[error("not signed in")]
    Unauthenticated,

    /// The platform cannot show notifications at all
    #[error("notifications are not supported on this platform")]
    Unsupported,

    /// The user denied notification permission
    #[error("notification permission denied")]
    PermissionDenied,

    /// The background worker did not become ready in time
    #[error("background worker not ready after {waited_ms}ms")]
    WorkerTimeout {
        /// How long activation waited before giving up
        waited_ms: u64,
    },

    /// Creating the platform push subscription failed
    #[error("platform subscribe failed: {0}")]
    PlatformSubscribeFailed(#[source] PlatformError),

    /// The activation task ended without producing a result (panic or runtime shutdown)
    #[error("activation interrupted: {0}")]
    Interrupted(String),
}

impl ActivationError {
    /// Check if the user can reasonably try again later
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerTimeout { .. } | Self::PlatformSubscribeFailed(_) | Self::Interrupted(_)
        )
    }

    /// Check if no retry path exists for the rest of the session
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unsupported | Self::PermissionDenied)
    }

    /// Message suitable for showing to the user
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "Sign in to enable notifications.",
            Self::Unsupported => "This browser does not support notifications.",
            Self::PermissionDenied => {
                "Notifications are blocked. Allow them in your browser settings to enable reminders."
            }
            Self::WorkerTimeout { .. } => {
                "The notification service is still starting. Please try again in a moment."
            }
            Self::PlatformSubscribeFailed(_) => {
                "Could not subscribe to push notifications. Please try again."
            }
            Self::Interrupted(_) => "Enabling notifications was interrupted. Please try again.",
        }
    }
}

/// Backend registration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// No credential to authenticate the registration request
    #[error("no credential available for registration")]
    AuthMissing,

    /// Backend answered with a non-success status
    #[error("server rejected registration ({status}): {body}")]
    ServerRejected {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// Request never got a response
    #[error("network error: {0}")]
    NetworkError(String),

    /// All attempts exhausted
    #[error("registration failed after {attempts} attempts: {last_error}")]
    RegistrationFailed {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: Box<RegistrationError>,
    },
}

impl RegistrationError {
    /// Check if another attempt could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerRejected { .. } | Self::NetworkError(_))
    }
}

/// Errors reported by the platform gateway
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// Platform refused the operation
    #[error("rejected by platform: {0}")]
    Rejected(String),

    /// Required platform facility is missing
    #[error("platform facility unavailable: {0}")]
    Unavailable(String),

    /// Anything else
    #[error("platform error: {0}")]
    Internal(String),
}

/// Errors fetching a polled resource
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Resource does not exist (yet)
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Unexpected status code
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// Transport failure
    #[error("network error: {0}")]
    Network(String),

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

/// Local flag store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Store file is not a JSON object of strings
    #[error("store file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config {path}: {source}")]
    Read {
        /// Path that was read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for `EngineConfig`
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config parsed but holds an unusable value
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_error_classification() {
        assert!(ActivationError::PermissionDenied.is_terminal());
        assert!(ActivationError::Unsupported.is_terminal());
        assert!(!ActivationError::PermissionDenied.is_retryable());

        let timeout = ActivationError::WorkerTimeout { waited_ms: 15_000 };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_terminal());

        let subscribe = ActivationError::PlatformSubscribeFailed(PlatformError::Rejected(
            "AbortError".to_string(),
        ));
        assert!(subscribe.is_retryable());

        let interrupted = ActivationError::Interrupted("task cancelled".to_string());
        assert!(interrupted.is_retryable());
        assert!(!interrupted.is_terminal());
    }

    #[test]
    fn registration_error_retryability() {
        assert!(!RegistrationError::AuthMissing.is_retryable());
        assert!(RegistrationError::NetworkError("reset".into()).is_retryable());
        assert!(RegistrationError::ServerRejected {
            status: 500,
            body: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn registration_failed_display_includes_last_error() {
        let err = RegistrationError::RegistrationFailed {
            attempts: 3,
            last_error: Box::new(RegistrationError::ServerRejected {
                status: 503,
                body: "busy".to_string(),
            }),
        };
        let text = err.to_string();
        assert!(text.contains("3 attempts"));
        assert!(text.contains("503"));
    }
}
