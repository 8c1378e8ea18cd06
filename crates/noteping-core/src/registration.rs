//! Backend registration client
//!
//! Sends the platform channel handle to the backend delivery-relay with
//! bounded retries and exponential backoff:
//! - `AuthMissing` fails immediately (retrying cannot help)
//! - `ServerRejected` and `NetworkError` are retried
//! - exhaustion yields `RegistrationFailed { attempts, last_error }`

use crate::auth::AuthContext;
use crate::backoff::BackoffPolicy;
use crate::config::RegistrationConfig;
use crate::error::RegistrationError;
use crate::types::{ChannelHandle, Credential};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One registration request against the backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Upsert `handle` for the authenticated user
    async fn register(
        &self,
        handle: &ChannelHandle,
        credential: &Credential,
    ) -> Result<(), RegistrationError>;
}

/// Outcome of a full retry cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Attempts made (including one short-circuited by missing auth)
    pub attempts: u32,
    /// Backoff delays slept between attempts, in order
    pub delays: Vec<Duration>,
    /// Final result
    pub result: Result<(), RegistrationError>,
}

/// Registration with retry/backoff
#[derive(Clone)]
pub struct BackendRegistrationClient {
    registrar: Arc<dyn Registrar>,
    auth: Arc<dyn AuthContext>,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for BackendRegistrationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistrationClient")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl BackendRegistrationClient {
    /// Create from config
    #[must_use]
    pub fn new(
        registrar: Arc<dyn Registrar>,
        auth: Arc<dyn AuthContext>,
        config: &RegistrationConfig,
    ) -> Self {
        Self {
            registrar,
            auth,
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
        }
    }

    /// With explicit retry policy
    #[inline]
    #[must_use]
    pub fn with_policy(mut self, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Maximum attempts per call
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Register `handle`, retrying transient failures
    ///
    /// # Errors
    /// - `RegistrationError::AuthMissing` when no credential is available
    /// - `RegistrationError::RegistrationFailed` once attempts are exhausted
    pub async fn register(&self, handle: &ChannelHandle) -> Result<(), RegistrationError> {
        self.register_with_report(handle).await.result
    }

    /// Register `handle` and report every attempt and delay
    pub async fn register_with_report(&self, handle: &ChannelHandle) -> RegistrationReport {
        let mut delays = Vec::new();
        let mut attempt = 0u32;

        loop {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt - 1);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "backing off before registration retry"
                );
                delays.push(delay);
                tokio::time::sleep(delay).await;
            }
            attempt += 1;

            let Some(credential) = self.auth.credential() else {
                tracing::warn!(attempt, "registration skipped: no credential");
                return RegistrationReport {
                    attempts: attempt,
                    delays,
                    result: Err(RegistrationError::AuthMissing),
                };
            };

            let error = match self.registrar.register(handle, &credential).await {
                Ok(()) => {
                    tracing::info!(
                        attempt,
                        endpoint = handle.endpoint_preview(),
                        "push channel registered with backend"
                    );
                    return RegistrationReport {
                        attempts: attempt,
                        delays,
                        result: Ok(()),
                    };
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                tracing::warn!(attempt, error = %error, "registration failed permanently");
                return RegistrationReport {
                    attempts: attempt,
                    delays,
                    result: Err(error),
                };
            }

            if attempt >= self.max_attempts {
                tracing::warn!(
                    attempts = attempt,
                    error = %error,
                    "registration attempts exhausted"
                );
                return RegistrationReport {
                    attempts: attempt,
                    delays,
                    result: Err(RegistrationError::RegistrationFailed {
                        attempts: attempt,
                        last_error: Box::new(error),
                    }),
                };
            }

            tracing::debug!(attempt, error = %error, "registration attempt failed, will retry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionAuth;

    fn handle() -> ChannelHandle {
        ChannelHandle::new("https://push.example/ch/1", "p256", "auth")
    }

    fn signed_in() -> Arc<dyn AuthContext> {
        Arc::new(SessionAuth::signed_in(Credential::bearer("token")))
    }

    fn client(registrar: MockRegistrar, auth: Arc<dyn AuthContext>) -> BackendRegistrationClient {
        BackendRegistrationClient::new(Arc::new(registrar), auth, &RegistrationConfig::default())
            .with_policy(
                3,
                BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10)),
            )
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds() {
        let mut registrar = MockRegistrar::new();
        let mut calls = 0u32;
        registrar.expect_register().times(3).returning(move |_, _| {
            calls += 1;
            if calls < 3 {
                Err(RegistrationError::NetworkError("connection reset".into()))
            } else {
                Ok(())
            }
        });

        let report = client(registrar, signed_in())
            .register_with_report(&handle())
            .await;

        assert_eq!(report.attempts, 3);
        assert_eq!(report.result, Ok(()));
        assert_eq!(
            report.delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert!(report.delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_last_error() {
        let mut registrar = MockRegistrar::new();
        registrar.expect_register().times(3).returning(|_, _| {
            Err(RegistrationError::ServerRejected {
                status: 500,
                body: "boom".into(),
            })
        });

        let result = client(registrar, signed_in()).register(&handle()).await;
        assert_eq!(
            result,
            Err(RegistrationError::RegistrationFailed {
                attempts: 3,
                last_error: Box::new(RegistrationError::ServerRejected {
                    status: 500,
                    body: "boom".into(),
                }),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_never_reaches_backend() {
        let mut registrar = MockRegistrar::new();
        registrar.expect_register().never();

        let report = client(registrar, Arc::new(SessionAuth::new()))
            .register_with_report(&handle())
            .await;
        assert_eq!(report.result, Err(RegistrationError::AuthMissing));
        assert_eq!(report.attempts, 1);
        assert!(report.delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_missing_from_backend_is_not_retried() {
        let mut registrar = MockRegistrar::new();
        registrar
            .expect_register()
            .times(1)
            .returning(|_, _| Err(RegistrationError::AuthMissing));

        let report = client(registrar, signed_in())
            .register_with_report(&handle())
            .await;
        assert_eq!(report.attempts, 1);
        assert_eq!(report.result, Err(RegistrationError::AuthMissing));
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_still_wraps() {
        let mut registrar = MockRegistrar::new();
        registrar
            .expect_register()
            .times(1)
            .returning(|_, _| Err(RegistrationError::NetworkError("down".into())));

        let result = client(registrar, signed_in())
            .with_policy(1, BackoffPolicy::immediate())
            .register(&handle())
            .await;
        assert!(matches!(
            result,
            Err(RegistrationError::RegistrationFailed { attempts: 1, .. })
        ));
    }
}
