//! Subscription reconciler
//!
//! Owns the lifecycle of the single platform push subscription and keeps
//! three views of it consistent:
//! - the advisory local flags (`LocalFlags`)
//! - the platform's live subscription (`PlatformGateway`)
//! - the backend's registration (`BackendRegistrationClient`)
//!
//! # Activation sequence
//! 1. Require authentication
//! 2. Require push capability
//! 3. Obtain permission (never re-prompts after a denial)
//! 4. Wait for the background worker, bounded by a timeout
//! 5. Reuse a usable existing subscription
//! 6. Otherwise subscribe
//! 7. Register with the backend (failure is a warning, not an error)
//!
//! Concurrent `activate()` calls are coalesced onto one in-flight activation,
//! and every transition that can create or destroy the subscription runs under
//! a single lifecycle lock. The activation runs as its own task, so it
//! finishes and releases the lifecycle lock even when every caller has gone.
//!
//! # Lock order
//! The lifecycle lock is the only lock held across an await. The
//! `parking_lot` mutexes in `Inner` are never held together: each one is
//! taken, read or written, and released before the next is taken.

use crate::auth::AuthContext;
use crate::config::ReconcilerConfig;
use crate::error::{ActivationError, PlatformError};
use crate::platform::PlatformGateway;
use crate::probe::CapabilityProbe;
use crate::registration::BackendRegistrationClient;
use crate::store::LocalFlags;
use crate::types::{ActivationWarning, Capability, ChannelHandle, Permission, SubscriptionState};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Result of an activation, shared by every coalesced caller
pub type ActivationResult = Result<SubscriptionState, ActivationError>;

type InFlightActivation = Shared<BoxFuture<'static, ActivationResult>>;

/// Snapshot of reconciler internals for troubleshooting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticReport {
    /// State produced by the most recent pass or transition
    pub last_state: Option<SubscriptionState>,
    /// Capability seen by the most recent probe
    pub capability: Option<Capability>,
    /// An activation is currently running
    pub activation_in_flight: bool,
    /// Endpoint the backend registration is believed to match
    pub registered_endpoint: Option<String>,
    /// Activations actually executed
    pub activations_started: u64,
    /// Callers that joined an already running activation
    pub coalesced_waiters: u64,
    /// Registration cycles that ended without success
    pub registration_failures: u64,
    /// Most recent activation error
    pub last_activation_error: Option<String>,
}

/// Handle the backend registration belongs to
#[derive(Debug, Default)]
struct Registration {
    handle: Option<ChannelHandle>,
    /// Bumped on every write; an observation that started under an older
    /// epoch must not heal over a newer transition
    epoch: u64,
}

impl Registration {
    fn set(&mut self, handle: Option<ChannelHandle>) {
        self.handle = handle;
        self.epoch += 1;
    }
}

#[derive(Debug, Default)]
struct Counters {
    activations_started: u64,
    coalesced_waiters: u64,
    registration_failures: u64,
    last_activation_error: Option<String>,
    last_state: Option<SubscriptionState>,
}

struct Inner {
    platform: Arc<dyn PlatformGateway>,
    flags: LocalFlags,
    auth: Arc<dyn AuthContext>,
    registration: BackendRegistrationClient,
    probe: CapabilityProbe,
    config: ReconcilerConfig,
    /// Serializes every transition that may create or destroy the subscription
    lifecycle: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<InFlightActivation>>,
    /// The handle the backend registration belongs to; never carried over to a new handle
    registered_for: Mutex<Registration>,
    counters: Mutex<Counters>,
}

/// Reconciles local, platform and backend subscription state
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SubscriptionReconciler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SubscriptionReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionReconciler")
            .field("config", &self.inner.config)
            .field("registration", &self.inner.registration)
            .finish_non_exhaustive()
    }
}

impl SubscriptionReconciler {
    /// Create a reconciler over injected collaborators
    #[must_use]
    pub fn new(
        platform: Arc<dyn PlatformGateway>,
        flags: LocalFlags,
        auth: Arc<dyn AuthContext>,
        registration: BackendRegistrationClient,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                flags,
                auth,
                registration,
                probe: CapabilityProbe::new(),
                config,
                lifecycle: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(None),
                registered_for: Mutex::new(Registration::default()),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    /// Local flags this reconciler maintains
    #[inline]
    #[must_use]
    pub fn flags(&self) -> &LocalFlags {
        &self.inner.flags
    }

    /// Authentication context consulted on activation
    #[inline]
    #[must_use]
    pub fn auth(&self) -> &Arc<dyn AuthContext> {
        &self.inner.auth
    }

    /// Fresh read of platform truth, self-healing the local flags
    ///
    /// Never cached and never fails; unsupported facilities report
    /// `false`/`None`. Safe to call concurrently with any transition.
    pub async fn get_truth(&self) -> SubscriptionState {
        self.inner.observe().await
    }

    /// Enable push notifications
    ///
    /// Concurrent callers share one in-flight activation and receive the
    /// same result. The activation runs to completion even if every caller
    /// is dropped; a later call after that starts a new one.
    ///
    /// # Errors
    /// One `ActivationError` variant per failing step; steps after the
    /// failing one have no side effects.
    pub async fn activate(&self) -> ActivationResult {
        let (activation, joined) = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(running) => (running.clone(), true),
                None => {
                    let activation = self.inner.spawn_activation();
                    *slot = Some(activation.clone());
                    (activation, false)
                }
            }
        };
        if joined {
            self.inner.counters.lock().coalesced_waiters += 1;
            tracing::debug!("joining in-flight activation");
        }
        activation.await
    }

    /// Disable push notifications
    ///
    /// Clears the local flags and drops the live platform subscription if
    /// one exists. Calling it with nothing active is a successful no-op.
    ///
    /// # Errors
    /// `PlatformError` if the platform lookup or unsubscribe fails; the
    /// local flags are cleared regardless.
    pub async fn deactivate(&self) -> Result<(), PlatformError> {
        self.inner.deactivate().await
    }

    /// `get_truth()` plus a registration retry for an unconfirmed handle
    pub async fn resync(&self) -> SubscriptionState {
        self.inner.resync().await
    }

    /// Diagnostic snapshot
    #[must_use]
    pub fn dump_state(&self) -> DiagnosticReport {
        let activation_in_flight = self.inner.in_flight.lock().is_some();
        let registered_endpoint = self
            .inner
            .registered_for
            .lock()
            .handle
            .as_ref()
            .map(|handle| handle.endpoint.clone());
        let capability = self.inner.probe.last();

        let counters = self.inner.counters.lock();
        DiagnosticReport {
            last_state: counters.last_state.clone(),
            capability,
            activation_in_flight,
            registered_endpoint,
            activations_started: counters.activations_started,
            coalesced_waiters: counters.coalesced_waiters,
            registration_failures: counters.registration_failures,
            last_activation_error: counters.last_activation_error.clone(),
        }
    }
}

impl Inner {
    /// Start the activation task; the caller stores the result in `in_flight`
    fn spawn_activation(self: &Arc<Self>) -> InFlightActivation {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = inner.run_activation().await;
            inner.in_flight.lock().take();
            result
        });

        let inner = Arc::clone(self);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "activation task did not complete");
                    inner.in_flight.lock().take();
                    Err(ActivationError::Interrupted(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn observe(&self) -> SubscriptionState {
        let capability = self.probe.probe(self.platform.as_ref());
        let epoch = self.registered_for.lock().epoch;

        let permission = if capability.notifications_supported {
            self.platform.permission().await
        } else {
            Permission::Unasked
        };

        let (subscription, lookup_ok) = if capability.push_capable() {
            match self.platform.lookup_subscription().await {
                Ok(found) => (found, true),
                Err(e) => {
                    tracing::warn!(error = %e, "subscription lookup failed, leaving local flags untouched");
                    (None, false)
                }
            }
        } else {
            (None, true)
        };

        // A transition that wrote since this observation began knows better
        let fresh = self.registered_for.lock().epoch == epoch;

        let mut local_enabled = self.flags.enabled();
        if !fresh {
            tracing::debug!("subscription changed during observation, skipping self-heal");
        } else if subscription.is_some() && !local_enabled {
            tracing::info!("live subscription without local flag, setting flag");
            self.flags.set_enabled(true);
            local_enabled = true;
        } else if subscription.is_none() && local_enabled && lookup_ok {
            tracing::info!("local flag without live subscription, clearing flag");
            self.flags.set_enabled(false);
            local_enabled = false;
        }

        let backend_registered = {
            let mut registration = self.registered_for.lock();
            if registration.epoch == epoch
                && lookup_ok
                && registration.handle.is_some()
                && registration.handle.as_ref() != subscription.as_ref()
            {
                tracing::debug!("subscription handle changed, backend registration is stale");
                registration.set(None);
            }
            subscription.is_some() && registration.handle.as_ref() == subscription.as_ref()
        };

        let state = SubscriptionState {
            capability,
            permission,
            platform_subscription: subscription,
            backend_registered,
            dismissed: self.flags.dismissed(),
            local_enabled,
            warnings: Vec::new(),
        };
        self.counters.lock().last_state = Some(state.clone());
        state
    }

    async fn run_activation(&self) -> ActivationResult {
        let _lifecycle = self.lifecycle.lock().await;
        self.counters.lock().activations_started += 1;
        tracing::info!("activating push notifications");

        let result = self.activation_steps().await;

        let mut counters = self.counters.lock();
        match &result {
            Ok(state) => {
                tracing::info!(
                    backend_registered = state.backend_registered,
                    warnings = state.warnings.len(),
                    "push notifications activated"
                );
                counters.last_state = Some(state.clone());
            }
            Err(e) => {
                tracing::warn!(error = %e, "activation failed");
                counters.last_activation_error = Some(e.to_string());
            }
        }
        result
    }

    async fn activation_steps(&self) -> ActivationResult {
        // 1. authentication
        if !self.auth.is_authenticated() {
            return Err(ActivationError::Unauthenticated);
        }

        // 2. capability
        let capability = self.probe.probe(self.platform.as_ref());
        if !capability.push_capable() {
            return Err(ActivationError::Unsupported);
        }

        // 3. permission; a denial is final for the session
        let permission = match self.platform.permission().await {
            Permission::Granted => Permission::Granted,
            Permission::Denied => return Err(ActivationError::PermissionDenied),
            Permission::Unasked => {
                tracing::debug!("requesting notification permission");
                self.platform.request_permission().await
            }
        };
        if permission != Permission::Granted {
            return Err(ActivationError::PermissionDenied);
        }

        // 4. background worker
        self.await_worker().await?;

        // 5./6. reuse or create the subscription
        let handle = self.ensure_subscription().await?;

        // 7. backend registration (non-fatal)
        let (backend_registered, warnings) = self.register_handle(&handle).await;
        self.flags.set_enabled(true);

        Ok(SubscriptionState {
            capability,
            permission,
            platform_subscription: Some(handle),
            backend_registered,
            dismissed: self.flags.dismissed(),
            local_enabled: true,
            warnings,
        })
    }

    async fn await_worker(&self) -> Result<(), ActivationError> {
        let timeout = self.config.worker_ready_timeout();
        let started = Instant::now();
        let waited_ms = || u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match tokio::time::timeout(timeout, self.platform.worker_ready()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "background worker failed to start");
                Err(ActivationError::WorkerTimeout {
                    waited_ms: waited_ms(),
                })
            }
            Err(_) => Err(ActivationError::WorkerTimeout {
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn ensure_subscription(&self) -> Result<ChannelHandle, ActivationError> {
        let existing = self
            .platform
            .lookup_subscription()
            .await
            .map_err(ActivationError::PlatformSubscribeFailed)?;

        match existing {
            Some(handle) if handle.is_usable() => {
                tracing::debug!(endpoint = handle.endpoint_preview(), "reusing existing subscription");
                return Ok(handle);
            }
            Some(stale) => {
                tracing::info!(endpoint = stale.endpoint_preview(), "existing subscription expired, replacing");
                self.platform
                    .unsubscribe(&stale)
                    .await
                    .map_err(ActivationError::PlatformSubscribeFailed)?;
                self.registered_for.lock().set(None);
            }
            None => {}
        }

        let handle = self
            .platform
            .subscribe(&self.config.application_server_key)
            .await
            .map_err(ActivationError::PlatformSubscribeFailed)?;
        tracing::info!(endpoint = handle.endpoint_preview(), "created platform subscription");

        let mut registration = self.registered_for.lock();
        if registration.handle.is_some() && registration.handle.as_ref() != Some(&handle) {
            registration.set(None);
        }
        Ok(handle)
    }

    async fn register_handle(&self, handle: &ChannelHandle) -> (bool, Vec<ActivationWarning>) {
        let report = self.registration.register_with_report(handle).await;
        match report.result {
            Ok(()) => {
                self.registered_for.lock().set(Some(handle.clone()));
                (true, Vec::new())
            }
            Err(e) => {
                tracing::warn!(
                    attempts = report.attempts,
                    error = %e,
                    "backend registration failed, falling back to local-only notifications"
                );
                self.registered_for.lock().set(None);
                self.counters.lock().registration_failures += 1;
                (
                    false,
                    vec![ActivationWarning::BackendRegistrationFailed {
                        attempts: report.attempts,
                        message: e.to_string(),
                    }],
                )
            }
        }
    }

    async fn deactivate(&self) -> Result<(), PlatformError> {
        let _lifecycle = self.lifecycle.lock().await;
        tracing::info!("deactivating push notifications");

        // Unsubscribe before clearing, or a concurrent observation would
        // see the live handle and set the flag again.
        let dropped = self.drop_platform_subscription().await;

        self.flags.clear();
        self.registered_for.lock().set(None);
        dropped
    }

    async fn drop_platform_subscription(&self) -> Result<(), PlatformError> {
        if !self.probe.probe(self.platform.as_ref()).push_capable() {
            return Ok(());
        }

        if let Some(handle) = self.platform.lookup_subscription().await? {
            let removed = self.platform.unsubscribe(&handle).await?;
            tracing::info!(
                endpoint = handle.endpoint_preview(),
                removed,
                "platform subscription dropped"
            );
        }
        Ok(())
    }

    async fn resync(&self) -> SubscriptionState {
        let _lifecycle = self.lifecycle.lock().await;
        let mut state = self.observe().await;

        if state.needs_backend_registration() && self.auth.is_authenticated() {
            if let Some(handle) = state.platform_subscription.clone() {
                tracing::info!(endpoint = handle.endpoint_preview(), "retrying backend registration");
                let (registered, warnings) = self.register_handle(&handle).await;
                state.backend_registered = registered;
                state.warnings = warnings;
                self.counters.lock().last_state = Some(state.clone());
            }
        }
        state
    }
}
