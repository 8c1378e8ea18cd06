//! Reconciler simulator
//!
//! Drives a [`TestRig`] through a seeded random mix of user transitions and
//! out-of-band platform/backend changes, checking after every step that:
//! - no more than one platform subscription is ever live
//! - two consecutive `get_truth()` reads agree and the local flag matches
//!   the platform after self-healing
//! - a failed activation leaves no partial side effects
//! - `backend_registered` only ever refers to the handle actually registered
//! - coalesced activations share one result and create at most one handle

use super::{FakePlatform, FakeRegistrar, PlatformCall, TestRig};
use crate::auth::AuthContext;
use crate::config::EngineConfig;
use crate::error::{ActivationError, RegistrationError};
use crate::types::{ChannelHandle, Credential, Permission, SubscriptionState};
use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fmt::Write as _;

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Operations to run
    pub total_operations: u64,
    /// Stop at the first violation
    pub stop_on_first_violation: bool,
    /// Largest burst of concurrent `activate()` calls
    pub max_concurrency: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            total_operations: 1_000,
            stop_on_first_violation: true,
            max_concurrency: 4,
        }
    }
}

/// One simulated step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedOperation {
    /// User enables notifications
    Activate,
    /// Several components enable at once
    ConcurrentActivate(usize),
    /// User disables notifications
    Deactivate,
    /// Read of the reconciled state
    GetTruth,
    /// Foreground/login resync
    Resync,
    /// Session ends
    Logout,
    /// Session starts
    Login,
    /// Platform drops the subscription out of band
    ExternalUnsubscribe,
    /// Platform replaces the subscription out of band
    ExternalRotate,
    /// Live subscription passes its expiration time
    ExpireSubscription,
    /// Backend fails the next n registration attempts
    BackendOutage(usize),
    /// User blocks notifications in platform settings
    RevokePermission,
    /// User resets the site permission; next prompt answers with the decision
    ResetPermission(Permission),
}

/// A violation detected during simulation
#[derive(Debug, Clone)]
pub enum Violation {
    /// More than one subscription was live at once
    MultipleSubscriptions {
        /// Step index
        step: u64,
        /// Observed maximum
        live: usize,
    },
    /// Two consecutive truth reads disagreed
    TruthNotIdempotent {
        /// Step index
        step: u64,
        /// First read
        first: Box<SubscriptionState>,
        /// Second read
        second: Box<SubscriptionState>,
    },
    /// Local flag disagrees with the platform after self-healing
    FlagDrift {
        /// Step index
        step: u64,
        /// Reconciled state
        state: Box<SubscriptionState>,
    },
    /// A failed activation touched the platform or backend past its failing step
    SideEffectAfterFailure {
        /// Step index
        step: u64,
        /// Activation error
        error: ActivationError,
        /// Subscribe calls made during the step
        subscribes: usize,
        /// Registration calls made during the step
        registrations: usize,
    },
    /// Reported state does not match the platform
    StateMismatch {
        /// Step index
        step: u64,
        /// What went wrong
        detail: String,
    },
    /// `backend_registered` refers to a handle the backend never confirmed
    StaleRegistration {
        /// Step index
        step: u64,
        /// Endpoint claimed as registered
        endpoint: String,
    },
    /// Coalesced callers received different results
    CoalescingDiverged {
        /// Step index
        step: u64,
        /// Callers in the burst
        callers: usize,
        /// Subscribe calls made during the burst
        subscribes: usize,
    },
}

/// Statistics for simulation
#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    /// Activation calls issued (each burst caller counts)
    pub activations_attempted: u64,
    /// Successful activations
    pub activations_succeeded: u64,
    /// Failed activations
    pub activations_failed: u64,
    /// Successful activations carrying a registration warning
    pub registration_warnings: u64,
    /// Deactivations issued
    pub deactivations: u64,
    /// Truth reads issued
    pub truth_reads: u64,
    /// Resyncs issued
    pub resyncs: u64,
    /// Out-of-band changes applied
    pub perturbations: u64,
}

/// Final report from simulator
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    /// Configuration the run used
    pub config: SimulatorConfig,
    /// Counters
    pub stats: SimulatorStats,
    /// Violations, in order of detection
    pub violations: Vec<Violation>,
    /// Operations executed
    pub operations_run: u64,
}

impl SimulatorReport {
    /// Check if simulation passed all criteria
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Generate text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();

        let _ = writeln!(report, "=== Noteping Reconciler Simulator Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Operations Run: {}", self.operations_run);
        let _ = writeln!(report, "Activations Attempted: {}", self.stats.activations_attempted);
        let _ = writeln!(report, "Activations Succeeded: {}", self.stats.activations_succeeded);
        let _ = writeln!(report, "Activations Failed: {}", self.stats.activations_failed);
        let _ = writeln!(report, "Registration Warnings: {}", self.stats.registration_warnings);
        let _ = writeln!(report, "Deactivations: {}", self.stats.deactivations);
        let _ = writeln!(report, "Truth Reads: {}", self.stats.truth_reads);
        let _ = writeln!(report, "Resyncs: {}", self.stats.resyncs);
        let _ = writeln!(report, "Out-of-band Changes: {}", self.stats.perturbations);
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            report.push_str("\n=== Violations ===\n");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {v:?}", i + 1);
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

/// Engine settings for simulation: no backoff sleeps, short worker timeout
fn simulation_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.registration.base_delay_ms = 0;
    config.registration.max_delay_ms = 0;
    config.reconciler.worker_ready_timeout_ms = 50;
    config
}

/// Run the reconciler simulator
pub async fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let rig = TestRig::build(FakePlatform::new(), FakeRegistrar::new(), &simulation_config());

    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();
    let mut operations_run = 0;

    for step in 0..config.total_operations {
        let operation = generate_operation(&mut rng, &config);
        let before = violations.len();
        execute_operation(&rig, step, &operation, &mut stats, &mut violations).await;
        check_global_invariants(&rig, step, &mut stats, &mut violations).await;
        operations_run += 1;

        if violations.len() > before {
            tracing::warn!(step, ?operation, "simulator detected violation");
            if config.stop_on_first_violation {
                break;
            }
        }
    }

    SimulatorReport {
        config,
        stats,
        violations,
        operations_run,
    }
}

/// Generate a random operation
fn generate_operation(rng: &mut StdRng, config: &SimulatorConfig) -> SimulatedOperation {
    match rng.random_range(0..100u32) {
        0..=24 => SimulatedOperation::Activate,
        25..=31 => SimulatedOperation::ConcurrentActivate(rng.random_range(2..=config.max_concurrency.max(2))),
        32..=43 => SimulatedOperation::Deactivate,
        44..=57 => SimulatedOperation::GetTruth,
        58..=65 => SimulatedOperation::Resync,
        66..=69 => SimulatedOperation::Logout,
        70..=75 => SimulatedOperation::Login,
        76..=80 => SimulatedOperation::ExternalUnsubscribe,
        81..=85 => SimulatedOperation::ExternalRotate,
        86..=88 => SimulatedOperation::ExpireSubscription,
        89..=93 => SimulatedOperation::BackendOutage(rng.random_range(1..=4)),
        94..=95 => SimulatedOperation::RevokePermission,
        _ => SimulatedOperation::ResetPermission(if rng.random_bool(0.8) {
            Permission::Granted
        } else {
            Permission::Denied
        }),
    }
}

async fn execute_operation(
    rig: &TestRig,
    step: u64,
    operation: &SimulatedOperation,
    stats: &mut SimulatorStats,
    violations: &mut Vec<Violation>,
) {
    match operation {
        SimulatedOperation::Activate => {
            let subscribes = rig.platform.count(PlatformCall::Subscribe);
            let registrations = rig.registrar.calls();
            stats.activations_attempted += 1;

            let result = rig.reconciler.activate().await;
            let subscribes = rig.platform.count(PlatformCall::Subscribe) - subscribes;
            let registrations = rig.registrar.calls() - registrations;
            check_activation(rig, step, &result, subscribes, registrations, stats, violations);
        }
        SimulatedOperation::ConcurrentActivate(callers) => {
            let subscribes = rig.platform.count(PlatformCall::Subscribe);
            stats.activations_attempted += *callers as u64;

            let results =
                futures::future::join_all((0..*callers).map(|_| rig.reconciler.activate())).await;
            let subscribes = rig.platform.count(PlatformCall::Subscribe) - subscribes;
            if subscribes > 1 || results.windows(2).any(|pair| pair[0] != pair[1]) {
                violations.push(Violation::CoalescingDiverged {
                    step,
                    callers: *callers,
                    subscribes,
                });
            }
            for result in &results {
                match result {
                    Ok(_) => stats.activations_succeeded += 1,
                    Err(_) => stats.activations_failed += 1,
                }
            }
        }
        SimulatedOperation::Deactivate => {
            stats.deactivations += 1;
            if let Err(e) = rig.reconciler.deactivate().await {
                violations.push(Violation::StateMismatch {
                    step,
                    detail: format!("deactivate failed: {e}"),
                });
                return;
            }
            if rig.platform.subscription().is_some() || rig.flags.enabled() {
                violations.push(Violation::StateMismatch {
                    step,
                    detail: "subscription or enabled flag survived deactivate".to_string(),
                });
            }
        }
        SimulatedOperation::GetTruth => {
            stats.truth_reads += 1;
            let _ = rig.reconciler.get_truth().await;
        }
        SimulatedOperation::Resync => {
            stats.resyncs += 1;
            let state = rig.reconciler.resync().await;
            if state.has_live_subscription()
                && rig.auth.credential().is_some()
                && !state.backend_registered
                && rig.registrar.calls() == 0
            {
                violations.push(Violation::StateMismatch {
                    step,
                    detail: "resync left an unconfirmed handle without trying".to_string(),
                });
            }
        }
        SimulatedOperation::Logout => rig.auth.logout(),
        SimulatedOperation::Login => rig.auth.login(Credential::bearer(super::TEST_TOKEN)),
        SimulatedOperation::ExternalUnsubscribe => {
            stats.perturbations += 1;
            rig.platform.set_subscription(None);
        }
        SimulatedOperation::ExternalRotate => {
            stats.perturbations += 1;
            if rig.platform.subscription().is_some() {
                let endpoint = format!("https://push.example.test/rotated/{step}");
                rig.platform
                    .set_subscription(Some(ChannelHandle::new(endpoint, "p256dh-rot", "auth-rot")));
            }
        }
        SimulatedOperation::ExpireSubscription => {
            stats.perturbations += 1;
            if let Some(handle) = rig.platform.subscription() {
                let expired = handle.with_expiration(Utc::now() - chrono::Duration::hours(1));
                rig.platform.set_subscription(Some(expired));
            }
        }
        SimulatedOperation::BackendOutage(failures) => {
            stats.perturbations += 1;
            for _ in 0..*failures {
                rig.registrar.push(Err(RegistrationError::NetworkError(
                    "connection refused".to_string(),
                )));
            }
        }
        SimulatedOperation::RevokePermission => {
            stats.perturbations += 1;
            rig.platform.set_permission(Permission::Denied);
        }
        SimulatedOperation::ResetPermission(decision) => {
            stats.perturbations += 1;
            rig.platform.set_permission(Permission::Unasked);
            rig.platform.set_decision(*decision);
        }
    }
}

fn check_activation(
    rig: &TestRig,
    step: u64,
    result: &Result<SubscriptionState, ActivationError>,
    subscribes: usize,
    registrations: usize,
    stats: &mut SimulatorStats,
    violations: &mut Vec<Violation>,
) {
    match result {
        Ok(state) => {
            stats.activations_succeeded += 1;
            if !state.warnings.is_empty() {
                stats.registration_warnings += 1;
            }
            if state.platform_subscription != rig.platform.subscription() {
                violations.push(Violation::StateMismatch {
                    step,
                    detail: "activation reported a handle the platform does not hold".to_string(),
                });
            }
            if !rig.flags.enabled() {
                violations.push(Violation::StateMismatch {
                    step,
                    detail: "enabled flag not set after activation".to_string(),
                });
            }
        }
        Err(error) => {
            stats.activations_failed += 1;
            let leaked = match error {
                ActivationError::PlatformSubscribeFailed(_) => registrations > 0,
                _ => subscribes > 0 || registrations > 0,
            };
            if leaked {
                violations.push(Violation::SideEffectAfterFailure {
                    step,
                    error: error.clone(),
                    subscribes,
                    registrations,
                });
            }
        }
    }
}

async fn check_global_invariants(
    rig: &TestRig,
    step: u64,
    stats: &mut SimulatorStats,
    violations: &mut Vec<Violation>,
) {
    let live = rig.platform.max_live_subscriptions();
    if live > 1 {
        violations.push(Violation::MultipleSubscriptions { step, live });
    }

    stats.truth_reads += 2;
    let first = rig.reconciler.get_truth().await;
    let second = rig.reconciler.get_truth().await;
    if first != second {
        violations.push(Violation::TruthNotIdempotent {
            step,
            first: Box::new(first.clone()),
            second: Box::new(second),
        });
    }
    if first.local_enabled != first.has_live_subscription() {
        violations.push(Violation::FlagDrift {
            step,
            state: Box::new(first.clone()),
        });
    }
    if first.backend_registered {
        let confirmed = rig.registrar.registered();
        if confirmed.last() != first.platform_subscription.as_ref() {
            violations.push(Violation::StaleRegistration {
                step,
                endpoint: first
                    .platform_subscription
                    .as_ref()
                    .map(|handle| handle.endpoint.clone())
                    .unwrap_or_default(),
            });
        }
    }
}
