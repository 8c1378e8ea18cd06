//! Subscription Reconciler Tests
//!
//! End-to-end activation, deactivation and resync against the in-memory
//! platform and backend fakes.
//!
use async_trait::async_trait;
use chrono::Utc;
use noteping_core::prelude::*;
use noteping_core::test_harness::{
    FakePlatform, FakeRegistrar, PlatformCall, TestRig, WorkerBehavior, TEST_TOKEN,
};
use noteping_core::{
    should_show_prompt, ActivationWarning, Capability, Facility, NavigationTarget,
    NotificationRender, PlatformError, PromptInputs, ResetHook,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

fn existing_handle() -> ChannelHandle {
    ChannelHandle::new("https://push.example.test/send/existing", "p256dh-x", "auth-x")
}

#[tokio::test(start_paused = true)]
async fn test_activation_happy_path() {
    let rig = TestRig::new();

    let state = rig.reconciler.activate().await.unwrap();

    assert_eq!(state.permission, Permission::Granted);
    assert!(state.push_ready());
    assert!(state.warnings.is_empty());
    assert!(rig.flags.enabled());
    assert_eq!(rig.platform.subscription(), state.platform_subscription);
    assert_eq!(rig.registrar.registered(), vec![rig.platform.subscription().unwrap()]);
    assert_eq!(
        rig.platform.calls(),
        vec![
            PlatformCall::Permission,
            PlatformCall::RequestPermission,
            PlatformCall::WorkerReady,
            PlatformCall::Lookup,
            PlatformCall::Subscribe,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_signed_out_activation_touches_nothing() {
    let rig = TestRig::new();
    rig.auth.logout();

    assert_eq!(rig.reconciler.activate().await, Err(ActivationError::Unauthenticated));
    assert!(rig.platform.calls().is_empty());
    assert_eq!(rig.registrar.calls(), 0);
    assert!(!rig.flags.enabled());
}

#[tokio::test(start_paused = true)]
async fn test_missing_worker_support_is_unsupported() {
    let rig = TestRig::with_platform(FakePlatform::new().with_capability(Capability {
        notifications_supported: true,
        worker_supported: false,
        push_supported: true,
    }));

    assert_eq!(rig.reconciler.activate().await, Err(ActivationError::Unsupported));
    assert_eq!(rig.platform.count(PlatformCall::RequestPermission), 0);

    let truth = rig.reconciler.get_truth().await;
    assert!(!truth.capability.push_capable());
    assert_eq!(truth.platform_subscription, None);
    assert_eq!(rig.platform.count(PlatformCall::Lookup), 0);
}

#[tokio::test(start_paused = true)]
async fn test_denied_permission_fails_fast() {
    let rig = TestRig::with_platform(FakePlatform::new().with_permission(Permission::Denied));

    assert_eq!(rig.reconciler.activate().await, Err(ActivationError::PermissionDenied));
    assert_eq!(rig.platform.count(PlatformCall::RequestPermission), 0);
    assert_eq!(rig.platform.count(PlatformCall::WorkerReady), 0);
    assert_eq!(rig.platform.count(PlatformCall::Subscribe), 0);
    assert_eq!(rig.registrar.calls(), 0);
    assert!(!rig.flags.enabled());
}

#[tokio::test(start_paused = true)]
async fn test_user_declining_prompt_is_final() {
    let rig = TestRig::with_platform(FakePlatform::new().with_decision(Permission::Denied));

    assert_eq!(rig.reconciler.activate().await, Err(ActivationError::PermissionDenied));
    assert_eq!(rig.reconciler.activate().await, Err(ActivationError::PermissionDenied));

    // Asked once; the second attempt sees the sticky denial.
    assert_eq!(rig.platform.count(PlatformCall::RequestPermission), 1);
    assert_eq!(rig.platform.count(PlatformCall::WorkerReady), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_worker_times_out() {
    let rig = TestRig::with_platform(FakePlatform::new().with_worker(WorkerBehavior::Hangs));

    let result = rig.reconciler.activate().await;

    assert_eq!(result, Err(ActivationError::WorkerTimeout { waited_ms: 15_000 }));
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(rig.platform.count(PlatformCall::Subscribe), 0);
    assert!(!rig.flags.enabled());
}

#[tokio::test(start_paused = true)]
async fn test_failing_worker_maps_to_timeout() {
    let rig = TestRig::with_platform(
        FakePlatform::new().with_worker(WorkerBehavior::Fails("script error".into())),
    );

    assert!(matches!(
        rig.reconciler.activate().await,
        Err(ActivationError::WorkerTimeout { .. })
    ));
    assert_eq!(rig.platform.count(PlatformCall::Subscribe), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_worker_within_timeout_succeeds() {
    let rig = TestRig::with_platform(
        FakePlatform::new().with_worker(WorkerBehavior::ReadyAfter(Duration::from_secs(5))),
    );
    assert!(rig.reconciler.activate().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failure_has_no_backend_side_effects() {
    let rig = TestRig::new();
    rig.platform
        .fail_subscribe(Some(PlatformError::Rejected("bad application key".into())));

    assert_eq!(
        rig.reconciler.activate().await,
        Err(ActivationError::PlatformSubscribeFailed(PlatformError::Rejected(
            "bad application key".into()
        )))
    );
    assert_eq!(rig.registrar.calls(), 0);
    assert!(!rig.flags.enabled());

    rig.platform.fail_subscribe(None);
    assert!(rig.reconciler.activate().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_activations_coalesce() {
    let rig = TestRig::with_platform(
        FakePlatform::new().with_decision_delay(Duration::from_secs(5)),
    );

    let (a, b, c) = tokio::join!(
        rig.reconciler.activate(),
        rig.reconciler.activate(),
        rig.reconciler.activate()
    );

    assert!(a.is_ok());
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(rig.platform.count(PlatformCall::RequestPermission), 1);
    assert_eq!(rig.platform.count(PlatformCall::Subscribe), 1);
    assert_eq!(rig.platform.max_live_subscriptions(), 1);
    assert_eq!(rig.registrar.calls(), 1);

    let report = rig.reconciler.dump_state();
    assert_eq!(report.activations_started, 1);
    assert_eq!(report.coalesced_waiters, 2);
    assert!(!report.activation_in_flight);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_activations_reuse_subscription() {
    let rig = TestRig::new();

    let first = rig.reconciler.activate().await.unwrap();
    let second = rig.reconciler.activate().await.unwrap();

    assert_eq!(first.platform_subscription, second.platform_subscription);
    assert_eq!(rig.platform.count(PlatformCall::Subscribe), 1);
    assert_eq!(rig.platform.max_live_subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_existing_subscription_is_reused() {
    let rig = TestRig::with_platform(
        FakePlatform::new()
            .with_permission(Permission::Granted)
            .with_subscription(existing_handle()),
    );

    let state = rig.reconciler.activate().await.unwrap();

    assert_eq!(state.platform_subscription, Some(existing_handle()));
    assert_eq!(rig.platform.count(PlatformCall::Subscribe), 0);
    assert_eq!(rig.registrar.registered(), vec![existing_handle()]);
}

#[tokio::test(start_paused = true)]
async fn test_expired_subscription_is_replaced() {
    let expired = existing_handle().with_expiration(Utc::now() - chrono::Duration::hours(1));
    let rig = TestRig::with_platform(
        FakePlatform::new()
            .with_permission(Permission::Granted)
            .with_subscription(expired.clone()),
    );

    let state = rig.reconciler.activate().await.unwrap();

    let fresh = state.platform_subscription.unwrap();
    assert_ne!(fresh, expired);
    assert_eq!(rig.platform.count(PlatformCall::Unsubscribe), 1);
    assert_eq!(rig.platform.count(PlatformCall::Subscribe), 1);
    assert_eq!(rig.platform.max_live_subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registration_failure_is_not_fatal() {
    let rig = TestRig::build(
        FakePlatform::new(),
        FakeRegistrar::failing(3),
        &EngineConfig::default(),
    );

    let state = rig.reconciler.activate().await.unwrap();

    assert!(state.has_live_subscription());
    assert!(!state.backend_registered);
    assert!(state.needs_backend_registration());
    assert!(matches!(
        state.warnings.as_slice(),
        [ActivationWarning::BackendRegistrationFailed { attempts: 3, .. }]
    ));
    assert!(rig.flags.enabled());
    assert_eq!(rig.registrar.calls(), 3);
    assert_eq!(rig.reconciler.dump_state().registration_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_resync_registers_unconfirmed_handle() {
    let rig = TestRig::build(
        FakePlatform::new(),
        FakeRegistrar::failing(3),
        &EngineConfig::default(),
    );
    rig.reconciler.activate().await.unwrap();

    let state = rig.reconciler.resync().await;

    assert!(state.push_ready());
    assert_eq!(rig.registrar.calls(), 4);
    assert_eq!(rig.platform.count(PlatformCall::Subscribe), 1);

    // Already confirmed: nothing more to do.
    rig.reconciler.resync().await;
    assert_eq!(rig.registrar.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_resync_signed_out_skips_registration() {
    let rig = TestRig::with_platform(
        FakePlatform::new()
            .with_permission(Permission::Granted)
            .with_subscription(existing_handle()),
    );
    rig.auth.logout();

    let state = rig.reconciler.resync().await;
    assert!(state.needs_backend_registration());
    assert_eq!(rig.registrar.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handle_change_invalidates_backend_registration() {
    let rig = TestRig::new();
    let state = rig.reconciler.activate().await.unwrap();
    assert!(state.backend_registered);

    let rotated = ChannelHandle::new("https://push.example.test/send/rotated", "p2", "a2");
    rig.platform.set_subscription(Some(rotated.clone()));

    let truth = rig.reconciler.get_truth().await;
    assert_eq!(truth.platform_subscription, Some(rotated.clone()));
    assert!(!truth.backend_registered);

    let state = rig.reconciler.resync().await;
    assert!(state.backend_registered);
    assert_eq!(rig.registrar.registered().last(), Some(&rotated));
}

#[tokio::test(start_paused = true)]
async fn test_get_truth_self_heals_and_is_idempotent() {
    let rig = TestRig::new();
    rig.flags.set_enabled(true);

    let first = rig.reconciler.get_truth().await;
    let second = rig.reconciler.get_truth().await;

    assert!(!first.local_enabled);
    assert!(!rig.flags.enabled());
    assert_eq!(first, second);

    rig.platform.set_subscription(Some(existing_handle()));
    let healed = rig.reconciler.get_truth().await;
    assert!(healed.local_enabled);
    assert!(rig.flags.enabled());
    assert_eq!(healed, rig.reconciler.get_truth().await);
}

#[tokio::test(start_paused = true)]
async fn test_failed_lookup_leaves_flags_alone() {
    let rig = TestRig::new();
    rig.flags.set_enabled(true);
    rig.platform
        .fail_lookup(Some(PlatformError::Internal("storage locked".into())));

    let truth = rig.reconciler.get_truth().await;

    assert_eq!(truth.platform_subscription, None);
    assert!(truth.local_enabled);
    assert!(rig.flags.enabled());
}

#[tokio::test(start_paused = true)]
async fn test_deactivate_is_idempotent() {
    let rig = TestRig::new();

    rig.reconciler.deactivate().await.unwrap();
    assert_eq!(rig.platform.count(PlatformCall::Unsubscribe), 0);

    rig.reconciler.activate().await.unwrap();
    rig.flags.set_dismissed(true);
    rig.reconciler.deactivate().await.unwrap();
    rig.reconciler.deactivate().await.unwrap();

    assert_eq!(rig.platform.subscription(), None);
    assert_eq!(rig.platform.count(PlatformCall::Unsubscribe), 1);
    assert!(!rig.flags.enabled());
    assert!(!rig.flags.dismissed());

    let truth = rig.reconciler.get_truth().await;
    assert!(!truth.backend_registered);
    assert_eq!(rig.reconciler.dump_state().registered_endpoint, None);
}

#[tokio::test(start_paused = true)]
async fn test_reset_hook_precedes_prompt_decision() {
    let rig = TestRig::new();
    rig.flags.set_enabled(true);
    rig.flags.set_dismissed(true);

    assert!(ResetHook::apply("?reset-notifications=true", &rig.flags));

    let state = rig.reconciler.get_truth().await;
    assert!(!state.dismissed);
    assert!(should_show_prompt(&PromptInputs::from_state(true, &state)));
}

#[tokio::test(start_paused = true)]
async fn test_dump_state_serializes() {
    let rig = TestRig::new();
    rig.reconciler.activate().await.unwrap();

    let report = rig.reconciler.dump_state();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["activations_started"], 1);
    assert_eq!(
        report.registered_endpoint,
        rig.platform.subscription().map(|handle| handle.endpoint)
    );
    assert!(report.last_state.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_does_not_wedge_lifecycle() {
    let rig = TestRig::with_platform(
        FakePlatform::new().with_decision_delay(Duration::from_secs(10)),
    );

    let abandoned = tokio::time::timeout(Duration::from_secs(1), rig.reconciler.activate()).await;
    assert!(abandoned.is_err());
    assert!(rig.reconciler.dump_state().activation_in_flight);

    // The activation keeps running without a caller and then yields the lock.
    let deactivated = tokio::time::timeout(Duration::from_secs(60), rig.reconciler.deactivate()).await;
    assert_eq!(deactivated, Ok(Ok(())));
    assert!(!rig.reconciler.dump_state().activation_in_flight);
    assert_eq!(rig.platform.count(PlatformCall::Subscribe), 1);
    assert_eq!(rig.platform.subscription(), None);
    assert!(!rig.flags.enabled());

    let resynced = tokio::time::timeout(Duration::from_secs(60), rig.reconciler.resync()).await;
    assert!(resynced.is_ok());

    let state = rig.reconciler.activate().await.unwrap();
    assert!(state.push_ready());
    assert_eq!(rig.reconciler.dump_state().activations_started, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_diagnostics_and_truth_run_alongside_transitions() {
    let rig = TestRig::new();
    let stop = Arc::new(AtomicBool::new(false));

    let dumpers: Vec<_> = (0..2)
        .map(|_| {
            let reconciler = rig.reconciler.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = reconciler.dump_state();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let reconciler = rig.reconciler.clone();
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    reconciler.get_truth().await;
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let transitions = async {
        for _ in 0..300 {
            let burst =
                futures::future::join_all((0..8).map(|_| rig.reconciler.activate())).await;
            assert!(burst.iter().all(Result::is_ok));
            rig.reconciler.deactivate().await.unwrap();
        }
    };
    let finished = tokio::time::timeout(Duration::from_secs(60), transitions).await;

    stop.store(true, Ordering::Relaxed);
    for dumper in dumpers {
        dumper.join().unwrap();
    }
    for reader in readers {
        reader.await.unwrap();
    }

    assert!(finished.is_ok());
    assert_eq!(rig.platform.max_live_subscriptions(), 1);
    assert!(!rig.reconciler.dump_state().activation_in_flight);
}

/// Parks one call until released
#[derive(Default)]
struct Gate {
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl Gate {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

/// `FakePlatform` whose lookups and unsubscribes can be held mid-call
struct GatedPlatform {
    inner: Arc<FakePlatform>,
    /// Holds a lookup after it has read the platform
    lookup: Gate,
    /// Holds an unsubscribe before it reaches the platform
    unsubscribe: Gate,
}

#[async_trait]
impl PlatformGateway for GatedPlatform {
    fn supports(&self, facility: Facility) -> bool {
        self.inner.supports(facility)
    }

    async fn permission(&self) -> Permission {
        self.inner.permission().await
    }

    async fn request_permission(&self) -> Permission {
        self.inner.request_permission().await
    }

    async fn worker_ready(&self) -> Result<(), PlatformError> {
        self.inner.worker_ready().await
    }

    async fn lookup_subscription(&self) -> Result<Option<ChannelHandle>, PlatformError> {
        let found = self.inner.lookup_subscription().await;
        self.lookup.pass().await;
        found
    }

    async fn subscribe(&self, application_server_key: &str) -> Result<ChannelHandle, PlatformError> {
        self.inner.subscribe(application_server_key).await
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<bool, PlatformError> {
        self.unsubscribe.pass().await;
        self.inner.unsubscribe(handle).await
    }

    async fn show_notification(&self, render: &NotificationRender) -> Result<(), PlatformError> {
        self.inner.show_notification(render).await
    }

    async fn open_target(&self, target: &NavigationTarget) -> Result<(), PlatformError> {
        self.inner.open_target(target).await
    }
}

struct GatedRig {
    platform: Arc<FakePlatform>,
    gated: Arc<GatedPlatform>,
    flags: LocalFlags,
    reconciler: SubscriptionReconciler,
}

fn gated_rig() -> GatedRig {
    let platform = Arc::new(FakePlatform::new());
    let gated = Arc::new(GatedPlatform {
        inner: Arc::clone(&platform),
        lookup: Gate::default(),
        unsubscribe: Gate::default(),
    });
    let auth = Arc::new(SessionAuth::signed_in(Credential::bearer(TEST_TOKEN)));
    let flags = LocalFlags::new(Arc::new(MemoryStore::new()));
    let config = EngineConfig::default();
    let registration = BackendRegistrationClient::new(
        Arc::new(FakeRegistrar::new()) as _,
        Arc::clone(&auth) as _,
        &config.registration,
    );
    let reconciler = SubscriptionReconciler::new(
        Arc::clone(&gated) as _,
        flags.clone(),
        auth as _,
        registration,
        config.reconciler.clone(),
    );
    GatedRig {
        platform,
        gated,
        flags,
        reconciler,
    }
}

#[tokio::test(start_paused = true)]
async fn test_stale_observation_keeps_fresh_registration() {
    let rig = gated_rig();

    rig.gated.lookup.arm();
    let observer = tokio::spawn({
        let reconciler = rig.reconciler.clone();
        async move { reconciler.get_truth().await }
    });
    rig.gated.lookup.reached.notified().await;

    // Activation completes while the observer still holds an empty lookup.
    let activated = rig.reconciler.activate().await.unwrap();
    assert!(activated.backend_registered);

    rig.gated.lookup.release.notify_one();
    let stale = observer.await.unwrap();
    assert_eq!(stale.platform_subscription, None);

    assert!(rig.flags.enabled());
    assert_eq!(
        rig.reconciler.dump_state().registered_endpoint,
        rig.platform.subscription().map(|handle| handle.endpoint)
    );
    let truth = rig.reconciler.get_truth().await;
    assert!(truth.backend_registered);
    assert!(truth.local_enabled);
}

#[tokio::test(start_paused = true)]
async fn test_deactivate_clears_flags_after_unsubscribing() {
    let rig = gated_rig();
    rig.reconciler.activate().await.unwrap();

    rig.gated.unsubscribe.arm();
    let deactivation = tokio::spawn({
        let reconciler = rig.reconciler.clone();
        async move { reconciler.deactivate().await }
    });
    rig.gated.unsubscribe.reached.notified().await;

    // The handle is still live here; an observation must not outlast deactivate.
    let during = rig.reconciler.get_truth().await;
    assert!(during.platform_subscription.is_some());

    rig.gated.unsubscribe.release.notify_one();
    deactivation.await.unwrap().unwrap();

    assert_eq!(rig.platform.subscription(), None);
    assert!(!rig.flags.enabled());
    let truth = rig.reconciler.get_truth().await;
    assert!(!truth.local_enabled);
    assert!(!truth.backend_registered);
}
