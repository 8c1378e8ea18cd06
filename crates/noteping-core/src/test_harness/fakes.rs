//! Deterministic fakes for the engine's collaborators
//!
//! `FakePlatform` simulates permission, worker readiness and the single
//! platform subscription, recording every call so tests can assert on
//! ordering and side effects. `FakeRegistrar` and `FakeNoteSource` replay
//! scripted outcomes.

use crate::dispatch::{NavigationTarget, NotificationRender};
use crate::error::{FetchError, PlatformError, RegistrationError};
use crate::platform::{Facility, PlatformGateway};
use crate::registration::Registrar;
use crate::summary::{Note, NoteSource};
use crate::types::{Capability, ChannelHandle, Credential, Permission};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Platform calls, in the order the fake observed them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformCall {
    /// `permission()`
    Permission,
    /// `request_permission()`
    RequestPermission,
    /// `worker_ready()`
    WorkerReady,
    /// `lookup_subscription()`
    Lookup,
    /// `subscribe()`
    Subscribe,
    /// `unsubscribe()`
    Unsubscribe,
    /// `show_notification()`
    Show,
    /// `open_target()`
    Open,
}

/// How the fake background worker behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerBehavior {
    /// Ready immediately
    Ready,
    /// Ready after a delay
    ReadyAfter(Duration),
    /// Registration fails
    Fails(String),
    /// Never becomes ready
    Hangs,
}

#[derive(Debug)]
struct PlatformState {
    capability: Capability,
    permission: Permission,
    decision: Permission,
    decision_delay: Duration,
    worker: WorkerBehavior,
    subscription: Option<ChannelHandle>,
    subscribe_failure: Option<PlatformError>,
    lookup_failure: Option<PlatformError>,
    endpoint_seq: u64,
    calls: Vec<PlatformCall>,
    max_live_subscriptions: usize,
    shown: Vec<NotificationRender>,
    opened: Vec<NavigationTarget>,
}

/// Scriptable in-memory platform
#[derive(Debug)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    /// Fully capable platform; the user will grant permission when asked
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlatformState {
                capability: Capability::full(),
                permission: Permission::Unasked,
                decision: Permission::Granted,
                decision_delay: Duration::ZERO,
                worker: WorkerBehavior::Ready,
                subscription: None,
                subscribe_failure: None,
                lookup_failure: None,
                endpoint_seq: 0,
                calls: Vec::new(),
                max_live_subscriptions: 0,
                shown: Vec::new(),
                opened: Vec::new(),
            }),
        }
    }

    /// With capability
    #[must_use]
    pub fn with_capability(self, capability: Capability) -> Self {
        self.state.lock().capability = capability;
        self
    }

    /// With current permission
    #[must_use]
    pub fn with_permission(self, permission: Permission) -> Self {
        self.state.lock().permission = permission;
        self
    }

    /// With the answer the user gives to a permission prompt
    #[must_use]
    pub fn with_decision(self, decision: Permission) -> Self {
        self.state.lock().decision = decision;
        self
    }

    /// With time the user takes to answer the prompt
    #[must_use]
    pub fn with_decision_delay(self, delay: Duration) -> Self {
        self.state.lock().decision_delay = delay;
        self
    }

    /// With worker behavior
    #[must_use]
    pub fn with_worker(self, worker: WorkerBehavior) -> Self {
        self.state.lock().worker = worker;
        self
    }

    /// With a pre-existing subscription
    #[must_use]
    pub fn with_subscription(self, handle: ChannelHandle) -> Self {
        self.set_subscription(Some(handle));
        self
    }

    /// Replace the live subscription out of band (e.g. the browser rotated it)
    pub fn set_subscription(&self, handle: Option<ChannelHandle>) {
        let mut state = self.state.lock();
        state.subscription = handle;
        state.max_live_subscriptions = state
            .max_live_subscriptions
            .max(usize::from(state.subscription.is_some()));
    }

    /// Make the next subscribe calls fail
    pub fn fail_subscribe(&self, error: Option<PlatformError>) {
        self.state.lock().subscribe_failure = error;
    }

    /// Make lookups fail
    pub fn fail_lookup(&self, error: Option<PlatformError>) {
        self.state.lock().lookup_failure = error;
    }

    /// Change permission out of band
    pub fn set_permission(&self, permission: Permission) {
        self.state.lock().permission = permission;
    }

    /// Change the prompt answer
    pub fn set_decision(&self, decision: Permission) {
        self.state.lock().decision = decision;
    }

    /// Current live subscription
    #[must_use]
    pub fn subscription(&self) -> Option<ChannelHandle> {
        self.state.lock().subscription.clone()
    }

    /// Every call so far
    #[must_use]
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of one kind
    #[must_use]
    pub fn count(&self, call: PlatformCall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Highest number of subscriptions that were live at once
    #[must_use]
    pub fn max_live_subscriptions(&self) -> usize {
        self.state.lock().max_live_subscriptions
    }

    /// Notifications displayed
    #[must_use]
    pub fn shown(&self) -> Vec<NotificationRender> {
        self.state.lock().shown.clone()
    }

    /// Targets opened
    #[must_use]
    pub fn opened(&self) -> Vec<NavigationTarget> {
        self.state.lock().opened.clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: PlatformCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl PlatformGateway for FakePlatform {
    fn supports(&self, facility: Facility) -> bool {
        let capability = self.state.lock().capability;
        match facility {
            Facility::Notifications => capability.notifications_supported,
            Facility::Worker => capability.worker_supported,
            Facility::Push => capability.push_supported,
        }
    }

    async fn permission(&self) -> Permission {
        self.record(PlatformCall::Permission);
        self.state.lock().permission
    }

    async fn request_permission(&self) -> Permission {
        self.record(PlatformCall::RequestPermission);
        let (current, delay) = {
            let state = self.state.lock();
            (state.permission, state.decision_delay)
        };
        if current.is_decided() {
            return current;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.permission = state.decision;
        state.permission
    }

    async fn worker_ready(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::WorkerReady);
        let worker = self.state.lock().worker.clone();
        match worker {
            WorkerBehavior::Ready => Ok(()),
            WorkerBehavior::ReadyAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            WorkerBehavior::Fails(reason) => Err(PlatformError::Unavailable(reason)),
            WorkerBehavior::Hangs => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn lookup_subscription(&self) -> Result<Option<ChannelHandle>, PlatformError> {
        self.record(PlatformCall::Lookup);
        let state = self.state.lock();
        if let Some(error) = state.lookup_failure.clone() {
            return Err(error);
        }
        Ok(state.subscription.clone())
    }

    async fn subscribe(&self, _application_server_key: &str) -> Result<ChannelHandle, PlatformError> {
        self.record(PlatformCall::Subscribe);
        let mut state = self.state.lock();
        if let Some(error) = state.subscribe_failure.clone() {
            return Err(error);
        }
        let live = usize::from(state.subscription.is_some()) + 1;
        state.max_live_subscriptions = state.max_live_subscriptions.max(live);

        state.endpoint_seq += 1;
        let handle = ChannelHandle::new(
            format!("https://push.example.test/send/{}", state.endpoint_seq),
            format!("p256dh-{}", state.endpoint_seq),
            format!("auth-{}", state.endpoint_seq),
        );
        state.subscription = Some(handle.clone());
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<bool, PlatformError> {
        self.record(PlatformCall::Unsubscribe);
        let mut state = self.state.lock();
        if state.subscription.as_ref() == Some(handle) {
            state.subscription = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn show_notification(&self, render: &NotificationRender) -> Result<(), PlatformError> {
        self.record(PlatformCall::Show);
        self.state.lock().shown.push(render.clone());
        Ok(())
    }

    async fn open_target(&self, target: &NavigationTarget) -> Result<(), PlatformError> {
        self.record(PlatformCall::Open);
        self.state.lock().opened.push(target.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RegistrarState {
    script: VecDeque<Result<(), RegistrationError>>,
    registered: Vec<ChannelHandle>,
    calls: usize,
}

/// Registrar replaying scripted outcomes; succeeds once the script runs out
#[derive(Debug, Default)]
pub struct FakeRegistrar {
    state: Mutex<RegistrarState>,
}

impl FakeRegistrar {
    /// Always succeeds
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays `script` before succeeding
    #[must_use]
    pub fn scripted(script: impl IntoIterator<Item = Result<(), RegistrationError>>) -> Self {
        Self {
            state: Mutex::new(RegistrarState {
                script: script.into_iter().collect(),
                ..RegistrarState::default()
            }),
        }
    }

    /// Fails `times` times with a server error, then succeeds
    #[must_use]
    pub fn failing(times: usize) -> Self {
        Self::scripted((0..times).map(|_| {
            Err(RegistrationError::ServerRejected {
                status: 503,
                body: "unavailable".to_string(),
            })
        }))
    }

    /// Append outcomes to the script
    pub fn push(&self, outcome: Result<(), RegistrationError>) {
        self.state.lock().script.push_back(outcome);
    }

    /// Calls made
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    /// Handles successfully registered, in order
    #[must_use]
    pub fn registered(&self) -> Vec<ChannelHandle> {
        self.state.lock().registered.clone()
    }
}

#[async_trait]
impl Registrar for FakeRegistrar {
    async fn register(
        &self,
        handle: &ChannelHandle,
        _credential: &Credential,
    ) -> Result<(), RegistrationError> {
        let mut state = self.state.lock();
        state.calls += 1;
        let outcome = state.script.pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            state.registered.push(handle.clone());
        }
        outcome
    }
}

/// Note source replaying scripted fetch results
#[derive(Debug, Default)]
pub struct FakeNoteSource {
    script: Mutex<VecDeque<Result<Note, FetchError>>>,
    fallback: Mutex<Option<Note>>,
    fetches: Mutex<usize>,
}

impl FakeNoteSource {
    /// Empty script; fetches fail with `NotFound`
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Note whose summary is still pending
    #[must_use]
    pub fn pending_note(id: i64) -> Note {
        let now = Utc::now();
        Note {
            id,
            content: format!("note {id}"),
            ai_summary: None,
            notebook_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Note with a summary
    #[must_use]
    pub fn summarized_note(id: i64, summary: &str) -> Note {
        Note {
            ai_summary: Some(summary.to_string()),
            ..Self::pending_note(id)
        }
    }

    /// Append a fetch outcome
    pub fn push(&self, outcome: Result<Note, FetchError>) {
        self.script.lock().push_back(outcome);
    }

    /// Result returned once the script is exhausted
    pub fn set_fallback(&self, note: Option<Note>) {
        *self.fallback.lock() = note;
    }

    /// Fetches made
    #[must_use]
    pub fn fetches(&self) -> usize {
        *self.fetches.lock()
    }
}

#[async_trait]
impl NoteSource for FakeNoteSource {
    async fn fetch_note(&self, note_id: i64) -> Result<Note, FetchError> {
        *self.fetches.lock() += 1;
        if let Some(outcome) = self.script.lock().pop_front() {
            return outcome;
        }
        self.fallback
            .lock()
            .clone()
            .ok_or_else(|| FetchError::NotFound(format!("note {note_id}")))
    }
}
