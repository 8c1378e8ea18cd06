//! Opt-in prompt gate
//!
//! [`should_show_prompt`] is the pure decision. [`PromptGate`] runs it against
//! the reconciler's truth on mount and on every auth change, hides at once
//! when the answer is no, and shows only after a grace period with no newer
//! evaluation in between.

use crate::auth::AuthContext;
use crate::config::PromptConfig;
use crate::reconciler::{ActivationResult, SubscriptionReconciler};
use crate::reset::ResetHook;
use crate::types::{Permission, SubscriptionState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Inputs of the prompt decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptInputs {
    /// A user session exists
    pub authenticated: bool,
    /// Platform permission
    pub permission: Permission,
    /// User dismissed the prompt before
    pub dismissed: bool,
    /// A platform subscription is live
    pub live_subscription: bool,
}

impl PromptInputs {
    /// Derive inputs from reconciled state
    ///
    /// A platform that cannot receive push reads as `Denied`.
    #[must_use]
    pub fn from_state(authenticated: bool, state: &SubscriptionState) -> Self {
        let permission = if state.capability.push_capable() {
            state.permission
        } else {
            Permission::Denied
        };
        Self {
            authenticated,
            permission,
            dismissed: state.dismissed,
            live_subscription: state.has_live_subscription(),
        }
    }
}

/// Show the opt-in prompt?
#[inline]
#[must_use]
pub fn should_show_prompt(inputs: &PromptInputs) -> bool {
    inputs.authenticated
        && inputs.permission != Permission::Denied
        && !inputs.dismissed
        && !inputs.live_subscription
}

/// Published prompt visibility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PromptVisibility {
    /// Not shown
    #[default]
    Hidden,
    /// Shown
    Visible,
}

struct GateShared {
    visibility: watch::Sender<PromptVisibility>,
    generation: AtomicU64,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl GateShared {
    /// Start a new evaluation, invalidating any pending show
    fn bump(&self) -> u64 {
        if let Some(task) = self.pending.lock().take() {
            task.abort();
        }
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn hide(&self) {
        self.visibility.send_if_modified(|current| {
            let changed = *current != PromptVisibility::Hidden;
            *current = PromptVisibility::Hidden;
            changed
        });
    }
}

/// Debounced prompt visibility driven by reconciler state
pub struct PromptGate {
    reconciler: SubscriptionReconciler,
    grace_period: Duration,
    shared: Arc<GateShared>,
}

impl std::fmt::Debug for PromptGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptGate")
            .field("grace_period", &self.grace_period)
            .field("visibility", &self.visibility())
            .finish_non_exhaustive()
    }
}

impl PromptGate {
    /// Create gate; starts hidden
    #[must_use]
    pub fn new(reconciler: SubscriptionReconciler, config: &PromptConfig) -> Self {
        let (visibility, _) = watch::channel(PromptVisibility::Hidden);
        Self {
            reconciler,
            grace_period: config.grace_period(),
            shared: Arc::new(GateShared {
                visibility,
                generation: AtomicU64::new(0),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Visibility updates
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PromptVisibility> {
        self.shared.visibility.subscribe()
    }

    /// Current visibility
    #[must_use]
    pub fn visibility(&self) -> PromptVisibility {
        *self.shared.visibility.borrow()
    }

    /// Evaluate on mount, applying a reset request in `location` first
    pub async fn mount(&self, location: Option<&str>) -> bool {
        if let Some(location) = location {
            ResetHook::apply(location, self.reconciler.flags());
        }
        let authenticated = self.reconciler.auth().is_authenticated();
        self.evaluate(authenticated).await
    }

    /// Re-evaluate after login or logout
    pub async fn on_auth_changed(&self, authenticated: bool) -> bool {
        self.evaluate(authenticated).await
    }

    /// User closed the prompt; it stays hidden across sessions
    pub fn dismiss(&self) {
        self.shared.bump();
        self.reconciler.flags().set_dismissed(true);
        self.shared.hide();
        tracing::debug!("notification prompt dismissed");
    }

    /// User accepted; hide and activate
    ///
    /// # Errors
    /// Whatever `activate()` reports.
    pub async fn accept(&self) -> ActivationResult {
        self.shared.bump();
        self.shared.hide();
        self.reconciler.activate().await
    }

    /// Run the decision; returns it, while visibility follows after the grace period
    async fn evaluate(&self, authenticated: bool) -> bool {
        let generation = self.shared.bump();

        let show = if authenticated {
            let state = self.reconciler.get_truth().await;
            should_show_prompt(&PromptInputs::from_state(true, &state))
        } else {
            false
        };

        if !self.shared.is_current(generation) {
            tracing::trace!(generation, "prompt evaluation superseded");
            return show;
        }

        if !show {
            self.shared.hide();
            return false;
        }
        if self.visibility() == PromptVisibility::Visible {
            return true;
        }

        let shared = Arc::clone(&self.shared);
        let grace_period = self.grace_period;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if shared.is_current(generation) {
                tracing::debug!("showing notification prompt");
                shared.visibility.send_replace(PromptVisibility::Visible);
            }
        });
        let mut pending = self.shared.pending.lock();
        if self.shared.is_current(generation) {
            *pending = Some(task);
        } else {
            task.abort();
        }
        true
    }
}

impl Drop for PromptGate {
    fn drop(&mut self) {
        if let Some(task) = self.shared.pending.lock().take() {
            task.abort();
        }
    }
}
