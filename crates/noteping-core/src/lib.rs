//! Noteping Core - notification subscription engine
//!
//! Two cooperating state machines:
//! - the subscription reconciler, which keeps the local flags, the
//!   platform's push subscription and the backend registration consistent
//! - the completion poller, which watches server-side jobs (AI summaries)
//!   until they finish or the attempt budget runs out
//!
//! Around them sit the capability probe, the local flag store, the backend
//! registration client with retry/backoff, the opt-in prompt gate, push
//! dispatch and the reset hook.
//!
//! # Example
//!
//! ```rust,ignore
//! use noteping_core::prelude::*;
//!
//! # async fn example(platform: Arc<dyn PlatformGateway>, registrar: Arc<dyn Registrar>) {
//! let config = EngineConfig::new();
//! let auth = Arc::new(SessionAuth::signed_in(Credential::bearer("token")));
//! let flags = LocalFlags::new(Arc::new(MemoryStore::new()));
//! let registration = BackendRegistrationClient::new(registrar, auth.clone(), &config.registration);
//! let reconciler = SubscriptionReconciler::new(platform, flags, auth, registration, config.reconciler);
//!
//! match reconciler.activate().await {
//!     Ok(state) => println!("push ready: {}", state.push_ready()),
//!     Err(e) => println!("{}", e.user_message()),
//! }
//! # }
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod auth;
pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod platform;
pub mod poller;
pub mod probe;
pub mod prompt;
pub mod reconciler;
pub mod registration;
pub mod reset;
pub mod store;
pub mod summary;
pub mod types;

// Fakes and simulator, shared with integration tests and the CLI
pub mod test_harness;

// Re-exports for convenience
pub use auth::{AuthContext, SessionAuth};
pub use backoff::BackoffPolicy;
pub use config::{
    BackendConfig, EngineConfig, PollerConfig, PromptConfig, ReconcilerConfig, RegistrationConfig,
};
pub use dispatch::{
    resolve_click, NavigationTarget, NotificationData, NotificationRender, PushDispatcher,
    PushPayload,
};
pub use error::{
    ActivationError, ConfigError, FetchError, PlatformError, RegistrationError, StoreError,
};
pub use platform::{Facility, PlatformGateway};
pub use poller::{
    CompletionPoller, PollHandle, PollJob, PollOptions, PollOutcome, PollState, Settlement,
};
pub use probe::CapabilityProbe;
pub use prompt::{should_show_prompt, PromptGate, PromptInputs, PromptVisibility};
pub use reconciler::{ActivationResult, DiagnosticReport, SubscriptionReconciler};
pub use registration::{BackendRegistrationClient, Registrar, RegistrationReport};
pub use reset::{ResetHook, RESET_PARAM};
pub use store::{FileStore, LocalFlags, LocalStore, MemoryStore};
pub use summary::{Note, NoteDisplay, NoteEvent, NoteSource, SummaryUpdate, SummaryWatcher};
pub use types::{
    ActivationWarning, Capability, ChannelHandle, ChannelKeys, Credential, JobId, Permission,
    PollTicket, SubscriptionState,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for embedding the engine
    pub use crate::{
        ActivationError, AuthContext, BackendRegistrationClient, ChannelHandle, CompletionPoller,
        Credential, EngineConfig, LocalFlags, MemoryStore, NoteSource, Permission,
        PlatformGateway, PromptGate, Registrar, SessionAuth, SubscriptionReconciler,
        SubscriptionState, SummaryWatcher,
    };
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
