// Test harness module
// Deterministic fakes and the randomized reconciler simulator

pub mod fakes;
pub mod simulator;

pub use fakes::*;
pub use simulator::*;

use crate::auth::SessionAuth;
use crate::config::EngineConfig;
use crate::reconciler::SubscriptionReconciler;
use crate::registration::BackendRegistrationClient;
use crate::store::{LocalFlags, MemoryStore};
use crate::types::Credential;
use std::sync::Arc;

/// Token carried by the rig's signed-in session
pub const TEST_TOKEN: &str = "test-token";

/// Reconciler wired to in-memory fakes
///
/// The fakes stay reachable through the public fields so tests can script
/// the platform and inspect side effects.
#[derive(Debug, Clone)]
pub struct TestRig {
    /// Scripted platform
    pub platform: Arc<FakePlatform>,
    /// Scripted backend
    pub registrar: Arc<FakeRegistrar>,
    /// Session; starts signed in
    pub auth: Arc<SessionAuth>,
    /// Flags over a `MemoryStore`
    pub flags: LocalFlags,
    /// Engine under test
    pub reconciler: SubscriptionReconciler,
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRig {
    /// Capable platform, granting user, healthy backend
    #[must_use]
    pub fn new() -> Self {
        Self::with_platform(FakePlatform::new())
    }

    /// Custom platform, healthy backend
    #[must_use]
    pub fn with_platform(platform: FakePlatform) -> Self {
        Self::build(platform, FakeRegistrar::new(), &EngineConfig::default())
    }

    /// Fully custom rig
    #[must_use]
    pub fn build(platform: FakePlatform, registrar: FakeRegistrar, config: &EngineConfig) -> Self {
        let platform = Arc::new(platform);
        let registrar = Arc::new(registrar);
        let auth = Arc::new(SessionAuth::signed_in(Credential::bearer(TEST_TOKEN)));
        let flags = LocalFlags::new(Arc::new(MemoryStore::new()));
        let registration = BackendRegistrationClient::new(
            Arc::clone(&registrar) as _,
            Arc::clone(&auth) as _,
            &config.registration,
        );
        let reconciler = SubscriptionReconciler::new(
            Arc::clone(&platform) as _,
            flags.clone(),
            Arc::clone(&auth) as _,
            registration,
            config.reconciler.clone(),
        );
        Self {
            platform,
            registrar,
            auth,
            flags,
            reconciler,
        }
    }
}
