//! Platform gateway
//!
//! The platform's notification subsystem (permission, background worker,
//! push channel, notification display) is process-wide shared state. The
//! engine only ever touches it through this injected interface so tests
//! can substitute a deterministic fake.

use crate::dispatch::{NavigationTarget, NotificationRender};
use crate::error::PlatformError;
use crate::types::{ChannelHandle, Permission};
use async_trait::async_trait;

/// Individually probed platform facilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    /// Notification display
    Notifications,
    /// Background worker registration
    Worker,
    /// Push channel subscription
    Push,
}

/// Injected access to the platform notification subsystem
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// Whether a facility exists in this runtime
    fn supports(&self, facility: Facility) -> bool;

    /// Current permission without prompting
    async fn permission(&self) -> Permission;

    /// Prompt the user; may wait indefinitely on the user's decision
    async fn request_permission(&self) -> Permission;

    /// Resolve once the background worker is active (unbounded)
    async fn worker_ready(&self) -> Result<(), PlatformError>;

    /// Existing push subscription, if any
    async fn lookup_subscription(&self) -> Result<Option<ChannelHandle>, PlatformError>;

    /// Create a push subscription
    async fn subscribe(&self, application_server_key: &str) -> Result<ChannelHandle, PlatformError>;

    /// Drop a push subscription; `Ok(false)` when it was already gone
    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<bool, PlatformError>;

    /// Display a notification
    async fn show_notification(&self, render: &NotificationRender) -> Result<(), PlatformError>;

    /// Focus or open the application at a target
    async fn open_target(&self, target: &NavigationTarget) -> Result<(), PlatformError>;
}
