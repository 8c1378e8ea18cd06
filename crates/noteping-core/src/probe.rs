//! Capability probe
//!
//! Takes a fresh capability snapshot from the platform gateway on every
//! reconciliation pass and logs when the runtime's support changes.

use crate::platform::{Facility, PlatformGateway};
use crate::types::Capability;
use parking_lot::Mutex;

/// Snapshots platform capability
#[derive(Debug, Default)]
pub struct CapabilityProbe {
    last: Mutex<Option<Capability>>,
}

impl CapabilityProbe {
    /// Create a probe with no prior snapshot
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a fresh snapshot
    pub fn probe(&self, platform: &dyn PlatformGateway) -> Capability {
        let notifications_supported = platform.supports(Facility::Notifications);
        let capability = Capability {
            notifications_supported,
            // Worker and push are meaningless without notification display.
            worker_supported: notifications_supported && platform.supports(Facility::Worker),
            push_supported: notifications_supported && platform.supports(Facility::Push),
        };

        let mut last = self.last.lock();
        if last.as_ref() != Some(&capability) {
            tracing::debug!(
                notifications = capability.notifications_supported,
                worker = capability.worker_supported,
                push = capability.push_supported,
                "platform capability changed"
            );
            *last = Some(capability);
        }
        capability
    }

    /// Most recent snapshot, if any probe ran
    #[must_use]
    pub fn last(&self) -> Option<Capability> {
        *self.last.lock()
    }
}
