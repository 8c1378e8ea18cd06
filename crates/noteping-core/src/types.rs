//! Core types for Noteping
//!
//! Defines the shared vocabulary of the two state machines:
//! - Platform capability snapshot and permission state
//! - Push channel handles as issued by the platform
//! - The reconciled `SubscriptionState`
//! - Poll job identifiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// What the runtime currently supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    /// Notifications can be displayed at all
    pub notifications_supported: bool,
    /// A background worker can be registered
    pub worker_supported: bool,
    /// Push channels can be created
    pub push_supported: bool,
}

impl Capability {
    /// Everything supported
    #[inline]
    #[must_use]
    pub const fn full() -> Self {
        Self {
            notifications_supported: true,
            worker_supported: true,
            push_supported: true,
        }
    }

    /// Nothing supported
    #[inline]
    #[must_use]
    pub const fn none() -> Self {
        Self {
            notifications_supported: false,
            worker_supported: false,
            push_supported: false,
        }
    }

    /// Push delivery needs all three facilities
    #[inline]
    #[must_use]
    pub const fn push_capable(&self) -> bool {
        self.notifications_supported && self.worker_supported && self.push_supported
    }
}

/// Notification permission as reported by the platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// User allowed notifications
    Granted,
    /// User blocked notifications; sticky for the session
    Denied,
    /// User has not decided yet
    #[default]
    Unasked,
}

impl Permission {
    /// Whether the user has made a decision
    #[inline]
    #[must_use]
    pub const fn is_decided(&self) -> bool {
        !matches!(self, Self::Unasked)
    }
}

/// Key material of a push channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKeys {
    /// Client public key (base64url)
    pub p256dh: String,
    /// Authentication secret (base64url)
    pub auth: String,
}

/// Opaque platform-issued push destination
///
/// Only ever obtained from the platform gateway; the reconciler never
/// constructs one on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHandle {
    /// Push service endpoint URL
    pub endpoint: String,
    /// Channel expiry, if the push service set one
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub expiration_time: Option<DateTime<Utc>>,
    /// Encryption keys
    pub keys: ChannelKeys,
}

impl ChannelHandle {
    /// Create a handle without an expiry
    #[must_use]
    pub fn new(endpoint: impl Into<String>, p256dh: impl Into<String>, auth: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            expiration_time: None,
            keys: ChannelKeys {
                p256dh: p256dh.into(),
                auth: auth.into(),
            },
        }
    }

    /// With expiry
    #[inline]
    #[must_use]
    pub fn with_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_time = Some(at);
        self
    }

    /// Whether the handle can still receive pushes at `now`
    #[inline]
    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.map_or(true, |at| at > now)
    }

    /// Whether the handle can still receive pushes
    #[inline]
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.is_usable_at(Utc::now())
    }

    /// Endpoint shortened for log lines
    #[must_use]
    pub fn endpoint_preview(&self) -> &str {
        let end = self
            .endpoint
            .char_indices()
            .nth(50)
            .map_or(self.endpoint.len(), |(idx, _)| idx);
        &self.endpoint[..end]
    }
}

/// Authentication credential presented to the backend
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a bearer token
    #[inline]
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token value
    #[inline]
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Non-fatal conditions attached to a successful activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationWarning {
    /// Backend never confirmed the registration; push delivery is off
    BackendRegistrationFailed {
        /// Attempts made before giving up
        attempts: u32,
        /// Description of the final failure
        message: String,
    },
}

/// Reconciled view of the client's notification subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    /// Capability snapshot taken during this pass
    pub capability: Capability,
    /// Platform permission
    pub permission: Permission,
    /// Live platform subscription, if any
    pub platform_subscription: Option<ChannelHandle>,
    /// Backend holds a registration for `platform_subscription`
    pub backend_registered: bool,
    /// User dismissed the opt-in prompt
    pub dismissed: bool,
    /// Local "enabled" flag after self-healing
    pub local_enabled: bool,
    /// Non-fatal issues from the last transition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ActivationWarning>,
}

impl SubscriptionState {
    /// A live platform subscription exists
    #[inline]
    #[must_use]
    pub fn has_live_subscription(&self) -> bool {
        self.platform_subscription.is_some()
    }

    /// Push delivery is fully wired end to end
    #[inline]
    #[must_use]
    pub fn push_ready(&self) -> bool {
        self.has_live_subscription() && self.backend_registered
    }

    /// Local handle exists but the backend never confirmed it
    #[inline]
    #[must_use]
    pub fn needs_backend_registration(&self) -> bool {
        self.has_live_subscription() && !self.backend_registered
    }
}

/// Identifier of an outstanding asynchronous job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Arbitrary job id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Job tracking the AI summary of a note
    #[inline]
    #[must_use]
    pub fn for_note(note_id: i64) -> Self {
        Self(format!("note:{note_id}"))
    }

    /// String form
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identity of one started poll job (distinguishes restarts of the same `JobId`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PollTicket(pub Ulid);

impl PollTicket {
    /// Generate new ticket
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PollTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PollTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn channel_handle_usability_follows_expiry() {
        let now = Utc::now();
        let open = ChannelHandle::new("https://push.example/a", "key", "auth");
        assert!(open.is_usable_at(now));

        let expired = open.clone().with_expiration(now - Duration::seconds(1));
        assert!(!expired.is_usable_at(now));

        let later = open.with_expiration(now + Duration::hours(1));
        assert!(later.is_usable_at(now));
    }

    #[test]
    fn channel_handle_uses_push_subscription_json_shape() {
        let json = r#"{
            "endpoint": "https://fcm.googleapis.com/fcm/send/abc",
            "expirationTime": null,
            "keys": { "p256dh": "BPk", "auth": "x9" }
        }"#;
        let handle: ChannelHandle = serde_json::from_str(json).unwrap();
        assert_eq!(handle.keys.auth, "x9");
        assert!(handle.expiration_time.is_none());
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::bearer("secret-token");
        assert!(!format!("{cred:?}").contains("secret"));
        assert_eq!(cred.token(), "secret-token");
    }

    #[test]
    fn job_id_for_note() {
        assert_eq!(JobId::for_note(42).as_str(), "note:42");
    }

    #[test]
    fn endpoint_preview_truncates() {
        let long = "x".repeat(120);
        let handle = ChannelHandle::new(long, "k", "a");
        assert_eq!(handle.endpoint_preview().len(), 50);
    }
}
