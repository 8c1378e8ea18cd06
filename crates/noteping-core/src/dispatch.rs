//! Push payload dispatch and click routing
//!
//! Incoming push payloads are decoded into a `NotificationRender` and handed
//! to the platform for display. A click on a rendered notification resolves
//! to a `NavigationTarget` from its `data`: a note id opens the note, a URL
//! opens the URL, anything else opens the home view.

use crate::error::PlatformError;
use crate::platform::PlatformGateway;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Icon and badge used when the payload names none
pub const DEFAULT_ICON: &str = "/icon-192.svg";

/// Title used when the payload names none or cannot be decoded
pub const DEFAULT_TITLE: &str = "Notification";

/// Routing data attached to a notification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    /// Note the notification refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<i64>,
    /// Explicit navigation URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Action hint, e.g. `view_note`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// Payload as sent by the delivery-relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    /// Notification title
    #[serde(default)]
    pub title: Option<String>,
    /// Notification body
    #[serde(default)]
    pub body: Option<String>,
    /// Icon URL
    #[serde(default)]
    pub icon: Option<String>,
    /// Badge URL
    #[serde(default)]
    pub badge: Option<String>,
    /// Replacement tag
    #[serde(default)]
    pub tag: Option<String>,
    /// Routing data
    #[serde(default)]
    pub data: NotificationData,
}

/// Fully defaulted notification ready for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRender {
    /// Title line
    pub title: String,
    /// Body text
    pub body: String,
    /// Icon URL
    pub icon: String,
    /// Badge URL
    pub badge: String,
    /// Notifications with the same tag replace each other
    pub tag: Option<String>,
    /// Routing data carried through to the click
    pub data: NotificationData,
}

impl NotificationRender {
    /// Fill defaults into a decoded payload
    #[must_use]
    pub fn from_payload(payload: PushPayload) -> Self {
        let tag = payload
            .tag
            .or_else(|| payload.data.note_id.map(|id| format!("note-{id}")));
        Self {
            title: payload.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            body: payload.body.unwrap_or_default(),
            icon: payload.icon.unwrap_or_else(|| DEFAULT_ICON.to_string()),
            badge: payload.badge.unwrap_or_else(|| DEFAULT_ICON.to_string()),
            tag,
            data: payload.data,
        }
    }

    /// Render for a payload that could not be decoded
    #[must_use]
    pub fn fallback(body: impl Into<String>) -> Self {
        Self::from_payload(PushPayload {
            body: Some(body.into()),
            ..PushPayload::default()
        })
    }
}

/// Where a notification click leads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NavigationTarget {
    /// Note detail view
    NoteDetail(i64),
    /// Explicit URL
    Url(String),
    /// Application home
    Home,
}

impl NavigationTarget {
    /// Application-relative path of the target
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::NoteDetail(id) => format!("/note/{id}"),
            Self::Url(url) => url.clone(),
            Self::Home => "/".to_string(),
        }
    }
}

/// Map notification data to its navigation target
#[must_use]
pub fn resolve_click(data: &NotificationData) -> NavigationTarget {
    if let Some(id) = data.note_id {
        return NavigationTarget::NoteDetail(id);
    }
    match data.url.as_deref() {
        Some(url) if !url.trim().is_empty() => NavigationTarget::Url(url.to_string()),
        _ => NavigationTarget::Home,
    }
}

/// Routes incoming payloads and clicks to the platform
#[derive(Clone)]
pub struct PushDispatcher {
    platform: Arc<dyn PlatformGateway>,
}

impl std::fmt::Debug for PushDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushDispatcher").finish_non_exhaustive()
    }
}

impl PushDispatcher {
    /// Create dispatcher
    #[inline]
    #[must_use]
    pub fn new(platform: Arc<dyn PlatformGateway>) -> Self {
        Self { platform }
    }

    /// Decode a raw push payload and display it
    ///
    /// Undecodable payloads still produce a generic notification carrying
    /// the raw text as its body.
    pub async fn handle_payload(&self, bytes: &[u8]) -> Result<NotificationRender, PlatformError> {
        let render = match serde_json::from_slice::<PushPayload>(bytes) {
            Ok(payload) => NotificationRender::from_payload(payload),
            Err(e) => {
                tracing::warn!(error = %e, len = bytes.len(), "undecodable push payload");
                NotificationRender::fallback(String::from_utf8_lossy(bytes).trim().to_string())
            }
        };
        tracing::debug!(title = %render.title, tag = ?render.tag, "showing notification");
        self.platform.show_notification(&render).await?;
        Ok(render)
    }

    /// Resolve a click and ask the platform to open the target
    pub async fn handle_click(&self, data: &NotificationData) -> Result<NavigationTarget, PlatformError> {
        let target = resolve_click(data);
        tracing::debug!(target = %target.path(), "notification clicked");
        self.platform.open_target(&target).await?;
        Ok(target)
    }
}
