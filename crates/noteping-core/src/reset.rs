//! Query-parameter reset hook
//!
//! Operational escape hatch: loading the client with `?reset-notifications`
//! clears both local flags before anything else reads them.

use crate::store::LocalFlags;

/// Query parameter that triggers the reset
pub const RESET_PARAM: &str = "reset-notifications";

/// Clears local flags when the reset parameter is present
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetHook;

impl ResetHook {
    /// Whether `location` (full URL or bare query string) asks for a reset
    #[must_use]
    pub fn requested(location: &str) -> bool {
        let query = if location.contains("://") {
            match url::Url::parse(location) {
                Ok(parsed) => parsed.query().unwrap_or_default().to_string(),
                Err(e) => {
                    tracing::debug!(error = %e, "unparsable location, no reset");
                    return false;
                }
            }
        } else {
            let location = location.split_once('#').map_or(location, |(before, _)| before);
            location
                .split_once('?')
                .map_or(location, |(_, query)| query)
                .to_string()
        };

        url::form_urlencoded::parse(query.as_bytes())
            .filter(|(key, _)| key == RESET_PARAM)
            .any(|(_, value)| !matches!(value.as_ref(), "false" | "0"))
    }

    /// Clear both flags if requested; returns whether a reset happened
    pub fn apply(location: &str, flags: &LocalFlags) -> bool {
        if !Self::requested(location) {
            return false;
        }
        flags.clear();
        tracing::info!("notification flags reset via query parameter");
        true
    }
}
