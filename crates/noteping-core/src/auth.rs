//! Authentication context
//!
//! The engine never logs in by itself; the hosting application owns the
//! session and exposes the current credential through [`AuthContext`].

use crate::types::Credential;
use parking_lot::RwLock;

/// Source of the current authentication credential
#[cfg_attr(test, mockall::automock)]
pub trait AuthContext: Send + Sync {
    /// Current credential, if signed in
    fn credential(&self) -> Option<Credential>;

    /// Whether a credential is present
    fn is_authenticated(&self) -> bool {
        self.credential().is_some()
    }
}

/// Mutable session holder for the hosting application
#[derive(Debug, Default)]
pub struct SessionAuth {
    credential: RwLock<Option<Credential>>,
}

impl SessionAuth {
    /// Signed-out session
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signed-in session
    #[must_use]
    pub fn signed_in(credential: Credential) -> Self {
        Self {
            credential: RwLock::new(Some(credential)),
        }
    }

    /// Record a login
    pub fn login(&self, credential: Credential) {
        *self.credential.write() = Some(credential);
        tracing::debug!("session credential set");
    }

    /// Record a logout
    pub fn logout(&self) {
        *self.credential.write() = None;
        tracing::debug!("session credential cleared");
    }
}

impl AuthContext for SessionAuth {
    fn credential(&self) -> Option<Credential> {
        self.credential.read().clone()
    }
}
