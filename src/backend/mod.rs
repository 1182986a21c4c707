//! Hosted-backend collaborator layer.
//!
//! Provides the [`AuthResolver`], [`SettingsStore`] and [`RoleStore`] traits
//! that the request gate consumes.  Everything backend-specific (URL
//! construction, cookie formats, response parsing) stays behind these traits
//! so the gate can be driven by mocks in tests.

pub mod credentials;
pub mod supabase;

use std::collections::HashMap;

use anyhow::Result;

pub use credentials::RequestCredentials;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-request identity resolved from the caller's credentials.
///
/// Built at the start of every request and dropped at its end; never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Backend user id.  `None` means anonymous.
    pub user_id: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Validates request credentials against the backend auth service.
#[async_trait::async_trait]
pub trait AuthResolver: Send + Sync {
    /// Resolve the caller's session.
    ///
    /// "Not logged in" is `Ok(Session::anonymous())`; `Err` is reserved for
    /// transport or backend failures.
    async fn resolve(&self, credentials: &RequestCredentials) -> Result<Session>;
}

/// Point reads against the backend key-value settings table.
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync {
    /// Fetch the named settings.  Keys without a row are absent from the map.
    async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, serde_json::Value>>;
}

/// Role lookup by user id.
#[async_trait::async_trait]
pub trait RoleStore: Send + Sync {
    /// Return the user's role, or `None` when no profile row exists.
    async fn get_role(&self, user_id: &str) -> Result<Option<String>>;
}

/// Interpret a loosely-typed boolean setting.
///
/// Only JSON `true` and the string `"true"` count as enabled.
pub fn setting_enabled(value: Option<&serde_json::Value>) -> bool {
    match value {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s == "true",
        _ => false,
    }
}
