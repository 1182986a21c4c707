//! Supabase-style hosted backend.
//!
//! Implements the three collaborator traits over the backend's HTTP API:
//! `GET /auth/v1/user` for session validation and PostgREST reads against the
//! `app_settings` and `profiles` tables.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::BackendConfig;

use super::{AuthResolver, RequestCredentials, RoleStore, Session, SettingsStore};

// ---------------------------------------------------------------------------
// Backend struct
// ---------------------------------------------------------------------------

pub struct SupabaseBackend {
    http_client: reqwest::Client,
    base_url: String,
    anon_key: String,
    /// Used for table reads when present, otherwise the anon key is used.
    service_key: Option<String>,
    cookie_prefix: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SettingRow {
    key: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    role: Option<String>,
}

impl SupabaseBackend {
    /// Build the backend from config, reading keys from the environment.
    pub fn from_config(config: &BackendConfig, http_client: reqwest::Client) -> Result<Self> {
        let anon_key = std::env::var(&config.anon_key_env).with_context(|| {
            format!(
                "backend anon key env var {} is not set",
                config.anon_key_env
            )
        })?;
        let service_key = std::env::var(&config.service_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if service_key.is_none() {
            debug!(
                env_var = %config.service_key_env,
                "service key not set, table reads use the anon key"
            );
        }
        Ok(Self::new(
            http_client,
            &config.url,
            anon_key,
            service_key,
            &config.auth_cookie_prefix,
        ))
    }

    pub fn new(
        http_client: reqwest::Client,
        base_url: &str,
        anon_key: String,
        service_key: Option<String>,
        cookie_prefix: &str,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key,
            service_key,
            cookie_prefix: cookie_prefix.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    fn table_key(&self) -> &str {
        self.service_key.as_deref().unwrap_or(&self.anon_key)
    }

    fn rest_get(&self, url: reqwest::Url) -> reqwest::RequestBuilder {
        self.http_client
            .get(url)
            .header("apikey", self.table_key())
            .bearer_auth(self.table_key())
            .header("Accept", "application/json")
    }
}

/// PostgREST `in.(...)` filter value.  Keys are quoted so commas and
/// parentheses inside a key cannot break the list.
fn in_filter(keys: &[&str]) -> String {
    let quoted: Vec<String> = keys
        .iter()
        .map(|k| format!("\"{}\"", k.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl AuthResolver for SupabaseBackend {
    async fn resolve(&self, credentials: &RequestCredentials) -> Result<Session> {
        let Some(token) = credentials.access_token(&self.cookie_prefix) else {
            return Ok(Session::anonymous());
        };

        let url = format!("{}/auth/v1/user", self.base_url);
        let resp = self
            .http_client
            .get(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&token)
            .send()
            .await
            .context("backend auth request failed")?;

        match resp.status() {
            s if s.is_success() => {
                let user: UserResponse = resp
                    .json()
                    .await
                    .context("failed to parse backend user response")?;
                Ok(Session::authenticated(user.id))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(status = %resp.status(), "backend rejected access token");
                Ok(Session::anonymous())
            }
            status => bail!("backend auth returned {status}"),
        }
    }
}

#[async_trait::async_trait]
impl SettingsStore for SupabaseBackend {
    async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, serde_json::Value>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let url = reqwest::Url::parse_with_params(
            &format!("{}/rest/v1/app_settings", self.base_url),
            &[("select", "key,value".to_string()), ("key", in_filter(keys))],
        )?;

        let resp = self
            .rest_get(url)
            .send()
            .await
            .context("backend settings request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            warn!(%status, "backend returned non-success for settings read");
            bail!("backend settings read returned {status}");
        }

        let rows: Vec<SettingRow> = resp
            .json()
            .await
            .context("failed to parse backend settings response")?;

        Ok(rows.into_iter().map(|r| (r.key, r.value)).collect())
    }
}

#[async_trait::async_trait]
impl RoleStore for SupabaseBackend {
    async fn get_role(&self, user_id: &str) -> Result<Option<String>> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/rest/v1/profiles", self.base_url),
            &[("select", "role".to_string()), ("id", format!("eq.{user_id}"))],
        )?;

        let resp = self
            .rest_get(url)
            .send()
            .await
            .context("backend profile request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            warn!(%status, "backend returned non-success for profile read");
            bail!("backend profile read returned {status}");
        }

        let rows: Vec<ProfileRow> = resp
            .json()
            .await
            .context("failed to parse backend profile response")?;

        Ok(rows.into_iter().next().and_then(|r| r.role))
    }
}
