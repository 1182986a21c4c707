use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub settings: SettingsKeys,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub response: ResponseConfig,
    /// Role string that unlocks maintenance bypass and the admin area.
    #[serde(default = "default_admin_role")]
    pub admin_role: String,
}

fn default_admin_role() -> String {
    "admin".to_string()
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    pub listen: String,
}

// ---------------------------------------------------------------------------
// Upstream application
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Origin of the web application that gated requests are forwarded to.
    pub app_url: String,
}

// ---------------------------------------------------------------------------
// Hosted backend (auth, settings table, profiles table)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the hosted backend (e.g. `https://xyz.supabase.co`).
    pub url: String,
    /// Name of the environment variable holding the public anon key.
    #[serde(default = "default_anon_key_env")]
    pub anon_key_env: String,
    /// Name of the environment variable holding the service-role key.
    ///
    /// Optional at runtime: when the variable is unset, settings and role
    /// reads fall back to the anon key.
    #[serde(default = "default_service_key_env")]
    pub service_key_env: String,
    /// Per-call timeout (milliseconds) for auth, settings and role lookups.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Prefix of the backend session cookie (`sb-<project>-auth-token`).
    #[serde(default = "default_auth_cookie_prefix")]
    pub auth_cookie_prefix: String,
}

fn default_anon_key_env() -> String {
    "SUPABASE_ANON_KEY".to_string()
}

fn default_service_key_env() -> String {
    "SUPABASE_SERVICE_ROLE_KEY".to_string()
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_auth_cookie_prefix() -> String {
    "sb-".to_string()
}

// ---------------------------------------------------------------------------
// Site-mode settings cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum staleness (seconds) of the cached site-mode flags.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingsKeys {
    #[serde(default = "default_maintenance_key")]
    pub maintenance_key: String,
    #[serde(default = "default_gate_key")]
    pub gate_key: String,
}

impl Default for SettingsKeys {
    fn default() -> Self {
        Self {
            maintenance_key: default_maintenance_key(),
            gate_key: default_gate_key(),
        }
    }
}

fn default_maintenance_key() -> String {
    "maintenance_mode".to_string()
}

fn default_gate_key() -> String {
    "gate_mode".to_string()
}

// ---------------------------------------------------------------------------
// Path categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Login page.
    pub root: String,
    /// Landing page for authenticated users.
    pub home: String,
    pub auth: String,
    pub rest: String,
    pub api: String,
    pub gate: String,
    pub maintenance: String,
    pub admin: String,
    /// Internal asset prefixes that bypass every gating rule.
    pub asset_prefixes: Vec<String>,
    /// Unauthenticated API prefixes that bypass every gating rule.
    pub public_api_prefixes: Vec<String>,
    /// File extensions (without the dot) treated as static assets.
    pub static_extensions: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: "/".to_string(),
            home: "/accueil".to_string(),
            auth: "/auth".to_string(),
            rest: "/rest".to_string(),
            api: "/api".to_string(),
            gate: "/gate".to_string(),
            maintenance: "/maintenance".to_string(),
            admin: "/admin".to_string(),
            asset_prefixes: vec!["/_app/".to_string()],
            public_api_prefixes: vec!["/api/public".to_string()],
            static_extensions: [
                "js",
                "css",
                "map",
                "png",
                "jpg",
                "jpeg",
                "gif",
                "svg",
                "ico",
                "webp",
                "avif",
                "woff",
                "woff2",
                "ttf",
                "otf",
                "txt",
                "webmanifest",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Cookie holding the base64 JSON gate pass.
    pub cookie_name: String,
    /// Name of the environment variable holding the HMAC secret for passes.
    /// Unset variable means passes are accepted unsigned.
    pub pass_secret_env: String,
    /// Name of the environment variable holding the gate access code.
    pub access_code_env: String,
    /// Lifetime (seconds) of passes issued by `POST /gate/pass`.
    pub pass_ttl_secs: u64,
    /// Mark the pass cookie `Secure`.
    pub cookie_secure: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cookie_name: "gate_pass".to_string(),
            pass_secret_env: "SITEGATE_PASS_SECRET".to_string(),
            access_code_env: "SITEGATE_ACCESS_CODE".to_string(),
            pass_ttl_secs: 12 * 60 * 60,
            cookie_secure: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Response filtering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseConfig {
    /// Headers allowed through on fully-gated responses.
    #[serde(default = "default_header_allowlist")]
    pub header_allowlist: Vec<String>,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            header_allowlist: default_header_allowlist(),
        }
    }
}

fn default_header_allowlist() -> Vec<String> {
    vec!["content-range".to_string()]
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    config
        .server
        .listen
        .parse::<std::net::SocketAddr>()
        .context("server.listen must be a socket address")?;
    reqwest::Url::parse(&config.upstream.app_url).context("upstream.app_url must be a URL")?;
    reqwest::Url::parse(&config.backend.url).context("backend.url must be a URL")?;

    anyhow::ensure!(config.cache.ttl_secs > 0, "cache.ttl_secs must be positive");
    anyhow::ensure!(
        config.backend.timeout_ms > 0,
        "backend.timeout_ms must be positive"
    );
    anyhow::ensure!(
        config.gate.pass_ttl_secs > 0,
        "gate.pass_ttl_secs must be positive"
    );
    anyhow::ensure!(
        !config.gate.cookie_name.is_empty(),
        "gate.cookie_name must not be empty"
    );
    anyhow::ensure!(!config.admin_role.is_empty(), "admin_role must not be empty");

    let p = &config.paths;
    let named = [
        ("root", &p.root),
        ("home", &p.home),
        ("auth", &p.auth),
        ("rest", &p.rest),
        ("api", &p.api),
        ("gate", &p.gate),
        ("maintenance", &p.maintenance),
        ("admin", &p.admin),
    ];
    for (name, value) in named {
        anyhow::ensure!(
            value.starts_with('/'),
            "paths.{name} must start with '/' (got {value:?})"
        );
    }
    for prefix in p.asset_prefixes.iter().chain(&p.public_api_prefixes) {
        anyhow::ensure!(
            prefix.starts_with('/'),
            "bypass prefix must start with '/' (got {prefix:?})"
        );
    }

    for name in &config.response.header_allowlist {
        anyhow::ensure!(
            axum::http::HeaderName::from_bytes(name.as_bytes()).is_ok()
                && name.chars().all(|c| !c.is_ascii_uppercase()),
            "response.header_allowlist entry {name:?} is not a lowercase header name"
        );
    }
    Ok(())
}
