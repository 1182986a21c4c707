//! Path classification for the request gate.

use crate::config::PathsConfig;

/// Mount point of the backend passthrough.  Callers must be authenticated.
pub const BACKEND_PROXY_PREFIX: &str = "/api-proxy";

/// Configured path categories, matched against the request path only (no
/// query string).
#[derive(Debug, Clone)]
pub struct PathRules {
    root: String,
    home: String,
    auth: String,
    rest: String,
    api: String,
    gate: String,
    maintenance: String,
    admin: String,
    asset_prefixes: Vec<String>,
    public_api_prefixes: Vec<String>,
    static_extensions: Vec<String>,
}

impl PathRules {
    pub fn from_config(config: &PathsConfig) -> Self {
        Self {
            root: config.root.clone(),
            home: config.home.clone(),
            auth: config.auth.clone(),
            rest: config.rest.clone(),
            api: config.api.clone(),
            gate: config.gate.clone(),
            maintenance: config.maintenance.clone(),
            admin: config.admin.clone(),
            asset_prefixes: config.asset_prefixes.clone(),
            public_api_prefixes: config.public_api_prefixes.clone(),
            static_extensions: config
                .static_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn gate(&self) -> &str {
        &self.gate
    }

    pub fn maintenance(&self) -> &str {
        &self.maintenance
    }

    /// Internal assets, static files and unauthenticated API prefixes.
    /// The extension match never applies to the admin area or the backend
    /// passthrough.
    pub fn is_bypass(&self, path: &str) -> bool {
        self.asset_prefixes
            .iter()
            .chain(&self.public_api_prefixes)
            .any(|p| under_prefix(path, p))
            || (self.has_static_extension(path)
                && !self.is_admin_area(path)
                && !under_prefix(path, BACKEND_PROXY_PREFIX))
    }

    pub fn is_root(&self, path: &str) -> bool {
        path == self.root
    }

    pub fn is_gate_page(&self, path: &str) -> bool {
        under_prefix(path, &self.gate)
    }

    pub fn is_maintenance_page(&self, path: &str) -> bool {
        under_prefix(path, &self.maintenance)
    }

    /// Routes served without authentication.
    pub fn is_public(&self, path: &str) -> bool {
        self.is_root(path)
            || under_prefix(path, &self.auth)
            || under_prefix(path, &self.rest)
            || under_prefix(path, &self.api)
            || self.is_gate_page(path)
            || self.is_maintenance_page(path)
    }

    /// Raw prefix match: `/administrator` is treated as admin area too.
    pub fn is_admin_area(&self, path: &str) -> bool {
        path.starts_with(&self.admin)
    }

    fn has_static_extension(&self, path: &str) -> bool {
        let segment = path.rsplit('/').next().unwrap_or(path);
        match segment.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                let ext = ext.to_ascii_lowercase();
                self.static_extensions.iter().any(|e| *e == ext)
            }
            _ => false,
        }
    }
}

/// Canonical form of a request path: empty segments collapsed, trailing
/// slash kept.  `None` when a segment is `.` or `..` (also percent-encoded),
/// smuggles a separator, or is not UTF-8 once decoded.
pub fn normalize_path(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        let decoded = urlencoding::decode(segment).ok()?;
        if decoded == "."
            || decoded == ".."
            || decoded.contains(['/', '\\', '\0'])
        {
            return None;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() || raw.ends_with('/') {
        out.push('/');
    }
    Some(out)
}

/// Segment-aware prefix match.  `/auth` matches `/auth` and `/auth/x` but
/// not `/authors`; a prefix ending in `/` matches as a raw prefix.
fn under_prefix(path: &str, prefix: &str) -> bool {
    if prefix.ends_with('/') {
        return path.starts_with(prefix);
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
