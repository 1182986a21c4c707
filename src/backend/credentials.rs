//! Request credential extraction.
//!
//! Pulls the `Authorization` header and cookies out of an inbound request and
//! recovers the backend access token from either of them.  The backend
//! session cookie is `sb-<project>-auth-token`, optionally split into
//! `...-auth-token.0`, `...-auth-token.1` chunks, holding JSON that may be
//! wrapped as `base64-<payload>`.

use std::collections::BTreeMap;

use axum::http::{header, HeaderMap};
use base64::Engine;

const AUTH_TOKEN_SUFFIX: &str = "-auth-token";
const BASE64_PREFIX: &str = "base64-";

/// Credentials carried by a single request.
#[derive(Debug, Clone, Default)]
pub struct RequestCredentials {
    /// Raw `Authorization` header value.
    pub authorization: Option<String>,
    /// Cookies in header order.  Duplicate names keep the first occurrence
    /// when looked up through [`RequestCredentials::cookie`].
    pub cookies: Vec<(String, String)>,
}

impl RequestCredentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_owned());

        let cookies = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_cookie_header)
            .collect();

        Self {
            authorization,
            cookies,
        }
    }

    /// Value of the first cookie named `name`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Recover the backend access token.
    ///
    /// A `Bearer` authorization header wins over the session cookie.
    pub fn access_token(&self, cookie_prefix: &str) -> Option<String> {
        if let Some(token) = self
            .authorization
            .as_deref()
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            return Some(token.to_string());
        }

        let raw = self.session_cookie_value(cookie_prefix)?;
        token_from_cookie_value(&raw)
    }

    /// Reassemble the (possibly chunked) session cookie value.
    fn session_cookie_value(&self, cookie_prefix: &str) -> Option<String> {
        // base name -> (whole value, chunks by index)
        let mut found: BTreeMap<&str, (Option<&str>, BTreeMap<u32, &str>)> = BTreeMap::new();

        for (name, value) in &self.cookies {
            if !name.starts_with(cookie_prefix) {
                continue;
            }
            if name.ends_with(AUTH_TOKEN_SUFFIX) {
                let entry = found.entry(name.as_str()).or_default();
                entry.0.get_or_insert(value.as_str());
            } else if let Some((base, idx)) = name.rsplit_once('.') {
                if !base.ends_with(AUTH_TOKEN_SUFFIX) {
                    continue;
                }
                if let Ok(idx) = idx.parse::<u32>() {
                    let entry = found.entry(base).or_default();
                    entry.1.entry(idx).or_insert(value.as_str());
                }
            }
        }

        let (_, (whole, chunks)) = found.into_iter().next()?;
        if let Some(whole) = whole {
            return Some(whole.to_string());
        }
        // Chunks must be contiguous from 0.
        let mut out = String::new();
        for (expected, (idx, part)) in chunks.into_iter().enumerate() {
            if idx as usize != expected {
                break;
            }
            out.push_str(part);
        }
        (!out.is_empty()).then_some(out)
    }
}

/// Split a `Cookie` header into `(name, value)` pairs.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"');
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Decode the session cookie payload and pull out the access token.
fn token_from_cookie_value(raw: &str) -> Option<String> {
    let decoded = urlencoding::decode(raw).ok()?.into_owned();

    let json_text = match decoded.strip_prefix(BASE64_PREFIX) {
        Some(b64) => {
            let bytes = decode_base64_lenient(b64)?;
            String::from_utf8(bytes).ok()?
        }
        None => decoded,
    };

    let value: serde_json::Value = serde_json::from_str(&json_text).ok()?;
    let token = match &value {
        serde_json::Value::Object(map) => map.get("access_token")?.as_str()?,
        serde_json::Value::Array(items) => items.first()?.as_str()?,
        _ => return None,
    };
    (!token.is_empty()).then(|| token.to_string())
}

/// Decode base64 in any of the common alphabets, padded or not.
pub fn decode_base64_lenient(input: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

    let input = input.trim();
    [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(input).ok())
}
