//! Gate pass encoding, signing and validation.
//!
//! A pass is a cookie holding base64-encoded JSON with at least `exp` (epoch
//! milliseconds).  When a secret is configured the JSON must also carry
//! `sig`, the hex HMAC-SHA256 of `gate-pass:{exp}`; without a secret, any
//! structurally valid unexpired pass is accepted.

use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::backend::credentials::decode_base64_lenient;

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation key for access-code comparison.
const ACCESS_CODE_KEY: &[u8] = b"sitegate:access-code";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePass {
    /// Expiry, epoch milliseconds.
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl GatePass {
    /// Parse a cookie value.  Any structural problem is an error.
    pub fn decode(cookie_value: &str) -> Result<Self> {
        let bytes = decode_base64_lenient(cookie_value).context("gate pass is not base64")?;
        serde_json::from_slice(&bytes).context("gate pass is not a JSON object with exp")
    }

    /// Cookie-safe encoding (URL-safe base64, no padding).
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).context("failed to serialise gate pass")?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json))
    }
}

/// Issues and validates passes, optionally under an HMAC secret.
#[derive(Clone)]
pub struct PassKey {
    secret: Option<Vec<u8>>,
}

impl PassKey {
    pub fn new(secret: Option<Vec<u8>>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Passes must carry a valid signature.
    pub fn is_signing(&self) -> bool {
        self.secret.is_some()
    }

    /// Issue a pass expiring `ttl_ms` after `now_ms`.
    pub fn issue(&self, now_ms: i64, ttl_ms: i64) -> Result<GatePass> {
        let exp = now_ms.saturating_add(ttl_ms);
        let sig = match self.secret.as_deref() {
            Some(secret) => Some(hex::encode(sign(secret, exp)?)),
            None => None,
        };
        Ok(GatePass { exp, sig })
    }

    /// A missing, malformed, expired or (when signing) unsigned/forged pass
    /// is invalid.
    pub fn is_valid(&self, cookie_value: Option<&str>, now_ms: i64) -> bool {
        let Some(pass) = cookie_value.and_then(|v| GatePass::decode(v).ok()) else {
            return false;
        };
        if pass.exp <= now_ms {
            return false;
        }
        match self.secret.as_deref() {
            None => true,
            Some(secret) => pass
                .sig
                .as_deref()
                .and_then(|s| hex::decode(s).ok())
                .is_some_and(|sig| verify(secret, pass.exp, &sig)),
        }
    }
}

impl std::fmt::Debug for PassKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassKey")
            .field("signing", &self.is_signing())
            .finish()
    }
}

fn keyed_mac(key: &[u8], message: &[u8]) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("HMAC key error: {e}"))?;
    mac.update(message);
    Ok(mac)
}

fn pass_message(exp: i64) -> Vec<u8> {
    format!("gate-pass:{exp}").into_bytes()
}

fn sign(secret: &[u8], exp: i64) -> Result<Vec<u8>> {
    Ok(keyed_mac(secret, &pass_message(exp))?
        .finalize()
        .into_bytes()
        .to_vec())
}

fn verify(secret: &[u8], exp: i64, sig: &[u8]) -> bool {
    keyed_mac(secret, &pass_message(exp)).is_ok_and(|mac| mac.verify_slice(sig).is_ok())
}

/// Constant-time comparison of a submitted access code with the expected one.
pub fn access_code_matches(expected: &str, submitted: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let Ok(expected_mac) = keyed_mac(ACCESS_CODE_KEY, expected.as_bytes()) else {
        return false;
    };
    let expected_tag = expected_mac.finalize().into_bytes();
    keyed_mac(ACCESS_CODE_KEY, submitted.as_bytes())
        .is_ok_and(|mac| mac.verify_slice(&expected_tag).is_ok())
}
