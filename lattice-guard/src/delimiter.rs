//! HMAC-minted context delimiters.
//!
//! Prompt context is fenced in tags of the form `GRAPHCTX_<nonce>_<mac>`
//! where the MAC covers the nonce under a process-wide secret. A fresh tag is
//! minted per message, so a tag observed in one prompt is useless for forging
//! the fence of another, and tags minted by a different process fail
//! validation closed.

use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;
const MAC_HEX_LEN: usize = 16;

static TAG_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^GRAPHCTX_([A-Za-z0-9]+)_([A-Za-z0-9]+)$").unwrap());

static PROCESS_SECRET: Lazy<Vec<u8>> = Lazy::new(|| {
    let mut rng = rand::rng();
    (0..32).map(|_| rng.random::<u8>()).collect()
});

/// Mints and validates per-message delimiter tags.
#[derive(Clone)]
pub struct HmacDelimiter {
    secret: Vec<u8>,
}

impl std::fmt::Debug for HmacDelimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacDelimiter").finish_non_exhaustive()
    }
}

impl Default for HmacDelimiter {
    fn default() -> Self {
        Self {
            secret: PROCESS_SECRET.clone(),
        }
    }
}

impl HmacDelimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct with an explicit secret (tests, cross-instance validation).
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac_hex(&self, nonce: &str) -> Option<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(nonce.as_bytes());
        let digest = mac.finalize().into_bytes();
        Some(hex::encode(digest)[..MAC_HEX_LEN].to_string())
    }

    /// Mint a fresh tag: `GRAPHCTX_<nonce>_<mac>`.
    pub fn generate(&self) -> String {
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        // An uninitializable MAC yields a malformed tag, which validation
        // rejects: still fail-closed.
        let mac = self.mac_hex(&nonce).unwrap_or_default();
        format!("GRAPHCTX_{nonce}_{mac}")
    }

    /// Validate a tag. Fails closed: wrong shape, wrong MAC, or a tag minted
    /// under another instance's secret all return false.
    pub fn validate(&self, tag: &str) -> bool {
        let Some(caps) = TAG_SHAPE.captures(tag) else {
            return false;
        };
        let nonce = &caps[1];
        let mac = &caps[2];
        let Some(expected_hex) = self.mac_hex(nonce) else {
            return false;
        };
        // Length is fixed; compare bytes without early exit.
        if mac.len() != expected_hex.len() {
            return false;
        }
        mac.bytes()
            .zip(expected_hex.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tags_validate() {
        let delimiter = HmacDelimiter::new();
        let tag = delimiter.generate();
        assert!(tag.starts_with("GRAPHCTX_"));
        assert!(delimiter.validate(&tag));
    }

    #[test]
    fn test_tags_are_fresh_per_message() {
        let delimiter = HmacDelimiter::new();
        assert_ne!(delimiter.generate(), delimiter.generate());
    }

    #[test]
    fn test_foreign_instance_tags_fail_closed() {
        let ours = HmacDelimiter::with_secret(*b"secret-a-secret-a-secret-a-sec-a");
        let theirs = HmacDelimiter::with_secret(*b"secret-b-secret-b-secret-b-sec-b");
        let tag = theirs.generate();
        assert!(!ours.validate(&tag));
    }

    #[test]
    fn test_malformed_tags_fail_closed() {
        let delimiter = HmacDelimiter::new();
        for bad in ["", "GRAPHCTX_", "GRAPHCTX_abc", "GRAPHCTX_abc_", "nope_abc_def"] {
            assert!(!delimiter.validate(bad), "{bad}");
        }
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let delimiter = HmacDelimiter::new();
        let tag = delimiter.generate();
        let tampered = tag.replacen("GRAPHCTX_", "GRAPHCTX_x", 1);
        assert!(!delimiter.validate(&tampered));
    }
}
