//! # Request Signing
//!
//! The upstream service only accepts connections whose query string carries a
//! signature over the application credentials. Signing is a pluggable
//! primitive: sessions only see the `RequestSigner` trait.
//!
//! ## Default scheme (`YoudaoSigner`, signType v3):
//! ```text
//! sign = hex(sha256(appKey + input + salt + curtime + appSecret))
//! ```
//! where `input` is the `q` parameter shortened to `first10 + len + last10`
//! when it is longer than 20 characters, and empty when absent (streaming
//! requests never carry one).

use crate::relay::error::UpstreamError;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Ordered request parameters. A BTreeMap keeps the query string stable,
/// which makes logs and tests readable.
pub type RequestParams = BTreeMap<String, String>;

/// Produces signed request parameters from unsigned ones.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, params: RequestParams) -> Result<RequestParams, UpstreamError>;
}

/// Default signer for the Youdao streaming speech-translation API.
#[derive(Clone)]
pub struct YoudaoSigner {
    app_key: String,
    app_secret: String,
}

impl YoudaoSigner {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
        }
    }

    /// Sign with an explicit salt and timestamp.
    ///
    /// `sign` calls this with a fresh UUID and the current unix time; tests
    /// call it directly to get deterministic output.
    pub fn sign_with(
        &self,
        mut params: RequestParams,
        salt: &str,
        curtime: &str,
    ) -> Result<RequestParams, UpstreamError> {
        if self.app_key.is_empty() || self.app_secret.is_empty() {
            return Err(UpstreamError::Signing(
                "app key and app secret must both be configured".to_string(),
            ));
        }

        let input = params.get("q").map(|q| truncate_input(q)).unwrap_or_default();
        let source = format!("{}{}{}{}{}", self.app_key, input, salt, curtime, self.app_secret);

        params.insert("appKey".to_string(), self.app_key.clone());
        params.insert("salt".to_string(), salt.to_string());
        params.insert("curtime".to_string(), curtime.to_string());
        params.insert("signType".to_string(), "v3".to_string());
        params.insert("sign".to_string(), sha256_hex(&source));

        Ok(params)
    }
}

/// Secrets stay out of Debug output (and therefore out of logs).
impl std::fmt::Debug for YoudaoSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoudaoSigner")
            .field("app_key", &self.app_key)
            .field("app_secret", &"<redacted>")
            .finish()
    }
}

impl RequestSigner for YoudaoSigner {
    fn sign(&self, params: RequestParams) -> Result<RequestParams, UpstreamError> {
        let salt = uuid::Uuid::new_v4().to_string();
        let curtime = chrono::Utc::now().timestamp().to_string();
        self.sign_with(params, &salt, &curtime)
    }
}

/// Shorten long inputs to `first10 + char count + last10`.
fn truncate_input(q: &str) -> String {
    let chars: Vec<char> = q.chars().collect();
    let len = chars.len();
    if len <= 20 {
        return q.to_string();
    }

    let head: String = chars[..10].iter().collect();
    let tail: String = chars[len - 10..].iter().collect();
    format!("{}{}{}", head, len, tail)
}

fn sha256_hex(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> RequestParams {
        let mut params = RequestParams::new();
        params.insert("from".into(), "zh-CHS".into());
        params.insert("to".into(), "en".into());
        params
    }

    #[test]
    fn test_sign_adds_auth_params() {
        let signer = YoudaoSigner::new("key", "secret");
        let signed = signer.sign_with(base_params(), "salt-1", "1700000000").unwrap();

        assert_eq!(signed["appKey"], "key");
        assert_eq!(signed["salt"], "salt-1");
        assert_eq!(signed["curtime"], "1700000000");
        assert_eq!(signed["signType"], "v3");
        assert_eq!(signed["from"], "zh-CHS");
        assert_eq!(signed["sign"], sha256_hex("keysalt-11700000000secret"));
        assert_eq!(signed["sign"].len(), 64);
    }

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sign_is_deterministic_for_fixed_salt() {
        let signer = YoudaoSigner::new("key", "secret");
        let a = signer.sign_with(base_params(), "s", "1").unwrap();
        let b = signer.sign_with(base_params(), "s", "1").unwrap();
        let c = signer.sign_with(base_params(), "s", "2").unwrap();
        assert_eq!(a["sign"], b["sign"]);
        assert_ne!(a["sign"], c["sign"]);
    }

    #[test]
    fn test_missing_credentials_fail() {
        let signer = YoudaoSigner::new("", "secret");
        assert!(matches!(signer.sign(base_params()), Err(UpstreamError::Signing(_))));
    }

    #[test]
    fn test_truncate_input() {
        assert_eq!(truncate_input("short"), "short");
        assert_eq!(truncate_input("abcdefghijklmnopqrstuvwxyz"), "abcdefghij26qrstuvwxyz");
        // Counted in characters, not bytes
        let cjk = "语".repeat(25);
        assert_eq!(truncate_input(&cjk), format!("{}25{}", "语".repeat(10), "语".repeat(10)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let signer = YoudaoSigner::new("key", "top-secret");
        let debug = format!("{:?}", signer);
        assert!(!debug.contains("top-secret"));
    }
}
