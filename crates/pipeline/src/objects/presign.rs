use std::time::Duration;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use url::Url;
use super::{PresignMethod, PresignedUrl};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresignError {
    #[error("invalid presign base url: {0}")]
    BaseUrl(String),
    #[error("malformed presigned url: {0}")]
    Malformed(String),
    #[error("presigned url expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("presigned url signature mismatch")]
    BadSignature,
    #[error("unusable signing key")]
    Key,
    #[error("presign ttl out of range: {0:?}")]
    TtlOutOfRange(Duration),
}

/// Signs and checks `?key=..&method=..&expires=..&signature=..` links
#[derive(Clone)]
pub struct Presigner {
    secret: Vec<u8>,
    base_url: Url,
}

impl std::fmt::Debug for Presigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presigner")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl Presigner {
    pub fn new(secret: &str, base_url: &str) -> Result<Self, PresignError> {
        let base_url = Url::parse(base_url).map_err(|e| PresignError::BaseUrl(e.to_string()))?;
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            base_url,
        })
    }

    fn signature(&self, method: PresignMethod, key: &str, expires: i64) -> Result<HmacSha256, PresignError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| PresignError::Key)?;
        mac.update(method.as_str().as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    pub fn sign(
        &self,
        key: &str,
        method: PresignMethod,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<PresignedUrl, PresignError> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or(PresignError::TtlOutOfRange(ttl))?;
        let expires = expires_at.timestamp();
        let signature = hex::encode(self.signature(method, key, expires)?.finalize().into_bytes());

        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("key", key)
            .append_pair("method", method.as_str())
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);

        Ok(PresignedUrl {
            url: url.to_string(),
            method,
            expires_at,
        })
    }

    /// Check a link; returns the method and key it grants
    pub fn verify(&self, raw: &str, now: DateTime<Utc>) -> Result<(PresignMethod, String), PresignError> {
        let url = Url::parse(raw).map_err(|e| PresignError::Malformed(e.to_string()))?;
        let mut key = None;
        let mut method = None;
        let mut expires = None;
        let mut signature = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "key" => key = Some(value.into_owned()),
                "method" => method = PresignMethod::parse(&value),
                "expires" => expires = value.parse::<i64>().ok(),
                "signature" => signature = hex::decode(value.as_bytes()).ok(),
                _ => {}
            }
        }
        let (Some(key), Some(method), Some(expires), Some(signature)) = (key, method, expires, signature) else {
            return Err(PresignError::Malformed("missing query parameters".to_string()));
        };

        self.signature(method, &key, expires)?
            .verify_slice(&signature)
            .map_err(|_| PresignError::BadSignature)?;

        let expires_at = DateTime::<Utc>::from_timestamp(expires, 0)
            .ok_or_else(|| PresignError::Malformed("expiry out of range".to_string()))?;
        if now >= expires_at {
            return Err(PresignError::Expired(expires_at));
        }
        Ok((method, key))
    }
}
