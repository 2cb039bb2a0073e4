//! Credential caching and request headers for the KIS API

use std::time::Duration;
use tokio::time::Instant;

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Shortest lifetime we trust, whatever the server claims
const MIN_LIFETIME: Duration = Duration::from_secs(60);

/// An access token and when it stops being usable
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AccessToken {
    /// Token issued now with a lifetime of `expires_in` seconds
    pub fn issued_now(value: String, expires_in: i64) -> Self {
        let lifetime = Duration::from_secs(expires_in.max(0) as u64).max(MIN_LIFETIME);
        Self {
            value,
            expires_at: Instant::now() + lifetime,
        }
    }

    /// Still usable with the refresh margin applied
    pub fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Cached credentials; both are cleared by a forced refresh
#[derive(Debug, Default)]
pub struct CredentialCache {
    pub access_token: Option<AccessToken>,
    pub approval_key: Option<String>,
}

impl CredentialCache {
    /// The cached access token if it is still fresh
    pub fn fresh_token(&self) -> Option<&str> {
        self.access_token
            .as_ref()
            .filter(|t| t.is_fresh())
            .map(|t| t.value.as_str())
    }

    pub fn clear(&mut self) {
        self.access_token = None;
        self.approval_key = None;
    }
}

/// Headers carried by every authorised KIS call
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub access_token: String,
    pub app_key: String,
    pub app_secret: String,
    pub tr_id: String,
    pub custtype: String,
    pub hashkey: Option<String>,
}

impl AuthHeaders {
    /// Add authentication headers to a reqwest RequestBuilder
    pub fn apply_to_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header("content-type", "application/json; charset=utf-8")
            .header("authorization", format!("Bearer {}", self.access_token))
            .header("appKey", &self.app_key)
            .header("appSecret", &self.app_secret)
            .header("tr_id", &self.tr_id)
            .header("custtype", &self.custtype);
        match &self.hashkey {
            Some(hash) => request.header("hashkey", hash),
            None => request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_token_expires_with_margin() {
        let token = AccessToken::issued_now("t".to_string(), 120);
        assert!(token.is_fresh());

        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(token.is_fresh());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!token.is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_lifetime_is_clamped() {
        let token = AccessToken::issued_now("t".to_string(), 0);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(token.is_fresh());
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut cache = CredentialCache {
            access_token: None,
            approval_key: Some("approval".to_string()),
        };
        assert!(cache.fresh_token().is_none());
        cache.clear();
        assert!(cache.approval_key.is_none());
    }
}
