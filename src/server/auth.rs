//! Proxy-Authorization verification
//!
//! Static credentials are checked first, then the token cache, then the
//! external token verifier.

use super::token_cache::{CachedCheck, TokenCache};
use crate::Result;
use async_trait::async_trait;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// A verifier failure is not retried for this long
pub const FAILED_CHECK_TTL: Duration = Duration::from_secs(3 * 60);
/// A successful verification is trusted for this long
pub const VERIFIED_TTL: Duration = Duration::from_secs(30 * 60);

/// Tokens with this prefix are refresh tokens
pub const REFRESH_TOKEN_PREFIX: &str = "SR:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub email: String,
    pub verified_email: bool,
}

/// Token verification backend
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_access_token(&self, token: &str) -> Result<TokenInfo>;

    async fn verify_refresh_token(&self, token: &str) -> Result<TokenInfo>;
}

/// Result of checking one `Proxy-Authorization` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized(String),
    /// Rejected; carries the claimed username when one could be parsed
    Denied(Option<String>),
}

impl AuthOutcome {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthOutcome::Authorized(_))
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            AuthOutcome::Authorized(user) => Some(user),
            AuthOutcome::Denied(user) => user.as_deref(),
        }
    }
}

pub struct Authenticator {
    static_tokens: HashMap<String, String>,
    cache: Arc<TokenCache>,
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl Authenticator {
    pub fn new(
        static_tokens: HashMap<String, String>,
        cache: Arc<TokenCache>,
        verifier: Option<Arc<dyn TokenVerifier>>,
    ) -> Self {
        Authenticator {
            static_tokens,
            cache,
            verifier,
        }
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    /// Check a raw `Proxy-Authorization` header value
    pub async fn authenticate(&self, header: Option<&str>) -> AuthOutcome {
        let (username, token) = match header.and_then(parse_basic) {
            Some(pair) => pair,
            None => return AuthOutcome::Denied(None),
        };

        if self.matches_static(&username, &token) {
            return AuthOutcome::Authorized(username);
        }

        let verifier = match &self.verifier {
            Some(verifier) => verifier,
            None => return AuthOutcome::Denied(Some(username)),
        };

        if let Some(cached) = self.cache.get(&token) {
            return match cached {
                CachedCheck::Email(email) if email == username => AuthOutcome::Authorized(username),
                CachedCheck::Email(_) => AuthOutcome::Denied(Some(username)),
                CachedCheck::Failed => {
                    debug!("{}: token check failed recently", username);
                    AuthOutcome::Denied(Some(username))
                }
            };
        }

        let checked = match token.strip_prefix(REFRESH_TOKEN_PREFIX) {
            Some(refresh) => verifier.verify_refresh_token(refresh).await,
            None => verifier.verify_access_token(&token).await,
        };

        match checked {
            Ok(info) if !info.verified_email => {
                debug!("{}: email {} not verified", username, info.email);
                self.cache.put(&token, CachedCheck::Failed, VERIFIED_TTL);
                AuthOutcome::Denied(Some(username))
            }
            Ok(info) => {
                let matched = info.email == username;
                self.cache.put(&token, CachedCheck::Email(info.email), VERIFIED_TTL);
                if matched {
                    AuthOutcome::Authorized(username)
                } else {
                    AuthOutcome::Denied(Some(username))
                }
            }
            Err(e) => {
                warn!("token check for {} failed: {}", username, e);
                self.cache.put(&token, CachedCheck::Failed, FAILED_CHECK_TTL);
                AuthOutcome::Denied(Some(username))
            }
        }
    }

    fn matches_static(&self, username: &str, token: &str) -> bool {
        match self.static_tokens.get(username) {
            Some(expected) if !expected.is_empty() => {
                expected.as_bytes().ct_eq(token.as_bytes()).into()
            }
            _ => false,
        }
    }
}

/// Split `Basic base64(user:token)` into its parts
fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, token) = decoded.split_once(':')?;
    Some((user.to_string(), token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn basic(user: &str, token: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, token));
        format!("Basic {}", encoded)
    }

    #[derive(Default)]
    struct FakeVerifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenVerifier for FakeVerifier {
        async fn verify_access_token(&self, token: &str) -> Result<TokenInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match token {
                "bob-token" => Ok(TokenInfo {
                    email: "bob@example.com".into(),
                    verified_email: true,
                }),
                "unverified" => Ok(TokenInfo {
                    email: "eve@example.com".into(),
                    verified_email: false,
                }),
                _ => Err(Error::auth("invalid token")),
            }
        }

        async fn verify_refresh_token(&self, token: &str) -> Result<TokenInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match token {
                "bob-refresh" => Ok(TokenInfo {
                    email: "bob@example.com".into(),
                    verified_email: true,
                }),
                _ => Err(Error::auth("invalid refresh token")),
            }
        }
    }

    fn authenticator(verifier: Option<Arc<FakeVerifier>>) -> Authenticator {
        let mut tokens = HashMap::new();
        tokens.insert("alice".to_string(), "secret".to_string());
        tokens.insert("nobody".to_string(), String::new());
        Authenticator::new(
            tokens,
            Arc::new(TokenCache::new()),
            verifier.map(|v| v as Arc<dyn TokenVerifier>),
        )
    }

    #[test]
    fn test_parse_basic() {
        assert_eq!(
            parse_basic("Basic YWxpY2U6c2VjcmV0"),
            Some(("alice".to_string(), "secret".to_string()))
        );
        assert_eq!(
            parse_basic(&basic("bob", "SR:a:b")),
            Some(("bob".to_string(), "SR:a:b".to_string()))
        );
        assert_eq!(parse_basic("Bearer abc"), None);
        assert_eq!(parse_basic("Basic !!!"), None);
        assert_eq!(parse_basic("Basic"), None);
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let auth = authenticator(None);

        let outcome = auth.authenticate(Some(&basic("alice", "secret"))).await;
        assert_eq!(outcome, AuthOutcome::Authorized("alice".into()));

        let outcome = auth.authenticate(Some(&basic("alice", "wrong"))).await;
        assert_eq!(outcome, AuthOutcome::Denied(Some("alice".into())));

        // an empty configured token never matches
        let outcome = auth.authenticate(Some(&basic("nobody", ""))).await;
        assert!(!outcome.is_authorized());

        assert_eq!(auth.authenticate(None).await, AuthOutcome::Denied(None));
    }

    #[tokio::test]
    async fn test_verifier_success_is_cached() {
        let verifier = Arc::new(FakeVerifier::default());
        let auth = authenticator(Some(verifier.clone()));
        let header = basic("bob@example.com", "bob-token");

        assert!(auth.authenticate(Some(&header)).await.is_authorized());
        assert!(auth.authenticate(Some(&header)).await.is_authorized());
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);

        // same token claimed by another user
        let other = basic("mallory@example.com", "bob-token");
        assert!(!auth.authenticate(Some(&other)).await.is_authorized());
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_verifier_error_is_cached() {
        let verifier = Arc::new(FakeVerifier::default());
        let auth = authenticator(Some(verifier.clone()));
        let header = basic("bob@example.com", "garbage");

        let outcome = auth.authenticate(Some(&header)).await;
        assert_eq!(outcome.username(), Some("bob@example.com"));
        assert!(!outcome.is_authorized());
        assert!(!auth.authenticate(Some(&header)).await.is_authorized());
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.cache().get("garbage"), Some(CachedCheck::Failed));
    }

    #[tokio::test]
    async fn test_refresh_token_prefix() {
        let verifier = Arc::new(FakeVerifier::default());
        let auth = authenticator(Some(verifier));

        let header = basic("bob@example.com", "SR:bob-refresh");
        assert!(auth.authenticate(Some(&header)).await.is_authorized());
    }

    #[tokio::test]
    async fn test_unverified_email_denied() {
        let verifier = Arc::new(FakeVerifier::default());
        let auth = authenticator(Some(verifier));

        let header = basic("eve@example.com", "unverified");
        assert!(!auth.authenticate(Some(&header)).await.is_authorized());
        // and stays denied when answered from the cache
        assert!(!auth.authenticate(Some(&header)).await.is_authorized());
    }
}
