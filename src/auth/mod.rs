//! Client credentials
//!
//! The username and current access token, consulted each time a request is
//! sent to a proxy host. The token is replaced in place by the refresher.

mod refresh;

pub use refresh::{TokenRefresher, CHECK_INTERVAL, REFRESH_MARGIN};

use crate::{Error, Result};
use base64::Engine;
use http::HeaderValue;
use parking_lot::RwLock;

pub struct Credentials {
    username: String,
    token: RwLock<String>,
}

impl Credentials {
    pub fn new<U: Into<String>, T: Into<String>>(username: U, token: T) -> Self {
        Credentials {
            username: username.into(),
            token: RwLock::new(token.into()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    pub fn set_token<T: Into<String>>(&self, token: T) {
        *self.token.write() = token.into();
    }

    /// `Proxy-Authorization` value: `Basic base64(username:token)`
    pub fn basic_header(&self) -> Result<HeaderValue> {
        let raw = format!("{}:{}", self.username, self.token.read());
        let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
        HeaderValue::from_str(&format!("Basic {}", encoded))
            .map_err(|e| Error::auth(format!("invalid credentials header: {}", e)))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
