//! Destination metadata

use crate::{Error, Result};
use http::uri::{Authority, Scheme, Uri};
use std::fmt;
use std::str::FromStr;

/// Destination of a proxied connection (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Host as requested; IPv6 literals keep their brackets
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Target {
            host: host.into(),
            port,
        }
    }

    /// Parse an authority-form request target (`CONNECT host:port`).
    ///
    /// The port is mandatory for CONNECT, but a bare host falls back to 443.
    pub fn from_authority(authority: &str) -> Result<Self> {
        let parsed = Authority::from_str(authority)
            .map_err(|e| Error::address(format!("{}: {}", authority, e)))?;
        if parsed.host().is_empty() {
            return Err(Error::address(format!("missing host in {}", authority)));
        }
        Ok(Target::new(parsed.host(), parsed.port_u16().unwrap_or(443)))
    }

    /// Extract the destination of an absolute-form request URI
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let authority = uri
            .authority()
            .ok_or_else(|| Error::address(format!("missing authority in {}", uri)))?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None if uri.scheme() == Some(&Scheme::HTTPS) => 443,
            None => 80,
        };
        Ok(Target::new(authority.host(), port))
    }

    /// Host normalized for policy lookups
    pub fn domain(&self) -> String {
        normalize_domain(&self.host)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Lowercase, strip IPv6 brackets and a trailing root dot
pub fn normalize_domain(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Suffix candidates of a domain, most specific first.
///
/// `a.b.c` yields `a.b.c`, `b.c`, `c`.
pub fn domain_suffixes(domain: &str) -> impl Iterator<Item = &str> + '_ {
    let mut rest = Some(domain).filter(|d| !d.is_empty());
    std::iter::from_fn(move || {
        let current = rest?;
        rest = current.split_once('.').map(|(_, tail)| tail).filter(|t| !t.is_empty());
        Some(current)
    })
}

/// Last two labels of a domain (registrable-domain heuristic).
///
/// IP literals are returned whole.
pub fn registrable_domain(domain: &str) -> &str {
    if domain.parse::<std::net::IpAddr>().is_ok() {
        return domain;
    }
    match domain.rmatch_indices('.').nth(1) {
        Some((idx, _)) => &domain[idx + 1..],
        None => domain,
    }
}
