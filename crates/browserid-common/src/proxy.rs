//! Proxy selection for outbound connections.
//!
//! A [`ProxyProvider`] answers one question per request: which proxy, if any,
//! should carry traffic to this target? [`FixedProxy`] sends everything through
//! a single local proxy, [`ProxyTable`] routes per domain.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

/// Host and port of an HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyAddress {
    /// Hostname or IP literal (IPv6 without brackets)
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ProxyAddress {
    /// Default address of the local Tor HTTP proxy.
    pub const LOCAL_TOR_HOST: &'static str = "127.0.0.1";
    /// Default port of the local Tor HTTP proxy.
    pub const LOCAL_TOR_PORT: u16 = 8118;

    /// Create a proxy address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The local Tor HTTP proxy at `127.0.0.1:8118`
    pub fn local_tor() -> Self {
        Self::new(Self::LOCAL_TOR_HOST, Self::LOCAL_TOR_PORT)
    }

    /// `http://host:port/` form suitable for a proxy scheme.
    ///
    /// A host that cannot appear in a URL maps to a name under the reserved
    /// `.invalid` TLD, so the request fails instead of bypassing the proxy.
    pub fn to_url(&self) -> Url {
        Url::parse(&format!("http://{self}/")).unwrap_or_else(|_| {
            Url::parse(&format!("http://unusable-proxy.invalid:{}/", self.port))
                .expect("static host with numeric port is valid")
        })
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error parsing a `host:port` proxy address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
#[error("invalid proxy address {input:?}: {reason}")]
#[diagnostic(
    code(browserid_common::proxy_address),
    help("use host:port, e.g. 127.0.0.1:8118 or [::1]:8118")
)]
pub struct ProxyAddressError {
    /// The rejected input
    pub input: String,
    /// What was wrong with it
    pub reason: &'static str,
}

impl FromStr for ProxyAddress {
    type Err = ProxyAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ProxyAddressError {
            input: s.to_string(),
            reason,
        };
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| err("unclosed '['"))?;
            let port = tail.strip_prefix(':').ok_or_else(|| err("missing port"))?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(|| err("missing port"))?
        };
        if host.is_empty() {
            return Err(err("empty host"));
        }
        if !s.starts_with('[') && host.contains(':') {
            return Err(err("IPv6 hosts must be bracketed"));
        }
        let port = port.parse::<u16>().map_err(|_| err("invalid port"))?;
        Ok(Self::new(host, port))
    }
}

/// Chooses the proxy for an outbound request.
pub trait ProxyProvider: Send + Sync {
    /// Proxy to use for `target`, or `None` to connect directly.
    fn proxy_for(&self, target: &Url) -> Option<ProxyAddress>;
}

impl<P: ProxyProvider + ?Sized> ProxyProvider for Arc<P> {
    fn proxy_for(&self, target: &Url) -> Option<ProxyAddress> {
        self.as_ref().proxy_for(target)
    }
}

impl<P: ProxyProvider + ?Sized> ProxyProvider for &P {
    fn proxy_for(&self, target: &Url) -> Option<ProxyAddress> {
        (**self).proxy_for(target)
    }
}

/// Route every request through one proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedProxy(pub ProxyAddress);

impl Default for FixedProxy {
    fn default() -> Self {
        Self(ProxyAddress::local_tor())
    }
}

impl ProxyProvider for FixedProxy {
    fn proxy_for(&self, _target: &Url) -> Option<ProxyAddress> {
        Some(self.0.clone())
    }
}

/// Always connect directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoProxy;

impl ProxyProvider for NoProxy {
    fn proxy_for(&self, _target: &Url) -> Option<ProxyAddress> {
        None
    }
}

/// Per-domain proxy routing.
///
/// A rule for `example.com` applies to `example.com` itself and to any
/// subdomain (`a.example.com`), never to `badexample.com`. When several rules
/// match, the longest domain wins. Targets without a matching rule use the
/// fallback, which may be `None` for direct connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyTable {
    rules: BTreeMap<String, ProxyAddress>,
    fallback: Option<ProxyAddress>,
}

impl ProxyTable {
    /// Empty table; everything connects directly until rules are added
    pub fn new() -> Self {
        Self::default()
    }

    /// Proxy used when no rule matches
    pub fn with_fallback(mut self, fallback: Option<ProxyAddress>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Route `domain` and its subdomains through `proxy`
    pub fn with_rule(mut self, domain: impl AsRef<str>, proxy: ProxyAddress) -> Self {
        self.insert(domain, proxy);
        self
    }

    /// Add or replace a rule, returning the previous proxy for that domain
    pub fn insert(
        &mut self,
        domain: impl AsRef<str>,
        proxy: ProxyAddress,
    ) -> Option<ProxyAddress> {
        let domain = normalize_domain(domain.as_ref());
        self.rules.insert(domain, proxy)
    }

    /// Number of domain rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table has no domain rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn lookup(&self, host: &str) -> Option<&ProxyAddress> {
        let host = normalize_domain(host);
        let mut candidate = host.as_str();
        loop {
            if let Some(proxy) = self.rules.get(candidate) {
                return Some(proxy);
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return None,
            }
        }
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl ProxyProvider for ProxyTable {
    fn proxy_for(&self, target: &Url) -> Option<ProxyAddress> {
        target
            .host_str()
            .and_then(|host| self.lookup(host))
            .or(self.fallback.as_ref())
            .cloned()
    }
}
