//! Proxy records and their protocol.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Protocol a proxy is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    /// Both protocols, in the order pools are reported.
    pub const ALL: [Protocol; 2] = [Protocol::Http, Protocol::Https];

    /// Lowercase URL scheme for this protocol.
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "HTTP"),
            Protocol::Https => write!(f, "HTTPS"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(format!("unsupported proxy protocol `{}`", other)),
        }
    }
}

/// Host and port of a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl ProxyAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in `{}`", s))?;
        if host.is_empty() {
            return Err(format!("missing host in `{}`", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("bad port in `{}`: {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

/// A proxy that was (or is about to be) validated.
///
/// Identity is `(address, protocol)`: two records that differ only in source
/// or latency are the same proxy.
#[derive(Debug, Clone)]
pub struct ProxyRecord {
    pub address: ProxyAddr,
    pub protocol: Protocol,
    /// Name of the source that discovered this proxy.
    pub source: String,
    /// Latency advertised by the source, in milliseconds.
    pub observed_latency_ms: f64,
}

impl ProxyRecord {
    pub fn new(
        address: ProxyAddr,
        protocol: Protocol,
        source: impl Into<String>,
        observed_latency_ms: f64,
    ) -> Self {
        Self {
            address,
            protocol,
            source: source.into(),
            observed_latency_ms,
        }
    }

    /// Proxy URL understood by `reqwest::Proxy`.
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// Convert the record to a `reqwest::Proxy` for its protocol.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        match self.protocol {
            Protocol::Http => reqwest::Proxy::http(self.proxy_url()),
            Protocol::Https => reqwest::Proxy::https(self.proxy_url()),
        }
    }
}

impl PartialEq for ProxyRecord {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.protocol == other.protocol
    }
}

impl Eq for ProxyRecord {}

impl Hash for ProxyRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.protocol.hash(state);
    }
}

impl fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {:.0}ms) via {}",
            self.address, self.protocol, self.observed_latency_ms, self.source
        )
    }
}

/// Unfiltered candidate as produced by a source's extractor.
///
/// The protocol is kept as the raw text the source reported; the extract stage
/// discards anything that is not HTTP or HTTPS.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCandidate {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub latency_ms: f64,
}
