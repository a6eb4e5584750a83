//! Registry Configuration
//!
//! Construction-time settings for a registry instance and the per-call
//! registration options. Every option is a named field with a documented
//! default; `RegistryConfig::validate` fills the defaults and rejects bad
//! input before any connection is attempted.

use crate::addr::{join_host_port, split_host_port, AddrError};
use crate::error::{RegistryError, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{warn, Span};

/// Advertised address used when none is configured
pub const DEFAULT_SERVICE_ADDR: &str = ":9999";

/// Store endpoint used when none is configured
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:2379";

/// Port appended to endpoints given without one
pub const DEFAULT_ENDPOINT_PORT: &str = "2379";

/// Deadline applied to each store operation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lease lifetime used when `RegisterOptions::ttl` is unset
pub const DEFAULT_REGISTER_TTL: Duration = Duration::from_secs(30);

/// Smallest lease lifetime the store can express
pub const MIN_REGISTER_TTL: Duration = Duration::from_secs(1);

/// TLS material for the store connection. Paths point at PEM files.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// CA bundle used to verify the store (system roots when unset)
    pub ca_cert: Option<PathBuf>,
    /// Client certificate for mutual TLS
    pub client_cert: Option<PathBuf>,
    /// Client private key for mutual TLS
    pub client_key: Option<PathBuf>,
    /// Server name to verify instead of the endpoint host
    pub domain: Option<String>,
}

/// Username/password authentication for the store.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Exponential backoff for the construction-time connection check
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial interval between connection attempts
    pub initial: Duration,
    /// Maximum interval between connection attempts
    pub max: Duration,
    /// Give up after this much time
    pub max_elapsed: Duration,
    /// Interval multiplier
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Construction-time options for a registry instance
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Service name, required and non-empty. Prefixes the store key.
    pub service_name: String,

    /// Advertised `host:port`. Empty host means "detect" (default `":9999"`)
    pub service_addr: Option<String>,

    /// Store endpoints, normalized to `host:port` (default `127.0.0.1:2379`)
    pub endpoints: Vec<String>,

    /// Arbitrary metadata attached to the node
    pub metadata: HashMap<String, String>,

    /// Per-operation deadline (default 5s)
    pub timeout: Option<Duration>,

    /// Use TLS even without explicit TLS settings
    pub secure: bool,

    /// TLS material; presence implies `secure`
    pub tls: Option<TlsSettings>,

    /// Store credentials
    pub credentials: Option<Credentials>,

    /// Retry policy for the initial connection check
    pub connect_backoff: BackoffConfig,

    /// Parent span for everything the registry logs
    pub span: Option<Span>,
}

impl RegistryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_service_addr(mut self, addr: impl Into<String>) -> Self {
        self.service_addr = Some(addr.into());
        self
    }

    pub fn with_endpoints<I, E>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Apply defaults and check required fields.
    pub fn validate(self) -> Result<ValidatedConfig> {
        let service_name = self.service_name.trim().to_string();
        if service_name.is_empty() {
            return Err(RegistryError::Config("service name required".to_string()));
        }

        let service_addr = self
            .service_addr
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_ADDR.to_string());
        split_host_port(&service_addr).map_err(|e| {
            RegistryError::Config(format!("invalid service address {service_addr:?}: {e}"))
        })?;

        let timeout = self
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_TIMEOUT);

        let mut endpoints = normalize_endpoints(&self.endpoints);
        if endpoints.is_empty() {
            endpoints.push(DEFAULT_ENDPOINT.to_string());
        }

        let tls = match (self.tls, self.secure) {
            (Some(tls), _) => Some(tls),
            (None, true) => Some(TlsSettings::default()),
            (None, false) => None,
        };

        Ok(ValidatedConfig {
            service_name,
            service_addr,
            endpoints,
            metadata: self.metadata,
            timeout,
            tls,
            credentials: self.credentials,
            connect_backoff: self.connect_backoff,
            span: self.span,
        })
    }
}

/// Configuration with every default applied
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub service_name: String,
    pub service_addr: String,
    pub endpoints: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub timeout: Duration,
    pub tls: Option<TlsSettings>,
    pub credentials: Option<Credentials>,
    pub connect_backoff: BackoffConfig,
    pub span: Option<Span>,
}

/// Normalize one endpoint to `host:port`. Returns `None` for empty or
/// malformed entries.
pub fn normalize_endpoint(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    if without_scheme.is_empty() {
        return None;
    }

    match split_host_port(without_scheme) {
        Ok((host, port)) => Some(join_host_port(&host, &port)),
        Err(AddrError::MissingPort(_)) => {
            let host = without_scheme.trim_start_matches('[').trim_end_matches(']');
            Some(join_host_port(host, DEFAULT_ENDPOINT_PORT))
        }
        Err(e) => {
            warn!(endpoint = %raw, error = %e, "Ignoring malformed store endpoint");
            None
        }
    }
}

pub fn normalize_endpoints(raw: &[String]) -> Vec<String> {
    raw.iter().filter_map(|e| normalize_endpoint(e)).collect()
}

/// Per-call registration options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Lease lifetime (default 30s)
    pub ttl: Option<Duration>,
    /// Renewal period, clamped into `[ttl/3, ttl]`
    pub interval: Option<Duration>,
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Fill defaults and clamp the renewal interval.
    ///
    /// The TTL is truncated to whole seconds, the granularity leases are
    /// granted with. An interval that is unset, shorter than a third of that
    /// TTL or longer than it is replaced by `ttl / 3`.
    pub fn resolve(&self) -> ResolvedRegisterOptions {
        let ttl = match self.ttl {
            None => DEFAULT_REGISTER_TTL,
            Some(ttl) if ttl.is_zero() => DEFAULT_REGISTER_TTL,
            Some(ttl) => Duration::from_secs(ttl.as_secs()).max(MIN_REGISTER_TTL),
        };
        let floor = ttl / 3;

        let interval = match self.interval {
            Some(interval) if interval >= floor && interval <= ttl => interval,
            _ => floor,
        };

        ResolvedRegisterOptions { ttl, interval }
    }
}

/// Registration options after defaults and clamping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRegisterOptions {
    pub ttl: Duration,
    pub interval: Duration,
}

impl ResolvedRegisterOptions {
    /// Lease TTL in whole seconds, as granted by the store
    pub fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
    }
}
