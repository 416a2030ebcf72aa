//! Environment-based proxy configuration
//!
//! All settings come from environment variables with sensible defaults, so
//! the daemon can run unconfigured and be tuned per deployment:
//!
//! - `LISTEN_HOST` / `LISTEN_PORT` - UDP bind address (default 0.0.0.0:5053)
//! - `DOH_UPSTREAM` - comma-separated DoH endpoint URLs
//! - `BOOTSTRAP_DNS` - IPv4 of the plain-DNS server used to resolve DoH hostnames
//! - `WORKER_COUNT` / `QUEUE_SIZE` - worker pool size and ingress queue capacity
//! - `CACHE_ENABLED` - "true"/"false", case-insensitive
//! - `LOG_LEVEL` - DEBUG/INFO/WARNING/ERROR

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};

/// Default DoH endpoint when `DOH_UPSTREAM` is unset
pub const DEFAULT_UPSTREAM: &str = "https://cloudflare-dns.com/dns-query";

/// Default bootstrap DNS server when `BOOTSTRAP_DNS` is unset
pub const DEFAULT_BOOTSTRAP_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP bind address
    pub listen_host: IpAddr,

    /// UDP bind port
    pub listen_port: u16,

    /// DoH endpoint URLs, in configured order
    pub upstream_urls: Vec<String>,

    /// Plain-DNS server used to bootstrap DoH hostnames
    pub bootstrap_dns: Ipv4Addr,

    /// Number of worker tasks draining the ingress queue
    pub worker_count: usize,

    /// Capacity of the bounded ingress queue
    pub queue_size: usize,

    /// Whether the response cache is active
    pub cache_enabled: bool,

    /// Log level name as configured (DEBUG/INFO/WARNING/ERROR)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 5053,
            upstream_urls: vec![DEFAULT_UPSTREAM.to_string()],
            bootstrap_dns: DEFAULT_BOOTSTRAP_DNS,
            worker_count: 10,
            queue_size: 1000,
            cache_enabled: true,
            log_level: "INFO".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    ///
    /// Unset variables fall back to defaults; set-but-invalid values are
    /// configuration errors and abort startup.
    pub fn from_source<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let listen_host = match get("LISTEN_HOST") {
            Some(raw) => raw
                .parse::<IpAddr>()
                .map_err(|e| Error::Config(format!("invalid LISTEN_HOST '{}': {}", raw, e)))?,
            None => defaults.listen_host,
        };

        let listen_port = parse_number(&get, "LISTEN_PORT", defaults.listen_port)?;

        let upstream_urls = match get("DOH_UPSTREAM") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.upstream_urls,
        };

        let bootstrap_dns = match get("BOOTSTRAP_DNS") {
            Some(raw) => raw
                .parse::<Ipv4Addr>()
                .map_err(|e| Error::Config(format!("invalid BOOTSTRAP_DNS '{}': {}", raw, e)))?,
            None => defaults.bootstrap_dns,
        };

        let worker_count = parse_number(&get, "WORKER_COUNT", defaults.worker_count)?;
        if worker_count == 0 {
            return Err(Error::Config("WORKER_COUNT must be at least 1".into()));
        }

        let queue_size = parse_number(&get, "QUEUE_SIZE", defaults.queue_size)?;
        if queue_size == 0 {
            return Err(Error::Config("QUEUE_SIZE must be at least 1".into()));
        }

        let cache_enabled = match get("CACHE_ENABLED") {
            Some(raw) => raw.trim().eq_ignore_ascii_case("true"),
            None => defaults.cache_enabled,
        };

        let log_level = get("LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            listen_host,
            listen_port,
            upstream_urls,
            bootstrap_dns,
            worker_count,
            queue_size,
            cache_enabled,
            log_level,
        })
    }

    /// The socket address to bind the UDP listener to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.listen_port)
    }

    /// Map the configured log level onto a tracing filter directive
    pub fn tracing_level(&self) -> &'static str {
        match self.log_level.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" => "error",
            _ => "info",
        }
    }
}

fn parse_number<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Config(format!("invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}
