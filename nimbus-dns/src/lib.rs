//! nimbus-dns - DNS-over-HTTPS proxy engine
//!
//! Accepts standard DNS queries over UDP and resolves them by forwarding the
//! wire-format question to one or more upstream DoH endpoints (RFC 8484),
//! returning the upstream's answer unchanged apart from the transaction ID.
//!
//! Features:
//! - TTL-based response caching keyed on the question (name, type, class)
//! - Round-robin upstream selection with failure tracking and recovery
//! - Bootstrap resolution of DoH hostnames over raw UDP/53, so the proxy can
//!   run as the host's only resolver
//! - Bounded ingress queue with drop-on-full backpressure and a worker pool
//!
//! # Example
//!
//! ```no_run
//! use nimbus_dns::{Config, Server};
//!
//! # async fn example() -> nimbus_dns::Result<()> {
//! let config = Config::from_env()?;
//! let server = Server::bind(config).await?;
//!
//! let shutdown = server.shutdown_handle();
//! // ... send on `shutdown` to stop the server ...
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
mod proxy;
pub mod resolver;
pub mod server;
pub mod upstream;

pub use bootstrap::{bootstrap_url, ResolvedUpstream};
pub use cache::{CacheKey, DnsCache};
pub use config::Config;
pub use error::{Error, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use resolver::DohResolver;
pub use server::Server;
pub use upstream::{SelectedUpstream, UpstreamEndpoint, UpstreamManager, UpstreamStats};
