//! Bootstrap resolution of DoH endpoint hostnames
//!
//! When this proxy is the host's only resolver, resolving the DoH endpoint's
//! own hostname through the system resolver would loop back into the proxy.
//! To break that cycle, the hostname is resolved once at startup with a raw
//! UDP query against a configured plain-DNS server, and the URL's host is
//! replaced by the first A record. The original hostname is kept so the HTTP
//! layer can still present it for SNI / virtual hosting.
//!
//! Bootstrap is fail-open: on timeout, socket error, or a malformed response
//! the original URL is used unchanged.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// How long to wait for the bootstrap server's answer
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Plain DNS port on the bootstrap server
const DNS_PORT: u16 = 53;

/// Maximum size of a plain-UDP DNS answer
const MAX_RESPONSE_SIZE: usize = 512;

/// A DoH endpoint URL after bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUpstream {
    /// The effective URL to send requests to
    pub url: String,
    /// The original hostname, when the URL host was replaced by an IP.
    /// Carried as a Host header override on each request.
    pub host_override: Option<String>,
}

/// Resolve a DoH endpoint URL against the bootstrap DNS server
///
/// URLs whose host is already an IP literal are returned unchanged.
pub async fn bootstrap_url(url: &str, bootstrap_dns: IpAddr) -> ResolvedUpstream {
    resolve_upstream(
        url,
        SocketAddr::new(bootstrap_dns, DNS_PORT),
        BOOTSTRAP_TIMEOUT,
    )
    .await
}

pub(crate) async fn resolve_upstream(
    url: &str,
    server: SocketAddr,
    timeout: Duration,
) -> ResolvedUpstream {
    let original = ResolvedUpstream {
        url: url.to_string(),
        host_override: None,
    };

    let mut parsed = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("bootstrap: cannot parse upstream URL '{}': {}", url, e);
            return original;
        }
    };

    let host = match parsed.host_str() {
        Some(host) => host.to_string(),
        None => return original,
    };

    // IP-literal hosts need no resolution. IPv6 hosts appear bracketed.
    if host.parse::<IpAddr>().is_ok()
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok()
    {
        return original;
    }

    log::info!("bootstrapping upstream '{}' via {}", host, server);

    match query_a(&host, server, timeout).await {
        Ok(Some(addr)) => {
            if parsed.set_ip_host(IpAddr::V4(addr)).is_err() {
                log::warn!("bootstrap: cannot rewrite host of '{}', keeping original", url);
                return original;
            }
            log::info!("resolved {} -> {}", host, addr);
            ResolvedUpstream {
                url: parsed.to_string(),
                host_override: Some(host),
            }
        }
        Ok(None) => {
            log::warn!(
                "bootstrap: no A record for '{}', keeping original URL",
                host
            );
            original
        }
        Err(e) => {
            log::warn!("bootstrap for '{}' failed: {}, keeping original URL", host, e);
            original
        }
    }
}

/// Send a single A query over UDP and return the first A record, if any
async fn query_a(
    host: &str,
    server: SocketAddr,
    timeout: Duration,
) -> Result<Option<std::net::Ipv4Addr>> {
    let name = Name::from_utf8(host)
        .map_err(|e| Error::Bootstrap(format!("invalid hostname '{}': {}", host, e)))?;

    let mut query = Message::new();
    query.set_id(rand::random());
    query.set_message_type(MessageType::Query);
    query.set_op_code(OpCode::Query);
    query.set_recursion_desired(true);
    query.add_query(Query::query(name, RecordType::A));

    let packet = query
        .to_vec()
        .map_err(|e| Error::Bootstrap(format!("failed to encode query: {}", e)))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(&packet, server).await?;

    let mut buf = [0u8; MAX_RESPONSE_SIZE];
    let (len, _) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::Bootstrap(format!("no answer from {} within {:?}", server, timeout)))??;

    let response = Message::from_vec(&buf[..len])
        .map_err(|e| Error::Bootstrap(format!("malformed answer from {}: {}", server, e)))?;

    for record in response.answers() {
        if let RData::A(a) = record.data() {
            return Ok(Some(a.0));
        }
    }
    Ok(None)
}
