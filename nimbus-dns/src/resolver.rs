//! DoH resolver
//!
//! Performs a single DNS-over-HTTPS exchange: pick an endpoint from the
//! upstream pool, POST the wire-format query, and hand back the wire-format
//! answer together with the TTL to cache it under. The outcome of every
//! exchange is reported back to the pool so endpoint health stays current.
//!
//! The resolver never retries across endpoints; failed queries surface to the
//! caller, and the next query simply selects again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use reqwest::header;
use tokio::sync::RwLock;

use crate::cache::{MAX_TTL_SECS, MIN_TTL_SECS};
use crate::error::{Error, Result};
use crate::upstream::UpstreamManager;

/// Per-request deadline for the DoH exchange
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// TTL used when the answer section is empty
pub const NO_ANSWER_TTL_SECS: u64 = 60;

/// RFC 8484 media type for DNS wire format over HTTPS
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Resolver forwarding wire-format queries to DoH endpoints
pub struct DohResolver {
    /// Shared HTTP/2 client; connection pooling and keep-alive live here
    client: reqwest::Client,
    upstreams: Arc<RwLock<UpstreamManager>>,
}

impl DohResolver {
    /// Create a resolver with its own pooled HTTPS client
    pub fn new(upstreams: Arc<RwLock<UpstreamManager>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(UPSTREAM_TIMEOUT)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, upstreams })
    }

    /// Resolve one wire-format query, returning the answer bytes and its TTL
    pub async fn resolve(&self, query: &[u8]) -> Result<(Vec<u8>, u64)> {
        let selected = self
            .upstreams
            .write()
            .await
            .select()
            .ok_or(Error::NoUpstream)?;

        let started = Instant::now();

        let mut request = self
            .client
            .post(&selected.url)
            .header(header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(query.to_vec());
        if let Some(host) = &selected.host_override {
            request = request.header(header::HOST, host.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.upstreams.write().await.record_failure(selected.index);
                let what = if e.is_timeout() { "timed out" } else { "failed" };
                return Err(Error::Upstream(format!(
                    "request to {} {}: {}",
                    selected.url, what, e
                )));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.upstreams.write().await.record_failure(selected.index);
            return Err(Error::UpstreamStatus(status));
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                self.upstreams.write().await.record_failure(selected.index);
                return Err(Error::Upstream(format!(
                    "failed to read body from {}: {}",
                    selected.url, e
                )));
            }
        };

        let ttl = match response_ttl(&body) {
            Ok(ttl) => ttl,
            Err(e) => {
                self.upstreams.write().await.record_failure(selected.index);
                return Err(e);
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.upstreams
            .write()
            .await
            .record_success(selected.index, elapsed_ms);

        Ok((body.to_vec(), ttl))
    }
}

/// Extract the cache TTL from an upstream answer
///
/// The TTL is the minimum over all answer records, [`NO_ANSWER_TTL_SECS`]
/// when the answer section is empty, clamped into the cacheable range.
fn response_ttl(bytes: &[u8]) -> Result<u64> {
    let message = Message::from_vec(bytes)
        .map_err(|e| Error::Decode(format!("invalid upstream response: {}", e)))?;

    let ttl = message
        .answers()
        .iter()
        .map(|record| record.ttl() as u64)
        .min()
        .unwrap_or(NO_ANSWER_TTL_SECS);

    Ok(ttl.clamp(MIN_TTL_SECS, MAX_TTL_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamEndpoint;
    use hickory_proto::op::{MessageType, OpCode, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::str::FromStr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn make_response(ttls: &[u32]) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(4242);
        message.set_message_type(MessageType::Response);
        message.set_op_code(OpCode::Query);
        message.set_response_code(ResponseCode::NoError);

        let name = Name::from_str("example.com.").unwrap();
        for ttl in ttls {
            message.add_answer(Record::from_rdata(
                name.clone(),
                *ttl,
                RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
            ));
        }
        message.to_vec().unwrap()
    }

    #[test]
    fn test_ttl_is_minimum_of_answers() {
        assert_eq!(response_ttl(&make_response(&[300, 120, 900])).unwrap(), 120);
    }

    #[test]
    fn test_zero_ttl_clamped_to_one() {
        assert_eq!(response_ttl(&make_response(&[0])).unwrap(), 1);
    }

    #[test]
    fn test_large_ttl_clamped_to_max() {
        assert_eq!(response_ttl(&make_response(&[7200])).unwrap(), MAX_TTL_SECS);
    }

    #[test]
    fn test_empty_answer_uses_default() {
        assert_eq!(
            response_ttl(&make_response(&[])).unwrap(),
            NO_ANSWER_TTL_SECS
        );
    }

    #[test]
    fn test_garbage_body_is_decode_error() {
        assert!(matches!(
            response_ttl(&[0xff, 0x00, 0x01]),
            Err(Error::Decode(_))
        ));
    }

    /// Minimal HTTP/1.1 upstream answering every request with a fixed
    /// status and body; enough to exercise the resolver without TLS.
    async fn spawn_http_upstream(status_line: &'static str, body: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 65536];
                    let mut read = 0;
                    loop {
                        match stream.read(&mut buf[read..]).await {
                            Ok(0) => break,
                            Ok(n) => {
                                read += n;
                                if request_complete(&buf[..read]) {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }

                    let head = format!(
                        "HTTP/1.1 {}\r\ncontent-type: application/dns-message\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        status_line,
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(&body).await;
                });
            }
        });

        addr
    }

    fn request_complete(data: &[u8]) -> bool {
        let Some(header_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&data[..header_end]).to_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        data.len() >= header_end + 4 + content_length
    }

    fn make_resolver(url: String) -> (DohResolver, Arc<RwLock<UpstreamManager>>) {
        let endpoints = vec![UpstreamEndpoint::new(url, None)];
        let upstreams = Arc::new(RwLock::new(UpstreamManager::new(endpoints).unwrap()));
        let resolver = DohResolver::new(upstreams.clone()).unwrap();
        (resolver, upstreams)
    }

    #[tokio::test]
    async fn test_resolve_success_records_stats() {
        let addr = spawn_http_upstream("200 OK", make_response(&[300])).await;
        let (resolver, upstreams) = make_resolver(format!("http://{}/dns-query", addr));

        let query = make_response(&[]); // any valid DNS message works as a query body
        let (bytes, ttl) = resolver.resolve(&query).await.unwrap();

        assert_eq!(bytes, make_response(&[300]));
        assert_eq!(ttl, 300);

        let stats = upstreams.read().await.stats_snapshot();
        assert_eq!(stats[0].successes, 1);
        assert_eq!(stats[0].failures, 0);
        assert!(stats[0].healthy);
    }

    #[tokio::test]
    async fn test_resolve_http_error_records_failure() {
        let addr = spawn_http_upstream("502 Bad Gateway", Vec::new()).await;
        let (resolver, upstreams) = make_resolver(format!("http://{}/dns-query", addr));

        let result = resolver.resolve(&make_response(&[])).await;
        assert!(matches!(result, Err(Error::UpstreamStatus(_))));

        let stats = upstreams.read().await.stats_snapshot();
        assert_eq!(stats[0].failures, 1);
    }

    #[tokio::test]
    async fn test_resolve_garbage_body_records_failure() {
        let addr = spawn_http_upstream("200 OK", vec![0xff, 0x00]).await;
        let (resolver, upstreams) = make_resolver(format!("http://{}/dns-query", addr));

        let result = resolver.resolve(&make_response(&[])).await;
        assert!(matches!(result, Err(Error::Decode(_))));

        let stats = upstreams.read().await.stats_snapshot();
        assert_eq!(stats[0].failures, 1);
    }

    #[tokio::test]
    async fn test_resolve_connect_error() {
        // Nothing listens on this address.
        let (resolver, upstreams) = make_resolver("http://127.0.0.1:1/dns-query".into());

        let result = resolver.resolve(&make_response(&[])).await;
        assert!(matches!(result, Err(Error::Upstream(_))));

        let stats = upstreams.read().await.stats_snapshot();
        assert_eq!(stats[0].failures, 1);
    }
}
