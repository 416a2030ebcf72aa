//! Proxy server: ingress queue, worker pool, maintenance tasks, lifecycle
//!
//! The server owns every long-lived piece: the UDP socket, the bounded job
//! queue, the response cache, the upstream pool, and the shared DoH resolver.
//! [`Server::bind`] performs the whole startup sequence up to binding the
//! socket; [`Server::run`] starts the workers and maintenance tasks and then
//! drives the receive loop until shutdown is signalled.
//!
//! Failed queries are dropped without an answer; DNS clients see a timeout
//! and retry on their own. The proxy never synthesizes SERVFAIL.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::interval;

use crate::bootstrap;
use crate::cache::{CacheKey, DnsCache};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::proxy::{self, Job};
use crate::resolver::DohResolver;
use crate::upstream::{UpstreamEndpoint, UpstreamManager};

/// How often expired cache entries are pruned
pub const CACHE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// How often the stats summary is logged
pub const STATS_INTERVAL: Duration = Duration::from_secs(300);

/// How long shutdown waits for workers to drain the queue
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a worker needs to process one job
#[derive(Clone)]
struct WorkerContext {
    socket: Arc<UdpSocket>,
    cache: Arc<RwLock<DnsCache>>,
    resolver: Arc<DohResolver>,
    metrics: Arc<Metrics>,
}

/// The DNS proxy server
pub struct Server {
    config: Config,
    socket: Arc<UdpSocket>,
    cache: Arc<RwLock<DnsCache>>,
    upstreams: Arc<RwLock<UpstreamManager>>,
    resolver: Arc<DohResolver>,
    metrics: Arc<Metrics>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Run the startup sequence: bootstrap upstreams, build the shared
    /// HTTPS client, and bind the UDP socket. A bind failure is fatal.
    pub async fn bind(config: Config) -> Result<Self> {
        let cache = Arc::new(RwLock::new(DnsCache::new(config.cache_enabled)));
        if !config.cache_enabled {
            log::info!("response cache disabled");
        }

        let mut endpoints = Vec::with_capacity(config.upstream_urls.len());
        for url in &config.upstream_urls {
            let resolved =
                bootstrap::bootstrap_url(url, IpAddr::V4(config.bootstrap_dns)).await;
            endpoints.push(UpstreamEndpoint::new(resolved.url, resolved.host_override));
        }

        let upstreams = Arc::new(RwLock::new(UpstreamManager::new(endpoints)?));
        let resolver = Arc::new(DohResolver::new(upstreams.clone())?);

        let socket = UdpSocket::bind(config.listen_addr()).await?;
        log::info!("udp server listening on {}", socket.local_addr()?);

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            socket: Arc::new(socket),
            cache,
            upstreams,
            resolver,
            metrics: Arc::new(Metrics::new()),
            shutdown_tx,
        })
    }

    /// The address the UDP socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// A handle that stops the server when sent to
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Start workers and maintenance tasks, then serve until shutdown
    pub async fn run(self) -> Result<()> {
        let Server {
            config,
            socket,
            cache,
            upstreams,
            resolver,
            metrics,
            shutdown_tx,
        } = self;

        let (queue_tx, queue_rx) = mpsc::channel::<Job>(config.queue_size);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let context = WorkerContext {
            socket: socket.clone(),
            cache: cache.clone(),
            resolver,
            metrics: metrics.clone(),
        };

        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            workers.push(tokio::spawn(worker_loop(
                id,
                queue_rx.clone(),
                context.clone(),
            )));
        }
        log::info!("started {} workers", config.worker_count);

        let cleaner = tokio::spawn(cache_cleaner(cache.clone(), shutdown_tx.subscribe()));
        let reporter = tokio::spawn(stats_reporter(
            cache,
            upstreams,
            metrics.clone(),
            shutdown_tx.subscribe(),
        ));

        proxy::receive_loop(socket, queue_tx, metrics, shutdown_tx.subscribe()).await;

        // The queue sender is gone; workers drain the remaining jobs and
        // stop when the channel is empty, bounded by the drain timeout.
        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        for worker in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, worker).await.is_err() {
                log::warn!("workers did not drain the queue in time");
                break;
            }
        }

        cleaner.abort();
        reporter.abort();
        log::info!("server stopped");
        Ok(())
    }
}

/// Pull jobs off the shared queue until it is closed and drained
async fn worker_loop(id: usize, queue: Arc<Mutex<mpsc::Receiver<Job>>>, context: WorkerContext) {
    log::debug!("worker {} started", id);
    loop {
        let job = { queue.lock().await.recv().await };
        match job {
            Some(job) => handle_job(job, &context).await,
            None => break,
        }
    }
    log::debug!("worker {} stopped", id);
}

/// Process one datagram: decode, consult the cache, resolve on a miss
async fn handle_job(job: Job, context: &WorkerContext) {
    let Some((transaction_id, key)) = decode_question(&job.data) else {
        context.metrics.record_malformed();
        log::debug!("dropping undecodable packet from {}", job.client);
        return;
    };

    context.metrics.record_query();

    let cached = context.cache.write().await.lookup(&key);
    if let Some((mut response, remaining)) = cached {
        context.metrics.record_cache_hit();
        // The cached bytes carry the upstream's transaction ID; patch the
        // caller's ID into this copy only, never into the stored entry.
        patch_transaction_id(&mut response, transaction_id);
        proxy::send_response(&context.socket, job.client, &response).await;
        log::debug!(
            "[cache] {} {:?} ttl={}s {}us -> {}",
            key.name(),
            key.qtype(),
            remaining,
            job.received_at.elapsed().as_micros(),
            job.client
        );
        return;
    }
    context.metrics.record_cache_miss();

    match context.resolver.resolve(&job.data).await {
        Ok((mut response, ttl)) => {
            context.cache.write().await.insert(key.clone(), &response, ttl);
            patch_transaction_id(&mut response, transaction_id);
            proxy::send_response(&context.socket, job.client, &response).await;
            log::debug!(
                "[upstream] {} {:?} ttl={}s {}us -> {}",
                key.name(),
                key.qtype(),
                ttl,
                job.received_at.elapsed().as_micros(),
                job.client
            );
        }
        Err(Error::NoUpstream) => {
            log::error!("dropping query for {}: no upstream available", key.name());
        }
        Err(e) => {
            context.metrics.record_upstream_failure();
            log::warn!("dropping query for {}: {}", key.name(), e);
        }
    }
}

/// Extract the transaction ID and question fingerprint from a raw packet
fn decode_question(data: &[u8]) -> Option<(u16, CacheKey)> {
    let message = Message::from_vec(data).ok()?;
    let question = message.queries().first()?;
    Some((message.id(), CacheKey::from_query(question)))
}

/// Overwrite the first two octets with the caller's transaction ID
fn patch_transaction_id(response: &mut [u8], transaction_id: u16) {
    if response.len() >= 2 {
        let bytes = transaction_id.to_be_bytes();
        response[0] = bytes[0];
        response[1] = bytes[1];
    }
}

/// Prune expired cache entries on a fixed interval
async fn cache_cleaner(cache: Arc<RwLock<DnsCache>>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(CACHE_PRUNE_INTERVAL);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let removed = cache.write().await.prune();
                if removed > 0 {
                    log::debug!("pruned {} expired cache entries", removed);
                }
            }
        }
    }
}

/// Log a one-line summary of counters and per-endpoint health
async fn stats_reporter(
    cache: Arc<RwLock<DnsCache>>,
    upstreams: Arc<RwLock<UpstreamManager>>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(STATS_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let snapshot = metrics.snapshot_and_reset();
                let entries = cache.read().await.len();
                log::info!(
                    "stats: queries={} hits={} misses={} ({:.1}% hit rate) malformed={} dropped={} upstream_failures={} cache_entries={}",
                    snapshot.queries,
                    snapshot.cache_hits,
                    snapshot.cache_misses,
                    snapshot.hit_rate(),
                    snapshot.malformed,
                    snapshot.queue_dropped,
                    snapshot.upstream_failures,
                    entries
                );
                for stats in upstreams.read().await.stats_snapshot() {
                    log::info!(
                        "upstream {} [{}] ok={} failed={} avg={:.1}ms",
                        stats.url,
                        if stats.healthy { "up" } else { "down" },
                        stats.successes,
                        stats.failures,
                        stats.avg_response_ms
                    );
                }
            }
        }
    }
}
