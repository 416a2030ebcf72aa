//! UDP protocol handler
//!
//! One task owns the receive side of the socket: every datagram becomes a
//! [`Job`] and is pushed onto the bounded ingress queue without blocking.
//! When the queue is full the datagram is dropped and counted; bounded loss
//! under overload is preferred over unbounded buffering. Workers send
//! responses through the same socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use crate::metrics::Metrics;

/// Maximum DNS message size accepted over UDP
pub const MAX_DNS_MESSAGE_SIZE: usize = 4096;

/// One received datagram, queued for a worker
#[derive(Debug)]
pub(crate) struct Job {
    /// Raw datagram bytes
    pub data: Vec<u8>,
    /// Where the datagram came from; the response goes back here
    pub client: SocketAddr,
    /// When the datagram was received
    pub received_at: Instant,
}

/// Enqueue a job without blocking; a full queue drops the job
pub(crate) fn enqueue(queue: &mpsc::Sender<Job>, metrics: &Metrics, job: Job) -> bool {
    match queue.try_send(job) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(job)) => {
            metrics.record_queue_drop();
            log::warn!("ingress queue full, dropping datagram from {}", job.client);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Read datagrams and enqueue jobs until shutdown is signalled
pub(crate) async fn receive_loop(
    socket: Arc<UdpSocket>,
    queue: mpsc::Sender<Job>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("ingress loop shutting down");
                break;
            }

            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let job = Job {
                            data: buf[..len].to_vec(),
                            client: src,
                            received_at: Instant::now(),
                        };
                        enqueue(&queue, &metrics, job);
                    }
                    Err(e) => {
                        log::error!("udp recv error: {}", e);
                    }
                }
            }
        }
    }
}

/// Best-effort response send; UDP gives no delivery guarantee anyway
pub(crate) async fn send_response(socket: &UdpSocket, client: SocketAddr, data: &[u8]) {
    if let Err(e) = socket.send_to(data, client).await {
        log::debug!("failed to send response to {}: {}", client, e);
    }
}
