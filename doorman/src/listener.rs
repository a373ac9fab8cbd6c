//! One task per offset in the port sequence.
//!
//! Each task binds the port its offset currently derives to, serves until the
//! minute rolls over, then rebinds on the freshly derived port. Datagrams are
//! rate limited, authenticated and queued for the consumer; nothing is ever
//! sent back from here.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use seqknock_proto::{clock, ports, AuthError, Verifier};

use crate::consumer::QueuedKnock;
use crate::ratelimit::RateLimiter;
use crate::shutdown::Shutdown;

/// Largest datagram read; a signed knock is well under this.
pub const MAX_DATAGRAM: usize = 4096;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

pub struct PortListener {
    offset: usize,
    bind: IpAddr,
    port_secret: String,
    port_count: usize,
    verifier: Arc<Verifier>,
    queue: mpsc::Sender<QueuedKnock>,
    limiter: RateLimiter,
}

impl PortListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        offset: usize,
        bind: IpAddr,
        port_secret: String,
        port_count: usize,
        verifier: Arc<Verifier>,
        queue: mpsc::Sender<QueuedKnock>,
        rate_pps: u32,
        rate_burst: u32,
    ) -> Self {
        Self {
            offset,
            bind,
            port_secret,
            port_count,
            verifier,
            queue,
            limiter: RateLimiter::new(rate_pps, rate_burst),
        }
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut backoff = INITIAL_BACKOFF;
        while !shutdown.is_triggered() {
            // Deadline first: if the minute turns between the two calls we
            // serve the new port briefly and rebind onto the same one.
            let rotation = Instant::now() + clock::until_next_rotation();
            let port = match ports::derive_ports(&self.port_secret, self.port_count) {
                Ok(p) => p[self.offset],
                Err(e) => {
                    error!(offset = self.offset, "derive ports: {}", e);
                    return;
                }
            };

            let socket = match UdpSocket::bind((self.bind, port)).await {
                Ok(s) => {
                    backoff = INITIAL_BACKOFF;
                    Arc::new(s)
                }
                Err(e) => {
                    let delay = backoff.min(rotation.saturating_duration_since(Instant::now()));
                    warn!(offset = self.offset, port, "bind failed, retry in {:?}: {}", delay, e);
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = sleep(delay) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            debug!(offset = self.offset, port, "listening");
            self.serve(&socket, rotation, &mut shutdown).await;
        }
        info!(offset = self.offset, "listener stopped");
    }

    async fn serve(&mut self, socket: &Arc<UdpSocket>, until: Instant, shutdown: &mut Shutdown) {
        let local = match socket.local_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!(offset = self.offset, "local addr: {}", e);
                return;
            }
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let rotate = sleep_until(until);
        tokio::pin!(rotate);

        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = &mut rotate => {
                    trace!(offset = self.offset, port = local.port(), "rotating");
                    return;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => self.accept(&buf[..n], peer, local, socket),
                    // ICMP unreachable from an earlier send surfaces here on some platforms
                    Err(e) => debug!(port = local.port(), "recv: {}", e),
                },
            }
        }
    }

    fn accept(&mut self, datagram: &[u8], peer: SocketAddr, local: SocketAddr, socket: &Arc<UdpSocket>) {
        if !self.limiter.allow(peer.ip(), std::time::Instant::now()) {
            trace!(%peer, decision = "drop", reason = "rate_limited");
            return;
        }
        let knock = match self.verifier.open(datagram, clock::now_unix_u32()) {
            Ok(k) => k,
            Err(AuthError::Unauthenticated) => {
                trace!(%peer, port = local.port(), "ignoring unauthenticated packet");
                return;
            }
            Err(e) => {
                trace!(%peer, port = local.port(), "drop: {}", e);
                return;
            }
        };
        let item = QueuedKnock {
            knock,
            peer,
            local,
            reply: Some(socket.clone()),
        };
        match self.queue.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(%peer, decision = "drop", reason = "queue_full");
            }
            Err(TrySendError::Closed(_)) => trace!("consumer gone"),
        }
    }
}
