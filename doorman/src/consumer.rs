//! The single consumer of authenticated knocks.
//!
//! Listeners only enqueue. This task alone advances watermarks, mutates
//! sessions and asks the gate to extend, so none of that state needs a lock
//! beyond the registry's.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use seqknock_proto::packet::{Ack, Packet};
use seqknock_proto::{clock, ports, Knock, Registry, SessionId};

use crate::gate::GateHandle;
use crate::session::SessionTable;
use crate::shutdown::Shutdown;
use crate::store::StoreWriter;

/// One authenticated knock as handed over by a listener.
#[derive(Debug)]
pub struct QueuedKnock {
    pub knock: Knock,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Socket the knock arrived on, for acks.
    pub reply: Option<Arc<UdpSocket>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Dropped before touching session state.
    Rejected(&'static str),
    /// Recorded; the session is still incomplete.
    Recorded,
    /// Complete and matching: the gate was extended.
    Correct,
    /// Complete but wrong ports or order.
    Incorrect,
    /// The ack could not be sent; the session was dropped.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub port_secret: String,
    pub port_count: usize,
    pub open_secs: u64,
    pub send_acks: bool,
}

pub struct Consumer {
    settings: ConsumerSettings,
    registry: Arc<Registry>,
    writer: Option<StoreWriter>,
    gate: GateHandle,
    sessions: SessionTable,
    clock: fn() -> u64,
}

impl Consumer {
    pub fn new(
        settings: ConsumerSettings,
        registry: Arc<Registry>,
        writer: Option<StoreWriter>,
        gate: GateHandle,
    ) -> Self {
        Self {
            settings,
            registry,
            writer,
            gate,
            sessions: SessionTable::new(),
            clock: clock::now_unix,
        }
    }

    /// Replaces the wall clock used to derive the expected sequence.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    fn session(&self, id: &seqknock_proto::ClientId) -> Option<&crate::session::KnockSession> {
        self.sessions.get(id)
    }

    pub async fn run(mut self, mut queue: mpsc::Receiver<QueuedKnock>, mut shutdown: Shutdown) {
        info!("packet consumer started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                item = queue.recv() => match item {
                    Some(item) => {
                        self.handle(item).await;
                    }
                    None => break,
                },
            }
        }
        self.sessions.clear();
        info!("packet consumer stopped");
    }

    pub async fn handle(&mut self, item: QueuedKnock) -> Outcome {
        let knock = item.knock;
        let id = knock.client_id();

        // The listener checked the watermark under a read lock; another copy
        // of this knock may have been accepted since.
        if let Err(e) = self.registry.advance(&id, knock.nonce()) {
            trace!(client = %id, "drop: {}", e);
            return Outcome::Rejected("replay");
        }
        if let Some(writer) = &self.writer {
            writer.mark_dirty();
        }

        // The codec keeps whatever indices arrive; an index past its own
        // maximum would sit in the session forever and block completion.
        if knock.sequence() > knock.max_sequence() {
            debug!(
                client = %id,
                decision = "drop",
                reason = "sequence exceeds max sequence",
                sequence = knock.sequence(),
                max_sequence = knock.max_sequence()
            );
            return Outcome::Rejected("sequence exceeds max sequence");
        }

        if usize::from(knock.max_sequence()) >= self.settings.port_count {
            debug!(
                client = %id,
                decision = "drop",
                reason = "max sequence exceeds port count",
                max_sequence = knock.max_sequence()
            );
            return Outcome::Rejected("max sequence exceeds port count");
        }

        let port = item.local.port();
        let session = self.sessions.get_or_create(id, new_session_id);
        session.record(knock.sequence(), knock.max_sequence(), port);
        let session_id = session.id();
        let complete = session.is_complete();
        debug!(
            client = %id,
            peer = %item.peer,
            port,
            sequence = knock.sequence(),
            max_sequence = knock.max_sequence(),
            "knock recorded"
        );

        if self.settings.send_acks {
            if let Some(reply) = &item.reply {
                if let Err(e) = send_ack(reply, item.peer, session_id, knock.sequence()).await {
                    warn!(client = %id, peer = %item.peer, "ack failed, abandoning session: {}", e);
                    self.sessions.remove(&id);
                    return Outcome::Abandoned;
                }
            }
        }

        if !complete {
            return Outcome::Recorded;
        }

        let received = self
            .sessions
            .remove(&id)
            .map(|s| s.knock_sequence())
            .unwrap_or_default();
        let minute = clock::unix_minute((self.clock)());
        let expected = match ports::derive_ports_at(
            &self.settings.port_secret,
            self.settings.port_count,
            minute,
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!("derive ports: {}", e);
                return Outcome::Incorrect;
            }
        };

        if received == expected {
            info!(
                client = %id,
                peer = %item.peer,
                decision = "allow",
                reason = "valid",
                opens_for_secs = self.settings.open_secs,
                "correct knock sequence"
            );
            self.gate.extend(self.settings.open_secs);
            Outcome::Correct
        } else {
            info!(
                client = %id,
                peer = %item.peer,
                decision = "drop",
                reason = "wrong sequence",
                "incorrect knock sequence"
            );
            debug!(?received, "received sequence");
            Outcome::Incorrect
        }
    }
}

fn new_session_id() -> SessionId {
    let mut id = [0u8; 16];
    if let Err(e) = getrandom::getrandom(&mut id) {
        warn!("session id entropy: {}", e);
    }
    SessionId(id)
}

async fn send_ack(
    socket: &UdpSocket,
    peer: SocketAddr,
    session: SessionId,
    sequence: u8,
) -> std::io::Result<()> {
    let ack = Packet::Ack(Ack {
        session,
        sequence: u16::from(sequence),
    });
    socket.send_to(&ack.encode(), peer).await.map(|_| ())
}
