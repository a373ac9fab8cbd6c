//! The protected resource and the timer that keeps it open.
//!
//! A [`Gate`] only knows how to open and close the resource. The gate task
//! owns both the gate and its deadline: each correct knock sequence pushes the
//! deadline out, and a one second tick closes the gate once it passes. Only
//! that task touches either, so an extend can never race a close. Hooks may
//! wait on child processes, so they run on the blocking pool.

mod command;
mod proxy;

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use command::CommandGate;
pub use proxy::TcpProxyGate;

use crate::config::GateConfig;

pub trait Gate: Send {
    fn name(&self) -> &'static str;
    fn initialize(&mut self) -> Result<()>;
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn shutdown(&mut self) -> Result<()>;
}

pub fn from_config(cfg: &GateConfig) -> Box<dyn Gate> {
    match cfg {
        GateConfig::None => Box::new(LogGate::new()),
        GateConfig::Command { open, close } => Box::new(CommandGate::new(open.clone(), close.clone())),
        GateConfig::TcpProxy { listen, upstream } => {
            Box::new(TcpProxyGate::new(*listen, upstream.clone()))
        }
    }
}

/// Open/closed plus, when open, the instant it closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct GateState {
    close_at: Option<Instant>,
}

impl GateState {
    pub fn is_open(&self) -> bool {
        self.close_at.is_some()
    }

    /// Adds `by` to the remaining budget. Returns true when this opened the gate.
    pub fn extend(&mut self, now: Instant, by: Duration) -> bool {
        match &mut self.close_at {
            Some(at) => {
                *at = (*at).max(now) + by;
                false
            }
            None => {
                self.close_at = Some(now + by);
                true
            }
        }
    }

    /// Returns true when the deadline has passed and the gate must close.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.close_at {
            Some(at) if now >= at => {
                self.close_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.close_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn reset(&mut self) {
        self.close_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStatus {
    pub open: bool,
    pub remaining: Duration,
}

enum GateCommand {
    Extend(Duration),
    Status(oneshot::Sender<GateStatus>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct GateHandle {
    tx: mpsc::UnboundedSender<GateCommand>,
}

impl GateHandle {
    pub fn extend(&self, secs: u64) {
        let _ = self.tx.send(GateCommand::Extend(Duration::from_secs(secs)));
    }

    pub async fn status(&self) -> Option<GateStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(GateCommand::Status(tx)).ok()?;
        rx.await.ok()
    }

    /// Closes the gate if open, then shuts the resource down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(GateCommand::Shutdown);
    }
}

/// Starts the gate task. The gate must already be initialized.
pub fn spawn(gate: Box<dyn Gate>) -> (GateHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(gate, rx));
    (GateHandle { tx }, task)
}

type Hook = fn(&mut dyn Gate) -> Result<()>;

/// Runs `hook` off the async workers and hands the gate back. `None` when the
/// hook panicked.
async fn invoke(gate: Box<dyn Gate>, hook: Hook) -> Option<(Box<dyn Gate>, Result<()>)> {
    let name = gate.name();
    let joined = tokio::task::spawn_blocking(move || {
        let mut gate = gate;
        let result = hook(gate.as_mut());
        (gate, result)
    })
    .await;
    match joined {
        Ok(done) => Some(done),
        Err(e) => {
            error!(gate = name, "gate hook: {}", e);
            None
        }
    }
}

async fn run(mut gate: Box<dyn Gate>, mut rx: mpsc::UnboundedReceiver<GateCommand>) {
    let mut state = GateState::default();
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(GateCommand::Extend(by)) => {
                    let now = Instant::now();
                    if state.extend(now, by) {
                        let Some((back, opened)) = invoke(gate, |g| g.open()).await else {
                            return;
                        };
                        gate = back;
                        match opened {
                            Ok(()) => info!(gate = gate.name(), secs = by.as_secs(), "gate opened"),
                            Err(e) => {
                                error!(gate = gate.name(), "open failed: {:#}", e);
                                state.reset();
                            }
                        }
                    } else {
                        debug!(remaining = state.remaining(now).as_secs(), "gate extended");
                    }
                }
                Some(GateCommand::Status(reply)) => {
                    let _ = reply.send(GateStatus {
                        open: state.is_open(),
                        remaining: state.remaining(Instant::now()),
                    });
                }
                Some(GateCommand::Shutdown) | None => break,
            },
            _ = tick.tick() => {
                if state.expire(Instant::now()) {
                    match close(gate).await {
                        Some(back) => gate = back,
                        None => return,
                    }
                }
            }
        }
    }

    if state.is_open() {
        state.reset();
        match close(gate).await {
            Some(back) => gate = back,
            None => return,
        }
    }
    if let Some((gate, result)) = invoke(gate, |g| g.shutdown()).await {
        match result {
            Ok(()) => info!(gate = gate.name(), "gate shut down"),
            Err(e) => warn!(gate = gate.name(), "shutdown failed: {:#}", e),
        }
    }
}

async fn close(gate: Box<dyn Gate>) -> Option<Box<dyn Gate>> {
    let (gate, result) = invoke(gate, |g| g.close()).await?;
    match result {
        Ok(()) => info!(gate = gate.name(), "gate closed"),
        Err(e) => error!(gate = gate.name(), "close failed: {:#}", e),
    }
    Some(gate)
}

/// Transition counters, shared with whoever built the gate.
#[derive(Debug, Default)]
pub struct GateStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl GateStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

/// Gate with no resource behind it: logs and counts transitions.
#[derive(Debug, Default)]
pub struct LogGate {
    stats: Arc<GateStats>,
}

impl LogGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<GateStats> {
        self.stats.clone()
    }
}

impl Gate for LogGate {
    fn name(&self) -> &'static str {
        "log"
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
