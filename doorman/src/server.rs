use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use seqknock_proto::{Registry, Verifier};

use crate::config::Config;
use crate::consumer::{Consumer, ConsumerSettings};
use crate::gate::{self, Gate, GateHandle};
use crate::listener::PortListener;
use crate::shutdown::{self, ShutdownTrigger};
use crate::store::{ClientStore, StoreWriter};

/// A running doorman: gate task, consumer task and one listener per port.
pub struct ServerHandle {
    trigger: ShutdownTrigger,
    gate: GateHandle,
    gate_task: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

pub struct Server;

impl Server {
    /// Initializes the gate, then spawns every task. Must run inside a tokio
    /// runtime. A gate that fails to initialize is fatal.
    pub fn start(
        cfg: &Config,
        registry: Arc<Registry>,
        store: Option<ClientStore>,
        mut gate: Box<dyn Gate>,
    ) -> Result<ServerHandle> {
        cfg.validate()?;
        gate.initialize()
            .with_context(|| format!("initialize {} gate", gate.name()))?;
        let (gate_handle, gate_task) = gate::spawn(gate);

        let (trigger, shutdown) = shutdown::channel();
        let (tx, rx) = mpsc::channel(cfg.queue_capacity);
        let mut workers = Vec::with_capacity(cfg.port_count + 2);

        // ends once the consumer drops its writer
        let writer = store.map(|store| {
            let (writer, task) = StoreWriter::spawn(store, registry.clone());
            workers.push(task);
            writer
        });

        let consumer = Consumer::new(
            ConsumerSettings {
                port_secret: cfg.port_secret.clone(),
                port_count: cfg.port_count,
                open_secs: cfg.open_secs,
                send_acks: cfg.send_acks,
            },
            registry.clone(),
            writer,
            gate_handle.clone(),
        );
        workers.push(tokio::spawn(consumer.run(rx, shutdown.clone())));

        let verifier = Arc::new(Verifier::new(registry.clone(), cfg.max_skew_secs));
        for offset in 0..cfg.port_count {
            let listener = PortListener::new(
                offset,
                cfg.bind_address,
                cfg.port_secret.clone(),
                cfg.port_count,
                verifier.clone(),
                tx.clone(),
                cfg.rate_pps,
                cfg.rate_burst,
            );
            workers.push(tokio::spawn(listener.run(shutdown.clone())));
        }

        info!(
            bind = %cfg.bind_address,
            ports = cfg.port_count,
            clients = registry.len(),
            auth = ?cfg.auth,
            "doorman started"
        );
        Ok(ServerHandle {
            trigger,
            gate: gate_handle,
            gate_task,
            workers,
        })
    }
}

impl ServerHandle {
    pub fn gate(&self) -> &GateHandle {
        &self.gate
    }

    /// Stops listeners and the consumer, then closes and shuts down the gate.
    pub async fn shutdown(self) {
        self.trigger.trigger();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("worker task: {}", e);
            }
        }
        self.gate.shutdown();
        if let Err(e) = self.gate_task.await {
            warn!("gate task: {}", e);
        }
        info!("doorman stopped");
    }
}
