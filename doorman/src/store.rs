//! Durable trusted-client records.
//!
//! The file is a JSON array of `{ "id", "key_b64", "largest_nonce" }`. It is
//! read once at startup and rewritten whole whenever a watermark advances.
//! The rewrite happens on a [`StoreWriter`] task so the consumer never waits
//! on the disk.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use seqknock_proto::{ClientId, KeyMaterial, Registry, TrustedClient};

use crate::config::AuthMode;
use crate::error::DoormanError;

#[derive(Debug, Serialize, Deserialize)]
struct ClientRecord {
    id: ClientId,
    key_b64: String,
    #[serde(default)]
    largest_nonce: u32,
}

#[derive(Debug, Clone)]
pub struct ClientStore {
    path: PathBuf,
}

impl ClientStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, mode: AuthMode) -> Result<Vec<TrustedClient>> {
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let records: Vec<ClientRecord> = serde_json::from_str(&data)
            .with_context(|| format!("parse {}", self.path.display()))?;
        if records.is_empty() {
            return Err(DoormanError::NoClients.into());
        }

        let mut clients = Vec::with_capacity(records.len());
        for rec in records {
            let key = decode_key(&rec, mode).map_err(|reason| DoormanError::ClientKey {
                id: rec.id.to_string(),
                reason,
            })?;
            clients.push(TrustedClient::new(rec.id, key, rec.largest_nonce));
        }
        Ok(clients)
    }

    pub fn save(&self, clients: &[TrustedClient]) -> Result<()> {
        let records: Vec<ClientRecord> = clients
            .iter()
            .map(|c| ClientRecord {
                id: c.id,
                key_b64: STANDARD.encode(c.key.to_bytes()),
                largest_nonce: c.largest_nonce,
            })
            .collect();
        let data = serde_json::to_vec_pretty(&records)?;

        // write beside the target, then rename over it
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut f =
                fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

/// Background saver. Marks coalesce: however many arrive while a write is in
/// flight, one more write follows it. Dropping the writer flushes the last
/// mark and ends the task.
#[derive(Debug)]
pub struct StoreWriter {
    dirty: watch::Sender<u64>,
}

impl StoreWriter {
    pub fn spawn(store: ClientStore, registry: Arc<Registry>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = watch::channel(0);
        let task = tokio::spawn(write_loop(store, registry, rx));
        (Self { dirty: tx }, task)
    }

    pub fn mark_dirty(&self) {
        self.dirty.send_modify(|gen| *gen = gen.wrapping_add(1));
    }
}

async fn write_loop(store: ClientStore, registry: Arc<Registry>, mut dirty: watch::Receiver<u64>) {
    // an unseen mark is still reported after the sender is gone
    while dirty.changed().await.is_ok() {
        let snapshot = registry.snapshot();
        let target = store.clone();
        match tokio::task::spawn_blocking(move || target.save(&snapshot)).await {
            Ok(Ok(())) => trace!(path = %store.path().display(), "watermarks saved"),
            Ok(Err(e)) => warn!(path = %store.path().display(), "persist watermarks: {:#}", e),
            Err(e) => warn!("persist task: {}", e),
        }
    }
}

fn decode_key(rec: &ClientRecord, mode: AuthMode) -> Result<KeyMaterial, String> {
    let bytes = STANDARD
        .decode(rec.key_b64.trim())
        .map_err(|e| format!("key_b64: {}", e))?;
    match mode {
        AuthMode::Hmac if bytes.is_empty() => Err("empty shared key".to_string()),
        AuthMode::Hmac => Ok(KeyMaterial::Shared(bytes)),
        AuthMode::Signature => {
            KeyMaterial::public_from_bytes(&bytes).map_err(|e| e.to_string())
        }
    }
}
