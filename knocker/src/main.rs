#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use seqknock_proto::packet::Packet;
use seqknock_proto::{clock, ports, ClientId, Knock, Sealer, SessionId, SigningKey};

const PROBE_ATTEMPTS: u32 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AuthMode {
    #[default]
    Hmac,
    Signature,
}

#[derive(Debug, Deserialize)]
struct Config {
    server_host: String,
    port_secret: String,
    port_count: usize,
    client_id: ClientId,
    #[serde(default)]
    auth: AuthMode,
    /// Shared key, base64 (hmac)
    #[serde(default)]
    key_b64: Option<String>,
    /// Raw ML-DSA-65 secret key file (signature)
    #[serde(default)]
    signing_key: Option<PathBuf>,
    /// Last nonce used; the next knock uses a larger one
    #[serde(default)]
    nonce: u32,
    #[serde(default)]
    wait_acks: bool,
    #[serde(default = "default_ack_timeout_ms")]
    ack_timeout_ms: u64,
    #[serde(default = "default_retries")]
    retries: u32,
    /// TCP port to probe once the sequence is sent
    #[serde(default)]
    service_port: Option<u16>,
}

fn default_ack_timeout_ms() -> u64 {
    500
}

fn default_retries() -> u32 {
    3
}

#[derive(Parser, Debug)]
#[command(name = "seqknock-knocker", version)]
struct Cli {
    /// Path to client config JSON
    #[arg(long)]
    config: Option<PathBuf>,
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only print warnings and errors
    #[arg(short, long, default_value_t = false)]
    quiet: bool,
}

fn default_config_path() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        if let Ok(app) = std::env::var("APPDATA") {
            let p = PathBuf::from(app).join("seqknock").join("knocker.json");
            if p.exists() { return Some(p); }
        }
    }
    #[cfg(unix)]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            let p = PathBuf::from(xdg).join("seqknock").join("knocker.json");
            if p.exists() { return Some(p); }
        }
        if let Ok(home) = std::env::var("HOME") {
            let p = PathBuf::from(home).join(".config").join("seqknock").join("knocker.json");
            if p.exists() { return Some(p); }
        }
    }
    let local = PathBuf::from("knocker.json");
    if local.exists() { Some(local) } else { None }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn signing_key(cfg: &Config) -> Result<SigningKey> {
    match cfg.auth {
        AuthMode::Hmac => {
            let b64 = cfg
                .key_b64
                .as_deref()
                .ok_or_else(|| anyhow!("hmac auth needs key_b64"))?;
            let key = STANDARD.decode(b64.trim()).context("key_b64")?;
            if key.is_empty() {
                bail!("key_b64 is empty");
            }
            Ok(SigningKey::Shared(key))
        }
        AuthMode::Signature => {
            let path = cfg
                .signing_key
                .as_ref()
                .ok_or_else(|| anyhow!("signature auth needs signing_key"))?;
            let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
            SigningKey::secret_from_bytes(&bytes).map_err(|e| anyhow!("{}: {}", path.display(), e))
        }
    }
}

fn resolve(host: &str) -> Result<IpAddr> {
    (host, 0)
        .to_socket_addrs()
        .with_context(|| format!("resolve {}", host))?
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| anyhow!("resolve {}", host))
}

/// Sends one full knock sequence and hands out nonces from `nonce`.
struct Knocker<'a> {
    cfg: &'a Config,
    sealer: Sealer,
    sock: UdpSocket,
    server: IpAddr,
    nonce: u32,
}

impl Knocker<'_> {
    fn next_nonce(&mut self) -> Result<u32> {
        self.nonce = self
            .nonce
            .checked_add(1)
            .ok_or_else(|| anyhow!("nonce space exhausted; rotate this client's id"))?;
        Ok(self.nonce)
    }

    fn knock_sequence(&mut self) -> Result<()> {
        let ports = ports::derive_ports(&self.cfg.port_secret, self.cfg.port_count)?;
        let max_sequence = u8::try_from(ports.len() - 1)
            .map_err(|_| anyhow!("port count {} too large", ports.len()))?;
        let left = clock::until_next_rotation();
        if left < Duration::from_secs(2) {
            // the last knocks would land after the server rotated
            debug!("waiting {:?} for the next rotation", left);
            thread::sleep(left + Duration::from_millis(100));
            return self.knock_sequence();
        }

        let mut session: Option<SessionId> = None;
        for (i, &port) in ports.iter().enumerate() {
            let sequence = i as u8;
            let dst = SocketAddr::new(self.server, port);
            let nonce = self.next_nonce()?;
            let mut knock = Knock::new(
                self.cfg.client_id,
                nonce,
                clock::now_unix_u32(),
                sequence,
                max_sequence,
            )?;

            let mut attempt = 0;
            loop {
                let datagram = self.sealer.seal(&knock)?;
                self.sock
                    .send_to(&datagram, dst)
                    .with_context(|| format!("send to {}", dst))?;
                debug!(port, sequence, nonce = knock.nonce(), "knock sent");

                if !self.cfg.wait_acks || self.await_ack(sequence, &mut session)? {
                    break;
                }
                attempt += 1;
                if attempt > self.cfg.retries {
                    bail!("no ack for knock {} after {} retries", sequence, self.cfg.retries);
                }
                let nonce = self.next_nonce()?;
                knock.restamp(nonce, clock::now_unix_u32());
            }
        }
        Ok(())
    }

    fn await_ack(&self, sequence: u8, session: &mut Option<SessionId>) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.ack_timeout_ms);
        let mut buf = [0u8; 64];
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(false);
            }
            self.sock.set_read_timeout(Some(left))?;
            let (n, from) = match self.sock.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(false)
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };
            if from.ip() != self.server {
                continue;
            }
            let ack = match Packet::decode(&buf[..n]) {
                Ok(Packet::Ack(ack)) => ack,
                _ => continue,
            };
            if ack.sequence != u16::from(sequence) {
                debug!(expected = sequence, got = ack.sequence, "stale ack");
                continue;
            }
            match session {
                Some(id) if *id != ack.session => {
                    warn!(session = %ack.session, "ack from a different session");
                    continue;
                }
                Some(_) => {}
                None => *session = Some(ack.session),
            }
            debug!(sequence, session = %ack.session, "ack received");
            return Ok(true);
        }
    }
}

fn probe(server: IpAddr, port: u16) -> bool {
    TcpStream::connect_timeout(&SocketAddr::new(server, port), PROBE_TIMEOUT).is_ok()
}

/// Rewrites only the `nonce` field so the rest of the file stays as written.
fn persist_nonce(path: &Path, nonce: u32) -> Result<()> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut doc: serde_json::Value = serde_json::from_str(&data)?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| anyhow!("{} is not a JSON object", path.display()))?;
    obj.insert("nonce".to_string(), nonce.into());
    let out = serde_json::to_string_pretty(&doc)?;
    fs::write(path, out + "\n").with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let cfg_path = cli.config.or_else(default_config_path)
        .ok_or_else(|| anyhow!("config not found; pass --config"))?;
    let cfg_data = fs::read_to_string(&cfg_path)
        .with_context(|| format!("read {}", cfg_path.display()))?;
    let cfg: Config = serde_json::from_str(&cfg_data)
        .with_context(|| format!("parse {}", cfg_path.display()))?;
    if cfg.port_count == 0 || cfg.port_count > u8::MAX as usize {
        bail!("port_count {} out of range 1..=255", cfg.port_count);
    }

    let server = resolve(&cfg.server_host)?;
    let bind: SocketAddr = match server {
        IpAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let mut knocker = Knocker {
        cfg: &cfg,
        sealer: Sealer::new(signing_key(&cfg)?),
        sock: UdpSocket::bind(bind)?,
        server,
        nonce: cfg.nonce,
    };

    let attempts = if cfg.service_port.is_some() { PROBE_ATTEMPTS } else { 1 };
    let mut outcome = Err(anyhow!("no knock attempted"));
    for attempt in 1..=attempts {
        outcome = knocker.knock_sequence();
        if let Err(e) = &outcome {
            warn!(attempt, "knock failed: {:#}", e);
            continue;
        }
        match cfg.service_port {
            Some(port) if probe(server, port) => {
                info!(%server, port, "service reachable");
                break;
            }
            Some(port) => {
                warn!(attempt, %server, port, "service not reachable yet");
                outcome = Err(anyhow!("{}:{} unreachable after knocking", server, port));
            }
            None => {
                info!(%server, ports = cfg.port_count, "knock sequence sent");
                break;
            }
        }
    }

    // the server may have accepted some of them even on failure
    if knocker.nonce != cfg.nonce {
        persist_nonce(&cfg_path, knocker.nonce)?;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"server_host":"127.0.0.1","port_secret":"s3cr3t","port_count":3,
                "client_id":"com1","key_b64":"a2V5"}"#,
        )
        .unwrap();
        assert_eq!(cfg.auth, AuthMode::Hmac);
        assert_eq!(cfg.nonce, 0);
        assert_eq!(cfg.retries, 3);
        assert_eq!(cfg.ack_timeout_ms, 500);
        assert!(!cfg.wait_acks);
        assert!(matches!(signing_key(&cfg).unwrap(), SigningKey::Shared(k) if k == b"key"));
    }

    #[test]
    fn signature_mode_needs_a_key_file() {
        let cfg: Config = serde_json::from_str(
            r#"{"server_host":"h","port_secret":"s","port_count":1,"client_id":"com1",
                "auth":"signature"}"#,
        )
        .unwrap();
        assert!(signing_key(&cfg).is_err());
    }

    #[test]
    fn persist_nonce_keeps_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knocker.json");
        fs::write(&path, r#"{"server_host":"h","nonce":4,"extra":true}"#).unwrap();
        persist_nonce(&path, 9).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["nonce"], 9);
        assert_eq!(doc["extra"], true);
        assert_eq!(doc["server_host"], "h");
    }
}
