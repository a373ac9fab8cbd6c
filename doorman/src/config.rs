use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::error::DoormanError;

/// Daemon settings, read from a JSON document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind_address: IpAddr,
    pub port_secret: String,
    pub port_count: usize,
    /// Seconds each correct knock sequence adds to the gate.
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,
    #[serde(default)]
    pub auth: AuthMode,
    pub clients_file: PathBuf,
    #[serde(default = "default_max_skew")]
    pub max_skew_secs: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub send_acks: bool,
    /// Max knocks per second per source IP
    #[serde(default = "default_rate_pps")]
    pub rate_pps: u32,
    #[serde(default = "default_rate_burst")]
    pub rate_burst: u32,
    #[serde(default)]
    pub gate: GateConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Hmac,
    Signature,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateConfig {
    /// Only log transitions
    #[default]
    None,
    /// Run a program on open and on close, e.g. an nft rule change
    Command { open: Vec<String>, close: Vec<String> },
    /// Forward TCP from `listen` to `upstream` while open
    TcpProxy { listen: SocketAddr, upstream: String },
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_open_secs() -> u64 {
    45
}

fn default_max_skew() -> u32 {
    seqknock_proto::auth::DEFAULT_MAX_SKEW_SECS
}

fn default_queue_capacity() -> usize {
    100
}

fn default_rate_pps() -> u32 {
    10
}

fn default_rate_burst() -> u32 {
    20
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config =
            serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), DoormanError> {
        if self.port_secret.is_empty() {
            return Err(DoormanError::NoSecret);
        }
        if self.port_count == 0 || self.port_count > u8::MAX as usize {
            return Err(DoormanError::PortCount(self.port_count));
        }
        if self.queue_capacity == 0 {
            return Err(DoormanError::QueueCapacity);
        }
        if let GateConfig::Command { open, close } = &self.gate {
            if open.is_empty() || close.is_empty() {
                return Err(DoormanError::EmptyCommand);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let cfg = parse(r#"{"port_secret":"s3cr3t","port_count":3,"clients_file":"clients.json"}"#);
        assert_eq!(cfg.bind_address, default_bind());
        assert_eq!(cfg.open_secs, 45);
        assert_eq!(cfg.auth, AuthMode::Hmac);
        assert_eq!(cfg.max_skew_secs, 10);
        assert_eq!(cfg.queue_capacity, 100);
        assert!(!cfg.send_acks);
        assert!(matches!(cfg.gate, GateConfig::None));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn gate_variants() {
        let cfg = parse(
            r#"{"port_secret":"x","port_count":2,"clients_file":"c","auth":"signature",
                "gate":{"kind":"tcp_proxy","listen":"0.0.0.0:8080","upstream":"127.0.0.1:80"}}"#,
        );
        assert_eq!(cfg.auth, AuthMode::Signature);
        assert!(matches!(cfg.gate, GateConfig::TcpProxy { .. }));

        let cfg = parse(
            r#"{"port_secret":"x","port_count":2,"clients_file":"c",
                "gate":{"kind":"command","open":["true"],"close":[]}}"#,
        );
        assert!(matches!(cfg.validate(), Err(DoormanError::EmptyCommand)));
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = parse(r#"{"port_secret":"","port_count":3,"clients_file":"c"}"#);
        assert!(matches!(cfg.validate(), Err(DoormanError::NoSecret)));
        let cfg = parse(r#"{"port_secret":"x","port_count":0,"clients_file":"c"}"#);
        assert!(matches!(cfg.validate(), Err(DoormanError::PortCount(0))));
        let cfg = parse(r#"{"port_secret":"x","port_count":300,"clients_file":"c"}"#);
        assert!(matches!(cfg.validate(), Err(DoormanError::PortCount(300))));
    }
}
