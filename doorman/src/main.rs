#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use pqcrypto_mldsa::mldsa65;
use pqcrypto_traits::sign::{PublicKey as PkTrait, SecretKey as SkTrait};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use doorman::store::ClientStore;
use doorman::{console, gate, logging, Config, Server};
use seqknock_proto::{clock, ports, Registry};

#[derive(Parser, Debug)]
#[command(name = "seqknock-doorman", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an ML-DSA-65 keypair for a signing client
    GenKeys {
        /// Private key output path (raw bytes), handed to the client
        #[arg(long)]
        priv_out: PathBuf,
        /// Public key output path (raw bytes)
        #[arg(long)]
        pub_out: PathBuf,
    },

    /// Print a random 32 byte shared key, base64
    GenSecret,

    /// Print the port sequence valid right now
    Ports {
        #[arg(long, default_value = "/etc/seqknock/doorman.json")]
        config: PathBuf,
    },

    /// Run the knock daemon
    Run {
        #[arg(long, default_value = "/etc/seqknock/doorman.json")]
        config: PathBuf,
        /// Optional log file path (JSONL)
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Increase verbosity (developer runs)
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
        /// Quiet mode (suppress info logs)
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },
}

fn write_file(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut f = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    f.write_all(data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

fn gen_keys(priv_out: &Path, pub_out: &Path) -> Result<()> {
    let (pk, sk) = mldsa65::keypair();
    write_file(priv_out, SkTrait::as_bytes(&sk), 0o600)?;
    write_file(pub_out, PkTrait::as_bytes(&pk), 0o644)?;
    eprintln!(
        "generated ML-DSA-65 keypair: priv={}, pub={}",
        priv_out.display(),
        pub_out.display()
    );
    // ready to paste into the clients file
    println!("{}", STANDARD.encode(PkTrait::as_bytes(&pk)));
    Ok(())
}

fn gen_secret() -> Result<()> {
    let mut key = [0u8; 32];
    getrandom::getrandom(&mut key).map_err(|e| anyhow!(e))?;
    println!("{}", STANDARD.encode(key));
    Ok(())
}

fn print_ports(config: &Path) -> Result<()> {
    let cfg = Config::load(config)?;
    let ports = ports::derive_ports(&cfg.port_secret, cfg.port_count)?;
    let list: Vec<String> = ports.iter().map(u16::to_string).collect();
    println!("{}", list.join(" "));
    eprintln!("rotates in {}s", clock::until_next_rotation().as_secs());
    Ok(())
}

async fn run_daemon(config: PathBuf) -> Result<()> {
    let cfg = Config::load(&config)?;
    let store = ClientStore::new(cfg.clients_file.clone());
    let registry = Arc::new(Registry::new(store.load(cfg.auth)?));
    let server = Server::start(&cfg, registry, Some(store), gate::from_config(&cfg.gate))?;

    tokio::select! {
        _ = console::wait_for_stop() => {}
        r = tokio::signal::ctrl_c() => {
            r.context("listen for ctrl-c")?;
            info!("interrupted");
        }
    }
    server.shutdown().await;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::GenKeys { priv_out, pub_out } => gen_keys(&priv_out, &pub_out),
        Command::GenSecret => gen_secret(),
        Command::Ports { config } => print_ports(&config),
        Command::Run {
            config,
            log_file,
            verbose,
            quiet,
        } => {
            logging::init(verbose, quiet, log_file.as_deref())?;
            let rt = tokio::runtime::Runtime::new().context("start runtime")?;
            let result = rt.block_on(run_daemon(config));
            // a pending stdin read cannot be cancelled; do not wait on it
            rt.shutdown_timeout(Duration::from_millis(200));
            result
        }
    }
}
