use anyhow::{anyhow, Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Gate;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};

/// Accepts TCP on `listen` only while open and splices each connection to
/// `upstream`. Closing stops accepting; relays already running carry on until
/// either side hangs up or the gate shuts down.
#[derive(Debug)]
pub struct TcpProxyGate {
    listen: SocketAddr,
    upstream: String,
    accept: Option<JoinHandle<()>>,
    stop_relays: ShutdownTrigger,
    relays: Shutdown,
}

impl TcpProxyGate {
    pub fn new(listen: SocketAddr, upstream: String) -> Self {
        let (stop_relays, relays) = shutdown::channel();
        Self {
            listen,
            upstream,
            accept: None,
            stop_relays,
            relays,
        }
    }
}

impl Gate for TcpProxyGate {
    fn name(&self) -> &'static str {
        "tcp_proxy"
    }

    fn initialize(&mut self) -> Result<()> {
        self.upstream
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", self.upstream))?
            .next()
            .ok_or_else(|| anyhow!("resolve {}", self.upstream))?;
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        if self.accept.is_some() {
            return Ok(());
        }
        let std_listener = std::net::TcpListener::bind(self.listen)
            .with_context(|| format!("bind {}", self.listen))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        self.accept = Some(tokio::spawn(accept_loop(
            listener,
            self.upstream.clone(),
            self.relays.clone(),
        )));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(task) = self.accept.take() {
            task.abort();
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.close()?;
        self.stop_relays.trigger();
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, upstream: String, relays: Shutdown) {
    loop {
        match listener.accept().await {
            Ok((inbound, peer)) => {
                tokio::spawn(relay(inbound, peer, upstream.clone(), relays.clone()));
            }
            Err(e) => warn!("accept: {}", e),
        }
    }
}

async fn relay(inbound: TcpStream, peer: SocketAddr, upstream: String, mut stop: Shutdown) {
    tokio::select! {
        _ = stop.wait() => debug!(%peer, "relay stopped"),
        _ = splice(inbound, peer, &upstream) => {}
    }
}

async fn splice(mut inbound: TcpStream, peer: SocketAddr, upstream: &str) {
    let mut outbound = match TcpStream::connect(upstream).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, "connect {}: {}", upstream, e);
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((up, down)) => debug!(%peer, up, down, "relay finished"),
        Err(e) => debug!(%peer, "relay: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = s.read(&mut buf).await {
                        if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn free_port() -> SocketAddr {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    }

    async fn echoes(client: &mut TcpStream, msg: &[u8]) {
        client.write_all(msg).await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, msg);
    }

    #[tokio::test]
    async fn forwards_only_while_open() {
        let upstream = echo_server().await;
        let listen = free_port();
        let mut gate = TcpProxyGate::new(listen, upstream.to_string());
        gate.initialize().unwrap();

        assert!(TcpStream::connect(listen).await.is_err());

        gate.open().unwrap();
        let mut client = TcpStream::connect(listen).await.unwrap();
        echoes(&mut client, b"knock knock").await;

        gate.close().unwrap();
        // the aborted accept loop releases the port shortly after
        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(listen).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused);
        // closing only stops new connections
        echoes(&mut client, b"still here").await;

        gate.shutdown().unwrap();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[test]
    fn initialize_resolves_upstream() {
        let mut gate = TcpProxyGate::new(free_port(), "not an address".to_string());
        assert!(gate.initialize().is_err());
    }
}
