//! Inbound notification listener
//!
//! Binds UDP and TCP on the same port. A UDP datagram carries one or more
//! newline-delimited JSON messages; a TCP connection is read to EOF and
//! split on `\n`, so one connection may submit many notifications.
//! Malformed input is dropped and logged, never fatal.

use crate::config::ListenConfig;
use crate::notification::Notification;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Intake counters, shared with spawned per-stream tasks
#[derive(Debug, Default)]
struct ListenerStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
}

/// Inbound listener owning the UDP and TCP sockets
pub struct Listener {
    udp: UdpSocket,
    tcp: TcpListener,
    tx: mpsc::Sender<Notification>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind both sockets. A bind failure is the one fatal error class in
    /// the daemon and is propagated to terminate startup.
    pub async fn bind(config: &ListenConfig, tx: mpsc::Sender<Notification>) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let udp = UdpSocket::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("Cannot bind UDP {}: {}", addr, e)))?;
        // With port 0, TCP follows the port the kernel picked for UDP so
        // both protocols share one port as the wire contract requires
        let tcp_addr = format!("{}:{}", config.host, udp.local_addr()?.port());
        let tcp = TcpListener::bind(&tcp_addr)
            .await
            .map_err(|e| Error::Config(format!("Cannot bind TCP {}: {}", tcp_addr, e)))?;
        Ok(Self {
            udp,
            tcp,
            tx,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Address the TCP listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// Accept input until shutdown is signalled. Returning drops the
    /// notification sender, which lets the dispatcher drain and exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut datagram = vec![0u8; 65536];
        info!(
            "Listening for notifications on {}",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.udp.recv_from(&mut datagram) => match received {
                    Ok((len, peer)) => {
                        let payload = String::from_utf8_lossy(&datagram[..len]).into_owned();
                        debug!("UDP datagram ({} bytes) from {}", len, peer);
                        for line in payload.split('\n') {
                            ingest_line(line, &self.tx, &self.stats).await;
                        }
                    }
                    Err(e) => {
                        warn!("UDP receive error: {}", e);
                    }
                },
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("TCP submitter connected from {}", peer);
                        let tx = self.tx.clone();
                        let stats = self.stats.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(handle_stream(stream, tx, stats, shutdown));
                    }
                    Err(e) => {
                        warn!("TCP accept error: {}", e);
                    }
                },
            }
        }

        info!(
            "Listener stopping; accepted {} notification(s), dropped {}",
            self.stats.accepted.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed)
        );
    }
}

/// Read one submitter connection to EOF, one JSON message per line
async fn handle_stream(
    stream: TcpStream,
    tx: mpsc::Sender<Notification>,
    stats: Arc<ListenerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => ingest_line(&line, &tx, &stats).await,
                Ok(None) => break,
                Err(e) => {
                    debug!("Submitter stream error: {}", e);
                    break;
                }
            },
        }
    }
}

/// Decode and forward one line; malformed input is logged and dropped
async fn ingest_line(line: &str, tx: &mpsc::Sender<Notification>, stats: &ListenerStats) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match Notification::from_json_line(line) {
        Ok(notification) => {
            if tx.send(notification).await.is_err() {
                warn!("Dispatcher is gone; dropping notification");
                stats.dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.accepted.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(e) => {
            warn!("Rejected notification: {}", e);
            stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
