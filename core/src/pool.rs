//! Connection pool
//!
//! Maps each `ConnectionKey` to exactly one live connection task. The pool
//! exclusively owns every connection; callers only ever hold
//! `ConnectionHandle`s, so eviction and reconnection are invisible to them.

use crate::config::{IrcConfig, PoolConfig};
use crate::connection::{self, ConnectionHandle, ConnectionState};
use crate::target::ConnectionKey;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct PoolEntry {
    handle: ConnectionHandle,
    task: JoinHandle<()>,
    last_activity: Instant,
    /// Distinguishes this connection from its successors under the same key
    generation: u64,
}

/// Reconnect backoff bookkeeping for one key
#[derive(Debug, Clone, Copy)]
struct BackoffState {
    consecutive_failures: u32,
    retry_after: Instant,
}

/// Pool of shared per-server IRC connections
pub struct ConnectionPool {
    entries: Arc<RwLock<HashMap<ConnectionKey, PoolEntry>>>,
    backoff: Arc<RwLock<HashMap<ConnectionKey, BackoffState>>>,
    irc_config: IrcConfig,
    pool_config: PoolConfig,
    generation: AtomicU64,
}

impl ConnectionPool {
    /// Create a new pool
    pub fn new(irc_config: IrcConfig, pool_config: PoolConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            backoff: Arc::new(RwLock::new(HashMap::new())),
            irc_config,
            pool_config,
            generation: AtomicU64::new(0),
        }
    }

    /// Return the connection for `key`, creating it if absent. The handle is
    /// usable immediately; deliveries queue inside the connection task until
    /// registration completes. While a reconnect backoff window is open the
    /// key is not retried and `ConnectFailed` is returned instead.
    ///
    /// Creation is coalesced: the entry is registered before any I/O starts,
    /// so concurrent first access to one key never opens duplicate sockets.
    pub async fn acquire(
        &self,
        key: &ConnectionKey,
        nick_hint: Option<&str>,
    ) -> Result<ConnectionHandle> {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(key) {
            if !entry.handle.state().is_terminal() {
                entry.last_activity = Instant::now();
                return Ok(entry.handle.clone());
            }
        }
        // Absent, or terminal and due for replacement
        if let Some(stale) = entries.remove(key) {
            debug!("Evicting terminal connection for {}", key);
            stale.task.abort();
        }

        if let Some(backoff) = self.backoff.read().await.get(key) {
            let now = Instant::now();
            if now < backoff.retry_after {
                return Err(Error::ConnectFailed {
                    key: key.to_string(),
                    reason: format!(
                        "Reconnect backoff active for another {:.1}s ({} consecutive failures)",
                        (backoff.retry_after - now).as_secs_f64(),
                        backoff.consecutive_failures
                    ),
                });
            }
        }

        let nick = nick_hint.unwrap_or(&self.irc_config.nick).to_string();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (handle, task) = connection::spawn(key.clone(), self.irc_config.clone(), nick);
        self.watch_connection(key.clone(), generation, handle.state_watch());
        entries.insert(
            key.clone(),
            PoolEntry {
                handle: handle.clone(),
                task,
                last_activity: Instant::now(),
                generation,
            },
        );
        info!("Pool created connection for {}", key);
        Ok(handle)
    }

    /// Remove and tear down the connection for `key`, if present
    pub async fn evict(&self, key: &ConnectionKey) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.remove(key) {
            debug!("Evicting connection for {}", key);
            entry.handle.quit();
        }
    }

    /// Number of pooled connections
    pub async fn connection_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Follow a connection's state transitions: reset backoff when it
    /// registers, record a failure and evict when it dies. Backoff counts
    /// failed connection attempts only; a registered connection that drops
    /// mid-session is evicted without opening a backoff window, so the next
    /// notification reconnects immediately.
    fn watch_connection(
        &self,
        key: ConnectionKey,
        generation: u64,
        mut state_rx: tokio::sync::watch::Receiver<ConnectionState>,
    ) {
        let entries = self.entries.clone();
        let backoff = self.backoff.clone();
        let base = self.pool_config.backoff_base_secs;
        let max = self.pool_config.backoff_max_secs;

        tokio::spawn(async move {
            let mut reached_ready = false;
            let final_state = loop {
                let state = *state_rx.borrow();
                if state == ConnectionState::Ready {
                    reached_ready = true;
                    backoff.write().await.remove(&key);
                }
                if state.is_terminal() {
                    break state;
                }
                if state_rx.changed().await.is_err() {
                    break ConnectionState::Failed;
                }
            };

            if final_state == ConnectionState::Failed && !reached_ready {
                let mut backoff = backoff.write().await;
                let entry = backoff.entry(key.clone()).or_insert(BackoffState {
                    consecutive_failures: 0,
                    retry_after: Instant::now(),
                });
                entry.consecutive_failures += 1;
                // base * 2^(n-1), capped
                let delay = base
                    .saturating_mul(2u64.saturating_pow(entry.consecutive_failures.min(16) - 1))
                    .min(max);
                entry.retry_after = Instant::now() + Duration::from_secs(delay);
                warn!(
                    "Connection {} failed ({} consecutive); next attempt in {}s",
                    key, entry.consecutive_failures, delay
                );
            } else if final_state == ConnectionState::Failed {
                warn!("Connection {} dropped after registering; reconnect on next use", key);
            }

            let mut entries = entries.write().await;
            if entries.get(&key).map(|e| e.generation) == Some(generation) {
                entries.remove(&key);
            }
        });
    }

    /// Evict terminal connections and connections idle past the configured
    /// timeout with no joined channels.
    pub async fn sweep(&self) {
        let idle_timeout = Duration::from_secs(self.pool_config.idle_timeout_secs);
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|key, entry| {
            if entry.handle.state().is_terminal() {
                debug!("Sweeping terminal connection for {}", key);
                return false;
            }
            if entry.handle.joined_channels() == 0
                && now.duration_since(entry.last_activity) >= idle_timeout
            {
                info!("Evicting idle connection for {}", key);
                entry.handle.quit();
                return false;
            }
            true
        });
    }

    /// Spawn the periodic idle sweep
    pub fn start_sweep_task(self: &Arc<Self>) {
        let pool = self.clone();
        let period = Duration::from_secs(self.pool_config.idle_timeout_secs.clamp(1, 60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                pool.sweep().await;
            }
        });
    }

    /// Graceful shutdown: ask every connection to QUIT, then wait up to
    /// `grace` for the tasks to flush and exit.
    pub async fn shutdown(&self, grace: Duration) {
        let mut entries = self.entries.write().await;
        let drained: Vec<(ConnectionKey, PoolEntry)> = entries.drain().collect();
        drop(entries);

        for (key, entry) in &drained {
            debug!("Shutting down connection for {}", key);
            entry.handle.quit();
        }
        for (_, entry) in drained {
            if tokio::time::timeout(grace, entry.task).await.is_err() {
                warn!("Connection task did not exit within the grace period");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Accept any number of connections, register each, and count accepts
    async fn spawn_counting_server() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = tokio::io::split(stream);
                    let mut lines = BufReader::new(read_half).lines();
                    let mut nick = String::new();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let words: Vec<&str> = line.split_whitespace().collect();
                        match words.first().copied() {
                            Some("NICK") => nick = words[1].to_string(),
                            Some("USER") => {
                                let reply = format!(":mock 001 {} :Welcome\r\n", nick);
                                let _ = write_half.write_all(reply.as_bytes()).await;
                            }
                            Some("QUIT") => break,
                            _ => {}
                        }
                    }
                });
            }
        });

        (addr, accepts)
    }

    /// Register each connection, echo JOINs, and close the socket as soon
    /// as a PRIVMSG arrives
    async fn spawn_dropping_server() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = tokio::io::split(stream);
                    let mut lines = BufReader::new(read_half).lines();
                    let mut nick = String::new();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let words: Vec<&str> = line.split_whitespace().collect();
                        match words.first().copied() {
                            Some("NICK") => nick = words[1].to_string(),
                            Some("USER") => {
                                let reply = format!(":mock 001 {} :Welcome\r\n", nick);
                                let _ = write_half.write_all(reply.as_bytes()).await;
                            }
                            Some("JOIN") => {
                                let reply = format!(":{}!u@h JOIN :{}\r\n", nick, words[1]);
                                let _ = write_half.write_all(reply.as_bytes()).await;
                            }
                            Some("PRIVMSG") | Some("QUIT") => break,
                            _ => {}
                        }
                    }
                });
            }
        });

        (addr, accepts)
    }

    fn test_pool() -> ConnectionPool {
        let config = Config::default();
        ConnectionPool::new(config.irc, config.pool)
    }

    fn key_for(addr: SocketAddr) -> ConnectionKey {
        ConnectionKey {
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: false,
        }
    }

    #[tokio::test]
    async fn test_concurrent_acquire_creates_one_connection() {
        let (addr, accepts) = spawn_counting_server().await;
        let pool = Arc::new(test_pool());
        let key = key_for(addr);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { pool.acquire(&key, None).await }));
        }
        for task in handles {
            assert!(task.await.unwrap().is_ok());
        }

        // Let the single connection finish registering
        let handle = pool.acquire(&key, None).await.unwrap();
        let mut state_rx = handle.state_watch();
        timeout(Duration::from_secs(5), async {
            while *state_rx.borrow() != ConnectionState::Ready {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_connection_triggers_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = test_pool();
        let key = key_for(addr);

        let handle = pool.acquire(&key, None).await.unwrap();
        let mut state_rx = handle.state_watch();
        timeout(Duration::from_secs(10), async {
            while !state_rx.borrow().is_terminal() {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        // Give the watcher a moment to record the failure and evict
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.connection_count().await, 0);

        match pool.acquire(&key, None).await {
            Err(Error::ConnectFailed { .. }) => {}
            other => panic!("Expected ConnectFailed during backoff, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_idle_sweep_evicts_unused_connection() {
        let (addr, _accepts) = spawn_counting_server().await;
        let config = Config::default();
        let mut pool_config = config.pool;
        pool_config.idle_timeout_secs = 0;
        let pool = ConnectionPool::new(config.irc, pool_config);
        let key = key_for(addr);

        pool.acquire(&key, None).await.unwrap();
        assert_eq!(pool.connection_count().await, 1);

        pool.sweep().await;
        assert_eq!(pool.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_midsession_drop_reconnects_without_backoff() {
        let (addr, accepts) = spawn_dropping_server().await;
        let pool = test_pool();
        let key = key_for(addr);

        let handle = pool.acquire(&key, None).await.unwrap();
        let mut state_rx = handle.state_watch();
        timeout(Duration::from_secs(5), async {
            while *state_rx.borrow() != ConnectionState::Ready {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        // The server hangs up on this delivery
        handle
            .deliver(crate::connection::Delivery {
                channel: "#c".to_string(),
                is_channel: true,
                channel_password: None,
                text: "bye".to_string(),
            })
            .unwrap();
        timeout(Duration::from_secs(5), async {
            while !state_rx.borrow().is_terminal() {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        // Let the watcher evict the dead entry
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A connection that had registered gets no backoff window: the very
        // next acquire opens a fresh connection
        let handle = pool.acquire(&key, None).await.unwrap();
        let mut state_rx = handle.state_watch();
        timeout(Duration::from_secs(5), async {
            while *state_rx.borrow() != ConnectionState::Ready {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_connection() {
        let (addr, accepts) = spawn_counting_server().await;
        let pool = test_pool();
        let key = key_for(addr);

        let first = pool.acquire(&key, None).await.unwrap();
        let mut state_rx = first.state_watch();
        timeout(Duration::from_secs(5), async {
            while *state_rx.borrow() != ConnectionState::Ready {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let _second = pool.acquire(&key, None).await.unwrap();
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }
}
