//! IRC connection state machine
//!
//! One task per server connection. The task owns its socket, registration
//! state, joined-channel set, and pending queues; everything else talks to
//! it through a `ConnectionHandle` handed out by the pool, so reconnection
//! and eviction stay invisible to callers.

use crate::config::IrcConfig;
use crate::message::{privmsg_chunks, Command, Message};
use crate::target::ConnectionKey;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP (and TLS) connect in progress
    Connecting,
    /// Awaiting the server welcome (001)
    Registering,
    /// Registered; accepts JOINs and PRIVMSGs
    Ready,
    /// Graceful teardown after QUIT
    Closing,
    /// Unrecoverable; entry must be evicted
    Failed,
}

impl ConnectionState {
    /// Whether the task has stopped for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Failed)
    }
}

/// One message send bound for a single target on this connection
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel name (leading `#`/`&`) or nickname
    pub channel: String,
    /// Channels are joined before sending; nicknames are messaged directly
    pub is_channel: bool,
    /// Optional channel key for JOIN
    pub channel_password: Option<String>,
    /// Message body; split into multiple PRIVMSGs if it exceeds the line limit
    pub text: String,
}

/// Commands accepted by a connection task
#[derive(Debug)]
pub enum ConnCommand {
    Deliver(Delivery),
    Quit,
}

/// Pool-mediated front for a connection task
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<ConnCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    joined_count: Arc<AtomicUsize>,
}

impl ConnectionHandle {
    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Number of channels currently joined
    pub fn joined_channels(&self) -> usize {
        self.joined_count.load(Ordering::Relaxed)
    }

    /// Watch receiver for state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Enqueue a delivery. Never blocks: the queue is bounded and a full
    /// queue fails the delivery instead of stalling the dispatcher.
    pub fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.cmd_tx
            .try_send(ConnCommand::Deliver(delivery))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::Connection("Outbound queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Connection("Connection task has exited".to_string())
                }
            })
    }

    /// Request a graceful QUIT and teardown
    pub fn quit(&self) {
        let _ = self.cmd_tx.try_send(ConnCommand::Quit);
    }
}

/// Spawn a connection task for the given key. The returned handle is usable
/// immediately; deliveries queue inside the task until registration completes.
pub fn spawn(key: ConnectionKey, config: IrcConfig, nick: String) -> (ConnectionHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.outbound_queue_limit);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let joined_count = Arc::new(AtomicUsize::new(0));

    let handle = ConnectionHandle {
        cmd_tx,
        state_rx,
        joined_count: joined_count.clone(),
    };

    let conn = IrcConnection {
        key,
        config,
        nick,
        state: ConnectionState::Connecting,
        state_tx,
        cmd_rx,
        joined: HashSet::new(),
        joined_count,
        pending_ready: Vec::new(),
        pending_join: HashMap::new(),
        last_activity: Instant::now(),
        ping_outstanding: false,
    };

    let task = tokio::spawn(conn.run());
    (handle, task)
}

struct IrcConnection {
    key: ConnectionKey,
    config: IrcConfig,
    nick: String,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    cmd_rx: mpsc::Receiver<ConnCommand>,
    joined: HashSet<String>,
    joined_count: Arc<AtomicUsize>,
    /// Deliveries queued until the connection reaches Ready
    pending_ready: Vec<Delivery>,
    /// Deliveries queued per channel until the server confirms the JOIN
    pending_join: HashMap<String, Vec<Delivery>>,
    last_activity: Instant,
    ping_outstanding: bool,
}

impl IrcConnection {
    async fn run(mut self) {
        info!("Connecting to {}", self.key);

        let tcp = match TcpStream::connect((self.key.host.as_str(), self.key.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connect to {} failed: {}", self.key, e);
                self.set_state(ConnectionState::Failed);
                return;
            }
        };

        if self.key.tls {
            let stream = match Self::tls_handshake(&self.key, tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("TLS handshake with {} failed: {}", self.key, e);
                    self.set_state(ConnectionState::Failed);
                    return;
                }
            };
            self.run_session(stream).await;
        } else {
            self.run_session(tcp).await;
        }
    }

    async fn tls_handshake(
        key: &ConnectionKey,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let tls_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::ServerName::try_from(key.host.as_str())
            .map_err(|_| Error::Connection(format!("Invalid TLS server name: {}", key.host)))?;
        let stream = connector.connect(server_name, tcp).await?;
        Ok(stream)
    }

    async fn run_session<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut writer) = tokio::io::split(stream);

        // Reader runs in its own task; read_line is not cancellation-safe
        // inside select!, a channel of complete lines is.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        self.set_state(ConnectionState::Registering);
        self.last_activity = Instant::now();

        if self
            .send(&mut writer, Message::new(Command::Nick, vec![self.nick.clone()]))
            .await
            .is_err()
            || self
                .send(
                    &mut writer,
                    Message::new(
                        Command::User,
                        vec![
                            self.config.username.clone(),
                            "0".to_string(),
                            "*".to_string(),
                            self.config.realname.clone(),
                        ],
                    ),
                )
                .await
                .is_err()
        {
            self.set_state(ConnectionState::Failed);
            reader_task.abort();
            return;
        }

        loop {
            let keepalive = self.keepalive_deadline();
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => {
                        self.last_activity = Instant::now();
                        self.ping_outstanding = false;
                        match Message::parse(&line) {
                            Ok(message) => {
                                if let Err(e) = self.handle_server_message(message, &mut writer).await {
                                    warn!("Connection {} failed: {}", self.key, e);
                                    self.set_state(ConnectionState::Failed);
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("Unparseable line from {}: {}", self.key, e);
                            }
                        }
                        if self.state.is_terminal() {
                            break;
                        }
                    }
                    None => {
                        warn!("Connection {} closed by server", self.key);
                        self.set_state(ConnectionState::Failed);
                        break;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Deliver(delivery)) => {
                        if let Err(e) = self.handle_delivery(delivery, &mut writer).await {
                            warn!("Connection {} failed: {}", self.key, e);
                            self.set_state(ConnectionState::Failed);
                            break;
                        }
                    }
                    Some(ConnCommand::Quit) | None => {
                        let quit = Message::new(
                            Command::Quit,
                            vec![self.config.quit_message.clone()],
                        );
                        let _ = self.send(&mut writer, quit).await;
                        let _ = writer.shutdown().await;
                        self.set_state(ConnectionState::Closing);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(keepalive) => {
                    if self.ping_outstanding {
                        warn!("Connection {} timed out ({}s of silence)", self.key,
                            self.last_activity.elapsed().as_secs());
                        self.set_state(ConnectionState::Failed);
                        break;
                    }
                    let ping = Message::new(Command::Ping, vec![self.key.host.clone()]);
                    if self.send(&mut writer, ping).await.is_err() {
                        self.set_state(ConnectionState::Failed);
                        break;
                    }
                    self.ping_outstanding = true;
                }
            }
        }

        reader_task.abort();
        self.drop_queued_deliveries();
        if !self.state.is_terminal() {
            self.set_state(ConnectionState::Failed);
        }
    }

    /// Next moment the keepalive timer should fire: the ping threshold in
    /// normal operation, the dead threshold once a PING is outstanding.
    fn keepalive_deadline(&self) -> Instant {
        let interval = if self.ping_outstanding {
            Duration::from_secs(self.config.dead_interval_secs)
        } else {
            Duration::from_secs(self.config.ping_interval_secs)
        };
        self.last_activity + interval
    }

    async fn handle_server_message<W>(&mut self, message: Message, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match message.command {
            Command::Ping => {
                let token = message.param(0).unwrap_or(&self.key.host).to_string();
                self.send(writer, Message::new(Command::Pong, vec![token])).await?;
            }
            Command::Reply(1) => {
                if self.state == ConnectionState::Registering {
                    info!("Registered with {} as {}", self.key, self.nick);
                    self.set_state(ConnectionState::Ready);
                    let pending = std::mem::take(&mut self.pending_ready);
                    for delivery in pending {
                        self.handle_delivery(delivery, writer).await?;
                    }
                }
            }
            Command::Reply(433) => {
                if self.state == ConnectionState::Registering {
                    // Nickname in use: mutate and retry
                    self.nick.push('_');
                    debug!("Nick in use on {}, retrying as {}", self.key, self.nick);
                    self.send(writer, Message::new(Command::Nick, vec![self.nick.clone()]))
                        .await?;
                }
            }
            Command::Reply(n @ (431 | 432 | 436 | 464 | 465)) => {
                if self.state == ConnectionState::Registering {
                    return Err(Error::ConnectFailed {
                        key: self.key.to_string(),
                        reason: format!("Registration rejected with {:03}", n),
                    });
                }
            }
            Command::Reply(n @ (403 | 405 | 471 | 473 | 474 | 475)) => {
                // JOIN rejected: <nick> <channel> :<reason>
                if let Some(channel) = message.param(1) {
                    let channel = channel.to_string();
                    let reason = message.param(2).unwrap_or("join rejected").to_string();
                    if let Some(dropped) = self.pending_join.remove(&channel) {
                        let err = Error::JoinFailed {
                            key: self.key.to_string(),
                            channel,
                            reason: format!("{:03} {}", n, reason),
                        };
                        warn!("{}; dropping {} queued message(s)", err, dropped.len());
                    }
                }
            }
            Command::Join => {
                if message.prefix.as_ref().and_then(|p| p.nick()) == Some(self.nick.as_str()) {
                    if let Some(channel) = message.param(0) {
                        let channel = channel.to_string();
                        debug!("Joined {} on {}", channel, self.key);
                        self.joined.insert(channel.clone());
                        self.joined_count.store(self.joined.len(), Ordering::Relaxed);
                        if let Some(queued) = self.pending_join.remove(&channel) {
                            for delivery in queued {
                                self.send_privmsg(&delivery, writer).await?;
                            }
                        }
                    }
                }
            }
            Command::Part => {
                if message.prefix.as_ref().and_then(|p| p.nick()) == Some(self.nick.as_str()) {
                    if let Some(channel) = message.param(0) {
                        self.joined.remove(channel);
                        self.joined_count.store(self.joined.len(), Ordering::Relaxed);
                    }
                }
            }
            Command::Kick => {
                // <channel> <victim> :<reason>
                if let (Some(channel), Some(victim)) = (message.param(0), message.param(1)) {
                    if victim == self.nick {
                        debug!("Kicked from {} on {}", channel, self.key);
                        self.joined.remove(channel);
                        self.joined_count.store(self.joined.len(), Ordering::Relaxed);
                    }
                }
            }
            Command::Error => {
                return Err(Error::ProtocolViolation(format!(
                    "Server error: {}",
                    message.param(0).unwrap_or("unknown")
                )));
            }
            _ => {
                debug!("Ignoring {} from {}", message.command, self.key);
            }
        }
        Ok(())
    }

    async fn handle_delivery<W>(&mut self, delivery: Delivery, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.state != ConnectionState::Ready {
            if self.queued_deliveries() >= self.config.outbound_queue_limit {
                warn!(
                    "Dropping delivery to {} on {}: pending queue full",
                    delivery.channel, self.key
                );
                return Ok(());
            }
            self.pending_ready.push(delivery);
            return Ok(());
        }

        if !delivery.is_channel || self.joined.contains(&delivery.channel) {
            return self.send_privmsg(&delivery, writer).await;
        }

        if let Some(queued) = self.pending_join.get_mut(&delivery.channel) {
            // JOIN already in flight for this channel; no duplicate JOIN
            if queued.len() >= self.config.outbound_queue_limit {
                warn!(
                    "Dropping delivery to {} on {}: join queue full",
                    delivery.channel, self.key
                );
            } else {
                queued.push(delivery);
            }
            return Ok(());
        }

        let mut params = vec![delivery.channel.clone()];
        if let Some(ref password) = delivery.channel_password {
            params.push(password.clone());
        }
        self.send(writer, Message::new(Command::Join, params)).await?;
        self.pending_join.insert(delivery.channel.clone(), vec![delivery]);
        Ok(())
    }

    async fn send_privmsg<W>(&mut self, delivery: &Delivery, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        for chunk in privmsg_chunks(&delivery.channel, &delivery.text) {
            let message = Message::new(
                Command::PrivMsg,
                vec![delivery.channel.clone(), chunk],
            );
            self.send(writer, message).await?;
        }
        Ok(())
    }

    async fn send<W>(&mut self, writer: &mut W, message: Message) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let line = message.to_line();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    fn queued_deliveries(&self) -> usize {
        self.pending_ready.len() + self.pending_join.values().map(Vec::len).sum::<usize>()
    }

    fn drop_queued_deliveries(&mut self) {
        let queued = self.queued_deliveries();
        if queued > 0 {
            warn!("Connection {} dropped {} undelivered message(s)", self.key, queued);
        }
        self.pending_ready.clear();
        self.pending_join.clear();
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        let _ = self.state_tx.send(state);
    }
}
