//! End-to-end scenario tests for the relay engine
//!
//! These wire the listener, dispatcher, rate limiter, and pool together
//! against scripted in-process IRC servers.

use crate::config::{Config, ListenConfig};
use crate::dispatcher::Dispatcher;
use crate::listener::Listener;
use crate::pool::ConnectionPool;
use crate::rate_limiter::RateLimiter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Scripted IRC server: registers clients, echoes JOINs, and closes the
/// active connection when a PRIVMSG body contains `drop_marker`. Every
/// received line is forwarded tagged with its connection index.
async fn spawn_mock_irc_server(
    drop_marker: &'static str,
) -> (SocketAddr, mpsc::UnboundedReceiver<(usize, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut conn_index = 0usize;
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tx = tx.clone();
            let index = conn_index;
            conn_index += 1;
            tokio::spawn(async move {
                let (read_half, mut write_half) = tokio::io::split(stream);
                let mut lines = BufReader::new(read_half).lines();
                let mut nick = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    let words: Vec<&str> = line.split_whitespace().collect();
                    let _ = tx.send((index, line.clone()));
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
                        Some("PRIVMSG") if line.contains(drop_marker) => break,
                        Some("QUIT") => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (addr, rx)
}

struct TestDaemon {
    listen_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

/// Wire listener → dispatcher → pool on an ephemeral port
async fn spawn_engine(mut config: Config) -> TestDaemon {
    config.listen = ListenConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
    };

    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let pool = Arc::new(ConnectionPool::new(config.irc.clone(), config.pool.clone()));
    let (tx, rx) = mpsc::channel(config.dispatch.max_in_flight);
    let listener = Listener::bind(&config.listen, tx).await.unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(listener.run(shutdown_rx));
    tokio::spawn(Dispatcher::new(pool, limiter, rx).run());

    TestDaemon {
        listen_addr,
        shutdown_tx,
    }
}

async fn submit(addr: SocketAddr, json: &str) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(json.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    stream.shutdown().await.unwrap();
}

async fn next_line(rx: &mut mpsc::UnboundedReceiver<(usize, String)>) -> (usize, String) {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for IRC line")
        .expect("mock server closed")
}

#[tokio::test]
async fn test_end_to_end_single_notification() {
    let (irc_addr, mut irc_rx) = spawn_mock_irc_server("\u{1}never\u{1}").await;
    let engine = spawn_engine(Config::default()).await;

    let json = format!(
        r#"{{"to": "irc://{}:{}/#test", "privmsg": "build ok"}}"#,
        irc_addr.ip(),
        irc_addr.port()
    );
    submit(engine.listen_addr, &json).await;

    assert_eq!(next_line(&mut irc_rx).await.1, "NICK ircnotify");
    assert!(next_line(&mut irc_rx).await.1.starts_with("USER ircnotify"));
    assert_eq!(next_line(&mut irc_rx).await.1, "JOIN #test");
    assert_eq!(next_line(&mut irc_rx).await.1, "PRIVMSG #test :build ok");

    let _ = engine.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_nick_override_applies_to_fresh_connection() {
    let (irc_addr, mut irc_rx) = spawn_mock_irc_server("\u{1}never\u{1}").await;
    let engine = spawn_engine(Config::default()).await;

    let json = format!(
        r#"{{"to": "irc://{}:{}/#ci", "privmsg": "deployed", "nick": "cibot"}}"#,
        irc_addr.ip(),
        irc_addr.port()
    );
    submit(engine.listen_addr, &json).await;

    assert_eq!(next_line(&mut irc_rx).await.1, "NICK cibot");

    let _ = engine.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_two_channels_share_one_connection() {
    let (irc_addr, mut irc_rx) = spawn_mock_irc_server("\u{1}never\u{1}").await;
    let engine = spawn_engine(Config::default()).await;

    let json = format!(
        r#"{{"to": ["irc://{ip}:{port}/#one", "irc://{ip}:{port}/#two"], "privmsg": "hello"}}"#,
        ip = irc_addr.ip(),
        port = irc_addr.port()
    );
    submit(engine.listen_addr, &json).await;

    let mut lines = Vec::new();
    for _ in 0..6 {
        lines.push(next_line(&mut irc_rx).await);
    }
    // Everything arrived on connection 0
    assert!(lines.iter().all(|(conn, _)| *conn == 0));
    let texts: Vec<&str> = lines.iter().map(|(_, l)| l.as_str()).collect();
    assert!(texts.contains(&"JOIN #one"));
    assert!(texts.contains(&"JOIN #two"));
    assert!(texts.contains(&"PRIVMSG #one :hello"));
    assert!(texts.contains(&"PRIVMSG #two :hello"));

    let _ = engine.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_dropped_connection_reconnects_and_rejoins_lazily() {
    let (irc_addr, mut irc_rx) = spawn_mock_irc_server("tear-it-down").await;
    let engine = spawn_engine(Config::default()).await;
    let (ip, port) = (irc_addr.ip(), irc_addr.port());

    // Join two channels on one connection
    let json = format!(
        r#"{{"to": ["irc://{ip}:{port}/#one", "irc://{ip}:{port}/#two"], "privmsg": "hello"}}"#
    );
    submit(engine.listen_addr, &json).await;
    loop {
        let (conn, line) = next_line(&mut irc_rx).await;
        assert_eq!(conn, 0);
        if line == "PRIVMSG #two :hello" {
            break;
        }
    }

    // The marker makes the mock close the connection
    let json = format!(r#"{{"to": "irc://{ip}:{port}/#one", "privmsg": "tear-it-down"}}"#);
    submit(engine.listen_addr, &json).await;
    loop {
        let (_, line) = next_line(&mut irc_rx).await;
        if line.contains("tear-it-down") {
            break;
        }
    }

    // Give the pool watcher a moment to evict the dead entry; a dropped
    // registered connection carries no backoff window, so the next
    // notification reconnects right away
    tokio::time::sleep(Duration::from_millis(100)).await;
    let json = format!(r#"{{"to": "irc://{ip}:{port}/#two", "privmsg": "after"}}"#);
    submit(engine.listen_addr, &json).await;

    let mut second_conn_lines = Vec::new();
    loop {
        let (conn, line) = next_line(&mut irc_rx).await;
        if conn == 1 {
            let done = line == "PRIVMSG #two :after";
            second_conn_lines.push(line);
            if done {
                break;
            }
        }
    }
    // The fresh connection rejoined only the channel actually targeted
    assert!(second_conn_lines.contains(&"JOIN #two".to_string()));
    assert!(!second_conn_lines.iter().any(|l| l == "JOIN #one"));

    let _ = engine.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_malformed_submission_does_not_break_delivery() {
    let (irc_addr, mut irc_rx) = spawn_mock_irc_server("\u{1}never\u{1}").await;
    let engine = spawn_engine(Config::default()).await;

    let mut stream = TcpStream::connect(engine.listen_addr).await.unwrap();
    let good = format!(
        r#"{{"to": "irc://{}:{}/#ok", "privmsg": "survived"}}"#,
        irc_addr.ip(),
        irc_addr.port()
    );
    let payload = format!("{}\n{}\n", r#"{"to": [], "privmsg": "x"}"#, good);
    stream.write_all(payload.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();

    loop {
        let (_, line) = next_line(&mut irc_rx).await;
        if line == "PRIVMSG #ok :survived" {
            break;
        }
    }

    let _ = engine.shutdown_tx.send(true);
}
