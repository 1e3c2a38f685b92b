//! Notification target parsing
//!
//! A target is one IRC destination extracted from a notification's `to`
//! field, written as a URI: `irc[s]://host[:port]/channel[?key=secret]`.

use crate::{Error, Result};
use std::fmt;

/// Default port for plaintext IRC
pub const DEFAULT_PLAIN_PORT: u16 = 6667;
/// Default port for TLS IRC
pub const DEFAULT_TLS_PORT: u16 = 6697;

/// Identifies one shared IRC session: all targets with the same key
/// multiplex onto the same connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Server hostname, lowercased
    pub host: String,
    /// Server port
    pub port: u16,
    /// Whether the session is TLS-wrapped
    pub tls: bool,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tls {
            write!(f, "ircs://{}:{}", self.host, self.port)
        } else {
            write!(f, "irc://{}:{}", self.host, self.port)
        }
    }
}

/// One IRC destination: a server plus a channel or nickname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Server hostname, lowercased
    pub host: String,
    /// Server port
    pub port: u16,
    /// Whether to use TLS
    pub use_tls: bool,
    /// Channel (leading `#` or `&`) or nickname for a direct message
    pub channel: String,
    /// Optional channel key passed to JOIN
    pub password: Option<String>,
}

impl Target {
    /// Parse a target URI of the form `irc[s]://host[:port]/channel[?key=secret]`
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::MalformedInput(format!("Target URI missing scheme: {}", uri)))?;

        let scheme_tls = match scheme.to_ascii_lowercase().as_str() {
            "irc" => false,
            "ircs" => true,
            other => {
                return Err(Error::MalformedInput(format!(
                    "Unsupported target scheme: {}",
                    other
                )))
            }
        };

        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::MalformedInput(format!("Target URI missing channel: {}", uri)))?;

        let (host, explicit_port) = match authority.split_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    Error::MalformedInput(format!("Invalid port in target URI: {}", uri))
                })?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        if host.is_empty() {
            return Err(Error::MalformedInput(format!(
                "Target URI missing host: {}",
                uri
            )));
        }

        // Port 6697 is the conventional TLS port; an explicit 6697 implies
        // TLS even with the plain scheme.
        let use_tls = scheme_tls || explicit_port == Some(DEFAULT_TLS_PORT);
        let port = explicit_port.unwrap_or(if use_tls {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PLAIN_PORT
        });

        let (channel_raw, query) = match path.split_once('?') {
            Some((channel, query)) => (channel, Some(query)),
            None => (path, None),
        };

        let channel = percent_decode(channel_raw)?;
        if channel.is_empty() {
            return Err(Error::MalformedInput(format!(
                "Target URI has empty channel: {}",
                uri
            )));
        }

        let password = match query {
            Some(query) => query
                .split('&')
                .find_map(|pair| pair.strip_prefix("key="))
                .map(percent_decode)
                .transpose()?,
            None => None,
        };

        Ok(Target {
            host: host.to_ascii_lowercase(),
            port,
            use_tls,
            channel,
            password,
        })
    }

    /// Connection pool addressing unit for this target
    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey {
            host: self.host.clone(),
            port: self.port,
            tls: self.use_tls,
        }
    }

    /// Whether this target is a channel (as opposed to a direct message)
    pub fn is_channel(&self) -> bool {
        self.channel.starts_with('#') || self.channel.starts_with('&')
    }

    /// Rate-limiter bucket key: one bucket per channel per server
    pub fn channel_key(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.channel)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "ircs" } else { "irc" };
        write!(f, "{}://{}:{}/{}", scheme, self.host, self.port, self.channel)
    }
}

/// Decode %XX escapes in a URI path segment
fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return Err(Error::MalformedInput(format!(
                    "Truncated percent escape in: {}",
                    input
                )));
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    Error::MalformedInput(format!("Invalid percent escape in: {}", input))
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| Error::MalformedInput(format!("Percent escapes decode to invalid UTF-8: {}", input)))
}
