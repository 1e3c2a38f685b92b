//! Configuration management

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener settings
    pub listen: ListenConfig,
    /// IRC client settings
    pub irc: IrcConfig,
    /// Rate limiting settings
    pub rate_limit: RateLimitConfig,
    /// Connection pool settings
    pub pool: PoolConfig,
    /// Dispatcher settings
    pub dispatch: DispatchConfig,
}

/// Inbound listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address to bind the UDP and TCP listeners on
    pub host: String,
    /// Port to bind the UDP and TCP listeners on
    pub port: u16,
}

/// IRC client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrcConfig {
    /// Base nickname used when registering connections
    pub nick: String,
    /// Username sent in USER
    pub username: String,
    /// Realname sent in USER
    pub realname: String,
    /// Quit message sent on graceful shutdown
    pub quit_message: String,
    /// Seconds of server silence before we send a client-side PING
    pub ping_interval_secs: u64,
    /// Seconds of server silence before the connection is declared dead
    pub dead_interval_secs: u64,
    /// Maximum queued outbound lines per connection
    pub outbound_queue_limit: usize,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Token bucket capacity per channel
    pub capacity: f64,
    /// Seconds to refill one token
    pub refill_interval_secs: f64,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Seconds of inactivity (no traffic, no joined channels) before eviction
    pub idle_timeout_secs: u64,
    /// Base reconnect backoff in seconds
    pub backoff_base_secs: u64,
    /// Maximum reconnect backoff in seconds
    pub backoff_max_secs: u64,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum notifications buffered between listener and dispatcher
    pub max_in_flight: usize,
    /// Seconds granted to flush outbound queues on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                host: "127.0.0.1".to_string(),
                port: 6659,
            },
            irc: IrcConfig {
                nick: "ircnotify".to_string(),
                username: "ircnotify".to_string(),
                realname: "ircnotifyd notification relay".to_string(),
                quit_message: "ircnotifyd shutting down".to_string(),
                ping_interval_secs: 180,
                dead_interval_secs: 600,
                outbound_queue_limit: 512,
            },
            rate_limit: RateLimitConfig {
                capacity: 1.0,
                refill_interval_secs: 2.0,
            },
            pool: PoolConfig {
                idle_timeout_secs: 600,
                backoff_base_secs: 1,
                backoff_max_secs: 60,
            },
            dispatch: DispatchConfig {
                max_in_flight: 1024,
                shutdown_grace_secs: 5,
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.irc.nick.is_empty() {
            return Err(Error::Config("irc.nick must not be empty".to_string()));
        }
        if self.irc.username.is_empty() {
            return Err(Error::Config("irc.username must not be empty".to_string()));
        }
        if self.rate_limit.capacity < 1.0 {
            return Err(Error::Config(
                "rate_limit.capacity must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.refill_interval_secs <= 0.0 {
            return Err(Error::Config(
                "rate_limit.refill_interval_secs must be positive".to_string(),
            ));
        }
        if self.pool.backoff_base_secs == 0 {
            return Err(Error::Config(
                "pool.backoff_base_secs must be at least 1".to_string(),
            ));
        }
        if self.pool.backoff_max_secs < self.pool.backoff_base_secs {
            return Err(Error::Config(
                "pool.backoff_max_secs must be >= pool.backoff_base_secs".to_string(),
            ));
        }
        if self.irc.dead_interval_secs <= self.irc.ping_interval_secs {
            return Err(Error::Config(
                "irc.dead_interval_secs must be greater than irc.ping_interval_secs".to_string(),
            ));
        }
        if self.irc.outbound_queue_limit == 0 {
            return Err(Error::Config(
                "irc.outbound_queue_limit must be at least 1".to_string(),
            ));
        }
        if self.dispatch.max_in_flight == 0 {
            return Err(Error::Config(
                "dispatch.max_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Shutdown grace period as a Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.dispatch.shutdown_grace_secs)
    }
}
