//! Daemon orchestration
//!
//! Wires the listener, dispatcher, rate limiter, and connection pool
//! together and drives graceful shutdown: intake stops first, the
//! dispatcher drains, then every connection flushes and QUITs within the
//! configured grace period.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::listener::Listener;
use crate::pool::ConnectionPool;
use crate::rate_limiter::RateLimiter;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Sweep period for dropping idle rate-limiter buckets
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// The notification relay daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a daemon from validated configuration
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until `shutdown` flips to true. Only a listener bind failure is
    /// fatal; all later errors degrade gracefully with logging.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.config.validate()?;

        let limiter = Arc::new(RateLimiter::new(&self.config.rate_limit));
        let pool = Arc::new(ConnectionPool::new(
            self.config.irc.clone(),
            self.config.pool.clone(),
        ));
        pool.start_sweep_task();

        {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    limiter.sweep().await;
                }
            });
        }

        let (notification_tx, notification_rx) = mpsc::channel(self.config.dispatch.max_in_flight);
        let listener = Listener::bind(&self.config.listen, notification_tx).await?;

        let dispatcher = Dispatcher::new(pool.clone(), limiter, notification_rx);
        let mut dispatcher_task = tokio::spawn(dispatcher.run());

        // Listener returns once shutdown is signalled, dropping the
        // notification sender so no new work enters during teardown
        listener.run(shutdown).await;

        info!("Draining dispatcher");
        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, &mut dispatcher_task).await.is_err() {
            warn!("Dispatcher did not drain within the grace period");
            dispatcher_task.abort();
        }

        info!("Closing IRC connections");
        pool.shutdown(grace).await;
        info!("Shutdown complete");
        Ok(())
    }
}
