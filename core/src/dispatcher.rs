//! Notification dispatch
//!
//! Consumes validated notifications, resolves each target to a pooled
//! connection, and gates every send on the per-channel rate limiter.
//! Denied sends are parked in per-channel FIFO queues and woken by a
//! `DelayQueue` timer; rate limiting defers, it never drops.

use crate::connection::Delivery;
use crate::notification::Notification;
use crate::pool::ConnectionPool;
use crate::rate_limiter::{RateLimiter, TokenDecision};
use crate::target::Target;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tracing::{debug, warn};

/// One target's share of a notification, waiting for a rate-limit token
struct PendingSend {
    target: Target,
    text: String,
    nick_hint: Option<String>,
}

/// Dispatcher task: the bridge between the listener and the connection pool
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    limiter: Arc<RateLimiter>,
    rx: mpsc::Receiver<Notification>,
}

impl Dispatcher {
    /// Create a dispatcher consuming from `rx`
    pub fn new(
        pool: Arc<ConnectionPool>,
        limiter: Arc<RateLimiter>,
        rx: mpsc::Receiver<Notification>,
    ) -> Self {
        Self { pool, limiter, rx }
    }

    /// Run until the notification channel closes, then drain the deferred
    /// queues (still honoring rate-limit spacing).
    pub async fn run(mut self) {
        let mut deferred: HashMap<String, VecDeque<PendingSend>> = HashMap::new();
        let mut timers: DelayQueue<String> = DelayQueue::new();

        loop {
            tokio::select! {
                notification = self.rx.recv() => match notification {
                    Some(notification) => {
                        self.handle_notification(notification, &mut deferred, &mut timers).await;
                    }
                    None => break,
                },
                expired = std::future::poll_fn(|cx| timers.poll_expired(cx)), if !timers.is_empty() => {
                    if let Some(expired) = expired {
                        self.retry_channel(expired.into_inner(), &mut deferred, &mut timers).await;
                    }
                }
            }
        }

        // Input closed; flush what the rate limiter deferred
        while let Some(expired) = std::future::poll_fn(|cx| timers.poll_expired(cx)).await {
            self.retry_channel(expired.into_inner(), &mut deferred, &mut timers).await;
        }
        debug!("Dispatcher drained");
    }

    async fn handle_notification(
        &self,
        notification: Notification,
        deferred: &mut HashMap<String, VecDeque<PendingSend>>,
        timers: &mut DelayQueue<String>,
    ) {
        for target in notification.targets {
            let channel_key = target.channel_key();
            let send = PendingSend {
                target,
                text: notification.text.clone(),
                nick_hint: notification.nick_hint.clone(),
            };

            // A channel with a deferred head keeps FIFO order: later
            // messages queue behind it even if a token is available now.
            if let Some(queue) = deferred.get_mut(&channel_key) {
                queue.push_back(send);
                continue;
            }

            match self.limiter.try_acquire(&channel_key).await {
                TokenDecision::Granted => self.send_now(send).await,
                TokenDecision::Wait(delay) => {
                    let mut queue = VecDeque::new();
                    queue.push_back(send);
                    deferred.insert(channel_key.clone(), queue);
                    timers.insert(channel_key, delay);
                }
            }
        }
    }

    /// A rate-limit timer fired for this channel: send as many queued
    /// messages as tokens allow, re-arming the timer if any remain.
    async fn retry_channel(
        &self,
        channel_key: String,
        deferred: &mut HashMap<String, VecDeque<PendingSend>>,
        timers: &mut DelayQueue<String>,
    ) {
        let Some(queue) = deferred.get_mut(&channel_key) else {
            return;
        };
        while !queue.is_empty() {
            match self.limiter.try_acquire(&channel_key).await {
                TokenDecision::Granted => {
                    // Non-empty by the loop guard
                    if let Some(send) = queue.pop_front() {
                        self.send_now(send).await;
                    }
                }
                TokenDecision::Wait(delay) => {
                    timers.insert(channel_key, delay);
                    return;
                }
            }
        }
        deferred.remove(&channel_key);
    }

    /// Resolve the target's connection and enqueue the delivery. Failures
    /// are per-target: they are logged and never abort other targets.
    async fn send_now(&self, send: PendingSend) {
        let key = send.target.connection_key();
        match self.pool.acquire(&key, send.nick_hint.as_deref()).await {
            Ok(handle) => {
                let delivery = Delivery {
                    channel: send.target.channel.clone(),
                    is_channel: send.target.is_channel(),
                    channel_password: send.target.password.clone(),
                    text: send.text,
                };
                if let Err(e) = handle.deliver(delivery) {
                    warn!("Delivery to {} failed: {}", send.target, e);
                }
            }
            Err(e) => {
                warn!("Delivery to {} failed: {}", send.target, e);
            }
        }
    }
}
