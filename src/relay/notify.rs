//! Operator notifications with per-key throttling.
//!
//! Notifications are best-effort: a full channel or a throttled key drops
//! the notification and never slows down event handling.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{ChatId, SourceKey};

/// Last-sent time per key. Reads share the lock; only a send takes it
/// exclusively, and only for the insert.
pub struct Throttle {
    interval: Duration,
    last: RwLock<HashMap<String, Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a notification for `key` may go out now. Records the send if so.
    pub fn allow(&self, key: &str) -> bool {
        {
            let last = self.last.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = last.get(key) {
                if at.elapsed() < self.interval {
                    return false;
                }
            }
        }

        let mut last = self.last.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match last.get(key) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop entries older than the interval.
    pub fn prune(&self) {
        let mut last = self.last.write().unwrap_or_else(PoisonError::into_inner);
        last.retain(|_, at| at.elapsed() < self.interval);
    }
}

/// A message for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Throttle key; equal keys within the interval collapse into one.
    pub key: String,
    pub text: String,
    pub source: Option<SourceKey>,
    pub destination: Option<ChatId>,
}

/// Sending half of the notification channel.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
    throttle: Arc<Throttle>,
}

impl Notifier {
    /// Create a notifier and the receiver its notifications arrive on.
    pub fn channel(capacity: usize, interval: Duration) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let notifier = Self {
            tx,
            throttle: Arc::new(Throttle::new(interval)),
        };
        (notifier, rx)
    }

    /// Queue a notification unless its key is throttled. Returns whether it was queued.
    pub fn notify(&self, notification: Notification) -> bool {
        if !self.throttle.allow(&notification.key) {
            debug!(key = %notification.key, "Notification throttled");
            return false;
        }
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!(key = %n.key, "Notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Report a delivery failure for one destination.
    pub fn delivery_failed(&self, source: &SourceKey, destination: ChatId, error: &str) -> bool {
        self.notify(Notification {
            key: format!("failed/{}/{destination}", source.chat()),
            text: format!("*Relay failure*: {source} -> {destination}\n\n{error}"),
            source: Some(source.clone()),
            destination: Some(destination),
        })
    }

    pub fn prune(&self) {
        self.throttle.prune();
    }
}
