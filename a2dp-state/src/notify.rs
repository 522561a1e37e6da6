//! Outbound notifications and their subscribers
//!
//! The state machine commits a transition and then publishes it here, so
//! every subscriber observes transitions in commit order. Notifications are
//! consumed through [`NotificationIterator`], a blocking iterator:
//! - Blocking: `recv()`, `for n in iter`
//! - Non-blocking: `try_recv()`, `try_iter()`
//! - Timeout: `recv_timeout()`, `timeout_iter()`

use std::sync::mpsc;
use std::time::Duration;

use a2dp_stack::{AudioConfig, ConnectionState, DeviceAddress, PlayState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// An observable change published by the connection core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    ConnectionStateChanged {
        device: DeviceAddress,
        old: ConnectionState,
        new: ConnectionState,
    },
    AudioStateChanged {
        device: DeviceAddress,
        old: PlayState,
        new: PlayState,
    },
    AudioConfigChanged {
        device: DeviceAddress,
        config: AudioConfig,
    },
}

impl Notification {
    pub fn device(&self) -> &DeviceAddress {
        match self {
            Self::ConnectionStateChanged { device, .. }
            | Self::AudioStateChanged { device, .. }
            | Self::AudioConfigChanged { device, .. } => device,
        }
    }

    /// `(old, new)` if this is a connection-state notification
    pub fn connection_change(&self) -> Option<(ConnectionState, ConnectionState)> {
        match self {
            Self::ConnectionStateChanged { old, new, .. } => Some((*old, *new)),
            _ => None,
        }
    }
}

/// Fans notifications out to every live subscriber
///
/// While a batch is open, notifications are held back and delivered in one
/// go by [`flush`](Self::flush). The connection worker opens a batch around
/// each step so subscribers never observe a transition before the snapshot
/// that contains it.
#[derive(Debug, Default)]
pub struct NotificationBroadcaster {
    subscribers: Mutex<Vec<mpsc::Sender<Notification>>>,
    batch: Mutex<Option<Vec<Notification>>>,
}

impl NotificationBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    ///
    /// The subscriber sees only notifications published after this call.
    pub fn subscribe(&self) -> NotificationIterator {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        NotificationIterator::new(rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn connection_state_changed(
        &self,
        device: DeviceAddress,
        old: ConnectionState,
        new: ConnectionState,
    ) {
        if old == new {
            return;
        }
        tracing::debug!("{}: connection {} -> {}", device, old, new);
        self.publish(Notification::ConnectionStateChanged { device, old, new });
    }

    pub fn audio_state_changed(&self, device: DeviceAddress, old: PlayState, new: PlayState) {
        if old == new {
            return;
        }
        tracing::debug!("{}: audio {} -> {}", device, old, new);
        self.publish(Notification::AudioStateChanged { device, old, new });
    }

    pub fn audio_config_changed(&self, device: DeviceAddress, config: AudioConfig) {
        tracing::debug!(
            "{}: audio config {} Hz, {} channel(s)",
            device,
            config.sample_rate,
            config.channel_count
        );
        self.publish(Notification::AudioConfigChanged { device, config });
    }

    /// Hold notifications until the next [`flush`](Self::flush)
    pub(crate) fn begin_batch(&self) {
        let mut batch = self.batch.lock();
        if batch.is_none() {
            *batch = Some(Vec::new());
        }
    }

    /// Deliver held notifications in the order they were published
    pub(crate) fn flush(&self) {
        let held = self.batch.lock().take().unwrap_or_default();
        for notification in held {
            self.deliver(notification);
        }
    }

    fn publish(&self, notification: Notification) {
        if let Some(batch) = self.batch.lock().as_mut() {
            batch.push(notification);
            return;
        }
        self.deliver(notification);
    }

    fn deliver(&self, notification: Notification) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

/// Blocking iterator over notifications
///
/// All methods are synchronous. Iteration ends once the manager that owns the
/// broadcaster has been dropped.
///
/// # Example
///
/// ```rust,ignore
/// for notification in manager.subscribe() {
///     println!("{:?}", notification);
/// }
///
/// if let Some(n) = manager.subscribe().recv_timeout(Duration::from_secs(1)) {
///     println!("Got notification: {:?}", n);
/// }
/// ```
pub struct NotificationIterator {
    rx: mpsc::Receiver<Notification>,
}

impl NotificationIterator {
    pub(crate) fn new(rx: mpsc::Receiver<Notification>) -> Self {
        Self { rx }
    }

    /// Block until the next notification is available
    ///
    /// Returns `None` if the broadcaster is gone.
    pub fn recv(&self) -> Option<Notification> {
        self.rx.recv().ok()
    }

    /// Block until the next notification or timeout expires
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Try to receive a notification without blocking
    pub fn try_recv(&self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Non-blocking iterator over notifications already queued
    pub fn try_iter(&self) -> TryIter<'_> {
        TryIter { inner: self }
    }

    /// Iterator that waits up to `timeout` for each notification and stops
    /// at the first gap longer than that
    pub fn timeout_iter(&self, timeout: Duration) -> TimeoutIter<'_> {
        TimeoutIter {
            inner: self,
            timeout,
        }
    }
}

impl Iterator for NotificationIterator {
    type Item = Notification;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

pub struct TryIter<'a> {
    inner: &'a NotificationIterator,
}

impl Iterator for TryIter<'_> {
    type Item = Notification;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.try_recv()
    }
}

pub struct TimeoutIter<'a> {
    inner: &'a NotificationIterator,
    timeout: Duration,
}

impl Iterator for TimeoutIter<'_> {
    type Item = Notification;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.recv_timeout(self.timeout)
    }
}
