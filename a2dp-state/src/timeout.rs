//! Connect timers
//!
//! Every outgoing or incoming connection gets a deadline. When it passes, a
//! `Message::Timeout` lands in the actor's mailbox. Each start bumps a
//! generation counter so a timer that fires after being replaced or cancelled
//! is recognised as stale and dropped.

use std::collections::HashMap;
use std::time::Duration;

use a2dp_stack::DeviceAddress;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::message::{MailboxSender, Message};

/// Timer service used by the state machine
pub trait ConnectTimer: Send {
    /// Start (or restart) the timer for `device`
    fn start(&mut self, device: DeviceAddress, duration: Duration);

    /// Cancel the timer for `device`, if any
    fn cancel(&mut self, device: &DeviceAddress);

    fn cancel_all(&mut self);

    /// Consume a fired timer
    ///
    /// Returns `true` exactly once for the live generation of `device`, and
    /// `false` for stale or already-claimed generations.
    fn claim(&mut self, device: &DeviceAddress, generation: u64) -> bool;
}

struct ArmedTimer {
    generation: u64,
    task: AbortHandle,
}

/// Tokio-backed [`ConnectTimer`] posting into the actor mailbox
pub struct TimeoutSupervisor {
    runtime: Handle,
    mailbox: MailboxSender,
    timers: HashMap<DeviceAddress, ArmedTimer>,
    next_generation: u64,
}

impl TimeoutSupervisor {
    pub(crate) fn new(runtime: Handle, mailbox: MailboxSender) -> Self {
        Self {
            runtime,
            mailbox,
            timers: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Number of armed timers
    pub fn active(&self) -> usize {
        self.timers.len()
    }
}

impl ConnectTimer for TimeoutSupervisor {
    fn start(&mut self, device: DeviceAddress, duration: Duration) {
        self.cancel(&device);

        self.next_generation += 1;
        let generation = self.next_generation;
        let mailbox = self.mailbox.clone();

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            if mailbox
                .send(Message::Timeout { device, generation })
                .is_err()
            {
                tracing::trace!("Timer for {} fired after the actor stopped", device);
            }
        });

        tracing::trace!(
            "Connect timer armed for {} ({:?}, generation {})",
            device,
            duration,
            generation
        );
        self.timers.insert(
            device,
            ArmedTimer {
                generation,
                task: task.abort_handle(),
            },
        );
    }

    fn cancel(&mut self, device: &DeviceAddress) {
        if let Some(timer) = self.timers.remove(device) {
            timer.task.abort();
            tracing::trace!("Connect timer cancelled for {}", device);
        }
    }

    fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }

    fn claim(&mut self, device: &DeviceAddress, generation: u64) -> bool {
        match self.timers.get(device) {
            Some(timer) if timer.generation == generation => {
                self.timers.remove(device);
                true
            }
            _ => false,
        }
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
