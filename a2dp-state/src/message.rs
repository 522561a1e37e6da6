//! Mailbox messages for the connection actor

use a2dp_stack::{DeviceAddress, StackEvent};
use tokio::sync::mpsc;

/// A unit of work processed to completion by the connection actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Locally requested outgoing connection
    Connect(DeviceAddress),
    /// Locally requested disconnection
    Disconnect(DeviceAddress),
    /// Confirmation or unsolicited event from the lower stack
    Stack(StackEvent),
    /// A connect timer fired; only the live generation is honoured
    Timeout {
        device: DeviceAddress,
        generation: u64,
    },
    Shutdown,
}

impl From<StackEvent> for Message {
    fn from(event: StackEvent) -> Self {
        Self::Stack(event)
    }
}

pub(crate) type MailboxSender = mpsc::UnboundedSender<Message>;
pub(crate) type MailboxReceiver = mpsc::UnboundedReceiver<Message>;
