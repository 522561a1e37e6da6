//! Narrow native-call interface to the lower radio/protocol stack
//!
//! Calls return immediately. A `false` return means the stack refused the
//! request outright and no follow-up [`StackEvent`](crate::StackEvent) will
//! arrive for it. An accepted request is confirmed (or denied) later through
//! a `ConnectionStateChanged` event.

use crate::address::DeviceAddress;

/// Outbound calls from the connection core into the lower stack
///
/// Implementations must not block: they are invoked from inside the
/// connection actor while it processes a message.
pub trait LowerStackGateway: Send + Sync {
    /// Start an outgoing profile connection to `device`
    fn request_connect(&self, device: &DeviceAddress) -> bool;

    /// Tear down the profile connection to `device`
    fn request_disconnect(&self, device: &DeviceAddress) -> bool;

    /// Answer a `CheckConnectionPriority` query from the stack
    fn allow_connection(&self, device: &DeviceAddress, allowed: bool) {
        tracing::trace!("allow_connection({}, {}) not handled by gateway", device, allowed);
    }

    /// Tell the lower layer an incoming connection was refused so other
    /// profiles can be tried for the same peer
    fn notify_connection_rejected(&self, device: &DeviceAddress) {
        tracing::trace!("notify_connection_rejected({}) not handled by gateway", device);
    }
}
