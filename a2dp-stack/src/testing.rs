//! In-process gateway double that records every call
//!
//! Enabled with the `test-support` feature. Clones share the same call log,
//! so a test can hand one clone to the connection core and inspect another.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::DeviceAddress;
use crate::gateway::LowerStackGateway;

/// A single call observed by [`RecordingGateway`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Connect(DeviceAddress),
    Disconnect(DeviceAddress),
    AllowConnection(DeviceAddress, bool),
    Rejected(DeviceAddress),
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<GatewayCall>,
    refuse_connect: HashSet<DeviceAddress>,
    refuse_disconnect: HashSet<DeviceAddress>,
}

/// Gateway that accepts every request unless told otherwise
#[derive(Debug, Clone, Default)]
pub struct RecordingGateway {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `request_connect(device)` return `false`
    pub fn refuse_connect(&self, device: DeviceAddress) {
        self.inner.lock().refuse_connect.insert(device);
    }

    /// Make `request_disconnect(device)` return `false`
    pub fn refuse_disconnect(&self, device: DeviceAddress) {
        self.inner.lock().refuse_disconnect.insert(device);
    }

    /// Clear all refusals
    pub fn accept_all(&self) {
        let mut inner = self.inner.lock();
        inner.refuse_connect.clear();
        inner.refuse_disconnect.clear();
    }

    /// Every call observed so far, in order
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.inner.lock().calls.clone()
    }

    /// Drain the call log
    pub fn take_calls(&self) -> Vec<GatewayCall> {
        std::mem::take(&mut self.inner.lock().calls)
    }

    pub fn connect_requests(&self) -> Vec<DeviceAddress> {
        self.filter(|call| match call {
            GatewayCall::Connect(d) => Some(*d),
            _ => None,
        })
    }

    pub fn disconnect_requests(&self) -> Vec<DeviceAddress> {
        self.filter(|call| match call {
            GatewayCall::Disconnect(d) => Some(*d),
            _ => None,
        })
    }

    fn filter(&self, f: impl Fn(&GatewayCall) -> Option<DeviceAddress>) -> Vec<DeviceAddress> {
        self.inner.lock().calls.iter().filter_map(f).collect()
    }
}

impl LowerStackGateway for RecordingGateway {
    fn request_connect(&self, device: &DeviceAddress) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.push(GatewayCall::Connect(*device));
        !inner.refuse_connect.contains(device)
    }

    fn request_disconnect(&self, device: &DeviceAddress) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.push(GatewayCall::Disconnect(*device));
        !inner.refuse_disconnect.contains(device)
    }

    fn allow_connection(&self, device: &DeviceAddress, allowed: bool) {
        self.inner
            .lock()
            .calls
            .push(GatewayCall::AllowConnection(*device, allowed));
    }

    fn notify_connection_rejected(&self, device: &DeviceAddress) {
        self.inner.lock().calls.push(GatewayCall::Rejected(*device));
    }
}
