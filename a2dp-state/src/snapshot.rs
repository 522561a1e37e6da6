//! Immutable view of the connection core published after every step

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use a2dp_stack::{AudioConfig, ConnectionState, DeviceAddress};
use serde::{Deserialize, Serialize};

/// Top-level state of the connection machine
///
/// Derived from the role slots; never stored independently of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineState {
    /// Nothing connected, nothing in flight
    #[default]
    Idle,
    /// An operation is in flight and no peer is stably connected
    Pending,
    /// At least one peer connected, nothing in flight
    Connected,
    /// Peers are connected while another operation is in flight
    AdmissionPending,
}

impl MachineState {
    /// Whether new requests are processed immediately rather than deferred
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Idle | Self::Connected)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Pending => "Pending",
            Self::Connected => "Connected",
            Self::AdmissionPending => "AdmissionPending",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of everything the query API can answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: MachineState,
    /// Connected peers, oldest admission first
    pub connected: Vec<DeviceAddress>,
    pub primary: Option<DeviceAddress>,
    /// Outgoing connection in flight
    pub target: Option<DeviceAddress>,
    /// Incoming connection in flight
    pub incoming: Option<DeviceAddress>,
    /// Connected peer being torn down
    pub disconnecting: Option<DeviceAddress>,
    pub playing: BTreeSet<DeviceAddress>,
    pub audio_configs: BTreeMap<DeviceAddress, AudioConfig>,
}

impl ConnectionSnapshot {
    /// Externally visible connection state of `device`
    pub fn connection_state(&self, device: &DeviceAddress) -> ConnectionState {
        if self.disconnecting.as_ref() == Some(device) {
            ConnectionState::Disconnecting
        } else if self.connected.contains(device) {
            ConnectionState::Connected
        } else if self.target.as_ref() == Some(device) || self.incoming.as_ref() == Some(device) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn connected_devices(&self) -> &[DeviceAddress] {
        &self.connected
    }

    pub fn is_playing(&self, device: &DeviceAddress) -> bool {
        self.playing.contains(device)
    }

    pub fn playing_devices(&self) -> Vec<DeviceAddress> {
        self.playing.iter().copied().collect()
    }

    pub fn is_any_playing(&self) -> bool {
        !self.playing.is_empty()
    }

    /// More than one peer is streaming
    pub fn is_multicast_active(&self) -> bool {
        self.playing.len() > 1
    }

    pub fn primary_device(&self) -> Option<DeviceAddress> {
        self.primary
    }

    pub fn audio_config(&self, device: &DeviceAddress) -> Option<AudioConfig> {
        self.audio_configs.get(device).copied()
    }

    /// Every device held in a role slot, without duplicates
    pub fn known_devices(&self) -> Vec<DeviceAddress> {
        let mut devices: Vec<_> = self.connected.clone();
        for slot in [self.target, self.incoming, self.disconnecting]
            .into_iter()
            .flatten()
        {
            if !devices.contains(&slot) {
                devices.push(slot);
            }
        }
        devices
    }

    /// Known devices whose current state is one of `states`
    pub fn devices_matching_states(&self, states: &[ConnectionState]) -> Vec<DeviceAddress> {
        self.known_devices()
            .into_iter()
            .filter(|d| states.contains(&self.connection_state(d)))
            .collect()
    }
}
