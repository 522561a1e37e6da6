//! Events raised by the lower stack
//!
//! The native layer reports everything through these values. They are
//! produced on the radio-event thread and consumed by the connection core.

use serde::{Deserialize, Serialize};

use crate::address::DeviceAddress;
use crate::state::{AudioState, ConnectionState};

/// Negotiated stream configuration for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of audio channels (1 = mono, 2 = stereo)
    pub channel_count: u8,
}

impl AudioConfig {
    pub fn new(sample_rate: u32, channel_count: u8) -> Self {
        Self {
            sample_rate,
            channel_count,
        }
    }

    pub fn is_stereo(&self) -> bool {
        self.channel_count >= 2
    }
}

/// Inbound event from the lower stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackEvent {
    /// Profile connection state of a peer changed
    ConnectionStateChanged {
        device: DeviceAddress,
        state: ConnectionState,
    },

    /// Streaming state of a peer changed
    AudioStateChanged {
        device: DeviceAddress,
        state: AudioState,
    },

    /// Stream configuration was (re)negotiated
    AudioConfigChanged {
        device: DeviceAddress,
        config: AudioConfig,
    },

    /// The stack asks whether a peer may complete an incoming connection
    CheckConnectionPriority { device: DeviceAddress },
}

impl StackEvent {
    /// Device the event refers to
    pub fn device(&self) -> &DeviceAddress {
        match self {
            Self::ConnectionStateChanged { device, .. }
            | Self::AudioStateChanged { device, .. }
            | Self::AudioConfigChanged { device, .. }
            | Self::CheckConnectionPriority { device } => device,
        }
    }

    pub fn connection(device: DeviceAddress, state: ConnectionState) -> Self {
        Self::ConnectionStateChanged { device, state }
    }

    pub fn audio(device: DeviceAddress, state: AudioState) -> Self {
        Self::AudioStateChanged { device, state }
    }
}
