//! Profile-level state enums shared by the stack and the connection core

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::UnknownValue;

/// Connection state of a single peer
///
/// Raw values match the native `btav_connection_state_t` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Whether the peer holds (or is acquiring) a profile connection
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl TryFrom<i32> for ConnectionState {
    type Error = UnknownValue;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Disconnected),
            1 => Ok(Self::Connecting),
            2 => Ok(Self::Connected),
            3 => Ok(Self::Disconnecting),
            _ => Err(UnknownValue {
                kind: "connection state",
                value,
            }),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
        };
        f.write_str(s)
    }
}

/// Streaming state reported by the stack for a connected peer
///
/// Raw values match the native `btav_audio_state_t` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioState {
    RemoteSuspend,
    Stopped,
    Started,
}

impl TryFrom<i32> for AudioState {
    type Error = UnknownValue;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::RemoteSuspend),
            1 => Ok(Self::Stopped),
            2 => Ok(Self::Started),
            _ => Err(UnknownValue {
                kind: "audio state",
                value,
            }),
        }
    }
}

/// Play state published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayState {
    NotPlaying,
    Playing,
}

impl From<AudioState> for PlayState {
    fn from(state: AudioState) -> Self {
        match state {
            AudioState::Started => Self::Playing,
            AudioState::Stopped | AudioState::RemoteSuspend => Self::NotPlaying,
        }
    }
}

impl fmt::Display for PlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPlaying => f.write_str("NOT_PLAYING"),
            Self::Playing => f.write_str("PLAYING"),
        }
    }
}

/// Stored per-device connection priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Off,
    #[default]
    Undefined,
    On,
    AutoConnect,
}

impl Priority {
    /// Priority is `On` or stronger
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::On | Self::AutoConnect)
    }

    /// Decode the platform's integer priority encoding
    ///
    /// `-1` is undefined, `0` off, anything in `1..1000` on and `1000`
    /// or above auto-connect.
    pub fn from_raw(value: i32) -> Self {
        match value {
            i32::MIN..=-1 => Self::Undefined,
            0 => Self::Off,
            1..=999 => Self::On,
            _ => Self::AutoConnect,
        }
    }

    /// Encode in the platform's integer priority representation
    pub fn to_raw(self) -> i32 {
        match self {
            Self::Undefined => -1,
            Self::Off => 0,
            Self::On => 100,
            Self::AutoConnect => 1000,
        }
    }
}
