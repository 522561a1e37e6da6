//! Remote device identity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AddressParseError;

/// Bluetooth device address (`BD_ADDR`) identifying a remote peer
///
/// The address is the only identity the connection core knows about a peer.
/// It is used as a map/set key and carries no mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Create an address from its raw bytes (most significant byte first)
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes as handed to the native layer
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Parse a `AA:BB:CC:DD:EE:FF` style address
    ///
    /// Both `:` and `-` are accepted as separators, hex digits may be
    /// upper or lower case.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let s = s.trim();
        if s.len() != 17 {
            return Err(AddressParseError::Length(s.len()));
        }

        let mut bytes = [0u8; 6];
        let mut count = 0;
        for (i, part) in s.split([':', '-']).enumerate() {
            if i >= 6 || part.len() != 2 {
                return Err(AddressParseError::Format(s.to_string()));
            }
            if !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(AddressParseError::InvalidDigit(part.to_string()));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| AddressParseError::InvalidDigit(part.to_string()))?;
            count += 1;
        }

        if count != 6 {
            return Err(AddressParseError::Format(s.to_string()));
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for DeviceAddress {
    type Error = AddressParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl TryFrom<&[u8]> for DeviceAddress {
    type Error = AddressParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; 6] = bytes
            .try_into()
            .map_err(|_| AddressParseError::Length(bytes.len()))?;
        Ok(Self(raw))
    }
}

impl From<[u8; 6]> for DeviceAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl From<DeviceAddress> for String {
    fn from(addr: DeviceAddress) -> Self {
        addr.to_string()
    }
}
