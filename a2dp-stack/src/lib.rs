//! # A2DP Stack Interface
//!
//! Types shared between the lower radio/protocol stack and the A2DP
//! connection core:
//!
//! - **Identity**: [`DeviceAddress`], the stable key for a remote peer
//! - **States**: [`ConnectionState`], [`AudioState`], [`PlayState`], [`Priority`]
//! - **Inbound events**: [`StackEvent`] raised on the native event thread
//! - **Outbound calls**: the [`LowerStackGateway`] trait
//!
//! The stack itself (wire protocol, codec negotiation, radio timing) is
//! opaque; this crate only describes the narrow surface the connection core
//! talks to.
//!
//! ## Usage
//!
//! ```rust
//! use a2dp_stack::{ConnectionState, DeviceAddress, StackEvent};
//!
//! let device: DeviceAddress = "00:1A:7D:DA:71:13".parse().unwrap();
//! let event = StackEvent::connection(device, ConnectionState::Connected);
//! assert_eq!(event.device(), &device);
//! ```

pub mod address;
pub mod error;
pub mod event;
pub mod gateway;
pub mod state;

#[cfg(feature = "test-support")]
pub mod testing;

pub use address::DeviceAddress;
pub use error::{AddressParseError, UnknownValue};
pub use event::{AudioConfig, StackEvent};
pub use gateway::LowerStackGateway;
pub use state::{AudioState, ConnectionState, PlayState, Priority};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        AudioConfig, AudioState, ConnectionState, DeviceAddress, LowerStackGateway, PlayState,
        Priority, StackEvent,
    };
}
