//! A2DP Connection Admission
//!
//! Manages audio-profile connections between the local device and up to
//! `max_connections` remote sinks, reconciling three sources of truth:
//! local connect/disconnect requests, confirmations from the lower stack,
//! and connect timeouts.
//!
//! # Features
//!
//! - **Admission**: capacity, stored priority, bond state and quiet mode
//!   decide who may connect
//! - **Eviction**: at capacity, the oldest member makes room for a new target
//! - **Serialized processing**: a single actor thread owns all state
//! - **Sync-first API**: no `.await` needed; queries read a published snapshot
//! - **Notifications**: blocking iterators over connection and audio changes
//!
//! # Architecture
//!
//! ```text
//! A2dpManager ─┐                       ┌─> LowerStackGateway
//! StackEvents ─┼─> mailbox ─> machine ─┼─> NotificationBroadcaster ─> subscribers
//! timers ──────┘                       └─> ConnectionSnapshot ─> queries
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use a2dp_state::{A2dpManager, ManagerConfig};
//!
//! let manager = A2dpManager::builder()
//!     .config(ManagerConfig::from_env()?)
//!     .gateway(native_gateway)
//!     .registry(settings)
//!     .build()?;
//!
//! let native_events = manager.stack_sender();
//! manager.connect(headset)?;
//!
//! for notification in manager.subscribe() {
//!     println!("{:?}", notification);
//! }
//! ```

pub mod admission;
pub mod config;
pub mod error;
pub mod logging;
pub mod machine;
pub mod manager;
pub mod message;
pub mod notify;
pub mod registry;
pub mod snapshot;
pub mod timeout;
mod worker;

pub use admission::AdmissionPolicy;
pub use config::ManagerConfig;
pub use error::{A2dpError, Result};
pub use machine::ConnectionStateMachine;
pub use manager::{A2dpManager, A2dpManagerBuilder, StackEventSender};
pub use message::Message;
pub use notify::{Notification, NotificationBroadcaster, NotificationIterator};
pub use registry::{DeviceRegistry, InMemoryDeviceRegistry};
pub use snapshot::{ConnectionSnapshot, MachineState};
pub use timeout::{ConnectTimer, TimeoutSupervisor};

pub use a2dp_stack::{
    AudioConfig, AudioState, ConnectionState, DeviceAddress, LowerStackGateway, PlayState,
    Priority, StackEvent,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        A2dpError, A2dpManager, ConnectionState, DeviceAddress, ManagerConfig, MachineState,
        Notification, Priority, Result,
    };
}
