use a2dp_stack::{AddressParseError, DeviceAddress};
use thiserror::Error;

/// Errors returned by the A2DP connection manager
#[derive(Error, Debug)]
pub enum A2dpError {
    /// A device address could not be parsed
    #[error("Invalid device address: {0}")]
    InvalidAddress(#[from] AddressParseError),

    /// Configuration rejected by `ManagerConfig::validate`
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The stored priority of the device forbids connecting to it
    #[error("Connection to {0} refused: priority is off")]
    ConnectionRefused(DeviceAddress),

    /// The connection worker is gone (shut down or panicked)
    #[error("Connection worker is not running")]
    WorkerDisconnected,

    /// The connection worker thread or runtime could not be started
    #[error("Failed to start connection worker: {0}")]
    WorkerSpawn(String),

    /// The worker did not stop cleanly
    #[error("Shutdown failed: {0}")]
    ShutdownFailed(String),

    /// No gateway was supplied to the builder
    #[error("A lower stack gateway is required")]
    MissingGateway,
}

/// Result type for A2DP manager operations
pub type Result<T> = std::result::Result<T, A2dpError>;
