//! Sync-first A2DP connection manager
//!
//! Public entry point of the crate. Requests and stack events are posted to
//! the connection worker's mailbox and return immediately; queries read the
//! snapshot the worker publishes after every step.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use a2dp_stack::{
    AudioConfig, AudioState, ConnectionState, DeviceAddress, LowerStackGateway, Priority,
    StackEvent,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::info;

use crate::admission::AdmissionPolicy;
use crate::config::ManagerConfig;
use crate::error::{A2dpError, Result};
use crate::message::{MailboxSender, Message};
use crate::notify::{NotificationBroadcaster, NotificationIterator};
use crate::registry::{DeviceRegistry, InMemoryDeviceRegistry};
use crate::snapshot::{ConnectionSnapshot, MachineState};
use crate::worker::{spawn_connection_worker, WorkerParts};

/// Sync-first manager for multi-device A2DP connections
///
/// # Example
///
/// ```rust,ignore
/// use a2dp_state::{A2dpManager, ManagerConfig};
///
/// let manager = A2dpManager::builder()
///     .config(ManagerConfig::multicast())
///     .gateway(my_gateway)
///     .build()?;
///
/// // hand this to the native event thread
/// let events = manager.stack_sender();
///
/// let updates = manager.subscribe();
/// manager.connect("00:1A:7D:DA:71:13".parse()?)?;
///
/// for notification in updates {
///     println!("{:?}", notification);
/// }
/// ```
pub struct A2dpManager {
    mailbox: MailboxSender,
    snapshot: Arc<RwLock<ConnectionSnapshot>>,
    notifier: Arc<NotificationBroadcaster>,
    registry: Arc<dyn DeviceRegistry>,
    config: ManagerConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl A2dpManager {
    pub fn builder() -> A2dpManagerBuilder {
        A2dpManagerBuilder::default()
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Request an outgoing connection
    ///
    /// Fails immediately if the stored priority of `device` is `Off`. Any
    /// other outcome is reported through notifications.
    pub fn connect(&self, device: DeviceAddress) -> Result<()> {
        if self.registry.priority(&device) == Priority::Off {
            tracing::warn!("Refusing connect to {}: priority is off", device);
            return Err(A2dpError::ConnectionRefused(device));
        }
        self.post(Message::Connect(device))
    }

    /// Request disconnection of a connected or connecting device
    pub fn disconnect(&self, device: DeviceAddress) -> Result<()> {
        self.post(Message::Disconnect(device))
    }

    /// Stop the worker
    ///
    /// Connections still being negotiated are torn down and reported as
    /// disconnected. Called automatically on drop; calling it again is a
    /// no-op.
    pub fn shutdown(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };

        if self.mailbox.send(Message::Shutdown).is_err() {
            tracing::debug!("Connection worker already gone");
        }

        worker
            .join()
            .map_err(|_| A2dpError::ShutdownFailed("connection worker panicked".to_string()))?;

        info!("A2dpManager shut down");
        Ok(())
    }

    /// Handle for the native event thread to report stack events
    pub fn stack_sender(&self) -> StackEventSender {
        StackEventSender {
            mailbox: self.mailbox.clone(),
        }
    }

    /// Subscribe to connection, audio and config notifications
    pub fn subscribe(&self) -> NotificationIterator {
        self.notifier.subscribe()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Copy of the most recently published state
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.read().clone()
    }

    pub fn machine_state(&self) -> MachineState {
        self.snapshot.read().state
    }

    pub fn connection_state(&self, device: &DeviceAddress) -> ConnectionState {
        self.snapshot.read().connection_state(device)
    }

    /// Connected devices, oldest admission first
    pub fn connected_devices(&self) -> Vec<DeviceAddress> {
        self.snapshot.read().connected.clone()
    }

    pub fn is_playing(&self, device: &DeviceAddress) -> bool {
        self.snapshot.read().is_playing(device)
    }

    pub fn playing_devices(&self) -> Vec<DeviceAddress> {
        self.snapshot.read().playing_devices()
    }

    pub fn is_any_playing(&self) -> bool {
        self.snapshot.read().is_any_playing()
    }

    /// More than one connected device is streaming
    pub fn is_multicast_active(&self) -> bool {
        self.snapshot.read().is_multicast_active()
    }

    /// Most recently admitted connected device
    pub fn primary_device(&self) -> Option<DeviceAddress> {
        self.snapshot.read().primary_device()
    }

    pub fn audio_config(&self, device: &DeviceAddress) -> Option<AudioConfig> {
        self.snapshot.read().audio_config(device)
    }

    /// Devices in any of `states`
    ///
    /// Bonded devices with no connection are reported as `Disconnected`.
    pub fn devices_matching_states(&self, states: &[ConnectionState]) -> Vec<DeviceAddress> {
        let snapshot = self.snapshot.read();
        let mut devices = snapshot.devices_matching_states(states);

        if states.contains(&ConnectionState::Disconnected) {
            for device in self.registry.bonded_devices() {
                if !devices.contains(&device)
                    && snapshot.connection_state(&device) == ConnectionState::Disconnected
                {
                    devices.push(device);
                }
            }
        }

        devices
    }

    // ========================================================================
    // Registry passthrough
    // ========================================================================

    pub fn priority(&self, device: &DeviceAddress) -> Priority {
        self.registry.priority(device)
    }

    pub fn set_priority(&self, device: &DeviceAddress, priority: Priority) {
        self.registry.set_priority(device, priority);
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn post(&self, message: Message) -> Result<()> {
        self.mailbox
            .send(message)
            .map_err(|_| A2dpError::WorkerDisconnected)
    }
}

impl Drop for A2dpManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Error during A2dpManager drop: {}", e);
        }
    }
}

// ============================================================================
// StackEventSender
// ============================================================================

/// Cloneable handle used by the native event thread
///
/// Sending only enqueues; it never blocks on the connection worker.
#[derive(Debug, Clone)]
pub struct StackEventSender {
    mailbox: MailboxSender,
}

impl StackEventSender {
    pub fn send(&self, event: StackEvent) -> Result<()> {
        self.mailbox
            .send(Message::Stack(event))
            .map_err(|_| A2dpError::WorkerDisconnected)
    }

    pub fn connection_state_changed(
        &self,
        device: DeviceAddress,
        state: ConnectionState,
    ) -> Result<()> {
        self.send(StackEvent::connection(device, state))
    }

    pub fn audio_state_changed(&self, device: DeviceAddress, state: AudioState) -> Result<()> {
        self.send(StackEvent::audio(device, state))
    }

    pub fn audio_config_changed(&self, device: DeviceAddress, config: AudioConfig) -> Result<()> {
        self.send(StackEvent::AudioConfigChanged { device, config })
    }

    pub fn check_connection_priority(&self, device: DeviceAddress) -> Result<()> {
        self.send(StackEvent::CheckConnectionPriority { device })
    }
}

// ============================================================================
// A2dpManagerBuilder
// ============================================================================

/// Builder for [`A2dpManager`]
#[derive(Default)]
pub struct A2dpManagerBuilder {
    config: ManagerConfig,
    gateway: Option<Arc<dyn LowerStackGateway>>,
    registry: Option<Arc<dyn DeviceRegistry>>,
}

impl A2dpManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = max_connections;
        self
    }

    pub fn quiet_mode(mut self, quiet_mode: bool) -> Self {
        self.config.quiet_mode = quiet_mode;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Gateway to the lower stack (required)
    pub fn gateway<G: LowerStackGateway + 'static>(mut self, gateway: G) -> Self {
        self.gateway = Some(Arc::new(gateway) as Arc<dyn LowerStackGateway>);
        self
    }

    /// Gateway already shared with other components
    pub fn shared_gateway(mut self, gateway: Arc<dyn LowerStackGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Source of priorities and bond state
    ///
    /// Defaults to an empty [`InMemoryDeviceRegistry`].
    pub fn registry<R: DeviceRegistry + 'static>(mut self, registry: Arc<R>) -> Self {
        self.registry = Some(registry as Arc<dyn DeviceRegistry>);
        self
    }

    /// Validate the configuration and start the connection worker
    pub fn build(self) -> Result<A2dpManager> {
        self.config.validate()?;
        let gateway = self.gateway.ok_or(A2dpError::MissingGateway)?;
        let registry: Arc<dyn DeviceRegistry> = self
            .registry
            .unwrap_or_else(|| Arc::new(InMemoryDeviceRegistry::new()) as Arc<dyn DeviceRegistry>);

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(NotificationBroadcaster::new());
        let snapshot = Arc::new(RwLock::new(ConnectionSnapshot::default()));

        let worker = spawn_connection_worker(WorkerParts {
            config: self.config.clone(),
            policy: AdmissionPolicy::new(Arc::clone(&registry), self.config.quiet_mode),
            gateway,
            notifier: Arc::clone(&notifier),
            snapshot: Arc::clone(&snapshot),
            mailbox_tx: mailbox_tx.clone(),
            mailbox_rx,
        })?;

        info!(
            "A2dpManager started (max_connections={}, quiet_mode={})",
            self.config.max_connections, self.config.quiet_mode
        );

        Ok(A2dpManager {
            mailbox: mailbox_tx,
            snapshot,
            notifier,
            registry,
            config: self.config,
            worker: Mutex::new(Some(worker)),
        })
    }
}
