//! Multicast Connection Demo
//!
//! Drives an `A2dpManager` against a scripted lower stack that answers every
//! request immediately, the way a cooperative headset would. Shows outgoing
//! connects, eviction of the oldest sink at capacity, playback tracking and
//! an unsolicited incoming connection.
//!
//! Run with: `cargo run -p a2dp-state --example multicast_demo`

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use a2dp_state::logging::{init_logging, LoggingMode};
use a2dp_state::{
    A2dpManager, AudioState, ConnectionState, DeviceAddress, InMemoryDeviceRegistry,
    LowerStackGateway, ManagerConfig, Notification, Priority, StackEventSender,
};

/// Lower stack that confirms every request by posting the matching event
struct ScriptedStack {
    events: Arc<OnceLock<StackEventSender>>,
}

impl ScriptedStack {
    fn post(&self, device: &DeviceAddress, state: ConnectionState) -> bool {
        match self.events.get() {
            Some(events) => events.connection_state_changed(*device, state).is_ok(),
            None => false,
        }
    }
}

impl LowerStackGateway for ScriptedStack {
    fn request_connect(&self, device: &DeviceAddress) -> bool {
        println!("   stack: connecting {}", device);
        self.post(device, ConnectionState::Connected)
    }

    fn request_disconnect(&self, device: &DeviceAddress) -> bool {
        println!("   stack: disconnecting {}", device);
        self.post(device, ConnectionState::Disconnected)
    }

    fn notify_connection_rejected(&self, device: &DeviceAddress) {
        println!("   stack: {} rejected, trying other profiles", device);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LoggingMode::Development)?;

    println!("🎧 A2DP Multicast Demo");
    println!("======================\n");

    let speaker: DeviceAddress = "00:1A:7D:DA:71:01".parse()?;
    let earbuds: DeviceAddress = "00:1A:7D:DA:71:02".parse()?;
    let car: DeviceAddress = "00:1A:7D:DA:71:03".parse()?;
    let stranger: DeviceAddress = "00:1A:7D:DA:71:04".parse()?;

    let registry = InMemoryDeviceRegistry::new()
        .with_device(speaker, Priority::On)
        .with_device(earbuds, Priority::On)
        .with_device(car, Priority::AutoConnect);

    let events = Arc::new(OnceLock::new());
    let manager = A2dpManager::builder()
        .config(ManagerConfig::multicast())
        .gateway(ScriptedStack {
            events: events.clone(),
        })
        .registry(Arc::new(registry))
        .build()?;
    let stack = manager.stack_sender();
    events
        .set(stack.clone())
        .map_err(|_| "stack sender already installed")?;

    let notifications = manager.subscribe();
    let print_changes = || {
        for notification in notifications.timeout_iter(Duration::from_millis(100)) {
            match notification {
                Notification::ConnectionStateChanged { device, old, new } => {
                    println!("   📡 {}: {:?} -> {:?}", device, old, new)
                }
                Notification::AudioStateChanged { device, new, .. } => {
                    println!("   🔊 {}: {:?}", device, new)
                }
                Notification::AudioConfigChanged { device, config } => {
                    println!("   ⚙️  {}: {:?}", device, config)
                }
            }
        }
    };

    println!("🚀 Connecting speaker and earbuds");
    manager.connect(speaker)?;
    manager.connect(earbuds)?;
    print_changes();
    println!(
        "   connected={:?} primary={:?} multicast={}\n",
        manager.connected_devices(),
        manager.primary_device(),
        manager.is_multicast_active()
    );

    println!("🚀 Playing on the earbuds");
    stack.audio_state_changed(earbuds, AudioState::Started)?;
    print_changes();
    println!("   playing={:?}\n", manager.playing_devices());

    println!("🚀 Connecting the car at capacity (evicts the oldest sink)");
    manager.connect(car)?;
    print_changes();
    println!("   connected={:?}\n", manager.connected_devices());

    println!("🚀 Unbonded device tries to connect on its own");
    stack.connection_state_changed(stranger, ConnectionState::Connecting)?;
    print_changes();
    println!("   state={}\n", manager.machine_state());

    manager.shutdown()?;
    println!("✨ Demo completed!");

    Ok(())
}
