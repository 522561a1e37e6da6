//! Connection admission state machine
//!
//! One instance owns every role slot (connected members, the outgoing
//! target, the incoming peer, the member being torn down) and processes
//! [`Message`]s to completion, one at a time. It never blocks: all gateway
//! calls return immediately and their outcome arrives later as a stack event.
//!
//! The top-level [`MachineState`] is derived from the slots after each step.
//! Local connect/disconnect requests that arrive while an operation is in
//! flight are queued and replayed in order once the machine is stable again.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use a2dp_stack::{
    AudioConfig, AudioState, ConnectionState, DeviceAddress, LowerStackGateway, PlayState,
    StackEvent,
};

use crate::admission::AdmissionPolicy;
use crate::config::ManagerConfig;
use crate::message::Message;
use crate::notify::NotificationBroadcaster;
use crate::snapshot::{ConnectionSnapshot, MachineState};
use crate::timeout::ConnectTimer;

use ConnectionState::{Connected, Connecting, Disconnected, Disconnecting};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetPhase {
    /// Waiting for the evicted member to confirm its disconnect
    AwaitingEviction(DeviceAddress),
    /// `request_connect` accepted by the lower stack
    ConnectIssued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Target {
    device: DeviceAddress,
    phase: TargetPhase,
}

/// Single-threaded connection state machine
pub struct ConnectionStateMachine<T: ConnectTimer> {
    max_connections: usize,
    connect_timeout: Duration,
    policy: AdmissionPolicy,
    gateway: Arc<dyn LowerStackGateway>,
    notifier: Arc<NotificationBroadcaster>,
    timer: T,

    connected: Vec<DeviceAddress>,
    primary: Option<DeviceAddress>,
    target: Option<Target>,
    incoming: Option<DeviceAddress>,
    disconnecting: Option<DeviceAddress>,
    playing: BTreeSet<DeviceAddress>,
    audio_configs: BTreeMap<DeviceAddress, AudioConfig>,

    deferred: VecDeque<Message>,
    stopped: bool,
}

impl<T: ConnectTimer> ConnectionStateMachine<T> {
    pub fn new(
        config: &ManagerConfig,
        policy: AdmissionPolicy,
        gateway: Arc<dyn LowerStackGateway>,
        notifier: Arc<NotificationBroadcaster>,
        timer: T,
    ) -> Self {
        Self {
            max_connections: config.max_connections,
            connect_timeout: config.connect_timeout,
            policy,
            gateway,
            notifier,
            timer,
            connected: Vec::new(),
            primary: None,
            target: None,
            incoming: None,
            disconnecting: None,
            playing: BTreeSet::new(),
            audio_configs: BTreeMap::new(),
            deferred: VecDeque::new(),
            stopped: false,
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn state(&self) -> MachineState {
        let pending =
            self.target.is_some() || self.incoming.is_some() || self.disconnecting.is_some();
        let stable_member = self
            .connected
            .iter()
            .any(|d| self.disconnecting.as_ref() != Some(d));

        match (pending, stable_member) {
            (false, _) if self.connected.is_empty() => MachineState::Idle,
            (false, _) => MachineState::Connected,
            (true, false) => MachineState::Pending,
            (true, true) => MachineState::AdmissionPending,
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state(),
            connected: self.connected.clone(),
            primary: self.primary,
            target: self.target.map(|t| t.device),
            incoming: self.incoming,
            disconnecting: self.disconnecting,
            playing: self.playing.clone(),
            audio_configs: self.audio_configs.clone(),
        }
    }

    /// Number of requests waiting for the machine to become stable
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Process one message to completion, then replay deferred requests
    /// while the machine is stable
    pub fn handle(&mut self, message: Message) {
        if self.stopped {
            tracing::debug!("Ignoring {:?}: state machine stopped", message);
            return;
        }

        let before = self.state();
        self.process(message);

        while !self.stopped && self.state().is_stable() {
            let Some(next) = self.deferred.pop_front() else {
                break;
            };
            tracing::debug!("Replaying deferred {:?}", next);
            self.process(next);
        }

        let after = self.state();
        if before != after {
            tracing::debug!("Machine state {} -> {}", before, after);
        }
    }

    fn process(&mut self, message: Message) {
        match message {
            Message::Connect(device) => self.on_connect(device),
            Message::Disconnect(device) => self.on_disconnect(device),
            Message::Stack(event) => self.on_stack_event(event),
            Message::Timeout { device, generation } => self.on_timeout(device, generation),
            Message::Shutdown => self.on_shutdown(),
        }
    }

    // ========================================================================
    // Local requests
    // ========================================================================

    fn on_connect(&mut self, device: DeviceAddress) {
        if self.is_stable_member(&device) || self.is_in_flight(&device) {
            tracing::debug!("Connect({}) ignored: already connected or connecting", device);
            return;
        }

        if !self.state().is_stable() {
            self.defer(device, Message::Connect(device));
            return;
        }

        self.notify_connection(device, Disconnected, Connecting);

        if self.has_room() {
            if self.gateway.request_connect(&device) {
                self.target = Some(Target {
                    device,
                    phase: TargetPhase::ConnectIssued,
                });
                self.timer.start(device, self.connect_timeout);
            } else {
                tracing::warn!("Lower stack refused connect to {}", device);
                self.notify_connection(device, Connecting, Disconnected);
            }
            return;
        }

        let Some(victim) = self.connected.first().copied() else {
            tracing::error!("No room for {} but nothing connected to evict", device);
            self.notify_connection(device, Connecting, Disconnected);
            return;
        };

        if !self.gateway.request_disconnect(&victim) {
            tracing::warn!("Lower stack refused to evict {} for {}", victim, device);
            self.notify_connection(device, Connecting, Disconnected);
            return;
        }

        tracing::info!("Evicting {} to admit {}", victim, device);
        self.notify_connection(victim, Connected, Disconnecting);
        self.stop_audio(&victim);
        self.disconnecting = Some(victim);
        self.timer.start(victim, self.connect_timeout);
        self.target = Some(Target {
            device,
            phase: TargetPhase::AwaitingEviction(victim),
        });
        self.timer.start(device, self.connect_timeout);
    }

    fn on_disconnect(&mut self, device: DeviceAddress) {
        if self.disconnecting == Some(device) {
            tracing::debug!("Disconnect({}) ignored: already disconnecting", device);
            return;
        }

        if let Some(target) = self.target {
            if target.device == device && matches!(target.phase, TargetPhase::AwaitingEviction(_)) {
                tracing::info!("Connect to {} cancelled before it was issued", device);
                self.fail_target();
                return;
            }
        }

        if !self.connected.contains(&device) && !self.is_in_flight(&device) {
            tracing::debug!("Disconnect({}) ignored: not connected", device);
            return;
        }

        if !self.state().is_stable() {
            self.defer(device, Message::Disconnect(device));
            return;
        }

        self.notify_connection(device, Connected, Disconnecting);
        if self.gateway.request_disconnect(&device) {
            self.disconnecting = Some(device);
            self.timer.start(device, self.connect_timeout);
            self.stop_audio(&device);
        } else {
            tracing::warn!("Lower stack refused disconnect of {}", device);
            self.notify_connection(device, Disconnecting, Connected);
        }
    }

    // ========================================================================
    // Stack events
    // ========================================================================

    fn on_stack_event(&mut self, event: StackEvent) {
        match event {
            StackEvent::ConnectionStateChanged { device, state } => match state {
                Disconnected => self.on_stack_disconnected(device),
                Connecting => self.on_stack_connecting(device),
                Connected => self.on_stack_connected(device),
                Disconnecting => {
                    tracing::debug!("{} reported disconnecting", device);
                }
            },
            StackEvent::AudioStateChanged { device, state } => self.on_audio_state(device, state),
            StackEvent::AudioConfigChanged { device, config } => {
                self.on_audio_config(device, config)
            }
            StackEvent::CheckConnectionPriority { device } => {
                let initiated_locally = self.target.map(|t| t.device) == Some(device);
                let allowed = self.policy.allow(&device, initiated_locally);
                tracing::debug!("Connection priority check for {}: {}", device, allowed);
                self.gateway.allow_connection(&device, allowed);
            }
        }
    }

    fn on_stack_disconnected(&mut self, device: DeviceAddress) {
        if self.disconnecting == Some(device) {
            self.disconnecting = None;
            self.timer.cancel(&device);
            self.remove_member(device, Disconnecting);

            if let Some(target) = self.target {
                if target.phase == TargetPhase::AwaitingEviction(device) {
                    self.issue_deferred_connect(target.device);
                }
            }
            return;
        }

        if self.connected.contains(&device) {
            tracing::info!("{} dropped by remote", device);
            self.remove_member(device, Connected);
            return;
        }

        if self.target.map(|t| t.device) == Some(device) {
            tracing::info!("Outgoing connection to {} failed", device);
            self.fail_target();
            return;
        }

        if self.incoming == Some(device) {
            tracing::info!("Incoming connection from {} failed", device);
            self.incoming = None;
            self.timer.cancel(&device);
            self.audio_configs.remove(&device);
            self.notify_connection(device, Connecting, Disconnected);
            return;
        }

        tracing::warn!("Disconnected event for unknown device {}", device);
    }

    fn on_stack_connecting(&mut self, device: DeviceAddress) {
        if self.connected.contains(&device) || self.is_in_flight(&device) {
            tracing::debug!("{} reported connecting", device);
            return;
        }

        if self.incoming.is_none() && self.has_room() && self.policy.allow(&device, false) {
            tracing::info!("Accepting incoming connection from {}", device);
            self.incoming = Some(device);
            self.notify_connection(device, Disconnected, Connecting);
            self.timer.start(device, self.connect_timeout);
        } else {
            tracing::warn!("Rejecting incoming connection from {}", device);
            self.reject(device);
        }
    }

    fn on_stack_connected(&mut self, device: DeviceAddress) {
        if self.target.map(|t| t.device) == Some(device) {
            if self.connected.len() < self.max_connections {
                self.target = None;
                self.timer.cancel(&device);
                self.admit(device, Connecting);
            } else {
                // connected on its own before the eviction finished
                tracing::warn!("{} connected before a slot was free", device);
                self.gateway.request_disconnect(&device);
                self.fail_target();
            }
            return;
        }

        if self.incoming == Some(device) {
            if self.policy.allow(&device, false) && self.connected.len() < self.max_connections {
                self.incoming = None;
                self.timer.cancel(&device);
                self.admit(device, Connecting);
            } else {
                tracing::warn!("Incoming {} no longer allowed, disconnecting", device);
                self.gateway.request_disconnect(&device);
            }
            return;
        }

        if self.disconnecting == Some(device) {
            tracing::warn!("Disconnect of {} failed, still connected", device);
            self.disconnecting = None;
            self.timer.cancel(&device);
            self.notify_connection(device, Disconnecting, Connected);

            if let Some(target) = self.target {
                if target.phase == TargetPhase::AwaitingEviction(device) {
                    self.fail_target();
                }
            }
            return;
        }

        if self.connected.contains(&device) {
            tracing::debug!("Duplicate connected event for {}", device);
            return;
        }

        if self.policy.allow(&device, false) && self.has_room() {
            tracing::warn!("Admitting {} connected without a pending request", device);
            self.admit(device, Disconnected);
        } else {
            tracing::warn!("Rejecting unsolicited connection from {}", device);
            self.reject(device);
        }
    }

    fn on_audio_state(&mut self, device: DeviceAddress, state: AudioState) {
        if !self.connected.contains(&device) {
            tracing::debug!("Audio state {:?} for non-member {} ignored", state, device);
            return;
        }

        match PlayState::from(state) {
            PlayState::Playing => {
                if self.playing.insert(device) {
                    self.notifier
                        .audio_state_changed(device, PlayState::NotPlaying, PlayState::Playing);
                }
            }
            PlayState::NotPlaying => self.stop_audio(&device),
        }
    }

    fn on_audio_config(&mut self, device: DeviceAddress, config: AudioConfig) {
        if !self.connected.contains(&device) && !self.is_in_flight(&device) {
            tracing::debug!("Audio config for unknown device {} ignored", device);
            return;
        }

        if self.audio_configs.insert(device, config) != Some(config) {
            self.notifier.audio_config_changed(device, config);
        }
    }

    // ========================================================================
    // Timeouts and shutdown
    // ========================================================================

    fn on_timeout(&mut self, device: DeviceAddress, generation: u64) {
        if !self.timer.claim(&device, generation) {
            tracing::trace!("Stale timer for {} (generation {})", device, generation);
            return;
        }

        match self.target {
            Some(target) if target.device == device => match target.phase {
                TargetPhase::AwaitingEviction(victim) => {
                    tracing::warn!("Timed out waiting for {} to make room for {}", victim, device);
                    self.fail_target();
                    self.settle_disconnect(victim);
                }
                TargetPhase::ConnectIssued => {
                    tracing::warn!("Connect to {} timed out", device);
                    self.gateway.request_disconnect(&device);
                    self.on_stack_disconnected(device);
                }
            },
            _ if self.incoming == Some(device) => {
                tracing::warn!("Incoming connection from {} timed out", device);
                self.gateway.request_disconnect(&device);
                self.on_stack_disconnected(device);
            }
            _ if self.disconnecting == Some(device) => {
                tracing::warn!("Disconnect of {} was never confirmed", device);
                self.on_stack_disconnected(device);
            }
            _ => tracing::debug!("Timer fired for {} with nothing pending", device),
        }
    }

    fn on_shutdown(&mut self) {
        tracing::info!("Connection state machine shutting down");

        if let Some(target) = self.target.take() {
            if target.phase == TargetPhase::ConnectIssued {
                self.gateway.request_disconnect(&target.device);
            }
            self.audio_configs.remove(&target.device);
            self.notify_connection(target.device, Connecting, Disconnected);
        }

        if let Some(device) = self.incoming.take() {
            self.gateway.request_disconnect(&device);
            self.audio_configs.remove(&device);
            self.notify_connection(device, Connecting, Disconnected);
        }

        self.timer.cancel_all();

        if !self.deferred.is_empty() {
            tracing::info!("Dropping {} deferred request(s)", self.deferred.len());
            self.deferred.clear();
        }

        self.stopped = true;
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn is_stable_member(&self, device: &DeviceAddress) -> bool {
        self.connected.contains(device) && self.disconnecting.as_ref() != Some(device)
    }

    fn is_in_flight(&self, device: &DeviceAddress) -> bool {
        self.target.map(|t| t.device).as_ref() == Some(device)
            || self.incoming.as_ref() == Some(device)
    }

    /// Capacity check counting reserved target and incoming slots
    fn has_room(&self) -> bool {
        let reserved = usize::from(self.target.is_some()) + usize::from(self.incoming.is_some());
        self.connected.len() + reserved < self.max_connections
    }

    fn admit(&mut self, device: DeviceAddress, from: ConnectionState) {
        self.connected.push(device);
        self.primary = Some(device);
        tracing::info!(
            "{} connected ({}/{})",
            device,
            self.connected.len(),
            self.max_connections
        );
        self.notify_connection(device, from, Connected);
    }

    fn remove_member(&mut self, device: DeviceAddress, from: ConnectionState) {
        self.connected.retain(|d| *d != device);
        self.stop_audio(&device);
        self.audio_configs.remove(&device);
        self.notify_connection(device, from, Disconnected);

        if self.primary == Some(device) {
            let newest_stable = self
                .connected
                .iter()
                .rev()
                .find(|d| self.disconnecting.as_ref() != Some(*d))
                .copied();
            // a member on its way out only holds the role silently
            self.primary = newest_stable.or_else(|| self.connected.last().copied());
            if let Some(primary) = newest_stable {
                tracing::info!("{} is now the primary device", primary);
                self.notify_connection(primary, Disconnected, Connected);
            }
        }
    }

    /// Queue a request until the machine is stable, collapsing a repeat of
    /// the latest request already queued for the same device
    fn defer(&mut self, device: DeviceAddress, message: Message) {
        let latest = self.deferred.iter().rev().find(|queued| match queued {
            Message::Connect(d) | Message::Disconnect(d) => *d == device,
            _ => false,
        });
        if latest == Some(&message) {
            tracing::debug!("{:?} already deferred", message);
            return;
        }

        tracing::debug!("{:?} deferred in state {}", message, self.state());
        self.deferred.push_back(message);
    }

    /// Treat an unconfirmed disconnect as done
    fn settle_disconnect(&mut self, device: DeviceAddress) {
        if self.disconnecting == Some(device) {
            self.timer.cancel(&device);
            self.on_stack_disconnected(device);
        }
    }

    /// Victim gone: issue the connect the target has been waiting for
    fn issue_deferred_connect(&mut self, device: DeviceAddress) {
        if self.gateway.request_connect(&device) {
            self.target = Some(Target {
                device,
                phase: TargetPhase::ConnectIssued,
            });
            self.timer.start(device, self.connect_timeout);
        } else {
            tracing::warn!("Lower stack refused connect to {}", device);
            self.fail_target();
        }
    }

    fn fail_target(&mut self) {
        if let Some(target) = self.target.take() {
            self.timer.cancel(&target.device);
            self.audio_configs.remove(&target.device);
            self.notify_connection(target.device, Connecting, Disconnected);
        }
    }

    fn reject(&self, device: DeviceAddress) {
        self.gateway.request_disconnect(&device);
        self.gateway.notify_connection_rejected(&device);
    }

    fn stop_audio(&mut self, device: &DeviceAddress) {
        if self.playing.remove(device) {
            self.notifier
                .audio_state_changed(*device, PlayState::Playing, PlayState::NotPlaying);
        }
    }

    fn notify_connection(&self, device: DeviceAddress, old: ConnectionState, new: ConnectionState) {
        self.notifier.connection_state_changed(device, old, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Notification, NotificationIterator};
    use crate::registry::{DeviceRegistry, InMemoryDeviceRegistry};
    use a2dp_stack::testing::{GatewayCall, RecordingGateway};
    use a2dp_stack::Priority;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeTimer {
        armed: HashMap<DeviceAddress, u64>,
        next: u64,
    }

    impl FakeTimer {
        fn generation(&self, device: &DeviceAddress) -> Option<u64> {
            self.armed.get(device).copied()
        }

        fn is_armed(&self, device: &DeviceAddress) -> bool {
            self.armed.contains_key(device)
        }
    }

    impl ConnectTimer for FakeTimer {
        fn start(&mut self, device: DeviceAddress, _duration: Duration) {
            self.next += 1;
            self.armed.insert(device, self.next);
        }

        fn cancel(&mut self, device: &DeviceAddress) {
            self.armed.remove(device);
        }

        fn cancel_all(&mut self) {
            self.armed.clear();
        }

        fn claim(&mut self, device: &DeviceAddress, generation: u64) -> bool {
            if self.armed.get(device) == Some(&generation) {
                self.armed.remove(device);
                true
            } else {
                false
            }
        }
    }

    fn addr(n: u8) -> DeviceAddress {
        DeviceAddress::new([0x00, 0x1A, 0x7D, 0x00, 0x00, n])
    }

    struct Harness {
        machine: ConnectionStateMachine<FakeTimer>,
        gateway: RecordingGateway,
        registry: Arc<InMemoryDeviceRegistry>,
        events: NotificationIterator,
    }

    impl Harness {
        fn new(max_connections: usize) -> Self {
            Self::with_config(ManagerConfig::new().with_max_connections(max_connections))
        }

        fn with_config(config: ManagerConfig) -> Self {
            let registry = Arc::new(InMemoryDeviceRegistry::new());
            for n in 1..=5 {
                registry.set_bonded(addr(n), true);
                registry.set_priority(&addr(n), Priority::On);
            }
            let gateway = RecordingGateway::new();
            let notifier = Arc::new(NotificationBroadcaster::new());
            let events = notifier.subscribe();
            let policy = AdmissionPolicy::new(registry.clone(), config.quiet_mode);
            let machine = ConnectionStateMachine::new(
                &config,
                policy,
                Arc::new(gateway.clone()),
                notifier,
                FakeTimer::default(),
            );
            Self {
                machine,
                gateway,
                registry,
                events,
            }
        }

        fn connect(&mut self, n: u8) {
            self.machine.handle(Message::Connect(addr(n)));
        }

        fn disconnect(&mut self, n: u8) {
            self.machine.handle(Message::Disconnect(addr(n)));
        }

        fn stack(&mut self, n: u8, state: ConnectionState) {
            self.machine
                .handle(StackEvent::connection(addr(n), state).into());
        }

        fn audio(&mut self, n: u8, state: AudioState) {
            self.machine.handle(StackEvent::audio(addr(n), state).into());
        }

        /// Connect `n` through the whole outgoing handshake
        fn establish(&mut self, n: u8) {
            self.connect(n);
            self.stack(n, Connected);
        }

        fn fire_timer(&mut self, n: u8) {
            let generation = self
                .machine
                .timer()
                .generation(&addr(n))
                .expect("timer armed");
            self.machine.handle(Message::Timeout {
                device: addr(n),
                generation,
            });
        }

        fn changes(&self) -> Vec<(DeviceAddress, ConnectionState, ConnectionState)> {
            self.events
                .try_iter()
                .filter_map(|n| match n {
                    Notification::ConnectionStateChanged { device, old, new } => {
                        Some((device, old, new))
                    }
                    _ => None,
                })
                .collect()
        }

        fn notifications(&self) -> Vec<Notification> {
            self.events.try_iter().collect()
        }

        fn reset(&self) {
            self.gateway.take_calls();
            self.events.try_iter().for_each(drop);
        }

        fn state(&self) -> MachineState {
            self.machine.state()
        }

        fn connected(&self) -> Vec<DeviceAddress> {
            self.machine.snapshot().connected
        }
    }

    // ------------------------------------------------------------------------
    // Outgoing connections
    // ------------------------------------------------------------------------

    #[test]
    fn test_connect_from_idle() {
        let mut h = Harness::new(1);

        h.connect(1);
        assert_eq!(h.state(), MachineState::Pending);
        assert_eq!(h.gateway.calls(), vec![GatewayCall::Connect(addr(1))]);
        assert!(h.machine.timer().is_armed(&addr(1)));
        assert_eq!(h.changes(), vec![(addr(1), Disconnected, Connecting)]);

        h.stack(1, Connected);
        assert_eq!(h.state(), MachineState::Connected);
        assert_eq!(h.connected(), vec![addr(1)]);
        assert_eq!(h.machine.snapshot().primary, Some(addr(1)));
        assert!(!h.machine.timer().is_armed(&addr(1)));
        assert_eq!(h.changes(), vec![(addr(1), Connecting, Connected)]);
    }

    #[test]
    fn test_gateway_refusal_rolls_back() {
        let mut h = Harness::new(1);
        h.gateway.refuse_connect(addr(1));

        h.connect(1);

        assert_eq!(h.state(), MachineState::Idle);
        assert_eq!(h.machine.snapshot(), ConnectionSnapshot::default());
        assert!(!h.machine.timer().is_armed(&addr(1)));
        assert_eq!(
            h.changes(),
            vec![
                (addr(1), Disconnected, Connecting),
                (addr(1), Connecting, Disconnected)
            ]
        );
    }

    #[test]
    fn test_duplicate_connect_is_noop() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.connect(2);
        h.reset();

        h.connect(1);
        h.connect(2);

        assert!(h.gateway.calls().is_empty());
        assert!(h.notifications().is_empty());
        assert_eq!(h.machine.deferred_len(), 0);
    }

    #[test]
    fn test_second_device_connects_while_room() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.reset();

        h.connect(2);
        assert_eq!(h.state(), MachineState::AdmissionPending);
        assert_eq!(h.gateway.connect_requests(), vec![addr(2)]);

        h.stack(2, Connected);
        assert_eq!(h.connected(), vec![addr(1), addr(2)]);
        assert_eq!(h.machine.snapshot().primary, Some(addr(2)));
        assert_eq!(h.state(), MachineState::Connected);
    }

    #[test]
    fn test_requests_while_pending_replay_in_order() {
        let mut h = Harness::new(3);

        h.connect(1);
        h.connect(2);
        h.connect(3);
        assert_eq!(h.machine.deferred_len(), 2);
        assert_eq!(h.gateway.connect_requests(), vec![addr(1)]);

        h.stack(1, Connected);
        assert_eq!(h.gateway.connect_requests(), vec![addr(1), addr(2)]);
        assert_eq!(h.machine.deferred_len(), 1);

        h.stack(2, Connected);
        assert_eq!(h.gateway.connect_requests(), vec![addr(1), addr(2), addr(3)]);
        assert_eq!(h.machine.deferred_len(), 0);

        h.stack(3, Connected);
        assert_eq!(h.connected(), vec![addr(1), addr(2), addr(3)]);
    }

    // ------------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------------

    #[test]
    fn test_eviction_is_serialized_before_connect() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.audio(1, AudioState::Started);
        h.reset();

        h.connect(2);
        assert_eq!(h.gateway.calls(), vec![GatewayCall::Disconnect(addr(1))]);
        assert_eq!(h.state(), MachineState::Pending);
        assert!(h.machine.timer().is_armed(&addr(2)));
        assert_eq!(
            h.notifications(),
            vec![
                Notification::ConnectionStateChanged {
                    device: addr(2),
                    old: Disconnected,
                    new: Connecting
                },
                Notification::ConnectionStateChanged {
                    device: addr(1),
                    old: Connected,
                    new: Disconnecting
                },
                Notification::AudioStateChanged {
                    device: addr(1),
                    old: PlayState::Playing,
                    new: PlayState::NotPlaying
                },
            ]
        );

        h.stack(1, Disconnected);
        assert_eq!(
            h.gateway.calls(),
            vec![GatewayCall::Disconnect(addr(1)), GatewayCall::Connect(addr(2))]
        );
        assert_eq!(h.changes(), vec![(addr(1), Disconnecting, Disconnected)]);
        assert!(h.connected().is_empty());

        h.stack(2, Connected);
        assert_eq!(h.connected(), vec![addr(2)]);
        assert_eq!(h.changes(), vec![(addr(2), Connecting, Connected)]);
    }

    #[test]
    fn test_eviction_picks_oldest_member() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.establish(2);
        h.reset();

        h.connect(3);
        assert_eq!(h.gateway.disconnect_requests(), vec![addr(1)]);
        assert_eq!(h.state(), MachineState::AdmissionPending);

        h.stack(1, Disconnected);
        h.stack(3, Connected);
        assert_eq!(h.connected(), vec![addr(2), addr(3)]);
    }

    #[test]
    fn test_eviction_refused_rolls_back() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.gateway.refuse_disconnect(addr(1));
        h.reset();

        h.connect(2);

        assert_eq!(h.state(), MachineState::Connected);
        assert_eq!(h.connected(), vec![addr(1)]);
        assert!(!h.machine.timer().is_armed(&addr(2)));
        assert_eq!(
            h.changes(),
            vec![
                (addr(2), Disconnected, Connecting),
                (addr(2), Connecting, Disconnected)
            ]
        );
    }

    #[test]
    fn test_disconnect_cancels_target_awaiting_eviction() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.connect(2);
        h.reset();

        h.disconnect(2);
        assert_eq!(h.changes(), vec![(addr(2), Connecting, Disconnected)]);
        assert!(!h.machine.timer().is_armed(&addr(2)));

        h.stack(1, Disconnected);
        assert!(h.gateway.connect_requests().is_empty());
        assert_eq!(h.state(), MachineState::Idle);
    }

    #[test]
    fn test_failed_eviction_fails_target() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.connect(2);
        h.reset();

        // victim reports connected again: its disconnect did not happen
        h.stack(1, Connected);

        assert_eq!(
            h.changes(),
            vec![
                (addr(1), Disconnecting, Connected),
                (addr(2), Connecting, Disconnected)
            ]
        );
        assert_eq!(h.connected(), vec![addr(1)]);
        assert_eq!(h.state(), MachineState::Connected);
        assert!(h.gateway.connect_requests().is_empty());
    }

    #[test]
    fn test_connect_refused_after_eviction() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.gateway.refuse_connect(addr(2));
        h.connect(2);
        h.reset();

        h.stack(1, Disconnected);

        assert_eq!(
            h.changes(),
            vec![
                (addr(1), Disconnecting, Disconnected),
                (addr(2), Connecting, Disconnected)
            ]
        );
        assert_eq!(h.state(), MachineState::Idle);
    }

    // ------------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------------

    #[test]
    fn test_local_disconnect() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.audio(1, AudioState::Started);
        h.reset();

        h.disconnect(1);
        assert_eq!(h.gateway.disconnect_requests(), vec![addr(1)]);
        assert_eq!(h.state(), MachineState::Pending);
        assert!(!h.machine.snapshot().is_playing(&addr(1)));

        h.disconnect(1);
        assert_eq!(h.gateway.disconnect_requests(), vec![addr(1)]);

        h.stack(1, Disconnected);
        assert_eq!(h.state(), MachineState::Idle);
        assert_eq!(h.machine.snapshot().primary, None);
        assert_eq!(
            h.changes(),
            vec![
                (addr(1), Connected, Disconnecting),
                (addr(1), Disconnecting, Disconnected)
            ]
        );
    }

    #[test]
    fn test_disconnect_refused_restores_connected() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.gateway.refuse_disconnect(addr(1));
        h.reset();

        h.disconnect(1);

        assert_eq!(h.state(), MachineState::Connected);
        assert_eq!(
            h.changes(),
            vec![
                (addr(1), Connected, Disconnecting),
                (addr(1), Disconnecting, Connected)
            ]
        );
    }

    #[test]
    fn test_disconnect_unknown_is_noop() {
        let mut h = Harness::new(1);
        h.disconnect(4);
        assert!(h.gateway.calls().is_empty());
        assert!(h.notifications().is_empty());
    }

    #[test]
    fn test_disconnect_while_pending_is_deferred() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.connect(2);
        h.reset();

        h.disconnect(1);
        assert_eq!(h.machine.deferred_len(), 1);
        assert!(h.gateway.disconnect_requests().is_empty());

        h.stack(2, Connected);
        assert_eq!(h.gateway.disconnect_requests(), vec![addr(1)]);
        assert_eq!(h.machine.snapshot().disconnecting, Some(addr(1)));
    }

    #[test]
    fn test_remote_drop_reelects_newest_member() {
        let mut h = Harness::new(3);
        h.establish(1);
        h.establish(2);
        h.establish(3);
        h.reset();

        h.stack(3, Disconnected);

        assert_eq!(h.machine.snapshot().primary, Some(addr(2)));
        assert_eq!(
            h.changes(),
            vec![
                (addr(3), Connected, Disconnected),
                (addr(2), Disconnected, Connected)
            ]
        );

        // non-primary drop keeps the primary
        h.stack(1, Disconnected);
        assert_eq!(h.machine.snapshot().primary, Some(addr(2)));
        assert_eq!(h.changes(), vec![(addr(1), Connected, Disconnected)]);
    }

    #[test]
    fn test_reelection_skips_member_being_disconnected() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.establish(2);
        h.disconnect(1);
        h.reset();

        h.stack(2, Disconnected);
        assert_eq!(h.changes(), vec![(addr(2), Connected, Disconnected)]);
        assert_eq!(h.machine.snapshot().primary, Some(addr(1)));

        h.stack(1, Disconnected);
        assert_eq!(h.machine.snapshot().primary, None);
        assert_eq!(h.state(), MachineState::Idle);
    }

    #[test]
    fn test_local_disconnect_of_primary_reelects() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.establish(2);
        h.reset();

        h.disconnect(2);
        assert_eq!(h.state(), MachineState::AdmissionPending);
        assert_eq!(h.gateway.disconnect_requests(), vec![addr(2)]);

        h.stack(2, Disconnected);

        assert_eq!(
            h.changes(),
            vec![
                (addr(2), Connected, Disconnecting),
                (addr(2), Disconnecting, Disconnected),
                (addr(1), Disconnected, Connected)
            ]
        );
        assert_eq!(h.machine.snapshot().primary, Some(addr(1)));
        assert_eq!(h.connected(), vec![addr(1)]);
        assert_eq!(h.state(), MachineState::Connected);
    }

    #[test]
    fn test_outgoing_failure_reported_by_stack() {
        let mut h = Harness::new(1);
        h.connect(1);
        h.reset();

        h.stack(1, Disconnected);

        assert_eq!(h.state(), MachineState::Idle);
        assert!(!h.machine.timer().is_armed(&addr(1)));
        assert_eq!(h.changes(), vec![(addr(1), Connecting, Disconnected)]);
    }

    #[test]
    fn test_unknown_disconnected_is_ignored() {
        let mut h = Harness::new(1);
        h.stack(4, Disconnected);
        h.stack(4, Disconnecting);
        assert!(h.notifications().is_empty());
        assert_eq!(h.state(), MachineState::Idle);
    }

    // ------------------------------------------------------------------------
    // Incoming connections
    // ------------------------------------------------------------------------

    #[test]
    fn test_incoming_accepted() {
        let mut h = Harness::new(2);

        h.stack(1, Connecting);
        assert_eq!(h.machine.snapshot().incoming, Some(addr(1)));
        assert!(h.machine.timer().is_armed(&addr(1)));
        assert_eq!(h.state(), MachineState::Pending);

        h.stack(1, Connected);
        assert_eq!(h.connected(), vec![addr(1)]);
        assert!(!h.machine.timer().is_armed(&addr(1)));
        assert_eq!(
            h.changes(),
            vec![
                (addr(1), Disconnected, Connecting),
                (addr(1), Connecting, Connected)
            ]
        );
    }

    #[test]
    fn test_incoming_rejected_at_capacity() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.reset();

        h.stack(2, Connecting);

        assert_eq!(
            h.gateway.calls(),
            vec![GatewayCall::Disconnect(addr(2)), GatewayCall::Rejected(addr(2))]
        );
        assert!(h.notifications().is_empty());
        assert_eq!(h.machine.snapshot().incoming, None);
    }

    #[test]
    fn test_incoming_counts_reserved_target() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.connect(2);
        h.reset();

        h.stack(3, Connecting);
        assert_eq!(h.gateway.calls().last(), Some(&GatewayCall::Rejected(addr(3))));
    }

    #[test]
    fn test_quiet_mode_rejects_incoming() {
        let mut h = Harness::with_config(ManagerConfig::multicast().with_quiet_mode(true));

        h.stack(1, Connecting);
        assert_eq!(h.gateway.calls().last(), Some(&GatewayCall::Rejected(addr(1))));

        // local connects are still allowed
        h.connect(2);
        assert_eq!(h.gateway.connect_requests(), vec![addr(2)]);
    }

    #[test]
    fn test_unbonded_undefined_priority_rejected() {
        let mut h = Harness::new(2);
        h.stack(9, Connecting);
        assert_eq!(h.gateway.calls().last(), Some(&GatewayCall::Rejected(addr(9))));
    }

    #[test]
    fn test_incoming_policy_rechecked_on_connected() {
        let mut h = Harness::new(2);
        h.stack(1, Connecting);
        h.registry.set_priority(&addr(1), Priority::Off);
        h.reset();

        h.stack(1, Connected);
        assert_eq!(h.gateway.calls(), vec![GatewayCall::Disconnect(addr(1))]);
        assert_eq!(h.machine.snapshot().incoming, Some(addr(1)));
        assert!(h.connected().is_empty());

        h.stack(1, Disconnected);
        assert_eq!(h.state(), MachineState::Idle);
        assert_eq!(h.changes(), vec![(addr(1), Connecting, Disconnected)]);
    }

    // ------------------------------------------------------------------------
    // Unsolicited connected
    // ------------------------------------------------------------------------

    #[test]
    fn test_unknown_connected_admitted_with_room() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.reset();

        h.stack(2, Connected);

        assert_eq!(h.connected(), vec![addr(1), addr(2)]);
        assert_eq!(h.machine.snapshot().primary, Some(addr(2)));
        assert_eq!(h.changes(), vec![(addr(2), Disconnected, Connected)]);
    }

    #[test]
    fn test_unknown_connected_rejected_when_full() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.reset();

        h.stack(2, Connected);

        assert_eq!(h.connected(), vec![addr(1)]);
        assert_eq!(
            h.gateway.calls(),
            vec![GatewayCall::Disconnect(addr(2)), GatewayCall::Rejected(addr(2))]
        );
    }

    #[test]
    fn test_duplicate_connected_not_duplicated() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.reset();

        h.stack(1, Connected);
        assert_eq!(h.connected(), vec![addr(1)]);
        assert!(h.notifications().is_empty());
    }

    // ------------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------------

    #[test]
    fn test_connect_timeout_disconnects() {
        let mut h = Harness::new(1);
        h.connect(1);
        h.reset();

        h.fire_timer(1);

        assert_eq!(h.gateway.calls(), vec![GatewayCall::Disconnect(addr(1))]);
        assert_eq!(h.changes(), vec![(addr(1), Connecting, Disconnected)]);
        assert_eq!(h.state(), MachineState::Idle);

        // the lower stack confirming afterwards is an unknown device now
        h.stack(1, Disconnected);
        assert!(h.notifications().is_empty());
    }

    #[test]
    fn test_stale_timeout_ignored() {
        let mut h = Harness::new(1);
        h.connect(1);
        let generation = h.machine.timer().generation(&addr(1)).unwrap();
        h.stack(1, Connected);
        h.reset();

        h.machine.handle(Message::Timeout {
            device: addr(1),
            generation,
        });

        assert!(h.gateway.calls().is_empty());
        assert_eq!(h.connected(), vec![addr(1)]);
    }

    #[test]
    fn test_timeout_while_awaiting_eviction() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.connect(2);
        h.reset();

        h.fire_timer(2);

        assert!(h.gateway.calls().is_empty());
        assert_eq!(
            h.changes(),
            vec![
                (addr(2), Connecting, Disconnected),
                (addr(1), Disconnecting, Disconnected)
            ]
        );
        assert_eq!(h.machine.snapshot().disconnecting, None);
        assert!(h.machine.timer().armed.is_empty());
        assert_eq!(h.state(), MachineState::Idle);

        // late confirmation from the stack is for an unknown device
        h.stack(1, Disconnected);
        assert!(h.gateway.connect_requests().is_empty());
        assert!(h.notifications().is_empty());
        assert_eq!(h.state(), MachineState::Idle);
    }

    #[test]
    fn test_unconfirmed_eviction_does_not_wedge() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.connect(2);
        h.fire_timer(2);
        h.reset();

        for _ in 0..1000 {
            h.connect(3);
        }

        assert_eq!(h.machine.deferred_len(), 0);
        assert_eq!(h.gateway.calls(), vec![GatewayCall::Connect(addr(3))]);
        assert_eq!(h.state(), MachineState::Pending);
        assert_eq!(h.changes(), vec![(addr(3), Disconnected, Connecting)]);
    }

    #[test]
    fn test_victim_timeout_issues_waiting_connect() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.connect(2);
        assert!(h.machine.timer().is_armed(&addr(1)));
        h.reset();

        h.fire_timer(1);

        assert_eq!(h.changes(), vec![(addr(1), Disconnecting, Disconnected)]);
        assert_eq!(h.gateway.calls(), vec![GatewayCall::Connect(addr(2))]);
        assert!(h.machine.timer().is_armed(&addr(2)));

        h.stack(2, Connected);
        assert_eq!(h.connected(), vec![addr(2)]);
    }

    #[test]
    fn test_unconfirmed_local_disconnect_times_out() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.establish(2);
        h.disconnect(1);
        h.connect(3);
        h.connect(3);
        assert_eq!(h.machine.deferred_len(), 1);
        h.reset();

        h.fire_timer(1);

        assert_eq!(h.connected(), vec![addr(2)]);
        assert_eq!(h.machine.deferred_len(), 0);
        assert_eq!(h.gateway.connect_requests(), vec![addr(3)]);
        assert_eq!(
            h.changes(),
            vec![
                (addr(1), Disconnecting, Disconnected),
                (addr(3), Disconnected, Connecting)
            ]
        );
    }

    #[test]
    fn test_repeated_deferred_requests_collapsed() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.connect(2);

        h.connect(3);
        h.connect(3);
        h.disconnect(1);
        h.disconnect(1);
        h.connect(3);

        assert_eq!(h.machine.deferred_len(), 2);
    }

    #[test]
    fn test_incoming_timeout() {
        let mut h = Harness::new(1);
        h.stack(1, Connecting);
        h.reset();

        h.fire_timer(1);

        assert_eq!(h.gateway.calls(), vec![GatewayCall::Disconnect(addr(1))]);
        assert_eq!(h.changes(), vec![(addr(1), Connecting, Disconnected)]);
        assert_eq!(h.state(), MachineState::Idle);
    }

    // ------------------------------------------------------------------------
    // Audio
    // ------------------------------------------------------------------------

    #[test]
    fn test_audio_state_deduplicated() {
        let mut h = Harness::new(2);
        h.establish(1);
        h.establish(2);
        h.reset();

        h.audio(1, AudioState::Started);
        h.audio(1, AudioState::Started);
        h.audio(2, AudioState::Started);
        assert!(h.machine.snapshot().is_multicast_active());

        h.audio(1, AudioState::RemoteSuspend);
        h.audio(1, AudioState::Stopped);

        assert_eq!(
            h.notifications(),
            vec![
                Notification::AudioStateChanged {
                    device: addr(1),
                    old: PlayState::NotPlaying,
                    new: PlayState::Playing
                },
                Notification::AudioStateChanged {
                    device: addr(2),
                    old: PlayState::NotPlaying,
                    new: PlayState::Playing
                },
                Notification::AudioStateChanged {
                    device: addr(1),
                    old: PlayState::Playing,
                    new: PlayState::NotPlaying
                },
            ]
        );
        assert_eq!(h.machine.snapshot().playing_devices(), vec![addr(2)]);
    }

    #[test]
    fn test_audio_for_non_member_ignored() {
        let mut h = Harness::new(1);
        h.connect(1);
        h.reset();

        h.audio(1, AudioState::Started);
        assert!(h.notifications().is_empty());
        assert!(!h.machine.snapshot().is_any_playing());
    }

    #[test]
    fn test_remote_drop_stops_playback() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.audio(1, AudioState::Started);
        h.reset();

        h.stack(1, Disconnected);

        assert!(!h.machine.snapshot().is_any_playing());
        assert_eq!(
            h.notifications().first(),
            Some(&Notification::AudioStateChanged {
                device: addr(1),
                old: PlayState::Playing,
                new: PlayState::NotPlaying
            })
        );
    }

    #[test]
    fn test_audio_config_cached_and_cleared() {
        let mut h = Harness::new(1);
        let config = AudioConfig::new(44_100, 2);
        h.establish(1);
        h.reset();

        for _ in 0..2 {
            h.machine.handle(Message::Stack(StackEvent::AudioConfigChanged {
                device: addr(1),
                config,
            }));
        }
        assert_eq!(h.machine.snapshot().audio_config(&addr(1)), Some(config));
        assert_eq!(
            h.notifications(),
            vec![Notification::AudioConfigChanged {
                device: addr(1),
                config
            }]
        );

        h.stack(1, Disconnected);
        assert_eq!(h.machine.snapshot().audio_config(&addr(1)), None);
    }

    #[test]
    fn test_priority_check_answered() {
        let mut h = Harness::new(1);
        h.registry.set_priority(&addr(2), Priority::Off);

        h.machine
            .handle(StackEvent::CheckConnectionPriority { device: addr(1) }.into());
        h.machine
            .handle(StackEvent::CheckConnectionPriority { device: addr(2) }.into());

        assert_eq!(
            h.gateway.calls(),
            vec![
                GatewayCall::AllowConnection(addr(1), true),
                GatewayCall::AllowConnection(addr(2), false)
            ]
        );
        assert_eq!(h.registry.bonded_devices().len(), 5);
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    #[test]
    fn test_shutdown_force_notifies_in_flight() {
        let mut h = Harness::new(3);
        h.establish(1);
        h.connect(2);
        h.stack(3, Connecting);
        h.connect(4);
        assert_eq!(h.machine.deferred_len(), 1);
        h.reset();

        h.machine.handle(Message::Shutdown);

        assert!(h.machine.is_stopped());
        assert_eq!(h.machine.deferred_len(), 0);
        assert!(h.machine.timer().armed.is_empty());
        assert_eq!(
            h.gateway.calls(),
            vec![GatewayCall::Disconnect(addr(2)), GatewayCall::Disconnect(addr(3))]
        );
        assert_eq!(
            h.changes(),
            vec![
                (addr(2), Connecting, Disconnected),
                (addr(3), Connecting, Disconnected)
            ]
        );

        h.connect(5);
        assert_eq!(h.gateway.calls().len(), 2);
    }

    #[test]
    fn test_shutdown_skips_gateway_for_unissued_connect() {
        let mut h = Harness::new(1);
        h.establish(1);
        h.connect(2);
        h.reset();

        h.machine.handle(Message::Shutdown);

        assert!(h.gateway.calls().is_empty());
        assert_eq!(h.changes(), vec![(addr(2), Connecting, Disconnected)]);
    }
}
