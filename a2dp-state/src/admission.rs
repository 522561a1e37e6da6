//! Admission policy for peer connections

use std::sync::Arc;

use a2dp_stack::{DeviceAddress, Priority};

use crate::registry::DeviceRegistry;

/// Decides whether a peer may be connected
///
/// Stateless apart from the quiet-mode flag; every answer is computed from
/// the registry at call time.
#[derive(Clone)]
pub struct AdmissionPolicy {
    registry: Arc<dyn DeviceRegistry>,
    quiet_mode: bool,
}

impl AdmissionPolicy {
    pub fn new(registry: Arc<dyn DeviceRegistry>, quiet_mode: bool) -> Self {
        Self {
            registry,
            quiet_mode,
        }
    }

    /// Whether `device` may connect
    ///
    /// In quiet mode only locally initiated connections are allowed. Otherwise
    /// a priority of `On` or `AutoConnect` allows, and an `Undefined` priority
    /// allows bonded devices only.
    pub fn allow(&self, device: &DeviceAddress, initiated_locally: bool) -> bool {
        if self.quiet_mode && !initiated_locally {
            return false;
        }

        match self.registry.priority(device) {
            Priority::On | Priority::AutoConnect => true,
            Priority::Undefined => self.registry.is_bonded(device),
            Priority::Off => false,
        }
    }

    pub fn quiet_mode(&self) -> bool {
        self.quiet_mode
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for AdmissionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPolicy")
            .field("quiet_mode", &self.quiet_mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryDeviceRegistry;
    use rstest::rstest;

    fn device() -> DeviceAddress {
        DeviceAddress::new([0xAA, 0, 0, 0, 0, 1])
    }

    fn policy(priority: Option<Priority>, bonded: bool, quiet: bool) -> AdmissionPolicy {
        let registry = InMemoryDeviceRegistry::new();
        if let Some(priority) = priority {
            registry.set_priority(&device(), priority);
        }
        registry.set_bonded(device(), bonded);
        AdmissionPolicy::new(Arc::new(registry), quiet)
    }

    #[rstest]
    #[case(Some(Priority::On), false, true)]
    #[case(Some(Priority::AutoConnect), false, true)]
    #[case(Some(Priority::Off), true, false)]
    #[case(Some(Priority::Undefined), true, true)]
    #[case(Some(Priority::Undefined), false, false)]
    #[case(None, true, true)]
    #[case(None, false, false)]
    fn test_priority_and_bond(
        #[case] priority: Option<Priority>,
        #[case] bonded: bool,
        #[case] expected: bool,
    ) {
        let policy = policy(priority, bonded, false);
        assert_eq!(policy.allow(&device(), false), expected);
        assert_eq!(policy.allow(&device(), true), expected);
    }

    #[test]
    fn test_quiet_mode_refuses_remote_initiated() {
        let policy = policy(Some(Priority::AutoConnect), true, true);
        assert!(!policy.allow(&device(), false));
        assert!(policy.allow(&device(), true));
    }

    #[test]
    fn test_quiet_mode_still_honors_priority() {
        let policy = policy(Some(Priority::Off), true, true);
        assert!(!policy.allow(&device(), true));
    }
}
