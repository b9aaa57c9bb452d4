//! Device enumeration consumed by the server's hot-plug step.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Source of enabled / disabled device ids, queried once per loop iteration.
pub trait DeviceSource: Send + fmt::Debug {
    /// Devices that should have a listening endpoint.
    fn enabled_devices(&self) -> Vec<u16>;

    /// Devices whose endpoint should be torn down.
    fn disabled_devices(&self) -> Vec<u16>;
}

/// A fixed device list that never changes.
#[derive(Debug, Clone, Default)]
pub struct StaticDevices(Vec<u16>);

impl StaticDevices {
    /// Creates a source reporting `devices` as enabled.
    pub fn new(devices: impl IntoIterator<Item = u16>) -> Self {
        Self(devices.into_iter().collect())
    }
}

impl DeviceSource for StaticDevices {
    fn enabled_devices(&self) -> Vec<u16> {
        self.0.clone()
    }

    fn disabled_devices(&self) -> Vec<u16> {
        Vec::new()
    }
}

/// Enabled / disabled sets.
#[derive(Debug, Default)]
struct Sets {
    /// Currently present devices.
    enabled: BTreeSet<u16>,
    /// Devices that went away.
    disabled: BTreeSet<u16>,
}

/// A shared, mutable device set driven by a hot-plug monitor.
///
/// Clones share state: hand one to the server and keep one to report
/// arrivals and removals.
#[derive(Debug, Clone, Default)]
pub struct DeviceSet(Arc<Mutex<Sets>>);

impl DeviceSet {
    /// Creates a set with `devices` enabled.
    pub fn new(devices: impl IntoIterator<Item = u16>) -> Self {
        let set = Self::default();
        for d in devices {
            set.enable(d);
        }
        set
    }

    /// Locks the sets, recovering from a poisoned mutex.
    fn sets(&self) -> MutexGuard<'_, Sets> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `device` present.
    pub fn enable(&self, device: u16) {
        let mut s = self.sets();
        s.disabled.remove(&device);
        s.enabled.insert(device);
    }

    /// Marks `device` gone.
    pub fn disable(&self, device: u16) {
        let mut s = self.sets();
        if s.enabled.remove(&device) {
            s.disabled.insert(device);
        }
    }
}

impl DeviceSource for DeviceSet {
    fn enabled_devices(&self) -> Vec<u16> {
        self.sets().enabled.iter().copied().collect()
    }

    fn disabled_devices(&self) -> Vec<u16> {
        self.sets().disabled.iter().copied().collect()
    }
}
