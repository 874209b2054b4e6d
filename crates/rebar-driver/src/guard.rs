//! Driver lifecycle guard
//!
//! Once the procedure has detached a driver or removed a subtree, the GPUs
//! must not be left without a driver, whatever happens next. [`DriverGuard`]
//! owns the bus port for the duration of the procedure. While armed, dropping
//! it makes a best-effort attempt to load the driver and re-probe every
//! present device (GPU or companion) that came back unbound.
//!
//! The normal path disarms the guard after its own driver-load step, so the
//! driver initializes once.

use crate::port::BusPort;
use crate::topology::DeviceAddress;

/// Scoped safety net around the bus port
#[derive(Debug)]
pub struct DriverGuard<'p, P: BusPort + ?Sized> {
    port: &'p mut P,
    driver: String,
    devices: Vec<DeviceAddress>,
    armed: bool,
}

impl<'p, P: BusPort + ?Sized> DriverGuard<'p, P> {
    /// Disarmed guard over `port`
    pub fn new(port: &'p mut P, driver: impl Into<String>, devices: &[DeviceAddress]) -> Self {
        Self {
            port,
            driver: driver.into(),
            devices: devices.to_vec(),
            armed: false,
        }
    }

    /// Shared access to the port
    pub fn port(&self) -> &P {
        &*self.port
    }

    /// Exclusive access to the port
    pub fn port_mut(&mut self) -> &mut P {
        &mut *self.port
    }

    /// Recovery will run on drop
    pub fn arm(&mut self) {
        if !self.armed {
            tracing::debug!("Driver guard armed for {}", self.driver);
        }
        self.armed = true;
    }

    /// Recovery will not run on drop
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Whether recovery is pending
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Load the driver if needed and re-probe unbound devices
    ///
    /// Best effort: every failure is logged and skipped.
    pub fn recover(&mut self) {
        if self.port.is_driver_loaded(&self.driver) {
            tracing::info!("Driver {} already loaded", self.driver);
        } else {
            tracing::warn!("Loading driver {} on exit path", self.driver);
            if let Err(e) = self.port.load_driver(&self.driver) {
                tracing::error!("Recovery load of {} failed: {e}", self.driver);
                return;
            }
        }

        for device in &self.devices {
            if self.port.is_present(device) && self.port.bound_driver(device).is_none() {
                tracing::info!("Re-probing {device}");
                if let Err(e) = self.port.probe(device) {
                    tracing::error!("Probe of {device} failed: {e}");
                }
            }
        }
    }
}

impl<P: BusPort + ?Sized> Drop for DriverGuard<'_, P> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.recover();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBus;
    use crate::config::Config;

    fn setup() -> (Config, MemoryBus) {
        let config = Config::from_toml("").unwrap();
        let bus = MemoryBus::new(&config.topology, 0x208, 0, "amdgpu", "vis");
        (config, bus)
    }

    #[test]
    fn disarmed_guard_does_nothing() {
        let (config, mut bus) = setup();
        {
            let _guard = DriverGuard::new(&mut bus, "amdgpu", config.topology.gpu_devices());
        }
        assert_eq!(bus.loads(), 0);
        assert!(bus.probes().is_empty());
    }

    #[test]
    fn armed_guard_loads_driver_on_drop() {
        let (config, mut bus) = setup();
        {
            let mut guard = DriverGuard::new(&mut bus, "amdgpu", config.topology.gpu_devices());
            guard.arm();
        }
        assert_eq!(bus.loads(), 1);
        assert!(bus.is_driver_loaded("amdgpu"));
        let gpu = &config.topology.gpu_devices()[0];
        assert_eq!(bus.bound_driver(gpu).as_deref(), Some("amdgpu"));
    }

    #[test]
    fn loaded_driver_only_reprobes_unbound() {
        let (config, bus) = setup();
        let mut bus = bus.with_driver_loaded(true);
        let gpu = config.topology.gpu_devices()[1].clone();
        bus.unbind(&gpu).unwrap();
        {
            let mut guard = DriverGuard::new(&mut bus, "amdgpu", config.topology.gpu_devices());
            guard.arm();
        }
        assert_eq!(bus.loads(), 0);
        assert_eq!(bus.probes(), &[gpu.clone()]);
        assert_eq!(bus.bound_driver(&gpu).as_deref(), Some("amdgpu"));
    }

    #[test]
    fn disarm_cancels_recovery() {
        let (config, mut bus) = setup();
        {
            let mut guard = DriverGuard::new(&mut bus, "amdgpu", config.topology.gpu_devices());
            guard.arm();
            assert!(guard.is_armed());
            guard.disarm();
        }
        assert_eq!(bus.loads(), 0);
    }
}
