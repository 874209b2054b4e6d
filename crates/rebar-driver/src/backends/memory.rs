//! In-memory bus: a simulated topology with kernel-like cascade semantics.
//!
//! Removing a top-level bridge removes everything configured below it. A
//! rescan brings removed devices back, re-derives each GPU's BAR window from
//! its size index, and re-sizes bridge windows to fit their subtree. When the
//! driver module is loaded, rediscovered GPUs bind to it automatically.
//!
//! No time passes: [`BusPort::sleep`] only accumulates the requested duration.
//!
//! Faults can be injected per device (write does not latch, unbind or remove
//! rejected, device lost on rescan) and for the driver load.

use crate::config::Config;
use crate::error::{RebarError, Result};
use crate::port::BusPort;
use crate::topology::{DeviceAddress, Topology};
use rebar_chip::bar::{ResourceWindow, BRIDGE_PREFETCH_WINDOW_LINE, FLAG_MEM_64, FLAG_PREFETCH};
use rebar_chip::regs::{decode_size_index, encode_size_index, SizeIndex};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Companion (audio) driver name used by the simulation
pub const COMPANION_DRIVER: &str = "snd_hda_intel";

const RESOURCE_LINES: usize = 17;
const WINDOW_BASE: u64 = 0x0000_0380_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Bridge,
    Gpu,
    Companion,
}

#[derive(Debug, Clone)]
struct SimDevice {
    role: Role,
    register: u32,
    /// Window as enumerated; only changes on rescan
    window: u64,
    driver: Option<String>,
    vram: u64,
}

/// Simulated PCI bus implementing [`BusPort`]
#[derive(Debug)]
pub struct MemoryBus {
    present: BTreeMap<DeviceAddress, SimDevice>,
    removed: BTreeMap<DeviceAddress, SimDevice>,
    below: HashMap<DeviceAddress, Vec<DeviceAddress>>,
    register_offset: u16,
    bar_index: usize,
    gpu_driver: String,
    visible_attribute: String,
    driver_loaded: bool,
    kernel_log: Vec<String>,

    no_latch: BTreeSet<DeviceAddress>,
    reject_unbind: BTreeSet<DeviceAddress>,
    reject_remove: BTreeSet<DeviceAddress>,
    lost_on_rescan: BTreeSet<DeviceAddress>,
    reject_load: bool,
    peer_errors_after_load: usize,
    peer_error_text: String,

    writes: usize,
    unbinds: usize,
    removals: Vec<DeviceAddress>,
    rescans: usize,
    loads: usize,
    probes: Vec<DeviceAddress>,
    slept: Cell<Duration>,
}

impl MemoryBus {
    /// Bus matching `config`, every GPU at `initial` index, the driver loaded
    /// and bound to every device.
    #[must_use]
    pub fn from_config(config: &Config, initial: SizeIndex) -> Self {
        let mut bus = Self::new(
            &config.topology,
            config.register_offset,
            config.bar_index,
            &config.driver,
            &config.visible_memory_attribute,
        );
        bus.peer_error_text = config.verify.peer_error_signature.clone();
        for gpu in config.topology.gpu_devices() {
            bus = bus.with_size_index(gpu, initial);
        }
        bus.with_driver_loaded(true)
    }

    /// Bus with every device present and unbound, driver not loaded, GPUs at
    /// size index 8 (256 MB).
    #[must_use]
    pub fn new(
        topology: &Topology,
        register_offset: u16,
        bar_index: usize,
        gpu_driver: &str,
        visible_attribute: &str,
    ) -> Self {
        let initial_window: u64 = 256 << 20;
        let initial_register = encode_size_index(0x0000_0020, 8).unwrap_or(0);

        let mut present = BTreeMap::new();
        let mut below = HashMap::new();

        for group in topology.groups() {
            let subtree: Vec<DeviceAddress> = group
                .chain
                .iter()
                .chain(std::iter::once(&group.gpu))
                .chain(group.companion.iter())
                .cloned()
                .collect();
            below.insert(group.bridge.clone(), subtree);

            for bridge in std::iter::once(&group.bridge).chain(group.chain.iter()) {
                present.insert(bridge.clone(), SimDevice::bridge());
            }
            present.insert(
                group.gpu.clone(),
                SimDevice {
                    role: Role::Gpu,
                    register: initial_register,
                    window: initial_window,
                    driver: None,
                    vram: 32 << 30,
                },
            );
            if let Some(companion) = &group.companion {
                present.insert(companion.clone(), SimDevice::companion());
            }
        }

        let mut bus = Self {
            present,
            removed: BTreeMap::new(),
            below,
            register_offset,
            bar_index,
            gpu_driver: gpu_driver.to_string(),
            visible_attribute: visible_attribute.to_string(),
            driver_loaded: false,
            kernel_log: Vec::new(),
            no_latch: BTreeSet::new(),
            reject_unbind: BTreeSet::new(),
            reject_remove: BTreeSet::new(),
            lost_on_rescan: BTreeSet::new(),
            reject_load: false,
            peer_errors_after_load: 0,
            peer_error_text: "Failed to map peer".to_string(),
            writes: 0,
            unbinds: 0,
            removals: Vec::new(),
            rescans: 0,
            loads: 0,
            probes: Vec::new(),
            slept: Cell::new(Duration::ZERO),
        };
        bus.resize_bridge_windows();
        bus
    }

    /// Set the register index of `gpu`; the window follows only after a rescan
    #[must_use]
    pub fn with_size_index(mut self, gpu: &DeviceAddress, index: SizeIndex) -> Self {
        if let Some(dev) = self.present.get_mut(gpu) {
            dev.register = encode_size_index(dev.register, index.get()).unwrap_or(dev.register);
        }
        self
    }

    /// Set the window of `gpu` directly, as if enumerated at that size
    #[must_use]
    pub fn with_window(mut self, gpu: &DeviceAddress, bytes: u64) -> Self {
        if let Some(dev) = self.present.get_mut(gpu) {
            dev.window = bytes;
        }
        self.resize_bridge_windows();
        self
    }

    /// Load (and bind) or unload (and unbind) the driver
    #[must_use]
    pub fn with_driver_loaded(mut self, loaded: bool) -> Self {
        self.driver_loaded = loaded;
        let gpu_driver = self.gpu_driver.clone();
        for dev in self.present.values_mut() {
            dev.driver = match (loaded, dev.role) {
                (true, Role::Gpu) => Some(gpu_driver.clone()),
                (true, Role::Companion) => Some(COMPANION_DRIVER.to_string()),
                _ => None,
            };
        }
        self
    }

    /// Take `address` off the bus (never enumerated)
    #[must_use]
    pub fn without_device(mut self, address: &DeviceAddress) -> Self {
        self.present.remove(address);
        self
    }

    /// Writes to `gpu` are accepted but never latch
    #[must_use]
    pub fn with_stuck_register(mut self, gpu: &DeviceAddress) -> Self {
        self.no_latch.insert(gpu.clone());
        self
    }

    /// Unbind requests for `address` fail
    #[must_use]
    pub fn with_unbind_failure(mut self, address: &DeviceAddress) -> Self {
        self.reject_unbind.insert(address.clone());
        self
    }

    /// Remove requests for `address` fail
    #[must_use]
    pub fn with_remove_failure(mut self, address: &DeviceAddress) -> Self {
        self.reject_remove.insert(address.clone());
        self
    }

    /// `address` does not come back after a rescan
    #[must_use]
    pub fn with_lost_on_rescan(mut self, address: &DeviceAddress) -> Self {
        self.lost_on_rescan.insert(address.clone());
        self
    }

    /// Every load attempt fails
    #[must_use]
    pub fn with_load_failure(mut self) -> Self {
        self.reject_load = true;
        self
    }

    /// Emit `count` peer-mapping errors into the kernel log on the next load
    #[must_use]
    pub fn with_peer_errors(mut self, count: usize) -> Self {
        self.peer_errors_after_load = count;
        self
    }

    /// Register writes accepted
    pub const fn writes(&self) -> usize {
        self.writes
    }

    /// Unbind requests accepted
    pub const fn unbinds(&self) -> usize {
        self.unbinds
    }

    /// Devices removed by request, in order
    pub fn removals(&self) -> &[DeviceAddress] {
        &self.removals
    }

    /// Rescans requested
    pub const fn rescans(&self) -> usize {
        self.rescans
    }

    /// Driver load requests (successful or not)
    pub const fn loads(&self) -> usize {
        self.loads
    }

    /// Devices probed, in order
    pub fn probes(&self) -> &[DeviceAddress] {
        &self.probes
    }

    /// Total simulated waiting
    pub fn slept(&self) -> Duration {
        self.slept.get()
    }

    /// Size index currently held by `gpu`'s register
    pub fn size_index(&self, gpu: &DeviceAddress) -> Option<SizeIndex> {
        self.present
            .get(gpu)
            .or_else(|| self.removed.get(gpu))
            .map(|d| decode_size_index(d.register))
    }

    fn bind_all(&mut self) {
        let gpu_driver = self.gpu_driver.clone();
        for dev in self.present.values_mut() {
            if dev.driver.is_none() {
                dev.driver = match dev.role {
                    Role::Gpu => Some(gpu_driver.clone()),
                    Role::Companion => Some(COMPANION_DRIVER.to_string()),
                    Role::Bridge => None,
                };
            }
        }
    }

    /// Bridge prefetch windows cover everything configured below them.
    fn resize_bridge_windows(&mut self) {
        for (bridge, subtree) in &self.below {
            let total: u64 = subtree
                .iter()
                .filter_map(|a| self.present.get(a))
                .filter(|d| d.role == Role::Gpu)
                .map(|d| d.window)
                .fold(0, u64::saturating_add);
            let chain: Vec<&DeviceAddress> = std::iter::once(bridge)
                .chain(subtree.iter())
                .filter(|a| self.present.get(*a).is_some_and(|d| d.role == Role::Bridge))
                .collect();
            for address in chain {
                if let Some(dev) = self.present.get_mut(address) {
                    dev.window = total;
                }
            }
        }
    }
}

impl SimDevice {
    const fn bridge() -> Self {
        Self {
            role: Role::Bridge,
            register: 0,
            window: 0,
            driver: None,
            vram: 0,
        }
    }

    const fn companion() -> Self {
        Self {
            role: Role::Companion,
            register: 0,
            window: 16 << 10,
            driver: None,
            vram: 0,
        }
    }
}

impl BusPort for MemoryBus {
    fn read_config_u32(&self, address: &DeviceAddress, offset: u16) -> Result<Option<u32>> {
        Ok(self
            .present
            .get(address)
            .filter(|_| offset == self.register_offset)
            .map(|d| d.register))
    }

    fn write_config_u32(
        &mut self,
        address: &DeviceAddress,
        offset: u16,
        value: u32,
    ) -> Result<()> {
        if offset != self.register_offset {
            return Err(RebarError::hardware_error(format!(
                "{address}: no register at {offset:#x}"
            )));
        }
        let latch = !self.no_latch.contains(address);
        let dev = self
            .present
            .get_mut(address)
            .ok_or_else(|| RebarError::hardware_error(format!("{address} not present")))?;
        if latch {
            dev.register = value;
        }
        self.writes += 1;
        Ok(())
    }

    fn is_present(&self, address: &DeviceAddress) -> bool {
        self.present.contains_key(address)
    }

    fn bound_driver(&self, address: &DeviceAddress) -> Option<String> {
        self.present.get(address)?.driver.clone()
    }

    fn unbind(&mut self, address: &DeviceAddress) -> Result<()> {
        if self.reject_unbind.contains(address) {
            return Err(RebarError::Unbind {
                address: address.clone(),
                reason: "device busy".to_string(),
            });
        }
        let dev = self
            .present
            .get_mut(address)
            .ok_or_else(|| RebarError::hardware_error(format!("{address} not present")))?;
        dev.driver = None;
        self.unbinds += 1;
        Ok(())
    }

    fn remove(&mut self, address: &DeviceAddress) -> Result<()> {
        if self.reject_remove.contains(address) {
            return Err(RebarError::Removal {
                address: address.clone(),
                reason: "removal rejected".to_string(),
            });
        }
        let dev = self
            .present
            .remove(address)
            .ok_or_else(|| RebarError::hardware_error(format!("{address} not present")))?;
        self.removed.insert(address.clone(), dev);

        for child in self.below.get(address).cloned().unwrap_or_default() {
            if let Some(dev) = self.present.remove(&child) {
                self.removed.insert(child, dev);
            }
        }
        self.removals.push(address.clone());
        Ok(())
    }

    fn rescan(&mut self) -> Result<()> {
        self.rescans += 1;
        let removed = std::mem::take(&mut self.removed);
        for (address, mut dev) in removed {
            if self.lost_on_rescan.contains(&address) {
                self.removed.insert(address, dev);
                continue;
            }
            dev.driver = None;
            if dev.role == Role::Gpu {
                let bytes = decode_size_index(dev.register).bytes();
                dev.window = u64::try_from(bytes).unwrap_or(u64::MAX);
            }
            self.present.insert(address, dev);
        }
        self.resize_bridge_windows();
        if self.driver_loaded {
            self.bind_all();
        }
        Ok(())
    }

    fn probe(&mut self, address: &DeviceAddress) -> Result<()> {
        self.probes.push(address.clone());
        let gpu_driver = self.gpu_driver.clone();
        if let Some(dev) = self.present.get_mut(address) {
            if dev.driver.is_none() {
                dev.driver = match dev.role {
                    Role::Gpu if self.driver_loaded => Some(gpu_driver),
                    Role::Companion => Some(COMPANION_DRIVER.to_string()),
                    _ => None,
                };
            }
        }
        Ok(())
    }

    fn is_driver_loaded(&self, driver: &str) -> bool {
        self.driver_loaded && driver == self.gpu_driver
    }

    fn load_driver(&mut self, driver: &str) -> Result<()> {
        self.loads += 1;
        if self.reject_load || driver != self.gpu_driver {
            return Err(RebarError::driver_load(driver, "module not found"));
        }
        self.driver_loaded = true;
        self.bind_all();
        for n in 0..std::mem::take(&mut self.peer_errors_after_load) {
            self.kernel_log
                .push(format!("[{n:>5}.000000] amdgpu: {}", self.peer_error_text));
        }
        Ok(())
    }

    fn resources(&self, address: &DeviceAddress) -> Option<Vec<Option<ResourceWindow>>> {
        let dev = self.present.get(address)?;
        let mut lines = vec![None; RESOURCE_LINES];
        let line = match dev.role {
            Role::Bridge => BRIDGE_PREFETCH_WINDOW_LINE,
            Role::Gpu => self.bar_index,
            Role::Companion => 0,
        };
        if dev.window > 0 && line < RESOURCE_LINES {
            // Windows too large to sit above the base start at zero
            let last = dev.window - 1;
            let start = if WINDOW_BASE.checked_add(last).is_some() {
                WINDOW_BASE
            } else {
                0
            };
            lines[line] = Some(ResourceWindow {
                start,
                end: start + last,
                flags: 0x200 | FLAG_PREFETCH | FLAG_MEM_64,
            });
        }
        Some(lines)
    }

    fn attribute(&self, address: &DeviceAddress, name: &str) -> Option<String> {
        let dev = self.present.get(address)?;
        if name != self.visible_attribute || dev.role != Role::Gpu {
            return None;
        }
        dev.driver.as_ref()?;
        Some(dev.window.min(dev.vram).to_string())
    }

    fn kernel_log_tail(&self, lines: usize) -> Result<Vec<String>> {
        let skip = self.kernel_log.len().saturating_sub(lines);
        Ok(self.kernel_log[skip..].to_vec())
    }

    fn sleep(&self, duration: Duration) {
        self.slept.set(self.slept.get() + duration);
    }
}
