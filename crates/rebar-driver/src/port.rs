//! Bus port abstraction
//!
//! Every interaction with the live PCI topology goes through [`BusPort`].
//! The production implementation is [`crate::SysfsBus`]; tests drive the
//! state machine against an in-memory bus.

use crate::error::Result;
use crate::topology::DeviceAddress;
use rebar_chip::ResourceWindow;
use std::fmt::Debug;
use std::time::Duration;

/// Access to the machine's PCI bus
///
/// Reads that target an absent device return `Ok(None)` rather than an
/// error: absence is the normal state while a subtree is removed.
pub trait BusPort: Debug {
    /// Read a 32-bit configuration-space register
    ///
    /// # Errors
    ///
    /// Returns error if the device is present but the read fails.
    fn read_config_u32(&self, address: &DeviceAddress, offset: u16) -> Result<Option<u32>>;

    /// Write a 32-bit configuration-space register
    ///
    /// # Errors
    ///
    /// Returns error if the device is absent or the write fails.
    fn write_config_u32(&mut self, address: &DeviceAddress, offset: u16, value: u32)
        -> Result<()>;

    /// Whether the device currently exists in the device tree
    fn is_present(&self, address: &DeviceAddress) -> bool;

    /// Name of the driver bound to the device, if any
    fn bound_driver(&self, address: &DeviceAddress) -> Option<String>;

    /// Detach the bound driver
    ///
    /// # Errors
    ///
    /// Returns error if the unbind request is rejected.
    fn unbind(&mut self, address: &DeviceAddress) -> Result<()>;

    /// Remove the device and everything below it
    ///
    /// # Errors
    ///
    /// Returns error if the removal request is rejected.
    fn remove(&mut self, address: &DeviceAddress) -> Result<()>;

    /// Request a bus-wide rescan
    ///
    /// # Errors
    ///
    /// Returns error if the rescan request is rejected.
    fn rescan(&mut self) -> Result<()>;

    /// Ask the kernel to match a driver to an unbound device
    ///
    /// # Errors
    ///
    /// Returns error if the probe request is rejected.
    fn probe(&mut self, address: &DeviceAddress) -> Result<()>;

    /// Whether the driver module is loaded
    fn is_driver_loaded(&self, driver: &str) -> bool;

    /// Load the driver module
    ///
    /// # Errors
    ///
    /// Returns error if the module cannot be loaded.
    fn load_driver(&mut self, driver: &str) -> Result<()>;

    /// Resource windows of the device, one entry per sysfs `resource` line
    fn resources(&self, address: &DeviceAddress) -> Option<Vec<Option<ResourceWindow>>>;

    /// Raw value of a device attribute
    fn attribute(&self, address: &DeviceAddress, name: &str) -> Option<String>;

    /// The most recent `lines` lines of the kernel log
    ///
    /// # Errors
    ///
    /// Returns error if the log cannot be read.
    fn kernel_log_tail(&self, lines: usize) -> Result<Vec<String>>;

    /// Wait for asynchronous kernel work
    fn sleep(&self, duration: Duration);
}

/// Size in bytes of resource line `index`, if assigned
pub(crate) fn window_size<P: BusPort + ?Sized>(
    port: &P,
    address: &DeviceAddress,
    index: usize,
) -> Option<u64> {
    port.resources(address)?
        .get(index)
        .copied()
        .flatten()
        .map(|w| w.size())
}
