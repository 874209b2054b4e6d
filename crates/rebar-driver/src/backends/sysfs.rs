//! sysfs bus port
//!
//! Drives the live PCI topology through `/sys/bus/pci`:
//!
//! ```text
//! devices/{addr}/config          4-byte pread/pwrite at the register offset
//! devices/{addr}/driver          symlink to the bound driver
//! devices/{addr}/driver/unbind   write address to detach
//! devices/{addr}/remove          write 1 to remove device + descendants
//! devices/{addr}/resource        BAR and bridge windows
//! rescan                         write 1 to re-enumerate every bus
//! drivers_probe                  write address to re-match a driver
//! ```
//!
//! Config space is accessed with rustix positional I/O. Unprivileged
//! readers only see the first 64 bytes; a short read of an extended register
//! is reported as "not available", the same as an absent device.

use crate::config::Paths;
use crate::error::{RebarError, Result};
use crate::port::BusPort;
use crate::topology::DeviceAddress;
use rebar_chip::bar::parse_resource_line;
use rebar_chip::ResourceWindow;
use rustix::io::{pread, pwrite};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// [`BusPort`] backed by Linux sysfs
#[derive(Debug, Clone)]
pub struct SysfsBus {
    root: PathBuf,
    module_root: PathBuf,
}

impl SysfsBus {
    /// Bus rooted at `/sys/bus/pci`
    #[must_use]
    pub fn new() -> Self {
        Self::from_paths(&Paths::default())
    }

    /// Bus rooted at the configured paths
    #[must_use]
    pub fn from_paths(paths: &Paths) -> Self {
        Self {
            root: paths.sysfs_root.clone(),
            module_root: paths.module_root.clone(),
        }
    }

    fn device_dir(&self, address: &DeviceAddress) -> PathBuf {
        self.root.join("devices").join(address.as_str())
    }

    fn trigger(path: &Path, value: &str) -> Result<()> {
        tracing::debug!("{} <- {value}", path.display());
        std::fs::write(path, value).map_err(|e| {
            RebarError::hardware_error(format!("Cannot write {}: {e}", path.display()))
        })
    }
}

impl Default for SysfsBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusPort for SysfsBus {
    fn read_config_u32(&self, address: &DeviceAddress, offset: u16) -> Result<Option<u32>> {
        let path = self.device_dir(address).join("config");
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RebarError::hardware_error(format!(
                    "Cannot open {}: {e}",
                    path.display()
                )))
            }
        };

        let mut buf = [0u8; 4];
        let n = pread(&file, &mut buf, u64::from(offset)).map_err(|e| {
            RebarError::hardware_error(format!("Config read {address}+{offset:#x}: {e}"))
        })?;

        if n < buf.len() {
            tracing::debug!("{address}: short config read at {offset:#x} ({n} bytes)");
            return Ok(None);
        }

        Ok(Some(u32::from_le_bytes(buf)))
    }

    fn write_config_u32(
        &mut self,
        address: &DeviceAddress,
        offset: u16,
        value: u32,
    ) -> Result<()> {
        let path = self.device_dir(address).join("config");
        let file = OpenOptions::new().write(true).open(&path).map_err(|e| {
            RebarError::hardware_error(format!("Cannot open {}: {e}", path.display()))
        })?;

        let n = pwrite(&file, &value.to_le_bytes(), u64::from(offset)).map_err(|e| {
            RebarError::hardware_error(format!("Config write {address}+{offset:#x}: {e}"))
        })?;

        if n != 4 {
            return Err(RebarError::hardware_error(format!(
                "Config write {address}+{offset:#x}: wrote {n} of 4 bytes"
            )));
        }

        Ok(())
    }

    fn is_present(&self, address: &DeviceAddress) -> bool {
        self.device_dir(address).exists()
    }

    fn bound_driver(&self, address: &DeviceAddress) -> Option<String> {
        std::fs::read_link(self.device_dir(address).join("driver"))
            .ok()?
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }

    fn unbind(&mut self, address: &DeviceAddress) -> Result<()> {
        let path = self.device_dir(address).join("driver").join("unbind");
        Self::trigger(&path, address.as_str())
    }

    fn remove(&mut self, address: &DeviceAddress) -> Result<()> {
        Self::trigger(&self.device_dir(address).join("remove"), "1")
    }

    fn rescan(&mut self) -> Result<()> {
        Self::trigger(&self.root.join("rescan"), "1")
    }

    fn probe(&mut self, address: &DeviceAddress) -> Result<()> {
        Self::trigger(&self.root.join("drivers_probe"), address.as_str())
    }

    fn is_driver_loaded(&self, driver: &str) -> bool {
        self.module_root.join(driver.replace('-', "_")).exists()
    }

    fn load_driver(&mut self, driver: &str) -> Result<()> {
        let status = Command::new("modprobe")
            .arg(driver)
            .status()
            .map_err(|e| RebarError::driver_load(driver, format!("cannot run modprobe: {e}")))?;

        if !status.success() {
            return Err(RebarError::driver_load(driver, format!("modprobe exited with {status}")));
        }

        Ok(())
    }

    fn resources(&self, address: &DeviceAddress) -> Option<Vec<Option<ResourceWindow>>> {
        let content = std::fs::read_to_string(self.device_dir(address).join("resource")).ok()?;
        Some(content.lines().map(parse_resource_line).collect())
    }

    fn attribute(&self, address: &DeviceAddress, name: &str) -> Option<String> {
        std::fs::read_to_string(self.device_dir(address).join(name))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn kernel_log_tail(&self, lines: usize) -> Result<Vec<String>> {
        let output = Command::new("dmesg")
            .output()
            .map_err(|e| RebarError::hardware_error(format!("cannot run dmesg: {e}")))?;

        if !output.status.success() {
            return Err(RebarError::hardware_error(format!(
                "dmesg exited with {}",
                output.status
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let all: Vec<&str> = text.lines().collect();
        let skip = all.len().saturating_sub(lines);
        Ok(all[skip..].iter().map(ToString::to_string).collect())
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
