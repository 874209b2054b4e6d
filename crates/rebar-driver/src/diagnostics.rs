//! Pre- and post-procedure inspection
//!
//! Observations are always read live. Nothing here is cached between phases
//! because removal and rescan change every value being observed.
//!
//! Missing data is reported as unavailable, never as an error: visible
//! memory only exists while a driver is bound, and the extended register is
//! unreadable without privilege.

use crate::config::Config;
use crate::port::{window_size, BusPort};
use crate::register::ControlRegister;
use crate::topology::DeviceAddress;
use rebar_chip::bar::BRIDGE_PREFETCH_WINDOW_LINE;
use rebar_chip::format_size;
use rebar_chip::regs::SizeIndex;
use std::fmt;

/// Live state of one GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceObservation {
    /// Device observed
    pub address: DeviceAddress,
    /// Present in the device tree
    pub present: bool,
    /// Size of the resized BAR as currently assigned
    pub window_bytes: Option<u64>,
    /// CPU-visible device memory reported by the driver
    pub visible_bytes: Option<u64>,
    /// Size index in the control register
    pub size_index: Option<SizeIndex>,
    /// Bound driver
    pub driver: Option<String>,
}

/// Live state of one bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeObservation {
    /// Bridge observed
    pub address: DeviceAddress,
    /// Present in the device tree
    pub present: bool,
    /// Prefetchable memory window
    pub prefetch_window_bytes: Option<u64>,
}

/// Everything observed at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// One entry per configured GPU
    pub devices: Vec<DeviceObservation>,
    /// One entry per bridge in the chain
    pub bridges: Vec<BridgeObservation>,
}

impl Snapshot {
    /// GPUs currently present
    pub fn present_count(&self) -> usize {
        self.devices.iter().filter(|d| d.present).count()
    }

    /// Observation for `address`
    pub fn device(&self, address: &DeviceAddress) -> Option<&DeviceObservation> {
        self.devices.iter().find(|d| &d.address == address)
    }
}

/// Observe one GPU
pub fn observe_device<P: BusPort + ?Sized>(
    port: &P,
    config: &Config,
    address: &DeviceAddress,
) -> DeviceObservation {
    if !port.is_present(address) {
        return DeviceObservation {
            address: address.clone(),
            present: false,
            window_bytes: None,
            visible_bytes: None,
            size_index: None,
            driver: None,
        };
    }

    let register = ControlRegister::new(config.register_offset);
    DeviceObservation {
        address: address.clone(),
        present: true,
        window_bytes: window_size(port, address, config.bar_index),
        visible_bytes: port
            .attribute(address, &config.visible_memory_attribute)
            .and_then(|s| s.parse().ok()),
        size_index: register.size_index(port, address),
        driver: port.bound_driver(address),
    }
}

/// Observe one bridge
pub fn observe_bridge<P: BusPort + ?Sized>(
    port: &P,
    address: &DeviceAddress,
) -> BridgeObservation {
    let present = port.is_present(address);
    BridgeObservation {
        address: address.clone(),
        present,
        prefetch_window_bytes: if present {
            window_size(port, address, BRIDGE_PREFETCH_WINDOW_LINE)
        } else {
            None
        },
    }
}

/// Observe every configured GPU and bridge
pub fn snapshot<P: BusPort + ?Sized>(port: &P, config: &Config) -> Snapshot {
    Snapshot {
        devices: config
            .topology
            .gpu_devices()
            .iter()
            .map(|a| observe_device(port, config, a))
            .collect(),
        bridges: config
            .topology
            .bridge_chain()
            .iter()
            .map(|a| observe_bridge(port, a))
            .collect(),
    }
}

/// Run and log pre-procedure diagnostics
pub fn diagnose<P: BusPort + ?Sized>(port: &P, config: &Config) -> Snapshot {
    let snap = snapshot(port, config);
    for device in &snap.devices {
        tracing::info!("{device}");
    }
    for bridge in &snap.bridges {
        tracing::debug!("{bridge}");
    }
    tracing::info!(
        "{} of {} GPU(s) present, target size index {} ({})",
        snap.present_count(),
        snap.devices.len(),
        config.target,
        format_size(config.target.bytes())
    );
    snap
}

/// Per-device verification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Window at or above the threshold and visible memory grew
    Resized,
    /// Present but still small, or visible memory did not grow
    NotResized,
    /// Not in the device tree
    Missing,
}

impl Verdict {
    /// Counts as success
    pub const fn passed(self) -> bool {
        matches!(self, Self::Resized)
    }
}

/// Verification result for one GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceVerdict {
    /// State after the procedure
    pub after: DeviceObservation,
    /// Visible memory before the procedure
    pub visible_before: Option<u64>,
    /// Classification
    pub verdict: Verdict,
}

/// Outcome of post-procedure verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Per-GPU results, in topology order
    pub devices: Vec<DeviceVerdict>,
    /// Bridges after the procedure
    pub bridges: Vec<BridgeObservation>,
    /// GPUs present after the procedure
    pub found: usize,
    /// GPUs configured
    pub expected: usize,
    /// Peer-mapping errors in the recent kernel log, if it was readable
    pub peer_errors: Option<usize>,
}

impl VerificationReport {
    /// Every GPU resized
    pub fn passed(&self) -> bool {
        self.found == self.expected && self.devices.iter().all(|d| d.verdict.passed())
    }
}

/// Classify one GPU against its pre-procedure state
pub fn classify(
    config: &Config,
    after: &DeviceObservation,
    before: Option<&DeviceObservation>,
) -> Verdict {
    if !after.present {
        return Verdict::Missing;
    }

    let large = after
        .window_bytes
        .is_some_and(|w| w >= config.verify.min_window_bytes());

    // Grown past the firmware-assigned window, and not smaller than before.
    // A re-run on already resized devices passes with equal values.
    let prior = before.and_then(|b| b.visible_bytes).unwrap_or(0);
    let grew = after
        .visible_bytes
        .is_some_and(|v| v > config.verify.original_window_bytes() && v >= prior);

    if large && grew {
        Verdict::Resized
    } else {
        Verdict::NotResized
    }
}

/// Count lines containing `signature`
pub fn count_peer_errors(lines: &[String], signature: &str) -> usize {
    lines.iter().filter(|l| l.contains(signature)).count()
}

/// Re-read everything and judge the result
pub fn verify<P: BusPort + ?Sized>(
    port: &P,
    config: &Config,
    before: &Snapshot,
) -> VerificationReport {
    let after = snapshot(port, config);

    let devices: Vec<DeviceVerdict> = after
        .devices
        .iter()
        .map(|obs| {
            let prior = before.device(&obs.address);
            DeviceVerdict {
                verdict: classify(config, obs, prior),
                visible_before: prior.and_then(|p| p.visible_bytes),
                after: obs.clone(),
            }
        })
        .collect();

    let peer_errors = match port.kernel_log_tail(config.verify.kernel_log_lines) {
        Ok(lines) => Some(count_peer_errors(&lines, &config.verify.peer_error_signature)),
        Err(e) => {
            tracing::warn!("Kernel log unavailable: {e}");
            None
        }
    };

    let report = VerificationReport {
        found: after.present_count(),
        expected: devices.len(),
        devices,
        bridges: after.bridges,
        peer_errors,
    };

    for device in &report.devices {
        match device.verdict {
            Verdict::Resized => tracing::info!("ok: {}", device.after),
            Verdict::NotResized => tracing::error!("not resized: {}", device.after),
            Verdict::Missing => tracing::error!("missing: {}", device.after.address),
        }
    }
    for bridge in &report.bridges {
        tracing::debug!("{bridge}");
    }
    match report.peer_errors {
        Some(0) => tracing::info!("No peer-mapping errors in the recent kernel log"),
        Some(n) => tracing::warn!(
            "{n} peer-mapping error(s) in the last {} kernel log lines",
            config.verify.kernel_log_lines
        ),
        None => {}
    }
    if report.passed() {
        tracing::info!("ok: all {} GPU(s) resized", report.expected);
    } else {
        tracing::error!(
            "Verification failed: {} of {} GPU(s) present, {} resized",
            report.found,
            report.expected,
            report.devices.iter().filter(|d| d.verdict.passed()).count()
        );
    }

    report
}

fn fmt_bytes(bytes: Option<u64>) -> String {
    bytes.map_or_else(|| "unavailable".to_string(), |b| format_size(u128::from(b)))
}

impl fmt::Display for DeviceObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.present {
            return write!(f, "{}: not present", self.address);
        }
        let index = self.size_index.map_or_else(
            || "unavailable".to_string(),
            |i| format!("{i} ({})", format_size(i.bytes())),
        );
        write!(
            f,
            "{}: BAR {}, visible {}, register index {}, driver {}",
            self.address,
            fmt_bytes(self.window_bytes),
            fmt_bytes(self.visible_bytes),
            index,
            self.driver.as_deref().unwrap_or("(none)")
        )
    }
}

impl fmt::Display for BridgeObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.present {
            write!(
                f,
                "{}: prefetch window {}",
                self.address,
                fmt_bytes(self.prefetch_window_bytes)
            )
        } else {
            write!(f, "{}: not present", self.address)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(window: Option<u64>, visible: Option<u64>) -> DeviceObservation {
        DeviceObservation {
            address: "0000:03:00.0".parse().unwrap(),
            present: true,
            window_bytes: window,
            visible_bytes: visible,
            size_index: SizeIndex::new(15).ok(),
            driver: Some("amdgpu".into()),
        }
    }

    #[test]
    fn classifies_resized_device() {
        let config = Config::from_toml("").unwrap();
        let before = obs(Some(256 << 20), Some(256 << 20));
        let after = obs(Some(32 << 30), Some(32 << 30));
        assert_eq!(classify(&config, &after, Some(&before)), Verdict::Resized);
        assert_eq!(classify(&config, &after, None), Verdict::Resized);
    }

    #[test]
    fn small_window_or_flat_visible_is_not_resized() {
        let config = Config::from_toml("").unwrap();
        let before = obs(Some(256 << 20), Some(256 << 20));
        assert_eq!(
            classify(&config, &obs(Some(256 << 20), Some(256 << 20)), Some(&before)),
            Verdict::NotResized
        );
        assert_eq!(
            classify(&config, &obs(Some(32 << 30), Some(256 << 20)), Some(&before)),
            Verdict::NotResized
        );
        assert_eq!(
            classify(&config, &obs(Some(32 << 30), None), Some(&before)),
            Verdict::NotResized
        );
    }

    #[test]
    fn rerun_on_resized_device_passes() {
        let config = Config::from_toml("").unwrap();
        let resized = obs(Some(32 << 30), Some(32 << 30));
        assert_eq!(classify(&config, &resized, Some(&resized)), Verdict::Resized);
        let shrunk = obs(Some(32 << 30), Some(16 << 30));
        assert_eq!(classify(&config, &shrunk, Some(&resized)), Verdict::NotResized);
    }

    #[test]
    fn absent_device_is_missing() {
        let config = Config::from_toml("").unwrap();
        let mut gone = obs(None, None);
        gone.present = false;
        assert_eq!(classify(&config, &gone, None), Verdict::Missing);
        assert_eq!(gone.to_string(), "0000:03:00.0: not present");
    }

    #[test]
    fn counts_signature_lines() {
        let lines = vec![
            "amdgpu 0000:03:00.0: Failed to map peer:0000:23:00.0".to_string(),
            "amdgpu: ring gfx timeout".to_string(),
            "amdgpu 0000:23:00.0: Failed to map peer:0000:03:00.0".to_string(),
        ];
        assert_eq!(count_peer_errors(&lines, "Failed to map peer"), 2);
        assert_eq!(count_peer_errors(&[], "Failed to map peer"), 0);
    }

    #[test]
    fn observation_display() {
        let text = obs(Some(32 << 30), None).to_string();
        assert!(text.contains("BAR 32 GB"), "{text}");
        assert!(text.contains("visible unavailable"), "{text}");
        assert!(text.contains("register index 15 (32 GB)"), "{text}");
    }
}
