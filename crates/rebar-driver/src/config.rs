//! Run configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file
//! at all) yields the built-in four-GPU layout. See `config/rebar.toml` for
//! an annotated sample.

use crate::error::{RebarError, Result};
use crate::topology::{BridgeGroup, DeviceAddress, Topology};
use rebar_chip::bar::{LARGE_WINDOW, ORIGINAL_WINDOW};
use rebar_chip::regs::{SizeIndex, DEFAULT_CONTROL_OFFSET};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a configuration file
pub const CONFIG_ENV: &str = "REBAR_CONFIG";

/// Fully validated settings for one run
#[derive(Debug, Clone)]
pub struct Config {
    /// Kernel module driving the GPUs
    pub driver: String,
    /// Size index written to every GPU
    pub target: SizeIndex,
    /// Config-space offset of the Resizable BAR control register
    pub register_offset: u16,
    /// Resource line of the BAR being resized
    pub bar_index: usize,
    /// Device attribute holding the CPU-visible memory size
    pub visible_memory_attribute: String,
    /// Device graph
    pub topology: Topology,
    /// Polling and settle times
    pub timing: Timing,
    /// Verification thresholds
    pub verify: VerifySettings,
    /// Checks run before mutating anything
    pub preflight: Preflight,
    /// Filesystem roots
    pub paths: Paths,
}

/// Bounded waits
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timing {
    /// Presence polls after the rescan
    pub rescan_attempts: u32,
    /// Delay between presence polls
    pub rescan_interval_ms: u64,
    /// Settle time when the driver auto-attached during the rescan
    pub settle_loaded_ms: u64,
    /// Settle time after loading the driver ourselves
    pub settle_fresh_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            rescan_attempts: 30,
            rescan_interval_ms: 1000,
            settle_loaded_ms: 5_000,
            settle_fresh_ms: 15_000,
        }
    }
}

impl Timing {
    /// Delay between presence polls
    pub const fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    /// Settle time for an already-loaded driver
    pub const fn settle_loaded(&self) -> Duration {
        Duration::from_millis(self.settle_loaded_ms)
    }

    /// Settle time after a fresh load
    pub const fn settle_fresh(&self) -> Duration {
        Duration::from_millis(self.settle_fresh_ms)
    }
}

/// Verification thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifySettings {
    /// Smallest window counted as resized, GiB
    pub min_window_gib: u64,
    /// Window size before resizing, MiB
    pub original_window_mib: u64,
    /// Kernel log lines scanned for peer-mapping errors
    pub kernel_log_lines: usize,
    /// Substring identifying a peer-memory mapping failure
    pub peer_error_signature: String,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            min_window_gib: LARGE_WINDOW >> 30,
            original_window_mib: ORIGINAL_WINDOW >> 20,
            kernel_log_lines: 2000,
            peer_error_signature: "Failed to map peer".to_string(),
        }
    }
}

impl VerifySettings {
    /// Resized threshold in bytes
    pub const fn min_window_bytes(&self) -> u64 {
        self.min_window_gib.saturating_mul(1 << 30)
    }

    /// Original window in bytes
    pub const fn original_window_bytes(&self) -> u64 {
        self.original_window_mib.saturating_mul(1 << 20)
    }
}

/// Preflight requirements
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Preflight {
    /// Kernel command-line parameter that must be present (empty: none)
    pub boot_parameter: String,
    /// Executables that must be on `PATH`
    pub required_tools: Vec<String>,
}

impl Default for Preflight {
    fn default() -> Self {
        Self {
            boot_parameter: "pci=realloc".to_string(),
            required_tools: vec!["modprobe".to_string()],
        }
    }
}

/// Filesystem roots, overridable for testing against a fake tree
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    /// PCI bus directory in sysfs
    pub sysfs_root: PathBuf,
    /// Loaded-module directory
    pub module_root: PathBuf,
    /// Kernel command line
    pub cmdline: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/bus/pci"),
            module_root: PathBuf::from("/sys/module"),
            cmdline: PathBuf::from("/proc/cmdline"),
        }
    }
}

/// On-disk shape
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    driver: String,
    target_size_index: u8,
    register_offset: u16,
    bar_index: usize,
    visible_memory_attribute: String,
    group: Vec<BridgeGroup>,
    timing: Timing,
    verify: VerifySettings,
    preflight: Preflight,
    paths: Paths,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            driver: "amdgpu".to_string(),
            target_size_index: SizeIndex::GIB_32.get(),
            register_offset: DEFAULT_CONTROL_OFFSET,
            bar_index: 0,
            visible_memory_attribute: "mem_info_vis_vram_total".to_string(),
            group: Vec::new(),
            timing: Timing::default(),
            verify: VerifySettings::default(),
            preflight: Preflight::default(),
            paths: Paths::default(),
        }
    }
}

/// Four GPUs, each behind root port → switch upstream → switch downstream
const DEFAULT_GROUPS: [(&str, [&str; 2], &str, &str); 4] = [
    ("0000:00:01.1", ["0000:01:00.0", "0000:02:00.0"], "0000:03:00.0", "0000:03:00.1"),
    ("0000:20:01.1", ["0000:21:00.0", "0000:22:00.0"], "0000:23:00.0", "0000:23:00.1"),
    ("0000:40:01.1", ["0000:41:00.0", "0000:42:00.0"], "0000:43:00.0", "0000:43:00.1"),
    ("0000:60:01.1", ["0000:61:00.0", "0000:62:00.0"], "0000:63:00.0", "0000:63:00.1"),
];

fn default_groups() -> Result<Vec<BridgeGroup>> {
    DEFAULT_GROUPS
        .iter()
        .map(|(bridge, chain, gpu, companion)| {
            Ok(BridgeGroup {
                bridge: bridge.parse()?,
                chain: chain
                    .iter()
                    .map(|a| a.parse())
                    .collect::<Result<Vec<DeviceAddress>>>()?,
                gpu: gpu.parse()?,
                companion: Some(companion.parse()?),
            })
        })
        .collect()
}

impl Config {
    /// Parse and validate TOML text
    ///
    /// # Errors
    ///
    /// Returns `RebarError::Config` on syntax errors, unknown keys, an
    /// out-of-range target index, or an invalid topology.
    pub fn from_toml(text: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| RebarError::config(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Read and validate a TOML file
    ///
    /// # Errors
    ///
    /// Returns `RebarError::ConfigFile` if the file cannot be read, otherwise
    /// as [`Config::from_toml`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| RebarError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Self::from_toml(&text)
    }

    /// Resolve the configuration source: explicit path, then `REBAR_CONFIG`,
    /// then built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the selected file is unreadable or invalid.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        tracing::debug!("No configuration file, using built-in topology");
        Self::from_raw(RawConfig::default())
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let target = SizeIndex::new(raw.target_size_index)
            .map_err(|e| RebarError::config(e.to_string()))?;

        if raw.timing.rescan_attempts == 0 {
            return Err(RebarError::config("timing.rescan_attempts must be at least 1"));
        }
        if raw.driver.trim().is_empty() {
            return Err(RebarError::config("driver must not be empty"));
        }
        if raw.verify.min_window_gib.checked_mul(1 << 30).is_none() {
            return Err(RebarError::config("verify.min_window_gib out of range"));
        }
        if raw.verify.original_window_mib.checked_mul(1 << 20).is_none() {
            return Err(RebarError::config("verify.original_window_mib out of range"));
        }

        let groups = if raw.group.is_empty() {
            default_groups()?
        } else {
            raw.group
        };

        Ok(Self {
            driver: raw.driver,
            target,
            register_offset: raw.register_offset,
            bar_index: raw.bar_index,
            visible_memory_attribute: raw.visible_memory_attribute,
            topology: Topology::from_groups(groups)?,
            timing: raw.timing,
            verify: raw.verify,
            preflight: raw.preflight,
            paths: raw.paths,
        })
    }

    /// Override the target size index
    ///
    /// # Errors
    ///
    /// Returns `RebarError::Config` if `index > 63`.
    pub fn with_target(mut self, index: u8) -> Result<Self> {
        self.target = SizeIndex::new(index).map_err(|e| RebarError::config(e.to_string()))?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.driver, "amdgpu");
        assert_eq!(config.target, SizeIndex::GIB_32);
        assert_eq!(config.register_offset, 0x208);
        assert_eq!(config.topology.gpu_devices().len(), 4);
        assert_eq!(config.topology.bridge_chain().len(), 12);
        assert_eq!(config.verify.min_window_bytes(), 16 << 30);
        assert_eq!(config.verify.original_window_bytes(), 256 << 20);
    }

    #[test]
    fn parses_groups_and_sections() {
        let text = r#"
            driver = "amdgpu"
            target_size_index = 14
            register_offset = 0x1a8

            [[group]]
            bridge = "0000:80:03.1"
            chain = ["0000:81:00.0"]
            gpu = "0000:83:00.0"

            [timing]
            rescan_attempts = 5
            rescan_interval_ms = 10

            [verify]
            peer_error_signature = "p2p failed"
        "#;
        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.target.get(), 14);
        assert_eq!(config.register_offset, 0x1a8);
        assert_eq!(config.topology.gpu_devices().len(), 1);
        assert!(config.topology.companion_devices().is_empty());
        assert_eq!(config.timing.rescan_attempts, 5);
        assert_eq!(config.timing.settle_fresh_ms, 15_000);
        assert_eq!(config.verify.peer_error_signature, "p2p failed");
    }

    #[test]
    fn sample_file_matches_defaults() {
        let sample = Config::from_toml(include_str!("../../../config/rebar.toml")).unwrap();
        let builtin = Config::from_toml("").unwrap();
        assert_eq!(sample.topology, builtin.topology);
        assert_eq!(sample.target, builtin.target);
        assert_eq!(sample.paths.sysfs_root, builtin.paths.sysfs_root);
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebar.toml");
        std::fs::write(&path, "driver = \"nvidia\"\n").unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().driver, "nvidia");
        assert!(matches!(
            Config::load(Some(&dir.path().join("missing.toml"))),
            Err(RebarError::ConfigFile { .. })
        ));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::from_toml("target_size_index = 64").is_err());
        assert!(Config::from_toml("[timing]\nrescan_attempts = 0").is_err());
        assert!(Config::from_toml("unknown_key = 1").is_err());
        assert!(Config::from_toml("[verify]\nmin_window_gib = 17179869184").is_err());
        assert!(Config::from_toml("[verify]\noriginal_window_mib = 17592186044416").is_err());
        assert!(Config::from_toml("[verify]\nmin_window_gib = 17179869183").is_ok());
        let bad_group = "[[group]]\nbridge = \"bogus\"\ngpu = \"0000:03:00.0\"";
        assert!(Config::from_toml(bad_group).is_err());
        assert!(Config::from_toml("").unwrap().with_target(70).is_err());
    }
}
