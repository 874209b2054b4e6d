//! Error types for BAR resize operations

use crate::topology::DeviceAddress;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for resize operations
pub type Result<T> = std::result::Result<T, RebarError>;

/// Errors that can occur while resizing and re-enumerating devices
#[derive(Debug, Error)]
pub enum RebarError {
    /// A prerequisite for mutating the bus is missing
    #[error("Precondition failed: {reason}")]
    Precondition {
        /// What is missing
        reason: String,
    },

    /// One or more size-index writes did not latch
    #[error("Register write failed on {failed} of {total} device(s)")]
    RegisterWrite {
        /// Devices whose write failed
        failed: usize,
        /// Devices attempted
        total: usize,
    },

    /// Driver could not be detached from a device
    #[error("Cannot unbind {address}: {reason}")]
    Unbind {
        /// Device address
        address: DeviceAddress,
        /// Reason for failure
        reason: String,
    },

    /// Bridge subtree could not be removed
    #[error("Cannot remove {address}: {reason}")]
    Removal {
        /// Bridge address
        address: DeviceAddress,
        /// Reason for failure
        reason: String,
    },

    /// Not every GPU came back after the rescan
    #[error("Rescan timeout after {waited_ms}ms: {present} of {expected} device(s) present")]
    RescanTimeout {
        /// Devices observed present
        present: usize,
        /// Devices expected
        expected: usize,
        /// Total time waited in milliseconds
        waited_ms: u64,
    },

    /// Driver module could not be loaded
    #[error("Failed to load driver {driver}: {reason}")]
    DriverLoad {
        /// Driver (module) name
        driver: String,
        /// Reason for failure
        reason: String,
    },

    /// Malformed PCI address
    #[error("Invalid PCI address {input:?}: {reason}")]
    InvalidAddress {
        /// Offending input
        input: String,
        /// Reason for rejection
        reason: &'static str,
    },

    /// Configuration could not be loaded or is inconsistent
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Reason for rejection
        reason: String,
    },

    /// Configuration file could not be read
    #[error("Cannot read {path}: {source}")]
    ConfigFile {
        /// File that was read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// I/O error during sysfs access
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Procedure step invoked out of order
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Hardware-level failure reported by the bus
    #[error("Hardware error: {reason}")]
    Hardware {
        /// Reason for failure
        reason: String,
    },
}

impl RebarError {
    /// Create a precondition error
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition {
            reason: reason.into(),
        }
    }

    /// Create a driver load error
    pub fn driver_load(driver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DriverLoad {
            driver: driver.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a hardware error
    pub fn hardware_error(reason: impl Into<String>) -> Self {
        Self::Hardware {
            reason: reason.into(),
        }
    }

    /// Whether the bus topology may already have been changed when this error
    /// was raised.
    pub const fn is_post_removal(&self) -> bool {
        matches!(self, Self::RescanTimeout { .. } | Self::DriverLoad { .. })
    }
}
