//! Resizable BAR reconfiguration for GPUs behind PCIe switch chains.
//!
//! Firmware often enumerates large-memory GPUs with a 256 MB BAR. This crate
//! writes a larger size index into each GPU's Resizable BAR control register,
//! removes the bridge subtrees, rescans so the kernel re-assigns windows at
//! the new size, then reloads the GPU driver and verifies the result.
//!
//! # Procedure
//!
//! ```text
//! unbind drivers → write size index (read back) → remove subtrees
//!   → rescan (bounded poll) → load driver → verify
//! ```
//!
//! A failed register write aborts before anything is removed. After removal,
//! [`DriverGuard`] makes sure the driver is loaded again whatever happens.
//!
//! # Quick start
//!
//! ```no_run
//! use rebar_driver::{diagnostics, BusOperator, Config, SysfsBus};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?;
//! let mut bus = SysfsBus::from_paths(&config.paths);
//! let before = diagnostics::diagnose(&bus, &config);
//! let report = BusOperator::new(&mut bus, &config).run(&before)?;
//! println!("resized: {}", report.passed());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
pub mod config;
pub mod diagnostics;
mod error;
pub mod guard;
pub mod operator;
pub mod port;
pub mod preflight;
pub mod register;
pub mod topology;

pub use backends::{MemoryBus, SysfsBus};
pub use config::{Config, CONFIG_ENV};
pub use diagnostics::{Snapshot, VerificationReport, Verdict};
pub use error::{RebarError, Result};
pub use guard::DriverGuard;
pub use operator::{BusOperator, Phase, ProcedureReport};
pub use port::BusPort;
pub use register::{ControlRegister, OperationResult};
pub use topology::{BridgeGroup, DeviceAddress, Topology};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BusOperator, BusPort, Config, DeviceAddress, MemoryBus, Phase, ProcedureReport,
        RebarError, Result, SysfsBus, Topology,
    };
}
