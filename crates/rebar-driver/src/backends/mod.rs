//! Bus port implementations
//!
//! - **Sysfs**: the live kernel PCI interface (requires root for writes)
//! - **Memory**: simulated topology for rehearsals and tests

pub mod memory;
pub mod sysfs;

pub use memory::MemoryBus;
pub use sysfs::SysfsBus;
