//! Register and window model for PCIe Resizable BAR reconfiguration.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the bits involved: the Resizable BAR control register, the
//! size-index encoding, and the sysfs `resource` layout used to read back
//! BAR and bridge window sizes.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Control register codec, size-index math |
//! | [`bar`] | sysfs resource lines, bridge window line, size formatting |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod regs;

pub use bar::{format_size, ResourceWindow};
pub use regs::{
    decode_size_index, encode_size_index, size_index_to_bytes, IndexOutOfRange, SizeIndex,
};
