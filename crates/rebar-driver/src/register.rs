//! Resizable BAR control register access
//!
//! Writes are only reported successful after a read-back shows the new size
//! index: config writes on these devices do not always latch synchronously.

use crate::error::Result;
use crate::port::BusPort;
use crate::topology::DeviceAddress;
use rebar_chip::regs::{decode_size_index, encode_size_index, SizeIndex};

/// Outcome of resizing one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// Device written
    pub address: DeviceAddress,
    /// Size index observed before the write
    pub before: Option<SizeIndex>,
    /// Size index observed after the write
    pub after: Option<SizeIndex>,
    /// Whether `after` equals the target
    pub succeeded: bool,
    /// Why the write failed, or that it was skipped
    pub reason: Option<String>,
}

impl OperationResult {
    fn failed(address: &DeviceAddress, before: Option<SizeIndex>, reason: String) -> Self {
        Self {
            address: address.clone(),
            before,
            after: None,
            succeeded: false,
            reason: Some(reason),
        }
    }
}

/// Control register at a fixed config-space offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegister {
    offset: u16,
}

impl ControlRegister {
    /// Register at `offset`
    #[must_use]
    pub const fn new(offset: u16) -> Self {
        Self { offset }
    }

    /// Config-space offset
    #[must_use]
    pub const fn offset(&self) -> u16 {
        self.offset
    }

    /// Raw register value, `None` while the device is absent
    ///
    /// # Errors
    ///
    /// Returns error if the device is present but unreadable.
    pub fn read<P: BusPort + ?Sized>(
        &self,
        port: &P,
        address: &DeviceAddress,
    ) -> Result<Option<u32>> {
        port.read_config_u32(address, self.offset)
    }

    /// Current size index, `None` if unavailable for any reason
    pub fn size_index<P: BusPort + ?Sized>(
        &self,
        port: &P,
        address: &DeviceAddress,
    ) -> Option<SizeIndex> {
        match self.read(port, address) {
            Ok(value) => value.map(decode_size_index),
            Err(e) => {
                tracing::debug!("{address}: register unreadable: {e}");
                None
            }
        }
    }

    /// Set the size index, verifying by read-back
    ///
    /// Already at `target` → no write, reported as success.
    pub fn write_size_index<P: BusPort + ?Sized>(
        &self,
        port: &mut P,
        address: &DeviceAddress,
        target: SizeIndex,
    ) -> OperationResult {
        let current = match self.read(port, address) {
            Ok(Some(value)) => value,
            Ok(None) => {
                return OperationResult::failed(address, None, "register not available".into())
            }
            Err(e) => return OperationResult::failed(address, None, e.to_string()),
        };

        let before = decode_size_index(current);
        if before == target {
            tracing::info!("{address}: already at size index {target}, skipping write");
            return OperationResult {
                address: address.clone(),
                before: Some(before),
                after: Some(before),
                succeeded: true,
                reason: Some("already at target".into()),
            };
        }

        let value = match encode_size_index(current, target.get()) {
            Ok(value) => value,
            Err(e) => return OperationResult::failed(address, Some(before), e.to_string()),
        };

        tracing::debug!(
            "{address}: control {current:#010x} -> {value:#010x} (index {before} -> {target})"
        );

        if let Err(e) = port.write_config_u32(address, self.offset, value) {
            return OperationResult::failed(address, Some(before), e.to_string());
        }

        let after = self.size_index(port, address);
        let succeeded = after == Some(target);
        let reason = if succeeded {
            None
        } else {
            Some(match after {
                Some(found) => format!("read back size index {found}, expected {target}"),
                None => "register not readable after write".to_string(),
            })
        };

        OperationResult {
            address: address.clone(),
            before: Some(before),
            after,
            succeeded,
            reason,
        }
    }
}
