//! Resizable BAR control register codec.
//!
//! Layout of the per-BAR control register inside the Resizable BAR extended
//! capability (PCIe Base Spec, §7.8.6):
//!
//! ```text
//!  31            16 15  14 13        8 7   5 4  3 2      0
//! ┌────────────────┬──────┬───────────┬─────┬────┬────────┐
//! │ upper sizes    │ rsvd │ BAR size  │ #   │rsvd│ BAR idx│
//! └────────────────┴──────┴───────────┴─────┴────┴────────┘
//! ```
//!
//! Only the six-bit `BAR size` field is ever modified. Every other bit is
//! carried over from the last read value.

use std::fmt;

/// Offset of the BAR0 control register when the capability sits at `0x200`.
pub const DEFAULT_CONTROL_OFFSET: u16 = 0x208;

/// Bit position of the size-index field.
pub const SIZE_SHIFT: u32 = 8;

/// Width of the size-index field in bits.
pub const SIZE_BITS: u32 = 6;

/// Size-index field mask, unshifted.
pub const SIZE_FIELD: u32 = (1 << SIZE_BITS) - 1;

/// Size-index field mask in register position.
pub const SIZE_MASK: u32 = SIZE_FIELD << SIZE_SHIFT;

/// Largest encodable index.
pub const MAX_SIZE_INDEX: u8 = 63;

/// Index 0 encodes 1 MiB.
pub const SIZE_BASE_SHIFT: u32 = 20;

/// A BAR size selector: `bytes = 1 MiB << index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeIndex(u8);

impl SizeIndex {
    /// 32 GiB.
    pub const GIB_32: Self = Self(15);

    /// Construct an index, rejecting anything wider than the register field.
    ///
    /// # Errors
    ///
    /// Returns [`IndexOutOfRange`] if `index > 63`.
    pub const fn new(index: u8) -> Result<Self, IndexOutOfRange> {
        if index > MAX_SIZE_INDEX {
            Err(IndexOutOfRange(index))
        } else {
            Ok(Self(index))
        }
    }

    /// Raw index value.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Size selected by this index, in bytes.
    #[must_use]
    pub const fn bytes(self) -> u128 {
        size_index_to_bytes(self)
    }
}

impl fmt::Display for SizeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for SizeIndex {
    type Error = IndexOutOfRange;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::new(index)
    }
}

/// Size index does not fit the six-bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOutOfRange(pub u8);

impl fmt::Display for IndexOutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size index {} does not fit in {SIZE_BITS} bits (max {MAX_SIZE_INDEX})",
            self.0
        )
    }
}

impl std::error::Error for IndexOutOfRange {}

/// Extract the size index from a raw control register value.
#[must_use]
pub const fn decode_size_index(value: u32) -> SizeIndex {
    // Six bits after masking, always in range.
    #[allow(clippy::cast_possible_truncation)]
    let index = ((value & SIZE_MASK) >> SIZE_SHIFT) as u8;
    SizeIndex(index)
}

/// Replace the size-index field of `value` with `index`.
///
/// # Errors
///
/// Returns [`IndexOutOfRange`] if `index` is wider than six bits. The value is
/// never silently truncated.
pub const fn encode_size_index(value: u32, index: u8) -> Result<u32, IndexOutOfRange> {
    if index > MAX_SIZE_INDEX {
        return Err(IndexOutOfRange(index));
    }
    Ok((value & !SIZE_MASK) | ((index as u32) << SIZE_SHIFT))
}

/// Bytes selected by `index`. Reporting only.
#[must_use]
pub const fn size_index_to_bytes(index: SizeIndex) -> u128 {
    1u128 << (index.0 as u32 + SIZE_BASE_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reads_bits_13_to_8() {
        assert_eq!(decode_size_index(0x0000_0800).get(), 8);
        assert_eq!(decode_size_index(0x0000_3F00).get(), 63);
        assert_eq!(decode_size_index(0xFFFF_00FF).get(), 0);
    }

    #[test]
    fn encode_preserves_other_bits() {
        let samples = [0u32, 0xFFFF_FFFF, 0x0FFF_E0C0, 0x1234_5678, 0x0000_0820];
        for value in samples {
            for index in [0u8, 1, 8, 15, 42, 63] {
                let encoded = encode_size_index(value, index).unwrap();
                assert_eq!(decode_size_index(encoded).get(), index);
                assert_eq!(encoded & !SIZE_MASK, value & !SIZE_MASK, "{value:#x} / {index}");
            }
        }
    }

    #[test]
    fn encode_rejects_wide_index() {
        assert_eq!(encode_size_index(0, 64), Err(IndexOutOfRange(64)));
        assert_eq!(encode_size_index(0, 255), Err(IndexOutOfRange(255)));
        assert!(SizeIndex::new(64).is_err());
    }

    #[test]
    fn index_to_bytes() {
        assert_eq!(size_index_to_bytes(SizeIndex::new(0).unwrap()), 1 << 20);
        assert_eq!(size_index_to_bytes(SizeIndex::GIB_32), 1 << 35);
        assert_eq!(SizeIndex::new(8).unwrap().bytes(), 256 * 1024 * 1024);
        assert_eq!(SizeIndex::new(63).unwrap().bytes(), 1u128 << 83);
    }
}
