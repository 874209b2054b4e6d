//! BAR and bridge window layout as exposed by sysfs.
//!
//! `/sys/bus/pci/devices/{addr}/resource` holds one line per resource:
//!
//! ```text
//! line  contents
//! ────  ───────────────────────────────────────────────
//!  0-5  BAR0..BAR5
//!   6   expansion ROM
//!  7-12 SR-IOV BARs
//!  13   bridge I/O window
//!  14   bridge memory window
//!  15   bridge prefetchable memory window
//! ```
//!
//! Each line is `start end flags` in `0x`-prefixed hex. Unassigned
//! resources read as all zeros.

/// Resource line carrying a bridge's prefetchable memory window.
pub const BRIDGE_PREFETCH_WINDOW_LINE: usize = 15;

/// `IORESOURCE_PREFETCH`.
pub const FLAG_PREFETCH: u64 = 0x0000_2000;

/// `IORESOURCE_MEM_64`.
pub const FLAG_MEM_64: u64 = 0x0010_0000;

/// Size of a GPU BAR before resizing on the target boards (256 MB).
pub const ORIGINAL_WINDOW: u64 = 256 * 1024 * 1024;

/// Minimum window accepted as "resized" (16 GB).
pub const LARGE_WINDOW: u64 = 16 * 1024 * 1024 * 1024;

/// One assigned resource from a sysfs `resource` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceWindow {
    /// Bus address of the first byte.
    pub start: u64,
    /// Bus address of the last byte.
    pub end: u64,
    /// Kernel `IORESOURCE_*` flags.
    pub flags: u64,
}

impl ResourceWindow {
    /// Window length in bytes, saturating at `u64::MAX` for a window
    /// spanning the whole address space.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    /// Prefetchable memory.
    #[must_use]
    pub const fn is_prefetchable(&self) -> bool {
        self.flags & FLAG_PREFETCH != 0
    }

    /// 64-bit memory.
    #[must_use]
    pub const fn is_64bit(&self) -> bool {
        self.flags & FLAG_MEM_64 != 0
    }
}

/// Parse one line of a sysfs `resource` file.
///
/// Returns `None` for unassigned (all-zero) or malformed lines.
#[must_use]
pub fn parse_resource_line(line: &str) -> Option<ResourceWindow> {
    let mut parts = line.split_whitespace().map(parse_hex);
    let start = parts.next()??;
    let end = parts.next()??;
    let flags = parts.next()??;

    if (start == 0 && end == 0) || end < start {
        return None;
    }

    Some(ResourceWindow { start, end, flags })
}

/// Resource `line` of a whole `resource` file.
#[must_use]
pub fn resource_at(content: &str, line: usize) -> Option<ResourceWindow> {
    content.lines().nth(line).and_then(parse_resource_line)
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

/// Human-readable byte count in binary units (`1 << 35` → `"32 GB"`).
#[must_use]
pub fn format_size(bytes: u128) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

    let mut unit = 0;
    let mut scale: u128 = 1;
    while unit + 1 < UNITS.len() && bytes >= scale * 1024 {
        scale *= 1024;
        unit += 1;
    }

    if bytes % scale == 0 {
        format!("{} {}", bytes / scale, UNITS[unit])
    } else {
        // Display only; precision loss is fine.
        #[allow(clippy::cast_precision_loss)]
        let value = bytes as f64 / scale as f64;
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assigned_line() {
        let w = parse_resource_line("0x0000038000000000 0x00000387ffffffff 0x000000000014220c")
            .unwrap();
        assert_eq!(w.size(), 32 * 1024 * 1024 * 1024);
        assert!(w.is_prefetchable());
        assert!(w.is_64bit());
    }

    #[test]
    fn unassigned_line_is_none() {
        assert!(parse_resource_line("0x0000000000000000 0x0000000000000000 0x0000000000000000")
            .is_none());
        assert!(parse_resource_line("garbage").is_none());
    }

    #[test]
    fn full_address_space_window_saturates() {
        let w = parse_resource_line("0x0000000000000000 0xffffffffffffffff 0x0000000000102201")
            .unwrap();
        assert_eq!(w.size(), u64::MAX);
        let one = ResourceWindow { start: 0x1000, end: 0x1000, flags: 0 };
        assert_eq!(one.size(), 1);
    }

    #[test]
    fn picks_bridge_prefetch_line() {
        let mut lines = vec!["0x0 0x0 0x0".to_string(); 16];
        lines[BRIDGE_PREFETCH_WINDOW_LINE] =
            "0x0000038000000000 0x000003801fffffff 0x0000000000102201".to_string();
        let content = lines.join("\n");
        let w = resource_at(&content, BRIDGE_PREFETCH_WINDOW_LINE).unwrap();
        assert_eq!(w.size(), 512 * 1024 * 1024);
        assert!(resource_at(&content, 0).is_none());
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_size(1 << 35), "32 GB");
        assert_eq!(format_size(256 * 1024 * 1024), "256 MB");
        assert_eq!(format_size(1536 * 1024 * 1024), "1.5 GB");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(0), "0 B");
    }
}
