//! Guest address filter

use std::fmt;

/// Half-open range `[low, high)` of guest addresses to instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub low: u64,
    pub high: u64,
}

impl AddressRange {
    pub const ALL: AddressRange = AddressRange {
        low: 0,
        high: u64::MAX,
    };

    pub const fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    pub const fn contains(&self, addr: u64) -> bool {
        self.low <= addr && addr < self.high
    }

    pub const fn is_empty(&self) -> bool {
        self.low >= self.high
    }
}

impl Default for AddressRange {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_open() {
        let range = AddressRange::new(0x1000, 0x2000);
        assert!(!range.contains(0x500));
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1500));
        assert!(range.contains(0x1fff));
        assert!(!range.contains(0x2000));
    }

    #[test]
    fn test_default_covers_everything_but_max() {
        let range = AddressRange::default();
        assert!(range.contains(0));
        assert!(range.contains(u64::MAX - 1));
        assert!(!range.contains(u64::MAX));
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let range = AddressRange::new(0x2000, 0x1000);
        assert!(range.is_empty());
        assert!(!range.contains(0x1800));
    }
}
