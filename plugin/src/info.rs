//! Helper info record
//!
//! A 64-bit value built at translation time, baked into the generated helper
//! call and decoded by the plugin at run time. Both sides must agree on the
//! layout bit for bit:
//!
//! ```text
//!  63                      32 31            16 15             0
//! +--------------------------+----------------+----------------+
//! |  icount  /  access kind  |      size      |   cpu_index    |
//! +--------------------------+----------------+----------------+
//! ```
//!
//! The upper half is a union: block helpers carry the instruction count,
//! memory-access helpers carry a single character code in its low byte.

use std::fmt;

#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HelperInfo(u64);

const _: () = assert!(std::mem::size_of::<HelperInfo>() == 8);

impl HelperInfo {
    /// Info describing a whole block.
    pub const fn for_block(cpu_index: u16, size: u16, icount: u32) -> Self {
        Self((cpu_index as u64) | ((size as u64) << 16) | ((icount as u64) << 32))
    }

    /// Info describing a single memory access (`b'r'`, `b'w'`, ...).
    pub const fn for_access(cpu_index: u16, size: u16, kind: u8) -> Self {
        Self((cpu_index as u64) | ((size as u64) << 16) | ((kind as u64) << 32))
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn to_bits(self) -> u64 {
        self.0
    }

    pub const fn cpu_index(self) -> u16 {
        self.0 as u16
    }

    pub const fn size(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn icount(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn access_kind(self) -> u8 {
        (self.0 >> 32) as u8
    }
}

impl fmt::Debug for HelperInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperInfo")
            .field("cpu_index", &self.cpu_index())
            .field("size", &self.size())
            .field("icount", &self.icount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout() {
        let info = HelperInfo::for_block(3, 16, 4);
        assert_eq!(info.to_bits(), 0x0000_0004_0010_0003);
        assert_eq!(info.cpu_index(), 3);
        assert_eq!(info.size(), 16);
        assert_eq!(info.icount(), 4);
    }

    #[test]
    fn test_access_kind_shares_union() {
        let info = HelperInfo::for_access(1, 8, b'w');
        assert_eq!(info.access_kind(), b'w');
        assert_eq!(info.icount(), b'w' as u32);
        assert_eq!(info.size(), 8);
    }

    #[test]
    fn test_fields_do_not_bleed() {
        let info = HelperInfo::for_block(u16::MAX, 0, u32::MAX);
        assert_eq!(info.size(), 0);
        assert_eq!(info.cpu_index(), u16::MAX);
        assert_eq!(info.icount(), u32::MAX);
    }
}
