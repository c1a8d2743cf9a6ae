// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Global addresses.
//!
//! The owning rank lives in the top 16 bits, the rest is an offset into that
//! rank's segment. Offset 1 names the locality itself.

use std::fmt;

/// A participating process.
pub type Rank = u32;

const RANK_SHIFT: u32 = 48;
const OFFSET_MASK: u64 = (1 << RANK_SHIFT) - 1;
const LOCALITY: u64 = 1;

/// Most ranks an address can name.
pub const MAX_RANKS: u32 = 1 << 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GlobalAddr(u64);

impl GlobalAddr {
    pub const NULL: GlobalAddr = GlobalAddr(0);

    pub fn new(rank: Rank, offset: u64) -> Self {
        debug_assert!(rank < MAX_RANKS);
        GlobalAddr(((rank as u64) << RANK_SHIFT) | (offset & OFFSET_MASK))
    }

    /// The address of a locality, used as the target of rank-level actions.
    pub fn there(rank: Rank) -> Self {
        Self::new(rank, LOCALITY)
    }

    pub fn from_bits(bits: u64) -> Self {
        GlobalAddr(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Rank encoded in the address.
    pub fn rank(self) -> Rank {
        (self.0 >> RANK_SHIFT) as Rank
    }

    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

impl fmt::Debug for GlobalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("NULL");
        }
        write!(f, "{}:{:#x}", self.rank(), self.offset())
    }
}

impl fmt::Display for GlobalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_and_offset_split() {
        let a = GlobalAddr::new(3, 0x40);
        assert_eq!(a.rank(), 3);
        assert_eq!(a.offset(), 0x40);
        assert_eq!(GlobalAddr::from_bits(a.bits()), a);
    }

    #[test]
    fn locality_is_not_null() {
        assert!(GlobalAddr::NULL.is_null());
        assert!(!GlobalAddr::there(0).is_null());
        assert_eq!(GlobalAddr::there(7).rank(), 7);
    }
}
