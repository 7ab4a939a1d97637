//! Cache entry record and its flag set.

use bitcoin::OutPoint;
use quartzcoin_primitives::Coin;
use std::collections::HashMap;
use std::ops::BitOr;

/// Per-entry state flags of a cached coin.
///
/// The permitted flag/spent combinations are:
///
/// | flags           | spent | meaning |
/// |-----------------|-------|---------|
/// | (none)          | no    | clean copy of the backing store |
/// | DIRTY           | no    | modified, must be written down |
/// | DIRTY + FRESH   | no    | created here, absent below |
/// | DIRTY           | yes   | spentness must be written down |
/// | FRESH           | yes   | tombstone fetched from below |
///
/// FRESH alone on an unspent entry, an unflagged spent entry, and
/// DIRTY + FRESH on a spent entry never occur. FLUSH may be combined with
/// any of the above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoinFlags(u8);

impl CoinFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The entry differs from what the backing store holds.
    pub const DIRTY: Self = Self(1 << 0);
    /// The backing store is known to hold no unspent entry for this outpoint.
    pub const FRESH: Self = Self(1 << 1);
    /// The entry is prioritized for partial flushing.
    pub const FLUSH: Self = Self(1 << 2);

    /// Whether all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Whether no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CoinFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A cached coin together with its state flags.
#[derive(Debug, Clone)]
pub struct CoinsCacheEntry {
    /// The coin, possibly a spent tombstone.
    pub coin: Coin,
    /// Flag set, see [`CoinFlags`].
    pub flags: CoinFlags,
}

impl CoinsCacheEntry {
    /// Entry with no flags set.
    pub fn new(coin: Coin) -> Self {
        Self {
            coin,
            flags: CoinFlags::NONE,
        }
    }
}

/// The staged entry table of a cache layer.
///
/// Keys are unique, iteration order is unspecified, and entries own their
/// coins; dropping or replacing the map releases all entry memory in one
/// step.
pub type CoinsMap = HashMap<OutPoint, CoinsCacheEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_operations() {
        let mut flags = CoinFlags::NONE;
        assert!(flags.is_empty());

        flags.insert(CoinFlags::DIRTY);
        flags.insert(CoinFlags::FRESH);
        assert!(flags.contains(CoinFlags::DIRTY));
        assert!(flags.contains(CoinFlags::DIRTY | CoinFlags::FRESH));
        assert!(!flags.contains(CoinFlags::FLUSH));

        flags.remove(CoinFlags::FRESH);
        assert!(!flags.contains(CoinFlags::FRESH));
        assert!(flags.contains(CoinFlags::DIRTY));
    }
}
