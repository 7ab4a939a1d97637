//! In-memory leaf store.

use crate::entry::CoinFlags;
use crate::view::{CoinsCursor, CoinsView};
use crate::{CoinsMap, Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint};
use quartzcoin_primitives::Coin;
use std::collections::HashMap;

/// An in-memory coins store, usable as the bottom of a view stack.
///
/// Spent coins written down by a cache are retained as tombstones, the way a
/// durable store may keep a deletion marker around; fetching such an entry
/// lets an upper cache mark its copy FRESH. Hosts with a real database use
/// their own [`CoinsView`] implementation instead.
#[derive(Debug)]
pub struct MemoryCoinsView {
    coins: HashMap<OutPoint, Coin>,
    best_block: BlockHash,
    fail_reads: bool,
}

impl Default for MemoryCoinsView {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoinsView {
    pub fn new() -> Self {
        Self {
            coins: HashMap::new(),
            best_block: BlockHash::all_zeros(),
            fail_reads: false,
        }
    }

    /// Seed a coin directly, bypassing the write path. The coin may be a
    /// spent tombstone.
    pub fn insert_coin(&mut self, outpoint: OutPoint, coin: Coin) {
        self.coins.insert(outpoint, coin);
    }

    /// Direct lookup, tombstones included.
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.coins.get(outpoint)
    }

    /// Number of stored entries, tombstones included.
    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    /// Make every subsequent read fail, simulating a broken database.
    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }
}

impl CoinsView for MemoryCoinsView {
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        if self.fail_reads {
            return Err(Error::Read("simulated database failure".to_string()));
        }
        Ok(self.coins.get(outpoint).cloned())
    }

    fn best_block(&mut self) -> BlockHash {
        self.best_block
    }

    fn batch_write(
        &mut self,
        coins: &mut CoinsMap,
        best_block: BlockHash,
        erase: bool,
        partial: bool,
    ) -> Result<()> {
        let store = &mut self.coins;
        coins.retain(|outpoint, entry| {
            if partial && !entry.flags.contains(CoinFlags::FLUSH) {
                // Left behind for a later full flush.
                return true;
            }
            if entry.flags.contains(CoinFlags::DIRTY) {
                if entry.coin.is_spent() && entry.flags.contains(CoinFlags::FRESH) {
                    // Known to be absent here already; nothing to record.
                    store.remove(outpoint);
                } else {
                    store.insert(*outpoint, entry.coin.clone());
                }
            }
            !erase
        });
        self.best_block = best_block;
        Ok(())
    }

    fn cursor(&mut self) -> Option<CoinsCursor<'_>> {
        Some(Box::new(
            self.coins.iter().map(|(outpoint, coin)| (*outpoint, coin.clone())),
        ))
    }

    fn estimate_size(&mut self) -> usize {
        self.coins
            .iter()
            .map(|(_, coin)| {
                std::mem::size_of::<(OutPoint, Coin)>() + coin.dynamic_memory_usage()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Amount, ScriptBuf, TxOut, Txid};

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([byte; 32]), vout)
    }

    fn coin(value: u64, script_len: usize) -> Coin {
        Coin::from_txout(
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51; script_len]),
            },
            1,
            false,
        )
    }

    #[test]
    fn test_get_coin_returns_tombstones() {
        let mut store = MemoryCoinsView::new();
        let spent = outpoint(1, 0);
        let mut tombstone = coin(1000, 10);
        tombstone.clear();
        store.insert_coin(spent, tombstone);

        assert!(store.get_coin(&spent).unwrap().unwrap().is_spent());
        assert!(!store.have_coin(&spent).unwrap());
        assert!(store.get_coin(&outpoint(2, 0)).unwrap().is_none());
    }

    #[test]
    fn test_cursor_yields_every_entry() {
        let mut store = MemoryCoinsView::new();
        for i in 0..5 {
            store.insert_coin(outpoint(i, 0), coin(1000 * u64::from(i) + 1, 10));
        }

        let seen: Vec<_> = store.cursor().unwrap().collect();
        assert_eq!(seen.len(), 5);
        for (op, c) in seen {
            assert_eq!(store.get(&op), Some(&c));
        }
    }

    #[test]
    fn test_failed_reads_surface_as_errors() {
        let mut store = MemoryCoinsView::new();
        store.insert_coin(outpoint(1, 0), coin(1000, 10));
        store.set_fail_reads(true);
        assert!(store.get_coin(&outpoint(1, 0)).is_err());
    }
}
