//! The layered write-through cache over a coins view.

use crate::entry::{CoinFlags, CoinsCacheEntry, CoinsMap};
use crate::view::{CoinsCursor, CoinsView, CoinsViewBacked};
use crate::Result;
use bitcoin::constants::WITNESS_SCALE_FACTOR;
use bitcoin::hashes::Hash;
use bitcoin::{consensus, BlockHash, OutPoint, Script, Transaction, TxOut, Txid, Weight};
use quartzcoin_primitives::Coin;
use std::sync::LazyLock;

/// Consensus limit on a script carried by an output.
const MAX_SCRIPT_SIZE: usize = 10_000;

/// Shared return value of [`CoinsViewCache::access_coin`] for "no coin here".
/// Callers must not mutate through it.
static COIN_EMPTY: Coin = Coin {
    output: TxOut::NULL,
    height: 0,
    is_coinbase: false,
};

/// Upper bound on the output index scanned by [`access_by_txid`]: no block
/// can carry more outputs than fit its weight limit at the minimum output
/// weight.
fn max_outputs_per_block() -> u32 {
    static CAP: LazyLock<u32> = LazyLock::new(|| {
        let min_output_weight = WITNESS_SCALE_FACTOR * consensus::serialize(&TxOut::NULL).len();
        (Weight::MAX_BLOCK.to_wu() / min_output_weight as u64) as u32
    });
    *CAP
}

fn is_unspendable(script: &Script) -> bool {
    script.is_op_return() || script.len() > MAX_SCRIPT_SIZE
}

/// A cache layer over another coins view.
///
/// Reads populate the local entry table from the backing store; writes are
/// staged locally with DIRTY/FRESH flags and reach the store in bulk via
/// [`CoinsViewCache::flush`] or [`CoinsViewCache::sync`]. Layers compose:
/// the backing store may itself be another cache.
///
/// The cache keeps two memory counters in lockstep with the table: the
/// total dynamic memory of all cached coins, and the share belonging to
/// FLUSH-tagged entries, which drives the partial-flush decision.
pub struct CoinsViewCache<'a> {
    base: CoinsViewBacked<'a>,
    cache_coins: CoinsMap,
    /// Lazily populated from the backing store on first read.
    best_block: Option<BlockHash>,
    cached_coins_usage: usize,
    flush_coins_usage: usize,
    flush_count: usize,
}

impl<'a> CoinsViewCache<'a> {
    pub fn new(base: &'a mut dyn CoinsView) -> Self {
        Self {
            base: CoinsViewBacked::new(base),
            cache_coins: CoinsMap::default(),
            best_block: None,
            cached_coins_usage: 0,
            flush_coins_usage: 0,
            flush_count: 0,
        }
    }

    /// Swap the backing store.
    pub fn set_backend(&mut self, base: &'a mut dyn CoinsView) {
        self.base.set_backend(base);
    }

    fn memory_add(&mut self, usage: usize, flags: CoinFlags) {
        self.cached_coins_usage += usage;
        if flags.contains(CoinFlags::FLUSH) {
            self.flush_count += 1;
            self.flush_coins_usage += usage;
        }
        assert!(self.flush_coins_usage <= self.cached_coins_usage);
    }

    fn memory_sub(&mut self, usage: usize, flags: CoinFlags) {
        self.cached_coins_usage -= usage;
        if flags.contains(CoinFlags::FLUSH) {
            assert!(self.flush_count > 0);
            assert!(self.flush_coins_usage >= usage);
            self.flush_count -= 1;
            self.flush_coins_usage -= usage;
        }
        assert!(self.flush_coins_usage <= self.cached_coins_usage);
    }

    /// Look up an entry, fetching it from the backing store on a local miss.
    ///
    /// A miss below inserts nothing. A spent coin handed back by the store
    /// is only a tombstone, so the local copy is marked FRESH.
    fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<&mut CoinsCacheEntry>> {
        if !self.cache_coins.contains_key(outpoint) {
            let Some(coin) = self.base.get_coin(outpoint)? else {
                return Ok(None);
            };
            let mut entry = CoinsCacheEntry::new(coin);
            if entry.coin.is_spent() {
                entry.flags = CoinFlags::FRESH;
            }
            self.memory_add(entry.coin.dynamic_memory_usage(), entry.flags);
            self.cache_coins.insert(*outpoint, entry);
        }
        Ok(self.cache_coins.get_mut(outpoint))
    }

    /// Add a coin, staging it as DIRTY (and FRESH when the backing store
    /// cannot hold an unspent copy).
    ///
    /// The coin must be unspent. Statically unspendable outputs are not
    /// worth caching and are silently ignored.
    ///
    /// # Panics
    ///
    /// Panics if an unspent coin is already cached here and
    /// `possible_overwrite` is false: the UTXO set cannot see the same
    /// output created twice, except for the pre-BIP30 duplicate coinbases,
    /// which callers must announce by passing `possible_overwrite`.
    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, possible_overwrite: bool) {
        assert!(!coin.is_spent());
        if is_unspendable(&coin.output.script_pubkey) {
            return;
        }
        let existing = self
            .cache_coins
            .get(&outpoint)
            .map(|entry| (entry.coin.dynamic_memory_usage(), entry.flags, entry.coin.is_spent()));
        let mut fresh = false;
        match existing {
            Some((usage, flags, spent)) => {
                // The coin is being replaced; drop the old copy's memory first.
                self.memory_sub(usage, flags);
                if !possible_overwrite {
                    if !spent {
                        panic!("Attempted to overwrite an unspent coin (when possible_overwrite is false)");
                    }
                    // A spent DIRTY entry means the spentness has not reached
                    // the backing store yet. Re-adding (a re-org replaying the
                    // creating block) must not mark FRESH, or a later spend
                    // would drop the entry and the spentness below would
                    // never be overwritten.
                    fresh = !flags.contains(CoinFlags::DIRTY);
                }
            }
            None => {
                fresh = !possible_overwrite;
            }
        }
        let entry = self
            .cache_coins
            .entry(outpoint)
            .or_insert_with(|| CoinsCacheEntry::new(Coin::default()));
        entry.coin = coin;
        entry.flags.insert(CoinFlags::DIRTY);
        if fresh {
            entry.flags.insert(CoinFlags::FRESH);
        }
        entry.flags.remove(CoinFlags::FLUSH);
        let usage = entry.coin.dynamic_memory_usage();
        let flags = entry.flags;
        tracing::trace!(
            target: "utxocache",
            txid = %outpoint.txid,
            vout = outpoint.vout,
            height = entry.coin.height,
            value = entry.coin.output.value.to_sat(),
            is_coinbase = entry.coin.is_coinbase,
            "add coin"
        );
        self.memory_add(usage, flags);
    }

    /// Spend the coin at the given outpoint.
    ///
    /// A FRESH entry is dropped outright (the store below never knew it);
    /// anything else becomes a DIRTY tombstone. Returns false when no entry
    /// exists here or below. The old coin is moved into `moveout` when
    /// provided.
    pub fn spend_coin(&mut self, outpoint: &OutPoint, moveout: Option<&mut Coin>) -> Result<bool> {
        let Some(entry) = self.fetch_coin(outpoint)? else {
            return Ok(false);
        };
        let usage = entry.coin.dynamic_memory_usage();
        let flags = entry.flags;
        tracing::trace!(
            target: "utxocache",
            txid = %outpoint.txid,
            vout = outpoint.vout,
            height = entry.coin.height,
            value = entry.coin.output.value.to_sat(),
            is_coinbase = entry.coin.is_coinbase,
            "spend coin"
        );
        self.memory_sub(usage, flags);
        if flags.contains(CoinFlags::FRESH) {
            let entry = self
                .cache_coins
                .remove(outpoint)
                .expect("entry fetched above");
            if let Some(out) = moveout {
                *out = entry.coin;
            }
        } else {
            let entry = self
                .cache_coins
                .get_mut(outpoint)
                .expect("entry fetched above");
            entry.flags.insert(CoinFlags::DIRTY);
            entry.flags.remove(CoinFlags::FLUSH);
            let old = std::mem::take(&mut entry.coin);
            if let Some(out) = moveout {
                *out = old;
            }
        }
        Ok(true)
    }

    /// Borrow the coin at the given outpoint, or the shared empty coin if
    /// there is none. The return must not be mutated.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<&Coin> {
        Ok(match self.fetch_coin(outpoint)? {
            Some(entry) => &entry.coin,
            None => &COIN_EMPTY,
        })
    }

    /// Local lookup only; never consults the backing store.
    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.cache_coins
            .get(outpoint)
            .is_some_and(|entry| !entry.coin.is_spent())
    }

    /// Record the block this cache now reflects.
    pub fn set_best_block(&mut self, hash: BlockHash) {
        self.best_block = Some(hash);
    }

    fn best_block_or_zero(&self) -> BlockHash {
        self.best_block.unwrap_or_else(BlockHash::all_zeros)
    }

    /// Whether every input of `tx` refers to an unspent coin. Vacuously true
    /// for coinbases.
    pub fn have_inputs(&mut self, tx: &Transaction) -> Result<bool> {
        if !tx.is_coinbase() {
            for input in &tx.input {
                if !self.have_coin(&input.previous_output)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Publish staged entries downward and drop them.
    ///
    /// With `partial_ok`, a partial flush (dropping only FLUSH-tagged
    /// entries) is chosen when those entries hold strictly between 10% and
    /// 90% of the cached memory; at either extreme the savings of keeping
    /// the split would be trivial and a full flush releases more.
    ///
    /// # Panics
    ///
    /// Panics if the backing store fails to consume every entry of a full
    /// flush.
    pub fn flush(&mut self, partial_ok: bool) -> Result<()> {
        let partial = partial_ok
            && self.flush_coins_usage * 10 > self.cached_coins_usage
            && self.flush_coins_usage * 10 < self.cached_coins_usage * 9;
        if partial_ok {
            tracing::debug!(
                target: "coindb",
                cached_coins_usage = self.cached_coins_usage,
                flush_coins_usage = self.flush_coins_usage,
                flush_count = self.flush_count,
                partial,
                "flush"
            );
        }
        let best_block = self.best_block_or_zero();
        self.base
            .batch_write(&mut self.cache_coins, best_block, /* erase */ true, partial)?;
        if partial {
            assert!(self.cached_coins_usage >= self.flush_coins_usage);
            self.cached_coins_usage -= self.flush_coins_usage;
        } else {
            if !self.cache_coins.is_empty() {
                panic!("Not all cached coins were erased");
            }
            // The table only returns its allocation to the allocator on
            // tear-down; a long-lived emptied table would inflate residency.
            self.reallocate_cache();
            self.cached_coins_usage = 0;
        }
        // Every FLUSH-tagged entry has been written out either way.
        self.flush_coins_usage = 0;
        self.flush_count = 0;
        Ok(())
    }

    /// Publish staged entries downward without dropping the table.
    ///
    /// Spent entries are erased afterwards; everything else survives with an
    /// empty flag set, now a clean copy of the store below.
    pub fn sync(&mut self) -> Result<()> {
        let best_block = self.best_block_or_zero();
        self.base
            .batch_write(&mut self.cache_coins, best_block, /* erase */ false, false)?;
        let cached_coins_usage = &mut self.cached_coins_usage;
        let flush_coins_usage = &mut self.flush_coins_usage;
        let flush_count = &mut self.flush_count;
        self.cache_coins.retain(|_, entry| {
            if entry.flags.contains(CoinFlags::FLUSH) {
                *flush_count -= 1;
                *flush_coins_usage -= entry.coin.dynamic_memory_usage();
            }
            if entry.coin.is_spent() {
                *cached_coins_usage -= entry.coin.dynamic_memory_usage();
                false
            } else {
                entry.flags = CoinFlags::NONE;
                true
            }
        });
        Ok(())
    }

    /// Drop the entry if nothing about it is pending. Lets callers release
    /// memory for outpoints they know are no longer of interest.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if let Some(entry) = self.cache_coins.get(outpoint) {
            if entry.flags.is_empty() {
                let usage = entry.coin.dynamic_memory_usage();
                tracing::trace!(
                    target: "utxocache",
                    txid = %outpoint.txid,
                    vout = outpoint.vout,
                    height = entry.coin.height,
                    value = entry.coin.output.value.to_sat(),
                    is_coinbase = entry.coin.is_coinbase,
                    "uncache coin"
                );
                self.cached_coins_usage -= usage;
                self.cache_coins.remove(outpoint);
            }
        }
    }

    /// Tag the entry for priority treatment by the next partial flush.
    /// Returns false if the outpoint is not cached.
    pub fn mark_for_flush(&mut self, outpoint: &OutPoint) -> bool {
        let Some(entry) = self.cache_coins.get_mut(outpoint) else {
            return false;
        };
        if !entry.flags.contains(CoinFlags::FLUSH) {
            entry.flags.insert(CoinFlags::FLUSH);
            let usage = entry.coin.dynamic_memory_usage();
            self.flush_count += 1;
            self.flush_coins_usage += usage;
        }
        true
    }

    /// Number of cached entries.
    pub fn cache_size(&self) -> usize {
        self.cache_coins.len()
    }

    /// Memory held by this layer: the coins' own heap plus an estimate of
    /// the table allocation.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.cache_coins.capacity() * std::mem::size_of::<(OutPoint, CoinsCacheEntry)>()
            + self.cached_coins_usage
    }

    fn reallocate_cache(&mut self) {
        assert!(self.cache_coins.is_empty());
        self.cache_coins = CoinsMap::default();
    }

    /// Check every entry against the legal flag/spent combinations and the
    /// memory counters against a full recomputation.
    pub fn sanity_check(&self) {
        let mut recomputed_usage = 0;
        let mut recomputed_flush_usage = 0;
        let mut recomputed_flush_count = 0;
        for entry in self.cache_coins.values() {
            let mut attr = 0u8;
            if entry.flags.contains(CoinFlags::DIRTY) {
                attr |= 1;
            }
            if entry.flags.contains(CoinFlags::FRESH) {
                attr |= 2;
            }
            if entry.coin.is_spent() {
                attr |= 4;
            }
            // Only 5 combinations are possible.
            assert!(attr != 2 && attr != 4 && attr != 7);

            recomputed_usage += entry.coin.dynamic_memory_usage();
            if entry.flags.contains(CoinFlags::FLUSH) {
                recomputed_flush_count += 1;
                recomputed_flush_usage += entry.coin.dynamic_memory_usage();
            }
        }
        assert_eq!(recomputed_usage, self.cached_coins_usage);
        assert_eq!(recomputed_flush_usage, self.flush_coins_usage);
        assert_eq!(recomputed_flush_count, self.flush_count);
    }
}

impl CoinsView for CoinsViewCache<'_> {
    /// Returns the coin only while unspent; a locally spent coin reads as
    /// absent, exactly like a store that erased it.
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        Ok(self.fetch_coin(outpoint)?.and_then(|entry| {
            if entry.coin.is_spent() {
                None
            } else {
                Some(entry.coin.clone())
            }
        }))
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self
            .fetch_coin(outpoint)?
            .is_some_and(|entry| !entry.coin.is_spent()))
    }

    fn best_block(&mut self) -> BlockHash {
        match self.best_block {
            Some(hash) => hash,
            None => {
                let hash = self.base.best_block();
                if hash != BlockHash::all_zeros() {
                    self.best_block = Some(hash);
                }
                hash
            }
        }
    }

    fn head_blocks(&mut self) -> Vec<BlockHash> {
        self.base.head_blocks()
    }

    /// Coalesce a child layer's entries into this one.
    ///
    /// # Panics
    ///
    /// Panics when a child entry carries FRESH while an unspent coin for the
    /// same outpoint exists here: the flag was misapplied by the calling
    /// code.
    fn batch_write(
        &mut self,
        coins: &mut CoinsMap,
        best_block: BlockHash,
        erase: bool,
        partial: bool,
    ) -> Result<()> {
        coins.retain(|outpoint, child| {
            if partial && !child.flags.contains(CoinFlags::FLUSH) {
                // Left behind for a later full flush.
                return true;
            }
            // Ignore non-dirty entries (optimization).
            if !child.flags.contains(CoinFlags::DIRTY) {
                return !erase;
            }
            let parent = self
                .cache_coins
                .get(outpoint)
                .map(|entry| (entry.coin.dynamic_memory_usage(), entry.flags, entry.coin.is_spent()));
            match parent {
                None => {
                    // We have no entry while the child does. A spent FRESH
                    // child never existed down here to begin with.
                    if !(child.flags.contains(CoinFlags::FRESH) && child.coin.is_spent()) {
                        let coin = if erase {
                            // The child map still erases the (now hollow)
                            // entry via the retain below.
                            std::mem::take(&mut child.coin)
                        } else {
                            child.coin.clone()
                        };
                        let mut entry = CoinsCacheEntry::new(coin);
                        entry.flags = CoinFlags::DIRTY;
                        // FRESH may propagate from the child; had the entry
                        // merely been flushed out of this layer before, the
                        // child could not be FRESH.
                        if child.flags.contains(CoinFlags::FRESH) {
                            entry.flags.insert(CoinFlags::FRESH);
                        }
                        if child.flags.contains(CoinFlags::FLUSH) {
                            entry.flags.insert(CoinFlags::FLUSH);
                        }
                        self.memory_add(entry.coin.dynamic_memory_usage(), entry.flags);
                        self.cache_coins.insert(*outpoint, entry);
                    }
                }
                Some((parent_usage, parent_flags, parent_spent)) => {
                    if child.flags.contains(CoinFlags::FRESH) && !parent_spent {
                        panic!("FRESH flag misapplied to coin that exists in parent cache");
                    }
                    if parent_flags.contains(CoinFlags::FRESH) && child.coin.is_spent() {
                        // The layer below us has no entry either; ours can
                        // simply go away.
                        self.memory_sub(parent_usage, parent_flags);
                        self.cache_coins.remove(outpoint);
                    } else {
                        // A normal modification, typically unspent becoming
                        // spent.
                        self.memory_sub(parent_usage, parent_flags);
                        let entry = self
                            .cache_coins
                            .get_mut(outpoint)
                            .expect("entry probed above");
                        entry.coin = if erase {
                            std::mem::take(&mut child.coin)
                        } else {
                            child.coin.clone()
                        };
                        entry.flags.insert(CoinFlags::DIRTY);
                        entry.flags.remove(CoinFlags::FLUSH);
                        if child.flags.contains(CoinFlags::FLUSH) {
                            entry.flags.insert(CoinFlags::FLUSH);
                        }
                        // Never FRESH here: the layer below may hold a spent
                        // copy whose spentness must still flow down.
                        let usage = entry.coin.dynamic_memory_usage();
                        let flags = entry.flags;
                        self.memory_add(usage, flags);
                    }
                }
            }
            !erase
        });
        self.best_block = (best_block != BlockHash::all_zeros()).then_some(best_block);
        Ok(())
    }

    fn cursor(&mut self) -> Option<CoinsCursor<'_>> {
        self.base.cursor()
    }

    fn estimate_size(&mut self) -> usize {
        self.base.estimate_size()
    }
}

/// Add every output of `tx` to the cache.
///
/// With `check_for_overwrite`, each outpoint is probed first and an existing
/// unspent coin permits the overwrite; otherwise only coinbase outputs may
/// overwrite, which deals with the pre-BIP30 duplicate coinbase
/// transactions.
pub fn add_coins(
    cache: &mut CoinsViewCache<'_>,
    tx: &Transaction,
    height: u32,
    check_for_overwrite: bool,
) -> Result<()> {
    let is_coinbase = tx.is_coinbase();
    let txid = tx.compute_txid();
    for (index, output) in tx.output.iter().enumerate() {
        let outpoint = OutPoint::new(txid, index as u32);
        let overwrite = if check_for_overwrite {
            cache.have_coin(&outpoint)?
        } else {
            is_coinbase
        };
        cache.add_coin(
            outpoint,
            Coin::from_txout(output.clone(), height, is_coinbase),
            overwrite,
        );
    }
    Ok(())
}

/// Return the first unspent output of `txid`, scanning output indices up to
/// the per-block cap, or the shared empty coin if there is none.
pub fn access_by_txid<'c>(view: &'c mut CoinsViewCache<'_>, txid: &Txid) -> Result<&'c Coin> {
    let mut outpoint = OutPoint::new(*txid, 0);
    while outpoint.vout < max_outputs_per_block() {
        if view.have_coin(&outpoint)? {
            return view.access_coin(&outpoint);
        }
        outpoint.vout += 1;
    }
    Ok(&COIN_EMPTY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCoinsView;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, Witness};

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([byte; 32]), vout)
    }

    fn coin(value: u64, script_len: usize, height: u32) -> Coin {
        Coin::from_txout(
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51; script_len]),
            },
            height,
            false,
        )
    }

    fn tombstone() -> Coin {
        let mut coin = coin(0, 0, 0);
        coin.clear();
        coin
    }

    fn flags_of(cache: &CoinsViewCache<'_>, op: &OutPoint) -> Option<CoinFlags> {
        cache.cache_coins.get(op).map(|entry| entry.flags)
    }

    fn unspent_coins(store: &mut MemoryCoinsView) -> std::collections::HashMap<OutPoint, Coin> {
        store
            .cursor()
            .expect("memory store has a cursor")
            .filter(|(_, coin)| !coin.is_spent())
            .collect()
    }

    /// xorshift64; deterministic driver for the randomized simulation.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn test_fresh_add_then_spend_leaves_no_trace() {
        let mut store = MemoryCoinsView::new();
        let mut cache = CoinsViewCache::new(&mut store);
        let op = outpoint(1, 0);

        cache.add_coin(op, coin(1000, 10, 1), false);
        assert_eq!(flags_of(&cache, &op), Some(CoinFlags::DIRTY | CoinFlags::FRESH));
        cache.sanity_check();

        // FRESH + spent drops the entry outright.
        assert!(cache.spend_coin(&op, None).unwrap());
        assert_eq!(cache.cache_size(), 0);
        cache.sanity_check();

        cache.flush(false).unwrap();
        drop(cache);
        assert!(store.is_empty());
    }

    #[test]
    fn test_spent_coin_propagates_to_backing_store() {
        let mut store = MemoryCoinsView::new();
        let op = outpoint(1, 0);
        store.insert_coin(op, coin(1000, 10, 1));

        let mut cache = CoinsViewCache::new(&mut store);
        assert!(cache.get_coin(&op).unwrap().is_some());
        assert_eq!(flags_of(&cache, &op), Some(CoinFlags::NONE));

        assert!(cache.spend_coin(&op, None).unwrap());
        assert_eq!(flags_of(&cache, &op), Some(CoinFlags::DIRTY));
        cache.sanity_check();

        cache.flush(false).unwrap();
        drop(cache);
        assert!(store.get(&op).expect("tombstone written down").is_spent());
        assert!(!store.have_coin(&op).unwrap());
    }

    #[test]
    #[should_panic(expected = "FRESH flag misapplied")]
    fn test_fresh_misapplied_panics() {
        let mut store = MemoryCoinsView::new();
        let op = outpoint(1, 0);
        store.insert_coin(op, coin(1000, 10, 1));

        let mut parent = CoinsViewCache::new(&mut store);
        assert!(parent.have_coin(&op).unwrap());

        // A buggy middle layer claiming FRESH for a coin the parent holds
        // unspent.
        let mut staged = CoinsMap::default();
        let mut entry = CoinsCacheEntry::new(coin(1000, 10, 1));
        entry.flags = CoinFlags::DIRTY | CoinFlags::FRESH;
        staged.insert(op, entry);

        let _ = parent.batch_write(&mut staged, BlockHash::all_zeros(), true, false);
    }

    #[test]
    #[should_panic(expected = "overwrite an unspent coin")]
    fn test_unspent_overwrite_panics() {
        let mut store = MemoryCoinsView::new();
        let mut cache = CoinsViewCache::new(&mut store);
        let op = outpoint(1, 0);
        cache.add_coin(op, coin(1000, 10, 1), false);
        cache.add_coin(op, coin(2000, 10, 2), false);
    }

    #[test]
    fn test_possible_overwrite_permits_duplicate() {
        let mut store = MemoryCoinsView::new();
        let mut cache = CoinsViewCache::new(&mut store);
        let op = outpoint(1, 0);
        cache.add_coin(op, coin(1000, 10, 1), false);
        cache.add_coin(op, coin(2000, 12, 2), true);
        assert_eq!(
            cache.get_coin(&op).unwrap().unwrap().output.value,
            Amount::from_sat(2000)
        );
        // The earlier FRESH bit survives the union: the coin still never
        // reached the backing store.
        assert_eq!(flags_of(&cache, &op), Some(CoinFlags::DIRTY | CoinFlags::FRESH));
        cache.sanity_check();
    }

    #[test]
    fn test_readd_spent_dirty_coin_is_not_fresh() {
        let mut store = MemoryCoinsView::new();
        let op = outpoint(1, 0);
        store.insert_coin(op, coin(1000, 10, 1));

        let mut cache = CoinsViewCache::new(&mut store);
        assert!(cache.spend_coin(&op, None).unwrap());
        // Re-org replays the creating block.
        cache.add_coin(op, coin(1000, 10, 1), false);
        // The spentness below has not been flushed, so FRESH must not be set:
        // a later spend has to reach the store.
        assert_eq!(flags_of(&cache, &op), Some(CoinFlags::DIRTY));
        cache.sanity_check();
    }

    #[test]
    fn test_fetched_tombstone_is_fresh() {
        let mut store = MemoryCoinsView::new();
        let op = outpoint(1, 0);
        store.insert_coin(op, tombstone());

        let mut cache = CoinsViewCache::new(&mut store);
        assert!(cache.get_coin(&op).unwrap().is_none());
        assert_eq!(flags_of(&cache, &op), Some(CoinFlags::FRESH));
        cache.sanity_check();

        // Adding over the tombstone is a creation, not an overwrite.
        cache.add_coin(op, coin(500, 8, 2), false);
        assert_eq!(flags_of(&cache, &op), Some(CoinFlags::DIRTY | CoinFlags::FRESH));
        cache.sanity_check();
    }

    #[test]
    fn test_partial_flush_threshold() {
        // 5% of memory tagged FLUSH: a full flush is cheaper overall.
        let mut store = MemoryCoinsView::new();
        let mut cache = CoinsViewCache::new(&mut store);
        for i in 0..100u8 {
            cache.add_coin(outpoint(i, 0), coin(1000, 10, 1), false);
        }
        for i in 0..5u8 {
            assert!(cache.mark_for_flush(&outpoint(i, 0)));
        }
        cache.sanity_check();
        cache.flush(true).unwrap();
        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.cached_coins_usage, 0);
        assert_eq!(cache.flush_count, 0);
        drop(cache);
        assert_eq!(store.len(), 100);

        // 50%: a partial flush drops exactly the tagged half.
        let mut store = MemoryCoinsView::new();
        let mut cache = CoinsViewCache::new(&mut store);
        for i in 0..100u8 {
            cache.add_coin(outpoint(i, 0), coin(1000, 10, 1), false);
        }
        for i in 0..50u8 {
            assert!(cache.mark_for_flush(&outpoint(i, 0)));
        }
        let usage_before = cache.cached_coins_usage;
        let flush_usage = cache.flush_coins_usage;
        cache.flush(true).unwrap();
        assert_eq!(cache.cache_size(), 50);
        assert_eq!(cache.cached_coins_usage, usage_before - flush_usage);
        assert_eq!(cache.flush_count, 0);
        assert_eq!(cache.flush_coins_usage, 0);
        cache.sanity_check();
        for i in 0..50u8 {
            assert!(!cache.cache_coins.contains_key(&outpoint(i, 0)));
        }
        drop(cache);
        assert_eq!(store.len(), 50);
    }

    #[test]
    fn test_partial_flush_degrades_to_full_without_marks() {
        let mut store = MemoryCoinsView::new();
        let mut cache = CoinsViewCache::new(&mut store);
        for i in 0..10u8 {
            cache.add_coin(outpoint(i, 0), coin(1000, 10, 1), false);
        }
        cache.flush(true).unwrap();
        assert_eq!(cache.cache_size(), 0);
        drop(cache);
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn test_sync_publishes_without_dropping() {
        let mut store = MemoryCoinsView::new();
        let spent_op = outpoint(9, 0);
        store.insert_coin(spent_op, coin(700, 7, 1));

        let mut cache = CoinsViewCache::new(&mut store);
        let kept_op = outpoint(1, 0);
        cache.add_coin(kept_op, coin(1000, 10, 1), false);
        assert!(cache.spend_coin(&spent_op, None).unwrap());

        cache.sync().unwrap();
        // The unspent entry survives as a clean copy; the tombstone is gone.
        assert_eq!(flags_of(&cache, &kept_op), Some(CoinFlags::NONE));
        assert!(!cache.cache_coins.contains_key(&spent_op));
        cache.sanity_check();
        assert!(cache.have_coin(&kept_op).unwrap());

        drop(cache);
        assert!(store.have_coin(&kept_op).unwrap());
        assert!(!store.have_coin(&spent_op).unwrap());
    }

    #[test]
    fn test_uncache_only_drops_clean_entries() {
        let mut store = MemoryCoinsView::new();
        let fetched_op = outpoint(1, 0);
        store.insert_coin(fetched_op, coin(1000, 10, 1));

        let mut cache = CoinsViewCache::new(&mut store);
        assert!(cache.have_coin(&fetched_op).unwrap());
        let dirty_op = outpoint(2, 0);
        cache.add_coin(dirty_op, coin(2000, 10, 1), false);

        cache.uncache(&fetched_op);
        cache.uncache(&dirty_op);
        assert!(!cache.cache_coins.contains_key(&fetched_op));
        assert!(cache.cache_coins.contains_key(&dirty_op));
        cache.sanity_check();
    }

    #[test]
    fn test_spend_moves_coin_out() {
        let mut store = MemoryCoinsView::new();
        let op = outpoint(1, 0);
        store.insert_coin(op, coin(1234, 11, 7));

        let mut cache = CoinsViewCache::new(&mut store);
        let mut moved = Coin::default();
        assert!(cache.spend_coin(&op, Some(&mut moved)).unwrap());
        assert_eq!(moved.output.value, Amount::from_sat(1234));
        assert_eq!(moved.height, 7);

        assert!(!cache.spend_coin(&outpoint(2, 0), None).unwrap());
    }

    #[test]
    fn test_access_coin_returns_sentinel_on_miss() {
        let mut store = MemoryCoinsView::new();
        let mut cache = CoinsViewCache::new(&mut store);
        let coin_ref = cache.access_coin(&outpoint(1, 0)).unwrap();
        assert!(coin_ref.is_spent());
        assert!(std::ptr::eq(coin_ref, &COIN_EMPTY));
        // A miss through access must not populate the table.
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_access_by_txid_skips_spent_outputs() {
        let mut store = MemoryCoinsView::new();
        let txid = Txid::from_byte_array([3; 32]);
        store.insert_coin(OutPoint::new(txid, 0), tombstone());
        store.insert_coin(OutPoint::new(txid, 2), coin(4321, 9, 5));

        let mut cache = CoinsViewCache::new(&mut store);
        let found = access_by_txid(&mut cache, &txid).unwrap();
        assert!(!found.is_spent());
        assert_eq!(found.output.value, Amount::from_sat(4321));

        let missing = Txid::from_byte_array([4; 32]);
        let empty = access_by_txid(&mut cache, &missing).unwrap();
        assert!(std::ptr::eq(empty, &COIN_EMPTY));
    }

    #[test]
    fn test_best_block_is_lazy() {
        let mut store = MemoryCoinsView::new();
        let hash = BlockHash::from_byte_array([8; 32]);
        store.batch_write(&mut CoinsMap::default(), hash, true, false).unwrap();

        let mut cache = CoinsViewCache::new(&mut store);
        assert_eq!(cache.best_block(), hash);

        let updated = BlockHash::from_byte_array([9; 32]);
        cache.set_best_block(updated);
        assert_eq!(cache.best_block(), updated);
    }

    #[test]
    fn test_add_coins_and_have_inputs() {
        let mut store = MemoryCoinsView::new();
        let prev_op = outpoint(1, 0);
        store.insert_coin(prev_op, coin(50_000, 10, 1));

        let mut cache = CoinsViewCache::new(&mut store);
        let tx = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: prev_op,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![
                TxOut {
                    value: Amount::from_sat(40_000),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51; 20]),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: ScriptBuf::from_bytes(vec![0x6a]),
                },
            ],
        };
        assert!(cache.have_inputs(&tx).unwrap());

        add_coins(&mut cache, &tx, 2, false).unwrap();
        let txid = tx.compute_txid();
        assert!(cache.have_coin(&OutPoint::new(txid, 0)).unwrap());
        // The OP_RETURN output is unspendable and never cached.
        assert!(!cache.cache_coins.contains_key(&OutPoint::new(txid, 1)));

        assert!(cache.spend_coin(&prev_op, None).unwrap());
        assert!(!cache.have_inputs(&tx).unwrap());
        cache.sanity_check();
    }

    #[test]
    fn test_read_failure_propagates() {
        let mut store = MemoryCoinsView::new();
        store.insert_coin(outpoint(1, 0), coin(1000, 10, 1));
        store.set_fail_reads(true);

        let mut cache = CoinsViewCache::new(&mut store);
        assert!(cache.get_coin(&outpoint(1, 0)).is_err());
        assert!(cache.spend_coin(&outpoint(1, 0), None).is_err());
    }

    /// A two-layer stack must behave exactly like a single layer over the
    /// same store, whatever interleaving of operations and layer flushes is
    /// applied, and every intermediate state must pass the sanity check.
    #[test]
    fn test_cache_transparency_randomized() {
        let mut store1 = MemoryCoinsView::new();
        let mut store2 = MemoryCoinsView::new();

        // Pool of outpoints the simulation draws from, partially seeded in
        // both stores.
        let pool: Vec<OutPoint> = (0u8..8)
            .flat_map(|byte| (0u32..2).map(move |vout| outpoint(byte, vout)))
            .collect();
        for op in pool.iter().take(6) {
            let seeded = coin(10_000 + u64::from(op.vout), 10, 1);
            store1.insert_coin(*op, seeded.clone());
            store2.insert_coin(*op, seeded);
        }

        let mut cache1 = CoinsViewCache::new(&mut store1);
        let mut mid2 = CoinsViewCache::new(&mut store2);
        let mut top2 = CoinsViewCache::new(&mut mid2);

        let mut rng = XorShift(0x9e3779b97f4a7c15);
        for step in 0..400 {
            let pick = pool[(rng.next() % pool.len() as u64) as usize];
            match rng.next() % 100 {
                0..=39 => {
                    let new_coin = coin(1 + rng.next() % 100_000, 5 + (rng.next() % 20) as usize, 1);
                    let overwrite1 = cache1.have_coin(&pick).unwrap();
                    let overwrite2 = top2.have_coin(&pick).unwrap();
                    assert_eq!(overwrite1, overwrite2);
                    cache1.add_coin(pick, new_coin.clone(), overwrite1);
                    top2.add_coin(pick, new_coin, overwrite2);
                }
                40..=64 => {
                    // Probe first, the way validation does; spending an
                    // already-spent outpoint is a caller bug.
                    let known1 = cache1.have_coin(&pick).unwrap();
                    let known2 = top2.have_coin(&pick).unwrap();
                    assert_eq!(known1, known2);
                    if known1 {
                        assert!(cache1.spend_coin(&pick, None).unwrap());
                        assert!(top2.spend_coin(&pick, None).unwrap());
                    }
                }
                65..=74 => {
                    cache1.sync().unwrap();
                    top2.sync().unwrap();
                }
                75..=84 => {
                    top2.flush(false).unwrap();
                }
                85..=89 => {
                    top2.mark_for_flush(&pick);
                    top2.flush(true).unwrap();
                }
                90..=94 => {
                    cache1.uncache(&pick);
                    top2.uncache(&pick);
                }
                _ => {
                    let spent1 = cache1.access_coin(&pick).unwrap().is_spent();
                    let spent2 = top2.access_coin(&pick).unwrap().is_spent();
                    assert_eq!(spent1, spent2);
                }
            }

            cache1.sanity_check();
            top2.sanity_check();

            if step % 10 == 0 {
                for op in &pool {
                    assert_eq!(cache1.get_coin(op).unwrap(), top2.get_coin(op).unwrap());
                }
            }
        }

        // Drain every layer and compare what actually reached the stores.
        top2.flush(false).unwrap();
        drop(top2);
        mid2.sanity_check();
        mid2.flush(false).unwrap();
        drop(mid2);
        cache1.flush(false).unwrap();
        drop(cache1);

        assert_eq!(unspent_coins(&mut store1), unspent_coins(&mut store2));
    }
}
