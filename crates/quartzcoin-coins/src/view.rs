//! The coins view capability trait and the forwarding view.

use crate::entry::CoinsMap;
use crate::{Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint};
use quartzcoin_primitives::Coin;

/// Scan over a view's coins, in unspecified order.
pub type CoinsCursor<'a> = Box<dyn Iterator<Item = (OutPoint, Coin)> + 'a>;

/// Abstract read/write access to a UTXO view.
///
/// Implementors are the durable leaf store, the cache layer
/// ([`crate::CoinsViewCache`]), the plain forwarder ([`CoinsViewBacked`])
/// and the error-trapping wrapper ([`crate::CoinsViewErrorCatcher`]).
///
/// Methods take `&mut self` because the cache layer mutates on read; a view
/// stack has a single owner and callers serialize access externally.
pub trait CoinsView {
    /// Retrieve the coin at the given outpoint.
    ///
    /// `Some` may carry a spent tombstone: an entry recording that the
    /// output is known to be gone. `None` means the view has no entry at
    /// all. An `Err` is a genuine read failure, never "not found".
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>>;

    /// Whether an unspent coin exists at the given outpoint.
    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self.get_coin(outpoint)?.is_some_and(|coin| !coin.is_spent()))
    }

    /// Hash of the block this view currently reflects.
    ///
    /// All-zeros before the view has been initialized.
    fn best_block(&mut self) -> BlockHash {
        BlockHash::all_zeros()
    }

    /// Blocks of an unfinished flush, newest first; empty when the view is
    /// consistent.
    fn head_blocks(&mut self) -> Vec<BlockHash> {
        Vec::new()
    }

    /// Bulk-apply a child layer's staged entries.
    ///
    /// Non-DIRTY entries carry no changes and are skipped. With `erase` the
    /// applied entries are consumed out of `coins`; otherwise they are left
    /// intact. With `partial` only entries carrying the FLUSH flag are
    /// applied (and, with `erase`, consumed).
    fn batch_write(
        &mut self,
        _coins: &mut CoinsMap,
        _best_block: BlockHash,
        _erase: bool,
        _partial: bool,
    ) -> Result<()> {
        Err(Error::BatchWriteUnsupported)
    }

    /// Scan interface over the view's coins, if supported.
    fn cursor(&mut self) -> Option<CoinsCursor<'_>> {
        None
    }

    /// Rough byte size of the view's state.
    fn estimate_size(&mut self) -> usize {
        0
    }
}

/// A view that forwards every operation to another view.
///
/// [`CoinsViewBacked::set_backend`] is the sole mechanism for swapping the
/// lower layer at runtime; the cache and the error catcher embed this type
/// for their downward path.
pub struct CoinsViewBacked<'a> {
    base: &'a mut dyn CoinsView,
}

impl<'a> CoinsViewBacked<'a> {
    pub fn new(base: &'a mut dyn CoinsView) -> Self {
        Self { base }
    }

    /// Swap the lower layer.
    pub fn set_backend(&mut self, base: &'a mut dyn CoinsView) {
        self.base = base;
    }
}

impl CoinsView for CoinsViewBacked<'_> {
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        self.base.get_coin(outpoint)
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool> {
        self.base.have_coin(outpoint)
    }

    fn best_block(&mut self) -> BlockHash {
        self.base.best_block()
    }

    fn head_blocks(&mut self) -> Vec<BlockHash> {
        self.base.head_blocks()
    }

    fn batch_write(
        &mut self,
        coins: &mut CoinsMap,
        best_block: BlockHash,
        erase: bool,
        partial: bool,
    ) -> Result<()> {
        self.base.batch_write(coins, best_block, erase, partial)
    }

    fn cursor(&mut self) -> Option<CoinsCursor<'_>> {
        self.base.cursor()
    }

    fn estimate_size(&mut self) -> usize {
        self.base.estimate_size()
    }
}
