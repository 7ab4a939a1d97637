//! Error-trapping read view.

use crate::entry::CoinsMap;
use crate::view::{CoinsCursor, CoinsView, CoinsViewBacked};
use crate::Result;
use bitcoin::{BlockHash, OutPoint};
use quartzcoin_primitives::Coin;

/// Wraps a coins view and turns read failures into process shutdown.
///
/// Reporting a failed read as "not found" would be indistinguishable from a
/// legitimately absent outpoint and could let a double-spend through, so the
/// registered callbacks are run and the process aborts instead. This view
/// must not be used for writes.
pub struct CoinsViewErrorCatcher<'a> {
    base: CoinsViewBacked<'a>,
    err_callbacks: Vec<Box<dyn Fn() + Send>>,
}

impl<'a> CoinsViewErrorCatcher<'a> {
    pub fn new(base: &'a mut dyn CoinsView) -> Self {
        Self {
            base: CoinsViewBacked::new(base),
            err_callbacks: Vec::new(),
        }
    }

    /// Register a callback to run before terminating on a read error.
    pub fn add_read_err_callback(&mut self, callback: Box<dyn Fn() + Send>) {
        self.err_callbacks.push(callback);
    }
}

impl CoinsView for CoinsViewErrorCatcher<'_> {
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        match self.base.get_coin(outpoint) {
            Ok(coin) => Ok(coin),
            Err(err) => {
                for callback in &self.err_callbacks {
                    callback();
                }
                tracing::error!("Error reading from database: {err}");
                // Returning the error upward would eventually be treated as
                // 'entry not found' somewhere. We cannot continue anyway,
                // and all writes are atomic, so exit immediately.
                std::process::abort();
            }
        }
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
