//! Read-only mempool abstraction for fee estimation.
//!
//! This trait pair is the entire mempool surface the mini-miner consumes,
//! avoiding a dependency on any concrete pool implementation and enabling
//! testing with mock pools.
//!
//! All methods are synchronous. Implementations guard their own state; a
//! caller holding a snapshot (e.g. the cluster returned by
//! [`MempoolRead::calculate_cluster`]) needs no further locking.

use bitcoin::{Amount, Txid};

/// A mempool transaction as seen by fee estimation code.
pub trait MempoolTx {
    /// Transaction ID.
    fn txid(&self) -> Txid;

    /// Fee including any priority delta applied by the node operator.
    fn modified_fee(&self) -> Amount;

    /// Virtual size in vbytes. Always positive for a well-formed entry.
    fn vsize(&self) -> u32;

    /// In-mempool parents. Confirmed parents are not reported.
    fn mempool_parents(&self) -> Box<dyn Iterator<Item = Txid> + '_>;

    /// In-mempool children.
    fn mempool_children(&self) -> Box<dyn Iterator<Item = Txid> + '_>;
}

/// Read-only queries against a mempool.
pub trait MempoolRead {
    /// The snapshot entry type handed out by [`Self::calculate_cluster`].
    type Entry: MempoolTx;

    /// Whether a transaction with this txid is currently in the pool.
    fn exists(&self, txid: &Txid) -> bool;

    /// Compute the cluster of the given transactions: the transitive closure
    /// of the in-mempool parent/child relation over the initial set.
    ///
    /// Unknown txids are ignored. The returned entries are a consistent
    /// snapshot taken under the pool's internal lock.
    fn calculate_cluster(&self, txids: Vec<Txid>) -> Vec<Self::Entry>;
}
