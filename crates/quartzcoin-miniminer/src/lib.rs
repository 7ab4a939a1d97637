//! A minimal version of the block assembler.
//!
//! Runs the mining algorithm over a single cluster of mempool transactions,
//! ignoring consensus rules, to answer one question: how much additional fee
//! would it take for given transactions (and their unconfirmed ancestors) to
//! be included by a rational miner at a target feerate?
//!
//! The [`MiniMiner`] snapshots the cluster once at construction, under the
//! mempool's own locking; afterwards it works purely on its internal graph
//! and may be queried repeatedly at different feerates.

use bitcoin::{Amount, OutPoint, Txid};
use std::collections::{BTreeMap, HashMap};

pub use quartzcoin_primitives::{FeeRate, MempoolRead, MempoolTx};

/// A very simplified representation of a mempool transaction.
///
/// Identity is the index into [`MiniMiner::tx_vec`]; parent/child edges are
/// indices as well, so the graph stays valid however the vector grows.
/// Relationships are cluster-local: an ancestor that is not in the mempool
/// is simply not represented, which treats it as already mined.
#[derive(Debug)]
struct MinerTx {
    /// Fee of this individual transaction (the mempool's modified fee).
    fee: Amount,
    /// Virtual size of this individual transaction.
    vsize: u32,
    /// Indices of in-cluster parents (unordered).
    parents: Vec<usize>,
    /// Indices of in-cluster children (unordered).
    children: Vec<usize>,
    /// Sum of our fee and all our unmined ancestors'.
    ancestor_fee: Amount,
    /// Sum of our vsize and all our unmined ancestors'.
    ancestor_vsize: u32,
    /// Only for the topological sort.
    in_degree: usize,
    /// This transaction has been "mined".
    mined: bool,
}

impl MinerTx {
    fn placeholder() -> Self {
        Self {
            fee: Amount::ZERO,
            vsize: 0,
            parents: Vec::new(),
            children: Vec::new(),
            ancestor_fee: Amount::ZERO,
            ancestor_vsize: 0,
            in_degree: 0,
            mined: false,
        }
    }
}

/// Simulates mining a cluster of mempool transactions to compute bump fees.
pub struct MiniMiner {
    /// The outpoints the caller asked about.
    requested_outpoints: Vec<OutPoint>,
    /// Transactions in the order encountered; the order is arbitrary.
    tx_vec: Vec<MinerTx>,
    /// A transaction's index into `tx_vec`, by txid.
    tx_map: HashMap<Txid, usize>,
    /// Indices in topologically-sorted order, ancestors first.
    top_sort: Vec<usize>,
}

impl MiniMiner {
    /// Snapshot the cluster connected to the given outpoints.
    ///
    /// Outpoints whose transaction is not in the mempool (already confirmed,
    /// or simply unknown) are remembered but get a bump fee of zero. This
    /// constructor is the only place the mempool is consulted.
    pub fn new<M: MempoolRead>(mempool: &M, outpoints: Vec<OutPoint>) -> Self {
        let mut miner = Self {
            requested_outpoints: outpoints,
            tx_vec: Vec::new(),
            tx_map: HashMap::new(),
            top_sort: Vec::new(),
        };

        let mut seed_txids = Vec::new();
        for outpoint in &miner.requested_outpoints {
            if !mempool.exists(&outpoint.txid) {
                tracing::trace!(target: "miniminer", txid = %outpoint.txid, "tx not in mempool");
                continue;
            }
            if !miner.tx_map.contains_key(&outpoint.txid) {
                register(&mut miner.tx_map, &mut miner.tx_vec, outpoint.txid);
                seed_txids.push(outpoint.txid);
            }
        }
        let cluster = mempool.calculate_cluster(seed_txids);

        // Make sure there's an entry for every tx in the cluster (it may
        // already exist), and record every entry's fee and vsize.
        for member in &cluster {
            let index = register(&mut miner.tx_map, &mut miner.tx_vec, member.txid());
            let tx = &mut miner.tx_vec[index];
            tx.fee = member.modified_fee();
            tx.vsize = member.vsize();
            tracing::trace!(
                target: "miniminer",
                index,
                txid = %member.txid(),
                fee = tx.fee.to_sat(),
                vsize = tx.vsize,
                "cluster tx"
            );
        }

        // Parent and child edges, restricted to mempool-resident cluster
        // members; anything else counts as mined already.
        for member in &cluster {
            let index = miner.tx_map[&member.txid()];
            let parents: Vec<usize> = member
                .mempool_parents()
                .filter_map(|txid| miner.tx_map.get(&txid).copied())
                .collect();
            let children: Vec<usize> = member
                .mempool_children()
                .filter_map(|txid| miner.tx_map.get(&txid).copied())
                .collect();
            let tx = &mut miner.tx_vec[index];
            tx.in_degree = parents.len();
            tx.parents = parents;
            tx.children = children;
        }

        // Kahn's topological sort; ancestors land before descendants.
        let mut zero_in_degree: Vec<usize> = (0..miner.tx_vec.len())
            .filter(|&index| miner.tx_vec[index].in_degree == 0)
            .collect();
        while let Some(index) = zero_in_degree.pop() {
            miner.top_sort.push(index);
            for child_pos in 0..miner.tx_vec[index].children.len() {
                let child = miner.tx_vec[index].children[child_pos];
                debug_assert!(miner.tx_vec[child].in_degree > 0);
                miner.tx_vec[child].in_degree -= 1;
                if miner.tx_vec[child].in_degree == 0 {
                    zero_in_degree.push(child);
                }
            }
        }
        debug_assert_eq!(miner.top_sort.len(), miner.tx_vec.len());

        miner
    }

    /// Determine which transactions would be mined at the target feerate and
    /// leave every unmined transaction's ancestor fee and vsize up to date
    /// for the calculate methods.
    ///
    /// Repeated passes over the topological order: within a pass a
    /// transaction's ancestor values are recomputed from its unmined
    /// parents, whose own values are already current because ancestors come
    /// first. When a package reaches the target, it is mined whole and the
    /// pass restarts, since ancestor sums downstream are now stale. Each
    /// pass either mines at least one transaction or is the last, so this
    /// terminates.
    fn build_mock_template(&mut self, target_feerate: FeeRate) {
        for tx in &mut self.tx_vec {
            tx.mined = false;
        }
        let mut progress = true;
        while progress {
            progress = false;
            tracing::trace!(
                target: "miniminer",
                target_feerate = target_feerate.as_sat_per_kvb(),
                "start template pass"
            );
            for pos in 0..self.top_sort.len() {
                let index = self.top_sort[pos];
                if self.tx_vec[index].mined {
                    continue;
                }
                let mut ancestor_fee = self.tx_vec[index].fee;
                let mut ancestor_vsize = self.tx_vec[index].vsize;
                for parent_pos in 0..self.tx_vec[index].parents.len() {
                    let parent = self.tx_vec[index].parents[parent_pos];
                    if !self.tx_vec[parent].mined {
                        ancestor_fee += self.tx_vec[parent].ancestor_fee;
                        ancestor_vsize += self.tx_vec[parent].ancestor_vsize;
                    }
                }
                let tx = &mut self.tx_vec[index];
                tx.ancestor_fee = ancestor_fee;
                tx.ancestor_vsize = ancestor_vsize;
                let Ok(ancestor_feerate) =
                    FeeRate::from_amount_and_vsize(ancestor_fee, i64::from(ancestor_vsize))
                else {
                    continue;
                };
                if ancestor_feerate < target_feerate {
                    continue;
                }
                // Mine this tx and all of its unmined ancestors.
                let mut to_mine = vec![index];
                while let Some(next) = to_mine.pop() {
                    if self.tx_vec[next].mined {
                        continue;
                    }
                    self.tx_vec[next].mined = true;
                    tracing::trace!(target: "miniminer", index = next, "mined");
                    for parent_pos in 0..self.tx_vec[next].parents.len() {
                        let parent = self.tx_vec[next].parents[parent_pos];
                        if !self.tx_vec[parent].mined {
                            to_mine.push(parent);
                        }
                    }
                }
                progress = true;
                break;
            }
        }
    }

    /// For each requested outpoint, the cost of bumping its transaction (and
    /// unconfirmed ancestors) to the target feerate. Transactions that make
    /// it into the mock template, and outpoints outside the mempool, cost
    /// zero.
    pub fn calculate_bump_fees(&mut self, target_feerate: FeeRate) -> BTreeMap<OutPoint, Amount> {
        tracing::debug!(
            target: "miniminer",
            target_feerate = target_feerate.as_sat_per_kvb(),
            "calculating bump fees"
        );
        self.build_mock_template(target_feerate);

        let mut bump_fees = BTreeMap::new();
        for outpoint in &self.requested_outpoints {
            let Some(&index) = self.tx_map.get(&outpoint.txid) else {
                bump_fees.insert(*outpoint, Amount::ZERO);
                continue;
            };
            let tx = &self.tx_vec[index];
            if tx.mined {
                bump_fees.insert(*outpoint, Amount::ZERO);
                continue;
            }
            let target_fee = target_feerate.get_fee(i64::from(tx.ancestor_vsize));
            debug_assert!(target_fee > tx.ancestor_fee);
            let bump_fee = target_fee.checked_sub(tx.ancestor_fee).unwrap_or(Amount::ZERO);
            tracing::trace!(target: "miniminer", index, bump_fee = bump_fee.to_sat(), "bump");
            bump_fees.insert(*outpoint, bump_fee);
        }
        bump_fees
    }

    /// The cost of bumping all requested transactions to the target feerate
    /// at once, counting shared unconfirmed ancestors exactly once.
    pub fn calculate_total_bump_fees(&mut self, target_feerate: FeeRate) -> Amount {
        tracing::debug!(
            target: "miniminer",
            target_feerate = target_feerate.as_sat_per_kvb(),
            "calculating total bump fee"
        );
        self.build_mock_template(target_feerate);

        // Union-walk over the unmined ancestors of every requested
        // transaction; `mined` doubles as the visited marker so shared
        // ancestors are summed once.
        let mut total_fees = Amount::ZERO;
        let mut total_vsize: u64 = 0;
        let mut todo = Vec::new();
        for outpoint in &self.requested_outpoints {
            let Some(&index) = self.tx_map.get(&outpoint.txid) else {
                continue;
            };
            if !self.tx_vec[index].mined {
                self.tx_vec[index].mined = true;
                todo.push(index);
            }
        }
        while let Some(index) = todo.pop() {
            total_fees += self.tx_vec[index].fee;
            total_vsize += u64::from(self.tx_vec[index].vsize);
            for parent_pos in 0..self.tx_vec[index].parents.len() {
                let parent = self.tx_vec[index].parents[parent_pos];
                if !self.tx_vec[parent].mined {
                    self.tx_vec[parent].mined = true;
                    todo.push(parent);
                }
            }
        }

        let target_fee = target_feerate.get_fee(total_vsize as i64);
        let bump = target_fee.checked_sub(total_fees).unwrap_or(Amount::ZERO);
        tracing::debug!(
            target: "miniminer",
            total_fees = total_fees.to_sat(),
            total_vsize,
            bump = bump.to_sat(),
            "total bump fee"
        );
        bump
    }
}

fn register(tx_map: &mut HashMap<Txid, usize>, tx_vec: &mut Vec<MinerTx>, txid: Txid) -> usize {
    if let Some(&index) = tx_map.get(&txid) {
        return index;
    }
    let index = tx_vec.len();
    tx_vec.push(MinerTx::placeholder());
    tx_map.insert(txid, index);
    index
}
