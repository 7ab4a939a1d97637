//! Primitives shared by the Quartzcoin node components.
//!
//! This crate holds the leaf types that both the coins-view layers and the
//! mini-miner build on:
//!
//! - [`Coin`]: a single unspent transaction output plus validation metadata.
//! - [`FeeRate`]: integer sat/kvB feerate with exact ordering.
//! - [`MempoolRead`]/[`MempoolTx`]: the narrow read-only mempool surface
//!   consumed by fee estimation code.

mod coin;
mod fee_rate;
mod tx_pool;

pub use self::coin::Coin;
pub use self::fee_rate::FeeRate;
pub use self::tx_pool::{MempoolRead, MempoolTx};
