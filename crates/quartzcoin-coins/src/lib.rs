//! Layered, write-through views over the UTXO set.
//!
//! The UTXO set is accessed through a stack of *coins views*, each implementing
//! the [`CoinsView`] capability trait:
//!
//! - A durable leaf store at the bottom (the host's database;
//!   [`MemoryCoinsView`] is the in-memory reference implementation).
//! - Any number of [`CoinsViewCache`] layers above it, staging reads and
//!   writes in a flag-tracked entry table and publishing them downward in
//!   bulk via `batch_write`.
//! - Optionally a [`CoinsViewErrorCatcher`] wrapped around the leaf, turning
//!   read failures into process shutdown instead of a silent miss.
//!
//! ## Entry flags
//!
//! Every cached entry carries a subset of `{DIRTY, FRESH, FLUSH}`:
//! DIRTY entries differ from the backing store and must be written down;
//! FRESH entries are known to be absent below, so spending them can simply
//! drop the entry; FLUSH entries are prioritized by partial flushes. The
//! legal flag/spent combinations are enforced by
//! [`CoinsViewCache::sanity_check`].

mod cache;
mod catcher;
mod entry;
mod error;
mod store;
mod view;

pub use self::cache::{access_by_txid, add_coins, CoinsViewCache};
pub use self::catcher::CoinsViewErrorCatcher;
pub use self::entry::{CoinFlags, CoinsCacheEntry, CoinsMap};
pub use self::error::Error;
pub use self::store::MemoryCoinsView;
pub use self::view::{CoinsCursor, CoinsView, CoinsViewBacked};

pub use quartzcoin_primitives::Coin;

/// Result type for coins view operations.
pub type Result<T> = std::result::Result<T, Error>;
