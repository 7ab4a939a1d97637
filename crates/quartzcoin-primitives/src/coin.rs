//! The UTXO record shared by the coins view layers.

use bitcoin::TxOut;

/// A single unspent transaction output, together with the metadata needed to
/// validate spends of it.
///
/// A coin has a distinguished *spent* state, represented by the null
/// [`TxOut`]. Spent coins act as tombstones inside caches: they record that
/// an output no longer exists without saying anything else about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    /// The output's amount and script.
    pub output: TxOut,
    /// Height of the block that created this output.
    pub height: u32,
    /// Whether the creating transaction was a coinbase.
    pub is_coinbase: bool,
}

impl Coin {
    /// Create a coin from a transaction output.
    pub fn from_txout(output: TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }

    /// Whether this coin has been spent.
    pub fn is_spent(&self) -> bool {
        self.output == TxOut::NULL
    }

    /// Mark this coin as spent, releasing the script allocation.
    pub fn clear(&mut self) {
        self.output = TxOut::NULL;
        self.height = 0;
        self.is_coinbase = false;
    }

    /// Heap memory owned by this coin.
    ///
    /// Only the script allocation counts; the inline struct itself is
    /// accounted by whoever stores the coin. Zero once spent.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.output.script_pubkey.len()
    }
}

impl Default for Coin {
    fn default() -> Self {
        Self {
            output: TxOut::NULL,
            height: 0,
            is_coinbase: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Amount, ScriptBuf};

    #[test]
    fn test_default_coin_is_spent() {
        assert!(Coin::default().is_spent());
        assert_eq!(Coin::default().dynamic_memory_usage(), 0);
    }

    #[test]
    fn test_clear_releases_script_memory() {
        let mut coin = Coin::from_txout(
            TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51; 25]),
            },
            100,
            false,
        );
        assert!(!coin.is_spent());
        assert_eq!(coin.dynamic_memory_usage(), 25);

        coin.clear();
        assert!(coin.is_spent());
        assert_eq!(coin.dynamic_memory_usage(), 0);
    }

    #[test]
    fn test_coinbase_flag_survives_from_txout() {
        let coin = Coin::from_txout(
            TxOut {
                value: Amount::from_sat(5_000_000_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            },
            0,
            true,
        );
        assert!(coin.is_coinbase);
        assert_eq!(coin.height, 0);
    }
}
