//! Integer feerate arithmetic.

use bitcoin::Amount;

/// Fee rate in satoshis per virtual kilobyte.
///
/// Kept as an integer so that feerate comparisons are exact; miners order
/// packages by this value and off-by-one rounding must not flip decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeeRate(pub u64);

impl FeeRate {
    /// Create fee rate from satoshis per virtual byte.
    pub fn from_sat_per_vb(sat_vb: u64) -> Self {
        Self(sat_vb.checked_mul(1000).expect("Fee rate overflow"))
    }

    /// Create fee rate from satoshis per kilovirtual byte.
    pub fn from_sat_per_kvb(sat_kvb: u64) -> Self {
        Self(sat_kvb)
    }

    /// Calculate fee rate from amount and vsize with overflow protection.
    ///
    /// Returns fee rate in sat/kvB, rounded down.
    pub fn from_amount_and_vsize(fee: Amount, vsize: i64) -> Result<Self, &'static str> {
        if vsize <= 0 {
            return Err("vsize must be positive");
        }

        let fee_sat = fee.to_sat();
        let vsize_u64 = vsize as u64;

        let numerator = fee_sat
            .checked_mul(1000)
            .ok_or("Fee rate calculation overflow")?;

        Ok(Self(numerator / vsize_u64))
    }

    /// Get fee for given virtual size.
    pub fn get_fee(&self, vsize: i64) -> Amount {
        let fee_sat = (self
            .0
            .checked_mul(vsize as u64)
            .expect("Fee calculation overflow"))
        .checked_div(1000)
        .unwrap_or(0);
        Amount::from_sat(fee_sat)
    }

    /// Get the fee rate in satoshis per kilovirtual byte.
    pub fn as_sat_per_kvb(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rate_from_amount_and_vsize() {
        // 1000 sat fee, 250 vbytes = 4000 sat/kvB
        let fee = Amount::from_sat(1000);
        assert_eq!(
            FeeRate::from_amount_and_vsize(fee, 250)
                .unwrap()
                .as_sat_per_kvb(),
            4000
        );

        // 500 sat fee, 200 vbytes = 2500 sat/kvB
        let fee = Amount::from_sat(500);
        assert_eq!(
            FeeRate::from_amount_and_vsize(fee, 200)
                .unwrap()
                .as_sat_per_kvb(),
            2500
        );

        // Zero vsize should error
        let fee = Amount::from_sat(1000);
        assert!(FeeRate::from_amount_and_vsize(fee, 0).is_err());

        // Negative vsize should error
        assert!(FeeRate::from_amount_and_vsize(fee, -1).is_err());
    }

    #[test]
    fn test_get_fee_round_trips_whole_kvb() {
        let rate = FeeRate::from_sat_per_vb(2);
        assert_eq!(rate.get_fee(100), Amount::from_sat(200));
        assert_eq!(rate.get_fee(0), Amount::ZERO);
    }

    #[test]
    fn test_ordering_matches_arithmetic() {
        let low = FeeRate::from_amount_and_vsize(Amount::from_sat(150), 100).unwrap();
        let high = FeeRate::from_amount_and_vsize(Amount::from_sat(400), 200).unwrap();
        let target = FeeRate::from_sat_per_kvb(1800);
        assert!(low < target);
        assert!(high > target);
    }
}
