//! # Domain Invariants
//!
//! Business rules checked before money moves.

use super::errors::{Hash, SwapError};

/// Default margin between the escrow deadline and the script-chain expiry (6 hours).
pub const MIN_TIMELOCK_MARGIN_SECS: u64 = 6 * 3600;

/// Smallest spendable output on the script chain, in satoshis.
pub const DUST_THRESHOLD_SAT: u64 = 546;

/// Largest height-based absolute timelock (values above are unix times).
pub const MAX_TIMELOCK: u32 = 499_999_999;

/// Target block interval used to turn a height into a wall-clock deadline.
pub const BLOCK_TIME_SECS: u64 = 600;

/// Invariant: timelock ordering.
///
/// The first-locked leg must expire after the second-locked leg plus a
/// margin, so the party that learns the secret last still has time to use it.
pub fn invariant_timelock_ordering(
    first_leg_deadline: u64,
    second_leg_deadline: u64,
    min_margin_secs: u64,
) -> Result<(), SwapError> {
    if first_leg_deadline <= second_leg_deadline.saturating_add(min_margin_secs) {
        return Err(SwapError::InvalidParameter(format!(
            "timelock ordering violated: first leg {first_leg_deadline} must exceed second leg {second_leg_deadline} + {min_margin_secs}s"
        )));
    }
    Ok(())
}

/// Invariant: both legs share one hash-lock.
pub fn invariant_hashlock_match(a: &Hash, b: &Hash) -> Result<(), SwapError> {
    use subtle::ConstantTimeEq;
    if bool::from(a.ct_eq(b)) {
        Ok(())
    } else {
        Err(SwapError::InvalidParameter("hash-lock mismatch between legs".to_string()))
    }
}

/// Invariant: amount is strictly above the dust threshold.
pub fn invariant_above_dust(amount: u64, dust_threshold: u64) -> Result<(), SwapError> {
    if amount <= dust_threshold {
        return Err(SwapError::InvalidParameter(format!(
            "amount {amount} sat not above dust threshold {dust_threshold} sat"
        )));
    }
    Ok(())
}

/// Invariant: output buried deeply enough.
pub fn invariant_sufficient_confirmations(confirmations: u32, required: u32) -> Result<(), SwapError> {
    if confirmations < required {
        return Err(SwapError::InvalidParameter(format!(
            "funding has {confirmations}/{required} confirmations"
        )));
    }
    Ok(())
}

/// Estimated unix deadline of a height timelock.
pub fn height_to_deadline(current_height: u32, timelock: u32, now: u64) -> u64 {
    let blocks = u64::from(timelock.saturating_sub(current_height));
    now + blocks * BLOCK_TIME_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timelock_ordering() {
        assert!(invariant_timelock_ordering(100_000, 50_000, MIN_TIMELOCK_MARGIN_SECS).is_ok());
        assert!(invariant_timelock_ordering(60_000, 50_000, MIN_TIMELOCK_MARGIN_SECS).is_err());
        // Exactly at the margin is still too tight.
        assert!(invariant_timelock_ordering(50_000 + MIN_TIMELOCK_MARGIN_SECS, 50_000, MIN_TIMELOCK_MARGIN_SECS).is_err());
    }

    #[test]
    fn test_dust() {
        assert!(invariant_above_dust(547, DUST_THRESHOLD_SAT).is_ok());
        assert!(invariant_above_dust(DUST_THRESHOLD_SAT, DUST_THRESHOLD_SAT).is_err());
        assert!(invariant_above_dust(545, DUST_THRESHOLD_SAT).is_err());
    }

    #[test]
    fn test_hashlock_match() {
        assert!(invariant_hashlock_match(&[1; 32], &[1; 32]).is_ok());
        assert!(invariant_hashlock_match(&[1; 32], &[2; 32]).is_err());
    }

    #[test]
    fn test_height_to_deadline() {
        assert_eq!(height_to_deadline(100, 110, 1_000), 1_000 + 6_000);
        assert_eq!(height_to_deadline(120, 110, 1_000), 1_000);
    }

    #[test]
    fn test_confirmations() {
        assert!(invariant_sufficient_confirmations(1, 1).is_ok());
        assert!(invariant_sufficient_confirmations(0, 1).is_err());
    }
}
