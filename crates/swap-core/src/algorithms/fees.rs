//! # Fee Math
//!
//! Size-based fee calculation and the fee sanity check every built
//! transaction passes before it is returned.

use crate::domain::SwapError;

/// Upper bound on a DER signature plus sighash byte.
pub const MAX_SIGNATURE_LEN: usize = 73;

/// Witness vbytes of a P2WPKH input (signature + key, rounded up).
pub const P2WPKH_WITNESS_VBYTES: u64 = 28;

/// Fee for `vsize` vbytes at `rate` sat/vB, rounded up.
pub fn fee_for_vsize(vsize: u64, rate: f64) -> u64 {
    (vsize as f64 * rate).ceil() as u64
}

/// Reject negative fees and rates above `ceiling` sat/vB.
///
/// Returns the fee and effective rate on success.
pub fn check_fee_sanity(
    inputs: u64,
    outputs: u64,
    vsize: u64,
    ceiling: f64,
) -> Result<(u64, f64), SwapError> {
    if outputs > inputs {
        return Err(SwapError::NegativeFee { inputs, outputs });
    }
    let fee = inputs - outputs;
    let rate = fee as f64 / vsize.max(1) as f64;
    if rate > ceiling {
        return Err(SwapError::AbsurdFee { rate, ceiling });
    }
    Ok((fee, rate))
}

/// Clamp a rate into `[floor, ceiling]`; non-finite rates become `floor`.
pub fn clamp_rate(rate: f64, floor: f64, ceiling: f64) -> f64 {
    if !rate.is_finite() {
        return floor;
    }
    rate.max(floor).min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rounds_up() {
        assert_eq!(fee_for_vsize(141, 1.0), 141);
        assert_eq!(fee_for_vsize(141, 1.5), 212);
        assert_eq!(fee_for_vsize(0, 50.0), 0);
    }

    #[test]
    fn test_negative_fee_rejected() {
        let err = check_fee_sanity(1_000, 1_001, 100, 1_000.0).unwrap_err();
        assert!(matches!(err, SwapError::NegativeFee { inputs: 1_000, outputs: 1_001 }));
    }

    #[test]
    fn test_absurd_fee_rejected() {
        let err = check_fee_sanity(1_000_000, 0, 100, 1_000.0).unwrap_err();
        assert!(matches!(err, SwapError::AbsurdFee { .. }));
    }

    #[test]
    fn test_sane_fee_passes() {
        let (fee, rate) = check_fee_sanity(100_000, 98_000, 200, 1_000.0).unwrap();
        assert_eq!(fee, 2_000);
        assert!((rate - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clamp_rate() {
        assert_eq!(clamp_rate(0.2, 1.0, 500.0), 1.0);
        assert_eq!(clamp_rate(900.0, 1.0, 500.0), 500.0);
        assert_eq!(clamp_rate(f64::NAN, 1.0, 500.0), 1.0);
    }
}
