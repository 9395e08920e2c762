//! Compact difficulty targets and per-block work.

use alloy_primitives::U256;

/// Expand a compact `bits` value into the full 256-bit target.
///
/// `target = mantissa × 2^(8 × (exponent − 3))` with the low 24 bits as the
/// mantissa. The sign bit is not interpreted. Targets that would not fit in
/// 256 bits saturate to `U256::MAX`.
pub fn target_from_bits(bits: u32) -> U256 {
    let exponent = bits >> 24;
    let mantissa = bits & 0x00ff_ffff;
    if mantissa == 0 {
        return U256::ZERO;
    }
    if exponent <= 3 {
        return U256::from(mantissa >> (8 * (3 - exponent)));
    }
    let shift = 8 * (exponent as usize - 3);
    let mantissa_bits = 32 - mantissa.leading_zeros() as usize;
    if mantissa_bits + shift > 256 {
        return U256::MAX;
    }
    U256::from(mantissa) << shift
}

/// Expected number of hashes for a block at `bits`: `2^256 / (target + 1)`.
pub fn work_from_bits(bits: u32) -> U256 {
    let target = target_from_bits(bits);
    if target == U256::MAX {
        return U256::from(1u64);
    }
    // 2^256 / (t + 1) == (!t / (t + 1)) + 1 without needing 257 bits.
    let divisor = target + U256::from(1u64);
    (!target / divisor).saturating_add(U256::from(1u64))
}
