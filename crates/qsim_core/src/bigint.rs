//! Big-integer view of the fixed-point word array.
//!
//! Rudimentary arithmetic needed by benchmark generation: schoolbook
//! multiplication truncated to `W` bits and restoring long division. Not
//! complete, nor fast.

use crate::fixed_point::FixedPoint;
use std::cmp::Ordering;

pub type BigInt<const W: usize> = FixedPoint<W>;

/// Unsigned comparison of two `W`-bit values.
pub fn cmp<const W: usize>(a: &BigInt<W>, b: &BigInt<W>) -> Ordering
where
    [(); W / 64]:,
{
    for i in (0..BigInt::<W>::NUM_WORDS).rev() {
        match a.word(i).cmp(&b.word(i)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Schoolbook multiplication; the result is truncated to `W` bits.
pub fn mul<const W: usize>(a: BigInt<W>, b: BigInt<W>) -> BigInt<W>
where
    [(); W / 64]:,
{
    let n = BigInt::<W>::NUM_WORDS;
    let mut out = BigInt::<W>::zero();
    for i in 0..n {
        if a.word(i) == 0 {
            continue;
        }
        let mut carry = 0u128;
        for j in 0..n - i {
            let t = a.word(i) as u128 * b.word(j) as u128
                + out.word(i + j) as u128
                + carry;
            out.set_word(i + j, t as u64);
            carry = t >> 64;
        }
    }
    out
}

/// Restoring long division. Returns `(quotient, remainder)`.
///
/// Division by zero is a precondition violation.
pub fn divrem<const W: usize>(num: BigInt<W>, den: BigInt<W>) -> (BigInt<W>, BigInt<W>)
where
    [(); W / 64]:,
{
    assert!(!den.is_zero(), "bigint division by zero");

    let mut quot = BigInt::<W>::zero();
    let mut rem = BigInt::<W>::zero();
    for i in (0..W).rev() {
        rem = rem.shl(1);
        if num.test(i) {
            rem.set(0, true);
        }
        if cmp(&rem, &den) != Ordering::Less {
            rem = rem.wrapping_sub(den);
            quot.set(i, true);
        }
    }
    (quot, rem)
}

/// Parses a hex string (optionally `0x`-prefixed) into a `W`-bit value.
/// Digits beyond `W` bits are a precondition violation.
pub fn from_hex_string<const W: usize>(s: &str) -> BigInt<W>
where
    [(); W / 64]:,
{
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let mut out = BigInt::<W>::zero();
    for c in digits.chars() {
        let d = c
            .to_digit(16)
            .unwrap_or_else(|| panic!("bigint_from_hex_string: bad hex digit '{c}'"));
        assert!(
            out.msb().is_none_or(|m| m + 4 < W),
            "bigint_from_hex_string: \"{s}\" does not fit in {W} bits"
        );
        out = out.shl(4).wrapping_add(BigInt::<W>::from_word(d as u64));
    }
    out
}
