//! 16-bit floating point storage types.
//!
//! [`F16`] is IEEE 754 binary16 and [`Bf16`] is the "brain float" format,
//! which keeps the 8-bit exponent of an f32 and truncates the mantissa to 7
//! bits. Both are storage-only types: arithmetic is done by converting to f32.
//!
//! These can be replaced with types from the Rust standard library when they
//! are stabilized. See <https://github.com/rust-lang/rust/issues/116909>.

use std::fmt;

/// IEEE half-precision float, stored as its bit pattern.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct F16(pub u16);

impl F16 {
    pub const ZERO: F16 = F16(0);

    /// Convert from f32, rounding to nearest with ties to even.
    #[inline]
    pub fn from_f32(value: f32) -> F16 {
        F16(f32_to_f16_bits(value))
    }

    #[inline]
    pub fn to_f32(self) -> f32 {
        f16_bits_to_f32(self.0)
    }

    pub fn to_bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> F16 {
        F16(bits)
    }
}

impl fmt::Debug for F16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}f16", self.to_f32())
    }
}

impl From<F16> for f32 {
    fn from(val: F16) -> f32 {
        val.to_f32()
    }
}

/// Brain float, stored as the upper 16 bits of an f32.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Bf16(pub u16);

impl Bf16 {
    pub const ZERO: Bf16 = Bf16(0);

    /// Convert from f32, rounding to nearest with ties to even.
    #[inline]
    pub fn from_f32(value: f32) -> Bf16 {
        Bf16(f32_to_bf16_bits(value))
    }

    #[inline]
    pub fn to_f32(self) -> f32 {
        f32::from_bits((self.0 as u32) << 16)
    }

    pub fn to_bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Bf16 {
        Bf16(bits)
    }
}

impl fmt::Debug for Bf16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}bf16", self.to_f32())
    }
}

impl From<Bf16> for f32 {
    fn from(val: Bf16) -> f32 {
        val.to_f32()
    }
}

/// Round an f32 to the nearest value representable as f16.
#[inline]
pub fn round_to_f16(value: f32) -> f32 {
    f16_bits_to_f32(f32_to_f16_bits(value))
}

/// Convert the bits of an f16 value to f32.
///
/// The implementation follows the `half` crate -
/// <https://github.com/VoidStarKat/half-rs>.
pub fn f16_bits_to_f32(i: u16) -> f32 {
    // Signed zero
    if i & 0x7FFFu16 == 0 {
        return f32::from_bits((i as u32) << 16);
    }

    let half_sign = (i & 0x8000u16) as u32;
    let half_exp = (i & 0x7C00u16) as u32;
    let half_man = (i & 0x03FFu16) as u32;

    // All exponent bits set: infinity or NaN.
    if half_exp == 0x7C00u32 {
        if half_man == 0 {
            return f32::from_bits((half_sign << 16) | 0x7F80_0000u32);
        } else {
            // Quiet the NaN, keeping the payload.
            return f32::from_bits((half_sign << 16) | 0x7FC0_0000u32 | (half_man << 13));
        }
    }

    let sign = half_sign << 16;
    let unbiased_exp = ((half_exp as i32) >> 10) - 15;

    // Subnormals are normalized by adjusting the exponent.
    if half_exp == 0 {
        let e = (half_man as u16).leading_zeros() - 6;
        let exp = (127 - 15 - e) << 23;
        let man = (half_man << (14 + e)) & 0x7F_FF_FFu32;
        return f32::from_bits(sign | exp | man);
    }

    let exp = ((unbiased_exp + 127) as u32) << 23;
    let man = (half_man & 0x03FFu32) << 13;
    f32::from_bits(sign | exp | man)
}

/// Convert an f32 value to the bits of the nearest f16.
///
/// The implementation follows the `half` crate -
/// <https://github.com/VoidStarKat/half-rs>.
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let x: u32 = value.to_bits();

    let sign = x & 0x8000_0000u32;
    let exp = x & 0x7F80_0000u32;
    let man = x & 0x007F_FFFFu32;

    // Infinity or NaN. NaNs keep the MSB of the mantissa set.
    if exp == 0x7F80_0000u32 {
        let nan_bit = if man == 0 { 0 } else { 0x0200u32 };
        return ((sign >> 16) | 0x7C00u32 | nan_bit | (man >> 13)) as u16;
    }

    let half_sign = sign >> 16;
    let unbiased_exp = ((exp >> 23) as i32) - 127;
    let half_exp = unbiased_exp + 15;

    // Overflow rounds to infinity.
    if half_exp >= 0x1F {
        return (half_sign | 0x7C00u32) as u16;
    }

    if half_exp <= 0 {
        // Too small even for a subnormal.
        if 14 - half_exp > 24 {
            return half_sign as u16;
        }
        let man = man | 0x0080_0000u32;
        let mut half_man = man >> (14 - half_exp);
        let round_bit = 1 << (13 - half_exp);
        if (man & round_bit) != 0 && (man & (3 * round_bit - 1)) != 0 {
            half_man += 1;
        }
        return (half_sign | half_man) as u16;
    }

    let half_exp = (half_exp as u32) << 10;
    let half_man = man >> 13;

    // Round to nearest, ties to even. A carry out of the mantissa correctly
    // increments the exponent.
    let round_bit = 0x0000_1000u32;
    if (man & round_bit) != 0 && (man & (3 * round_bit - 1)) != 0 {
        ((half_sign | half_exp | half_man) + 1) as u16
    } else {
        (half_sign | half_exp | half_man) as u16
    }
}

/// Convert an f32 value to the bits of the nearest bf16.
pub fn f32_to_bf16_bits(value: f32) -> u16 {
    let x = value.to_bits();
    if value.is_nan() {
        return ((x >> 16) | 0x0040) as u16;
    }
    let round_bit = 0x0000_8000u32;
    let upper = (x >> 16) as u16;
    if (x & round_bit) != 0 && (x & (3 * round_bit - 1)) != 0 {
        upper.wrapping_add(1)
    } else {
        upper
    }
}

#[cfg(test)]
mod tests {
    use packnn_testing::TestCases;

    use super::{round_to_f16, Bf16, F16};

    #[test]
    fn test_f16_round_trip() {
        #[derive(Clone, Debug)]
        struct Case {
            input: f32,
            output: f32,
        }

        let cases = [
            Case {
                input: 0.,
                output: 0.,
            },
            Case {
                input: -1.,
                output: -1.,
            },
            Case {
                input: 2.,
                output: 2.,
            },
            Case {
                input: 0.333,
                output: 0.3330078,
            },
            Case {
                input: 65504.,
                output: 65504.,
            },
            Case {
                input: f32::INFINITY,
                output: f32::INFINITY,
            },
            Case {
                input: f32::MAX,
                output: f32::INFINITY,
            },
            Case {
                input: f32::MIN,
                output: f32::NEG_INFINITY,
            },
            Case {
                input: f32::MIN_POSITIVE,
                output: 0.,
            },
            // Smallest f16 subnormal.
            Case {
                input: 5.9604645e-8,
                output: 5.9604645e-8,
            },
        ];

        cases.test_each_clone(|Case { input, output }| {
            let half = F16::from_f32(input);
            assert_eq!(half.to_f32(), output);
        });
    }

    #[test]
    fn test_f16_ties_to_even() {
        // 1 + 2^-11 lies exactly between 1.0 and the next f16. The tie rounds
        // to the even mantissa, 1.0.
        let tie = 1.0 + f32::powi(2., -11);
        assert_eq!(round_to_f16(tie), 1.0);

        // 1 + 3 * 2^-11 lies between 1 + 2^-10 (odd) and 1 + 2^-9 (even).
        let tie = 1.0 + 3. * f32::powi(2., -11);
        assert_eq!(round_to_f16(tie), 1.0 + f32::powi(2., -9));
    }

    #[test]
    fn test_f16_relative_error() {
        let mut x = 1.0e-4f32;
        while x < 6.0e4 {
            for v in [x, -x] {
                let err = (F16::from_f32(v).to_f32() - v).abs() / v.abs();
                assert!(err <= f32::powi(2., -10), "error {} for {}", err, v);
            }
            x *= 1.37;
        }
    }

    #[test]
    fn test_bf16_conversion() {
        #[derive(Clone, Debug)]
        struct Case {
            input: f32,
            bits: u16,
        }

        let cases = [
            Case {
                input: 1.,
                bits: 0x3F80,
            },
            Case {
                input: -2.,
                bits: 0xC000,
            },
            // 1 + 2^-8 is a tie between 1.0 and 1 + 2^-7, rounds to even.
            Case {
                input: 1.00390625,
                bits: 0x3F80,
            },
            // 1 + 3 * 2^-8 ties upwards to the even mantissa.
            Case {
                input: 1.01171875,
                bits: 0x3F82,
            },
            Case {
                input: f32::INFINITY,
                bits: 0x7F80,
            },
        ];

        cases.test_each_clone(|Case { input, bits }| {
            assert_eq!(Bf16::from_f32(input).to_bits(), bits);
        });

        assert!(Bf16::from_f32(f32::NAN).to_f32().is_nan());
    }

    #[test]
    fn test_bf16_relative_error() {
        let mut x = 1.0e-30f32;
        while x < 1.0e30 {
            let err = (Bf16::from_f32(x).to_f32() - x).abs() / x;
            assert!(err <= f32::powi(2., -7), "error {} for {}", err, x);
            x *= 3.7;
        }
    }
}
