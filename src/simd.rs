//! Instruction set abstraction used by the kernel library.
//!
//! Kernels are written once, generic over an [`Isa`], and instantiated for
//! each instruction set compiled into the binary. An `Isa` value is a token
//! proving that its instructions are available, so it can only be obtained via
//! constructors that check at runtime where needed.
//!
//! The primitives operate on short slices, typically one packed element of
//! 4 or 8 lanes, or a contiguous row. Implementations process full vector
//! registers and finish any remainder with scalar code.

use std::fmt;

mod generic;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::NeonIsa;
pub use generic::GenericIsa;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{Avx2Isa, Sse2Isa};

/// Identifies an instruction set that kernels can be instantiated for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IsaId {
    /// Portable code, available everywhere.
    Scalar,
    /// x86_64 SSE2 (128-bit).
    Sse2,
    /// x86_64 AVX2 + FMA (256-bit).
    Avx2,
    /// aarch64 Advanced SIMD (128-bit).
    Neon,
}

impl IsaId {
    /// Instruction sets that are compiled into this binary for the target
    /// architecture. Whether they can be used also depends on the CPU.
    pub fn compiled() -> &'static [IsaId] {
        #[cfg(target_arch = "x86_64")]
        {
            &[IsaId::Scalar, IsaId::Sse2, IsaId::Avx2]
        }
        #[cfg(target_arch = "aarch64")]
        {
            &[IsaId::Scalar, IsaId::Neon]
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            &[IsaId::Scalar]
        }
    }
}

impl fmt::Display for IsaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsaId::Scalar => "scalar",
            IsaId::Sse2 => "sse2",
            IsaId::Avx2 => "avx2",
            IsaId::Neon => "neon",
        };
        write!(f, "{}", name)
    }
}

/// Vector primitives for an instruction set.
///
/// The provided methods are portable scalar implementations, which
/// [`GenericIsa`] uses as-is. Slices passed to binary operations must have
/// the same length.
pub trait Isa: Copy + Send + Sync {
    fn id(self) -> IsaId;

    /// `acc[i] += a[i] * b`
    #[inline(always)]
    fn fma_scalar(self, acc: &mut [f32], a: &[f32], b: f32) {
        debug_assert_eq!(acc.len(), a.len());
        for (acc, a) in acc.iter_mut().zip(a) {
            *acc += a * b;
        }
    }

    /// `acc[i] += a[i] * b[i]`
    #[inline(always)]
    fn fma(self, acc: &mut [f32], a: &[f32], b: &[f32]) {
        debug_assert_eq!(acc.len(), a.len());
        for ((acc, a), b) in acc.iter_mut().zip(a).zip(b) {
            *acc += a * b;
        }
    }

    /// Sum of `a[i] * b[i]`.
    #[inline(always)]
    fn dot(self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        a.iter().zip(b).map(|(a, b)| a * b).sum()
    }

    /// `out[i] = a[i] * alpha + b[i] * beta`
    #[inline(always)]
    fn axpby(self, out: &mut [f32], a: &[f32], alpha: f32, b: &[f32], beta: f32) {
        debug_assert_eq!(out.len(), a.len());
        for ((out, a), b) in out.iter_mut().zip(a).zip(b) {
            *out = a * alpha + b * beta;
        }
    }

    /// `acc[i] = max(acc[i], a[i])`
    #[inline(always)]
    fn max_assign(self, acc: &mut [f32], a: &[f32]) {
        debug_assert_eq!(acc.len(), a.len());
        for (acc, a) in acc.iter_mut().zip(a) {
            *acc = acc.max(*a);
        }
    }

    /// `acc[i] += a[i]`
    #[inline(always)]
    fn add_assign(self, acc: &mut [f32], a: &[f32]) {
        debug_assert_eq!(acc.len(), a.len());
        for (acc, a) in acc.iter_mut().zip(a) {
            *acc += a;
        }
    }

    /// Sum of `a[i] * b[i]` with 32-bit integer accumulation.
    #[inline(always)]
    fn dot_i8(self, a: &[i8], b: &[i8]) -> i32 {
        debug_assert_eq!(a.len(), b.len());
        a.iter().zip(b).map(|(&a, &b)| a as i32 * b as i32).sum()
    }
}

/// An operation that can be evaluated with any [`Isa`].
pub trait SimdOp {
    /// The type of the operation's result.
    type Output;

    /// Evaluate the operation using the given instruction set.
    fn eval<I: Isa>(self, isa: I) -> Self::Output;
}

/// Evaluate `op` using the instruction set identified by `isa`.
///
/// If `isa` is not available on the current CPU or not compiled for the
/// target, the portable implementation is used.
pub fn dispatch_isa<Op: SimdOp>(isa: IsaId, op: Op) -> Op::Output {
    match isa {
        IsaId::Scalar => op.eval(GenericIsa::new()),

        #[cfg(target_arch = "x86_64")]
        IsaId::Sse2 => op.eval(Sse2Isa::new()),

        #[cfg(target_arch = "x86_64")]
        IsaId::Avx2 => {
            // The features enabled here must match those tested for by
            // `Avx2Isa::new`.
            #[target_feature(enable = "avx2")]
            #[target_feature(enable = "avx")]
            #[target_feature(enable = "fma")]
            unsafe fn eval_avx2<Op: SimdOp>(isa: Avx2Isa, op: Op) -> Op::Output {
                op.eval(isa)
            }

            match Avx2Isa::new() {
                // Safety: AVX2 and FMA are supported.
                Some(avx2) => unsafe { eval_avx2(avx2, op) },
                None => op.eval(GenericIsa::new()),
            }
        }

        #[cfg(target_arch = "aarch64")]
        IsaId::Neon => op.eval(NeonIsa::new()),

        #[allow(unreachable_patterns)]
        _ => op.eval(GenericIsa::new()),
    }
}

#[cfg(test)]
mod tests {
    use packnn_testing::{expect_all_close, TestCases};

    use super::{dispatch_isa, Isa, IsaId, SimdOp};
    use crate::cpu::cpu_features;

    /// Runs every primitive once and returns the results, for comparing
    /// instruction sets against the portable implementation.
    struct Primitives<'a> {
        a: &'a [f32],
        b: &'a [f32],
        qa: &'a [i8],
        qb: &'a [i8],
    }

    #[derive(Debug, PartialEq)]
    struct PrimitiveResults {
        isa: IsaId,
        fma_scalar: Vec<f32>,
        fma: Vec<f32>,
        dot: f32,
        axpby: Vec<f32>,
        max: Vec<f32>,
        add: Vec<f32>,
        dot_i8: i32,
    }

    impl SimdOp for Primitives<'_> {
        type Output = PrimitiveResults;

        fn eval<I: Isa>(self, isa: I) -> PrimitiveResults {
            let mut fma_scalar = self.a.to_vec();
            isa.fma_scalar(&mut fma_scalar, self.b, 0.5);

            let mut fma = self.a.to_vec();
            isa.fma(&mut fma, self.a, self.b);

            let mut axpby = vec![0.; self.a.len()];
            isa.axpby(&mut axpby, self.a, 0.25, self.b, 0.75);

            let mut max = self.a.to_vec();
            isa.max_assign(&mut max, self.b);

            let mut add = self.a.to_vec();
            isa.add_assign(&mut add, self.b);

            PrimitiveResults {
                isa: isa.id(),
                fma_scalar,
                fma,
                dot: isa.dot(self.a, self.b),
                axpby,
                max,
                add,
                dot_i8: isa.dot_i8(self.qa, self.qb),
            }
        }
    }

    #[test]
    fn test_isa_primitives_match_scalar() {
        #[derive(Debug)]
        struct Case {
            len: usize,
        }

        // Lengths cover full registers, remainders and empty slices.
        let cases = [0, 1, 3, 4, 7, 8, 9, 16, 31, 67].map(|len| Case { len });

        cases.test_each(|&Case { len }| {
            let mut rng = fastrand::Rng::with_seed(1234);
            let a: Vec<f32> = (0..len).map(|_| rng.f32() * 2. - 1.).collect();
            let b: Vec<f32> = (0..len).map(|_| rng.f32() * 2. - 1.).collect();
            let qa: Vec<i8> = (0..len).map(|_| rng.i8(-127..=127)).collect();
            let qb: Vec<i8> = (0..len).map(|_| rng.i8(-127..=127)).collect();
            let op = || Primitives {
                a: &a,
                b: &b,
                qa: &qa,
                qb: &qb,
            };

            let expected = dispatch_isa(IsaId::Scalar, op());
            assert_eq!(expected.isa, IsaId::Scalar);

            for &isa in cpu_features().isa_priority().iter() {
                let actual = dispatch_isa(isa, op());
                assert_eq!(actual.isa, isa);
                expect_all_close(&actual.fma_scalar, &expected.fma_scalar, 1e-5, 1e-6).unwrap();
                expect_all_close(&actual.fma, &expected.fma, 1e-5, 1e-6).unwrap();
                expect_all_close(&[actual.dot], &[expected.dot], 1e-4, 1e-5).unwrap();
                expect_all_close(&actual.axpby, &expected.axpby, 1e-5, 1e-6).unwrap();
                assert_eq!(actual.max, expected.max);
                assert_eq!(actual.add, expected.add);
                assert_eq!(actual.dot_i8, expected.dot_i8);
            }
        });
    }

    #[test]
    fn test_dispatch_unavailable_isa_falls_back() {
        struct Id;
        impl SimdOp for Id {
            type Output = IsaId;
            fn eval<I: Isa>(self, isa: I) -> IsaId {
                isa.id()
            }
        }

        #[cfg(not(target_arch = "aarch64"))]
        assert_eq!(dispatch_isa(IsaId::Neon, Id), IsaId::Scalar);
        #[cfg(not(target_arch = "x86_64"))]
        assert_eq!(dispatch_isa(IsaId::Avx2, Id), IsaId::Scalar);
        assert_eq!(dispatch_isa(IsaId::Scalar, Id), IsaId::Scalar);
    }
}
