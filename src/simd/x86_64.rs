use std::arch::x86_64::{
    __m128i, __m256i, _mm256_add_epi32, _mm256_add_ps, _mm256_cvtepi8_epi16, _mm256_fmadd_ps,
    _mm256_loadu_ps, _mm256_madd_epi16, _mm256_max_ps, _mm256_mul_ps, _mm256_set1_ps,
    _mm256_setzero_ps, _mm256_setzero_si256, _mm256_storeu_ps, _mm256_storeu_si256, _mm_add_epi32,
    _mm_add_ps, _mm_fmadd_ps, _mm_loadl_epi64, _mm_loadu_ps, _mm_loadu_si128, _mm_madd_epi16,
    _mm_max_ps, _mm_mul_ps, _mm_set1_ps, _mm_setzero_ps, _mm_setzero_si128, _mm_srai_epi16,
    _mm_storeu_ps, _mm_storeu_si128, _mm_unpacklo_epi8,
};
use std::is_x86_feature_detected;

use super::{Isa, IsaId};

/// SSE2 instruction set. This is part of the x86_64 baseline, so it is always
/// available.
#[derive(Copy, Clone, Debug)]
pub struct Sse2Isa {
    _private: (),
}

impl Sse2Isa {
    pub fn new() -> Self {
        Sse2Isa { _private: () }
    }
}

impl Default for Sse2Isa {
    fn default() -> Self {
        Self::new()
    }
}

impl Isa for Sse2Isa {
    fn id(self) -> IsaId {
        IsaId::Sse2
    }

    #[inline(always)]
    fn fma_scalar(self, acc: &mut [f32], a: &[f32], b: f32) {
        let n = acc.len().min(a.len());
        let mut i = 0;
        // Safety: SSE2 is always available on x86_64 and all loads and
        // stores are within `0..n`.
        unsafe {
            let vb = _mm_set1_ps(b);
            while i + 4 <= n {
                let va = _mm_loadu_ps(a.as_ptr().add(i));
                let vacc = _mm_loadu_ps(acc.as_ptr().add(i));
                _mm_storeu_ps(acc.as_mut_ptr().add(i), _mm_add_ps(vacc, _mm_mul_ps(va, vb)));
                i += 4;
            }
        }
        for j in i..n {
            acc[j] += a[j] * b;
        }
    }

    #[inline(always)]
    fn fma(self, acc: &mut [f32], a: &[f32], b: &[f32]) {
        let n = acc.len().min(a.len()).min(b.len());
        let mut i = 0;
        // Safety: See `fma_scalar`.
        unsafe {
            while i + 4 <= n {
                let va = _mm_loadu_ps(a.as_ptr().add(i));
                let vb = _mm_loadu_ps(b.as_ptr().add(i));
                let vacc = _mm_loadu_ps(acc.as_ptr().add(i));
                _mm_storeu_ps(acc.as_mut_ptr().add(i), _mm_add_ps(vacc, _mm_mul_ps(va, vb)));
                i += 4;
            }
        }
        for j in i..n {
            acc[j] += a[j] * b[j];
        }
    }

    #[inline(always)]
    fn dot(self, a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let mut i = 0;
        let mut lanes = [0f32; 4];
        // Safety: See `fma_scalar`.
        unsafe {
            let mut vsum = _mm_setzero_ps();
            while i + 4 <= n {
                let va = _mm_loadu_ps(a.as_ptr().add(i));
                let vb = _mm_loadu_ps(b.as_ptr().add(i));
                vsum = _mm_add_ps(vsum, _mm_mul_ps(va, vb));
                i += 4;
            }
            _mm_storeu_ps(lanes.as_mut_ptr(), vsum);
        }
        let mut sum = lanes.iter().sum::<f32>();
        for j in i..n {
            sum += a[j] * b[j];
        }
        sum
    }

    #[inline(always)]
    fn axpby(self, out: &mut [f32], a: &[f32], alpha: f32, b: &[f32], beta: f32) {
        let n = out.len().min(a.len()).min(b.len());
        let mut i = 0;
        // Safety: See `fma_scalar`.
        unsafe {
            let valpha = _mm_set1_ps(alpha);
            let vbeta = _mm_set1_ps(beta);
            while i + 4 <= n {
                let va = _mm_loadu_ps(a.as_ptr().add(i));
                let vb = _mm_loadu_ps(b.as_ptr().add(i));
                let y = _mm_add_ps(_mm_mul_ps(va, valpha), _mm_mul_ps(vb, vbeta));
                _mm_storeu_ps(out.as_mut_ptr().add(i), y);
                i += 4;
            }
        }
        for j in i..n {
            out[j] = a[j] * alpha + b[j] * beta;
        }
    }

    #[inline(always)]
    fn max_assign(self, acc: &mut [f32], a: &[f32]) {
        let n = acc.len().min(a.len());
        let mut i = 0;
        // Safety: See `fma_scalar`.
        unsafe {
            while i + 4 <= n {
                let va = _mm_loadu_ps(a.as_ptr().add(i));
                let vacc = _mm_loadu_ps(acc.as_ptr().add(i));
                _mm_storeu_ps(acc.as_mut_ptr().add(i), _mm_max_ps(vacc, va));
                i += 4;
            }
        }
        for j in i..n {
            acc[j] = acc[j].max(a[j]);
        }
    }

    #[inline(always)]
    fn dot_i8(self, a: &[i8], b: &[i8]) -> i32 {
        let n = a.len().min(b.len());
        let mut i = 0;
        let mut lanes = [0i32; 4];
        // Safety: See `fma_scalar`. `_mm_loadl_epi64` reads 8 bytes.
        unsafe {
            let mut vsum = _mm_setzero_si128();
            while i + 8 <= n {
                let va = _mm_loadl_epi64(a.as_ptr().add(i) as *const __m128i);
                let vb = _mm_loadl_epi64(b.as_ptr().add(i) as *const __m128i);

                // Sign-extend i8 -> i16 by duplicating each byte into both
                // halves of a 16-bit lane and shifting right arithmetically.
                let wa = _mm_srai_epi16(_mm_unpacklo_epi8(va, va), 8);
                let wb = _mm_srai_epi16(_mm_unpacklo_epi8(vb, vb), 8);
                vsum = _mm_add_epi32(vsum, _mm_madd_epi16(wa, wb));
                i += 8;
            }
            _mm_storeu_si128(lanes.as_mut_ptr() as *mut __m128i, vsum);
        }
        let mut sum = lanes.iter().sum::<i32>();
        for j in i..n {
            sum += a[j] as i32 * b[j] as i32;
        }
        sum
    }
}

/// AVX2 instruction set with FMA.
#[derive(Copy, Clone, Debug)]
pub struct Avx2Isa {
    _private: (),
}

impl Avx2Isa {
    /// Return an AVX2 token if AVX2 and FMA are supported by the current CPU.
    pub fn new() -> Option<Self> {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            Some(Avx2Isa { _private: () })
        } else {
            None
        }
    }
}

// Safety for all methods below: an `Avx2Isa` can only be constructed if AVX2
// and FMA are supported, and all loads and stores are within `0..n`.
impl Isa for Avx2Isa {
    fn id(self) -> IsaId {
        IsaId::Avx2
    }

    #[inline(always)]
    fn fma_scalar(self, acc: &mut [f32], a: &[f32], b: f32) {
        let n = acc.len().min(a.len());
        let mut i = 0;
        unsafe {
            let vb = _mm256_set1_ps(b);
            while i + 8 <= n {
                let va = _mm256_loadu_ps(a.as_ptr().add(i));
                let vacc = _mm256_loadu_ps(acc.as_ptr().add(i));
                _mm256_storeu_ps(acc.as_mut_ptr().add(i), _mm256_fmadd_ps(va, vb, vacc));
                i += 8;
            }
            if i + 4 <= n {
                let va = _mm_loadu_ps(a.as_ptr().add(i));
                let vacc = _mm_loadu_ps(acc.as_ptr().add(i));
                _mm_storeu_ps(
                    acc.as_mut_ptr().add(i),
                    _mm_fmadd_ps(va, _mm_set1_ps(b), vacc),
                );
                i += 4;
            }
        }
        for j in i..n {
            acc[j] += a[j] * b;
        }
    }

    #[inline(always)]
    fn fma(self, acc: &mut [f32], a: &[f32], b: &[f32]) {
        let n = acc.len().min(a.len()).min(b.len());
        let mut i = 0;
        unsafe {
            while i + 8 <= n {
                let va = _mm256_loadu_ps(a.as_ptr().add(i));
                let vb = _mm256_loadu_ps(b.as_ptr().add(i));
                let vacc = _mm256_loadu_ps(acc.as_ptr().add(i));
                _mm256_storeu_ps(acc.as_mut_ptr().add(i), _mm256_fmadd_ps(va, vb, vacc));
                i += 8;
            }
            if i + 4 <= n {
                let va = _mm_loadu_ps(a.as_ptr().add(i));
                let vb = _mm_loadu_ps(b.as_ptr().add(i));
                let vacc = _mm_loadu_ps(acc.as_ptr().add(i));
                _mm_storeu_ps(acc.as_mut_ptr().add(i), _mm_fmadd_ps(va, vb, vacc));
                i += 4;
            }
        }
        for j in i..n {
            acc[j] += a[j] * b[j];
        }
    }

    #[inline(always)]
    fn dot(self, a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let mut i = 0;
        let mut lanes = [0f32; 8];
        unsafe {
            let mut vsum = _mm256_setzero_ps();
            while i + 8 <= n {
                let va = _mm256_loadu_ps(a.as_ptr().add(i));
                let vb = _mm256_loadu_ps(b.as_ptr().add(i));
                vsum = _mm256_fmadd_ps(va, vb, vsum);
                i += 8;
            }
            _mm256_storeu_ps(lanes.as_mut_ptr(), vsum);
        }
        let mut sum = lanes.iter().sum::<f32>();
        for j in i..n {
            sum += a[j] * b[j];
        }
        sum
    }

    #[inline(always)]
    fn axpby(self, out: &mut [f32], a: &[f32], alpha: f32, b: &[f32], beta: f32) {
        let n = out.len().min(a.len()).min(b.len());
        let mut i = 0;
        unsafe {
            let valpha = _mm256_set1_ps(alpha);
            let vbeta = _mm256_set1_ps(beta);
            while i + 8 <= n {
                let va = _mm256_loadu_ps(a.as_ptr().add(i));
                let vb = _mm256_loadu_ps(b.as_ptr().add(i));
                let y = _mm256_fmadd_ps(va, valpha, _mm256_mul_ps(vb, vbeta));
                _mm256_storeu_ps(out.as_mut_ptr().add(i), y);
                i += 8;
            }
        }
        for j in i..n {
            out[j] = a[j] * alpha + b[j] * beta;
        }
    }

    #[inline(always)]
    fn max_assign(self, acc: &mut [f32], a: &[f32]) {
        let n = acc.len().min(a.len());
        let mut i = 0;
        unsafe {
            while i + 8 <= n {
                let va = _mm256_loadu_ps(a.as_ptr().add(i));
                let vacc = _mm256_loadu_ps(acc.as_ptr().add(i));
                _mm256_storeu_ps(acc.as_mut_ptr().add(i), _mm256_max_ps(vacc, va));
                i += 8;
            }
        }
        for j in i..n {
            acc[j] = acc[j].max(a[j]);
        }
    }

    #[inline(always)]
    fn add_assign(self, acc: &mut [f32], a: &[f32]) {
        let n = acc.len().min(a.len());
        let mut i = 0;
        unsafe {
            while i + 8 <= n {
                let va = _mm256_loadu_ps(a.as_ptr().add(i));
                let vacc = _mm256_loadu_ps(acc.as_ptr().add(i));
                _mm256_storeu_ps(acc.as_mut_ptr().add(i), _mm256_add_ps(vacc, va));
                i += 8;
            }
        }
        for j in i..n {
            acc[j] += a[j];
        }
    }

    #[inline(always)]
    fn dot_i8(self, a: &[i8], b: &[i8]) -> i32 {
        let n = a.len().min(b.len());
        let mut i = 0;
        let mut lanes = [0i32; 8];
        unsafe {
            let mut vsum = _mm256_setzero_si256();
            while i + 16 <= n {
                let va = _mm256_cvtepi8_epi16(_mm_loadu_si128(a.as_ptr().add(i) as *const __m128i));
                let vb = _mm256_cvtepi8_epi16(_mm_loadu_si128(b.as_ptr().add(i) as *const __m128i));
                vsum = _mm256_add_epi32(vsum, _mm256_madd_epi16(va, vb));
                i += 16;
            }
            _mm256_storeu_si256(lanes.as_mut_ptr() as *mut __m256i, vsum);
        }
        let mut sum = lanes.iter().sum::<i32>();
        for j in i..n {
            sum += a[j] as i32 * b[j] as i32;
        }
        sum
    }
}
