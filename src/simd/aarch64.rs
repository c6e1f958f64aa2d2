use std::arch::aarch64::{
    vaddq_f32, vaddvq_f32, vaddvq_s32, vdupq_n_f32, vdupq_n_s32, vfmaq_f32, vld1_s8, vld1q_f32,
    vmaxq_f32, vmulq_f32, vmull_s8, vpadalq_s16, vst1q_f32,
};

use super::{Isa, IsaId};

/// Arm Neon instruction set. This is part of the aarch64 baseline.
#[derive(Copy, Clone, Debug)]
pub struct NeonIsa {
    _private: (),
}

impl NeonIsa {
    pub fn new() -> Self {
        NeonIsa { _private: () }
    }
}

impl Default for NeonIsa {
    fn default() -> Self {
        Self::new()
    }
}

// Safety for all methods below: Neon is always available on aarch64, and all
// loads and stores are within `0..n`.
impl Isa for NeonIsa {
    fn id(self) -> IsaId {
        IsaId::Neon
    }

    #[inline(always)]
    fn fma_scalar(self, acc: &mut [f32], a: &[f32], b: f32) {
        let n = acc.len().min(a.len());
        let mut i = 0;
        unsafe {
            let vb = vdupq_n_f32(b);
            while i + 4 <= n {
                let va = vld1q_f32(a.as_ptr().add(i));
                let vacc = vld1q_f32(acc.as_ptr().add(i));
                vst1q_f32(acc.as_mut_ptr().add(i), vfmaq_f32(vacc, va, vb));
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
            while i + 4 <= n {
                let va = vld1q_f32(a.as_ptr().add(i));
                let vb = vld1q_f32(b.as_ptr().add(i));
                let vacc = vld1q_f32(acc.as_ptr().add(i));
                vst1q_f32(acc.as_mut_ptr().add(i), vfmaq_f32(vacc, va, vb));
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
        let mut sum = unsafe {
            let mut vsum = vdupq_n_f32(0.);
            while i + 4 <= n {
                let va = vld1q_f32(a.as_ptr().add(i));
                let vb = vld1q_f32(b.as_ptr().add(i));
                vsum = vfmaq_f32(vsum, va, vb);
                i += 4;
            }
            vaddvq_f32(vsum)
        };
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
            let valpha = vdupq_n_f32(alpha);
            let vbeta = vdupq_n_f32(beta);
            while i + 4 <= n {
                let va = vld1q_f32(a.as_ptr().add(i));
                let vb = vld1q_f32(b.as_ptr().add(i));
                let y = vfmaq_f32(vmulq_f32(vb, vbeta), va, valpha);
                vst1q_f32(out.as_mut_ptr().add(i), y);
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
        unsafe {
            while i + 4 <= n {
                let va = vld1q_f32(a.as_ptr().add(i));
                let vacc = vld1q_f32(acc.as_ptr().add(i));
                vst1q_f32(acc.as_mut_ptr().add(i), vmaxq_f32(vacc, va));
                i += 4;
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
            while i + 4 <= n {
                let va = vld1q_f32(a.as_ptr().add(i));
                let vacc = vld1q_f32(acc.as_ptr().add(i));
                vst1q_f32(acc.as_mut_ptr().add(i), vaddq_f32(vacc, va));
                i += 4;
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
        let mut sum = unsafe {
            let mut vsum = vdupq_n_s32(0);
            while i + 8 <= n {
                let va = vld1_s8(a.as_ptr().add(i));
                let vb = vld1_s8(b.as_ptr().add(i));
                vsum = vpadalq_s16(vsum, vmull_s8(va, vb));
                i += 8;
            }
            vaddvq_s32(vsum)
        };
        for j in i..n {
            sum += a[j] as i32 * b[j] as i32;
        }
        sum
    }
}
