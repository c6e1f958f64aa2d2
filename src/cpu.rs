//! Runtime detection of CPU features.
//!
//! Features are probed once per process and treated as immutable afterwards.
//! Kernel selection only ever consults a [`CpuFeatures`] value, so tests can
//! substitute [`CpuFeatures::baseline`] to exercise the portable kernels.

use std::sync::OnceLock;

use smallvec::SmallVec;

use crate::env::env_flag;
use crate::simd::IsaId;

/// Instruction set extensions relevant to kernel selection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    /// 128-bit SIMD on x86_64.
    pub sse2: bool,

    /// 256-bit integer and float SIMD on x86_64. Only reported when FMA is
    /// also present.
    pub avx2: bool,

    /// Hardware f16 <-> f32 conversion on x86_64.
    pub f16c: bool,

    /// 128-bit Advanced SIMD on aarch64.
    pub neon: bool,

    /// Native half-precision arithmetic.
    pub fp16_arith: bool,

    /// Native bfloat16 dot products.
    pub bf16: bool,
}

impl CpuFeatures {
    /// Feature set with no extensions, which selects the portable kernels.
    pub fn baseline() -> CpuFeatures {
        CpuFeatures::default()
    }

    /// Probe the current CPU.
    pub fn detect() -> CpuFeatures {
        #[allow(unused_mut)]
        let mut features = CpuFeatures::baseline();

        #[cfg(target_arch = "x86_64")]
        {
            features.sse2 = true;
            features.avx2 =
                is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma");
            features.f16c = is_x86_feature_detected!("f16c");
        }

        #[cfg(target_arch = "aarch64")]
        {
            features.neon = true;
            features.fp16_arith = std::arch::is_aarch64_feature_detected!("fp16");
            features.bf16 = std::arch::is_aarch64_feature_detected!("bf16");
        }

        features
    }

    /// Instruction sets usable on this CPU, in order of preference.
    ///
    /// [`IsaId::Scalar`] is always last.
    pub fn isa_priority(&self) -> SmallVec<[IsaId; 4]> {
        let mut isas = SmallVec::new();
        if self.avx2 {
            isas.push(IsaId::Avx2);
        }
        if self.sse2 {
            isas.push(IsaId::Sse2);
        }
        if self.neon {
            isas.push(IsaId::Neon);
        }
        isas.push(IsaId::Scalar);
        isas
    }

    /// Return true if `isa` can run on this CPU.
    pub fn supports(&self, isa: IsaId) -> bool {
        self.isa_priority().contains(&isa)
    }

    /// The widest channel packing that maps onto a native vector register.
    ///
    /// Without 256-bit registers, pack 8 is never selected automatically,
    /// though pack 8 kernels remain callable.
    pub fn max_elempack(&self) -> usize {
        if self.avx2 {
            8
        } else {
            4
        }
    }
}

/// Return the features of the current CPU.
///
/// Setting `PACKNN_FORCE_SCALAR=1` hides all extensions, which forces the
/// portable kernels everywhere.
pub fn cpu_features() -> &'static CpuFeatures {
    static FEATURES: OnceLock<CpuFeatures> = OnceLock::new();
    FEATURES.get_or_init(|| {
        let features = if env_flag("PACKNN_FORCE_SCALAR", false) {
            CpuFeatures::baseline()
        } else {
            CpuFeatures::detect()
        };
        tracing::debug!(?features, "detected cpu features");
        features
    })
}
