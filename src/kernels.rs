//! Registry of kernel variants.
//!
//! Each operator with performance-critical loops has a [`KernelTable`] that
//! maps a [`KernelKey`] (data type, input and output packing, instruction set)
//! to a kernel function. Tables are built once and consulted both when a
//! layer creates its pipeline, to decide the layout of its packed weights,
//! and when it runs, to find the kernel that reads them. Selection is a pure
//! function of its inputs so the two always agree.

use std::fmt;

use packnn_base::half::round_to_f16;
use packnn_base::{Bf16, Element, F16};
use rustc_hash::FxHashMap;

use crate::cpu::CpuFeatures;
use crate::options::RunOptions;
use crate::simd::IsaId;

/// Numeric representation used by a kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,

    /// f16 storage with f32 accumulation, rounded to f16 on store.
    F16Storage,

    /// f16 storage and arithmetic. Accumulators are rounded to f16 after
    /// every step.
    F16Arith,

    /// bf16 storage with f32 accumulation.
    Bf16Storage,

    /// int8 weights and dynamically quantized int8 inputs, with i32
    /// accumulation. Activations are stored as f32.
    Int8,
}

impl DType {
    /// Size in bytes of one activation scalar.
    pub fn storage_size(self) -> usize {
        match self {
            DType::F32 | DType::Int8 => 4,
            DType::F16Storage | DType::F16Arith | DType::Bf16Storage => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16Storage => "fp16s",
            DType::F16Arith => "fp16sa",
            DType::Bf16Storage => "bf16s",
            DType::Int8 => "int8",
        };
        write!(f, "{}", name)
    }
}

/// Choose the data type for a layer's kernels.
///
/// `int8_weights` indicates whether the layer was configured for int8
/// inference.
pub fn select_dtype(opt: &RunOptions, int8_weights: bool) -> DType {
    if int8_weights && opt.use_int8_inference {
        DType::Int8
    } else if opt.use_fp16_storage && opt.use_fp16_arithmetic {
        DType::F16Arith
    } else if opt.use_fp16_storage {
        DType::F16Storage
    } else if opt.use_bf16_storage {
        DType::Bf16Storage
    } else {
        DType::F32
    }
}

/// Identifies a kernel variant within an operator's table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub dtype: DType,
    pub in_pack: usize,
    pub out_pack: usize,
    pub isa: IsaId,
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pack{}to{} {}",
            self.dtype, self.in_pack, self.out_pack, self.isa
        )
    }
}

/// A selected kernel together with the key it was registered under.
#[derive(Copy, Clone, Debug)]
pub struct Plan<K> {
    pub key: KernelKey,
    pub kernel: K,
}

/// Kernel variants for one operator.
///
/// `K` is usually a function pointer type.
pub struct KernelTable<K> {
    op_name: &'static str,
    kernels: FxHashMap<KernelKey, K>,
}

impl<K: Copy> KernelTable<K> {
    pub fn new(op_name: &'static str) -> Self {
        KernelTable {
            op_name,
            kernels: FxHashMap::default(),
        }
    }

    /// Register `kernel` for every instruction set compiled into the binary.
    pub fn register_all_isas(&mut self, dtype: DType, in_pack: usize, out_pack: usize, kernel: K) {
        for &isa in IsaId::compiled() {
            self.register(
                KernelKey {
                    dtype,
                    in_pack,
                    out_pack,
                    isa,
                },
                kernel,
            );
        }
    }

    pub fn register(&mut self, key: KernelKey, kernel: K) {
        self.kernels.insert(key, kernel);
    }

    /// Return true if a portable kernel exists for `dtype` and the given
    /// packing.
    pub fn supports(&self, dtype: DType, in_pack: usize, out_pack: usize) -> bool {
        self.kernels.contains_key(&KernelKey {
            dtype,
            in_pack,
            out_pack,
            isa: IsaId::Scalar,
        })
    }

    /// Find the preferred kernel for a data type and packing on a CPU with
    /// the given features.
    ///
    /// Instruction sets are tried in the order given by
    /// [`CpuFeatures::isa_priority`], ending with the portable kernels.
    pub fn select(
        &self,
        dtype: DType,
        in_pack: usize,
        out_pack: usize,
        features: &CpuFeatures,
    ) -> Option<Plan<K>> {
        let isas = features.isa_priority();
        let plan = isas.iter().find_map(|&isa| {
            let key = KernelKey {
                dtype,
                in_pack,
                out_pack,
                isa,
            };
            self.kernels.get(&key).map(|&kernel| Plan { key, kernel })
        })?;

        if plan.key.isa == IsaId::Scalar && isas.len() > 1 {
            tracing::warn!(
                op = self.op_name,
                %dtype,
                in_pack,
                out_pack,
                "no accelerated kernel, using portable fallback"
            );
        }
        Some(plan)
    }

    /// Number of registered variants.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

/// Scalar types that activations and weights are stored as.
///
/// Kernels load stored values into f32 buffers, compute and convert back on
/// store.
pub trait Storage: Element {
    fn to_f32(self) -> f32;
    fn from_f32(x: f32) -> Self;

    /// Return `src` as f32 values, converting into `scratch` if needed.
    ///
    /// `scratch` must be at least as long as `src`.
    #[inline]
    fn widen<'a>(src: &'a [Self], scratch: &'a mut [f32]) -> &'a [f32] {
        let scratch = &mut scratch[..src.len()];
        for (x, y) in src.iter().zip(scratch.iter_mut()) {
            *y = x.to_f32();
        }
        scratch
    }

    /// Convert `src` and write it to `dst`.
    #[inline]
    fn narrow(src: &[f32], dst: &mut [Self]) {
        for (x, y) in src.iter().zip(dst) {
            *y = Self::from_f32(*x);
        }
    }
}

impl Storage for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(x: f32) -> f32 {
        x
    }

    #[inline]
    fn widen<'a>(src: &'a [f32], _scratch: &'a mut [f32]) -> &'a [f32] {
        src
    }

    #[inline]
    fn narrow(src: &[f32], dst: &mut [f32]) {
        dst.copy_from_slice(src);
    }
}

impl Storage for F16 {
    #[inline]
    fn to_f32(self) -> f32 {
        F16::to_f32(self)
    }

    #[inline]
    fn from_f32(x: f32) -> F16 {
        F16::from_f32(x)
    }
}

impl Storage for Bf16 {
    #[inline]
    fn to_f32(self) -> f32 {
        Bf16::to_f32(self)
    }

    #[inline]
    fn from_f32(x: f32) -> Bf16 {
        Bf16::from_f32(x)
    }
}

/// Rounding applied to accumulators after each accumulation step.
pub trait Accumulate: Copy + Send + Sync + 'static {
    /// True if [`round`](Accumulate::round) is the identity.
    const EXACT: bool;

    fn round(x: f32) -> f32;

    #[inline]
    fn round_slice(acc: &mut [f32]) {
        if !Self::EXACT {
            for x in acc {
                *x = Self::round(*x);
            }
        }
    }
}

/// Accumulate in f32.
#[derive(Copy, Clone, Debug)]
pub struct F32Acc;

impl Accumulate for F32Acc {
    const EXACT: bool = true;

    #[inline]
    fn round(x: f32) -> f32 {
        x
    }
}

/// Accumulate with f16 precision.
#[derive(Copy, Clone, Debug)]
pub struct F16Acc;

impl Accumulate for F16Acc {
    const EXACT: bool = false;

    #[inline]
    fn round(x: f32) -> f32 {
        round_to_f16(x)
    }
}

/// Register the float kernels of an operator for each data type.
///
/// `$kernel` is an expression naming a kernel instantiated with the storage
/// type `$S` and accumulator `$A`, eg. `conv_packed::<S, A, 4, 8>`, and
/// `$in`, `$out` give the packing it is registered for.
macro_rules! register_float_kernels {
    ($table:expr, $in:expr, $out:expr, $S:ident, $A:ident => $kernel:expr) => {{
        use $crate::kernels::{DType, F16Acc, F32Acc, KernelKey};
        use $crate::simd::IsaId;
        $table.register_all_isas(DType::F32, $in, $out, {
            type $S = f32;
            type $A = F32Acc;
            $kernel
        });
        $table.register_all_isas(DType::F16Storage, $in, $out, {
            type $S = packnn_base::F16;
            type $A = F32Acc;
            $kernel
        });
        $table.register_all_isas(DType::Bf16Storage, $in, $out, {
            type $S = packnn_base::Bf16;
            type $A = F32Acc;
            $kernel
        });

        // The x86_64 kernels have no native f16 arithmetic, so only the
        // portable and Arm kernels advertise it.
        for isa in [IsaId::Scalar, IsaId::Neon] {
            if IsaId::compiled().contains(&isa) {
                let key = KernelKey {
                    dtype: DType::F16Arith,
                    in_pack: $in,
                    out_pack: $out,
                    isa,
                };
                $table.register(key, {
                    type $S = packnn_base::F16;
                    type $A = F16Acc;
                    $kernel
                });
            }
        }
    }};
}

pub(crate) use register_float_kernels;

#[cfg(test)]
mod tests {
    use packnn_testing::TestCases;

    use super::{select_dtype, DType, KernelKey, KernelTable};
    use crate::cpu::CpuFeatures;
    use crate::options::RunOptions;
    use crate::simd::IsaId;

    #[test]
    fn test_select_dtype() {
        #[derive(Debug)]
        struct Case {
            fp16_storage: bool,
            fp16_arith: bool,
            bf16: bool,
            int8_weights: bool,
            expected: DType,
        }

        let cases = [
            Case {
                fp16_storage: false,
                fp16_arith: false,
                bf16: false,
                int8_weights: false,
                expected: DType::F32,
            },
            Case {
                fp16_storage: true,
                fp16_arith: false,
                bf16: true,
                int8_weights: false,
                expected: DType::F16Storage,
            },
            Case {
                fp16_storage: true,
                fp16_arith: true,
                bf16: false,
                int8_weights: false,
                expected: DType::F16Arith,
            },
            // Arithmetic without storage has no effect.
            Case {
                fp16_storage: false,
                fp16_arith: true,
                bf16: false,
                int8_weights: false,
                expected: DType::F32,
            },
            Case {
                fp16_storage: false,
                fp16_arith: false,
                bf16: true,
                int8_weights: false,
                expected: DType::Bf16Storage,
            },
            Case {
                fp16_storage: true,
                fp16_arith: false,
                bf16: false,
                int8_weights: true,
                expected: DType::Int8,
            },
        ];

        cases.test_each(|case| {
            let opt = RunOptions {
                use_fp16_storage: case.fp16_storage,
                use_fp16_arithmetic: case.fp16_arith,
                use_bf16_storage: case.bf16,
                ..RunOptions::default()
            };
            assert_eq!(select_dtype(&opt, case.int8_weights), case.expected);
        });

        let no_int8 = RunOptions {
            use_int8_inference: false,
            ..RunOptions::default()
        };
        assert_eq!(select_dtype(&no_int8, true), DType::F32);
    }

    #[test]
    fn test_select_prefers_accelerated_kernels() {
        let mut table = KernelTable::<&'static str>::new("Test");
        table.register_all_isas(DType::F32, 4, 4, "generic");
        table.register(
            KernelKey {
                dtype: DType::F32,
                in_pack: 4,
                out_pack: 4,
                isa: IsaId::Avx2,
            },
            "avx2",
        );
        table.register(
            KernelKey {
                dtype: DType::Int8,
                in_pack: 1,
                out_pack: 1,
                isa: IsaId::Scalar,
            },
            "int8",
        );

        let avx2 = CpuFeatures {
            sse2: true,
            avx2: true,
            ..CpuFeatures::baseline()
        };
        let baseline = CpuFeatures::baseline();

        let plan = table.select(DType::F32, 4, 4, &avx2).unwrap();
        assert_eq!(plan.kernel, "avx2");
        assert_eq!(plan.key.isa, IsaId::Avx2);

        let plan = table.select(DType::F32, 4, 4, &baseline).unwrap();
        assert_eq!(plan.key.isa, IsaId::Scalar);

        // Falls back to the portable kernel.
        let plan = table.select(DType::Int8, 1, 1, &avx2).unwrap();
        assert_eq!(plan.kernel, "int8");
        assert_eq!(plan.key.isa, IsaId::Scalar);

        assert!(table.select(DType::F16Storage, 4, 4, &avx2).is_none());
        assert!(table.supports(DType::F32, 4, 4));
        assert!(!table.supports(DType::F32, 1, 4));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let mut table = KernelTable::<usize>::new("Test");
        for (i, &isa) in IsaId::compiled().iter().enumerate() {
            table.register(
                KernelKey {
                    dtype: DType::F32,
                    in_pack: 1,
                    out_pack: 1,
                    isa,
                },
                i,
            );
        }
        let features = CpuFeatures::detect();
        let a = table.select(DType::F32, 1, 1, &features).unwrap();
        let b = table.select(DType::F32, 1, 1, &features).unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.kernel, b.kernel);
    }
}
