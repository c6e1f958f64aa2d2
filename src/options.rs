use std::fmt;
use std::sync::Arc;

use crate::allocator::{system_allocator, Allocator};
use crate::cpu::{cpu_features, CpuFeatures};
use crate::env::{env_flag, env_number};
use crate::threading::default_num_threads;

/// Options which control how layers create pipelines and run.
///
/// Layers receive options by reference and never modify the caller's copy.
/// Where a layer needs different settings for an internal sub-computation it
/// derives a modified copy, eg. using [`RunOptions::with_num_threads`].
#[derive(Clone)]
pub struct RunOptions {
    /// Release raw weights once they have been transformed into the packed
    /// form used by the selected kernels.
    pub lightmode: bool,

    /// Maximum number of threads used by a layer's parallel loops.
    pub num_threads: usize,

    /// Allocator for layer outputs. Defaults to the system allocator.
    pub blob_allocator: Option<Arc<dyn Allocator>>,

    /// Allocator for scratch buffers and repacked inputs. Defaults to the
    /// system allocator.
    pub workspace_allocator: Option<Arc<dyn Allocator>>,

    /// Allow channels to be interleaved into 4 or 8 lane elements.
    pub use_packing_layout: bool,

    /// Store activations and weights as f16, computing in f32.
    pub use_fp16_storage: bool,

    /// Compute in f16 as well. Only takes effect together with
    /// `use_fp16_storage`.
    pub use_fp16_arithmetic: bool,

    /// Store activations and weights as bf16, computing in f32.
    pub use_bf16_storage: bool,

    /// Use int8 kernels for layers with int8 weights enabled.
    pub use_int8_inference: bool,

    /// Apply activations inside the kernels of layers that support a fused
    /// activation, rather than as a separate pass.
    pub use_fused_activation: bool,

    /// CPU features used for kernel selection instead of the detected ones.
    ///
    /// Setting [`CpuFeatures::baseline`] forces the portable kernels.
    pub cpu_features: Option<CpuFeatures>,
}

impl RunOptions {
    /// Return options with environment variable overrides applied.
    ///
    /// Recognized variables are `PACKNN_NUM_THREADS`, `PACKNN_PACKING`,
    /// `PACKNN_FP16_STORAGE`, `PACKNN_FP16_ARITHMETIC`, `PACKNN_BF16_STORAGE`
    /// and `PACKNN_LIGHTMODE`.
    pub fn from_env() -> RunOptions {
        let defaults = RunOptions::default();
        RunOptions {
            num_threads: env_number::<usize>("PACKNN_NUM_THREADS")
                .map(|n| n.max(1))
                .unwrap_or(defaults.num_threads),
            use_packing_layout: env_flag("PACKNN_PACKING", defaults.use_packing_layout),
            use_fp16_storage: env_flag("PACKNN_FP16_STORAGE", defaults.use_fp16_storage),
            use_fp16_arithmetic: env_flag("PACKNN_FP16_ARITHMETIC", defaults.use_fp16_arithmetic),
            use_bf16_storage: env_flag("PACKNN_BF16_STORAGE", defaults.use_bf16_storage),
            lightmode: env_flag("PACKNN_LIGHTMODE", defaults.lightmode),
            ..defaults
        }
    }

    /// Return a copy of these options with a different thread count.
    pub fn with_num_threads(&self, num_threads: usize) -> RunOptions {
        RunOptions {
            num_threads: num_threads.max(1),
            ..self.clone()
        }
    }

    /// Return a copy of these options with packed layouts disabled.
    pub fn without_packing(&self) -> RunOptions {
        RunOptions {
            use_packing_layout: false,
            ..self.clone()
        }
    }

    /// Return the CPU features that kernel selection should assume.
    pub fn cpu_features(&self) -> CpuFeatures {
        self.cpu_features.unwrap_or_else(|| *cpu_features())
    }

    /// Return the allocator for layer outputs.
    pub fn blob_allocator(&self) -> Arc<dyn Allocator> {
        self.blob_allocator.clone().unwrap_or_else(system_allocator)
    }

    /// Return the allocator for scratch buffers.
    pub fn workspace_allocator(&self) -> Arc<dyn Allocator> {
        self.workspace_allocator
            .clone()
            .unwrap_or_else(system_allocator)
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            lightmode: true,
            num_threads: default_num_threads(),
            blob_allocator: None,
            workspace_allocator: None,
            use_packing_layout: true,
            use_fp16_storage: false,
            use_fp16_arithmetic: false,
            use_bf16_storage: false,
            use_int8_inference: true,
            use_fused_activation: true,
            cpu_features: None,
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("lightmode", &self.lightmode)
            .field("num_threads", &self.num_threads)
            .field("custom_blob_allocator", &self.blob_allocator.is_some())
            .field("custom_workspace_allocator", &self.workspace_allocator.is_some())
            .field("use_packing_layout", &self.use_packing_layout)
            .field("use_fp16_storage", &self.use_fp16_storage)
            .field("use_fp16_arithmetic", &self.use_fp16_arithmetic)
            .field("use_bf16_storage", &self.use_bf16_storage)
            .field("use_int8_inference", &self.use_int8_inference)
            .field("use_fused_activation", &self.use_fused_activation)
            .field("cpu_features", &self.cpu_features)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::RunOptions;

    #[test]
    fn test_derived_options_leave_original_unchanged() {
        let opt = RunOptions::default();
        assert!(opt.num_threads >= 1);

        let single = opt.with_num_threads(0);
        assert_eq!(single.num_threads, 1);

        let unpacked = opt.without_packing();
        assert!(!unpacked.use_packing_layout);
        assert!(opt.use_packing_layout);
    }
}
