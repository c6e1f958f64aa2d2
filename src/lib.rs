//! packnn is a library of CPU kernels for neural network inference, organized
//! around per-operator kernel dispatch.
//!
//! # Tensors and packing
//!
//! Activations and weights are stored in [`Mat`], a reference-counted tensor
//! of up to four dimensions. Channels may be *packed*: with an `elempack` of
//! 4 or 8, that many consecutive channels are interleaved so that each stored
//! element holds one lane from each, matching the width of the SIMD registers
//! the kernels use. See [`packing`] for conversions between layouts.
//!
//! Elements are stored as `f32`, or as `f16` / `bf16` to halve memory
//! traffic. Layers configured for int8 inference quantize their weights and,
//! on the fly, their inputs. See [`convert`] and [`quantize`].
//!
//! # Layers
//!
//! Operators implement the [`Layer`] trait and are created by name with
//! [`create_layer`]. A layer moves through a fixed lifecycle:
//!
//! 1. Load parameters using [`Layer::load_param`].
//! 2. Load weights using [`Layer::load_model`].
//! 3. Create the pipeline using [`Layer::create_pipeline`]. This selects a
//!    kernel for the storage type, packing and instruction set implied by
//!    the [`RunOptions`] and the CPU, and packs the weights to match.
//! 4. Run the layer any number of times with [`Layer::forward`].
//!
//! `forward` must be called with options that select the same kernels as the
//! options used to create the pipeline.
//!
//! ```
//! use packnn::{create_layer, Layer, Mat, ParamDict, RunOptions};
//!
//! let opt = RunOptions::default();
//! let mut relu = create_layer("ReLU").unwrap();
//! relu.load_param(&ParamDict::new()).unwrap();
//! relu.create_pipeline(&opt).unwrap();
//!
//! let input = Mat::from_f32(&[4], &[-1., 2., -3., 4.]).unwrap();
//! let output = relu.forward(&[input], &opt).unwrap();
//! assert_eq!(output[0].to_vec::<f32>().unwrap(), [0., 2., 0., 4.]);
//! ```
//!
//! # Kernels
//!
//! Kernels are written once, generic over an instruction set ([`simd::Isa`])
//! and element storage type, and registered in a per-operator
//! [`KernelTable`]. See the [`kernels`] module.
//!
//! # Threading
//!
//! Kernels split their work across a process-wide pool of worker threads
//! using [`threading::parallel_for`]. [`RunOptions::num_threads`] limits the
//! number of threads used by a single call. The [`microtask`] module adapts
//! code written against a fork-join runtime's microtask interface to the same
//! pool.
//!
//! # Configuration
//!
//! The defaults of [`RunOptions::from_env`] can be overridden with
//! environment variables:
//!
//! - `PACKNN_NUM_THREADS` - Number of worker threads
//! - `PACKNN_PACKING` - Enable packed layouts (`1` / `0`)
//! - `PACKNN_FP16_STORAGE`, `PACKNN_BF16_STORAGE` - Enable 16-bit storage
//! - `PACKNN_FORCE_SCALAR` - Ignore SIMD extensions detected on the CPU
//!
//! Kernel selection and pipeline creation are logged using [`tracing`] at
//! debug level.

pub mod allocator;
pub mod convert;
pub mod cpu;
mod env;
pub mod kernels;
pub mod layer;
pub mod mat;
pub mod microtask;
pub mod ops;
pub mod options;
pub mod packing;
pub mod param;
pub mod quantize;
pub mod simd;
pub mod threading;

pub use allocator::{system_allocator, AllocError, Allocator, PoolAllocator};
pub use cpu::{cpu_features, CpuFeatures};
pub use kernels::{DType, KernelKey, KernelTable};
pub use layer::{create_layer, create_pipelines, status_code, Layer, LayerError, LayerState};
pub use mat::{Mat, MatError};
pub use options::RunOptions;
pub use param::{ParamDict, ParamValue};
pub use threading::{thread_pool, worker_pool, ThreadPool};
