use std::marker::PhantomData;
use std::sync::OnceLock;

use tracing::debug;

use crate::kernels::{register_float_kernels, select_dtype, Accumulate, DType, KernelTable, Storage};
use crate::layer::{prepare_input, weight_data, Layer, LayerError, LayerState, OutputList};
use crate::mat::Mat;
use crate::options::RunOptions;
use crate::param::ParamDict;
use crate::simd::{dispatch_isa, Isa, IsaId, SimdOp};
use crate::threading::{parallel_for_each_mut_with_scratch, scratch_slots};

struct LayerNormArgs<'a> {
    /// Number of elements in each normalized group.
    group_len: usize,
    eps: f32,
    gamma: &'a [f32],
    beta: &'a [f32],
    num_threads: usize,
}

/// Normalize `out` in place. `scratch` holds one group of f32 values for
/// each thread.
type LayerNormKernel =
    fn(IsaId, &LayerNormArgs<'_>, &mut Mat, &mut [f32]) -> Result<(), LayerError>;

/// Return the length of the chunks that the data of `out` is split into
/// for `pack`-lane kernels, and how much of each chunk holds groups.
///
/// Groups never span channel padding, so each channel is processed as a
/// unit.
fn chunk_layout(out: &Mat, group: usize, pack: usize) -> (usize, usize) {
    if out.dims() >= 3 {
        (out.cstep() * pack, out.plane_len() * pack)
    } else {
        (group, group)
    }
}

/// Normalize `n` consecutive `P`-lane elements, with separate statistics
/// for each lane.
fn normalize_group<I: Isa, S: Storage, A: Accumulate, const P: usize>(
    isa: I,
    data: &mut [S],
    scratch: &mut [f32],
    args: &LayerNormArgs<'_>,
) {
    let n = data.len() / P;
    let x = &mut scratch[..data.len()];
    for (x, y) in data.iter().zip(x.iter_mut()) {
        *y = x.to_f32();
    }

    let mut mean = [0.; P];
    for chunk in x.chunks_exact(P) {
        isa.add_assign(&mut mean, chunk);
    }
    for m in &mut mean {
        *m /= n as f32;
    }

    let mut var = [0.; P];
    for chunk in x.chunks_exact(P) {
        for l in 0..P {
            let d = chunk[l] - mean[l];
            var[l] += d * d;
        }
    }
    let mut scale = [0.; P];
    for l in 0..P {
        scale[l] = 1. / (var[l] / n as f32 + args.eps).sqrt();
    }

    for (i, chunk) in x.chunks_exact_mut(P).enumerate() {
        for l in 0..P {
            chunk[l] = (chunk[l] - mean[l]) * scale[l];
        }
        if let (Some(&g), Some(&b)) = (args.gamma.get(i), args.beta.get(i)) {
            for v in chunk.iter_mut() {
                *v = *v * g + b;
            }
        }
        A::round_slice(chunk);
    }
    S::narrow(x, data);
}

struct LayerNormOp<'a, 'b, 'c, S, A, const P: usize> {
    args: &'a LayerNormArgs<'a>,
    out: &'b mut Mat,
    scratch: &'c mut [f32],
    _marker: PhantomData<(S, A)>,
}

impl<S: Storage, A: Accumulate, const P: usize> SimdOp for LayerNormOp<'_, '_, '_, S, A, P> {
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let LayerNormOp {
            args, out, scratch, ..
        } = self;
        let group = args.group_len * P;
        let (chunk, used) = chunk_layout(out, group, P);
        let data = out.data_mut::<S>()?;
        parallel_for_each_mut_with_scratch(
            data,
            chunk,
            scratch,
            group,
            args.num_threads,
            |_, chunk, scratch| {
                for group in chunk[..used].chunks_exact_mut(group) {
                    normalize_group::<_, S, A, P>(isa, group, scratch, args);
                }
            },
        );
        Ok(())
    }
}

fn layernorm_packed<S: Storage, A: Accumulate, const P: usize>(
    isa: IsaId,
    args: &LayerNormArgs<'_>,
    out: &mut Mat,
    scratch: &mut [f32],
) -> Result<(), LayerError> {
    dispatch_isa(
        isa,
        LayerNormOp::<S, A, P> {
            args,
            out,
            scratch,
            _marker: PhantomData,
        },
    )
}

fn layernorm_kernels() -> &'static KernelTable<LayerNormKernel> {
    static KERNELS: OnceLock<KernelTable<LayerNormKernel>> = OnceLock::new();
    KERNELS.get_or_init(|| {
        let mut table = KernelTable::<LayerNormKernel>::new("LayerNorm");
        register_float_kernels!(table, 1, 1, S, A => layernorm_packed::<S, A, 1>);
        register_float_kernels!(table, 4, 4, S, A => layernorm_packed::<S, A, 4>);
        register_float_kernels!(table, 8, 8, S, A => layernorm_packed::<S, A, 8>);
        debug!(op = "LayerNorm", variants = table.len(), "built kernel table");
        table
    })
}

#[derive(Clone, Debug)]
struct LayerNormParams {
    affine_size: usize,
    eps: f32,
    affine: bool,
}

impl Default for LayerNormParams {
    fn default() -> Self {
        LayerNormParams {
            affine_size: 0,
            eps: 0.001,
            affine: true,
        }
    }
}

/// Layer normalization.
///
/// A 1D input is normalized as a whole and each row of a 2D input is
/// normalized separately. For a 3D input `affine_size` selects whether each
/// row (`affine_size == w`) or each channel (`affine_size == w * h`) is
/// normalized. Packing is preserved, with statistics computed separately for
/// each lane.
///
/// With `affine` set, the weights are `gamma` and `beta`, each of
/// `affine_size` values, applied after normalization.
#[derive(Default)]
pub struct LayerNorm {
    params: LayerNormParams,
    weights: Vec<Mat>,
    gamma: Vec<f32>,
    beta: Vec<f32>,
    dtype: Option<DType>,
    state: LayerState,
}

impl LayerNorm {
    pub fn new() -> LayerNorm {
        LayerNorm::default()
    }
}

impl Layer for LayerNorm {
    fn type_name(&self) -> &'static str {
        "LayerNorm"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        let affine_size = params.get_int(0, 0);
        if affine_size <= 0 {
            return Err(LayerError::InvalidParam("affine_size must be positive"));
        }
        let eps = params.get_float(1, 0.001);
        if eps.is_nan() || eps < 0. {
            return Err(LayerError::InvalidParam("eps must be non-negative"));
        }
        self.params = LayerNormParams {
            affine_size: affine_size as usize,
            eps,
            affine: params.get_int(2, 1) != 0,
        };
        self.state = LayerState::Configured;
        Ok(())
    }

    fn load_model(&mut self, weights: &[Mat]) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.weights = weights.to_vec();
        Ok(())
    }

    fn create_pipeline(&mut self, opt: &RunOptions) -> Result<(), LayerError> {
        self.state.check_configured()?;
        let dtype = select_dtype(opt, false);
        let table = layernorm_kernels();
        if ![1, 4, 8].iter().all(|&pack| table.supports(dtype, pack, pack)) {
            return Err(LayerError::UnsupportedType);
        }

        if self.params.affine {
            let size = self.params.affine_size;
            self.gamma = weight_data(&self.weights, 0, size, "gamma_data")?.to_vec();
            self.beta = weight_data(&self.weights, 1, size, "beta_data")?.to_vec();
        }
        if opt.lightmode {
            self.weights.clear();
        }
        debug!(op = "LayerNorm", %dtype, "created pipeline");
        self.dtype = Some(dtype);
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&self, inputs: &[Mat], opt: &RunOptions) -> Result<OutputList, LayerError> {
        self.state.check_ready()?;
        let dtype = select_dtype(opt, false);
        if Some(dtype) != self.dtype {
            return Err(LayerError::PlanMismatch);
        }
        let input = inputs.first().ok_or(LayerError::MissingInputs)?;
        let input = prepare_input(input, dtype, input.elempack(), opt)?;
        let mut out = input.deep_clone(&opt.blob_allocator())?;

        let affine_size = self.params.affine_size;
        let (w, h, pack) = (out.w(), out.h(), out.elempack());

        // A packed 1D tensor is normalized as one group of scalars.
        let (group_len, kernel_pack) = match out.dims() {
            1 if w * pack == affine_size => (w * pack, 1),
            2 if w == affine_size => (w, pack),
            3 if w == affine_size || w * h == affine_size => (affine_size, pack),
            1..=3 => {
                return Err(LayerError::IncompatibleShape(
                    "affine_size does not match input",
                ))
            }
            _ => {
                return Err(LayerError::IncompatibleShape(
                    "layer norm supports 1D, 2D and 3D inputs",
                ))
            }
        };

        let plan = layernorm_kernels()
            .select(dtype, kernel_pack, kernel_pack, &opt.cpu_features())
            .ok_or(LayerError::UnsupportedType)?;

        let group = group_len * kernel_pack;
        let (chunk, _) = chunk_layout(&out, group, kernel_pack);
        let n_chunks = (out.cstep() * out.c() * out.elempack()).div_ceil(chunk);
        let slots = scratch_slots(n_chunks, opt.num_threads);
        let mut scratch = Mat::create_1d(slots * group, 4, 1, &opt.workspace_allocator())?;

        let args = LayerNormArgs {
            group_len,
            eps: self.params.eps,
            gamma: &self.gamma,
            beta: &self.beta,
            num_threads: opt.num_threads,
        };
        (plan.kernel)(plan.key.isa, &args, &mut out, scratch.data_mut::<f32>()?)?;
        Ok([out].into())
    }

    fn destroy_pipeline(&mut self, _opt: &RunOptions) -> Result<(), LayerError> {
        self.dtype = None;
        self.state = LayerState::Unconfigured;
        debug!(op = "LayerNorm", "destroyed pipeline");
        Ok(())
    }

    fn state(&self) -> LayerState {
        self.state
    }
}
