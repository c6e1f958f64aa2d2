use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::OnceLock;

use tracing::debug;

use crate::allocator::system_allocator;
use crate::kernels::{
    register_float_kernels, select_dtype, Accumulate, DType, KernelTable, Plan, Storage,
};
use crate::layer::{
    match_storage, prepare_input, weight_data, Layer, LayerError, LayerState, OutputList,
};
use crate::mat::Mat;
use crate::ops::activation::{activate_in_place, Activation};
use crate::ops::convolution::accumulate;
use crate::options::RunOptions;
use crate::packing::select_elempack;
use crate::param::ParamDict;
use crate::quantize::{quantize_row, quantize_weight_mat};
use crate::simd::{dispatch_isa, Isa, IsaId, SimdOp};
use crate::threading::parallel_for_each_mut;

#[derive(Clone, Debug, Default)]
struct InnerProductParams {
    num_output: usize,
    bias_term: bool,
    weight_data_size: usize,
    int8: bool,
    activation: Activation,
}

impl InnerProductParams {
    fn from_params(params: &ParamDict) -> Result<InnerProductParams, LayerError> {
        let num_output = params.get_int(0, 0);
        if num_output <= 0 {
            return Err(LayerError::InvalidParam("num_output must be positive"));
        }
        let num_output = num_output as usize;
        let weight_data_size = params.get_int(2, 0).max(0) as usize;
        if weight_data_size == 0 || weight_data_size % num_output != 0 {
            return Err(LayerError::InvalidParam(
                "weight_data_size is not a multiple of num_output",
            ));
        }
        Ok(InnerProductParams {
            num_output,
            bias_term: params.get_int(1, 0) != 0,
            weight_data_size,
            int8: params.get_int(8, 0) != 0,
            activation: Activation::from_params(params.get_int(9, 0), &params.get_floats(10))?,
        })
    }

    fn num_input(&self) -> usize {
        self.weight_data_size / self.num_output
    }
}

/// Interleave `[num_output][num_input]` weights so that the `OUT` weights
/// each input contributes to a group of outputs are adjacent.
fn pack_weights<S: Storage>(
    raw: &[f32],
    num_output: usize,
    num_input: usize,
    out_pack: usize,
) -> Result<Mat, LayerError> {
    let mut packed = Mat::create_2d(
        num_input,
        num_output / out_pack,
        size_of::<S>() * out_pack,
        out_pack,
        &system_allocator(),
    )?;
    let data = packed.data_mut::<S>()?;
    for (p, row) in data.chunks_mut(num_input * out_pack).enumerate() {
        for i in 0..num_input {
            for o in 0..out_pack {
                row[i * out_pack + o] = S::from_f32(raw[(p * out_pack + o) * num_input + i]);
            }
        }
    }
    Ok(packed)
}

struct InnerProductArgs<'a> {
    /// Flattened input. Quantized for int8 kernels.
    input: &'a Mat,
    input_descale: f32,
    weights: &'a Mat,
    weight_descales: &'a [f32],
    bias: &'a [f32],
    activation: Activation,
    num_threads: usize,
}

type InnerProductKernel = fn(IsaId, &InnerProductArgs<'_>, &mut Mat) -> Result<(), LayerError>;

struct InnerProductOp<'a, 'b, S, A, const OUT: usize> {
    args: &'a InnerProductArgs<'a>,
    out: &'b mut Mat,
    _marker: PhantomData<(S, A)>,
}

impl<S: Storage, A: Accumulate, const OUT: usize> SimdOp for InnerProductOp<'_, '_, S, A, OUT> {
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let InnerProductOp { args, out, .. } = self;
        let input = args.input.data::<S>()?;
        let num_input = input.len();
        let weights = args.weights.data::<S>()?;
        let (bias, activation) = (args.bias, args.activation);

        parallel_for_each_mut(out.data_mut::<S>()?, OUT, args.num_threads, |p, out| {
            let mut acc = [0.; 8];
            let acc = &mut acc[..OUT];
            match bias.get(p * OUT..(p + 1) * OUT) {
                Some(b) => acc.copy_from_slice(b),
                None => acc.fill(0.),
            }
            let w_row = &weights[p * num_input * OUT..][..num_input * OUT];
            for i in 0..num_input {
                let w = &w_row[i * OUT..(i + 1) * OUT];
                accumulate::<_, S, A, 1, OUT>(isa, acc, &input[i..i + 1], w);
            }
            activation.apply_slice(acc);
            S::narrow(acc, out);
        });
        Ok(())
    }
}

fn innerproduct_packed<S: Storage, A: Accumulate, const OUT: usize>(
    isa: IsaId,
    args: &InnerProductArgs<'_>,
    out: &mut Mat,
) -> Result<(), LayerError> {
    dispatch_isa(
        isa,
        InnerProductOp::<S, A, OUT> {
            args,
            out,
            _marker: PhantomData,
        },
    )
}

struct InnerProductInt8Op<'a, 'b, const OUT: usize> {
    args: &'a InnerProductArgs<'a>,
    out: &'b mut Mat,
}

impl<const OUT: usize> SimdOp for InnerProductInt8Op<'_, '_, OUT> {
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let InnerProductInt8Op { args, out } = self;
        let input = args.input.data::<i8>()?;
        let num_input = input.len();
        let weights = args.weights.data::<i8>()?;
        let (descales, bias, activation) = (args.weight_descales, args.bias, args.activation);
        let input_descale = args.input_descale;

        parallel_for_each_mut(out.data_mut::<f32>()?, OUT, args.num_threads, |p, out| {
            for (o, y) in out.iter_mut().enumerate() {
                let oc = p * OUT + o;
                let sum = isa.dot_i8(input, &weights[oc * num_input..(oc + 1) * num_input]);
                *y = sum as f32 * input_descale * descales[oc] + bias.get(oc).copied().unwrap_or(0.);
            }
            activation.apply_slice(out);
        });
        Ok(())
    }
}

fn innerproduct_int8<const OUT: usize>(
    isa: IsaId,
    args: &InnerProductArgs<'_>,
    out: &mut Mat,
) -> Result<(), LayerError> {
    dispatch_isa(isa, InnerProductInt8Op::<OUT> { args, out })
}

fn innerproduct_kernels() -> &'static KernelTable<InnerProductKernel> {
    static KERNELS: OnceLock<KernelTable<InnerProductKernel>> = OnceLock::new();
    KERNELS.get_or_init(|| {
        let mut table = KernelTable::<InnerProductKernel>::new("InnerProduct");
        register_float_kernels!(table, 1, 1, S, A => innerproduct_packed::<S, A, 1>);
        register_float_kernels!(table, 1, 4, S, A => innerproduct_packed::<S, A, 4>);
        register_float_kernels!(table, 1, 8, S, A => innerproduct_packed::<S, A, 8>);
        table.register_all_isas(DType::Int8, 1, 1, innerproduct_int8::<1>);
        table.register_all_isas(DType::Int8, 1, 4, innerproduct_int8::<4>);
        table.register_all_isas(DType::Int8, 1, 8, innerproduct_int8::<8>);
        debug!(op = "InnerProduct", variants = table.len(), "built kernel table");
        table
    })
}

struct InnerProductPipeline {
    plan: Plan<InnerProductKernel>,
    weights: Mat,
    weight_descales: Vec<f32>,
    bias: Vec<f32>,
}

/// Fully connected layer.
///
/// The input is flattened, whatever its shape, and the output is a 1D tensor
/// of `num_output` values. Weights are `[num_output][num_input]`, followed by
/// an optional bias.
#[derive(Default)]
pub struct InnerProduct {
    params: InnerProductParams,
    weights: Vec<Mat>,
    pipeline: Option<InnerProductPipeline>,
    state: LayerState,
}

impl InnerProduct {
    pub fn new() -> InnerProduct {
        InnerProduct::default()
    }

    fn select_plan(&self, opt: &RunOptions) -> Result<Plan<InnerProductKernel>, LayerError> {
        let dtype = select_dtype(opt, self.params.int8);
        let features = opt.cpu_features();
        let out_pack = select_elempack(self.params.num_output, &features, opt.use_packing_layout);
        innerproduct_kernels()
            .select(dtype, 1, out_pack, &features)
            .ok_or(LayerError::UnsupportedType)
    }
}

impl Layer for InnerProduct {
    fn type_name(&self) -> &'static str {
        "InnerProduct"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.params = InnerProductParams::from_params(params)?;
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
        let plan = self.select_plan(opt)?;
        let p = &self.params;

        let raw = weight_data(&self.weights, 0, p.weight_data_size, "weight_data")?;
        let bias = if p.bias_term {
            weight_data(&self.weights, 1, p.num_output, "bias_data")?.to_vec()
        } else {
            Vec::new()
        };
        let (weights, weight_descales) = if plan.key.dtype == DType::Int8 {
            quantize_weight_mat(raw, p.num_output, &system_allocator())?
        } else {
            let packed = match_storage!(plan.key.dtype, S => {
                pack_weights::<S>(raw, p.num_output, p.num_input(), plan.key.out_pack)
            })?;
            (packed, Vec::new())
        };

        if opt.lightmode {
            self.weights.clear();
        }
        debug!(op = "InnerProduct", kernel = %plan.key, "created pipeline");
        self.pipeline = Some(InnerProductPipeline {
            plan,
            weights,
            weight_descales,
            bias,
        });
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&self, inputs: &[Mat], opt: &RunOptions) -> Result<OutputList, LayerError> {
        self.state.check_ready()?;
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or(LayerError::NotReady(self.state))?;
        let plan = self.select_plan(opt)?;
        if plan.key != pipeline.plan.key {
            return Err(LayerError::PlanMismatch);
        }

        let input = inputs.first().ok_or(LayerError::MissingInputs)?;
        let dtype = plan.key.dtype;
        let input = prepare_input(input, dtype, 1, opt)?;
        let size = input.plane_len() * input.c();
        if size != self.params.num_input() {
            return Err(LayerError::IncompatibleShape("input size does not match weights"));
        }
        let flat = input.reshape_1d(size)?;

        let (kernel_input, input_descale) = if dtype == DType::Int8 {
            let mut quantized = Mat::create_1d(size, 1, 1, &opt.workspace_allocator())?;
            let descale = quantize_row(flat.data::<f32>()?, quantized.data_mut::<i8>()?);
            (quantized, descale)
        } else {
            (flat, 1.)
        };

        let out_pack = plan.key.out_pack;
        let mut output = Mat::create_1d(
            self.params.num_output / out_pack,
            dtype.storage_size() * out_pack,
            out_pack,
            &opt.blob_allocator(),
        )?;

        let activation = self.params.activation;
        let args = InnerProductArgs {
            input: &kernel_input,
            input_descale,
            weights: &pipeline.weights,
            weight_descales: &pipeline.weight_descales,
            bias: &pipeline.bias,
            activation: if opt.use_fused_activation {
                activation
            } else {
                Activation::Identity
            },
            num_threads: opt.num_threads,
        };
        (plan.kernel)(plan.key.isa, &args, &mut output)?;

        if !opt.use_fused_activation {
            activate_in_place(&mut output, activation, dtype, opt.num_threads)?;
        }
        Ok([output].into())
    }

    fn destroy_pipeline(&mut self, _opt: &RunOptions) -> Result<(), LayerError> {
        self.pipeline = None;
        self.state = LayerState::Unconfigured;
        debug!(op = "InnerProduct", "destroyed pipeline");
        Ok(())
    }

    fn state(&self) -> LayerState {
        self.state
    }
}
