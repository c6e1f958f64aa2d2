//! 2D convolution.
//!
//! Weights are packed at pipeline creation into blocks of `IN * OUT` values,
//! one per kernel tap, so the inner loop of the float kernels is a sequence of
//! `OUT`-wide multiply-adds, one per input lane. The int8 kernels instead
//! work on an im2col matrix of the dynamically quantized input and take dot
//! products with per-row quantized weights.

use std::marker::PhantomData;
use std::sync::OnceLock;

use tracing::debug;

use crate::allocator::{system_allocator, Allocator};
use crate::kernels::{
    register_float_kernels, select_dtype, Accumulate, DType, KernelTable, Plan, Storage,
};
use crate::layer::{
    match_storage, prepare_input, weight_data, Layer, LayerError, LayerState, OutputList,
};
use crate::mat::Mat;
use crate::ops::activation::{activate_in_place, Activation};
use crate::options::RunOptions;
use crate::packing::{copy_make_border, select_elempack, Border};
use crate::param::ParamDict;
use crate::quantize::{quantize_tensor, quantize_weight_mat};
use crate::simd::{dispatch_isa, Isa, IsaId, SimdOp};
use crate::threading::parallel_for_each_mut;

/// Padding value requesting an output of `ceil(size / stride)`, with any odd
/// padding placed after the input.
pub(crate) const PAD_SAME_UPPER: i32 = -233;

/// As [`PAD_SAME_UPPER`] but with odd padding placed before the input.
pub(crate) const PAD_SAME_LOWER: i32 = -234;

/// Parameters shared by convolution and deconvolution.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConvParams {
    pub num_output: usize,
    pub kernel_w: usize,
    pub kernel_h: usize,
    pub dilation_w: usize,
    pub dilation_h: usize,
    pub stride_w: usize,
    pub stride_h: usize,
    pub pad_left: i32,
    pub pad_right: i32,
    pub pad_top: i32,
    pub pad_bottom: i32,
    pub pad_value: f32,
    pub bias_term: bool,
    pub weight_data_size: usize,
    pub int8: bool,
    pub activation: Activation,
}

fn positive_param(
    params: &ParamDict,
    id: u32,
    default: i32,
    err: &'static str,
) -> Result<usize, LayerError> {
    match params.get_int(id, default) {
        v if v > 0 => Ok(v as usize),
        _ => Err(LayerError::InvalidParam(err)),
    }
}

fn check_pad(pad: i32) -> Result<i32, LayerError> {
    if pad >= 0 || pad == PAD_SAME_UPPER || pad == PAD_SAME_LOWER {
        Ok(pad)
    } else {
        Err(LayerError::InvalidParam("padding must be non-negative"))
    }
}

impl ConvParams {
    pub fn from_params(params: &ParamDict) -> Result<ConvParams, LayerError> {
        let num_output = positive_param(params, 0, 0, "num_output must be positive")?;
        let kernel_w = positive_param(params, 1, 0, "kernel size must be positive")?;
        let kernel_h = positive_param(params, 11, kernel_w as i32, "kernel size must be positive")?;
        let dilation_w = positive_param(params, 2, 1, "dilation must be positive")?;
        let dilation_h = positive_param(params, 12, dilation_w as i32, "dilation must be positive")?;
        let stride_w = positive_param(params, 3, 1, "stride must be positive")?;
        let stride_h = positive_param(params, 13, stride_w as i32, "stride must be positive")?;

        let pad_left = check_pad(params.get_int(4, 0))?;
        let pad_right = check_pad(params.get_int(15, pad_left))?;
        let pad_top = check_pad(params.get_int(14, pad_left))?;
        let pad_bottom = check_pad(params.get_int(16, pad_top))?;

        let weight_data_size = params.get_int(6, 0).max(0) as usize;
        let per_input = kernel_w * kernel_h * num_output;
        if weight_data_size == 0 || weight_data_size % per_input != 0 {
            return Err(LayerError::InvalidParam(
                "weight_data_size is not a multiple of num_output * kernel size",
            ));
        }

        Ok(ConvParams {
            num_output,
            kernel_w,
            kernel_h,
            dilation_w,
            dilation_h,
            stride_w,
            stride_h,
            pad_left,
            pad_right,
            pad_top,
            pad_bottom,
            pad_value: params.get_float(18, 0.),
            bias_term: params.get_int(5, 0) != 0,
            weight_data_size,
            int8: params.get_int(8, 0) != 0,
            activation: Activation::from_params(params.get_int(9, 0), &params.get_floats(10))?,
        })
    }

    /// Number of taps in the kernel.
    pub fn maxk(&self) -> usize {
        self.kernel_w * self.kernel_h
    }

    pub fn num_input(&self) -> usize {
        self.weight_data_size / self.maxk() / self.num_output
    }

    pub fn kernel_extent_w(&self) -> usize {
        self.dilation_w * (self.kernel_w - 1) + 1
    }

    pub fn kernel_extent_h(&self) -> usize {
        self.dilation_h * (self.kernel_h - 1) + 1
    }

    /// Resolve the padding for an input of `w` x `h`.
    pub fn border(&self, w: usize, h: usize) -> Border {
        let (left, right) = resolve_pad(
            self.pad_left,
            self.pad_right,
            w,
            self.kernel_extent_w(),
            self.stride_w,
        );
        let (top, bottom) = resolve_pad(
            self.pad_top,
            self.pad_bottom,
            h,
            self.kernel_extent_h(),
            self.stride_h,
        );
        Border {
            top,
            bottom,
            left,
            right,
        }
    }

    /// Offsets of each kernel tap relative to the first, in a plane with rows
    /// of `row_len` elements.
    pub fn space_offsets(&self, row_len: usize) -> Vec<usize> {
        (0..self.kernel_h)
            .flat_map(|ky| {
                (0..self.kernel_w)
                    .map(move |kx| ky * self.dilation_h * row_len + kx * self.dilation_w)
            })
            .collect()
    }
}

fn resolve_pad(before: i32, after: i32, size: usize, extent: usize, stride: usize) -> (usize, usize) {
    match before {
        PAD_SAME_UPPER | PAD_SAME_LOWER => {
            let total = (extent + size.saturating_sub(1) / stride * stride).saturating_sub(size);
            let (small, large) = (total / 2, total - total / 2);
            if before == PAD_SAME_UPPER {
                (small, large)
            } else {
                (large, small)
            }
        }
        _ => (before.max(0) as usize, after.max(0) as usize),
    }
}

/// Rearrange `[num_output][num_input][maxk]` weights into a tensor of
/// `IN * OUT` lane blocks.
///
/// Output channel group `p` is channel `p` of the result, and the block for
/// input group `q` and tap `k` is element `q * maxk + k` of that channel.
/// Within a block, lane `i * out_pack + o` holds the weight from input lane
/// `i` to output lane `o`.
pub(crate) fn pack_weights<S: Storage>(
    raw: &[f32],
    num_output: usize,
    num_input: usize,
    maxk: usize,
    in_pack: usize,
    out_pack: usize,
) -> Result<Mat, LayerError> {
    let lanes = in_pack * out_pack;
    let mut packed = Mat::create_3d(
        maxk,
        num_input / in_pack,
        num_output / out_pack,
        size_of::<S>() * lanes,
        lanes,
        &system_allocator(),
    )?;
    let cstep = packed.cstep();
    let data = packed.data_mut::<S>()?;

    for p in 0..num_output / out_pack {
        for q in 0..num_input / in_pack {
            for k in 0..maxk {
                let block = &mut data[(p * cstep + q * maxk + k) * lanes..][..lanes];
                for i in 0..in_pack {
                    for o in 0..out_pack {
                        let src = ((p * out_pack + o) * num_input + q * in_pack + i) * maxk + k;
                        block[i * out_pack + o] = S::from_f32(raw[src]);
                    }
                }
            }
        }
    }
    Ok(packed)
}

/// Accumulate one packed input element times one `IN * OUT` weight block.
#[inline(always)]
pub(crate) fn accumulate<I: Isa, S: Storage, A: Accumulate, const IN: usize, const OUT: usize>(
    isa: I,
    acc: &mut [f32],
    x: &[S],
    w: &[S],
) {
    let mut x_tmp = [0.; 8];
    let mut w_tmp = [0.; 64];
    let x = S::widen(x, &mut x_tmp);
    let w = S::widen(w, &mut w_tmp);
    for i in 0..IN {
        isa.fma_scalar(acc, &w[i * OUT..(i + 1) * OUT], x[i]);
        A::round_slice(acc);
    }
}

/// Inputs to a convolution kernel.
struct ConvArgs<'a> {
    /// Padded input for float kernels, or the im2col matrix of the quantized
    /// input for int8 kernels.
    input: &'a Mat,
    weights: &'a Mat,
    weight_descales: &'a [f32],
    input_descale: f32,
    bias: &'a [f32],
    params: &'a ConvParams,
    activation: Activation,
    num_threads: usize,
}

type ConvKernel = fn(IsaId, &ConvArgs<'_>, &mut Mat) -> Result<(), LayerError>;

struct ConvOp<'a, 'b, S, A, const IN: usize, const OUT: usize> {
    args: &'a ConvArgs<'a>,
    out: &'b mut Mat,
    _marker: PhantomData<(S, A)>,
}

impl<S: Storage, A: Accumulate, const IN: usize, const OUT: usize> SimdOp
    for ConvOp<'_, '_, S, A, IN, OUT>
{
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let ConvOp { args, out, .. } = self;
        let params = args.params;
        let maxk = params.maxk();
        let (stride_w, stride_h) = (params.stride_w, params.stride_h);

        let in_w = args.input.w();
        let in_groups = args.input.c();
        let in_cstep = args.input.cstep() * IN;
        let input = args.input.data::<S>()?;

        let w_cstep = args.weights.cstep() * IN * OUT;
        let weights = args.weights.data::<S>()?;

        let (out_w, out_h) = (out.w(), out.h());
        let out_cstep = out.cstep() * OUT;

        // 1x1 stride 1 convolution reads each input element at the position
        // of its output.
        let pointwise = maxk == 1 && stride_w == 1 && stride_h == 1;
        let space_ofs = params.space_offsets(in_w);
        let (bias, activation) = (args.bias, args.activation);

        let out_data = out.data_mut::<S>()?;
        parallel_for_each_mut(out_data, out_cstep, args.num_threads, |p, out_chan| {
            let mut acc = [0.; 8];
            let acc = &mut acc[..OUT];
            let w_chan = &weights[p * w_cstep..];

            for y in 0..out_h {
                for x in 0..out_w {
                    match bias.get(p * OUT..(p + 1) * OUT) {
                        Some(b) => acc.copy_from_slice(b),
                        None => acc.fill(0.),
                    }

                    if pointwise {
                        let i = (y * in_w + x) * IN;
                        for q in 0..in_groups {
                            let src = &input[q * in_cstep + i..][..IN];
                            let w = &w_chan[q * IN * OUT..][..IN * OUT];
                            accumulate::<_, S, A, IN, OUT>(isa, acc, src, w);
                        }
                    } else {
                        let base = y * stride_h * in_w + x * stride_w;
                        for q in 0..in_groups {
                            let in_chan = &input[q * in_cstep..];
                            let w_group = &w_chan[q * maxk * IN * OUT..];
                            for (k, &ofs) in space_ofs.iter().enumerate() {
                                let src = &in_chan[(base + ofs) * IN..][..IN];
                                let w = &w_group[k * IN * OUT..][..IN * OUT];
                                accumulate::<_, S, A, IN, OUT>(isa, acc, src, w);
                            }
                        }
                    }

                    activation.apply_slice(acc);
                    S::narrow(acc, &mut out_chan[(y * out_w + x) * OUT..][..OUT]);
                }
            }
        });
        Ok(())
    }
}

fn conv_packed<S: Storage, A: Accumulate, const IN: usize, const OUT: usize>(
    isa: IsaId,
    args: &ConvArgs<'_>,
    out: &mut Mat,
) -> Result<(), LayerError> {
    dispatch_isa(
        isa,
        ConvOp::<S, A, IN, OUT> {
            args,
            out,
            _marker: PhantomData,
        },
    )
}

struct ConvInt8Op<'a, 'b, const OUT: usize> {
    args: &'a ConvArgs<'a>,
    out: &'b mut Mat,
}

impl<const OUT: usize> SimdOp for ConvInt8Op<'_, '_, OUT> {
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let ConvInt8Op { args, out } = self;
        let cols = args.input;
        let k_len = cols.w();
        let cols = cols.data::<i8>()?;
        let weights = args.weights.data::<i8>()?;
        let (descales, bias, activation) = (args.weight_descales, args.bias, args.activation);
        let input_descale = args.input_descale;

        let positions = out.w() * out.h();
        let out_cstep = out.cstep() * OUT;
        let out_data = out.data_mut::<f32>()?;

        parallel_for_each_mut(out_data, out_cstep, args.num_threads, |p, out_chan| {
            let mut acc = [0.; 8];
            let acc = &mut acc[..OUT];
            for i in 0..positions {
                let col = &cols[i * k_len..(i + 1) * k_len];
                for (o, acc) in acc.iter_mut().enumerate() {
                    let oc = p * OUT + o;
                    let sum = isa.dot_i8(col, &weights[oc * k_len..(oc + 1) * k_len]);
                    *acc = sum as f32 * input_descale * descales[oc]
                        + bias.get(oc).copied().unwrap_or(0.);
                }
                activation.apply_slice(acc);
                out_chan[i * OUT..(i + 1) * OUT].copy_from_slice(acc);
            }
        });
        Ok(())
    }
}

fn conv_int8<const OUT: usize>(
    isa: IsaId,
    args: &ConvArgs<'_>,
    out: &mut Mat,
) -> Result<(), LayerError> {
    dispatch_isa(isa, ConvInt8Op::<OUT> { args, out })
}

/// Unroll the patches of a quantized, padded input into the rows of a 2D
/// tensor, one row per output position.
fn im2col(
    input: &Mat,
    params: &ConvParams,
    out_w: usize,
    out_h: usize,
    allocator: &std::sync::Arc<dyn Allocator>,
    num_threads: usize,
) -> Result<Mat, LayerError> {
    let maxk = params.maxk();
    let k_len = input.c() * maxk;
    let (in_w, in_cstep, in_c) = (input.w(), input.cstep(), input.c());
    let space_ofs = params.space_offsets(in_w);
    let src = input.data::<i8>()?;

    let mut cols = Mat::create_2d(k_len, out_w * out_h, 1, 1, allocator)?;
    parallel_for_each_mut(cols.data_mut::<i8>()?, k_len, num_threads, |pos, col| {
        let (y, x) = (pos / out_w, pos % out_w);
        let base = y * params.stride_h * in_w + x * params.stride_w;
        for q in 0..in_c {
            for (k, &ofs) in space_ofs.iter().enumerate() {
                col[q * maxk + k] = src[q * in_cstep + base + ofs];
            }
        }
    });
    Ok(cols)
}

fn conv_kernels() -> &'static KernelTable<ConvKernel> {
    static KERNELS: OnceLock<KernelTable<ConvKernel>> = OnceLock::new();
    KERNELS.get_or_init(|| {
        let mut table = KernelTable::<ConvKernel>::new("Convolution");
        register_float_kernels!(table, 1, 1, S, A => conv_packed::<S, A, 1, 1>);
        register_float_kernels!(table, 1, 4, S, A => conv_packed::<S, A, 1, 4>);
        register_float_kernels!(table, 1, 8, S, A => conv_packed::<S, A, 1, 8>);
        register_float_kernels!(table, 4, 1, S, A => conv_packed::<S, A, 4, 1>);
        register_float_kernels!(table, 4, 4, S, A => conv_packed::<S, A, 4, 4>);
        register_float_kernels!(table, 4, 8, S, A => conv_packed::<S, A, 4, 8>);
        register_float_kernels!(table, 8, 1, S, A => conv_packed::<S, A, 8, 1>);
        register_float_kernels!(table, 8, 4, S, A => conv_packed::<S, A, 8, 4>);
        register_float_kernels!(table, 8, 8, S, A => conv_packed::<S, A, 8, 8>);
        table.register_all_isas(DType::Int8, 1, 1, conv_int8::<1>);
        table.register_all_isas(DType::Int8, 1, 4, conv_int8::<4>);
        table.register_all_isas(DType::Int8, 1, 8, conv_int8::<8>);
        debug!(op = "Convolution", variants = table.len(), "built kernel table");
        table
    })
}

/// Weights and kernel selected by [`Convolution::create_pipeline`].
struct ConvPipeline {
    plan: Plan<ConvKernel>,
    weights: Mat,
    weight_descales: Vec<f32>,
    bias: Vec<f32>,
}

/// 2D convolution of a 3D `(w, h, channels)` tensor.
///
/// Weights are `[num_output][num_input][kernel_h][kernel_w]`, followed by an
/// optional bias of `num_output` values.
#[derive(Default)]
pub struct Convolution {
    params: ConvParams,
    weights: Vec<Mat>,
    pipeline: Option<ConvPipeline>,
    state: LayerState,
}

impl Convolution {
    pub fn new() -> Convolution {
        Convolution::default()
    }

    fn select_plan(&self, opt: &RunOptions) -> Result<Plan<ConvKernel>, LayerError> {
        let dtype = select_dtype(opt, self.params.int8);
        let features = opt.cpu_features();
        let out_pack = select_elempack(self.params.num_output, &features, opt.use_packing_layout);
        let in_pack = if dtype == DType::Int8 {
            1
        } else {
            select_elempack(self.params.num_input(), &features, opt.use_packing_layout)
        };
        conv_kernels()
            .select(dtype, in_pack, out_pack, &features)
            .ok_or(LayerError::UnsupportedType)
    }
}

impl Layer for Convolution {
    fn type_name(&self) -> &'static str {
        "Convolution"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.params = ConvParams::from_params(params)?;
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
            let (num_input, maxk) = (p.num_input(), p.maxk());
            let (in_pack, out_pack) = (plan.key.in_pack, plan.key.out_pack);
            let packed = match_storage!(plan.key.dtype, S => {
                pack_weights::<S>(raw, p.num_output, num_input, maxk, in_pack, out_pack)
            })?;
            (packed, Vec::new())
        };

        if opt.lightmode {
            self.weights.clear();
        }
        debug!(op = "Convolution", kernel = %plan.key, "created pipeline");
        self.pipeline = Some(ConvPipeline {
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
        let p = &self.params;
        if input.dims() != 3 || input.logical_channels() != p.num_input() {
            return Err(LayerError::IncompatibleShape(
                "input channels do not match weights",
            ));
        }

        let dtype = plan.key.dtype;
        let input = prepare_input(input, dtype, plan.key.in_pack, opt)?;
        let border = p.border(input.w(), input.h());
        let padded_w = input.w() + border.left + border.right;
        let padded_h = input.h() + border.top + border.bottom;
        if padded_w < p.kernel_extent_w() || padded_h < p.kernel_extent_h() {
            return Err(LayerError::IncompatibleShape("input is smaller than the kernel"));
        }
        let out_w = (padded_w - p.kernel_extent_w()) / p.stride_w + 1;
        let out_h = (padded_h - p.kernel_extent_h()) / p.stride_h + 1;

        let ws = opt.workspace_allocator();
        let (kernel_input, input_descale) = if dtype == DType::Int8 {
            let padded = copy_make_border(&input, border, p.pad_value, &ws)?;
            let (quantized, descale) = quantize_tensor(&padded, &ws)?;
            let cols = im2col(&quantized, p, out_w, out_h, &ws, opt.num_threads)?;
            (cols, descale)
        } else {
            let padded = match_storage!(dtype, S => {
                copy_make_border(&input, border, S::from_f32(p.pad_value), &ws)
            })?;
            (padded, 1.)
        };

        let out_pack = plan.key.out_pack;
        let mut output = Mat::create_3d(
            out_w,
            out_h,
            p.num_output / out_pack,
            dtype.storage_size() * out_pack,
            out_pack,
            &opt.blob_allocator(),
        )?;

        let args = ConvArgs {
            input: &kernel_input,
            weights: &pipeline.weights,
            weight_descales: &pipeline.weight_descales,
            input_descale,
            bias: &pipeline.bias,
            params: p,
            activation: if opt.use_fused_activation {
                p.activation
            } else {
                Activation::Identity
            },
            num_threads: opt.num_threads,
        };
        (plan.kernel)(plan.key.isa, &args, &mut output)?;

        if !opt.use_fused_activation {
            activate_in_place(&mut output, p.activation, dtype, opt.num_threads)?;
        }
        Ok([output].into())
    }

    fn destroy_pipeline(&mut self, _opt: &RunOptions) -> Result<(), LayerError> {
        self.pipeline = None;
        self.state = LayerState::Unconfigured;
        debug!(op = "Convolution", "destroyed pipeline");
        Ok(())
    }

    fn state(&self) -> LayerState {
        self.state
    }
}
