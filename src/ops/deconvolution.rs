//! 2D transposed convolution.
//!
//! Rather than scattering each input element into the output, the kernels
//! gather: each output element sums the taps whose scatter position lands on
//! it. This keeps output channels independent so they can be computed in
//! parallel, and lets the cropped border be skipped entirely.

use std::marker::PhantomData;
use std::sync::OnceLock;

use tracing::debug;

use crate::kernels::{
    register_float_kernels, select_dtype, Accumulate, KernelTable, Plan, Storage,
};
use crate::layer::{
    match_storage, prepare_input, weight_data, Layer, LayerError, LayerState, OutputList,
};
use crate::mat::Mat;
use crate::ops::activation::{activate_in_place, Activation};
use crate::ops::convolution::{accumulate, pack_weights, ConvParams, PAD_SAME_LOWER};
use crate::options::RunOptions;
use crate::packing::{select_elempack, Border};
use crate::param::ParamDict;
use crate::simd::{dispatch_isa, Isa, IsaId, SimdOp};
use crate::threading::parallel_for_each_mut;

#[derive(Clone, Debug, Default)]
struct DeconvParams {
    conv: ConvParams,
    output_pad_right: usize,
    output_pad_bottom: usize,
    output_w: usize,
    output_h: usize,
}

impl DeconvParams {
    fn from_params(params: &ParamDict) -> Result<DeconvParams, LayerError> {
        let non_negative = |id, default| -> Result<usize, LayerError> {
            match params.get_int(id, default) {
                v if v >= 0 => Ok(v as usize),
                _ => Err(LayerError::InvalidParam("output size must be non-negative")),
            }
        };
        let output_pad_right = non_negative(18, 0)?;
        let output_pad_bottom = non_negative(19, output_pad_right as i32)?;
        let output_w = non_negative(20, 0)?;
        let output_h = non_negative(21, output_w as i32)?;

        Ok(DeconvParams {
            conv: ConvParams::from_params(params)?,
            output_pad_right,
            output_pad_bottom,
            output_w,
            output_h,
        })
    }

    /// Size of the uncropped output for an input of `w` x `h`.
    fn full_size(&self, w: usize, h: usize) -> (usize, usize) {
        let c = &self.conv;
        (
            (w - 1) * c.stride_w + c.kernel_extent_w() + self.output_pad_right,
            (h - 1) * c.stride_h + c.kernel_extent_h() + self.output_pad_bottom,
        )
    }

    /// Amount to crop from each side of the uncropped output.
    ///
    /// Explicit padding takes precedence. Otherwise, if an output size is
    /// given, the excess is split between both sides, with the odd element
    /// cropped from the end unless the padding mode is "same lower".
    fn crop(&self, full_w: usize, full_h: usize) -> Border {
        let c = &self.conv;
        let pads = [c.pad_left, c.pad_right, c.pad_top, c.pad_bottom];
        if pads.iter().any(|&pad| pad > 0) {
            let [left, right, top, bottom] = pads.map(|pad| pad.max(0) as usize);
            return Border {
                top,
                bottom,
                left,
                right,
            };
        }
        if self.output_w == 0 || self.output_h == 0 {
            return Border::default();
        }

        let wcut = full_w.saturating_sub(self.output_w);
        let hcut = full_h.saturating_sub(self.output_h);
        if c.pad_left == PAD_SAME_LOWER {
            Border {
                top: hcut - hcut / 2,
                bottom: hcut / 2,
                left: wcut - wcut / 2,
                right: wcut / 2,
            }
        } else {
            Border {
                top: hcut / 2,
                bottom: hcut - hcut / 2,
                left: wcut / 2,
                right: wcut - wcut / 2,
            }
        }
    }
}

struct DeconvArgs<'a> {
    input: &'a Mat,
    weights: &'a Mat,
    bias: &'a [f32],
    params: &'a ConvParams,

    /// Offset of the first output element within the uncropped output.
    crop_left: usize,
    crop_top: usize,

    activation: Activation,
    num_threads: usize,
}

type DeconvKernel = fn(IsaId, &DeconvArgs<'_>, &mut Mat) -> Result<(), LayerError>;

struct DeconvOp<'a, 'b, S, A, const IN: usize, const OUT: usize> {
    args: &'a DeconvArgs<'a>,
    out: &'b mut Mat,
    _marker: PhantomData<(S, A)>,
}

impl<S: Storage, A: Accumulate, const IN: usize, const OUT: usize> SimdOp
    for DeconvOp<'_, '_, S, A, IN, OUT>
{
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let DeconvOp { args, out, .. } = self;
        let p = args.params;
        let maxk = p.maxk();

        let (in_w, in_h) = (args.input.w(), args.input.h());
        let in_groups = args.input.c();
        let in_cstep = args.input.cstep() * IN;
        let input = args.input.data::<S>()?;

        let w_cstep = args.weights.cstep() * IN * OUT;
        let weights = args.weights.data::<S>()?;

        let (out_w, out_h) = (out.w(), out.h());
        let out_cstep = out.cstep() * OUT;
        let (bias, activation) = (args.bias, args.activation);
        let (crop_left, crop_top) = (args.crop_left, args.crop_top);

        // Source coordinate of tap `k` for full output coordinate `pos`, if
        // the tap lands there.
        let source = |pos: usize, k: usize, dilation: usize, stride: usize, size: usize| {
            let offset = pos.checked_sub(k * dilation)?;
            (offset % stride == 0 && offset / stride < size).then_some(offset / stride)
        };

        let out_data = out.data_mut::<S>()?;
        parallel_for_each_mut(out_data, out_cstep, args.num_threads, |oc, out_chan| {
            let mut acc = [0.; 8];
            let acc = &mut acc[..OUT];
            let w_chan = &weights[oc * w_cstep..];

            for y in 0..out_h {
                for x in 0..out_w {
                    match bias.get(oc * OUT..(oc + 1) * OUT) {
                        Some(b) => acc.copy_from_slice(b),
                        None => acc.fill(0.),
                    }

                    for ky in 0..p.kernel_h {
                        let Some(sy) = source(y + crop_top, ky, p.dilation_h, p.stride_h, in_h)
                        else {
                            continue;
                        };
                        for kx in 0..p.kernel_w {
                            let Some(sx) =
                                source(x + crop_left, kx, p.dilation_w, p.stride_w, in_w)
                            else {
                                continue;
                            };
                            let k = ky * p.kernel_w + kx;
                            let i = (sy * in_w + sx) * IN;
                            for q in 0..in_groups {
                                let src = &input[q * in_cstep + i..][..IN];
                                let w = &w_chan[(q * maxk + k) * IN * OUT..][..IN * OUT];
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

fn deconv_packed<S: Storage, A: Accumulate, const IN: usize, const OUT: usize>(
    isa: IsaId,
    args: &DeconvArgs<'_>,
    out: &mut Mat,
) -> Result<(), LayerError> {
    dispatch_isa(
        isa,
        DeconvOp::<S, A, IN, OUT> {
            args,
            out,
            _marker: PhantomData,
        },
    )
}

fn deconv_kernels() -> &'static KernelTable<DeconvKernel> {
    static KERNELS: OnceLock<KernelTable<DeconvKernel>> = OnceLock::new();
    KERNELS.get_or_init(|| {
        let mut table = KernelTable::<DeconvKernel>::new("Deconvolution");
        register_float_kernels!(table, 1, 1, S, A => deconv_packed::<S, A, 1, 1>);
        register_float_kernels!(table, 1, 4, S, A => deconv_packed::<S, A, 1, 4>);
        register_float_kernels!(table, 1, 8, S, A => deconv_packed::<S, A, 1, 8>);
        register_float_kernels!(table, 4, 1, S, A => deconv_packed::<S, A, 4, 1>);
        register_float_kernels!(table, 4, 4, S, A => deconv_packed::<S, A, 4, 4>);
        register_float_kernels!(table, 4, 8, S, A => deconv_packed::<S, A, 4, 8>);
        register_float_kernels!(table, 8, 1, S, A => deconv_packed::<S, A, 8, 1>);
        register_float_kernels!(table, 8, 4, S, A => deconv_packed::<S, A, 8, 4>);
        register_float_kernels!(table, 8, 8, S, A => deconv_packed::<S, A, 8, 8>);
        debug!(op = "Deconvolution", variants = table.len(), "built kernel table");
        table
    })
}

struct DeconvPipeline {
    plan: Plan<DeconvKernel>,
    weights: Mat,
    bias: Vec<f32>,
}

/// Transposed 2D convolution of a 3D `(w, h, channels)` tensor.
///
/// Weights are `[num_output][num_input][kernel_h][kernel_w]`, where the
/// weight at tap `(ky, kx)` scatters input `(y, x)` to output
/// `(y * stride + ky * dilation, x * stride + kx * dilation)`. An optional
/// bias of `num_output` values follows. There are no int8 kernels, so
/// `int8_scale_term` is ignored.
#[derive(Default)]
pub struct Deconvolution {
    params: DeconvParams,
    weights: Vec<Mat>,
    pipeline: Option<DeconvPipeline>,
    state: LayerState,
}

impl Deconvolution {
    pub fn new() -> Deconvolution {
        Deconvolution::default()
    }

    fn select_plan(&self, opt: &RunOptions) -> Result<Plan<DeconvKernel>, LayerError> {
        let p = &self.params.conv;
        let dtype = select_dtype(opt, false);
        let features = opt.cpu_features();
        let in_pack = select_elempack(p.num_input(), &features, opt.use_packing_layout);
        let out_pack = select_elempack(p.num_output, &features, opt.use_packing_layout);
        deconv_kernels()
            .select(dtype, in_pack, out_pack, &features)
            .ok_or(LayerError::UnsupportedType)
    }
}

impl Layer for Deconvolution {
    fn type_name(&self) -> &'static str {
        "Deconvolution"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.params = DeconvParams::from_params(params)?;
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
        let p = &self.params.conv;

        let raw = weight_data(&self.weights, 0, p.weight_data_size, "weight_data")?;
        let bias = if p.bias_term {
            weight_data(&self.weights, 1, p.num_output, "bias_data")?.to_vec()
        } else {
            Vec::new()
        };
        let (num_input, maxk) = (p.num_input(), p.maxk());
        let (in_pack, out_pack) = (plan.key.in_pack, plan.key.out_pack);
        let weights = match_storage!(plan.key.dtype, S => {
            pack_weights::<S>(raw, p.num_output, num_input, maxk, in_pack, out_pack)
        })?;

        if opt.lightmode {
            self.weights.clear();
        }
        debug!(op = "Deconvolution", kernel = %plan.key, "created pipeline");
        self.pipeline = Some(DeconvPipeline {
            plan,
            weights,
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
        let p = &self.params.conv;
        if input.dims() != 3 || input.logical_channels() != p.num_input() {
            return Err(LayerError::IncompatibleShape(
                "input channels do not match weights",
            ));
        }
        if input.is_empty() {
            return Err(LayerError::IncompatibleShape("input is empty"));
        }

        let dtype = plan.key.dtype;
        let input = prepare_input(input, dtype, plan.key.in_pack, opt)?;
        let (full_w, full_h) = self.params.full_size(input.w(), input.h());
        let crop = self.params.crop(full_w, full_h);
        if crop.left + crop.right >= full_w || crop.top + crop.bottom >= full_h {
            return Err(LayerError::IncompatibleShape("cropping removes the whole output"));
        }

        let out_pack = plan.key.out_pack;
        let mut output = Mat::create_3d(
            full_w - crop.left - crop.right,
            full_h - crop.top - crop.bottom,
            p.num_output / out_pack,
            dtype.storage_size() * out_pack,
            out_pack,
            &opt.blob_allocator(),
        )?;

        let args = DeconvArgs {
            input: &input,
            weights: &pipeline.weights,
            bias: &pipeline.bias,
            params: p,
            crop_left: crop.left,
            crop_top: crop.top,
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
        debug!(op = "Deconvolution", "destroyed pipeline");
        Ok(())
    }

    fn state(&self) -> LayerState {
        self.state
    }
}
