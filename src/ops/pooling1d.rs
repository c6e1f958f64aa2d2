use std::marker::PhantomData;
use std::sync::OnceLock;

use tracing::debug;

use crate::kernels::{register_float_kernels, select_dtype, Accumulate, DType, KernelTable, Storage};
use crate::layer::{prepare_input, Layer, LayerError, LayerState, OutputList};
use crate::mat::Mat;
use crate::options::RunOptions;
use crate::param::ParamDict;
use crate::simd::{dispatch_isa, Isa, IsaId, SimdOp};
use crate::threading::{parallel_for_each_mut_with_scratch, scratch_slots};

/// Reduction applied over each window.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PoolingType {
    #[default]
    Max,
    Average,
}

/// How padding is computed from the input size.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PadMode {
    /// Use the given padding, extended on the right so that the last window
    /// covers the end of the input.
    #[default]
    Full,

    /// Use the given padding as-is.
    Valid,

    /// Pad so that `out_w = ceil(w / stride)`, with any odd element of
    /// padding at the end.
    SameUpper,

    /// As [`PadMode::SameUpper`], with any odd element at the start.
    SameLower,
}

/// Input range reduced for one output element, and the divisor for
/// averages.
#[derive(Copy, Clone, Debug, PartialEq)]
struct Window {
    start: usize,
    end: usize,
    divisor: f32,
}

struct PoolingArgs<'a> {
    input: &'a Mat,
    windows: &'a [Window],
    pooling_type: PoolingType,
    num_threads: usize,
}

/// Pool each row of the input into the matching row of the output.
///
/// `scratch` holds one slot of [`PoolingArgs::slot_len`] elements per
/// thread.
type PoolingKernel = fn(IsaId, &PoolingArgs<'_>, &mut Mat, &mut [f32]) -> Result<(), LayerError>;

impl PoolingArgs<'_> {
    /// Length of the scratch slot each thread uses to widen one input row.
    fn slot_len(&self, dtype: DType) -> usize {
        match dtype {
            DType::F32 => 0,
            _ => self.input.w() * self.input.elempack(),
        }
    }
}

struct PoolingOp<'a, 'b, 'c, S, A, const P: usize> {
    args: &'a PoolingArgs<'a>,
    out: &'b mut Mat,
    scratch: &'c mut [f32],
    _marker: PhantomData<(S, A)>,
}

impl<S: Storage, A: Accumulate, const P: usize> SimdOp for PoolingOp<'_, '_, '_, S, A, P> {
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let PoolingOp {
            args, out, scratch, ..
        } = self;
        let w = args.input.w();
        let src = args.input.data::<S>()?;
        let windows = args.windows;
        let out_row_len = windows.len() * P;
        let slot_len = scratch.len() / scratch_slots(args.input.h(), args.num_threads);

        parallel_for_each_mut_with_scratch(
            out.data_mut::<S>()?,
            out_row_len,
            scratch,
            slot_len,
            args.num_threads,
            |y, row, scratch| {
                let src_row = S::widen(&src[y * w * P..(y + 1) * w * P], scratch);

                for (win, dst) in windows.iter().zip(row.chunks_exact_mut(P)) {
                    let mut acc = [0.; P];
                    let elements = src_row[win.start * P..win.end * P].chunks_exact(P);
                    match args.pooling_type {
                        PoolingType::Max => {
                            acc.fill(-f32::MAX);
                            for x in elements {
                                isa.max_assign(&mut acc, x);
                            }
                        }
                        PoolingType::Average => {
                            for x in elements {
                                isa.add_assign(&mut acc, x);
                                A::round_slice(&mut acc);
                            }
                            let scale = if win.divisor > 0. { 1. / win.divisor } else { 0. };
                            for x in &mut acc {
                                *x *= scale;
                            }
                        }
                    }
                    A::round_slice(&mut acc);
                    S::narrow(&acc, dst);
                }
            },
        );
        Ok(())
    }
}

fn pooling_packed<S: Storage, A: Accumulate, const P: usize>(
    isa: IsaId,
    args: &PoolingArgs<'_>,
    out: &mut Mat,
    scratch: &mut [f32],
) -> Result<(), LayerError> {
    dispatch_isa(
        isa,
        PoolingOp::<S, A, P> {
            args,
            out,
            scratch,
            _marker: PhantomData,
        },
    )
}

fn pooling_kernels() -> &'static KernelTable<PoolingKernel> {
    static KERNELS: OnceLock<KernelTable<PoolingKernel>> = OnceLock::new();
    KERNELS.get_or_init(|| {
        let mut table = KernelTable::<PoolingKernel>::new("Pooling1D");
        register_float_kernels!(table, 1, 1, S, A => pooling_packed::<S, A, 1>);
        register_float_kernels!(table, 4, 4, S, A => pooling_packed::<S, A, 4>);
        register_float_kernels!(table, 8, 8, S, A => pooling_packed::<S, A, 8>);
        debug!(op = "Pooling1D", variants = table.len(), "built kernel table");
        table
    })
}

#[derive(Clone, Debug)]
struct PoolingParams {
    pooling_type: PoolingType,
    kernel_w: usize,
    stride_w: usize,
    pad_left: usize,
    pad_right: usize,
    global_pooling: bool,
    pad_mode: PadMode,
    count_include_pad: bool,
    adaptive_pooling: bool,
    out_w: usize,
}

impl Default for PoolingParams {
    fn default() -> Self {
        PoolingParams {
            pooling_type: PoolingType::Max,
            kernel_w: 0,
            stride_w: 1,
            pad_left: 0,
            pad_right: 0,
            global_pooling: false,
            pad_mode: PadMode::Full,
            count_include_pad: false,
            adaptive_pooling: false,
            out_w: 0,
        }
    }
}

impl PoolingParams {
    fn from_params(params: &ParamDict) -> Result<PoolingParams, LayerError> {
        let pooling_type = match params.get_int(0, 0) {
            0 => PoolingType::Max,
            1 => PoolingType::Average,
            _ => return Err(LayerError::InvalidParam("unknown pooling type")),
        };
        let pad_mode = match params.get_int(5, 0) {
            0 => PadMode::Full,
            1 => PadMode::Valid,
            2 => PadMode::SameUpper,
            3 => PadMode::SameLower,
            _ => return Err(LayerError::InvalidParam("unknown pad mode")),
        };
        let non_negative = |value: i32, msg| {
            if value < 0 {
                Err(LayerError::InvalidParam(msg))
            } else {
                Ok(value as usize)
            }
        };
        let pad_left = non_negative(params.get_int(3, 0), "padding must be non-negative")?;
        let pad_right = non_negative(
            params.get_int(14, pad_left as i32),
            "padding must be non-negative",
        )?;

        let p = PoolingParams {
            pooling_type,
            kernel_w: non_negative(params.get_int(1, 0), "kernel size must be positive")?,
            stride_w: non_negative(params.get_int(2, 1), "stride must be positive")?,
            pad_left,
            pad_right,
            global_pooling: params.get_int(4, 0) != 0,
            pad_mode,
            count_include_pad: params.get_int(6, 0) != 0,
            adaptive_pooling: params.get_int(7, 0) != 0,
            out_w: non_negative(params.get_int(8, 0), "out_w must be non-negative")?,
        };

        if p.adaptive_pooling && !p.global_pooling && p.out_w == 0 {
            return Err(LayerError::InvalidParam("out_w must be positive"));
        }
        if !p.global_pooling && !p.adaptive_pooling {
            if p.kernel_w == 0 {
                return Err(LayerError::InvalidParam("kernel size must be positive"));
            }
            if p.stride_w == 0 {
                return Err(LayerError::InvalidParam("stride must be positive"));
            }
        }
        Ok(p)
    }

    /// Return the windows for an input of width `w`.
    fn windows(&self, w: usize) -> Result<Vec<Window>, LayerError> {
        if self.global_pooling {
            return Ok(vec![Window {
                start: 0,
                end: w,
                divisor: w as f32,
            }]);
        }

        if self.adaptive_pooling {
            let out_w = self.out_w;
            let windows = (0..out_w)
                .map(|j| {
                    let start = j * w / out_w;
                    let end = ((j + 1) * w).div_ceil(out_w);
                    Window {
                        start,
                        end,
                        divisor: (end - start) as f32,
                    }
                })
                .collect();
            return Ok(windows);
        }

        let (kernel_w, stride) = (self.kernel_w, self.stride_w);
        // `pad_right` excludes any extra padding added for `PadMode::Full`,
        // which never counts towards averages.
        let (pad_left, pad_right, tail_pad) = match self.pad_mode {
            PadMode::Full => {
                let padded = w + self.pad_left + self.pad_right;
                let tail = padded.saturating_sub(kernel_w) % stride;
                let tail_pad = if tail != 0 { stride - tail } else { 0 };
                (self.pad_left, self.pad_right, tail_pad)
            }
            PadMode::Valid => (self.pad_left, self.pad_right, 0),
            PadMode::SameUpper | PadMode::SameLower => {
                let total = (kernel_w + (w - 1) / stride * stride).saturating_sub(w);
                if self.pad_mode == PadMode::SameUpper {
                    (total / 2, total - total / 2, 0)
                } else {
                    (total - total / 2, total / 2, 0)
                }
            }
        };

        let padded = w + pad_left + pad_right + tail_pad;
        if padded < kernel_w {
            return Err(LayerError::IncompatibleShape("input is smaller than the kernel"));
        }
        let out_w = (padded - kernel_w) / stride + 1;

        let windows = (0..out_w)
            .map(|j| {
                // Window bounds in padded coordinates.
                let (lo, hi) = (j * stride, j * stride + kernel_w);
                let start = lo.saturating_sub(pad_left).min(w);
                let end = hi.saturating_sub(pad_left).min(w);
                let divisor = if self.count_include_pad {
                    (hi.min(pad_left + w + pad_right) - lo) as f32
                } else {
                    (end - start) as f32
                };
                Window {
                    start,
                    end: end.max(start),
                    divisor,
                }
            })
            .collect();
        Ok(windows)
    }
}

/// Max or average pooling along the width of a 2D `(w, channels)` tensor.
///
/// Padding with max pooling behaves as if the input were padded with
/// `-f32::MAX`, and with average pooling as if padded with zeros. Padded
/// elements count towards the average only if `avgpool_count_include_pad` is
/// set, and never for the extra right padding of [`PadMode::Full`].
///
/// Global pooling produces a 1D tensor with one value per channel. Adaptive
/// pooling produces `out_w` outputs, where output `j` reduces inputs
/// `floor(j * w / out_w)..ceil((j + 1) * w / out_w)`.
#[derive(Default)]
pub struct Pooling1D {
    params: PoolingParams,
    dtype: Option<DType>,
    state: LayerState,
}

impl Pooling1D {
    pub fn new() -> Pooling1D {
        Pooling1D::default()
    }
}

impl Layer for Pooling1D {
    fn type_name(&self) -> &'static str {
        "Pooling1D"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.params = PoolingParams::from_params(params)?;
        self.state = LayerState::Configured;
        Ok(())
    }

    fn create_pipeline(&mut self, opt: &RunOptions) -> Result<(), LayerError> {
        self.state.check_configured()?;
        let dtype = select_dtype(opt, false);
        let table = pooling_kernels();
        if ![1, 4, 8].iter().all(|&pack| table.supports(dtype, pack, pack)) {
            return Err(LayerError::UnsupportedType);
        }
        debug!(op = "Pooling1D", %dtype, "created pipeline");
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
        if input.dims() != 2 {
            return Err(LayerError::IncompatibleShape("pooling input must be 2D"));
        }
        if input.w() == 0 {
            return Err(LayerError::IncompatibleShape("input is empty"));
        }

        let pack = input.elempack();
        let input = prepare_input(input, dtype, pack, opt)?;
        let windows = self.params.windows(input.w())?;

        let (h, elemsize) = (input.h(), input.elemsize());
        let blob = opt.blob_allocator();
        let mut out = if self.params.global_pooling {
            Mat::create_1d(h, elemsize, pack, &blob)?
        } else {
            Mat::create_2d(windows.len(), h, elemsize, pack, &blob)?
        };

        let plan = pooling_kernels()
            .select(dtype, pack, pack, &opt.cpu_features())
            .ok_or(LayerError::UnsupportedType)?;
        let args = PoolingArgs {
            input: &input,
            windows: &windows,
            pooling_type: self.params.pooling_type,
            num_threads: opt.num_threads,
        };
        let slots = scratch_slots(h, opt.num_threads);
        let mut scratch =
            Mat::create_1d(slots * args.slot_len(dtype), 4, 1, &opt.workspace_allocator())?;
        (plan.kernel)(plan.key.isa, &args, &mut out, scratch.data_mut::<f32>()?)?;
        Ok([out].into())
    }

    fn destroy_pipeline(&mut self, _opt: &RunOptions) -> Result<(), LayerError> {
        self.dtype = None;
        self.state = LayerState::Unconfigured;
        debug!(op = "Pooling1D", "destroyed pipeline");
        Ok(())
    }

    fn state(&self) -> LayerState {
        self.state
    }
}
