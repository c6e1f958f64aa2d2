//! Elman recurrent layer with a tanh activation, run forwards, backwards or
//! in both directions over a sequence.

use std::iter::Rev;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Range;
use std::sync::OnceLock;

use tracing::debug;

use crate::allocator::system_allocator;
use crate::convert::{cast_to_bfloat16, cast_to_float16};
use crate::kernels::{
    register_float_kernels, select_dtype, Accumulate, DType, F32Acc, KernelTable, Plan, Storage,
};
use crate::layer::{
    match_storage, prepare_input, weight_data, Layer, LayerError, LayerState, OutputList,
};
use crate::mat::Mat;
use crate::options::RunOptions;
use crate::param::ParamDict;
use crate::quantize::{quantize_rows, quantize_weight_mat};
use crate::simd::{dispatch_isa, Isa, IsaId, SimdOp};
use crate::threading::parallel_for_each_mut;

/// Direction that an RNN layer will traverse the input sequence in.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
    Bidirectional,
}

impl Direction {
    fn from_param(value: i32) -> Result<Direction, LayerError> {
        match value {
            0 => Ok(Direction::Forward),
            1 => Ok(Direction::Reverse),
            2 => Ok(Direction::Bidirectional),
            _ => Err(LayerError::InvalidParam("unknown direction")),
        }
    }

    /// Number of directions that an RNN layer will traverse the sequence in.
    pub fn num_directions(self) -> usize {
        match self {
            Self::Forward | Self::Reverse => 1,
            Self::Bidirectional => 2,
        }
    }
}

/// Forward or backward iterator over values in a range.
enum Sequence {
    Forward(Range<usize>),
    Backward(Rev<Range<usize>>),
}

impl Iterator for Sequence {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            Sequence::Forward(range) => range.next(),
            Sequence::Backward(rev_range) => rev_range.next(),
        }
    }
}

/// Return an iterator over timesteps for direction `dir` (0 or 1) of a layer
/// traversing the sequence in `direction`.
fn sequence_for_dir(direction: Direction, dir: usize, seq_len: usize) -> Sequence {
    let reversed = matches!(
        (dir, direction),
        (0, Direction::Reverse) | (1, Direction::Bidirectional)
    );
    if reversed {
        Sequence::Backward((0..seq_len).rev())
    } else {
        Sequence::Forward(0..seq_len)
    }
}

#[derive(Clone, Debug, Default)]
struct RnnParams {
    num_output: usize,
    weight_data_size: usize,
    direction: Direction,
    int8: bool,
}

impl RnnParams {
    fn from_params(params: &ParamDict) -> Result<RnnParams, LayerError> {
        let num_output = params.get_int(0, 0);
        if num_output <= 0 {
            return Err(LayerError::InvalidParam("num_output must be positive"));
        }
        let num_output = num_output as usize;
        let direction = Direction::from_param(params.get_int(2, 0))?;
        let weight_data_size = params.get_int(1, 0).max(0) as usize;
        let per_input = num_output * direction.num_directions();
        if weight_data_size == 0 || weight_data_size % per_input != 0 {
            return Err(LayerError::InvalidParam(
                "weight_data_size is not a multiple of num_output * directions",
            ));
        }
        Ok(RnnParams {
            num_output,
            weight_data_size,
            direction,
            int8: params.get_int(8, 0) != 0,
        })
    }

    /// Length of each input timestep.
    fn input_size(&self) -> usize {
        self.weight_data_size / self.num_output / self.direction.num_directions()
    }
}

/// Choose how many output rows of the weight matrices are interleaved.
fn lane_block(num_output: usize, max_elempack: usize, use_packing_layout: bool) -> usize {
    if !use_packing_layout {
        1
    } else if num_output >= 8 && max_elempack >= 8 {
        8
    } else if num_output >= 4 {
        4
    } else {
        1
    }
}

/// Pack a `[num_output][row_len]` matrix so that each block of `block`
/// consecutive rows is stored column by column, with the rows that do not
/// fill a block left as they are.
///
/// The rows for block or tail row `o` start at `o * row_len` either way.
fn pack_blocks<S: Storage>(
    raw: &[f32],
    num_output: usize,
    row_len: usize,
    block: usize,
) -> Result<Mat, LayerError> {
    let mut packed = Mat::create_1d(raw.len(), size_of::<S>(), 1, &system_allocator())?;
    let data = packed.data_mut::<S>()?;
    let full = num_output / block * block;
    for ob in (0..full).step_by(block) {
        for i in 0..row_len {
            for l in 0..block {
                data[ob * row_len + i * block + l] = S::from_f32(raw[(ob + l) * row_len + i]);
            }
        }
    }
    for o in full..num_output {
        for i in 0..row_len {
            data[o * row_len + i] = S::from_f32(raw[o * row_len + i]);
        }
    }
    Ok(packed)
}

/// Accumulate a block of `B` interleaved weight rows times `x`.
#[inline(always)]
fn gemv_block<I: Isa, S: Storage, A: Accumulate, const B: usize>(
    isa: I,
    acc: &mut [f32],
    x: &[f32],
    w: &[S],
) {
    let mut tmp = [0.; 8];
    for (i, &x) in x.iter().enumerate() {
        let w = S::widen(&w[i * B..(i + 1) * B], &mut tmp);
        isa.fma_scalar(acc, w, x);
        A::round_slice(acc);
    }
}

/// Weights for one direction.
struct DirWeights {
    /// Input weights, packed in lane blocks, or quantized rows for int8.
    xc: Mat,
    xc_descales: Vec<f32>,
    hc: Mat,
    bias: Vec<f32>,
}

struct RnnArgs<'a> {
    /// `(input_size, T)` unpacked input.
    input: &'a Mat,
    weights: &'a DirWeights,
    num_output: usize,
    direction: Direction,
    dir: usize,
    num_threads: usize,
}

/// Per-call buffers, allocated from the workspace allocator.
struct RnnScratch<'a> {
    /// Pre-activation sums for one timestep.
    pre: &'a mut [f32],

    /// Input converted to f32. Empty if the input is already f32 or the
    /// kernel quantizes it.
    x: &'a mut [f32],

    /// Quantized input rows and the descale of each row, for int8 kernels.
    xq: &'a mut [i8],
    x_descales: &'a mut [f32],
}

/// Run one direction over the sequence, writing hidden states to the rows
/// of `out` and updating `hidden` in place.
type RnnKernel =
    fn(IsaId, &RnnArgs<'_>, &mut Mat, &mut [f32], RnnScratch<'_>) -> Result<(), LayerError>;

/// Run the recurrence for one direction.
///
/// `input_term(t, o, acc)` adds the input contribution at timestep `t` to
/// the accumulators for outputs `o..o + acc.len()`.
fn recur<I: Isa, S: Storage, A: Accumulate, const B: usize>(
    isa: I,
    args: &RnnArgs<'_>,
    out: &mut Mat,
    hidden: &mut [f32],
    pre: &mut [f32],
    input_term: &(dyn Fn(usize, usize, &mut [f32]) + Sync),
) -> Result<(), LayerError> {
    let num_output = args.num_output;
    let steps = args.input.h();
    let full = num_output / B * B;
    let hc = args.weights.hc.data::<S>()?;
    let bias = &args.weights.bias;
    let out = out.data_mut::<S>()?;
    let pre = &mut pre[..num_output];

    for t in sequence_for_dir(args.direction, args.dir, steps) {
        let h_prev = &*hidden;
        parallel_for_each_mut(&mut pre[..full], B, args.num_threads, |blk, acc| {
            let ob = blk * B;
            acc.copy_from_slice(&bias[ob..ob + B]);
            input_term(t, ob, acc);
            gemv_block::<_, S, A, B>(isa, acc, h_prev, &hc[ob * num_output..][..num_output * B]);
        });
        for o in full..num_output {
            let acc = &mut pre[o..o + 1];
            acc[0] = bias[o];
            input_term(t, o, acc);
            gemv_block::<_, S, A, 1>(isa, acc, h_prev, &hc[o * num_output..][..num_output]);
        }

        for (h, x) in hidden.iter_mut().zip(pre.iter()) {
            *h = A::round(x.tanh());
        }
        S::narrow(hidden, &mut out[t * num_output..][..num_output]);
    }
    Ok(())
}

struct RnnOp<'a, 'b, 'c, 'd, S, A, const B: usize> {
    args: &'a RnnArgs<'a>,
    out: &'b mut Mat,
    hidden: &'c mut [f32],
    scratch: RnnScratch<'d>,
    _marker: PhantomData<(S, A)>,
}

impl<S: Storage, A: Accumulate, const B: usize> SimdOp for RnnOp<'_, '_, '_, '_, S, A, B> {
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let RnnOp {
            args,
            out,
            hidden,
            scratch,
            ..
        } = self;
        let RnnScratch { pre, x, .. } = scratch;
        let (size, steps) = (args.input.w(), args.input.h());
        let x = S::widen(&args.input.data::<S>()?[..size * steps], x);
        let xc = args.weights.xc.data::<S>()?;

        let input_term = |t: usize, o: usize, acc: &mut [f32]| {
            let x = &x[t * size..(t + 1) * size];
            if acc.len() == B {
                gemv_block::<_, S, A, B>(isa, acc, x, &xc[o * size..][..size * B]);
            } else {
                gemv_block::<_, S, A, 1>(isa, acc, x, &xc[o * size..][..size]);
            }
        };
        recur::<_, S, A, B>(isa, args, out, hidden, pre, &input_term)
    }
}

fn rnn_packed<S: Storage, A: Accumulate, const B: usize>(
    isa: IsaId,
    args: &RnnArgs<'_>,
    out: &mut Mat,
    hidden: &mut [f32],
    scratch: RnnScratch<'_>,
) -> Result<(), LayerError> {
    dispatch_isa(
        isa,
        RnnOp::<S, A, B> {
            args,
            out,
            hidden,
            scratch,
            _marker: PhantomData,
        },
    )
}

struct RnnInt8Op<'a, 'b, 'c, 'd, const B: usize> {
    args: &'a RnnArgs<'a>,
    out: &'b mut Mat,
    hidden: &'c mut [f32],
    scratch: RnnScratch<'d>,
}

impl<const B: usize> SimdOp for RnnInt8Op<'_, '_, '_, '_, B> {
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let RnnInt8Op {
            args,
            out,
            hidden,
            scratch,
        } = self;
        let RnnScratch {
            pre,
            xq,
            x_descales,
            ..
        } = scratch;
        let (size, steps) = (args.input.w(), args.input.h());

        // Each timestep is quantized with its own scale.
        let xq = &mut xq[..size * steps];
        let x_descales = &mut x_descales[..steps];
        quantize_rows(&args.input.data::<f32>()?[..size * steps], size, xq, x_descales);
        let (xq, x_descales) = (&*xq, &*x_descales);

        let xc = args.weights.xc.data::<i8>()?;
        let descales = &args.weights.xc_descales;

        let input_term = |t: usize, o: usize, acc: &mut [f32]| {
            let x = &xq[t * size..(t + 1) * size];
            for (l, acc) in acc.iter_mut().enumerate() {
                let oc = o + l;
                let sum = isa.dot_i8(x, &xc[oc * size..(oc + 1) * size]);
                *acc += sum as f32 * x_descales[t] * descales[oc];
            }
        };
        recur::<_, f32, F32Acc, B>(isa, args, out, hidden, pre, &input_term)
    }
}

fn rnn_int8<const B: usize>(
    isa: IsaId,
    args: &RnnArgs<'_>,
    out: &mut Mat,
    hidden: &mut [f32],
    scratch: RnnScratch<'_>,
) -> Result<(), LayerError> {
    dispatch_isa(
        isa,
        RnnInt8Op::<B> {
            args,
            out,
            hidden,
            scratch,
        },
    )
}

fn rnn_kernels() -> &'static KernelTable<RnnKernel> {
    static KERNELS: OnceLock<KernelTable<RnnKernel>> = OnceLock::new();
    KERNELS.get_or_init(|| {
        let mut table = KernelTable::<RnnKernel>::new("RNN");
        register_float_kernels!(table, 1, 1, S, A => rnn_packed::<S, A, 1>);
        register_float_kernels!(table, 1, 4, S, A => rnn_packed::<S, A, 4>);
        register_float_kernels!(table, 1, 8, S, A => rnn_packed::<S, A, 8>);
        table.register_all_isas(DType::Int8, 1, 1, rnn_int8::<1>);
        table.register_all_isas(DType::Int8, 1, 4, rnn_int8::<4>);
        table.register_all_isas(DType::Int8, 1, 8, rnn_int8::<8>);
        debug!(op = "RNN", variants = table.len(), "built kernel table");
        table
    })
}

/// Copy the rows of two `(n, T)` tensors side by side into a `(2n, T)`
/// tensor.
fn concat_rows<S: Storage>(a: &Mat, b: &Mat, out: &mut Mat) -> Result<(), LayerError> {
    let n = a.w();
    let (a, b) = (a.data::<S>()?, b.data::<S>()?);
    let out = out.data_mut::<S>()?;
    for (t, row) in out.chunks_mut(2 * n).enumerate() {
        row[..n].copy_from_slice(&a[t * n..(t + 1) * n]);
        row[n..].copy_from_slice(&b[t * n..(t + 1) * n]);
    }
    Ok(())
}

struct RnnPipeline {
    plan: Plan<RnnKernel>,
    directions: Vec<DirWeights>,
}

/// Elman recurrent layer computing `H_t = tanh(W_xc x_t + b + W_hc H_{t-1})`.
///
/// The input is a 2D `(input_size, T)` tensor with one row per timestep. The
/// output has one row of `num_output` hidden states per timestep, or
/// `2 * num_output` for a bidirectional layer, with the forward direction
/// first.
///
/// An optional second input of shape `(num_output, directions)` provides
/// the initial hidden state. When it is given, the final hidden state is
/// returned as a second output of the same shape.
///
/// Weights are `weight_xc [dirs][num_output][input_size]`,
/// `bias_c [dirs][num_output]` and `weight_hc [dirs][num_output][num_output]`.
/// With int8 enabled only the input weights are quantized. The recurrent
/// term and the hidden state stay in f32.
#[derive(Default)]
pub struct Rnn {
    params: RnnParams,
    weights: Vec<Mat>,
    pipeline: Option<RnnPipeline>,
    state: LayerState,
}

impl Rnn {
    pub fn new() -> Rnn {
        Rnn::default()
    }

    fn select_plan(&self, opt: &RunOptions) -> Result<Plan<RnnKernel>, LayerError> {
        let dtype = select_dtype(opt, self.params.int8);
        let features = opt.cpu_features();
        let block = lane_block(
            self.params.num_output,
            features.max_elempack(),
            opt.use_packing_layout,
        );
        rnn_kernels()
            .select(dtype, 1, block, &features)
            .ok_or(LayerError::UnsupportedType)
    }
}

impl Layer for Rnn {
    fn type_name(&self) -> &'static str {
        "RNN"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.params = RnnParams::from_params(params)?;
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
        let (num_output, size) = (p.num_output, p.input_size());
        let dirs = p.direction.num_directions();

        let xc = weight_data(&self.weights, 0, p.weight_data_size, "weight_xc_data")?;
        let bias = weight_data(&self.weights, 1, num_output * dirs, "bias_c_data")?;
        let hc = weight_data(&self.weights, 2, num_output * num_output * dirs, "weight_hc_data")?;

        let block = plan.key.out_pack;
        let mut directions = Vec::with_capacity(dirs);
        for dir in 0..dirs {
            let xc = &xc[dir * num_output * size..(dir + 1) * num_output * size];
            let hc = &hc[dir * num_output * num_output..(dir + 1) * num_output * num_output];
            let (xc, xc_descales) = if plan.key.dtype == DType::Int8 {
                quantize_weight_mat(xc, num_output, &system_allocator())?
            } else {
                let packed = match_storage!(plan.key.dtype, S => {
                    pack_blocks::<S>(xc, num_output, size, block)
                })?;
                (packed, Vec::new())
            };
            let hc = match_storage!(plan.key.dtype, S => {
                pack_blocks::<S>(hc, num_output, num_output, block)
            })?;
            directions.push(DirWeights {
                xc,
                xc_descales,
                hc,
                bias: bias[dir * num_output..(dir + 1) * num_output].to_vec(),
            });
        }

        if opt.lightmode {
            self.weights.clear();
        }
        debug!(op = "RNN", kernel = %plan.key, "created pipeline");
        self.pipeline = Some(RnnPipeline { plan, directions });
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

        let p = &self.params;
        let (num_output, dirs) = (p.num_output, p.direction.num_directions());
        let input = inputs.first().ok_or(LayerError::MissingInputs)?;
        if input.dims() != 2 || input.w() != p.input_size() {
            return Err(LayerError::IncompatibleShape(
                "input size does not match weights",
            ));
        }
        let dtype = plan.key.dtype;
        let input = prepare_input(input, dtype, 1, opt)?;
        let (size, steps) = (input.w(), input.h());

        let initial_hidden = match inputs.get(1) {
            Some(h) => {
                let h = prepare_input(h, DType::F32, 1, opt)?;
                if h.plane_len() * h.c() != num_output * dirs {
                    return Err(LayerError::IncompatibleShape(
                        "hidden state size does not match weights",
                    ));
                }
                Some(h)
            }
            None => None,
        };

        // Hidden state for every direction, followed by the kernel scratch.
        let int8 = dtype == DType::Int8;
        let widen_len = match dtype {
            DType::F32 | DType::Int8 => 0,
            _ => size * steps,
        };
        let descales_len = if int8 { steps } else { 0 };
        let ws = opt.workspace_allocator();
        let mut workspace = Mat::create_1d(
            num_output * dirs + num_output + widen_len + descales_len,
            4,
            1,
            &ws,
        )?;
        let mut quantized = Mat::create_1d(if int8 { size * steps } else { 0 }, 1, 1, &ws)?;
        let (hidden, rest) = workspace.data_mut::<f32>()?.split_at_mut(num_output * dirs);
        let (pre, rest) = rest.split_at_mut(num_output);
        let (x, x_descales) = rest.split_at_mut(widen_len);
        let xq = quantized.data_mut::<i8>()?;

        if let Some(h) = &initial_hidden {
            let plane = h.plane_len();
            for q in 0..h.c() {
                hidden[q * plane..(q + 1) * plane].copy_from_slice(h.channel_data::<f32>(q)?);
            }
        }

        let elemsize = dtype.storage_size();
        let mut dir_outputs = Vec::with_capacity(dirs);
        for (dir, weights) in pipeline.directions.iter().enumerate() {
            let alloc = if dirs == 1 {
                opt.blob_allocator()
            } else {
                opt.workspace_allocator()
            };
            let mut out = Mat::create_2d(num_output, steps, elemsize, 1, &alloc)?;
            let args = RnnArgs {
                input: &input,
                weights,
                num_output,
                direction: p.direction,
                dir,
                num_threads: opt.num_threads,
            };
            let scratch = RnnScratch {
                pre: &mut *pre,
                x: &mut *x,
                xq: &mut *xq,
                x_descales: &mut *x_descales,
            };
            let dir_hidden = &mut hidden[dir * num_output..(dir + 1) * num_output];
            (plan.kernel)(plan.key.isa, &args, &mut out, dir_hidden, scratch)?;
            dir_outputs.push(out);
        }

        let output = match (dir_outputs.pop(), dir_outputs.pop()) {
            (Some(rev), Some(fwd)) => {
                let mut out =
                    Mat::create_2d(2 * num_output, steps, elemsize, 1, &opt.blob_allocator())?;
                match_storage!(dtype, S => concat_rows::<S>(&fwd, &rev, &mut out))?;
                out
            }
            (Some(out), None) => out,
            _ => return Err(LayerError::NotReady(self.state)),
        };

        if inputs.len() < 2 {
            return Ok([output].into());
        }

        let blob = opt.blob_allocator();
        let mut hidden_out = Mat::create_2d(num_output, dirs, 4, 1, &blob)?;
        hidden_out.data_mut::<f32>()?.copy_from_slice(hidden);
        let hidden_out = match dtype {
            DType::F16Storage | DType::F16Arith => cast_to_float16(&hidden_out, &blob)?,
            DType::Bf16Storage => cast_to_bfloat16(&hidden_out, &blob)?,
            DType::F32 | DType::Int8 => hidden_out,
        };
        Ok([output, hidden_out].into_iter().collect())
    }

    fn destroy_pipeline(&mut self, _opt: &RunOptions) -> Result<(), LayerError> {
        self.pipeline = None;
        self.state = LayerState::Unconfigured;
        debug!(op = "RNN", "destroyed pipeline");
        Ok(())
    }

    fn state(&self) -> LayerState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use packnn_testing::{expect_all_close, TestCases};

    use super::{lane_block, pack_blocks};
    use crate::allocator::testing::LimitedAllocator;
    use crate::cpu::CpuFeatures;
    use crate::layer::{status_code, LayerError};
    use crate::mat::Mat;
    use crate::ops::testing::{random_mat, random_values, run_layer, unpacked_values};
    use crate::options::RunOptions;
    use crate::param::ParamDict;

    struct RnnWeights {
        xc: Vec<f32>,
        bias: Vec<f32>,
        hc: Vec<f32>,
    }

    impl RnnWeights {
        fn random(rng: &mut fastrand::Rng, num_output: usize, size: usize) -> RnnWeights {
            RnnWeights {
                xc: random_values(rng, num_output * size),
                bias: random_values(rng, num_output),
                hc: random_values(rng, num_output * num_output),
            }
        }

        /// Concatenate the weights for several directions.
        fn mats(dirs: &[&RnnWeights]) -> Vec<Mat> {
            let cat = |f: fn(&RnnWeights) -> &Vec<f32>| -> Mat {
                let data: Vec<f32> = dirs.iter().flat_map(|w| f(w).iter().copied()).collect();
                Mat::from_f32(&[data.len()], &data).unwrap()
            };
            vec![cat(|w| &w.xc), cat(|w| &w.bias), cat(|w| &w.hc)]
        }
    }

    fn params(num_output: usize, size: usize, direction: i32, int8: bool) -> ParamDict {
        let dirs = if direction == 2 { 2 } else { 1 };
        ParamDict::new()
            .with_int(0, num_output as i32)
            .with_int(1, (num_output * size * dirs) as i32)
            .with_int(2, direction)
            .with_int(8, int8 as i32)
    }

    /// Return the hidden state at each timestep, in timestep order, and the
    /// final hidden state.
    fn reference_rnn(
        x: &[f32],
        size: usize,
        w: &RnnWeights,
        reverse: bool,
        h0: Option<&[f32]>,
    ) -> (Vec<f32>, Vec<f32>) {
        let n = w.bias.len();
        let steps = x.len() / size;
        let mut h = h0.map(|h| h.to_vec()).unwrap_or(vec![0.; n]);
        let mut out = vec![0.; steps * n];
        let order: Vec<usize> = if reverse {
            (0..steps).rev().collect()
        } else {
            (0..steps).collect()
        };
        for t in order {
            let xt = &x[t * size..(t + 1) * size];
            let next: Vec<f32> = (0..n)
                .map(|o| {
                    let xs: f32 = (0..size).map(|i| w.xc[o * size + i] * xt[i]).sum();
                    let hs: f32 = (0..n).map(|i| w.hc[o * n + i] * h[i]).sum();
                    (xs + w.bias[o] + hs).tanh()
                })
                .collect();
            h = next;
            out[t * n..(t + 1) * n].copy_from_slice(&h);
        }
        (out, h)
    }

    #[test]
    fn test_pack_blocks() {
        // 5 rows of 2: one block of 4 and a tail row.
        let raw: Vec<f32> = (0..10).map(|x| x as f32).collect();
        let packed = pack_blocks::<f32>(&raw, 5, 2, 4).unwrap();
        assert_eq!(
            packed.to_vec::<f32>().unwrap(),
            [0., 2., 4., 6., 1., 3., 5., 7., 8., 9.]
        );
    }

    #[test]
    fn test_lane_block() {
        assert_eq!(lane_block(16, 8, true), 8);
        assert_eq!(lane_block(16, 4, true), 4);
        assert_eq!(lane_block(6, 8, true), 4);
        assert_eq!(lane_block(3, 8, true), 1);
        assert_eq!(lane_block(16, 8, false), 1);
    }

    #[test]
    fn test_rnn_matches_reference() {
        #[derive(Debug)]
        struct Case {
            num_output: usize,
            size: usize,
            steps: usize,
            direction: i32,
        }

        let cases = [
            Case {
                num_output: 3,
                size: 5,
                steps: 4,
                direction: 0,
            },
            Case {
                num_output: 8,
                size: 16,
                steps: 6,
                direction: 0,
            },
            Case {
                num_output: 12,
                size: 7,
                steps: 5,
                direction: 1,
            },
            Case {
                num_output: 19,
                size: 4,
                steps: 3,
                direction: 0,
            },
        ];

        cases.test_each(|case| {
            let mut rng = fastrand::Rng::with_seed(1234);
            let w = RnnWeights::random(&mut rng, case.num_output, case.size);
            let input = random_mat(&mut rng, &[case.size, case.steps]);
            let (expected, _) =
                reference_rnn(&input.to_vec().unwrap(), case.size, &w, case.direction == 1, None);
            let params = params(case.num_output, case.size, case.direction, false);

            let baseline = RunOptions {
                cpu_features: Some(CpuFeatures::baseline()),
                ..RunOptions::default()
            };
            let default = RunOptions::default();
            for opt in [default.clone(), default.without_packing(), baseline] {
                let out = run_layer("RNN", &params, &RnnWeights::mats(&[&w]), &[input.clone()], &opt)
                    .unwrap();
                assert_eq!([out[0].w(), out[0].h()], [case.num_output, case.steps]);
                expect_all_close(&unpacked_values(&out[0], &opt), &expected, 1e-4, 1e-5)
                    .unwrap();
            }
        });
    }

    #[test]
    fn test_bidirectional() -> Result<(), String> {
        let (num_output, size, steps) = (8, 16, 5);
        let mut rng = fastrand::Rng::with_seed(1234);
        let fwd = RnnWeights::random(&mut rng, num_output, size);
        let rev = RnnWeights::random(&mut rng, num_output, size);
        let input = random_mat(&mut rng, &[size, steps]);
        let opt = RunOptions::default();

        let run = |direction, weights: &[&RnnWeights]| {
            run_layer(
                "RNN",
                &params(num_output, size, direction, false),
                &RnnWeights::mats(weights),
                &[input.clone()],
                &opt,
            )
            .map(|out| out[0].to_vec::<f32>().unwrap())
            .map_err(|e| e.to_string())
        };
        let both = run(2, &[&fwd, &rev])?;
        let fwd_only = run(0, &[&fwd])?;
        let rev_only = run(1, &[&rev])?;

        assert_eq!(both.len(), 2 * num_output * steps);
        for t in 0..steps {
            let row = &both[t * 2 * num_output..(t + 1) * 2 * num_output];
            let step = t * num_output..(t + 1) * num_output;
            expect_all_close(&row[..num_output], &fwd_only[step.clone()], 1e-6, 1e-6)?;
            expect_all_close(&row[num_output..], &rev_only[step], 1e-6, 1e-6)?;
        }
        Ok(())
    }

    #[test]
    fn test_initial_hidden_state() -> Result<(), String> {
        let (num_output, size, steps) = (4, 6, 3);
        let mut rng = fastrand::Rng::with_seed(1234);
        let w = RnnWeights::random(&mut rng, num_output, size);
        let input = random_mat(&mut rng, &[size, steps]);
        let h0 = random_values(&mut rng, num_output);
        let (expected, expected_h) =
            reference_rnn(&input.to_vec().unwrap(), size, &w, false, Some(&h0));

        let opt = RunOptions::default();
        let hidden = Mat::from_f32(&[num_output, 1], &h0).unwrap();
        let out = run_layer(
            "RNN",
            &params(num_output, size, 0, false),
            &RnnWeights::mats(&[&w]),
            &[input, hidden],
            &opt,
        )
        .map_err(|e| e.to_string())?;

        assert_eq!(out.len(), 2);
        assert_eq!([out[1].w(), out[1].h()], [num_output, 1]);
        expect_all_close(&out[0].to_vec::<f32>().unwrap(), &expected, 1e-4, 1e-5)?;
        expect_all_close(&out[1].to_vec::<f32>().unwrap(), &expected_h, 1e-4, 1e-5)
    }

    #[test]
    fn test_reduced_precision() {
        #[derive(Clone, Debug)]
        struct Case {
            opt: RunOptions,
            int8: bool,
            atol: f32,
        }

        let default = RunOptions::default();
        let cases = [
            Case {
                opt: RunOptions {
                    use_fp16_storage: true,
                    ..default.clone()
                },
                int8: false,
                atol: 1e-2,
            },
            Case {
                opt: RunOptions {
                    use_bf16_storage: true,
                    ..default.clone()
                },
                int8: false,
                atol: 5e-2,
            },
            Case {
                opt: default.clone(),
                int8: true,
                atol: 5e-2,
            },
        ];

        cases.map(std::panic::AssertUnwindSafe).test_each_value(|case| {
            let (num_output, size, steps) = (8, 16, 4);
            let mut rng = fastrand::Rng::with_seed(1234);
            let w = RnnWeights::random(&mut rng, num_output, size);
            let input = random_mat(&mut rng, &[size, steps]);
            let (expected, _) = reference_rnn(&input.to_vec().unwrap(), size, &w, false, None);

            let out = run_layer(
                "RNN",
                &params(num_output, size, 0, case.int8),
                &RnnWeights::mats(&[&w]),
                &[input],
                &case.opt,
            )
            .unwrap();
            expect_all_close(&unpacked_values(&out[0], &case.opt), &expected, 0., case.atol)
                .unwrap();
        });
    }

    #[test]
    fn test_input_size_mismatch() {
        let mut rng = fastrand::Rng::with_seed(1234);
        let w = RnnWeights::random(&mut rng, 4, 6);
        let result = run_layer(
            "RNN",
            &params(4, 6, 0, false),
            &RnnWeights::mats(&[&w]),
            &[random_mat(&mut rng, &[5, 3])],
            &RunOptions::default(),
        );
        assert_eq!(
            result.err(),
            Some(LayerError::IncompatibleShape("input size does not match weights"))
        );
    }

    #[test]
    fn test_allocation_failure() {
        let (num_output, size, steps) = (8, 16, 4);
        let mut rng = fastrand::Rng::with_seed(1234);
        let w = RnnWeights::random(&mut rng, num_output, size);
        let input = random_mat(&mut rng, &[size, steps]);
        let opt = RunOptions {
            workspace_allocator: Some(Arc::new(LimitedAllocator::new(0))),
            ..RunOptions::default()
        };

        for int8 in [false, true] {
            let result = run_layer(
                "RNN",
                &params(num_output, size, 0, int8),
                &RnnWeights::mats(&[&w]),
                &[input.clone()],
                &opt,
            );
            assert_eq!(result.as_ref().err(), Some(&LayerError::AllocationFailed));
            assert_eq!(status_code(&result), -100);
        }
    }
}
