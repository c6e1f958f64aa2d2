//! Nearest, bilinear and bicubic resizing.
//!
//! Resizing is separable. Each output row is a weighted sum of a few source
//! rows which have been resized horizontally. Output rows map to source rows
//! in non-decreasing order, so the kernels keep the horizontally resized rows
//! for the previous output row and only compute the rows that are new.

use std::marker::PhantomData;
use std::sync::OnceLock;

use tracing::debug;

use crate::kernels::{register_float_kernels, select_dtype, Accumulate, DType, KernelTable, Storage};
use crate::layer::{match_storage, prepare_input, Layer, LayerError, LayerState, OutputList};
use crate::mat::Mat;
use crate::options::RunOptions;
use crate::param::ParamDict;
use crate::simd::{dispatch_isa, Isa, IsaId, SimdOp};
use crate::threading::{parallel_for_each_mut_with_scratch, scratch_slots};

/// Interpolation method.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ResizeType {
    #[default]
    Nearest,
    Bilinear,
    Bicubic,
}

impl ResizeType {
    fn from_param(value: i32) -> Result<ResizeType, LayerError> {
        match value {
            0 | 1 => Ok(ResizeType::Nearest),
            2 => Ok(ResizeType::Bilinear),
            3 => Ok(ResizeType::Bicubic),
            _ => Err(LayerError::InvalidParam("unknown resize type")),
        }
    }
}

/// Source taps and weights for each output coordinate along one axis.
///
/// Output coordinate `i` reads source coordinates `base[i] + k` for
/// `k in 0..taps`, clamped to the source extent.
#[derive(Clone, Debug, PartialEq)]
struct Coeffs {
    base: Vec<isize>,
    weights: Vec<[f32; 4]>,
    taps: usize,
}

impl Coeffs {
    /// Return the clamped source coordinate of tap `k` for output `i`.
    #[inline]
    fn source(&self, i: usize, k: usize, size: usize) -> usize {
        (self.base[i] + k as isize).clamp(0, size as isize - 1) as usize
    }

    /// Coefficients which copy a single coordinate.
    fn identity() -> Coeffs {
        Coeffs {
            base: vec![0],
            weights: vec![[1., 0., 0., 0.]],
            taps: 1,
        }
    }
}

/// Nearest neighbor coefficients, where `scale` maps output to input
/// coordinates.
fn nearest_coeffs(size: usize, out_size: usize, scale: f32) -> Coeffs {
    let base = (0..out_size)
        .map(|i| ((i as f32 * scale) as usize).min(size - 1) as isize)
        .collect();
    Coeffs {
        base,
        weights: vec![[1., 0., 0., 0.]; out_size],
        taps: 1,
    }
}

/// Return the source coordinate of output coordinate `i`.
fn source_coord(i: usize, size: usize, out_size: usize, align_corner: bool) -> f32 {
    if align_corner {
        let scale = if out_size > 1 {
            (size - 1) as f64 / (out_size - 1) as f64
        } else {
            0.
        };
        (i as f64 * scale) as f32
    } else {
        let scale = size as f64 / out_size as f64;
        ((i as f64 + 0.5) * scale - 0.5) as f32
    }
}

fn linear_coeffs(size: usize, out_size: usize, align_corner: bool) -> Coeffs {
    let mut base = Vec::with_capacity(out_size);
    let mut weights = Vec::with_capacity(out_size);
    for i in 0..out_size {
        let x = source_coord(i, size, out_size, align_corner);
        let mut sx = x.floor() as isize;
        let mut fx = x - sx as f32;
        if sx < 0 {
            sx = 0;
            fx = 0.;
        }
        if sx >= size as isize - 1 {
            sx = size as isize - 1;
            fx = 0.;
        }
        base.push(sx);
        weights.push([1. - fx, fx, 0., 0.]);
    }
    Coeffs {
        base,
        weights,
        taps: 2,
    }
}

/// Cubic convolution weights for the four taps around a point at fraction
/// `fx` between the second and third tap.
fn cubic_weights(fx: f32) -> [f32; 4] {
    const A: f32 = -0.75;
    let fx0 = fx + 1.;
    let fx1 = fx;
    let fx2 = 1. - fx;
    let w0 = A * fx0 * fx0 * fx0 - 5. * A * fx0 * fx0 + 8. * A * fx0 - 4. * A;
    let w1 = (A + 2.) * fx1 * fx1 * fx1 - (A + 3.) * fx1 * fx1 + 1.;
    let w2 = (A + 2.) * fx2 * fx2 * fx2 - (A + 3.) * fx2 * fx2 + 1.;
    [w0, w1, w2, 1. - w0 - w1 - w2]
}

fn cubic_coeffs(size: usize, out_size: usize, align_corner: bool) -> Coeffs {
    let mut base = Vec::with_capacity(out_size);
    let mut weights = Vec::with_capacity(out_size);
    for i in 0..out_size {
        let x = source_coord(i, size, out_size, align_corner);
        let sx = x.floor();
        base.push(sx as isize - 1);
        weights.push(cubic_weights(x - sx));
    }
    Coeffs {
        base,
        weights,
        taps: 4,
    }
}

struct InterpArgs<'a> {
    input: &'a Mat,
    xc: &'a Coeffs,
    yc: &'a Coeffs,

    /// Reuse horizontally resized rows between output rows.
    reuse_rows: bool,
    num_threads: usize,
}

/// Resize `input` into `out`, using `scratch` for intermediate rows.
///
/// `scratch` must hold [`scratch_slots`] slots of [`slot_len`] elements.
type InterpKernel = fn(IsaId, &InterpArgs<'_>, &mut Mat, &mut [f32]) -> Result<(), LayerError>;

/// Length of the scratch space needed to resize one plane of `w` elements
/// per row to `out_w` elements per row, with `taps` source rows per output
/// row and `pack` lanes per element.
fn slot_len(w: usize, out_w: usize, taps: usize, pack: usize) -> usize {
    (w + (taps + 1) * out_w) * pack
}

/// Resize a `w x h` plane of `P`-lane elements.
///
/// `scratch` must hold at least `slot_len(w, out_w, yc.taps, P)` elements.
fn resize_plane<I: Isa, S: Storage, A: Accumulate, const P: usize>(
    isa: I,
    src: &[S],
    (w, h): (usize, usize),
    dst: &mut [S],
    (out_w, out_h): (usize, usize),
    (xc, yc): (&Coeffs, &Coeffs),
    reuse_rows: bool,
    scratch: &mut [f32],
) {
    let taps = yc.taps;
    let row_len = out_w * P;
    let (src_row, scratch) = scratch.split_at_mut(w * P);
    let (out_row, rows) = scratch.split_at_mut(row_len);
    let rows = &mut rows[..taps * row_len];
    let mut prev_sy = None;

    let hresize = |src_row: &[f32], row: &mut [f32]| {
        for (dx, acc) in row.chunks_exact_mut(P).enumerate() {
            acc.fill(0.);
            for k in 0..xc.taps {
                let sx = xc.source(dx, k, w);
                isa.fma_scalar(acc, &src_row[sx * P..(sx + 1) * P], xc.weights[dx][k]);
            }
            A::round_slice(acc);
        }
    };

    for dy in 0..out_h {
        let sy = yc.base[dy];
        let first_new = match prev_sy {
            Some(prev) if reuse_rows && sy >= prev && ((sy - prev) as usize) < taps => {
                let shift = (sy - prev) as usize;
                rows.rotate_left(shift * row_len);
                taps - shift
            }
            _ => 0,
        };
        for k in first_new..taps {
            let y = yc.source(dy, k, h);
            let src_data = S::widen(&src[y * w * P..(y + 1) * w * P], &mut src_row[..]);
            hresize(src_data, &mut rows[k * row_len..(k + 1) * row_len]);
        }
        prev_sy = Some(sy);

        let cached: &[f32] = rows;
        let row = move |k: usize| &cached[k * row_len..(k + 1) * row_len];
        let beta = &yc.weights[dy];
        match taps {
            1 => {
                out_row.fill(0.);
                isa.fma_scalar(out_row, row(0), beta[0]);
            }
            2 => isa.axpby(out_row, row(0), beta[0], row(1), beta[1]),
            _ => {
                out_row.fill(0.);
                for (k, &b) in beta.iter().enumerate().take(taps) {
                    isa.fma_scalar(out_row, row(k), b);
                }
            }
        }
        A::round_slice(out_row);
        S::narrow(out_row, &mut dst[dy * row_len..(dy + 1) * row_len]);
    }
}

struct InterpOp<'a, 'b, 'c, S, A, const P: usize> {
    args: &'a InterpArgs<'a>,
    out: &'b mut Mat,
    scratch: &'c mut [f32],
    _marker: PhantomData<(S, A)>,
}

impl<S: Storage, A: Accumulate, const P: usize> SimdOp for InterpOp<'_, '_, '_, S, A, P> {
    type Output = Result<(), LayerError>;

    fn eval<I: Isa>(self, isa: I) -> Self::Output {
        let InterpOp {
            args, out, scratch, ..
        } = self;
        let input = args.input;
        let (w, h) = (input.w(), input.h());
        let (out_w, out_h) = (out.w(), out.h());
        let src = input.data::<S>()?;
        let (xc, yc, reuse_rows) = (args.xc, args.yc, args.reuse_rows);
        let slot = slot_len(w, out_w, yc.taps, P);

        if input.dims() == 2 {
            // Each row is resized along its width independently.
            let identity = Coeffs::identity();
            let dst = out.data_mut::<S>()?;
            parallel_for_each_mut_with_scratch(
                dst,
                out_w * P,
                scratch,
                slot,
                args.num_threads,
                |y, row, scratch| {
                    let src_row = &src[y * w * P..(y + 1) * w * P];
                    resize_plane::<_, S, A, P>(
                        isa,
                        src_row,
                        (w, 1),
                        row,
                        (out_w, 1),
                        (xc, &identity),
                        reuse_rows,
                        scratch,
                    );
                },
            );
        } else {
            let in_cstep = input.cstep() * P;
            let out_cstep = out.cstep() * P;
            let dst = out.data_mut::<S>()?;
            parallel_for_each_mut_with_scratch(
                dst,
                out_cstep,
                scratch,
                slot,
                args.num_threads,
                |q, plane, scratch| {
                    let src_plane = &src[q * in_cstep..][..w * h * P];
                    let dst_plane = &mut plane[..out_w * out_h * P];
                    resize_plane::<_, S, A, P>(
                        isa,
                        src_plane,
                        (w, h),
                        dst_plane,
                        (out_w, out_h),
                        (xc, yc),
                        reuse_rows,
                        scratch,
                    );
                },
            );
        }
        Ok(())
    }
}

fn interp_packed<S: Storage, A: Accumulate, const P: usize>(
    isa: IsaId,
    args: &InterpArgs<'_>,
    out: &mut Mat,
    scratch: &mut [f32],
) -> Result<(), LayerError> {
    dispatch_isa(
        isa,
        InterpOp::<S, A, P> {
            args,
            out,
            scratch,
            _marker: PhantomData,
        },
    )
}

fn interp_kernels() -> &'static KernelTable<InterpKernel> {
    static KERNELS: OnceLock<KernelTable<InterpKernel>> = OnceLock::new();
    KERNELS.get_or_init(|| {
        let mut table = KernelTable::<InterpKernel>::new("Interp");
        register_float_kernels!(table, 1, 1, S, A => interp_packed::<S, A, 1>);
        register_float_kernels!(table, 4, 4, S, A => interp_packed::<S, A, 4>);
        register_float_kernels!(table, 8, 8, S, A => interp_packed::<S, A, 8>);
        debug!(op = "Interp", variants = table.len(), "built kernel table");
        table
    })
}

/// Broadcast each element of a 1D tensor over an `out_w x out_h` plane.
fn fill_planes<S: Storage>(input: &Mat, out: &mut Mat) -> Result<(), LayerError> {
    let pack = input.elempack();
    let src = input.data::<S>()?;
    let plane = out.plane_len();
    for q in 0..out.c() {
        let value = &src[q * pack..(q + 1) * pack];
        let dst = out.channel_data_mut::<S>(q)?;
        for chunk in dst[..plane * pack].chunks_exact_mut(pack) {
            chunk.copy_from_slice(value);
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
struct InterpParams {
    resize_type: ResizeType,
    height_scale: f32,
    width_scale: f32,
    output_height: usize,
    output_width: usize,
    dynamic_target_size: bool,
    align_corner: bool,
}

impl Default for InterpParams {
    fn default() -> Self {
        InterpParams {
            resize_type: ResizeType::Nearest,
            height_scale: 1.,
            width_scale: 1.,
            output_height: 0,
            output_width: 0,
            dynamic_target_size: false,
            align_corner: false,
        }
    }
}

impl InterpParams {
    fn from_params(params: &ParamDict) -> Result<InterpParams, LayerError> {
        let height_scale = params.get_float(1, 1.);
        let width_scale = params.get_float(2, 1.);
        if height_scale.is_nan() || width_scale.is_nan() || height_scale <= 0. || width_scale <= 0. {
            return Err(LayerError::InvalidParam("scale must be positive"));
        }
        Ok(InterpParams {
            resize_type: ResizeType::from_param(params.get_int(0, 0))?,
            height_scale,
            width_scale,
            output_height: params.get_int(3, 0).max(0) as usize,
            output_width: params.get_int(4, 0).max(0) as usize,
            dynamic_target_size: params.get_int(5, 0) != 0,
            align_corner: params.get_int(6, 0) != 0,
        })
    }
}

/// Resize along one axis: the output size and the output to input scale
/// used for nearest neighbor sampling.
fn axis_size(size: usize, target: Option<usize>, scale: f32) -> (usize, f32) {
    match target {
        Some(out) => (out, size as f32 / out.max(1) as f32),
        None => ((size as f32 * scale) as usize, 1. / scale),
    }
}

/// Resize 2D images, rows or broadcast 1D vectors.
///
/// For a 3D `(w, h, c)` input each channel is resized. A 2D `(w, h)` input
/// is resized along its width only. A 1D input of `w` values produces a 3D
/// `(out_w, out_h, w)` tensor with each channel filled with one value.
///
/// The output size is read from a second "reference" input if
/// `dynamic_target_size` is set, otherwise from `output_width` and
/// `output_height` if both are set, otherwise it is the input size times the
/// scale factors.
#[derive(Default)]
pub struct Interp {
    params: InterpParams,
    dtype: Option<DType>,
    state: LayerState,
}

impl Interp {
    pub fn new() -> Interp {
        Interp::default()
    }

    fn run(&self, inputs: &[Mat], opt: &RunOptions, reuse_rows: bool) -> Result<OutputList, LayerError> {
        self.state.check_ready()?;
        let dtype = select_dtype(opt, false);
        if Some(dtype) != self.dtype {
            return Err(LayerError::PlanMismatch);
        }

        let input = inputs.first().ok_or(LayerError::MissingInputs)?;
        let p = &self.params;
        let (target_w, target_h) = if p.dynamic_target_size {
            let reference = inputs.get(1).ok_or(LayerError::MissingInputs)?;
            (Some(reference.w()), Some(reference.h()))
        } else if p.output_width > 0 && p.output_height > 0 {
            (Some(p.output_width), Some(p.output_height))
        } else {
            (None, None)
        };

        if input.w() == 0 || (input.dims() >= 2 && input.h() == 0) || input.is_empty() {
            return Err(LayerError::IncompatibleShape("input is empty"));
        }

        let pack = input.elempack();
        let input = prepare_input(input, dtype, pack, opt)?;
        let (w, h) = (input.w(), input.h());
        let (out_w, x_scale) = axis_size(w, target_w, p.width_scale);
        let (out_h, y_scale) = match input.dims() {
            2 => (h, 1.),
            _ => axis_size(h, target_h, p.height_scale),
        };
        if out_w == 0 || out_h == 0 {
            return Err(LayerError::IncompatibleShape("output size is zero"));
        }

        let elemsize = input.elemsize();
        let blob = opt.blob_allocator();
        if input.dims() == 1 {
            let mut out = Mat::create_3d(out_w, out_h, w, elemsize, pack, &blob)?;
            match_storage!(dtype, S => fill_planes::<S>(&input, &mut out))?;
            return Ok([out].into());
        }

        let mut out = match input.dims() {
            2 => Mat::create_2d(out_w, h, elemsize, pack, &blob)?,
            3 => Mat::create_3d(out_w, out_h, input.c(), elemsize, pack, &blob)?,
            _ => {
                return Err(LayerError::IncompatibleShape(
                    "interp supports 1D, 2D and 3D inputs",
                ))
            }
        };

        let (xc, yc) = match p.resize_type {
            ResizeType::Nearest => (
                nearest_coeffs(w, out_w, x_scale),
                nearest_coeffs(h, out_h, y_scale),
            ),
            ResizeType::Bilinear => (
                linear_coeffs(w, out_w, p.align_corner),
                linear_coeffs(h, out_h, p.align_corner),
            ),
            ResizeType::Bicubic => (
                cubic_coeffs(w, out_w, p.align_corner),
                cubic_coeffs(h, out_h, p.align_corner),
            ),
        };

        let features = opt.cpu_features();
        let plan = interp_kernels()
            .select(dtype, pack, pack, &features)
            .ok_or(LayerError::UnsupportedType)?;

        let n_chunks = if input.dims() == 2 { h } else { input.c() };
        let slots = scratch_slots(n_chunks, opt.num_threads);
        let mut scratch = Mat::create_1d(
            slots * slot_len(w, out_w, yc.taps, pack),
            4,
            1,
            &opt.workspace_allocator(),
        )?;

        let args = InterpArgs {
            input: &input,
            xc: &xc,
            yc: &yc,
            reuse_rows,
            num_threads: opt.num_threads,
        };
        (plan.kernel)(plan.key.isa, &args, &mut out, scratch.data_mut::<f32>()?)?;
        Ok([out].into())
    }

    /// Run the layer without reusing resized rows between output rows.
    #[cfg(test)]
    fn forward_no_reuse(&self, inputs: &[Mat], opt: &RunOptions) -> Result<OutputList, LayerError> {
        self.run(inputs, opt, false)
    }
}

impl Layer for Interp {
    fn type_name(&self) -> &'static str {
        "Interp"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.params = InterpParams::from_params(params)?;
        self.state = LayerState::Configured;
        Ok(())
    }

    fn create_pipeline(&mut self, opt: &RunOptions) -> Result<(), LayerError> {
        self.state.check_configured()?;
        let dtype = select_dtype(opt, false);
        let table = interp_kernels();
        if ![1, 4, 8].iter().all(|&pack| table.supports(dtype, pack, pack)) {
            return Err(LayerError::UnsupportedType);
        }
        debug!(op = "Interp", %dtype, "created pipeline");
        self.dtype = Some(dtype);
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&self, inputs: &[Mat], opt: &RunOptions) -> Result<OutputList, LayerError> {
        self.run(inputs, opt, true)
    }

    fn destroy_pipeline(&mut self, _opt: &RunOptions) -> Result<(), LayerError> {
        self.dtype = None;
        self.state = LayerState::Unconfigured;
        debug!(op = "Interp", "destroyed pipeline");
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

    use super::{cubic_weights, linear_coeffs, Coeffs, Interp};
    use crate::allocator::system_allocator;
    use crate::allocator::testing::LimitedAllocator;
    use crate::layer::{status_code, Layer, LayerError};
    use crate::mat::Mat;
    use crate::ops::testing::{random_mat, run_layer, unpacked_values};
    use crate::options::RunOptions;
    use crate::packing::convert_packing;
    use crate::param::ParamDict;

    fn params(resize_type: i32, out_w: usize, out_h: usize, align_corner: bool) -> ParamDict {
        ParamDict::new()
            .with_int(0, resize_type)
            .with_int(3, out_h as i32)
            .with_int(4, out_w as i32)
            .with_int(6, align_corner as i32)
    }

    /// Separable resize of unpacked `(w, h, c)` data using the given
    /// coefficients, without any row caching.
    fn reference_resize(
        src: &[f32],
        [w, h, c]: [usize; 3],
        xc: &Coeffs,
        yc: &Coeffs,
    ) -> Vec<f32> {
        let (out_w, out_h) = (xc.base.len(), yc.base.len());
        let mut out = Vec::with_capacity(out_w * out_h * c);
        for q in 0..c {
            for dy in 0..out_h {
                for dx in 0..out_w {
                    let mut sum = 0.;
                    for ky in 0..yc.taps {
                        let sy = yc.source(dy, ky, h);
                        for kx in 0..xc.taps {
                            let sx = xc.source(dx, kx, w);
                            sum += yc.weights[dy][ky]
                                * xc.weights[dx][kx]
                                * src[(q * h + sy) * w + sx];
                        }
                    }
                    out.push(sum);
                }
            }
        }
        out
    }

    #[test]
    fn test_linear_coeffs() {
        // Upscaling 2x with half-pixel centers.
        let c = linear_coeffs(4, 8, false);
        assert_eq!(c.base, [0, 0, 0, 1, 1, 2, 2, 3]);
        assert_eq!(c.weights[0], [1., 0., 0., 0.]);
        assert_eq!(c.weights[1], [0.75, 0.25, 0., 0.]);
        assert_eq!(c.weights[2], [0.25, 0.75, 0., 0.]);
        assert_eq!(c.weights[7], [1., 0., 0., 0.]);

        let aligned = linear_coeffs(2, 3, true);
        assert_eq!(aligned.base, [0, 0, 1]);
        assert_eq!(aligned.weights[1], [0.5, 0.5, 0., 0.]);
    }

    #[test]
    fn test_cubic_weights_sum_to_one() {
        for fx in [0., 0.25, 0.5, 0.9] {
            let sum: f32 = cubic_weights(fx).iter().sum();
            assert!((sum - 1.).abs() < 1e-6);
        }
        assert_eq!(cubic_weights(0.), [0., 1., 0., 0.]);
    }

    #[test]
    fn test_bilinear_pack4() -> Result<(), String> {
        let mut rng = fastrand::Rng::with_seed(1234);
        let src = random_mat(&mut rng, &[4, 4, 8]);
        let opt = RunOptions::default();
        let packed = convert_packing(&src, 4, &opt.workspace_allocator()).map_err(|e| e.to_string())?;
        assert_eq!(packed.elempack(), 4);

        let out = run_layer("Interp", &params(2, 8, 8, false), &[], &[packed], &opt)
            .map_err(|e| e.to_string())?;
        assert_eq!(out[0].elempack(), 4);
        assert_eq!([out[0].w(), out[0].h(), out[0].c()], [8, 8, 2]);

        let (xofs, yofs) = (linear_coeffs(4, 8, false), linear_coeffs(4, 8, false));
        let expected = reference_resize(&src.to_vec().unwrap(), [4, 4, 8], &xofs, &yofs);
        expect_all_close(&unpacked_values(&out[0], &opt), &expected, 1e-5, 1e-6)
    }

    #[test]
    fn test_nearest() -> Result<(), String> {
        let src = Mat::from_f32(&[2, 2, 1], &[1., 2., 3., 4.]).unwrap();
        let params = ParamDict::new().with_int(0, 1).with_float(1, 2.).with_float(2, 2.);
        let opt = RunOptions::default();
        let out = run_layer("Interp", &params, &[], &[src], &opt).map_err(|e| e.to_string())?;
        assert_eq!([out[0].w(), out[0].h()], [4, 4]);
        assert_eq!(
            out[0].to_vec::<f32>().unwrap(),
            [
                1., 1., 2., 2., //
                1., 1., 2., 2., //
                3., 3., 4., 4., //
                3., 3., 4., 4.,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_row_reuse_matches_recompute() {
        #[derive(Debug)]
        struct Case {
            resize_type: i32,
            input: [usize; 3],
            out_wh: [usize; 2],
            align_corner: bool,
        }

        let cases = [
            Case { resize_type: 2, input: [5, 7, 4], out_wh: [11, 16], align_corner: false },
            Case { resize_type: 2, input: [9, 12, 8], out_wh: [4, 5], align_corner: true },
            Case { resize_type: 3, input: [6, 6, 4], out_wh: [13, 15], align_corner: false },
            Case { resize_type: 3, input: [12, 14, 8], out_wh: [5, 6], align_corner: false },
            Case { resize_type: 3, input: [3, 3, 1], out_wh: [7, 7], align_corner: true },
            Case { resize_type: 1, input: [7, 5, 3], out_wh: [3, 9], align_corner: false },
        ];

        cases.test_each(|case| {
            let mut rng = fastrand::Rng::with_seed(1234);
            let src = random_mat(&mut rng, &case.input);
            let opt = RunOptions::default();
            let params = params(case.resize_type, case.out_wh[0], case.out_wh[1], case.align_corner);
            let mut interp = Interp::new();
            interp.load_param(&params).unwrap();
            interp.create_pipeline(&opt).unwrap();

            let reused = interp.forward(&[src.clone()], &opt).unwrap();
            let recomputed = interp.forward_no_reuse(&[src], &opt).unwrap();
            assert_eq!(
                reused[0].to_vec::<f32>().unwrap(),
                recomputed[0].to_vec::<f32>().unwrap()
            );
        });
    }

    #[test]
    fn test_bicubic_matches_reference() -> Result<(), String> {
        let mut rng = fastrand::Rng::with_seed(1234);
        let src = random_mat(&mut rng, &[5, 4, 3]);
        let opt = RunOptions::default();
        let out = run_layer("Interp", &params(3, 9, 7, false), &[], &[src.clone()], &opt)
            .map_err(|e| e.to_string())?;

        // Independent evaluation of the cubic kernel with clamped taps.
        let taps = |size: usize, out_size: usize| -> Coeffs {
            let mut base = Vec::new();
            let mut weights = Vec::new();
            for i in 0..out_size {
                let x = (i as f32 + 0.5) * size as f32 / out_size as f32 - 0.5;
                let sx = x.floor();
                base.push(sx as isize - 1);
                let kernel = |d: f32| {
                    let (a, d) = (-0.75f32, d.abs());
                    if d <= 1. {
                        (a + 2.) * d * d * d - (a + 3.) * d * d + 1.
                    } else if d < 2. {
                        a * d * d * d - 5. * a * d * d + 8. * a * d - 4. * a
                    } else {
                        0.
                    }
                };
                let t = x - sx;
                weights.push([kernel(t + 1.), kernel(t), kernel(1. - t), kernel(2. - t)]);
            }
            Coeffs {
                base,
                weights,
                taps: 4,
            }
        };
        let expected = reference_resize(&src.to_vec().unwrap(), [5, 4, 3], &taps(5, 9), &taps(4, 7));
        expect_all_close(&out[0].to_vec::<f32>().unwrap(), &expected, 1e-4, 1e-5)
    }

    #[test]
    fn test_resize_rows_and_fill() -> Result<(), String> {
        let opt = RunOptions::default();

        // 2D inputs are resized along the width only.
        let rows = Mat::from_f32(&[2, 3], &[0., 1., 2., 3., 4., 5.]).unwrap();
        let out = run_layer("Interp", &params(1, 4, 9, false), &[], &[rows], &opt)
            .map_err(|e| e.to_string())?;
        assert_eq!([out[0].dims(), out[0].w(), out[0].h()], [2, 4, 3]);
        assert_eq!(
            out[0].to_vec::<f32>().unwrap(),
            [0., 0., 1., 1., 2., 2., 3., 3., 4., 4., 5., 5.]
        );

        // 1D inputs are broadcast over planes.
        let values = Mat::from_f32(&[2], &[7., 8.]).unwrap();
        let out = run_layer("Interp", &params(2, 3, 2, false), &[], &[values], &opt)
            .map_err(|e| e.to_string())?;
        assert_eq!([out[0].dims(), out[0].w(), out[0].h(), out[0].c()], [3, 3, 2, 2]);
        assert_eq!(out[0].to_vec::<f32>().unwrap(), [[7.; 6], [8.; 6]].concat());
        Ok(())
    }

    #[test]
    fn test_dynamic_target_size() -> Result<(), String> {
        let mut rng = fastrand::Rng::with_seed(1234);
        let src = random_mat(&mut rng, &[4, 4, 2]);
        let reference = random_mat(&mut rng, &[6, 5, 1]);
        let params = ParamDict::new().with_int(0, 2).with_int(5, 1);
        let opt = RunOptions::default();

        let out = run_layer("Interp", &params, &[], &[src.clone(), reference], &opt)
            .map_err(|e| e.to_string())?;
        assert_eq!([out[0].w(), out[0].h()], [6, 5]);

        let missing = run_layer("Interp", &params, &[], &[src], &opt);
        assert_eq!(missing.err(), Some(LayerError::MissingInputs));
        Ok(())
    }

    #[test]
    fn test_fp16_storage() -> Result<(), String> {
        let mut rng = fastrand::Rng::with_seed(1234);
        let src = random_mat(&mut rng, &[4, 4, 8]);
        let f32_opt = RunOptions::default();
        let fp16_opt = RunOptions {
            use_fp16_storage: true,
            ..RunOptions::default()
        };
        let expected = run_layer("Interp", &params(3, 7, 7, false), &[], &[src.clone()], &f32_opt)
            .map_err(|e| e.to_string())?;
        let out = run_layer("Interp", &params(3, 7, 7, false), &[], &[src], &fp16_opt)
            .map_err(|e| e.to_string())?;
        assert_eq!(out[0].scalar_size(), 2);
        expect_all_close(
            &unpacked_values(&out[0], &fp16_opt),
            &unpacked_values(&expected[0], &f32_opt),
            1e-2,
            1e-2,
        )
    }

    #[test]
    fn test_allocation_failure() {
        let mut rng = fastrand::Rng::with_seed(1234);
        let opt = RunOptions {
            workspace_allocator: Some(Arc::new(LimitedAllocator::new(0))),
            ..RunOptions::default()
        };
        let shapes: [&[usize]; 2] = [&[4, 4, 3], &[4, 4]];
        for shape in shapes {
            let src = random_mat(&mut rng, shape);
            let result = run_layer("Interp", &params(2, 8, 8, false), &[], &[src], &opt);
            assert_eq!(result.as_ref().err(), Some(&LayerError::AllocationFailed));
            assert_eq!(status_code(&result), -100);
        }
    }

    #[test]
    fn test_empty_input() {
        let opt = RunOptions::default();
        let alloc = system_allocator();
        let inputs = [
            Mat::create_3d(0, 2, 1, 4, 1, &alloc).unwrap(),
            Mat::create_3d(2, 0, 1, 4, 1, &alloc).unwrap(),
            Mat::create_2d(0, 3, 4, 1, &alloc).unwrap(),
            Mat::create_1d(0, 4, 1, &alloc).unwrap(),
        ];
        for resize_type in [1, 2, 3] {
            for input in &inputs {
                let result =
                    run_layer("Interp", &params(resize_type, 8, 8, false), &[], &[input.clone()], &opt);
                assert_eq!(
                    result.err(),
                    Some(LayerError::IncompatibleShape("input is empty"))
                );
            }
        }
    }
}
