//! Dynamic symmetric int8 quantization.
//!
//! Values are mapped to `[-127, 127]` using a scale derived from the largest
//! absolute value in each row (or the whole tensor). A row whose absolute
//! maximum is zero, or not finite, gets a scale and descale of zero, so it
//! quantizes to all zeros and dequantizes to exact zeros.

use std::sync::Arc;

use crate::allocator::Allocator;
use crate::mat::{Mat, MatError};

/// Return the largest absolute value in `x`, or 0 for an empty slice.
pub fn absmax(x: &[f32]) -> f32 {
    x.iter().fold(0., |max, x| max.max(x.abs()))
}

/// Return `(scale, descale)` for quantizing values with the given absolute
/// maximum.
pub fn scales_for_absmax(absmax: f32) -> (f32, f32) {
    if absmax > 0. && absmax.is_finite() {
        (127. / absmax, absmax / 127.)
    } else {
        (0., 0.)
    }
}

/// Quantize `x * scale`, rounding half to even and saturating.
#[inline]
pub fn quantize_value(x: f32, scale: f32) -> i8 {
    (x * scale).round_ties_even().clamp(-127., 127.) as i8
}

/// Quantize `src` into `dst` using `scale`.
pub fn quantize_with_scale(src: &[f32], scale: f32, dst: &mut [i8]) {
    debug_assert_eq!(src.len(), dst.len());
    for (x, y) in src.iter().zip(dst) {
        *y = quantize_value(*x, scale);
    }
}

/// Quantize one row and return its descale.
pub fn quantize_row(src: &[f32], dst: &mut [i8]) -> f32 {
    let (scale, descale) = scales_for_absmax(absmax(src));
    quantize_with_scale(src, scale, dst);
    descale
}

/// Quantize consecutive rows of `row_len` values, writing one descale per
/// row to `descales`.
pub fn quantize_rows(src: &[f32], row_len: usize, dst: &mut [i8], descales: &mut [f32]) {
    if row_len == 0 {
        return;
    }
    for ((src, dst), descale) in src
        .chunks(row_len)
        .zip(dst.chunks_mut(row_len))
        .zip(descales.iter_mut())
    {
        *descale = quantize_row(src, dst);
    }
}

/// Quantize weight matrices with one row per output channel.
///
/// Returns the quantized weights and the descale for each output channel.
pub fn quantize_weights_per_row(weights: &[f32], num_output: usize) -> (Vec<i8>, Vec<f32>) {
    let row_len = weights.len().checked_div(num_output).unwrap_or(0);
    let mut quantized = vec![0; weights.len()];
    let mut descales = vec![0.; num_output];
    quantize_rows(weights, row_len, &mut quantized, &mut descales);
    (quantized, descales)
}

/// Quantize a weight matrix with one row per output channel into a 2D tensor
/// of shape `(weights.len() / num_output, num_output)`.
///
/// Returns the tensor and the descale of each row.
pub fn quantize_weight_mat(
    weights: &[f32],
    num_output: usize,
    allocator: &Arc<dyn Allocator>,
) -> Result<(Mat, Vec<f32>), MatError> {
    if num_output == 0 || weights.len() % num_output != 0 {
        return Err(MatError::Shape("weight count is not a multiple of the output count"));
    }
    let (quantized, descales) = quantize_weights_per_row(weights, num_output);
    let mut mat = Mat::create_2d(weights.len() / num_output, num_output, 1, 1, allocator)?;
    mat.data_mut::<i8>()?.copy_from_slice(&quantized);
    Ok((mat, descales))
}

/// Recover approximate float values from `src`.
pub fn dequantize_row(src: &[i8], descale: f32, dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    for (x, y) in src.iter().zip(dst) {
        *y = *x as f32 * descale;
    }
}

/// Quantize an unpacked f32 tensor with a single scale.
///
/// Returns a tensor of the same shape with 1-byte elements, and the descale.
pub fn quantize_tensor(
    src: &Mat,
    allocator: &Arc<dyn Allocator>,
) -> Result<(Mat, f32), MatError> {
    if src.elempack() != 1 {
        return Err(MatError::Shape("int8 quantization needs an unpacked tensor"));
    }
    let mut dst = src.create_like(1, 1, allocator)?;
    if src.is_empty() {
        return Ok((dst, 0.));
    }

    let mut max = 0.0f32;
    for q in 0..src.c() {
        max = max.max(absmax(src.channel_data::<f32>(q)?));
    }
    let (scale, descale) = scales_for_absmax(max);
    for q in 0..src.c() {
        quantize_with_scale(src.channel_data::<f32>(q)?, scale, dst.channel_data_mut::<i8>(q)?);
    }
    Ok((dst, descale))
}

#[cfg(test)]
mod tests {
    use packnn_testing::TestCases;

    use super::{
        absmax, dequantize_row, quantize_row, quantize_tensor, quantize_value,
        quantize_weight_mat, quantize_weights_per_row, scales_for_absmax,
    };
    use crate::allocator::system_allocator;
    use crate::mat::Mat;

    #[test]
    fn test_zero_row_quantizes_to_zero() {
        let src = [0.; 16];
        let mut q = [1i8; 16];
        let descale = quantize_row(&src, &mut q);
        assert_eq!(descale, 0.);
        assert!(q.iter().all(|&x| x == 0));

        let mut back = [f32::NAN; 16];
        dequantize_row(&q, descale, &mut back);
        assert!(back.iter().all(|&x| x == 0. && x.is_finite()));
    }

    #[test]
    fn test_non_finite_absmax() {
        assert_eq!(scales_for_absmax(f32::INFINITY), (0., 0.));
        assert_eq!(scales_for_absmax(f32::NAN), (0., 0.));
        assert_eq!(absmax(&[]), 0.);
    }

    #[test]
    fn test_quantize_value() {
        #[derive(Debug)]
        struct Case {
            x: f32,
            scale: f32,
            expected: i8,
        }

        let cases = [
            Case { x: 0.5, scale: 1., expected: 0 },
            Case { x: 1.5, scale: 1., expected: 2 },
            Case { x: -2.5, scale: 1., expected: -2 },
            Case { x: 1000., scale: 1., expected: 127 },
            Case { x: -1000., scale: 1., expected: -127 },
            Case { x: 1., scale: 127., expected: 127 },
        ];

        cases.test_each(|&Case { x, scale, expected }| {
            assert_eq!(quantize_value(x, scale), expected);
        });
    }

    #[test]
    fn test_round_trip_error() {
        let mut rng = fastrand::Rng::with_seed(1234);
        let src: Vec<f32> = (0..64).map(|_| rng.f32() * 6. - 3.).collect();
        let mut q = vec![0; src.len()];
        let descale = quantize_row(&src, &mut q);
        assert!(q.iter().any(|&x| x.abs() == 127));

        let mut back = vec![0.; src.len()];
        dequantize_row(&q, descale, &mut back);
        for (x, y) in src.iter().zip(&back) {
            assert!((x - y).abs() <= descale * 0.5 + 1e-6);
        }
    }

    #[test]
    fn test_weights_per_row() {
        let weights = [1., -2., 0., 0., 0.5, 0.25];
        let (q, descales) = quantize_weights_per_row(&weights, 3);
        assert_eq!(q, [64, -127, 0, 0, 127, 64]);
        assert_eq!(descales, [2. / 127., 0., 0.5 / 127.]);
    }

    #[test]
    fn test_quantize_weight_mat() {
        let weights = [1., -2., 0., 0., 0.5, 0.25];
        let (mat, descales) = quantize_weight_mat(&weights, 3, &system_allocator()).unwrap();
        assert_eq!((mat.w(), mat.h()), (2, 3));
        assert_eq!(mat.row::<i8>(2).unwrap(), &[127, 64]);
        assert_eq!(descales.len(), 3);
        assert!(quantize_weight_mat(&weights, 4, &system_allocator()).is_err());
    }

    #[test]
    fn test_quantize_tensor() {
        let src = Mat::from_f32(&[2, 1, 2], &[1., -4., 2., 0.]).unwrap();
        let (q, descale) = quantize_tensor(&src, &system_allocator()).unwrap();
        assert_eq!(q.elemsize(), 1);
        assert_eq!(q.to_vec::<i8>().unwrap(), [32, -127, 64, 0]);
        assert_eq!(descale, 4. / 127.);
    }
}
