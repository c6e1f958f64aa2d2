//! Conversion of tensors between f32 and 16-bit float storage.

use std::sync::Arc;

use packnn_base::{Bf16, Element, F16};

use crate::allocator::Allocator;
#[cfg(target_arch = "x86_64")]
use crate::cpu::cpu_features;
use crate::mat::{Mat, MatError};

/// Convert f32 values to f16, rounding to nearest even.
///
/// `src` and `dst` must have the same length.
pub fn f32_to_f16_slice(src: &[f32], dst: &mut [F16]) {
    assert_eq!(src.len(), dst.len());

    #[cfg(target_arch = "x86_64")]
    if cpu_features().f16c {
        // Safety: F16C is supported.
        return unsafe { x86_f16c::f32_to_f16(src, dst) };
    }

    for (x, y) in src.iter().zip(dst) {
        *y = F16::from_f32(*x);
    }
}

/// Convert f16 values to f32.
///
/// `src` and `dst` must have the same length.
pub fn f16_to_f32_slice(src: &[F16], dst: &mut [f32]) {
    assert_eq!(src.len(), dst.len());

    #[cfg(target_arch = "x86_64")]
    if cpu_features().f16c {
        // Safety: F16C is supported.
        return unsafe { x86_f16c::f16_to_f32(src, dst) };
    }

    for (x, y) in src.iter().zip(dst) {
        *y = x.to_f32();
    }
}

#[cfg(target_arch = "x86_64")]
mod x86_f16c {
    use std::arch::x86_64::{
        __m128i, _mm256_cvtph_ps, _mm256_cvtps_ph, _mm256_loadu_ps, _mm256_storeu_ps,
        _mm_loadu_si128, _mm_storeu_si128, _MM_FROUND_TO_NEAREST_INT,
    };

    use packnn_base::F16;

    #[target_feature(enable = "avx")]
    #[target_feature(enable = "f16c")]
    pub unsafe fn f32_to_f16(src: &[f32], dst: &mut [F16]) {
        let n = src.len() / 8 * 8;
        for i in (0..n).step_by(8) {
            let x = _mm256_loadu_ps(src.as_ptr().add(i));
            let y = _mm256_cvtps_ph::<_MM_FROUND_TO_NEAREST_INT>(x);
            _mm_storeu_si128(dst.as_mut_ptr().add(i) as *mut __m128i, y);
        }
        for i in n..src.len() {
            dst[i] = F16::from_f32(src[i]);
        }
    }

    #[target_feature(enable = "avx")]
    #[target_feature(enable = "f16c")]
    pub unsafe fn f16_to_f32(src: &[F16], dst: &mut [f32]) {
        let n = src.len() / 8 * 8;
        for i in (0..n).step_by(8) {
            let x = _mm_loadu_si128(src.as_ptr().add(i) as *const __m128i);
            _mm256_storeu_ps(dst.as_mut_ptr().add(i), _mm256_cvtph_ps(x));
        }
        for i in n..src.len() {
            dst[i] = src[i].to_f32();
        }
    }
}

/// Create a tensor with the shape and packing of `src` and a scalar type of
/// `T`, then fill each channel plane using `convert`.
fn map_channels<S: Element, T: Element>(
    src: &Mat,
    allocator: &Arc<dyn Allocator>,
    convert: impl Fn(&[S], &mut [T]),
) -> Result<Mat, MatError> {
    let pack = src.elempack();
    let mut dst = src.create_like(size_of::<T>() * pack, pack, allocator)?;
    if src.is_empty() {
        return Ok(dst);
    }
    for q in 0..src.c() {
        convert(src.channel_data::<S>(q)?, dst.channel_data_mut::<T>(q)?);
    }
    Ok(dst)
}

/// Convert an f32 tensor to f16 storage, keeping its shape and packing.
pub fn cast_to_float16(src: &Mat, allocator: &Arc<dyn Allocator>) -> Result<Mat, MatError> {
    map_channels::<f32, F16>(src, allocator, f32_to_f16_slice)
}

/// Convert an f16 tensor to f32, keeping its shape and packing.
pub fn cast_from_float16(src: &Mat, allocator: &Arc<dyn Allocator>) -> Result<Mat, MatError> {
    map_channels::<F16, f32>(src, allocator, f16_to_f32_slice)
}

/// Convert an f32 tensor to bf16 storage, keeping its shape and packing.
pub fn cast_to_bfloat16(src: &Mat, allocator: &Arc<dyn Allocator>) -> Result<Mat, MatError> {
    map_channels::<f32, Bf16>(src, allocator, |src, dst| {
        for (x, y) in src.iter().zip(dst) {
            *y = Bf16::from_f32(*x);
        }
    })
}

/// Convert a bf16 tensor to f32, keeping its shape and packing.
pub fn cast_from_bfloat16(src: &Mat, allocator: &Arc<dyn Allocator>) -> Result<Mat, MatError> {
    map_channels::<Bf16, f32>(src, allocator, |src, dst| {
        for (x, y) in src.iter().zip(dst) {
            *y = x.to_f32();
        }
    })
}

#[cfg(test)]
mod tests {
    use packnn_base::F16;
    use packnn_testing::TestCases;

    use super::{
        cast_from_bfloat16, cast_from_float16, cast_to_bfloat16, cast_to_float16,
        f16_to_f32_slice, f32_to_f16_slice,
    };
    use crate::allocator::system_allocator;
    use crate::mat::Mat;
    use crate::packing::convert_packing;

    #[test]
    fn test_slice_conversion_matches_scalar() {
        #[derive(Debug)]
        struct Case {
            len: usize,
        }

        let cases = [0, 1, 7, 8, 9, 33].map(|len| Case { len });

        cases.test_each(|&Case { len }| {
            let mut rng = fastrand::Rng::with_seed(1234);
            let src: Vec<f32> = (0..len).map(|_| (rng.f32() - 0.5) * 1000.).collect();

            let mut half = vec![F16::default(); len];
            f32_to_f16_slice(&src, &mut half);
            let expected: Vec<F16> = src.iter().map(|&x| F16::from_f32(x)).collect();
            assert_eq!(half, expected);

            let mut back = vec![0.; len];
            f16_to_f32_slice(&half, &mut back);
            let expected: Vec<f32> = half.iter().map(|x| x.to_f32()).collect();
            assert_eq!(back, expected);
        });
    }

    #[test]
    fn test_tensor_casts_preserve_shape() {
        let alloc = system_allocator();
        let mut rng = fastrand::Rng::with_seed(1234);
        let data: Vec<f32> = (0..5 * 3 * 8).map(|_| rng.f32() * 4. - 2.).collect();
        let src = Mat::from_f32(&[5, 3, 8], &data).unwrap();
        let src = convert_packing(&src, 4, &alloc).unwrap();

        let half = cast_to_float16(&src, &alloc).unwrap();
        assert_eq!(half.elemsize(), 8);
        assert_eq!(half.elempack(), 4);
        assert_eq!((half.w(), half.h(), half.c()), (5, 3, 2));

        let back = cast_from_float16(&half, &alloc).unwrap();
        assert!(back.same_shape(&src));
        for (x, y) in src.to_vec::<f32>().unwrap().iter().zip(back.to_vec::<f32>().unwrap()) {
            assert!((x - y).abs() <= x.abs() * (2.0f32).powi(-10));
        }

        let bf = cast_to_bfloat16(&src, &alloc).unwrap();
        assert_eq!(bf.elemsize(), 8);
        let back = cast_from_bfloat16(&bf, &alloc).unwrap();
        for (x, y) in src.to_vec::<f32>().unwrap().iter().zip(back.to_vec::<f32>().unwrap()) {
            assert!((x - y).abs() <= x.abs() * (2.0f32).powi(-7));
        }
    }
}
