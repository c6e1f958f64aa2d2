//! Conversion between channel packing layouts.
//!
//! In a packed tensor, `elempack` consecutive logical channels are
//! interleaved so that one stored element holds one lane from each. The
//! packed axis is the outermost one: `w` for 1D tensors, `h` for 2D and `c`
//! for 3D and 4D tensors.

use std::sync::Arc;

use packnn_base::Element;

use crate::allocator::Allocator;
use crate::cpu::CpuFeatures;
use crate::mat::{Mat, MatError};

/// Choose the packing for an axis with `channels` logical channels.
///
/// Returns 8 if `channels` is a multiple of 8 and the CPU has 8-lane
/// registers, otherwise 4 if it is a multiple of 4, otherwise 1. Layers use
/// this both when packing weights and when repacking inputs, so the two
/// always agree.
pub fn select_elempack(channels: usize, features: &CpuFeatures, use_packing_layout: bool) -> usize {
    if !use_packing_layout || channels == 0 {
        1
    } else if channels % 8 == 0 && features.max_elempack() >= 8 {
        8
    } else if channels % 4 == 0 {
        4
    } else {
        1
    }
}

/// Number of units along the packed axis, elements per unit and the
/// distance between units, in elements.
fn packed_axis(mat: &Mat) -> (usize, usize, usize) {
    match mat.dims() {
        1 => (mat.w(), 1, 1),
        2 => (mat.h(), mat.w(), mat.w()),
        _ => (mat.c(), mat.plane_len(), mat.cstep()),
    }
}

fn repack<T: Element>(src: &Mat, dst: &mut Mat) -> Result<(), MatError> {
    let (src_pack, dst_pack) = (src.elempack(), dst.elempack());
    let (src_units, plane, src_step) = packed_axis(src);
    let (_, _, dst_step) = packed_axis(dst);

    let src_data = src.data::<T>()?;
    let dst_data = dst.data_mut::<T>()?;

    for ch in 0..src_units * src_pack {
        let (sq, sl) = (ch / src_pack, ch % src_pack);
        let (dq, dl) = (ch / dst_pack, ch % dst_pack);
        for i in 0..plane {
            dst_data[(dq * dst_step + i) * dst_pack + dl] =
                src_data[(sq * src_step + i) * src_pack + sl];
        }
    }
    Ok(())
}

/// Return `src` rearranged to use `out_elempack` lanes per element.
///
/// If the number of logical channels is not a multiple of `out_elempack`, the
/// result is unpacked instead. When no conversion is needed the result is
/// another handle to `src`.
pub fn convert_packing(
    src: &Mat,
    out_elempack: usize,
    allocator: &Arc<dyn Allocator>,
) -> Result<Mat, MatError> {
    let channels = src.logical_channels();
    let out_elempack = if out_elempack > 0 && channels % out_elempack == 0 {
        out_elempack
    } else {
        1
    };
    if src.is_empty() || out_elempack == src.elempack() {
        return Ok(src.clone());
    }

    let scalar_size = src.scalar_size();
    let mut dst = src.create_like(scalar_size * out_elempack, out_elempack, allocator)?;
    match scalar_size {
        1 => repack::<i8>(src, &mut dst)?,
        2 => repack::<u16>(src, &mut dst)?,
        4 => repack::<f32>(src, &mut dst)?,
        _ => return Err(MatError::Shape("unsupported scalar size")),
    }
    Ok(dst)
}

/// Padding added on each side of the spatial plane.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Border {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Border {
    pub fn is_empty(&self) -> bool {
        *self == Border::default()
    }
}

/// Return a copy of a 2D or 3D tensor padded with `value` around each
/// channel plane.
///
/// For 2D tensors only the left and right padding apply, as rows are the
/// packed axis. `value` is stored in every lane of every padding element.
pub fn copy_make_border<T: Element>(
    src: &Mat,
    border: Border,
    value: T,
    allocator: &Arc<dyn Allocator>,
) -> Result<Mat, MatError> {
    if border.is_empty() {
        return Ok(src.clone());
    }
    let pack = src.elempack();
    let elemsize = src.elemsize();
    let w = src.w() + border.left + border.right;
    let (src_row, dst_row) = (src.w() * pack, w * pack);

    if src.dims() == 2 {
        let mut dst = Mat::create_2d(w, src.h(), elemsize, pack, allocator)?;
        dst.fill(value)?;
        let src_data = src.data::<T>()?;
        let dst_data = dst.data_mut::<T>()?;
        for y in 0..src.h() {
            let out = y * dst_row + border.left * pack;
            dst_data[out..out + src_row].copy_from_slice(&src_data[y * src_row..(y + 1) * src_row]);
        }
        return Ok(dst);
    }
    if src.dims() != 3 {
        return Err(MatError::Shape("border padding needs a 2D or 3D tensor"));
    }

    let h = src.h() + border.top + border.bottom;
    let mut dst = Mat::create_3d(w, h, src.c(), elemsize, pack, allocator)?;
    dst.fill(value)?;
    for q in 0..src.c() {
        let src_plane = src.channel_data::<T>(q)?;
        let dst_plane = dst.channel_data_mut::<T>(q)?;
        for y in 0..src.h() {
            let out = (y + border.top) * dst_row + border.left * pack;
            dst_plane[out..out + src_row].copy_from_slice(&src_plane[y * src_row..(y + 1) * src_row]);
        }
    }
    Ok(dst)
}
