//! Element types that can be stored in untyped tensor buffers.

use crate::half::{Bf16, F16};

/// Plain-old-data types which can be viewed as, and created from, raw bytes.
///
/// # Safety
///
/// Implementations must be `Copy` types with no padding and no invalid bit
/// patterns, so that any suitably aligned byte slice can be reinterpreted as
/// a slice of `Self`.
pub unsafe trait Element: Copy + Default + Send + Sync + 'static {}

unsafe impl Element for f32 {}
unsafe impl Element for i32 {}
unsafe impl Element for u32 {}
unsafe impl Element for i16 {}
unsafe impl Element for u16 {}
unsafe impl Element for i8 {}
unsafe impl Element for u8 {}
unsafe impl Element for F16 {}
unsafe impl Element for Bf16 {}

/// Reinterpret a byte slice as a slice of `T`.
///
/// Returns `None` if the slice is misaligned for `T` or its length is not a
/// multiple of `size_of::<T>()`.
pub fn cast_slice<T: Element>(bytes: &[u8]) -> Option<&[T]> {
    if bytes.is_empty() {
        return Some(&[]);
    }
    let size = size_of::<T>();
    if bytes.len() % size != 0 || bytes.as_ptr() as usize % align_of::<T>() != 0 {
        return None;
    }
    // Safety: Alignment and length were checked above and `T: Element` has no
    // invalid bit patterns.
    Some(unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, bytes.len() / size) })
}

/// Mutable variant of [`cast_slice`].
pub fn cast_slice_mut<T: Element>(bytes: &mut [u8]) -> Option<&mut [T]> {
    if bytes.is_empty() {
        return Some(&mut []);
    }
    let size = size_of::<T>();
    if bytes.len() % size != 0 || bytes.as_ptr() as usize % align_of::<T>() != 0 {
        return None;
    }
    // Safety: See `cast_slice`.
    Some(unsafe {
        std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, bytes.len() / size)
    })
}

/// View a slice of elements as bytes.
pub fn as_bytes<T: Element>(data: &[T]) -> &[u8] {
    // Safety: `T: Element` has no padding bytes.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}
