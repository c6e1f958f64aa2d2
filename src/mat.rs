//! The [`Mat`] tensor type.
//!
//! A `Mat` is a handle to a reference-counted buffer plus a description of
//! the data it holds: up to four dimensions (width, height, depth, channels),
//! the size of each stored element and the number of logical channels packed
//! into each element.
//!
//! Cloning a `Mat` with [`Clone::clone`] produces another handle to the same
//! buffer, as do views such as [`Mat::channel`] and [`Mat::reshape_2d`]. There
//! is no copy-on-write. Mutable access to the data is only granted when the
//! handle is the sole owner of its buffer; use [`Mat::deep_clone`] to get an
//! independently mutable copy.

use std::error::Error;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use packnn_base::elem::{cast_slice, cast_slice_mut};
use packnn_base::Element;

use crate::allocator::{system_allocator, AllocError, Allocator};

/// Owned allocation from an [`Allocator`], released when dropped.
struct RawBuffer {
    ptr: NonNull<u8>,
    len: usize,
    allocator: Arc<dyn Allocator>,
}

impl RawBuffer {
    fn new(len: usize, allocator: Arc<dyn Allocator>) -> Result<RawBuffer, AllocError> {
        let ptr = allocator.allocate(len).ok_or(AllocError { bytes: len })?;

        // Safety: `ptr` is valid for writes of `len` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, len) };

        Ok(RawBuffer {
            ptr,
            len,
            allocator,
        })
    }

    fn as_bytes(&self) -> &[u8] {
        // Safety: `ptr` points to an initialized allocation of `len` bytes
        // owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: See `as_bytes`. `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        // Safety: The buffer was allocated from `allocator` with size `len`.
        unsafe { self.allocator.release(self.ptr, self.len) }
    }
}

// Safety: RawBuffer uniquely owns its allocation and only hands out access
// through `&self` / `&mut self`.
unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

/// Errors from accessing or transforming a [`Mat`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatError {
    /// Allocating storage failed.
    Alloc(AllocError),

    /// Mutable access was requested but the buffer is shared with other
    /// handles.
    Shared,

    /// The requested element type does not match the element size and
    /// packing of the tensor.
    ElemType {
        type_size: usize,
        elemsize: usize,
        elempack: usize,
    },

    /// A shape is invalid for the requested operation.
    Shape(&'static str),
}

impl fmt::Display for MatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatError::Alloc(err) => write!(f, "{}", err),
            MatError::Shared => write!(f, "buffer is shared with other handles"),
            MatError::ElemType {
                type_size,
                elemsize,
                elempack,
            } => write!(
                f,
                "element type of size {} does not match elemsize {} with elempack {}",
                type_size, elemsize, elempack
            ),
            MatError::Shape(msg) => write!(f, "invalid shape: {}", msg),
        }
    }
}

impl Error for MatError {}

impl From<AllocError> for MatError {
    fn from(err: AllocError) -> MatError {
        MatError::Alloc(err)
    }
}

/// Compute the channel step, in elements, for a tensor shape.
///
/// Channel planes of 3D and 4D tensors start on 16-byte boundaries.
fn channel_step(dims: usize, w: usize, h: usize, d: usize, elemsize: usize) -> usize {
    if dims >= 3 && elemsize > 0 {
        (w * h * d * elemsize).next_multiple_of(16) / elemsize
    } else {
        w * h * d
    }
}

/// A tensor of up to four dimensions with optional channel packing.
#[derive(Clone, Default)]
pub struct Mat {
    data: Option<Arc<RawBuffer>>,

    /// Offset of this view's first byte within `data`.
    offset: usize,

    dims: usize,
    w: usize,
    h: usize,
    d: usize,
    c: usize,

    /// Size of one stored element in bytes. For packed tensors this covers
    /// all lanes, eg. 16 for pack 4 f32.
    elemsize: usize,

    /// Number of logical channels (or rows, for 2D tensors) interleaved in
    /// each stored element.
    elempack: usize,

    /// Distance between channel planes, in elements.
    cstep: usize,
}

impl Mat {
    /// Return an empty tensor with no storage.
    pub fn empty() -> Mat {
        Mat::default()
    }

    fn create(
        dims: usize,
        [w, h, d, c]: [usize; 4],
        elemsize: usize,
        elempack: usize,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Mat, AllocError> {
        let cstep = channel_step(dims, w, h, d, elemsize);
        let bytes = cstep * c * elemsize;
        let data = if bytes == 0 {
            None
        } else {
            Some(Arc::new(RawBuffer::new(bytes, allocator.clone())?))
        };
        Ok(Mat {
            data,
            offset: 0,
            dims,
            w,
            h,
            d,
            c,
            elemsize,
            elempack,
            cstep,
        })
    }

    /// Allocate a zero-filled 1D tensor.
    pub fn create_1d(
        w: usize,
        elemsize: usize,
        elempack: usize,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Mat, AllocError> {
        Self::create(1, [w, 1, 1, 1], elemsize, elempack, allocator)
    }

    /// Allocate a zero-filled 2D tensor.
    pub fn create_2d(
        w: usize,
        h: usize,
        elemsize: usize,
        elempack: usize,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Mat, AllocError> {
        Self::create(2, [w, h, 1, 1], elemsize, elempack, allocator)
    }

    /// Allocate a zero-filled 3D tensor.
    pub fn create_3d(
        w: usize,
        h: usize,
        c: usize,
        elemsize: usize,
        elempack: usize,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Mat, AllocError> {
        Self::create(3, [w, h, 1, c], elemsize, elempack, allocator)
    }

    /// Allocate a zero-filled 4D tensor.
    pub fn create_4d(
        w: usize,
        h: usize,
        d: usize,
        c: usize,
        elemsize: usize,
        elempack: usize,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Mat, AllocError> {
        Self::create(4, [w, h, d, c], elemsize, elempack, allocator)
    }

    /// Allocate a zero-filled tensor with the same shape as `self` but a
    /// different element size and packing.
    ///
    /// `elempack` must divide (or be a multiple of) the current packing such
    /// that the packed axis remains whole; the packed axis extent is scaled
    /// accordingly.
    pub fn create_like(
        &self,
        elemsize: usize,
        elempack: usize,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Mat, AllocError> {
        let [mut w, mut h, d, mut c] = [self.w, self.h, self.d, self.c];
        let logical = |n: usize| n * self.elempack / elempack.max(1);
        match self.dims {
            1 => w = logical(w),
            2 => h = logical(h),
            3 | 4 => c = logical(c),
            _ => {}
        }
        Self::create(self.dims, [w, h, d, c], elemsize, elempack, allocator)
    }

    /// Create an unpacked f32 tensor from a slice of values in `c, d, h, w`
    /// order.
    ///
    /// The length of `data` must equal the product of `shape`. The number of
    /// dimensions is the length of `shape`, given in `[w, h, d, c]` order.
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Result<Mat, MatError> {
        let alloc = system_allocator();
        let mut mat = match *shape {
            [w] => Mat::create_1d(w, 4, 1, &alloc)?,
            [w, h] => Mat::create_2d(w, h, 4, 1, &alloc)?,
            [w, h, c] => Mat::create_3d(w, h, c, 4, 1, &alloc)?,
            [w, h, d, c] => Mat::create_4d(w, h, d, c, 4, 1, &alloc)?,
            _ => return Err(MatError::Shape("expected 1 to 4 dimensions")),
        };
        if data.len() != shape.iter().product::<usize>() {
            return Err(MatError::Shape("data length does not match shape"));
        }
        let plane = mat.plane_len();
        for q in 0..mat.c {
            mat.channel_data_mut::<f32>(q)?
                .copy_from_slice(&data[q * plane..(q + 1) * plane]);
        }
        Ok(mat)
    }

    /// Number of dimensions, or 0 for an empty tensor.
    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn w(&self) -> usize {
        self.w
    }

    pub fn h(&self) -> usize {
        self.h
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn c(&self) -> usize {
        self.c
    }

    pub fn elemsize(&self) -> usize {
        self.elemsize
    }

    pub fn elempack(&self) -> usize {
        self.elempack
    }

    /// Distance between channel planes, in elements.
    pub fn cstep(&self) -> usize {
        self.cstep
    }

    /// Size in bytes of one scalar lane.
    pub fn scalar_size(&self) -> usize {
        self.elemsize / self.elempack.max(1)
    }

    /// Number of stored elements in one channel plane, excluding padding.
    pub fn plane_len(&self) -> usize {
        self.w * self.h * self.d
    }

    /// Number of stored elements, including padding between channel planes.
    pub fn total(&self) -> usize {
        self.cstep * self.c
    }

    /// Extent of the packed axis in logical (unpacked) units.
    pub fn logical_channels(&self) -> usize {
        let packed = match self.dims {
            1 => self.w,
            2 => self.h,
            _ => self.c,
        };
        packed * self.elempack
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none() || self.total() == 0
    }

    /// Return true if `self` and `other` have the same dimensions, element
    /// size and packing.
    pub fn same_shape(&self, other: &Mat) -> bool {
        self.dims == other.dims
            && self.w == other.w
            && self.h == other.h
            && self.d == other.d
            && self.c == other.c
            && self.elemsize == other.elemsize
            && self.elempack == other.elempack
    }

    /// Return true if `self` and `other` are views of the same buffer.
    pub fn shares_storage(&self, other: &Mat) -> bool {
        match (&self.data, &other.data) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Return the allocator that owns this tensor's buffer, or the system
    /// allocator for an empty tensor.
    pub fn allocator(&self) -> Arc<dyn Allocator> {
        self.data
            .as_ref()
            .map(|buf| buf.allocator.clone())
            .unwrap_or_else(system_allocator)
    }

    fn byte_len(&self) -> usize {
        if self.dims <= 2 {
            self.w * self.h * self.elemsize
        } else {
            self.cstep * self.c * self.elemsize
        }
    }

    fn check_elem<T: Element>(&self) -> Result<(), MatError> {
        if size_of::<T>() * self.elempack != self.elemsize {
            return Err(MatError::ElemType {
                type_size: size_of::<T>(),
                elemsize: self.elemsize,
                elempack: self.elempack,
            });
        }
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        match &self.data {
            Some(buf) => &buf.as_bytes()[self.offset..self.offset + self.byte_len()],
            None => &[],
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8], MatError> {
        let (offset, len) = (self.offset, self.byte_len());
        match &mut self.data {
            Some(buf) => {
                let buf = Arc::get_mut(buf).ok_or(MatError::Shared)?;
                Ok(&mut buf.as_bytes_mut()[offset..offset + len])
            }
            None => Ok(&mut []),
        }
    }

    /// Return the tensor's data as a slice of scalars.
    ///
    /// The slice includes any padding between channel planes. The scalars
    /// for channel `q` start at `q * cstep * elempack`.
    pub fn data<T: Element>(&self) -> Result<&[T], MatError> {
        self.check_elem::<T>()?;
        cast_slice(self.bytes()).ok_or(MatError::Shape("misaligned view"))
    }

    /// Return the tensor's data as a mutable slice of scalars.
    ///
    /// Fails with [`MatError::Shared`] if other handles reference the buffer.
    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T], MatError> {
        self.check_elem::<T>()?;
        cast_slice_mut(self.bytes_mut()?).ok_or(MatError::Shape("misaligned view"))
    }

    /// Return the scalars of channel `q`, excluding padding.
    pub fn channel_data<T: Element>(&self, q: usize) -> Result<&[T], MatError> {
        let (start, len) = self.channel_span(q)?;
        Ok(&self.data::<T>()?[start..start + len])
    }

    /// Return the scalars of channel `q` mutably, excluding padding.
    pub fn channel_data_mut<T: Element>(&mut self, q: usize) -> Result<&mut [T], MatError> {
        let (start, len) = self.channel_span(q)?;
        Ok(&mut self.data_mut::<T>()?[start..start + len])
    }

    fn channel_span(&self, q: usize) -> Result<(usize, usize), MatError> {
        if q >= self.c {
            return Err(MatError::Shape("channel index out of range"));
        }
        let plane = self.plane_len() * self.elempack;
        Ok((q * self.cstep * self.elempack, plane))
    }

    /// Return the scalars of row `y` of a 1D or 2D tensor.
    pub fn row<T: Element>(&self, y: usize) -> Result<&[T], MatError> {
        if self.dims > 2 || y >= self.h {
            return Err(MatError::Shape("row index out of range"));
        }
        let row_len = self.w * self.elempack;
        Ok(&self.data::<T>()?[y * row_len..(y + 1) * row_len])
    }

    /// Fill every element, including channel padding, with `value`.
    pub fn fill<T: Element>(&mut self, value: T) -> Result<(), MatError> {
        self.data_mut::<T>()?.fill(value);
        Ok(())
    }

    /// Return a view of channel `q`.
    ///
    /// For a 3D tensor this is a 2D tensor of shape `(w, h)`. For a 4D tensor
    /// this is a 3D tensor of shape `(w, h, d)`.
    pub fn channel(&self, q: usize) -> Result<Mat, MatError> {
        if self.dims < 3 || q >= self.c {
            return Err(MatError::Shape("channel index out of range"));
        }
        let offset = self.offset + q * self.cstep * self.elemsize;
        Ok(if self.dims == 4 {
            Mat {
                data: self.data.clone(),
                offset,
                dims: 3,
                c: self.d,
                d: 1,
                cstep: self.w * self.h,
                ..*self
            }
        } else {
            Mat {
                data: self.data.clone(),
                offset,
                dims: 2,
                c: 1,
                cstep: self.w * self.h,
                ..*self
            }
        })
    }

    /// Return a view of channels `q..q + n`.
    pub fn channel_range(&self, q: usize, n: usize) -> Result<Mat, MatError> {
        if self.dims < 3 || q + n > self.c {
            return Err(MatError::Shape("channel range out of bounds"));
        }
        Ok(Mat {
            data: self.data.clone(),
            offset: self.offset + q * self.cstep * self.elemsize,
            c: n,
            ..*self
        })
    }

    /// Return a view of rows `y..y + n` of a 2D tensor.
    pub fn row_range(&self, y: usize, n: usize) -> Result<Mat, MatError> {
        if self.dims != 2 || y + n > self.h {
            return Err(MatError::Shape("row range out of bounds"));
        }
        Ok(Mat {
            data: self.data.clone(),
            offset: self.offset + y * self.w * self.elemsize,
            h: n,
            cstep: self.w * n,
            ..*self
        })
    }

    /// Return true if the element data has no padding between channels.
    fn is_contiguous(&self) -> bool {
        self.dims <= 2 || self.c <= 1 || self.cstep == self.plane_len()
    }

    fn reshape(&self, dims: usize, shape: [usize; 4]) -> Result<Mat, MatError> {
        let [w, h, d, c] = shape;
        if w * h * d * c != self.plane_len() * self.c {
            return Err(MatError::Shape("reshape changes the element count"));
        }
        // A single channel plane needs no trailing padding.
        let cstep = if c == 1 {
            w * h * d
        } else {
            channel_step(dims, w, h, d, self.elemsize)
        };

        // Adding or removing a unit axis within the plane keeps the channel
        // layout unchanged.
        let same_planes =
            self.dims >= 3 && dims >= 3 && c == self.c && cstep == self.cstep;

        if same_planes || (self.is_contiguous() && (dims <= 2 || cstep == w * h * d)) {
            return Ok(Mat {
                data: self.data.clone(),
                offset: self.offset,
                dims,
                w,
                h,
                d,
                c,
                cstep,
                ..*self
            });
        }

        // Layout differs in channel padding, so copy plane by plane.
        let mut flat = Vec::with_capacity(self.plane_len() * self.c * self.elemsize);
        let bytes = self.bytes();
        let src_plane = self.plane_len() * self.elemsize;
        for q in 0..self.c {
            let start = q * self.cstep * self.elemsize;
            flat.extend_from_slice(&bytes[start..start + src_plane]);
        }

        let mut out = Mat::create(dims, shape, self.elemsize, self.elempack, &self.allocator())?;
        let dst_plane = out.plane_len() * out.elemsize;
        let dst_cstep = out.cstep * out.elemsize;
        let dst = out.bytes_mut()?;
        for q in 0..c {
            dst[q * dst_cstep..q * dst_cstep + dst_plane]
                .copy_from_slice(&flat[q * dst_plane..(q + 1) * dst_plane]);
        }
        Ok(out)
    }

    /// Reshape to a 1D tensor of `w` elements.
    pub fn reshape_1d(&self, w: usize) -> Result<Mat, MatError> {
        self.reshape(1, [w, 1, 1, 1])
    }

    /// Reshape to a 2D tensor.
    pub fn reshape_2d(&self, w: usize, h: usize) -> Result<Mat, MatError> {
        self.reshape(2, [w, h, 1, 1])
    }

    /// Reshape to a 3D tensor.
    pub fn reshape_3d(&self, w: usize, h: usize, c: usize) -> Result<Mat, MatError> {
        self.reshape(3, [w, h, 1, c])
    }

    /// Reshape to a 4D tensor.
    pub fn reshape_4d(&self, w: usize, h: usize, d: usize, c: usize) -> Result<Mat, MatError> {
        self.reshape(4, [w, h, d, c])
    }

    /// Copy the tensor into a new, uniquely owned buffer from `allocator`.
    pub fn deep_clone(&self, allocator: &Arc<dyn Allocator>) -> Result<Mat, MatError> {
        let mut out = Mat::create(
            self.dims,
            [self.w, self.h, self.d, self.c],
            self.elemsize,
            self.elempack,
            allocator,
        )?;
        let plane = self.plane_len() * self.elemsize;
        let (src_step, dst_step) = (self.cstep * self.elemsize, out.cstep * out.elemsize);
        let src = self.bytes();
        let dst = out.bytes_mut()?;
        for q in 0..self.c {
            dst[q * dst_step..q * dst_step + plane]
                .copy_from_slice(&src[q * src_step..q * src_step + plane]);
        }
        Ok(out)
    }

    /// Return the data as a vector of scalars with channel padding removed.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, MatError> {
        let mut out = Vec::with_capacity(self.plane_len() * self.elempack * self.c);
        for q in 0..self.c {
            out.extend_from_slice(self.channel_data::<T>(q)?);
        }
        Ok(out)
    }
}

impl fmt::Debug for Mat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mat")
            .field("dims", &self.dims)
            .field("w", &self.w)
            .field("h", &self.h)
            .field("d", &self.d)
            .field("c", &self.c)
            .field("elemsize", &self.elemsize)
            .field("elempack", &self.elempack)
            .field("cstep", &self.cstep)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use packnn_testing::TestCases;

    use super::{Mat, MatError};
    use crate::allocator::testing::LimitedAllocator;
    use crate::allocator::{system_allocator, AllocError, Allocator};

    fn iota(n: usize) -> Vec<f32> {
        (0..n).map(|x| x as f32).collect()
    }

    #[test]
    fn test_create_shapes() {
        #[derive(Debug)]
        struct Case {
            shape: Vec<usize>,
            elemsize: usize,
            elempack: usize,
            dims: usize,
            cstep: usize,
        }

        let cases = [
            Case {
                shape: vec![10],
                elemsize: 4,
                elempack: 1,
                dims: 1,
                cstep: 10,
            },
            Case {
                shape: vec![3, 5],
                elemsize: 16,
                elempack: 4,
                dims: 2,
                cstep: 15,
            },
            // 3 * 3 * 4 bytes = 36, rounded up to 48 bytes per channel.
            Case {
                shape: vec![3, 3, 2],
                elemsize: 4,
                elempack: 1,
                dims: 3,
                cstep: 12,
            },
            // f16 pack 8 elements are 16 bytes, so no padding is needed.
            Case {
                shape: vec![3, 3, 2],
                elemsize: 16,
                elempack: 8,
                dims: 3,
                cstep: 9,
            },
            Case {
                shape: vec![2, 3, 5, 2],
                elemsize: 4,
                elempack: 1,
                dims: 4,
                cstep: 32,
            },
        ];

        cases.test_each(|case| {
            let alloc = system_allocator();
            let (elemsize, elempack) = (case.elemsize, case.elempack);
            let mat = match case.shape[..] {
                [w] => Mat::create_1d(w, elemsize, elempack, &alloc),
                [w, h] => Mat::create_2d(w, h, elemsize, elempack, &alloc),
                [w, h, c] => Mat::create_3d(w, h, c, elemsize, elempack, &alloc),
                [w, h, d, c] => Mat::create_4d(w, h, d, c, elemsize, elempack, &alloc),
                _ => unreachable!(),
            }
            .unwrap();
            assert_eq!(mat.dims(), case.dims);
            assert_eq!(mat.cstep(), case.cstep);
            assert_eq!(mat.elemsize(), case.elemsize);
            assert!(!mat.is_empty());
        });
    }

    #[test]
    fn test_zero_size_is_empty() {
        let mat = Mat::create_3d(0, 4, 4, 4, 1, &system_allocator()).unwrap();
        assert!(mat.is_empty());
        assert_eq!(mat.data::<f32>().unwrap().len(), 0);
    }

    #[test]
    fn test_from_f32_zero_size() {
        let mut mat = Mat::from_f32(&[0, 2, 1], &[]).unwrap();
        assert!(mat.is_empty());
        assert_eq!([mat.w(), mat.h(), mat.c()], [0, 2, 1]);
        assert!(mat.to_vec::<f32>().unwrap().is_empty());
        assert!(mat.data_mut::<f32>().unwrap().is_empty());
        assert!(mat.channel_data::<f32>(0).unwrap().is_empty());
    }

    #[test]
    fn test_allocation_failure() {
        let alloc: Arc<dyn Allocator> = Arc::new(LimitedAllocator::new(0));
        let err = Mat::create_2d(4, 4, 4, 1, &alloc).unwrap_err();
        assert_eq!(err, AllocError { bytes: 64 });
    }

    #[test]
    fn test_channel_views_alias() {
        let mat = Mat::from_f32(&[2, 3, 4], &iota(24)).unwrap();
        assert_eq!(mat.channel_data::<f32>(1).unwrap(), &iota(12)[6..]);

        let ch = mat.channel(2).unwrap();
        assert_eq!(ch.dims(), 2);
        assert!(ch.shares_storage(&mat));
        assert_eq!(ch.to_vec::<f32>().unwrap(), (12..18).map(|x| x as f32).collect::<Vec<_>>());

        let range = mat.channel_range(1, 2).unwrap();
        assert_eq!(range.c(), 2);
        assert_eq!(range.to_vec::<f32>().unwrap(), iota(24)[6..18]);

        let rows = ch.row_range(1, 2).unwrap();
        assert_eq!(rows.row::<f32>(0).unwrap(), &[14., 15.]);
        assert_eq!(rows.row::<f32>(1).unwrap(), &[16., 17.]);
    }

    #[test]
    fn test_mutation_requires_unique_owner() {
        let mut mat = Mat::from_f32(&[4, 4], &iota(16)).unwrap();
        let alias = mat.clone();
        assert_eq!(mat.data_mut::<f32>().unwrap_err(), MatError::Shared);

        let mut copy = alias.deep_clone(&system_allocator()).unwrap();
        assert!(!copy.shares_storage(&alias));
        copy.fill(1.0f32).unwrap();
        assert_eq!(alias.data::<f32>().unwrap(), &iota(16)[..]);

        std::mem::drop(alias);
        mat.fill(2.0f32).unwrap();
        assert!(mat.data::<f32>().unwrap().iter().all(|&x| x == 2.));
    }

    #[test]
    fn test_element_type_mismatch() {
        let mat = Mat::create_2d(4, 4, 16, 4, &system_allocator()).unwrap();
        assert!(mat.data::<f32>().is_ok());
        assert_eq!(
            mat.data::<u16>().unwrap_err(),
            MatError::ElemType {
                type_size: 2,
                elemsize: 16,
                elempack: 4
            }
        );
    }

    #[test]
    fn test_reshape() {
        let data = iota(24);

        // Contiguous 2D -> 1D reshape aliases.
        let mat = Mat::from_f32(&[6, 4], &data).unwrap();
        let flat = mat.reshape_1d(24).unwrap();
        assert!(flat.shares_storage(&mat));
        assert_eq!(flat.to_vec::<f32>().unwrap(), data);

        // 1D -> 3D with 3x3 planes needs channel padding, so copies.
        let src = Mat::from_f32(&[18], &data[..18]).unwrap();
        let cube = src.reshape_3d(3, 3, 2).unwrap();
        assert!(!cube.shares_storage(&src));
        assert_eq!(cube.cstep(), 12);
        assert_eq!(cube.to_vec::<f32>().unwrap(), data[..18]);

        // And back again.
        let back = cube.reshape_2d(9, 2).unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), data[..18]);

        // Inserting unit axes keeps the planes, so aliases.
        let planes = cube.reshape_4d(3, 3, 1, 2).unwrap();
        assert!(planes.shares_storage(&cube));
        let single = mat.reshape_3d(6, 4, 1).unwrap();
        assert!(single.shares_storage(&mat));
        assert_eq!(single.cstep(), 24);

        assert_eq!(
            mat.reshape_1d(5).unwrap_err(),
            MatError::Shape("reshape changes the element count")
        );
    }
}
