//! Process-private multi-dimensional arrays.
//!
//! Arrays are typed, column-major (first index varies fastest) and limited to
//! [`MAX_NDIMS`] dimensions.  Element storage is 64-byte aligned, matching
//! the layout of shared arrays so that whole frames move between the two
//! representations with plain memory copies.  Conversion between any pair of
//! the ten element types follows Rust `as`-cast semantics: values exactly
//! representable in both types round-trip unchanged, float-to-integer
//! conversion saturates, integer narrowing wraps.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use strehl_common::{ElType, Error, ErrorKind, Result, Scalar};

use crate::object::DATA_ALIGNMENT;

/// Maximum number of dimensions of an array.
pub const MAX_NDIMS: usize = 5;

/// Cast between array element types with `as` semantics.
pub trait CastFrom<S>: Sized {
    /// Convert `v` into `Self`.
    fn cast_from(v: S) -> Self;
}

macro_rules! impl_casts_to {
    ($d:ty) => {
        impl_casts_to!(@each $d; i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);
    };
    (@each $d:ty; $($s:ty),*) => {
        $(impl CastFrom<$s> for $d {
            fn cast_from(v: $s) -> $d {
                v as $d
            }
        })*
    };
}

impl_casts_to!(i8);
impl_casts_to!(u8);
impl_casts_to!(i16);
impl_casts_to!(u16);
impl_casts_to!(i32);
impl_casts_to!(u32);
impl_casts_to!(i64);
impl_casts_to!(u64);
impl_casts_to!(f32);
impl_casts_to!(f64);

// SAFETY: caller guarantees `src`/`dst` point at `n` valid elements of the
// named types and do not overlap.
unsafe fn convert_run<S: Scalar, D: Scalar + CastFrom<S>>(src: *const u8, dst: *mut u8, n: usize) {
    let src = unsafe { std::slice::from_raw_parts(src.cast::<S>(), n) };
    let dst = unsafe { std::slice::from_raw_parts_mut(dst.cast::<D>(), n) };
    for (d, s) in dst.iter_mut().zip(src) {
        *d = D::cast_from(*s);
    }
}

macro_rules! dispatch_dst {
    ($s:ty, $src:expr, $dst_ty:expr, $dst:expr, $n:expr) => {
        match $dst_ty {
            ElType::I8 => unsafe { convert_run::<$s, i8>($src, $dst, $n) },
            ElType::U8 => unsafe { convert_run::<$s, u8>($src, $dst, $n) },
            ElType::I16 => unsafe { convert_run::<$s, i16>($src, $dst, $n) },
            ElType::U16 => unsafe { convert_run::<$s, u16>($src, $dst, $n) },
            ElType::I32 => unsafe { convert_run::<$s, i32>($src, $dst, $n) },
            ElType::U32 => unsafe { convert_run::<$s, u32>($src, $dst, $n) },
            ElType::I64 => unsafe { convert_run::<$s, i64>($src, $dst, $n) },
            ElType::U64 => unsafe { convert_run::<$s, u64>($src, $dst, $n) },
            ElType::F32 => unsafe { convert_run::<$s, f32>($src, $dst, $n) },
            ElType::F64 => unsafe { convert_run::<$s, f64>($src, $dst, $n) },
        }
    };
}

/// Convert `n` elements from `src` (of type `src_ty`) into `dst` (of type
/// `dst_ty`).  Both byte slices must hold at least `n` elements of their
/// respective types.
pub fn convert_elements(
    src_ty: ElType,
    src: &[u8],
    dst_ty: ElType,
    dst: &mut [u8],
    n: usize,
) -> Result<()> {
    if src.len() < n * src_ty.size() || dst.len() < n * dst_ty.size() {
        return Err(Error::new("convert_elements", ErrorKind::BadSize));
    }
    let sp = src.as_ptr();
    let dp = dst.as_mut_ptr();
    match src_ty {
        ElType::I8 => dispatch_dst!(i8, sp, dst_ty, dp, n),
        ElType::U8 => dispatch_dst!(u8, sp, dst_ty, dp, n),
        ElType::I16 => dispatch_dst!(i16, sp, dst_ty, dp, n),
        ElType::U16 => dispatch_dst!(u16, sp, dst_ty, dp, n),
        ElType::I32 => dispatch_dst!(i32, sp, dst_ty, dp, n),
        ElType::U32 => dispatch_dst!(u32, sp, dst_ty, dp, n),
        ElType::I64 => dispatch_dst!(i64, sp, dst_ty, dp, n),
        ElType::U64 => dispatch_dst!(u64, sp, dst_ty, dp, n),
        ElType::F32 => dispatch_dst!(f32, sp, dst_ty, dp, n),
        ElType::F64 => dispatch_dst!(f64, sp, dst_ty, dp, n),
    }
    Ok(())
}

struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    fn new_zeroed(size: usize) -> Result<AlignedBuf> {
        let layout = Layout::from_size_align(size.max(1), DATA_ALIGNMENT)
            .map_err(|_| Error::new("array_alloc", ErrorKind::BadSize))?;
        // SAFETY: layout has nonzero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::new("array_alloc", ErrorKind::Exhausted))?;
        Ok(AlignedBuf { ptr, layout })
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with the stored layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

/// Validate dimensions, yielding the element count.
pub(crate) fn check_array_dims(func: &'static str, dims: &[i64]) -> Result<usize> {
    if dims.is_empty() || dims.len() > MAX_NDIMS {
        return Err(Error::new(func, ErrorKind::BadRank));
    }
    let mut nelem: usize = 1;
    for &d in dims {
        if d < 1 {
            return Err(Error::new(func, ErrorKind::BadSize));
        }
        nelem = nelem
            .checked_mul(d as usize)
            .ok_or(Error::new(func, ErrorKind::BadSize))?;
    }
    Ok(nelem)
}

/// A typed, column-major multi-dimensional array.
pub struct Array {
    eltype: ElType,
    ndims: usize,
    dims: [i64; MAX_NDIMS],
    nelem: usize,
    buf: AlignedBuf,
}

impl Array {
    /// Allocate a zero-filled array.
    pub fn new(eltype: ElType, dims: &[i64]) -> Result<Array> {
        let nelem = check_array_dims("array_new", dims)?;
        let buf = AlignedBuf::new_zeroed(nelem * eltype.size())?;
        let mut all = [1i64; MAX_NDIMS];
        all[..dims.len()].copy_from_slice(dims);
        Ok(Array {
            eltype,
            ndims: dims.len(),
            dims: all,
            nelem,
            buf,
        })
    }

    /// Element type.
    pub fn eltype(&self) -> ElType {
        self.eltype
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.ndims
    }

    /// Dimension lengths (entries beyond [`Array::ndims`] are 1).
    pub fn dims(&self) -> &[i64] {
        &self.dims[..self.ndims]
    }

    /// Total number of elements.
    pub fn nelem(&self) -> usize {
        self.nelem
    }

    /// Raw element storage.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the buffer holds nelem * elsize initialized bytes.
        unsafe {
            std::slice::from_raw_parts(self.buf.ptr.as_ptr(), self.nelem * self.eltype.size())
        }
    }

    /// Raw element storage, mutable.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.buf.ptr.as_ptr(), self.nelem * self.eltype.size())
        }
    }

    /// Typed element slice; fails unless `T` matches the element type.
    pub fn data<T: Scalar>(&self) -> Result<&[T]> {
        if T::ELTYPE != self.eltype {
            return Err(Error::new("array_data", ErrorKind::BadType));
        }
        // SAFETY: type and length just checked; storage is 64-byte aligned.
        Ok(unsafe {
            std::slice::from_raw_parts(self.buf.ptr.as_ptr().cast::<T>(), self.nelem)
        })
    }

    /// Typed element slice, mutable.
    pub fn data_mut<T: Scalar>(&mut self) -> Result<&mut [T]> {
        if T::ELTYPE != self.eltype {
            return Err(Error::new("array_data_mut", ErrorKind::BadType));
        }
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.buf.ptr.as_ptr().cast::<T>(), self.nelem)
        })
    }

    fn strides(&self) -> [usize; MAX_NDIMS] {
        let mut strides = [1usize; MAX_NDIMS];
        for k in 1..MAX_NDIMS {
            strides[k] = strides[k - 1] * self.dims[k - 1] as usize;
        }
        strides
    }
}

/// Copy (and convert) a rectangular region between two arrays.
///
/// `lens[k]` elements along dimension `k` are copied from `src` starting at
/// `src_offs` into `dst` starting at `dst_offs`; offsets and lengths are
/// checked against both shapes.  Elements are converted when the element
/// types differ.
pub fn copy_region(
    dst: &mut Array,
    dst_offs: &[i64],
    src: &Array,
    src_offs: &[i64],
    lens: &[i64],
) -> Result<()> {
    let rank = lens.len();
    if rank == 0 || rank > MAX_NDIMS || dst_offs.len() != rank || src_offs.len() != rank {
        return Err(Error::new("array_copy_region", ErrorKind::BadRank));
    }
    for k in 0..rank {
        let len = lens[k];
        if len < 1 || dst_offs[k] < 0 || src_offs[k] < 0 {
            return Err(Error::new("array_copy_region", ErrorKind::OutOfRange));
        }
        let dst_dim = *dst.dims.get(k).unwrap_or(&1);
        let src_dim = *src.dims.get(k).unwrap_or(&1);
        if dst_offs[k] + len > dst_dim || src_offs[k] + len > src_dim {
            return Err(Error::new("array_copy_region", ErrorKind::OutOfRange));
        }
    }

    let src_ty = src.eltype;
    let dst_ty = dst.eltype;
    let src_strides = src.strides();
    let dst_strides = dst.strides();
    let run = lens[0] as usize;

    // Odometer over the outer dimensions; the innermost run is contiguous in
    // both arrays (column-major).
    let mut index = [0usize; MAX_NDIMS];
    loop {
        let mut src_elem = src_offs[0] as usize;
        let mut dst_elem = dst_offs[0] as usize;
        for k in 1..rank {
            src_elem += (src_offs[k] as usize + index[k]) * src_strides[k];
            dst_elem += (dst_offs[k] as usize + index[k]) * dst_strides[k];
        }
        let src_start = src_elem * src_ty.size();
        let dst_start = dst_elem * dst_ty.size();
        let dst_len = run * dst_ty.size();
        convert_elements(
            src_ty,
            &src.as_bytes()[src_start..src_start + run * src_ty.size()],
            dst_ty,
            &mut dst.as_bytes_mut()[dst_start..dst_start + dst_len],
            run,
        )?;

        // Advance the odometer.
        let mut k = 1;
        loop {
            if k >= rank {
                return Ok(());
            }
            index[k] += 1;
            if index[k] < lens[k] as usize {
                break;
            }
            index[k] = 0;
            k += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_and_typed_access() {
        let mut arr = Array::new(ElType::U16, &[4, 3]).unwrap();
        assert_eq!(arr.nelem(), 12);
        assert_eq!(arr.dims(), &[4, 3]);
        assert!(arr.as_bytes().iter().all(|&b| b == 0));
        assert!(arr.data::<f32>().is_err());

        let data = arr.data_mut::<u16>().unwrap();
        for (i, v) in data.iter_mut().enumerate() {
            *v = i as u16;
        }
        assert_eq!(arr.data::<u16>().unwrap()[5], 5);
    }

    #[test]
    fn bad_shapes_are_rejected() {
        assert!(Array::new(ElType::U8, &[]).is_err());
        assert!(Array::new(ElType::U8, &[1, 1, 1, 1, 1, 1]).is_err());
        assert!(Array::new(ElType::U8, &[0]).is_err());
        assert!(Array::new(ElType::U8, &[-3]).is_err());
    }

    #[test]
    fn exact_values_round_trip_across_types() {
        let mut a = Array::new(ElType::U16, &[8]).unwrap();
        let vals = [0u16, 1, 2, 1000, 4095, 65535, 7, 42];
        a.data_mut::<u16>().unwrap().copy_from_slice(&vals);

        let mut b = Array::new(ElType::F64, &[8]).unwrap();
        copy_region(&mut b, &[0], &a, &[0], &[8]).unwrap();

        let mut c = Array::new(ElType::U16, &[8]).unwrap();
        copy_region(&mut c, &[0], &b, &[0], &[8]).unwrap();
        assert_eq!(c.data::<u16>().unwrap(), &vals);
    }

    #[test]
    fn float_to_int_saturates() {
        let mut a = Array::new(ElType::F64, &[3]).unwrap();
        a.data_mut::<f64>().unwrap().copy_from_slice(&[1e9, -1e9, 0.5]);
        let mut b = Array::new(ElType::U8, &[3]).unwrap();
        copy_region(&mut b, &[0], &a, &[0], &[3]).unwrap();
        assert_eq!(b.data::<u8>().unwrap(), &[255, 0, 0]);
    }

    #[test]
    fn region_copy_2d() {
        let mut src = Array::new(ElType::I32, &[4, 4]).unwrap();
        {
            let d = src.data_mut::<i32>().unwrap();
            for (i, v) in d.iter_mut().enumerate() {
                *v = i as i32;
            }
        }
        let mut dst = Array::new(ElType::I32, &[2, 2]).unwrap();
        // Copy the central 2x2 block (offsets [1,1]).
        copy_region(&mut dst, &[0, 0], &src, &[1, 1], &[2, 2]).unwrap();
        // Column-major: element (i,j) of src is i + 4*j.
        assert_eq!(dst.data::<i32>().unwrap(), &[5, 6, 9, 10]);
    }

    #[test]
    fn region_bounds_are_checked() {
        let src = Array::new(ElType::U8, &[4]).unwrap();
        let mut dst = Array::new(ElType::U8, &[4]).unwrap();
        assert!(copy_region(&mut dst, &[2], &src, &[0], &[3]).is_err());
        assert!(copy_region(&mut dst, &[0], &src, &[-1], &[2]).is_err());
        assert!(copy_region(&mut dst, &[0], &src, &[0], &[0]).is_err());
    }
}
