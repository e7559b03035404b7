//! Shared multi-dimensional arrays.
//!
//! A shared array is a read/write-locked object whose data section stores a
//! column-major typed array.  The element storage begins at the first
//! 64-byte aligned offset after the header, so frames can be exchanged with
//! process-private [`Array`]s by plain memory copies.
//!
//! The `serial` counter and the time stamp table are used by frame
//! publishers: the serial of a posted image equals the serial of the ring
//! entry it backs.

use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};

use strehl_common::{ElType, Error, ErrorKind, Result, Serial, Shmid, TimeSpec};

use crate::array::{check_array_dims, convert_elements, Array, MAX_NDIMS};
use crate::object::{align_up, ObjectType, DATA_ALIGNMENT};
use crate::rwlocked::{RwHeader, RwLockedObject};
use crate::segment::ObjectFlags;

/// Number of time stamps carried by a shared array.
pub const TIMESTAMPS: usize = 5;

/// Header of a shared array.
#[repr(C)]
pub struct SharedArrayHeader {
    /// Base structure.
    pub(crate) base: RwHeader,
    nelem: i64,
    ndims: i32,
    _pad0: [u8; 4],
    dims: [i64; MAX_NDIMS],
    eltype: i32,
    _pad1: [u8; 4],
    serial: AtomicI64,
    ts: [TimeSpec; TIMESTAMPS],
}

/// Byte offset from the header to the element storage.
pub fn data_offset() -> usize {
    align_up(std::mem::size_of::<SharedArrayHeader>(), DATA_ALIGNMENT)
}

/// Handle on a shared multi-dimensional array.
pub struct SharedArray {
    base: RwLockedObject,
}

impl Deref for SharedArray {
    type Target = RwLockedObject;

    fn deref(&self) -> &RwLockedObject {
        &self.base
    }
}

impl SharedArray {
    /// Create a new zero-filled shared array.
    pub fn create(eltype: ElType, dims: &[i64], flags: ObjectFlags) -> Result<SharedArray> {
        let nelem = check_array_dims("shared_array_create", dims)?;
        let size = data_offset() + nelem * eltype.size();
        let base = RwLockedObject::create(ObjectType::SharedArray, size, flags)?;
        let h = base.as_ptr().cast::<SharedArrayHeader>().as_ptr();
        // SAFETY: freshly created object, not yet shared.
        unsafe {
            (*h).nelem = nelem as i64;
            (*h).ndims = dims.len() as i32;
            let mut all = [1i64; MAX_NDIMS];
            all[..dims.len()].copy_from_slice(dims);
            (*h).dims = all;
            (*h).eltype = eltype as i32;
        }
        Ok(SharedArray { base })
    }

    /// Attach an existing shared array.
    pub fn attach(shmid: Shmid) -> Result<SharedArray> {
        let base = crate::object::SharedObject::attach_checked(
            shmid,
            Some((ObjectType::SharedArray as u32, u32::MAX)),
        )?;
        let arr = SharedArray {
            base: RwLockedObject::from_base(base),
        };
        // Sanity-check the geometry before handing the array out.
        let h = arr.header();
        let eltype = ElType::from_raw(h.eltype)?;
        let ndims = h.ndims;
        if !(1..=MAX_NDIMS as i32).contains(&ndims) {
            return Err(Error::new("shared_array_attach", ErrorKind::BadRank));
        }
        let expect = data_offset() + h.nelem as usize * eltype.size();
        if arr.size() < expect {
            return Err(Error::new("shared_array_attach", ErrorKind::Corrupted));
        }
        Ok(arr)
    }

    fn header(&self) -> &SharedArrayHeader {
        // SAFETY: geometry validated at creation/attachment.
        unsafe { &*self.base.as_ptr().cast::<SharedArrayHeader>().as_ptr() }
    }

    /// Element type.
    pub fn eltype(&self) -> ElType {
        ElType::from_raw(self.header().eltype).unwrap_or(ElType::U8)
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.header().ndims as usize
    }

    /// Dimension lengths.
    pub fn dims(&self) -> &[i64] {
        &self.header().dims[..self.ndims()]
    }

    /// Total number of elements.
    pub fn nelem(&self) -> usize {
        self.header().nelem as usize
    }

    /// Serial number of the frame stored in the array, 0 when unused.
    pub fn serial(&self) -> Serial {
        self.header().serial.load(Ordering::Acquire)
    }

    /// Publish the serial number of the stored frame.
    pub fn set_serial(&self, serial: Serial) {
        self.header().serial.store(serial, Ordering::Release);
    }

    /// Read one of the [`TIMESTAMPS`] time stamps.
    pub fn timestamp(&self, idx: usize) -> Result<TimeSpec> {
        if idx >= TIMESTAMPS {
            return Err(Error::new("shared_array_timestamp", ErrorKind::OutOfRange));
        }
        Ok(self.header().ts[idx])
    }

    /// Store one of the [`TIMESTAMPS`] time stamps.
    pub fn set_timestamp(&self, idx: usize, ts: TimeSpec) -> Result<()> {
        if idx >= TIMESTAMPS {
            return Err(Error::new("shared_array_set_timestamp", ErrorKind::OutOfRange));
        }
        let h = self.base.as_ptr().cast::<SharedArrayHeader>().as_ptr();
        // Time stamps are owned by the publisher; written before the serial.
        unsafe { (*h).ts[idx] = ts };
        Ok(())
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the segment extends past the aligned data offset.
        unsafe { self.base.as_ptr().as_ptr().add(data_offset()) }
    }

    /// Raw element storage.
    ///
    /// The caller is expected to hold a read or write lock on the array
    /// while the owning server may be publishing into it.
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.nelem() * self.eltype().size();
        // SAFETY: geometry validated at creation/attachment.
        unsafe { std::slice::from_raw_parts(self.data_ptr(), len) }
    }

    /// Raw element storage, mutable.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.nelem() * self.eltype().size();
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(), len) }
    }

    /// Typed element slice; fails unless `T` matches the element type.
    pub fn data<T: strehl_common::Scalar>(&self) -> Result<&[T]> {
        if T::ELTYPE != self.eltype() {
            return Err(Error::new("shared_array_data", ErrorKind::BadType));
        }
        // SAFETY: the storage is DATA_ALIGNMENT-aligned and large enough.
        Ok(unsafe { std::slice::from_raw_parts(self.data_ptr().cast::<T>(), self.nelem()) })
    }

    /// Typed element slice, mutable.
    pub fn data_mut<T: strehl_common::Scalar>(&mut self) -> Result<&mut [T]> {
        if T::ELTYPE != self.eltype() {
            return Err(Error::new("shared_array_data_mut", ErrorKind::BadType));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.data_ptr().cast::<T>(), self.nelem()) })
    }

    /// Copy (and convert) the contents of a process-private array in.
    ///
    /// Shapes must match element-for-element; element types may differ.
    pub fn copy_from_array(&mut self, src: &Array) -> Result<()> {
        if src.nelem() != self.nelem() {
            return Err(Error::new("shared_array_copy_from", ErrorKind::BadSize));
        }
        let n = self.nelem();
        let (src_ty, dst_ty) = (src.eltype(), self.eltype());
        convert_elements(src_ty, src.as_bytes(), dst_ty, self.as_bytes_mut(), n)
    }

    /// Snapshot the contents into a process-private array of the same shape
    /// and element type.
    pub fn to_array(&self) -> Result<Array> {
        let mut arr = Array::new(self.eltype(), self.dims())?;
        arr.as_bytes_mut().copy_from_slice(self.as_bytes());
        Ok(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_offset_is_aligned() {
        assert_eq!(data_offset() % DATA_ALIGNMENT, 0);
        assert!(data_offset() >= std::mem::size_of::<SharedArrayHeader>());
    }

    #[test]
    fn create_attach_and_write() {
        let mut arr = SharedArray::create(ElType::U16, &[8, 4], ObjectFlags::empty()).unwrap();
        assert_eq!(arr.nelem(), 32);
        assert_eq!(arr.dims(), &[8, 4]);
        assert_eq!(arr.eltype(), ElType::U16);
        assert_eq!(arr.serial(), 0);

        arr.data_mut::<u16>().unwrap()[3] = 777;

        let peer = SharedArray::attach(arr.shmid()).unwrap();
        assert_eq!(peer.data::<u16>().unwrap()[3], 777);
        assert_eq!(peer.dims(), &[8, 4]);
    }

    #[test]
    fn serial_and_timestamps() {
        let arr = SharedArray::create(ElType::F32, &[4], ObjectFlags::empty()).unwrap();
        arr.set_serial(9);
        assert_eq!(arr.serial(), 9);
        let ts = TimeSpec { sec: 1, nsec: 2 };
        arr.set_timestamp(2, ts).unwrap();
        assert_eq!(arr.timestamp(2).unwrap(), ts);
        assert!(arr.timestamp(TIMESTAMPS).is_err());
    }

    #[test]
    fn attach_rejects_non_arrays() {
        let obj = crate::object::SharedObject::create(
            ObjectType::RemoteObject,
            4096,
            ObjectFlags::empty(),
        )
        .unwrap();
        assert!(SharedArray::attach(obj.shmid()).is_err());
    }

    #[test]
    fn round_trip_with_private_array() {
        let mut shared = SharedArray::create(ElType::F64, &[6], ObjectFlags::empty()).unwrap();
        let mut private = Array::new(ElType::U16, &[6]).unwrap();
        private
            .data_mut::<u16>()
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        shared.copy_from_array(&private).unwrap();
        assert_eq!(
            shared.data::<f64>().unwrap(),
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
        let snap = shared.to_array().unwrap();
        assert_eq!(snap.data::<f64>().unwrap()[5], 6.0);
    }
}
