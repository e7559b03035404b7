//! Shared objects: the reference-counted base of every shared structure.
//!
//! A shared object occupies a whole shared memory segment.  Its header sits
//! at offset 0 and carries a process-shared mutex and condition variable, the
//! atomic attachment count, and the immutable identity of the object (total
//! size, segment identifier, flags, type tag).  Memory beyond the header
//! stores the members and data of derived types.
//!
//! Derived object types are expressed as a header-prefix hierarchy: a
//! derived header begins with [`ObjectHeader`] (or a derived header of its
//! own), and the type tag, magic-ORed, gates every downcast.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};

use static_assertions::const_assert_eq;
use strehl_common::{Deadline, Error, ErrorKind, Result, Shmid, TimeSpec, Wait};

use crate::segment::{self, ObjectFlags};
use crate::sync::{SharedCond, SharedMutex, Sharing};

/// Magic value present in the type tag of every shared object.
pub const SHARED_MAGIC: u32 = 0x9BB0_4E00;

/// Mask isolating the magic part of a type tag.
pub const SHARED_MASK: u32 = 0xFFFF_FF00;

/// Mask isolating the super-family part of a type tag.
pub const SUPERTYPE_MASK: u32 = 0xFFFF_FFE0;

/// Type identifiers of shared objects.
///
/// The family occupies the bit group `0x60`, concrete types the low five
/// bits, so that masking with [`SUPERTYPE_MASK`] yields the family tag.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// Basic shared object.
    SharedObject = SHARED_MAGIC,
    /// Basic read/write locked object.
    RwLockedObject = SHARED_MAGIC | (1 << 5),
    /// Basic remote object.
    RemoteObject = SHARED_MAGIC | (2 << 5),
    /// Shared multi-dimensional array.
    SharedArray = SHARED_MAGIC | (1 << 5) | 1,
    /// Remote camera.
    RemoteCamera = SHARED_MAGIC | (2 << 5) | 2,
    /// Remote deformable mirror.
    RemoteMirror = SHARED_MAGIC | (2 << 5) | 3,
    /// Remote wavefront sensor.
    RemoteSensor = SHARED_MAGIC | (2 << 5) | 4,
}

impl ObjectType {
    /// Decode a raw type tag.
    pub fn from_raw(raw: u32) -> Result<ObjectType> {
        Ok(match raw {
            x if x == ObjectType::SharedObject as u32 => ObjectType::SharedObject,
            x if x == ObjectType::RwLockedObject as u32 => ObjectType::RwLockedObject,
            x if x == ObjectType::RemoteObject as u32 => ObjectType::RemoteObject,
            x if x == ObjectType::SharedArray as u32 => ObjectType::SharedArray,
            x if x == ObjectType::RemoteCamera as u32 => ObjectType::RemoteCamera,
            x if x == ObjectType::RemoteMirror as u32 => ObjectType::RemoteMirror,
            x if x == ObjectType::RemoteSensor as u32 => ObjectType::RemoteSensor,
            _ => return Err(Error::new("object_type_from_raw", ErrorKind::BadType)),
        })
    }

    /// Family tag of this type.
    pub fn family(self) -> u32 {
        self as u32 & SUPERTYPE_MASK
    }

    /// Whether objects of this type embed a read/write lock.
    pub fn is_rwlocked(self) -> bool {
        self.family() == ObjectType::RwLockedObject as u32
    }

    /// Whether objects of this type embed the remote command protocol.
    pub fn is_remote(self) -> bool {
        self.family() == ObjectType::RemoteObject as u32
    }
}

/// Round `n` up to a multiple of `align` (a power of two).
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Alignment of object data sections, chosen to avoid false sharing.
pub const DATA_ALIGNMENT: usize = 64;

/// Header at offset 0 of every shared object.
#[repr(C)]
pub struct ObjectHeader {
    /// Mutually exclusive lock controlling access to mutable members.
    pub(crate) mutex: SharedMutex,
    /// Condition variable signaling changes.
    pub(crate) cond: SharedCond,
    /// Number of attachments; the detacher that observes zero destroys the
    /// backing segment.
    pub(crate) nrefs: AtomicI64,
    pub(crate) size: u64,
    pub(crate) shmid: i32,
    pub(crate) flags: u32,
    pub(crate) ty: u32,
    pub(crate) _pad: [u8; 4],
}

#[cfg(target_os = "linux")]
const_assert_eq!(std::mem::size_of::<ObjectHeader>() % 8, 0);

/// Handle on a shared object attached to the caller's address space.
///
/// Dropping the handle detaches the object; the handle that brings the
/// attachment count to zero also destroys the backing segment unless the
/// object was created persistent.
#[derive(Debug)]
pub struct SharedObject {
    ptr: NonNull<ObjectHeader>,
}

// Handles may travel between threads; all shared state is process-shared by
// construction and all mutation goes through &self with internal locking.
unsafe impl Send for SharedObject {}
unsafe impl Sync for SharedObject {}

impl SharedObject {
    /// Create a new shared object of `ty` occupying `size` bytes.
    ///
    /// The segment is zero-filled beyond the initialized header, and the
    /// caller holds the first attachment.
    pub fn create(ty: ObjectType, size: usize, flags: ObjectFlags) -> Result<SharedObject> {
        if size < std::mem::size_of::<ObjectHeader>() {
            return Err(Error::new("shared_object_create", ErrorKind::BadSize));
        }
        let (ptr, shmid) = segment::create(size, flags)?;
        let header = ptr.cast::<ObjectHeader>();
        // SAFETY: freshly created zero-filled segment, exclusively ours until
        // the shmid is published.
        unsafe {
            let h = header.as_ptr();
            if let Err(err) = (*h).mutex.init(Sharing::Shared) {
                let _ = segment::destroy(shmid);
                let _ = segment::detach(ptr);
                return Err(err);
            }
            if let Err(err) = (*h).cond.init(Sharing::Shared) {
                let _ = (*h).mutex.destroy();
                let _ = segment::destroy(shmid);
                let _ = segment::detach(ptr);
                return Err(err);
            }
            (*h).nrefs.store(1, Ordering::Release);
            (*h).size = size as u64;
            (*h).shmid = shmid.0;
            (*h).flags = flags.bits();
            (*h).ty = ty as u32;
        }
        Ok(SharedObject { ptr: header })
    }

    /// Attach an existing shared object of any type.
    pub fn attach(shmid: Shmid) -> Result<SharedObject> {
        Self::attach_checked(shmid, None)
    }

    /// Attach an existing object, checking its type tag.
    ///
    /// With `expected = Some((tag, mask))` the attachment succeeds only when
    /// `ty & mask == tag`; this implements both exact-type and family-level
    /// downcasts.
    pub fn attach_checked(shmid: Shmid, expected: Option<(u32, u32)>) -> Result<SharedObject> {
        let (ptr, size) = segment::attach(shmid)?;
        if size < std::mem::size_of::<ObjectHeader>() {
            let _ = unsafe { segment::detach(ptr) };
            return Err(Error::new("shared_object_attach", ErrorKind::BadSize));
        }
        let header = ptr.cast::<ObjectHeader>();
        // SAFETY: the mapping is at least as large as the header.
        let h = unsafe { header.as_ref() };
        if h.ty & SHARED_MASK != SHARED_MAGIC {
            let _ = unsafe { segment::detach(ptr) };
            return Err(Error::new("shared_object_attach", ErrorKind::BadMagic));
        }
        if let Some((tag, mask)) = expected {
            if h.ty & mask != tag {
                let _ = unsafe { segment::detach(ptr) };
                return Err(Error::new("shared_object_attach", ErrorKind::BadType));
            }
        }
        // The object may be halfway through destruction: only count the
        // attachment if somebody still holds one.
        if h.nrefs.fetch_add(1, Ordering::AcqRel) <= 0 {
            h.nrefs.fetch_sub(1, Ordering::AcqRel);
            let _ = unsafe { segment::detach(ptr) };
            return Err(Error::new("shared_object_attach", ErrorKind::Destroyed));
        }
        Ok(SharedObject { ptr: header })
    }

    pub(crate) fn header(&self) -> &ObjectHeader {
        // SAFETY: the mapping stays valid for the lifetime of the handle.
        unsafe { self.ptr.as_ref() }
    }

    /// Address of the object in the caller's address space.
    ///
    /// Derived object types use this to reach their members beyond the base
    /// header; offsets must stay within [`SharedObject::size`].
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// Total number of bytes of the backing segment.
    pub fn size(&self) -> usize {
        self.header().size as usize
    }

    /// Segment identifier, usable by other processes to attach.
    pub fn shmid(&self) -> Shmid {
        Shmid(self.header().shmid)
    }

    /// Type tag of the object.
    pub fn object_type(&self) -> Result<ObjectType> {
        ObjectType::from_raw(self.header().ty)
    }

    /// Creation flags (permissions and options).
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.header().flags)
    }

    /// Current number of attachments.
    pub fn nrefs(&self) -> i64 {
        self.header().nrefs.load(Ordering::Acquire)
    }

    /// Lock the object for exclusive access.
    pub fn lock(&self) -> Result<()> {
        self.header().mutex.lock()
    }

    /// Attempt to lock the object without blocking.
    pub fn try_lock(&self) -> Result<Wait> {
        self.header().mutex.try_lock()
    }

    /// Lock the object, blocking no later than an absolute time limit.
    pub fn abstimed_lock(&self, lim: TimeSpec) -> Result<Wait> {
        self.header().mutex.abstimed_lock(lim)
    }

    /// Lock the object, blocking no longer than `secs` seconds.
    pub fn timed_lock(&self, secs: f64) -> Result<Wait> {
        self.header().mutex.timed_lock(secs)
    }

    /// Lock the object against a pre-computed deadline.
    pub fn lock_deadline(&self, deadline: &Deadline) -> Result<Wait> {
        self.header().mutex.lock_deadline(deadline)
    }

    /// Unlock the object.
    pub fn unlock(&self) -> Result<()> {
        self.header().mutex.unlock()
    }

    /// Wake at most one thread waiting on the object's condition variable.
    pub fn signal(&self) -> Result<()> {
        self.header().cond.signal()
    }

    /// Wake every thread waiting on the object's condition variable.
    pub fn broadcast(&self) -> Result<()> {
        self.header().cond.broadcast()
    }

    /// Wait on the object's condition variable; the caller must hold the
    /// lock, which is atomically released and re-acquired.
    pub fn wait_condition(&self) -> Result<()> {
        self.header().cond.wait(&self.header().mutex)
    }

    /// Timed wait on the condition variable with an absolute limit.
    pub fn abstimed_wait_condition(&self, lim: TimeSpec) -> Result<Wait> {
        self.header().cond.abstimed_wait(&self.header().mutex, lim)
    }

    /// Timed wait on the condition variable with a relative limit.
    pub fn timed_wait_condition(&self, secs: f64) -> Result<Wait> {
        self.header().cond.timed_wait(&self.header().mutex, secs)
    }

    /// Wait on the condition variable against a pre-computed deadline.
    pub fn wait_deadline(&self, deadline: &Deadline) -> Result<Wait> {
        self.header().cond.wait_deadline(&self.header().mutex, deadline)
    }
}

impl Drop for SharedObject {
    fn drop(&mut self) {
        let h = self.header();
        let shmid = Shmid(h.shmid);
        let persistent = ObjectFlags::from_bits_truncate(h.flags).contains(ObjectFlags::PERSISTENT);
        let last = h.nrefs.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && !persistent {
            // SAFETY: we hold the final attachment, nobody can be waiting.
            unsafe {
                let _ = h.cond.destroy();
                let _ = h.mutex.destroy();
            }
            if let Err(err) = segment::destroy(shmid) {
                tracing::warn!(%shmid, %err, "failed to destroy shared object segment");
            }
        }
        // SAFETY: the pointer came from segment::create/attach and is not
        // used after this point.
        if let Err(err) = unsafe { segment::detach(self.ptr.cast()) } {
            tracing::warn!(%shmid, %err, "failed to detach shared object");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags() {
        assert_eq!(ObjectType::SharedObject as u32 & SHARED_MASK, SHARED_MAGIC);
        assert_eq!(ObjectType::SharedArray.family(), ObjectType::RwLockedObject as u32);
        assert_eq!(ObjectType::RemoteCamera.family(), ObjectType::RemoteObject as u32);
        assert!(ObjectType::RemoteMirror.is_remote());
        assert!(ObjectType::SharedArray.is_rwlocked());
        assert!(!ObjectType::SharedObject.is_remote());
        for ty in [
            ObjectType::SharedObject,
            ObjectType::RwLockedObject,
            ObjectType::RemoteObject,
            ObjectType::SharedArray,
            ObjectType::RemoteCamera,
            ObjectType::RemoteMirror,
            ObjectType::RemoteSensor,
        ] {
            assert_eq!(ObjectType::from_raw(ty as u32).unwrap(), ty);
        }
        assert!(ObjectType::from_raw(0).is_err());
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn create_attach_lifecycle() {
        let obj = SharedObject::create(ObjectType::SharedObject, 4096, ObjectFlags::empty())
            .unwrap();
        assert_eq!(obj.size(), 4096);
        assert_eq!(obj.nrefs(), 1);
        assert_eq!(obj.object_type().unwrap(), ObjectType::SharedObject);

        let shmid = obj.shmid();
        let other = SharedObject::attach(shmid).unwrap();
        assert_eq!(obj.nrefs(), 2);
        assert_eq!(other.shmid(), shmid);

        drop(other);
        assert_eq!(obj.nrefs(), 1);

        drop(obj);
        // Destroyed on last detach: the identifier is gone.
        assert!(segment::stat(shmid).is_err());
    }

    #[test]
    fn attach_rejects_wrong_type() {
        let obj =
            SharedObject::create(ObjectType::RemoteObject, 4096, ObjectFlags::empty()).unwrap();
        let err = SharedObject::attach_checked(
            obj.shmid(),
            Some((ObjectType::SharedArray as u32, u32::MAX)),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadType);

        // Family-level downcast accepts the concrete remote type.
        let fam = SharedObject::attach_checked(
            obj.shmid(),
            Some((ObjectType::RemoteObject as u32, SUPERTYPE_MASK)),
        );
        assert!(fam.is_ok());
    }

    #[test]
    fn lock_and_condition() {
        let obj =
            SharedObject::create(ObjectType::SharedObject, 4096, ObjectFlags::empty()).unwrap();
        obj.lock().unwrap();
        let w = obj.timed_wait_condition(0.01).unwrap();
        assert!(w.timed_out());
        obj.unlock().unwrap();
        obj.broadcast().unwrap();
    }
}
