//! Read/write-locked shared objects.
//!
//! A read/write-locked object extends the shared object base with two
//! counters implementing writer-preferring read/write semantics on top of
//! the base mutex and condition variable: `users` is `-1` while one writer
//! is active, positive while readers are active, `0` when idle; `writers`
//! counts blocked writers, and new readers are refused while it is nonzero,
//! so writers cannot starve under sustained reader traffic.

use std::ops::Deref;

use strehl_common::{Deadline, Error, ErrorKind, Result, Shmid, Wait};

use crate::object::{ObjectHeader, ObjectType, SharedObject, SUPERTYPE_MASK};
use crate::segment::ObjectFlags;

/// Header of a read/write-locked object.
#[repr(C)]
pub struct RwHeader {
    /// Base structure.
    pub(crate) base: ObjectHeader,
    /// Number of waiting writers.  Must be nonnegative.
    pub(crate) writers: i64,
    /// Number of active users: 0 if none, > 0 if some active readers, -1 if
    /// one active writer.
    pub(crate) users: i64,
}

/// Handle on a read/write-locked object.
pub struct RwLockedObject {
    base: SharedObject,
}

impl Deref for RwLockedObject {
    type Target = SharedObject;

    fn deref(&self) -> &SharedObject {
        &self.base
    }
}

impl RwLockedObject {
    /// Create a read/write-locked object of `ty` (which must belong to the
    /// read/write-locked family) occupying `size` bytes.
    pub fn create(ty: ObjectType, size: usize, flags: ObjectFlags) -> Result<RwLockedObject> {
        if !ty.is_rwlocked() {
            return Err(Error::new("rwlocked_object_create", ErrorKind::BadType));
        }
        if size < std::mem::size_of::<RwHeader>() {
            return Err(Error::new("rwlocked_object_create", ErrorKind::BadSize));
        }
        // The counters start at zero courtesy of segment zero-fill.
        let base = SharedObject::create(ty, size, flags)?;
        Ok(RwLockedObject { base })
    }

    /// Attach an existing object of the read/write-locked family.
    pub fn attach(shmid: Shmid) -> Result<RwLockedObject> {
        let base = SharedObject::attach_checked(
            shmid,
            Some((ObjectType::RwLockedObject as u32, SUPERTYPE_MASK)),
        )?;
        Ok(RwLockedObject { base })
    }

    /// Wrap an already-validated shared object handle.
    pub(crate) fn from_base(base: SharedObject) -> RwLockedObject {
        RwLockedObject { base }
    }

    fn rw(&self) -> *mut RwHeader {
        self.base.as_ptr().cast::<RwHeader>().as_ptr()
    }

    // Counter accesses only while holding the base mutex.
    fn users(&self) -> i64 {
        unsafe { (*self.rw()).users }
    }

    fn set_users(&self, v: i64) {
        unsafe { (*self.rw()).users = v };
    }

    fn writers(&self) -> i64 {
        unsafe { (*self.rw()).writers }
    }

    fn set_writers(&self, v: i64) {
        unsafe { (*self.rw()).writers = v };
    }

    /// Acquire the object for reading (shared access).
    pub fn rdlock(&self) -> Result<()> {
        match self.rdlock_deadline(&Deadline::Forever)? {
            Wait::Done => Ok(()),
            Wait::TimedOut => Err(Error::new("rwlocked_rdlock", ErrorKind::SystemError)),
        }
    }

    /// Acquire the object for reading without blocking.
    pub fn try_rdlock(&self) -> Result<Wait> {
        self.rdlock_deadline(&Deadline::Immediate)
    }

    /// Acquire the object for reading, blocking no longer than `secs`.
    pub fn timed_rdlock(&self, secs: f64) -> Result<Wait> {
        self.rdlock_deadline(&Deadline::after(secs)?)
    }

    /// Acquire the object for reading against a pre-computed deadline.
    pub fn rdlock_deadline(&self, deadline: &Deadline) -> Result<Wait> {
        if self.base.lock_deadline(deadline)?.timed_out() {
            return Ok(Wait::TimedOut);
        }
        loop {
            // Writer preference: no new readers while writers are queued.
            if self.users() >= 0 && self.writers() == 0 {
                self.set_users(self.users() + 1);
                self.base.unlock()?;
                return Ok(Wait::Done);
            }
            if self.base.wait_deadline(deadline)?.timed_out() {
                self.base.unlock()?;
                return Ok(Wait::TimedOut);
            }
        }
    }

    /// Acquire the object for writing (exclusive access).
    pub fn wrlock(&self) -> Result<()> {
        match self.wrlock_deadline(&Deadline::Forever)? {
            Wait::Done => Ok(()),
            Wait::TimedOut => Err(Error::new("rwlocked_wrlock", ErrorKind::SystemError)),
        }
    }

    /// Acquire the object for writing without blocking.
    pub fn try_wrlock(&self) -> Result<Wait> {
        self.wrlock_deadline(&Deadline::Immediate)
    }

    /// Acquire the object for writing, blocking no longer than `secs`.
    pub fn timed_wrlock(&self, secs: f64) -> Result<Wait> {
        self.wrlock_deadline(&Deadline::after(secs)?)
    }

    /// Acquire the object for writing against a pre-computed deadline.
    pub fn wrlock_deadline(&self, deadline: &Deadline) -> Result<Wait> {
        if self.base.lock_deadline(deadline)?.timed_out() {
            return Ok(Wait::TimedOut);
        }
        self.set_writers(self.writers() + 1);
        loop {
            if self.users() == 0 {
                self.set_users(-1);
                self.set_writers(self.writers() - 1);
                self.base.unlock()?;
                return Ok(Wait::Done);
            }
            if self.base.wait_deadline(deadline)?.timed_out() {
                self.set_writers(self.writers() - 1);
                self.base.unlock()?;
                return Ok(Wait::TimedOut);
            }
        }
    }

    /// Release a read lock.
    pub fn unlock_read(&self) -> Result<()> {
        self.base.lock()?;
        if self.users() <= 0 {
            self.base.unlock()?;
            return Err(Error::new("rwlocked_unlock_read", ErrorKind::NotLocked));
        }
        self.set_users(self.users() - 1);
        if self.users() == 0 {
            self.base.broadcast()?;
        }
        self.base.unlock()
    }

    /// Release a write lock.
    pub fn unlock_write(&self) -> Result<()> {
        self.base.lock()?;
        if self.users() != -1 {
            self.base.unlock()?;
            return Err(Error::new("rwlocked_unlock_write", ErrorKind::NotLocked));
        }
        self.set_users(0);
        self.base.broadcast()?;
        self.base.unlock()
    }
}
