//! System V shared memory segments.
//!
//! Segments are the backing storage of every shared object.  They are
//! identified by an integer [`Shmid`], created zero-filled, and carry a
//! kernel-maintained attachment count.  On Linux a segment can be marked for
//! destruction while still attached; the kernel then reclaims it on the last
//! detach.

use std::ptr::NonNull;

use bitflags::bitflags;
use strehl_common::{Error, ErrorKind, Result, Shmid};

bitflags! {
    /// Access permissions and options of a shared object.
    ///
    /// The lower nine bits mirror the classic `rwxrwxrwx` permission bits;
    /// the owner is always granted read and write access at creation,
    /// whatever the requested bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// Owner may read.
        const OWNER_READ = 0o400;
        /// Owner may write.
        const OWNER_WRITE = 0o200;
        /// Group may read.
        const GROUP_READ = 0o040;
        /// Group may write.
        const GROUP_WRITE = 0o020;
        /// Others may read.
        const OTHER_READ = 0o004;
        /// Others may write.
        const OTHER_WRITE = 0o002;
        /// Do not destroy the backing segment on last detach.
        const PERSISTENT = 1 << 20;
    }
}

impl ObjectFlags {
    /// Permission bits passed to the kernel (owner read/write forced).
    pub fn perms(self) -> u32 {
        (self.bits() & 0o777) | 0o600
    }
}

/// Create a new zero-filled segment of `size` bytes, attached to the caller.
pub fn create(size: usize, flags: ObjectFlags) -> Result<(NonNull<u8>, Shmid)> {
    if size == 0 {
        return Err(Error::new("segment_create", ErrorKind::BadSize));
    }
    // SAFETY: plain System V calls; IPC_PRIVATE always names a new segment.
    let id = unsafe {
        libc::shmget(
            libc::IPC_PRIVATE,
            size,
            libc::IPC_CREAT | libc::IPC_EXCL | flags.perms() as i32,
        )
    };
    if id < 0 {
        return Err(Error::last_os_error("segment_create"));
    }
    let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
    if addr == usize::MAX as *mut libc::c_void {
        let err = Error::last_os_error("segment_create");
        unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
        return Err(err);
    }
    Ok((
        NonNull::new(addr as *mut u8).ok_or(Error::new("segment_create", ErrorKind::BadAddress))?,
        Shmid(id),
    ))
}

/// Attach an existing segment, yielding its address and total size.
pub fn attach(shmid: Shmid) -> Result<(NonNull<u8>, usize)> {
    if !shmid.is_valid() {
        return Err(Error::new("segment_attach", ErrorKind::BadArgument));
    }
    let addr = unsafe { libc::shmat(shmid.0, std::ptr::null(), 0) };
    if addr == usize::MAX as *mut libc::c_void {
        return Err(Error::last_os_error("segment_attach"));
    }
    let (size, _) = match stat(shmid) {
        Ok(info) => info,
        Err(err) => {
            unsafe { libc::shmdt(addr) };
            return Err(err);
        }
    };
    Ok((
        NonNull::new(addr as *mut u8).ok_or(Error::new("segment_attach", ErrorKind::BadAddress))?,
        size,
    ))
}

/// Detach a segment from the caller's address space.
///
/// # Safety
/// `addr` must be the address returned by [`create`] or [`attach`] and must
/// not be used afterwards.
pub unsafe fn detach(addr: NonNull<u8>) -> Result<()> {
    if unsafe { libc::shmdt(addr.as_ptr() as *const libc::c_void) } != 0 {
        return Err(Error::last_os_error("segment_detach"));
    }
    Ok(())
}

/// Schedule a segment for destruction.
///
/// May be called while the segment is still attached; the kernel reclaims
/// the memory once the last process detaches.
pub fn destroy(shmid: Shmid) -> Result<()> {
    if unsafe { libc::shmctl(shmid.0, libc::IPC_RMID, std::ptr::null_mut()) } != 0 {
        return Err(Error::last_os_error("segment_destroy"));
    }
    Ok(())
}

/// Query the size and attachment count of a segment.
///
/// Fails (leaving nothing to report) if the identifier is unknown or the
/// segment has already been destroyed.
pub fn stat(shmid: Shmid) -> Result<(usize, i64)> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    if unsafe { libc::shmctl(shmid.0, libc::IPC_STAT, &mut ds) } != 0 {
        return Err(Error::last_os_error("segment_stat"));
    }
    Ok((ds.shm_segsz as usize, ds.shm_nattch as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_attach_detach_destroy() {
        let (ptr, shmid) = create(4096, ObjectFlags::empty()).unwrap();
        assert!(shmid.is_valid());

        // Creation zero-fills.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));

        let (size, nattch) = stat(shmid).unwrap();
        assert_eq!(size, 4096);
        assert_eq!(nattch, 1);

        let (ptr2, size2) = attach(shmid).unwrap();
        assert_eq!(size2, 4096);
        assert_eq!(stat(shmid).unwrap().1, 2);

        unsafe { detach(ptr2).unwrap() };
        assert_eq!(stat(shmid).unwrap().1, 1);

        // Destruction is deferred to the last detach on Linux.
        destroy(shmid).unwrap();
        unsafe { detach(ptr).unwrap() };
        assert!(stat(shmid).is_err());
    }

    #[test]
    fn stat_of_unknown_segment_fails() {
        assert!(stat(Shmid::BAD).is_err());
        assert!(stat(Shmid(0x7fff_0000)).is_err());
    }

    #[test]
    fn owner_access_is_forced() {
        assert_eq!(ObjectFlags::empty().perms(), 0o600);
        assert_eq!(
            (ObjectFlags::GROUP_READ | ObjectFlags::OTHER_READ).perms(),
            0o644
        );
        // The persistent bit is not a permission bit.
        assert_eq!(ObjectFlags::PERSISTENT.perms(), 0o600);
    }
}
