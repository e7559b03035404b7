//! Process-shared synchronization primitives.
//!
//! Thin `#[repr(C)]` wrappers around pthread mutexes, condition variables and
//! POSIX semaphores, initialized with the process-shared attribute so that
//! they can live inside a shared memory segment and synchronize threads of
//! different processes.  Every blocking acquire comes in four flavors:
//! unbounded, non-blocking (`try_`), absolute deadline (`abstimed_`,
//! CLOCK_REALTIME) and relative timeout (`timed_`, seconds).
//!
//! Initialization and destruction are `unsafe`: the caller must guarantee
//! that the primitive lives at a stable address in memory shared by every
//! participating process, is initialized exactly once before use, and is not
//! destroyed while in use.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use strehl_common::{Deadline, Error, ErrorKind, Result, TimeSpec, Wait};

/// Sharing disposition of a synchronization primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Usable by threads of the owning process only.
    Private,
    /// Usable by any process mapping the memory.
    Shared,
}

fn pthread_err(func: &'static str, code: i32) -> Error {
    Error::new(func, ErrorKind::Errno(code))
}

/// Map a pthread return code to a timed-wait outcome.
fn wait_outcome(func: &'static str, code: i32) -> Result<Wait> {
    match code {
        0 => Ok(Wait::Done),
        libc::ETIMEDOUT | libc::EBUSY => Ok(Wait::TimedOut),
        code => Err(pthread_err(func, code)),
    }
}

/// Process-shared mutual exclusion lock.
#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// The pthread object is designed for concurrent use from any thread.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialize the mutex in place.
    ///
    /// # Safety
    /// Must be called exactly once, on memory that stays mapped at a stable
    /// address for the lifetime of the mutex.
    pub unsafe fn init(&self, sharing: Sharing) -> Result<()> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            let code = libc::pthread_mutexattr_init(attr.as_mut_ptr());
            if code != 0 {
                return Err(pthread_err("mutex_init", code));
            }
            if sharing == Sharing::Shared {
                let code = libc::pthread_mutexattr_setpshared(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                );
                if code != 0 {
                    libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
                    return Err(pthread_err("mutex_init", code));
                }
            }
            let code = libc::pthread_mutex_init(self.inner.get(), attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            if code != 0 {
                return Err(pthread_err("mutex_init", code));
            }
        }
        Ok(())
    }

    /// Destroy the mutex.
    ///
    /// # Safety
    /// No thread of any process may hold or wait on the mutex.
    pub unsafe fn destroy(&self) -> Result<()> {
        let code = unsafe { libc::pthread_mutex_destroy(self.inner.get()) };
        if code != 0 {
            return Err(pthread_err("mutex_destroy", code));
        }
        Ok(())
    }

    /// Acquire the lock, blocking without limit.
    pub fn lock(&self) -> Result<()> {
        let code = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        if code != 0 {
            return Err(pthread_err("mutex_lock", code));
        }
        Ok(())
    }

    /// Acquire the lock without blocking.
    pub fn try_lock(&self) -> Result<Wait> {
        let code = unsafe { libc::pthread_mutex_trylock(self.inner.get()) };
        wait_outcome("mutex_try_lock", code)
    }

    /// Acquire the lock, blocking no later than an absolute time limit.
    pub fn abstimed_lock(&self, lim: TimeSpec) -> Result<Wait> {
        let ts = lim.to_libc();
        let code = unsafe { libc::pthread_mutex_timedlock(self.inner.get(), &ts) };
        wait_outcome("mutex_abstimed_lock", code)
    }

    /// Acquire the lock, blocking no longer than `secs` seconds.
    pub fn timed_lock(&self, secs: f64) -> Result<Wait> {
        self.lock_deadline(&Deadline::after(secs)?)
    }

    /// Acquire the lock against a pre-computed deadline.
    pub fn lock_deadline(&self, deadline: &Deadline) -> Result<Wait> {
        match deadline {
            Deadline::Immediate => self.try_lock(),
            Deadline::Forever => self.lock().map(|()| Wait::Done),
            Deadline::At(lim) => self.abstimed_lock(*lim),
        }
    }

    /// Release the lock.
    pub fn unlock(&self) -> Result<()> {
        let code = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if code != 0 {
            return Err(pthread_err("mutex_unlock", code));
        }
        Ok(())
    }
}

/// Process-shared condition variable.
#[repr(C)]
pub struct SharedCond {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCond {}
unsafe impl Sync for SharedCond {}

impl SharedCond {
    /// Initialize the condition variable in place.
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(&self, sharing: Sharing) -> Result<()> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
            let code = libc::pthread_condattr_init(attr.as_mut_ptr());
            if code != 0 {
                return Err(pthread_err("cond_init", code));
            }
            if sharing == Sharing::Shared {
                let code = libc::pthread_condattr_setpshared(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                );
                if code != 0 {
                    libc::pthread_condattr_destroy(attr.as_mut_ptr());
                    return Err(pthread_err("cond_init", code));
                }
            }
            let code = libc::pthread_cond_init(self.inner.get(), attr.as_ptr());
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            if code != 0 {
                return Err(pthread_err("cond_init", code));
            }
        }
        Ok(())
    }

    /// Destroy the condition variable.
    ///
    /// # Safety
    /// No thread of any process may be waiting on it.
    pub unsafe fn destroy(&self) -> Result<()> {
        let code = unsafe { libc::pthread_cond_destroy(self.inner.get()) };
        if code != 0 {
            return Err(pthread_err("cond_destroy", code));
        }
        Ok(())
    }

    /// Wake at most one waiting thread.
    pub fn signal(&self) -> Result<()> {
        let code = unsafe { libc::pthread_cond_signal(self.inner.get()) };
        if code != 0 {
            return Err(pthread_err("cond_signal", code));
        }
        Ok(())
    }

    /// Wake every waiting thread.
    pub fn broadcast(&self) -> Result<()> {
        let code = unsafe { libc::pthread_cond_broadcast(self.inner.get()) };
        if code != 0 {
            return Err(pthread_err("cond_broadcast", code));
        }
        Ok(())
    }

    /// Wait for a signal, atomically releasing and re-acquiring `mutex`.
    ///
    /// The caller must hold `mutex`.
    pub fn wait(&self, mutex: &SharedMutex) -> Result<()> {
        let code = unsafe { libc::pthread_cond_wait(self.inner.get(), mutex.inner.get()) };
        if code != 0 {
            return Err(pthread_err("cond_wait", code));
        }
        Ok(())
    }

    /// Wait for a signal, blocking no later than an absolute time limit.
    pub fn abstimed_wait(&self, mutex: &SharedMutex, lim: TimeSpec) -> Result<Wait> {
        let ts = lim.to_libc();
        let code =
            unsafe { libc::pthread_cond_timedwait(self.inner.get(), mutex.inner.get(), &ts) };
        wait_outcome("cond_abstimed_wait", code)
    }

    /// Wait for a signal, blocking no longer than `secs` seconds.
    pub fn timed_wait(&self, mutex: &SharedMutex, secs: f64) -> Result<Wait> {
        self.wait_deadline(mutex, &Deadline::after(secs)?)
    }

    /// Wait for a signal against a pre-computed deadline.
    ///
    /// An [`Deadline::Immediate`] deadline does not block and reports
    /// [`Wait::TimedOut`] directly.
    pub fn wait_deadline(&self, mutex: &SharedMutex, deadline: &Deadline) -> Result<Wait> {
        match deadline {
            Deadline::Immediate => Ok(Wait::TimedOut),
            Deadline::Forever => self.wait(mutex).map(|()| Wait::Done),
            Deadline::At(lim) => self.abstimed_wait(mutex, *lim),
        }
    }
}

/// Process-shared counting semaphore.
#[repr(C)]
pub struct SharedSem {
    inner: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for SharedSem {}
unsafe impl Sync for SharedSem {}

impl SharedSem {
    /// Initialize the semaphore in place with an initial `value`.
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(&self, sharing: Sharing, value: u32) -> Result<()> {
        let pshared = if sharing == Sharing::Shared { 1 } else { 0 };
        if unsafe { libc::sem_init(self.inner.get(), pshared, value) } != 0 {
            return Err(Error::last_os_error("sem_init"));
        }
        Ok(())
    }

    /// Destroy the semaphore.
    ///
    /// # Safety
    /// No thread of any process may be waiting on it.
    pub unsafe fn destroy(&self) -> Result<()> {
        if unsafe { libc::sem_destroy(self.inner.get()) } != 0 {
            return Err(Error::last_os_error("sem_destroy"));
        }
        Ok(())
    }

    /// Increment the semaphore, waking one waiter if any.
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.inner.get()) } != 0 {
            return Err(Error::last_os_error("sem_post"));
        }
        Ok(())
    }

    /// Decrement the semaphore, blocking while its value is zero.
    pub fn wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(Error::last_os_error("sem_wait"));
            }
        }
    }

    /// Decrement the semaphore without blocking.
    pub fn try_wait(&self) -> Result<Wait> {
        if unsafe { libc::sem_trywait(self.inner.get()) } == 0 {
            return Ok(Wait::Done);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => Ok(Wait::TimedOut),
            Some(code) => Err(Error::new("sem_try_wait", ErrorKind::Errno(code))),
            None => Err(Error::new("sem_try_wait", ErrorKind::SystemError)),
        }
    }

    /// Decrement the semaphore, blocking no later than an absolute limit.
    pub fn abstimed_wait(&self, lim: TimeSpec) -> Result<Wait> {
        let ts = lim.to_libc();
        loop {
            if unsafe { libc::sem_timedwait(self.inner.get(), &ts) } == 0 {
                return Ok(Wait::Done);
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(Wait::TimedOut),
                Some(code) => return Err(Error::new("sem_abstimed_wait", ErrorKind::Errno(code))),
                None => return Err(Error::new("sem_abstimed_wait", ErrorKind::SystemError)),
            }
        }
    }

    /// Decrement the semaphore, blocking no longer than `secs` seconds.
    pub fn timed_wait(&self, secs: f64) -> Result<Wait> {
        match Deadline::after(secs)? {
            Deadline::Immediate => self.try_wait(),
            Deadline::Forever => self.wait().map(|()| Wait::Done),
            Deadline::At(lim) => self.abstimed_wait(lim),
        }
    }
}
