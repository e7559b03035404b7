//! The remote camera shared object.
//!
//! Layout of the shared segment:
//!
//! ```text
//! [ remote object header | camera body | ring of nbufs slots ]
//! ```
//!
//! The camera body holds the current configuration (published by the
//! server), the configuration argument slot of the `Config` command
//! (written by clients under the command lock) and the segment identifiers
//! of the four preprocessing parameter arrays.  Each ring slot's payload is
//! the segment identifier of the shared array storing that frame.

use std::ops::Deref;

use strehl_common::{Error, ErrorKind, Result, Serial, Shmid};
use strehl_shm::{
    align_up, Command, ObjectFlags, ObjectType, RemoteObject, DATA_ALIGNMENT, REMOTE_HEADER_SIZE,
};

use crate::config::CameraConfig;

/// Offset of the camera body within the shared segment.
pub const CAMERA_BODY_OFFSET: usize = align_up(REMOTE_HEADER_SIZE, DATA_ALIGNMENT);

#[repr(C)]
struct CameraBody {
    /// Current configuration, published by the server.
    config: CameraConfig,
    /// Argument of the `Config` command, written by clients.
    arg_config: CameraConfig,
    /// Segment identifiers of the preprocessing arrays `a`, `b`, `q`, `r`.
    preproc: [i32; 4],
}

/// Offset of the output ring within the shared segment.
pub const RING_OFFSET: usize =
    align_up(CAMERA_BODY_OFFSET + std::mem::size_of::<CameraBody>(), DATA_ALIGNMENT);

/// Stride of the output ring: each slot stores one segment identifier.
pub const RING_STRIDE: usize = DATA_ALIGNMENT;

/// Handle on a remote camera.
pub struct RemoteCamera {
    base: RemoteObject,
}

impl Deref for RemoteCamera {
    type Target = RemoteObject;

    fn deref(&self) -> &RemoteObject {
        &self.base
    }
}

impl RemoteCamera {
    /// Create the shared resources of a remote camera (server side).
    pub fn create(
        owner: &str,
        nbufs: i64,
        config: &CameraConfig,
        flags: ObjectFlags,
    ) -> Result<RemoteCamera> {
        let size = RING_OFFSET + nbufs.max(0) as usize * RING_STRIDE;
        let base = RemoteObject::create(
            owner,
            ObjectType::RemoteCamera,
            nbufs,
            RING_OFFSET,
            RING_STRIDE,
            size,
            flags,
        )?;
        let cam = RemoteCamera { base };
        let body = cam.body();
        // SAFETY: freshly created object, not yet shared.
        unsafe {
            (*body).config = *config;
            (*body).arg_config = *config;
            (*body).preproc = [Shmid::BAD.0; 4];
        }
        Ok(cam)
    }

    /// Attach an existing remote camera.
    pub fn attach(shmid: Shmid) -> Result<RemoteCamera> {
        let base = RemoteObject::attach_as(shmid, ObjectType::RemoteCamera)?;
        if base.size() < RING_OFFSET + base.nbufs() as usize * RING_STRIDE {
            return Err(Error::new("remote_camera_attach", ErrorKind::Corrupted));
        }
        Ok(RemoteCamera { base })
    }

    fn body(&self) -> *mut CameraBody {
        // SAFETY: the segment extends past the body by the creation checks.
        unsafe {
            self.base
                .as_ptr()
                .as_ptr()
                .add(CAMERA_BODY_OFFSET)
                .cast::<CameraBody>()
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Result<CameraConfig> {
        self.lock()?;
        // SAFETY: reads guarded by the object mutex.
        let cfg = unsafe { (*self.body()).config };
        self.unlock()?;
        Ok(cfg)
    }

    /// Validate `config` and queue a `Config` command carrying it.
    ///
    /// Returns the command serial, or `None` when the command could not be
    /// queued before the deadline.
    pub fn configure(&self, config: &CameraConfig, secs: f64) -> Result<Option<Serial>> {
        config.validate()?;
        let Some(guard) = self.lock_for_command(Command::Config, secs)? else {
            return Ok(None);
        };
        // SAFETY: the command guard holds the object mutex.
        unsafe { (*self.body()).arg_config = *config };
        Ok(Some(guard.serial()))
    }

    /// Start acquisition.
    pub fn start(&self, secs: f64) -> Result<Option<Serial>> {
        self.send_simple_command(Command::Start, secs)
    }

    /// Stop acquisition after the current frame.
    pub fn stop(&self, secs: f64) -> Result<Option<Serial>> {
        self.send_simple_command(Command::Stop, secs)
    }

    /// Abort acquisition immediately.
    pub fn abort(&self, secs: f64) -> Result<Option<Serial>> {
        self.send_simple_command(Command::Abort, secs)
    }

    /// Reset the camera after a recoverable error.
    pub fn reset(&self, secs: f64) -> Result<Option<Serial>> {
        self.send_simple_command(Command::Reset, secs)
    }

    /// Segment identifier of preprocessing array `a|b|q|r` (`idx` in 0..4).
    ///
    /// Yields [`Shmid::BAD`] when the current preprocessing level does not
    /// use that array.
    pub fn preprocessing_shmid(&self, idx: usize) -> Result<Shmid> {
        if idx >= 4 {
            return Err(Error::new("camera_preprocessing_shmid", ErrorKind::OutOfRange));
        }
        self.lock()?;
        // SAFETY: reads guarded by the object mutex.
        let (level, raw) = unsafe { ((*self.body()).config.preprocessing, (*self.body()).preproc[idx]) };
        self.unlock()?;
        if idx >= level.used_params() {
            return Ok(Shmid::BAD);
        }
        Ok(Shmid(raw))
    }

    /// Segment identifier of the shared array storing frame `serial`.
    ///
    /// Yields [`Shmid::BAD`] when the serial is zero, not yet acquired, or
    /// already overwritten.
    pub fn image_shmid(&self, serial: Serial) -> Shmid {
        if serial < 1 {
            return Shmid::BAD;
        }
        let mut raw = [0u8; 4];
        match self.fetch_frame(serial, &mut raw) {
            Ok(info) if info.serial == serial => Shmid(i32::from_ne_bytes(raw)),
            _ => Shmid::BAD,
        }
    }

    // ----- server side ------------------------------------------------------

    /// Copy the argument of a pending `Config` command (server side).
    pub fn arg_config(&self) -> Result<CameraConfig> {
        self.lock()?;
        // SAFETY: reads guarded by the object mutex.
        let cfg = unsafe { (*self.body()).arg_config };
        self.unlock()?;
        Ok(cfg)
    }

    /// Publish the configuration now in effect (server side).
    pub fn publish_config(&self, config: &CameraConfig) -> Result<()> {
        self.lock()?;
        // SAFETY: writes guarded by the object mutex.
        unsafe { (*self.body()).config = *config };
        self.broadcast()?;
        self.unlock()
    }

    /// Publish the preprocessing array identifiers (server side).
    pub fn publish_preproc_shmids(&self, shmids: [Shmid; 4]) -> Result<()> {
        self.lock()?;
        // SAFETY: writes guarded by the object mutex.
        unsafe { (*self.body()).preproc = shmids.map(|s| s.0) };
        self.unlock()
    }
}
