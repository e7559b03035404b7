//! The remote deformable mirror shared object.
//!
//! Layout of the shared segment:
//!
//! ```text
//! [ remote object header | mirror body | actuator layout |
//!   reference | perturbation | requested | effective | ring ]
//! ```
//!
//! The four command vectors hold `nacts` doubles each, in this order.  Every
//! telemetry frame published in the ring carries a copy of the four vectors
//! as they were applied.

use std::ops::Deref;

use strehl_common::layout::check_indexed_layout;
use strehl_common::{Error, ErrorKind, Result, Serial, Shmid};
use strehl_shm::{
    align_up, Command, FrameInfo, ObjectFlags, ObjectType, RemoteObject, DATA_ALIGNMENT,
    FRAME_HEADER_SIZE, REMOTE_HEADER_SIZE,
};

/// Offset of the mirror body within the shared segment.
pub const MIRROR_BODY_OFFSET: usize = align_up(REMOTE_HEADER_SIZE, DATA_ALIGNMENT);

#[repr(C)]
struct MirrorBody {
    nacts: i64,
    dims: [i64; 2],
    inds_offset: i64,
    vals_offset: i64,
    cmin: f64,
    cmax: f64,
    /// User mark for the next telemetry frame, guarded by the mutex.
    mark: i64,
}

/// Index of the reference vector among the four command vectors.
pub(crate) const REFERENCE: usize = 0;
/// Index of the perturbation vector.
pub(crate) const PERTURBATION: usize = 1;
/// Index of the requested-commands vector.
pub(crate) const REQUESTED: usize = 2;
/// Index of the effective-commands vector.
pub(crate) const EFFECTIVE: usize = 3;

/// The four command vectors of one telemetry frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorFrame {
    /// Reference commands.
    pub reference: Vec<f64>,
    /// Perturbation applied to this frame.
    pub perturbation: Vec<f64>,
    /// Commands requested by the client.
    pub requested: Vec<f64>,
    /// Commands actually applied to the mirror.
    pub effective: Vec<f64>,
}

/// Handle on a remote deformable mirror.
#[derive(Debug)]
pub struct RemoteMirror {
    base: RemoteObject,
}

impl Deref for RemoteMirror {
    type Target = RemoteObject;

    fn deref(&self) -> &RemoteObject {
        &self.base
    }
}

impl RemoteMirror {
    /// Create the shared resources of a remote deformable mirror.
    ///
    /// `inds` is the actuator layout on a `dims[0]` by `dims[1]` grid
    /// (column-major, `-1` marking absent actuators).  The reference vector
    /// is initialized to `(cmin + cmax) / 2`, the perturbation and command
    /// vectors to zero.
    pub fn create(
        owner: &str,
        nbufs: i64,
        inds: &[i64],
        dims: [i64; 2],
        cmin: f64,
        cmax: f64,
        flags: ObjectFlags,
    ) -> Result<RemoteMirror> {
        let nacts = check_indexed_layout(inds, dims[0], dims[1])?;
        if nacts < 1 {
            return Err(Error::new("remote_mirror_create", ErrorKind::BadNumber));
        }
        if !(cmin < cmax) || !cmin.is_finite() || !cmax.is_finite() {
            return Err(Error::new("remote_mirror_create", ErrorKind::BadRange));
        }
        let ninds = inds.len();
        let inds_offset = align_up(
            MIRROR_BODY_OFFSET + std::mem::size_of::<MirrorBody>(),
            DATA_ALIGNMENT,
        );
        let vals_offset = align_up(inds_offset + ninds * 8, DATA_ALIGNMENT);
        let ring_offset = align_up(vals_offset + 4 * nacts as usize * 8, DATA_ALIGNMENT);
        let stride = align_up(
            FRAME_HEADER_SIZE + 4 * nacts as usize * 8,
            DATA_ALIGNMENT,
        );
        let size = ring_offset + nbufs.max(0) as usize * stride;

        let base = RemoteObject::create(
            owner,
            ObjectType::RemoteMirror,
            nbufs,
            ring_offset,
            stride,
            size,
            flags,
        )?;
        let mirror = RemoteMirror { base };
        // SAFETY: freshly created object, not yet shared.
        unsafe {
            let body = mirror.body();
            (*body).nacts = nacts;
            (*body).dims = dims;
            (*body).inds_offset = inds_offset as i64;
            (*body).vals_offset = vals_offset as i64;
            (*body).cmin = cmin;
            (*body).cmax = cmax;
            (*body).mark = 0;

            let dst = mirror.base.as_ptr().as_ptr().add(inds_offset).cast::<i64>();
            std::ptr::copy_nonoverlapping(inds.as_ptr(), dst, ninds);

            let reference = mirror.vector_ptr(REFERENCE);
            let mid = 0.5 * (cmin + cmax);
            for k in 0..nacts as usize {
                *reference.add(k) = mid;
            }
        }
        Ok(mirror)
    }

    /// Attach an existing remote deformable mirror.
    pub fn attach(shmid: Shmid) -> Result<RemoteMirror> {
        let base = RemoteObject::attach_as(shmid, ObjectType::RemoteMirror)?;
        let mirror = RemoteMirror { base };
        let nacts = mirror.nacts();
        if nacts < 1 || mirror.payload_capacity() < 4 * nacts as usize * 8 {
            return Err(Error::new("remote_mirror_attach", ErrorKind::Corrupted));
        }
        Ok(mirror)
    }

    fn body(&self) -> *mut MirrorBody {
        // SAFETY: the segment extends past the body by the creation checks.
        unsafe {
            self.base
                .as_ptr()
                .as_ptr()
                .add(MIRROR_BODY_OFFSET)
                .cast::<MirrorBody>()
        }
    }

    /// Pointer to one of the four command vectors.
    ///
    /// Mutation requires the object mutex (or a freshly created object).
    unsafe fn vector_ptr(&self, which: usize) -> *mut f64 {
        let body = self.body();
        // SAFETY: offsets written at creation and immutable afterwards.
        unsafe {
            let off = (*body).vals_offset as usize + which * (*body).nacts as usize * 8;
            self.base.as_ptr().as_ptr().add(off).cast::<f64>()
        }
    }

    /// Number of actuators.
    pub fn nacts(&self) -> i64 {
        unsafe { (*self.body()).nacts }
    }

    /// Dimensions of the actuator grid.
    pub fn dims(&self) -> [i64; 2] {
        unsafe { (*self.body()).dims }
    }

    /// Minimal actuator command value.
    pub fn cmin(&self) -> f64 {
        unsafe { (*self.body()).cmin }
    }

    /// Maximal actuator command value.
    pub fn cmax(&self) -> f64 {
        unsafe { (*self.body()).cmax }
    }

    /// The actuator layout (immutable after creation).
    pub fn layout(&self) -> &[i64] {
        let body = self.body();
        // SAFETY: written at creation, never mutated afterwards.
        unsafe {
            let ninds = ((*body).dims[0] * (*body).dims[1]) as usize;
            let ptr = self
                .base
                .as_ptr()
                .as_ptr()
                .add((*body).inds_offset as usize)
                .cast::<i64>();
            std::slice::from_raw_parts(ptr, ninds)
        }
    }

    /// Snapshot of the reference commands.
    pub fn reference(&self) -> Result<Vec<f64>> {
        self.lock()?;
        let nacts = self.nacts() as usize;
        // SAFETY: reads guarded by the object mutex.
        let out = unsafe {
            std::slice::from_raw_parts(self.vector_ptr(REFERENCE), nacts).to_vec()
        };
        self.unlock()?;
        Ok(out)
    }

    fn check_vals(&self, func: &'static str, vals: &[f64]) -> Result<()> {
        if vals.len() != self.nacts() as usize {
            return Err(Error::new(func, ErrorKind::BadNumber));
        }
        Ok(())
    }

    fn queue_vector_command(
        &self,
        cmd: Command,
        which: usize,
        vals: &[f64],
        mark: Option<Serial>,
        secs: f64,
    ) -> Result<Option<(Serial, Serial)>> {
        let Some(guard) = self.lock_for_command(cmd, secs)? else {
            return Ok(None);
        };
        // SAFETY: the command guard holds the object mutex.
        unsafe {
            std::ptr::copy_nonoverlapping(vals.as_ptr(), self.vector_ptr(which), vals.len());
            if let Some(mark) = mark {
                (*self.body()).mark = mark;
            }
        }
        let datnum = self.serial() + 1;
        Ok(Some((guard.serial(), datnum)))
    }

    /// Set the reference for subsequent actuator commands.
    ///
    /// Returns the command serial and the serial of the first telemetry
    /// frame in which the new reference takes effect, or `None` when the
    /// command could not be queued before the deadline.
    pub fn set_reference(&self, vals: &[f64], secs: f64) -> Result<Option<(Serial, Serial)>> {
        self.check_vals("mirror_set_reference", vals)?;
        self.queue_vector_command(Command::Config, REFERENCE, vals, None, secs)
    }

    /// Set a perturbation consumed by the next send.
    ///
    /// When several clients race, the last writer wins.
    pub fn set_perturbation(&self, vals: &[f64], secs: f64) -> Result<Option<(Serial, Serial)>> {
        self.check_vals("mirror_set_perturbation", vals)?;
        self.queue_vector_command(Command::Config, PERTURBATION, vals, None, secs)
    }

    /// Request actuator commands (relative to the reference).
    ///
    /// The applied commands are clamped element-wise to `[cmin, cmax]`; the
    /// published frame at the returned data serial carries `mark`.
    pub fn send_commands(
        &self,
        vals: &[f64],
        mark: Serial,
        secs: f64,
    ) -> Result<Option<(Serial, Serial)>> {
        self.check_vals("mirror_send_commands", vals)?;
        self.queue_vector_command(Command::Send, REQUESTED, vals, Some(mark), secs)
    }

    /// Reset the mirror: equivalent to sending all-zero commands.
    pub fn reset(&self, mark: Serial, secs: f64) -> Result<Option<(Serial, Serial)>> {
        let zeros = vec![0.0; self.nacts() as usize];
        self.send_commands(&zeros, mark, secs)
    }

    /// Fetch the vectors of telemetry frame `serial`.
    pub fn fetch_data(&self, serial: Serial) -> Result<(FrameInfo, MirrorFrame)> {
        let nacts = self.nacts() as usize;
        let mut bytes = vec![0u8; 4 * nacts * 8];
        let info = self.fetch_frame(serial, &mut bytes)?;
        let mut vectors = [const { Vec::new() }; 4];
        for (which, vec) in vectors.iter_mut().enumerate() {
            let start = which * nacts * 8;
            let mut vals = vec![0.0f64; nacts];
            // SAFETY: the byte buffer holds 4 * nacts doubles.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(start),
                    vals.as_mut_ptr().cast::<u8>(),
                    nacts * 8,
                );
            }
            *vec = vals;
        }
        let [reference, perturbation, requested, effective] = vectors;
        Ok((
            info,
            MirrorFrame {
                reference,
                perturbation,
                requested,
                effective,
            },
        ))
    }

    // ----- server side ------------------------------------------------------

    /// Copy one command vector (server side, under the mutex).
    pub(crate) fn read_vector(&self, which: usize, out: &mut [f64]) {
        // SAFETY: caller holds the mutex; `out` sized by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(self.vector_ptr(which), out.as_mut_ptr(), out.len());
        }
    }

    /// Overwrite one command vector (server side, under the mutex).
    pub(crate) fn write_vector(&self, which: usize, vals: &[f64]) {
        // SAFETY: caller holds the mutex.
        unsafe {
            std::ptr::copy_nonoverlapping(vals.as_ptr(), self.vector_ptr(which), vals.len());
        }
    }

    pub(crate) fn take_mark(&self) -> i64 {
        // SAFETY: caller holds the mutex.
        unsafe { (*self.body()).mark }
    }
}
