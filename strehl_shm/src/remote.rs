//! Remote objects: the command/response protocol and the output-frame ring.
//!
//! A remote object is the shared structure a server publishes so that its
//! clients can drive it.  It extends the shared object base with a single
//! command slot, a monotonic count of processed commands, a server state,
//! and a cyclic list of `nbufs` fixed-stride output buffers.
//!
//! Command flow: a client waits (under the object mutex) for the command
//! slot to be free and the server ready, stores the command, and broadcasts;
//! the serial of the command is one more than the count of processed
//! commands.  The server copies the pending command, executes it without
//! holding the mutex, then clears the slot, advances `ncmds` to the
//! command's serial and broadcasts.
//!
//! Frame flow: the publisher computes the next serial under the mutex, then
//! releases it and fills the ring slot: payload first, then the slot
//! header's mark and time stamp, then the slot serial (release store), then
//! the object serial (release store), and finally a broadcast.  Readers
//! never lock the ring; they re-check the slot serial after copying to
//! detect overwrites.

use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use strehl_common::{
    Deadline, Error, ErrorKind, Result, Serial, Shmid, TimeSpec, Wait,
};

use crate::object::{ObjectHeader, ObjectType, SharedObject, DATA_ALIGNMENT, SUPERTYPE_MASK};
use crate::segment::ObjectFlags;

/// Number of bytes (including the final NUL) of a server owner name.
pub const OWNER_SIZE: usize = 64;

/// Commands understood by remote servers.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// No pending command.
    None = 0,
    /// Reset correction or configuration.
    Reset = 1,
    /// Send actuator commands.
    Send = 2,
    /// Change configuration.
    Config = 3,
    /// Start work.
    Start = 4,
    /// Stop work.
    Stop = 5,
    /// Abort work.
    Abort = 6,
    /// Require the remote server to quit.
    Kill = 7,
}

impl Command {
    /// Decode a raw command tag.
    pub fn from_raw(raw: i32) -> Result<Command> {
        Ok(match raw {
            0 => Command::None,
            1 => Command::Reset,
            2 => Command::Send,
            3 => Command::Config,
            4 => Command::Start,
            5 => Command::Stop,
            6 => Command::Abort,
            7 => Command::Kill,
            _ => return Err(Error::new("command_from_raw", ErrorKind::BadCommand)),
        })
    }

    /// Literal name of the command.
    pub fn name(self) -> &'static str {
        match self {
            Command::None => "none",
            Command::Reset => "reset",
            Command::Send => "send",
            Command::Config => "config",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Abort => "abort",
            Command::Kill => "kill",
        }
    }

    /// Server state entered while this command executes.
    pub fn executing_state(self) -> ServerState {
        match self {
            Command::None => ServerState::Waiting,
            Command::Reset => ServerState::Resetting,
            Command::Send => ServerState::Working,
            Command::Config => ServerState::Configuring,
            Command::Start => ServerState::Starting,
            Command::Stop => ServerState::Stopping,
            Command::Abort => ServerState::Aborting,
            Command::Kill => ServerState::Quitting,
        }
    }
}

/// States of a remote server, in logical ascending order.
///
/// A server is *alive* while its state is strictly below
/// [`ServerState::Unreachable`].
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    /// Server is not yet ready.
    Initializing = 0,
    /// Server is waiting for commands.
    Waiting = 1,
    /// Server is configuring the settings.
    Configuring = 2,
    /// Server is starting its work.
    Starting = 3,
    /// Server is working.
    Working = 4,
    /// Server is stopping its work.
    Stopping = 5,
    /// Server is aborting its work.
    Aborting = 6,
    /// Server is in recoverable error state.
    Error = 7,
    /// Server is attempting a reset.
    Resetting = 8,
    /// Server is about to quit.
    Quitting = 9,
    /// Server is unreachable.
    Unreachable = 10,
}

impl ServerState {
    /// Decode a raw state tag; unknown values read as unreachable.
    pub fn from_raw(raw: i32) -> ServerState {
        match raw {
            0 => ServerState::Initializing,
            1 => ServerState::Waiting,
            2 => ServerState::Configuring,
            3 => ServerState::Starting,
            4 => ServerState::Working,
            5 => ServerState::Stopping,
            6 => ServerState::Aborting,
            7 => ServerState::Error,
            8 => ServerState::Resetting,
            9 => ServerState::Quitting,
            _ => ServerState::Unreachable,
        }
    }

    /// Literal name of the state.
    pub fn name(self) -> &'static str {
        match self {
            ServerState::Initializing => "initializing",
            ServerState::Waiting => "waiting",
            ServerState::Configuring => "configuring",
            ServerState::Starting => "starting",
            ServerState::Working => "working",
            ServerState::Stopping => "stopping",
            ServerState::Aborting => "aborting",
            ServerState::Error => "error",
            ServerState::Resetting => "resetting",
            ServerState::Quitting => "quitting",
            ServerState::Unreachable => "unreachable",
        }
    }

    /// Whether a server in this state is still running.
    pub fn is_alive(self) -> bool {
        self < ServerState::Unreachable
    }

    /// Whether a server in this state accepts a new command.
    pub fn accepts_commands(self) -> bool {
        matches!(self, ServerState::Waiting | ServerState::Error)
    }
}

/// Header of a remote object.
#[repr(C)]
pub struct RemoteHeader {
    /// Base structure.
    pub(crate) base: ObjectHeader,
    nbufs: i64,
    offset: i64,
    stride: i64,
    serial: AtomicI64,
    state: AtomicI32,
    command: i32,
    ncmds: AtomicI64,
    owner: [u8; OWNER_SIZE],
}

/// Header at the start of every ring slot.
#[repr(C)]
pub struct FrameHeader {
    /// Serial number of the frame stored in the slot.
    pub serial: AtomicI64,
    /// User-defined mark.
    pub mark: i64,
    /// Publication time stamp.
    pub time: TimeSpec,
}

/// Size in bytes of a ring slot header.
pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

/// Size in bytes of the remote object header.
///
/// Derived object types lay their own members out at (aligned) offsets past
/// this header.
pub const REMOTE_HEADER_SIZE: usize = std::mem::size_of::<RemoteHeader>();

/// Data-frame descriptor as retrieved by clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Serial number: the requested frame's serial on success, `0` when the
    /// frame lies in the future, `-1` when it has been overwritten.
    pub serial: Serial,
    /// User-defined mark.
    pub mark: i64,
    /// Publication time stamp.
    pub time: TimeSpec,
}

/// Outcome of waiting for an output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WaitOutput {
    /// The frame with this serial is available in the ring.
    Ready(Serial),
    /// The deadline elapsed first.
    TimedOut,
    /// The requested frame has already been overwritten (or lies beyond the
    /// last available one while older frames exist).
    Overwritten,
    /// The server has been killed and the requested frame is beyond the
    /// last available one.
    ServerGone,
}

/// Handle on a remote object.
#[derive(Debug)]
pub struct RemoteObject {
    base: SharedObject,
}

impl Deref for RemoteObject {
    type Target = SharedObject;

    fn deref(&self) -> &SharedObject {
        &self.base
    }
}

/// Queued command whose extended arguments are still being written.
///
/// Returned by [`RemoteObject::lock_for_command`]; the object mutex is held
/// until the guard is dropped, after which the server may pick the command
/// up.
pub struct CommandGuard<'a> {
    obj: &'a RemoteObject,
    serial: Serial,
}

impl CommandGuard<'_> {
    /// Serial number of the queued command.
    pub fn serial(&self) -> Serial {
        self.serial
    }
}

impl Drop for CommandGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.obj.unlock() {
            tracing::warn!(%err, "failed to release command lock");
        }
    }
}

impl RemoteObject {
    /// Create a new remote object.
    ///
    /// The ring of `nbufs` output buffers starts `offset` bytes from the
    /// object base and advances by `stride` bytes per slot; slot `s` (for
    /// `s >= 1`) lives at `offset + ((s - 1) % nbufs) * stride`.  Both
    /// `offset` and `stride` must be multiples of the data alignment and
    /// `size` must cover the whole ring.
    pub fn create(
        owner: &str,
        ty: ObjectType,
        nbufs: i64,
        offset: usize,
        stride: usize,
        size: usize,
        flags: ObjectFlags,
    ) -> Result<RemoteObject> {
        if !ty.is_remote() {
            return Err(Error::new("remote_object_create", ErrorKind::BadType));
        }
        if owner.is_empty() || owner.len() >= OWNER_SIZE {
            return Err(Error::new("remote_object_create", ErrorKind::BadName));
        }
        if nbufs < 2 {
            return Err(Error::new("remote_object_create", ErrorKind::BadBuffers));
        }
        if offset < std::mem::size_of::<RemoteHeader>()
            || offset % DATA_ALIGNMENT != 0
            || stride < FRAME_HEADER_SIZE
            || stride % DATA_ALIGNMENT != 0
        {
            return Err(Error::new("remote_object_create", ErrorKind::BadArgument));
        }
        let ring_end = offset + nbufs as usize * stride;
        if size < ring_end {
            return Err(Error::new("remote_object_create", ErrorKind::BadSize));
        }
        let base = SharedObject::create(ty, size, flags)?;
        let h = base.as_ptr().cast::<RemoteHeader>().as_ptr();
        // SAFETY: freshly created object, not yet shared.
        unsafe {
            (*h).nbufs = nbufs;
            (*h).offset = offset as i64;
            (*h).stride = stride as i64;
            (*h).serial.store(0, Ordering::Release);
            (*h).state.store(ServerState::Initializing as i32, Ordering::Release);
            (*h).command = Command::None as i32;
            (*h).ncmds.store(0, Ordering::Release);
            (*h).owner = [0; OWNER_SIZE];
            (&mut (*h).owner)[..owner.len()].copy_from_slice(owner.as_bytes());
        }
        Ok(RemoteObject { base })
    }

    /// Attach an existing object of the remote family.
    pub fn attach(shmid: Shmid) -> Result<RemoteObject> {
        let base = SharedObject::attach_checked(
            shmid,
            Some((ObjectType::RemoteObject as u32, SUPERTYPE_MASK)),
        )?;
        Ok(RemoteObject { base })
    }

    /// Attach an existing remote object of an exact concrete type.
    pub fn attach_as(shmid: Shmid, ty: ObjectType) -> Result<RemoteObject> {
        if !ty.is_remote() {
            return Err(Error::new("remote_object_attach", ErrorKind::BadType));
        }
        let base = SharedObject::attach_checked(shmid, Some((ty as u32, u32::MAX)))?;
        Ok(RemoteObject { base })
    }

    fn remote(&self) -> &RemoteHeader {
        // SAFETY: geometry validated at creation; attachments carry the tag.
        unsafe { &*self.base.as_ptr().cast::<RemoteHeader>().as_ptr() }
    }

    /// Name of the owning server.
    pub fn owner(&self) -> &str {
        let bytes = &self.remote().owner;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(OWNER_SIZE);
        std::str::from_utf8(&bytes[..end]).unwrap_or("")
    }

    /// Number of entries in the output ring.
    pub fn nbufs(&self) -> i64 {
        self.remote().nbufs
    }

    /// Byte offset from the object base to the first ring slot.
    pub fn ring_offset(&self) -> usize {
        self.remote().offset as usize
    }

    /// Byte stride between successive ring slots.
    pub fn stride(&self) -> usize {
        self.remote().stride as usize
    }

    /// Payload bytes available in each ring slot.
    pub fn payload_capacity(&self) -> usize {
        self.stride() - FRAME_HEADER_SIZE
    }

    /// Serial number of the last published frame (0 before the first).
    pub fn serial(&self) -> Serial {
        self.remote().serial.load(Ordering::Acquire)
    }

    /// Number of commands processed so far by the server.
    pub fn ncmds(&self) -> Serial {
        self.remote().ncmds.load(Ordering::Acquire)
    }

    /// Current server state.
    pub fn state(&self) -> ServerState {
        ServerState::from_raw(self.remote().state.load(Ordering::Acquire))
    }

    /// Whether the owning server is still running.
    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    /// Pending command tag; only meaningful while holding the mutex.
    fn pending_command(&self) -> Command {
        Command::from_raw(self.remote().command).unwrap_or(Command::None)
    }

    fn set_pending_command(&self, cmd: Command) {
        let h = self.base.as_ptr().cast::<RemoteHeader>().as_ptr();
        // Guarded by the object mutex.
        unsafe { (*h).command = cmd as i32 };
    }

    /// Address of the ring slot that stores (or will store) frame `serial`.
    fn slot(&self, serial: Serial) -> *mut FrameHeader {
        debug_assert!(serial >= 1);
        let index = ((serial - 1) % self.nbufs()) as usize;
        let offset = self.ring_offset() + index * self.stride();
        // SAFETY: offset stays inside the segment by the creation checks.
        unsafe { self.base.as_ptr().as_ptr().add(offset).cast::<FrameHeader>() }
    }

    fn slot_payload(&self, slot: *mut FrameHeader) -> *mut u8 {
        // SAFETY: the slot extends `stride` bytes past its header.
        unsafe { slot.cast::<u8>().add(FRAME_HEADER_SIZE) }
    }

    // ----- client side ------------------------------------------------------

    /// Wait for the server to accept a command, then queue `cmd`.
    ///
    /// On success the object mutex is held by the returned guard so that the
    /// caller can write the command's extended arguments; dropping the guard
    /// hands the command to the server.  `Ok(None)` means the command could
    /// not be queued before the deadline (including the case of a server
    /// that quit in the meantime).
    pub fn lock_for_command(&self, cmd: Command, secs: f64) -> Result<Option<CommandGuard<'_>>> {
        if cmd == Command::None {
            return Err(Error::new("remote_lock_for_command", ErrorKind::BadCommand));
        }
        let deadline = Deadline::after(secs)?;
        if self.lock_deadline(&deadline)?.timed_out() {
            return Ok(None);
        }
        loop {
            let state = self.state();
            if state >= ServerState::Quitting {
                self.unlock()?;
                return Ok(None);
            }
            if self.pending_command() == Command::None && state.accepts_commands() {
                break;
            }
            if self.wait_deadline(&deadline)?.timed_out() {
                self.unlock()?;
                return Ok(None);
            }
        }
        let serial = self.ncmds() + 1;
        self.set_pending_command(cmd);
        self.broadcast()?;
        Ok(Some(CommandGuard { obj: self, serial }))
    }

    /// Send a command that takes no extended arguments.
    ///
    /// Returns the command serial, or `None` if the command could not be
    /// queued before the deadline.
    pub fn send_simple_command(&self, cmd: Command, secs: f64) -> Result<Option<Serial>> {
        Ok(self.lock_for_command(cmd, secs)?.map(|guard| guard.serial()))
    }

    /// Ask the server to quit.
    pub fn kill(&self, secs: f64) -> Result<Option<Serial>> {
        self.send_simple_command(Command::Kill, secs)
    }

    /// Wait for command `num` to have been processed.
    ///
    /// Reports [`Wait::TimedOut`] when the deadline elapses first, or when
    /// the server quits before processing the command.
    pub fn wait_command(&self, num: Serial, secs: f64) -> Result<Wait> {
        let deadline = Deadline::after(secs)?;
        if self.lock_deadline(&deadline)?.timed_out() {
            return Ok(Wait::TimedOut);
        }
        loop {
            if self.ncmds() >= num {
                self.unlock()?;
                return Ok(Wait::Done);
            }
            if !self.is_alive() {
                self.unlock()?;
                return Ok(Wait::TimedOut);
            }
            if self.wait_deadline(&deadline)?.timed_out() {
                self.unlock()?;
                return Ok(Wait::TimedOut);
            }
        }
    }

    /// Wait for output frame `num` to be available.
    ///
    /// `num <= 0` waits for the next frame published after the call.
    pub fn wait_output(&self, num: Serial, secs: f64) -> Result<WaitOutput> {
        let deadline = Deadline::after(secs)?;
        if self.lock_deadline(&deadline)?.timed_out() {
            return Ok(WaitOutput::TimedOut);
        }
        let requested = if num <= 0 { self.serial() + 1 } else { num };
        loop {
            let serial = self.serial();
            if serial >= requested {
                let slot_serial =
                    unsafe { (*self.slot(requested)).serial.load(Ordering::Acquire) };
                self.unlock()?;
                return Ok(if slot_serial == requested {
                    WaitOutput::Ready(requested)
                } else {
                    WaitOutput::Overwritten
                });
            }
            if !self.is_alive() {
                self.unlock()?;
                return Ok(WaitOutput::ServerGone);
            }
            if self.wait_deadline(&deadline)?.timed_out() {
                self.unlock()?;
                return Ok(WaitOutput::TimedOut);
            }
        }
    }

    /// Copy the payload of frame `serial` out of the ring without locking.
    ///
    /// After the copy the slot serial is re-read: on mismatch the outputs
    /// are zero-filled and the reported serial is `0` (frame still in the
    /// future) or `-1` (frame overwritten).  This gives a lock-free reader
    /// provided the ring has enough slack.
    pub fn fetch_frame(&self, serial: Serial, out: &mut [u8]) -> Result<FrameInfo> {
        if serial < 1 {
            return Err(Error::new("remote_fetch_frame", ErrorKind::BadSerial));
        }
        if out.len() > self.payload_capacity() {
            return Err(Error::new("remote_fetch_frame", ErrorKind::BadSize));
        }
        let slot = self.slot(serial);
        // SAFETY: slot points at a valid ring entry; concurrent writes are
        // detected through the serial re-check below.
        let (mark, time) = unsafe { ((*slot).mark, (*slot).time) };
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_payload(slot), out.as_mut_ptr(), out.len());
        }
        let check = unsafe { (*slot).serial.load(Ordering::Acquire) };
        if check == serial {
            Ok(FrameInfo { serial, mark, time })
        } else {
            out.fill(0);
            Ok(FrameInfo {
                serial: if check < serial { 0 } else { -1 },
                mark: 0,
                time: TimeSpec::ZERO,
            })
        }
    }

    // ----- server side ------------------------------------------------------

    /// Store the server state without notifying waiters.
    pub fn set_state(&self, state: ServerState) {
        self.remote().state.store(state as i32, Ordering::Release);
    }

    /// Store the server state and wake every waiter.
    pub fn announce_state(&self, state: ServerState) -> Result<()> {
        self.lock()?;
        self.set_state(state);
        self.broadcast()?;
        self.unlock()
    }

    /// Wait for a client command, entering the command's executing state.
    ///
    /// Returns the command and its serial, or `None` if no command arrived
    /// before the deadline.  The pending-command slot stays occupied until
    /// [`RemoteObject::finish_command`] so that clients keep waiting.
    pub fn take_command(&self, secs: f64) -> Result<Option<(Command, Serial)>> {
        let deadline = Deadline::after(secs)?;
        if self.lock_deadline(&deadline)?.timed_out() {
            return Ok(None);
        }
        loop {
            let cmd = self.pending_command();
            if cmd != Command::None {
                let serial = self.ncmds() + 1;
                self.set_state(cmd.executing_state());
                self.broadcast()?;
                self.unlock()?;
                return Ok(Some((cmd, serial)));
            }
            if self.wait_deadline(&deadline)?.timed_out() {
                self.unlock()?;
                return Ok(None);
            }
        }
    }

    /// Complete command `num`, entering `state` and waking every waiter.
    pub fn finish_command(&self, num: Serial, state: ServerState) -> Result<()> {
        self.lock()?;
        self.set_pending_command(Command::None);
        self.set_state(state);
        self.remote().ncmds.store(num, Ordering::Release);
        self.broadcast()?;
        self.unlock()
    }

    /// Publish the next output frame.
    ///
    /// `fill` receives the slot payload to populate; header fields and
    /// serials are stored afterwards in publication order, and waiters are
    /// notified last.  Returns the serial of the published frame.
    pub fn publish_frame<F>(&self, mark: i64, fill: F) -> Result<Serial>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        self.lock()?;
        let serial = self.serial() + 1;
        self.unlock()?;

        let slot = self.slot(serial);
        let payload = unsafe {
            std::slice::from_raw_parts_mut(self.slot_payload(slot), self.payload_capacity())
        };
        fill(payload)?;
        let time = TimeSpec::now()?;
        // Publication order: payload, mark, time, slot serial, object serial.
        unsafe {
            (*slot).mark = mark;
            (*slot).time = time;
            (*slot).serial.store(serial, Ordering::Release);
        }
        self.remote().serial.store(serial, Ordering::Release);

        self.lock()?;
        self.broadcast()?;
        self.unlock()?;
        Ok(serial)
    }

    /// Mark the server as gone and wake every waiter.
    ///
    /// Called after the server event loop exits so that blocked
    /// [`RemoteObject::wait_output`] callers observe
    /// [`WaitOutput::ServerGone`].
    pub fn mark_unreachable(&self) -> Result<()> {
        self.announce_state(ServerState::Unreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_remote(nbufs: i64, payload: usize) -> RemoteObject {
        let offset = crate::object::align_up(
            std::mem::size_of::<RemoteHeader>(),
            DATA_ALIGNMENT,
        );
        let stride = crate::object::align_up(FRAME_HEADER_SIZE + payload, DATA_ALIGNMENT);
        let size = offset + nbufs as usize * stride;
        RemoteObject::create(
            "test-server",
            ObjectType::RemoteObject,
            nbufs,
            offset,
            stride,
            size,
            ObjectFlags::empty(),
        )
        .unwrap()
    }

    #[test]
    fn creation_validates_arguments() {
        let offset = crate::object::align_up(
            std::mem::size_of::<RemoteHeader>(),
            DATA_ALIGNMENT,
        );
        let stride = 64;
        let err = RemoteObject::create(
            "x",
            ObjectType::RemoteObject,
            1,
            offset,
            stride,
            offset + stride,
            ObjectFlags::empty(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadBuffers);

        let err = RemoteObject::create(
            "",
            ObjectType::RemoteObject,
            2,
            offset,
            stride,
            offset + 2 * stride,
            ObjectFlags::empty(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadName);

        let err = RemoteObject::create(
            "x",
            ObjectType::SharedArray,
            2,
            offset,
            stride,
            offset + 2 * stride,
            ObjectFlags::empty(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadType);
    }

    #[test]
    fn owner_and_geometry() {
        let obj = new_remote(4, 32);
        assert_eq!(obj.owner(), "test-server");
        assert_eq!(obj.nbufs(), 4);
        assert_eq!(obj.serial(), 0);
        assert_eq!(obj.ncmds(), 0);
        assert_eq!(obj.state(), ServerState::Initializing);
        assert!(obj.is_alive());
    }

    #[test]
    fn command_round_trip() {
        let obj = Arc::new(new_remote(2, 32));
        obj.announce_state(ServerState::Waiting).unwrap();

        let server = {
            let obj = Arc::clone(&obj);
            std::thread::spawn(move || {
                let (cmd, num) = obj.take_command(5.0).unwrap().expect("command expected");
                assert_eq!(cmd, Command::Start);
                obj.finish_command(num, ServerState::Waiting).unwrap();
            })
        };

        let num = obj
            .send_simple_command(Command::Start, 5.0)
            .unwrap()
            .expect("queueing should succeed");
        assert_eq!(num, 1);
        assert!(!obj.wait_command(num, 5.0).unwrap().timed_out());
        assert_eq!(obj.ncmds(), 1);
        server.join().unwrap();
    }

    #[test]
    fn commands_execute_in_order() {
        let obj = Arc::new(new_remote(2, 32));
        obj.announce_state(ServerState::Waiting).unwrap();

        let server = {
            let obj = Arc::clone(&obj);
            std::thread::spawn(move || {
                for _ in 0..2 {
                    let (_, num) = obj.take_command(5.0).unwrap().expect("command");
                    obj.finish_command(num, ServerState::Waiting).unwrap();
                }
            })
        };

        let a = obj.send_simple_command(Command::Start, 5.0).unwrap().unwrap();
        let b = obj.send_simple_command(Command::Stop, 5.0).unwrap().unwrap();
        assert!(a < b);
        assert!(!obj.wait_command(a, 5.0).unwrap().timed_out());
        assert!(!obj.wait_command(b, 5.0).unwrap().timed_out());
        server.join().unwrap();
    }

    #[test]
    fn publish_and_wait_output() {
        let obj = Arc::new(new_remote(4, 32));
        obj.announce_state(ServerState::Waiting).unwrap();

        let publisher = {
            let obj = Arc::clone(&obj);
            std::thread::spawn(move || {
                for i in 1..=3i64 {
                    let s = obj
                        .publish_frame(10 + i, |payload| {
                            payload[..8].copy_from_slice(&i.to_ne_bytes());
                            Ok(())
                        })
                        .unwrap();
                    assert_eq!(s, i);
                }
            })
        };

        match obj.wait_output(3, 5.0).unwrap() {
            WaitOutput::Ready(s) => assert_eq!(s, 3),
            other => panic!("unexpected outcome {other:?}"),
        }
        publisher.join().unwrap();

        let mut payload = [0u8; 8];
        let info = obj.fetch_frame(3, &mut payload).unwrap();
        assert_eq!(info.serial, 3);
        assert_eq!(info.mark, 13);
        assert_eq!(i64::from_ne_bytes(payload), 3);
    }

    #[test]
    fn overwritten_frames_are_detected() {
        let obj = new_remote(2, 32);
        obj.announce_state(ServerState::Waiting).unwrap();
        for i in 1..=5i64 {
            obj.publish_frame(i, |payload| {
                payload[..8].copy_from_slice(&i.to_ne_bytes());
                Ok(())
            })
            .unwrap();
        }
        // Frame 1 lives in slot 0, which now stores frame 5.
        assert_eq!(obj.wait_output(1, 0.0).unwrap(), WaitOutput::Overwritten);

        let mut payload = [0u8; 8];
        let info = obj.fetch_frame(1, &mut payload).unwrap();
        assert_eq!(info.serial, -1);
        assert_eq!(payload, [0u8; 8]);

        // A frame beyond the last published one reads as still-future.
        let info = obj.fetch_frame(6, &mut payload).unwrap();
        assert_eq!(info.serial, 0);
    }

    #[test]
    fn killed_server_wakes_waiters() {
        let obj = Arc::new(new_remote(2, 32));
        obj.announce_state(ServerState::Waiting).unwrap();

        let waiter = {
            let obj = Arc::clone(&obj);
            std::thread::spawn(move || obj.wait_output(1, 30.0).unwrap())
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        obj.mark_unreachable().unwrap();
        assert_eq!(waiter.join().unwrap(), WaitOutput::ServerGone);
        assert!(!obj.is_alive());

        // A dead server accepts no further commands.
        assert_eq!(obj.send_simple_command(Command::Start, 0.1).unwrap(), None);
    }

    #[test]
    fn wait_output_next_frame() {
        let obj = Arc::new(new_remote(4, 32));
        obj.announce_state(ServerState::Waiting).unwrap();
        obj.publish_frame(0, |_| Ok(())).unwrap();

        // num <= 0 waits for the frame after the call, not frame 1.
        let waiter = {
            let obj = Arc::clone(&obj);
            std::thread::spawn(move || obj.wait_output(0, 5.0).unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        obj.publish_frame(0, |_| Ok(())).unwrap();
        assert_eq!(waiter.join().unwrap(), WaitOutput::Ready(2));
    }
}
