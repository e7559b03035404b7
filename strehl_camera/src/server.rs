//! The camera server event loop.
//!
//! Two threads cooperate around a [`parking_lot`] mutex/condvar pair: the
//! *server* (the caller of [`CameraServer::run_loop`]) owns the remote
//! camera, executes the client command protocol and publishes preprocessed
//! frames; the *worker* drives the camera device, acquiring raw buffers and
//! handing the freshest one over.
//!
//! Worker run-levels mirror the device levels: 0 not started, 1 idle, 2
//! acquiring, 3 joinable, 4 join failed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use strehl_common::{ElType, Error, ErrorKind, Result, Shmid, TimeSpec, Wait};
use strehl_shm::{convert_elements, Command, ObjectFlags, ServerState, SharedArray};
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, Preprocessing};
use crate::device::{AcquisitionBuffer, Camera, CameraDevice, DropPolicy, RunLevel};
use crate::pixels::{PixelProcessor, PreprocParams};
use crate::remote::RemoteCamera;

/// Tuning knobs of a camera server.
#[derive(Debug, Clone, Copy)]
pub struct CameraServerOptions {
    /// Disposition of pending acquisition buffers.
    pub drop: DropPolicy,
    /// Maximum time the worker waits for one frame (seconds).
    pub timeout: f64,
    /// Permissions of the remote camera and of every published array.
    pub flags: ObjectFlags,
}

impl Default for CameraServerOptions {
    fn default() -> CameraServerOptions {
        CameraServerOptions {
            drop: DropPolicy::Oldest,
            timeout: 0.1,
            flags: ObjectFlags::empty(),
        }
    }
}

enum WorkerTask {
    Config(Box<CameraConfig>),
    Start,
    Stop,
    Reset,
    Kill,
}

#[derive(Default)]
struct WorkerState {
    runlevel: i32,
    task: Option<WorkerTask>,
    result: Option<Result<()>>,
    frame: Option<AcquisitionBuffer>,
    spare: Option<AcquisitionBuffer>,
    dropped: i64,
    failure: Option<Error>,
}

struct WorkerShared {
    lock: Mutex<WorkerState>,
    cond: Condvar,
}

/// A running camera server.
pub struct CameraServer {
    remote: RemoteCamera,
    shared: Arc<WorkerShared>,
    worker: Option<std::thread::JoinHandle<()>>,
    images: Vec<SharedArray>,
    preproc: [Option<SharedArray>; 4],
    processor: Option<PixelProcessor>,
    config: CameraConfig,
    options: CameraServerOptions,
    nbufs: i64,
}

impl CameraServer {
    /// Create the shared resources and the worker thread for `device`.
    ///
    /// The remote camera advertises `owner`; `nbufs` shared arrays back the
    /// output ring.
    pub fn new(
        owner: &str,
        device: Box<dyn CameraDevice>,
        nbufs: i64,
        options: CameraServerOptions,
    ) -> Result<CameraServer> {
        let camera = Camera::new(device)?;
        let config = *camera.config();
        let remote = RemoteCamera::create(owner, nbufs, &config, options.flags)?;

        let shared = Arc::new(WorkerShared {
            lock: Mutex::new(WorkerState {
                runlevel: 1,
                ..WorkerState::default()
            }),
            cond: Condvar::new(),
        });

        let mut server = CameraServer {
            remote,
            shared: Arc::clone(&shared),
            worker: None,
            images: Vec::new(),
            preproc: [None, None, None, None],
            processor: None,
            config,
            options,
            nbufs,
        };
        server.allocate_outputs(&config)?;

        let timeout = options.timeout;
        let drop_policy = options.drop;
        server.worker = Some(std::thread::spawn(move || {
            worker_main(camera, shared, timeout, drop_policy);
        }));
        Ok(server)
    }

    /// Segment identifier of the remote camera (to advertise to clients).
    pub fn shmid(&self) -> Shmid {
        self.remote.shmid()
    }

    /// Owner name of the server.
    pub fn owner(&self) -> String {
        self.remote.owner().to_string()
    }

    /// The remote camera object.
    pub fn remote(&self) -> &RemoteCamera {
        &self.remote
    }

    /// Run the server event loop until a `kill` command arrives.
    pub fn run_loop(&mut self) -> Result<()> {
        info!(owner = %self.remote.owner(), shmid = %self.remote.shmid(), "camera server ready");
        self.remote.announce_state(ServerState::Waiting)?;
        loop {
            self.drain_frame()?;
            self.drain_failure()?;

            let Some((cmd, num)) = self.remote.take_command(0.01)? else {
                continue;
            };
            debug!(command = cmd.name(), serial = num, "executing command");
            if cmd == Command::Kill {
                let _ = self.execute(cmd);
                self.remote.finish_command(num, ServerState::Quitting)?;
                break;
            }
            let state = match self.execute(cmd) {
                Ok(()) => ServerState::Waiting,
                Err(err) => {
                    warn!(command = cmd.name(), %err, "command failed");
                    ServerState::Error
                }
            };
            self.remote.finish_command(num, state)?;
        }
        self.shutdown();
        info!(owner = %self.remote.owner(), "camera server exited");
        Ok(())
    }

    fn execute(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Config => {
                let cfg = self.remote.arg_config()?;
                cfg.validate()?;
                self.run_task(WorkerTask::Config(Box::new(cfg)))?;
                self.allocate_outputs(&cfg)?;
                self.config = cfg;
                self.remote.publish_config(&cfg)
            }
            Command::Start => self.run_task(WorkerTask::Start),
            Command::Stop | Command::Abort => self.run_task(WorkerTask::Stop),
            Command::Reset => self.run_task(WorkerTask::Reset),
            Command::Kill => self.run_task(WorkerTask::Kill),
            Command::None | Command::Send => {
                Err(Error::new("camera_server_execute", ErrorKind::BadCommand))
            }
        }
    }

    fn run_task(&self, task: WorkerTask) -> Result<()> {
        let mut st = self.shared.lock.lock();
        st.task = Some(task);
        st.result = None;
        self.shared.cond.notify_all();
        while st.result.is_none() && st.runlevel < 3 {
            self.shared
                .cond
                .wait_for(&mut st, Duration::from_millis(500));
        }
        st.result.take().unwrap_or(Ok(()))
    }

    fn drain_failure(&mut self) -> Result<()> {
        let failure = {
            let mut st = self.shared.lock.lock();
            st.failure.take()
        };
        if let Some(err) = failure {
            warn!(%err, "acquisition failure");
            self.remote.announce_state(ServerState::Error)?;
        }
        Ok(())
    }

    fn drain_frame(&mut self) -> Result<()> {
        let buf = {
            let mut st = self.shared.lock.lock();
            st.frame.take()
        };
        let Some(buf) = buf else { return Ok(()) };
        self.publish(&buf)?;
        // Recycle the buffer allocation.
        let mut st = self.shared.lock.lock();
        if st.spare.is_none() {
            st.spare = Some(buf);
        }
        Ok(())
    }

    fn publish(&mut self, buf: &AcquisitionBuffer) -> Result<()> {
        let Some(processor) = self.processor else {
            return Ok(());
        };
        let serial = self.remote.serial() + 1;
        let index = ((serial - 1) % self.nbufs) as usize;
        let npix = processor.npixels();
        let elsize = self.config.pixeltype.size();

        // Field-disjoint borrows: the parameter slices come from
        // `self.preproc`, the output image from `self.images`.
        let params = if self.config.preprocessing == Preprocessing::None {
            None
        } else {
            Some(PreprocParams {
                a: self.preproc[0].as_ref().map(|a| a.as_bytes()).unwrap_or(&[]),
                b: self.preproc[1].as_ref().map(|a| a.as_bytes()).unwrap_or(&[]),
                q: self.preproc[2].as_ref().map(|a| a.as_bytes()).unwrap_or(&[]),
                r: self.preproc[3].as_ref().map(|a| a.as_bytes()).unwrap_or(&[]),
            })
        };
        let image = &mut self.images[index];
        // A reader still holding the array means the ring is too short for
        // that client; drop the frame rather than stall the loop.
        if image.timed_wrlock(self.options.timeout)?.timed_out() {
            let mut st = self.shared.lock.lock();
            st.dropped += 1;
            return Ok(());
        }
        let raw = &buf.data[buf.offset..];
        let result = {
            let bytes = image.as_bytes_mut();
            match self.config.preprocessing {
                Preprocessing::Full => {
                    let (dat, wgt) = bytes.split_at_mut(npix * elsize);
                    processor.process(raw, buf.stride, dat, Some(wgt), params.as_ref())
                }
                _ => processor.process(raw, buf.stride, bytes, None, params.as_ref()),
            }
        };
        if let Err(err) = result {
            image.unlock_write()?;
            return Err(err);
        }
        image.set_timestamp(0, buf.frame_start)?;
        image.set_timestamp(1, buf.frame_end)?;
        image.set_timestamp(2, buf.buffer_ready)?;
        image.set_timestamp(3, TimeSpec::now()?)?;
        image.set_serial(serial);
        let shmid = image.shmid();
        image.unlock_write()?;

        let published = self.remote.publish_frame(buf.serial, |payload| {
            payload[..4].copy_from_slice(&shmid.0.to_ne_bytes());
            Ok(())
        })?;
        debug_assert_eq!(published, serial);
        Ok(())
    }

    /// (Re)allocate the output ring and the preprocessing arrays for `cfg`.
    fn allocate_outputs(&mut self, cfg: &CameraConfig) -> Result<()> {
        let width = cfg.roi.width as usize;
        let height = cfg.roi.height as usize;
        let processor = PixelProcessor::new(
            cfg.bufferencoding,
            cfg.pixeltype,
            cfg.preprocessing,
            width,
            height,
        )?;

        let dims: Vec<i64> = match cfg.preprocessing {
            Preprocessing::Full => vec![width as i64, height as i64, 2],
            _ => vec![width as i64, height as i64],
        };
        let mut images = Vec::with_capacity(self.nbufs as usize);
        for _ in 0..self.nbufs {
            images.push(SharedArray::create(cfg.pixeltype, &dims, self.options.flags)?);
        }

        // Neutral calibration: a = 1, b = 0, q = 1, r = 1.
        let mut preproc: [Option<SharedArray>; 4] = [None, None, None, None];
        let neutral = [1.0f64, 0.0, 1.0, 1.0];
        for (idx, slot) in preproc.iter_mut().enumerate().take(cfg.preprocessing.used_params()) {
            let mut arr = SharedArray::create(
                cfg.pixeltype,
                &[width as i64, height as i64],
                self.options.flags,
            )?;
            let fill = vec![neutral[idx]; width * height];
            let fill_bytes = unsafe {
                std::slice::from_raw_parts(fill.as_ptr().cast::<u8>(), fill.len() * 8)
            };
            let n = fill.len();
            convert_elements(ElType::F64, fill_bytes, cfg.pixeltype, arr.as_bytes_mut(), n)?;
            *slot = Some(arr);
        }

        let shmids = [
            preproc[0].as_ref().map_or(Shmid::BAD, |a| a.shmid()),
            preproc[1].as_ref().map_or(Shmid::BAD, |a| a.shmid()),
            preproc[2].as_ref().map_or(Shmid::BAD, |a| a.shmid()),
            preproc[3].as_ref().map_or(Shmid::BAD, |a| a.shmid()),
        ];
        self.remote.publish_preproc_shmids(shmids)?;

        self.images = images;
        self.preproc = preproc;
        self.processor = Some(processor);
        Ok(())
    }

    fn shutdown(&mut self) {
        // The worker exits on the Kill task; join it and tell the world.
        if let Some(handle) = self.worker.take() {
            let joined = handle.join();
            let mut st = self.shared.lock.lock();
            st.runlevel = if joined.is_ok() { 3 } else { 4 };
        }
        if let Err(err) = self.remote.mark_unreachable() {
            warn!(%err, "failed to mark remote camera unreachable");
        }
    }

    /// Number of frames dropped because readers held the ring too long or
    /// the publisher lagged.
    pub fn dropped_frames(&self) -> i64 {
        self.shared.lock.lock().dropped
    }
}

impl Drop for CameraServer {
    fn drop(&mut self) {
        // A server dropped without running its loop still owns a live
        // worker; shut the device down before releasing the shared objects.
        if self.worker.is_some() {
            let _ = self.run_task(WorkerTask::Kill);
            if let Some(handle) = self.worker.take() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_main(
    mut camera: Camera,
    shared: Arc<WorkerShared>,
    timeout: f64,
    drop_policy: DropPolicy,
) {
    loop {
        // Pick up a task, or fall through to acquisition when running.
        let task = {
            let mut st = shared.lock.lock();
            loop {
                if let Some(task) = st.task.take() {
                    break Some(task);
                }
                if st.runlevel == 2 {
                    break None;
                }
                shared
                    .cond
                    .wait_for(&mut st, Duration::from_millis(100));
            }
        };

        match task {
            Some(WorkerTask::Config(cfg)) => {
                let result = camera.set_config(&cfg);
                post_result(&shared, result);
            }
            Some(WorkerTask::Start) => {
                let result = camera.start();
                let ok = result.is_ok();
                post_result(&shared, result);
                if ok {
                    shared.lock.lock().runlevel = 2;
                }
            }
            Some(WorkerTask::Stop) => {
                let result = if camera.runlevel() == RunLevel::Acquiring {
                    camera.stop()
                } else {
                    Ok(())
                };
                post_result(&shared, result);
                shared.lock.lock().runlevel = 1;
            }
            Some(WorkerTask::Reset) => {
                let result = camera.reset();
                post_result(&shared, result);
            }
            Some(WorkerTask::Kill) => {
                if camera.runlevel() == RunLevel::Acquiring {
                    let _ = camera.stop();
                }
                let result = camera.finalize();
                let mut st = shared.lock.lock();
                st.result = Some(result);
                st.runlevel = 3;
                shared.cond.notify_all();
                return;
            }
            None => {
                let mut buf = {
                    let mut st = shared.lock.lock();
                    st.spare.take().unwrap_or_default()
                };
                match camera.wait_buffer(&mut buf, timeout, drop_policy) {
                    Ok(Wait::Done) => {
                        let mut st = shared.lock.lock();
                        if let Some(old) = st.frame.replace(buf) {
                            // The server did not keep up; recycle the
                            // overwritten frame.
                            st.dropped += 1;
                            st.spare = Some(old);
                        }
                        shared.cond.notify_all();
                    }
                    Ok(Wait::TimedOut) => {
                        let mut st = shared.lock.lock();
                        st.spare = Some(buf);
                    }
                    Err(err) => {
                        let mut st = shared.lock.lock();
                        st.failure = Some(err);
                        st.runlevel = 1;
                        shared.cond.notify_all();
                    }
                }
            }
        }
    }
}

fn post_result(shared: &WorkerShared, result: Result<()>) {
    let mut st = shared.lock.lock();
    st.result = Some(result);
    shared.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCamera;

    #[test]
    fn server_creates_ring_and_preproc_arrays() {
        let device = Box::new(MockCamera::new(32, 32));
        let server =
            CameraServer::new("cam-ut", device, 4, CameraServerOptions::default()).unwrap();
        assert_eq!(server.remote().nbufs(), 4);
        assert_eq!(server.images.len(), 4);
        // Level none uses no preprocessing arrays.
        assert!(server.preproc.iter().all(|p| p.is_none()));
        assert_eq!(server.owner(), "cam-ut");
    }

    #[test]
    fn full_level_allocates_planes_and_params() {
        let device = Box::new(MockCamera::new(16, 16));
        let mut server =
            CameraServer::new("cam-ut2", device, 2, CameraServerOptions::default()).unwrap();
        let mut cfg = server.config;
        cfg.preprocessing = Preprocessing::Full;
        cfg.pixeltype = ElType::F32;
        server.allocate_outputs(&cfg).unwrap();
        server.config = cfg;
        assert!(server.preproc.iter().all(|p| p.is_some()));
        assert_eq!(server.images[0].dims(), &[16, 16, 2]);
        // Neutral gain is 1.
        let a = server.preproc[0].as_ref().unwrap();
        assert_eq!(a.data::<f32>().unwrap()[0], 1.0);
    }
}
