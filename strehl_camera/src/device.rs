//! Camera device abstraction.
//!
//! A camera device is defined by the [`CameraDevice`] trait, one
//! implementation per combination of camera model and frame grabber.  The
//! [`Camera`] wrapper owns the device together with a five-level run-level
//! machine and guards every trait call site: methods are only invoked in the
//! run-level documented here, and the methods themselves never change the
//! level.
//!
//! Run-levels: 0 initialization not complete, 1 idle, 2 acquiring, 3
//! recoverable error (explicit reset required), 4 unusable.

use strehl_common::{Encoding, Error, ErrorKind, Result, Serial, TimeSpec, Wait};

use crate::config::CameraConfig;

/// Disposition of pending acquisition buffers in
/// [`CameraDevice::wait_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Deliver the oldest pending buffer.
    #[default]
    Oldest,
    /// Deliver the latest pending buffer, dropping older ones.
    Newest,
    /// Drop every pending buffer and wait for a fresh frame.
    Fresh,
}

/// One acquired raw frame.
///
/// The device fills `data` (resizing as needed) with `height` rows of
/// `stride` bytes; the first pixel of the region of interest lies `offset`
/// bytes in.
#[derive(Debug, Default, Clone)]
pub struct AcquisitionBuffer {
    /// Raw frame bytes.
    pub data: Vec<u8>,
    /// Offset of the first ROI pixel in `data`.
    pub offset: usize,
    /// Pixels per line.
    pub width: i64,
    /// Number of lines.
    pub height: i64,
    /// Bytes per line, padding included.
    pub stride: usize,
    /// Pixel encoding of the buffer.
    pub encoding: Encoding,
    /// Serial number of the frame.
    pub serial: Serial,
    /// Start of the exposure.
    pub frame_start: TimeSpec,
    /// End of the exposure.
    pub frame_end: TimeSpec,
    /// Time the buffer became available.
    pub buffer_ready: TimeSpec,
}

/// Virtual operations of a camera device.
///
/// Implementations may assume that the [`Camera`] wrapper enforces the
/// run-level discipline: `initialize` is called exactly once, `reset` only
/// at run-level 3, `update_config`/`set_config`/`start` only at run-level 1,
/// `stop`/`wait_buffer` only at run-level 2, `finalize` once at the end of
/// the device's life.
pub trait CameraDevice: Send {
    /// Camera model/family name.
    fn name(&self) -> &'static str;

    /// Initialize the device and fill in its current configuration.
    fn initialize(&mut self, config: &mut CameraConfig) -> Result<()>;

    /// Release device resources.
    fn finalize(&mut self) -> Result<()>;

    /// Return the device from a recoverable error to the idle state.
    fn reset(&mut self) -> Result<()>;

    /// Refresh `config` from the current device settings.
    fn update_config(&mut self, config: &mut CameraConfig) -> Result<()>;

    /// Check prospective settings without applying them.
    ///
    /// Pixel conversion parameters (`pixeltype`, `preprocessing`,
    /// `bufferencoding`) are validated by the caller beforehand.
    fn check_config(&self, config: &CameraConfig) -> Result<()>;

    /// Apply settings that have passed [`CameraDevice::check_config`].
    fn set_config(&mut self, config: &CameraConfig) -> Result<()>;

    /// Start acquisition.
    fn start(&mut self) -> Result<()>;

    /// Stop acquisition immediately, without waiting for the current frame.
    fn stop(&mut self) -> Result<()>;

    /// Wait for the next frame, no longer than `secs` seconds.
    ///
    /// Must account for the attempt in the frame counters whatever the
    /// outcome; the caller maintains `config.frames` accordingly.
    fn wait_buffer(
        &mut self,
        buf: &mut AcquisitionBuffer,
        secs: f64,
        drop: DropPolicy,
    ) -> Result<Wait>;
}

/// Run-level of a camera.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunLevel {
    /// Initialization not complete.
    Uninitialized = 0,
    /// Initialized, acquisition stopped.
    Idle = 1,
    /// Acquiring.
    Acquiring = 2,
    /// Recoverable error, reset required.
    RecoverableError = 3,
    /// Unusable, only finalization remains.
    Fatal = 4,
}

/// A camera device together with its run-level machine.
pub struct Camera {
    device: Box<dyn CameraDevice>,
    config: CameraConfig,
    runlevel: RunLevel,
}

impl Camera {
    /// Initialize `device` and wrap it at run-level 1.
    pub fn new(mut device: Box<dyn CameraDevice>) -> Result<Camera> {
        let mut config = CameraConfig::new(1, 1);
        device.initialize(&mut config)?;
        Ok(Camera {
            device,
            config,
            runlevel: RunLevel::Idle,
        })
    }

    /// Current run-level.
    pub fn runlevel(&self) -> RunLevel {
        self.runlevel
    }

    /// Device name.
    pub fn name(&self) -> &'static str {
        self.device.name()
    }

    /// Last known device configuration.
    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Frame counters, mutable (maintained by the acquisition loop).
    pub fn config_mut(&mut self) -> &mut CameraConfig {
        &mut self.config
    }

    fn require(&self, func: &'static str, level: RunLevel) -> Result<()> {
        if self.runlevel == level {
            return Ok(());
        }
        Err(Error::new(
            func,
            match self.runlevel {
                RunLevel::Uninitialized => ErrorKind::NotReady,
                RunLevel::Idle => ErrorKind::NotAcquiring,
                RunLevel::Acquiring => ErrorKind::AcquisitionRunning,
                RunLevel::RecoverableError => ErrorKind::MustReset,
                RunLevel::Fatal => ErrorKind::Unrecoverable,
            },
        ))
    }

    /// Degrade the run-level after a device failure.
    fn degrade(&mut self, err: &Error) {
        self.runlevel = if err.kind == ErrorKind::Unrecoverable {
            RunLevel::Fatal
        } else {
            RunLevel::RecoverableError
        };
    }

    /// Reset the device after a recoverable error.
    ///
    /// A reset at run-level 1 is a no-op.
    pub fn reset(&mut self) -> Result<()> {
        match self.runlevel {
            RunLevel::Idle => Ok(()),
            RunLevel::RecoverableError => {
                self.device.reset()?;
                self.runlevel = RunLevel::Idle;
                Ok(())
            }
            _ => self.require("camera_reset", RunLevel::RecoverableError),
        }
    }

    /// Refresh the cached configuration from the device.
    pub fn update_config(&mut self) -> Result<()> {
        self.require("camera_update_config", RunLevel::Idle)?;
        self.device.update_config(&mut self.config)
    }

    /// Check prospective settings.
    pub fn check_config(&self, config: &CameraConfig) -> Result<()> {
        config.validate()?;
        self.device.check_config(config)
    }

    /// Check and apply new settings.
    pub fn set_config(&mut self, config: &CameraConfig) -> Result<()> {
        self.require("camera_set_config", RunLevel::Idle)?;
        self.check_config(config)?;
        if let Err(err) = self.device.set_config(config) {
            self.degrade(&err);
            return Err(err);
        }
        self.config = *config;
        self.device.update_config(&mut self.config)
    }

    /// Start acquisition.
    pub fn start(&mut self) -> Result<()> {
        self.require("camera_start", RunLevel::Idle)?;
        if let Err(err) = self.device.start() {
            self.degrade(&err);
            return Err(err);
        }
        self.runlevel = RunLevel::Acquiring;
        Ok(())
    }

    /// Stop acquisition.
    pub fn stop(&mut self) -> Result<()> {
        self.require("camera_stop", RunLevel::Acquiring)?;
        if let Err(err) = self.device.stop() {
            self.degrade(&err);
            return Err(err);
        }
        self.runlevel = RunLevel::Idle;
        Ok(())
    }

    /// Wait for the next acquisition buffer.
    ///
    /// The frame counter advances whatever the outcome; timeouts are counted
    /// separately.
    pub fn wait_buffer(
        &mut self,
        buf: &mut AcquisitionBuffer,
        secs: f64,
        drop: DropPolicy,
    ) -> Result<Wait> {
        self.require("camera_wait_buffer", RunLevel::Acquiring)?;
        let outcome = self.device.wait_buffer(buf, secs, drop);
        self.config.frames += 1;
        match outcome {
            Ok(Wait::Done) => Ok(Wait::Done),
            Ok(Wait::TimedOut) => {
                self.config.timeouts += 1;
                Ok(Wait::TimedOut)
            }
            Err(err) => {
                self.degrade(&err);
                Err(err)
            }
        }
    }

    /// Finalize the device; the camera is unusable afterwards.
    pub fn finalize(&mut self) -> Result<()> {
        if self.runlevel == RunLevel::Acquiring {
            let _ = self.device.stop();
        }
        self.runlevel = RunLevel::Fatal;
        self.device.finalize()
    }
}
