//! Shack-Hartmann wavefront sensor server.
//!
//! Creates a remote wavefront sensor, advertises its segment identifier in
//! the configuration directory, and runs the measurement loop until a
//! `kill` command (or SIGINT/SIGTERM) arrives.  Once configured against a
//! camera, each measurement pulls the next published frame from the
//! camera's ring and runs the center-of-gravity estimator over the
//! configured sub-images.

use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strehl_camera::RemoteCamera;
use strehl_common::config as cfgdir;
use strehl_common::{ElType, Error, ErrorKind, Serial, Shmid};
use strehl_sensor::{center_of_gravity, RemoteSensor, SensorConfig, SensorServer, ShackData};
use strehl_shm::{convert_elements, ObjectFlags, SharedArray, WaitOutput};

#[derive(Parser, Debug)]
#[command(name = "strehl_wfsserver", about = "STREHL wavefront sensor server")]
struct Args {
    /// Server owner name advertised to clients.
    #[arg(long, default_value = "wfs1")]
    owner: String,

    /// Number of measurement ring buffers.
    #[arg(long, default_value_t = 8)]
    nbufs: i64,

    /// Capacity of the sub-image grid.
    #[arg(long, default_value_t = 1024)]
    max_ninds: i64,

    /// Capacity of the sub-image table.
    #[arg(long, default_value_t = 512)]
    max_nsubs: i64,

    /// Seconds to wait for each camera frame.
    #[arg(long, default_value_t = 1.0)]
    frame_timeout: f64,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Pull one camera frame and measure every sub-image.
struct CameraMeasure {
    camera: Option<(Shmid, RemoteCamera)>,
    frame: Vec<f64>,
    timeout: f64,
}

impl CameraMeasure {
    fn new(timeout: f64) -> CameraMeasure {
        CameraMeasure {
            camera: None,
            frame: Vec::new(),
            timeout,
        }
    }

    fn camera(&mut self, shmid: Shmid) -> strehl_common::Result<&RemoteCamera> {
        if self.camera.as_ref().map(|(id, _)| *id) != Some(shmid) {
            self.camera = Some((shmid, RemoteCamera::attach(shmid)?));
        }
        match &self.camera {
            Some((_, cam)) => Ok(cam),
            None => Err(Error::new("wfs_measure", ErrorKind::NotFound)),
        }
    }

    fn measure(
        &mut self,
        cfg: &SensorConfig,
        data: &mut Vec<ShackData>,
    ) -> strehl_common::Result<Option<Serial>> {
        if !cfg.camera_shmid.is_valid() {
            // Not bound to a camera yet; nothing to measure.
            strehl_common::sleep_secs(0.01);
            return Ok(None);
        }
        let timeout = self.timeout;
        let width = cfg.camera_width;
        let npix = (cfg.camera_width * cfg.camera_height) as usize;
        let camera = self.camera(cfg.camera_shmid)?;
        let serial = match camera.wait_output(0, timeout)? {
            WaitOutput::Ready(serial) => serial,
            WaitOutput::TimedOut | WaitOutput::Overwritten => return Ok(None),
            WaitOutput::ServerGone => {
                return Err(Error::new("wfs_measure", ErrorKind::NotRunning));
            }
        };
        let image_shmid = camera.image_shmid(serial);
        if !image_shmid.is_valid() {
            return Ok(None);
        }
        let image = SharedArray::attach(image_shmid)?;
        if image.nelem() < npix {
            return Err(Error::new("wfs_measure", ErrorKind::BadSize));
        }

        // Snapshot the pixels as doubles under a read lock; the overwrite
        // re-check is the array serial.
        self.frame.resize(npix, 0.0);
        if image.timed_rdlock(timeout)?.timed_out() {
            return Ok(None);
        }
        let frame_bytes = unsafe {
            std::slice::from_raw_parts_mut(self.frame.as_mut_ptr().cast::<u8>(), npix * 8)
        };
        let copied = convert_elements(
            image.eltype(),
            &image.as_bytes()[..npix * image.eltype().size()],
            ElType::F64,
            frame_bytes,
            npix,
        );
        let still_current = image.serial() == serial;
        image.unlock_read()?;
        copied?;
        if !still_current {
            return Ok(None);
        }

        center_of_gravity(cfg, &self.frame, width, data)?;
        Ok(Some(serial))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();
    let args = Args::parse();

    let handler = SigHandler::Handler(on_signal);
    unsafe {
        signal::signal(Signal::SIGINT, handler)?;
        signal::signal(Signal::SIGTERM, handler)?;
    }

    let sensor = RemoteSensor::create(
        &args.owner,
        args.nbufs,
        args.max_ninds,
        args.max_nsubs,
        ObjectFlags::empty(),
    )?;
    cfgdir::write_shmid(&format!("{}/shmid", args.owner), sensor.shmid())?;
    info!(owner = %args.owner, shmid = %sensor.shmid(), "serving");

    let watcher = {
        let remote = RemoteSensor::attach(sensor.shmid())?;
        std::thread::spawn(move || {
            while remote.is_alive() {
                if INTERRUPTED.load(Ordering::Relaxed) {
                    let _ = remote.kill(1.0);
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        })
    };

    let mut measure = CameraMeasure::new(args.frame_timeout);
    let mut server = SensorServer::new(sensor);
    let result = server.run_loop(&mut |cfg, data| measure.measure(cfg, data));
    if let Err(ref err) = result {
        warn!(%err, "sensor server failed");
    }
    INTERRUPTED.store(true, Ordering::Relaxed);
    let _ = watcher.join();
    result.map_err(Into::into)
}
