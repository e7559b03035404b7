//! The wavefront sensor server event loop.
//!
//! The server validates proposed configurations, installs them into the
//! primary block before the `Config` command completes, and, while started,
//! invokes a measurement callback for every processed camera frame and
//! publishes its results in the ring.

use strehl_common::{Error, ErrorKind, Result, Serial};
use strehl_shm::{Command, ServerState};
use tracing::{debug, info, warn};

use crate::config::{MeasuredPosition, SensorConfig, ShackData};
use crate::remote::RemoteSensor;

/// Measurement callback: fill `data` (one entry per sub-image) for the next
/// camera frame, returning the mark to attach to the published frame.
///
/// Returning `Ok(None)` means "no frame available right now" (nothing is
/// published); the loop calls again after polling for commands.
pub type Measure<'a> =
    dyn FnMut(&SensorConfig, &mut Vec<ShackData>) -> Result<Option<Serial>> + 'a;

/// The server side of a remote wavefront sensor.
pub struct SensorServer {
    remote: RemoteSensor,
    measuring: bool,
}

impl SensorServer {
    /// Wrap a freshly created remote sensor.
    pub fn new(remote: RemoteSensor) -> SensorServer {
        SensorServer {
            remote,
            measuring: false,
        }
    }

    /// The remote sensor object.
    pub fn remote(&self) -> &RemoteSensor {
        &self.remote
    }

    /// Run the event loop until a `kill` command arrives.
    pub fn run_loop(&mut self, measure: &mut Measure<'_>) -> Result<()> {
        info!(owner = %self.remote.owner(), shmid = %self.remote.shmid(), "sensor server ready");
        self.remote.announce_state(ServerState::Waiting)?;
        let mut data = Vec::new();
        loop {
            if self.measuring {
                let cfg = self.remote.config()?;
                data.clear();
                data.resize(cfg.subs.len(), ShackData::default());
                match measure(&cfg, &mut data) {
                    Ok(Some(mark)) => {
                        self.remote.publish_data(mark, &data)?;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(%err, "measurement failed");
                        self.measuring = false;
                        self.remote.announce_state(ServerState::Error)?;
                    }
                }
            }

            let Some((cmd, num)) = self.remote.take_command(0.01)? else {
                continue;
            };
            debug!(command = cmd.name(), serial = num, "executing command");
            match cmd {
                Command::Config => {
                    let state = match self.install_proposed() {
                        Ok(()) => ServerState::Waiting,
                        Err(err) => {
                            warn!(%err, "configuration rejected");
                            ServerState::Error
                        }
                    };
                    self.remote.finish_command(num, state)?;
                }
                Command::Start => {
                    self.measuring = true;
                    self.remote.finish_command(num, ServerState::Waiting)?;
                }
                Command::Stop | Command::Abort => {
                    self.measuring = false;
                    self.remote.finish_command(num, ServerState::Waiting)?;
                }
                Command::Kill => {
                    self.remote.finish_command(num, ServerState::Quitting)?;
                    break;
                }
                Command::None | Command::Send | Command::Reset => {
                    // Not part of the sensor protocol.
                    self.remote.finish_command(num, ServerState::Error)?;
                }
            }
        }
        self.remote.mark_unreachable()?;
        info!(owner = %self.remote.owner(), "sensor server exited");
        Ok(())
    }

    /// Validate the proposed configuration and swap it into the primary
    /// block; layout changes land before the command completes, so clients
    /// can rely on `wait_command`.
    fn install_proposed(&self) -> Result<()> {
        let cfg = self.remote.proposed_config()?;
        cfg.check(self.remote.max_ninds(), self.remote.max_nsubs())?;
        self.remote.install_config(&cfg)
    }
}

/// Center-of-gravity measurement over one monochrome frame.
///
/// `frame` holds `width * height` pixels, column-major.  For every
/// sub-image the centroid is computed inside the bounding box; the measured
/// position is reported relative to the reference position, the precision
/// matrix is diagonal with the integrated intensity, `alpha` is the mean
/// intensity and `eta` is the fraction of non-zero pixels.
pub fn center_of_gravity(
    cfg: &SensorConfig,
    frame: &[f64],
    width: i64,
    data: &mut [ShackData],
) -> Result<()> {
    if data.len() != cfg.subs.len() {
        return Err(Error::new("center_of_gravity", ErrorKind::BadNumber));
    }
    if width < 1 || frame.len() as i64 % width != 0 {
        return Err(Error::new("center_of_gravity", ErrorKind::BadSize));
    }
    let height = frame.len() as i64 / width;
    for (sub, out) in cfg.subs.iter().zip(data.iter_mut()) {
        if !sub.bbox.fits(width, height) {
            return Err(Error::new("center_of_gravity", ErrorKind::BadBoundingBox));
        }
        let mut sum = 0.0;
        let mut sx = 0.0;
        let mut sy = 0.0;
        let mut lit = 0usize;
        let mut npix = 0usize;
        for y in sub.bbox.ymin..=sub.bbox.ymax {
            for x in sub.bbox.xmin..=sub.bbox.xmax {
                let v = frame[(x as i64 + y as i64 * width) as usize];
                sum += v;
                sx += v * x as f64;
                sy += v * y as f64;
                if v > 0.0 {
                    lit += 1;
                }
                npix += 1;
            }
        }
        out.bbox = sub.bbox;
        out.refpos = sub.refpos;
        if sum > 0.0 {
            out.pos = MeasuredPosition {
                x: sx / sum - sub.refpos.x,
                y: sy / sum - sub.refpos.y,
                wxx: sum,
                wxy: 0.0,
                wyy: sum,
            };
        } else {
            out.pos = MeasuredPosition::default();
        }
        out.alpha = if npix > 0 { sum / npix as f64 } else { 0.0 };
        out.eta = if npix > 0 { lit as f64 / npix as f64 } else { 0.0 };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoundingBox, Position, ShackConfig, SubImage};
    use strehl_common::Shmid;

    #[test]
    fn centroid_of_a_point_source() {
        let width = 8i64;
        let mut frame = vec![0.0f64; 64];
        // Light a single pixel at (5, 2).
        frame[(5 + 2 * width) as usize] = 10.0;

        let cfg = SensorConfig {
            shack: ShackConfig::new([1, 1], 1),
            camera_owner: String::new(),
            camera_shmid: Shmid::BAD,
            camera_width: 8,
            camera_height: 8,
            inds: vec![0],
            subs: vec![SubImage {
                bbox: BoundingBox { xmin: 0, xmax: 7, ymin: 0, ymax: 7 },
                refpos: Position { x: 3.5, y: 3.5 },
            }],
        };
        let mut data = vec![ShackData::default()];
        center_of_gravity(&cfg, &frame, width, &mut data).unwrap();
        let d = &data[0];
        assert!((d.pos.x - 1.5).abs() < 1e-12);
        assert!((d.pos.y - (-1.5)).abs() < 1e-12);
        assert_eq!(d.pos.wxx, 10.0);
        assert!(d.alpha > 0.0);
        assert!(d.eta > 0.0 && d.eta < 1.0);
    }

    #[test]
    fn dark_sub_image_measures_zero() {
        let cfg = SensorConfig {
            shack: ShackConfig::new([1, 1], 1),
            camera_owner: String::new(),
            camera_shmid: Shmid::BAD,
            camera_width: 4,
            camera_height: 4,
            inds: vec![0],
            subs: vec![SubImage {
                bbox: BoundingBox { xmin: 0, xmax: 3, ymin: 0, ymax: 3 },
                refpos: Position { x: 1.5, y: 1.5 },
            }],
        };
        let frame = vec![0.0f64; 16];
        let mut data = vec![ShackData::default()];
        center_of_gravity(&cfg, &frame, 4, &mut data).unwrap();
        assert_eq!(data[0].pos, MeasuredPosition::default());
        assert_eq!(data[0].eta, 0.0);
    }
}
