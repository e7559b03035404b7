//! Shack-Hartmann wavefront sensor configuration.

use serde::{Deserialize, Serialize};
use strehl_common::{Error, ErrorKind, Result, Shmid};

/// Wavefront sensing algorithms.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// Plain center of gravity.
    CenterOfGravity = 0,
    /// Linearized matched filter.
    LinearizedMatchedFilter = 1,
}

impl Algorithm {
    /// Decode a raw tag.
    pub fn from_raw(raw: i32) -> Result<Algorithm> {
        Ok(match raw {
            0 => Algorithm::CenterOfGravity,
            1 => Algorithm::LinearizedMatchedFilter,
            _ => return Err(Error::new("algorithm_from_raw", ErrorKind::BadAlgorithm)),
        })
    }
}

/// Inclusive pixel range on the sensor camera.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Minimum abscissa (inclusive).
    pub xmin: i16,
    /// Maximum abscissa (inclusive).
    pub xmax: i16,
    /// Minimum ordinate (inclusive).
    pub ymin: i16,
    /// Maximum ordinate (inclusive).
    pub ymax: i16,
}

impl BoundingBox {
    /// Whether the box is well formed and fits a `width` by `height` frame.
    pub fn fits(&self, width: i64, height: i64) -> bool {
        self.xmin >= 0
            && self.ymin >= 0
            && self.xmin <= self.xmax
            && self.ymin <= self.ymax
            && (self.xmax as i64) < width
            && (self.ymax as i64) < height
    }
}

/// 2-dimensional position.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Abscissa.
    pub x: f64,
    /// Ordinate.
    pub y: f64,
}

/// Measured 2-dimensional position with its precision matrix.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasuredPosition {
    /// Measured abscissa.
    pub x: f64,
    /// Measured ordinate.
    pub y: f64,
    /// Precision of `x`.
    pub wxx: f64,
    /// Joint precision of `x` and `y`.
    pub wxy: f64,
    /// Precision of `y`.
    pub wyy: f64,
}

/// Definition of one wavefront sensor sub-image.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubImage {
    /// Bounding box of the sub-image.
    pub bbox: BoundingBox,
    /// Reference position in the sub-image.
    pub refpos: Position,
}

/// Elementary datum of a wavefront sensor output frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ShackData {
    /// Bounding box of the sub-image.
    pub bbox: BoundingBox,
    /// Reference position in the sub-image.
    pub refpos: Position,
    /// Measured position, relative to the reference.
    pub pos: MeasuredPosition,
    /// Intensity factor.
    pub alpha: f64,
    /// Quality factor.
    pub eta: f64,
}

/// Fixed-size part of a wavefront sensor configuration.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShackConfig {
    /// Forgetting factor of the running estimates, in `(0, 1]`.
    pub forgetting_factor: f64,
    /// Restoring force pulling measurements back to the reference.
    pub restoring_force: f64,
    /// Maximum excursion of a measurement from its reference.
    pub max_excursion: f64,
    /// Wavefront sensing algorithm.
    pub algorithm: Algorithm,
    _pad: i32,
    /// Dimensions of the sub-image grid.
    pub dims: [i64; 2],
    /// Number of sub-images.
    pub nsubs: i64,
}

impl ShackConfig {
    /// A consistent default configuration for a `dims` sub-image grid.
    pub fn new(dims: [i64; 2], nsubs: i64) -> ShackConfig {
        ShackConfig {
            forgetting_factor: 1.0,
            restoring_force: 0.0,
            max_excursion: 0.0,
            algorithm: Algorithm::CenterOfGravity,
            _pad: 0,
            dims,
            nsubs,
        }
    }

    /// Number of cells in the sub-image grid.
    pub fn ninds(&self) -> i64 {
        self.dims[0] * self.dims[1]
    }

    /// Validate the run-time tunable parameters.
    pub fn check_tunable(&self) -> Result<()> {
        if !(self.forgetting_factor > 0.0 && self.forgetting_factor <= 1.0) {
            return Err(Error::new("shack_check", ErrorKind::BadForgettingFactor));
        }
        if !(self.restoring_force >= 0.0) || !self.restoring_force.is_finite() {
            return Err(Error::new("shack_check", ErrorKind::BadRestoringForce));
        }
        if !(self.max_excursion >= 0.0) || !self.max_excursion.is_finite() {
            return Err(Error::new("shack_check", ErrorKind::BadMaxExcursion));
        }
        Ok(())
    }

    /// Copy the run-time tunable fields of `src`, refusing any change to the
    /// layout-defining fields.
    pub fn tune_from(&mut self, src: &ShackConfig) -> Result<()> {
        if src.algorithm != self.algorithm
            || src.dims != self.dims
            || src.nsubs != self.nsubs
        {
            return Err(Error::new("shack_tune", ErrorKind::ForbiddenChange));
        }
        src.check_tunable()?;
        self.forgetting_factor = src.forgetting_factor;
        self.restoring_force = src.restoring_force;
        self.max_excursion = src.max_excursion;
        Ok(())
    }
}

/// Complete configuration of a remote wavefront sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Fixed-size part.
    pub shack: ShackConfig,
    /// Owner name of the camera serving the raw images.
    pub camera_owner: String,
    /// Segment identifier of the camera's remote object.
    pub camera_shmid: Shmid,
    /// Width of the camera frames.
    pub camera_width: i64,
    /// Height of the camera frames.
    pub camera_height: i64,
    /// Layout indices of the sub-image grid (column-major).
    pub inds: Vec<i64>,
    /// Sub-image definitions.
    pub subs: Vec<SubImage>,
}

impl SensorConfig {
    /// Validate the configuration against capacity limits.
    pub fn check(&self, max_ninds: i64, max_nsubs: i64) -> Result<()> {
        let cfg = &self.shack;
        cfg.check_tunable()?;
        if cfg.dims[0] < 1 || cfg.dims[1] < 1 || cfg.ninds() > max_ninds {
            return Err(Error::new("sensor_check_config", ErrorKind::BadSize));
        }
        if cfg.nsubs < 1 || cfg.nsubs > max_nsubs {
            return Err(Error::new("sensor_check_config", ErrorKind::BadNumber));
        }
        if self.inds.len() as i64 != cfg.ninds() || self.subs.len() as i64 != cfg.nsubs {
            return Err(Error::new("sensor_check_config", ErrorKind::BadNumber));
        }
        if self.camera_width < 1 || self.camera_height < 1 {
            return Err(Error::new("sensor_check_config", ErrorKind::BadSize));
        }
        for &ind in &self.inds {
            if ind < -1 || ind >= cfg.nsubs {
                return Err(Error::new("sensor_check_config", ErrorKind::OutOfRange));
            }
        }
        for sub in &self.subs {
            if !sub.bbox.fits(self.camera_width, self.camera_height) {
                return Err(Error::new("sensor_check_config", ErrorKind::BadBoundingBox));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> SensorConfig {
        let subs = vec![
            SubImage {
                bbox: BoundingBox { xmin: 0, xmax: 7, ymin: 0, ymax: 7 },
                refpos: Position { x: 3.5, y: 3.5 },
            },
            SubImage {
                bbox: BoundingBox { xmin: 8, xmax: 15, ymin: 0, ymax: 7 },
                refpos: Position { x: 11.5, y: 3.5 },
            },
        ];
        SensorConfig {
            shack: ShackConfig::new([2, 1], 2),
            camera_owner: "cam1".to_string(),
            camera_shmid: Shmid(12),
            camera_width: 16,
            camera_height: 8,
            inds: vec![0, 1],
            subs,
        }
    }

    #[test]
    fn valid_configuration_passes() {
        sample_config().check(4, 4).unwrap();
    }

    #[test]
    fn capacity_limits_are_enforced() {
        let cfg = sample_config();
        assert_eq!(cfg.check(1, 4).unwrap_err().kind, ErrorKind::BadSize);
        assert_eq!(cfg.check(4, 1).unwrap_err().kind, ErrorKind::BadNumber);
    }

    #[test]
    fn boxes_must_fit_the_camera() {
        let mut cfg = sample_config();
        cfg.subs[1].bbox.xmax = 16;
        assert_eq!(cfg.check(4, 4).unwrap_err().kind, ErrorKind::BadBoundingBox);
        cfg.subs[1].bbox = BoundingBox { xmin: 5, xmax: 4, ymin: 0, ymax: 7 };
        assert_eq!(cfg.check(4, 4).unwrap_err().kind, ErrorKind::BadBoundingBox);
    }

    #[test]
    fn grid_entries_must_name_sub_images() {
        let mut cfg = sample_config();
        cfg.inds[0] = 2;
        assert_eq!(cfg.check(4, 4).unwrap_err().kind, ErrorKind::OutOfRange);
        cfg.inds[0] = -1;
        cfg.check(4, 4).unwrap();
    }

    #[test]
    fn tunable_fields_only() {
        let mut dst = ShackConfig::new([2, 2], 4);
        let mut src = dst;
        src.forgetting_factor = 0.5;
        src.restoring_force = 0.1;
        dst.tune_from(&src).unwrap();
        assert_eq!(dst.forgetting_factor, 0.5);

        src.nsubs = 5;
        assert_eq!(dst.tune_from(&src).unwrap_err().kind, ErrorKind::ForbiddenChange);

        let mut bad = dst;
        bad.forgetting_factor = 0.0;
        assert_eq!(
            dst.tune_from(&bad).unwrap_err().kind,
            ErrorKind::BadForgettingFactor
        );
    }
}
