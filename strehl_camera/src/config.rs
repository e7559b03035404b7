//! Camera configuration.
//!
//! [`CameraConfig`] is a plain `#[repr(C)]` structure: it is stored verbatim
//! inside the remote camera shared object (both as the current configuration
//! and as the argument slot of the `Config` command), so it must not contain
//! pointers or any other process-local state.

use serde::{Deserialize, Serialize};
use strehl_common::{Colorant, ElType, Encoding, Error, ErrorKind, Result, TimeSpec};

/// Number of named attributes carried by a camera configuration.
pub const ATTR_COUNT: usize = 50;

/// Maximum length of an attribute name (bytes, including no terminator).
pub const ATTR_NAME_SIZE: usize = 32;

/// Level of image preprocessing applied by the frame grabber.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preprocessing {
    /// Just convert pixel values.
    None = 0,
    /// Apply affine correction.
    Affine = 1,
    /// Apply affine correction and compute weights.
    Full = 2,
}

impl Preprocessing {
    /// Decode a raw tag.
    pub fn from_raw(raw: i32) -> Result<Preprocessing> {
        Ok(match raw {
            0 => Preprocessing::None,
            1 => Preprocessing::Affine,
            2 => Preprocessing::Full,
            _ => return Err(Error::new("preprocessing_from_raw", ErrorKind::BadPreprocessing)),
        })
    }

    /// Number of parameter arrays (`a`, `b`, `q`, `r`) this level uses.
    pub fn used_params(self) -> usize {
        match self {
            Preprocessing::None => 0,
            Preprocessing::Affine => 2,
            Preprocessing::Full => 4,
        }
    }
}

/// Region of interest on a camera detector.
///
/// Offsets and binning are in physical pixels, width and height in
/// macro-pixels.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Horizontal binning.
    pub xbin: i64,
    /// Vertical binning.
    pub ybin: i64,
    /// Horizontal offset with respect to the left border of the detector.
    pub xoff: i64,
    /// Vertical offset with respect to the bottom border of the detector.
    pub yoff: i64,
    /// Number of macro-pixels per line.
    pub width: i64,
    /// Number of lines.
    pub height: i64,
}

impl Roi {
    /// Full-detector region with unit binning.
    pub fn full(width: i64, height: i64) -> Roi {
        Roi {
            xbin: 1,
            ybin: 1,
            xoff: 0,
            yoff: 0,
            width,
            height,
        }
    }

    /// Check the region against the detector size.
    pub fn check(&self, sensorwidth: i64, sensorheight: i64) -> Result<()> {
        let bad = Error::new("roi_check", ErrorKind::BadRoi);
        if self.xbin < 1 || self.ybin < 1 || self.xoff < 0 || self.yoff < 0 {
            return Err(bad);
        }
        if self.width < 1 || self.height < 1 {
            return Err(bad);
        }
        if self.xoff + self.width * self.xbin > sensorwidth
            || self.yoff + self.height * self.ybin > sensorheight
        {
            return Err(bad);
        }
        Ok(())
    }
}

/// Value of a named camera attribute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttrValue {
    /// Integer attribute.
    Int(i64),
    /// Floating-point attribute.
    Float(f64),
}

/// A named camera attribute as stored in shared memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Attr {
    name: [u8; ATTR_NAME_SIZE],
    kind: i32,
    _pad: i32,
    ival: i64,
    fval: f64,
}

const ATTR_KIND_NONE: i32 = 0;
const ATTR_KIND_INT: i32 = 1;
const ATTR_KIND_FLOAT: i32 = 2;

impl Attr {
    /// An unused attribute slot.
    pub const EMPTY: Attr = Attr {
        name: [0; ATTR_NAME_SIZE],
        kind: ATTR_KIND_NONE,
        _pad: 0,
        ival: 0,
        fval: 0.0,
    };

    /// Whether the slot holds an attribute.
    pub fn is_set(&self) -> bool {
        self.kind != ATTR_KIND_NONE
    }

    /// Attribute name.
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(ATTR_NAME_SIZE);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Attribute value, if the slot is used.
    pub fn value(&self) -> Option<AttrValue> {
        match self.kind {
            ATTR_KIND_INT => Some(AttrValue::Int(self.ival)),
            ATTR_KIND_FLOAT => Some(AttrValue::Float(self.fval)),
            _ => None,
        }
    }
}

fn default_attrs() -> [Attr; ATTR_COUNT] {
    [Attr::EMPTY; ATTR_COUNT]
}

/// Complete camera configuration.
#[repr(C)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraConfig {
    // Common non-configurable parameters.
    /// Physical pixels per detector row.
    pub sensorwidth: i64,
    /// Physical pixels per detector column.
    pub sensorheight: i64,
    /// Origin of time.
    pub origin: TimeSpec,
    /// Number of frames acquired so far.
    pub frames: i64,
    /// Number of dropped frames.
    pub droppedframes: i64,
    /// Number of frames lost because of overruns.
    pub overruns: i64,
    /// Number of lost frames.
    pub lostframes: i64,
    /// Number of overflows.
    pub overflows: i64,
    /// Number of synchronization losses so far.
    pub lostsyncs: i64,
    /// Number of timeouts so far.
    pub timeouts: i64,

    // Common configurable parameters.
    /// Region of interest on the detector.
    pub roi: Roi,
    /// Acquisition rate in frames per second.
    pub framerate: f64,
    /// Exposure time in seconds.
    pub exposuretime: f64,
    /// Number of acquisition buffers.
    pub buffers: i64,
    /// Pixel type in preprocessed images.
    pub pixeltype: ElType,
    /// Pixel encoding of images acquired by the sensor.
    pub sensorencoding: Encoding,
    /// Pixel encoding of acquisition buffers.
    pub bufferencoding: Encoding,
    /// Level of image preprocessing.
    pub preprocessing: Preprocessing,
    _pad: i32,

    /// Named attributes.
    #[serde(skip, default = "default_attrs")]
    pub attributes: [Attr; ATTR_COUNT],
}

impl CameraConfig {
    /// A consistent configuration for a `width` by `height` detector.
    pub fn new(sensorwidth: i64, sensorheight: i64) -> CameraConfig {
        CameraConfig {
            sensorwidth,
            sensorheight,
            origin: TimeSpec::ZERO,
            frames: 0,
            droppedframes: 0,
            overruns: 0,
            lostframes: 0,
            overflows: 0,
            lostsyncs: 0,
            timeouts: 0,
            roi: Roi::full(sensorwidth, sensorheight),
            framerate: 25.0,
            exposuretime: 0.001,
            buffers: 2,
            pixeltype: ElType::U8,
            sensorencoding: Encoding::mono(8),
            bufferencoding: Encoding::mono(8),
            preprocessing: Preprocessing::None,
            _pad: 0,
            attributes: default_attrs(),
        }
    }

    /// Width of acquired images in macro-pixels.
    pub fn width(&self) -> i64 {
        self.roi.width
    }

    /// Height of acquired images in macro-pixels.
    pub fn height(&self) -> i64 {
        self.roi.height
    }

    /// Look an attribute up by name.
    pub fn attribute(&self, name: &str) -> Option<AttrValue> {
        self.attributes
            .iter()
            .find(|a| a.is_set() && a.name() == name)
            .and_then(|a| a.value())
    }

    /// Define (or redefine) a named attribute.
    ///
    /// Fails with `exhausted` once all [`ATTR_COUNT`] slots are in use.
    pub fn set_attribute(&mut self, name: &str, value: AttrValue) -> Result<()> {
        if name.is_empty() || name.len() >= ATTR_NAME_SIZE {
            return Err(Error::new("camera_set_attribute", ErrorKind::BadName));
        }
        let idx = self
            .attributes
            .iter()
            .position(|a| a.is_set() && a.name() == name)
            .or_else(|| self.attributes.iter().position(|a| !a.is_set()))
            .ok_or(Error::new("camera_set_attribute", ErrorKind::Exhausted))?;
        let slot = &mut self.attributes[idx];
        slot.name = [0; ATTR_NAME_SIZE];
        slot.name[..name.len()].copy_from_slice(name.as_bytes());
        match value {
            AttrValue::Int(v) => {
                slot.kind = ATTR_KIND_INT;
                slot.ival = v;
            }
            AttrValue::Float(v) => {
                slot.kind = ATTR_KIND_FLOAT;
                slot.fval = v;
            }
        }
        Ok(())
    }

    /// Validate the configurable parameters.
    pub fn validate(&self) -> Result<()> {
        if self.sensorwidth < 1 || self.sensorheight < 1 {
            return Err(Error::new("camera_config_validate", ErrorKind::BadSize));
        }
        self.roi.check(self.sensorwidth, self.sensorheight)?;
        if self.buffers < 2 {
            return Err(Error::new("camera_config_validate", ErrorKind::BadBuffers));
        }
        if !(self.framerate > 0.0) || !self.framerate.is_finite() {
            return Err(Error::new("camera_config_validate", ErrorKind::BadFrameRate));
        }
        if !(self.exposuretime > 0.0) || self.exposuretime > 1.0 / self.framerate {
            return Err(Error::new(
                "camera_config_validate",
                ErrorKind::BadExposureTime,
            ));
        }
        if self.preprocessing != Preprocessing::None && !self.pixeltype.is_floating_point() {
            return Err(Error::new("camera_config_validate", ErrorKind::BadPixelType));
        }
        if !crate::pixels::is_supported(self.bufferencoding, self.pixeltype, self.preprocessing) {
            return Err(Error::new("camera_config_validate", ErrorKind::BadEncoding));
        }
        Ok(())
    }

    /// Pixel encoding helper: mono encoding matching the buffer depth.
    pub fn mono_buffer(mut self, bits: u8) -> CameraConfig {
        self.sensorencoding = Encoding::new(Colorant::Mono, bits);
        self.bufferencoding = Encoding::new(Colorant::Mono, bits);
        self
    }
}
