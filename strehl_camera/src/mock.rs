//! Synthetic camera device for tests and demos.
//!
//! Generates deterministic gradient frames at the configured frame rate:
//! pixel `(x, y)` of frame `s` has the raw value `(x + y + s) mod 2^bits`.
//! Acquisition timing is simulated by sleeping, so timeouts behave like a
//! real frame grabber's.

use strehl_common::{sleep_secs, Encoding, Error, ErrorKind, Result, Serial, TimeSpec, Wait};

use crate::config::CameraConfig;
use crate::device::{AcquisitionBuffer, CameraDevice, DropPolicy};
use crate::pixels;

/// A simulated camera.
pub struct MockCamera {
    sensorwidth: i64,
    sensorheight: i64,
    config: CameraConfig,
    serial: Serial,
    fail_start: Option<ErrorKind>,
}

impl MockCamera {
    /// New simulated camera with the given detector size.
    pub fn new(sensorwidth: i64, sensorheight: i64) -> MockCamera {
        MockCamera {
            sensorwidth,
            sensorheight,
            config: CameraConfig::new(sensorwidth, sensorheight),
            serial: 0,
            fail_start: None,
        }
    }

    /// Make the next `start` fail with `kind` (failure injection for tests).
    pub fn fail_next_start(&mut self, kind: ErrorKind) {
        self.fail_start = Some(kind);
    }

    /// Expected raw value of pixel `(x, y)` in frame `serial`.
    pub fn pixel_value(encoding: Encoding, x: i64, y: i64, serial: Serial) -> u32 {
        let bits = encoding.bits_per_pixel().min(32);
        let mask = if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 };
        ((x + y + serial) as u32) & mask
    }

    fn synthesize(&self, buf: &mut AcquisitionBuffer) -> Result<()> {
        let enc = self.config.bufferencoding;
        let width = self.config.roi.width;
        let height = self.config.roi.height;
        let stride = pixels::min_row_stride(enc, width as usize)?;
        buf.data.clear();
        buf.data.resize(stride * height as usize, 0);
        for y in 0..height {
            let row = &mut buf.data[y as usize * stride..(y as usize + 1) * stride];
            for x in 0..width {
                let v = Self::pixel_value(enc, x, y, self.serial);
                match (enc.bits_per_pixel(), enc.bits_per_packet()) {
                    (8, 8) => row[x as usize] = v as u8,
                    (16, 16) => {
                        row[x as usize * 2..x as usize * 2 + 2]
                            .copy_from_slice(&(v as u16).to_le_bytes());
                    }
                    (32, 32) => {
                        row[x as usize * 4..x as usize * 4 + 4]
                            .copy_from_slice(&v.to_le_bytes());
                    }
                    (12, 12) => {
                        let base = x as usize / 2 * 3;
                        if x % 2 == 0 {
                            row[base] = v as u8;
                            row[base + 1] = (row[base + 1] & 0xF0) | ((v >> 8) as u8 & 0x0F);
                        } else {
                            row[base + 1] = (row[base + 1] & 0x0F) | (((v & 0x0F) as u8) << 4);
                            row[base + 2] = (v >> 4) as u8;
                        }
                    }
                    _ => return Err(Error::new("mock_synthesize", ErrorKind::BadEncoding)),
                }
            }
        }
        buf.offset = 0;
        buf.width = width;
        buf.height = height;
        buf.stride = stride;
        buf.encoding = enc;
        buf.serial = self.serial;
        Ok(())
    }
}

impl CameraDevice for MockCamera {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn initialize(&mut self, config: &mut CameraConfig) -> Result<()> {
        self.config = CameraConfig::new(self.sensorwidth, self.sensorheight);
        self.config.origin = TimeSpec::now()?;
        *config = self.config;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.fail_start = None;
        Ok(())
    }

    fn update_config(&mut self, config: &mut CameraConfig) -> Result<()> {
        let counters = (
            config.frames,
            config.droppedframes,
            config.timeouts,
        );
        *config = self.config;
        (config.frames, config.droppedframes, config.timeouts) = counters;
        Ok(())
    }

    fn check_config(&self, config: &CameraConfig) -> Result<()> {
        if config.sensorwidth != self.sensorwidth || config.sensorheight != self.sensorheight {
            return Err(Error::new("mock_check_config", ErrorKind::ForbiddenChange));
        }
        Ok(())
    }

    fn set_config(&mut self, config: &CameraConfig) -> Result<()> {
        self.config = *config;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if let Some(kind) = self.fail_start.take() {
            return Err(Error::new("mock_start", kind));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn wait_buffer(
        &mut self,
        buf: &mut AcquisitionBuffer,
        secs: f64,
        _drop: DropPolicy,
    ) -> Result<Wait> {
        let period = 1.0 / self.config.framerate;
        if secs < period {
            sleep_secs(secs.max(0.0));
            return Ok(Wait::TimedOut);
        }
        sleep_secs(period);
        self.serial += 1;
        buf.frame_start = TimeSpec::now()?;
        self.synthesize(buf)?;
        buf.frame_end = TimeSpec::now()?;
        buf.buffer_ready = buf.frame_end;
        Ok(Wait::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strehl_common::ElType;
    use crate::config::Preprocessing;
    use crate::pixels::PixelProcessor;

    #[test]
    fn frames_are_deterministic() {
        let mut cam = MockCamera::new(16, 8);
        let mut cfg = CameraConfig::new(16, 8);
        cam.initialize(&mut cfg).unwrap();
        cfg = cfg.mono_buffer(16);
        cfg.framerate = 1000.0;
        cfg.exposuretime = 0.0005;
        cam.set_config(&cfg).unwrap();
        cam.start().unwrap();

        let mut buf = AcquisitionBuffer::default();
        let w = cam.wait_buffer(&mut buf, 1.0, DropPolicy::Oldest).unwrap();
        assert!(!w.timed_out());
        assert_eq!(buf.serial, 1);

        // Decode through the conversion kernel and compare to the formula.
        let proc = PixelProcessor::new(cfg.bufferencoding, ElType::U16, Preprocessing::None, 16, 8)
            .unwrap();
        let mut dat = vec![0u8; 16 * 8 * 2];
        proc.process(&buf.data, buf.stride, &mut dat, None, None).unwrap();
        let px = |x: i64, y: i64| -> u16 {
            let k = (y * 16 + x) as usize * 2;
            u16::from_le_bytes([dat[k], dat[k + 1]])
        };
        assert_eq!(px(0, 0), 1); // 0 + 0 + serial 1
        assert_eq!(px(3, 2), 6);
    }

    #[test]
    fn short_timeout_expires() {
        let mut cam = MockCamera::new(8, 8);
        let mut cfg = CameraConfig::new(8, 8);
        cam.initialize(&mut cfg).unwrap();
        cam.start().unwrap();
        let mut buf = AcquisitionBuffer::default();
        // Default frame rate is 25 Hz; 1 ms is not enough for a frame.
        let w = cam.wait_buffer(&mut buf, 0.001, DropPolicy::Fresh).unwrap();
        assert!(w.timed_out());
    }
}
