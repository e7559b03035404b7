//! Pixel conversion and preprocessing kernels.
//!
//! A kernel exists per combination of raw buffer encoding (8-, 16-, 32-bit
//! monochrome and packed 12-bit), output pixel type, and preprocessing
//! level:
//!
//! - `none`:   `dat[i] = convert(raw[i])`
//! - `affine`: `dat[i] = (convert(raw[i]) - b[i]) * a[i]`
//! - `full`:   affine plus `wgt[i] = q[i] / (max(dat[i], 0) + r[i])`
//!
//! Raw frame rows may be strided; output arrays are contiguous.  The weight
//! computation must not assume fast-math: when `max(dat[i], 0)` is a NaN
//! (dead pixels are tagged with NaN calibration values), `wgt[i]` is a NaN
//! too.

use strehl_common::{ElType, Encoding, Error, ErrorKind, Result, Scalar};
use strehl_shm::array::CastFrom;

use crate::config::Preprocessing;

/// Decoding of one raw pixel format.
trait RawDecode {
    /// Minimum bytes per row for `width` pixels.
    fn min_stride(width: usize) -> usize;
    /// Decode pixel `i` of a row.
    ///
    /// # Safety
    /// `row` must point at [`RawDecode::min_stride`] readable bytes.
    unsafe fn get(row: *const u8, i: usize) -> u32;
}

struct Raw8;
struct Raw16;
struct Raw32;
/// Two 12-bit pixels packed in three bytes, low nibbles first.
struct Packed12;

impl RawDecode for Raw8 {
    fn min_stride(width: usize) -> usize {
        width
    }

    unsafe fn get(row: *const u8, i: usize) -> u32 {
        unsafe { *row.add(i) as u32 }
    }
}

impl RawDecode for Raw16 {
    fn min_stride(width: usize) -> usize {
        width * 2
    }

    unsafe fn get(row: *const u8, i: usize) -> u32 {
        let p = unsafe { row.add(i * 2) };
        u16::from_le_bytes(unsafe { [*p, *p.add(1)] }) as u32
    }
}

impl RawDecode for Raw32 {
    fn min_stride(width: usize) -> usize {
        width * 4
    }

    unsafe fn get(row: *const u8, i: usize) -> u32 {
        let p = unsafe { row.add(i * 4) };
        u32::from_le_bytes(unsafe { [*p, *p.add(1), *p.add(2), *p.add(3)] })
    }
}

impl RawDecode for Packed12 {
    fn min_stride(width: usize) -> usize {
        width.div_ceil(2) * 3
    }

    unsafe fn get(row: *const u8, i: usize) -> u32 {
        let p = unsafe { row.add(i / 2 * 3) };
        if i % 2 == 0 {
            let (b0, b1) = unsafe { (*p as u32, *p.add(1) as u32) };
            b0 | ((b1 & 0x0F) << 8)
        } else {
            let (b1, b2) = unsafe { (*p.add(1) as u32, *p.add(2) as u32) };
            (b1 >> 4) | (b2 << 4)
        }
    }
}

/// Floating-point output pixels usable by the affine and full kernels.
pub trait FloatPixel:
    Scalar
    + CastFrom<u32>
    + PartialOrd
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
{
    /// The additive identity.
    const ZERO: Self;
}

impl FloatPixel for f32 {
    const ZERO: f32 = 0.0;
}

impl FloatPixel for f64 {
    const ZERO: f64 = 0.0;
}

/// `max(v, 0)` that propagates NaN instead of hiding it.
fn max_zero<T: FloatPixel>(v: T) -> T {
    match v.partial_cmp(&T::ZERO) {
        Some(std::cmp::Ordering::Less) => T::ZERO,
        // Greater, equal, or incomparable (NaN): keep the value.
        _ => v,
    }
}

// SAFETY (all kernels): `raw` spans `height` rows of `stride` bytes with at
// least `R::min_stride(width)` readable bytes each; output pointers span
// `width * height` elements.  Outputs are written element-wise and possibly
// unaligned, parameters are read unaligned.

unsafe fn kernel_none<R: RawDecode, T: Scalar + CastFrom<u32>>(
    raw: *const u8,
    stride: usize,
    width: usize,
    height: usize,
    dat: *mut T,
) {
    for j in 0..height {
        let row = unsafe { raw.add(j * stride) };
        let out = unsafe { dat.add(j * width) };
        for i in 0..width {
            unsafe { out.add(i).write_unaligned(T::cast_from(R::get(row, i))) };
        }
    }
}

unsafe fn kernel_affine<R: RawDecode, T: FloatPixel>(
    raw: *const u8,
    stride: usize,
    width: usize,
    height: usize,
    dat: *mut T,
    a: *const T,
    b: *const T,
) {
    for j in 0..height {
        let row = unsafe { raw.add(j * stride) };
        for i in 0..width {
            let k = j * width + i;
            let v = unsafe {
                (T::cast_from(R::get(row, i)) - b.add(k).read_unaligned())
                    * a.add(k).read_unaligned()
            };
            unsafe { dat.add(k).write_unaligned(v) };
        }
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn kernel_full<R: RawDecode, T: FloatPixel>(
    raw: *const u8,
    stride: usize,
    width: usize,
    height: usize,
    dat: *mut T,
    wgt: *mut T,
    a: *const T,
    b: *const T,
    q: *const T,
    r: *const T,
) {
    for j in 0..height {
        let row = unsafe { raw.add(j * stride) };
        for i in 0..width {
            let k = j * width + i;
            let v = unsafe {
                (T::cast_from(R::get(row, i)) - b.add(k).read_unaligned())
                    * a.add(k).read_unaligned()
            };
            unsafe { dat.add(k).write_unaligned(v) };
            let w = unsafe {
                q.add(k).read_unaligned() / (max_zero(v) + r.add(k).read_unaligned())
            };
            unsafe { wgt.add(k).write_unaligned(w) };
        }
    }
}

/// Raw formats accepted by the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawFormat {
    U8,
    U16,
    U32,
    P12,
}

fn raw_format(encoding: Encoding) -> Option<RawFormat> {
    if !encoding.is_monochrome() {
        return None;
    }
    match (encoding.bits_per_pixel(), encoding.bits_per_packet()) {
        (8, 8) => Some(RawFormat::U8),
        (16, 16) => Some(RawFormat::U16),
        (32, 32) => Some(RawFormat::U32),
        (12, 12) => Some(RawFormat::P12),
        _ => None,
    }
}

/// Whether a kernel exists for the given combination.
pub fn is_supported(encoding: Encoding, pixeltype: ElType, level: Preprocessing) -> bool {
    if raw_format(encoding).is_none() {
        return false;
    }
    match level {
        Preprocessing::None => true,
        Preprocessing::Affine | Preprocessing::Full => pixeltype.is_floating_point(),
    }
}

/// Minimum bytes per raw row for `width` pixels of `encoding`.
pub fn min_row_stride(encoding: Encoding, width: usize) -> Result<usize> {
    Ok(match raw_format(encoding)
        .ok_or(Error::new("pixels_min_row_stride", ErrorKind::BadEncoding))?
    {
        RawFormat::U8 => Raw8::min_stride(width),
        RawFormat::U16 => Raw16::min_stride(width),
        RawFormat::U32 => Raw32::min_stride(width),
        RawFormat::P12 => Packed12::min_stride(width),
    })
}

/// Preprocessing parameter arrays, as raw bytes of the output pixel type.
#[derive(Debug, Clone, Copy)]
pub struct PreprocParams<'a> {
    /// Per-pixel gain.
    pub a: &'a [u8],
    /// Per-pixel bias.
    pub b: &'a [u8],
    /// Per-pixel weight numerator.
    pub q: &'a [u8],
    /// Per-pixel weight regularization.
    pub r: &'a [u8],
}

/// A validated pixel processor for one `(encoding, pixel type, level)`
/// combination and one frame geometry.
#[derive(Debug, Clone, Copy)]
pub struct PixelProcessor {
    format: RawFormat,
    pixeltype: ElType,
    level: Preprocessing,
    width: usize,
    height: usize,
}

impl PixelProcessor {
    /// Select the kernel for a combination, failing when none exists.
    pub fn new(
        encoding: Encoding,
        pixeltype: ElType,
        level: Preprocessing,
        width: usize,
        height: usize,
    ) -> Result<PixelProcessor> {
        let format = raw_format(encoding)
            .ok_or(Error::new("pixel_processor_new", ErrorKind::BadEncoding))?;
        if level != Preprocessing::None && !pixeltype.is_floating_point() {
            return Err(Error::new("pixel_processor_new", ErrorKind::BadPixelType));
        }
        if width == 0 || height == 0 {
            return Err(Error::new("pixel_processor_new", ErrorKind::BadSize));
        }
        Ok(PixelProcessor {
            format,
            pixeltype,
            level,
            width,
            height,
        })
    }

    /// Number of pixels per frame.
    pub fn npixels(&self) -> usize {
        self.width * self.height
    }

    fn check_io(
        &self,
        raw: &[u8],
        raw_stride: usize,
        dat: &[u8],
        wgt: Option<&usize>,
        params: Option<&PreprocParams<'_>>,
    ) -> Result<usize> {
        let min_stride = match self.format {
            RawFormat::U8 => Raw8::min_stride(self.width),
            RawFormat::U16 => Raw16::min_stride(self.width),
            RawFormat::U32 => Raw32::min_stride(self.width),
            RawFormat::P12 => Packed12::min_stride(self.width),
        };
        if raw_stride < min_stride || raw.len() < raw_stride * self.height {
            return Err(Error::new("pixel_process", ErrorKind::BadSize));
        }
        let out_bytes = self.npixels() * self.pixeltype.size();
        if dat.len() < out_bytes {
            return Err(Error::new("pixel_process", ErrorKind::BadSize));
        }
        if let Some(&wgt_len) = wgt {
            if wgt_len < out_bytes {
                return Err(Error::new("pixel_process", ErrorKind::BadSize));
            }
        }
        if let Some(p) = params {
            let needed = self.level.used_params();
            let lens = [p.a.len(), p.b.len(), p.q.len(), p.r.len()];
            for &len in lens.iter().take(needed) {
                if len < out_bytes {
                    return Err(Error::new("pixel_process", ErrorKind::BadSize));
                }
            }
        }
        Ok(out_bytes)
    }

    /// Run the kernel over one frame.
    ///
    /// `wgt` is required (and written) only at the `full` level; `params`
    /// is required for the `affine` and `full` levels and must hold pixels
    /// of the output type.
    pub fn process(
        &self,
        raw: &[u8],
        raw_stride: usize,
        dat: &mut [u8],
        wgt: Option<&mut [u8]>,
        params: Option<&PreprocParams<'_>>,
    ) -> Result<()> {
        match self.level {
            Preprocessing::None => {
                self.check_io(raw, raw_stride, dat, None, None)?;
                self.run_none(raw, raw_stride, dat)
            }
            Preprocessing::Affine => {
                let params =
                    params.ok_or(Error::new("pixel_process", ErrorKind::BadPreprocessing))?;
                self.check_io(raw, raw_stride, dat, None, Some(params))?;
                self.run_affine(raw, raw_stride, dat, params)
            }
            Preprocessing::Full => {
                let params =
                    params.ok_or(Error::new("pixel_process", ErrorKind::BadPreprocessing))?;
                let wgt = wgt.ok_or(Error::new("pixel_process", ErrorKind::BadPreprocessing))?;
                self.check_io(raw, raw_stride, dat, Some(&wgt.len()), Some(params))?;
                self.run_full(raw, raw_stride, dat, wgt, params)
            }
        }
    }

    fn run_none(&self, raw: &[u8], stride: usize, dat: &mut [u8]) -> Result<()> {
        macro_rules! go {
            ($r:ty) => {
                match self.pixeltype {
                    ElType::I8 => self.none_typed::<$r, i8>(raw, stride, dat),
                    ElType::U8 => self.none_typed::<$r, u8>(raw, stride, dat),
                    ElType::I16 => self.none_typed::<$r, i16>(raw, stride, dat),
                    ElType::U16 => self.none_typed::<$r, u16>(raw, stride, dat),
                    ElType::I32 => self.none_typed::<$r, i32>(raw, stride, dat),
                    ElType::U32 => self.none_typed::<$r, u32>(raw, stride, dat),
                    ElType::I64 => self.none_typed::<$r, i64>(raw, stride, dat),
                    ElType::U64 => self.none_typed::<$r, u64>(raw, stride, dat),
                    ElType::F32 => self.none_typed::<$r, f32>(raw, stride, dat),
                    ElType::F64 => self.none_typed::<$r, f64>(raw, stride, dat),
                }
            };
        }
        match self.format {
            RawFormat::U8 => go!(Raw8),
            RawFormat::U16 => go!(Raw16),
            RawFormat::U32 => go!(Raw32),
            RawFormat::P12 => go!(Packed12),
        }
        Ok(())
    }

    fn none_typed<R: RawDecode, T: Scalar + CastFrom<u32>>(
        &self,
        raw: &[u8],
        stride: usize,
        dat: &mut [u8],
    ) {
        // SAFETY: geometry checked in check_io.
        unsafe {
            kernel_none::<R, T>(
                raw.as_ptr(),
                stride,
                self.width,
                self.height,
                dat.as_mut_ptr().cast::<T>(),
            )
        }
    }

    fn run_affine(
        &self,
        raw: &[u8],
        stride: usize,
        dat: &mut [u8],
        params: &PreprocParams<'_>,
    ) -> Result<()> {
        macro_rules! go {
            ($r:ty) => {
                match self.pixeltype {
                    ElType::F32 => self.affine_typed::<$r, f32>(raw, stride, dat, params),
                    ElType::F64 => self.affine_typed::<$r, f64>(raw, stride, dat, params),
                    _ => return Err(Error::new("pixel_process", ErrorKind::BadPixelType)),
                }
            };
        }
        match self.format {
            RawFormat::U8 => go!(Raw8),
            RawFormat::U16 => go!(Raw16),
            RawFormat::U32 => go!(Raw32),
            RawFormat::P12 => go!(Packed12),
        }
        Ok(())
    }

    fn affine_typed<R: RawDecode, T: FloatPixel>(
        &self,
        raw: &[u8],
        stride: usize,
        dat: &mut [u8],
        params: &PreprocParams<'_>,
    ) {
        // SAFETY: geometry checked in check_io.
        unsafe {
            kernel_affine::<R, T>(
                raw.as_ptr(),
                stride,
                self.width,
                self.height,
                dat.as_mut_ptr().cast::<T>(),
                params.a.as_ptr().cast::<T>(),
                params.b.as_ptr().cast::<T>(),
            )
        }
    }

    fn run_full(
        &self,
        raw: &[u8],
        stride: usize,
        dat: &mut [u8],
        wgt: &mut [u8],
        params: &PreprocParams<'_>,
    ) -> Result<()> {
        macro_rules! go {
            ($r:ty) => {
                match self.pixeltype {
                    ElType::F32 => self.full_typed::<$r, f32>(raw, stride, dat, wgt, params),
                    ElType::F64 => self.full_typed::<$r, f64>(raw, stride, dat, wgt, params),
                    _ => return Err(Error::new("pixel_process", ErrorKind::BadPixelType)),
                }
            };
        }
        match self.format {
            RawFormat::U8 => go!(Raw8),
            RawFormat::U16 => go!(Raw16),
            RawFormat::U32 => go!(Raw32),
            RawFormat::P12 => go!(Packed12),
        }
        Ok(())
    }

    fn full_typed<R: RawDecode, T: FloatPixel>(
        &self,
        raw: &[u8],
        stride: usize,
        dat: &mut [u8],
        wgt: &mut [u8],
        params: &PreprocParams<'_>,
    ) {
        // SAFETY: geometry checked in check_io.
        unsafe {
            kernel_full::<R, T>(
                raw.as_ptr(),
                stride,
                self.width,
                self.height,
                dat.as_mut_ptr().cast::<T>(),
                wgt.as_mut_ptr().cast::<T>(),
                params.a.as_ptr().cast::<T>(),
                params.b.as_ptr().cast::<T>(),
                params.q.as_ptr().cast::<T>(),
                params.r.as_ptr().cast::<T>(),
            )
        }
    }
}

/// Unpack packed 12-bit pixels into 16-bit values.
pub fn unpack_p12(src: &[u8], dst: &mut [u16]) -> Result<()> {
    if src.len() < dst.len().div_ceil(2) * 3 {
        return Err(Error::new("unpack_p12", ErrorKind::BadSize));
    }
    for (i, d) in dst.iter_mut().enumerate() {
        // SAFETY: bounds checked above.
        *d = unsafe { Packed12::get(src.as_ptr(), i) as u16 };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strehl_common::Colorant;

    fn as_bytes<T: Scalar>(v: &[T]) -> &[u8] {
        // SAFETY: plain-old-data scalars.
        unsafe {
            std::slice::from_raw_parts(v.as_ptr().cast::<u8>(), std::mem::size_of_val(v))
        }
    }

    fn as_bytes_mut<T: Scalar>(v: &mut [T]) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(v.as_mut_ptr().cast::<u8>(), std::mem::size_of_val(v))
        }
    }

    #[test]
    fn support_matrix() {
        let mono8 = Encoding::mono(8);
        let mono12p = Encoding::mono_packed(12, 12);
        assert!(is_supported(mono8, ElType::U16, Preprocessing::None));
        assert!(is_supported(mono12p, ElType::F32, Preprocessing::Full));
        assert!(!is_supported(mono8, ElType::U16, Preprocessing::Affine));
        assert!(!is_supported(Encoding::new(Colorant::Rgb, 24), ElType::F32, Preprocessing::None));
        assert!(!is_supported(Encoding::mono_packed(12, 16), ElType::F32, Preprocessing::None));
    }

    #[test]
    fn convert_u16_to_u16_with_row_padding() {
        // 3x2 frame, rows padded to 8 bytes.
        let raw: [u8; 16] = [
            1, 0, 2, 0, 3, 0, 0xEE, 0xEE, //
            4, 0, 5, 0, 6, 0, 0xEE, 0xEE,
        ];
        let proc = PixelProcessor::new(Encoding::mono(16), ElType::U16, Preprocessing::None, 3, 2)
            .unwrap();
        let mut dat = [0u16; 6];
        proc.process(&raw, 8, as_bytes_mut(&mut dat), None, None).unwrap();
        assert_eq!(dat, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn packed12_decoding() {
        // Pixels 0x123 and 0xABC pack as [0x23, 0xC1, 0xAB].
        let raw = [0x23u8, 0xC1, 0xAB];
        let proc =
            PixelProcessor::new(Encoding::mono_packed(12, 12), ElType::U16, Preprocessing::None, 2, 1)
                .unwrap();
        let mut dat = [0u16; 2];
        proc.process(&raw, 3, as_bytes_mut(&mut dat), None, None).unwrap();
        assert_eq!(dat, [0x123, 0xABC]);

        let mut via_helper = [0u16; 2];
        unpack_p12(&raw, &mut via_helper).unwrap();
        assert_eq!(via_helper, dat);
    }

    #[test]
    fn affine_correction() {
        let raw = [10u8, 20, 30, 40];
        let a = [0.5f64, 0.5, 2.0, 1.0];
        let b = [10.0f64, 10.0, 10.0, 10.0];
        let proc =
            PixelProcessor::new(Encoding::mono(8), ElType::F64, Preprocessing::Affine, 4, 1)
                .unwrap();
        let mut dat = [0f64; 4];
        let params = PreprocParams {
            a: as_bytes(&a),
            b: as_bytes(&b),
            q: &[],
            r: &[],
        };
        proc.process(&raw, 4, as_bytes_mut(&mut dat), None, Some(&params)).unwrap();
        assert_eq!(dat, [0.0, 5.0, 40.0, 30.0]);
    }

    #[test]
    fn full_level_weights() {
        let raw = [0u8, 100];
        let a = [1.0f64, 1.0];
        let b = [50.0f64, 0.0];
        let q = [4.0f64, 9.0];
        let r = [2.0f64, 1.0];
        let proc = PixelProcessor::new(Encoding::mono(8), ElType::F64, Preprocessing::Full, 2, 1)
            .unwrap();
        let mut dat = [0f64; 2];
        let mut wgt = [0f64; 2];
        let params = PreprocParams {
            a: as_bytes(&a),
            b: as_bytes(&b),
            q: as_bytes(&q),
            r: as_bytes(&r),
        };
        proc.process(&raw, 2, as_bytes_mut(&mut dat), Some(as_bytes_mut(&mut wgt)), Some(&params))
            .unwrap();
        // dat[0] = -50 clamps to 0 in the weight: wgt = 4 / (0 + 2).
        assert_eq!(dat, [-50.0, 100.0]);
        assert_eq!(wgt, [2.0, 9.0 / 101.0]);
    }

    #[test]
    fn nan_calibration_propagates_into_weights() {
        let raw = [7u8];
        let a = [f64::NAN];
        let b = [0.0f64];
        let q = [1.0f64];
        let r = [1.0f64];
        let proc = PixelProcessor::new(Encoding::mono(8), ElType::F64, Preprocessing::Full, 1, 1)
            .unwrap();
        let mut dat = [0f64; 1];
        let mut wgt = [0f64; 1];
        let params = PreprocParams {
            a: as_bytes(&a),
            b: as_bytes(&b),
            q: as_bytes(&q),
            r: as_bytes(&r),
        };
        proc.process(&raw, 1, as_bytes_mut(&mut dat), Some(as_bytes_mut(&mut wgt)), Some(&params))
            .unwrap();
        assert!(dat[0].is_nan());
        assert!(wgt[0].is_nan(), "NaN data must yield NaN weight");
    }

    #[test]
    fn geometry_is_checked() {
        let proc = PixelProcessor::new(Encoding::mono(8), ElType::U8, Preprocessing::None, 4, 4)
            .unwrap();
        let raw = [0u8; 15]; // one byte short
        let mut dat = [0u8; 16];
        assert!(proc.process(&raw, 4, &mut dat, None, None).is_err());
        // Stride below the minimum is rejected.
        let raw = [0u8; 16];
        assert!(proc.process(&raw, 3, &mut dat, None, None).is_err());
    }
}
