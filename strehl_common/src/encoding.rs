//! Pixel encoding descriptors.
//!
//! A pixel encoding is a bitwise combination packed in a 32-bit unsigned
//! integer:
//!
//! | Bits  | Description     |
//! |:-----:|:----------------|
//! | 1-8   | Bits per pixel  |
//! | 9-16  | Bits per packet |
//! | 17-24 | Colorant        |
//! | 25-32 | Flags           |

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Color type of a pixel stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Colorant {
    /// Raw sensor values, no color interpretation.
    Raw = 1,
    /// Monochrome (also used for unsigned integer samples).
    Mono = 2,
    /// Red, green, blue.
    Rgb = 3,
    /// Blue, green, red.
    Bgr = 4,
    /// Alpha, red, green, blue.
    Argb = 5,
    /// Red, green, blue, alpha.
    Rgba = 6,
    /// Alpha, blue, green, red.
    Abgr = 7,
    /// Blue, green, red, alpha.
    Bgra = 8,
    /// Bayer pattern, RGGB.
    BayerRggb = 9,
    /// Bayer pattern, GRBG.
    BayerGrbg = 10,
    /// Bayer pattern, GBRG.
    BayerGbrg = 11,
    /// Bayer pattern, BGGR.
    BayerBggr = 12,
    /// YUV 4:4:4.
    Yuv444 = 13,
    /// YUV 4:2:2.
    Yuv422 = 14,
    /// YUV 4:1:1.
    Yuv411 = 15,
    /// YUV 4:2:0, planar.
    Yuv420p = 16,
    /// YUV 4:2:0, semi-planar.
    Yuv420sp = 17,
    /// Signed integer samples.
    Signed = 18,
    /// Floating-point samples.
    Float = 19,
}

impl Colorant {
    /// Decode the colorant field of an encoding.
    pub fn from_raw(raw: u32) -> Option<Colorant> {
        Some(match raw {
            1 => Colorant::Raw,
            2 => Colorant::Mono,
            3 => Colorant::Rgb,
            4 => Colorant::Bgr,
            5 => Colorant::Argb,
            6 => Colorant::Rgba,
            7 => Colorant::Abgr,
            8 => Colorant::Bgra,
            9 => Colorant::BayerRggb,
            10 => Colorant::BayerGrbg,
            11 => Colorant::BayerGbrg,
            12 => Colorant::BayerBggr,
            13 => Colorant::Yuv444,
            14 => Colorant::Yuv422,
            15 => Colorant::Yuv411,
            16 => Colorant::Yuv420p,
            17 => Colorant::Yuv420sp,
            18 => Colorant::Signed,
            19 => Colorant::Float,
            _ => return None,
        })
    }
}

bitflags! {
    /// Modifier flags of a pixel encoding.
    ///
    /// The padding bit distinguishes LSB padding (set) from the default MSB
    /// padding (unset) for packets wider than the pixel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncodingFlags: u8 {
        /// Padding bits are the least significant ones.
        const LSB_PAD = 1 << 0;
        /// Andor "coded" packing mode.
        const CODED = 1 << 1;
        /// Andor "parallel" packing mode.
        const PARALLEL = 1 << 2;
    }
}

/// Packed pixel encoding descriptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encoding(pub u32);

impl Encoding {
    /// The unknown/invalid encoding.
    pub const UNKNOWN: Encoding = Encoding(0);

    /// Build an encoding where each pixel fills a whole packet.
    pub fn new(colorant: Colorant, bits_per_pixel: u8) -> Encoding {
        Encoding::with_packet(colorant, bits_per_pixel, bits_per_pixel)
    }

    /// Build an encoding with distinct pixel and packet widths.
    pub fn with_packet(colorant: Colorant, bits_per_pixel: u8, bits_per_packet: u8) -> Encoding {
        Encoding(
            ((colorant as u32) << 16)
                | ((bits_per_packet as u32) << 8)
                | bits_per_pixel as u32,
        )
    }

    /// Build a complete encoding, flags included.
    pub fn with_flags(
        colorant: Colorant,
        bits_per_pixel: u8,
        bits_per_packet: u8,
        flags: EncodingFlags,
    ) -> Encoding {
        Encoding(
            ((flags.bits() as u32) << 24)
                | Encoding::with_packet(colorant, bits_per_pixel, bits_per_packet).0,
        )
    }

    /// Monochrome encoding with `bpp` bits per pixel.
    pub fn mono(bpp: u8) -> Encoding {
        Encoding::new(Colorant::Mono, bpp)
    }

    /// Monochrome packed encoding, e.g. `mono_packed(12, 12)` for the packed
    /// 12-bit format where two pixels occupy three bytes.
    pub fn mono_packed(bpp: u8, bpk: u8) -> Encoding {
        Encoding::with_packet(Colorant::Mono, bpp, bpk)
    }

    /// Raw sensor encoding with `bpp` bits per pixel.
    pub fn raw(bpp: u8) -> Encoding {
        Encoding::new(Colorant::Raw, bpp)
    }

    /// Bits per pixel (significant bits).
    pub fn bits_per_pixel(self) -> u32 {
        self.0 & 255
    }

    /// Bits per packet (storage bits).
    pub fn bits_per_packet(self) -> u32 {
        (self.0 >> 8) & 255
    }

    /// Colorant field, if known.
    pub fn colorant(self) -> Option<Colorant> {
        Colorant::from_raw((self.0 >> 16) & 255)
    }

    /// Modifier flags.
    pub fn flags(self) -> EncodingFlags {
        EncodingFlags::from_bits_truncate(((self.0 >> 24) & 255) as u8)
    }

    /// Whether this is a single-channel (raw or monochrome) stream.
    pub fn is_monochrome(self) -> bool {
        matches!(self.colorant(), Some(Colorant::Raw) | Some(Colorant::Mono))
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.colorant() {
            Some(Colorant::Raw) => "raw",
            Some(Colorant::Mono) => "mono",
            Some(Colorant::Rgb) => "rgb",
            Some(Colorant::Bgr) => "bgr",
            Some(Colorant::Argb) => "argb",
            Some(Colorant::Rgba) => "rgba",
            Some(Colorant::Abgr) => "abgr",
            Some(Colorant::Bgra) => "bgra",
            Some(Colorant::BayerRggb) => "bayer-rggb",
            Some(Colorant::BayerGrbg) => "bayer-grbg",
            Some(Colorant::BayerGbrg) => "bayer-gbrg",
            Some(Colorant::BayerBggr) => "bayer-bggr",
            Some(Colorant::Yuv444) => "yuv444",
            Some(Colorant::Yuv422) => "yuv422",
            Some(Colorant::Yuv411) => "yuv411",
            Some(Colorant::Yuv420p) => "yuv420p",
            Some(Colorant::Yuv420sp) => "yuv420sp",
            Some(Colorant::Signed) => "signed",
            Some(Colorant::Float) => "float",
            None => return write!(f, "unknown({:#010x})", self.0),
        };
        if self.bits_per_packet() == self.bits_per_pixel() {
            write!(f, "{}{}", name, self.bits_per_pixel())
        } else {
            write!(f, "{}{}p{}", name, self.bits_per_pixel(), self.bits_per_packet())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_packing() {
        let enc = Encoding::with_flags(Colorant::Mono, 12, 16, EncodingFlags::LSB_PAD);
        assert_eq!(enc.bits_per_pixel(), 12);
        assert_eq!(enc.bits_per_packet(), 16);
        assert_eq!(enc.colorant(), Some(Colorant::Mono));
        assert_eq!(enc.flags(), EncodingFlags::LSB_PAD);
    }

    #[test]
    fn simple_constructors() {
        assert_eq!(Encoding::mono(8).bits_per_packet(), 8);
        assert_eq!(Encoding::mono_packed(12, 12).bits_per_packet(), 12);
        assert!(Encoding::raw(16).is_monochrome());
    }

    #[test]
    fn display() {
        assert_eq!(Encoding::mono(8).to_string(), "mono8");
        assert_eq!(Encoding::mono_packed(12, 16).to_string(), "mono12p16");
        assert_eq!(Encoding::UNKNOWN.to_string(), "unknown(0x00000000)");
    }
}
