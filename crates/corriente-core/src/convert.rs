//! The sample-conversion matrix.
//!
//! Every cell of the {int8, uint8, int16, int24, int32, float32}² matrix is
//! a monomorphic [`Converter`] function selected once per stream by
//! [`select_converter`]. Converters read `frames` samples from a strided
//! source channel and write them, converted, to a strided destination
//! channel. Strides are in **samples**; byte strides are derived from the
//! format widths. Converters never fail and never allocate.
//!
//! Narrowing conversions come in plain, dithering and clipping variants;
//! which one a stream uses is decided at open time, so the inner loops
//! carry no per-sample flag checks.
//!
//! Conversion rules:
//!
//! - integer widening left-shifts with sign extension, so a narrower value
//!   round-trips bit-exactly through any wider integer format;
//! - integer narrowing right-shifts; with dithering on, triangular noise
//!   scaled to the destination LSB is added (and the intermediate clamped
//!   to the source range) before the shift;
//! - integer to float divides by the integer's max magnitude, bounding the
//!   result within ±1.0;
//! - float to integer scales by the destination's max positive value
//!   (one less when dithering, leaving headroom for the noise), rounds,
//!   then clips or wraps depending on the selected variant.

use crate::dither::TriangularDither;
use crate::format::SampleFormat;

/// A per-channel sample converter.
///
/// `(dst, dst_stride, src, src_stride, frames, dither)`: reads `frames`
/// samples from `src` at `src_stride`-sample intervals, converts, and
/// writes to `dst` at `dst_stride`-sample intervals. Both slices start at
/// the channel's first sample.
pub type Converter =
    fn(&mut [u8], usize, &[u8], usize, usize, &mut TriangularDither);

/// A packed 24-bit sample, sign-extended into the low 24 bits of an `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct I24(pub(crate) i32);

/// Raw load/store of one sample type from native-endian bytes.
pub(crate) trait RawSample: Copy {
    const BYTES: usize;
    fn load(bytes: &[u8], offset: usize) -> Self;
    fn store(self, bytes: &mut [u8], offset: usize);
}

impl RawSample for i8 {
    const BYTES: usize = 1;
    #[inline]
    fn load(bytes: &[u8], offset: usize) -> Self {
        bytes[offset] as i8
    }
    #[inline]
    fn store(self, bytes: &mut [u8], offset: usize) {
        bytes[offset] = self as u8;
    }
}

impl RawSample for u8 {
    const BYTES: usize = 1;
    #[inline]
    fn load(bytes: &[u8], offset: usize) -> Self {
        bytes[offset]
    }
    #[inline]
    fn store(self, bytes: &mut [u8], offset: usize) {
        bytes[offset] = self;
    }
}

impl RawSample for i16 {
    const BYTES: usize = 2;
    #[inline]
    fn load(bytes: &[u8], offset: usize) -> Self {
        i16::from_ne_bytes([bytes[offset], bytes[offset + 1]])
    }
    #[inline]
    fn store(self, bytes: &mut [u8], offset: usize) {
        bytes[offset..offset + 2].copy_from_slice(&self.to_ne_bytes());
    }
}

impl RawSample for I24 {
    const BYTES: usize = 3;
    #[inline]
    fn load(bytes: &[u8], offset: usize) -> Self {
        let (lo, mid, hi) = if cfg!(target_endian = "little") {
            (bytes[offset], bytes[offset + 1], bytes[offset + 2])
        } else {
            (bytes[offset + 2], bytes[offset + 1], bytes[offset])
        };
        I24((i32::from(hi as i8) << 16) | (i32::from(mid) << 8) | i32::from(lo))
    }
    #[inline]
    fn store(self, bytes: &mut [u8], offset: usize) {
        let v = self.0;
        let (lo, mid, hi) = (v as u8, (v >> 8) as u8, (v >> 16) as u8);
        if cfg!(target_endian = "little") {
            bytes[offset] = lo;
            bytes[offset + 1] = mid;
            bytes[offset + 2] = hi;
        } else {
            bytes[offset] = hi;
            bytes[offset + 1] = mid;
            bytes[offset + 2] = lo;
        }
    }
}

impl RawSample for i32 {
    const BYTES: usize = 4;
    #[inline]
    fn load(bytes: &[u8], offset: usize) -> Self {
        i32::from_ne_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }
    #[inline]
    fn store(self, bytes: &mut [u8], offset: usize) {
        bytes[offset..offset + 4].copy_from_slice(&self.to_ne_bytes());
    }
}

impl RawSample for f32 {
    const BYTES: usize = 4;
    #[inline]
    fn load(bytes: &[u8], offset: usize) -> Self {
        f32::from_ne_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }
    #[inline]
    fn store(self, bytes: &mut [u8], offset: usize) {
        bytes[offset..offset + 4].copy_from_slice(&self.to_ne_bytes());
    }
}

/// Strided map over one channel: the shared inner loop of every converter.
#[inline]
fn convert_each<S: RawSample, D: RawSample>(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    frames: usize,
    dither: &mut TriangularDither,
    mut map: impl FnMut(S, &mut TriangularDither) -> D,
) {
    let mut src_offset = 0;
    let mut dst_offset = 0;
    for _ in 0..frames {
        let sample = S::load(src, src_offset);
        map(sample, dither).store(dst, dst_offset);
        src_offset += src_stride * S::BYTES;
        dst_offset += dst_stride * D::BYTES;
    }
}

/// Triangular dither rescaled from 16-bit units to ±1 LSB of a destination
/// that drops `removed_bits` bits.
#[inline]
fn dither_units(dither: &mut TriangularDither, removed_bits: u32) -> i32 {
    let tri = dither.next_i32();
    if removed_bits <= 15 {
        tri >> (15 - removed_bits)
    } else {
        tri << (removed_bits - 15)
    }
}

// ---------------------------------------------------------------------------
// Identity copies
// ---------------------------------------------------------------------------

fn copy_1(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<u8, u8>(dst, ds, src, ss, n, g, |v, _| v);
}

fn copy_2(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i16, i16>(dst, ds, src, ss, n, g, |v, _| v);
}

fn copy_3(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<I24, I24>(dst, ds, src, ss, n, g, |v, _| v);
}

fn copy_4(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, i32>(dst, ds, src, ss, n, g, |v, _| v);
}

// ---------------------------------------------------------------------------
// Integer to float32
// ---------------------------------------------------------------------------

fn i8_to_f32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i8, f32>(dst, ds, src, ss, n, g, |v, _| f32::from(v) / 128.0);
}

fn u8_to_f32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<u8, f32>(dst, ds, src, ss, n, g, |v, _| {
        (f32::from(v) - 128.0) / 128.0
    });
}

fn i16_to_f32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i16, f32>(dst, ds, src, ss, n, g, |v, _| f32::from(v) / 32768.0);
}

fn i24_to_f32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<I24, f32>(dst, ds, src, ss, n, g, |v, _| v.0 as f32 / 8_388_608.0);
}

fn i32_to_f32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, f32>(dst, ds, src, ss, n, g, |v, _| {
        (f64::from(v) / 2_147_483_648.0) as f32
    });
}

// ---------------------------------------------------------------------------
// Float32 to integer
//
// The wrapping (non-clip) variants go through a wide integer before the
// final cast so out-of-range values wrap the way a narrowing integer cast
// does, instead of saturating.
// ---------------------------------------------------------------------------

fn f32_to_i8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i8>(dst, ds, src, ss, n, g, |v, _| {
        libm::roundf(v * 127.0) as i64 as i8
    });
}

fn f32_to_i8_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i8>(dst, ds, src, ss, n, g, |v, _| {
        libm::roundf(v * 127.0).clamp(-128.0, 127.0) as i8
    });
}

fn f32_to_i8_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i8>(dst, ds, src, ss, n, g, |v, g| {
        libm::roundf(v * 126.0 + g.next_f32()) as i64 as i8
    });
}

fn f32_to_i8_dither_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i8>(dst, ds, src, ss, n, g, |v, g| {
        libm::roundf(v * 126.0 + g.next_f32()).clamp(-128.0, 127.0) as i8
    });
}

fn f32_to_u8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, u8>(dst, ds, src, ss, n, g, |v, _| {
        (libm::roundf(v * 127.0) as i64).wrapping_add(128) as u8
    });
}

fn f32_to_u8_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, u8>(dst, ds, src, ss, n, g, |v, _| {
        (libm::roundf(v * 127.0).clamp(-128.0, 127.0) as i32 + 128) as u8
    });
}

fn f32_to_u8_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, u8>(dst, ds, src, ss, n, g, |v, g| {
        (libm::roundf(v * 126.0 + g.next_f32()) as i64).wrapping_add(128) as u8
    });
}

fn f32_to_u8_dither_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, u8>(dst, ds, src, ss, n, g, |v, g| {
        (libm::roundf(v * 126.0 + g.next_f32()).clamp(-128.0, 127.0) as i32 + 128) as u8
    });
}

fn f32_to_i16(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i16>(dst, ds, src, ss, n, g, |v, _| {
        libm::roundf(v * 32_767.0) as i64 as i16
    });
}

fn f32_to_i16_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i16>(dst, ds, src, ss, n, g, |v, _| {
        libm::roundf(v * 32_767.0).clamp(-32_768.0, 32_767.0) as i16
    });
}

fn f32_to_i16_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i16>(dst, ds, src, ss, n, g, |v, g| {
        libm::roundf(v * 32_766.0 + g.next_f32()) as i64 as i16
    });
}

fn f32_to_i16_dither_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i16>(dst, ds, src, ss, n, g, |v, g| {
        libm::roundf(v * 32_766.0 + g.next_f32()).clamp(-32_768.0, 32_767.0) as i16
    });
}

fn f32_to_i24(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, I24>(dst, ds, src, ss, n, g, |v, _| {
        I24(libm::round(f64::from(v) * 8_388_607.0) as i64 as i32)
    });
}

fn f32_to_i24_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, I24>(dst, ds, src, ss, n, g, |v, _| {
        I24(libm::round(f64::from(v) * 8_388_607.0).clamp(-8_388_608.0, 8_388_607.0) as i32)
    });
}

fn f32_to_i24_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, I24>(dst, ds, src, ss, n, g, |v, g| {
        I24(libm::round(f64::from(v) * 8_388_606.0 + f64::from(g.next_f32())) as i64 as i32)
    });
}

fn f32_to_i24_dither_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, I24>(dst, ds, src, ss, n, g, |v, g| {
        I24(
            libm::round(f64::from(v) * 8_388_606.0 + f64::from(g.next_f32()))
                .clamp(-8_388_608.0, 8_388_607.0) as i32,
        )
    });
}

fn f32_to_i32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i32>(dst, ds, src, ss, n, g, |v, _| {
        libm::round(f64::from(v) * 2_147_483_647.0) as i64 as i32
    });
}

fn f32_to_i32_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i32>(dst, ds, src, ss, n, g, |v, _| {
        libm::round(f64::from(v) * 2_147_483_647.0).clamp(-2_147_483_648.0, 2_147_483_647.0) as i32
    });
}

fn f32_to_i32_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i32>(dst, ds, src, ss, n, g, |v, g| {
        libm::round(f64::from(v) * 2_147_483_646.0 + f64::from(g.next_f32())) as i64 as i32
    });
}

fn f32_to_i32_dither_clip(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<f32, i32>(dst, ds, src, ss, n, g, |v, g| {
        libm::round(f64::from(v) * 2_147_483_646.0 + f64::from(g.next_f32()))
            .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32
    });
}

// ---------------------------------------------------------------------------
// Integer widening (lossless; round-trips bit-exactly)
// ---------------------------------------------------------------------------

fn i8_to_i16(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i8, i16>(dst, ds, src, ss, n, g, |v, _| i16::from(v) << 8);
}

fn i8_to_i24(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i8, I24>(dst, ds, src, ss, n, g, |v, _| I24(i32::from(v) << 16));
}

fn i8_to_i32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i8, i32>(dst, ds, src, ss, n, g, |v, _| i32::from(v) << 24);
}

fn u8_to_i16(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<u8, i16>(dst, ds, src, ss, n, g, |v, _| {
        i16::from((v ^ 0x80) as i8) << 8
    });
}

fn u8_to_i24(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<u8, I24>(dst, ds, src, ss, n, g, |v, _| {
        I24(i32::from((v ^ 0x80) as i8) << 16)
    });
}

fn u8_to_i32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<u8, i32>(dst, ds, src, ss, n, g, |v, _| {
        i32::from((v ^ 0x80) as i8) << 24
    });
}

fn i16_to_i24(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i16, I24>(dst, ds, src, ss, n, g, |v, _| I24(i32::from(v) << 8));
}

fn i16_to_i32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i16, i32>(dst, ds, src, ss, n, g, |v, _| i32::from(v) << 16);
}

fn i24_to_i32(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<I24, i32>(dst, ds, src, ss, n, g, |v, _| v.0 << 8);
}

// ---------------------------------------------------------------------------
// Same-width sign flips
// ---------------------------------------------------------------------------

fn i8_to_u8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i8, u8>(dst, ds, src, ss, n, g, |v, _| (v as u8) ^ 0x80);
}

fn u8_to_i8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<u8, i8>(dst, ds, src, ss, n, g, |v, _| (v ^ 0x80) as i8);
}

// ---------------------------------------------------------------------------
// Integer narrowing, plain (truncating right shift)
// ---------------------------------------------------------------------------

fn i16_to_i8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i16, i8>(dst, ds, src, ss, n, g, |v, _| (v >> 8) as i8);
}

fn i16_to_u8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i16, u8>(dst, ds, src, ss, n, g, |v, _| ((v >> 8) as u8) ^ 0x80);
}

fn i24_to_i16(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<I24, i16>(dst, ds, src, ss, n, g, |v, _| (v.0 >> 8) as i16);
}

fn i24_to_i8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<I24, i8>(dst, ds, src, ss, n, g, |v, _| (v.0 >> 16) as i8);
}

fn i24_to_u8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<I24, u8>(dst, ds, src, ss, n, g, |v, _| ((v.0 >> 16) as u8) ^ 0x80);
}

fn i32_to_i24(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, I24>(dst, ds, src, ss, n, g, |v, _| I24(v >> 8));
}

fn i32_to_i16(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, i16>(dst, ds, src, ss, n, g, |v, _| (v >> 16) as i16);
}

fn i32_to_i8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, i8>(dst, ds, src, ss, n, g, |v, _| (v >> 24) as i8);
}

fn i32_to_u8(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, u8>(dst, ds, src, ss, n, g, |v, _| ((v >> 24) as u8) ^ 0x80);
}

// ---------------------------------------------------------------------------
// Integer narrowing with triangular dither
//
// The dithered intermediate is clamped to the source range before the
// shift, so the result always fits the destination.
// ---------------------------------------------------------------------------

fn i16_to_i8_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i16, i8>(dst, ds, src, ss, n, g, |v, g| {
        let x = (i32::from(v) + dither_units(g, 8)).clamp(-32_768, 32_767);
        (x >> 8) as i8
    });
}

fn i16_to_u8_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i16, u8>(dst, ds, src, ss, n, g, |v, g| {
        let x = (i32::from(v) + dither_units(g, 8)).clamp(-32_768, 32_767);
        ((x >> 8) as u8) ^ 0x80
    });
}

fn i24_to_i16_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<I24, i16>(dst, ds, src, ss, n, g, |v, g| {
        let x = (i64::from(v.0) + i64::from(dither_units(g, 8))).clamp(-8_388_608, 8_388_607);
        (x >> 8) as i16
    });
}

fn i24_to_i8_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<I24, i8>(dst, ds, src, ss, n, g, |v, g| {
        let x = (i64::from(v.0) + i64::from(dither_units(g, 16))).clamp(-8_388_608, 8_388_607);
        (x >> 16) as i8
    });
}

fn i24_to_u8_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<I24, u8>(dst, ds, src, ss, n, g, |v, g| {
        let x = (i64::from(v.0) + i64::from(dither_units(g, 16))).clamp(-8_388_608, 8_388_607);
        (((x >> 16) as i8) as u8) ^ 0x80
    });
}

fn i32_to_i24_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, I24>(dst, ds, src, ss, n, g, |v, g| {
        let x = (i64::from(v) + i64::from(dither_units(g, 8)))
            .clamp(i64::from(i32::MIN), i64::from(i32::MAX));
        I24((x >> 8) as i32)
    });
}

fn i32_to_i16_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, i16>(dst, ds, src, ss, n, g, |v, g| {
        let x = (i64::from(v) + i64::from(dither_units(g, 16)))
            .clamp(i64::from(i32::MIN), i64::from(i32::MAX));
        (x >> 16) as i16
    });
}

fn i32_to_i8_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, i8>(dst, ds, src, ss, n, g, |v, g| {
        let x = (i64::from(v) + i64::from(dither_units(g, 24)))
            .clamp(i64::from(i32::MIN), i64::from(i32::MAX));
        (x >> 24) as i8
    });
}

fn i32_to_u8_dither(dst: &mut [u8], ds: usize, src: &[u8], ss: usize, n: usize, g: &mut TriangularDither) {
    convert_each::<i32, u8>(dst, ds, src, ss, n, g, |v, g| {
        let x = (i64::from(v) + i64::from(dither_units(g, 24)))
            .clamp(i64::from(i32::MIN), i64::from(i32::MAX));
        (((x >> 24) as i8) as u8) ^ 0x80
    });
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Pick the converter for one direction of a stream.
///
/// Every cell of the format matrix is populated; selection cannot fail.
/// `clip` and `dither` only affect narrowing conversions (float to integer,
/// and integer narrowing for `dither`); widening and identity conversions
/// ignore both.
#[must_use]
pub fn select_converter(
    src: SampleFormat,
    dst: SampleFormat,
    clip: bool,
    dither: bool,
) -> Converter {
    use SampleFormat::{Float32, Int8, Int16, Int24, Int32, UInt8};

    match (src, dst) {
        // identities
        (Int8, Int8) | (UInt8, UInt8) => copy_1,
        (Int16, Int16) => copy_2,
        (Int24, Int24) => copy_3,
        (Int32, Int32) | (Float32, Float32) => copy_4,

        // integer -> float
        (Int8, Float32) => i8_to_f32,
        (UInt8, Float32) => u8_to_f32,
        (Int16, Float32) => i16_to_f32,
        (Int24, Float32) => i24_to_f32,
        (Int32, Float32) => i32_to_f32,

        // float -> integer
        (Float32, Int8) => match (dither, clip) {
            (false, false) => f32_to_i8,
            (false, true) => f32_to_i8_clip,
            (true, false) => f32_to_i8_dither,
            (true, true) => f32_to_i8_dither_clip,
        },
        (Float32, UInt8) => match (dither, clip) {
            (false, false) => f32_to_u8,
            (false, true) => f32_to_u8_clip,
            (true, false) => f32_to_u8_dither,
            (true, true) => f32_to_u8_dither_clip,
        },
        (Float32, Int16) => match (dither, clip) {
            (false, false) => f32_to_i16,
            (false, true) => f32_to_i16_clip,
            (true, false) => f32_to_i16_dither,
            (true, true) => f32_to_i16_dither_clip,
        },
        (Float32, Int24) => match (dither, clip) {
            (false, false) => f32_to_i24,
            (false, true) => f32_to_i24_clip,
            (true, false) => f32_to_i24_dither,
            (true, true) => f32_to_i24_dither_clip,
        },
        (Float32, Int32) => match (dither, clip) {
            (false, false) => f32_to_i32,
            (false, true) => f32_to_i32_clip,
            (true, false) => f32_to_i32_dither,
            (true, true) => f32_to_i32_dither_clip,
        },

        // widening integer
        (Int8, Int16) => i8_to_i16,
        (Int8, Int24) => i8_to_i24,
        (Int8, Int32) => i8_to_i32,
        (UInt8, Int16) => u8_to_i16,
        (UInt8, Int24) => u8_to_i24,
        (UInt8, Int32) => u8_to_i32,
        (Int16, Int24) => i16_to_i24,
        (Int16, Int32) => i16_to_i32,
        (Int24, Int32) => i24_to_i32,

        // same-width sign flips
        (Int8, UInt8) => i8_to_u8,
        (UInt8, Int8) => u8_to_i8,

        // narrowing integer
        (Int16, Int8) => {
            if dither {
                i16_to_i8_dither
            } else {
                i16_to_i8
            }
        }
        (Int16, UInt8) => {
            if dither {
                i16_to_u8_dither
            } else {
                i16_to_u8
            }
        }
        (Int24, Int16) => {
            if dither {
                i24_to_i16_dither
            } else {
                i24_to_i16
            }
        }
        (Int24, Int8) => {
            if dither {
                i24_to_i8_dither
            } else {
                i24_to_i8
            }
        }
        (Int24, UInt8) => {
            if dither {
                i24_to_u8_dither
            } else {
                i24_to_u8
            }
        }
        (Int32, Int24) => {
            if dither {
                i32_to_i24_dither
            } else {
                i32_to_i24
            }
        }
        (Int32, Int16) => {
            if dither {
                i32_to_i16_dither
            } else {
                i32_to_i16
            }
        }
        (Int32, Int8) => {
            if dither {
                i32_to_i8_dither
            } else {
                i32_to_i8
            }
        }
        (Int32, UInt8) => {
            if dither {
                i32_to_u8_dither
            } else {
                i32_to_u8
            }
        }
    }
}

/// Write `frames` silent samples into a strided channel.
///
/// Silence is the format's "ground": zero for every format except uint8,
/// where it is 128.
pub fn write_silence(format: SampleFormat, dst: &mut [u8], stride: usize, frames: usize) {
    let bytes = format.bytes_per_sample();
    let step = stride * bytes;
    let mut offset = 0;
    for _ in 0..frames {
        match format {
            SampleFormat::UInt8 => dst[offset] = 0x80,
            _ => dst[offset..offset + bytes].fill(0),
        }
        offset += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        converter: Converter,
        dst: &mut [u8],
        dst_stride: usize,
        src: &[u8],
        src_stride: usize,
        frames: usize,
    ) {
        let mut g = TriangularDither::new();
        converter(dst, dst_stride, src, src_stride, frames, &mut g);
    }

    #[test]
    fn identity_copy_matches_strided_memcpy() {
        // Interleaved stereo i16 source, extract channel 1 into a packed
        // destination and compare against the hand-computed answer.
        let samples: [i16; 8] = [10, -11, 12, -13, 14, -15, 16, -17];
        let mut src = [0u8; 16];
        for (i, s) in samples.iter().enumerate() {
            s.store(&mut src, i * 2);
        }
        let mut dst = [0u8; 8];
        let conv = select_converter(SampleFormat::Int16, SampleFormat::Int16, true, false);
        // channel 1 = odd samples; stride 2 on the source side
        run(conv, &mut dst, 1, &src[2..], 2, 4);
        for (i, expected) in [-11i16, -13, -15, -17].iter().enumerate() {
            assert_eq!(i16::load(&dst, i * 2), *expected);
        }
    }

    #[test]
    fn i24_pack_unpack_roundtrip() {
        for v in [-8_388_608, -1, 0, 1, 0x123456, 8_388_607] {
            let mut buf = [0u8; 3];
            I24(v).store(&mut buf, 0);
            assert_eq!(I24::load(&buf, 0).0, v);
        }
    }

    #[test]
    fn widening_roundtrips_are_lossless() {
        let values: [i16; 5] = [i16::MIN, -1, 0, 1, i16::MAX];
        let mut src = [0u8; 10];
        for (i, v) in values.iter().enumerate() {
            v.store(&mut src, i * 2);
        }

        // i16 -> i32 -> i16
        let mut wide = [0u8; 20];
        run(
            select_converter(SampleFormat::Int16, SampleFormat::Int32, true, false),
            &mut wide,
            1,
            &src,
            1,
            5,
        );
        let mut back = [0u8; 10];
        run(
            select_converter(SampleFormat::Int32, SampleFormat::Int16, true, false),
            &mut back,
            1,
            &wide,
            1,
            5,
        );
        assert_eq!(src, back);

        // i16 -> i24 -> i16
        let mut wide24 = [0u8; 15];
        run(
            select_converter(SampleFormat::Int16, SampleFormat::Int24, true, false),
            &mut wide24,
            1,
            &src,
            1,
            5,
        );
        let mut back24 = [0u8; 10];
        run(
            select_converter(SampleFormat::Int24, SampleFormat::Int16, true, false),
            &mut back24,
            1,
            &wide24,
            1,
            5,
        );
        assert_eq!(src, back24);
    }

    #[test]
    fn uint8_bias_roundtrip() {
        let mut src = [0u8; 3];
        src[0] = 0; // most negative
        src[1] = 128; // ground
        src[2] = 255; // most positive
        let mut wide = [0u8; 12];
        run(
            select_converter(SampleFormat::UInt8, SampleFormat::Int32, true, false),
            &mut wide,
            1,
            &src,
            1,
            3,
        );
        assert_eq!(i32::load(&wide, 0), i32::MIN);
        assert_eq!(i32::load(&wide, 4), 0);
        assert_eq!(i32::load(&wide, 8), 127 << 24);
        let mut back = [0u8; 3];
        run(
            select_converter(SampleFormat::Int32, SampleFormat::UInt8, true, false),
            &mut back,
            1,
            &wide,
            1,
            3,
        );
        assert_eq!(src, back);
    }

    #[test]
    fn float_to_i16_clips_out_of_range() {
        let mut src = [0u8; 12];
        1.5f32.store(&mut src, 0);
        (-2.0f32).store(&mut src, 4);
        0.5f32.store(&mut src, 8);
        let mut dst = [0u8; 6];
        run(
            select_converter(SampleFormat::Float32, SampleFormat::Int16, true, false),
            &mut dst,
            1,
            &src,
            1,
            3,
        );
        assert_eq!(i16::load(&dst, 0), 32_767);
        assert_eq!(i16::load(&dst, 2), -32_768);
        assert_eq!(i16::load(&dst, 4), 16_384);
    }

    #[test]
    fn float_to_i16_without_clip_wraps() {
        let mut src = [0u8; 4];
        1.5f32.store(&mut src, 0);
        let mut dst = [0u8; 2];
        run(
            select_converter(SampleFormat::Float32, SampleFormat::Int16, false, false),
            &mut dst,
            1,
            &src,
            1,
            1,
        );
        // 1.5 * 32767 rounds to 49151, which wraps negative in 16 bits.
        assert!(i16::load(&dst, 0) < 0);
    }

    #[test]
    fn float_unit_values_hit_full_scale() {
        let mut src = [0u8; 8];
        1.0f32.store(&mut src, 0);
        (-1.0f32).store(&mut src, 4);
        let mut dst = [0u8; 4];
        run(
            select_converter(SampleFormat::Float32, SampleFormat::Int16, true, false),
            &mut dst,
            1,
            &src,
            1,
            2,
        );
        assert_eq!(i16::load(&dst, 0), 32_767);
        assert_eq!(i16::load(&dst, 2), -32_767);
    }

    #[test]
    fn int_to_float_is_bounded() {
        let values = [i32::MIN, -1, 0, 1, i32::MAX];
        let mut src = [0u8; 20];
        for (i, v) in values.iter().enumerate() {
            v.store(&mut src, i * 4);
        }
        let mut dst = [0u8; 20];
        run(
            select_converter(SampleFormat::Int32, SampleFormat::Float32, true, false),
            &mut dst,
            1,
            &src,
            1,
            5,
        );
        for i in 0..5 {
            let f = f32::load(&dst, i * 4);
            assert!((-1.0..=1.0).contains(&f), "out of range: {f}");
        }
    }

    #[test]
    fn f32_i24_f32_roundtrip_error_below_one_lsb() {
        let mut g = TriangularDither::new();
        let to_i24 = select_converter(SampleFormat::Float32, SampleFormat::Int24, true, false);
        let back = select_converter(SampleFormat::Int24, SampleFormat::Float32, true, false);
        for step in 0..=200 {
            let v = -1.0 + step as f32 * 0.01;
            let mut src = [0u8; 4];
            v.store(&mut src, 0);
            let mut mid = [0u8; 3];
            to_i24(&mut mid, 1, &src, 1, 1, &mut g);
            let mut out = [0u8; 4];
            back(&mut out, 1, &mid, 1, 1, &mut g);
            let r = f32::load(&out, 0);
            assert!(
                (r - v).abs() <= 1.0 / 8_388_608.0,
                "error too large at {v}: {r}"
            );
        }
    }

    #[test]
    fn dithered_narrowing_stays_within_one_lsb_of_plain() {
        let mut g = TriangularDither::new();
        let plain = select_converter(SampleFormat::Int16, SampleFormat::Int8, true, false);
        let dithered = select_converter(SampleFormat::Int16, SampleFormat::Int8, true, true);
        let mut src = [0u8; 2];
        for v in [-30_000i16, -256, -1, 0, 1, 255, 30_000] {
            v.store(&mut src, 0);
            let mut a = [0u8; 1];
            let mut b = [0u8; 1];
            plain(&mut a, 1, &src, 1, 1, &mut g);
            dithered(&mut b, 1, &src, 1, 1, &mut g);
            let delta = (i32::from(a[0] as i8) - i32::from(b[0] as i8)).abs();
            assert!(delta <= 2, "dither moved the sample by {delta} LSBs");
        }
    }

    #[test]
    fn silence_is_format_ground() {
        let mut buf = [0xAAu8; 8];
        write_silence(SampleFormat::UInt8, &mut buf, 2, 4);
        assert_eq!(buf, [0x80, 0xAA, 0x80, 0xAA, 0x80, 0xAA, 0x80, 0xAA]);

        let mut buf16 = [0xAAu8; 8];
        write_silence(SampleFormat::Int16, &mut buf16, 2, 2);
        assert_eq!(&buf16[0..2], &[0, 0]);
        assert_eq!(&buf16[4..6], &[0, 0]);
        assert_eq!(&buf16[2..4], &[0xAA, 0xAA]);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Converters are total: arbitrary bit patterns, including
            /// NaN and infinities on the float side, convert without
            /// panicking in every variant.
            #[test]
            fn conversions_accept_any_bit_pattern(
                data in proptest::collection::vec(any::<u8>(), 16..128),
            ) {
                let mut g = TriangularDither::new();
                for src_fmt in SampleFormat::ALL {
                    let frames = data.len() / src_fmt.bytes_per_sample();
                    for dst_fmt in SampleFormat::ALL {
                        let conv = select_converter(src_fmt, dst_fmt, true, true);
                        let mut dst = vec![0u8; frames * dst_fmt.bytes_per_sample()];
                        conv(&mut dst, 1, &data, 1, frames, &mut g);
                    }
                }
            }
        }
    }

    #[test]
    fn every_matrix_cell_is_populated() {
        // Selection must return a working converter for all 36 pairs and
        // all four flag combinations without panicking.
        let mut g = TriangularDither::new();
        for src_fmt in SampleFormat::ALL {
            for dst_fmt in SampleFormat::ALL {
                for (clip, dither) in [(false, false), (true, false), (false, true), (true, true)] {
                    let conv = select_converter(src_fmt, dst_fmt, clip, dither);
                    let src = [0u8; 16];
                    let mut dst = [0u8; 16];
                    conv(&mut dst, 1, &src, 1, 2, &mut g);
                }
            }
        }
    }
}
