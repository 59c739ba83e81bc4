//! Triangular-PDF dither noise source.
//!
//! Narrowing sample conversions quantize; adding sub-LSB triangular noise
//! before the quantization decorrelates the error from the signal. The
//! generator here produces one triangular deviate per call by summing two
//! independent linear-congruential streams, then first-differences the
//! result so the noise spectrum is tilted away from DC.
//!
//! One generator instance belongs to each stream. It is deliberately not
//! thread-safe; the stream's processing loop is its only caller.

/// Bits of amplitude in one uniform deviate; the triangular sum spans
/// roughly ±2^15.
const DITHER_BITS: u32 = 15;

/// Linear-congruential multiplier shared by both streams.
const LCG_MUL: u32 = 196_314_165;
/// Linear-congruential increment shared by both streams.
const LCG_ADD: u32 = 907_633_515;

/// Stateful triangular-PDF noise generator.
///
/// [`next_i32`](TriangularDither::next_i32) yields values in roughly
/// ±0x7FFF, scaled for a 16-bit LSB; narrowing converters rescale to the
/// LSB they are quantizing to. [`next_f32`](TriangularDither::next_f32)
/// yields the same sequence scaled to roughly ±1.0.
#[derive(Debug, Clone)]
pub struct TriangularDither {
    seed1: u32,
    seed2: u32,
    previous: i32,
}

impl TriangularDither {
    /// Create a generator with the fixed default seeds.
    #[must_use]
    pub const fn new() -> TriangularDither {
        TriangularDither {
            seed1: 22_222,
            seed2: 5_555_555,
            previous: 0,
        }
    }

    /// Next triangular deviate, scaled so one 16-bit LSB is ±1 unit of the
    /// top dither bit (range roughly ±0x7FFF).
    #[inline]
    pub fn next_i32(&mut self) -> i32 {
        self.seed1 = self.seed1.wrapping_mul(LCG_MUL).wrapping_add(LCG_ADD);
        self.seed2 = self.seed2.wrapping_mul(LCG_MUL).wrapping_add(LCG_ADD);
        // Arithmetic shift keeps the sign of each uniform deviate.
        let current =
            ((self.seed1 as i32) >> (32 - DITHER_BITS)) + ((self.seed2 as i32) >> (32 - DITHER_BITS));
        // First difference: high-pass the noise so its energy sits away
        // from DC where the ear is most sensitive.
        let shaped = current - self.previous;
        self.previous = current;
        shaped
    }

    /// Next triangular deviate scaled to roughly ±1.0, i.e. one LSB of
    /// whatever integer scale the caller is rounding to.
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        const SCALE: f32 = 1.0 / ((1 << DITHER_BITS) as f32);
        self.next_i32() as f32 * SCALE
    }
}

impl Default for TriangularDither {
    fn default() -> Self {
        TriangularDither::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_sequence() {
        let mut a = TriangularDither::new();
        let mut b = TriangularDither::new();
        for _ in 0..1000 {
            assert_eq!(a.next_i32(), b.next_i32());
        }
    }

    #[test]
    fn bounded_amplitude() {
        // Triangular sum spans ±2^15; the first difference at most doubles
        // it. Anything outside ±2^17 means the shift arithmetic broke.
        let mut g = TriangularDither::new();
        for _ in 0..100_000 {
            let v = g.next_i32();
            assert!(v > -(1 << 17) && v < (1 << 17), "out of range: {v}");
        }
    }

    #[test]
    fn roughly_zero_mean() {
        let mut g = TriangularDither::new();
        let n = 100_000;
        let sum: i64 = (0..n).map(|_| i64::from(g.next_i32())).sum();
        let mean = sum as f64 / f64::from(n);
        assert!(mean.abs() < 64.0, "mean too far from zero: {mean}");
    }

    #[test]
    fn float_scale_tracks_integer_scale() {
        let mut gi = TriangularDither::new();
        let mut gf = TriangularDither::new();
        for _ in 0..1000 {
            let i = gi.next_i32();
            let f = gf.next_f32();
            assert!((f - i as f32 / 32768.0).abs() < 1e-6);
        }
    }
}
