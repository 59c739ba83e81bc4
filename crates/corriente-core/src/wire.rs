//! Driver-native wire layout stages.
//!
//! Drivers declare layouts like "int32 container, 24 significant bits,
//! LSB-justified, big-endian". Conversion against such a layout decomposes
//! into three orthogonal stages: an optional byte swap, an optional bit
//! shift, and the base format conversion from [`convert`](crate::convert).
//! [`WireConverter`] composes the three at selection time; calling it
//! involves no layout interpretation, just the pre-selected stages.
//!
//! Stages operate in place on the host-side bytes: host slots are loaned
//! mutably for exactly this reason. Incoming data is normalized
//! (swap, then shift into MSB alignment) before the base conversion reads
//! it; outgoing data is converted first and then denormalized.

use crate::convert::{Converter, I24, RawSample, select_converter};
use crate::dither::TriangularDither;
use crate::format::{SampleFormat, WireFormat};

/// An in-place transform over one strided channel of host samples:
/// `(channel bytes, stride in samples, frames)`.
pub type SwapStage = fn(&mut [u8], usize, usize);

fn swap_2(buf: &mut [u8], stride: usize, frames: usize) {
    let step = stride * 2;
    let mut offset = 0;
    for _ in 0..frames {
        buf.swap(offset, offset + 1);
        offset += step;
    }
}

fn swap_3(buf: &mut [u8], stride: usize, frames: usize) {
    let step = stride * 3;
    let mut offset = 0;
    for _ in 0..frames {
        buf.swap(offset, offset + 2);
        offset += step;
    }
}

fn swap_4(buf: &mut [u8], stride: usize, frames: usize) {
    let step = stride * 4;
    let mut offset = 0;
    for _ in 0..frames {
        buf.swap(offset, offset + 3);
        buf.swap(offset + 1, offset + 2);
        offset += step;
    }
}

/// The in-place byte swapper for a sample width, if the width has one.
#[must_use]
pub fn select_byte_swapper(format: SampleFormat) -> Option<SwapStage> {
    match format.bytes_per_sample() {
        2 => Some(swap_2),
        3 => Some(swap_3),
        4 => Some(swap_4),
        _ => None,
    }
}

/// Which way a shift stage moves the significant bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShiftDirection {
    /// Unpacking: LSB-justified bits move up into MSB alignment.
    Left,
    /// Packing: MSB-aligned bits move down into the LSB-justified field.
    /// Arithmetic, so the sign lands in the significant bits.
    Right,
}

/// An in-place bit shift over one strided channel of container samples.
#[derive(Debug, Clone, Copy)]
struct ShiftStage {
    container: SampleFormat,
    bits: u8,
    direction: ShiftDirection,
}

impl ShiftStage {
    fn apply(&self, buf: &mut [u8], stride: usize, frames: usize) {
        let bits = u32::from(self.bits);
        let step = stride * self.container.bytes_per_sample();
        let mut offset = 0;
        match self.container {
            SampleFormat::Int16 => {
                for _ in 0..frames {
                    let v = i16::load(buf, offset);
                    let shifted = match self.direction {
                        ShiftDirection::Left => v << bits,
                        ShiftDirection::Right => v >> bits,
                    };
                    shifted.store(buf, offset);
                    offset += step;
                }
            }
            SampleFormat::Int24 => {
                for _ in 0..frames {
                    let v = I24::load(buf, offset);
                    let shifted = match self.direction {
                        ShiftDirection::Left => v.0 << bits,
                        ShiftDirection::Right => v.0 >> bits,
                    };
                    I24(shifted).store(buf, offset);
                    offset += step;
                }
            }
            SampleFormat::Int32 => {
                for _ in 0..frames {
                    let v = i32::load(buf, offset);
                    let shifted = match self.direction {
                        ShiftDirection::Left => v << bits,
                        ShiftDirection::Right => v >> bits,
                    };
                    shifted.store(buf, offset);
                    offset += step;
                }
            }
            // 8-bit and float containers never carry a shift stage;
            // WireFormat::is_supported rules them out.
            SampleFormat::Int8 | SampleFormat::UInt8 | SampleFormat::Float32 => {}
        }
    }
}

/// A statically composed wire-layout converter for one stream direction.
///
/// Built once at stream open by [`WireConverter::incoming`] or
/// [`WireConverter::outgoing`]; per-call work is exactly the selected
/// stages, nothing is re-derived.
pub struct WireConverter {
    swap: Option<SwapStage>,
    shift: Option<ShiftStage>,
    base: Converter,
}

impl WireConverter {
    /// Compose a host-to-application converter.
    ///
    /// Returns `None` when the wire layout is not expressible
    /// (see [`WireFormat::is_supported`]).
    #[must_use]
    pub fn incoming(
        wire: WireFormat,
        app: SampleFormat,
        clip: bool,
        dither: bool,
    ) -> Option<WireConverter> {
        if !wire.is_supported() {
            return None;
        }
        Some(WireConverter {
            swap: wire.needs_swap().then(|| select_byte_swapper(wire.format)).flatten(),
            shift: wire.needs_shift().then_some(ShiftStage {
                container: wire.format,
                bits: wire.shift_bits(),
                direction: ShiftDirection::Left,
            }),
            base: select_converter(wire.format, app, clip, dither),
        })
    }

    /// Compose an application-to-host converter.
    #[must_use]
    pub fn outgoing(
        app: SampleFormat,
        wire: WireFormat,
        clip: bool,
        dither: bool,
    ) -> Option<WireConverter> {
        if !wire.is_supported() {
            return None;
        }
        Some(WireConverter {
            swap: wire.needs_swap().then(|| select_byte_swapper(wire.format)).flatten(),
            shift: wire.needs_shift().then_some(ShiftStage {
                container: wire.format,
                bits: wire.shift_bits(),
                direction: ShiftDirection::Right,
            }),
            base: select_converter(app, wire.format, clip, dither),
        })
    }

    /// Convert one host channel into an application channel.
    ///
    /// The host bytes are normalized in place (swap, then shift) before the
    /// base conversion reads them.
    pub fn convert_incoming(
        &self,
        dst: &mut [u8],
        dst_stride: usize,
        host: &mut [u8],
        host_stride: usize,
        frames: usize,
        dither: &mut TriangularDither,
    ) {
        if let Some(swap) = self.swap {
            swap(host, host_stride, frames);
        }
        if let Some(shift) = &self.shift {
            shift.apply(host, host_stride, frames);
        }
        (self.base)(dst, dst_stride, host, host_stride, frames, dither);
    }

    /// Convert one application channel into a host channel.
    ///
    /// The base conversion writes container samples; the stages then shift
    /// them into the declared field and swap into the declared byte order.
    pub fn convert_outgoing(
        &self,
        host: &mut [u8],
        host_stride: usize,
        src: &[u8],
        src_stride: usize,
        frames: usize,
        dither: &mut TriangularDither,
    ) {
        (self.base)(host, host_stride, src, src_stride, frames, dither);
        if let Some(shift) = &self.shift {
            shift.apply(host, host_stride, frames);
        }
        if let Some(swap) = self.swap {
            swap(host, host_stride, frames);
        }
    }
}
