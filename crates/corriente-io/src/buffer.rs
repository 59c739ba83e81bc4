//! Typed views over application sample buffers.
//!
//! The engine's scratch buffers are raw bytes; callbacks want `&[f32]` or
//! `&mut [i16]`. [`Buffer`] and [`BufferMut`] wrap a byte slice together
//! with its format and layout, and hand out typed slices via
//! [`bytemuck`] casts. The backing allocations are 4-byte aligned, so the
//! casts always succeed for matching formats.
//!
//! Packed 24-bit buffers have no native Rust element type; access them
//! through the byte accessors.

use corriente_core::SampleFormat;

/// A sample type usable with the typed accessors.
///
/// Implemented for the formats with a native Rust representation; packed
/// 24-bit data is bytes-only.
pub trait Sample: bytemuck::Pod {
    /// The stream format this type reads.
    const FORMAT: SampleFormat;
}

impl Sample for i8 {
    const FORMAT: SampleFormat = SampleFormat::Int8;
}
impl Sample for u8 {
    const FORMAT: SampleFormat = SampleFormat::UInt8;
}
impl Sample for i16 {
    const FORMAT: SampleFormat = SampleFormat::Int16;
}
impl Sample for i32 {
    const FORMAT: SampleFormat = SampleFormat::Int32;
}
impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::Float32;
}

#[derive(Debug, Clone, Copy)]
struct Shape {
    format: SampleFormat,
    channels: usize,
    frames: usize,
    interleaved: bool,
}

impl Shape {
    fn check_format(&self, requested: SampleFormat) {
        assert!(
            self.format == requested,
            "buffer holds {} samples, not {}",
            self.format,
            requested
        );
    }

    fn channel_range(&self, channel: usize) -> core::ops::Range<usize> {
        assert!(
            !self.interleaved,
            "per-channel access requires a non-interleaved buffer"
        );
        assert!(channel < self.channels, "channel {channel} out of range");
        let bytes = self.frames * self.format.bytes_per_sample();
        let start = channel * bytes;
        start..start + bytes
    }
}

/// A read-only view of captured application-format samples.
pub struct Buffer<'a> {
    bytes: &'a [u8],
    shape: Shape,
}

impl<'a> Buffer<'a> {
    pub(crate) fn new(
        bytes: &'a [u8],
        format: SampleFormat,
        channels: usize,
        frames: usize,
        interleaved: bool,
    ) -> Buffer<'a> {
        debug_assert_eq!(bytes.len(), frames * channels * format.bytes_per_sample());
        Buffer {
            bytes,
            shape: Shape {
                format,
                channels,
                frames,
                interleaved,
            },
        }
    }

    /// The application sample format of this buffer.
    #[must_use]
    pub fn format(&self) -> SampleFormat {
        self.shape.format
    }

    /// Channels in this buffer.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    /// Frames in this buffer.
    #[must_use]
    pub fn frames(&self) -> usize {
        self.shape.frames
    }

    /// `true` when frames are interleaved; `false` when the buffer is
    /// channel-major.
    #[must_use]
    pub fn is_interleaved(&self) -> bool {
        self.shape.interleaved
    }

    /// The raw bytes: interleaved frames, or all channels back to back.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    /// All samples as a typed slice.
    ///
    /// # Panics
    /// Panics when `T` does not match the buffer's format.
    #[must_use]
    pub fn samples<T: Sample>(&self) -> &[T] {
        self.shape.check_format(T::FORMAT);
        bytemuck::cast_slice(self.bytes)
    }

    /// One channel of a non-interleaved buffer as a typed slice.
    ///
    /// # Panics
    /// Panics on an interleaved buffer, a format mismatch, or an
    /// out-of-range channel.
    #[must_use]
    pub fn channel<T: Sample>(&self, channel: usize) -> &[T] {
        self.shape.check_format(T::FORMAT);
        bytemuck::cast_slice(&self.bytes[self.shape.channel_range(channel)])
    }

    /// One channel of a non-interleaved buffer as raw bytes; works for any
    /// format including packed 24-bit.
    #[must_use]
    pub fn channel_bytes(&self, channel: usize) -> &[u8] {
        &self.bytes[self.shape.channel_range(channel)]
    }
}

/// A mutable view of application-format samples for the callback to fill.
pub struct BufferMut<'a> {
    bytes: &'a mut [u8],
    shape: Shape,
}

impl<'a> BufferMut<'a> {
    pub(crate) fn new(
        bytes: &'a mut [u8],
        format: SampleFormat,
        channels: usize,
        frames: usize,
        interleaved: bool,
    ) -> BufferMut<'a> {
        debug_assert_eq!(bytes.len(), frames * channels * format.bytes_per_sample());
        BufferMut {
            bytes,
            shape: Shape {
                format,
                channels,
                frames,
                interleaved,
            },
        }
    }

    /// The application sample format of this buffer.
    #[must_use]
    pub fn format(&self) -> SampleFormat {
        self.shape.format
    }

    /// Channels in this buffer.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    /// Frames in this buffer.
    #[must_use]
    pub fn frames(&self) -> usize {
        self.shape.frames
    }

    /// `true` when frames are interleaved.
    #[must_use]
    pub fn is_interleaved(&self) -> bool {
        self.shape.interleaved
    }

    /// The raw bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    /// The raw bytes, writable.
    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// All samples as a typed slice.
    ///
    /// # Panics
    /// Panics when `T` does not match the buffer's format.
    #[must_use]
    pub fn samples<T: Sample>(&self) -> &[T] {
        self.shape.check_format(T::FORMAT);
        bytemuck::cast_slice(self.bytes)
    }

    /// All samples as a writable typed slice.
    ///
    /// # Panics
    /// Panics when `T` does not match the buffer's format.
    #[must_use]
    pub fn samples_mut<T: Sample>(&mut self) -> &mut [T] {
        self.shape.check_format(T::FORMAT);
        bytemuck::cast_slice_mut(self.bytes)
    }

    /// One channel of a non-interleaved buffer, writable.
    ///
    /// # Panics
    /// Panics on an interleaved buffer, a format mismatch, or an
    /// out-of-range channel.
    #[must_use]
    pub fn channel_mut<T: Sample>(&mut self, channel: usize) -> &mut [T] {
        self.shape.check_format(T::FORMAT);
        let range = self.shape.channel_range(channel);
        bytemuck::cast_slice_mut(&mut self.bytes[range])
    }

    /// One channel as writable raw bytes; works for packed 24-bit.
    #[must_use]
    pub fn channel_bytes_mut(&mut self, channel: usize) -> &mut [u8] {
        let range = self.shape.channel_range(channel);
        &mut self.bytes[range]
    }

    /// Fill the whole buffer with format silence.
    pub fn fill_silence(&mut self) {
        corriente_core::write_silence(self.shape.format, self.bytes, 1, self.shape.frames * self.shape.channels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access_interleaved() {
        let mut backing = vec![0u32; 4]; // 4-aligned backing for 8 i16 samples
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut backing);
        let mut buf = BufferMut::new(bytes, SampleFormat::Int16, 2, 4, true);
        buf.samples_mut::<i16>().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf.samples::<i16>()[2], 3);
        assert_eq!(buf.frames(), 4);
        assert_eq!(buf.channels(), 2);
    }

    #[test]
    fn channel_access_non_interleaved() {
        let mut backing = vec![0u32; 8]; // 8 f32 samples
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut backing);
        let mut buf = BufferMut::new(bytes, SampleFormat::Float32, 2, 4, false);
        buf.channel_mut::<f32>(1).fill(0.25);
        assert!(buf.channel_mut::<f32>(0).iter().all(|&v| v == 0.0));
        assert_eq!(buf.samples::<f32>()[4..8], [0.25; 4]);
    }

    #[test]
    #[should_panic(expected = "buffer holds")]
    fn format_mismatch_panics() {
        let backing = vec![0u32; 4];
        let bytes: &[u8] = bytemuck::cast_slice(&backing);
        let buf = Buffer::new(bytes, SampleFormat::Int16, 2, 4, true);
        let _ = buf.samples::<f32>();
    }

    #[test]
    #[should_panic(expected = "per-channel access")]
    fn channel_access_on_interleaved_panics() {
        let backing = vec![0u32; 4];
        let bytes: &[u8] = bytemuck::cast_slice(&backing);
        let buf = Buffer::new(bytes, SampleFormat::Int16, 2, 4, true);
        let _ = buf.channel_bytes(0);
    }

    #[test]
    fn silence_fill_uses_format_ground() {
        let mut backing = vec![0u32; 1];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut backing);
        let mut buf = BufferMut::new(bytes, SampleFormat::UInt8, 2, 2, true);
        buf.fill_silence();
        assert_eq!(buf.bytes(), &[0x80; 4]);
    }
}
