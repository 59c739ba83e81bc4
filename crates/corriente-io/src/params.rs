//! Public stream vocabulary: parameters, flags, callback contract.

use crate::buffer::{Buffer, BufferMut};
use corriente_core::SampleFormat;

bitflags::bitflags! {
    /// Behavior flags supplied at stream open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u32 {
        /// Disable the default clipping of out-of-range samples.
        const CLIP_OFF = 1 << 0;
        /// Disable the default dithering of narrowing conversions.
        const DITHER_OFF = 1 << 1;
        /// Full-duplex only: never discard overflowed input without the
        /// callback seeing it. Ignored for blocking streams.
        const NEVER_DROP_INPUT = 1 << 2;
        /// Fill the initial output buffers by calling the stream callback
        /// (with [`CallbackFlags::PRIMING_OUTPUT`] set) instead of with
        /// silence.
        const PRIME_OUTPUT_BUFFERS_USING_STREAM_CALLBACK = 1 << 3;
        /// Bits reserved for backend-specific flags.
        const PLATFORM_SPECIFIC = 0xFFFF_0000;
    }
}

bitflags::bitflags! {
    /// Status bits passed to each callback invocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallbackFlags: u32 {
        /// Input is silence because no real data was available in time.
        const INPUT_UNDERFLOW = 1 << 0;
        /// Input data was discarded before the callback saw it.
        const INPUT_OVERFLOW = 1 << 1;
        /// Output was inserted by the engine because the callback fell
        /// behind.
        const OUTPUT_UNDERFLOW = 1 << 2;
        /// Output data will be discarded because no room was available.
        const OUTPUT_OVERFLOW = 1 << 3;
        /// This invocation fills an initial output buffer before the
        /// stream starts.
        const PRIMING_OUTPUT = 1 << 4;
    }
}

/// The callback's continuation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackResult {
    /// Keep streaming.
    #[default]
    Continue,
    /// Finish after already-queued output has played.
    Complete,
    /// Finish as soon as possible, discarding queued output.
    Abort,
}

/// Timestamps for one callback invocation, all in seconds on the stream's
/// monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeInfo {
    /// When the first frame of the input buffer was captured at the ADC.
    pub input_buffer_adc_time: f64,
    /// The time the callback was invoked.
    pub current_time: f64,
    /// When the first frame of the output buffer will reach the DAC.
    pub output_buffer_dac_time: f64,
}

/// Arguments to one invocation of the stream callback.
///
/// `input` is `None` for output-only streams and during output priming;
/// `output` is `None` for input-only streams.
pub struct StreamCallbackArgs<'a> {
    /// Captured frames in the application's input format, or `None`.
    pub input: Option<Buffer<'a>>,
    /// Output frames to fill in the application's output format, or `None`.
    ///
    /// The callback must fill the entire buffer whatever verdict it
    /// returns, except that [`CallbackResult::Abort`] may leave it
    /// unfilled.
    pub output: Option<BufferMut<'a>>,
    /// Frames in each buffer this invocation.
    pub frames: usize,
    /// Timestamps for this invocation.
    pub time: TimeInfo,
    /// Over/underflow and priming status.
    pub flags: CallbackFlags,
}

/// The application's stream callback.
///
/// Runs on the stream's real-time worker thread. It must not block, must
/// not allocate, and must not call back into stream lifecycle functions;
/// the CPU-load and time getters are the only library calls allowed from
/// inside it.
pub type StreamCallback = Box<dyn FnMut(StreamCallbackArgs<'_>) -> CallbackResult + Send>;

/// Invoked exactly once when a started stream reaches a terminal state of
/// its own accord (callback verdict or worker error). Runs on the worker
/// thread.
pub type FinishedCallback = Box<dyn FnMut() + Send>;

/// Per-direction stream parameters supplied at open.
#[derive(Debug, Clone, Copy)]
pub struct StreamParameters {
    /// Channels the application produces or consumes.
    pub channel_count: usize,
    /// The application-side sample format.
    pub sample_format: SampleFormat,
    /// When `true`, callback buffers carry each channel contiguously
    /// (channel-major) instead of interleaved frames.
    pub non_interleaved: bool,
    /// Latency the application is willing to accept, in seconds. A hint;
    /// the device's achievable latency is reported in [`StreamInfo`].
    pub suggested_latency: f64,
}

impl StreamParameters {
    /// Interleaved parameters with no latency preference.
    #[must_use]
    pub fn new(channel_count: usize, sample_format: SampleFormat) -> StreamParameters {
        StreamParameters {
            channel_count,
            sample_format,
            non_interleaved: false,
            suggested_latency: 0.0,
        }
    }

    /// Same parameters with the non-interleaved layout selected.
    #[must_use]
    pub fn non_interleaved(mut self) -> StreamParameters {
        self.non_interleaved = true;
        self
    }
}

/// Actual properties of an open stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    /// Capture latency in seconds, including adaptation residue.
    pub input_latency: f64,
    /// Playback latency in seconds, including adaptation residue.
    pub output_latency: f64,
    /// The rate the stream actually runs at.
    pub sample_rate: f64,
}
