//! The buffer processor: block-size and format adaptation between host
//! buffers and the application callback.
//!
//! A host backend delivers and demands buffers of its own size, layout and
//! wire format; the application callback produces and consumes blocks of a
//! possibly different size in its own format. The [`BufferProcessor`] sits
//! between them. Depending on the size relationship chosen at
//! construction it runs one of two regimes:
//!
//! - **Non-adapting**: the callback is fed host-sized (or any-sized)
//!   blocks directly through the conversion scratch, with no residues.
//!   Used when the application accepts any block size, or when the host
//!   size is a fixed multiple of the application size.
//! - **Adapting**: scratch buffers carry partial-block residues across
//!   host buffer boundaries so the callback always sees exactly its
//!   requested block size.
//!
//! Each direction of a host buffer is described per visit by two slots
//! (a split double buffer) of [`ChannelDescriptor`]s over caller-loaned
//! byte slices; the processor retains no host memory between calls.
//!
//! Call order per host-buffer visit: [`begin_processing`]
//! (latches timestamps and status flags), the frame-count and channel
//! setters, then [`end_processing`] with the slot data, which runs the
//! regime and reports frames processed plus the callback's verdict.
//!
//! [`begin_processing`]: BufferProcessor::begin_processing
//! [`end_processing`]: BufferProcessor::end_processing

use crate::buffer::{Buffer, BufferMut};
use crate::params::{
    CallbackFlags, CallbackResult, StreamCallback, StreamCallbackArgs, TimeInfo,
};
use crate::{Error, Result};
use corriente_core::{SampleFormat, TriangularDither, WireConverter, WireFormat, write_silence};

/// Scratch size when neither side fixes a block size.
const DEFAULT_TEMP_FRAMES: usize = 1024;

/// How a backend treats the size of the buffers it presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBufferSizeMode {
    /// Every host buffer has exactly the declared frame count.
    Fixed,
    /// Sizes vary up to a declared bound, and the backend tolerates the
    /// processor consuming only part of what is offered.
    BoundedPartialUsageAllowed,
    /// Sizes vary up to a declared bound and everything offered must be
    /// consumed.
    BoundedPartialUsageForbidden,
    /// Sizes are unknown in advance; everything offered must be consumed.
    Unknown,
}

impl HostBufferSizeMode {
    /// Whether the backend can be handed back partially consumed buffers.
    #[must_use]
    pub fn partial_usage_allowed(self) -> bool {
        matches!(self, HostBufferSizeMode::BoundedPartialUsageAllowed)
    }
}

/// One channel inside a host buffer slot: a byte offset to its first
/// sample and a stride in samples. A stride of 1 names a non-interleaved
/// channel; a stride equal to the buffer's channel count names an
/// interleaved channel at an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// Byte offset of the channel's first sample within the slot.
    pub offset: usize,
    /// Distance between consecutive samples, in samples. Nonzero.
    pub stride: usize,
}

/// The host slot byte slices for one processing call.
///
/// Slots are loaned for the duration of the call only. They are mutable in
/// both directions: output slots are written, and input slots may be
/// normalized in place by wire-layout stages.
#[derive(Default)]
pub struct ProcessorIo<'a> {
    /// Input slot data, indexed by slot.
    pub input: [Option<&'a mut [u8]>; 2],
    /// Output slot data, indexed by slot.
    pub output: [Option<&'a mut [u8]>; 2],
}

/// Outcome of one [`BufferProcessor::end_processing`] call.
#[derive(Debug, Clone, Copy)]
pub struct ProcessResult {
    /// Application frames produced/consumed by this call.
    pub frames: usize,
    /// The callback's (combined) terminal verdict for this call.
    pub result: CallbackResult,
}

/// Per-direction configuration for [`BufferProcessor::new`].
#[derive(Debug, Clone, Copy)]
pub struct DirectionConfig {
    /// Application-side channel count.
    pub channels: usize,
    /// Application-side sample format.
    pub app_format: SampleFormat,
    /// `true` for interleaved application buffers.
    pub app_interleaved: bool,
    /// Host-side wire layout.
    pub wire_format: WireFormat,
}

/// Full configuration for [`BufferProcessor::new`].
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// Capture direction, if present.
    pub input: Option<DirectionConfig>,
    /// Playback direction, if present.
    pub output: Option<DirectionConfig>,
    /// Stream sample rate in Hz.
    pub sample_rate: f64,
    /// Application block size; 0 means the callback accepts any size.
    pub frames_per_app_buffer: usize,
    /// Host block size; 0 means unknown/variable.
    pub frames_per_host_buffer: usize,
    /// The backend's buffer-size behavior.
    pub host_buffer_size_mode: HostBufferSizeMode,
    /// Clip narrowing conversions (default on at the stream layer).
    pub clip: bool,
    /// Dither narrowing conversions (default off at the stream layer).
    pub dither: bool,
    /// When set, output scratch is primed by the callback instead of
    /// silence at reset.
    pub prime_output_with_callback: bool,
}

struct Direction {
    channels: usize,
    app_format: SampleFormat,
    app_interleaved: bool,
    app_bytes: usize,
    host_bytes: usize,
    converter: WireConverter,
    /// 4-byte aligned scratch backing; `temp_len` bytes are in use.
    temp: Vec<u32>,
    temp_len: usize,
    descriptors: [Vec<ChannelDescriptor>; 2],
}

impl Direction {
    fn new(
        config: DirectionConfig,
        frames_per_temp: usize,
        incoming: bool,
        clip: bool,
        dither: bool,
    ) -> Result<Direction> {
        if config.channels == 0 {
            return Err(Error::InvalidChannelCount);
        }
        let converter = if incoming {
            WireConverter::incoming(config.wire_format, config.app_format, clip, dither)
        } else {
            WireConverter::outgoing(config.app_format, config.wire_format, clip, dither)
        }
        .ok_or(Error::SampleFormatNotSupported)?;

        let app_bytes = config.app_format.bytes_per_sample();
        let temp_len = frames_per_temp * config.channels * app_bytes;
        let temp = vec![0u32; temp_len.div_ceil(4)];

        let descriptor = ChannelDescriptor {
            offset: 0,
            stride: 1,
        };
        Ok(Direction {
            channels: config.channels,
            app_format: config.app_format,
            app_interleaved: config.app_interleaved,
            app_bytes,
            host_bytes: config.wire_format.format.bytes_per_sample(),
            converter,
            temp,
            temp_len,
            descriptors: [
                vec![descriptor; config.channels],
                vec![descriptor; config.channels],
            ],
        })
    }

    fn temp_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.temp)[..self.temp_len]
    }

    fn temp_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.temp)[..self.temp_len]
    }

    fn silence_temp(&mut self) {
        let format = self.app_format;
        let samples = self.temp_len / self.app_bytes;
        write_silence(format, self.temp_bytes_mut(), 1, samples);
    }

    /// Convert `frames` host samples from `slot_data` into the scratch at
    /// frame offset `temp_offset`, with non-interleaved channel lanes laid
    /// out `lane_frames` apart, then advance the slot's descriptors.
    fn convert_in(
        &mut self,
        slot: usize,
        slot_data: &mut [u8],
        frames: usize,
        temp_offset: usize,
        lane_frames: usize,
        dither: &mut TriangularDither,
    ) {
        let channels = self.channels;
        let app_bytes = self.app_bytes;
        let host_bytes = self.host_bytes;
        let interleaved = self.app_interleaved;
        let temp_len = self.temp_len;
        let temp: &mut [u8] = &mut bytemuck::cast_slice_mut(&mut self.temp)[..temp_len];

        for (index, descriptor) in self.descriptors[slot].iter_mut().enumerate() {
            let (dest_start, dest_stride) = if interleaved {
                ((temp_offset * channels + index) * app_bytes, channels)
            } else {
                ((index * lane_frames + temp_offset) * app_bytes, 1)
            };
            self.converter.convert_incoming(
                &mut temp[dest_start..],
                dest_stride,
                &mut slot_data[descriptor.offset..],
                descriptor.stride,
                frames,
                dither,
            );
            descriptor.offset += frames * descriptor.stride * host_bytes;
        }
    }

    /// Convert `frames` application samples from the scratch (starting at
    /// frame offset `temp_offset`) into `slot_data`, then advance the
    /// slot's descriptors.
    fn convert_out(
        &mut self,
        slot: usize,
        slot_data: &mut [u8],
        frames: usize,
        temp_offset: usize,
        lane_frames: usize,
        dither: &mut TriangularDither,
    ) {
        let channels = self.channels;
        let app_bytes = self.app_bytes;
        let host_bytes = self.host_bytes;
        let interleaved = self.app_interleaved;
        let temp_len = self.temp_len;
        let temp: &[u8] = &bytemuck::cast_slice(&self.temp)[..temp_len];

        for (index, descriptor) in self.descriptors[slot].iter_mut().enumerate() {
            let (src_start, src_stride) = if interleaved {
                ((temp_offset * channels + index) * app_bytes, channels)
            } else {
                ((index * lane_frames + temp_offset) * app_bytes, 1)
            };
            self.converter.convert_outgoing(
                &mut slot_data[descriptor.offset..],
                descriptor.stride,
                &temp[src_start..],
                src_stride,
                frames,
                dither,
            );
            descriptor.offset += frames * descriptor.stride * host_bytes;
        }
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: usize, b: usize) -> usize {
    (a * b) / gcd(a, b)
}

/// Worst-case residue left in the adaptation scratch when host buffers of
/// `host_frames` are cut into application buffers of `app_frames`.
fn frame_shift(host_frames: usize, app_frames: usize) -> usize {
    let cycle = lcm(host_frames, app_frames);
    let mut shift = 0;
    let mut i = host_frames;
    while i < cycle {
        shift = shift.max(i % app_frames);
        i += host_frames;
    }
    shift
}

fn combine_verdict(a: CallbackResult, b: CallbackResult) -> CallbackResult {
    match (a, b) {
        (CallbackResult::Abort, _) | (_, CallbackResult::Abort) => CallbackResult::Abort,
        (CallbackResult::Complete, _) | (_, CallbackResult::Complete) => CallbackResult::Complete,
        _ => CallbackResult::Continue,
    }
}

/// The block-size and format adaptor between host buffers and the
/// application callback. See the module docs for the regimes and the
/// per-call protocol.
pub struct BufferProcessor {
    frames_per_app_buffer: usize,
    frames_per_host_buffer: usize,
    host_mode: HostBufferSizeMode,
    use_non_adapting: bool,
    frames_per_temp: usize,

    input: Option<Direction>,
    output: Option<Direction>,

    initial_input_residue: usize,
    initial_output_residue: usize,
    frames_in_temp_input: usize,
    frames_in_temp_output: usize,

    prime_output_with_callback: bool,
    dither: TriangularDither,
    sample_period: f64,
    host_out_time: f64,
    time_info: TimeInfo,
    flags_this_call: CallbackFlags,
    no_input_this_call: bool,

    host_input_frames: [usize; 2],
    host_output_frames: [usize; 2],

    callback: StreamCallback,
}

impl BufferProcessor {
    /// Build a processor: select converters, size scratch, choose the
    /// adaptation regime.
    pub fn new(config: ProcessorConfig, callback: StreamCallback) -> Result<BufferProcessor> {
        if config.sample_rate <= 0.0 {
            return Err(Error::InvalidSampleRate);
        }
        if config.input.is_none() && config.output.is_none() {
            return Err(Error::BadIoDeviceCombination);
        }

        let full_duplex = config.input.is_some() && config.output.is_some();
        let app_frames = config.frames_per_app_buffer;
        let host_frames = config.frames_per_host_buffer;

        let mut use_non_adapting = false;
        let mut initial_input_residue = 0;
        let mut initial_output_residue = 0;

        let frames_per_temp = if app_frames == 0 {
            // The callback accepts whatever block size arrives.
            use_non_adapting = true;
            if host_frames != 0 {
                host_frames
            } else {
                DEFAULT_TEMP_FRAMES
            }
        } else {
            if config.host_buffer_size_mode == HostBufferSizeMode::Fixed
                && host_frames != 0
                && host_frames % app_frames == 0
            {
                use_non_adapting = true;
            } else if full_duplex {
                if config.host_buffer_size_mode == HostBufferSizeMode::Fixed && host_frames != 0 {
                    let shift = frame_shift(host_frames, app_frames);
                    if app_frames > host_frames {
                        initial_input_residue = shift;
                    } else {
                        initial_output_residue = shift;
                    }
                } else {
                    // Variable-size host buffers cost one application
                    // buffer of latency.
                    initial_output_residue = app_frames;
                }
            }
            app_frames
        };

        let input = config
            .input
            .map(|direction| {
                Direction::new(direction, frames_per_temp, true, config.clip, config.dither)
            })
            .transpose()?;
        let output = config
            .output
            .map(|direction| {
                Direction::new(direction, frames_per_temp, false, config.clip, config.dither)
            })
            .transpose()?;

        let mut processor = BufferProcessor {
            frames_per_app_buffer: app_frames,
            frames_per_host_buffer: host_frames,
            host_mode: config.host_buffer_size_mode,
            use_non_adapting,
            frames_per_temp,
            input,
            output,
            initial_input_residue,
            initial_output_residue,
            frames_in_temp_input: 0,
            frames_in_temp_output: 0,
            prime_output_with_callback: config.prime_output_with_callback,
            dither: TriangularDither::new(),
            sample_period: 1.0 / config.sample_rate,
            host_out_time: 0.0,
            time_info: TimeInfo::default(),
            flags_this_call: CallbackFlags::empty(),
            no_input_this_call: false,
            host_input_frames: [0; 2],
            host_output_frames: [0; 2],
            callback,
        };
        processor.reset();
        Ok(processor)
    }

    /// The adaptation regime in use.
    #[must_use]
    pub fn is_non_adapting(&self) -> bool {
        self.use_non_adapting
    }

    /// Frames of capture latency the adaptation residue adds.
    #[must_use]
    pub fn input_latency_frames(&self) -> usize {
        self.initial_input_residue
    }

    /// Frames of playback latency the adaptation residue adds.
    #[must_use]
    pub fn output_latency_frames(&self) -> usize {
        self.initial_output_residue
    }

    /// Current input residue; exposed for diagnostics and tests.
    #[must_use]
    pub fn frames_in_temp_input(&self) -> usize {
        self.frames_in_temp_input
    }

    /// Current output residue; exposed for diagnostics and tests.
    #[must_use]
    pub fn frames_in_temp_output(&self) -> usize {
        self.frames_in_temp_output
    }

    /// Clear residues back to their initial values and silence the
    /// scratch (unless output priming is callback-driven). Called when a
    /// stream starts.
    pub fn reset(&mut self) {
        self.frames_in_temp_input = self.initial_input_residue;
        self.frames_in_temp_output = self.initial_output_residue;
        self.no_input_this_call = false;
        if self.frames_in_temp_input > 0 {
            if let Some(direction) = self.input.as_mut() {
                direction.silence_temp();
            }
        }
        if self.frames_in_temp_output > 0 && !self.prime_output_with_callback {
            if let Some(direction) = self.output.as_mut() {
                direction.silence_temp();
            }
        }
    }

    /// Latch timestamps and status flags for the next
    /// [`end_processing`](BufferProcessor::end_processing) and clear the
    /// per-call slot accounting.
    ///
    /// The first callback of the coming call generates samples that play
    /// after whatever is already waiting in the output scratch, so the DAC
    /// clock starts beyond the residue.
    pub fn begin_processing(&mut self, time_info: TimeInfo, flags: CallbackFlags) {
        self.time_info = time_info;
        self.flags_this_call = flags;
        self.host_out_time = time_info.output_buffer_dac_time
            + self.frames_in_temp_output as f64 * self.sample_period;
        self.host_input_frames = [0; 2];
        self.host_output_frames = [0; 2];
    }

    /// Process the coming call as output-only even though the stream has
    /// input; used while priming output buffers before start.
    pub fn set_no_input(&mut self) {
        self.no_input_this_call = true;
    }

    /// Set the frame count of an input slot.
    pub fn set_input_frame_count(&mut self, slot: usize, frames: usize) {
        self.host_input_frames[slot] = frames;
    }

    /// Set the frame count of an output slot.
    pub fn set_output_frame_count(&mut self, slot: usize, frames: usize) {
        self.host_output_frames[slot] = frames;
    }

    /// Describe one input channel of a slot.
    pub fn set_input_channel(&mut self, slot: usize, channel: usize, descriptor: ChannelDescriptor) {
        debug_assert!(descriptor.stride != 0);
        let direction = self.input.as_mut().expect("stream has no input");
        direction.descriptors[slot][channel] = descriptor;
    }

    /// Describe `channel_count` interleaved input channels starting at
    /// `first_channel`, with the interleave beginning at `byte_offset`.
    /// A `channel_count` of 0 means all of the direction's channels.
    pub fn set_interleaved_input_channels(
        &mut self,
        slot: usize,
        first_channel: usize,
        byte_offset: usize,
        channel_count: usize,
    ) {
        let direction = self.input.as_mut().expect("stream has no input");
        let count = if channel_count == 0 {
            direction.channels
        } else {
            channel_count
        };
        debug_assert!(first_channel + count <= direction.channels);
        for i in 0..count {
            direction.descriptors[slot][first_channel + i] = ChannelDescriptor {
                offset: byte_offset + i * direction.host_bytes,
                stride: count,
            };
        }
    }

    /// Describe one non-interleaved (contiguous) input channel.
    pub fn set_non_interleaved_input_channel(
        &mut self,
        slot: usize,
        channel: usize,
        byte_offset: usize,
    ) {
        self.set_input_channel(
            slot,
            channel,
            ChannelDescriptor {
                offset: byte_offset,
                stride: 1,
            },
        );
    }

    /// Describe one output channel of a slot.
    pub fn set_output_channel(
        &mut self,
        slot: usize,
        channel: usize,
        descriptor: ChannelDescriptor,
    ) {
        debug_assert!(descriptor.stride != 0);
        let direction = self.output.as_mut().expect("stream has no output");
        direction.descriptors[slot][channel] = descriptor;
    }

    /// Describe `channel_count` interleaved output channels starting at
    /// `first_channel`. A `channel_count` of 0 means all of the
    /// direction's channels.
    pub fn set_interleaved_output_channels(
        &mut self,
        slot: usize,
        first_channel: usize,
        byte_offset: usize,
        channel_count: usize,
    ) {
        let direction = self.output.as_mut().expect("stream has no output");
        let count = if channel_count == 0 {
            direction.channels
        } else {
            channel_count
        };
        debug_assert!(first_channel + count <= direction.channels);
        for i in 0..count {
            direction.descriptors[slot][first_channel + i] = ChannelDescriptor {
                offset: byte_offset + i * direction.host_bytes,
                stride: count,
            };
        }
    }

    /// Describe one non-interleaved (contiguous) output channel.
    pub fn set_non_interleaved_output_channel(
        &mut self,
        slot: usize,
        channel: usize,
        byte_offset: usize,
    ) {
        self.set_output_channel(
            slot,
            channel,
            ChannelDescriptor {
                offset: byte_offset,
                stride: 1,
            },
        );
    }

    /// Run the selected regime over the slot data and report frames
    /// processed plus the callback's verdict. Never fails; an
    /// [`Abort`](CallbackResult::Abort) verdict cuts the call short.
    pub fn end_processing(&mut self, mut io: ProcessorIo<'_>) -> ProcessResult {
        let mut verdict = CallbackResult::Continue;
        let mut frames_processed = 0;

        let has_input = self.input.is_some() && !self.no_input_this_call;
        let has_output = self.output.is_some();

        if has_input && has_output {
            debug_assert_eq!(
                self.host_input_frames[0] + self.host_input_frames[1],
                self.host_output_frames[0] + self.host_output_frames[1],
                "full-duplex frame balance violated by the caller",
            );
        }

        if self.use_non_adapting {
            if has_input && has_output {
                // Splice the two directions, draining whichever slot pair
                // is non-empty in lockstep.
                let mut frames_to_go = self.host_input_frames[0] + self.host_input_frames[1];
                while frames_to_go > 0 {
                    let in_slot = if self.host_input_frames[0] != 0 { 0 } else { 1 };
                    let out_slot = if self.host_output_frames[0] != 0 { 0 } else { 1 };
                    let frames = self.host_input_frames[in_slot].min(self.host_output_frames[out_slot]);
                    if frames == 0 {
                        break;
                    }
                    let processed = self.non_adapting_block(
                        &mut io,
                        Some(in_slot),
                        Some(out_slot),
                        frames,
                        &mut verdict,
                    );
                    self.host_input_frames[in_slot] -= processed;
                    self.host_output_frames[out_slot] -= processed;
                    frames_processed += processed;
                    frames_to_go = frames_to_go.saturating_sub(frames.max(processed));
                    if verdict == CallbackResult::Abort {
                        break;
                    }
                }
            } else {
                for slot in 0..2 {
                    if verdict == CallbackResult::Abort {
                        break;
                    }
                    let frames = if has_input {
                        self.host_input_frames[slot]
                    } else {
                        self.host_output_frames[slot]
                    };
                    if frames > 0 {
                        frames_processed += self.non_adapting_block(
                            &mut io,
                            has_input.then_some(slot),
                            has_output.then_some(slot),
                            frames,
                            &mut verdict,
                        );
                    }
                }
            }
        } else if has_input && has_output {
            frames_processed = self.adapting_duplex(&mut io, &mut verdict);
        } else if has_input {
            for slot in 0..2 {
                if verdict == CallbackResult::Abort {
                    break;
                }
                let frames = self.host_input_frames[slot];
                if frames > 0 {
                    frames_processed += self.adapting_input_only(&mut io, slot, frames, &mut verdict);
                }
            }
        } else if has_output {
            for slot in 0..2 {
                if verdict == CallbackResult::Abort {
                    break;
                }
                let frames = self.host_output_frames[slot];
                if frames > 0 {
                    frames_processed += self.adapting_output_only(&mut io, slot, frames, &mut verdict);
                }
            }
        }

        self.no_input_this_call = false;
        ProcessResult {
            frames: frames_processed,
            result: verdict,
        }
    }

    /// Direct host-block processing through the scratch, in chunks of at
    /// most the scratch size. Half or full duplex.
    fn non_adapting_block(
        &mut self,
        io: &mut ProcessorIo<'_>,
        in_slot: Option<usize>,
        out_slot: Option<usize>,
        frames_to_process: usize,
        verdict: &mut CallbackResult,
    ) -> usize {
        let mut frames_to_go = frames_to_process;
        let mut frames_processed = 0;

        while frames_to_go > 0 {
            let frame_count = self.frames_per_temp.min(frames_to_go);

            if let Some(slot) = in_slot {
                let slot_data = io.input[slot]
                    .as_deref_mut()
                    .expect("input slot frames set without slot data");
                if let Some(direction) = self.input.as_mut() {
                    direction.convert_in(slot, slot_data, frame_count, 0, frame_count, &mut self.dither);
                }
            }

            let this_verdict = self.invoke_callback(frame_count, in_slot.is_some());
            *verdict = combine_verdict(*verdict, this_verdict);
            if this_verdict == CallbackResult::Abort {
                // The callback may leave an aborted buffer unfilled; do
                // not convert it into the host slot.
                break;
            }

            if let Some(slot) = out_slot {
                let slot_data = io.output[slot]
                    .as_deref_mut()
                    .expect("output slot frames set without slot data");
                if let Some(direction) = self.output.as_mut() {
                    direction.convert_out(slot, slot_data, frame_count, 0, frame_count, &mut self.dither);
                }
            }

            frames_processed += frame_count;
            frames_to_go -= frame_count;
        }

        frames_processed
    }

    /// Half-duplex adapting input: accumulate host frames into the input
    /// scratch; invoke the callback whenever a full application buffer is
    /// ready. Partial residue persists across host buffers.
    fn adapting_input_only(
        &mut self,
        io: &mut ProcessorIo<'_>,
        slot: usize,
        frames_to_process: usize,
        verdict: &mut CallbackResult,
    ) -> usize {
        let app_frames = self.frames_per_app_buffer;
        let mut frames_to_go = frames_to_process;
        let mut frames_processed = 0;

        while frames_to_go > 0 {
            let frame_count = (app_frames - self.frames_in_temp_input).min(frames_to_go);
            let slot_data = io.input[slot]
                .as_deref_mut()
                .expect("input slot frames set without slot data");
            let offset = self.frames_in_temp_input;
            if let Some(direction) = self.input.as_mut() {
                direction.convert_in(slot, slot_data, frame_count, offset, app_frames, &mut self.dither);
            }
            self.frames_in_temp_input += frame_count;

            if self.frames_in_temp_input == app_frames {
                let this_verdict = self.invoke_callback(app_frames, true);
                *verdict = combine_verdict(*verdict, this_verdict);
                self.frames_in_temp_input = 0;
                if this_verdict == CallbackResult::Abort {
                    return frames_processed + frame_count;
                }
            }

            frames_processed += frame_count;
            frames_to_go -= frame_count;
        }

        frames_processed
    }

    /// Half-duplex adapting output: when the output scratch is empty the
    /// callback refills it, then it drains into host buffers, possibly
    /// across several of them.
    fn adapting_output_only(
        &mut self,
        io: &mut ProcessorIo<'_>,
        slot: usize,
        frames_to_process: usize,
        verdict: &mut CallbackResult,
    ) -> usize {
        let app_frames = self.frames_per_app_buffer.max(1);
        let mut frames_to_go = frames_to_process;
        let mut frames_processed = 0;

        while frames_to_go > 0 {
            if self.frames_in_temp_output == 0 {
                let this_verdict = self.invoke_callback(app_frames, false);
                *verdict = combine_verdict(*verdict, this_verdict);
                if this_verdict == CallbackResult::Abort {
                    return frames_processed;
                }
                self.frames_in_temp_output = app_frames;
            }

            let frame_count = self.frames_in_temp_output.min(frames_to_go);
            let offset = app_frames - self.frames_in_temp_output;
            let slot_data = io.output[slot]
                .as_deref_mut()
                .expect("output slot frames set without slot data");
            if let Some(direction) = self.output.as_mut() {
                direction.convert_out(slot, slot_data, frame_count, offset, app_frames, &mut self.dither);
            }
            self.frames_in_temp_output -= frame_count;

            frames_processed += frame_count;
            frames_to_go -= frame_count;
        }

        frames_processed
    }

    /// Full-duplex adaptation: drain output residue, fill input scratch,
    /// fire the callback when the input is full and the output is empty.
    ///
    /// On backends that tolerate partial consumption the loop leaves a
    /// trailing partial application buffer in the host buffers; everywhere
    /// else it absorbs the tail into the residues.
    fn adapting_duplex(&mut self, io: &mut ProcessorIo<'_>, verdict: &mut CallbackResult) -> usize {
        let app_frames = self.frames_per_app_buffer;
        let mut frames_available = self.host_input_frames[0] + self.host_input_frames[1];
        let mut frames_processed = 0;

        let end_processing_min = if self.host_mode.partial_usage_allowed() {
            app_frames - 1
        } else {
            0
        };

        while frames_available > end_processing_min {
            let mut progressed = false;

            // Drain the output scratch into whichever output slot has room.
            while self.frames_in_temp_output > 0
                && (self.host_output_frames[0] + self.host_output_frames[1]) > 0
            {
                let slot = if self.host_output_frames[0] > 0 { 0 } else { 1 };
                let frame_count = self.frames_in_temp_output.min(self.host_output_frames[slot]);
                let offset = app_frames - self.frames_in_temp_output;
                let slot_data = io.output[slot]
                    .as_deref_mut()
                    .expect("output slot frames set without slot data");
                if let Some(direction) = self.output.as_mut() {
                    direction.convert_out(slot, slot_data, frame_count, offset, app_frames, &mut self.dither);
                }
                self.host_output_frames[slot] -= frame_count;
                self.frames_in_temp_output -= frame_count;
                progressed = true;
            }

            // Fill the input scratch from whichever input slot has data.
            while self.frames_in_temp_input < app_frames
                && (self.host_input_frames[0] + self.host_input_frames[1]) > 0
            {
                let slot = if self.host_input_frames[0] > 0 { 0 } else { 1 };
                let frame_count =
                    (app_frames - self.frames_in_temp_input).min(self.host_input_frames[slot]);
                let offset = self.frames_in_temp_input;
                let slot_data = io.input[slot]
                    .as_deref_mut()
                    .expect("input slot frames set without slot data");
                if let Some(direction) = self.input.as_mut() {
                    direction.convert_in(slot, slot_data, frame_count, offset, app_frames, &mut self.dither);
                }
                self.host_input_frames[slot] -= frame_count;
                self.frames_in_temp_input += frame_count;
                frames_available -= frame_count;
                frames_processed += frame_count;
                progressed = true;
            }

            if self.frames_in_temp_input == app_frames && self.frames_in_temp_output == 0 {
                let this_verdict = self.invoke_callback(app_frames, true);
                *verdict = combine_verdict(*verdict, this_verdict);
                self.frames_in_temp_input = 0;
                self.frames_in_temp_output = app_frames;
                progressed = true;
                if this_verdict == CallbackResult::Abort {
                    break;
                }
            }

            // The caller upholds the frame-balance invariant; if it was
            // broken anyway, stop rather than spin.
            if !progressed {
                debug_assert!(false, "adapting full-duplex made no progress");
                break;
            }
        }

        frames_processed
    }

    /// Present the scratch buffers to the callback for `frames` frames and
    /// advance the DAC-time cursor.
    fn invoke_callback(&mut self, frames: usize, with_input: bool) -> CallbackResult {
        let time = TimeInfo {
            input_buffer_adc_time: self.time_info.input_buffer_adc_time,
            current_time: self.time_info.current_time,
            output_buffer_dac_time: self.host_out_time,
        };
        let flags = self.flags_this_call;

        let input = if with_input {
            self.input.as_ref().map(|direction| {
                let len = frames * direction.channels * direction.app_bytes;
                Buffer::new(
                    &direction.temp_bytes()[..len],
                    direction.app_format,
                    direction.channels,
                    frames,
                    direction.app_interleaved,
                )
            })
        } else {
            None
        };
        let output = self.output.as_mut().map(|direction| {
            let len = frames * direction.channels * direction.app_bytes;
            let format = direction.app_format;
            let channels = direction.channels;
            let interleaved = direction.app_interleaved;
            BufferMut::new(
                &mut direction.temp_bytes_mut()[..len],
                format,
                channels,
                frames,
                interleaved,
            )
        });

        let verdict = (self.callback)(StreamCallbackArgs {
            input,
            output,
            frames,
            time,
            flags,
        });
        self.host_out_time += frames as f64 * self.sample_period;
        verdict
    }
}

impl std::fmt::Debug for BufferProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferProcessor")
            .field("frames_per_app_buffer", &self.frames_per_app_buffer)
            .field("frames_per_host_buffer", &self.frames_per_host_buffer)
            .field("non_adapting", &self.use_non_adapting)
            .field("frames_in_temp_input", &self.frames_in_temp_input)
            .field("frames_in_temp_output", &self.frames_in_temp_output)
            .finish_non_exhaustive()
    }
}
