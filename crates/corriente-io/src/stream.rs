//! Stream lifecycle and the public open/start/stop/abort surface.
//!
//! A [`Stream`] is the opaque handle applications hold. Internally it is
//! either a callback stream — whose audio runs on a dedicated worker
//! thread ([`worker`](crate::worker)) — or a blocking stream, whose audio
//! is pumped by the application from [`Stream::read`] / [`Stream::write`].
//! Both kinds share the same validation, buffer processor and host device
//! seam; only the driving thread differs.

use crate::blocking::BlockingStream;
use crate::buffer::Sample;
use crate::group::ResourceGroup;
use crate::host::{DeviceConfig, EndpointConfig, HostDevice, HostWaker};
use crate::params::{
    FinishedCallback, StreamCallback, StreamFlags, StreamInfo, StreamParameters,
};
use crate::processor::{
    BufferProcessor, DirectionConfig, HostBufferSizeMode, ProcessorConfig,
};
use crate::worker::{EndpointCache, StreamShared, StreamState, Worker, WorkerConfig};
use crate::{Error, Result, require_initialized};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Open a stream against `device`.
///
/// `input`/`output` select the directions and their application-side
/// shape; at least one must be present and each must fit what the device
/// offers. `frames_per_buffer` of 0 means the callback accepts any block
/// size. A `callback` of `None` requests a blocking stream driven through
/// [`Stream::read`] and [`Stream::write`].
///
/// The stream is returned stopped; nothing runs until
/// [`Stream::start`].
pub fn open_stream(
    device: Box<dyn HostDevice>,
    input: Option<StreamParameters>,
    output: Option<StreamParameters>,
    sample_rate: f64,
    frames_per_buffer: usize,
    flags: StreamFlags,
    callback: Option<StreamCallback>,
) -> Result<Stream> {
    require_initialized()?;

    let device_config = device.config();
    validate_open(
        &device_config,
        input.as_ref(),
        output.as_ref(),
        sample_rate,
        frames_per_buffer,
        flags,
        callback.is_some(),
    )?;

    // Everything acquired before the stream exists is released in
    // reverse order if a later step fails.
    let mut group = ResourceGroup::new();
    group.adopt(device);

    let input_endpoint = input.map(|params| {
        let endpoint = device_config.input.expect("validated above");
        resolve_endpoint(&params, &endpoint)
    });
    let output_endpoint = output.map(|params| {
        let endpoint = device_config.output.expect("validated above");
        resolve_endpoint(&params, &endpoint)
    });

    let host_frames = input_endpoint
        .map(|(cache, _)| cache.frames_per_buffer)
        .or(output_endpoint.map(|(cache, _)| cache.frames_per_buffer))
        .unwrap_or(0);

    let clip = !flags.contains(StreamFlags::CLIP_OFF);
    let dither = !flags.contains(StreamFlags::DITHER_OFF);
    let prime = flags.contains(StreamFlags::PRIME_OUTPUT_BUFFERS_USING_STREAM_CALLBACK);

    let processor_config = ProcessorConfig {
        input: input_endpoint.map(|(_, direction)| direction),
        output: output_endpoint.map(|(_, direction)| direction),
        sample_rate,
        frames_per_app_buffer: frames_per_buffer,
        frames_per_host_buffer: host_frames,
        host_buffer_size_mode: device_config.buffer_size_mode,
        clip,
        dither,
        prime_output_with_callback: prime,
    };

    match callback {
        Some(callback) => {
            // Converter selection and scratch sizing can fail; the group
            // still owns the device and releases it on the error path.
            let processor = BufferProcessor::new(processor_config, callback)?;
            let device = group.reclaim::<Box<dyn HostDevice>>().ok_or(Error::InternalError)?;
            let info = stream_info(&processor, sample_rate, &input_endpoint, &output_endpoint);
            let stream = CallbackStream::new(
                device,
                processor,
                WorkerConfig {
                    input: input_endpoint.map(|(cache, _)| cache),
                    output: output_endpoint.map(|(cache, _)| cache),
                    flags,
                    info,
                    throttle_on_overload: true,
                },
            );
            tracing::info!(
                sample_rate,
                frames_per_buffer,
                kind = "callback",
                "stream opened"
            );
            Ok(Stream {
                inner: StreamInner::Callback(stream),
            })
        }
        None => {
            let device = group.reclaim::<Box<dyn HostDevice>>().ok_or(Error::InternalError)?;
            let stream = BlockingStream::open(
                device,
                processor_config,
                input_endpoint.map(|(cache, _)| cache),
                output_endpoint.map(|(cache, _)| cache),
            )?;
            tracing::info!(
                sample_rate,
                frames_per_buffer,
                kind = "blocking",
                "stream opened"
            );
            Ok(Stream {
                inner: StreamInner::Blocking(stream),
            })
        }
    }
}

fn validate_open(
    device: &DeviceConfig,
    input: Option<&StreamParameters>,
    output: Option<&StreamParameters>,
    sample_rate: f64,
    frames_per_buffer: usize,
    flags: StreamFlags,
    has_callback: bool,
) -> Result<()> {
    if input.is_none() && output.is_none() {
        return Err(Error::BadIoDeviceCombination);
    }
    if sample_rate <= 0.0 || (sample_rate - device.sample_rate).abs() > f64::EPSILON {
        return Err(Error::InvalidSampleRate);
    }
    if flags.contains(StreamFlags::PRIME_OUTPUT_BUFFERS_USING_STREAM_CALLBACK) && !has_callback {
        // Priming is defined by the callback; a blocking stream has none.
        return Err(Error::InvalidFlag);
    }

    if let Some(params) = input {
        let endpoint = device.input.ok_or(Error::InvalidDevice)?;
        validate_direction(params, &endpoint, frames_per_buffer, device.buffer_size_mode)?;
    }
    if let Some(params) = output {
        let endpoint = device.output.ok_or(Error::InvalidDevice)?;
        validate_direction(params, &endpoint, frames_per_buffer, device.buffer_size_mode)?;
    }

    if let (Some(_), Some(_)) = (input, output) {
        let in_frames = device.input.map_or(0, |endpoint| endpoint.frames_per_buffer);
        let out_frames = device.output.map_or(0, |endpoint| endpoint.frames_per_buffer);
        // The processor balances full-duplex frame counts per call;
        // mismatched endpoint sizes cannot uphold that.
        if in_frames != out_frames {
            return Err(Error::BadIoDeviceCombination);
        }
    }
    Ok(())
}

fn validate_direction(
    params: &StreamParameters,
    endpoint: &EndpointConfig,
    frames_per_buffer: usize,
    mode: HostBufferSizeMode,
) -> Result<()> {
    if params.channel_count == 0 || params.channel_count > endpoint.channels {
        return Err(Error::InvalidChannelCount);
    }
    if !endpoint.wire_format.is_supported() {
        return Err(Error::SampleFormatNotSupported);
    }
    let bounded = matches!(
        mode,
        HostBufferSizeMode::BoundedPartialUsageAllowed
            | HostBufferSizeMode::BoundedPartialUsageForbidden
    );
    if bounded && endpoint.frames_per_buffer != 0 && frames_per_buffer > endpoint.frames_per_buffer
    {
        return Err(Error::BufferTooBig);
    }
    Ok(())
}

fn resolve_endpoint(
    params: &StreamParameters,
    endpoint: &EndpointConfig,
) -> (EndpointCache, DirectionConfig) {
    (
        EndpointCache {
            device_channels: endpoint.channels,
            app_channels: params.channel_count,
            frames_per_buffer: endpoint.frames_per_buffer,
            host_sample_bytes: endpoint.wire_format.format.bytes_per_sample(),
            host_format: endpoint.wire_format.format,
        },
        DirectionConfig {
            channels: params.channel_count,
            app_format: params.sample_format,
            app_interleaved: !params.non_interleaved,
            wire_format: endpoint.wire_format,
        },
    )
}

fn stream_info(
    processor: &BufferProcessor,
    sample_rate: f64,
    input: &Option<(EndpointCache, DirectionConfig)>,
    output: &Option<(EndpointCache, DirectionConfig)>,
) -> StreamInfo {
    let input_latency = input.map_or(0.0, |(cache, _)| {
        (cache.frames_per_buffer + processor.input_latency_frames()) as f64 / sample_rate
    });
    let output_latency = output.map_or(0.0, |(cache, _)| {
        (cache.frames_per_buffer + processor.output_latency_frames()) as f64 / sample_rate
    });
    StreamInfo {
        input_latency,
        output_latency,
        sample_rate,
    }
}

enum StreamInner {
    Callback(CallbackStream),
    Blocking(BlockingStream),
}

/// An open audio stream. Opaque; applications interact with it only
/// through these methods.
pub struct Stream {
    inner: StreamInner,
}

impl Stream {
    /// Begin audio I/O. For callback streams this spawns the worker; for
    /// blocking streams it starts the pins.
    pub fn start(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamInner::Callback(stream) => stream.start(),
            StreamInner::Blocking(stream) => stream.start(),
        }
    }

    /// Stop cooperatively: queued output finishes playing first.
    pub fn stop(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamInner::Callback(stream) => stream.stop(false),
            StreamInner::Blocking(stream) => stream.stop(),
        }
    }

    /// Stop as soon as possible, discarding queued output.
    pub fn abort(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamInner::Callback(stream) => stream.stop(true),
            StreamInner::Blocking(stream) => stream.abort(),
        }
    }

    /// Stop if needed and release the stream.
    pub fn close(mut self) -> Result<()> {
        match &mut self.inner {
            StreamInner::Callback(stream) => {
                if stream.started {
                    stream.stop(true)?;
                }
                Ok(())
            }
            StreamInner::Blocking(stream) => stream.abort(),
        }
    }

    /// `true` when the stream is in the stopped state (never started, or
    /// start balanced by stop/abort).
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        match &self.inner {
            StreamInner::Callback(stream) => !stream.started,
            StreamInner::Blocking(stream) => !stream.is_started(),
        }
    }

    /// `true` while audio is actually moving: between start and either a
    /// stop/abort or the callback finishing the stream.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match &self.inner {
            StreamInner::Callback(stream) => stream.shared.is_active(),
            StreamInner::Blocking(stream) => stream.is_started(),
        }
    }

    /// Actual latencies and rate of the open stream.
    #[must_use]
    pub fn info(&self) -> StreamInfo {
        match &self.inner {
            StreamInner::Callback(stream) => stream.info,
            StreamInner::Blocking(stream) => stream.info(),
        }
    }

    /// Capture latency in seconds.
    #[must_use]
    pub fn input_latency(&self) -> f64 {
        self.info().input_latency
    }

    /// Playback latency in seconds.
    #[must_use]
    pub fn output_latency(&self) -> f64 {
        self.info().output_latency
    }

    /// Seconds on the stream's monotonic clock; the time base of
    /// [`TimeInfo`](crate::TimeInfo).
    #[must_use]
    pub fn time(&self) -> f64 {
        match &self.inner {
            StreamInner::Callback(stream) => stream.epoch.elapsed().as_secs_f64(),
            StreamInner::Blocking(stream) => stream.time(),
        }
    }

    /// Smoothed CPU load of the stream callback; zero for blocking
    /// streams and freshly started streams.
    #[must_use]
    pub fn cpu_load(&self) -> f64 {
        match &self.inner {
            StreamInner::Callback(stream) => stream.shared.cpu_load(),
            StreamInner::Blocking(_) => 0.0,
        }
    }

    /// Install (or clear) the hook invoked when a started stream reaches
    /// a terminal state. Only allowed while stopped.
    pub fn set_finished_callback(&mut self, callback: Option<FinishedCallback>) -> Result<()> {
        match &mut self.inner {
            StreamInner::Callback(stream) => {
                if stream.started {
                    return Err(Error::StreamIsNotStopped);
                }
                stream.shared.set_finished_callback(callback);
                Ok(())
            }
            StreamInner::Blocking(stream) => stream.set_finished_callback(callback),
        }
    }

    /// Read `frames` captured frames into `buffer` (interleaved,
    /// application format), blocking until they are available. Blocking
    /// streams only.
    pub fn read(&mut self, buffer: &mut [u8], frames: usize) -> Result<()> {
        match &mut self.inner {
            StreamInner::Callback(_) => Err(Error::CanNotReadFromACallbackStream),
            StreamInner::Blocking(stream) => stream.read(buffer, frames),
        }
    }

    /// Write `frames` frames from `buffer` (interleaved, application
    /// format), blocking until they are queued. Blocking streams only.
    pub fn write(&mut self, buffer: &[u8], frames: usize) -> Result<()> {
        match &mut self.inner {
            StreamInner::Callback(_) => Err(Error::CanNotWriteToACallbackStream),
            StreamInner::Blocking(stream) => stream.write(buffer, frames),
        }
    }

    /// Typed convenience over [`read`](Stream::read).
    pub fn read_samples<T: Sample>(&mut self, buffer: &mut [T]) -> Result<()> {
        let frames = self.reader_frames::<T>(buffer.len())?;
        self.read(bytemuck::cast_slice_mut(buffer), frames)
    }

    /// Typed convenience over [`write`](Stream::write).
    pub fn write_samples<T: Sample>(&mut self, buffer: &[T]) -> Result<()> {
        let frames = self.writer_frames::<T>(buffer.len())?;
        self.write(bytemuck::cast_slice(buffer), frames)
    }

    /// Frames that can be read without blocking.
    pub fn read_available(&mut self) -> Result<usize> {
        match &mut self.inner {
            StreamInner::Callback(_) => Err(Error::CanNotReadFromACallbackStream),
            StreamInner::Blocking(stream) => stream.read_available(),
        }
    }

    /// Frames that can be written without blocking.
    pub fn write_available(&mut self) -> Result<usize> {
        match &mut self.inner {
            StreamInner::Callback(_) => Err(Error::CanNotWriteToACallbackStream),
            StreamInner::Blocking(stream) => stream.write_available(),
        }
    }

    fn reader_frames<T: Sample>(&self, samples: usize) -> Result<usize> {
        match &self.inner {
            StreamInner::Callback(_) => Err(Error::CanNotReadFromACallbackStream),
            StreamInner::Blocking(stream) => {
                let channels = stream.input_channels().ok_or(Error::CanNotReadFromAnOutputOnlyStream)?;
                stream.check_app_format(true, T::FORMAT)?;
                Ok(samples / channels)
            }
        }
    }

    fn writer_frames<T: Sample>(&self, samples: usize) -> Result<usize> {
        match &self.inner {
            StreamInner::Callback(_) => Err(Error::CanNotWriteToACallbackStream),
            StreamInner::Blocking(stream) => {
                let channels = stream.output_channels().ok_or(Error::CanNotWriteToAnInputOnlyStream)?;
                stream.check_app_format(false, T::FORMAT)?;
                Ok(samples / channels)
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            StreamInner::Callback(_) => "callback",
            StreamInner::Blocking(_) => "blocking",
        };
        f.debug_struct("Stream").field("kind", &kind).finish_non_exhaustive()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let StreamInner::Callback(stream) = &mut self.inner {
            if stream.started {
                let _ = stream.stop(true);
            }
        }
    }
}

struct CallbackStream {
    shared: Arc<StreamShared>,
    /// Parked worker while stopped; in flight while started.
    worker: Option<Worker>,
    join: Option<std::thread::JoinHandle<Worker>>,
    waker: HostWaker,
    info: StreamInfo,
    epoch: Instant,
    shutdown_wait: Duration,
    started: bool,
}

impl CallbackStream {
    fn new(device: Box<dyn HostDevice>, processor: BufferProcessor, config: WorkerConfig) -> CallbackStream {
        let shared = StreamShared::new();
        let waker = device.waker();
        let info = config.info;
        let buffer_frames = config
            .input
            .iter()
            .chain(config.output.iter())
            .map(|endpoint| endpoint.frames_per_buffer)
            .max()
            .unwrap_or(0);
        let total_buffer = 2.0 * buffer_frames.max(1) as f64 / info.sample_rate;
        let shutdown_wait =
            Duration::from_secs_f64(total_buffer * 1.5).max(Duration::from_secs(1));
        let worker = Worker::new(device, processor, Arc::clone(&shared), config);
        CallbackStream {
            shared,
            worker: Some(worker),
            join: None,
            waker,
            info,
            epoch: Instant::now(),
            shutdown_wait,
            started: false,
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::StreamIsNotStopped);
        }
        let mut worker = self.worker.take().ok_or(Error::InternalError)?;
        worker.prepare_run();
        self.shared.clear_requests();
        self.shared.set_active(true);
        let handle = std::thread::Builder::new()
            .name("corriente-stream".into())
            .spawn(move || {
                worker.run();
                worker
            })
            .map_err(|_| Error::InsufficientMemory)?;
        self.join = Some(handle);
        self.started = true;
        tracing::debug!("stream started");
        Ok(())
    }

    /// Shared stop/abort path; `hard` discards queued output.
    fn stop(&mut self, hard: bool) -> Result<()> {
        if !self.started {
            return Err(Error::StreamIsStopped);
        }
        let was_active = self.shared.is_active();
        if hard {
            self.shared.request_abort();
        } else {
            self.shared.request_stop();
        }
        self.waker.wake();

        self.join_worker()?;
        self.started = false;
        self.shared.set_active(false);
        self.shared.set_state(StreamState::Stopped);

        if was_active {
            // Externally driven stop: the worker skipped the hook, so it
            // fires here, after all state has settled.
            self.shared.fire_finished();
        }
        tracing::debug!(hard, "stream stopped");

        // Surface any error the worker stored during the run.
        match self.shared.take_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn join_worker(&mut self) -> Result<()> {
        let Some(handle) = self.join.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.shutdown_wait;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                // The worker missed its shutdown budget. Dropping the
                // handle detaches the runaway thread; the stream can no
                // longer be restarted.
                drop(handle);
                tracing::error!("stream worker missed its shutdown budget");
                return Err(Error::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        match handle.join() {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(_) => Err(Error::InternalError),
        }
    }
}
