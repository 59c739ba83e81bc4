//! The per-stream host event loop.
//!
//! Every started callback stream runs one worker thread. The worker blocks
//! in the device's multi-signal wait, queues ready slots, drives the
//! buffer processor over them, and hands the slots back. It owns the
//! stream's real-time state outright: the buffer processor, the CPU-load
//! meter, the slot queues. Application threads communicate with it only
//! through atomic flags on [`StreamShared`] and the device waker.
//!
//! The run of a worker walks the stream state machine:
//!
//! ```text
//! Stopped -> Starting -> Running -> StopPending -> Finished
//!                            \----> Aborting    -> Finished
//! ```
//!
//! `Running -> StopPending` on a stop request or a `Complete` verdict
//! (queued output drains first); `-> Aborting` on an abort request, an
//! `Abort` verdict, or a device error (nothing drains).

use crate::host::{HostDevice, SLOTS_PER_DIRECTION, ThreadPriority};
use crate::params::{CallbackFlags, CallbackResult, FinishedCallback, StreamFlags, StreamInfo, TimeInfo};
use crate::processor::{BufferProcessor, ChannelDescriptor, ProcessorIo};
use crate::{Error, Result};
use corriente_core::{CpuLoadMeasurer, write_silence};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// CPU load above which the worker throttles itself.
const THROTTLE_LOAD: f64 = 1.0;

/// Stream lifecycle states, as stored in [`StreamShared::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum StreamState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    StopPending = 3,
    Aborting = 4,
    Finished = 5,
}

impl StreamState {
    fn from_u8(value: u8) -> StreamState {
        match value {
            1 => StreamState::Starting,
            2 => StreamState::Running,
            3 => StreamState::StopPending,
            4 => StreamState::Aborting,
            5 => StreamState::Finished,
            _ => StreamState::Stopped,
        }
    }
}

/// State shared between a stream handle and its worker thread.
///
/// Everything the application threads touch while the worker runs is an
/// atomic or a mutex that is never held across a wait.
pub(crate) struct StreamShared {
    state: AtomicU8,
    stop_requested: AtomicBool,
    abort_requested: AtomicBool,
    active: AtomicBool,
    cpu_load_bits: AtomicU64,
    error: Mutex<Option<Error>>,
    finished: Mutex<Option<FinishedCallback>>,
    finished_fired: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new() -> Arc<StreamShared> {
        Arc::new(StreamShared {
            state: AtomicU8::new(StreamState::Stopped as u8),
            stop_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            active: AtomicBool::new(false),
            cpu_load_bits: AtomicU64::new(0),
            error: Mutex::new(None),
            finished: Mutex::new(None),
            finished_fired: AtomicBool::new(false),
        })
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub(crate) fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    pub(crate) fn clear_requests(&self) {
        self.stop_requested.store(false, Ordering::Release);
        self.abort_requested.store(false, Ordering::Release);
        self.finished_fired.store(false, Ordering::Release);
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn publish_cpu_load(&self, load: f64) {
        self.cpu_load_bits.store(load.to_bits(), Ordering::Release);
    }

    pub(crate) fn cpu_load(&self) -> f64 {
        f64::from_bits(self.cpu_load_bits.load(Ordering::Acquire))
    }

    pub(crate) fn store_error(&self, error: Error) {
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                *slot = Some(error);
            }
        }
    }

    pub(crate) fn take_error(&self) -> Option<Error> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }

    pub(crate) fn set_finished_callback(&self, callback: Option<FinishedCallback>) {
        if let Ok(mut slot) = self.finished.lock() {
            *slot = callback;
        }
    }

    /// Invoke the finished callback at most once per run.
    pub(crate) fn fire_finished(&self) {
        if self.finished_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.finished.lock() {
            if let Some(callback) = slot.as_mut() {
                callback();
            }
        }
    }
}

/// Fixed ring of slot indexes awaiting processing, oldest first.
#[derive(Debug, Default)]
struct SlotQueue {
    entries: [usize; 4],
    head: u32,
    tail: u32,
}

impl SlotQueue {
    fn push(&mut self, slot: usize) {
        self.entries[(self.head & 3) as usize] = slot;
        self.head = self.head.wrapping_add(1);
    }

    fn pop(&mut self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let slot = self.entries[(self.tail & 3) as usize];
        self.tail = self.tail.wrapping_add(1);
        Some(slot)
    }

    fn peek(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.entries[(self.tail & 3) as usize])
        }
    }

    fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail) as usize
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn clear(&mut self) {
        self.tail = self.head;
    }
}

/// Cached per-direction host layout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndpointCache {
    pub device_channels: usize,
    pub app_channels: usize,
    pub frames_per_buffer: usize,
    pub host_sample_bytes: usize,
    pub host_format: corriente_core::SampleFormat,
}

/// Everything a worker needs beyond the device and the processor.
pub(crate) struct WorkerConfig {
    pub input: Option<EndpointCache>,
    pub output: Option<EndpointCache>,
    pub flags: StreamFlags,
    pub info: StreamInfo,
    pub throttle_on_overload: bool,
}

/// The per-stream worker. Built when a stream starts, consumed by the
/// worker thread, and handed back through the join so the stream can be
/// restarted.
pub(crate) struct Worker {
    device: Box<dyn HostDevice>,
    processor: BufferProcessor,
    shared: Arc<StreamShared>,
    meter: CpuLoadMeasurer,
    config: WorkerConfig,

    epoch: Instant,
    wait_timeout: Duration,
    timeout_limit: Duration,
    accumulated_timeout: Duration,

    capture_queue: SlotQueue,
    render_queue: SlotQueue,
    /// Render buffers the driver still owes back.
    submits_outstanding: usize,
    /// False until the first render submit of the run; double-empty
    /// render slots before that are initial priming, not underflow.
    render_primed: bool,
    output_slip_pending: bool,
    underover: CallbackFlags,
    verdict: CallbackResult,
    throttled: bool,
}

impl Worker {
    pub(crate) fn new(
        device: Box<dyn HostDevice>,
        processor: BufferProcessor,
        shared: Arc<StreamShared>,
        config: WorkerConfig,
    ) -> Worker {
        let sample_rate = config.info.sample_rate;
        let buffer_frames = config
            .input
            .iter()
            .chain(config.output.iter())
            .map(|endpoint| endpoint.frames_per_buffer)
            .max()
            .unwrap_or(0);
        // Total double-buffer duration; both slots of the longer direction.
        let total_buffer = Duration::from_secs_f64(
            (SLOTS_PER_DIRECTION * buffer_frames.max(1)) as f64 / sample_rate,
        );
        let wait_timeout = (total_buffer / 2).max(Duration::from_millis(1));
        let timeout_limit =
            Duration::from_secs_f64(total_buffer.as_secs_f64() * 1.5).max(Duration::from_secs(1));

        Worker {
            device,
            processor,
            meter: CpuLoadMeasurer::new(sample_rate),
            shared,
            config,
            epoch: Instant::now(),
            wait_timeout,
            timeout_limit,
            accumulated_timeout: Duration::ZERO,
            capture_queue: SlotQueue::default(),
            render_queue: SlotQueue::default(),
            submits_outstanding: 0,
            render_primed: false,
            output_slip_pending: false,
            underover: CallbackFlags::empty(),
            verdict: CallbackResult::Continue,
            throttled: false,
        }
    }

    /// The full lifetime of one `Start` -> terminal-state run.
    pub(crate) fn run(&mut self) {
        let outcome = self.run_inner();

        if let Err(error) = outcome {
            tracing::warn!(error = %error, "stream worker failed");
            if let Some(info) = self.device.take_host_error() {
                crate::record_host_error(info);
            }
            self.shared.set_state(StreamState::Aborting);
            self.shared.store_error(error);
            let _ = self.device.stop();
        }

        self.device.set_worker_priority(ThreadPriority::Normal);
        self.shared.set_active(false);
        self.shared.set_state(StreamState::Finished);

        // The finished hook fires from here only when the stream wound
        // down of its own accord; externally driven stop/abort invoke it
        // after the join instead.
        if !self.shared.stop_requested() && !self.shared.abort_requested() {
            self.shared.fire_finished();
        }
        tracing::debug!("stream worker exited");
    }

    /// Reset per-run state; called by the stream before spawning the
    /// worker thread.
    pub(crate) fn prepare_run(&mut self) {
        self.processor.reset();
        self.meter.reset();
        self.shared.publish_cpu_load(0.0);
        self.epoch = Instant::now();
        self.accumulated_timeout = Duration::ZERO;
        self.capture_queue.clear();
        self.render_queue.clear();
        self.submits_outstanding = 0;
        self.render_primed = false;
        self.output_slip_pending = false;
        self.underover = CallbackFlags::empty();
        self.verdict = CallbackResult::Continue;
        self.throttled = false;
    }

    fn run_inner(&mut self) -> Result<()> {
        self.shared.set_state(StreamState::Starting);
        self.device.set_worker_priority(ThreadPriority::TimeCritical);

        if self.config.output.is_some() {
            if self
                .config
                .flags
                .contains(StreamFlags::PRIME_OUTPUT_BUFFERS_USING_STREAM_CALLBACK)
            {
                self.prime_output()?;
            } else {
                self.zero_render_slots();
            }
        }

        self.device.start()?;
        self.shared.set_state(StreamState::Running);
        tracing::debug!(backend = self.device.name(), "stream running");

        loop {
            if self.shared.abort_requested() || self.verdict == CallbackResult::Abort {
                self.shared.set_state(StreamState::Aborting);
                self.device.stop()?;
                return Ok(());
            }

            let status = self.device.wait(self.wait_timeout)?;

            if status.is_timeout() {
                self.accumulated_timeout += self.wait_timeout;
                if self.accumulated_timeout >= self.timeout_limit {
                    return Err(Error::TimedOut);
                }
                if self.shared.stop_requested() && self.drained() {
                    break;
                }
                continue;
            }
            self.accumulated_timeout = Duration::ZERO;

            self.enqueue_signals(status)?;
            self.do_processing()?;

            if self.shared.stop_requested() && self.verdict == CallbackResult::Continue {
                // Stop, but let already-queued output play out.
                self.verdict = CallbackResult::Complete;
            }

            if self.verdict == CallbackResult::Complete {
                self.shared.set_state(StreamState::StopPending);
                if self.config.output.is_none() || self.drained() {
                    break;
                }
            }

            self.throttle_check();
        }

        self.device.stop()?;
        Ok(())
    }

    /// Whether every submitted render buffer has come back.
    fn drained(&self) -> bool {
        self.submits_outstanding == 0
    }

    fn time_info(&self) -> TimeInfo {
        let now = self.epoch.elapsed().as_secs_f64();
        let output_dac = now + self.config.info.output_latency;
        let input_adc = match (&self.config.input, &self.config.output) {
            (Some(_), Some(_)) => {
                output_dac - (self.config.info.input_latency + self.config.info.output_latency)
            }
            (Some(_), None) => now - self.config.info.input_latency,
            _ => 0.0,
        };
        TimeInfo {
            input_buffer_adc_time: input_adc,
            current_time: now,
            output_buffer_dac_time: output_dac,
        }
    }

    /// Fill the initial render slots by invoking the callback with the
    /// priming flag and no input, then queue them, all before the pins
    /// start.
    fn prime_output(&mut self) -> Result<()> {
        let output = self.config.output.expect("priming requires output");
        for slot in 0..SLOTS_PER_DIRECTION {
            self.processor.set_no_input();
            self.processor
                .begin_processing(self.time_info(), CallbackFlags::PRIMING_OUTPUT);
            self.set_output_slot(slot, output);
            let loan = self.device.loan_slots(None, Some(slot));
            let outcome = self.processor.end_processing(ProcessorIo {
                input: [None, None],
                output: [loan.render, None],
            });
            self.verdict = combine(self.verdict, outcome.result);
            self.finish_output_slot(slot, output);
            self.device.submit_render_slot(slot)?;
            self.submits_outstanding += 1;
            self.render_primed = true;
        }
        tracing::debug!("output primed via callback");
        Ok(())
    }

    /// Silence the initial render slots in the wire format.
    fn zero_render_slots(&mut self) {
        let Some(output) = self.config.output else {
            return;
        };
        for slot in 0..SLOTS_PER_DIRECTION {
            if let Some(bytes) = self.device.loan_slots(None, Some(slot)).render {
                write_silence(
                    output.host_format,
                    bytes,
                    1,
                    output.frames_per_buffer * output.device_channels,
                );
            }
        }
    }

    /// Queue ready slots and apply the catch-up policy.
    ///
    /// Input: if older capture slots are still queued when new ones
    /// arrive, every ready slot was ready at once — the stream fell
    /// behind. Discard all but the most recent and tell the next
    /// callback, unless the stream asked to never drop input. Output:
    /// when all render slots empty at once, the most recently generated
    /// buffer will be repeated into the surplus slots after the next
    /// callback refills the first.
    fn enqueue_signals(&mut self, status: crate::host::WaitStatus) -> Result<()> {
        if self.config.input.is_some() {
            for slot in 0..SLOTS_PER_DIRECTION {
                if status.capture_ready[slot] {
                    self.capture_queue.push(slot);
                }
            }
            let never_drop = self.config.flags.contains(StreamFlags::NEVER_DROP_INPUT)
                && self.config.output.is_some();
            if self.capture_queue.len() > 1 && !never_drop {
                self.underover |= CallbackFlags::INPUT_OVERFLOW;
                tracing::trace!("input overflow; dropping oldest capture buffers");
                while self.capture_queue.len() > 1 {
                    if let Some(old) = self.capture_queue.pop() {
                        self.device.release_capture_slot(old)?;
                    }
                }
            }
        }

        if self.config.output.is_some() {
            for slot in 0..SLOTS_PER_DIRECTION {
                if status.render_ready[slot] {
                    self.render_queue.push(slot);
                    self.submits_outstanding = self.submits_outstanding.saturating_sub(1);
                }
            }
            if self.render_queue.len() > 1 && self.render_primed {
                self.underover |= CallbackFlags::OUTPUT_UNDERFLOW;
                self.output_slip_pending = true;
                tracing::trace!("output underflow; will repeat most recent buffer");
            }
        }

        Ok(())
    }

    fn set_input_slot(&mut self, _slot: usize, input: EndpointCache) {
        self.processor.set_input_frame_count(0, input.frames_per_buffer);
        for channel in 0..input.app_channels {
            self.processor.set_input_channel(
                0,
                channel,
                ChannelDescriptor {
                    offset: channel * input.host_sample_bytes,
                    stride: input.device_channels,
                },
            );
        }
    }

    fn set_output_slot(&mut self, _slot: usize, output: EndpointCache) {
        self.processor.set_output_frame_count(0, output.frames_per_buffer);
        if output.app_channels == 1 && output.device_channels > 1 {
            // Write the single application channel into the first
            // interleaved device channel; the rest are copies made after
            // conversion.
            self.processor.set_output_channel(
                0,
                0,
                ChannelDescriptor {
                    offset: 0,
                    stride: output.device_channels,
                },
            );
        } else {
            for channel in 0..output.app_channels {
                self.processor.set_output_channel(
                    0,
                    channel,
                    ChannelDescriptor {
                        offset: channel * output.host_sample_bytes,
                        stride: output.device_channels,
                    },
                );
            }
        }
    }

    /// Post-conversion fixups on a filled render slot: mono upmix across
    /// surplus device channels.
    fn finish_output_slot(&mut self, slot: usize, output: EndpointCache) {
        if output.app_channels == 1 && output.device_channels > 1 {
            if let Some(bytes) = self.device.loan_slots(None, Some(slot)).render {
                duplicate_first_channel(
                    bytes,
                    output.host_sample_bytes,
                    output.device_channels,
                    output.frames_per_buffer,
                );
            }
        }
    }

    /// Drive the buffer processor over the queued slots.
    fn do_processing(&mut self) -> Result<()> {
        let full_duplex = self.config.input.is_some() && self.config.output.is_some();

        while self.verdict != CallbackResult::Abort
            && !(self.capture_queue.is_empty() && self.render_queue.is_empty())
        {
            // Full duplex pairs one slot of each direction so the frame
            // balance holds; a lone direction waits for its partner.
            if full_duplex && (self.capture_queue.is_empty() || self.render_queue.is_empty()) {
                break;
            }

            let capture_slot = if self.config.input.is_some() {
                self.capture_queue.peek()
            } else {
                None
            };
            let render_slot = if self.config.output.is_some() {
                self.render_queue.peek()
            } else {
                None
            };

            self.meter.begin();
            self.processor.begin_processing(self.time_info(), self.underover);
            self.underover = CallbackFlags::empty();

            if let (Some(_), Some(input)) = (capture_slot, self.config.input) {
                self.set_input_slot(0, input);
            }
            if let (Some(_), Some(output)) = (render_slot, self.config.output) {
                // Surplus device channels would otherwise carry stale
                // data from the previous lap of the ring.
                if output.app_channels < output.device_channels && output.app_channels > 1 {
                    if let Some(slot) = render_slot {
                        if let Some(bytes) = self.device.loan_slots(None, Some(slot)).render {
                            write_silence(
                                output.host_format,
                                bytes,
                                1,
                                output.frames_per_buffer * output.device_channels,
                            );
                        }
                    }
                }
                self.set_output_slot(0, output);
            }

            let loan = self.device.loan_slots(capture_slot, render_slot);
            let outcome = self.processor.end_processing(ProcessorIo {
                input: [loan.capture, None],
                output: [loan.render, None],
            });

            self.verdict = combine(self.verdict, outcome.result);
            self.meter.end(outcome.frames);
            self.shared.publish_cpu_load(self.meter.current_load());

            if let Some(slot) = capture_slot {
                self.capture_queue.pop();
                if !self.shared.stop_requested() {
                    self.device.release_capture_slot(slot)?;
                }
            }

            if let Some(slot) = render_slot {
                self.render_queue.pop();
                if self.verdict == CallbackResult::Abort {
                    continue;
                }
                if let Some(output) = self.config.output {
                    self.finish_output_slot(slot, output);
                }
                self.device.submit_render_slot(slot)?;
                self.submits_outstanding += 1;
                self.render_primed = true;

                // Output-underflow slip: the buffer the callback just
                // produced is repeated into the other starved slots; a
                // stutter, never a reordering.
                if self.output_slip_pending {
                    self.output_slip_pending = false;
                    while let Some(extra) = self.render_queue.pop() {
                        self.device.clone_render_slot(slot, extra);
                        self.device.submit_render_slot(extra)?;
                        self.submits_outstanding += 1;
                    }
                }
            }
        }

        Ok(())
    }

    /// Demote and breathe when the callback cannot keep up, so the
    /// watchdog never sees a runaway time-critical thread.
    fn throttle_check(&mut self) {
        if !self.config.throttle_on_overload {
            return;
        }
        let load = self.meter.current_load();
        if load > THROTTLE_LOAD && !self.throttled {
            self.throttled = true;
            self.device
                .set_worker_priority(ThreadPriority::TimeCritical.demoted());
            tracing::debug!(load, "worker throttled");
            std::thread::sleep(self.wait_timeout / 4);
        } else if self.throttled && load <= THROTTLE_LOAD {
            self.throttled = false;
            self.device.set_worker_priority(ThreadPriority::TimeCritical);
            tracing::debug!(load, "worker priority restored");
        }
    }
}

fn combine(a: CallbackResult, b: CallbackResult) -> CallbackResult {
    match (a, b) {
        (CallbackResult::Abort, _) | (_, CallbackResult::Abort) => CallbackResult::Abort,
        (CallbackResult::Complete, _) | (_, CallbackResult::Complete) => CallbackResult::Complete,
        _ => CallbackResult::Continue,
    }
}

/// Copy the first interleaved channel over the remaining ones, one frame
/// at a time, for any sample width.
fn duplicate_first_channel(bytes: &mut [u8], sample_bytes: usize, channels: usize, frames: usize) {
    let frame_bytes = sample_bytes * channels;
    for frame in 0..frames {
        let base = frame * frame_bytes;
        let (first, rest) = bytes[base..base + frame_bytes].split_at_mut(sample_bytes);
        for channel in 0..channels - 1 {
            rest[channel * sample_bytes..(channel + 1) * sample_bytes].copy_from_slice(first);
        }
    }
}
