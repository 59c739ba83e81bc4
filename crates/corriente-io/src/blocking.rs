//! Blocking read/write streams.
//!
//! A blocking stream has no worker thread and no user callback: the
//! application thread itself enters the buffer processor. [`read`] and
//! [`write`] wait on the device's ready signals, run the processor over
//! whichever slots are ready, and move frames through small FIFOs that
//! bridge the host block size and whatever read/write lengths the
//! application uses. The processor is configured for any-size blocks, so
//! no adaptation residues are involved.
//!
//! [`read`]: BlockingStream::read
//! [`write`]: BlockingStream::write

use crate::host::{HostDevice, SLOTS_PER_DIRECTION};
use crate::params::{CallbackResult, FinishedCallback, StreamCallback, StreamInfo, TimeInfo};
use crate::processor::{BufferProcessor, ChannelDescriptor, ProcessorConfig, ProcessorIo};
use crate::worker::EndpointCache;
use crate::{Error, Result};
use corriente_core::{SampleFormat, write_silence};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Frames of output the write side will buffer beyond the device's own
/// double buffer before `write` blocks.
const WRITE_HIGH_WATER_BUFFERS: usize = 4;

type ByteFifo = Arc<Mutex<VecDeque<u8>>>;

fn lock(fifo: &ByteFifo) -> std::sync::MutexGuard<'_, VecDeque<u8>> {
    fifo.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) struct BlockingStream {
    device: Box<dyn HostDevice>,
    processor: BufferProcessor,
    input: Option<EndpointCache>,
    output: Option<EndpointCache>,
    input_format: Option<SampleFormat>,
    output_format: Option<SampleFormat>,
    input_fifo: Option<ByteFifo>,
    output_fifo: Option<ByteFifo>,
    /// Render slots reported ready but not yet filled.
    render_ready: [bool; SLOTS_PER_DIRECTION],
    finished: Option<FinishedCallback>,
    started: bool,
    info: StreamInfo,
    epoch: Instant,
    wait_timeout: Duration,
}

impl BlockingStream {
    pub(crate) fn open(
        device: Box<dyn HostDevice>,
        mut config: ProcessorConfig,
        input: Option<EndpointCache>,
        output: Option<EndpointCache>,
    ) -> Result<BlockingStream> {
        // The internal callback accepts any block size; adaptation
        // residues never arise on the blocking path.
        config.frames_per_app_buffer = 0;

        let input_format = config.input.map(|direction| direction.app_format);
        let output_format = config.output.map(|direction| direction.app_format);
        let input_fifo = config.input.map(|_| Arc::new(Mutex::new(VecDeque::new())));
        let output_fifo = config.output.map(|_| Arc::new(Mutex::new(VecDeque::new())));

        let callback = pump_callback(
            input_fifo.clone(),
            output_fifo.clone(),
            output_format,
        );
        let processor = BufferProcessor::new(config, callback)?;

        let sample_rate = config.sample_rate;
        let info = StreamInfo {
            input_latency: input.map_or(0.0, |cache| cache.frames_per_buffer as f64 / sample_rate),
            output_latency: output.map_or(0.0, |cache| cache.frames_per_buffer as f64 / sample_rate),
            sample_rate,
        };
        let buffer_frames = input
            .iter()
            .chain(output.iter())
            .map(|cache| cache.frames_per_buffer)
            .max()
            .unwrap_or(0);
        let wait_timeout = Duration::from_secs_f64(
            (SLOTS_PER_DIRECTION * buffer_frames.max(1)) as f64 / sample_rate / 2.0,
        )
        .max(Duration::from_millis(1));

        Ok(BlockingStream {
            device,
            processor,
            input,
            output,
            input_format,
            output_format,
            input_fifo,
            output_fifo,
            render_ready: [false; SLOTS_PER_DIRECTION],
            finished: None,
            started: false,
            info,
            epoch: Instant::now(),
            wait_timeout,
        })
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn info(&self) -> StreamInfo {
        self.info
    }

    pub(crate) fn time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub(crate) fn input_channels(&self) -> Option<usize> {
        self.input.map(|cache| cache.app_channels)
    }

    pub(crate) fn output_channels(&self) -> Option<usize> {
        self.output.map(|cache| cache.app_channels)
    }

    pub(crate) fn set_finished_callback(&mut self, callback: Option<FinishedCallback>) -> Result<()> {
        if self.started {
            return Err(Error::StreamIsNotStopped);
        }
        self.finished = callback;
        Ok(())
    }

    pub(crate) fn check_app_format(&self, input_side: bool, format: SampleFormat) -> Result<()> {
        let expected = if input_side {
            self.input_format
        } else {
            self.output_format
        };
        if expected == Some(format) {
            Ok(())
        } else {
            Err(Error::SampleFormatNotSupported)
        }
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::StreamIsNotStopped);
        }
        self.processor.reset();
        self.render_ready = [false; SLOTS_PER_DIRECTION];
        if let Some(fifo) = &self.input_fifo {
            lock(fifo).clear();
        }
        if let Some(output) = self.output {
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
        self.device.start()?;
        self.started = true;
        tracing::debug!("blocking stream started");
        Ok(())
    }

    pub(crate) fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Err(Error::StreamIsStopped);
        }
        // Cooperative: flush whatever output is already queued.
        let deadline = Instant::now() + self.shutdown_budget();
        while self
            .output_fifo
            .as_ref()
            .is_some_and(|fifo| !lock(fifo).is_empty())
        {
            if Instant::now() >= deadline {
                break;
            }
            if let Some(slot) = self.take_ready_render_slot() {
                self.process_render(slot)?;
            } else if self.pump(deadline).is_err() {
                // Out of drain budget; stop with whatever is left queued.
                break;
            }
        }
        self.device.stop()?;
        self.started = false;
        if let Some(callback) = self.finished.as_mut() {
            callback();
        }
        tracing::debug!("blocking stream stopped");
        Ok(())
    }

    pub(crate) fn abort(&mut self) -> Result<()> {
        if self.started {
            self.device.stop()?;
            self.started = false;
            if let Some(callback) = self.finished.as_mut() {
                callback();
            }
        }
        if let Some(fifo) = &self.output_fifo {
            lock(fifo).clear();
        }
        if let Some(fifo) = &self.input_fifo {
            lock(fifo).clear();
        }
        Ok(())
    }

    pub(crate) fn read(&mut self, buffer: &mut [u8], frames: usize) -> Result<()> {
        let Some(input) = self.input else {
            return Err(Error::CanNotReadFromAnOutputOnlyStream);
        };
        if !self.started {
            return Err(Error::StreamIsStopped);
        }
        let format = self.input_format.ok_or(Error::InternalError)?;
        let frame_bytes = input.app_channels * format.bytes_per_sample();
        let needed = frames * frame_bytes;
        if buffer.len() < needed {
            return Err(Error::BufferTooSmall);
        }

        let deadline = Instant::now() + self.io_budget(frames);
        let mut filled = 0;
        while filled < needed {
            if let Some(fifo) = &self.input_fifo {
                let mut fifo = lock(fifo);
                while filled < needed {
                    match fifo.pop_front() {
                        Some(byte) => {
                            buffer[filled] = byte;
                            filled += 1;
                        }
                        None => break,
                    }
                }
            }
            if filled >= needed {
                break;
            }
            self.pump(deadline)?;
        }
        Ok(())
    }

    pub(crate) fn write(&mut self, buffer: &[u8], frames: usize) -> Result<()> {
        let Some(output) = self.output else {
            return Err(Error::CanNotWriteToAnInputOnlyStream);
        };
        if !self.started {
            return Err(Error::StreamIsStopped);
        }
        let format = self.output_format.ok_or(Error::InternalError)?;
        let frame_bytes = output.app_channels * format.bytes_per_sample();
        let needed = frames * frame_bytes;
        if buffer.len() < needed {
            return Err(Error::BufferTooSmall);
        }

        if let Some(fifo) = &self.output_fifo {
            lock(fifo).extend(buffer[..needed].iter().copied());
        }

        // Block until everything queued has moved to the device; a tail
        // shorter than one host buffer stays queued for the next write.
        let host_buffer_bytes = output.frames_per_buffer * frame_bytes;
        let deadline = Instant::now() + self.io_budget(frames);
        loop {
            let backlog = self
                .output_fifo
                .as_ref()
                .map_or(0, |fifo| lock(fifo).len());
            if backlog < host_buffer_bytes.max(1) {
                break;
            }
            if let Some(slot) = self.take_ready_render_slot() {
                self.process_render(slot)?;
            } else {
                self.pump(deadline)?;
            }
        }
        Ok(())
    }

    pub(crate) fn read_available(&mut self) -> Result<usize> {
        let Some(input) = self.input else {
            return Err(Error::CanNotReadFromAnOutputOnlyStream);
        };
        let format = self.input_format.ok_or(Error::InternalError)?;
        let frame_bytes = input.app_channels * format.bytes_per_sample();
        Ok(self
            .input_fifo
            .as_ref()
            .map_or(0, |fifo| lock(fifo).len() / frame_bytes))
    }

    pub(crate) fn write_available(&mut self) -> Result<usize> {
        let Some(output) = self.output else {
            return Err(Error::CanNotWriteToAnInputOnlyStream);
        };
        let format = self.output_format.ok_or(Error::InternalError)?;
        let frame_bytes = output.app_channels * format.bytes_per_sample();
        let high_water = output.frames_per_buffer * WRITE_HIGH_WATER_BUFFERS * frame_bytes;
        let backlog = self.output_fifo.as_ref().map_or(0, |fifo| lock(fifo).len());
        Ok(high_water.saturating_sub(backlog) / frame_bytes)
    }

    /// One wait on the device, servicing whatever became ready. Errors
    /// with `TimedOut` past the deadline.
    fn pump(&mut self, deadline: Instant) -> Result<bool> {
        let status = self.device.wait(self.wait_timeout)?;
        if status.is_timeout() {
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
            return Ok(false);
        }
        let mut serviced = false;
        for slot in 0..SLOTS_PER_DIRECTION {
            if status.capture_ready[slot] && self.input.is_some() {
                self.process_capture(slot)?;
                serviced = true;
            }
            if status.render_ready[slot] && self.output.is_some() {
                self.render_ready[slot] = true;
                serviced = true;
            }
        }
        // Keep the output side fed opportunistically, also during reads
        // on a full-duplex stream.
        while let Some(slot) = self.take_ready_render_slot() {
            let frame_bytes = self.output.map_or(0, |output| {
                output.app_channels
                    * self
                        .output_format
                        .map_or(1, SampleFormat::bytes_per_sample)
            });
            let host_buffer_bytes =
                self.output.map_or(0, |output| output.frames_per_buffer) * frame_bytes;
            let backlog = self.output_fifo.as_ref().map_or(0, |fifo| lock(fifo).len());
            if backlog >= host_buffer_bytes && host_buffer_bytes > 0 {
                self.process_render(slot)?;
            } else {
                self.render_ready[slot] = true;
                break;
            }
        }
        Ok(serviced)
    }

    fn take_ready_render_slot(&mut self) -> Option<usize> {
        for slot in 0..SLOTS_PER_DIRECTION {
            if self.render_ready[slot] {
                self.render_ready[slot] = false;
                return Some(slot);
            }
        }
        None
    }

    fn process_capture(&mut self, slot: usize) -> Result<()> {
        let input = self.input.ok_or(Error::InternalError)?;
        self.processor
            .begin_processing(self.time_info(), crate::params::CallbackFlags::empty());
        self.processor
            .set_input_frame_count(0, input.frames_per_buffer);
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
        let loan = self.device.loan_slots(Some(slot), None);
        self.processor.end_processing(ProcessorIo {
            input: [loan.capture, None],
            output: [None, None],
        });
        self.device.release_capture_slot(slot)?;
        Ok(())
    }

    fn process_render(&mut self, slot: usize) -> Result<()> {
        let output = self.output.ok_or(Error::InternalError)?;
        self.processor
            .begin_processing(self.time_info(), crate::params::CallbackFlags::empty());
        self.processor
            .set_output_frame_count(0, output.frames_per_buffer);
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
        let loan = self.device.loan_slots(None, Some(slot));
        self.processor.end_processing(ProcessorIo {
            input: [None, None],
            output: [loan.render, None],
        });
        self.device.submit_render_slot(slot)?;
        Ok(())
    }

    fn time_info(&self) -> TimeInfo {
        let now = self.time();
        let output_dac = now + self.info.output_latency;
        let input_adc = match (&self.input, &self.output) {
            (Some(_), Some(_)) => output_dac - (self.info.input_latency + self.info.output_latency),
            (Some(_), None) => now - self.info.input_latency,
            _ => 0.0,
        };
        TimeInfo {
            input_buffer_adc_time: input_adc,
            current_time: now,
            output_buffer_dac_time: output_dac,
        }
    }

    fn io_budget(&self, frames: usize) -> Duration {
        let audio = Duration::from_secs_f64(frames as f64 / self.info.sample_rate);
        (audio * 8).max(Duration::from_secs(1))
    }

    fn shutdown_budget(&self) -> Duration {
        Duration::from_secs(1)
    }
}

/// The internal callback that moves frames between the processor's
/// scratch and the FIFOs. Runs on the application thread, inside
/// read/write.
fn pump_callback(
    input_fifo: Option<ByteFifo>,
    output_fifo: Option<ByteFifo>,
    output_format: Option<SampleFormat>,
) -> StreamCallback {
    Box::new(move |mut args| {
        if let (Some(fifo), Some(input)) = (&input_fifo, args.input.as_ref()) {
            lock(fifo).extend(input.bytes().iter().copied());
        }
        if let (Some(fifo), Some(output)) = (&output_fifo, args.output.as_mut()) {
            let format = output_format.unwrap_or(SampleFormat::Float32);
            let sample_bytes = format.bytes_per_sample();
            let mut fifo = lock(fifo);
            let bytes = output.bytes_mut();
            // Only whole samples leave the FIFO; a short tail becomes
            // silence rather than a torn sample.
            let take = (fifo.len() / sample_bytes).min(bytes.len() / sample_bytes) * sample_bytes;
            for byte in bytes.iter_mut().take(take) {
                *byte = fifo.pop_front().unwrap_or(0);
            }
            if take < bytes.len() {
                let remaining_samples = (bytes.len() - take) / sample_bytes;
                write_silence(format, &mut bytes[take..], 1, remaining_samples);
            }
        }
        CallbackResult::Continue
    })
}
