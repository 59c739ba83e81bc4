//! cpal-backed host device (feature `cpal-backend`).
//!
//! Presents a system audio device pair through the engine's two-slot
//! protocol. cpal delivers audio through its own callbacks in f32; this
//! adapter bridges them to slot readiness with byte rings sized to two
//! host buffers per direction, so the engine sees the same double-buffer
//! shape a ring-buffered driver would give it. The adapter contains no
//! engine logic: no format conversion (the wire format is declared f32),
//! no block adaptation, no callback dispatch.
//!
//! cpal streams are not guaranteed to be movable across threads, so a
//! small owner thread builds and holds them between start and stop.

use crate::host::{
    DeviceConfig, EndpointConfig, HostDevice, HostWaker, SLOTS_PER_DIRECTION, SlotLoan, WaitStatus,
};
use crate::processor::HostBufferSizeMode;
use crate::sync::SignalSet;
use crate::{Error, HostErrorInfo, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use corriente_core::{SampleFormat, WireFormat};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const RING_SIGNAL: u32 = 0;
const WAKE_SIGNAL: u32 = 4;

/// Configuration for [`CpalDevice::new`].
#[derive(Debug, Clone, Default)]
pub struct CpalDeviceConfig {
    /// Sample rate to run both directions at.
    pub sample_rate: u32,
    /// Frames per engine-visible host buffer (one slot).
    pub frames_per_buffer: usize,
    /// Capture channels; `None` for an output-only device.
    pub input_channels: Option<u16>,
    /// Playback channels; `None` for an input-only device.
    pub output_channels: Option<u16>,
    /// Case-insensitive substring match on the capture device name;
    /// `None` uses the system default.
    pub input_device_name: Option<String>,
    /// Case-insensitive substring match on the playback device name.
    pub output_device_name: Option<String>,
}

struct Shared {
    signals: SignalSet,
    capture_ring: Mutex<VecDeque<u8>>,
    render_ring: Mutex<VecDeque<u8>>,
    error: Mutex<Option<HostErrorInfo>>,
}

impl Shared {
    fn record_error(&self, text: String) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(HostErrorInfo { code: -1, text });
        }
        self.signals.signal(WAKE_SIGNAL);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

enum OwnerCommand {
    Stop,
}

/// A system audio device pair behind the [`HostDevice`] seam.
pub struct CpalDevice {
    shared: Arc<Shared>,
    config: CpalDeviceConfig,

    capture_slots: [Vec<u8>; SLOTS_PER_DIRECTION],
    render_slots: [Vec<u8>; SLOTS_PER_DIRECTION],
    capture_filled: [bool; SLOTS_PER_DIRECTION],
    render_armed: [bool; SLOTS_PER_DIRECTION],
    capture_next: usize,

    owner: Option<(mpsc::Sender<OwnerCommand>, std::thread::JoinHandle<()>)>,
}

impl CpalDevice {
    /// Resolve the system devices and size the rings. No streams are
    /// opened until [`start`](HostDevice::start).
    pub fn new(config: CpalDeviceConfig) -> Result<CpalDevice> {
        if config.input_channels.is_none() && config.output_channels.is_none() {
            return Err(Error::BadIoDeviceCombination);
        }
        if config.frames_per_buffer == 0 || config.sample_rate == 0 {
            return Err(Error::BufferTooSmall);
        }
        // Fail early when the requested devices are absent.
        let host = cpal::default_host();
        if config.input_channels.is_some() {
            find_device(&host, config.input_device_name.as_deref(), true)?;
        }
        if config.output_channels.is_some() {
            find_device(&host, config.output_device_name.as_deref(), false)?;
        }

        let capture_bytes = config.input_channels.map_or(0, |channels| {
            config.frames_per_buffer * channels as usize * 4
        });
        let render_bytes = config.output_channels.map_or(0, |channels| {
            config.frames_per_buffer * channels as usize * 4
        });

        Ok(CpalDevice {
            shared: Arc::new(Shared {
                signals: SignalSet::new(),
                capture_ring: Mutex::new(VecDeque::new()),
                render_ring: Mutex::new(VecDeque::new()),
                error: Mutex::new(None),
            }),
            config,
            capture_slots: [vec![0u8; capture_bytes], vec![0u8; capture_bytes]],
            render_slots: [vec![0u8; render_bytes], vec![0u8; render_bytes]],
            capture_filled: [false; SLOTS_PER_DIRECTION],
            render_armed: [false; SLOTS_PER_DIRECTION],
            capture_next: 0,
            owner: None,
        })
    }

    fn slot_bytes(&self, capture: bool) -> usize {
        if capture {
            self.capture_slots[0].len()
        } else {
            self.render_slots[0].len()
        }
    }

    fn ring_capacity(&self, capture: bool) -> usize {
        self.slot_bytes(capture) * SLOTS_PER_DIRECTION
    }
}

fn pick_device(
    devices: impl Iterator<Item = cpal::Device>,
    search: &str,
) -> Option<cpal::Device> {
    let search = search.to_lowercase();
    devices.into_iter().find(|device| {
        device
            .name()
            .map(|name| name.to_lowercase().contains(&search))
            .unwrap_or(false)
    })
}

fn find_device(host: &cpal::Host, name: Option<&str>, input: bool) -> Result<cpal::Device> {
    match (name, input) {
        (Some(search), true) => {
            pick_device(host.input_devices().map_err(|_| Error::DeviceUnavailable)?, search)
                .ok_or(Error::InvalidDevice)
        }
        (Some(search), false) => {
            pick_device(host.output_devices().map_err(|_| Error::DeviceUnavailable)?, search)
                .ok_or(Error::InvalidDevice)
        }
        (None, true) => host.default_input_device().ok_or(Error::DeviceUnavailable),
        (None, false) => host.default_output_device().ok_or(Error::DeviceUnavailable),
    }
}

/// Build both cpal streams on the owner thread and park until stopped.
fn owner_thread(
    shared: Arc<Shared>,
    config: CpalDeviceConfig,
    capture_capacity: usize,
    render_capacity: usize,
    ready: mpsc::Sender<Result<()>>,
    commands: mpsc::Receiver<OwnerCommand>,
) {
    let host = cpal::default_host();
    let mut streams: Vec<cpal::Stream> = Vec::new();

    let build = (|| -> Result<()> {
        if let Some(channels) = config.input_channels {
            let device = find_device(&host, config.input_device_name.as_deref(), true)?;
            let stream_config = cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(config.frames_per_buffer as u32),
            };
            let data_shared = Arc::clone(&shared);
            let error_shared = Arc::clone(&shared);
            let stream = device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let bytes: &[u8] = bytemuck::cast_slice(data);
                        let mut ring = lock(&data_shared.capture_ring);
                        // Ring full means the engine fell behind; drop the
                        // oldest audio, keep the freshest.
                        let overshoot =
                            (ring.len() + bytes.len()).saturating_sub(capture_capacity);
                        ring.drain(..overshoot.min(ring.len()));
                        ring.extend(bytes.iter().copied());
                        drop(ring);
                        data_shared.signals.signal(RING_SIGNAL);
                    },
                    move |err| error_shared.record_error(err.to_string()),
                    None,
                )
                .map_err(|_| Error::DeviceUnavailable)?;
            stream.play().map_err(|_| Error::DeviceUnavailable)?;
            streams.push(stream);
        }

        if let Some(channels) = config.output_channels {
            let device = find_device(&host, config.output_device_name.as_deref(), false)?;
            let stream_config = cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(config.frames_per_buffer as u32),
            };
            let data_shared = Arc::clone(&shared);
            let error_shared = Arc::clone(&shared);
            let stream = device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let bytes: &mut [u8] = bytemuck::cast_slice_mut(data);
                        let mut ring = lock(&data_shared.render_ring);
                        for byte in bytes.iter_mut() {
                            *byte = ring.pop_front().unwrap_or(0);
                        }
                        let has_space =
                            render_capacity.saturating_sub(ring.len()) >= render_capacity / 2;
                        drop(ring);
                        if has_space {
                            data_shared.signals.signal(RING_SIGNAL);
                        }
                    },
                    move |err| error_shared.record_error(err.to_string()),
                    None,
                )
                .map_err(|_| Error::DeviceUnavailable)?;
            stream.play().map_err(|_| Error::DeviceUnavailable)?;
            streams.push(stream);
        }
        Ok(())
    })();

    let failed = build.is_err();
    let _ = ready.send(build);
    if failed {
        return;
    }

    // Park until stop; the streams live on this thread.
    let _ = commands.recv();
    drop(streams);
}

impl HostDevice for CpalDevice {
    fn name(&self) -> &str {
        "cpal"
    }

    fn config(&self) -> DeviceConfig {
        let endpoint = |channels: Option<u16>| {
            channels.map(|channels| EndpointConfig {
                channels: channels as usize,
                wire_format: WireFormat::native(SampleFormat::Float32),
                frames_per_buffer: self.config.frames_per_buffer,
                latency: self.config.frames_per_buffer as f64 / f64::from(self.config.sample_rate),
            })
        };
        DeviceConfig {
            sample_rate: f64::from(self.config.sample_rate),
            input: endpoint(self.config.input_channels),
            output: endpoint(self.config.output_channels),
            buffer_size_mode: HostBufferSizeMode::Fixed,
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.owner.is_some() {
            return Err(Error::StreamIsNotStopped);
        }
        lock(&self.shared.capture_ring).clear();
        // Whatever was submitted before start (priming) stays queued in
        // the render ring and plays first.
        self.capture_filled = [false; SLOTS_PER_DIRECTION];
        self.capture_next = 0;

        let (ready_tx, ready_rx) = mpsc::channel();
        let (command_tx, command_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let capture_capacity = self.ring_capacity(true);
        let render_capacity = self.ring_capacity(false);
        let handle = std::thread::Builder::new()
            .name("corriente-cpal".into())
            .spawn(move || {
                owner_thread(
                    shared,
                    config,
                    capture_capacity,
                    render_capacity,
                    ready_tx,
                    command_rx,
                )
            })
            .map_err(|_| Error::InsufficientMemory)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.owner = Some((command_tx, handle));
                // The render side starts empty: both slots are writable.
                if self.config.output_channels.is_some() {
                    self.shared.signals.signal(RING_SIGNAL);
                }
                tracing::info!("cpal device started");
                Ok(())
            }
            Ok(Err(error)) => {
                let _ = handle.join();
                Err(error)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::UnanticipatedHostError(HostErrorInfo {
                    code: -1,
                    text: "cpal owner thread died during start".into(),
                }))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let Some((commands, handle)) = self.owner.take() {
            let _ = commands.send(OwnerCommand::Stop);
            let _ = handle.join();
            tracing::info!("cpal device stopped");
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus> {
        let fired = self.shared.signals.wait_any(timeout);
        let woke = fired & (1 << WAKE_SIGNAL) != 0;
        let mut status = WaitStatus {
            woke,
            ..WaitStatus::default()
        };

        if self.config.input_channels.is_some() {
            let slot_bytes = self.slot_bytes(true);
            let mut ring = lock(&self.shared.capture_ring);
            for _ in 0..SLOTS_PER_DIRECTION {
                let slot = self.capture_next;
                if self.capture_filled[slot] || ring.len() < slot_bytes {
                    break;
                }
                for byte in self.capture_slots[slot].iter_mut() {
                    *byte = ring.pop_front().unwrap_or(0);
                }
                self.capture_filled[slot] = true;
                status.capture_ready[slot] = true;
                self.capture_next = (slot + 1) % SLOTS_PER_DIRECTION;
            }
        }

        if self.config.output_channels.is_some() {
            let slot_bytes = self.slot_bytes(false);
            let ring_len = lock(&self.shared.render_ring).len();
            let capacity = self.ring_capacity(false);
            let armed = self.render_armed.iter().filter(|&&armed| armed).count();
            let mut armable = (capacity.saturating_sub(ring_len) / slot_bytes.max(1))
                .saturating_sub(armed);
            for slot in 0..SLOTS_PER_DIRECTION {
                if armable == 0 {
                    break;
                }
                if !self.render_armed[slot] {
                    self.render_armed[slot] = true;
                    status.render_ready[slot] = true;
                    armable -= 1;
                }
            }
        }

        Ok(status)
    }

    fn waker(&self) -> HostWaker {
        let shared = Arc::clone(&self.shared);
        HostWaker::new(move || shared.signals.signal(WAKE_SIGNAL))
    }

    fn loan_slots(
        &mut self,
        capture_slot: Option<usize>,
        render_slot: Option<usize>,
    ) -> SlotLoan<'_> {
        let capture = capture_slot.map(|slot| &mut self.capture_slots[slot][..]);
        let render = render_slot.map(|slot| &mut self.render_slots[slot][..]);
        SlotLoan { capture, render }
    }

    fn release_capture_slot(&mut self, slot: usize) -> Result<()> {
        self.capture_filled[slot] = false;
        Ok(())
    }

    fn submit_render_slot(&mut self, slot: usize) -> Result<()> {
        let mut ring = lock(&self.shared.render_ring);
        ring.extend(self.render_slots[slot].iter().copied());
        drop(ring);
        self.render_armed[slot] = false;
        Ok(())
    }

    fn clone_render_slot(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        let (source, dest) = if from < to {
            let (head, tail) = self.render_slots.split_at_mut(to);
            (&head[from], &mut tail[0])
        } else {
            let (head, tail) = self.render_slots.split_at_mut(from);
            (&tail[0], &mut head[to])
        };
        dest.copy_from_slice(source);
    }

    fn take_host_error(&mut self) -> Option<HostErrorInfo> {
        lock(&self.shared.error).take()
    }
}
