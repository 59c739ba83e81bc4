//! A deterministic in-memory host device.
//!
//! The mock presents the same two-slot double-buffer protocol a real
//! ring-buffered driver would, but readiness is driven by the test (or by
//! the device's own auto-advance mode) instead of hardware. Tests hold a
//! [`MockController`] onto the same shared state as the device the stream
//! owns, inject capture data, meter submitted output, and observe pin
//! state transitions.
//!
//! Slot bytes live in the device itself and are loaned straight to the
//! engine; only readiness signaling, the capture source and the output
//! tap go through the shared state. In auto-advance mode the device
//! re-arms a slot as soon as the engine hands it back, so a worker runs
//! flat out until the configured buffer budget is spent — a whole stream
//! lifetime compressed into milliseconds, with every buffer accounted
//! for.

use crate::Result;
use crate::host::{
    DeviceConfig, EndpointConfig, HostDevice, HostWaker, SLOTS_PER_DIRECTION, SlotLoan,
    ThreadPriority, WaitStatus,
};
use crate::sync::SignalSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const CAPTURE_SIGNAL_BASE: u32 = 0;
const RENDER_SIGNAL_BASE: u32 = 2;
const WAKE_SIGNAL: u32 = 4;

/// One direction of a [`MockDevice`].
#[derive(Debug, Clone, Copy)]
pub struct MockEndpoint {
    /// Device channel count.
    pub channels: usize,
    /// Wire layout of the device buffers.
    pub wire_format: corriente_core::WireFormat,
    /// Frames per slot.
    pub frames_per_buffer: usize,
    /// Reported hardware latency in seconds.
    pub latency: f64,
}

impl MockEndpoint {
    /// An endpoint with a native wire format and no reported latency.
    #[must_use]
    pub fn new(
        channels: usize,
        format: corriente_core::SampleFormat,
        frames_per_buffer: usize,
    ) -> MockEndpoint {
        MockEndpoint {
            channels,
            wire_format: corriente_core::WireFormat::native(format),
            frames_per_buffer,
            latency: 0.0,
        }
    }

    fn bytes_per_buffer(&self) -> usize {
        self.frames_per_buffer * self.channels * self.wire_format.format.bytes_per_sample()
    }

    fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            channels: self.channels,
            wire_format: self.wire_format,
            frames_per_buffer: self.frames_per_buffer,
            latency: self.latency,
        }
    }
}

/// Configuration for [`MockDevice::new`].
#[derive(Debug, Clone, Copy)]
pub struct MockDeviceConfig {
    /// Device sample rate.
    pub sample_rate: f64,
    /// Capture side.
    pub input: Option<MockEndpoint>,
    /// Playback side.
    pub output: Option<MockEndpoint>,
    /// Buffer-size behavior reported to the engine.
    pub buffer_size_mode: crate::processor::HostBufferSizeMode,
    /// Re-arm slots as soon as the engine returns them.
    pub auto_advance: bool,
    /// In auto-advance mode, total buffers per direction before the
    /// device goes quiet. `None` is unlimited.
    pub buffer_budget: Option<usize>,
}

impl MockDeviceConfig {
    /// A config with no endpoints, fixed-size buffers, auto-advance off.
    #[must_use]
    pub fn new(sample_rate: f64) -> MockDeviceConfig {
        MockDeviceConfig {
            sample_rate,
            input: None,
            output: None,
            buffer_size_mode: crate::processor::HostBufferSizeMode::Fixed,
            auto_advance: false,
            buffer_budget: None,
        }
    }
}

type CaptureSource = Box<dyn FnMut(&mut [u8]) + Send>;

struct MockShared {
    signals: SignalSet,
    state: Mutex<SharedState>,
}

struct SharedState {
    capture_source: Option<CaptureSource>,
    capture_pending_fill: [bool; SLOTS_PER_DIRECTION],
    capture_delivered: usize,
    capture_released: usize,
    capture_budget: Option<usize>,
    render_collected: Vec<u8>,
    render_submitted: usize,
    render_submitted_at_start: usize,
    render_armed: usize,
    render_budget: Option<usize>,
    auto_advance: bool,
    started: bool,
    start_count: usize,
    stop_count: usize,
    priorities: Vec<ThreadPriority>,
}

impl MockShared {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Mark a capture slot as due for a source refill and signal it.
    fn arm_capture(&self, state: &mut SharedState, slot: usize) {
        if state.capture_source.is_none() {
            return;
        }
        if let Some(budget) = state.capture_budget {
            if state.capture_delivered >= budget {
                return;
            }
        }
        state.capture_delivered += 1;
        state.capture_pending_fill[slot] = true;
        self.signals.signal(CAPTURE_SIGNAL_BASE + slot as u32);
    }

    fn arm_render(&self, state: &mut SharedState, slot: usize) {
        if let Some(budget) = state.render_budget {
            if state.render_armed >= budget {
                return;
            }
        }
        state.render_armed += 1;
        self.signals.signal(RENDER_SIGNAL_BASE + slot as u32);
    }
}

/// A ramp byte pattern; distinct enough that dropped or duplicated
/// buffers show up in assertions.
fn default_capture_source() -> CaptureSource {
    let mut counter = 0u8;
    Box::new(move |buffer: &mut [u8]| {
        for byte in buffer.iter_mut() {
            *byte = counter;
            counter = counter.wrapping_add(1);
        }
    })
}

/// The deterministic in-memory host device. See the module docs.
pub struct MockDevice {
    shared: Arc<MockShared>,
    config: MockDeviceConfig,
    capture_slots: [Vec<u8>; SLOTS_PER_DIRECTION],
    render_slots: [Vec<u8>; SLOTS_PER_DIRECTION],
}

impl MockDevice {
    /// Build a device and the controller that scripts it.
    #[must_use]
    pub fn new(config: MockDeviceConfig) -> (MockDevice, MockController) {
        let capture_bytes = config.input.map_or(0, |endpoint| endpoint.bytes_per_buffer());
        let render_bytes = config.output.map_or(0, |endpoint| endpoint.bytes_per_buffer());
        let shared = Arc::new(MockShared {
            signals: SignalSet::new(),
            state: Mutex::new(SharedState {
                capture_source: config.input.map(|_| default_capture_source()),
                capture_pending_fill: [false; SLOTS_PER_DIRECTION],
                capture_delivered: 0,
                capture_released: 0,
                capture_budget: config.buffer_budget,
                render_collected: Vec::new(),
                render_submitted: 0,
                render_submitted_at_start: 0,
                render_armed: 0,
                render_budget: config.buffer_budget,
                auto_advance: config.auto_advance,
                started: false,
                start_count: 0,
                stop_count: 0,
                priorities: Vec::new(),
            }),
        });
        (
            MockDevice {
                shared: Arc::clone(&shared),
                config,
                capture_slots: [vec![0u8; capture_bytes], vec![0u8; capture_bytes]],
                render_slots: [vec![0u8; render_bytes], vec![0u8; render_bytes]],
            },
            MockController { shared },
        )
    }

    /// Run the capture source over any slot the controller armed since
    /// the last call. Fills happen on the device side because the slot
    /// bytes live here.
    fn apply_pending_capture_fills(&mut self) {
        let mut state = self.shared.lock();
        for slot in 0..SLOTS_PER_DIRECTION {
            if state.capture_pending_fill[slot] {
                state.capture_pending_fill[slot] = false;
                if let Some(source) = state.capture_source.as_mut() {
                    source(&mut self.capture_slots[slot]);
                }
            }
        }
    }
}

impl HostDevice for MockDevice {
    fn name(&self) -> &str {
        "mock"
    }

    fn config(&self) -> DeviceConfig {
        DeviceConfig {
            sample_rate: self.config.sample_rate,
            input: self.config.input.map(|endpoint| endpoint.endpoint_config()),
            output: self.config.output.map(|endpoint| endpoint.endpoint_config()),
            buffer_size_mode: self.config.buffer_size_mode,
        }
    }

    fn start(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        state.started = true;
        state.start_count += 1;
        state.render_submitted_at_start = state.render_submitted;
        if state.auto_advance {
            // One slot per direction; the other arms as the first is
            // handed back, like a double buffer alternating in time.
            if self.config.input.is_some() {
                self.shared.arm_capture(&mut state, 0);
            }
            if self.config.output.is_some() {
                self.shared.arm_render(&mut state, 0);
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        state.started = false;
        state.stop_count += 1;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus> {
        let fired = self.shared.signals.wait_any(timeout);
        self.apply_pending_capture_fills();
        let mut status = WaitStatus::default();
        for slot in 0..SLOTS_PER_DIRECTION {
            status.capture_ready[slot] = fired & (1 << (CAPTURE_SIGNAL_BASE + slot as u32)) != 0;
            status.render_ready[slot] = fired & (1 << (RENDER_SIGNAL_BASE + slot as u32)) != 0;
        }
        status.woke = fired & (1 << WAKE_SIGNAL) != 0;
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
        self.apply_pending_capture_fills();
        let capture = capture_slot.map(|slot| &mut self.capture_slots[slot][..]);
        let render = render_slot.map(|slot| &mut self.render_slots[slot][..]);
        SlotLoan { capture, render }
    }

    fn release_capture_slot(&mut self, slot: usize) -> Result<()> {
        let mut state = self.shared.lock();
        state.capture_released += 1;
        if state.auto_advance {
            self.shared.arm_capture(&mut state, (slot + 1) % SLOTS_PER_DIRECTION);
        }
        Ok(())
    }

    fn submit_render_slot(&mut self, slot: usize) -> Result<()> {
        let mut state = self.shared.lock();
        state.render_collected.extend_from_slice(&self.render_slots[slot]);
        state.render_submitted += 1;
        if state.auto_advance {
            self.shared.arm_render(&mut state, (slot + 1) % SLOTS_PER_DIRECTION);
        }
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

    fn set_worker_priority(&mut self, priority: ThreadPriority) {
        self.shared.lock().priorities.push(priority);
    }
}

/// The test-side handle onto a [`MockDevice`]'s shared state.
pub struct MockController {
    shared: Arc<MockShared>,
}

impl MockController {
    /// Replace the capture data source.
    pub fn set_capture_source(&self, source: impl FnMut(&mut [u8]) + Send + 'static) {
        self.shared.lock().capture_source = Some(Box::new(source));
    }

    /// Queue a capture-slot refill and mark the slot ready.
    pub fn signal_capture(&self, slot: usize) {
        let mut state = self.shared.lock();
        self.shared.arm_capture(&mut state, slot);
    }

    /// Mark a render slot empty and ready for filling.
    pub fn signal_render(&self, slot: usize) {
        let mut state = self.shared.lock();
        self.shared.arm_render(&mut state, slot);
    }

    /// Mark both render slots empty in one atomic signal, the way a
    /// starved driver reports a whole double buffer at once.
    pub fn signal_render_pair(&self) {
        let mut state = self.shared.lock();
        let mut mask = 0u32;
        for slot in 0..SLOTS_PER_DIRECTION {
            if let Some(budget) = state.render_budget {
                if state.render_armed >= budget {
                    continue;
                }
            }
            state.render_armed += 1;
            mask |= 1 << (RENDER_SIGNAL_BASE + slot as u32);
        }
        drop(state);
        self.shared.signals.signal_mask(mask);
    }

    /// All bytes submitted to the render side, in submission order.
    #[must_use]
    pub fn collected_output(&self) -> Vec<u8> {
        self.shared.lock().render_collected.clone()
    }

    /// Render buffers submitted so far.
    #[must_use]
    pub fn submitted_render_buffers(&self) -> usize {
        self.shared.lock().render_submitted
    }

    /// Render buffers that had been submitted when the pins last
    /// started; what priming managed to queue ahead of time.
    #[must_use]
    pub fn submitted_before_start(&self) -> usize {
        self.shared.lock().render_submitted_at_start
    }

    /// Capture buffers released back so far.
    #[must_use]
    pub fn released_capture_buffers(&self) -> usize {
        self.shared.lock().capture_released
    }

    /// Block until `count` render buffers have been submitted, or the
    /// timeout passes. Returns whether the count was reached.
    #[must_use]
    pub fn wait_submitted(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.submitted_render_buffers() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.submitted_render_buffers() >= count
    }

    /// How many times the pins were started.
    #[must_use]
    pub fn start_count(&self) -> usize {
        self.shared.lock().start_count
    }

    /// How many times the pins were stopped.
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.shared.lock().stop_count
    }

    /// Whether the pins are currently running.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.shared.lock().started
    }

    /// Every priority the engine applied to the worker, in order.
    #[must_use]
    pub fn priorities(&self) -> Vec<ThreadPriority> {
        self.shared.lock().priorities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corriente_core::SampleFormat;

    fn duplex_config() -> MockDeviceConfig {
        let mut config = MockDeviceConfig::new(48_000.0);
        config.input = Some(MockEndpoint::new(2, SampleFormat::Int16, 64));
        config.output = Some(MockEndpoint::new(2, SampleFormat::Int16, 64));
        config
    }

    #[test]
    fn wait_reports_signaled_slots() {
        let (mut device, controller) = MockDevice::new(duplex_config());
        controller.signal_capture(1);
        controller.signal_render(0);
        let status = device.wait(Duration::from_millis(10)).unwrap();
        assert!(status.capture_ready[1]);
        assert!(!status.capture_ready[0]);
        assert!(status.render_ready[0]);
        assert!(!status.woke);
    }

    #[test]
    fn waker_interrupts_wait() {
        let (mut device, _controller) = MockDevice::new(duplex_config());
        let waker = device.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            waker.wake();
        });
        let status = device.wait(Duration::from_secs(5)).unwrap();
        assert!(status.woke);
        handle.join().unwrap();
    }

    #[test]
    fn submitted_render_data_is_collected() {
        let (mut device, controller) = MockDevice::new(duplex_config());
        controller.signal_render(0);
        let _ = device.wait(Duration::from_millis(10)).unwrap();
        let loan = device.loan_slots(None, Some(0));
        loan.render.unwrap().fill(0xAB);
        device.submit_render_slot(0).unwrap();
        let collected = controller.collected_output();
        assert_eq!(collected.len(), 64 * 2 * 2);
        assert!(collected.iter().all(|&byte| byte == 0xAB));
    }

    #[test]
    fn capture_source_feeds_slots() {
        let (mut device, controller) = MockDevice::new(duplex_config());
        controller.set_capture_source(|buffer| buffer.fill(0x11));
        controller.signal_capture(0);
        let status = device.wait(Duration::from_millis(10)).unwrap();
        assert!(status.capture_ready[0]);
        let loan = device.loan_slots(Some(0), None);
        assert!(loan.capture.unwrap().iter().all(|&byte| byte == 0x11));
    }

    #[test]
    fn duplex_loan_hands_out_both_directions() {
        let (mut device, controller) = MockDevice::new(duplex_config());
        controller.set_capture_source(|buffer| buffer.fill(0x22));
        controller.signal_capture(0);
        let _ = device.wait(Duration::from_millis(10)).unwrap();
        let loan = device.loan_slots(Some(0), Some(1));
        let capture = loan.capture.unwrap();
        let render = loan.render.unwrap();
        assert!(capture.iter().all(|&byte| byte == 0x22));
        render.fill(0x33);
        device.submit_render_slot(1).unwrap();
        assert!(controller.collected_output().iter().all(|&byte| byte == 0x33));
    }

    #[test]
    fn auto_advance_rearms_until_budget() {
        let mut config = duplex_config();
        config.input = None;
        config.auto_advance = true;
        config.buffer_budget = Some(3);
        let (mut device, controller) = MockDevice::new(config);
        device.start().unwrap();

        let mut served = 0u8;
        loop {
            let status = device.wait(Duration::from_millis(10)).unwrap();
            if status.is_timeout() {
                break;
            }
            for slot in 0..SLOTS_PER_DIRECTION {
                if status.render_ready[slot] {
                    device.loan_slots(None, Some(slot)).render.unwrap().fill(served);
                    device.submit_render_slot(slot).unwrap();
                    served += 1;
                }
            }
        }
        assert_eq!(served, 3);
        assert_eq!(controller.submitted_render_buffers(), 3);
    }

    #[test]
    fn clone_render_slot_duplicates_bytes() {
        let (mut device, _controller) = MockDevice::new(duplex_config());
        device.loan_slots(None, Some(0)).render.unwrap().fill(0x42);
        device.clone_render_slot(0, 1);
        assert!(
            device
                .loan_slots(None, Some(1))
                .render
                .unwrap()
                .iter()
                .all(|&byte| byte == 0x42)
        );
    }

    #[test]
    fn pin_state_is_observable() {
        let (mut device, controller) = MockDevice::new(duplex_config());
        assert!(!controller.is_started());
        device.start().unwrap();
        assert!(controller.is_started());
        assert_eq!(controller.start_count(), 1);
        device.stop().unwrap();
        assert!(!controller.is_started());
        assert_eq!(controller.stop_count(), 1);
    }
}
