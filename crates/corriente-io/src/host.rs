//! The backend seam: what a platform audio backend must provide.
//!
//! The engine is host-neutral. Everything driver-specific — device
//! negotiation, pin/endpoint handles, position registers, memory-mapped
//! buffers — lives behind the object-safe [`HostDevice`] trait. A device
//! presents each direction as two loanable slots (a split double buffer);
//! the worker waits on the device's ready signals, borrows slots, runs the
//! buffer processor over them, and hands them back.
//!
//! Two driver families fit this shape:
//!
//! - **Ring-buffered** drivers complete whole packets and can report each
//!   slot ready directly.
//! - **Mapped-memory** drivers expose a hardware position register; the
//!   backend reads it on its shared event and reports the half-buffer the
//!   hardware has moved out of. That translation happens inside the
//!   backend; the worker only ever sees slot indexes.

use crate::processor::HostBufferSizeMode;
use crate::{HostErrorInfo, Result};
use corriente_core::WireFormat;
use std::sync::Arc;
use std::time::Duration;

/// Slots per direction. The pair lets a backend present a split buffer
/// (for example a ring wrap) as two contiguous segments.
pub const SLOTS_PER_DIRECTION: usize = 2;

/// Scheduling band for the stream worker thread.
///
/// The engine asks for [`TimeCritical`](ThreadPriority::TimeCritical) at
/// start and demotes one band while throttling an overloaded callback.
/// How bands map to OS scheduling is the backend's business; the default
/// implementation ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ThreadPriority {
    /// No elevated scheduling.
    #[default]
    Normal,
    /// Elevated, but preemptible by time-critical work.
    Elevated,
    /// The platform's pro-audio / time-critical band.
    TimeCritical,
}

impl ThreadPriority {
    /// The next band down, saturating at [`Normal`](ThreadPriority::Normal).
    #[must_use]
    pub fn demoted(self) -> ThreadPriority {
        match self {
            ThreadPriority::TimeCritical => ThreadPriority::Elevated,
            ThreadPriority::Elevated | ThreadPriority::Normal => ThreadPriority::Normal,
        }
    }
}

/// Configuration of one direction of a device.
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    /// Channels the device carries. May exceed the application's channel
    /// count; the worker leaves (or duplicates into) the surplus.
    pub channels: usize,
    /// The driver-native sample layout.
    pub wire_format: WireFormat,
    /// Frames in each slot. Zero when the backend delivers variable-size
    /// buffers.
    pub frames_per_buffer: usize,
    /// Hardware latency of this endpoint, in seconds.
    pub latency: f64,
}

/// What a device tells the engine about itself at open time.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// The rate the device runs at.
    pub sample_rate: f64,
    /// Capture side, if the device has one.
    pub input: Option<EndpointConfig>,
    /// Playback side, if the device has one.
    pub output: Option<EndpointConfig>,
    /// How the device treats host buffer sizes.
    pub buffer_size_mode: HostBufferSizeMode,
}

/// Which slots became ready during a wait, plus control-signal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitStatus {
    /// Capture slots that filled since the last wait.
    pub capture_ready: [bool; SLOTS_PER_DIRECTION],
    /// Render slots that emptied since the last wait.
    pub render_ready: [bool; SLOTS_PER_DIRECTION],
    /// The waker fired (stop/abort request from another thread).
    pub woke: bool,
}

impl WaitStatus {
    /// `true` when nothing fired: the wait timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        !self.woke
            && !self.capture_ready.iter().any(|&ready| ready)
            && !self.render_ready.iter().any(|&ready| ready)
    }
}

/// A clonable handle that interrupts the device's wait from another
/// thread. Stop and abort paths use it to get the worker's attention.
#[derive(Clone)]
pub struct HostWaker {
    wake: Arc<dyn Fn() + Send + Sync>,
}

impl HostWaker {
    /// Wrap a wake function.
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> HostWaker {
        HostWaker {
            wake: Arc::new(wake),
        }
    }

    /// Interrupt the current (or next) wait.
    pub fn wake(&self) {
        (self.wake)();
    }
}

impl std::fmt::Debug for HostWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostWaker").finish_non_exhaustive()
    }
}

/// One direction-pair of slot loans for a single processing pass.
///
/// Loaned from [`HostDevice::loan_slots`]; both borrows end together,
/// which is what lets a full-duplex pass hold one capture and one render
/// slot at the same time.
#[derive(Default)]
pub struct SlotLoan<'a> {
    /// The requested capture slot's bytes, valid captured audio.
    pub capture: Option<&'a mut [u8]>,
    /// The requested render slot's bytes, to be filled.
    pub render: Option<&'a mut [u8]>,
}

/// One open host audio device, both directions.
///
/// The trait is object-safe; streams own their device as
/// `Box<dyn HostDevice>`. All methods except the waker obtained from
/// [`waker`](HostDevice::waker) are called from the stream's worker thread
/// (or, for blocking streams, the application thread driving reads and
/// writes).
///
/// ## Slot protocol
///
/// Capture: when a capture slot is reported ready its bytes are valid
/// captured audio. The worker borrows it via
/// [`loan_slots`](HostDevice::loan_slots), reads (and may normalize in
/// place), then returns it with
/// [`release_capture_slot`](HostDevice::release_capture_slot) so the
/// driver can refill it.
///
/// Render: when a render slot is reported ready it is empty. The worker
/// borrows it, fills it, then queues it with
/// [`submit_render_slot`](HostDevice::submit_render_slot). Render slots may
/// also be filled and submitted before [`start`](HostDevice::start) to
/// prime the stream.
pub trait HostDevice: Send {
    /// Short backend name for diagnostics, e.g. `"mock"` or `"cpal"`.
    fn name(&self) -> &str;

    /// Static configuration of this device.
    fn config(&self) -> DeviceConfig;

    /// Start both pins. After this the device begins signaling ready
    /// slots.
    fn start(&mut self) -> Result<()>;

    /// Stop both pins. Queued render slots may still play out, depending
    /// on the backend; abort paths call this without draining.
    fn stop(&mut self) -> Result<()>;

    /// Block until any slot becomes ready, the waker fires, or `timeout`
    /// passes. Ready states are edge-triggered: each slot is reported
    /// once per readiness.
    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus>;

    /// A handle other threads can use to interrupt [`wait`](HostDevice::wait).
    fn waker(&self) -> HostWaker;

    /// Borrow the requested slots for one processing pass. Capture bytes
    /// are mutable so wire-layout stages can normalize in place. Loans
    /// are valid only between the slot being reported ready and its
    /// release/submit.
    fn loan_slots(&mut self, capture_slot: Option<usize>, render_slot: Option<usize>)
    -> SlotLoan<'_>;

    /// Return a consumed capture slot to the driver.
    fn release_capture_slot(&mut self, slot: usize) -> Result<()>;

    /// Queue a filled render slot for playback.
    fn submit_render_slot(&mut self, slot: usize) -> Result<()>;

    /// Copy the contents of one render slot over another; used by the
    /// output-underflow catch-up to repeat the most recent buffer.
    fn clone_render_slot(&mut self, from: usize, to: usize);

    /// Apply a scheduling band to the calling (worker) thread. Optional.
    fn set_worker_priority(&mut self, _priority: ThreadPriority) {}

    /// The most recent backend-specific error, for the process-wide error
    /// slot. Optional.
    fn take_host_error(&mut self) -> Option<HostErrorInfo> {
        None
    }
}
