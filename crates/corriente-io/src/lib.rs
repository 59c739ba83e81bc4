//! Corriente I/O - the host-neutral real-time audio stream engine.
//!
//! This crate couples an application callback (application-shaped sample
//! blocks in the application's preferred format) to a host audio device
//! (driver-shaped blocks in the driver's native format) under real-time
//! constraints. It provides:
//!
//! - **Stream lifecycle**: [`open_stream`], [`Stream::start`],
//!   [`Stream::stop`], [`Stream::abort`], blocking [`Stream::read`] /
//!   [`Stream::write`]
//! - **The buffer processor**: block-size and format adaptation between
//!   host and application buffers ([`processor`])
//! - **The host event loop**: a per-stream worker that waits on
//!   buffer-ready signals, drives the processor, and handles
//!   underflow/overflow catch-up ([`worker`])
//! - **The backend seam**: the object-safe [`HostDevice`] trait that
//!   platform backends implement, plus a deterministic in-memory
//!   [`MockDevice`](backends::MockDevice) and an optional cpal adapter
//!   (feature `cpal-backend`)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use corriente_io::{initialize, open_stream, StreamFlags, StreamParameters};
//! use corriente_core::SampleFormat;
//!
//! initialize()?;
//! let device = /* a HostDevice implementation */;
//! let mut stream = open_stream(
//!     device,
//!     None,
//!     Some(StreamParameters::new(2, SampleFormat::Float32)),
//!     48_000.0,
//!     256,
//!     StreamFlags::empty(),
//!     Some(Box::new(|mut args| {
//!         let out = args.output.as_mut().unwrap();
//!         out.samples_mut::<f32>().fill(0.0);
//!         corriente_io::CallbackResult::Continue
//!     })),
//! )?;
//! stream.start()?;
//! ```

pub mod backends;
pub(crate) mod blocking;
pub mod buffer;
pub mod group;
pub mod host;
pub mod params;
pub mod processor;
pub mod stream;
pub mod sync;
pub(crate) mod worker;

pub use buffer::{Buffer, BufferMut, Sample};
pub use group::ResourceGroup;
pub use host::{
    DeviceConfig, EndpointConfig, HostDevice, HostWaker, SlotLoan, ThreadPriority, WaitStatus,
};
pub use params::{
    CallbackFlags, CallbackResult, FinishedCallback, StreamCallback, StreamCallbackArgs,
    StreamFlags, StreamInfo, StreamParameters, TimeInfo,
};
pub use processor::{
    BufferProcessor, ChannelDescriptor, DirectionConfig, HostBufferSizeMode, ProcessResult,
    ProcessorConfig, ProcessorIo,
};
pub use stream::{Stream, open_stream};

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Raw error information captured from a host backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostErrorInfo {
    /// Backend-specific error code.
    pub code: i64,
    /// Human-readable description from the backend.
    pub text: String,
}

impl std::fmt::Display for HostErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.text)
    }
}

/// Errors returned by the public stream surface.
///
/// `NoError` from the original taxonomy is the `Ok` arm of [`Result`];
/// invalid stream handles cannot be expressed because streams are owned
/// values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The library has not been brought up with [`initialize`].
    #[error("library is not initialized")]
    NotInitialized,

    /// The host backend reported an error the engine has no mapping for.
    /// The raw code and text are also stored in the process-wide slot
    /// readable via [`last_host_error`].
    #[error("unanticipated host error: {0}")]
    UnanticipatedHostError(HostErrorInfo),

    /// A channel count is zero or exceeds what the device offers.
    #[error("invalid channel count")]
    InvalidChannelCount,

    /// The requested sample rate is not the device's rate.
    #[error("invalid sample rate")]
    InvalidSampleRate,

    /// The backend rejected the device.
    #[error("invalid device")]
    InvalidDevice,

    /// A stream flag is unknown or not applicable to this stream.
    #[error("invalid flag")]
    InvalidFlag,

    /// A sample format or wire layout is not expressible by the engine.
    #[error("sample format not supported")]
    SampleFormatNotSupported,

    /// The input/output device combination cannot form a stream.
    #[error("bad I/O device combination")]
    BadIoDeviceCombination,

    /// Memory for stream state could not be allocated.
    #[error("insufficient memory")]
    InsufficientMemory,

    /// The requested buffer size exceeds what the backend can honor.
    #[error("buffer too big")]
    BufferTooBig,

    /// The requested buffer size is below what the backend can honor.
    #[error("buffer too small")]
    BufferTooSmall,

    /// A callback stream was opened without a callback.
    #[error("null callback")]
    NullCallback,

    /// The worker thread missed its shutdown or wait budget.
    #[error("timed out")]
    TimedOut,

    /// An internal invariant failed.
    #[error("internal error")]
    InternalError,

    /// The device exists but cannot currently be used.
    #[error("device unavailable")]
    DeviceUnavailable,

    /// Backend-specific stream info did not match the backend.
    #[error("incompatible host API specific stream info")]
    IncompatibleHostApiSpecificStreamInfo,

    /// The operation requires a started stream.
    #[error("stream is stopped")]
    StreamIsStopped,

    /// The operation requires a stopped stream.
    #[error("stream is not stopped")]
    StreamIsNotStopped,

    /// Input data was discarded before the application saw it.
    #[error("input overflowed")]
    InputOverflowed,

    /// Silence was inserted because output data was not ready in time.
    #[error("output underflowed")]
    OutputUnderflowed,

    /// No host API matching the request is present.
    #[error("host API not found")]
    HostApiNotFound,

    /// The host API identifier is out of range.
    #[error("invalid host API")]
    InvalidHostApi,

    /// [`Stream::read`] was called on a callback stream.
    #[error("can not read from a callback stream")]
    CanNotReadFromACallbackStream,

    /// [`Stream::write`] was called on a callback stream.
    #[error("can not write to a callback stream")]
    CanNotWriteToACallbackStream,

    /// [`Stream::read`] was called on an output-only stream.
    #[error("can not read from an output only stream")]
    CanNotReadFromAnOutputOnlyStream,

    /// [`Stream::write`] was called on an input-only stream.
    #[error("can not write to an input only stream")]
    CanNotWriteToAnInputOnlyStream,

    /// The stream belongs to a different host API than the operation.
    #[error("incompatible stream host API")]
    IncompatibleStreamHostApi,
}

/// Convenience result type for stream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reference count for [`initialize`] / [`terminate`] bracketing.
static INIT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Process-wide slot holding the most recent raw host error.
static LAST_HOST_ERROR: Mutex<Option<HostErrorInfo>> = Mutex::new(None);

/// Bring the library up. May be called multiple times; each call must be
/// balanced by a [`terminate`].
pub fn initialize() -> Result<()> {
    INIT_COUNT.fetch_add(1, Ordering::SeqCst);
    tracing::debug!("library initialized");
    Ok(())
}

/// Balance one [`initialize`]. When the last reference is released the
/// process-wide error slot is cleared.
pub fn terminate() -> Result<()> {
    let previous = INIT_COUNT.fetch_sub(1, Ordering::SeqCst);
    if previous == 0 {
        // Unbalanced terminate; restore and report.
        INIT_COUNT.fetch_add(1, Ordering::SeqCst);
        return Err(Error::NotInitialized);
    }
    if previous == 1 {
        clear_last_host_error();
        tracing::debug!("library terminated");
    }
    Ok(())
}

/// Whether [`initialize`] is currently in effect.
#[must_use]
pub fn is_initialized() -> bool {
    INIT_COUNT.load(Ordering::SeqCst) > 0
}

pub(crate) fn require_initialized() -> Result<()> {
    if is_initialized() {
        Ok(())
    } else {
        Err(Error::NotInitialized)
    }
}

/// The most recent raw host error, if any backend has reported one.
/// Overwritten on each occurrence; process-wide.
#[must_use]
pub fn last_host_error() -> Option<HostErrorInfo> {
    LAST_HOST_ERROR.lock().map(|slot| slot.clone()).unwrap_or(None)
}

pub(crate) fn record_host_error(info: HostErrorInfo) {
    tracing::warn!(code = info.code, text = %info.text, "host error");
    if let Ok(mut slot) = LAST_HOST_ERROR.lock() {
        *slot = Some(info);
    }
}

pub(crate) fn clear_last_host_error() {
    if let Ok(mut slot) = LAST_HOST_ERROR.lock() {
        *slot = None;
    }
}
