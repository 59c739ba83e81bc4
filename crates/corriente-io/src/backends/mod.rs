//! Host device implementations.
//!
//! The engine itself is backend-agnostic; everything here implements the
//! [`HostDevice`](crate::host::HostDevice) seam. [`MockDevice`] is a
//! deterministic in-memory device used throughout the test suite. The
//! `cpal-backend` feature adds [`CpalDevice`], an adapter that presents a
//! real system device through the same seam.

mod mock;

pub use mock::{MockController, MockDevice, MockDeviceConfig, MockEndpoint};

#[cfg(feature = "cpal-backend")]
mod cpal;

#[cfg(feature = "cpal-backend")]
pub use cpal::CpalDevice;
