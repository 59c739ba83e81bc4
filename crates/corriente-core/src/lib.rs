//! Corriente Core - sample-format machinery for real-time audio I/O
//!
//! This crate provides the format-level building blocks the corriente stream
//! engine is assembled from: everything that touches individual samples, and
//! nothing that touches devices, threads or time (except the CPU-load meter,
//! which is `std`-only).
//!
//! # Core Abstractions
//!
//! ## Formats
//!
//! - [`SampleFormat`] - the six base encodings a stream side can carry
//! - [`WireFormat`] - a driver-declared container layout (byte order,
//!   significant bits, justification)
//!
//! ## Conversion
//!
//! - [`Converter`] / [`select_converter`] - the full format-conversion
//!   matrix as statically selected, allocation-free strided functions
//! - [`WireConverter`] - byte-swap and bit-shift stages composed with a
//!   base converter for driver-native layouts
//! - [`write_silence`] - format-aware silence fill
//!
//! ## Dither
//!
//! - [`TriangularDither`] - per-stream triangular-PDF noise source used by
//!   narrowing converters
//!
//! ## Measurement
//!
//! - [`CpuLoadMeasurer`] - EWMA of callback wall time over audio time
//!   (`std` feature only)
//!
//! # no_std Support
//!
//! Everything except the CPU-load meter is `no_std` compatible; float
//! rounding comes from `libm`. Disable the default `std` feature:
//!
//! ```toml
//! [dependencies]
//! corriente-core = { version = "0.1", default-features = false }
//! ```
//!
//! # Design Principles
//!
//! - **Real-time safe**: converters never allocate and never fail
//! - **Static selection**: format and flag dispatch happens once per
//!   stream, never per sample
//! - **No raw pointers**: strided channel access is expressed over byte
//!   slices; the crate forbids `unsafe`

#![cfg_attr(not(feature = "std"), no_std)]

pub mod convert;
pub mod dither;
pub mod format;
#[cfg(feature = "std")]
pub mod load;
pub mod wire;

pub use convert::{Converter, select_converter, write_silence};
pub use dither::TriangularDither;
pub use format::{ByteOrder, Justification, SampleFormat, WireFormat};
#[cfg(feature = "std")]
pub use load::CpuLoadMeasurer;
pub use wire::{SwapStage, WireConverter, select_byte_swapper};
