//! Sample formats and driver-native wire layouts.
//!
//! A [`SampleFormat`] names one of the six base encodings a stream can carry.
//! Application buffers always use a base format in the platform's native byte
//! order. Host drivers may instead declare a [`WireFormat`]: a base container
//! plus byte order, significant-bit count and justification (e.g. "int32
//! container, 24 significant bits, MSB-justified, big-endian"). Wire layouts
//! are decomposed into byte-swap and bit-shift stages by
//! [`wire`](crate::wire); everything downstream of those stages works on base
//! formats only.

use core::fmt;

/// One of the base sample encodings supported by the engine.
///
/// Exactly one base format applies to each side of a stream. 24-bit samples
/// are packed: three consecutive bytes per sample, no padding byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer; 128 is "ground".
    UInt8,
    /// Signed 16-bit integer.
    Int16,
    /// Packed signed 24-bit integer (3 bytes per sample).
    Int24,
    /// Signed 32-bit integer.
    Int32,
    /// 32-bit float, nominal full scale at ±1.0.
    Float32,
}

impl SampleFormat {
    /// All base formats, widest last.
    pub const ALL: [SampleFormat; 6] = [
        SampleFormat::Int8,
        SampleFormat::UInt8,
        SampleFormat::Int16,
        SampleFormat::Int24,
        SampleFormat::Int32,
        SampleFormat::Float32,
    ];

    /// Size of one sample in bytes.
    #[must_use]
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Int8 | SampleFormat::UInt8 => 1,
            SampleFormat::Int16 => 2,
            SampleFormat::Int24 => 3,
            SampleFormat::Int32 | SampleFormat::Float32 => 4,
        }
    }

    /// Number of significant bits a full-scale sample carries.
    #[must_use]
    pub const fn bits_per_sample(self) -> u8 {
        (self.bytes_per_sample() * 8) as u8
    }

    /// `true` for the integer encodings.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        !matches!(self, SampleFormat::Float32)
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::Int8 => "int8",
            SampleFormat::UInt8 => "uint8",
            SampleFormat::Int16 => "int16",
            SampleFormat::Int24 => "int24",
            SampleFormat::Int32 => "int32",
            SampleFormat::Float32 => "float32",
        };
        f.write_str(name)
    }
}

/// Byte order of a wire container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Least-significant byte first.
    #[default]
    Little,
    /// Most-significant byte first.
    Big,
}

impl ByteOrder {
    /// The byte order of the machine this code runs on.
    #[must_use]
    pub const fn native() -> ByteOrder {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    /// `true` when samples in this order need a swap on this machine.
    #[must_use]
    pub const fn is_swapped(self) -> bool {
        !matches!(
            (self, ByteOrder::native()),
            (ByteOrder::Little, ByteOrder::Little) | (ByteOrder::Big, ByteOrder::Big)
        )
    }
}

/// Alignment of the significant bits within a wire container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Justification {
    /// Significant bits occupy the high end of the container. A full-scale
    /// value reads correctly as the container type; no shift stage needed.
    #[default]
    Msb,
    /// Significant bits occupy the low end of the container. Unpacking
    /// shifts left into MSB alignment; packing shifts right back.
    Lsb,
}

/// A driver-declared sample layout.
///
/// Describes how samples sit in host memory: base container, byte order, how
/// many of the container's bits are significant and where they sit. A wire
/// format whose container is fully used in native order degenerates to its
/// base [`SampleFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    /// Container encoding.
    pub format: SampleFormat,
    /// Byte order of each sample in host memory.
    pub byte_order: ByteOrder,
    /// Significant bits, `1..=container bits`. Equal to the container width
    /// for fully used containers.
    pub valid_bits: u8,
    /// Where the significant bits sit when `valid_bits` is smaller than the
    /// container.
    pub justification: Justification,
}

impl WireFormat {
    /// A wire format that is just the base format in native byte order.
    #[must_use]
    pub const fn native(format: SampleFormat) -> WireFormat {
        WireFormat {
            format,
            byte_order: ByteOrder::native(),
            valid_bits: format.bits_per_sample(),
            justification: Justification::Msb,
        }
    }

    /// Whether this layout is expressible by the engine.
    ///
    /// Float containers must be fully used; integer containers accept
    /// 8..=width significant bits.
    #[must_use]
    pub const fn is_supported(&self) -> bool {
        let width = self.format.bits_per_sample();
        if self.valid_bits == 0 || self.valid_bits > width {
            return false;
        }
        if !self.format.is_integer() && self.valid_bits != width {
            return false;
        }
        true
    }

    /// Bits between the significant field and the container edge it is not
    /// justified against; zero for fully used containers.
    #[must_use]
    pub const fn shift_bits(&self) -> u8 {
        self.format.bits_per_sample() - self.valid_bits
    }

    /// `true` when a byte-swap stage is required on this machine.
    #[must_use]
    pub const fn needs_swap(&self) -> bool {
        self.byte_order.is_swapped() && self.format.bytes_per_sample() > 1
    }

    /// `true` when a bit-shift stage is required.
    #[must_use]
    pub const fn needs_shift(&self) -> bool {
        matches!(self.justification, Justification::Lsb) && self.shift_bits() > 0
    }
}

impl From<SampleFormat> for WireFormat {
    fn from(format: SampleFormat) -> Self {
        WireFormat::native(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_sizes() {
        assert_eq!(SampleFormat::Int8.bytes_per_sample(), 1);
        assert_eq!(SampleFormat::UInt8.bytes_per_sample(), 1);
        assert_eq!(SampleFormat::Int16.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::Int24.bytes_per_sample(), 3);
        assert_eq!(SampleFormat::Int32.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::Float32.bytes_per_sample(), 4);
    }

    #[test]
    fn native_wire_format_needs_no_stages() {
        for format in SampleFormat::ALL {
            let wire = WireFormat::native(format);
            assert!(wire.is_supported());
            assert!(!wire.needs_swap());
            assert!(!wire.needs_shift());
            assert_eq!(wire.shift_bits(), 0);
        }
    }

    #[test]
    fn lsb_justified_container_shifts() {
        let wire = WireFormat {
            format: SampleFormat::Int32,
            byte_order: ByteOrder::native(),
            valid_bits: 24,
            justification: Justification::Lsb,
        };
        assert!(wire.is_supported());
        assert_eq!(wire.shift_bits(), 8);
        assert!(wire.needs_shift());
    }

    #[test]
    fn msb_justified_container_does_not_shift() {
        let wire = WireFormat {
            format: SampleFormat::Int32,
            byte_order: ByteOrder::native(),
            valid_bits: 24,
            justification: Justification::Msb,
        };
        assert!(wire.is_supported());
        assert!(!wire.needs_shift());
    }

    #[test]
    fn partial_float_container_rejected() {
        let wire = WireFormat {
            format: SampleFormat::Float32,
            byte_order: ByteOrder::native(),
            valid_bits: 24,
            justification: Justification::Msb,
        };
        assert!(!wire.is_supported());
    }

    #[test]
    fn foreign_byte_order_needs_swap() {
        let other = match ByteOrder::native() {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        };
        let wire = WireFormat {
            format: SampleFormat::Int16,
            byte_order: other,
            valid_bits: 16,
            justification: Justification::Msb,
        };
        assert!(wire.needs_swap());
        // Single-byte samples have no byte order.
        let wire8 = WireFormat {
            format: SampleFormat::UInt8,
            byte_order: other,
            valid_bits: 8,
            justification: Justification::Msb,
        };
        assert!(!wire8.needs_swap());
    }
}
