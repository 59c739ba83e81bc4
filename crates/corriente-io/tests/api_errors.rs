//! Error-path battery: every public entry point driven with
//! out-of-contract arguments, asserting the exact error kind.
//!
//! Kept as one sequential test so the not-initialized probe runs before
//! anything initializes the process-wide state.

use corriente_core::{ByteOrder, Justification, SampleFormat, WireFormat};
use corriente_io::backends::{MockDevice, MockDeviceConfig, MockEndpoint};
use corriente_io::{
    CallbackResult, Error, HostBufferSizeMode, StreamCallback, StreamFlags, StreamParameters,
    initialize, open_stream,
};

fn output_device(frames: usize) -> MockDeviceConfig {
    let mut config = MockDeviceConfig::new(48_000.0);
    config.output = Some(MockEndpoint::new(2, SampleFormat::Int16, frames));
    config
}

fn noop_callback() -> StreamCallback {
    Box::new(|mut args| {
        if let Some(output) = args.output.as_mut() {
            output.fill_silence();
        }
        CallbackResult::Continue
    })
}

#[test]
fn rejects_out_of_contract_arguments() {
    // --- before initialize -------------------------------------------------
    let (device, _controller) = MockDevice::new(output_device(256));
    let result = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(2, SampleFormat::Int16)),
        48_000.0,
        256,
        StreamFlags::empty(),
        Some(noop_callback()),
    );
    assert!(matches!(result, Err(Error::NotInitialized)));

    initialize().unwrap();

    // --- direction combinations -------------------------------------------
    let (device, _controller) = MockDevice::new(output_device(256));
    let result = open_stream(
        Box::new(device),
        None,
        None,
        48_000.0,
        256,
        StreamFlags::empty(),
        Some(noop_callback()),
    );
    assert!(matches!(result, Err(Error::BadIoDeviceCombination)));

    // input parameters against an output-only device
    let (device, _controller) = MockDevice::new(output_device(256));
    let result = open_stream(
        Box::new(device),
        Some(StreamParameters::new(1, SampleFormat::Int16)),
        None,
        48_000.0,
        256,
        StreamFlags::empty(),
        Some(noop_callback()),
    );
    assert!(matches!(result, Err(Error::InvalidDevice)));

    // full duplex over mismatched endpoint sizes
    let mut config = MockDeviceConfig::new(48_000.0);
    config.input = Some(MockEndpoint::new(1, SampleFormat::Int16, 128));
    config.output = Some(MockEndpoint::new(1, SampleFormat::Int16, 256));
    let (device, _controller) = MockDevice::new(config);
    let result = open_stream(
        Box::new(device),
        Some(StreamParameters::new(1, SampleFormat::Float32)),
        Some(StreamParameters::new(1, SampleFormat::Float32)),
        48_000.0,
        128,
        StreamFlags::empty(),
        Some(noop_callback()),
    );
    assert!(matches!(result, Err(Error::BadIoDeviceCombination)));

    // --- channel counts ----------------------------------------------------
    for channels in [0usize, 3] {
        let (device, _controller) = MockDevice::new(output_device(256));
        let result = open_stream(
            Box::new(device),
            None,
            Some(StreamParameters::new(channels, SampleFormat::Int16)),
            48_000.0,
            256,
            StreamFlags::empty(),
            Some(noop_callback()),
        );
        assert!(
            matches!(result, Err(Error::InvalidChannelCount)),
            "channel count {channels} was not rejected"
        );
    }

    // --- sample rates ------------------------------------------------------
    for rate in [0.0, -1.0, 44_100.0] {
        let (device, _controller) = MockDevice::new(output_device(256));
        let result = open_stream(
            Box::new(device),
            None,
            Some(StreamParameters::new(2, SampleFormat::Int16)),
            rate,
            256,
            StreamFlags::empty(),
            Some(noop_callback()),
        );
        assert!(
            matches!(result, Err(Error::InvalidSampleRate)),
            "sample rate {rate} was not rejected"
        );
    }

    // --- flags -------------------------------------------------------------
    let (device, _controller) = MockDevice::new(output_device(256));
    let result = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(2, SampleFormat::Int16)),
        48_000.0,
        256,
        StreamFlags::PRIME_OUTPUT_BUFFERS_USING_STREAM_CALLBACK,
        None, // blocking stream cannot prime via callback
    );
    assert!(matches!(result, Err(Error::InvalidFlag)));

    // --- wire formats ------------------------------------------------------
    let mut config = MockDeviceConfig::new(48_000.0);
    config.output = Some(MockEndpoint {
        channels: 2,
        wire_format: WireFormat {
            format: SampleFormat::Float32,
            byte_order: ByteOrder::native(),
            valid_bits: 24, // partially used float container is unsupported
            justification: Justification::Msb,
        },
        frames_per_buffer: 256,
        latency: 0.0,
    });
    let (device, _controller) = MockDevice::new(config);
    let result = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(2, SampleFormat::Float32)),
        48_000.0,
        256,
        StreamFlags::empty(),
        Some(noop_callback()),
    );
    assert!(matches!(result, Err(Error::SampleFormatNotSupported)));

    // --- buffer bounds -----------------------------------------------------
    let mut config = output_device(256);
    config.buffer_size_mode = HostBufferSizeMode::BoundedPartialUsageForbidden;
    let (device, _controller) = MockDevice::new(config);
    let result = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(2, SampleFormat::Int16)),
        48_000.0,
        512, // larger than the stated bound
        StreamFlags::empty(),
        Some(noop_callback()),
    );
    assert!(matches!(result, Err(Error::BufferTooBig)));

    // --- callback/blocking mode confusion ----------------------------------
    let (device, _controller) = MockDevice::new(output_device(256));
    let mut callback_stream = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(2, SampleFormat::Int16)),
        48_000.0,
        256,
        StreamFlags::empty(),
        Some(noop_callback()),
    )
    .unwrap();
    let mut scratch = [0u8; 64];
    assert!(matches!(
        callback_stream.read(&mut scratch, 8),
        Err(Error::CanNotReadFromACallbackStream)
    ));
    assert!(matches!(
        callback_stream.write(&scratch, 8),
        Err(Error::CanNotWriteToACallbackStream)
    ));
    assert!(matches!(
        callback_stream.read_available(),
        Err(Error::CanNotReadFromACallbackStream)
    ));
    assert!(matches!(
        callback_stream.write_available(),
        Err(Error::CanNotWriteToACallbackStream)
    ));

    // --- blocking direction confusion --------------------------------------
    let (device, _controller) = MockDevice::new(output_device(256));
    let mut blocking_output = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(2, SampleFormat::Int16)),
        48_000.0,
        0,
        StreamFlags::empty(),
        None,
    )
    .unwrap();
    assert!(matches!(
        blocking_output.read(&mut scratch, 8),
        Err(Error::CanNotReadFromAnOutputOnlyStream)
    ));
    // Writing while stopped is a state error, not a direction error.
    assert!(matches!(
        blocking_output.write(&scratch, 8),
        Err(Error::StreamIsStopped)
    ));

    let mut config = MockDeviceConfig::new(48_000.0);
    config.input = Some(MockEndpoint::new(2, SampleFormat::Int16, 256));
    let (device, _controller) = MockDevice::new(config);
    let mut blocking_input = open_stream(
        Box::new(device),
        Some(StreamParameters::new(2, SampleFormat::Int16)),
        None,
        48_000.0,
        0,
        StreamFlags::empty(),
        None,
    )
    .unwrap();
    assert!(matches!(
        blocking_input.write(&scratch, 8),
        Err(Error::CanNotWriteToAnInputOnlyStream)
    ));
    assert!(matches!(
        blocking_input.read(&mut scratch, 8),
        Err(Error::StreamIsStopped)
    ));

    // undersized destination buffer
    blocking_input.start().unwrap();
    let mut tiny = [0u8; 4];
    assert!(matches!(
        blocking_input.read(&mut tiny, 8),
        Err(Error::BufferTooSmall)
    ));
    blocking_input.abort().unwrap();

    // --- lifecycle state errors ---------------------------------------------
    let mut config = output_device(64);
    config.auto_advance = true;
    config.buffer_budget = Some(4);
    let (device, _controller) = MockDevice::new(config);
    let mut stream = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(2, SampleFormat::Int16)),
        48_000.0,
        64,
        StreamFlags::empty(),
        Some(noop_callback()),
    )
    .unwrap();

    assert!(matches!(stream.stop(), Err(Error::StreamIsStopped)));
    assert!(matches!(stream.abort(), Err(Error::StreamIsStopped)));
    assert!(stream.is_stopped());

    stream.start().unwrap();
    assert!(matches!(stream.start(), Err(Error::StreamIsNotStopped)));
    assert!(matches!(
        stream.set_finished_callback(None),
        Err(Error::StreamIsNotStopped)
    ));
    stream.abort().unwrap();
    assert!(stream.is_stopped());
    assert!(!stream.is_active());
}
