//! End-to-end stream scenarios over the mock host device.
//!
//! Each test drives a full open/start/process/stop lifecycle through the
//! public API, with the mock device either free-running on a buffer
//! budget (auto-advance) or scripted signal by signal.

use corriente_core::SampleFormat;
use corriente_io::backends::{MockDevice, MockDeviceConfig, MockEndpoint};
use corriente_io::{
    CallbackFlags, CallbackResult, StreamCallback, StreamFlags, StreamParameters, initialize,
    open_stream,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const XRUN_FLAGS: CallbackFlags = CallbackFlags::INPUT_UNDERFLOW
    .union(CallbackFlags::INPUT_OVERFLOW)
    .union(CallbackFlags::OUTPUT_UNDERFLOW)
    .union(CallbackFlags::OUTPUT_OVERFLOW);

/// Library init plus opt-in log output (`RUST_LOG=corriente_io=trace`).
fn init() {
    initialize().unwrap();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn i16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario: non-adapting interleaved i16 stereo, 2 seconds of sine
// ---------------------------------------------------------------------------

#[test]
fn non_adapting_stereo_sine_run() {
    init();

    // 2 s at 48 kHz in 512-frame buffers is 187 whole buffers.
    let buffers = 96_000 / 512;
    let mut config = MockDeviceConfig::new(48_000.0);
    config.output = Some(MockEndpoint::new(2, SampleFormat::Int16, 512));
    config.auto_advance = true;
    config.buffer_budget = Some(buffers);
    let (device, controller) = MockDevice::new(config);

    let callbacks = Arc::new(AtomicUsize::new(0));
    let xruns = Arc::new(Mutex::new(CallbackFlags::empty()));
    let counter = Arc::clone(&callbacks);
    let xrun_sink = Arc::clone(&xruns);
    let mut sample_clock = 0.0f64;
    let callback: StreamCallback = Box::new(move |mut args| {
        counter.fetch_add(1, Ordering::SeqCst);
        *xrun_sink.lock().unwrap() |= args.flags & XRUN_FLAGS;
        let output = args.output.as_mut().unwrap();
        let frames = output.frames();
        let samples = output.samples_mut::<i16>();
        for frame in 0..frames {
            let phase = 2.0 * std::f64::consts::PI * 1_000.0 * sample_clock;
            let value = (16_384.0 * phase.sin()) as i16;
            samples[2 * frame] = value;
            samples[2 * frame + 1] = value;
            sample_clock += 1.0 / 48_000.0;
        }
        CallbackResult::Continue
    });

    let mut stream = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(2, SampleFormat::Int16)),
        48_000.0,
        512,
        StreamFlags::empty(),
        Some(callback),
    )
    .unwrap();

    stream.start().unwrap();
    assert!(controller.wait_submitted(buffers, Duration::from_secs(10)));
    stream.abort().unwrap();

    assert_eq!(callbacks.load(Ordering::SeqCst), buffers);
    assert_eq!(*xruns.lock().unwrap(), CallbackFlags::empty());

    let samples = i16_samples(&controller.collected_output());
    assert_eq!(samples.len(), buffers * 512 * 2);
    let power: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    let rms = (power / samples.len() as f64).sqrt();
    let expected = 16_384.0 / std::f64::consts::SQRT_2;
    assert!(
        (rms - expected).abs() / expected < 0.01,
        "RMS {rms} deviates from {expected}"
    );
}

// ---------------------------------------------------------------------------
// Scenario: float32 application over int16 host, clipping vs wrap-around
// ---------------------------------------------------------------------------

#[test]
fn out_of_range_float_clips_by_default() {
    init();
    let samples = run_constant_float(1.5, StreamFlags::empty());
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|&s| s == 0x7FFF));
}

#[test]
fn out_of_range_float_wraps_with_clip_off() {
    init();
    let samples = run_constant_float(1.5, StreamFlags::CLIP_OFF);
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|&s| s < 0));
}

fn run_constant_float(value: f32, flags: StreamFlags) -> Vec<i16> {
    let mut config = MockDeviceConfig::new(44_100.0);
    config.output = Some(MockEndpoint::new(1, SampleFormat::Int16, 1024));
    config.auto_advance = true;
    config.buffer_budget = Some(2);
    let (device, controller) = MockDevice::new(config);

    let callback: StreamCallback = Box::new(move |mut args| {
        args.output.as_mut().unwrap().samples_mut::<f32>().fill(value);
        CallbackResult::Continue
    });

    let mut stream = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(1, SampleFormat::Float32)),
        44_100.0,
        256,
        flags,
        Some(callback),
    )
    .unwrap();

    stream.start().unwrap();
    assert!(controller.wait_submitted(2, Duration::from_secs(5)));
    stream.abort().unwrap();
    i16_samples(&controller.collected_output())
}

// ---------------------------------------------------------------------------
// Scenario: adapting full duplex, app 100 against host 256
// ---------------------------------------------------------------------------

#[test]
fn adapting_full_duplex_frame_balance() {
    init();
    let mut config = MockDeviceConfig::new(48_000.0);
    config.input = Some(MockEndpoint::new(1, SampleFormat::Int16, 256));
    config.output = Some(MockEndpoint::new(1, SampleFormat::Int16, 256));
    let (device, controller) = MockDevice::new(config);

    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&callbacks);
    let callback: StreamCallback = Box::new(move |mut args| {
        assert_eq!(args.frames, 100);
        assert!(args.input.is_some());
        counter.fetch_add(1, Ordering::SeqCst);
        args.output.as_mut().unwrap().samples_mut::<f32>().fill(0.0);
        CallbackResult::Continue
    });

    let mut stream = open_stream(
        Box::new(device),
        Some(StreamParameters::new(1, SampleFormat::Float32)),
        Some(StreamParameters::new(1, SampleFormat::Float32)),
        48_000.0,
        100,
        StreamFlags::empty(),
        Some(callback),
    )
    .unwrap();

    stream.start().unwrap();
    for iteration in 0..25usize {
        controller.signal_capture(iteration % 2);
        controller.signal_render(iteration % 2);
        assert!(
            wait_until(Duration::from_secs(2), || {
                controller.released_capture_buffers() == iteration + 1
                    && controller.submitted_render_buffers() == iteration + 1
            }),
            "iteration {iteration} did not complete"
        );
    }
    stream.abort().unwrap();

    // 25 host buffers x 256 frames = 6400 frames -> exactly 64 callbacks.
    assert_eq!(callbacks.load(Ordering::SeqCst), 6_400 / 100);
    // Host input consumed equals host output produced.
    let produced = controller.collected_output().len() / 2;
    assert_eq!(produced, 25 * 256);
}

// ---------------------------------------------------------------------------
// Scenario: output underflow catch-up repeats the resumed buffer
// ---------------------------------------------------------------------------

#[test]
fn output_underflow_duplicates_resumed_buffer() {
    init();
    let mut config = MockDeviceConfig::new(48_000.0);
    config.output = Some(MockEndpoint::new(1, SampleFormat::Int16, 480));
    let (device, controller) = MockDevice::new(config);

    let invocations = Arc::new(Mutex::new(Vec::<CallbackFlags>::new()));
    let sink = Arc::clone(&invocations);
    let callback: StreamCallback = Box::new(move |mut args| {
        let mut seen = sink.lock().unwrap();
        let index = seen.len();
        seen.push(args.flags);
        drop(seen);
        let output = args.output.as_mut().unwrap();
        output.samples_mut::<i16>().fill(index as i16 + 1);
        CallbackResult::Continue
    });

    let mut stream = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(1, SampleFormat::Int16)),
        48_000.0,
        480,
        StreamFlags::empty(),
        Some(callback),
    )
    .unwrap();
    stream.start().unwrap();

    controller.signal_render(0);
    assert!(wait_until(Duration::from_secs(2), || {
        controller.submitted_render_buffers() == 1
    }));

    // The callback stalled long enough for both slots to empty at once.
    controller.signal_render_pair();
    assert!(wait_until(Duration::from_secs(2), || {
        controller.submitted_render_buffers() == 3
    }));
    stream.abort().unwrap();

    let seen = invocations.lock().unwrap();
    // Only one of the starved slots was refilled by the callback.
    assert_eq!(seen.len(), 2);
    assert!(!seen[0].contains(CallbackFlags::OUTPUT_UNDERFLOW));
    assert!(seen[1].contains(CallbackFlags::OUTPUT_UNDERFLOW));

    let samples = i16_samples(&controller.collected_output());
    assert_eq!(samples.len(), 3 * 480);
    assert!(samples[..480].iter().all(|&s| s == 1));
    // The remaining slots are byte-for-byte repeats of the resumed buffer.
    assert!(samples[480..960].iter().all(|&s| s == 2));
    assert!(samples[960..].iter().all(|&s| s == 2));
}

// ---------------------------------------------------------------------------
// Scenario: abort verdict mid-stream
// ---------------------------------------------------------------------------

#[test]
fn abort_verdict_stops_pins_and_finishes_once() {
    init();
    let mut config = MockDeviceConfig::new(48_000.0);
    config.output = Some(MockEndpoint::new(1, SampleFormat::Int16, 128));
    config.auto_advance = true;
    config.buffer_budget = Some(16);
    let (device, controller) = MockDevice::new(config);

    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&callbacks);
    let callback: StreamCallback = Box::new(move |mut args| {
        let index = counter.fetch_add(1, Ordering::SeqCst);
        args.output.as_mut().unwrap().samples_mut::<i16>().fill(7);
        if index == 1 {
            CallbackResult::Abort
        } else {
            CallbackResult::Continue
        }
    });

    let finishes = Arc::new(AtomicUsize::new(0));
    let finish_counter = Arc::clone(&finishes);

    let mut stream = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(1, SampleFormat::Int16)),
        48_000.0,
        128,
        StreamFlags::empty(),
        Some(callback),
    )
    .unwrap();
    stream
        .set_finished_callback(Some(Box::new(move || {
            finish_counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || !stream.is_active()));

    // Pins stopped before any post-abort buffer was submitted.
    assert_eq!(controller.stop_count(), 1);
    assert_eq!(controller.submitted_render_buffers(), 1);
    assert_eq!(finishes.load(Ordering::SeqCst), 1);

    // Balancing stop after self-termination neither errors nor re-fires
    // the finished hook.
    stream.stop().unwrap();
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
    assert!(stream.is_stopped());
}

// ---------------------------------------------------------------------------
// Scenario: callback-driven priming
// ---------------------------------------------------------------------------

#[test]
fn priming_fills_both_slots_before_pins_start() {
    init();
    let mut config = MockDeviceConfig::new(48_000.0);
    config.input = Some(MockEndpoint::new(1, SampleFormat::Int16, 1024));
    config.output = Some(MockEndpoint::new(1, SampleFormat::Int16, 1024));
    config.auto_advance = true;
    config.buffer_budget = Some(8);
    let (device, controller) = MockDevice::new(config);

    #[derive(Clone, Copy, Debug)]
    struct Record {
        had_input: bool,
        priming: bool,
    }
    let records = Arc::new(Mutex::new(Vec::<Record>::new()));
    let sink = Arc::clone(&records);
    let callback: StreamCallback = Box::new(move |mut args| {
        sink.lock().unwrap().push(Record {
            had_input: args.input.is_some(),
            priming: args.flags.contains(CallbackFlags::PRIMING_OUTPUT),
        });
        if let Some(output) = args.output.as_mut() {
            output.samples_mut::<i16>().fill(3);
        }
        CallbackResult::Continue
    });

    let mut stream = open_stream(
        Box::new(device),
        Some(StreamParameters::new(1, SampleFormat::Int16)),
        Some(StreamParameters::new(1, SampleFormat::Int16)),
        48_000.0,
        1024,
        StreamFlags::PRIME_OUTPUT_BUFFERS_USING_STREAM_CALLBACK,
        Some(callback),
    )
    .unwrap();

    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        controller.submitted_render_buffers() >= 2
    }));
    stream.abort().unwrap();

    // Both initial slots were filled by the callback before the pins ran.
    assert_eq!(controller.submitted_before_start(), 2);
    let records = records.lock().unwrap();
    assert!(records.len() >= 2);
    for record in &records[..2] {
        assert!(record.priming, "priming pass missing the priming flag");
        assert!(!record.had_input, "priming pass saw input");
    }
    if let Some(record) = records.get(2) {
        assert!(!record.priming);
    }
}

// ---------------------------------------------------------------------------
// Ordering: frames play in generation order
// ---------------------------------------------------------------------------

#[test]
fn output_plays_in_generation_order() {
    init();
    let buffers = 20;
    let mut config = MockDeviceConfig::new(48_000.0);
    config.output = Some(MockEndpoint::new(1, SampleFormat::Int16, 64));
    config.auto_advance = true;
    config.buffer_budget = Some(buffers);
    let (device, controller) = MockDevice::new(config);

    let mut next_value = 0i16;
    let callback: StreamCallback = Box::new(move |mut args| {
        let output = args.output.as_mut().unwrap();
        for sample in output.samples_mut::<i16>() {
            *sample = next_value;
            next_value = next_value.wrapping_add(1);
        }
        CallbackResult::Continue
    });

    let mut stream = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(1, SampleFormat::Int16)),
        48_000.0,
        64,
        StreamFlags::empty(),
        Some(callback),
    )
    .unwrap();
    stream.start().unwrap();
    assert!(controller.wait_submitted(buffers, Duration::from_secs(5)));
    stream.abort().unwrap();

    let samples = i16_samples(&controller.collected_output());
    assert_eq!(samples.len(), buffers * 64);
    for (index, &sample) in samples.iter().enumerate() {
        assert_eq!(sample, index as i16, "frame {index} out of order");
    }
}

// ---------------------------------------------------------------------------
// CPU load lifecycle
// ---------------------------------------------------------------------------

#[test]
fn cpu_load_is_zero_until_first_callback() {
    init();
    let mut config = MockDeviceConfig::new(48_000.0);
    config.output = Some(MockEndpoint::new(1, SampleFormat::Int16, 64));
    config.auto_advance = true;
    config.buffer_budget = Some(4);
    let (device, controller) = MockDevice::new(config);

    let callback: StreamCallback = Box::new(move |mut args| {
        args.output.as_mut().unwrap().samples_mut::<i16>().fill(0);
        CallbackResult::Continue
    });

    let mut stream = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(1, SampleFormat::Int16)),
        48_000.0,
        64,
        StreamFlags::empty(),
        Some(callback),
    )
    .unwrap();

    assert_eq!(stream.cpu_load(), 0.0);
    stream.start().unwrap();
    assert!(controller.wait_submitted(4, Duration::from_secs(5)));
    let load = stream.cpu_load();
    assert!(load >= 0.0, "load must be non-negative, got {load}");
    stream.abort().unwrap();
}

// ---------------------------------------------------------------------------
// Blocking read/write
// ---------------------------------------------------------------------------

#[test]
fn blocking_write_pushes_frames_to_device() {
    init();
    let mut config = MockDeviceConfig::new(48_000.0);
    config.output = Some(MockEndpoint::new(1, SampleFormat::Int16, 64));
    config.auto_advance = true;
    config.buffer_budget = Some(8);
    let (device, controller) = MockDevice::new(config);

    let mut stream = open_stream(
        Box::new(device),
        None,
        Some(StreamParameters::new(1, SampleFormat::Float32)),
        48_000.0,
        0,
        StreamFlags::DITHER_OFF, // exact sample values below
        None,
    )
    .unwrap();
    stream.start().unwrap();

    stream.write_samples(&[0.5f32; 256]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        controller.submitted_render_buffers() >= 4
    }));
    stream.stop().unwrap();

    let samples = i16_samples(&controller.collected_output());
    assert!(samples.len() >= 256);
    assert!(samples[..256].iter().all(|&s| s == 16_384));
}

#[test]
fn blocking_read_delivers_capture_data() {
    init();
    let mut config = MockDeviceConfig::new(48_000.0);
    config.input = Some(MockEndpoint::new(1, SampleFormat::Int16, 64));
    config.auto_advance = true;
    config.buffer_budget = Some(8);
    let (device, controller) = MockDevice::new(config);

    // Continuous ramp across buffers so ordering losses are visible.
    let mut next = 0i16;
    controller.set_capture_source(move |buffer| {
        for pair in buffer.chunks_exact_mut(2) {
            pair.copy_from_slice(&next.to_ne_bytes());
            next = next.wrapping_add(1);
        }
    });

    let mut stream = open_stream(
        Box::new(device),
        Some(StreamParameters::new(1, SampleFormat::Int16)),
        None,
        48_000.0,
        0,
        StreamFlags::empty(),
        None,
    )
    .unwrap();
    stream.start().unwrap();

    let mut buffer = [0i16; 128];
    stream.read_samples(&mut buffer).unwrap();
    for (index, &sample) in buffer.iter().enumerate() {
        assert_eq!(sample, index as i16);
    }
    stream.abort().unwrap();
}
