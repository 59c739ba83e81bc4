//! CPU-load measurement for stream callbacks.
//!
//! Load is the ratio of wall-clock time spent inside one processing pass to
//! the audio time that pass produced (`frames × sample period`). A value of
//! 1.0 means the callback is only just keeping up; above 1.0 it is falling
//! behind. Readings are folded into an exponentially weighted moving
//! average so one slow pass does not dominate.

use std::time::Instant;

/// Smoothing factor for the load average. At typical callback rates the
/// average settles over roughly the last second of callbacks.
const SMOOTHING: f64 = 0.9;

/// Per-stream CPU-load meter.
///
/// Not thread-safe; owned and driven by the stream's processing loop, which
/// brackets each buffer-processor pass with [`begin`](CpuLoadMeasurer::begin)
/// and [`end`](CpuLoadMeasurer::end). Blocking streams never drive one, so
/// their load reads as zero.
#[derive(Debug)]
pub struct CpuLoadMeasurer {
    sample_period: f64,
    average_load: f64,
    measurement_start: Option<Instant>,
}

impl CpuLoadMeasurer {
    /// Create a meter for a stream running at `sample_rate` Hz.
    #[must_use]
    pub fn new(sample_rate: f64) -> CpuLoadMeasurer {
        CpuLoadMeasurer {
            sample_period: 1.0 / sample_rate,
            average_load: 0.0,
            measurement_start: None,
        }
    }

    /// Clear the average; called when a stream restarts.
    pub fn reset(&mut self) {
        self.average_load = 0.0;
        self.measurement_start = None;
    }

    /// Mark the start of a processing pass.
    pub fn begin(&mut self) {
        self.measurement_start = Some(Instant::now());
    }

    /// Mark the end of a processing pass that produced `frames` frames.
    ///
    /// Passes that produced nothing (or that were never begun) leave the
    /// average untouched.
    pub fn end(&mut self, frames: usize) {
        let Some(start) = self.measurement_start.take() else {
            return;
        };
        if frames == 0 {
            return;
        }
        let elapsed = start.elapsed().as_secs_f64();
        let audio_seconds = frames as f64 * self.sample_period;
        let measured = elapsed / audio_seconds;
        self.average_load = SMOOTHING * self.average_load + (1.0 - SMOOTHING) * measured;
    }

    /// The smoothed load. Zero on a freshly created or reset meter until
    /// the first pass completes.
    #[must_use]
    pub fn current_load(&self) -> f64 {
        self.average_load
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fresh_meter_reads_zero() {
        let meter = CpuLoadMeasurer::new(48_000.0);
        assert_eq!(meter.current_load(), 0.0);
    }

    #[test]
    fn end_without_begin_is_ignored() {
        let mut meter = CpuLoadMeasurer::new(48_000.0);
        meter.end(512);
        assert_eq!(meter.current_load(), 0.0);
    }

    #[test]
    fn zero_frames_leaves_average_untouched() {
        let mut meter = CpuLoadMeasurer::new(48_000.0);
        meter.begin();
        meter.end(0);
        assert_eq!(meter.current_load(), 0.0);
    }

    #[test]
    fn load_is_nonnegative_and_tracks_work() {
        let mut meter = CpuLoadMeasurer::new(48_000.0);
        // 480 frames at 48 kHz is 10 ms of audio; sleeping ~5 ms inside the
        // pass should register a load well above zero and below ~1.
        for _ in 0..20 {
            meter.begin();
            thread::sleep(Duration::from_millis(5));
            meter.end(480);
        }
        let load = meter.current_load();
        assert!(load > 0.05, "load too low: {load}");
        assert!(load < 2.0, "load implausibly high: {load}");
    }

    #[test]
    fn reset_clears_average() {
        let mut meter = CpuLoadMeasurer::new(48_000.0);
        meter.begin();
        thread::sleep(Duration::from_millis(2));
        meter.end(64);
        assert!(meter.current_load() > 0.0);
        meter.reset();
        assert_eq!(meter.current_load(), 0.0);
    }
}
