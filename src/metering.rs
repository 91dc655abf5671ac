//! Audio level metering
//!
//! Each handler owns one accumulator per source and folds post-gain
//! samples into it from the audio callback. Emission is throttled to a
//! 50 ms window (~20 Hz), which is plenty for UI meters.

use crate::events::{EngineEvent, EventBus, LevelSource};
use std::time::{Duration, Instant};

/// Minimum interval between two level events for one source
pub const EMIT_INTERVAL: Duration = Duration::from_millis(50);

/// Per-source accumulator: peak, sum of squares, count, clip flag
pub struct MeterAccumulator {
    source: LevelSource,
    peak: f32,
    sum_sq: f64,
    count: u64,
    clipped: bool,
    last_emit: Instant,
}

impl MeterAccumulator {
    pub fn new(source: LevelSource) -> Self {
        Self {
            source,
            peak: 0.0,
            sum_sq: 0.0,
            count: 0,
            clipped: false,
            last_emit: Instant::now(),
        }
    }

    /// Fold one block of post-gain samples into the accumulator.
    pub fn fold_block(&mut self, samples: &[f32], gain: f32) {
        for &s in samples {
            let v = s * gain;
            let mag = v.abs();
            if mag > self.peak {
                self.peak = mag;
            }
            if mag > 1.0 {
                self.clipped = true;
            }
            self.sum_sq += (v as f64) * (v as f64);
        }
        self.count += samples.len() as u64;
    }

    /// Emit a `LevelChanged` event if the window has expired and there is
    /// data, then reset. Called once per callback block.
    pub fn maybe_emit(&mut self, events: &EventBus) {
        if self.count == 0 || self.last_emit.elapsed() < EMIT_INTERVAL {
            return;
        }
        let rms = (self.sum_sq / self.count as f64).sqrt() as f32;
        events.emit(EngineEvent::LevelChanged {
            source: self.source,
            rms: rms.min(1.0),
            peak: self.peak.min(1.0),
            clipped: self.clipped,
        });
        self.reset();
    }

    pub fn reset(&mut self) {
        self.peak = 0.0;
        self.sum_sq = 0.0;
        self.count = 0;
        self.clipped = false;
        self.last_emit = Instant::now();
    }
}

/// Linear amplitude expressed in dBFS. Silence (and any non-positive
/// input) maps to negative infinity rather than a NaN.
pub fn amplitude_to_db(amplitude: f32) -> f32 {
    match amplitude {
        a if a <= 0.0 => f32::NEG_INFINITY,
        a => 20.0 * a.log10(),
    }
}

/// Inverse of [`amplitude_to_db`].
pub fn db_to_amplitude(db: f32) -> f32 {
    10f32.powf(db * 0.05)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_accumulates_peak_and_rms() {
        let mut meter = MeterAccumulator::new(LevelSource::Mic);
        meter.fold_block(&[0.5, -0.8, 0.1], 1.0);

        assert_eq!(meter.count, 3);
        assert!((meter.peak - 0.8).abs() < 1e-6);
        assert!(!meter.clipped);

        let rms = (meter.sum_sq / 3.0).sqrt();
        let expected = ((0.25 + 0.64 + 0.01) / 3.0_f64).sqrt();
        assert!((rms - expected).abs() < 1e-6);
    }

    #[test]
    fn test_gain_applied_before_fold() {
        let mut meter = MeterAccumulator::new(LevelSource::System);
        meter.fold_block(&[0.6], 2.0);
        assert!((meter.peak - 1.2).abs() < 1e-6);
        assert!(meter.clipped);
    }

    #[test]
    fn test_no_emit_inside_window() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let mut meter = MeterAccumulator::new(LevelSource::Mic);
        meter.fold_block(&[0.5; 128], 1.0);
        // Window has not expired yet
        meter.maybe_emit(&bus);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_after_window_and_reset() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let mut meter = MeterAccumulator::new(LevelSource::System);
        meter.fold_block(&[0.5; 64], 1.0);
        meter.last_emit = Instant::now() - Duration::from_millis(60);

        meter.maybe_emit(&bus);
        match rx.try_recv().unwrap() {
            EngineEvent::LevelChanged {
                source, rms, peak, ..
            } => {
                assert_eq!(source, LevelSource::System);
                assert!((rms - 0.5).abs() < 1e-3);
                assert!((peak - 0.5).abs() < 1e-6);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(meter.count, 0);
        assert_eq!(meter.peak, 0.0);
    }

    #[test]
    fn test_empty_window_never_emits() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let mut meter = MeterAccumulator::new(LevelSource::Mic);
        meter.last_emit = Instant::now() - Duration::from_millis(500);
        meter.maybe_emit(&bus);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_db_conversions() {
        assert!((amplitude_to_db(1.0) - 0.0).abs() < 0.001);
        assert!((amplitude_to_db(0.5) - (-6.02)).abs() < 0.1);
        assert!((db_to_amplitude(-6.02) - 0.5).abs() < 0.01);
        assert_eq!(amplitude_to_db(0.0), -f32::INFINITY);
    }
}
