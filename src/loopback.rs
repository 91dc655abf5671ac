//! Loopback (system audio) handler
//!
//! Runs on the loopback device's callback thread. The loopback stream
//! defines the canonical format and drives the session clock: each block
//! stamps the liveness tick, writes the raw system audio, pulls the
//! matching span of mic samples out of the ring, and assembles the mix.
//! Nothing here blocks beyond the ring's critical section, and nothing
//! allocates once the scratch buffers have warmed up.

use crate::dsp::{self, Format};
use crate::events::LevelSource;
use crate::metering::MeterAccumulator;
use crate::shared::EngineShared;
use crate::writer::Target;
use std::sync::Arc;

/// Emit a backlog diagnostic every this many loopback blocks
const DIAG_INTERVAL_BLOCKS: u64 = 50;

pub(crate) struct LoopbackHandler {
    shared: Arc<EngineShared>,
    canonical: Format,
    meter: MeterAccumulator,
    mic_scratch: Vec<f32>,
    mix_scratch: Vec<f32>,
    blocks: u64,
}

impl LoopbackHandler {
    pub(crate) fn new(shared: Arc<EngineShared>, canonical: Format) -> Self {
        Self {
            shared,
            canonical,
            meter: MeterAccumulator::new(LevelSource::System),
            mic_scratch: Vec::with_capacity(8192),
            mix_scratch: Vec::with_capacity(8192),
            blocks: 0,
        }
    }

    /// Process one canonical-format block of system audio.
    pub(crate) fn on_block(&mut self, input: &[f32]) {
        self.shared.touch_loopback();

        let loop_gain = self.shared.loopback_gain();
        self.meter.fold_block(input, loop_gain);
        self.meter.maybe_emit(&self.shared.events);

        if !self.shared.is_recording() || input.is_empty() {
            return;
        }
        let Some(rec) = self.shared.active_recording() else {
            return;
        };

        // Raw system write; gain shapes the meter and mix only
        let mut buf = self.shared.pool.rent(input.len() * 2);
        dsp::quantize_i16_dither(input, &mut buf);
        rec.enqueue(&self.shared.pool, Target::System, buf);

        // Pull the matching mic span; zero-fill whatever the ring is short
        self.mic_scratch.resize(input.len(), 0.0);
        let (delivered, backlog) = {
            let mut ring = self.shared.ring.lock();
            let backlog = ring.backlog_samples();
            let delivered = ring.pop(&mut self.mic_scratch);
            (delivered, backlog)
        };
        rec.note_backlog(backlog as u64);
        if delivered < input.len() {
            self.mic_scratch[delivered..].fill(0.0);
            rec.note_underrun();
        }

        let mic_gain = self.shared.mic_gain();
        self.mix_scratch.resize(input.len(), 0.0);
        dsp::mix_block(
            &mut self.mix_scratch,
            input,
            &self.mic_scratch,
            loop_gain,
            mic_gain,
        );
        let mut buf = self.shared.pool.rent(input.len() * 4);
        dsp::quantize_i32(&self.mix_scratch, &mut buf);
        rec.enqueue(&self.shared.pool, Target::Mix, buf);

        self.blocks += 1;
        if self.blocks % DIAG_INTERVAL_BLOCKS == 0 {
            let per_sec = (self.canonical.sample_rate as usize * self.canonical.channels).max(1);
            let backlog_s = backlog as f64 / per_sec as f64;
            let peak_s = rec.peak_backlog_samples.load(std::sync::atomic::Ordering::Relaxed)
                as f64
                / per_sec as f64;
            rec.log.info(
                "loopback",
                &format!(
                    "block {}: mic backlog {:.3}s (peak {:.3}s)",
                    self.blocks, backlog_s, peak_s
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::session_log::SessionLog;
    use crate::shared::ActiveRecording;
    use crate::writer::Job;
    use crossbeam_channel::{bounded, Receiver};
    use std::sync::atomic::Ordering;

    const FMT: Format = Format {
        sample_rate: 48_000,
        channels: 2,
    };

    fn recording_session(queue_cap: usize) -> (Arc<EngineShared>, Receiver<Job>) {
        let shared = Arc::new(EngineShared::new(EventBus::new()));
        let (tx, rx) = bounded(queue_cap);
        *shared.active.write() = Some(Arc::new(ActiveRecording::new(
            tx,
            SessionLog::disabled(),
        )));
        shared.set_recording(true);
        (shared, rx)
    }

    fn decode_i16(job: &Job) -> Vec<i16> {
        job.bytes[..job.len]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn decode_i32(job: &Job) -> Vec<i32> {
        job.bytes[..job.len]
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_block_produces_system_and_mix_jobs() {
        let (shared, rx) = recording_session(16);
        let mut handler = LoopbackHandler::new(shared, FMT);

        handler.on_block(&[0.5; 480]);

        let sys = rx.try_recv().unwrap();
        assert_eq!(sys.target, Target::System);
        assert_eq!(sys.len, 480 * 2);

        let mix = rx.try_recv().unwrap();
        assert_eq!(mix.target, Target::Mix);
        assert_eq!(mix.len, 480 * 4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_system_file_gets_raw_audio_mix_gets_gained() {
        let (shared, rx) = recording_session(16);
        shared.set_loopback_gain(2.0);
        let mut handler = LoopbackHandler::new(shared, FMT);

        // -6 dBFS tone sample, empty ring
        handler.on_block(&[0.5; 4]);

        let sys = decode_i16(&rx.try_recv().unwrap());
        // Raw 0.5, within dither of 16384
        assert!((sys[0] as i32 - 16384).abs() <= 2);

        let mix = decode_i32(&rx.try_recv().unwrap());
        // 0.5 * (0.5 * 2.0 + 0) = 0.5 of full scale
        let expected = (0.5 * i32::MAX as f64).round() as i32;
        assert!((mix[0] as i64 - expected as i64).abs() <= 1);
    }

    #[test]
    fn test_underrun_zero_fills_and_counts() {
        let (shared, rx) = recording_session(16);
        // Only 2 mic samples buffered for a 4-sample block
        shared.ring.lock().push(&[0.8, 0.8]);
        let mut handler = LoopbackHandler::new(shared.clone(), FMT);

        handler.on_block(&[0.0; 4]);

        let _sys = rx.try_recv().unwrap();
        let mix = decode_i32(&rx.try_recv().unwrap());
        // First two mix samples carry mic audio, the deficit is silence
        assert!(mix[0] != 0 && mix[1] != 0);
        assert_eq!(&mix[2..], &[0, 0]);

        let rec = shared.active_recording().unwrap();
        assert_eq!(rec.underruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_not_recording_skips_queue_but_meters() {
        let (shared, rx) = recording_session(16);
        shared.set_recording(false);
        let mut handler = LoopbackHandler::new(shared.clone(), FMT);

        handler.on_block(&[0.3; 64]);
        assert!(rx.try_recv().is_err());
        // Liveness still stamped while merely monitoring
        assert!(!shared.loopback_silent(200));
    }

    #[test]
    fn test_full_queue_drops_and_returns_buffers() {
        let (shared, _rx) = recording_session(1);
        let mut handler = LoopbackHandler::new(shared.clone(), FMT);

        handler.on_block(&[0.1; 32]);

        let rec = shared.active_recording().unwrap();
        // System job filled the queue; the mix job was dropped
        assert_eq!(rec.dropped_blocks.load(Ordering::Relaxed), 1);
        assert_eq!(shared.pool.idle_count(), 1);
    }

    #[test]
    fn test_mix_soft_clip_bound() {
        let (shared, rx) = recording_session(16);
        shared.set_loopback_gain(8.0);
        shared.ring.lock().push(&[1.0; 16]);
        shared.set_mic_gain(8.0);
        let mut handler = LoopbackHandler::new(shared, FMT);

        handler.on_block(&[1.0; 16]);

        let _sys = rx.try_recv().unwrap();
        let mix = decode_i32(&rx.try_recv().unwrap());
        // 0.5 * (8 + 8) = 8.0 saturates to exactly full scale
        for s in mix {
            assert_eq!(s, i32::MAX);
        }
    }
}
