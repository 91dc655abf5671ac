//! Microphone handler
//!
//! Runs on the mic device's callback thread. Converts each native block
//! to the canonical format, feeds the ring the loopback handler mixes
//! from, and writes the raw mic file. When the loopback side has gone
//! quiet the mic handler takes over the session clock: it clears the ring
//! (buffered samples would replay as echo once loopback resumes) and
//! writes a zero system block plus a mic-only mix block of equal length,
//! so mic-only sessions still produce three aligned files.

use crate::dsp::{self, Format};
use crate::events::LevelSource;
use crate::metering::MeterAccumulator;
use crate::shared::EngineShared;
use crate::writer::Target;
use std::sync::Arc;

/// Loopback is considered silent after this long without a callback.
pub(crate) const SILENCE_THRESHOLD_MS: u64 = 200;

pub(crate) struct MicHandler {
    shared: Arc<EngineShared>,
    source: Format,
    canonical: Format,
    meter: MeterAccumulator,
    resample_scratch: Vec<f32>,
    converted: Vec<f32>,
    mix_scratch: Vec<f32>,
}

impl MicHandler {
    pub(crate) fn new(shared: Arc<EngineShared>, source: Format, canonical: Format) -> Self {
        Self {
            shared,
            source,
            canonical,
            meter: MeterAccumulator::new(LevelSource::Mic),
            resample_scratch: Vec::with_capacity(8192),
            converted: Vec::with_capacity(8192),
            mix_scratch: Vec::with_capacity(8192),
        }
    }

    /// Process one native-format block of mic audio.
    pub(crate) fn on_block(&mut self, input: &[f32]) {
        dsp::resample_remap(
            input,
            self.source,
            self.canonical,
            &mut self.resample_scratch,
            &mut self.converted,
        );

        let mic_gain = self.shared.mic_gain();
        self.meter.fold_block(&self.converted, mic_gain);
        self.meter.maybe_emit(&self.shared.events);

        if !self.shared.is_recording() || self.converted.is_empty() {
            return;
        }
        let Some(rec) = self.shared.active_recording() else {
            return;
        };

        let silent = self.shared.loopback_silent(SILENCE_THRESHOLD_MS);
        if silent {
            // Anything buffered is stale; mixing it after loopback resumes
            // would double-expose the mic.
            self.shared.ring.lock().clear();
        } else {
            let mut ring = self.shared.ring.lock();
            if ring.capacity() < self.converted.len() {
                ring.grow(self.converted.len());
            }
            ring.push(&self.converted);
        }

        // Raw mic write; gain shapes the meter and mix only
        let mut buf = self.shared.pool.rent(self.converted.len() * 2);
        dsp::quantize_i16_dither(&self.converted, &mut buf);
        rec.enqueue(&self.shared.pool, Target::Mic, buf);

        if silent {
            // Mic-driven fallback keeps the trio aligned: a literal zero
            // system block (true digital silence, no dither) and a
            // mic-only mix block of the same length.
            let zeros = self.shared.pool.rent(self.converted.len() * 2);
            rec.enqueue(&self.shared.pool, Target::System, zeros);

            self.mix_scratch.resize(self.converted.len(), 0.0);
            dsp::mix_block_mic_only(&mut self.mix_scratch, &self.converted, mic_gain);
            let mut buf = self.shared.pool.rent(self.converted.len() * 4);
            dsp::quantize_i32(&self.mix_scratch, &mut buf);
            rec.enqueue(&self.shared.pool, Target::Mix, buf);
        }
    }
}
