//! Post-session MP3 encoding
//!
//! Runs after the WAV writers have finalized: reads the 32-bit mix file,
//! narrows to 16-bit on the fly, and feeds lame in chunks of at most
//! 64 KiB of PCM, emitting a progress event per chunk. Cancellation is
//! cooperative; a cancelled encode leaves a partial but playable MP3.

use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;
use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, InterleavedPcm, MonoPcm};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 64 KiB of 16-bit PCM per encoder feed
const CHUNK_SAMPLES: usize = 64 * 1024 / 2;

/// Cooperative cancellation flag, cloneable across threads.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Map a requested kbps value onto the nearest lame CBR step.
/// Callers clamp to [64, 320] at the API boundary first.
pub(crate) fn nearest_bitrate(kbps: u32) -> Bitrate {
    const STEPS: [(u32, Bitrate); 10] = [
        (64, Bitrate::Kbps64),
        (80, Bitrate::Kbps80),
        (96, Bitrate::Kbps96),
        (112, Bitrate::Kbps112),
        (128, Bitrate::Kbps128),
        (160, Bitrate::Kbps160),
        (192, Bitrate::Kbps192),
        (224, Bitrate::Kbps224),
        (256, Bitrate::Kbps256),
        (320, Bitrate::Kbps320),
    ];
    let mut best = STEPS[0];
    for step in STEPS {
        if step.0.abs_diff(kbps) < best.0.abs_diff(kbps) {
            best = step;
        }
    }
    best.1
}

/// Encode the finished mix WAV into an MP3 next to it.
///
/// Returns `Ok(true)` on a complete encode, `Ok(false)` if cancelled
/// part-way (partial file left in place).
pub(crate) fn encode_mix(
    mix_path: &Path,
    mp3_path: &Path,
    bitrate_kbps: u32,
    cancel: &CancelToken,
    events: &EventBus,
) -> EngineResult<bool> {
    let mut reader = hound::WavReader::open(mix_path)?;
    let spec = reader.spec();
    if spec.bits_per_sample != 32 {
        return Err(EngineError::Encode(format!(
            "expected 32-bit mix file, found {}-bit",
            spec.bits_per_sample
        )));
    }
    let channels = spec.channels as usize;
    let total_samples = reader.len() as u64;

    let mut builder =
        Builder::new().ok_or_else(|| EngineError::Encode("lame initialisation failed".into()))?;
    builder
        .set_num_channels(channels as u8)
        .map_err(|e| EngineError::Encode(format!("channels: {:?}", e)))?;
    builder
        .set_sample_rate(spec.sample_rate)
        .map_err(|e| EngineError::Encode(format!("sample rate: {:?}", e)))?;
    builder
        .set_brate(nearest_bitrate(bitrate_kbps))
        .map_err(|e| EngineError::Encode(format!("bitrate: {:?}", e)))?;
    builder
        .set_quality(mp3lame_encoder::Quality::Good)
        .map_err(|e| EngineError::Encode(format!("quality: {:?}", e)))?;
    let mut encoder = builder
        .build()
        .map_err(|e| EngineError::Encode(format!("build: {:?}", e)))?;

    let mut out = BufWriter::new(File::create(mp3_path)?);
    let mut pcm: Vec<i16> = Vec::with_capacity(CHUNK_SAMPLES);
    let mut mp3_buf: Vec<u8> = Vec::new();
    let mut samples_done: u64 = 0;
    let mut completed = true;

    let mut iter = reader.samples::<i32>();
    loop {
        if cancel.is_cancelled() {
            completed = false;
            break;
        }

        pcm.clear();
        for sample in iter.by_ref().take(CHUNK_SAMPLES) {
            pcm.push((sample? >> 16) as i16);
        }
        if pcm.is_empty() {
            break;
        }

        let frames = pcm.len() / channels.max(1);
        mp3_buf.clear();
        mp3_buf.reserve(mp3lame_encoder::max_required_buffer_size(frames));
        let written = if channels == 1 {
            encoder.encode(MonoPcm(&pcm), mp3_buf.spare_capacity_mut())
        } else {
            encoder.encode(InterleavedPcm(&pcm), mp3_buf.spare_capacity_mut())
        }
        .map_err(|e| EngineError::Encode(format!("encode: {:?}", e)))?;
        // Safety: lame wrote exactly `written` bytes into the reserved
        // spare capacity.
        unsafe { mp3_buf.set_len(written) };
        out.write_all(&mp3_buf)?;

        samples_done += pcm.len() as u64;
        if total_samples > 0 {
            events.encoding_progress((samples_done * 100 / total_samples) as u8);
        }
    }

    mp3_buf.clear();
    mp3_buf.reserve(mp3lame_encoder::max_required_buffer_size(CHUNK_SAMPLES));
    let written = encoder
        .flush::<FlushNoGap>(mp3_buf.spare_capacity_mut())
        .map_err(|e| EngineError::Encode(format!("flush: {:?}", e)))?;
    unsafe { mp3_buf.set_len(written) };
    out.write_all(&mp3_buf)?;
    out.flush()?;

    if completed {
        events.encoding_progress(100);
    }
    Ok(completed)
}
