//! DSP kernels
//!
//! Everything audio passes through on its way to disk: linear resampling
//! with channel remapping into the canonical format, tanh soft-clipping on
//! the mix path, TPDF-dithered 16-bit quantization for the raw files, and
//! plain 32-bit quantization for the mix. Speech fidelity is the target;
//! linear interpolation is deliberate.

use rand::Rng;

/// Sample layout of a stream: rate in Hz, interleaved channel count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub sample_rate: u32,
    pub channels: usize,
}

impl Format {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

/// Resample `input` from `src` to `dst` layout into `out`.
///
/// Resampling happens first, on the source channel layout, using linear
/// interpolation; channels are remapped afterwards. `scratch` and `out`
/// are caller-owned so steady-state calls do not allocate once the
/// buffers have reached their working size.
pub fn resample_remap(
    input: &[f32],
    src: Format,
    dst: Format,
    scratch: &mut Vec<f32>,
    out: &mut Vec<f32>,
) {
    let src_ch = src.channels.max(1);
    let in_frames = input.len() / src_ch;

    let resampled: &[f32] = if src.sample_rate == dst.sample_rate {
        input
    } else {
        let ratio = src.sample_rate as f64 / dst.sample_rate as f64;
        let out_frames = (in_frames as f64 * dst.sample_rate as f64 / src.sample_rate as f64)
            as usize;
        scratch.clear();
        scratch.resize(out_frames * src_ch, 0.0);
        if in_frames > 0 {
            for f in 0..out_frames {
                let pos = f as f64 * ratio;
                let i0 = (pos as usize).min(in_frames - 1);
                let i1 = (i0 + 1).min(in_frames - 1);
                let t = (pos - i0 as f64) as f32;
                for c in 0..src_ch {
                    let a = input[i0 * src_ch + c];
                    let b = input[i1 * src_ch + c];
                    scratch[f * src_ch + c] = (1.0 - t) * a + t * b;
                }
            }
        }
        scratch
    };

    remap_channels(resampled, src_ch, dst.channels.max(1), out);
}

/// Remap interleaved `input` with `src_ch` channels to `dst_ch` channels.
///
/// mono -> stereo duplicates, stereo -> mono averages, same-count copies;
/// for anything else, missing source channels clamp to the last one.
pub fn remap_channels(input: &[f32], src_ch: usize, dst_ch: usize, out: &mut Vec<f32>) {
    let frames = input.len() / src_ch;
    out.clear();
    out.resize(frames * dst_ch, 0.0);

    match (src_ch, dst_ch) {
        (s, d) if s == d => out.copy_from_slice(&input[..frames * s]),
        (1, 2) => {
            for f in 0..frames {
                let v = input[f];
                out[f * 2] = v;
                out[f * 2 + 1] = v;
            }
        }
        (2, 1) => {
            for f in 0..frames {
                out[f] = (input[f * 2] + input[f * 2 + 1]) * 0.5;
            }
        }
        (s, d) => {
            for f in 0..frames {
                for c in 0..d {
                    out[f * d + c] = input[f * s + c.min(s - 1)];
                }
            }
        }
    }
}

/// Tanh soft-clip: pass-through inside [-1, 1], saturate beyond.
#[inline]
pub fn soft_clip(sample: f32) -> f32 {
    if sample.abs() > 1.0 {
        sample.tanh().clamp(-1.0, 1.0)
    } else {
        sample
    }
}

/// Assemble one mix block: equal-weight sum at -6 dB headroom, soft-clipped.
///
/// `dst`, `loopback`, and `mic` must be the same length.
#[inline]
pub fn mix_block(dst: &mut [f32], loopback: &[f32], mic: &[f32], loop_gain: f32, mic_gain: f32) {
    for ((d, &l), &m) in dst.iter_mut().zip(loopback).zip(mic) {
        *d = soft_clip(0.5 * (l * loop_gain + m * mic_gain));
    }
}

/// Mic-only variant of [`mix_block`] used while loopback is silent.
#[inline]
pub fn mix_block_mic_only(dst: &mut [f32], mic: &[f32], mic_gain: f32) {
    for (d, &m) in dst.iter_mut().zip(mic) {
        *d = soft_clip(0.5 * m * mic_gain);
    }
}

/// Quantize to 16-bit little-endian with TPDF dither.
///
/// The dither is the difference of two independent uniform draws from the
/// calling thread's RNG, so quantization error is decorrelated from the
/// signal. `out` must be `2 * samples.len()` bytes.
pub fn quantize_i16_dither(samples: &[f32], out: &mut [u8]) {
    debug_assert_eq!(out.len(), samples.len() * 2);
    let mut rng = rand::thread_rng();
    for (s, chunk) in samples.iter().zip(out.chunks_exact_mut(2)) {
        let scaled = s.clamp(-1.0, 1.0) * 32767.0;
        let dither: f32 = rng.gen::<f32>() - rng.gen::<f32>();
        let q = (scaled + dither)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        chunk.copy_from_slice(&q.to_le_bytes());
    }
}

/// Quantize to 32-bit little-endian, no dither.
///
/// Scaling goes through f64 so +1.0 lands exactly on `i32::MAX` instead of
/// overflowing.
pub fn quantize_i32(samples: &[f32], out: &mut [u8]) {
    debug_assert_eq!(out.len(), samples.len() * 4);
    for (s, chunk) in samples.iter().zip(out.chunks_exact_mut(4)) {
        let scaled = (s.clamp(-1.0, 1.0) as f64 * i32::MAX as f64).round();
        let q = scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32;
        chunk.copy_from_slice(&q.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i16_at(bytes: &[u8], idx: usize) -> i16 {
        i16::from_le_bytes([bytes[idx * 2], bytes[idx * 2 + 1]])
    }

    fn i32_at(bytes: &[u8], idx: usize) -> i32 {
        i32::from_le_bytes([
            bytes[idx * 4],
            bytes[idx * 4 + 1],
            bytes[idx * 4 + 2],
            bytes[idx * 4 + 3],
        ])
    }

    #[test]
    fn test_resample_unity_ratio_is_identity() {
        let src = Format::new(48_000, 2);
        let input = vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3];
        let mut scratch = Vec::new();
        let mut out = Vec::new();
        resample_remap(&input, src, src, &mut scratch, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn test_resample_halves_frame_count() {
        let input: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let mut scratch = Vec::new();
        let mut out = Vec::new();
        resample_remap(
            &input,
            Format::new(48_000, 1),
            Format::new(24_000, 1),
            &mut scratch,
            &mut out,
        );
        assert_eq!(out.len(), 50);
        // Linear interpolation of a ramp is still a ramp
        assert!((out[10] - input[20]).abs() < 1e-6);
    }

    #[test]
    fn test_resample_upsamples_monotonic_ramp() {
        let input: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let mut scratch = Vec::new();
        let mut out = Vec::new();
        resample_remap(
            &input,
            Format::new(16_000, 1),
            Format::new(48_000, 1),
            &mut scratch,
            &mut out,
        );
        assert_eq!(out.len(), 30);
        for w in out.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn test_mono_stereo_mono_identity() {
        let mono = vec![0.5, -0.25, 0.125, 0.0];
        let mut stereo = Vec::new();
        remap_channels(&mono, 1, 2, &mut stereo);
        assert_eq!(stereo, vec![0.5, 0.5, -0.25, -0.25, 0.125, 0.125, 0.0, 0.0]);

        let mut back = Vec::new();
        remap_channels(&stereo, 2, 1, &mut back);
        assert_eq!(back, mono);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let stereo = vec![1.0, 0.0, 0.5, -0.5];
        let mut mono = Vec::new();
        remap_channels(&stereo, 2, 1, &mut mono);
        assert_eq!(mono, vec![0.5, 0.0]);
    }

    #[test]
    fn test_extra_channels_clamp_to_last() {
        // 3 channels in, 4 out: the 4th copies the 3rd
        let input = vec![0.1, 0.2, 0.3];
        let mut out = Vec::new();
        remap_channels(&input, 3, 4, &mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.3]);
    }

    #[test]
    fn test_soft_clip_passthrough_and_bound() {
        assert_eq!(soft_clip(0.5), 0.5);
        assert_eq!(soft_clip(-0.99), -0.99);
        assert_eq!(soft_clip(1.0), 1.0);

        for x in [1.1_f32, 2.0, 10.0, -1.1, -5.0] {
            let y = soft_clip(x);
            assert!(y.abs() <= 1.0, "soft_clip({}) = {} exceeds unity", x, y);
            assert_eq!(y.signum(), x.signum());
        }
    }

    #[test]
    fn test_mix_block_applies_gains_and_headroom() {
        let loopback = [0.8, -0.8];
        let mic = [0.4, 0.4];
        let mut out = [0.0; 2];
        mix_block(&mut out, &loopback, &mic, 1.0, 1.0);
        assert!((out[0] - 0.6).abs() < 1e-6);
        assert!((out[1] - (-0.2)).abs() < 1e-6);
    }

    #[test]
    fn test_mix_never_exceeds_unity() {
        let hot = [1.0_f32; 64];
        let mut out = [0.0; 64];
        mix_block(&mut out, &hot, &hot, 4.0, 4.0);
        for s in out {
            assert!(s.abs() <= 1.0);
        }
    }

    #[test]
    fn test_quantize_i16_full_scale_no_wraparound() {
        let samples = [1.0_f32, -1.0, 2.5, -3.0];
        let mut out = [0u8; 8];
        quantize_i16_dither(&samples, &mut out);
        // Dither is at most ±1 LSB before the final clamp
        assert!(i16_at(&out, 0) >= 32766);
        assert!(i16_at(&out, 1) <= -32766);
        assert!(i16_at(&out, 2) >= 32766);
        assert!(i16_at(&out, 3) <= -32766);
    }

    #[test]
    fn test_dither_mean_within_one_lsb() {
        // A DC signal at 0.5 should quantize to a mean within 1 LSB of
        // 0.5 * 32767 once the TPDF noise averages out.
        let samples = vec![0.5_f32; 20_000];
        let mut out = vec![0u8; samples.len() * 2];
        quantize_i16_dither(&samples, &mut out);

        let sum: i64 = (0..samples.len()).map(|i| i16_at(&out, i) as i64).sum();
        let mean = sum as f64 / samples.len() as f64;
        assert!(
            (mean - 0.5 * 32767.0).abs() < 1.0,
            "dithered mean {} too far from {}",
            mean,
            0.5 * 32767.0
        );
    }

    #[test]
    fn test_quantize_i32_boundaries() {
        let samples = [1.0_f32, -1.0, 0.0, 2.0];
        let mut out = [0u8; 16];
        quantize_i32(&samples, &mut out);
        assert_eq!(i32_at(&out, 0), i32::MAX);
        assert_eq!(i32_at(&out, 1), -i32::MAX);
        assert_eq!(i32_at(&out, 2), 0);
        assert_eq!(i32_at(&out, 3), i32::MAX);
    }

    #[test]
    fn test_quantize_i32_half_scale() {
        let samples = [0.5_f32];
        let mut out = [0u8; 4];
        quantize_i32(&samples, &mut out);
        let expected = (0.5 * i32::MAX as f64).round() as i32;
        assert_eq!(i32_at(&out, 0), expected);
    }
}
