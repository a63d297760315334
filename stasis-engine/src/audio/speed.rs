//! Speed change engine
//!
//! Time-stretches audio without pitch correction: per-channel linear
//! interpolation to a new frame count, with a streaming windowed-sinc
//! low-pass filter applied when slowing down.
//!
//! Slowing audio down shifts content above the new effective Nyquist
//! frequency into the audible band as aliasing; the filter suppresses it.
//! Speeding up introduces no new aliasing and needs no filter.

use crate::audio::chunk::PcmChunk;
use crate::error::{Error, Result};

/// Default tap count for the low-pass filter. Must be odd so the filter has
/// a center tap.
pub const DEFAULT_TAPS: usize = 201;

/// Streaming FIR low-pass filter with persistent per-channel state.
///
/// The filter carries the last `taps - 1` input frames across calls so that
/// filtering a track chunk by chunk produces the same samples as filtering
/// it as one continuous stream. The carry starts as silence, which keeps the
/// output length equal to the input length on every call including the
/// first.
///
/// Retuning (see [`LowPassFilter::retune`]) recomputes the coefficients and
/// zeroes the carry; it happens only when the speed value changes, not per
/// call.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    taps: Vec<f64>,
    sample_rate: u32,
    channels: u16,
    /// Per-channel history of the last `taps - 1` input samples
    carry: Vec<Vec<f64>>,
}

impl LowPassFilter {
    /// Create a filter with the default tap count.
    ///
    /// `cutoff_hz` must satisfy `0 < cutoff < sample_rate / 2`.
    pub fn new(cutoff_hz: f64, sample_rate: u32, channels: u16) -> Result<Self> {
        Self::with_taps(cutoff_hz, sample_rate, DEFAULT_TAPS, channels)
    }

    /// Create a filter with an explicit tap count (must be odd).
    pub fn with_taps(
        cutoff_hz: f64,
        sample_rate: u32,
        num_taps: usize,
        channels: u16,
    ) -> Result<Self> {
        let taps = design_taps(cutoff_hz, sample_rate, num_taps)?;
        let carry = vec![vec![0.0; num_taps - 1]; channels as usize];
        Ok(Self {
            taps,
            sample_rate,
            channels,
            carry,
        })
    }

    /// Recompute coefficients for a new cutoff and zero the carried state.
    pub fn retune(&mut self, cutoff_hz: f64) -> Result<()> {
        let num_taps = self.taps.len();
        self.taps = design_taps(cutoff_hz, self.sample_rate, num_taps)?;
        for c in &mut self.carry {
            c.iter_mut().for_each(|s| *s = 0.0);
        }
        Ok(())
    }

    /// Filter one chunk of interleaved samples in place.
    ///
    /// Output frame count equals input frame count. Samples are clamped to
    /// [-1.0, 1.0] to counter numerical overshoot from the convolution.
    pub fn apply(&mut self, chunk: &mut PcmChunk) -> Result<()> {
        if chunk.channels != self.channels {
            return Err(Error::InvalidTiming(format!(
                "filter built for {} channels, chunk has {}",
                self.channels, chunk.channels
            )));
        }
        let frames = chunk.frames();
        if frames == 0 {
            return Ok(());
        }
        let ch = self.channels as usize;
        let n = self.taps.len();

        for c in 0..ch {
            // Prepend the carried history, convolve, keep the steady-state
            // window, then save the tail as the next call's history.
            let mut padded = Vec::with_capacity(self.carry[c].len() + frames);
            padded.extend_from_slice(&self.carry[c]);
            padded.extend(chunk.samples.iter().skip(c).step_by(ch).map(|s| *s as f64));

            self.carry[c].clear();
            self.carry[c]
                .extend_from_slice(&padded[padded.len() - (n - 1)..]);

            for (i, out) in chunk
                .samples
                .iter_mut()
                .skip(c)
                .step_by(ch)
                .enumerate()
            {
                // Causal form: y[i] = sum_j taps[j] * x[i - j], with the
                // carried history standing in for x at negative indices.
                // Every index lands inside `padded`, so chunk boundaries
                // introduce no edge effects.
                let pos = (n - 1) + i;
                let mut acc = 0.0f64;
                for (j, tap) in self.taps.iter().enumerate() {
                    acc += tap * padded[pos - j];
                }
                *out = (acc as f32).clamp(-1.0, 1.0);
            }
        }
        Ok(())
    }
}

/// Windowed-sinc coefficient design: a sinc at the cutoff frequency shaped
/// by a Hamming window, normalized to unity DC gain.
fn design_taps(cutoff_hz: f64, sample_rate: u32, num_taps: usize) -> Result<Vec<f64>> {
    if cutoff_hz <= 0.0 || cutoff_hz >= sample_rate as f64 / 2.0 {
        return Err(Error::InvalidTiming(format!(
            "cutoff {} Hz outside (0, {})",
            cutoff_hz,
            sample_rate as f64 / 2.0
        )));
    }
    if num_taps % 2 == 0 || num_taps < 3 {
        return Err(Error::InvalidTiming(format!(
            "tap count {} must be odd and >= 3",
            num_taps
        )));
    }

    let center = (num_taps - 1) as f64 / 2.0;
    let mut taps: Vec<f64> = (0..num_taps)
        .map(|i| {
            let x = 2.0 * cutoff_hz * (i as f64 - center) / sample_rate as f64;
            let hamming = 0.54
                - 0.46 * (2.0 * std::f64::consts::PI * i as f64 / (num_taps - 1) as f64).cos();
            sinc(x) * hamming
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    for t in &mut taps {
        *t /= sum;
    }
    Ok(taps)
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Anti-alias cutoff for a playback speed: the slowed stream's Nyquist,
/// clamped inside the filter's valid design range.
pub fn cutoff_for_speed(speed: f64, sample_rate: u32) -> f64 {
    let nyquist = sample_rate as f64 / 2.0;
    (nyquist * speed).clamp(1.0, nyquist - 1.0)
}

/// Resample a chunk to a different effective speed.
///
/// Produces `round(frames / speed)` frames via per-channel linear
/// interpolation: `speed > 1` shortens the audio in time, `speed < 1`
/// lengthens it. When slowing down and a filter is supplied, the output is
/// low-pass filtered with state persisted inside `filter` across calls.
///
/// The output frame count is independent of filter state.
pub fn change_speed(
    chunk: &PcmChunk,
    speed: f64,
    filter: Option<&mut LowPassFilter>,
) -> Result<PcmChunk> {
    if speed <= 0.0 || !speed.is_finite() {
        return Err(Error::InvalidTiming(format!("invalid speed {}", speed)));
    }

    let in_frames = chunk.frames();
    let out_frames = (in_frames as f64 / speed).round() as usize;
    let ch = chunk.channels as usize;

    let mut samples = vec![0.0f32; out_frames * ch];
    if in_frames > 0 {
        for i in 0..out_frames {
            // Source positions spaced uniformly, endpoint exclusive, so
            // exact ratios land on exact source samples
            let src = i as f64 * in_frames as f64 / out_frames as f64;
            let i0 = src.floor() as usize;
            let i1 = (i0 + 1).min(in_frames - 1);
            let frac = (src - i0 as f64) as f32;
            for c in 0..ch {
                let a = chunk.samples[i0 * ch + c];
                let b = chunk.samples[i1 * ch + c];
                samples[i * ch + c] = a + (b - a) * frac;
            }
        }
    }

    let mut out = PcmChunk {
        samples,
        sample_rate: chunk.sample_rate,
        channels: chunk.channels,
    };

    if speed < 1.0 {
        if let Some(filter) = filter {
            filter.apply(&mut out)?;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_chunk(frames: usize) -> PcmChunk {
        let mut samples = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let v = (i as f32 / frames as f32) - 0.5;
            samples.push(v);
            samples.push(-v);
        }
        PcmChunk::new(samples, 44100, 2).unwrap()
    }

    fn sine_chunk(frames: usize, freq: f64) -> PcmChunk {
        let mut samples = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let v = (2.0 * std::f64::consts::PI * freq * i as f64 / 44100.0).sin() as f32 * 0.5;
            samples.push(v);
            samples.push(v);
        }
        PcmChunk::new(samples, 44100, 2).unwrap()
    }

    #[test]
    fn test_length_invariant() {
        let chunk = ramp_chunk(2205);
        for speed in [0.25, 0.5, 0.9, 1.0, 1.1, 1.5, 2.0, 3.0] {
            let out = change_speed(&chunk, speed, None).unwrap();
            assert_eq!(out.frames(), (2205.0 / speed).round() as usize, "speed {}", speed);
        }
    }

    #[test]
    fn test_length_invariant_with_filter() {
        let chunk = ramp_chunk(2205);
        let mut filter = LowPassFilter::new(0.5 * 22050.0, 44100, 2).unwrap();
        let out = change_speed(&chunk, 0.5, Some(&mut filter)).unwrap();
        assert_eq!(out.frames(), 4410);
    }

    #[test]
    fn test_unit_speed_is_identity() {
        let chunk = ramp_chunk(500);
        let out = change_speed(&chunk, 1.0, None).unwrap();
        assert_eq!(out.frames(), 500);
        for (a, b) in out.samples.iter().zip(chunk.samples.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_double_speed_picks_every_other_frame() {
        let chunk = ramp_chunk(1000);
        let out = change_speed(&chunk, 2.0, None).unwrap();
        assert_eq!(out.frames(), 500);
        // Exact 2:1 ratio lands on exact source samples
        for i in 0..500 {
            assert!((out.samples[i * 2] - chunk.samples[i * 4]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_invalid_speed_rejected() {
        let chunk = ramp_chunk(100);
        assert!(change_speed(&chunk, 0.0, None).is_err());
        assert!(change_speed(&chunk, -1.0, None).is_err());
        assert!(change_speed(&chunk, f64::NAN, None).is_err());
    }

    #[test]
    fn test_filter_design_validation() {
        assert!(LowPassFilter::new(0.0, 44100, 2).is_err());
        assert!(LowPassFilter::new(22050.0, 44100, 2).is_err());
        assert!(LowPassFilter::with_taps(1000.0, 44100, 200, 2).is_err());
        assert!(LowPassFilter::new(1000.0, 44100, 2).is_ok());
    }

    #[test]
    fn test_filter_attenuates_above_cutoff() {
        // 10 kHz tone through a 2 kHz low-pass should come out much quieter
        let chunk = sine_chunk(8820, 10_000.0);
        let mut filter = LowPassFilter::new(2_000.0, 44100, 2).unwrap();
        let mut filtered = chunk.clone();
        filter.apply(&mut filtered).unwrap();

        // Compare RMS over the tail, past the filter's warm-up
        let rms = |samples: &[f32]| {
            let tail = &samples[samples.len() / 2..];
            (tail.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / tail.len() as f64).sqrt()
        };
        assert!(rms(&filtered.samples) < rms(&chunk.samples) * 0.1);
    }

    #[test]
    fn test_filter_passes_below_cutoff() {
        let chunk = sine_chunk(8820, 200.0);
        let mut filter = LowPassFilter::new(5_000.0, 44100, 2).unwrap();
        let mut filtered = chunk.clone();
        filter.apply(&mut filtered).unwrap();

        let rms = |samples: &[f32]| {
            let tail = &samples[samples.len() / 2..];
            (tail.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / tail.len() as f64).sqrt()
        };
        let ratio = rms(&filtered.samples) / rms(&chunk.samples);
        assert!(ratio > 0.9 && ratio < 1.1, "ratio {}", ratio);
    }

    #[test]
    fn test_chunked_filtering_matches_whole_stream() {
        let whole = sine_chunk(4410, 1_000.0);

        let mut f_whole = LowPassFilter::new(3_000.0, 44100, 2).unwrap();
        let mut expected = whole.clone();
        f_whole.apply(&mut expected).unwrap();

        // Same input split into 50 ms pieces through a fresh filter
        let mut f_chunked = LowPassFilter::new(3_000.0, 44100, 2).unwrap();
        let mut got = Vec::new();
        for piece in whole.samples.chunks(2205 * 2) {
            let mut c = PcmChunk::new(piece.to_vec(), 44100, 2).unwrap();
            f_chunked.apply(&mut c).unwrap();
            got.extend(c.samples);
        }

        assert_eq!(got.len(), expected.samples.len());
        for (a, b) in got.iter().zip(expected.samples.iter()) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_retune_zeroes_state() {
        let mut filter = LowPassFilter::new(3_000.0, 44100, 2).unwrap();
        let mut chunk = sine_chunk(2205, 1_000.0);
        filter.apply(&mut chunk).unwrap();
        filter.retune(5_000.0).unwrap();
        for c in &filter.carry {
            assert!(c.iter().all(|s| *s == 0.0));
        }
    }
}
