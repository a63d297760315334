//! PCM chunk type
//!
//! `PcmChunk` is the arithmetic primitive the rest of the pipeline is built
//! from. Every decoded chunk, fade segment, and mixed output buffer is one of
//! these.
//!
//! **Format:**
//! - Samples are f32 (floating point -1.0 to 1.0)
//! - Stereo interleaved: [L, R, L, R, ...]
//! - Sample rate always 44100 Hz after decode-time normalization

use crate::error::{Error, Result};

/// Silence floor in decibels. Amplitudes at or below zero map here, and
/// values at or below it map back to amplitude zero.
pub const SILENCE_DB: f64 = -120.0;

/// Convert a normalized amplitude ratio to decibels.
pub fn amp_to_db(amp_ratio: f64) -> f64 {
    if amp_ratio <= 0.0 {
        SILENCE_DB
    } else {
        20.0 * amp_ratio.log10()
    }
}

/// Convert decibels to a normalized amplitude ratio.
pub fn db_to_amp(db: f64) -> f64 {
    if db <= SILENCE_DB {
        0.0
    } else {
        10f64.powf(db / 20.0)
    }
}

/// A chunk of decoded PCM audio.
///
/// Mutated in place by gain, mix, fade, and reverse; sliced into new chunks
/// for the crossfade engine. Sample values stay within [-1.0, 1.0] after
/// every operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmChunk {
    /// PCM audio samples (interleaved)
    pub samples: Vec<f32>,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Channel count (2 for the engine's internal format)
    pub channels: u16,
}

impl PcmChunk {
    /// Create a chunk from interleaved samples.
    ///
    /// Fails with `InvalidTiming` if the sample count is not a whole number
    /// of frames.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if channels == 0 {
            return Err(Error::InvalidTiming("channel count must be > 0".into()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(Error::InvalidTiming(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Create a silent chunk of the given frame count.
    pub fn silence(frames: usize, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: vec![0.0; frames * channels as usize],
            sample_rate,
            channels,
        }
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Duration in milliseconds, rounded to the nearest millisecond.
    pub fn len_ms(&self) -> u64 {
        ((self.frames() as f64 / self.sample_rate as f64) * 1000.0).round() as u64
    }

    /// Scale all samples by a decibel gain, clamping to range.
    pub fn gain_db(&mut self, db: f64) {
        let amp = db_to_amp(db) as f32;
        for s in &mut self.samples {
            *s = (*s * amp).clamp(-1.0, 1.0);
        }
    }

    /// Append another chunk's frames to this one.
    ///
    /// Fails with `InvalidTiming` on a rate or channel-layout mismatch.
    pub fn concat(&mut self, other: &PcmChunk) -> Result<()> {
        self.check_compatible(other)?;
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }

    /// Add another chunk sample-wise.
    ///
    /// When the frame counts differ by less than half a millisecond of
    /// frames, the shorter buffer is zero-padded rather than erroring out.
    /// Chunked generation rounds frame counts independently on each side of
    /// a crossfade, so off-by-a-few-frames inputs are normal here. Beyond
    /// the tolerance the mix is an `InvalidTiming` error.
    ///
    /// If the summed buffer's peak exceeds 1.0, the whole buffer is rescaled
    /// down proportionally (soft limiting) instead of hard-clipping.
    pub fn mix(&mut self, other: &PcmChunk) -> Result<()> {
        self.check_compatible(other)?;

        let tolerance = (self.sample_rate as usize).div_ceil(2000);
        let diff = self.frames() as i64 - other.frames() as i64;
        if diff.unsigned_abs() as usize >= tolerance {
            return Err(Error::InvalidTiming(format!(
                "cannot mix chunks of {} and {} frames",
                self.frames(),
                other.frames()
            )));
        }

        if diff < 0 {
            // Grow self with silence to match the longer chunk
            self.samples
                .resize(other.samples.len(), 0.0);
        }
        for (i, s) in other.samples.iter().enumerate() {
            self.samples[i] += s;
        }

        let peak = self
            .samples
            .iter()
            .fold(0f32, |acc, s| acc.max(s.abs()));
        if peak > 1.0 {
            let scale = 1.0 / peak;
            for s in &mut self.samples {
                *s *= scale;
            }
        }
        Ok(())
    }

    /// Return a new chunk covering the millisecond range, with bounds
    /// clamped to the buffer length.
    pub fn slice_ms(&self, start_ms: u64, end_ms: u64) -> PcmChunk {
        let len_ms = self.len_ms();
        let start_ms = start_ms.min(len_ms);
        let end_ms = end_ms.min(len_ms).max(start_ms);

        let start_frame = ms_to_frame(start_ms, self.sample_rate).min(self.frames());
        let end_frame = ms_to_frame(end_ms, self.sample_rate).min(self.frames());

        let ch = self.channels as usize;
        PcmChunk {
            samples: self.samples[start_frame * ch..end_frame * ch].to_vec(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Truncate the chunk to at most `frames` frames.
    pub fn truncate_frames(&mut self, frames: usize) {
        let max_samples = frames * self.channels as usize;
        if self.samples.len() > max_samples {
            self.samples.truncate(max_samples);
        }
    }

    /// Apply a gain ramp, linear in amplitude, across a millisecond window.
    ///
    /// `from_db`/`to_db` give the boundary gains; `start_ms` and
    /// `duration_ms` give the window, clamped to the chunk. A 0 dB → 0 dB
    /// ramp is a no-op.
    pub fn fade(&mut self, from_db: f64, to_db: f64, start_ms: u64, duration_ms: u64) {
        if from_db == 0.0 && to_db == 0.0 {
            return;
        }

        let from_amp = db_to_amp(from_db);
        let to_amp = db_to_amp(to_db);

        let start_frame = ms_to_frame(start_ms, self.sample_rate).min(self.frames());
        let end_frame =
            (start_frame + ms_to_frame(duration_ms, self.sample_rate)).min(self.frames());
        let span = end_frame - start_frame;
        if span == 0 {
            return;
        }

        let ch = self.channels as usize;
        for i in 0..span {
            // Linear amplitude ramp, endpoints inclusive
            let t = if span > 1 {
                i as f64 / (span - 1) as f64
            } else {
                1.0
            };
            let amp = (from_amp + (to_amp - from_amp) * t) as f32;
            let base = (start_frame + i) * ch;
            for c in 0..ch {
                self.samples[base + c] = (self.samples[base + c] * amp).clamp(-1.0, 1.0);
            }
        }
    }

    /// Reverse frame order in place. Channel order within each frame is
    /// preserved.
    pub fn reverse(&mut self) {
        let ch = self.channels as usize;
        let frames = self.frames();
        for i in 0..frames / 2 {
            let a = i * ch;
            let b = (frames - 1 - i) * ch;
            for c in 0..ch {
                self.samples.swap(a + c, b + c);
            }
        }
    }

    fn check_compatible(&self, other: &PcmChunk) -> Result<()> {
        if self.sample_rate != other.sample_rate || self.channels != other.channels {
            return Err(Error::InvalidTiming(format!(
                "chunk format mismatch: {}Hz/{}ch vs {}Hz/{}ch",
                self.sample_rate, self.channels, other.sample_rate, other.channels
            )));
        }
        Ok(())
    }
}

fn ms_to_frame(ms: u64, sample_rate: u32) -> usize {
    ((ms as f64 * sample_rate as f64) / 1000.0).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(samples: Vec<f32>) -> PcmChunk {
        PcmChunk::new(samples, 44100, 2).unwrap()
    }

    #[test]
    fn test_db_amp_conversions() {
        assert_eq!(amp_to_db(1.0), 0.0);
        assert_eq!(amp_to_db(0.0), SILENCE_DB);
        assert_eq!(amp_to_db(-0.5), SILENCE_DB);
        assert_eq!(db_to_amp(0.0), 1.0);
        assert_eq!(db_to_amp(SILENCE_DB), 0.0);
        assert_eq!(db_to_amp(-200.0), 0.0);

        // Round trip away from the floor
        let db = amp_to_db(0.7);
        assert!((db_to_amp(db) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_new_rejects_ragged_samples() {
        assert!(PcmChunk::new(vec![0.0; 3], 44100, 2).is_err());
        assert!(PcmChunk::new(vec![0.0; 4], 44100, 2).is_ok());
    }

    #[test]
    fn test_len_ms_rounds() {
        // 2205 frames at 44.1kHz = exactly 50 ms
        let c = PcmChunk::silence(2205, 44100, 2);
        assert_eq!(c.len_ms(), 50);
        // 44100 frames = 1000 ms
        let c = PcmChunk::silence(44100, 44100, 2);
        assert_eq!(c.len_ms(), 1000);
    }

    #[test]
    fn test_gain_round_trip() {
        let original: Vec<f32> = (0..1000).map(|i| ((i as f32) / 1000.0) - 0.5).collect();
        let mut c = chunk_of(original.clone());
        c.gain_db(-6.0);
        c.gain_db(6.0);
        // ±1 LSB at 16-bit scale
        let lsb = 1.0 / 32768.0;
        for (a, b) in c.samples.iter().zip(original.iter()) {
            assert!((a - b).abs() <= lsb, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_gain_clamps() {
        let mut c = chunk_of(vec![0.9, -0.9]);
        c.gain_db(6.0);
        assert_eq!(c.samples, vec![1.0, -1.0]);
    }

    #[test]
    fn test_concat() {
        let mut a = chunk_of(vec![0.1, 0.2]);
        let b = chunk_of(vec![0.3, 0.4]);
        a.concat(&b).unwrap();
        assert_eq!(a.samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(a.frames(), 2);
    }

    #[test]
    fn test_mix_equal_lengths() {
        let mut a = chunk_of(vec![0.1, 0.2, 0.3, 0.4]);
        let b = chunk_of(vec![0.1, 0.1, 0.1, 0.1]);
        a.mix(&b).unwrap();
        let expected = [0.2f32, 0.3, 0.4, 0.5];
        for (got, want) in a.samples.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mix_pads_small_difference() {
        // 10-frame difference is inside the 23-frame tolerance at 44.1kHz
        let mut a = chunk_of(vec![0.1; 200]); // 100 frames
        let b = chunk_of(vec![0.1; 180]); // 90 frames
        a.mix(&b).unwrap();
        assert_eq!(a.frames(), 100);
        assert!((a.samples[0] - 0.2).abs() < 1e-6);
        assert!((a.samples[199] - 0.1).abs() < 1e-6);

        // Shorter self grows to match
        let mut c = chunk_of(vec![0.1; 180]);
        let d = chunk_of(vec![0.1; 200]);
        c.mix(&d).unwrap();
        assert_eq!(c.frames(), 100);
        assert!((c.samples[199] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_mix_rejects_large_difference() {
        let mut a = chunk_of(vec![0.1; 200]);
        let b = chunk_of(vec![0.1; 100]);
        assert!(a.mix(&b).is_err());
    }

    #[test]
    fn test_mix_soft_limits() {
        let mut a = chunk_of(vec![0.8, 0.4]);
        let b = chunk_of(vec![0.8, 0.4]);
        a.mix(&b).unwrap();
        // Peak 1.6 rescales everything by 1/1.6, preserving the 2:1 ratio
        assert!((a.samples[0] - 1.0).abs() < 1e-6);
        assert!((a.samples[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_slice_ms_clamps() {
        let c = PcmChunk::silence(4410, 44100, 2); // 100 ms
        let s = c.slice_ms(25, 75);
        assert_eq!(s.len_ms(), 50);
        // Bounds past the end clamp instead of erroring
        let s = c.slice_ms(50, 500);
        assert_eq!(s.len_ms(), 50);
        let s = c.slice_ms(500, 600);
        assert_eq!(s.frames(), 0);
    }

    #[test]
    fn test_fade_full_ramp() {
        let mut c = chunk_of(vec![0.5; 2 * 441]); // 10 ms
        c.fade(SILENCE_DB, 0.0, 0, 10);
        // First frame silent, last frame at full gain
        assert_eq!(c.samples[0], 0.0);
        assert!((c.samples[c.samples.len() - 1] - 0.5).abs() < 1e-6);
        // Monotonically non-decreasing left channel
        let left: Vec<f32> = c.samples.iter().step_by(2).copied().collect();
        for w in left.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn test_fade_zero_to_zero_is_noop() {
        let mut c = chunk_of(vec![0.5; 100]);
        let before = c.samples.clone();
        c.fade(0.0, 0.0, 0, 50);
        assert_eq!(c.samples, before);
    }

    #[test]
    fn test_reverse() {
        let mut c = chunk_of(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        c.reverse();
        // Frame order flips, channel order within a frame does not
        assert_eq!(c.samples, vec![0.5, 0.6, 0.3, 0.4, 0.1, 0.2]);
    }

    #[test]
    fn test_double_reverse_is_identity() {
        let original: Vec<f32> = (0..200).map(|i| (i as f32) / 200.0).collect();
        let mut c = chunk_of(original.clone());
        c.reverse();
        c.reverse();
        assert_eq!(c.samples, original);
    }
}
