//! Crossfade engine
//!
//! Produces the mixed chunks for a transition: a fade-out gain schedule over
//! the outgoing stream, its mirror over the incoming stream, and tolerant
//! sample mixing. The per-step boundary gains are reported back to the
//! caller because an interrupted fade resumes from them (see the
//! override-transition path in the playback engine).

use crate::audio::chunk::{amp_to_db, PcmChunk};
use crate::audio::decoder::ChunkStream;
use crate::error::{Error, Result};

/// Anything that can produce a finite sequence of PCM chunks.
///
/// The playback engine feeds decoder streams through here directly; during
/// an override-transition it substitutes a combined source that merges two
/// already-fading streams.
pub trait ChunkSource: Send {
    /// Pull the next chunk; `Ok(None)` means exhausted.
    fn next_chunk(&mut self) -> Result<Option<PcmChunk>>;
}

impl ChunkSource for ChunkStream {
    fn next_chunk(&mut self) -> Result<Option<PcmChunk>> {
        ChunkStream::next_chunk(self)
    }
}

impl<T: ChunkSource + ?Sized> ChunkSource for &mut T {
    fn next_chunk(&mut self) -> Result<Option<PcmChunk>> {
        (**self).next_chunk()
    }
}

/// Applies a constant decibel gain to every chunk of an inner source.
pub struct GainSource<S: ChunkSource> {
    inner: S,
    gain_db: f64,
}

impl<S: ChunkSource> GainSource<S> {
    pub fn new(inner: S, gain_db: f64) -> Self {
        Self { inner, gain_db }
    }
}

impl<S: ChunkSource> ChunkSource for GainSource<S> {
    fn next_chunk(&mut self) -> Result<Option<PcmChunk>> {
        match self.inner.next_chunk()? {
            Some(mut chunk) => {
                chunk.gain_db(self.gain_db);
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }
}

/// Merges already-fading streams into one by chunk-wise mixing.
///
/// Used when a second crossfade is requested mid-transition: the outgoing
/// and incoming streams of the abandoned fade, each pre-gained to the level
/// the fade last reported, become a single source for the new fade. Ends
/// when the first constituent ends.
pub struct CombinedSource<'a> {
    sources: Vec<Box<dyn ChunkSource + 'a>>,
    /// Chunks remaining before this source reports exhaustion
    remaining_chunks: u64,
}

impl<'a> CombinedSource<'a> {
    pub fn new(sources: Vec<Box<dyn ChunkSource + 'a>>, span_ms: u64, chunk_ms: u64) -> Self {
        Self {
            sources,
            remaining_chunks: span_ms.div_ceil(chunk_ms),
        }
    }
}

impl ChunkSource for CombinedSource<'_> {
    fn next_chunk(&mut self) -> Result<Option<PcmChunk>> {
        if self.remaining_chunks == 0 || self.sources.is_empty() {
            return Ok(None);
        }
        self.remaining_chunks -= 1;

        let mut mixed = match self.sources[0].next_chunk()? {
            Some(chunk) => chunk,
            None => return Ok(None),
        };
        for source in &mut self.sources[1..] {
            if let Some(chunk) = source.next_chunk()? {
                mixed.mix(&chunk)?;
            }
        }
        Ok(Some(mixed))
    }
}

/// Fade shape requested from [`step_fade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeMode {
    /// Ramp the outgoing stream down to silence
    FadeOut,
    /// Ramp the stream up from silence (reuses the out-stream's chunks)
    FadeIn,
    /// Both at once
    Crossfade,
}

/// One yielded step of a fade: the mixed chunk plus the boundary gains the
/// step started at.
#[derive(Debug)]
pub struct FadeStep {
    pub chunk: PcmChunk,
    /// Outgoing stream's gain at the start of this step, in dB
    pub out_db: f64,
    /// Incoming stream's gain at the start of this step, in dB
    pub in_db: f64,
}

/// Lazy sequence of fade steps over one or two chunk sources.
pub struct StepFade<'a> {
    out_source: &'a mut dyn ChunkSource,
    in_source: Option<&'a mut dyn ChunkSource>,
    mode: FadeMode,
    /// Per-segment (start_db, end_db) pairs for the fade-out curve
    db_schedule: Vec<(f64, f64)>,
    step: usize,
}

/// Build a fade over `fade_duration_ms`, stepped at `chunk_len_ms`.
///
/// The duration is partitioned into `fade_duration / chunk_len` full
/// segments plus a shorter remainder segment when the division is not
/// exact. Each segment's share of the total duration becomes its share of
/// the amplitude ramp; the fade-in curve reads the same schedule from the
/// end. `fade_duration_ms` must be at least `chunk_len_ms` (a zero fade is
/// an immediate cut and never reaches this engine).
pub fn step_fade<'a>(
    out_source: &'a mut dyn ChunkSource,
    in_source: Option<&'a mut dyn ChunkSource>,
    fade_duration_ms: u64,
    chunk_len_ms: u64,
    mode: FadeMode,
) -> Result<StepFade<'a>> {
    if chunk_len_ms == 0 {
        return Err(Error::InvalidTiming("chunk length must be > 0".into()));
    }
    if fade_duration_ms < chunk_len_ms {
        return Err(Error::InvalidTiming(format!(
            "fade duration {}ms shorter than chunk length {}ms",
            fade_duration_ms, chunk_len_ms
        )));
    }
    if mode == FadeMode::Crossfade && in_source.is_none() {
        return Err(Error::Playback("crossfade requires an incoming source".into()));
    }

    // Proportion of the fade each segment covers
    let mut fractions =
        vec![chunk_len_ms as f64 / fade_duration_ms as f64; (fade_duration_ms / chunk_len_ms) as usize];
    let remainder = fade_duration_ms % chunk_len_ms;
    if remainder > 0 {
        fractions.push(remainder as f64 / fade_duration_ms as f64);
    }

    // Boundary gains from cumulative fractions: segment i runs from
    // amp(1 - prefix[i]) down to amp(1 - prefix[i+1])
    let mut db_schedule = Vec::with_capacity(fractions.len());
    let mut prefix = 0.0;
    for f in &fractions {
        let start = amp_to_db(1.0 - prefix);
        prefix += f;
        let end = amp_to_db(1.0 - prefix);
        db_schedule.push((start, end));
    }

    Ok(StepFade {
        out_source,
        in_source,
        mode,
        db_schedule,
        step: 0,
    })
}

impl StepFade<'_> {
    /// Total number of steps this fade will yield.
    pub fn len(&self) -> usize {
        self.db_schedule.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db_schedule.is_empty()
    }

    /// Produce the next fade step, or `Ok(None)` once the schedule is done
    /// or a source ran dry early.
    pub fn next_step(&mut self) -> Result<Option<FadeStep>> {
        if self.step >= self.db_schedule.len() {
            return Ok(None);
        }
        let x = self.step;
        let n = self.db_schedule.len();

        let mut out_chunk = match self.out_source.next_chunk()? {
            Some(chunk) => chunk,
            None => return Ok(None),
        };
        let chunk_ms = out_chunk.len_ms();

        let (out_db, faded_out) = match self.mode {
            FadeMode::FadeOut | FadeMode::Crossfade => {
                let (start, end) = self.db_schedule[x];
                let mut chunk = out_chunk.clone();
                chunk.fade(start, end, 0, chunk_ms);
                (start, Some(chunk))
            }
            FadeMode::FadeIn => (0.0, None),
        };

        let (in_db, faded_in) = match self.mode {
            FadeMode::FadeIn | FadeMode::Crossfade => {
                let mut chunk = if self.mode == FadeMode::FadeIn {
                    // Pure fade-in shapes the out-stream's own chunk
                    out_chunk.clone()
                } else {
                    match self
                        .in_source
                        .as_mut()
                        .and_then(|s| s.next_chunk().transpose())
                        .transpose()?
                    {
                        Some(chunk) => chunk,
                        None => return Ok(None),
                    }
                };
                // Clip the incoming chunk to the outgoing chunk's length
                chunk.truncate_frames(out_chunk.frames());

                // Mirror of the fade-out schedule, read from the end
                let (mirror_start, mirror_end) = self.db_schedule[n - 1 - x];
                let len = chunk.len_ms();
                chunk.fade(mirror_end, mirror_start, 0, len);
                (mirror_end, Some(chunk))
            }
            FadeMode::FadeOut => (0.0, None),
        };

        let mixed = match (faded_out, faded_in) {
            (Some(mut out), Some(inc)) => {
                out.mix(&inc)?;
                out
            }
            (Some(out), None) => out,
            (None, Some(inc)) => inc,
            (None, None) => out_chunk,
        };

        self.step += 1;
        Ok(Some(FadeStep {
            chunk: mixed,
            out_db,
            in_db,
        }))
    }
}
