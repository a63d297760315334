//! Time-stop set-piece
//!
//! A scripted sequence layered over normal playback: duck the running track,
//! decelerate it to a standstill under a sound effect, hold, then ramp back
//! up. The track stream keeps being consumed the whole time, so playback
//! resumes exactly where the deceleration left it.
//!
//! The sequence runs synchronously on the playback thread. A missing sound
//! asset aborts it with an error; the engine logs and resumes normal
//! playback, so the loop never dies over a stinger file.

use crate::audio::chunk::{amp_to_db, db_to_amp, PcmChunk};
use crate::audio::decoder::{ChunkStream, Direction};
use crate::audio::output::AudioSink;
use crate::audio::speed::{change_speed, cutoff_for_speed, LowPassFilter};
use crate::error::{Error, Result};
use stasis_common::timing::{chunk_frames, ENGINE_RATE};
use stasis_common::{EngineEvent, EventBus};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Gain the running track is ducked to while the stinger plays.
pub const DUCK_DB: f64 = -5.0;
/// Number of stepped fades that reach the duck gain.
pub const DUCK_STEPS: usize = 4;
/// Steps in each speed ramp (down and up).
pub const RAMP_STEPS: usize = 15;
/// Speed the resume ramp starts from.
pub const RESUME_START_SPEED: f64 = 0.1;
/// Wall-clock seconds the world stays stopped.
pub const FREEZE_SECS: u64 = 5;
/// Deceleration chunks written before the visual cue fires.
pub const VISUAL_CUE_AFTER_CHUNKS: usize = 1;

/// Frame offset into the deceleration sound where its impact lands; the
/// ramp-down is timed against this point rather than the file start.
const DECEL_SEEK_FRAME: u64 = 21_563;

/// The three sound files the sequence needs.
#[derive(Debug, Clone)]
pub struct TimeStopAssets {
    pub sting: PathBuf,
    pub decelerate: PathBuf,
    pub resume: PathBuf,
}

impl TimeStopAssets {
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            sting: dir.join("zawarudo.wav"),
            decelerate: dir.join("time_stop.wav"),
            resume: dir.join("time_resume.wav"),
        }
    }
}

/// Sound-effect reader that yields exactly the frame count asked for.
///
/// The track chunks it gets mixed against change length with speed, so the
/// effect is re-chunked on demand, zero-padded at the tail.
struct EffectFeed {
    stream: ChunkStream,
    pending: Vec<f32>,
    eof: bool,
}

impl EffectFeed {
    fn open(path: &Path, start_frame: u64) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "sound asset missing: {}",
                path.display()
            )));
        }
        let stream = ChunkStream::open(
            path,
            start_frame,
            Direction::Forward,
            chunk_frames(ENGINE_RATE) as usize,
        )?;
        Ok(Self {
            stream,
            pending: Vec::new(),
            eof: false,
        })
    }

    fn finished(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    /// Exactly `frames` frames of effect audio, zero-padded past the end.
    /// `None` once the effect is fully drained.
    fn take_frames(&mut self, frames: usize) -> Result<Option<PcmChunk>> {
        let want = frames * 2;
        while self.pending.len() < want && !self.eof {
            match self.stream.next_chunk()? {
                Some(chunk) => self.pending.extend_from_slice(&chunk.samples),
                None => self.eof = true,
            }
        }
        if self.finished() {
            return Ok(None);
        }
        let take = want.min(self.pending.len());
        let mut samples: Vec<f32> = self.pending.drain(..take).collect();
        samples.resize(want, 0.0);
        PcmChunk::new(samples, ENGINE_RATE, 2).map(Some)
    }
}

/// Run the full time-stop sequence, consuming chunks from `track`.
///
/// Returns the number of engine-rate frames consumed from the track stream
/// so the caller can keep its position counter honest. `on_progress` fires
/// with the cumulative consumed frame count after each track chunk, so the
/// caller's position feed keeps moving through the whole sequence.
pub fn run_time_stop<S: AudioSink>(
    sink: &mut S,
    events: &EventBus,
    assets: &TimeStopAssets,
    track: &mut ChunkStream,
    speed: f64,
    filter: &mut LowPassFilter,
    hold: Duration,
    on_progress: &mut dyn FnMut(u64),
) -> Result<u64> {
    info!("Time stop engaged at speed {:.2}", speed);
    let mut consumed = 0u64;

    // Amplitude step of the duck ramp: unity down to the duck gain across
    // DUCK_STEPS equal segments
    let duck_amp_step = (1.0 - db_to_amp(DUCK_DB)) / DUCK_STEPS as f64;

    // Phase 1: sting plays over the track while it ducks to DUCK_DB. The
    // fade happens over the first quarter of each of the first DUCK_STEPS
    // chunks; after that the track holds at the duck gain.
    let mut sting = EffectFeed::open(&assets.sting, 0)?;
    let mut step = 0usize;
    while !sting.finished() {
        let Some(chunk) = track.next_chunk()? else {
            break;
        };
        consumed += chunk.frames() as u64;
        let mut out = change_speed(&chunk, speed, Some(filter))?;
        let len = out.len_ms();
        if step < DUCK_STEPS {
            let from_db = amp_to_db(1.0 - step as f64 * duck_amp_step);
            let to_db = amp_to_db(1.0 - (step + 1) as f64 * duck_amp_step);
            out.fade(from_db, to_db, 0, len / 4);
            out.fade(to_db, to_db, len / 4, len);
        } else {
            out.gain_db(DUCK_DB);
        }
        if let Some(effect) = sting.take_frames(out.frames())? {
            out.mix(&effect)?;
        }
        sink.write(&out)?;
        on_progress(consumed);
        step += 1;
    }

    // Phase 2: ramp speed toward zero under the deceleration sound. The
    // endpoint is excluded so the last step still moves.
    let mut decel = EffectFeed::open(&assets.decelerate, DECEL_SEEK_FRAME)?;
    let mut decel_chunks = 0usize;
    for k in 0..RAMP_STEPS {
        let step_speed = speed * (1.0 - k as f64 / RAMP_STEPS as f64);
        filter.retune(cutoff_for_speed(step_speed, ENGINE_RATE))?;
        let Some(chunk) = track.next_chunk()? else {
            break;
        };
        consumed += chunk.frames() as u64;
        let mut out = change_speed(&chunk, step_speed, Some(filter))?;
        out.gain_db(DUCK_DB);
        if let Some(effect) = decel.take_frames(out.frames())? {
            out.mix(&effect)?;
        }
        sink.write(&out)?;
        on_progress(consumed);
        decel_chunks += 1;
        if decel_chunks == VISUAL_CUE_AFTER_CHUNKS {
            events.emit_lossy(EngineEvent::VisualEffectCue);
        }
    }

    // Phase 3: the track is frozen; finish the deceleration sound alone,
    // then hold in real time.
    let frames_per_chunk = chunk_frames(ENGINE_RATE) as usize;
    while let Some(effect) = decel.take_frames(frames_per_chunk)? {
        sink.write(&effect)?;
    }
    debug!("World stopped for {:?}", hold);
    std::thread::sleep(hold);

    // Phase 4: ramp back up under the resume sound, endpoint included so
    // the final step lands exactly on the original speed. The duck fades
    // mirror back to unity over the last DUCK_STEPS steps.
    let mut resume = EffectFeed::open(&assets.resume, 0)?;
    let fade_start = RAMP_STEPS - DUCK_STEPS;
    for k in 0..RAMP_STEPS {
        let step_speed = RESUME_START_SPEED
            + (speed - RESUME_START_SPEED) * k as f64 / (RAMP_STEPS - 1) as f64;
        filter.retune(cutoff_for_speed(step_speed, ENGINE_RATE))?;
        let Some(chunk) = track.next_chunk()? else {
            break;
        };
        consumed += chunk.frames() as u64;
        let mut out = change_speed(&chunk, step_speed, Some(filter))?;
        let len = out.len_ms();
        if k >= fade_start {
            let i = (k - fade_start) as f64;
            let from_db = amp_to_db(db_to_amp(DUCK_DB) + i * duck_amp_step);
            let to_db = amp_to_db(db_to_amp(DUCK_DB) + (i + 1.0) * duck_amp_step);
            out.fade(from_db, to_db, 0, len / 4);
            out.fade(to_db, to_db, len / 4, len);
        } else {
            out.gain_db(DUCK_DB);
        }
        if let Some(effect) = resume.take_frames(out.frames())? {
            out.mix(&effect)?;
        }
        sink.write(&out)?;
        on_progress(consumed);
    }

    filter.retune(cutoff_for_speed(speed, ENGINE_RATE))?;
    info!("Time resumed, {} track frames consumed", consumed);
    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::MemorySink;
    use std::path::Path;

    fn write_tone(path: &Path, frames: u32, amplitude: f32) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: ENGINE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            let t = i as f32 / ENGINE_RATE as f32;
            let v = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * amplitude;
            let s = (v * i16::MAX as f32) as i16;
            writer.write_sample(s).unwrap();
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn test_assets(dir: &Path) -> TimeStopAssets {
        let assets = TimeStopAssets::from_dir(dir);
        // Short sting, decel long enough to cover the seek offset, short resume
        write_tone(&assets.sting, ENGINE_RATE / 2, 0.3);
        write_tone(&assets.decelerate, ENGINE_RATE, 0.3);
        write_tone(&assets.resume, ENGINE_RATE / 2, 0.3);
        assets
    }

    fn open_track(dir: &Path) -> ChunkStream {
        let path = dir.join("track.wav");
        write_tone(&path, ENGINE_RATE * 10, 0.5);
        ChunkStream::open(
            &path,
            0,
            Direction::Forward,
            chunk_frames(ENGINE_RATE) as usize,
        )
        .unwrap()
    }

    #[test]
    fn test_sequence_consumes_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let assets = test_assets(dir.path());
        let mut track = open_track(dir.path());
        let mut sink = MemorySink::new();
        let mut filter = LowPassFilter::new(20_000.0, ENGINE_RATE, 2).unwrap();
        let events = EventBus::new(16);

        let mut progress = Vec::new();
        let consumed = run_time_stop(
            &mut sink,
            &events,
            &assets,
            &mut track,
            1.0,
            &mut filter,
            Duration::ZERO,
            &mut |c| progress.push(c),
        )
        .unwrap();

        // Duck (~10 chunks for a half-second sting) + two 15-step ramps
        let per_chunk = chunk_frames(ENGINE_RATE);
        assert!(consumed >= per_chunk * (RAMP_STEPS as u64 * 2));
        assert!(sink.frames_written() > 0);
        // The written audio outlasts the consumed track audio: the slowed
        // steps stretch and the frozen drain adds effect-only chunks
        assert!(sink.frames_written() as u64 > consumed);
        // Progress keeps moving through every phase that touches the track
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*progress.last().unwrap(), consumed);
    }

    #[test]
    fn test_visual_cue_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let assets = test_assets(dir.path());
        let mut track = open_track(dir.path());
        let mut sink = MemorySink::new();
        let mut filter = LowPassFilter::new(20_000.0, ENGINE_RATE, 2).unwrap();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();

        run_time_stop(
            &mut sink,
            &events,
            &assets,
            &mut track,
            1.0,
            &mut filter,
            Duration::ZERO,
            &mut |_| {},
        )
        .unwrap();

        let mut saw_cue = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::VisualEffectCue) {
                saw_cue = true;
            }
        }
        assert!(saw_cue);
    }

    #[test]
    fn test_missing_asset_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let assets = TimeStopAssets::from_dir(dir.path());
        let mut track = open_track(dir.path());
        let mut sink = MemorySink::new();
        let mut filter = LowPassFilter::new(20_000.0, ENGINE_RATE, 2).unwrap();
        let events = EventBus::new(16);

        let result = run_time_stop(
            &mut sink,
            &events,
            &assets,
            &mut track,
            1.0,
            &mut filter,
            Duration::ZERO,
            &mut |_| {},
        );
        assert!(result.is_err());
    }
}
