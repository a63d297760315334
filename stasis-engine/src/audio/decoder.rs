//! Streaming audio decoder using symphonia
//!
//! Produces fixed-size PCM chunks from an arbitrary start frame, forward or
//! reverse. All supported formats (WAV, Ogg Vorbis, MP3) decode through
//! symphonia; output is always interleaved stereo f32 at the engine rate.
//!
//! Forward playback seeks once and then streams packets. Reverse playback
//! seeks backward one chunk per iteration and reverses each chunk; MP3 files
//! cannot be reverse-streamed live and go through the transcode cache first
//! (see [`crate::audio::transcode`]).

use crate::audio::chunk::PcmChunk;
use crate::audio::resample::{Resampler, TARGET_SAMPLE_RATE};
use crate::audio::transcode::TranscodeCache;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

/// Playback direction for a chunk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Static facts about an audio file, probed once at library import time.
#[derive(Debug, Clone, Copy)]
pub struct ProbeInfo {
    /// Frame count in the source's native rate
    pub source_frames: u64,
    /// Source sample rate in Hz
    pub sample_rate: u32,
    /// Frame count converted to the engine rate
    pub engine_frames: u64,
    /// Channel count in the source
    pub channels: u16,
}

impl ProbeInfo {
    /// Track length in milliseconds.
    pub fn length_ms(&self) -> u64 {
        self.source_frames * 1000 / self.sample_rate as u64
    }
}

/// Probe an audio file for its length and format without decoding it.
pub fn probe_file(path: &Path) -> Result<ProbeInfo> {
    check_extension(path)?;
    let (format, _) = open_format(path)?;
    let track = default_track(format.as_ref())?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| Error::Decode(format!("{}: sample rate not found", path.display())))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .ok_or_else(|| Error::Decode(format!("{}: channel count not found", path.display())))?;
    let source_frames = track
        .codec_params
        .n_frames
        .ok_or_else(|| Error::Decode(format!("{}: frame count not found", path.display())))?;

    Ok(ProbeInfo {
        source_frames,
        sample_rate,
        engine_frames: source_frames * TARGET_SAMPLE_RATE as u64 / sample_rate as u64,
        channels,
    })
}

/// A lazy, finite stream of PCM chunks covering a track from a start frame
/// to end-of-file (or start-of-file when reversed).
///
/// Every yielded chunk is at most `chunk_frames` long; the final chunk is
/// shorter when the covered span is not an exact multiple. Positions are in
/// engine-rate frames throughout.
pub struct ChunkStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    source_rate: u32,
    source_channels: u16,
    direction: Direction,
    chunk_frames: usize,
    /// Engine-rate samples decoded but not yet emitted (forward mode)
    pending: Vec<f32>,
    /// Source frames still to discard after the last coarse seek
    skip_source_frames: u64,
    /// Reverse mode: engine-frame position the next chunk ends at
    reverse_end_frame: u64,
    exhausted: bool,
}

impl ChunkStream {
    /// Open a chunk stream over an audio file.
    ///
    /// `start_frame` is the engine-rate frame to begin at: the first frame
    /// played in forward mode, or the frame playback counts down *from* in
    /// reverse mode. Fails with `UnsupportedFormat` for unknown extensions
    /// and for reverse MP3 (use [`ChunkStream::open_with_cache`] for that).
    pub fn open(
        path: &Path,
        start_frame: u64,
        direction: Direction,
        chunk_frames: usize,
    ) -> Result<Self> {
        let ext = check_extension(path)?;
        if ext == "mp3" && direction == Direction::Reverse {
            return Err(Error::UnsupportedFormat(
                "mp3 cannot be reverse-streamed live; transcode first".into(),
            ));
        }
        Self::open_inner(path, start_frame, direction, chunk_frames)
    }

    /// Open a chunk stream, routing reverse MP3 through the transcode cache.
    ///
    /// For any case other than reverse MP3 this behaves exactly like
    /// [`ChunkStream::open`]. Reverse MP3 transcodes the whole file to a
    /// cached WAV on first request and streams that in reverse.
    pub fn open_with_cache(
        path: &Path,
        track_id: u32,
        start_frame: u64,
        direction: Direction,
        chunk_frames: usize,
        cache: &TranscodeCache,
    ) -> Result<Self> {
        let ext = check_extension(path)?;
        if ext == "mp3" && direction == Direction::Reverse {
            let wav_path = cache.path_for(track_id, path)?;
            return Self::open_inner(&wav_path, start_frame, direction, chunk_frames);
        }
        Self::open_inner(path, start_frame, direction, chunk_frames)
    }

    fn open_inner(
        path: &Path,
        start_frame: u64,
        direction: Direction,
        chunk_frames: usize,
    ) -> Result<Self> {
        if chunk_frames == 0 {
            return Err(Error::InvalidTiming("chunk length must be > 0 frames".into()));
        }

        let (format, _) = open_format(path)?;
        let track = default_track(format.as_ref())?;
        let track_id = track.id;
        let source_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode(format!("{}: sample rate not found", path.display())))?;
        let source_channels = track
            .codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::Decode(format!("{}: channel count not found", path.display())))?;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create decoder: {}", e)))?;

        debug!(
            "Opened {} for {:?} playback at frame {} ({}Hz, {}ch)",
            path.display(),
            direction,
            start_frame,
            source_rate,
            source_channels
        );

        let mut stream = Self {
            format,
            decoder,
            track_id,
            source_rate,
            source_channels,
            direction,
            chunk_frames,
            pending: Vec::new(),
            skip_source_frames: 0,
            reverse_end_frame: start_frame,
            exhausted: false,
        };

        if direction == Direction::Forward && start_frame > 0 {
            stream.seek_to_engine_frame(start_frame)?;
        }
        Ok(stream)
    }

    /// Pull the next chunk. `Ok(None)` means the stream is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<PcmChunk>> {
        match self.direction {
            Direction::Forward => self.next_forward(),
            Direction::Reverse => self.next_reverse(),
        }
    }

    fn next_forward(&mut self) -> Result<Option<PcmChunk>> {
        let want = self.chunk_frames * 2;
        while self.pending.len() < want && !self.exhausted {
            self.decode_next_packet()?;
        }

        if self.pending.is_empty() {
            return Ok(None);
        }

        let take = self.pending.len().min(want);
        let samples: Vec<f32> = self.pending.drain(..take).collect();
        Ok(Some(PcmChunk {
            samples,
            sample_rate: TARGET_SAMPLE_RATE,
            channels: 2,
        }))
    }

    fn next_reverse(&mut self) -> Result<Option<PcmChunk>> {
        if self.reverse_end_frame == 0 {
            return Ok(None);
        }

        let end = self.reverse_end_frame;
        let start = end.saturating_sub(self.chunk_frames as u64);
        let span = (end - start) as usize;

        // Decode [start, end) forward, then flip it
        self.pending.clear();
        self.exhausted = false;
        self.seek_to_engine_frame(start)?;
        while self.pending.len() < span * 2 && !self.exhausted {
            self.decode_next_packet()?;
        }

        let take = self.pending.len().min(span * 2);
        let samples: Vec<f32> = self.pending.drain(..take).collect();
        self.pending.clear();
        self.reverse_end_frame = start;

        if samples.is_empty() {
            return Ok(None);
        }
        let mut chunk = PcmChunk {
            samples,
            sample_rate: TARGET_SAMPLE_RATE,
            channels: 2,
        };
        chunk.reverse();
        Ok(Some(chunk))
    }

    /// Seek the format reader so the next decoded frame is the given
    /// engine-rate frame. Container seeks are coarse; the remainder is
    /// discarded frame-exact during decode.
    fn seek_to_engine_frame(&mut self, engine_frame: u64) -> Result<()> {
        let seconds = engine_frame as f64 / TARGET_SAMPLE_RATE as f64;
        let target_source_frame =
            (seconds * self.source_rate as f64).round() as u64;

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(seconds),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Decode(format!("Seek failed: {}", e)))?;

        self.decoder.reset();
        self.skip_source_frames = target_source_frame.saturating_sub(seeked.actual_ts);
        Ok(())
    }

    /// Decode one packet into `pending`, applying the post-seek skip, the
    /// mono/stereo normalization, and the rate normalization.
    fn decode_next_packet(&mut self) -> Result<()> {
        let packet = match self.format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                self.exhausted = true;
                return Ok(());
            }
            Err(symphonia::core::errors::Error::ResetRequired) => {
                self.exhausted = true;
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Decode(format!("Error reading packet: {}", e)));
            }
        };

        if packet.track_id() != self.track_id {
            return Ok(());
        }

        let decoded = match self.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                // Recoverable per symphonia's contract: skip the packet
                warn!("Skipping undecodable packet: {}", e);
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Decode(format!("Decode error: {}", e)));
            }
        };

        let mut source_samples = Vec::new();
        convert_samples_to_f32(&decoded, &mut source_samples);

        // Stereo normalization at the source rate
        let mut stereo = match self.source_channels {
            1 => {
                let mut out = Vec::with_capacity(source_samples.len() * 2);
                for s in source_samples {
                    out.push(s);
                    out.push(s);
                }
                out
            }
            2 => source_samples,
            n => {
                // Multichannel sources keep their front pair
                let n = n as usize;
                let mut out = Vec::with_capacity(source_samples.len() / n * 2);
                for frame in source_samples.chunks_exact(n) {
                    out.push(frame[0]);
                    out.push(frame[1]);
                }
                out
            }
        };

        if self.skip_source_frames > 0 {
            let skip_samples = (self.skip_source_frames as usize * 2).min(stereo.len());
            stereo.drain(..skip_samples);
            self.skip_source_frames -= (skip_samples / 2) as u64;
            if stereo.is_empty() {
                return Ok(());
            }
        }

        if self.source_rate == TARGET_SAMPLE_RATE {
            self.pending.extend(stereo);
        } else {
            let resampled = Resampler::to_engine_rate(&stereo, self.source_rate, 2)?;
            self.pending.extend(resampled);
        }
        Ok(())
    }
}

/// Validate the file extension against the supported set and return it
/// lowercased.
fn check_extension(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "wav" | "ogg" | "mp3" => Ok(ext),
        _ => Err(Error::UnsupportedFormat(format!(
            "{}: only wav, ogg, and mp3 are playable",
            path.display()
        ))),
    }
}

fn open_format(path: &Path) -> Result<(Box<dyn FormatReader>, PathBuf)> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Decode(format!("Failed to open file {}: {}", path.display(), e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions {
                enable_gapless: true,
                ..Default::default()
            },
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::Decode(format!("Failed to probe format: {}", e)))?;

    Ok((probed.format, path.to_path_buf()))
}

fn default_track(
    format: &dyn FormatReader,
) -> Result<&symphonia::core::formats::Track> {
    format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::Decode("No audio track found".to_string()))
}

/// Convert a symphonia buffer to interleaved f32 samples normalized to
/// [-1.0, 1.0].
fn convert_samples_to_f32(decoded: &AudioBufferRef, output: &mut Vec<f32>) {
    macro_rules! interleave {
        ($buf:expr, $map:expr) => {{
            let channels = $buf.spec().channels.count();
            let frames = $buf.frames();
            output.reserve(frames * channels);
            for frame_idx in 0..frames {
                for ch_idx in 0..channels {
                    output.push($map($buf.chan(ch_idx)[frame_idx]));
                }
            }
        }};
    }

    match decoded {
        AudioBufferRef::F32(buf) => interleave!(buf, |s: f32| s),
        AudioBufferRef::F64(buf) => interleave!(buf, |s: f64| s as f32),
        AudioBufferRef::S32(buf) => interleave!(buf, |s: i32| s as f32 / i32::MAX as f32),
        AudioBufferRef::S16(buf) => interleave!(buf, |s: i16| s as f32 / i16::MAX as f32),
        AudioBufferRef::S8(buf) => interleave!(buf, |s: i8| s as f32 / i8::MAX as f32),
        AudioBufferRef::U32(buf) => {
            interleave!(buf, |s: u32| (s as i64 - (1 << 31)) as f32 / (1i64 << 31) as f32)
        }
        AudioBufferRef::U16(buf) => {
            interleave!(buf, |s: u16| (s as i32 - 32768) as f32 / 32768.0)
        }
        AudioBufferRef::U8(buf) => interleave!(buf, |s: u8| (s as i32 - 128) as f32 / 128.0),
        AudioBufferRef::S24(buf) => {
            interleave!(buf, |s: symphonia::core::sample::i24| s.inner() as f32 / 8_388_608.0)
        }
        AudioBufferRef::U24(buf) => {
            interleave!(buf, |s: symphonia::core::sample::u24| {
                (s.inner() as i32 - 8_388_608) as f32 / 8_388_608.0
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chunk::PcmChunk;
    use stasis_common::timing::{chunk_frames, ENGINE_RATE};

    /// Write a deterministic stereo WAV fixture and return its path.
    fn write_wav_fixture(dir: &std::path::Path, name: &str, frames: u32) -> PathBuf {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: ENGINE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            let t = i as f32 / ENGINE_RATE as f32;
            let sample = ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 12000.0) as i16;
            writer.write_sample(sample).unwrap();
            writer.write_sample(-sample).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = ChunkStream::open(
            Path::new("/tmp/song.flac"),
            0,
            Direction::Forward,
            2205,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn test_reverse_mp3_rejected_without_cache() {
        let err = ChunkStream::open(
            Path::new("/tmp/song.mp3"),
            0,
            Direction::Reverse,
            2205,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn test_probe_reports_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav_fixture(dir.path(), "probe.wav", ENGINE_RATE * 2);
        let info = probe_file(&path).unwrap();
        assert_eq!(info.sample_rate, ENGINE_RATE);
        assert_eq!(info.source_frames, ENGINE_RATE as u64 * 2);
        assert_eq!(info.engine_frames, ENGINE_RATE as u64 * 2);
        assert_eq!(info.length_ms(), 2000);
    }

    #[test]
    fn test_chunk_coverage() {
        // 500ms + 10ms extra: 11 chunks, last one shorter
        let per_chunk = chunk_frames(ENGINE_RATE) as u32;
        let total = per_chunk * 10 + per_chunk / 5;
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav_fixture(dir.path(), "coverage.wav", total);

        let mut stream =
            ChunkStream::open(&path, 0, Direction::Forward, per_chunk as usize).unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk().unwrap() {
            chunks.push(chunk);
        }

        assert_eq!(chunks.len(), 11);
        for chunk in &chunks[..10] {
            assert_eq!(chunk.frames(), per_chunk as usize);
        }
        assert_eq!(chunks[10].frames(), (per_chunk / 5) as usize);
        let total_frames: usize = chunks.iter().map(|c| c.frames()).sum();
        assert_eq!(total_frames, total as usize);
    }

    #[test]
    fn test_forward_from_offset_covers_tail() {
        let per_chunk = chunk_frames(ENGINE_RATE) as usize;
        let total = per_chunk * 8;
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav_fixture(dir.path(), "offset.wav", total as u32);

        let start = (per_chunk * 3) as u64;
        let mut stream = ChunkStream::open(&path, start, Direction::Forward, per_chunk).unwrap();
        let mut frames = 0;
        while let Some(chunk) = stream.next_chunk().unwrap() {
            frames += chunk.frames();
        }
        assert_eq!(frames, total - start as usize);
    }

    #[test]
    fn test_reverse_symmetry() {
        let per_chunk = chunk_frames(ENGINE_RATE) as usize;
        let total = per_chunk * 4 + 100;
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav_fixture(dir.path(), "symmetry.wav", total as u32);

        // Forward from 0, concatenated, then reversed as a whole
        let mut forward = ChunkStream::open(&path, 0, Direction::Forward, per_chunk).unwrap();
        let mut all = PcmChunk::silence(0, ENGINE_RATE, 2);
        while let Some(chunk) = forward.next_chunk().unwrap() {
            all.concat(&chunk).unwrap();
        }
        all.reverse();

        // Reverse from EOF, concatenated in yield order
        let mut reverse =
            ChunkStream::open(&path, total as u64, Direction::Reverse, per_chunk).unwrap();
        let mut reversed = PcmChunk::silence(0, ENGINE_RATE, 2);
        while let Some(chunk) = reverse.next_chunk().unwrap() {
            reversed.concat(&chunk).unwrap();
        }

        assert_eq!(all.frames(), reversed.frames());
        for (a, b) in all.samples.iter().zip(reversed.samples.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_reverse_stops_at_file_start() {
        let per_chunk = chunk_frames(ENGINE_RATE) as usize;
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav_fixture(dir.path(), "bof.wav", (per_chunk * 2) as u32);

        let mut stream =
            ChunkStream::open(&path, (per_chunk * 2) as u64, Direction::Reverse, per_chunk)
                .unwrap();
        assert!(stream.next_chunk().unwrap().is_some());
        assert!(stream.next_chunk().unwrap().is_some());
        assert!(stream.next_chunk().unwrap().is_none());
    }
}
