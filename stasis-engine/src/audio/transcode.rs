//! Reverse-playback transcode cache
//!
//! MP3 cannot be streamed backward live, so the first reverse request for a
//! track transcodes the whole file once to a seekable WAV kept on disk. The
//! cache is bounded: only the 3 most recently modified transcodes survive an
//! insertion, so reverse-playing a large library cannot grow the disk
//! without limit.

use crate::audio::decoder::{ChunkStream, Direction};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Number of transcoded files retained after eviction.
pub const KEEP_FILES: usize = 3;

/// On-disk cache of WAV transcodes, keyed by track id.
#[derive(Debug, Clone)]
pub struct TranscodeCache {
    dir: PathBuf,
}

impl TranscodeCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Return the cached WAV path for a track, transcoding `source` on a
    /// cache miss and evicting the oldest-modified entries beyond
    /// [`KEEP_FILES`].
    pub fn path_for(&self, track_id: u32, source: &Path) -> Result<PathBuf> {
        let target = self.entry_path(track_id);
        if target.exists() {
            debug!("Transcode cache hit for track {}", track_id);
            return Ok(target);
        }

        info!(
            "Transcoding {} to {} for reverse playback",
            source.display(),
            target.display()
        );
        self.transcode(source, &target)?;
        self.evict()?;
        Ok(target)
    }

    /// Path an entry would live at, whether or not it exists yet.
    pub fn entry_path(&self, track_id: u32) -> PathBuf {
        self.dir.join(format!("{}.wav", track_id))
    }

    /// Decode the whole source file and write it as 16-bit stereo WAV at
    /// the engine rate.
    fn transcode(&self, source: &Path, target: &Path) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: crate::audio::resample::TARGET_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(target, spec)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        // One-second decode granularity; this is a bulk copy, not playback
        let mut stream = ChunkStream::open(
            source,
            0,
            Direction::Forward,
            crate::audio::resample::TARGET_SAMPLE_RATE as usize,
        )?;
        while let Some(chunk) = stream.next_chunk()? {
            for s in &chunk.samples {
                let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer
                    .write_sample(v)
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            }
        }
        writer
            .finalize()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(())
    }

    /// Delete cached WAVs beyond the newest [`KEEP_FILES`], oldest modified
    /// first.
    fn evict(&self) -> Result<()> {
        let mut entries: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wav") {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            entries.push((path, modified));
        }

        if entries.len() <= KEEP_FILES {
            return Ok(());
        }

        // Newest first; everything past the keep window goes
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _) in entries.drain(KEEP_FILES..) {
            debug!("Evicting transcode {}", path.display());
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(b"RIFF").unwrap();
        drop(f);
        let mtime = std::time::SystemTime::now() - std::time::Duration::from_secs(age_secs);
        let f = File::options().write(true).open(&path).unwrap();
        f.set_modified(mtime).unwrap();
        path
    }

    #[test]
    fn test_entry_path_is_keyed_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TranscodeCache::new(dir.path()).unwrap();
        assert_eq!(cache.entry_path(7), dir.path().join("7.wav"));
    }

    #[test]
    fn test_evict_keeps_three_newest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TranscodeCache::new(dir.path()).unwrap();

        let oldest = touch(dir.path(), "1.wav", 400);
        let old = touch(dir.path(), "2.wav", 300);
        let newer = touch(dir.path(), "3.wav", 200);
        let newest = touch(dir.path(), "4.wav", 100);

        cache.evict().unwrap();

        assert!(!oldest.exists());
        assert!(old.exists());
        assert!(newer.exists());
        assert!(newest.exists());
    }

    #[test]
    fn test_evict_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TranscodeCache::new(dir.path()).unwrap();

        touch(dir.path(), "1.wav", 500);
        touch(dir.path(), "2.wav", 400);
        touch(dir.path(), "3.wav", 300);
        touch(dir.path(), "4.wav", 200);
        let stray = dir.path().join("notes.txt");
        File::create(&stray).unwrap();

        cache.evict().unwrap();
        assert!(stray.exists());
        let wavs = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("wav")
            })
            .count();
        assert_eq!(wavs, KEEP_FILES);
    }

    #[test]
    fn test_evict_noop_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TranscodeCache::new(dir.path()).unwrap();
        let a = touch(dir.path(), "1.wav", 100);
        let b = touch(dir.path(), "2.wav", 50);
        cache.evict().unwrap();
        assert!(a.exists() && b.exists());
    }
}
