//! Track library
//!
//! A lookup table of playable files with pre-probed lengths, plus the
//! playlist cursor the engine walks. Every track is probed exactly once:
//! the results persist in a JSON manifest beside the music folder, and a
//! later launch only re-probes files whose size or mtime changed. Nothing
//! in the playback hot path ever probes a file.

use crate::audio::decoder::probe_file;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

const MANIFEST_NAME: &str = ".stasis-manifest.json";

/// One playable track with authoritative, pre-computed facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Stable numeric id, also the key for filesystem caches
    pub id: u32,
    pub path: PathBuf,
    /// Length in milliseconds at 1.0x speed
    pub length_ms: u64,
    /// Frame count at the engine rate
    pub total_frames: u64,
    /// Source sample rate in Hz
    pub sample_rate: u32,
    /// File facts used to detect changes without re-probing
    mtime_secs: u64,
    size_bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    tracks: Vec<TrackInfo>,
}

/// The track lookup table and playlist cursor.
///
/// Fully populated before playback begins; the engine only ever reads it.
#[derive(Debug)]
pub struct Library {
    music_dir: PathBuf,
    /// id → track, iteration order is id order
    tracks: BTreeMap<u32, TrackInfo>,
    /// Current track id; `None` only when the library is empty
    cursor: Option<u32>,
}

impl Library {
    /// Scan a music folder, probing new or changed files and reusing
    /// manifest entries for unchanged ones.
    pub fn scan(music_dir: impl Into<PathBuf>) -> Result<Self> {
        let music_dir = music_dir.into();
        let manifest = Self::load_manifest(&music_dir);
        let mut known: BTreeMap<PathBuf, TrackInfo> = manifest
            .tracks
            .into_iter()
            .map(|t| (t.path.clone(), t))
            .collect();

        let mut tracks = BTreeMap::new();
        let mut next_id = known.values().map(|t| t.id + 1).max().unwrap_or(0);

        let mut paths: Vec<PathBuf> = fs::read_dir(&music_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()),
                    Some(ref ext) if ext == "wav" || ext == "ogg" || ext == "mp3"
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            let meta = fs::metadata(&path)?;
            let mtime_secs = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let size_bytes = meta.len();

            if let Some(entry) = known.remove(&path) {
                if entry.mtime_secs == mtime_secs && entry.size_bytes == size_bytes {
                    debug!("Manifest hit for {}", path.display());
                    tracks.insert(entry.id, entry);
                    continue;
                }
            }

            match probe_file(&path) {
                Ok(info) => {
                    let track = TrackInfo {
                        id: next_id,
                        path: path.clone(),
                        length_ms: info.length_ms(),
                        total_frames: info.engine_frames,
                        sample_rate: info.sample_rate,
                        mtime_secs,
                        size_bytes,
                    };
                    info!(
                        "Probed {} ({} ms, track {})",
                        path.display(),
                        track.length_ms,
                        track.id
                    );
                    tracks.insert(next_id, track);
                    next_id += 1;
                }
                Err(e) => {
                    warn!("Skipping unreadable file {}: {}", path.display(), e);
                }
            }
        }

        let cursor = tracks.keys().next().copied();
        let library = Self {
            music_dir,
            tracks,
            cursor,
        };
        library.save_manifest()?;
        Ok(library)
    }

    fn manifest_path(music_dir: &Path) -> PathBuf {
        music_dir.join(MANIFEST_NAME)
    }

    fn load_manifest(music_dir: &Path) -> Manifest {
        let path = Self::manifest_path(music_dir);
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("Discarding corrupt manifest {}: {}", path.display(), e);
                Manifest::default()
            }),
            Err(_) => Manifest::default(),
        }
    }

    /// Persist the manifest. Called at scan time and from explicit
    /// checkpoints, never implicitly on mutation.
    pub fn save_manifest(&self) -> Result<()> {
        let manifest = Manifest {
            tracks: self.tracks.values().cloned().collect(),
        };
        let text = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::Library(format!("Manifest serialization failed: {}", e)))?;
        fs::write(Self::manifest_path(&self.music_dir), text)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn get(&self, id: u32) -> Option<&TrackInfo> {
        self.tracks.get(&id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackInfo> {
        self.tracks.values()
    }

    /// Track under the cursor.
    pub fn current(&self) -> Option<&TrackInfo> {
        self.cursor.and_then(|id| self.tracks.get(&id))
    }

    /// Track after the cursor, wrapping, without moving the cursor.
    pub fn peek_next(&self) -> Option<&TrackInfo> {
        let ids: Vec<u32> = self.tracks.keys().copied().collect();
        let pos = ids.iter().position(|id| Some(*id) == self.cursor)?;
        self.tracks.get(&ids[(pos + 1) % ids.len()])
    }

    /// Track before the cursor, wrapping, without moving the cursor.
    pub fn peek_previous(&self) -> Option<&TrackInfo> {
        let ids: Vec<u32> = self.tracks.keys().copied().collect();
        let pos = ids.iter().position(|id| Some(*id) == self.cursor)?;
        self.tracks.get(&ids[(pos + ids.len() - 1) % ids.len()])
    }

    /// Move the cursor forward and return the new current track.
    pub fn advance(&mut self) -> Option<&TrackInfo> {
        self.cursor = self.peek_next().map(|t| t.id);
        self.current()
    }

    /// Move the cursor backward and return the new current track.
    pub fn retreat(&mut self) -> Option<&TrackInfo> {
        self.cursor = self.peek_previous().map(|t| t.id);
        self.current()
    }

    /// Point the cursor at a specific track.
    pub fn set_current(&mut self, id: u32) -> Result<&TrackInfo> {
        if !self.tracks.contains_key(&id) {
            return Err(Error::NotFound(format!("track {} not in library", id)));
        }
        self.cursor = Some(id);
        Ok(&self.tracks[&id])
    }
}
