//! Saved playback state
//!
//! A small fixed-layout binary file that survives restarts: which track was
//! playing, where in it, and the user-tunable knobs. The format is 56 bytes,
//! little-endian throughout:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "mrrp"
//!      4     4  u32 track id
//!      8     4  u32 position in ms
//!     12     8  u64 total frames of the track
//!     20     1  flags (bit0 reverse, bit1 shuffle, bit2 repeat)
//!     21     1  sort mode
//!     22     4  primary color RGBA
//!     26     4  secondary color RGBA
//!     30     2  u16 fade duration in ms
//!     32     8  f64 track length in ms
//!     40     8  f64 speed
//!     48     8  f64 volume
//! ```
//!
//! A missing, truncated, or corrupt file is never fatal; the engine just
//! starts from defaults.

use crate::error::Result;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const MAGIC: [u8; 4] = *b"mrrp";
const STATE_LEN: usize = 56;

const FLAG_REVERSE: u8 = 0b001;
const FLAG_SHUFFLE: u8 = 0b010;
const FLAG_REPEAT: u8 = 0b100;

/// Everything the engine restores on launch.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedState {
    pub track_id: u32,
    pub position_ms: u32,
    pub total_frames: u64,
    pub reverse: bool,
    pub shuffle: bool,
    pub repeat: bool,
    pub sort_mode: u8,
    /// UI accent colors, carried through verbatim
    pub primary_color: [u8; 4],
    pub secondary_color: [u8; 4],
    pub fade_duration_ms: u16,
    pub track_length_ms: f64,
    pub speed: f64,
    pub volume: f64,
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            track_id: 0,
            position_ms: 0,
            total_frames: 0,
            reverse: false,
            shuffle: false,
            repeat: false,
            sort_mode: 0,
            primary_color: [0xff, 0xff, 0xff, 0xff],
            secondary_color: [0x00, 0x00, 0x00, 0xff],
            fade_duration_ms: 3000,
            track_length_ms: 0.0,
            speed: 1.0,
            volume: 1.0,
        }
    }
}

impl SavedState {
    /// Serialize to the fixed 56-byte layout.
    pub fn to_bytes(&self) -> [u8; STATE_LEN] {
        let mut buf = [0u8; STATE_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.track_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.position_ms.to_le_bytes());
        buf[12..20].copy_from_slice(&self.total_frames.to_le_bytes());

        let mut flags = 0u8;
        if self.reverse {
            flags |= FLAG_REVERSE;
        }
        if self.shuffle {
            flags |= FLAG_SHUFFLE;
        }
        if self.repeat {
            flags |= FLAG_REPEAT;
        }
        buf[20] = flags;
        buf[21] = self.sort_mode;
        buf[22..26].copy_from_slice(&self.primary_color);
        buf[26..30].copy_from_slice(&self.secondary_color);
        buf[30..32].copy_from_slice(&self.fade_duration_ms.to_le_bytes());
        buf[32..40].copy_from_slice(&self.track_length_ms.to_le_bytes());
        buf[40..48].copy_from_slice(&self.speed.to_le_bytes());
        buf[48..56].copy_from_slice(&self.volume.to_le_bytes());
        buf
    }

    /// Parse the fixed layout; `None` on any structural problem.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < STATE_LEN || data[0..4] != MAGIC {
            return None;
        }
        let flags = data[20];
        let state = Self {
            track_id: u32::from_le_bytes(data[4..8].try_into().ok()?),
            position_ms: u32::from_le_bytes(data[8..12].try_into().ok()?),
            total_frames: u64::from_le_bytes(data[12..20].try_into().ok()?),
            reverse: flags & FLAG_REVERSE != 0,
            shuffle: flags & FLAG_SHUFFLE != 0,
            repeat: flags & FLAG_REPEAT != 0,
            sort_mode: data[21],
            primary_color: data[22..26].try_into().ok()?,
            secondary_color: data[26..30].try_into().ok()?,
            fade_duration_ms: u16::from_le_bytes(data[30..32].try_into().ok()?),
            track_length_ms: f64::from_le_bytes(data[32..40].try_into().ok()?),
            speed: f64::from_le_bytes(data[40..48].try_into().ok()?),
            volume: f64::from_le_bytes(data[48..56].try_into().ok()?),
        };
        // Reject values that could wedge the engine on restore
        if !(state.speed > 0.0 && state.speed.is_finite()) {
            return None;
        }
        if !(0.0..=1.0).contains(&state.volume) {
            return None;
        }
        Some(state)
    }

    /// Load saved state from disk. Missing or corrupt files yield `None`.
    pub fn load(path: &Path) -> Option<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(_) => {
                debug!("No saved state at {}", path.display());
                return None;
            }
        };
        match Self::from_bytes(&data) {
            Some(state) => Some(state),
            None => {
                warn!("Ignoring corrupt saved state at {}", path.display());
                None
            }
        }
    }

    /// Persist to disk, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes())?;
        Ok(())
    }
}
