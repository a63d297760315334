//! Shared control state
//!
//! The closed set of attributes the control surface may read and write. The
//! playback loop polls these once per chunk; API handlers write them from
//! the server threads. This replaces any notion of reflective attribute
//! dispatch: everything external code can touch is a typed method here.
//!
//! Locking discipline: the pause flag sits behind a mutex because the audio
//! thread busy-waits on it while the control thread writes it. The status
//! has a *soft lock* on top: while an automatic transition is in progress,
//! external status writes become no-ops so they cannot clobber the engine's
//! own post-transition reset.

use crate::error::{Error, Result};
use stasis_common::PlaybackStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Snapshot of the playback position, refreshed by the loop every chunk.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PositionSnapshot {
    pub track_id: u32,
    pub position_ms: u64,
    pub frame_position: u64,
    pub length_ms: u64,
    pub total_frames: u64,
}

/// Engine attributes shared between the playback thread and the API.
#[derive(Debug)]
pub struct ControlState {
    status: Mutex<PlaybackStatus>,
    status_locked: AtomicBool,
    pause_flag: Mutex<bool>,
    /// Speed stored as f64 bits; the loop detects changes by comparison
    speed_bits: AtomicU64,
    volume_bits: AtomicU64,
    base_fade_duration_ms: AtomicU64,
    reverse: AtomicBool,
    repeat: AtomicBool,
    seek_target_ms: AtomicU64,
    next_track: Mutex<Option<u32>>,
    position: Mutex<PositionSnapshot>,
    debug_string: Mutex<String>,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(PlaybackStatus::Idle),
            status_locked: AtomicBool::new(false),
            pause_flag: Mutex::new(false),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            volume_bits: AtomicU64::new(1.0f64.to_bits()),
            base_fade_duration_ms: AtomicU64::new(3000),
            reverse: AtomicBool::new(false),
            repeat: AtomicBool::new(false),
            seek_target_ms: AtomicU64::new(0),
            next_track: Mutex::new(None),
            position: Mutex::new(PositionSnapshot::default()),
            debug_string: Mutex::new(String::new()),
        }
    }

    // --- status ---

    pub fn status(&self) -> PlaybackStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// External status write; a no-op while the soft lock is engaged.
    /// Returns whether the write was applied.
    pub fn set_status(&self, new_status: PlaybackStatus) -> bool {
        if self.status_locked.load(Ordering::Acquire) {
            return false;
        }
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = new_status;
        true
    }

    /// Engage or release the soft lock around automatic transitions.
    pub fn lock_status(&self, locked: bool) {
        self.status_locked.store(locked, Ordering::Release);
    }

    /// Engine-internal status write, bypassing the soft lock.
    pub fn force_status(&self, new_status: PlaybackStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = new_status;
    }

    // --- pause ---

    pub fn paused(&self) -> bool {
        *self.pause_flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_paused(&self, paused: bool) {
        *self.pause_flag.lock().unwrap_or_else(|e| e.into_inner()) = paused;
    }

    // --- speed / volume ---

    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    pub fn set_speed(&self, speed: f64) -> Result<()> {
        if !(speed > 0.0 && speed.is_finite()) {
            return Err(Error::BadRequest(format!("invalid speed {}", speed)));
        }
        self.speed_bits.store(speed.to_bits(), Ordering::Release);
        Ok(())
    }

    pub fn volume(&self) -> f64 {
        f64::from_bits(self.volume_bits.load(Ordering::Acquire))
    }

    pub fn set_volume(&self, volume: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::BadRequest(format!("invalid volume {}", volume)));
        }
        self.volume_bits.store(volume.to_bits(), Ordering::Release);
        Ok(())
    }

    // --- fade / reverse / seek ---

    pub fn base_fade_duration_ms(&self) -> u64 {
        self.base_fade_duration_ms.load(Ordering::Acquire)
    }

    pub fn set_base_fade_duration_ms(&self, ms: u64) {
        self.base_fade_duration_ms.store(ms, Ordering::Release);
    }

    /// Effective fade duration: the base value scaled by the current speed,
    /// so a fade spans the same wall-clock time at any speed.
    pub fn fade_duration_ms(&self) -> u64 {
        (self.base_fade_duration_ms() as f64 * self.speed()) as u64
    }

    pub fn reverse(&self) -> bool {
        self.reverse.load(Ordering::Acquire)
    }

    pub fn set_reverse(&self, reverse: bool) {
        self.reverse.store(reverse, Ordering::Release);
    }

    pub fn repeat(&self) -> bool {
        self.repeat.load(Ordering::Acquire)
    }

    pub fn set_repeat(&self, repeat: bool) {
        self.repeat.store(repeat, Ordering::Release);
    }

    pub fn seek_target_ms(&self) -> u64 {
        self.seek_target_ms.load(Ordering::Acquire)
    }

    pub fn set_seek_target_ms(&self, ms: u64) {
        self.seek_target_ms.store(ms, Ordering::Release);
    }

    // --- track selection ---

    pub fn next_track(&self) -> Option<u32> {
        *self.next_track.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_next_track(&self, track_id: Option<u32>) {
        *self.next_track.lock().unwrap_or_else(|e| e.into_inner()) = track_id;
    }

    /// Atomically take the queued next track, leaving `None`.
    pub fn take_next_track(&self) -> Option<u32> {
        self.next_track
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // --- position / debug ---

    pub fn position(&self) -> PositionSnapshot {
        *self.position.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_position(&self, snapshot: PositionSnapshot) {
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    pub fn debug_string(&self) -> String {
        self.debug_string
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_debug_string(&self, s: String) {
        *self.debug_string.lock().unwrap_or_else(|e| e.into_inner()) = s;
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let state = ControlState::new();
        assert_eq!(state.status(), PlaybackStatus::Idle);
        assert!(!state.paused());
        assert_eq!(state.speed(), 1.0);
        assert_eq!(state.volume(), 1.0);
        assert_eq!(state.base_fade_duration_ms(), 3000);
        assert!(!state.reverse());
        assert!(state.next_track().is_none());
    }

    #[test]
    fn test_soft_lock_blocks_external_writes() {
        let state = ControlState::new();
        state.force_status(PlaybackStatus::Playing);

        state.lock_status(true);
        assert!(!state.set_status(PlaybackStatus::Skip));
        assert_eq!(state.status(), PlaybackStatus::Playing);

        // Internal writes bypass the lock
        state.force_status(PlaybackStatus::Transition);
        assert_eq!(state.status(), PlaybackStatus::Transition);

        state.lock_status(false);
        assert!(state.set_status(PlaybackStatus::Skip));
        assert_eq!(state.status(), PlaybackStatus::Skip);
    }

    #[test]
    fn test_speed_validation() {
        let state = ControlState::new();
        assert!(state.set_speed(0.0).is_err());
        assert!(state.set_speed(-2.0).is_err());
        assert!(state.set_speed(f64::INFINITY).is_err());
        state.set_speed(1.5).unwrap();
        assert_eq!(state.speed(), 1.5);
    }

    #[test]
    fn test_fade_duration_scales_with_speed() {
        let state = ControlState::new();
        state.set_base_fade_duration_ms(3000);
        state.set_speed(0.5).unwrap();
        assert_eq!(state.fade_duration_ms(), 1500);
        state.set_speed(2.0).unwrap();
        assert_eq!(state.fade_duration_ms(), 6000);
    }

    #[test]
    fn test_volume_validation() {
        let state = ControlState::new();
        assert!(state.set_volume(1.5).is_err());
        assert!(state.set_volume(-0.1).is_err());
        state.set_volume(0.4).unwrap();
        assert_eq!(state.volume(), 0.4);
    }

    #[test]
    fn test_take_next_track() {
        let state = ControlState::new();
        state.set_next_track(Some(5));
        assert_eq!(state.take_next_track(), Some(5));
        assert_eq!(state.next_track(), None);
    }
}
