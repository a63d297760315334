//! # Stasis Playback Engine (stasis-engine)
//!
//! Streaming audio playback engine with sample-accurate crossfading, reverse
//! playback, variable speed, and a scripted time-stop set-piece.
//!
//! **Purpose:** Decode audio files chunk by chunk, run the playback state
//! machine, crossfade between tracks, and expose an HTTP/SSE control surface
//! for a separate UI process.
//!
//! **Architecture:** Single-stream audio pipeline using symphonia + rubato +
//! cpal, processed in ~50 ms chunks so external commands take effect within
//! one chunk period.

pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod library;
pub mod playback;

pub use error::{Error, Result};
