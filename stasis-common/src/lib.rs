//! # Stasis Common Library
//!
//! Shared code for the Stasis playback engine and its UI clients:
//! - Event types (EngineEvent enum) and the EventBus broadcaster
//! - Playback status enum used across the control surface
//! - Millisecond/frame timing conversions

pub mod events;
pub mod timing;

pub use events::{EngineEvent, EventBus, PlaybackStatus};
