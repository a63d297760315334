//! Playback coordination
//!
//! The state machine (`engine`), the crossfade engine (`fader`), the shared
//! control state polled by the loop (`control`), and the scripted time-stop
//! sequence (`timestop`).

pub mod control;
pub mod engine;
pub mod fader;
pub mod timestop;

pub use control::ControlState;
pub use engine::PlaybackEngine;
pub use fader::{step_fade, ChunkSource, FadeMode, FadeStep, StepFade};
pub use timestop::TimeStopAssets;
