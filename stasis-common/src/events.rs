//! Event types for the Stasis engine
//!
//! Provides the shared event definitions and EventBus used by the engine
//! process and any UI client listening on the SSE stream.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Playback status reported by (and written to) the engine.
///
/// This is the single source of truth for what the playback loop does next.
/// Several variants are transient commands (`ChangeTrack`, `Skip`, `Seek`,
/// `FadeIn`, `Zawarudo`): the loop observes them within one chunk period and
/// replaces them with an internal state.
///
/// `Paused` is deliberately *not* a status: pausing is an orthogonal flag so
/// that the status which resumes after the pause is never lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    /// Engine constructed, loop not yet consuming chunks
    Idle,
    /// Normal sequential playback
    Playing,
    /// External request: crossfade into the queued next track
    ChangeTrack,
    /// External request: jump to the next track with no fade
    Skip,
    /// Crossfade in progress (internal)
    Transition,
    /// A second crossfade was requested mid-transition (internal)
    OverrideTransition,
    /// Crossfading the current track into its own beginning (internal)
    Repeat,
    /// External request: reopen the current track at the seek target
    Seek,
    /// External request: fade in from silence (track selected while paused)
    FadeIn,
    /// External request: run the scripted time-stop sequence
    Zawarudo,
    /// Terminal: loop exits, no further transitions
    Stopped,
}

impl std::fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::ChangeTrack => "change_track",
            PlaybackStatus::Skip => "skip",
            PlaybackStatus::Transition => "transition",
            PlaybackStatus::OverrideTransition => "override_transition",
            PlaybackStatus::Repeat => "repeat",
            PlaybackStatus::Seek => "seek",
            PlaybackStatus::FadeIn => "fade_in",
            PlaybackStatus::Zawarudo => "zawarudo",
            PlaybackStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Engine event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
/// All engine→UI notifications use this central enum so clients can match
/// exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine finished initialization; the control surface is live
    Ready,

    /// Playback status changed
    StatusChanged {
        old_status: PlaybackStatus,
        new_status: PlaybackStatus,
    },

    /// A different track became the current track
    TrackChanged {
        track_id: u32,
        /// Track length in milliseconds at 1.0x speed
        length_ms: u64,
        total_frames: u64,
    },

    /// Periodic position report during playback
    PositionUpdate {
        track_id: u32,
        position_ms: u64,
        length_ms: u64,
    },

    /// The time-stop sequence reached the point where the UI should start
    /// its visual effect
    VisualEffectCue,

    /// The engine loop died; the UI should shut down rather than keep
    /// polling a dead process
    EngineFailed { reason: String },
}

impl EngineEvent {
    /// SSE event name for this event type
    pub fn event_name(&self) -> &'static str {
        match self {
            EngineEvent::Ready => "ready",
            EngineEvent::StatusChanged { .. } => "status_changed",
            EngineEvent::TrackChanged { .. } => "track_changed",
            EngineEvent::PositionUpdate { .. } => "position_update",
            EngineEvent::VisualEffectCue => "visual_effect_cue",
            EngineEvent::EngineFailed { .. } => "engine_failed",
        }
    }
}

/// One-to-many event broadcaster over `tokio::sync::broadcast`.
///
/// Lagging receivers drop the oldest events rather than blocking the sender;
/// the engine loop must never wait on a slow UI.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event; errors when no receiver is subscribed
    pub fn emit(
        &self,
        event: EngineEvent,
    ) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Broadcast an event, ignoring the no-subscriber case
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(PlaybackStatus::Playing.to_string(), "playing");
        assert_eq!(PlaybackStatus::Zawarudo.to_string(), "zawarudo");
        assert_eq!(
            PlaybackStatus::OverrideTransition.to_string(),
            "override_transition"
        );
    }

    #[test]
    fn test_status_serde_round_trip() {
        let json = serde_json::to_string(&PlaybackStatus::ChangeTrack).unwrap();
        assert_eq!(json, "\"change_track\"");
        let back: PlaybackStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PlaybackStatus::ChangeTrack);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EngineEvent::Ready.event_name(), "ready");
        assert_eq!(EngineEvent::VisualEffectCue.event_name(), "visual_effect_cue");
    }

    #[tokio::test]
    async fn test_eventbus_emit_with_subscriber() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(EngineEvent::Ready).unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::Ready => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_eventbus_emit_lossy_without_subscribers() {
        let bus = EventBus::new(10);
        // Must not panic or error
        bus.emit_lossy(EngineEvent::VisualEffectCue);
    }
}
