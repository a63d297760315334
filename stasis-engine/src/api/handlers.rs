//! HTTP request handlers
//!
//! Every handler validates its body, writes typed fields on
//! [`crate::playback::ControlState`], and answers immediately; the playback
//! thread picks the change up within one chunk period. A malformed request
//! gets a 400 and the connection stays usable.

use crate::api::server::AppContext;
use crate::playback::control::PositionSnapshot;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use stasis_common::PlaybackStatus;
use tracing::{debug, warn};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct StateResponse {
    pub status: PlaybackStatus,
    pub paused: bool,
    pub speed: f64,
    pub volume: f64,
    pub fade_duration_ms: u64,
    pub reverse: bool,
    pub repeat: bool,
    pub position: PositionSnapshot,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Whether a status write actually landed; `false` means the engine's soft
/// lock dropped it mid-transition.
#[derive(Serialize)]
pub struct AppliedResponse {
    pub applied: bool,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn bad_request(msg: impl Into<String>) -> HandlerError {
    let msg = msg.into();
    warn!("Rejected request: {}", msg);
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: msg }))
}

fn not_found(msg: impl Into<String>) -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse { error: msg.into() }),
    )
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /playback/state
pub async fn get_state(State(ctx): State<AppContext>) -> Json<StateResponse> {
    Json(StateResponse {
        status: ctx.control.status(),
        paused: ctx.control.paused(),
        speed: ctx.control.speed(),
        volume: ctx.control.volume(),
        fade_duration_ms: ctx.control.fade_duration_ms(),
        reverse: ctx.control.reverse(),
        repeat: ctx.control.repeat(),
        position: ctx.control.position(),
    })
}

/// GET /playback/position
pub async fn get_position(State(ctx): State<AppContext>) -> Json<PositionSnapshot> {
    Json(ctx.control.position())
}

/// GET /playback/debug
pub async fn get_debug(State(ctx): State<AppContext>) -> String {
    ctx.control.debug_string()
}

#[derive(Serialize)]
pub struct VolumeResponse {
    pub volume: f64,
}

#[derive(Deserialize)]
pub struct VolumeRequest {
    pub volume: f64,
}

/// GET /audio/volume
pub async fn get_volume(State(ctx): State<AppContext>) -> Json<VolumeResponse> {
    Json(VolumeResponse {
        volume: ctx.control.volume(),
    })
}

/// POST /audio/volume
pub async fn set_volume(
    State(ctx): State<AppContext>,
    Json(req): Json<VolumeRequest>,
) -> Result<Json<VolumeResponse>, HandlerError> {
    ctx.control
        .set_volume(req.volume)
        .map_err(|e| bad_request(e.to_string()))?;
    debug!("Volume set to {}", req.volume);
    Ok(Json(VolumeResponse {
        volume: ctx.control.volume(),
    }))
}

/// POST /playback/play
///
/// Idempotent: playing while already playing is a no-op.
pub async fn play(State(ctx): State<AppContext>) -> StatusCode {
    ctx.control.set_paused(false);
    StatusCode::OK
}

/// POST /playback/pause
///
/// Idempotent: pausing while paused changes nothing.
pub async fn pause(State(ctx): State<AppContext>) -> StatusCode {
    ctx.control.set_paused(true);
    StatusCode::OK
}

#[derive(Deserialize)]
pub struct SeekRequest {
    pub position_ms: u64,
}

/// POST /playback/seek
pub async fn seek(
    State(ctx): State<AppContext>,
    Json(req): Json<SeekRequest>,
) -> Json<AppliedResponse> {
    ctx.control.set_seek_target_ms(req.position_ms);
    let applied = ctx.control.set_status(PlaybackStatus::Seek);
    Json(AppliedResponse { applied })
}

/// Resolve the track after/before `current` in library order, wrapping.
fn neighbor(track_ids: &[u32], current: u32, forward: bool) -> Option<u32> {
    if track_ids.is_empty() {
        return None;
    }
    let pos = track_ids.iter().position(|id| *id == current).unwrap_or(0);
    let n = track_ids.len();
    let next = if forward {
        (pos + 1) % n
    } else {
        (pos + n - 1) % n
    };
    Some(track_ids[next])
}

/// POST /playback/next
pub async fn next(State(ctx): State<AppContext>) -> Result<Json<AppliedResponse>, HandlerError> {
    let current = ctx.control.position().track_id;
    let target = neighbor(&ctx.track_ids, current, true)
        .ok_or_else(|| not_found("library is empty"))?;
    ctx.control.set_next_track(Some(target));
    let applied = ctx.control.set_status(PlaybackStatus::Skip);
    Ok(Json(AppliedResponse { applied }))
}

/// POST /playback/previous
pub async fn previous(
    State(ctx): State<AppContext>,
) -> Result<Json<AppliedResponse>, HandlerError> {
    let current = ctx.control.position().track_id;
    let target = neighbor(&ctx.track_ids, current, false)
        .ok_or_else(|| not_found("library is empty"))?;
    ctx.control.set_next_track(Some(target));
    let applied = ctx.control.set_status(PlaybackStatus::Skip);
    Ok(Json(AppliedResponse { applied }))
}

/// POST /playback/skip
pub async fn skip(State(ctx): State<AppContext>) -> Json<AppliedResponse> {
    ctx.control.set_next_track(None);
    let applied = ctx.control.set_status(PlaybackStatus::Skip);
    Json(AppliedResponse { applied })
}

/// How a selected track replaces the current one.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Crossfade,
    FadeIn,
    Skip,
}

#[derive(Deserialize)]
pub struct SelectRequest {
    pub track_id: u32,
    #[serde(default = "default_transition")]
    pub transition: TransitionKind,
}

fn default_transition() -> TransitionKind {
    TransitionKind::Crossfade
}

/// POST /playback/select
pub async fn select(
    State(ctx): State<AppContext>,
    Json(req): Json<SelectRequest>,
) -> Result<Json<AppliedResponse>, HandlerError> {
    if !ctx.track_ids.contains(&req.track_id) {
        return Err(not_found(format!("track {} not in library", req.track_id)));
    }
    ctx.control.set_next_track(Some(req.track_id));
    let status = match req.transition {
        TransitionKind::Crossfade => PlaybackStatus::ChangeTrack,
        TransitionKind::FadeIn => {
            // A fade-in select also resumes from pause; that is its purpose
            ctx.control.set_paused(false);
            PlaybackStatus::FadeIn
        }
        TransitionKind::Skip => PlaybackStatus::Skip,
    };
    let applied = ctx.control.set_status(status);
    Ok(Json(AppliedResponse { applied }))
}

/// POST /playback/timestop
pub async fn timestop(State(ctx): State<AppContext>) -> Json<AppliedResponse> {
    let applied = ctx.control.set_status(PlaybackStatus::Zawarudo);
    Json(AppliedResponse { applied })
}

#[derive(Deserialize)]
pub struct SpeedRequest {
    pub speed: f64,
}

/// POST /playback/speed
pub async fn set_speed(
    State(ctx): State<AppContext>,
    Json(req): Json<SpeedRequest>,
) -> Result<StatusCode, HandlerError> {
    ctx.control
        .set_speed(req.speed)
        .map_err(|e| bad_request(e.to_string()))?;
    debug!("Speed set to {}", req.speed);
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
pub struct FadeDurationRequest {
    pub fade_duration_ms: u64,
}

/// POST /playback/fade_duration
pub async fn set_fade_duration(
    State(ctx): State<AppContext>,
    Json(req): Json<FadeDurationRequest>,
) -> StatusCode {
    ctx.control.set_base_fade_duration_ms(req.fade_duration_ms);
    StatusCode::OK
}

#[derive(Deserialize)]
pub struct ReverseRequest {
    pub reverse: bool,
}

/// POST /playback/reverse
pub async fn set_reverse(
    State(ctx): State<AppContext>,
    Json(req): Json<ReverseRequest>,
) -> StatusCode {
    ctx.control.set_reverse(req.reverse);
    StatusCode::OK
}

#[derive(Deserialize)]
pub struct RepeatRequest {
    pub repeat: bool,
}

/// POST /playback/repeat
pub async fn set_repeat(
    State(ctx): State<AppContext>,
    Json(req): Json<RepeatRequest>,
) -> StatusCode {
    ctx.control.set_repeat(req.repeat);
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbor_wraps() {
        let ids = vec![3, 7, 9];
        assert_eq!(neighbor(&ids, 3, true), Some(7));
        assert_eq!(neighbor(&ids, 9, true), Some(3));
        assert_eq!(neighbor(&ids, 3, false), Some(9));
        assert_eq!(neighbor(&ids, 7, false), Some(3));
    }

    #[test]
    fn test_neighbor_unknown_current_starts_at_front() {
        let ids = vec![3, 7, 9];
        assert_eq!(neighbor(&ids, 99, true), Some(7));
    }

    #[test]
    fn test_neighbor_empty() {
        assert_eq!(neighbor(&[], 0, true), None);
    }

    #[test]
    fn test_transition_kind_parses() {
        let req: SelectRequest =
            serde_json::from_str(r#"{"track_id": 2, "transition": "fade_in"}"#).unwrap();
        assert!(matches!(req.transition, TransitionKind::FadeIn));
        // Transition defaults to crossfade
        let req: SelectRequest = serde_json::from_str(r#"{"track_id": 2}"#).unwrap();
        assert!(matches!(req.transition, TransitionKind::Crossfade));
    }
}
