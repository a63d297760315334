//! HTTP server setup and routing

use crate::playback::ControlState;
use axum::{
    routing::{get, post},
    Router,
};
use stasis_common::EventBus;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application context passed to all handlers.
///
/// `AppContext` implements Clone, which gives us `FromRef<AppContext>` for
/// free via Axum's blanket implementation.
#[derive(Clone)]
pub struct AppContext {
    pub control: Arc<ControlState>,
    pub events: EventBus,
    /// Library track ids in playback order, fixed after the startup scan.
    /// Handlers use it to resolve next/previous without touching the
    /// library, which the playback thread owns.
    pub track_ids: Arc<Vec<u32>>,
}

/// Build the control-surface router. The caller binds the socket and
/// serves it, which keeps shutdown policy out of this module.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        // Health
        .route("/health", get(super::handlers::health))
        // State queries
        .route("/playback/state", get(super::handlers::get_state))
        .route("/playback/position", get(super::handlers::get_position))
        .route("/playback/debug", get(super::handlers::get_debug))
        // Volume
        .route("/audio/volume", get(super::handlers::get_volume))
        .route("/audio/volume", post(super::handlers::set_volume))
        // Playback control
        .route("/playback/play", post(super::handlers::play))
        .route("/playback/pause", post(super::handlers::pause))
        .route("/playback/seek", post(super::handlers::seek))
        .route("/playback/next", post(super::handlers::next))
        .route("/playback/previous", post(super::handlers::previous))
        .route("/playback/skip", post(super::handlers::skip))
        .route("/playback/select", post(super::handlers::select))
        .route("/playback/timestop", post(super::handlers::timestop))
        .route("/playback/speed", post(super::handlers::set_speed))
        .route("/playback/fade_duration", post(super::handlers::set_fade_duration))
        .route("/playback/reverse", post(super::handlers::set_reverse))
        .route("/playback/repeat", post(super::handlers::set_repeat))
        // SSE event stream
        .route("/events", get(super::sse::event_stream))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
