//! HTTP control surface
//!
//! Axum server exposing playback control, state queries, and the SSE event
//! stream. Handlers only touch [`crate::playback::ControlState`] and the
//! event bus; the playback thread observes the written state at chunk
//! granularity.

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{router, AppContext};
