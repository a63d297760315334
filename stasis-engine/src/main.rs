//! Stasis engine - main entry point
//!
//! Wires the pieces together: scan the library, restore saved state, start
//! the playback loop on its own thread, and serve the HTTP control surface
//! on the tokio runtime. The playback thread is deliberately a plain OS
//! thread: the loop blocks on the audio device for backpressure and must
//! never run on the async executor.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stasis_common::{EngineEvent, EventBus, PlaybackStatus};
use stasis_engine::api;
use stasis_engine::audio::{CpalSink, TranscodeCache};
use stasis_engine::config::SavedState;
use stasis_engine::library::Library;
use stasis_engine::playback::{ControlState, PlaybackEngine, TimeStopAssets};

/// Command-line arguments for the stasis engine
#[derive(Parser, Debug)]
#[command(name = "stasis-engine")]
#[command(about = "Real-time streaming audio playback engine")]
#[command(version)]
struct Args {
    /// Port the control surface listens on
    #[arg(short, long, default_value = "5750", env = "STASIS_PORT")]
    port: u16,

    /// Folder containing the music files
    #[arg(short, long, env = "STASIS_MUSIC_DIR")]
    music_dir: PathBuf,

    /// Folder with the time-stop sound assets (default: <music_dir>/assets)
    #[arg(long, env = "STASIS_ASSETS_DIR")]
    assets_dir: Option<PathBuf>,

    /// Transcode cache folder (default: <music_dir>/.stasis-cache)
    #[arg(long, env = "STASIS_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Saved-state file (default: <music_dir>/.stasis-state.bin)
    #[arg(long, env = "STASIS_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Audio output device name (default: system default)
    #[arg(long, env = "STASIS_AUDIO_DEVICE")]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stasis_engine=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let assets_dir = args
        .assets_dir
        .unwrap_or_else(|| args.music_dir.join("assets"));
    let cache_dir = args
        .cache_dir
        .unwrap_or_else(|| args.music_dir.join(".stasis-cache"));
    let state_file = args
        .state_file
        .unwrap_or_else(|| args.music_dir.join(".stasis-state.bin"));

    info!("Starting Stasis engine on port {}", args.port);
    info!("Music folder: {}", args.music_dir.display());

    let library = Library::scan(&args.music_dir).context("Failed to scan music folder")?;
    info!("Library holds {} tracks", library.len());
    let track_ids: Vec<u32> = library.tracks().map(|t| t.id).collect();

    let control = Arc::new(ControlState::new());
    let events = EventBus::default();
    let cache = TranscodeCache::new(&cache_dir).context("Failed to create transcode cache")?;
    let sink = CpalSink::new(args.device.clone(), None).context("Failed to open audio device")?;

    let mut engine = PlaybackEngine::new(
        library,
        sink,
        Arc::clone(&control),
        events.clone(),
        cache,
        TimeStopAssets::from_dir(&assets_dir),
    )
    .context("Failed to initialize playback engine")?;

    if let Some(state) = SavedState::load(&state_file) {
        info!(
            "Restoring track {} at {} ms",
            state.track_id, state.position_ms
        );
        engine.restore(&state);
    }

    // Playback loop on a dedicated thread; it persists state on the way out
    // and broadcasts EngineFailed if it dies, which shuts the server down
    let thread_events = events.clone();
    let thread_state_file = state_file.clone();
    let playback_thread = std::thread::Builder::new()
        .name("playback".into())
        .spawn(move || {
            let result = engine.run();
            if let Err(e) = &result {
                error!("Playback loop failed: {}", e);
                thread_events.emit_lossy(EngineEvent::EngineFailed {
                    reason: e.to_string(),
                });
            }
            if let Err(e) = engine.saved_state().save(&thread_state_file) {
                warn!("Could not persist playback state: {}", e);
            }
            result
        })
        .context("Failed to spawn playback thread")?;

    let ctx = api::AppContext {
        control: Arc::clone(&control),
        events: events.clone(),
        track_ids: Arc::new(track_ids),
    };
    let app = api::server::router(ctx);

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Control surface listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(events.clone()))
        .await
        .context("Server error")?;

    // Stop the loop and wait for it to persist state
    control.force_status(PlaybackStatus::Stopped);
    match playback_thread.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(anyhow::anyhow!("playback loop failed: {}", e)),
        Err(_) => return Err(anyhow::anyhow!("playback thread panicked")),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C, SIGTERM, or a fatal engine failure.
async fn shutdown_signal(events: EventBus) {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            // No signal handler; rely on the other branches
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let engine_failed = async {
        let mut rx = events.subscribe();
        loop {
            match rx.recv().await {
                Ok(EngineEvent::EngineFailed { .. }) => break,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await
                }
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
        _ = engine_failed => {
            error!("Engine failure broadcast, shutting down");
        },
    }
}
