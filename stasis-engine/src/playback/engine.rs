//! Playback state machine
//!
//! One loop, one chunk at a time. Every external command lands in
//! [`ControlState`] and is observed here at chunk granularity, so the worst
//! case command latency is one chunk period (~50 ms). The loop owns the
//! decoder stream, the anti-alias filter, and the sink; nothing else touches
//! audio.
//!
//! Status discipline during automatic transitions: the status stays writable
//! while a crossfade runs (that is how skip/seek/change-track interrupt it),
//! then the soft lock engages at the end of the fade and holds until the
//! loop re-enters normal playback and forces `Playing`. External writers can
//! therefore never clobber the engine's own post-transition reset.

use crate::audio::chunk::{PcmChunk, SILENCE_DB};
use crate::audio::decoder::{ChunkStream, Direction};
use crate::audio::output::AudioSink;
use crate::audio::speed::{change_speed, cutoff_for_speed, LowPassFilter};
use crate::audio::transcode::TranscodeCache;
use crate::config::SavedState;
use crate::error::{Error, Result};
use crate::library::{Library, TrackInfo};
use crate::playback::control::{ControlState, PositionSnapshot};
use crate::playback::fader::{step_fade, ChunkSource, CombinedSource, FadeMode, GainSource};
use crate::playback::timestop::{self, TimeStopAssets, FREEZE_SECS};
use stasis_common::timing::{chunk_frames, frames_to_ms, ms_to_frames, CHUNK_MS, ENGINE_RATE};
use stasis_common::{EngineEvent, EventBus, PlaybackStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the loop dozes while paused before re-checking.
const PAUSE_POLL: Duration = Duration::from_millis(10);

/// Where the loop goes after a transition finishes or is interrupted.
enum AfterTransition {
    /// Open this track at this position and resume the normal loop
    Open { track_id: u32, start_ms: u64 },
    /// Engine stop was requested mid-fade
    Stop,
}

/// The playback engine: library cursor, decoder stream, crossfades, and the
/// chunk pump into the sink.
///
/// Generic over the sink so the whole state machine runs in tests against
/// [`crate::audio::MemorySink`].
pub struct PlaybackEngine<S: AudioSink> {
    library: Library,
    sink: S,
    control: Arc<ControlState>,
    events: EventBus,
    cache: TranscodeCache,
    assets: TimeStopAssets,
    filter: LowPassFilter,
    /// Speed the filter is currently tuned for
    filter_speed: f64,
    /// Wall-clock hold of the time-stop sequence, shortened in tests
    freeze: Duration,
}

impl<S: AudioSink> PlaybackEngine<S> {
    pub fn new(
        library: Library,
        sink: S,
        control: Arc<ControlState>,
        events: EventBus,
        cache: TranscodeCache,
        assets: TimeStopAssets,
    ) -> Result<Self> {
        let filter = LowPassFilter::new(
            cutoff_for_speed(control.speed(), ENGINE_RATE),
            ENGINE_RATE,
            2,
        )?;
        let filter_speed = control.speed();
        Ok(Self {
            library,
            sink,
            control,
            events,
            cache,
            assets,
            filter,
            filter_speed,
            freeze: Duration::from_secs(FREEZE_SECS),
        })
    }

    /// Override the time-stop hold duration (tests shorten it to zero).
    pub fn set_freeze(&mut self, freeze: Duration) {
        self.freeze = freeze;
    }

    /// Apply a restored state: position, track, and the user knobs.
    pub fn restore(&mut self, state: &SavedState) {
        if self.library.get(state.track_id).is_some() {
            // Ignore the error: the id was just checked
            let _ = self.library.set_current(state.track_id);
            self.control.set_seek_target_ms(state.position_ms as u64);
        }
        self.control.set_reverse(state.reverse);
        self.control.set_repeat(state.repeat);
        self.control
            .set_base_fade_duration_ms(state.fade_duration_ms as u64);
        if self.control.set_speed(state.speed).is_err() {
            warn!("Restored speed {} rejected, keeping 1.0", state.speed);
        }
        if self.control.set_volume(state.volume).is_err() {
            warn!("Restored volume {} rejected, keeping 1.0", state.volume);
        }
    }

    /// Snapshot the current state for persistence on shutdown.
    pub fn saved_state(&self) -> SavedState {
        let pos = self.control.position();
        SavedState {
            track_id: pos.track_id,
            position_ms: pos.position_ms.min(u32::MAX as u64) as u32,
            total_frames: pos.total_frames,
            reverse: self.control.reverse(),
            shuffle: false,
            repeat: self.control.repeat(),
            fade_duration_ms: self
                .control
                .base_fade_duration_ms()
                .min(u16::MAX as u64) as u16,
            track_length_ms: pos.length_ms as f64,
            speed: self.control.speed(),
            volume: self.control.volume(),
            ..SavedState::default()
        }
    }

    /// Run the playback loop until `Stopped` or an unrecoverable error.
    ///
    /// Decode failures are local: the failing track is logged and skipped.
    /// Only a library with no playable track at all, or a dead sink, ends
    /// the loop with an error.
    pub fn run(&mut self) -> Result<()> {
        self.events.emit_lossy(EngineEvent::Ready);
        if self.library.is_empty() {
            info!("Library is empty, engine idle");
            self.set_status(PlaybackStatus::Idle);
            return Ok(());
        }

        let frames_per_chunk = chunk_frames(ENGINE_RATE) as usize;
        // Position the first track opens at; reset to 0 after every track
        // change, set by seek and by transition handoffs
        let mut next_start_ms: u64 = self.control.seek_target_ms();
        let mut fade_in_pending = false;
        let mut open_failures = 0usize;

        'track: loop {
            let track = match self.library.current() {
                Some(t) => t.clone(),
                None => return Err(Error::Playback("library cursor lost".into())),
            };
            let reverse = self.control.reverse();
            let direction = if reverse {
                Direction::Reverse
            } else {
                Direction::Forward
            };
            let start_frame = if next_start_ms > 0 {
                ms_to_frames(next_start_ms, ENGINE_RATE).min(track.total_frames)
            } else if reverse {
                track.total_frames
            } else {
                0
            };
            next_start_ms = 0;

            let mut stream = match ChunkStream::open_with_cache(
                &track.path,
                track.id,
                start_frame,
                direction,
                frames_per_chunk,
                &self.cache,
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot open track {} ({}): {}", track.id, track.path.display(), e);
                    open_failures += 1;
                    if open_failures >= self.library.len() {
                        return Err(Error::Playback("no playable track in library".into()));
                    }
                    self.library.advance();
                    continue 'track;
                }
            };
            open_failures = 0;

            let mut pos_frames = start_frame;
            self.events.emit_lossy(EngineEvent::TrackChanged {
                track_id: track.id,
                length_ms: track.length_ms,
                total_frames: track.total_frames,
            });
            self.control.lock_status(false);
            self.set_status(PlaybackStatus::Playing);
            info!(
                "Playing track {} ({}) from {} ms{}",
                track.id,
                track.path.display(),
                frames_to_ms(pos_frames, ENGINE_RATE),
                if reverse { " in reverse" } else { "" }
            );

            if fade_in_pending {
                fade_in_pending = false;
                match self.run_fade_in(&mut stream, &track, &mut pos_frames, reverse)? {
                    Some(AfterTransition::Stop) => {
                        self.set_status(PlaybackStatus::Stopped);
                        return Ok(());
                    }
                    _ => {}
                }
            }

            'chunk: loop {
                if self.pause_gate() {
                    info!("Stop requested while paused");
                    return Ok(());
                }

                // Reverse toggled mid-track: reopen the other way around
                if self.control.reverse() != reverse {
                    next_start_ms = frames_to_ms(pos_frames, ENGINE_RATE);
                    continue 'track;
                }

                match self.control.status() {
                    PlaybackStatus::Playing
                    | PlaybackStatus::Idle
                    | PlaybackStatus::Transition
                    | PlaybackStatus::OverrideTransition
                    | PlaybackStatus::Repeat => {}
                    PlaybackStatus::Stopped => {
                        info!("Stop requested");
                        return Ok(());
                    }
                    PlaybackStatus::Seek => {
                        next_start_ms = self.control.seek_target_ms().min(track.length_ms);
                        debug!("Seek to {} ms", next_start_ms);
                        continue 'track;
                    }
                    PlaybackStatus::Skip => {
                        match self.control.take_next_track() {
                            Some(id) => {
                                self.library.set_current(id)?;
                            }
                            None => {
                                self.library.advance();
                            }
                        }
                        continue 'track;
                    }
                    PlaybackStatus::ChangeTrack => {
                        let target = match self.control.take_next_track() {
                            Some(id) => id,
                            None => match self.library.peek_next() {
                                Some(t) => t.id,
                                None => {
                                    self.set_status(PlaybackStatus::Playing);
                                    continue 'chunk;
                                }
                            },
                        };
                        let fade_ms = self.control.fade_duration_ms();
                        match self.run_transition(
                            &mut stream,
                            Some(track.id),
                            pos_frames,
                            target,
                            fade_ms,
                            PlaybackStatus::Transition,
                        )? {
                            AfterTransition::Open { track_id, start_ms } => {
                                self.library.set_current(track_id)?;
                                next_start_ms = start_ms;
                                continue 'track;
                            }
                            AfterTransition::Stop => {
                                self.set_status(PlaybackStatus::Stopped);
                                return Ok(());
                            }
                        }
                    }
                    PlaybackStatus::FadeIn => {
                        if let Some(id) = self.control.take_next_track() {
                            self.library.set_current(id)?;
                        }
                        fade_in_pending = true;
                        continue 'track;
                    }
                    PlaybackStatus::Zawarudo => {
                        let speed = self.control.speed();
                        let freeze = self.freeze;
                        let control = Arc::clone(&self.control);
                        let events = self.events.clone();
                        let base = pos_frames;
                        let mut on_progress = |consumed: u64| {
                            let p = if reverse {
                                base.saturating_sub(consumed)
                            } else {
                                (base + consumed).min(track.total_frames)
                            };
                            report_position_to(&control, &events, &track, p);
                        };
                        match timestop::run_time_stop(
                            &mut self.sink,
                            &self.events,
                            &self.assets,
                            &mut stream,
                            speed,
                            &mut self.filter,
                            freeze,
                            &mut on_progress,
                        ) {
                            Ok(consumed) => {
                                pos_frames = if reverse {
                                    pos_frames.saturating_sub(consumed)
                                } else {
                                    (pos_frames + consumed).min(track.total_frames)
                                };
                            }
                            Err(e) => {
                                error!("Time stop aborted: {}", e);
                            }
                        }
                        self.set_status(PlaybackStatus::Playing);
                        continue 'chunk;
                    }
                }

                // Natural transition boundary: once the remaining audio fits
                // inside one fade plus one chunk, the crossfade must begin
                let fade_ms = self.control.fade_duration_ms();
                let pos_ms = frames_to_ms(pos_frames, ENGINE_RATE);
                let remaining_ms = if reverse {
                    pos_ms
                } else {
                    track.length_ms.saturating_sub(pos_ms)
                };
                if remaining_ms <= fade_ms + CHUNK_MS {
                    if remaining_ms == 0 {
                        // Nothing left to fade from; hard advance
                        if !self.control.repeat() {
                            self.library.advance();
                        }
                        continue 'track;
                    }
                    let (target, status) = if self.control.repeat() {
                        (track.id, PlaybackStatus::Repeat)
                    } else {
                        match self.library.peek_next() {
                            Some(t) => (t.id, PlaybackStatus::Transition),
                            None => {
                                self.library.advance();
                                continue 'track;
                            }
                        }
                    };
                    match self.run_transition(
                        &mut stream,
                        Some(track.id),
                        pos_frames,
                        target,
                        fade_ms,
                        status,
                    )? {
                        AfterTransition::Open { track_id, start_ms } => {
                            self.library.set_current(track_id)?;
                            next_start_ms = start_ms;
                            continue 'track;
                        }
                        AfterTransition::Stop => {
                            self.set_status(PlaybackStatus::Stopped);
                            return Ok(());
                        }
                    }
                }

                // Normal chunk pump
                let chunk = match stream.next_chunk() {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => {
                        if !self.control.repeat() {
                            self.library.advance();
                        }
                        continue 'track;
                    }
                    Err(e) => {
                        warn!("Decode failure on track {}: {}", track.id, e);
                        self.library.advance();
                        continue 'track;
                    }
                };
                let source_frames = chunk.frames() as u64;
                let out = self.apply_speed(&chunk)?;
                self.sink.set_volume(self.control.volume() as f32);
                self.sink.write(&out)?;

                pos_frames = if reverse {
                    pos_frames.saturating_sub(source_frames)
                } else {
                    (pos_frames + source_frames).min(track.total_frames)
                };
                self.report_position(&track, pos_frames);
            }
        }
    }

    /// Crossfade `out_source` into `in_track_id`, honoring interruptions.
    ///
    /// `out_track_id` is `None` when the outgoing audio is itself a merged
    /// fade (the override case) and has no single track to seek back to.
    fn run_transition(
        &mut self,
        out_source: &mut dyn ChunkSource,
        out_track_id: Option<u32>,
        out_pos_frames: u64,
        in_track_id: u32,
        fade_ms: u64,
        status: PlaybackStatus,
    ) -> Result<AfterTransition> {
        let in_track = self
            .library
            .get(in_track_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("track {} not in library", in_track_id)))?;
        let out_track = out_track_id.and_then(|id| self.library.get(id).cloned());
        let mut out_pos = out_pos_frames;
        let reverse = self.control.reverse();

        // A fade shorter than one chunk is a cut
        if fade_ms < CHUNK_MS {
            return Ok(AfterTransition::Open {
                track_id: in_track_id,
                start_ms: 0,
            });
        }

        // An incoming track shorter than the fade would end mid-fade; clamp
        // the fade to leave at least one plain chunk of it
        let mut fade_ms = fade_ms;
        if in_track.length_ms <= fade_ms + CHUNK_MS {
            fade_ms = in_track.length_ms.saturating_sub(CHUNK_MS).max(CHUNK_MS);
        }

        let frames_per_chunk = chunk_frames(ENGINE_RATE) as usize;
        let in_start_frame = if reverse { in_track.total_frames } else { 0 };
        let mut in_stream = ChunkStream::open_with_cache(
            &in_track.path,
            in_track.id,
            in_start_frame,
            if reverse {
                Direction::Reverse
            } else {
                Direction::Forward
            },
            frames_per_chunk,
            &self.cache,
        )?;

        self.set_status(status);
        debug!(
            "Transition into track {} over {} ms",
            in_track_id, fade_ms
        );

        let mut consumed_in = 0u64;
        let in_pos = |consumed: u64| {
            if reverse {
                frames_to_ms(in_start_frame.saturating_sub(consumed), ENGINE_RATE)
            } else {
                frames_to_ms(consumed, ENGINE_RATE)
            }
        };

        let mut last_out_db = 0.0;
        let mut last_in_db = SILENCE_DB;
        let mut fade = step_fade(
            &mut *out_source,
            Some(&mut in_stream),
            fade_ms,
            CHUNK_MS,
            FadeMode::Crossfade,
        )?;
        let total_steps = fade.len();
        let mut steps_done = 0usize;

        loop {
            if self.pause_gate() {
                return Ok(AfterTransition::Stop);
            }

            match self.control.status() {
                PlaybackStatus::Stopped => return Ok(AfterTransition::Stop),
                PlaybackStatus::Seek => {
                    // Abandon the fade; the outgoing track wins the seek
                    let target_ms = self.control.seek_target_ms();
                    return Ok(AfterTransition::Open {
                        track_id: out_track_id.unwrap_or(in_track_id),
                        start_ms: target_ms,
                    });
                }
                PlaybackStatus::Skip => {
                    // Jump to whichever track is audibly closer
                    if steps_done * 2 > total_steps {
                        return Ok(AfterTransition::Open {
                            track_id: in_track_id,
                            start_ms: in_pos(consumed_in),
                        });
                    }
                    let target = self.control.take_next_track().unwrap_or(in_track_id);
                    return Ok(AfterTransition::Open {
                        track_id: target,
                        start_ms: 0,
                    });
                }
                PlaybackStatus::ChangeTrack => {
                    // A second crossfade mid-fade: merge the in-flight fade
                    // into one source at its last reported gains, then fade
                    // that into the newly queued track
                    let new_target = match self.control.take_next_track() {
                        Some(id) => id,
                        None => in_track_id,
                    };
                    drop(fade);
                    let new_fade_ms = self.control.fade_duration_ms();
                    let mut combined = CombinedSource::new(
                        vec![
                            Box::new(GainSource::new(&mut *out_source, last_out_db)),
                            Box::new(GainSource::new(&mut in_stream, last_in_db)),
                        ],
                        new_fade_ms,
                        CHUNK_MS,
                    );
                    return self.run_transition(
                        &mut combined,
                        None,
                        0,
                        new_target,
                        new_fade_ms,
                        PlaybackStatus::OverrideTransition,
                    );
                }
                PlaybackStatus::Zawarudo => {
                    // Not honored mid-fade; drop the request
                    self.control.force_status(status);
                }
                _ => {}
            }

            match fade.next_step()? {
                Some(step) => {
                    last_out_db = step.out_db;
                    last_in_db = step.in_db;
                    let step_frames = step.chunk.frames() as u64;
                    consumed_in += step_frames;
                    let out = self.apply_speed(&step.chunk)?;
                    self.sink.set_volume(self.control.volume() as f32);
                    self.sink.write(&out)?;
                    steps_done += 1;
                    // The outgoing track keeps owning the reported position
                    // until the handoff; a merged override fade has no
                    // single outgoing track, so the incoming one reports
                    match &out_track {
                        Some(t) => {
                            out_pos = if reverse {
                                out_pos.saturating_sub(step_frames)
                            } else {
                                (out_pos + step_frames).min(t.total_frames)
                            };
                            self.report_position(t, out_pos);
                        }
                        None => {
                            let in_frames = if reverse {
                                in_start_frame.saturating_sub(consumed_in)
                            } else {
                                consumed_in
                            };
                            self.report_position(&in_track, in_frames);
                        }
                    }
                }
                None => {
                    if steps_done < total_steps {
                        // A stream ran dry mid-fade; restart the incoming
                        // track from its beginning
                        warn!("Source exhausted mid-transition, restarting incoming track");
                        return Ok(AfterTransition::Open {
                            track_id: in_track_id,
                            start_ms: 0,
                        });
                    }
                    break;
                }
            }
        }

        // Fade done: lock the status until the loop is back in normal
        // playback, then hand the incoming track over at the position the
        // fade carried it to
        self.control.lock_status(true);
        Ok(AfterTransition::Open {
            track_id: in_track_id,
            start_ms: in_pos(consumed_in),
        })
    }

    /// Fade the freshly opened stream in from silence.
    fn run_fade_in(
        &mut self,
        stream: &mut ChunkStream,
        track: &TrackInfo,
        pos_frames: &mut u64,
        reverse: bool,
    ) -> Result<Option<AfterTransition>> {
        let fade_ms = self.control.fade_duration_ms();
        if fade_ms < CHUNK_MS {
            return Ok(None);
        }
        let mut fade = step_fade(&mut *stream, None, fade_ms, CHUNK_MS, FadeMode::FadeIn)?;
        loop {
            if self.pause_gate() {
                return Ok(Some(AfterTransition::Stop));
            }
            if self.control.status() == PlaybackStatus::Stopped {
                return Ok(Some(AfterTransition::Stop));
            }
            match fade.next_step()? {
                Some(step) => {
                    let frames = step.chunk.frames() as u64;
                    let out = self.apply_speed(&step.chunk)?;
                    self.sink.set_volume(self.control.volume() as f32);
                    self.sink.write(&out)?;
                    *pos_frames = if reverse {
                        pos_frames.saturating_sub(frames)
                    } else {
                        *pos_frames + frames
                    };
                    self.report_position(track, *pos_frames);
                }
                None => break,
            }
        }
        Ok(None)
    }

    /// Resample a chunk to the current speed, retuning the filter when the
    /// speed changed since the last chunk.
    fn apply_speed(&mut self, chunk: &PcmChunk) -> Result<PcmChunk> {
        let speed = self.control.speed();
        if speed != self.filter_speed {
            self.filter
                .retune(cutoff_for_speed(speed, ENGINE_RATE))?;
            self.filter_speed = speed;
        }
        if speed == 1.0 {
            return Ok(chunk.clone());
        }
        change_speed(chunk, speed, Some(&mut self.filter))
    }

    /// Sleep while paused. A forced `Stopped` must still end the loop, so
    /// the wait watches the status too; returns true when a stop arrived.
    fn pause_gate(&self) -> bool {
        while self.control.paused() {
            if self.control.status() == PlaybackStatus::Stopped {
                return true;
            }
            std::thread::sleep(PAUSE_POLL);
        }
        false
    }

    /// Force a status change and broadcast it.
    fn set_status(&self, new_status: PlaybackStatus) {
        let old_status = self.control.status();
        if old_status != new_status {
            self.control.force_status(new_status);
            self.events.emit_lossy(EngineEvent::StatusChanged {
                old_status,
                new_status,
            });
        }
    }

    /// Refresh the position snapshot, debug string, and SSE position feed.
    fn report_position(&self, track: &TrackInfo, pos_frames: u64) {
        report_position_to(&self.control, &self.events, track, pos_frames);
    }
}

/// Position reporting as a free function so the time-stop progress callback
/// can use it while the engine's sink and filter are borrowed.
fn report_position_to(
    control: &ControlState,
    events: &EventBus,
    track: &TrackInfo,
    pos_frames: u64,
) {
    let position_ms = frames_to_ms(pos_frames, ENGINE_RATE);
    control.set_position(PositionSnapshot {
        track_id: track.id,
        position_ms,
        frame_position: pos_frames,
        length_ms: track.length_ms,
        total_frames: track.total_frames,
    });
    control.set_debug_string(format!(
        "status={} track={} pos={}/{}ms speed={:.2} vol={:.2} fade={}ms{}{}",
        control.status(),
        track.id,
        position_ms,
        track.length_ms,
        control.speed(),
        control.volume(),
        control.fade_duration_ms(),
        if control.reverse() { " reverse" } else { "" },
        if control.paused() { " paused" } else { "" },
    ));
    events.emit_lossy(EngineEvent::PositionUpdate {
        track_id: track.id,
        position_ms,
        length_ms: track.length_ms,
    });
}
