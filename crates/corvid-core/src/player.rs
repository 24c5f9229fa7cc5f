//! The player supervisor.
//!
//! Owns the media engine(s), converges requested state at each refresh
//! tick, performs overlapping media switches, and synchronizes video
//! frame delivery to the master clock (audio playout when an audio
//! stream is playing, else the oldest decoded video timestamp).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::audio::AudioSink;
use crate::config::EngineConfig;
use crate::engine::MediaEngine;
use crate::frame::{FrameBuffers, VideoFrame};
use crate::stream::StreamType;
use crate::worker::DecoderState;

/// How long a new engine may take to leave `Opening`.
const ENGINE_START_TIMEOUT: Duration = Duration::from_secs(20);
/// How long a superseded engine may take to stop before it is dropped.
const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(3);
/// How long pause/play convergence may take before it is logged.
const ENGINE_PAUSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A/V sync tolerance: both the lead video may hold and the lag that
/// triggers catch-up drops, in milliseconds.
const AV_SYNC_TOLERANCE_MS: i64 = 50;

/// Supervisor states. Intents converge to the current state at each
/// refresh tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    None,
    Opening,
    Paused,
    Starting,
    Playing,
    Searching,
    Pausing,
    Stopping,
    Stopped,
    Errored,
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The renderer collaborator the refresh loop hands frames to.
pub trait Renderer: Send {
    fn refresh(&mut self, frame: &VideoFrame, size: (u32, u32), time_now: Instant);
    fn reset(&mut self);
}

/// Renderer that discards frames. Useful headless and in tests.
#[derive(Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn refresh(&mut self, _frame: &VideoFrame, _size: (u32, u32), _time_now: Instant) {}
    fn reset(&mut self) {}
}

/// Commands accepted by the thread-safe control surface.
#[derive(Debug, Clone)]
pub enum PlayerCommand {
    Play { uri: String, start_paused: bool },
    Pause,
    Unpause,
    TogglePause,
    Stop,
    Seek,
    SelectProgram(usize),
    SelectStream(StreamType),
}

/// Cloneable sender half of the control surface. All calls are
/// idempotent; commands are drained at the next refresh tick.
#[derive(Clone)]
pub struct PlayerHandle {
    tx: Sender<PlayerCommand>,
}

impl PlayerHandle {
    pub fn send(&self, command: PlayerCommand) {
        let _ = self.tx.send(command);
    }

    pub fn play(&self, uri: impl Into<String>, start_paused: bool) {
        self.send(PlayerCommand::Play {
            uri: uri.into(),
            start_paused,
        });
    }

    pub fn pause(&self) {
        self.send(PlayerCommand::Pause);
    }

    pub fn unpause(&self) {
        self.send(PlayerCommand::Unpause);
    }

    pub fn toggle_pause(&self) {
        self.send(PlayerCommand::TogglePause);
    }

    pub fn stop(&self) {
        self.send(PlayerCommand::Stop);
    }

    pub fn seek(&self) {
        self.send(PlayerCommand::Seek);
    }

    pub fn select_program(&self, index: usize) {
        self.send(PlayerCommand::SelectProgram(index));
    }

    pub fn select_stream(&self, stream_type: StreamType) {
        self.send(PlayerCommand::SelectStream(stream_type));
    }
}

/// Picks the video frame to display for this refresh tick.
///
/// With audio present the master clock gates delivery: video that leads
/// the clock by more than the tolerance waits, video that lags by more
/// than the tolerance is dropped frame by frame until it catches up.
/// Returns the frame (already checked out of the pool) and the number
/// of frames dropped.
fn select_display_frame(
    frames: &FrameBuffers,
    clock: Option<i64>,
    has_audio: bool,
) -> (Option<VideoFrame>, u64) {
    let video_time = frames.next_decoded_pts();

    if has_audio {
        let Some(clock) = clock else {
            tracing::debug!("Waiting for audio to start");
            return (None, 0);
        };
        let Some(video_time) = video_time else {
            return (None, 0);
        };
        if video_time - clock > AV_SYNC_TOLERANCE_MS {
            tracing::debug!(
                "Video ahead of audio by {}ms - waiting",
                video_time - clock
            );
            return (None, 0);
        }

        let mut dropped = 0u64;
        let mut current = frames.frame_for_displaying();
        while let Some(frame) = current.take() {
            let drift = frame.pts.map(|pts| clock - pts).unwrap_or(0);
            if drift > AV_SYNC_TOLERANCE_MS {
                tracing::info!(
                    "Audio ahead of video by {}ms - dropping frame {}",
                    drift,
                    frame.frame_number
                );
                frames.release_from_displaying(frame);
                dropped += 1;
                current = frames.frame_for_displaying();
                continue;
            }
            return (Some(frame), dropped);
        }
        (None, dropped)
    } else {
        // No audio: the oldest decoded frame is the clock.
        (frames.frame_for_displaying(), 0)
    }
}

/// The top-level player.
///
/// Drive it by calling [`refresh`](Player::refresh) at the display
/// cadence; control it through [`PlayerHandle`] or the direct methods.
pub struct Player {
    config: EngineConfig,
    sink: Arc<dyn AudioSink>,
    frames: Arc<FrameBuffers>,
    renderer: Box<dyn Renderer>,

    state: PlayerState,
    next_state: Option<PlayerState>,
    uri: String,
    engine: Option<MediaEngine>,

    switching: bool,
    next_uri: String,
    next_engine: Option<MediaEngine>,
    next_engine_play: bool,
    next_engine_deadline: Option<Instant>,
    old_engine: Option<MediaEngine>,
    old_engine_deadline: Option<Instant>,

    pause_deadline: Option<Instant>,
    play_deadline: Option<Instant>,
    stop_deadline: Option<Instant>,

    current_frame: Option<VideoFrame>,
    last_displayed_pts: Option<i64>,
    frames_displayed: u64,
    frames_dropped: u64,
    user_messages: Vec<String>,

    command_tx: Sender<PlayerCommand>,
    command_rx: Receiver<PlayerCommand>,
}

impl Player {
    pub fn new(renderer: Box<dyn Renderer>, sink: Arc<dyn AudioSink>, config: EngineConfig) -> Self {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            sink,
            frames: Arc::new(FrameBuffers::with_default_capacity()),
            renderer,
            state: PlayerState::None,
            next_state: None,
            uri: String::new(),
            engine: None,
            switching: false,
            next_uri: String::new(),
            next_engine: None,
            next_engine_play: false,
            next_engine_deadline: None,
            old_engine: None,
            old_engine_deadline: None,
            pause_deadline: None,
            play_deadline: None,
            stop_deadline: None,
            current_frame: None,
            last_displayed_pts: None,
            frames_displayed: 0,
            frames_dropped: 0,
            user_messages: Vec::new(),
            command_tx,
            command_rx,
        }
    }

    /// Thread-safe control surface.
    pub fn handle(&self) -> PlayerHandle {
        PlayerHandle {
            tx: self.command_tx.clone(),
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_switching(&self) -> bool {
        self.switching
    }

    /// Engines alive right now (current, next and old). Never exceeds
    /// three.
    pub fn engine_count(&self) -> usize {
        usize::from(self.engine.is_some())
            + usize::from(self.next_engine.is_some())
            + usize::from(self.old_engine.is_some())
    }

    pub fn frames_displayed(&self) -> u64 {
        self.frames_displayed
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// The engine currently visible to the refresh loop, if any.
    pub fn current_engine(&self) -> Option<&MediaEngine> {
        self.engine.as_ref()
    }

    /// PTS of the most recently displayed frame.
    pub fn last_displayed_pts(&self) -> Option<i64> {
        self.last_displayed_pts
    }

    /// The master clock as of `now`: audio playout time when an audio
    /// stream is selected, else the oldest decoded video timestamp.
    pub fn clock(&self, now: Instant) -> Option<i64> {
        let has_audio = self
            .engine
            .as_ref()
            .is_some_and(|e| e.current_stream(StreamType::Audio).is_some());
        self.master_clock(now, has_audio)
    }

    /// Takes the user-visible messages emitted since the last drain.
    pub fn drain_user_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.user_messages)
    }

    fn send_user_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.user_messages.push(message);
    }

    fn set_state(&mut self, state: PlayerState) {
        if self.state != state {
            tracing::info!("Player state: {} -> {}", self.state, state);
        }
        self.state = state;
        self.pause_deadline = None;
        self.play_deadline = None;
        self.stop_deadline = None;
    }

    /// Tears everything down and returns to `None`.
    pub fn teardown(&mut self) {
        if let Some(frame) = self.current_frame.take() {
            self.frames.release_from_displaying(frame);
        }
        self.set_state(PlayerState::None);
        self.engine = None;
        self.next_engine = None;
        self.old_engine = None;
        self.next_engine_deadline = None;
        self.old_engine_deadline = None;
        self.uri = String::new();
        self.next_uri = String::new();
        self.next_state = None;
        self.switching = false;
        self.last_displayed_pts = None;
        self.renderer.reset();
        self.frames.reset(true);
    }

    /// Resets an inactive player so a new `play` can proceed.
    pub fn reset(&mut self) {
        if matches!(
            self.state,
            PlayerState::Errored | PlayerState::None | PlayerState::Stopped
        ) {
            tracing::info!("Resetting player");
            self.teardown();
            return;
        }
        tracing::error!("Not resetting player while it is active");
    }

    /// Begins playing a URI. The new engine opens while any current one
    /// keeps playing; the swap happens in `refresh` once the new engine
    /// leaves `Opening`.
    pub fn play_media(&mut self, uri: impl Into<String>, start_paused: bool) -> bool {
        let uri = uri.into();

        if uri == self.uri
            && !matches!(self.state, PlayerState::Stopped | PlayerState::Errored)
        {
            return false;
        }
        if uri.is_empty() {
            self.send_user_message("Failed to open media (invalid filename)");
            return false;
        }
        if self.switching {
            self.send_user_message("Player busy");
            return false;
        }

        if self.engine.is_none() {
            self.set_state(PlayerState::Opening);
        }

        self.next_engine_play = !start_paused;
        self.next_uri = uri.clone();
        let mut engine = MediaEngine::new(
            uri,
            self.config.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.frames),
        );
        if !engine.open() {
            self.send_user_message("Failed to open media decoder");
            self.next_uri = String::new();
            return false;
        }

        self.next_engine = Some(engine);
        self.next_engine_deadline = Some(Instant::now() + ENGINE_START_TIMEOUT);
        self.switching = true;
        true
    }

    pub fn play(&mut self) -> bool {
        if self.state == PlayerState::Errored {
            return false;
        }
        self.next_engine_play = false;
        self.next_state = Some(PlayerState::Playing);
        true
    }

    pub fn pause(&mut self) -> bool {
        if self.state == PlayerState::Errored {
            return false;
        }
        self.next_state = Some(PlayerState::Paused);
        true
    }

    pub fn unpause(&mut self) -> bool {
        if self.state == PlayerState::Errored {
            return false;
        }
        self.next_state = Some(PlayerState::Playing);
        true
    }

    pub fn toggle_pause(&mut self) -> bool {
        if self.state == PlayerState::Errored {
            return false;
        }
        self.next_state = Some(
            if matches!(self.state, PlayerState::Paused | PlayerState::Pausing) {
                PlayerState::Playing
            } else {
                PlayerState::Paused
            },
        );
        true
    }

    pub fn stop(&mut self) -> bool {
        if self.state == PlayerState::Errored {
            return false;
        }
        // A pending engine still opening is aborted immediately; its
        // interrupt flag preempts any blocking read it is stuck in.
        if let Some(next) = self.next_engine.take() {
            next.stop();
            drop(next);
            self.next_engine_deadline = None;
            self.next_uri = String::new();
            self.switching = false;
        }
        if self.engine.is_none() {
            self.next_state = None;
            self.set_state(PlayerState::Stopped);
        } else {
            self.next_state = Some(PlayerState::Stopped);
        }
        true
    }

    pub fn seek(&mut self) -> bool {
        if self.state == PlayerState::Errored {
            return false;
        }
        if let Some(engine) = self.engine.as_ref() {
            engine.seek();
            if self.state == PlayerState::Playing {
                self.set_state(PlayerState::Searching);
            }
            return true;
        }
        false
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                PlayerCommand::Play { uri, start_paused } => {
                    // Play is the one command an errored player accepts;
                    // it resets the supervisor first.
                    if matches!(
                        self.state,
                        PlayerState::Stopped | PlayerState::Errored | PlayerState::None
                    ) {
                        self.reset();
                    }
                    self.play_media(uri, start_paused);
                }
                PlayerCommand::Pause => {
                    if !matches!(
                        self.state,
                        PlayerState::Paused
                            | PlayerState::Pausing
                            | PlayerState::Opening
                            | PlayerState::Errored
                    ) {
                        self.pause();
                    }
                }
                PlayerCommand::Unpause => {
                    self.unpause();
                }
                PlayerCommand::TogglePause => {
                    self.toggle_pause();
                }
                PlayerCommand::Stop => {
                    self.stop();
                }
                PlayerCommand::Seek => {
                    self.seek();
                }
                PlayerCommand::SelectProgram(index) => {
                    if let Some(engine) = self.engine.as_ref() {
                        engine.select_program(index);
                    }
                }
                PlayerCommand::SelectStream(_) => {
                    if let Some(engine) = self.engine.as_ref() {
                        engine.select_streams();
                    }
                }
            }
        }
    }

    fn destroy_next_engine(&mut self) {
        tracing::error!("Failed to create new engine");
        if self.switching {
            self.send_user_message("Failed to open media decoder");
        }
        self.next_uri = String::new();
        self.next_engine = None;
        self.next_engine_deadline = None;
        self.switching = false;
        if self.engine.is_none() {
            self.set_state(PlayerState::Errored);
        }
    }

    fn destroy_old_engine(&mut self) {
        self.old_engine = None;
        self.old_engine_deadline = None;
        if self.engine.is_some() && self.next_engine_play {
            self.play();
        }
    }

    /// Progresses the current→next→old engine handshake.
    fn progress_media_switch(&mut self, now: Instant) {
        // A finished (or overdue) old engine goes away first.
        if self.old_engine.is_some() {
            let stopped = self
                .old_engine
                .as_ref()
                .is_some_and(|e| e.state() == DecoderState::Stopped);
            let overdue = self.old_engine_deadline.is_some_and(|d| now >= d);
            if stopped || overdue {
                if overdue && !stopped {
                    tracing::error!("Engine failed to stop - killing");
                }
                self.destroy_old_engine();
            }
        }

        if self.next_engine.is_none() {
            return;
        }

        let next_state = self.next_engine.as_ref().map(|e| e.state());
        let overdue = self.next_engine_deadline.is_some_and(|d| now >= d);

        match next_state {
            Some(DecoderState::Errored) | Some(DecoderState::Stopped) => {
                self.destroy_next_engine();
            }
            Some(state) if state > DecoderState::Opening && self.old_engine.is_none() => {
                // Swap: current becomes old and is told to stop; next
                // becomes current, initially paused.
                if let Some(old) = self.engine.take() {
                    old.stop();
                    self.old_engine_deadline = Some(now + ENGINE_STOP_TIMEOUT);
                    self.old_engine = Some(old);
                }
                self.engine = self.next_engine.take();
                self.uri = std::mem::take(&mut self.next_uri);
                self.switching = false;
                self.next_engine_deadline = None;

                self.set_state(PlayerState::Paused);
                if self.next_engine_play && self.old_engine.is_none() {
                    self.play();
                }
            }
            _ if overdue => {
                self.destroy_next_engine();
            }
            _ => {}
        }
    }

    /// The master clock in milliseconds.
    ///
    /// With a playing audio stream: the sink's playout timestamp,
    /// extrapolated by the wall-clock microseconds since the sink last
    /// updated it, plus the manual sync offset. Otherwise the oldest
    /// decoded video timestamp.
    fn master_clock(&self, now: Instant, has_audio: bool) -> Option<i64> {
        if has_audio {
            let (pts, updated) = self.sink.audio_time()?;
            let elapsed_us = now.saturating_duration_since(updated).as_micros() as i64;
            Some(pts + elapsed_us / 1000 + self.config.av_sync_offset_ms)
        } else {
            self.frames.next_decoded_pts()
        }
    }

    /// One refresh tick. Returns true while the player has an active
    /// engine and displayed (or is positioned to display) content.
    pub fn refresh(&mut self, now: Instant, size: (u32, u32), _visible: bool) -> bool {
        self.process_commands();

        // The frame displayed last tick goes back to the pool.
        if let Some(frame) = self.current_frame.take() {
            self.frames.release_from_displaying(frame);
        }

        self.progress_media_switch(now);

        if matches!(self.state, PlayerState::Stopped | PlayerState::Errored)
            && self.next_state.is_none()
        {
            return false;
        }

        // Fatal engine errors surface exactly one user message.
        if let Some(engine) = self.engine.as_ref() {
            if engine.state() == DecoderState::Errored {
                tracing::error!("Fatal engine error detected. Stopping playback");
                self.send_user_message("Fatal error decoding media");
                self.set_state(PlayerState::Errored);
                return false;
            }
        } else {
            if matches!(self.state, PlayerState::None | PlayerState::Opening) {
                return false;
            }
            self.set_state(PlayerState::Errored);
            return false;
        }

        // Playback completion.
        if self.engine.as_ref().is_some_and(|e| e.state() == DecoderState::Stopped) {
            self.set_state(PlayerState::Stopped);
            self.engine = None;
            return false;
        }

        // Apply one pending intent.
        if let Some(intent) = self.next_state.take() {
            if intent != self.state {
                match intent {
                    PlayerState::Paused => {
                        self.set_state(PlayerState::Pausing);
                        self.pause_deadline = Some(now + ENGINE_PAUSE_TIMEOUT);
                    }
                    PlayerState::Playing => {
                        if self.old_engine.is_some() {
                            tracing::warn!(
                                "Trying to start engine before old engine stopped"
                            );
                            self.next_state = Some(PlayerState::Playing);
                        } else {
                            self.set_state(PlayerState::Starting);
                            self.play_deadline = Some(now + ENGINE_PAUSE_TIMEOUT);
                        }
                    }
                    PlayerState::Stopped => {
                        self.set_state(PlayerState::Stopping);
                        self.stop_deadline = Some(now + ENGINE_STOP_TIMEOUT);
                    }
                    _ => {}
                }
            }
        }

        // Converge towards the engine's actual state.
        if let Some(engine) = self.engine.as_ref() {
            match self.state {
                PlayerState::Pausing => match engine.state() {
                    DecoderState::Paused => self.set_state(PlayerState::Paused),
                    DecoderState::Pausing => {}
                    _ => engine.pause(),
                },
                PlayerState::Starting => match engine.state() {
                    DecoderState::Running => self.set_state(PlayerState::Playing),
                    DecoderState::Starting => {}
                    _ => engine.start(),
                },
                PlayerState::Stopping => match engine.state() {
                    DecoderState::Stopped => {
                        self.set_state(PlayerState::Stopped);
                        self.engine = None;
                    }
                    DecoderState::Stopping => {}
                    _ => engine.stop(),
                },
                PlayerState::Searching => {
                    if !engine.seek_pending() {
                        self.set_state(PlayerState::Playing);
                    }
                }
                _ => {}
            }
        }

        // Supervised waits that elapse are logged, never fatal.
        for (deadline, what) in [
            (&mut self.pause_deadline, "pause"),
            (&mut self.play_deadline, "start playing"),
            (&mut self.stop_deadline, "stop"),
        ] {
            if deadline.is_some_and(|d| now >= d) {
                tracing::info!("Waited for player to {what}");
                *deadline = None;
            }
        }

        self.refresh_video(now, size);
        true
    }

    fn refresh_video(&mut self, now: Instant, size: (u32, u32)) {
        let Some(engine) = self.engine.as_ref() else {
            return;
        };
        if engine.current_stream(StreamType::Video).is_none() {
            return;
        }
        let has_audio = engine.current_stream(StreamType::Audio).is_some();

        let clock = self.master_clock(now, has_audio);
        let (frame, dropped) = select_display_frame(&self.frames, clock, has_audio);
        self.frames_dropped += dropped;
        self.current_frame = frame;

        if let Some(frame) = self.current_frame.as_ref() {
            if matches!(
                self.state,
                PlayerState::Paused
                    | PlayerState::Starting
                    | PlayerState::Playing
                    | PlayerState::Searching
                    | PlayerState::Pausing
                    | PlayerState::Stopping
            ) {
                self.renderer.refresh(frame, size, now);
                self.last_displayed_pts = frame.pts;
                self.frames_displayed += 1;
            }
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.teardown();
    }
}
