//! The media engine: a thin wrapper owning one demuxer thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::AudioSink;
use crate::config::EngineConfig;
use crate::demuxer::DemuxerThread;
use crate::frame::FrameBuffers;
use crate::stream::{Program, StreamType};
use crate::worker::{DecoderShared, DecoderState};

/// One playback session over one URI.
///
/// The engine owns the demuxer thread, which in turn owns the workers;
/// control is a handful of intents and latches the demuxer consumes on
/// its next iteration. `stop` raises the interrupt flag, which also
/// preempts blocking reads inside the format layer.
pub struct MediaEngine {
    uri: String,
    shared: Arc<DecoderShared>,
    sink: Arc<dyn AudioSink>,
    frames: Arc<FrameBuffers>,
    thread: Option<DemuxerThread>,
}

impl MediaEngine {
    pub fn new(
        uri: impl Into<String>,
        config: EngineConfig,
        sink: Arc<dyn AudioSink>,
        frames: Arc<FrameBuffers>,
    ) -> Self {
        Self {
            uri: uri.into(),
            shared: Arc::new(DecoderShared::new(config)),
            sink,
            frames,
            thread: None,
        }
    }

    /// Starts the demuxer thread. Returns false for an empty URI or a
    /// second open; the open itself completes asynchronously and is
    /// observed through [`state`](Self::state).
    pub fn open(&mut self) -> bool {
        if self.uri.is_empty() {
            return false;
        }
        if self.thread.is_some() {
            tracing::warn!("Trying to reopen engine - ignoring");
            return false;
        }
        self.thread = Some(DemuxerThread::spawn(
            self.uri.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&self.sink),
            Arc::clone(&self.frames),
        ));
        std::thread::sleep(Duration::from_millis(50));
        true
    }

    pub fn state(&self) -> DecoderState {
        self.thread
            .as_ref()
            .map(|t| t.state())
            .unwrap_or(DecoderState::None)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn start(&self) {
        if let Some(thread) = self.thread.as_ref() {
            thread.unpause();
        }
    }

    pub fn pause(&self) {
        if let Some(thread) = self.thread.as_ref() {
            thread.pause();
        }
    }

    pub fn stop(&self) {
        self.shared.interrupt.store(true, Ordering::Release);
        if let Some(thread) = self.thread.as_ref() {
            thread.stop();
        }
    }

    /// Arms the seek latch; the demuxer consumes it on its next loop
    /// iteration.
    pub fn seek(&self) {
        self.shared.seek_requested.store(true, Ordering::Release);
    }

    pub fn seek_pending(&self) -> bool {
        self.shared.seek_requested.load(Ordering::Acquire)
    }

    /// Requests a program switch. Only legal while Opening or Paused.
    pub fn select_program(&self, index: usize) -> bool {
        let state = self.state();
        if !matches!(state, DecoderState::Opening | DecoderState::Paused) {
            tracing::error!("Cannot select program unless demuxer is paused");
            return false;
        }
        let programs = self.shared.programs.read();
        if index >= programs.len() {
            return false;
        }
        drop(programs);
        self.shared
            .program_request
            .store(index as i64, Ordering::Release);
        true
    }

    /// Requests a fresh per-type stream selection. Only legal while
    /// Opening or Paused.
    pub fn select_streams(&self) -> bool {
        let state = self.state();
        if !matches!(state, DecoderState::Opening | DecoderState::Paused) {
            tracing::error!("Cannot select streams unless demuxer is paused");
            return false;
        }
        self.shared.reselect_request.store(true, Ordering::Release);
        true
    }

    /// Container index of the selected stream of a type, if any.
    pub fn current_stream(&self, stream_type: StreamType) -> Option<usize> {
        self.shared.selected_stream(stream_type)
    }

    pub fn programs(&self) -> Vec<Program> {
        self.shared.programs.read().clone()
    }

    /// Audio PTS high-water mark in milliseconds, when known.
    pub fn audio_pts(&self) -> Option<i64> {
        match self.shared.audio_pts.load(Ordering::Acquire) {
            crate::worker::NO_PTS => None,
            pts => Some(pts),
        }
    }

    /// Bytes currently queued for the audio worker. The demuxer's
    /// back-pressure keeps this at or below the configured ceiling plus
    /// one packet.
    pub fn audio_queue_bytes(&self) -> usize {
        self.shared.audio_queue.size()
    }

    /// Packets queued per worker: (audio, video, subtitle).
    pub fn queue_lengths(&self) -> (usize, usize, usize) {
        (
            self.shared.audio_queue.length(),
            self.shared.video_queue.length(),
            self.shared.subtitle_queue.length(),
        )
    }
}

impl Drop for MediaEngine {
    fn drop(&mut self) {
        self.stop();
        if let Some(mut thread) = self.thread.take() {
            thread.wait(Some(Duration::from_secs(1)));
            thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullSink;
    use std::time::Instant;

    fn engine(uri: &str) -> MediaEngine {
        let mut config = EngineConfig::default();
        config.user_locale = Some("en".to_string());
        MediaEngine::new(
            uri,
            config,
            Arc::new(NullSink::new()),
            Arc::new(FrameBuffers::with_default_capacity()),
        )
    }

    fn wait_for_state(engine: &MediaEngine, state: DecoderState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if engine.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_open_rejects_empty_uri() {
        let mut engine = engine("");
        assert!(!engine.open());
        assert_eq!(engine.state(), DecoderState::None);
    }

    #[test]
    fn test_open_reaches_paused_then_plays_and_stops() {
        let mut engine = engine("synth:audio?dur=60000");
        assert!(engine.open());
        assert!(wait_for_state(&engine, DecoderState::Paused, Duration::from_secs(2)));
        assert!(engine.current_stream(StreamType::Audio).is_some());
        assert!(engine.current_stream(StreamType::Video).is_none());

        engine.start();
        assert!(wait_for_state(&engine, DecoderState::Running, Duration::from_secs(2)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.audio_pts().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(engine.audio_pts().is_some());

        engine.stop();
        assert!(wait_for_state(&engine, DecoderState::Stopped, Duration::from_secs(1)));
    }

    #[test]
    fn test_open_failure_reaches_errored() {
        let mut engine = engine("synth:nonsense");
        assert!(engine.open());
        assert!(wait_for_state(&engine, DecoderState::Errored, Duration::from_secs(2)));
    }

    #[test]
    fn test_selection_rejected_while_running() {
        let mut engine = engine("synth:audio?dur=60000");
        assert!(engine.open());
        assert!(wait_for_state(&engine, DecoderState::Paused, Duration::from_secs(2)));

        // Legal while paused.
        assert!(engine.select_streams());
        assert!(engine.select_program(0));
        assert!(!engine.select_program(7));

        engine.start();
        assert!(wait_for_state(&engine, DecoderState::Running, Duration::from_secs(2)));
        assert!(!engine.select_streams());
        assert!(!engine.select_program(0));

        engine.stop();
    }

    #[test]
    fn test_seek_latch_is_consumed_by_demuxer() {
        let mut engine = engine("synth:audio?dur=60000");
        assert!(engine.open());
        assert!(wait_for_state(&engine, DecoderState::Paused, Duration::from_secs(2)));
        engine.start();
        assert!(wait_for_state(&engine, DecoderState::Running, Duration::from_secs(2)));

        engine.seek();
        let deadline = Instant::now() + Duration::from_secs(1);
        while engine.seek_pending() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!engine.seek_pending());

        // After the seek flush the watermark restarts from the top of
        // the stream.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut restarted = false;
        while Instant::now() < deadline {
            if engine.audio_pts().is_some_and(|pts| pts < 500) {
                restarted = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(restarted, "audio PTS should restart after seek to start");

        engine.stop();
    }

    #[test]
    fn test_stop_unblocks_stuck_open() {
        let mut engine = engine("synth:hang");
        assert!(engine.open());
        std::thread::sleep(Duration::from_millis(100));
        let stop_started = Instant::now();
        engine.stop();
        assert!(wait_for_state(&engine, DecoderState::Stopped, Duration::from_secs(1)));
        assert!(stop_started.elapsed() < Duration::from_secs(1));
    }
}
