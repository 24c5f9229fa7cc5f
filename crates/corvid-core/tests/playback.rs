//! End-to-end playback scenarios against the synthetic container.
//!
//! These drive the public surface only: a [`Player`] (or bare
//! [`MediaEngine`]) with a [`NullSink`], whose real-time playout makes
//! the audio master clock behave like a device without needing one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use corvid_core::{
    AudioDescription, AudioSink, CodecId, DecoderState, EngineConfig, FrameBuffers, MediaEngine,
    NullRenderer, NullSink, Player, PlayerState, StreamType,
};

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.user_locale = Some("en".to_string());
    config
}

fn new_player() -> Player {
    Player::new(
        Box::new(NullRenderer),
        Arc::new(NullSink::new()),
        test_config(),
    )
}

/// Drives refresh ticks until the predicate holds or the timeout
/// elapses. Returns true when the predicate held.
fn run_until(player: &mut Player, timeout: Duration, mut done: impl FnMut(&Player) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        player.refresh(Instant::now(), (1280, 720), true);
        assert!(player.engine_count() <= 3, "engine bound violated");
        if done(player) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// S1: audio-only playback
// ============================================================================

#[test]
fn audio_only_reaches_playing_with_monotonic_clock() {
    let mut player = new_player();
    assert!(player.play_media("synth:audio?dur=60000", false));

    assert!(
        run_until(&mut player, Duration::from_secs(2), |p| {
            p.state() == PlayerState::Playing
        }),
        "player never reached Playing"
    );

    // The audio clock advances monotonically while playing.
    let mut previous = None;
    let watch_until = Instant::now() + Duration::from_millis(400);
    while Instant::now() < watch_until {
        player.refresh(Instant::now(), (1280, 720), true);
        if let Some(clock) = player.clock(Instant::now()) {
            if let Some(previous) = previous {
                assert!(clock >= previous, "audio clock ran backwards");
            }
            previous = Some(clock);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(previous.is_some(), "audio clock never started");

    player.stop();
    assert!(
        run_until(&mut player, Duration::from_secs(2), |p| {
            p.state() == PlayerState::Stopped && p.engine_count() == 0
        }),
        "player did not stop cleanly"
    );
}

// ============================================================================
// S2: A/V steady state
// ============================================================================

#[test]
fn av_steady_state_delivers_at_frame_rate_in_sync() {
    let mut player = new_player();
    assert!(player.play_media("synth:av?fps=30&dur=10000", false));
    assert!(
        run_until(&mut player, Duration::from_secs(3), |p| {
            p.state() == PlayerState::Playing && p.frames_displayed() > 0
        }),
        "A/V playback never started"
    );

    // Count deliveries over a 2-second window.
    let base = player.frames_displayed();
    let window_start = Instant::now();
    while window_start.elapsed() < Duration::from_secs(2) {
        let now = Instant::now();
        let before = player.frames_displayed();
        player.refresh(now, (1280, 720), true);

        // Any frame displayed this tick is within tolerance of the
        // master clock (plus a little measurement slack).
        if player.frames_displayed() > before {
            if let (Some(pts), Some(clock)) = (player.last_displayed_pts(), player.clock(now)) {
                assert!(
                    (pts - clock).abs() <= 80,
                    "displayed frame {pts}ms vs clock {clock}ms"
                );
            }
        }
        std::thread::sleep(Duration::from_millis(4));
    }
    let delivered = player.frames_displayed() - base;
    assert!(
        (50..=70).contains(&delivered),
        "expected ~60 frames in 2s at 30fps, got {delivered}"
    );

    player.stop();
    run_until(&mut player, Duration::from_secs(2), |p| {
        p.state() == PlayerState::Stopped
    });
}

// ============================================================================
// S4: seek flushes and restarts
// ============================================================================

#[test]
fn seek_flushes_queues_and_restarts_clock() {
    let mut player = new_player();
    assert!(player.play_media("synth:av?fps=30&dur=60000", false));
    assert!(run_until(&mut player, Duration::from_secs(3), |p| {
        p.state() == PlayerState::Playing
    }));

    // Let the clock get somewhere first.
    assert!(run_until(&mut player, Duration::from_secs(2), |p| {
        p.current_engine()
            .and_then(|e| e.audio_pts())
            .is_some_and(|pts| pts > 300)
    }));

    player.seek();
    // The seek latch is consumed, queues flush, and the audio PTS
    // watermark restarts from the top of the stream.
    assert!(
        run_until(&mut player, Duration::from_secs(2), |p| {
            p.state() == PlayerState::Playing
                && p.current_engine()
                    .and_then(|e| e.audio_pts())
                    .is_some_and(|pts| pts < 300)
        }),
        "audio clock did not restart after seek"
    );

    player.stop();
    run_until(&mut player, Duration::from_secs(2), |p| {
        p.state() == PlayerState::Stopped
    });
}

// ============================================================================
// S5: overlapping media switch
// ============================================================================

#[test]
fn media_switch_swaps_engines_within_bounds() {
    let mut player = new_player();
    assert!(player.play_media("synth:audio?dur=60000", false));
    assert!(run_until(&mut player, Duration::from_secs(3), |p| {
        p.state() == PlayerState::Playing
    }));

    let switch_started = Instant::now();
    assert!(player.play_media("synth:av?fps=30&dur=60000", false));
    assert!(player.is_switching());

    // The swap completes, the old engine is gone, and the new source is
    // playing. run_until asserts the three-engine bound on every tick.
    assert!(
        run_until(&mut player, Duration::from_secs(20), |p| {
            p.state() == PlayerState::Playing
                && p.uri() == "synth:av?fps=30&dur=60000"
                && p.engine_count() == 1
        }),
        "media switch did not complete"
    );
    assert!(
        switch_started.elapsed() < Duration::from_secs(5),
        "old engine outlived its stop budget"
    );
    assert!(player
        .current_engine()
        .is_some_and(|e| e.current_stream(StreamType::Video).is_some()));

    player.stop();
    run_until(&mut player, Duration::from_secs(2), |p| {
        p.state() == PlayerState::Stopped
    });
}

#[test]
fn failed_switch_leaves_current_engine_playing() {
    let mut player = new_player();
    assert!(player.play_media("synth:audio?dur=60000", false));
    assert!(run_until(&mut player, Duration::from_secs(3), |p| {
        p.state() == PlayerState::Playing
    }));

    // A URI that opens but errors during the open sequence.
    assert!(player.play_media("synth:nonsense", false));
    assert!(run_until(&mut player, Duration::from_secs(3), |p| {
        !p.is_switching()
    }));

    // The original source is untouched and a user message was emitted.
    assert_eq!(player.state(), PlayerState::Playing);
    assert_eq!(player.uri(), "synth:audio?dur=60000");
    assert!(!player.drain_user_messages().is_empty());

    player.stop();
    run_until(&mut player, Duration::from_secs(2), |p| {
        p.state() == PlayerState::Stopped
    });
}

// ============================================================================
// S6: stop preempts a stuck open
// ============================================================================

#[test]
fn stop_on_stuck_open_returns_to_idle_within_a_second() {
    let mut player = new_player();
    assert!(player.play_media("synth:hang", false));

    // Give the open a moment to get stuck in the blocking read.
    let settle = Instant::now() + Duration::from_millis(200);
    while Instant::now() < settle {
        player.refresh(Instant::now(), (1280, 720), true);
        std::thread::sleep(Duration::from_millis(10));
    }

    let stop_started = Instant::now();
    player.stop();
    player.refresh(Instant::now(), (1280, 720), true);
    assert!(
        stop_started.elapsed() < Duration::from_secs(1),
        "stop took {:?}",
        stop_started.elapsed()
    );
    assert_eq!(player.state(), PlayerState::Stopped);
    assert_eq!(player.engine_count(), 0);
}

// ============================================================================
// Command surface
// ============================================================================

#[test]
fn handle_commands_drive_playback() {
    let mut player = new_player();
    let handle = player.handle();

    handle.play("synth:audio?dur=60000", false);
    assert!(run_until(&mut player, Duration::from_secs(3), |p| {
        p.state() == PlayerState::Playing
    }));

    handle.pause();
    assert!(run_until(&mut player, Duration::from_secs(2), |p| {
        p.state() == PlayerState::Paused
    }));

    handle.toggle_pause();
    assert!(run_until(&mut player, Duration::from_secs(2), |p| {
        p.state() == PlayerState::Playing
    }));

    handle.stop();
    assert!(run_until(&mut player, Duration::from_secs(2), |p| {
        p.state() == PlayerState::Stopped
    }));
}

// ============================================================================
// Invariant 6: bounded demuxer backlog
// ============================================================================

/// A sink that always reports full, so the audio worker never drains
/// its queue and the demuxer's byte ceiling is what bounds growth.
struct SaturatedSink;

impl AudioSink for SaturatedSink {
    fn should_passthrough(&self, _: u32, _: u32, _: CodecId, _: i32, _: bool) -> bool {
        false
    }
    fn decoder_will_downmix(&self, _: CodecId) -> bool {
        false
    }
    fn needs_decoding_before_passthrough(&self) -> bool {
        true
    }
    fn max_channels(&self) -> u32 {
        2
    }
    fn fill_status(&self) -> i32 {
        i32::MAX
    }
    fn set_audio_params(&self, _: &AudioDescription, _: u32) {}
    fn initialise(&self) {}
    fn add_audio_data(&self, _: &[u8], _: Option<i64>, _: i32) -> bool {
        true
    }
    fn drain(&self) {}
    fn has_audio_out(&self) -> bool {
        true
    }
    fn audio_time(&self) -> Option<(i64, Instant)> {
        None
    }
}

#[test]
fn audio_queue_stays_within_byte_ceiling() {
    let config = test_config();
    let ceiling = config.max_audio_queue_bytes;
    let mut engine = MediaEngine::new(
        "synth:audio?rate=48000&ch=2&dur=600000",
        config,
        Arc::new(SaturatedSink),
        Arc::new(FrameBuffers::with_default_capacity()),
    );
    assert!(engine.open());

    let deadline = Instant::now() + Duration::from_secs(3);
    while engine.state() != DecoderState::Paused && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    engine.start();

    // Let the demuxer fill against a worker that consumes nothing, then
    // watch the high-water mark for a while.
    let watch_until = Instant::now() + Duration::from_secs(2);
    let mut peak = 0usize;
    while Instant::now() < watch_until {
        peak = peak.max(engine.audio_queue_bytes());
        std::thread::sleep(Duration::from_millis(20));
    }

    // One stereo S16 packet is 4 KiB; allow that overshoot and nothing
    // more.
    assert!(peak > ceiling / 2, "queue never filled (peak {peak})");
    assert!(
        peak <= ceiling + 8 * 1024,
        "queue exceeded ceiling: {peak} > {ceiling}"
    );

    engine.stop();
}
