//! Headless playback demo.
//!
//! Plays a URI through the full pipeline with a null renderer and
//! prints playback progress. With no argument a synthetic A/V source
//! is played, which exercises everything except a real container:
//!
//! ```text
//! corvid-demo [URI] [SECONDS]
//! cargo run -p corvid-demo -- synth:av?fps=30&dur=10000
//! cargo run -p corvid-demo --features ffmpeg -- /path/to/movie.mkv
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use corvid_core::{EngineConfig, NullRenderer, Player, PlayerState};

#[cfg(feature = "cpal-output")]
use corvid_core::CpalSink;
#[cfg(not(feature = "cpal-output"))]
use corvid_core::NullSink;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let uri = args
        .next()
        .unwrap_or_else(|| "synth:av?fps=30&dur=10000".to_string());
    let seconds: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(10);

    #[cfg(feature = "cpal-output")]
    let sink = Arc::new(CpalSink::new()) as Arc<dyn corvid_core::AudioSink>;
    #[cfg(not(feature = "cpal-output"))]
    let sink = Arc::new(NullSink::new()) as Arc<dyn corvid_core::AudioSink>;

    let mut player = Player::new(Box::new(NullRenderer), sink, EngineConfig::default());

    tracing::info!("Playing '{uri}' for up to {seconds}s");
    if !player.play_media(uri.as_str(), false) {
        for message in player.drain_user_messages() {
            eprintln!("{message}");
        }
        std::process::exit(1);
    }

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut last_state = PlayerState::None;
    let mut last_report = Instant::now();

    while Instant::now() < deadline {
        let now = Instant::now();
        player.refresh(now, (1280, 720), true);

        let state = player.state();
        if state != last_state {
            println!("state: {last_state} -> {state}");
            last_state = state;
        }
        for message in player.drain_user_messages() {
            eprintln!("{message}");
        }
        if matches!(state, PlayerState::Stopped | PlayerState::Errored) {
            break;
        }

        if last_report.elapsed() > Duration::from_secs(1) {
            last_report = Instant::now();
            let clock = player
                .clock(now)
                .map(|ms| format!("{:.2}s", ms as f64 / 1000.0))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "clock {clock}  frames {} (dropped {})",
                player.frames_displayed(),
                player.frames_dropped()
            );
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    player.stop();
    let stop_deadline = Instant::now() + Duration::from_secs(3);
    while player.state() != PlayerState::Stopped && Instant::now() < stop_deadline {
        player.refresh(Instant::now(), (1280, 720), true);
        std::thread::sleep(Duration::from_millis(5));
    }

    println!(
        "done: {} frames displayed, {} dropped",
        player.frames_displayed(),
        player.frames_dropped()
    );
}
