//! Audio descriptions and the audio sink collaborator.
//!
//! The engine never talks to an audio device directly: decoded (or
//! passthrough) sample blocks go to an [`AudioSink`], which also serves
//! as the master clock source for A/V sync. [`NullSink`] simulates
//! real-time playout for tests and audio-less hosts; a cpal-backed sink
//! is available behind the `cpal-output` feature.

use std::time::Instant;

use parking_lot::Mutex;

use crate::stream::CodecId;

/// Interleaved sample formats the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    S32,
    Flt,
}

impl SampleFormat {
    /// Bytes per sample for one channel.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S24 => 3,
            SampleFormat::S32 | SampleFormat::Flt => 4,
        }
    }
}

/// Immutable description of an audio stream as delivered to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDescription {
    pub codec: CodecId,
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u32,
    pub passthrough: bool,
    pub original_channels: u32,
    pub codec_profile: i32,
}

impl AudioDescription {
    /// Bytes for one sample across all channels.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.format.sample_size()
    }

    /// Bytes per second of audio at this description.
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * self.frame_size()
    }

    /// Sink buffering granularity in milliseconds. The audio worker
    /// sleeps half of this when the sink is full, which keeps pause
    /// latency within a frame or two.
    pub fn buffer_time_ms(&self) -> u64 {
        100
    }

    /// Fill level above which the audio worker stops decoding.
    pub fn best_fill_size(&self) -> i32 {
        (self.byte_rate() / 10) as i32
    }
}

impl std::fmt::Display for AudioDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {:?} {}Hz {}ch{}{}",
            self.codec,
            self.format,
            self.sample_rate,
            self.channels,
            if self.passthrough { " passthrough" } else { "" },
            if self.original_channels != self.channels {
                format!(" (original {}ch)", self.original_channels)
            } else {
                String::new()
            }
        )
    }
}

/// The audio output collaborator consumed by the audio worker.
///
/// Implementations are internally synchronized. After engine setup only
/// the audio worker mutates the sink; the supervisor reads the playout
/// clock through [`AudioSink::audio_time`].
pub trait AudioSink: Send + Sync {
    /// Whether the encoded bitstream should be forwarded untouched.
    fn should_passthrough(
        &self,
        sample_rate: u32,
        channels: u32,
        codec: CodecId,
        profile: i32,
        upmix: bool,
    ) -> bool;

    /// Whether the decoder downmixes this codec itself, as opposed to the
    /// sink mixing after decode.
    fn decoder_will_downmix(&self, codec: CodecId) -> bool;

    /// Whether passthrough data still needs a decode pass first.
    fn needs_decoding_before_passthrough(&self) -> bool;

    /// Most channels the output can render.
    fn max_channels(&self) -> u32;

    /// Bytes currently buffered and not yet played.
    fn fill_status(&self) -> i32;

    /// Configures the sink for a new stream description.
    /// `requested_channels` is what the decoder was asked to produce.
    fn set_audio_params(&self, description: &AudioDescription, requested_channels: u32);

    /// (Re)opens the output after `set_audio_params`.
    fn initialise(&self);

    /// Queues one block of samples. Returns false when the sink refuses
    /// the data, which triggers a re-setup.
    fn add_audio_data(&self, data: &[u8], pts: Option<i64>, frames: i32) -> bool;

    /// Lets buffered audio play out, then discards the rest.
    fn drain(&self);

    /// True once an output is open.
    fn has_audio_out(&self) -> bool;

    /// The monotonic audio playout timestamp in milliseconds and the
    /// instant it was last advanced. `None` until audio has started.
    fn audio_time(&self) -> Option<(i64, Instant)>;
}

// ============================================================================
// Null sink
// ============================================================================

struct NullSinkState {
    description: Option<AudioDescription>,
    initialised: bool,
    buffered_bytes: f64,
    playout_pts: Option<i64>,
    last_advance: Instant,
    last_update: Instant,
    total_frames: u64,
}

/// An [`AudioSink`] that consumes audio at real-time rate without a
/// device. Drives the master clock exactly like a real output, which is
/// what the integration tests run against.
pub struct NullSink {
    state: Mutex<NullSinkState>,
}

impl NullSink {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(NullSinkState {
                description: None,
                initialised: false,
                buffered_bytes: 0.0,
                playout_pts: None,
                last_advance: now,
                last_update: now,
                total_frames: 0,
            }),
        }
    }

    /// Total sample frames accepted since setup. Test hook.
    pub fn total_frames(&self) -> u64 {
        self.state.lock().total_frames
    }

    fn advance(state: &mut NullSinkState, now: Instant) {
        let Some(ref description) = state.description else {
            return;
        };
        if !state.initialised {
            return;
        }
        let elapsed = now.duration_since(state.last_advance).as_secs_f64();
        state.last_advance = now;
        if state.buffered_bytes <= 0.0 {
            return;
        }
        let consumable = description.byte_rate() as f64 * elapsed;
        let consumed = consumable.min(state.buffered_bytes);
        if consumed > 0.0 {
            state.buffered_bytes -= consumed;
            let consumed_ms = consumed * 1000.0 / description.byte_rate() as f64;
            if let Some(pts) = state.playout_pts {
                state.playout_pts = Some(pts + consumed_ms.round() as i64);
            }
            state.last_update = now;
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullSink {
    fn should_passthrough(
        &self,
        _sample_rate: u32,
        _channels: u32,
        _codec: CodecId,
        _profile: i32,
        _upmix: bool,
    ) -> bool {
        false
    }

    fn decoder_will_downmix(&self, codec: CodecId) -> bool {
        matches!(
            codec,
            CodecId::Ac3 | CodecId::Eac3 | CodecId::Dts | CodecId::TrueHd
        )
    }

    fn needs_decoding_before_passthrough(&self) -> bool {
        true
    }

    fn max_channels(&self) -> u32 {
        2
    }

    fn fill_status(&self) -> i32 {
        let mut state = self.state.lock();
        Self::advance(&mut state, Instant::now());
        state.buffered_bytes as i32
    }

    fn set_audio_params(&self, description: &AudioDescription, requested_channels: u32) {
        let mut state = self.state.lock();
        tracing::debug!(
            "Null sink params: {} (requested {}ch)",
            description,
            requested_channels
        );
        state.description = Some(description.clone());
        state.initialised = false;
        state.buffered_bytes = 0.0;
        state.playout_pts = None;
        state.total_frames = 0;
    }

    fn initialise(&self) {
        let mut state = self.state.lock();
        state.initialised = state.description.is_some();
        state.last_advance = Instant::now();
    }

    fn add_audio_data(&self, data: &[u8], pts: Option<i64>, frames: i32) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        if !state.initialised {
            return false;
        }
        Self::advance(&mut state, now);

        let byte_rate = state
            .description
            .as_ref()
            .map(|d| d.byte_rate())
            .unwrap_or(0);
        if byte_rate == 0 {
            return false;
        }

        if state.playout_pts.is_none() {
            if let Some(pts) = pts {
                // Playout of this block begins after what is already
                // queued ahead of it.
                let queued_ms = (state.buffered_bytes * 1000.0 / byte_rate as f64).round() as i64;
                state.playout_pts = Some(pts - queued_ms);
                state.last_update = now;
            }
        } else if let (Some(playout), Some(pts)) = (state.playout_pts, pts) {
            // A chunk far from the projected playout position is a
            // stream discontinuity (seek); restart the clock there.
            let queued_ms = (state.buffered_bytes * 1000.0 / byte_rate as f64).round() as i64;
            if (pts - (playout + queued_ms)).abs() > 500 {
                state.buffered_bytes = 0.0;
                state.playout_pts = Some(pts);
                state.last_update = now;
            }
        }

        state.buffered_bytes += data.len() as f64;
        if frames > 0 {
            state.total_frames += frames as u64;
        }
        true
    }

    fn drain(&self) {
        let mut state = self.state.lock();
        if let (Some(pts), Some(description)) = (state.playout_pts, state.description.as_ref()) {
            let remaining_ms =
                (state.buffered_bytes * 1000.0 / description.byte_rate() as f64).round() as i64;
            state.playout_pts = Some(pts + remaining_ms);
        }
        state.buffered_bytes = 0.0;
        state.last_update = Instant::now();
    }

    fn has_audio_out(&self) -> bool {
        self.state.lock().initialised
    }

    fn audio_time(&self) -> Option<(i64, Instant)> {
        let mut state = self.state.lock();
        Self::advance(&mut state, Instant::now());
        state.playout_pts.map(|pts| (pts, state.last_update))
    }
}

// ============================================================================
// cpal sink
// ============================================================================

#[cfg(feature = "cpal-output")]
mod cpal_sink {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
    use std::sync::Arc;

    struct Shared {
        samples: Mutex<VecDeque<f32>>,
        // Playout clock, published from the output callback.
        base_pts_ms: AtomicI64,
        base_pts_valid: AtomicBool,
        frames_played: AtomicU64,
        last_update_us: AtomicU64,
        epoch: Instant,
    }

    struct CpalState {
        description: Option<AudioDescription>,
        stream: Option<cpal::Stream>,
        device_rate: u32,
        device_channels: u32,
    }

    /// cpal-backed [`AudioSink`] writing interleaved samples to the
    /// default output device.
    ///
    /// Samples are converted to f32 and queued into a ring the output
    /// callback drains; the playout clock is derived from frames the
    /// callback has actually consumed.
    pub struct CpalSink {
        shared: Arc<Shared>,
        state: Mutex<CpalState>,
    }

    impl CpalSink {
        pub fn new() -> Self {
            Self {
                shared: Arc::new(Shared {
                    samples: Mutex::new(VecDeque::new()),
                    base_pts_ms: AtomicI64::new(0),
                    base_pts_valid: AtomicBool::new(false),
                    frames_played: AtomicU64::new(0),
                    last_update_us: AtomicU64::new(0),
                    epoch: Instant::now(),
                }),
                state: Mutex::new(CpalState {
                    description: None,
                    stream: None,
                    device_rate: 48_000,
                    device_channels: 2,
                }),
            }
        }

        fn open_stream(&self, state: &mut CpalState) -> Result<(), String> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| "no output device".to_string())?;
            let config = device
                .default_output_config()
                .map_err(|e| format!("default output config: {e}"))?;

            state.device_rate = config.sample_rate().0;
            state.device_channels = config.channels() as u32;

            let shared = Arc::clone(&self.shared);
            let channels = state.device_channels as usize;

            let stream = device
                .build_output_stream(
                    &config.into(),
                    move |out: &mut [f32], _| {
                        let mut queue = shared.samples.lock();
                        let mut written = 0usize;
                        for slot in out.iter_mut() {
                            *slot = queue.pop_front().unwrap_or(0.0);
                            written += 1;
                        }
                        drop(queue);
                        let frames = (written / channels) as u64;
                        shared.frames_played.fetch_add(frames, Ordering::Relaxed);
                        shared.last_update_us.store(
                            shared.epoch.elapsed().as_micros() as u64,
                            Ordering::Relaxed,
                        );
                    },
                    |err| tracing::error!("Audio stream error: {err}"),
                    None,
                )
                .map_err(|e| format!("build output stream: {e}"))?;
            stream.play().map_err(|e| format!("start stream: {e}"))?;
            state.stream = Some(stream);
            Ok(())
        }

        fn convert_into(&self, description: &AudioDescription, data: &[u8], out: &mut VecDeque<f32>) {
            match description.format {
                SampleFormat::S16 => {
                    for pair in data.chunks_exact(2) {
                        let sample = i16::from_le_bytes([pair[0], pair[1]]);
                        out.push_back(sample as f32 / 32768.0);
                    }
                }
                SampleFormat::Flt => {
                    for quad in data.chunks_exact(4) {
                        out.push_back(f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]));
                    }
                }
                SampleFormat::S32 => {
                    for quad in data.chunks_exact(4) {
                        let sample = i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
                        out.push_back(sample as f32 / 2_147_483_648.0);
                    }
                }
                SampleFormat::U8 => {
                    for byte in data {
                        out.push_back((*byte as f32 - 128.0) / 128.0);
                    }
                }
                SampleFormat::S24 => {
                    for triple in data.chunks_exact(3) {
                        let sample =
                            i32::from_le_bytes([0, triple[0], triple[1], triple[2]]) >> 8;
                        out.push_back(sample as f32 / 8_388_608.0);
                    }
                }
            }
        }
    }

    impl Default for CpalSink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AudioSink for CpalSink {
        fn should_passthrough(
            &self,
            _sample_rate: u32,
            _channels: u32,
            _codec: CodecId,
            _profile: i32,
            _upmix: bool,
        ) -> bool {
            // No IEC passthrough over cpal; everything is decoded to PCM.
            false
        }

        fn decoder_will_downmix(&self, codec: CodecId) -> bool {
            matches!(
                codec,
                CodecId::Ac3 | CodecId::Eac3 | CodecId::Dts | CodecId::TrueHd
            )
        }

        fn needs_decoding_before_passthrough(&self) -> bool {
            true
        }

        fn max_channels(&self) -> u32 {
            self.state.lock().device_channels.max(2)
        }

        fn fill_status(&self) -> i32 {
            let state = self.state.lock();
            let Some(ref description) = state.description else {
                return 0;
            };
            let queued = self.shared.samples.lock().len();
            // Report in source-stream bytes so the worker's thresholds
            // stay in one unit.
            let frames = queued / state.device_channels.max(1) as usize;
            (frames * description.frame_size()) as i32
        }

        fn set_audio_params(&self, description: &AudioDescription, requested_channels: u32) {
            let mut state = self.state.lock();
            tracing::info!(
                "Audio output params: {} (requested {}ch)",
                description,
                requested_channels
            );
            state.description = Some(description.clone());
            self.shared.samples.lock().clear();
            self.shared.base_pts_valid.store(false, Ordering::Relaxed);
            self.shared.frames_played.store(0, Ordering::Relaxed);
        }

        fn initialise(&self) {
            let mut state = self.state.lock();
            if state.stream.is_none() {
                if let Err(err) = self.open_stream(&mut state) {
                    tracing::error!("Failed to open audio output: {err}");
                }
            }
        }

        fn add_audio_data(&self, data: &[u8], pts: Option<i64>, _frames: i32) -> bool {
            let state = self.state.lock();
            let Some(ref description) = state.description else {
                return false;
            };
            if state.stream.is_none() {
                return false;
            }
            if !self.shared.base_pts_valid.load(Ordering::Relaxed) {
                if let Some(pts) = pts {
                    self.shared.base_pts_ms.store(pts, Ordering::Relaxed);
                    self.shared.base_pts_valid.store(true, Ordering::Relaxed);
                    self.shared.frames_played.store(0, Ordering::Relaxed);
                }
            }
            let mut queue = self.shared.samples.lock();
            self.convert_into(description, data, &mut queue);
            true
        }

        fn drain(&self) {
            // Let the callback play what is queued; a bounded wait keeps
            // teardown prompt when the device has stalled.
            let deadline = Instant::now() + std::time::Duration::from_millis(500);
            while Instant::now() < deadline {
                if self.shared.samples.lock().is_empty() {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            self.shared.samples.lock().clear();
        }

        fn has_audio_out(&self) -> bool {
            self.state.lock().stream.is_some()
        }

        fn audio_time(&self) -> Option<(i64, Instant)> {
            if !self.shared.base_pts_valid.load(Ordering::Relaxed) {
                return None;
            }
            let state = self.state.lock();
            let description = state.description.as_ref()?;
            let frames = self.shared.frames_played.load(Ordering::Relaxed);
            let played_ms = frames * 1000 / description.sample_rate.max(1) as u64;
            let base = self.shared.base_pts_ms.load(Ordering::Relaxed);
            let updated_us = self.shared.last_update_us.load(Ordering::Relaxed);
            let updated =
                self.shared.epoch + std::time::Duration::from_micros(updated_us);
            Some((base + played_ms as i64, updated))
        }
    }

    // SAFETY: cpal::Stream is !Send on some back-ends; the stream is only
    // created and dropped under the state mutex and never accessed from
    // the output callback, which owns its own Arc<Shared>.
    unsafe impl Send for CpalSink {}
    unsafe impl Sync for CpalSink {}
}

#[cfg(feature = "cpal-output")]
pub use cpal_sink::CpalSink;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pcm_description() -> AudioDescription {
        AudioDescription {
            codec: CodecId::PcmS16,
            format: SampleFormat::S16,
            sample_rate: 48_000,
            channels: 2,
            passthrough: false,
            original_channels: 2,
            codec_profile: 0,
        }
    }

    #[test]
    fn test_description_sizes() {
        let description = pcm_description();
        assert_eq!(description.frame_size(), 4);
        assert_eq!(description.byte_rate(), 192_000);
        assert_eq!(description.best_fill_size(), 19_200);
    }

    #[test]
    fn test_null_sink_requires_initialise() {
        let sink = NullSink::new();
        assert!(!sink.add_audio_data(&[0u8; 64], Some(0), 16));
        sink.set_audio_params(&pcm_description(), 2);
        assert!(!sink.has_audio_out());
        sink.initialise();
        assert!(sink.has_audio_out());
        assert!(sink.add_audio_data(&[0u8; 64], Some(0), 16));
    }

    #[test]
    fn test_null_sink_consumes_in_real_time() {
        let sink = NullSink::new();
        sink.set_audio_params(&pcm_description(), 2);
        sink.initialise();

        // 100ms of audio.
        let block = vec![0u8; 19_200];
        assert!(sink.add_audio_data(&block, Some(0), 4_800));
        let initial = sink.fill_status();
        assert!(initial > 0);

        std::thread::sleep(Duration::from_millis(60));
        let later = sink.fill_status();
        assert!(later < initial, "fill should decay: {initial} -> {later}");
    }

    #[test]
    fn test_null_sink_audio_time_is_monotonic() {
        let sink = NullSink::new();
        sink.set_audio_params(&pcm_description(), 2);
        sink.initialise();
        assert!(sink.audio_time().is_none());

        sink.add_audio_data(&vec![0u8; 19_200], Some(1_000), 4_800);
        let mut previous = sink.audio_time().unwrap().0;
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(10));
            sink.add_audio_data(&vec![0u8; 1_920], None, 480);
            let now = sink.audio_time().unwrap().0;
            assert!(now >= previous);
            previous = now;
        }
    }

    #[test]
    fn test_null_sink_drain_empties_buffer() {
        let sink = NullSink::new();
        sink.set_audio_params(&pcm_description(), 2);
        sink.initialise();
        sink.add_audio_data(&vec![0u8; 19_200], Some(0), 4_800);
        sink.drain();
        assert_eq!(sink.fill_status(), 0);
        // Drained audio counts as played out (rounding aside).
        assert!(sink.audio_time().unwrap().0 >= 95);
    }
}
