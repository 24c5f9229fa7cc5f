//! Decoder state machines and the per-track worker threads.
//!
//! Each worker owns one packet queue and runs a small state machine:
//! intents from the demuxer land in `requested_state` and are applied by
//! the worker itself, which then reports back through `state`. Workers
//! share nothing with the demuxer beyond the queue, the interrupt flag
//! and the [`DecoderShared`] tables they are constructed with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::audio::{AudioDescription, AudioSink};
use crate::config::{EngineConfig, DECODE_AUDIO, DECODE_VIDEO};
use crate::format::AudioCodec;
use crate::packet::{Packet, PacketQueue};
use crate::stream::{select_stream, CodecId, Program, Stream, StreamType, STREAM_TYPE_COUNT};

/// Timestamp sentinel meaning "unknown".
pub(crate) const NO_PTS: i64 = i64::MIN;

/// States shared by the workers, the demuxer and the engine surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DecoderState {
    None = 0,
    Opening,
    Paused,
    Pausing,
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl DecoderState {
    fn from_u8(value: u8) -> DecoderState {
        match value {
            0 => DecoderState::None,
            1 => DecoderState::Opening,
            2 => DecoderState::Paused,
            3 => DecoderState::Pausing,
            4 => DecoderState::Starting,
            5 => DecoderState::Running,
            6 => DecoderState::Stopping,
            7 => DecoderState::Stopped,
            _ => DecoderState::Errored,
        }
    }
}

impl std::fmt::Display for DecoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An atomically readable/writable [`DecoderState`].
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: DecoderState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> DecoderState {
        DecoderState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: DecoderState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// State shared between the engine, the demuxer and the workers.
///
/// Workers receive this as an opaque handle instead of a back-reference
/// to the engine that owns them.
pub(crate) struct DecoderShared {
    pub config: EngineConfig,
    /// Raised by stop(); every loop checks it between iterations, and
    /// blocking buffers poll it as their abort callback.
    pub interrupt: Arc<AtomicBool>,
    /// Seek latch, consumed by the demuxer on its next iteration.
    pub seek_requested: AtomicBool,
    /// Program-selection request (-1 = none), applied while paused.
    pub program_request: AtomicI64,
    /// Stream re-selection request, applied while paused.
    pub reselect_request: AtomicBool,
    /// Selected container stream index per type bucket; -1 = none.
    selected: [AtomicI64; STREAM_TYPE_COUNT],
    /// The three packet queues, demuxer-filled and worker-drained.
    pub audio_queue: Arc<PacketQueue>,
    pub video_queue: Arc<PacketQueue>,
    pub subtitle_queue: Arc<PacketQueue>,
    pub programs: RwLock<Vec<Program>>,
    pub current_program: AtomicI64,
    /// Audio PTS high-water mark in milliseconds ([`NO_PTS`] = unknown).
    pub audio_pts: AtomicI64,
    /// Video PTS watermark, reset by the video worker on flush.
    pub video_pts: AtomicI64,
    /// First decoded video PTS since the last flush.
    pub first_video_pts: AtomicI64,
    /// While set, early audio is gated on the first video timestamp.
    pub filter_audio: AtomicBool,
}

impl DecoderShared {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            interrupt: Arc::new(AtomicBool::new(false)),
            seek_requested: AtomicBool::new(false),
            program_request: AtomicI64::new(-1),
            reselect_request: AtomicBool::new(false),
            selected: Default::default(),
            audio_queue: Arc::new(PacketQueue::new()),
            video_queue: Arc::new(PacketQueue::new()),
            subtitle_queue: Arc::new(PacketQueue::new()),
            programs: RwLock::new(Vec::new()),
            current_program: AtomicI64::new(0),
            audio_pts: AtomicI64::new(NO_PTS),
            video_pts: AtomicI64::new(NO_PTS),
            first_video_pts: AtomicI64::new(NO_PTS),
            filter_audio: AtomicBool::new(false),
        }
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    pub fn selected_stream(&self, stream_type: StreamType) -> Option<usize> {
        let bucket = stream_type.bucket()?;
        let index = self.selected[bucket].load(Ordering::Acquire);
        (index >= 0).then_some(index as usize)
    }

    pub fn set_selected(&self, stream_type: StreamType, index: Option<usize>) {
        if let Some(bucket) = stream_type.bucket() {
            self.selected[bucket].store(index.map_or(-1, |i| i as i64), Ordering::Release);
        }
    }

    /// Runs stream selection for one type over the current program.
    /// Returns true when the selection did not change.
    pub fn select_stream(&self, stream_type: StreamType) -> bool {
        let current = self.selected_stream(stream_type);
        let disabled = match stream_type {
            StreamType::Audio => self.config.decode_flags & DECODE_AUDIO == 0,
            StreamType::Video | StreamType::Subtitle | StreamType::RawText => {
                self.config.decode_flags & DECODE_VIDEO == 0
            }
            _ => true,
        };

        let selected = if disabled {
            None
        } else {
            let programs = self.programs.read();
            let program = self.current_program.load(Ordering::Acquire).max(0) as usize;
            programs.get(program).and_then(|p| {
                select_stream(
                    p.streams_of(stream_type),
                    self.config.user_locale.as_deref(),
                )
            })
        };

        self.set_selected(stream_type, selected);
        current == selected
    }

    /// Looks up the stream record for a selected container index.
    pub fn stream_info(&self, stream_type: StreamType, index: usize) -> Option<Stream> {
        let programs = self.programs.read();
        let program = self.current_program.load(Ordering::Acquire).max(0) as usize;
        programs.get(program).and_then(|p| {
            p.streams_of(stream_type)
                .iter()
                .find(|s| s.index == index)
                .cloned()
        })
    }
}

/// Audio codecs opened by the demuxer, keyed by container stream index.
/// Deposited while the workers are paused; consumed by the audio worker.
pub(crate) type AudioCodecTable = Arc<Mutex<HashMap<usize, Box<dyn AudioCodec>>>>;

/// Handle to one decoder worker thread.
pub(crate) struct Worker {
    name: &'static str,
    pub queue: Arc<PacketQueue>,
    pub state: Arc<StateCell>,
    requested: Arc<StateCell>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.state.load() == DecoderState::Paused
    }

    pub fn stop(&self) {
        self.requested.store(DecoderState::Stopped);
        self.queue.wake_all();
    }

    pub fn pause(&self) {
        self.requested.store(DecoderState::Paused);
        self.queue.wake_all();
    }

    pub fn unpause(&self) {
        self.requested.store(DecoderState::Running);
        self.queue.wake_all();
    }

    /// Waits for the worker thread to finish, polling liveness at 50 ms
    /// granularity. Returns false on timeout; cleanup proceeds anyway.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        while self.is_running() {
            if let Some(timeout) = timeout {
                if started.elapsed() > timeout {
                    tracing::warn!("Thread '{}' failed to stop", self.name);
                    return false;
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        true
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn spawn(
    name: &'static str,
    queue: Arc<PacketQueue>,
    body: impl FnOnce(&PacketQueue, &StateCell, &StateCell) + Send + 'static,
) -> Worker {
    let state = Arc::new(StateCell::new(DecoderState::None));
    let requested = Arc::new(StateCell::new(DecoderState::None));
    let running = Arc::new(AtomicBool::new(true));

    let thread_queue = Arc::clone(&queue);
    let thread_state = Arc::clone(&state);
    let thread_requested = Arc::clone(&requested);
    let thread_running = Arc::clone(&running);

    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            tracing::info!("{name} thread starting");
            body(&thread_queue, &thread_state, &thread_requested);
            thread_running.store(false, Ordering::Release);
            tracing::info!("{name} thread stopping");
        })
        .expect("failed to spawn worker thread");

    Worker {
        name,
        queue,
        state,
        requested,
        running,
        handle: Some(handle),
    }
}

/// Applies a pending intent. Returns false when the worker must exit.
fn apply_intent(state: &StateCell, requested: &StateCell) -> bool {
    match requested.load() {
        DecoderState::Stopped => return false,
        DecoderState::Running => {
            requested.store(DecoderState::None);
            state.store(DecoderState::Running);
        }
        DecoderState::Paused => {
            requested.store(DecoderState::None);
            state.store(DecoderState::Paused);
        }
        _ => {}
    }
    true
}

// ============================================================================
// Video worker
// ============================================================================

/// Spawns the video worker.
///
/// Video frames are decoded demuxer-side into the frame pool, so this
/// worker's job is flush bookkeeping: it drains its queue, resets the
/// video PTS watermark on markers and discards spent packets.
pub(crate) fn spawn_video_worker(shared: Arc<DecoderShared>) -> Worker {
    let queue = Arc::clone(&shared.video_queue);
    spawn("VideoDecode", queue, move |queue, state, requested| {
        shared.video_pts.store(NO_PTS, Ordering::Release);
        state.store(DecoderState::Paused);

        while !shared.interrupted() {
            queue.wait_for_work(Duration::from_millis(100));
            if shared.interrupted() || !apply_intent(state, requested) {
                break;
            }

            while state.load() == DecoderState::Running {
                let Some(packet) = queue.pop() else { break };
                match packet {
                    Packet::Flush => {
                        shared.video_pts.store(NO_PTS, Ordering::Release);
                    }
                    Packet::Data(packet) => {
                        if let Some(pts) = packet.pts {
                            if shared.selected_stream(StreamType::Video)
                                == Some(packet.stream_index)
                            {
                                shared.video_pts.store(pts, Ordering::Release);
                            }
                        }
                    }
                }
            }
        }

        state.store(DecoderState::Stopped);
        queue.flush(true);
    })
}

// ============================================================================
// Subtitle worker
// ============================================================================

/// Spawns the subtitle worker: the video worker's skeleton without the
/// watermark, since subtitle events are produced elsewhere.
pub(crate) fn spawn_subtitle_worker(shared: Arc<DecoderShared>) -> Worker {
    let queue = Arc::clone(&shared.subtitle_queue);
    spawn("SubsDecode", queue, move |queue, state, requested| {
        state.store(DecoderState::Paused);

        while !shared.interrupted() {
            queue.wait_for_work(Duration::from_millis(100));
            if shared.interrupted() || !apply_intent(state, requested) {
                break;
            }

            while state.load() == DecoderState::Running {
                if queue.pop().is_none() {
                    break;
                }
            }
        }

        state.store(DecoderState::Stopped);
        queue.flush(true);
    })
}

// ============================================================================
// Audio worker
// ============================================================================

/// Spawns the audio worker: decodes (or passes through) audio packets
/// and feeds the sink, which it alone may mutate after setup.
pub(crate) fn spawn_audio_worker(
    shared: Arc<DecoderShared>,
    sink: Arc<dyn AudioSink>,
    codecs: AudioCodecTable,
) -> Worker {
    let queue = Arc::clone(&shared.audio_queue);
    spawn("AudioDecode", queue, move |queue, state, requested| {
        audio_loop(&shared, sink.as_ref(), &codecs, queue, state, requested);
        state.store(DecoderState::Stopped);
        queue.flush(true);
    })
}

fn audio_loop(
    shared: &DecoderShared,
    sink: &dyn AudioSink,
    codecs: &AudioCodecTable,
    queue: &PacketQueue,
    state: &StateCell,
    requested: &StateCell,
) {
    shared.audio_pts.store(NO_PTS, Ordering::Release);
    state.store(DecoderState::Paused);
    let mut description: Option<AudioDescription> = None;

    while !shared.interrupted() {
        if !apply_intent(state, requested) {
            break;
        }
        if state.load() != DecoderState::Running {
            queue.wait_for_work(Duration::from_millis(100));
            continue;
        }

        // Wait for the audio device when it is comfortably full. The
        // sleep is half the sink's buffering granularity so pause and
        // stop intents stay responsive.
        if let Some(ref current) = description {
            if sink.fill_status() > current.best_fill_size() {
                std::thread::sleep(Duration::from_millis(current.buffer_time_ms() / 2));
                continue;
            }
        }

        let Some(packet) = queue.pop() else {
            queue.wait_for_work(Duration::from_millis(100));
            continue;
        };

        let packet = match packet {
            Packet::Flush => {
                let mut table = codecs.lock();
                for codec in table.values_mut() {
                    codec.flush();
                }
                shared.audio_pts.store(NO_PTS, Ordering::Release);
                continue;
            }
            Packet::Data(packet) => packet,
        };

        // Stale packets from a previously selected stream are discarded.
        let Some(index) = shared.selected_stream(StreamType::Audio) else {
            continue;
        };
        if index != packet.stream_index {
            continue;
        }

        let mut table = codecs.lock();
        let Some(codec) = table.get_mut(&index) else {
            continue;
        };

        let mut predecoded: Option<Vec<u8>> = None;
        let mut reselect = false;

        // Some streams only reveal their channel layout on the first
        // decode. Decide passthrough vs downmix before poking them.
        if codec.channels() == 0 {
            let passthrough = sink.should_passthrough(
                codec.sample_rate(),
                codec.channels(),
                codec.codec_id(),
                codec.profile(),
                false,
            );
            if passthrough || !sink.decoder_will_downmix(codec.codec_id()) {
                // For passthrough, or codecs the decoder won't downmix,
                // let the decoder pick the channel count; downmix (if
                // any) happens sink-side.
                codec.set_request_channels(0);
            } else {
                codec.set_request_channels(sink.max_channels());
                if codec.codec_id() == CodecId::Ac3 {
                    codec.force_channels(sink.max_channels());
                }
            }
            match codec.decode(&packet) {
                Ok(samples) => predecoded = Some(samples),
                Err(err) => {
                    tracing::error!("Audio decode error: {err}");
                    continue;
                }
            }
            reselect = codec.channels() > 0;
        }

        if reselect {
            tracing::info!("Audio stream parameters known; re-selecting");
            shared.select_stream(StreamType::Audio);
            description = setup_audio(shared, sink, codec.as_mut());
        }

        let Some(current) = description.clone().or_else(|| {
            description = setup_audio(shared, sink, codec.as_mut());
            description.clone()
        }) else {
            continue;
        };

        let samples = if current.passthrough {
            if predecoded.is_none() && sink.needs_decoding_before_passthrough() {
                if let Err(err) = codec.decode(&packet) {
                    tracing::error!("Audio decode error: {err}");
                    continue;
                }
            }
            // Forward the encoded bitstream untouched.
            packet.data.clone()
        } else {
            let samples = match predecoded {
                Some(samples) => samples,
                None => match codec.decode(&packet) {
                    Ok(samples) => samples,
                    Err(err) => {
                        tracing::error!("Audio decode error: {err}");
                        continue;
                    }
                },
            };

            // The container's idea of the stream can lag reality; when
            // decode disagrees, re-select and re-setup before pushing
            // mismatched samples at the sink.
            if codec.sample_rate() != current.sample_rate || codec.channels() != current.channels
            {
                tracing::warn!(
                    "Audio stream changed (samplerate {}->{} channels {}->{})",
                    current.sample_rate,
                    codec.sample_rate(),
                    current.channels,
                    codec.channels()
                );
                if shared.select_stream(StreamType::Audio) {
                    tracing::info!("On same audio stream");
                }
                sink.drain();
                description = setup_audio(shared, sink, codec.as_mut());
                continue;
            }
            samples
        };
        drop(table);

        if samples.is_empty() {
            continue;
        }

        // Gate early audio until the video pipeline has produced its
        // first timestamp, so seconds of audio don't pile into the sink
        // ahead of the first picture.
        if shared.filter_audio.load(Ordering::Acquire) {
            let first_video = shared.first_video_pts.load(Ordering::Acquire);
            if first_video == NO_PTS {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            if packet.pts.is_some_and(|pts| pts < first_video) {
                continue;
            }
            shared.filter_audio.store(false, Ordering::Release);
        }

        // Strictly increasing audio PTS: only deliveries that advance
        // the high-water mark carry a timestamp forward.
        let watermark = shared.audio_pts.load(Ordering::Acquire);
        let advanced = match packet.pts {
            Some(pts) if watermark == NO_PTS || pts > watermark => {
                shared.audio_pts.store(pts, Ordering::Release);
                true
            }
            Some(_) => false,
            None => true,
        };
        if !advanced {
            continue;
        }

        let pts = match shared.audio_pts.load(Ordering::Acquire) {
            NO_PTS => None,
            pts => Some(pts),
        };
        let frames = if current.channels == 0 {
            -1
        } else {
            (samples.len() / current.frame_size()) as i32
        };
        if !sink.add_audio_data(&samples, pts, frames) {
            tracing::warn!("Audio sink refused data; re-initialising output");
            description = None;
        }
    }
}

/// Maps the codec's current output onto an [`AudioDescription`] and
/// reconfigures the sink when the identifying fields changed.
///
/// Returns `None` while the stream is not describable yet (unknown
/// channel count or unsupported sample format).
fn setup_audio(
    shared: &DecoderShared,
    sink: &dyn AudioSink,
    codec: &mut dyn AudioCodec,
) -> Option<AudioDescription> {
    let index = shared.selected_stream(StreamType::Audio)?;
    if codec.channels() == 0 {
        return None;
    }
    let Some(format) = codec.sample_format() else {
        tracing::error!("Unsupported sample format on stream {index}");
        return None;
    };

    let passthrough = sink.should_passthrough(
        codec.sample_rate(),
        codec.channels(),
        codec.codec_id(),
        codec.profile(),
        false,
    );

    let mut request_channels = codec.channels();
    if !passthrough
        && codec.channels() > sink.max_channels()
        && sink.decoder_will_downmix(codec.codec_id())
    {
        request_channels = sink.max_channels();
    }
    codec.set_request_channels(request_channels);

    let original_channels = shared
        .stream_info(StreamType::Audio, index)
        .map(|s| s.original_channels)
        .unwrap_or(codec.channels());
    let codec_profile = if codec.codec_id() == CodecId::Dts {
        codec.profile()
    } else {
        0
    };

    let description = AudioDescription {
        codec: codec.codec_id(),
        format,
        sample_rate: codec.sample_rate(),
        channels: codec.channels(),
        passthrough,
        original_channels,
        codec_profile,
    };

    tracing::info!("Audio configured: {description}");
    sink.set_audio_params(&description, request_channels);
    sink.initialise();
    Some(description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullSink;
    use crate::error::MediaError;
    use crate::packet::DemuxPacket;
    use crate::stream::Disposition;

    struct TestCodec {
        channels: u32,
        sample_rate: u32,
    }

    impl AudioCodec for TestCodec {
        fn codec_id(&self) -> CodecId {
            CodecId::PcmS16
        }
        fn profile(&self) -> i32 {
            0
        }
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }
        fn channels(&self) -> u32 {
            self.channels
        }
        fn sample_format(&self) -> Option<crate::audio::SampleFormat> {
            Some(crate::audio::SampleFormat::S16)
        }
        fn set_request_channels(&mut self, _channels: u32) {}
        fn force_channels(&mut self, channels: u32) {
            self.channels = channels;
        }
        fn decode(&mut self, packet: &DemuxPacket) -> Result<Vec<u8>, MediaError> {
            Ok(packet.data.clone())
        }
        fn flush(&mut self) {}
    }

    fn shared_with_audio_stream() -> Arc<DecoderShared> {
        let shared = Arc::new(DecoderShared::new(EngineConfig::default()));
        let mut program = Program {
            id: 1,
            index: 0,
            ..Program::default()
        };
        program.add_stream(Stream {
            stream_type: StreamType::Audio,
            index: 0,
            id: 0,
            secondary_index: 0,
            disposition: Disposition(Disposition::DEFAULT),
            language: "eng".to_string(),
            codec: CodecId::PcmS16,
            original_channels: 2,
            metadata: HashMap::new(),
        });
        *shared.programs.write() = vec![program];
        shared.set_selected(StreamType::Audio, Some(0));
        shared
    }

    fn audio_packet(pts: i64, frames: usize) -> Packet {
        Packet::Data(DemuxPacket {
            stream_index: 0,
            pts: Some(pts),
            dts: Some(pts),
            data: vec![0u8; frames * 4],
        })
    }

    #[test]
    fn test_state_cell_round_trip() {
        let cell = StateCell::new(DecoderState::None);
        assert_eq!(cell.load(), DecoderState::None);
        for state in [
            DecoderState::Opening,
            DecoderState::Paused,
            DecoderState::Pausing,
            DecoderState::Starting,
            DecoderState::Running,
            DecoderState::Stopping,
            DecoderState::Stopped,
            DecoderState::Errored,
        ] {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn test_worker_starts_paused_and_stops_on_request() {
        let shared = Arc::new(DecoderShared::new(EngineConfig::default()));
        let worker = spawn_video_worker(Arc::clone(&shared));

        let deadline = Instant::now() + Duration::from_secs(1);
        while !worker.is_paused() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.is_paused());

        worker.stop();
        assert!(worker.wait(Some(Duration::from_secs(1))));
        assert_eq!(worker.state.load(), DecoderState::Stopped);
    }

    #[test]
    fn test_video_worker_tracks_and_resets_watermark() {
        let shared = shared_with_audio_stream();
        shared.set_selected(StreamType::Video, Some(0));
        let worker = spawn_video_worker(Arc::clone(&shared));
        worker.unpause();

        worker.queue.push(Packet::Data(DemuxPacket {
            stream_index: 0,
            pts: Some(120),
            dts: None,
            data: vec![0u8; 8],
        }));
        let deadline = Instant::now() + Duration::from_secs(1);
        while shared.video_pts.load(Ordering::Acquire) == NO_PTS && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(shared.video_pts.load(Ordering::Acquire), 120);

        worker.queue.push(Packet::Flush);
        let deadline = Instant::now() + Duration::from_secs(1);
        while shared.video_pts.load(Ordering::Acquire) != NO_PTS && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(shared.video_pts.load(Ordering::Acquire), NO_PTS);

        worker.stop();
        assert!(worker.wait(Some(Duration::from_secs(1))));
    }

    #[test]
    fn test_audio_worker_feeds_sink_with_monotonic_pts() {
        let shared = shared_with_audio_stream();
        let sink = Arc::new(NullSink::new());
        let codecs: AudioCodecTable = Arc::new(Mutex::new(HashMap::new()));
        codecs.lock().insert(
            0,
            Box::new(TestCodec {
                channels: 2,
                sample_rate: 48_000,
            }) as Box<dyn AudioCodec>,
        );

        let worker = spawn_audio_worker(
            Arc::clone(&shared),
            Arc::clone(&sink) as Arc<dyn AudioSink>,
            codecs,
        );
        worker.unpause();

        for i in 0..5i64 {
            worker.queue.push(audio_packet(i * 20, 960));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.total_frames() < 5 * 960 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sink.total_frames(), 5 * 960);
        assert_eq!(shared.audio_pts.load(Ordering::Acquire), 80);

        worker.stop();
        assert!(worker.wait(Some(Duration::from_secs(1))));
    }

    #[test]
    fn test_audio_worker_discards_foreign_and_stale_packets() {
        let shared = shared_with_audio_stream();
        let sink = Arc::new(NullSink::new());
        let codecs: AudioCodecTable = Arc::new(Mutex::new(HashMap::new()));
        codecs.lock().insert(
            0,
            Box::new(TestCodec {
                channels: 2,
                sample_rate: 48_000,
            }) as Box<dyn AudioCodec>,
        );

        let worker = spawn_audio_worker(
            Arc::clone(&shared),
            Arc::clone(&sink) as Arc<dyn AudioSink>,
            codecs,
        );
        worker.unpause();

        // Wrong stream index: dropped without touching the sink.
        worker.queue.push(Packet::Data(DemuxPacket {
            stream_index: 3,
            pts: Some(0),
            dts: None,
            data: vec![0u8; 64],
        }));
        // Delivered.
        worker.queue.push(audio_packet(100, 240));
        // PTS does not advance the watermark: dropped.
        worker.queue.push(audio_packet(50, 240));

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.total_frames() < 240 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.total_frames(), 240);
        assert_eq!(shared.audio_pts.load(Ordering::Acquire), 100);

        worker.stop();
        worker.wait(Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_audio_worker_flush_resets_watermark_before_next_packet() {
        let shared = shared_with_audio_stream();
        let sink = Arc::new(NullSink::new());
        let codecs: AudioCodecTable = Arc::new(Mutex::new(HashMap::new()));
        codecs.lock().insert(
            0,
            Box::new(TestCodec {
                channels: 2,
                sample_rate: 48_000,
            }) as Box<dyn AudioCodec>,
        );

        let worker = spawn_audio_worker(
            Arc::clone(&shared),
            Arc::clone(&sink) as Arc<dyn AudioSink>,
            codecs,
        );
        worker.unpause();

        worker.queue.push(audio_packet(500, 240));
        let deadline = Instant::now() + Duration::from_secs(2);
        while shared.audio_pts.load(Ordering::Acquire) != 500 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        worker.queue.push(Packet::Flush);
        // After a seek the stream restarts earlier than the old
        // watermark; the flush must have cleared it.
        worker.queue.push(audio_packet(0, 240));

        let deadline = Instant::now() + Duration::from_secs(2);
        while shared.audio_pts.load(Ordering::Acquire) != 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(shared.audio_pts.load(Ordering::Acquire), 0);

        worker.stop();
        worker.wait(Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_worker_queue_flushed_on_exit() {
        let shared = Arc::new(DecoderShared::new(EngineConfig::default()));
        let worker = spawn_subtitle_worker(Arc::clone(&shared));
        worker.queue.push(Packet::Data(DemuxPacket::empty(0)));
        worker.stop();
        assert!(worker.wait(Some(Duration::from_secs(1))));
        // Teardown leaves exactly the marker from the final flush.
        assert_eq!(worker.queue.length(), 1);
    }
}
