//! The demuxer thread.
//!
//! Opens the input, enumerates programs and streams, opens codecs, then
//! reads packets in a loop and routes them to the per-track queues. All
//! state transitions requested by the engine are applied here; the
//! demuxer in turn drives the three worker state machines and confirms
//! their handshakes before reporting its own state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::audio::AudioSink;
use crate::config::{DECODE_AUDIO, DECODE_NONE, DECODE_VIDEO};
use crate::error::MediaError;
use crate::format::{codec_lock, open_demux, Demux, ReadOutcome};
use crate::frame::FrameBuffers;
use crate::packet::{DemuxPacket, Packet};
use crate::stream::{Chapter, StreamType};
use crate::worker::{
    spawn_audio_worker, spawn_subtitle_worker, spawn_video_worker, AudioCodecTable, DecoderShared,
    DecoderState, StateCell, Worker, NO_PTS,
};

/// How long teardown waits for each worker before proceeding anyway.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

struct Workers {
    audio: Worker,
    video: Worker,
    subtitle: Worker,
}

impl Workers {
    fn all_paused(&self) -> bool {
        self.audio.is_paused() && self.video.is_paused() && self.subtitle.is_paused()
    }

    fn any_paused(&self) -> bool {
        self.audio.is_paused() || self.video.is_paused() || self.subtitle.is_paused()
    }

    fn pause(&self) {
        self.video.pause();
        self.audio.pause();
        self.subtitle.pause();
    }

    fn unpause(&self) {
        self.video.unpause();
        self.audio.unpause();
        self.subtitle.unpause();
    }

    fn stop_and_wait(&mut self, timeout: Option<Duration>) {
        self.video.stop();
        self.audio.stop();
        self.subtitle.stop();
        self.video.wait(timeout);
        self.audio.wait(timeout);
        self.subtitle.wait(timeout);
        self.video.join();
        self.audio.join();
        self.subtitle.join();
    }

    fn queued_packets(&self) -> usize {
        self.audio.queue.length() + self.video.queue.length() + self.subtitle.queue.length()
    }

    fn flush_all(&self) {
        self.video.queue.flush(true);
        self.audio.queue.flush(true);
        self.subtitle.queue.flush(true);
    }
}

struct Demuxer {
    uri: String,
    shared: Arc<DecoderShared>,
    sink: Arc<dyn AudioSink>,
    frames: Arc<FrameBuffers>,
    state: Arc<StateCell>,
    requested: Arc<StateCell>,
    demux: Option<Box<dyn Demux>>,
    workers: Option<Workers>,
    codecs: AudioCodecTable,
    duration_secs: f64,
    bit_rate: i64,
    bit_rate_factor: u32,
    chapters: Vec<Chapter>,
}

impl Demuxer {
    fn open(&mut self) -> Result<(), MediaError> {
        self.state.store(DecoderState::Opening);

        // Consumer threads first, paused, so queues have owners before
        // the first packet exists.
        self.workers = Some(Workers {
            audio: spawn_audio_worker(
                Arc::clone(&self.shared),
                Arc::clone(&self.sink),
                Arc::clone(&self.codecs),
            ),
            video: spawn_video_worker(Arc::clone(&self.shared)),
            subtitle: spawn_subtitle_worker(Arc::clone(&self.shared)),
        });

        let interrupt = Arc::clone(&self.shared.interrupt);
        let buffer = crate::buffer::create_buffer(&self.uri, Arc::clone(&interrupt))
            .ok_or_else(|| MediaError::OpenFailed(format!("no buffer for '{}'", self.uri)))?;

        let mut demux = open_demux(buffer, interrupt, self.shared.config.probe_size)?;

        let programs = demux.programs();
        let programs: Vec<_> = programs.into_iter().filter(|p| p.is_valid()).collect();
        if programs.is_empty() {
            return Err(MediaError::NoPrograms);
        }
        *self.shared.programs.write() = programs;

        self.update_bitrate(demux.as_mut());

        // Program 0 and an initial stream selection.
        demux.select_program(0);
        self.shared.current_program.store(0, Ordering::Release);
        self.select_streams();

        self.open_decoders(demux.as_mut())?;

        // Chapter tables with a single entry are containers being
        // chatty, not navigation.
        let chapters = demux.chapters();
        if chapters.len() > 1 {
            self.chapters = chapters;
        }

        self.debug_programs(demux.as_ref());
        self.demux = Some(demux);
        self.state.store(DecoderState::Paused);
        Ok(())
    }

    fn update_bitrate(&mut self, demux: &mut dyn Demux) {
        self.duration_secs = demux.duration_secs();
        self.bit_rate = demux.container_bit_rate();
        self.bit_rate_factor = 1;

        let name = demux.format_name().to_ascii_lowercase();
        if name.contains("matroska") || name.contains("webm") {
            self.bit_rate_factor = 2;
        }

        if self.bit_rate < 1000 && self.duration_secs > 0.0 {
            let size = demux.source_size();
            if size > 0 {
                self.bit_rate = (size as f64 * 8.0 / self.duration_secs) as i64;
                tracing::info!("Guessing bitrate from file size and duration");
            }
        }

        if self.bit_rate < 1000 {
            tracing::warn!("Unable to determine a reasonable bitrate - forcing");
            self.bit_rate = 1_000_000;
        }

        demux.set_bitrate_hint(self.bit_rate, self.bit_rate_factor);
    }

    fn select_streams(&self) {
        self.shared.select_stream(StreamType::Audio);
        self.shared.select_stream(StreamType::Video);
        self.shared.select_stream(StreamType::Subtitle);
        self.shared.select_stream(StreamType::RawText);

        let has_audio = self.shared.selected_stream(StreamType::Audio).is_some();
        let has_video = self.shared.selected_stream(StreamType::Video).is_some();
        self.shared.first_video_pts.store(NO_PTS, Ordering::Release);
        self.shared
            .filter_audio
            .store(has_audio && has_video, Ordering::Release);
    }

    fn open_decoders(&mut self, demux: &mut dyn Demux) -> Result<(), MediaError> {
        let flags = self.shared.config.decode_flags;
        if flags == DECODE_NONE {
            return Ok(());
        }

        let programs = self.shared.programs.read().clone();
        let program = &programs[0];

        if flags & DECODE_AUDIO != 0 {
            for stream in program.streams_of(StreamType::Audio) {
                let codec = {
                    let _lock = codec_lock();
                    demux.open_audio_codec(stream.index)?
                };
                tracing::info!("Stream #{}: audio codec {:?} opened", stream.index, stream.codec);
                self.codecs.lock().insert(stream.index, codec);
            }
        }

        if flags & DECODE_VIDEO != 0 {
            if let Some(index) = self.shared.selected_stream(StreamType::Video) {
                let _lock = codec_lock();
                demux.open_video(index, Arc::clone(&self.frames))?;
                tracing::info!("Stream #{index}: video codec opened");
            }
            for stream in program.streams_of(StreamType::Subtitle) {
                if stream.codec.is_undecodable_subtitle() {
                    continue;
                }
                let _lock = codec_lock();
                demux.open_subtitle(stream.index)?;
            }
        }

        Ok(())
    }

    fn debug_programs(&self, demux: &dyn Demux) {
        tracing::info!("Demuxer '{}' for '{}'", demux.format_name(), self.uri);
        tracing::info!(
            "Duration: {:.2}s Bitrate: {} kbit/s",
            self.duration_secs,
            self.bit_rate / 1000
        );
        for chapter in &self.chapters {
            tracing::debug!("Chapter [{}] start: {}s", chapter.id, chapter.start_secs);
        }
        for program in self.shared.programs.read().iter() {
            tracing::debug!("Program #{} ({} streams)", program.id, program.stream_count);
            for bucket in 0..crate::stream::STREAM_TYPE_COUNT {
                for stream in &program.streams[bucket] {
                    tracing::debug!(
                        "Stream #{} {}[0x{:x}] {} {:?}",
                        stream.index,
                        stream.stream_type,
                        stream.id,
                        if stream.language.is_empty() {
                            "und"
                        } else {
                            &stream.language
                        },
                        stream.codec
                    );
                }
            }
        }
    }

    /// The packet-reading loop. Returns true on an I/O error distinct
    /// from end-of-stream.
    fn demux_packets(&mut self) -> bool {
        let Some(mut demux) = self.demux.take() else {
            return false;
        };
        let Some(mut workers) = self.workers.take() else {
            self.demux = Some(demux);
            return false;
        };

        let mut eof = false;
        let mut was_eof = false;
        let mut demuxer_error = false;

        loop {
            if self.shared.interrupted() || self.requested.load() == DecoderState::Stopped {
                break;
            }

            match self.state.load() {
                DecoderState::Pausing => {
                    if workers.all_paused() {
                        tracing::info!("Demuxer paused");
                        self.state.store(DecoderState::Paused);
                    } else {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    continue;
                }
                DecoderState::Starting => {
                    if workers.any_paused() {
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    tracing::info!("Demuxer started");
                    self.state.store(DecoderState::Running);
                    continue;
                }
                _ => {}
            }

            match self.requested.load() {
                DecoderState::Paused => {
                    self.requested.store(DecoderState::None);
                    tracing::info!("Demuxer pausing...");
                    workers.pause();
                    if self.state.load() == DecoderState::Running {
                        // Failure here is deliberately swallowed; the
                        // worker handshake is the real confirmation.
                        demux.read_pause();
                    }
                    self.state.store(DecoderState::Pausing);
                    continue;
                }
                DecoderState::Running => {
                    self.requested.store(DecoderState::None);
                    tracing::info!("Demuxer unpausing...");
                    workers.unpause();
                    demux.read_play();
                    self.state.store(DecoderState::Starting);
                    continue;
                }
                _ => {}
            }

            // Program/stream selection requests only apply while paused.
            if self.state.load() == DecoderState::Paused {
                let program = self.shared.program_request.swap(-1, Ordering::AcqRel);
                if program >= 0 {
                    demux.select_program(program as usize);
                    self.shared
                        .current_program
                        .store(program, Ordering::Release);
                    self.select_streams();
                }
                if self.shared.reselect_request.swap(false, Ordering::AcqRel) {
                    self.select_streams();
                }
            } else {
                self.shared.program_request.store(-1, Ordering::Release);
                self.shared.reselect_request.store(false, Ordering::Release);
            }

            if self.shared.seek_requested.load(Ordering::Acquire) {
                match demux.seek_to_start() {
                    Ok(()) => {
                        demux.flush_video();
                        self.shared.first_video_pts.store(NO_PTS, Ordering::Release);
                        let refilter = self.shared.selected_stream(StreamType::Audio).is_some()
                            && self.shared.selected_stream(StreamType::Video).is_some();
                        self.shared.filter_audio.store(refilter, Ordering::Release);
                        workers.flush_all();
                        eof = false;
                        was_eof = false;
                    }
                    Err(err) => {
                        tracing::error!("Failed to seek: {err}");
                    }
                }
                self.shared.seek_requested.store(false, Ordering::Release);
            }

            if self.state.load() == DecoderState::Paused {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }

            // Back-pressure: the audio queue's byte budget bounds the
            // demuxer's backlog.
            if workers.audio.queue.size() > self.shared.config.max_audio_queue_bytes {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }

            let video_index = self.shared.selected_stream(StreamType::Video);
            let audio_index = self.shared.selected_stream(StreamType::Audio);
            let subtitle_index = self.shared.selected_stream(StreamType::Subtitle);

            if eof {
                if !was_eof {
                    was_eof = true;
                    if let Some(index) = video_index {
                        // The empty packet drains delayed frames out of
                        // the video codec before the queues empty.
                        let drain = DemuxPacket::empty(index);
                        if let Err(err) = demux.decode_video(&drain) {
                            tracing::debug!("Video drain: {err}");
                        }
                        workers.video.queue.push(Packet::Data(drain));
                    }
                    if let Some(index) = audio_index {
                        if demux.audio_codec_has_delay(index) {
                            workers
                                .audio
                                .queue
                                .push(Packet::Data(DemuxPacket::empty(index)));
                        }
                    }
                }

                if workers.queued_packets() == 0 {
                    // Let buffered audio play out before finishing.
                    if self.sink.fill_status() > 1 {
                        std::thread::sleep(Duration::from_millis(50));
                        continue;
                    }
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }

            let packet = match demux.read_packet() {
                Ok(ReadOutcome::Packet(packet)) => packet,
                Ok(ReadOutcome::Eof) => {
                    tracing::info!("End of stream");
                    eof = true;
                    continue;
                }
                Ok(ReadOutcome::Again) => {
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
                Err(err) => {
                    tracing::error!("Read error: {err}");
                    demuxer_error = true;
                    break;
                }
            };

            if Some(packet.stream_index) == video_index {
                // Video decodes demuxer-side into the frame pool; the
                // queued packet carries flush/watermark bookkeeping to
                // the worker.
                if let Err(err) = demux.decode_video(&packet) {
                    tracing::error!("Video decode error: {err}");
                } else if self.shared.first_video_pts.load(Ordering::Acquire) == NO_PTS {
                    if let Some(pts) = self.frames.next_decoded_pts() {
                        self.shared.first_video_pts.store(pts, Ordering::Release);
                    }
                }
                workers.video.queue.push(Packet::Data(packet));
            } else if Some(packet.stream_index) == audio_index {
                workers.audio.queue.push(Packet::Data(packet));
            } else if Some(packet.stream_index) == subtitle_index {
                workers.subtitle.queue.push(Packet::Data(packet));
            }
        }

        self.state.store(DecoderState::Stopping);
        tracing::info!("Demuxer stopping");
        workers.stop_and_wait(Some(WORKER_STOP_TIMEOUT));

        self.state.store(DecoderState::Stopped);
        tracing::info!("Demuxer stopped");

        // Stay around until the owner acknowledges with a stop, so the
        // Stopped state is observable.
        while !self.shared.interrupted()
            && !demuxer_error
            && self.requested.load() != DecoderState::Stopped
        {
            std::thread::sleep(Duration::from_millis(50));
        }

        self.shared.interrupt.store(true, Ordering::Release);
        tracing::info!("Demuxer exiting");
        self.demux = Some(demux);
        self.workers = Some(workers);
        demuxer_error
    }

    fn close(&mut self) {
        if let Some(mut workers) = self.workers.take() {
            workers.stop_and_wait(Some(WORKER_STOP_TIMEOUT));
        }

        for stream_type in [
            StreamType::Audio,
            StreamType::Video,
            StreamType::Subtitle,
            StreamType::RawText,
            StreamType::Attachment,
        ] {
            self.shared.set_selected(stream_type, None);
        }

        {
            // Codec close requires the same exclusion as open.
            let _lock = codec_lock();
            self.codecs.lock().clear();
            self.demux = None;
        }

        self.shared.programs.write().clear();
        self.shared.current_program.store(0, Ordering::Release);
        self.shared.seek_requested.store(false, Ordering::Release);
        self.frames.reset(true);

        self.duration_secs = 0.0;
        self.bit_rate = 0;
        self.bit_rate_factor = 1;
        self.chapters.clear();
    }
}

/// Owner handle for the demuxer thread.
pub(crate) struct DemuxerThread {
    state: Arc<StateCell>,
    requested: Arc<StateCell>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DemuxerThread {
    pub fn spawn(
        uri: String,
        shared: Arc<DecoderShared>,
        sink: Arc<dyn AudioSink>,
        frames: Arc<FrameBuffers>,
    ) -> Self {
        let state = Arc::new(StateCell::new(DecoderState::None));
        let requested = Arc::new(StateCell::new(DecoderState::None));
        let running = Arc::new(AtomicBool::new(true));

        let thread_state = Arc::clone(&state);
        let thread_requested = Arc::clone(&requested);
        let thread_running = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("Demuxer".to_string())
            .spawn(move || {
                tracing::info!("Demuxer thread starting");
                let mut demuxer = Demuxer {
                    uri,
                    shared,
                    sink,
                    frames,
                    state: Arc::clone(&thread_state),
                    requested: thread_requested,
                    demux: None,
                    workers: None,
                    codecs: Arc::new(Mutex::new(std::collections::HashMap::new())),
                    duration_secs: 0.0,
                    bit_rate: 0,
                    bit_rate_factor: 1,
                    chapters: Vec::new(),
                };

                let mut errored = false;
                match demuxer.open() {
                    Ok(()) => {
                        errored = demuxer.demux_packets();
                    }
                    Err(MediaError::Interrupted) => {
                        tracing::info!("Open interrupted");
                    }
                    Err(err) => {
                        tracing::error!("Failed to open demuxer: {err}");
                        errored = true;
                    }
                }
                demuxer.close();
                thread_state.store(if errored {
                    DecoderState::Errored
                } else {
                    DecoderState::Stopped
                });
                thread_running.store(false, Ordering::Release);
                tracing::info!("Demuxer thread stopping");
            })
            .expect("failed to spawn demuxer thread");

        Self {
            state,
            requested,
            running,
            handle: Some(handle),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state.load()
    }

    pub fn pause(&self) {
        self.requested.store(DecoderState::Paused);
    }

    pub fn unpause(&self) {
        self.requested.store(DecoderState::Running);
    }

    pub fn stop(&self) {
        self.requested.store(DecoderState::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Polls thread liveness at 50 ms granularity. Timeouts are logged;
    /// cleanup proceeds regardless.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        while self.is_running() {
            if let Some(timeout) = timeout {
                if started.elapsed() > timeout {
                    tracing::warn!("Demuxer thread failed to stop");
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

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
