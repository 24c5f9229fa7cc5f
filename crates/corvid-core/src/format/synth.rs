//! Built-in synthetic container.
//!
//! A `synth:` URI resolves to a tiny header describing a generated
//! stream: sine-wave PCM audio and/or a procedural test-pattern video
//! track. The header travels through a real [`Buffer`] and is probed by
//! magic, so the open path is exercised exactly like a file-backed
//! container. Packets are generated on demand rather than stored.
//!
//! URI grammar:
//!
//! ```text
//! synth:audio                    mono 48 kHz PCM, 2 s
//! synth:av?fps=30&dur=2000      audio + video
//! synth:video?fps=25            video only
//! synth:audio?lateformat        channel count hidden until first decode
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::SampleFormat;
use crate::buffer::{Buffer, MemoryBuffer};
use crate::error::MediaError;
use crate::frame::{FrameBuffers, PixelFormat, TimestampSelector};
use crate::packet::DemuxPacket;
use crate::stream::{Chapter, CodecId, Disposition, Program, Stream, StreamType};

use super::{AudioCodec, Demux, ReadOutcome};

/// Registry name of the synthetic container.
pub const FORMAT_NAME: &str = "synth";

const MAGIC: &[u8; 4] = b"CSYN";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 18;

const FLAG_AUDIO: u8 = 1 << 0;
const FLAG_VIDEO: u8 = 1 << 1;
const FLAG_LATE_FORMAT: u8 = 1 << 2;

/// Sample frames per generated audio packet.
const AUDIO_PACKET_FRAMES: u64 = 1024;

const VIDEO_WIDTH: u32 = 320;
const VIDEO_HEIGHT: u32 = 240;

/// Parameters of a synthetic stream, round-tripped through the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthConfig {
    pub audio: bool,
    pub video: bool,
    /// Audio channel count is reported as unknown until first decode.
    pub late_format: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub fps: u16,
    pub duration_ms: u32,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
            late_format: false,
            sample_rate: 48_000,
            channels: 1,
            fps: 30,
            duration_ms: 2_000,
        }
    }
}

impl SynthConfig {
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.audio {
            flags |= FLAG_AUDIO;
        }
        if self.video {
            flags |= FLAG_VIDEO;
        }
        if self.late_format {
            flags |= FLAG_LATE_FORMAT;
        }
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(flags);
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&self.fps.to_le_bytes());
        out.extend_from_slice(&self.duration_ms.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN || &data[0..4] != MAGIC || data[4] != VERSION {
            return None;
        }
        let flags = data[5];
        Some(Self {
            audio: flags & FLAG_AUDIO != 0,
            video: flags & FLAG_VIDEO != 0,
            late_format: flags & FLAG_LATE_FORMAT != 0,
            sample_rate: u32::from_le_bytes([data[6], data[7], data[8], data[9]]).max(8_000),
            channels: u16::from_le_bytes([data[10], data[11]]).max(1),
            fps: u16::from_le_bytes([data[12], data[13]]).max(1),
            duration_ms: u32::from_le_bytes([data[14], data[15], data[16], data[17]]),
        })
    }

    fn from_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("synth:")?;
        let (kind, query) = match rest.split_once('?') {
            Some((kind, query)) => (kind, Some(query)),
            None => (rest, None),
        };

        let mut config = SynthConfig::default();
        match kind {
            "audio" => {}
            "av" => {
                config.video = true;
                config.channels = 2;
            }
            "video" => {
                config.audio = false;
                config.video = true;
            }
            _ => return None,
        }

        if let Some(query) = query {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                match key {
                    "rate" => config.sample_rate = value.parse().unwrap_or(config.sample_rate),
                    "ch" => config.channels = value.parse().unwrap_or(config.channels),
                    "fps" => config.fps = value.parse().unwrap_or(config.fps),
                    "dur" => config.duration_ms = value.parse().unwrap_or(config.duration_ms),
                    "lateformat" => config.late_format = true,
                    _ => {}
                }
            }
        }
        Some(config)
    }
}

/// True when the peeked bytes look like a synthetic-container header.
pub fn probe(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && &data[0..4] == MAGIC && data[4] == VERSION
}

/// Builds the buffer for a `synth:` URI: the encoded header in memory,
/// with the format nominated so the probe is bypassed.
pub(crate) fn buffer_for_uri(uri: &str) -> Option<Box<dyn Buffer>> {
    let config = SynthConfig::from_uri(uri)?;
    Some(Box::new(
        MemoryBuffer::new(config.encode(), uri).with_required_format(FORMAT_NAME),
    ))
}

struct VideoState {
    frames: Arc<FrameBuffers>,
    timestamps: TimestampSelector,
    keyframe_seen: bool,
}

/// Demuxer over a synthetic stream description.
pub struct SynthDemux {
    config: SynthConfig,
    interrupt: Arc<AtomicBool>,
    /// Sample frames generated so far.
    audio_position: u64,
    /// Video frames generated so far.
    video_position: u64,
    video: Option<VideoState>,
}

impl SynthDemux {
    pub fn open(
        mut buffer: Box<dyn Buffer>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self, MediaError> {
        let mut header = vec![0u8; HEADER_LEN.min(buffer.best_buffer_size())];
        let got = buffer.read(&mut header);
        header.truncate(got);
        let config = SynthConfig::decode(&header).ok_or_else(|| {
            MediaError::OpenFailed(format!("bad synthetic header in '{}'", buffer.filtered_uri()))
        })?;
        if !config.audio && !config.video {
            return Err(MediaError::OpenFailed("synthetic source has no streams".into()));
        }
        tracing::debug!("Synthetic source: {:?}", config);
        Ok(Self {
            config,
            interrupt,
            audio_position: 0,
            video_position: 0,
            video: None,
        })
    }

    fn audio_stream_index(&self) -> Option<usize> {
        self.config.audio.then_some(0)
    }

    fn video_stream_index(&self) -> Option<usize> {
        self.config.video.then_some(usize::from(self.config.audio))
    }

    fn audio_pts(&self, frames: u64) -> i64 {
        (frames * 1000 / self.config.sample_rate as u64) as i64
    }

    fn video_pts(&self, frame: u64) -> i64 {
        (frame * 1000 / self.config.fps as u64) as i64
    }

    fn next_audio_packet(&mut self) -> DemuxPacket {
        let start = self.audio_position;
        let rate = self.config.sample_rate as f64;
        let channels = self.config.channels as usize;
        let mut data = Vec::with_capacity(AUDIO_PACKET_FRAMES as usize * channels * 2);
        for i in 0..AUDIO_PACKET_FRAMES {
            let t = (start + i) as f64 / rate;
            let sample = (8_000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16;
            for _ in 0..channels {
                data.extend_from_slice(&sample.to_le_bytes());
            }
        }
        self.audio_position += AUDIO_PACKET_FRAMES;
        DemuxPacket {
            stream_index: self.audio_stream_index().unwrap_or(0),
            pts: Some(self.audio_pts(start)),
            dts: Some(self.audio_pts(start)),
            data,
        }
    }

    fn next_video_packet(&mut self) -> DemuxPacket {
        let number = self.video_position;
        self.video_position += 1;
        let keyframe = number % self.config.fps as u64 == 0;
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&(number as u32).to_le_bytes());
        data.push(keyframe as u8);
        data.extend_from_slice(&[0u8; 3]);
        let pts = self.video_pts(number);
        DemuxPacket {
            stream_index: self.video_stream_index().unwrap_or(0),
            pts: Some(pts),
            dts: Some(pts),
            data,
        }
    }
}

impl Demux for SynthDemux {
    fn format_name(&self) -> &str {
        FORMAT_NAME
    }

    fn duration_secs(&self) -> f64 {
        self.config.duration_ms as f64 / 1000.0
    }

    fn container_bit_rate(&self) -> i64 {
        if self.config.audio {
            self.config.sample_rate as i64 * self.config.channels as i64 * 16
        } else {
            0
        }
    }

    fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("title".to_string(), "Synthetic test source".to_string());
        metadata
    }

    fn programs(&self) -> Vec<Program> {
        let mut program = Program {
            id: 1,
            index: 0,
            ..Program::default()
        };
        if let Some(index) = self.audio_stream_index() {
            program.add_stream(Stream {
                stream_type: StreamType::Audio,
                index,
                id: 0x100,
                secondary_index: 0,
                disposition: Disposition(Disposition::DEFAULT),
                language: "eng".to_string(),
                codec: CodecId::PcmS16,
                original_channels: if self.config.late_format {
                    0
                } else {
                    self.config.channels as u32
                },
                metadata: HashMap::new(),
            });
        }
        if let Some(index) = self.video_stream_index() {
            program.add_stream(Stream {
                stream_type: StreamType::Video,
                index,
                id: 0x200,
                secondary_index: 0,
                disposition: Disposition(Disposition::DEFAULT),
                language: String::new(),
                codec: CodecId::RawVideo,
                original_channels: 0,
                metadata: HashMap::new(),
            });
        }
        vec![program]
    }

    fn chapters(&self) -> Vec<Chapter> {
        // Two chapters so chapter enumeration has something to chew on.
        if self.config.duration_ms < 2_000 {
            return Vec::new();
        }
        let half = self.config.duration_ms as i64 / 2_000;
        vec![
            Chapter {
                id: 1,
                start_secs: 0,
                metadata: HashMap::new(),
            },
            Chapter {
                id: 2,
                start_secs: half,
                metadata: HashMap::new(),
            },
        ]
    }

    fn select_program(&mut self, index: usize) {
        if index != 0 {
            tracing::warn!("Synthetic source only has program 0");
        }
    }

    fn open_audio_codec(
        &mut self,
        stream_index: usize,
    ) -> Result<Box<dyn AudioCodec>, MediaError> {
        if Some(stream_index) != self.audio_stream_index() {
            return Err(MediaError::CodecOpen(format!(
                "stream {stream_index} is not the synthetic audio stream"
            )));
        }
        Ok(Box::new(PcmCodec {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels as u32,
            revealed: !self.config.late_format,
            request_channels: 0,
        }))
    }

    fn open_video(
        &mut self,
        stream_index: usize,
        frames: Arc<FrameBuffers>,
    ) -> Result<(), MediaError> {
        if Some(stream_index) != self.video_stream_index() {
            return Err(MediaError::CodecOpen(format!(
                "stream {stream_index} is not the synthetic video stream"
            )));
        }
        frames.format_changed(PixelFormat::Yuv420p, VIDEO_WIDTH, VIDEO_HEIGHT, 2);
        self.video = Some(VideoState {
            frames,
            timestamps: TimestampSelector::new(),
            keyframe_seen: false,
        });
        Ok(())
    }

    fn audio_codec_has_delay(&self, _stream_index: usize) -> bool {
        false
    }

    fn read_packet(&mut self) -> Result<ReadOutcome, MediaError> {
        let duration = self.config.duration_ms as i64;
        let audio_next = self
            .audio_stream_index()
            .map(|_| self.audio_pts(self.audio_position))
            .filter(|pts| *pts < duration);
        let video_next = self
            .video_stream_index()
            .map(|_| self.video_pts(self.video_position))
            .filter(|pts| *pts < duration);

        match (audio_next, video_next) {
            (None, None) => Ok(ReadOutcome::Eof),
            (Some(_), None) => Ok(ReadOutcome::Packet(self.next_audio_packet())),
            (None, Some(_)) => Ok(ReadOutcome::Packet(self.next_video_packet())),
            (Some(audio), Some(video)) => {
                if audio <= video {
                    Ok(ReadOutcome::Packet(self.next_audio_packet()))
                } else {
                    Ok(ReadOutcome::Packet(self.next_video_packet()))
                }
            }
        }
    }

    fn decode_video(&mut self, packet: &DemuxPacket) -> Result<(), MediaError> {
        let state = self
            .video
            .as_mut()
            .ok_or_else(|| MediaError::DecodeError("video stream not open".into()))?;
        if packet.data.len() < 5 {
            // The end-of-stream drain packet; nothing buffered to emit.
            return Ok(());
        }
        let number = u32::from_le_bytes([
            packet.data[0],
            packet.data[1],
            packet.data[2],
            packet.data[3],
        ]) as i64;
        let keyframe = packet.data[4] != 0;
        if keyframe {
            state.keyframe_seen = true;
        }

        // Wait for the renderer to free a frame; give up on interrupt or
        // after a second so a stalled consumer cannot wedge the demuxer.
        let mut frame = None;
        for _ in 0..20 {
            if self.interrupt.load(Ordering::Acquire) {
                return Ok(());
            }
            frame = state.frames.frame_for_decoding_timeout(Duration::from_millis(50));
            if frame.is_some() {
                break;
            }
        }
        let Some(mut frame) = frame else {
            return Err(MediaError::DecodeError("no free video frame".into()));
        };

        let luma = (number % 256) as u8;
        let y_plane = frame.offsets[1];
        frame.buffer[..y_plane].fill(luma);
        frame.buffer[y_plane..].fill(128);

        frame.pts = state.timestamps.select(packet.pts, packet.dts);
        frame.frame_number = number;
        frame.corrupt = !state.keyframe_seen;
        frame.frame_rate = self.config.fps as f64;
        frame.interlaced = false;
        frame.top_field_first = false;
        frame.repeat_pict = 0;
        frame.pixel_aspect_ratio = 1.0;
        frame.frame_aspect_ratio = VIDEO_WIDTH as f64 / VIDEO_HEIGHT as f64;
        state.frames.release_from_decoding(frame);
        Ok(())
    }

    fn flush_video(&mut self) {
        if let Some(state) = self.video.as_mut() {
            state.timestamps.reset();
            state.keyframe_seen = false;
            state.frames.reset(false);
        }
    }

    fn seek_to_start(&mut self) -> Result<(), MediaError> {
        self.audio_position = 0;
        self.video_position = 0;
        Ok(())
    }
}

/// Identity "decoder" for the synthetic PCM track.
struct PcmCodec {
    sample_rate: u32,
    channels: u32,
    revealed: bool,
    request_channels: u32,
}

impl AudioCodec for PcmCodec {
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
        if self.revealed {
            self.channels
        } else {
            0
        }
    }

    fn sample_format(&self) -> Option<SampleFormat> {
        Some(SampleFormat::S16)
    }

    fn set_request_channels(&mut self, channels: u32) {
        self.request_channels = channels;
    }

    fn force_channels(&mut self, channels: u32) {
        self.channels = channels;
    }

    fn decode(&mut self, packet: &DemuxPacket) -> Result<Vec<u8>, MediaError> {
        self.revealed = true;
        Ok(packet.data.clone())
    }

    fn flush(&mut self) {}
}
