//! FFmpeg-backed container support (`ffmpeg` cargo feature).
//!
//! Wraps `ffmpeg-next` behind the [`Demux`]/[`AudioCodec`] traits: the
//! format context is opened from the buffer's filtered URI (FFmpeg's
//! own protocol layer handles transport), the engine interrupt flag is
//! installed as the AVIO interrupt callback, and decoded video lands in
//! the shared frame pool converted to YUV 4:2:0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::audio::SampleFormat;
use crate::buffer::Buffer;
use crate::error::MediaError;
use crate::frame::{FrameBuffers, PixelFormat, TimestampSelector};
use crate::packet::DemuxPacket;
use crate::stream::{
    classify_stream, Chapter, CodecId, Disposition, MediaKind, Program, Stream,
};

use super::{AudioCodec, Demux, ReadOutcome};

pub const FORMAT_NAME: &str = "ffmpeg";

unsafe extern "C" fn interrupt_callback(opaque: *mut std::ffi::c_void) -> std::ffi::c_int {
    if opaque.is_null() {
        return 0;
    }
    let flag = &*(opaque as *const AtomicBool);
    if flag.load(Ordering::Acquire) {
        tracing::info!("Aborting demuxer");
        1
    } else {
        0
    }
}

fn map_codec_id(id: ffmpeg::codec::Id) -> CodecId {
    use ffmpeg::codec::Id;
    match id {
        Id::PCM_S16LE | Id::PCM_S16BE => CodecId::PcmS16,
        Id::MP3 => CodecId::Mp3,
        Id::AAC => CodecId::Aac,
        Id::AC3 => CodecId::Ac3,
        Id::EAC3 => CodecId::Eac3,
        Id::DTS => CodecId::Dts,
        Id::TRUEHD => CodecId::TrueHd,
        Id::FLAC => CodecId::Flac,
        Id::VORBIS => CodecId::Vorbis,
        Id::OPUS => CodecId::Opus,
        Id::H264 => CodecId::H264,
        Id::HEVC => CodecId::Hevc,
        Id::VP9 => CodecId::Vp9,
        Id::AV1 => CodecId::Av1,
        Id::MPEG2VIDEO => CodecId::Mpeg2Video,
        Id::RAWVIDEO => CodecId::RawVideo,
        Id::DVB_SUBTITLE => CodecId::DvbSubtitle,
        Id::HDMV_PGS_SUBTITLE => CodecId::PgsSubtitle,
        Id::SUBRIP | Id::SRT => CodecId::SubRip,
        Id::TEXT => CodecId::Text,
        Id::DVB_TELETEXT => CodecId::Teletext,
        other => CodecId::Other(ffi::AVCodecID::from(other) as u32),
    }
}

fn map_disposition(disposition: ffmpeg::format::stream::Disposition) -> Disposition {
    use ffmpeg::format::stream::Disposition as Av;
    let mut bits = 0u32;
    if disposition.contains(Av::DEFAULT) {
        bits |= Disposition::DEFAULT;
    }
    if disposition.contains(Av::FORCED) {
        bits |= Disposition::FORCED;
    }
    if disposition.contains(Av::ATTACHED_PIC) {
        bits |= Disposition::ATTACHED_PIC;
    }
    Disposition(bits)
}

fn map_kind(medium: ffmpeg::media::Type) -> MediaKind {
    use ffmpeg::media::Type;
    match medium {
        Type::Audio => MediaKind::Audio,
        Type::Video => MediaKind::Video,
        Type::Subtitle => MediaKind::Subtitle,
        Type::Attachment => MediaKind::Attachment,
        Type::Data => MediaKind::Data,
        _ => MediaKind::Unknown,
    }
}

fn dict_to_map(dict: &ffmpeg::DictionaryRef<'_>) -> HashMap<String, String> {
    dict.iter()
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Rescales a stream timestamp to milliseconds.
fn ts_to_ms(ts: Option<i64>, time_base: (i32, i32)) -> Option<i64> {
    let ts = ts?;
    let (num, den) = time_base;
    if den == 0 {
        return None;
    }
    Some((ts as i128 * num as i128 * 1000 / den as i128) as i64)
}

struct StreamMeta {
    av_id: ffmpeg::codec::Id,
    time_base: (i32, i32),
}

struct VideoState {
    decoder: ffmpeg::decoder::Video,
    frames: Arc<FrameBuffers>,
    scaler: Option<ffmpeg::software::scaling::Context>,
    timestamps: TimestampSelector,
    keyframe_seen: bool,
    time_base: (i32, i32),
    frame_rate: f64,
}

/// FFmpeg-backed demuxer.
pub struct FfmpegDemux {
    input: ffmpeg::format::context::Input,
    uri: String,
    // Kept alive for the interrupt callback installed on the context.
    interrupt: Arc<AtomicBool>,
    streams: Vec<StreamMeta>,
    programs: Vec<Program>,
    video: Option<VideoState>,
    source_size: i64,
}

// SAFETY: the format context and decoders are only touched from the
// demuxer thread that owns this value; the interrupt flag shared with
// libav's callback is an atomic.
unsafe impl Send for FfmpegDemux {}

impl FfmpegDemux {
    pub fn open(buffer: Box<dyn Buffer>, interrupt: Arc<AtomicBool>) -> Result<Self, MediaError> {
        ffmpeg::init().map_err(|e| MediaError::OpenFailed(format!("libav init: {e}")))?;

        let uri = buffer.filtered_uri().to_string();
        let source_size = buffer.size();
        // FFmpeg's protocol layer reads the source itself from here on.
        drop(buffer);

        let mut input = ffmpeg::format::input(&uri)
            .map_err(|e| MediaError::OpenFailed(format!("'{uri}': {e}")))?;

        unsafe {
            let ctx = input.as_mut_ptr();
            (*ctx).interrupt_callback.callback = Some(interrupt_callback);
            (*ctx).interrupt_callback.opaque = Arc::as_ptr(&interrupt) as *mut std::ffi::c_void;
        }

        let mut demux = Self {
            input,
            uri,
            interrupt,
            streams: Vec::new(),
            programs: Vec::new(),
            video: None,
            source_size,
        };
        demux.scan_streams()?;
        Ok(demux)
    }

    fn scan_streams(&mut self) -> Result<(), MediaError> {
        let mut classified = Vec::new();

        for stream in self.input.streams() {
            let params = stream.parameters();
            let av_id = params.id();
            let codec = map_codec_id(av_id);
            let kind = map_kind(params.medium());
            let disposition = map_disposition(stream.disposition());
            let time_base = {
                let tb = stream.time_base();
                (tb.numerator(), tb.denominator())
            };
            let metadata = dict_to_map(&stream.metadata());
            let language = metadata
                .get("language")
                .map(|l| l.to_ascii_lowercase())
                .unwrap_or_default();

            // The declared channel count needs a codec context; built
            // once per stream during open only.
            let channels = if kind == MediaKind::Audio {
                ffmpeg::codec::context::Context::from_parameters(params)
                    .ok()
                    .and_then(|ctx| ctx.decoder().audio().ok())
                    .map(|audio| audio.channels() as u32)
                    .unwrap_or(0)
            } else {
                0
            };

            self.streams.push(StreamMeta { av_id, time_base });
            classified.push(Stream {
                stream_type: classify_stream(kind, codec, disposition),
                index: stream.index(),
                id: stream.id() as i64,
                secondary_index: 0,
                disposition,
                language,
                codec,
                original_channels: channels,
                metadata,
            });
        }

        // Program tables come straight from the container; without one,
        // a single synthetic program spans every stream.
        let raw_programs = unsafe {
            let ctx = self.input.as_ptr();
            let count = (*ctx).nb_programs as usize;
            (0..count)
                .map(|i| {
                    let program = *(*ctx).programs.add(i);
                    let id = (*program).id as i64;
                    let stream_count = (*program).nb_stream_indexes as usize;
                    let indices: Vec<usize> = (0..stream_count)
                        .map(|j| *(*program).stream_index.add(j) as usize)
                        .collect();
                    (id, indices)
                })
                .collect::<Vec<_>>()
        };

        if raw_programs.is_empty() {
            let mut program = Program::default();
            for stream in &classified {
                program.add_stream(stream.clone());
            }
            if program.is_valid() {
                self.programs.push(program);
            }
        } else {
            for (index, (id, indices)) in raw_programs.into_iter().enumerate() {
                let mut program = Program {
                    id,
                    index,
                    ..Program::default()
                };
                for stream_index in indices {
                    if let Some(stream) = classified.iter().find(|s| s.index == stream_index) {
                        program.add_stream(stream.clone());
                    }
                }
                if program.is_valid() {
                    self.programs.push(program);
                }
            }
        }

        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> (i32, i32) {
        self.streams
            .get(index)
            .map(|meta| meta.time_base)
            .unwrap_or((1, 1000))
    }
}

impl Demux for FfmpegDemux {
    fn format_name(&self) -> &str {
        unsafe {
            let format = (*self.input.as_ptr()).iformat;
            if format.is_null() {
                return FORMAT_NAME;
            }
            std::ffi::CStr::from_ptr((*format).name)
                .to_str()
                .unwrap_or(FORMAT_NAME)
        }
    }

    fn duration_secs(&self) -> f64 {
        let duration = self.input.duration();
        if duration > 0 {
            duration as f64 / ffi::AV_TIME_BASE as f64
        } else {
            0.0
        }
    }

    fn container_bit_rate(&self) -> i64 {
        unsafe { (*self.input.as_ptr()).bit_rate }
    }

    fn source_size(&self) -> i64 {
        self.source_size
    }

    fn metadata(&self) -> HashMap<String, String> {
        dict_to_map(&self.input.metadata())
    }

    fn programs(&self) -> Vec<Program> {
        self.programs.clone()
    }

    fn chapters(&self) -> Vec<Chapter> {
        self.input
            .chapters()
            .map(|chapter| {
                let tb = chapter.time_base();
                let start_secs = if tb.denominator() != 0 {
                    (chapter.start() as i128 * tb.numerator() as i128 / tb.denominator() as i128)
                        as i64
                } else {
                    0
                };
                Chapter {
                    id: chapter.id() as i64,
                    start_secs,
                    metadata: dict_to_map(&chapter.metadata()),
                }
            })
            .collect()
    }

    fn select_program(&mut self, index: usize) {
        let Some(program) = self.programs.get(index) else {
            return;
        };
        let member: Vec<usize> = program
            .streams
            .iter()
            .flatten()
            .map(|s| s.index)
            .collect();
        unsafe {
            let ctx = self.input.as_ptr();
            for i in 0..(*ctx).nb_streams as usize {
                let stream = *(*ctx).streams.add(i);
                (*stream).discard = if member.contains(&i) {
                    ffi::AVDiscard::AVDISCARD_DEFAULT
                } else {
                    ffi::AVDiscard::AVDISCARD_ALL
                };
            }
        }
    }

    fn open_audio_codec(
        &mut self,
        stream_index: usize,
    ) -> Result<Box<dyn AudioCodec>, MediaError> {
        let stream = self
            .input
            .stream(stream_index)
            .ok_or_else(|| MediaError::CodecOpen(format!("no stream {stream_index}")))?;
        let codec_id = map_codec_id(stream.parameters().id());
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| MediaError::CodecOpen(format!("stream {stream_index}: {e}")))?;
        let profile = unsafe { (*context.as_ptr()).profile };
        let decoder = context
            .decoder()
            .audio()
            .map_err(|e| MediaError::CodecOpen(format!("stream {stream_index}: {e}")))?;

        Ok(Box::new(FfmpegAudioCodec {
            decoder,
            codec_id,
            profile,
            request_channels: 0,
        }))
    }

    fn open_video(
        &mut self,
        stream_index: usize,
        frames: Arc<FrameBuffers>,
    ) -> Result<(), MediaError> {
        let stream = self
            .input
            .stream(stream_index)
            .ok_or_else(|| MediaError::CodecOpen(format!("no stream {stream_index}")))?;
        let time_base = {
            let tb = stream.time_base();
            (tb.numerator(), tb.denominator())
        };
        let rate = stream.avg_frame_rate();
        let frame_rate = if rate.denominator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            30000.0 / 1001.0
        };

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| MediaError::CodecOpen(format!("stream {stream_index}: {e}")))?;
        let references = unsafe { (*context.as_ptr()).refs.max(2) as u32 };
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| MediaError::CodecOpen(format!("stream {stream_index}: {e}")))?;

        frames.format_changed(
            PixelFormat::Yuv420p,
            decoder.width(),
            decoder.height(),
            references,
        );
        self.video = Some(VideoState {
            decoder,
            frames,
            scaler: None,
            timestamps: TimestampSelector::new(),
            keyframe_seen: false,
            time_base,
            frame_rate,
        });
        Ok(())
    }

    fn audio_codec_has_delay(&self, stream_index: usize) -> bool {
        self.streams
            .get(stream_index)
            .and_then(|meta| ffmpeg::codec::decoder::find(meta.av_id))
            .map(|codec| {
                codec
                    .capabilities()
                    .contains(ffmpeg::codec::Capabilities::DELAY)
            })
            .unwrap_or(false)
    }

    fn read_packet(&mut self) -> Result<ReadOutcome, MediaError> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {
                let stream_index = packet.stream();
                let time_base = self.stream_time_base(stream_index);
                Ok(ReadOutcome::Packet(DemuxPacket {
                    stream_index,
                    pts: ts_to_ms(packet.pts(), time_base),
                    dts: ts_to_ms(packet.dts(), time_base),
                    data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
                }))
            }
            Err(ffmpeg::Error::Eof) => Ok(ReadOutcome::Eof),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                Ok(ReadOutcome::Again)
            }
            Err(err) => {
                if self.interrupt.load(Ordering::Acquire) {
                    Err(MediaError::Interrupted)
                } else {
                    Err(MediaError::IoError(err.to_string()))
                }
            }
        }
    }

    fn decode_video(&mut self, packet: &DemuxPacket) -> Result<(), MediaError> {
        let Some(state) = self.video.as_mut() else {
            return Err(MediaError::DecodeError("video stream not open".into()));
        };

        if packet.data.is_empty() {
            state.decoder.send_eof().ok();
        } else {
            let av_packet = ffmpeg::Packet::copy(&packet.data);
            state
                .decoder
                .send_packet(&av_packet)
                .map_err(|e| MediaError::DecodeError(e.to_string()))?;
        }

        let mut decoded = ffmpeg::frame::Video::empty();
        while state.decoder.receive_frame(&mut decoded).is_ok() {
            if decoded.is_key() {
                state.keyframe_seen = true;
            }

            // Normalise to YUV 4:2:0 for the pool.
            let yuv = if decoded.format() == ffmpeg::format::Pixel::YUV420P {
                decoded.clone()
            } else {
                let needs_rebuild = state.scaler.as_ref().is_none_or(|s| {
                    let input = s.input();
                    input.format != decoded.format()
                        || input.width != decoded.width()
                        || input.height != decoded.height()
                });
                if needs_rebuild {
                    state.scaler = Some(
                        ffmpeg::software::scaling::Context::get(
                            decoded.format(),
                            decoded.width(),
                            decoded.height(),
                            ffmpeg::format::Pixel::YUV420P,
                            decoded.width(),
                            decoded.height(),
                            ffmpeg::software::scaling::Flags::BILINEAR,
                        )
                        .map_err(|e| MediaError::DecodeError(e.to_string()))?,
                    );
                }
                let mut converted = ffmpeg::frame::Video::empty();
                state
                    .scaler
                    .as_mut()
                    .expect("scaler built above")
                    .run(&decoded, &mut converted)
                    .map_err(|e| MediaError::DecodeError(e.to_string()))?;
                converted
            };

            // The pool is the get-buffer seam: wait for the renderer to
            // free a frame, give up on interrupt.
            let mut pooled = None;
            for _ in 0..20 {
                if self.interrupt.load(Ordering::Acquire) {
                    return Ok(());
                }
                pooled = state
                    .frames
                    .frame_for_decoding_timeout(Duration::from_millis(50));
                if pooled.is_some() {
                    break;
                }
            }
            let Some(mut frame) = pooled else {
                return Err(MediaError::DecodeError("no free video frame".into()));
            };

            let width = yuv.width().min(frame.raw_width) as usize;
            let height = yuv.height().min(frame.raw_height) as usize;
            for plane in 0..3usize {
                let (rows, cols) = if plane == 0 {
                    (height, width)
                } else {
                    (height.div_ceil(2), width.div_ceil(2))
                };
                let src_stride = yuv.stride(plane);
                let src = yuv.data(plane);
                let dst_stride = frame.pitches[plane];
                let offset = frame.offsets[plane];
                for row in 0..rows {
                    let src_row = &src[row * src_stride..row * src_stride + cols];
                    let dst_start = offset + row * dst_stride;
                    frame.buffer[dst_start..dst_start + cols].copy_from_slice(src_row);
                }
            }

            let frame_pts = ts_to_ms(decoded.pts(), state.time_base);
            let par = decoded.aspect_ratio();
            let pixel_aspect = if par.numerator() > 0 && par.denominator() > 0 {
                par.numerator() as f64 / par.denominator() as f64
            } else {
                1.0
            };

            frame.pts = state.timestamps.select(frame_pts.or(packet.pts), packet.dts);
            frame.corrupt = !state.keyframe_seen;
            frame.frame_rate = state.frame_rate;
            frame.pixel_aspect_ratio = pixel_aspect;
            frame.frame_aspect_ratio = if yuv.height() > 0 {
                pixel_aspect * yuv.width() as f64 / yuv.height() as f64
            } else {
                4.0 / 3.0
            };
            frame.display_width = yuv.width();
            frame.display_height = yuv.height();
            unsafe {
                let raw = decoded.as_ptr();
                frame.interlaced = ((*raw).flags & ffi::AV_FRAME_FLAG_INTERLACED) != 0;
                frame.top_field_first = ((*raw).flags & ffi::AV_FRAME_FLAG_TOP_FIELD_FIRST) != 0;
                frame.repeat_pict = (*raw).repeat_pict;
            }
            state.frames.release_from_decoding(frame);
        }

        Ok(())
    }

    fn flush_video(&mut self) {
        if let Some(state) = self.video.as_mut() {
            state.decoder.flush();
            state.timestamps.reset();
            state.keyframe_seen = false;
            state.frames.reset(false);
        }
    }

    fn seek_to_start(&mut self) -> Result<(), MediaError> {
        tracing::debug!("Seeking '{}' to start", self.uri);
        self.input
            .seek(0, ..)
            .map_err(|e| MediaError::IoError(format!("seek: {e}")))
    }

    fn read_pause(&mut self) {
        let result = unsafe { ffi::av_read_pause(self.input.as_mut_ptr()) };
        if result < 0 {
            tracing::debug!("av_read_pause returned {result}");
        }
    }

    fn read_play(&mut self) {
        let result = unsafe { ffi::av_read_play(self.input.as_mut_ptr()) };
        if result < 0 {
            tracing::debug!("av_read_play returned {result}");
        }
    }
}

/// Audio decoder over an FFmpeg codec context, producing interleaved
/// samples regardless of the codec's native plane layout.
struct FfmpegAudioCodec {
    decoder: ffmpeg::decoder::Audio,
    codec_id: CodecId,
    profile: i32,
    request_channels: u32,
}

// SAFETY: owned and driven exclusively by the audio worker thread.
unsafe impl Send for FfmpegAudioCodec {}

impl FfmpegAudioCodec {
    fn interleave(&self, frame: &ffmpeg::frame::Audio, out: &mut Vec<u8>) {
        let channels = frame.channels() as usize;
        let samples = frame.samples();
        let bytes_per_sample = frame.format().bytes();

        if !frame.is_planar() || channels <= 1 {
            let plane = frame.data(0);
            let len = samples * channels.max(1) * bytes_per_sample;
            out.extend_from_slice(&plane[..len.min(plane.len())]);
            return;
        }

        for sample in 0..samples {
            for channel in 0..channels {
                let plane = frame.data(channel);
                let start = sample * bytes_per_sample;
                out.extend_from_slice(&plane[start..start + bytes_per_sample]);
            }
        }
    }
}

impl AudioCodec for FfmpegAudioCodec {
    fn codec_id(&self) -> CodecId {
        self.codec_id
    }

    fn profile(&self) -> i32 {
        self.profile
    }

    fn sample_rate(&self) -> u32 {
        self.decoder.rate()
    }

    fn channels(&self) -> u32 {
        self.decoder.channels() as u32
    }

    fn sample_format(&self) -> Option<SampleFormat> {
        use ffmpeg::format::sample::Type;
        use ffmpeg::format::Sample;
        match self.decoder.format() {
            Sample::U8(Type::Packed) | Sample::U8(Type::Planar) => Some(SampleFormat::U8),
            Sample::I16(Type::Packed) | Sample::I16(Type::Planar) => Some(SampleFormat::S16),
            Sample::I32(Type::Packed) | Sample::I32(Type::Planar) => Some(SampleFormat::S32),
            Sample::F32(Type::Packed) | Sample::F32(Type::Planar) => Some(SampleFormat::Flt),
            _ => None,
        }
    }

    fn set_request_channels(&mut self, channels: u32) {
        // Modern libav decoders negotiate layouts themselves; the
        // request is recorded for the sink's bookkeeping only.
        self.request_channels = channels;
    }

    fn force_channels(&mut self, _channels: u32) {}

    fn has_delay(&self) -> bool {
        self.decoder
            .codec()
            .map(|codec| {
                codec
                    .capabilities()
                    .contains(ffmpeg::codec::Capabilities::DELAY)
            })
            .unwrap_or(false)
    }

    fn decode(&mut self, packet: &DemuxPacket) -> Result<Vec<u8>, MediaError> {
        if packet.data.is_empty() {
            self.decoder.send_eof().ok();
        } else {
            let av_packet = ffmpeg::Packet::copy(&packet.data);
            self.decoder
                .send_packet(&av_packet)
                .map_err(|e| MediaError::DecodeError(e.to_string()))?;
        }

        let mut out = Vec::new();
        let mut frame = ffmpeg::frame::Audio::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            self.interleave(&frame, &mut out);
        }
        Ok(out)
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}
