//! The container format layer.
//!
//! A [`Demux`] models one open container: it enumerates programs and
//! streams, reads packets, seeks, and owns the video decode path into the
//! frame pool. Back-ends: the built-in synthetic container ([`synth`]),
//! and FFmpeg behind the `ffmpeg` cargo feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::audio::SampleFormat;
use crate::buffer::Buffer;
use crate::error::MediaError;
use crate::frame::FrameBuffers;
use crate::packet::DemuxPacket;
use crate::stream::{Chapter, CodecId, Program};

pub mod synth;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

// The codec layer requires process-wide exclusion around codec open and
// close. Never held across blocking I/O.
static CODEC_LOCK: Mutex<()> = Mutex::new(());

/// Scoped process-wide codec lock.
pub fn codec_lock() -> MutexGuard<'static, ()> {
    CODEC_LOCK.lock()
}

/// Result of one demuxer read iteration.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A packet was read.
    Packet(DemuxPacket),
    /// End of stream reached.
    Eof,
    /// Transient condition; retry after a short sleep.
    Again,
}

/// A decoder for one audio stream, owned by the audio worker.
pub trait AudioCodec: Send {
    fn codec_id(&self) -> CodecId;

    fn profile(&self) -> i32;

    fn sample_rate(&self) -> u32;

    /// Channel count; 0 until the first decode reveals it.
    fn channels(&self) -> u32;

    fn sample_format(&self) -> Option<SampleFormat>;

    /// Asks the decoder to produce at most this many channels.
    /// 0 lets the decoder decide.
    fn set_request_channels(&mut self, channels: u32);

    /// Coerces the declared channel count itself; needed by codecs that
    /// only downmix when the context already claims the target layout.
    fn force_channels(&mut self, channels: u32);

    /// True when the codec buffers frames internally and needs an empty
    /// packet to drain at end-of-stream.
    fn has_delay(&self) -> bool {
        false
    }

    /// Decodes one packet to interleaved samples in
    /// [`sample_format`](Self::sample_format). May legitimately return
    /// an empty buffer while the decoder warms up.
    fn decode(&mut self, packet: &DemuxPacket) -> Result<Vec<u8>, MediaError>;

    /// Drops internal codec state after a flush marker.
    fn flush(&mut self);
}

/// One open container.
///
/// Lives on the demuxer thread. The audio codec is handed off to the
/// audio worker at open; the video codec stays here because video decode
/// is driven demuxer-side into the [`FrameBuffers`] pool.
pub trait Demux: Send {
    fn format_name(&self) -> &str;

    /// Container duration in seconds; 0.0 when unknown.
    fn duration_secs(&self) -> f64;

    /// Container-declared bitrate in bits per second; 0 when undeclared.
    fn container_bit_rate(&self) -> i64;

    /// Total source size in bytes, or -1 when unknown. Feeds the
    /// bitrate estimate for containers that declare none.
    fn source_size(&self) -> i64 {
        -1
    }

    /// Passes the computed bitrate back to the buffer as a read-ahead
    /// hint.
    fn set_bitrate_hint(&mut self, _bits_per_second: i64, _factor: u32) {}

    fn metadata(&self) -> HashMap<String, String>;

    /// Programs with classified, bucketed streams. Containers without a
    /// program table report one synthetic program over all streams.
    fn programs(&self) -> Vec<Program>;

    fn chapters(&self) -> Vec<Chapter>;

    /// Restricts packet delivery to one program.
    fn select_program(&mut self, index: usize);

    /// Opens the decoder for an audio stream and transfers ownership.
    fn open_audio_codec(
        &mut self,
        stream_index: usize,
    ) -> Result<Box<dyn AudioCodec>, MediaError>;

    /// Opens the decoder for a video stream, decoding into `frames`.
    fn open_video(
        &mut self,
        stream_index: usize,
        frames: Arc<FrameBuffers>,
    ) -> Result<(), MediaError>;

    /// Opens a subtitle stream decoder. Default: nothing to open.
    fn open_subtitle(&mut self, _stream_index: usize) -> Result<(), MediaError> {
        Ok(())
    }

    /// Whether the audio codec for a stream advertises internal delay
    /// (drives the end-of-stream drain packet).
    fn audio_codec_has_delay(&self, stream_index: usize) -> bool;

    /// Reads the next packet in container order.
    fn read_packet(&mut self) -> Result<ReadOutcome, MediaError>;

    /// Decodes one packet of the opened video stream into the pool.
    fn decode_video(&mut self, packet: &DemuxPacket) -> Result<(), MediaError>;

    /// Resets video codec buffers and timestamp tracking after a seek.
    fn flush_video(&mut self);

    /// Repositions to the start of the stream.
    fn seek_to_start(&mut self) -> Result<(), MediaError>;

    /// Tells a network source to stop transmitting. Failures are
    /// swallowed; the pause handshake is confirmed by the workers.
    fn read_pause(&mut self) {}

    /// Resumes transmission after [`read_pause`](Self::read_pause).
    fn read_play(&mut self) {}
}

/// Opens a container over a buffer.
///
/// A buffer that nominates a required format bypasses probing; otherwise
/// up to `probe_size` bytes are peeked (capped by what a non-sequential
/// buffer has left) and each back-end is given a look.
pub(crate) fn open_demux(
    mut buffer: Box<dyn Buffer>,
    interrupt: Arc<AtomicBool>,
    probe_size: usize,
) -> Result<Box<dyn Demux>, MediaError> {
    if let Some(name) = buffer.required_format() {
        tracing::info!("Demuxer required by buffer: '{name}'");
        return open_named(name, buffer, interrupt);
    }

    let mut window = probe_size;
    if !buffer.is_sequential() {
        let available = buffer.bytes_available();
        if available >= 0 {
            window = window.min(available as usize);
        }
    }
    let mut probe = vec![0u8; window];
    let got = buffer.peek(&mut probe);
    if interrupt.load(Ordering::Acquire) {
        return Err(MediaError::Interrupted);
    }
    probe.truncate(got);

    if synth::probe(&probe) {
        return Ok(Box::new(synth::SynthDemux::open(buffer, interrupt)?));
    }

    #[cfg(feature = "ffmpeg")]
    {
        return Ok(Box::new(ffmpeg::FfmpegDemux::open(buffer, interrupt)?));
    }

    #[allow(unreachable_code)]
    Err(MediaError::OpenFailed(format!(
        "unrecognised container '{}'",
        buffer.filtered_uri()
    )))
}

fn open_named(
    name: &str,
    buffer: Box<dyn Buffer>,
    interrupt: Arc<AtomicBool>,
) -> Result<Box<dyn Demux>, MediaError> {
    match name {
        synth::FORMAT_NAME => Ok(Box::new(synth::SynthDemux::open(buffer, interrupt)?)),
        #[cfg(feature = "ffmpeg")]
        ffmpeg::FORMAT_NAME => Ok(Box::new(ffmpeg::FfmpegDemux::open(buffer, interrupt)?)),
        other => Err(MediaError::OpenFailed(format!(
            "no demuxer named '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;

    #[test]
    fn test_probe_rejects_garbage() {
        let interrupt = Arc::new(AtomicBool::new(false));
        let buffer = Box::new(MemoryBuffer::new(vec![0xde, 0xad, 0xbe, 0xef], "mem"));
        let result = open_demux(buffer, interrupt, 512 * 1024);
        assert!(result.is_err());
    }

    #[test]
    fn test_probe_recognises_synth_header_without_nomination() {
        let interrupt = Arc::new(AtomicBool::new(false));
        let header = synth::SynthConfig::default().encode();
        let buffer = Box::new(MemoryBuffer::new(header, "mem"));
        let demux = open_demux(buffer, interrupt, 512 * 1024).unwrap();
        assert_eq!(demux.format_name(), synth::FORMAT_NAME);
    }

    #[test]
    fn test_required_format_bypasses_probe() {
        let interrupt = Arc::new(AtomicBool::new(false));
        // A 16-byte probe window is too small to recognise the header;
        // only the nomination can route this.
        let header = synth::SynthConfig::default().encode();
        let buffer = Box::new(
            MemoryBuffer::new(header, "mem").with_required_format(synth::FORMAT_NAME),
        );
        let demux = open_demux(buffer, interrupt, 16).unwrap();
        assert_eq!(demux.format_name(), synth::FORMAT_NAME);
    }

    #[test]
    fn test_unknown_required_format_fails() {
        let interrupt = Arc::new(AtomicBool::new(false));
        let buffer =
            Box::new(MemoryBuffer::new(Vec::new(), "mem").with_required_format("no-such"));
        assert!(open_demux(buffer, interrupt, 16).is_err());
    }

    #[test]
    fn test_codec_lock_is_reentrant_across_scopes() {
        {
            let _guard = codec_lock();
        }
        let _guard = codec_lock();
    }
}
