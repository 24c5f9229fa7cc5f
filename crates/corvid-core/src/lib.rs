//! corvid-core: a media playback engine.
//!
//! Given a URI to a container file or stream, the engine demultiplexes
//! packets, dispatches them to per-track decoder workers, and delivers
//! decoded audio and video to a renderer in presentation-time order.
//!
//! The pieces, leaves first:
//!
//! - [`packet::PacketQueue`] — bounded FIFO between the demuxer and one
//!   worker, with flush-marker injection.
//! - worker threads (audio/video/subtitle) — consume one queue each and
//!   honor run/pause/stop intents.
//! - the demuxer thread — opens the input, enumerates programs and
//!   streams, reads and routes packets.
//! - [`engine::MediaEngine`] — owns the demuxer thread and exposes the
//!   session control surface.
//! - [`player::Player`] — owns engines, performs overlapping media
//!   switches, and synchronizes video to the audio master clock in its
//!   refresh loop.
//!
//! External collaborators are traits: [`buffer::Buffer`] for input
//! bytes, [`audio::AudioSink`] for output and the playout clock, and
//! [`player::Renderer`] for display. A built-in synthetic container
//! (`synth:` URIs) drives tests and headless bring-up; real containers
//! come from the FFmpeg back-end behind the `ffmpeg` cargo feature.

pub mod audio;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod frame;
pub mod packet;
pub mod player;
pub mod stream;

mod demuxer;
mod worker;

pub use audio::{AudioDescription, AudioSink, NullSink, SampleFormat};
#[cfg(feature = "cpal-output")]
pub use audio::CpalSink;
pub use buffer::{Buffer, FileBuffer, MemoryBuffer, SeekWhence};
pub use config::{EngineConfig, DECODE_AUDIO, DECODE_NONE, DECODE_VIDEO};
pub use engine::MediaEngine;
pub use error::MediaError;
pub use frame::{FrameBuffers, PixelFormat, VideoFrame};
pub use packet::{DemuxPacket, Packet, PacketQueue};
pub use player::{NullRenderer, Player, PlayerCommand, PlayerHandle, PlayerState, Renderer};
pub use stream::{Chapter, CodecId, Disposition, Program, Stream, StreamType};
pub use worker::DecoderState;
