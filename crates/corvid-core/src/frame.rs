//! Decoded video frames and the pooled frame buffers.
//!
//! Frames are pool-allocated once per format and reused. A frame is in
//! exactly one state at a time and cycles
//! `Free → Decoding → Decoded → Displaying → Free`: the decoder path
//! performs the first transition, the renderer the last.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Frames kept in the pool. Decode is synchronous on the demuxer thread,
/// so the pool only needs to cover the decoded backlog plus the frame the
/// renderer is holding.
const DEFAULT_POOL_FRAMES: usize = 8;

/// Pixel layout of a decoded frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (the common software-decode format)
    Yuv420p,
    /// Y plane plus interleaved UV
    Nv12,
    /// RGBA 32-bit, used by the synthetic source
    Rgba,
}

impl PixelFormat {
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgba => 1,
        }
    }

    /// Per-plane pitches and offsets for a tightly-packed buffer, plus
    /// the total byte size.
    fn layout(&self, width: u32, height: u32) -> ([usize; 4], [usize; 4], usize) {
        let w = width as usize;
        let h = height as usize;
        let mut pitches = [0usize; 4];
        let mut offsets = [0usize; 4];
        let total = match self {
            PixelFormat::Yuv420p => {
                pitches[0] = w;
                pitches[1] = w.div_ceil(2);
                pitches[2] = w.div_ceil(2);
                offsets[1] = w * h;
                offsets[2] = offsets[1] + pitches[1] * h.div_ceil(2);
                offsets[2] + pitches[2] * h.div_ceil(2)
            }
            PixelFormat::Nv12 => {
                pitches[0] = w;
                pitches[1] = w + (w & 1);
                offsets[1] = w * h;
                offsets[1] + pitches[1] * h.div_ceil(2)
            }
            PixelFormat::Rgba => {
                pitches[0] = w * 4;
                w * 4 * h
            }
        };
        (pitches, offsets, total)
    }
}

/// Colour space of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColourSpace {
    #[default]
    Unspecified,
    Bt601,
    Bt709,
}

/// One decoded video picture.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pixel_format: PixelFormat,
    /// Coded dimensions.
    pub raw_width: u32,
    pub raw_height: u32,
    /// Intended display dimensions (cropped).
    pub display_width: u32,
    pub display_height: u32,
    pub pitches: [usize; 4],
    pub offsets: [usize; 4],
    /// Raw pixel data, laid out per `pitches`/`offsets`.
    pub buffer: Vec<u8>,
    pub colour_space: ColourSpace,
    pub top_field_first: bool,
    pub interlaced: bool,
    pub frame_aspect_ratio: f64,
    pub pixel_aspect_ratio: f64,
    pub repeat_pict: i32,
    pub frame_number: i64,
    /// Presentation timestamp in milliseconds.
    pub pts: Option<i64>,
    /// Set on frames decoded before the first keyframe was seen.
    pub corrupt: bool,
    /// Frame rate measured from the container.
    pub frame_rate: f64,
    /// Pool generation this frame was allocated under.
    generation: u64,
}

impl VideoFrame {
    fn allocate(format: PixelFormat, width: u32, height: u32, generation: u64) -> Self {
        let (pitches, offsets, total) = format.layout(width, height);
        Self {
            pixel_format: format,
            raw_width: width,
            raw_height: height,
            display_width: width,
            display_height: height,
            pitches,
            offsets,
            buffer: vec![0u8; total],
            colour_space: ColourSpace::Unspecified,
            top_field_first: false,
            interlaced: false,
            frame_aspect_ratio: if height > 0 {
                width as f64 / height as f64
            } else {
                4.0 / 3.0
            },
            pixel_aspect_ratio: 1.0,
            repeat_pict: 0,
            frame_number: 0,
            pts: None,
            corrupt: false,
            frame_rate: 0.0,
            generation,
        }
    }
}

struct PoolState {
    free: Vec<VideoFrame>,
    decoded: VecDeque<VideoFrame>,
    decoding: usize,
    displaying: usize,
    generation: u64,
    capacity: usize,
    format: Option<(PixelFormat, u32, u32)>,
}

/// The pool of reusable video frames shared by the decoder path and the
/// refresh loop.
///
/// Exactly one producer (the demuxer-side decode) and one consumer (the
/// refresh loop) operate on the pool at a time; everything goes through
/// the acquire/release operations below so a frame always re-enters the
/// pool through `Free`.
pub struct FrameBuffers {
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl FrameBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            freed: Condvar::new(),
            state: Mutex::new(PoolState {
                free: Vec::new(),
                decoded: VecDeque::new(),
                decoding: 0,
                displaying: 0,
                generation: 0,
                capacity: capacity.max(2),
                format: None,
            }),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_POOL_FRAMES)
    }

    /// (Re)allocates the pool for a new coded format.
    ///
    /// Pending decoded frames are discarded; a frame currently checked
    /// out for display is replaced when it comes back rather than reused.
    pub fn format_changed(&self, format: PixelFormat, width: u32, height: u32, references: u32) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.capacity = state.capacity.max(references as usize + 2);
        state.format = Some((format, width, height));
        state.decoded.clear();
        state.free.clear();
        let outstanding = state.decoding + state.displaying;
        let fresh = state.capacity.saturating_sub(outstanding);
        let generation = state.generation;
        for _ in 0..fresh {
            state
                .free
                .push(VideoFrame::allocate(format, width, height, generation));
        }
        tracing::debug!(
            "Frame pool reallocated: {:?} {}x{}, {} frames",
            format,
            width,
            height,
            state.capacity
        );
        drop(state);
        self.freed.notify_all();
    }

    /// Checks a frame out for decoding (`Free → Decoding`).
    ///
    /// Returns `None` when the pool is exhausted or no format is set.
    pub fn frame_for_decoding(&self) -> Option<VideoFrame> {
        let mut state = self.state.lock();
        let frame = state.free.pop()?;
        state.decoding += 1;
        Some(frame)
    }

    /// Like [`frame_for_decoding`](Self::frame_for_decoding), but waits
    /// up to `timeout` for the renderer to free a frame. This is the
    /// back-pressure on the video decode path.
    pub fn frame_for_decoding_timeout(&self, timeout: Duration) -> Option<VideoFrame> {
        let mut state = self.state.lock();
        if state.free.is_empty() {
            self.freed.wait_for(&mut state, timeout);
        }
        let frame = state.free.pop()?;
        state.decoding += 1;
        Some(frame)
    }

    /// Hands a filled frame to the display queue (`Decoding → Decoded`).
    pub fn release_from_decoding(&self, frame: VideoFrame) {
        let mut state = self.state.lock();
        state.decoding = state.decoding.saturating_sub(1);
        if frame.generation == state.generation {
            state.decoded.push_back(frame);
        } else {
            Self::readmit_stale(&mut state);
        }
    }

    /// Returns an unused decode checkout to the free list
    /// (`Decoding → Free`).
    pub fn cancel_decoding(&self, frame: VideoFrame) {
        {
            let mut state = self.state.lock();
            state.decoding = state.decoding.saturating_sub(1);
            if frame.generation == state.generation {
                state.free.push(frame);
            } else {
                Self::readmit_stale(&mut state);
            }
        }
        self.freed.notify_one();
    }

    /// Takes the oldest decoded frame for display
    /// (`Decoded → Displaying`).
    pub fn frame_for_displaying(&self) -> Option<VideoFrame> {
        let mut state = self.state.lock();
        let frame = state.decoded.pop_front()?;
        state.displaying += 1;
        Some(frame)
    }

    /// Returns a displayed frame to the pool (`Displaying → Free`).
    pub fn release_from_displaying(&self, frame: VideoFrame) {
        {
            let mut state = self.state.lock();
            state.displaying = state.displaying.saturating_sub(1);
            if frame.generation == state.generation {
                state.free.push(frame);
            } else {
                Self::readmit_stale(&mut state);
            }
        }
        self.freed.notify_one();
    }

    // A frame from an old generation is not reused; a freshly allocated
    // one keeps the pool at capacity.
    fn readmit_stale(state: &mut PoolState) {
        if let Some((format, width, height)) = state.format {
            let generation = state.generation;
            if state.free.len() + state.decoded.len() + state.decoding + state.displaying
                < state.capacity
            {
                state
                    .free
                    .push(VideoFrame::allocate(format, width, height, generation));
            }
        }
    }

    /// PTS of the oldest decoded frame, without removing it.
    pub fn next_decoded_pts(&self) -> Option<i64> {
        let state = self.state.lock();
        state.decoded.front().and_then(|f| f.pts)
    }

    /// Discards pending decoded frames. Without `force` the frame
    /// currently checked out for display stays valid; with `force` it is
    /// invalidated and replaced when released.
    pub fn reset(&self, force: bool) {
        {
            let mut state = self.state.lock();
            while let Some(frame) = state.decoded.pop_front() {
                state.free.push(frame);
            }
            if force {
                state.generation += 1;
                let generation = state.generation;
                for frame in &mut state.free {
                    frame.generation = generation;
                    frame.pts = None;
                }
            }
        }
        self.freed.notify_all();
    }

    /// Returns `(free, decoding, decoded, displaying)` frame counts.
    pub fn status(&self) -> (usize, usize, usize, usize) {
        let state = self.state.lock();
        (
            state.free.len(),
            state.decoding,
            state.decoded.len(),
            state.displaying,
        )
    }

    pub fn decoded_len(&self) -> usize {
        self.state.lock().decoded.len()
    }
}

/// Chooses the validated presentation timestamp for a decoded frame.
///
/// Faults are counted as monotonicity violations per timestamp channel;
/// the PTS is used unless it has misbehaved more often than the DTS.
/// Reset on seek and flush.
#[derive(Debug)]
pub struct TimestampSelector {
    last_pts: i64,
    last_dts: i64,
    faulty_pts: u64,
    faulty_dts: u64,
}

impl TimestampSelector {
    pub fn new() -> Self {
        Self {
            last_pts: i64::MIN,
            last_dts: i64::MIN,
            faulty_pts: 0,
            faulty_dts: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn select(&mut self, pts: Option<i64>, dts: Option<i64>) -> Option<i64> {
        if let Some(dts) = dts {
            if dts <= self.last_dts {
                self.faulty_dts += 1;
            }
            self.last_dts = dts;
        }
        if let Some(pts) = pts {
            if pts <= self.last_pts {
                self.faulty_pts += 1;
            }
            self.last_pts = pts;
        }

        if pts.is_some() && (self.faulty_pts <= self.faulty_dts || dts.is_none()) {
            pts
        } else {
            dts
        }
    }
}

impl Default for TimestampSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> FrameBuffers {
        let buffers = FrameBuffers::new(4);
        buffers.format_changed(PixelFormat::Yuv420p, 64, 48, 2);
        buffers
    }

    #[test]
    fn test_yuv420_layout() {
        let (pitches, offsets, total) = PixelFormat::Yuv420p.layout(64, 48);
        assert_eq!(pitches[0], 64);
        assert_eq!(pitches[1], 32);
        assert_eq!(offsets[1], 64 * 48);
        assert_eq!(total, 64 * 48 + 2 * 32 * 24);
    }

    #[test]
    fn test_frame_cycle_through_states() {
        let buffers = pool();
        let (free, ..) = buffers.status();
        assert_eq!(free, 4);

        let mut frame = buffers.frame_for_decoding().unwrap();
        assert_eq!(buffers.status(), (3, 1, 0, 0));

        frame.pts = Some(40);
        buffers.release_from_decoding(frame);
        assert_eq!(buffers.status(), (3, 0, 1, 0));
        assert_eq!(buffers.next_decoded_pts(), Some(40));
        // Peeking does not remove the frame.
        assert_eq!(buffers.decoded_len(), 1);

        let shown = buffers.frame_for_displaying().unwrap();
        assert_eq!(shown.pts, Some(40));
        assert_eq!(buffers.status(), (3, 0, 0, 1));

        buffers.release_from_displaying(shown);
        assert_eq!(buffers.status(), (4, 0, 0, 0));
    }

    #[test]
    fn test_decoded_frames_come_out_in_order() {
        let buffers = pool();
        for pts in [10i64, 20, 30] {
            let mut frame = buffers.frame_for_decoding().unwrap();
            frame.pts = Some(pts);
            buffers.release_from_decoding(frame);
        }
        for expected in [10i64, 20, 30] {
            let frame = buffers.frame_for_displaying().unwrap();
            assert_eq!(frame.pts, Some(expected));
            buffers.release_from_displaying(frame);
        }
    }

    #[test]
    fn test_pool_exhaustion_returns_none() {
        let buffers = pool();
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(buffers.frame_for_decoding().unwrap());
        }
        assert!(buffers.frame_for_decoding().is_none());
        for frame in held {
            buffers.cancel_decoding(frame);
        }
        assert_eq!(buffers.status(), (4, 0, 0, 0));
    }

    #[test]
    fn test_reset_preserves_displaying_frame() {
        let buffers = pool();
        let mut frame = buffers.frame_for_decoding().unwrap();
        frame.pts = Some(5);
        buffers.release_from_decoding(frame);
        let shown = buffers.frame_for_displaying().unwrap();

        let mut queued = buffers.frame_for_decoding().unwrap();
        queued.pts = Some(6);
        buffers.release_from_decoding(queued);

        buffers.reset(false);
        assert_eq!(buffers.decoded_len(), 0);

        // The displaying frame is from the live generation and is reused.
        buffers.release_from_displaying(shown);
        assert_eq!(buffers.status(), (4, 0, 0, 0));
    }

    #[test]
    fn test_forced_reset_invalidates_displaying_frame() {
        let buffers = pool();
        let mut frame = buffers.frame_for_decoding().unwrap();
        frame.pts = Some(5);
        buffers.release_from_decoding(frame);
        let shown = buffers.frame_for_displaying().unwrap();

        buffers.reset(true);
        buffers.release_from_displaying(shown);

        // Capacity is restored with a replacement frame.
        let (free, decoding, decoded, displaying) = buffers.status();
        assert_eq!((decoding, decoded, displaying), (0, 0, 0));
        assert_eq!(free, 4);
        assert!(buffers.next_decoded_pts().is_none());
    }

    #[test]
    fn test_format_change_replaces_outstanding_frames() {
        let buffers = pool();
        let held = buffers.frame_for_decoding().unwrap();
        buffers.format_changed(PixelFormat::Nv12, 128, 96, 2);

        // The stale checkout is not readmitted as-is.
        buffers.release_from_decoding(held);
        assert_eq!(buffers.decoded_len(), 0);
        let frame = buffers.frame_for_decoding().unwrap();
        assert_eq!(frame.pixel_format, PixelFormat::Nv12);
        assert_eq!(frame.raw_width, 128);
        buffers.cancel_decoding(frame);
    }

    #[test]
    fn test_timestamp_selector_prefers_pts() {
        let mut selector = TimestampSelector::new();
        assert_eq!(selector.select(Some(0), Some(0)), Some(0));
        assert_eq!(selector.select(Some(40), Some(40)), Some(40));
        assert_eq!(selector.select(Some(80), None), Some(80));
    }

    #[test]
    fn test_timestamp_selector_switches_to_dts_on_faulty_pts() {
        let mut selector = TimestampSelector::new();
        selector.select(Some(100), Some(0));
        // PTS runs backwards twice while DTS stays monotonic.
        selector.select(Some(40), Some(40));
        let chosen = selector.select(Some(20), Some(80));
        assert_eq!(chosen, Some(80));
    }

    #[test]
    fn test_timestamp_selector_reset_restores_pts_preference() {
        let mut selector = TimestampSelector::new();
        selector.select(Some(100), Some(0));
        selector.select(Some(40), Some(40));
        selector.select(Some(20), Some(80));
        selector.reset();
        assert_eq!(selector.select(Some(10), Some(90)), Some(10));
    }
}
