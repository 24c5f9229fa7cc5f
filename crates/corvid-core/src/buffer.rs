//! The input buffer collaborator.
//!
//! A [`Buffer`] feeds bytes to the format layer. It can nominate a
//! required container format, advertise seekability, and is the one
//! place blocking I/O happens — which is why blocking implementations
//! hold the engine's interrupt flag and give up when it is raised.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Origin for [`Buffer::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Current,
    End,
}

/// Byte source handed to the demuxer.
pub trait Buffer: Send {
    /// Fills `out` from the current position without advancing it.
    /// Returns the number of bytes produced.
    fn peek(&mut self, out: &mut [u8]) -> usize;

    /// Reads and advances. Returns 0 at end-of-stream or when
    /// interrupted.
    fn read(&mut self, out: &mut [u8]) -> usize;

    /// Optional write-back channel; unsupported by default.
    fn write(&mut self, _data: &[u8]) -> usize {
        0
    }

    /// Repositions the stream. Returns the new position or -1.
    fn seek(&mut self, offset: i64, whence: SeekWhence) -> i64;

    /// True when the source cannot seek (pipes, live streams).
    fn is_sequential(&self) -> bool;

    /// Bytes known to remain from the current position, or -1 if
    /// unknown.
    fn bytes_available(&self) -> i64;

    /// Preferred read-chunk size for the format layer.
    fn best_buffer_size(&self) -> usize {
        32 * 1024
    }

    /// Total size in bytes, or -1 if unknown.
    fn size(&self) -> i64;

    /// The post-processed URI handed to the format layer.
    fn filtered_uri(&self) -> &str;

    /// A container format this buffer must be opened with, bypassing the
    /// probe.
    fn required_format(&self) -> Option<&'static str> {
        None
    }

    /// Gives the buffer first refusal on a user action.
    fn handle_action(&mut self, _action: u32) -> bool {
        false
    }

    /// Read-ahead hint from the demuxer's bitrate estimate.
    fn set_bitrate(&mut self, _bits_per_second: i64, _factor: u32) {}
}

// ============================================================================
// File buffer
// ============================================================================

/// Seekable file-backed buffer.
pub struct FileBuffer {
    file: File,
    uri: String,
    size: i64,
    position: i64,
}

impl FileBuffer {
    pub fn open(uri: &str) -> std::io::Result<Self> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        let file = File::open(path)?;
        let size = file.metadata().map(|m| m.len() as i64).unwrap_or(-1);
        Ok(Self {
            file,
            uri: path.to_string(),
            size,
            position: 0,
        })
    }
}

impl Buffer for FileBuffer {
    fn peek(&mut self, out: &mut [u8]) -> usize {
        let here = self.position;
        let got = self.read(out);
        self.seek(here, SeekWhence::Set);
        got
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        match self.file.read(out) {
            Ok(got) => {
                self.position += got as i64;
                got
            }
            Err(err) => {
                tracing::warn!("File read failed: {err}");
                0
            }
        }
    }

    fn seek(&mut self, offset: i64, whence: SeekWhence) -> i64 {
        let target = match whence {
            SeekWhence::Set => SeekFrom::Start(offset.max(0) as u64),
            SeekWhence::Current => SeekFrom::Current(offset),
            SeekWhence::End => SeekFrom::End(offset),
        };
        match self.file.seek(target) {
            Ok(position) => {
                self.position = position as i64;
                self.position
            }
            Err(_) => -1,
        }
    }

    fn is_sequential(&self) -> bool {
        false
    }

    fn bytes_available(&self) -> i64 {
        if self.size < 0 {
            -1
        } else {
            (self.size - self.position).max(0)
        }
    }

    fn size(&self) -> i64 {
        self.size
    }

    fn filtered_uri(&self) -> &str {
        &self.uri
    }
}

// ============================================================================
// Memory buffer
// ============================================================================

/// In-memory buffer, optionally sequential-only. Also the carrier for
/// synthetic-container headers.
pub struct MemoryBuffer {
    data: Vec<u8>,
    position: usize,
    uri: String,
    sequential: bool,
    required: Option<&'static str>,
}

impl MemoryBuffer {
    pub fn new(data: Vec<u8>, uri: &str) -> Self {
        Self {
            data,
            position: 0,
            uri: uri.to_string(),
            sequential: false,
            required: None,
        }
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn with_required_format(mut self, format: &'static str) -> Self {
        self.required = Some(format);
        self
    }
}

impl Buffer for MemoryBuffer {
    fn peek(&mut self, out: &mut [u8]) -> usize {
        let available = &self.data[self.position.min(self.data.len())..];
        let count = available.len().min(out.len());
        out[..count].copy_from_slice(&available[..count]);
        count
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        let count = self.peek(out);
        self.position += count;
        count
    }

    fn seek(&mut self, offset: i64, whence: SeekWhence) -> i64 {
        if self.sequential {
            return -1;
        }
        let base = match whence {
            SeekWhence::Set => 0i64,
            SeekWhence::Current => self.position as i64,
            SeekWhence::End => self.data.len() as i64,
        };
        let target = base + offset;
        if target < 0 {
            return -1;
        }
        self.position = (target as usize).min(self.data.len());
        self.position as i64
    }

    fn is_sequential(&self) -> bool {
        self.sequential
    }

    fn bytes_available(&self) -> i64 {
        (self.data.len() - self.position.min(self.data.len())) as i64
    }

    fn size(&self) -> i64 {
        self.data.len() as i64
    }

    fn filtered_uri(&self) -> &str {
        &self.uri
    }

    fn required_format(&self) -> Option<&'static str> {
        self.required
    }
}

// ============================================================================
// Hanging buffer
// ============================================================================

/// A buffer whose reads block until the engine interrupt is raised.
/// Models a stuck network source; used to prove stop() preempts a stuck
/// open.
pub struct HangBuffer {
    uri: String,
    interrupt: Arc<AtomicBool>,
}

impl HangBuffer {
    pub fn new(uri: &str, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            uri: uri.to_string(),
            interrupt,
        }
    }

    fn block_until_interrupted(&self) {
        while !self.interrupt.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Buffer for HangBuffer {
    fn peek(&mut self, _out: &mut [u8]) -> usize {
        self.block_until_interrupted();
        0
    }

    fn read(&mut self, _out: &mut [u8]) -> usize {
        self.block_until_interrupted();
        0
    }

    fn seek(&mut self, _offset: i64, _whence: SeekWhence) -> i64 {
        -1
    }

    fn is_sequential(&self) -> bool {
        true
    }

    fn bytes_available(&self) -> i64 {
        i64::MAX
    }

    fn size(&self) -> i64 {
        -1
    }

    fn filtered_uri(&self) -> &str {
        &self.uri
    }
}

/// Creates the buffer for a URI. Returns `None` for an empty or
/// unusable URI.
///
/// The interrupt flag is threaded into buffers that can block, which is
/// what lets `stop()` preempt a stuck read during open.
pub(crate) fn create_buffer(uri: &str, interrupt: Arc<AtomicBool>) -> Option<Box<dyn Buffer>> {
    if uri.is_empty() {
        return None;
    }
    if uri == "synth:hang" {
        return Some(Box::new(HangBuffer::new(uri, interrupt)));
    }
    if uri.starts_with("synth:") {
        return crate::format::synth::buffer_for_uri(uri);
    }
    if uri.starts_with("file://") || !uri.contains("://") {
        match FileBuffer::open(uri) {
            Ok(buffer) => return Some(Box::new(buffer)),
            Err(err) => {
                tracing::error!("Failed to open '{uri}': {err}");
                return None;
            }
        }
    }
    // Network URIs are handed to the format layer untouched; it opens
    // them through its own protocol support.
    #[cfg(feature = "ffmpeg")]
    {
        return Some(Box::new(MemoryBuffer::new(Vec::new(), uri)));
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        tracing::error!("No handler for '{uri}'");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_buffer_peek_does_not_advance() {
        let mut buffer = MemoryBuffer::new(vec![1, 2, 3, 4], "mem");
        let mut out = [0u8; 2];
        assert_eq!(buffer.peek(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(buffer.read(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(buffer.bytes_available(), 2);
    }

    #[test]
    fn test_memory_buffer_sequential_refuses_seek() {
        let mut buffer = MemoryBuffer::new(vec![0; 16], "mem").sequential();
        assert!(buffer.is_sequential());
        assert_eq!(buffer.seek(0, SeekWhence::Set), -1);
    }

    #[test]
    fn test_memory_buffer_peek_capped_by_available() {
        // Probe window larger than the content on a sequential source.
        let mut buffer = MemoryBuffer::new(vec![7; 100], "mem").sequential();
        let mut out = vec![0u8; 4096];
        assert_eq!(buffer.peek(&mut out), 100);
    }

    #[test]
    fn test_create_buffer_rejects_empty_uri() {
        let interrupt = Arc::new(AtomicBool::new(false));
        assert!(create_buffer("", interrupt).is_none());
    }

    #[test]
    fn test_hang_buffer_unblocks_on_interrupt() {
        let interrupt = Arc::new(AtomicBool::new(false));
        let mut buffer = HangBuffer::new("synth:hang", Arc::clone(&interrupt));
        let flag = Arc::clone(&interrupt);
        let unblocker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::Release);
        });
        let start = std::time::Instant::now();
        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out), 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
        unblocker.join().unwrap();
    }
}
