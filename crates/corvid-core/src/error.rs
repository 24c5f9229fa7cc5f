//! Error types for the playback pipeline.

/// Errors that can occur while opening or playing media.
///
/// Anything raised during the open sequence is fatal to the engine that
/// raised it but not to the supervisor, which stays able to accept a new
/// `play()`. Decode and sink errors are recovered locally and never
/// propagate past the worker that saw them.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaError {
    /// Buffer or format open failure.
    OpenFailed(String),
    /// No usable program was discovered in the container.
    NoPrograms,
    /// A required codec could not be opened.
    CodecOpen(String),
    /// Read-layer error distinct from end-of-stream.
    IoError(String),
    /// Per-packet decode failure; logged and skipped.
    DecodeError(String),
    /// The audio sink refused data; triggers a sink re-setup.
    SinkError(String),
    /// Normal termination via stop; not a failure.
    Interrupted,
    /// A supervised wait elapsed; the operation proceeds regardless.
    Timeout(String),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::OpenFailed(msg) => write!(f, "Failed to open media: {msg}"),
            MediaError::NoPrograms => write!(f, "No valid programs found"),
            MediaError::CodecOpen(msg) => write!(f, "Failed to open codec: {msg}"),
            MediaError::IoError(msg) => write!(f, "Read error: {msg}"),
            MediaError::DecodeError(msg) => write!(f, "Decode error: {msg}"),
            MediaError::SinkError(msg) => write!(f, "Audio sink error: {msg}"),
            MediaError::Interrupted => write!(f, "Interrupted"),
            MediaError::Timeout(msg) => write!(f, "Timed out: {msg}"),
        }
    }
}

impl std::error::Error for MediaError {}

impl MediaError {
    /// Returns true when the error ends the engine session rather than a
    /// single packet.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MediaError::DecodeError(_)
                | MediaError::SinkError(_)
                | MediaError::Timeout(_)
                | MediaError::Interrupted
        )
    }
}
