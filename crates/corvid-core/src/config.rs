//! Engine tunables.

/// Decode nothing; the demuxer only enumerates streams.
pub const DECODE_NONE: u32 = 0;
/// Decode the selected audio stream.
pub const DECODE_AUDIO: u32 = 1 << 0;
/// Decode the selected video, subtitle and raw-text streams.
pub const DECODE_VIDEO: u32 = 1 << 1;

/// Tunables shared by an engine and its workers.
///
/// The defaults match the sizes the pipeline was tuned with: a 320 KiB
/// audio queue ceiling, 100-packet queues and a 512 KiB probe window.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Byte ceiling for the audio packet queue; the demuxer sleeps while
    /// the queue is above it.
    pub max_audio_queue_bytes: usize,
    /// Packet-count ceiling used for queue sizing diagnostics.
    pub max_queue_length: usize,
    /// Bytes peeked from the buffer when probing an unknown container.
    pub probe_size: usize,
    /// Two-letter language preference used by stream scoring.
    pub user_locale: Option<String>,
    /// Which track types to decode (`DECODE_AUDIO` | `DECODE_VIDEO`).
    pub decode_flags: u32,
    /// Manual audio/video sync adjustment in milliseconds, added to the
    /// audio master clock.
    pub av_sync_offset_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_audio_queue_bytes: 320 * 1024,
            max_queue_length: 100,
            probe_size: 512 * 1024,
            user_locale: locale_from_env(),
            decode_flags: DECODE_AUDIO | DECODE_VIDEO,
            av_sync_offset_ms: 0,
        }
    }
}

/// Reads the preferred language from `LANG`/`LC_ALL` ("en_US.UTF-8" → "en").
pub fn locale_from_env() -> Option<String> {
    let raw = std::env::var("LC_ALL")
        .or_else(|_| std::env::var("LANG"))
        .ok()?;
    let lang: String = raw
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .flat_map(|c| c.to_lowercase())
        .collect();
    if lang.len() >= 2 {
        Some(lang[..2].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_audio_queue_bytes, 320 * 1024);
        assert_eq!(config.max_queue_length, 100);
        assert_eq!(config.probe_size, 512 * 1024);
        assert_eq!(config.decode_flags, DECODE_AUDIO | DECODE_VIDEO);
    }
}
