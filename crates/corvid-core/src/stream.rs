//! Stream, program and chapter metadata, plus stream selection scoring.

use std::collections::HashMap;

/// Codec identifiers the pipeline cares about.
///
/// Only the codecs that influence behavior (passthrough and downmix
/// policy, drain handling, subtitle reclassification) are named; anything
/// else lands on `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    PcmS16,
    Mp3,
    Aac,
    Ac3,
    Eac3,
    Dts,
    TrueHd,
    Flac,
    Vorbis,
    Opus,
    H264,
    Hevc,
    Vp9,
    Av1,
    Mpeg2Video,
    RawVideo,
    DvbSubtitle,
    PgsSubtitle,
    SubRip,
    Text,
    Teletext,
    Other(u32),
}

impl CodecId {
    /// Subtitle codecs that are plain text rather than bitmaps.
    pub fn is_raw_text(self) -> bool {
        matches!(self, CodecId::Text | CodecId::SubRip)
    }

    /// Subtitle codecs the pipeline never opens a decoder for.
    pub fn is_undecodable_subtitle(self) -> bool {
        matches!(self, CodecId::Teletext | CodecId::Text)
    }
}

/// The five elementary track types, in bucket order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Audio,
    Video,
    Subtitle,
    RawText,
    Attachment,
    Unknown,
}

/// Number of valid stream-type buckets in a [`Program`].
pub const STREAM_TYPE_COUNT: usize = 5;

impl StreamType {
    /// Bucket index for program grouping. `Unknown` has no bucket.
    pub fn bucket(self) -> Option<usize> {
        match self {
            StreamType::Audio => Some(0),
            StreamType::Video => Some(1),
            StreamType::Subtitle => Some(2),
            StreamType::RawText => Some(3),
            StreamType::Attachment => Some(4),
            StreamType::Unknown => None,
        }
    }

    pub fn from_bucket(index: usize) -> Option<StreamType> {
        match index {
            0 => Some(StreamType::Audio),
            1 => Some(StreamType::Video),
            2 => Some(StreamType::Subtitle),
            3 => Some(StreamType::RawText),
            4 => Some(StreamType::Attachment),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamType::Audio => "Audio",
            StreamType::Video => "Video",
            StreamType::Subtitle => "Subtitle",
            StreamType::RawText => "RawText",
            StreamType::Attachment => "Attachment",
            StreamType::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Container media category before pipeline classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Subtitle,
    Attachment,
    Data,
    Unknown,
}

/// Container disposition bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Disposition(pub u32);

impl Disposition {
    pub const DEFAULT: u32 = 1 << 0;
    pub const FORCED: u32 = 1 << 1;
    pub const ATTACHED_PIC: u32 = 1 << 2;

    pub fn is_default(self) -> bool {
        self.0 & Self::DEFAULT != 0
    }

    pub fn is_forced(self) -> bool {
        self.0 & Self::FORCED != 0
    }

    pub fn is_attached_picture(self) -> bool {
        self.0 & Self::ATTACHED_PIC != 0
    }
}

/// Maps a container stream onto a pipeline stream type.
///
/// Attached pictures become attachments regardless of their codec type,
/// plain-text subtitle codecs become raw text, and data streams are
/// discarded by returning `Unknown`.
pub fn classify_stream(kind: MediaKind, codec: CodecId, disposition: Disposition) -> StreamType {
    if disposition.is_attached_picture() {
        return StreamType::Attachment;
    }
    match kind {
        MediaKind::Audio => StreamType::Audio,
        MediaKind::Video => StreamType::Video,
        MediaKind::Subtitle => {
            if codec.is_raw_text() {
                StreamType::RawText
            } else {
                StreamType::Subtitle
            }
        }
        MediaKind::Attachment => StreamType::Attachment,
        MediaKind::Data | MediaKind::Unknown => StreamType::Unknown,
    }
}

/// One elementary track of the container.
#[derive(Debug, Clone)]
pub struct Stream {
    pub stream_type: StreamType,
    /// Container-assigned stream index.
    pub index: usize,
    /// Container stream id (e.g. the MPEG-TS PID).
    pub id: i64,
    /// Position within its type bucket, assigned during the program scan.
    pub secondary_index: usize,
    pub disposition: Disposition,
    /// Lowercase ISO-639-ish language code, empty when undeclared.
    pub language: String,
    pub codec: CodecId,
    /// Channel count as declared by the container (audio only).
    pub original_channels: u32,
    pub metadata: HashMap<String, String>,
}

impl Stream {
    pub fn is_valid(&self) -> bool {
        self.stream_type != StreamType::Unknown
    }
}

/// A group of streams that belong together, bucketed by type.
///
/// Containers without program tables are modeled as a single synthetic
/// program over every stream.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub id: i64,
    /// Container-assigned program index.
    pub index: usize,
    pub metadata: HashMap<String, String>,
    pub streams: [Vec<Stream>; STREAM_TYPE_COUNT],
    pub stream_count: usize,
}

impl Program {
    pub fn is_valid(&self) -> bool {
        self.stream_count > 0
    }

    /// Adds a classified stream to its bucket; `Unknown` streams are
    /// dropped.
    pub fn add_stream(&mut self, mut stream: Stream) {
        if let Some(bucket) = stream.stream_type.bucket() {
            stream.secondary_index = self.streams[bucket].len();
            self.streams[bucket].push(stream);
            self.stream_count += 1;
        }
    }

    pub fn streams_of(&self, stream_type: StreamType) -> &[Stream] {
        match stream_type.bucket() {
            Some(bucket) => &self.streams[bucket],
            None => &[],
        }
    }
}

/// A chapter marker.
#[derive(Debug, Clone)]
pub struct Chapter {
    pub id: i64,
    /// Chapter start in seconds.
    pub start_secs: i64,
    pub metadata: HashMap<String, String>,
}

/// True when a stream's declared language satisfies the user locale.
///
/// Stream languages are usually three-letter codes ("eng") and the locale
/// is two letters ("en"); the comparison matches on the common prefix.
fn language_matches(language: &str, locale: &str) -> bool {
    if language.is_empty() || locale.len() < 2 {
        return false;
    }
    language.as_bytes()[..2.min(language.len())] == locale.as_bytes()[..2]
}

/// Picks the best stream of a type from a program's bucket.
///
/// Returns the container index of the winner, or `None` when the bucket
/// is empty. With exactly one candidate it is chosen unconditionally;
/// otherwise each stream is scored and the highest score wins, ties
/// broken by first occurrence. The function is pure: identical inputs
/// always produce the identical choice.
pub fn select_stream(streams: &[Stream], locale: Option<&str>) -> Option<usize> {
    if streams.is_empty() {
        return None;
    }
    if streams.len() == 1 {
        return Some(streams[0].index);
    }

    let count = streams.len() as i64;
    let mut selected = None;
    let mut best = 0i64;

    for (position, stream) in streams.iter().enumerate() {
        let lang = locale.is_some_and(|l| language_matches(&stream.language, l));
        let score = (count - position as i64)
            + if lang { 500 } else { 0 }
            + if stream.disposition.is_forced() { 1000 } else { 0 }
            + if stream.disposition.is_default() { 100 } else { 0 }
            + (stream.original_channels as i64 + count) * 2;

        if score > best {
            best = score;
            selected = Some(stream.index);
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(index: usize, language: &str, disposition: u32, channels: u32) -> Stream {
        Stream {
            stream_type: StreamType::Audio,
            index,
            id: index as i64,
            secondary_index: 0,
            disposition: Disposition(disposition),
            language: language.to_string(),
            codec: CodecId::Aac,
            original_channels: channels,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_classify_attached_picture_overrides_codec_type() {
        let disposition = Disposition(Disposition::ATTACHED_PIC);
        assert_eq!(
            classify_stream(MediaKind::Video, CodecId::H264, disposition),
            StreamType::Attachment
        );
    }

    #[test]
    fn test_classify_text_subtitles_as_raw_text() {
        let none = Disposition::default();
        assert_eq!(
            classify_stream(MediaKind::Subtitle, CodecId::SubRip, none),
            StreamType::RawText
        );
        assert_eq!(
            classify_stream(MediaKind::Subtitle, CodecId::Text, none),
            StreamType::RawText
        );
        assert_eq!(
            classify_stream(MediaKind::Subtitle, CodecId::PgsSubtitle, none),
            StreamType::Subtitle
        );
    }

    #[test]
    fn test_classify_discards_data_streams() {
        let none = Disposition::default();
        assert_eq!(
            classify_stream(MediaKind::Data, CodecId::Other(0), none),
            StreamType::Unknown
        );
    }

    #[test]
    fn test_select_none_when_empty() {
        assert_eq!(select_stream(&[], Some("en")), None);
    }

    #[test]
    fn test_select_single_candidate() {
        let streams = vec![stream(7, "", 0, 0)];
        assert_eq!(select_stream(&streams, None), Some(7));
    }

    #[test]
    fn test_forced_outranks_language_and_default() {
        let streams = vec![
            stream(0, "en", Disposition::DEFAULT, 2),
            stream(1, "fr", Disposition::FORCED, 2),
        ];
        assert_eq!(select_stream(&streams, Some("en")), Some(1));
    }

    #[test]
    fn test_language_match_beats_position() {
        let streams = vec![
            stream(0, "fr", 0, 2),
            stream(1, "en", 0, 2),
            stream(2, "de", 0, 2),
        ];
        assert_eq!(select_stream(&streams, Some("en")), Some(1));
    }

    #[test]
    fn test_channel_count_breaks_position_preference() {
        // Position favors index 0; six channels on the second stream add
        // enough to overcome it.
        let streams = vec![stream(0, "", 0, 2), stream(1, "", 0, 6)];
        assert_eq!(select_stream(&streams, None), Some(1));
    }

    #[test]
    fn test_tie_broken_by_first_occurrence() {
        let streams = vec![stream(0, "", 0, 2), stream(1, "", 0, 2), stream(2, "", 0, 2)];
        // Identical apart from position, so the first wins outright.
        assert_eq!(select_stream(&streams, None), Some(0));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let streams = vec![
            stream(0, "en", Disposition::DEFAULT, 2),
            stream(1, "en", 0, 6),
            stream(2, "fr", Disposition::FORCED, 2),
        ];
        let first = select_stream(&streams, Some("en"));
        for _ in 0..32 {
            assert_eq!(select_stream(&streams, Some("en")), first);
        }
    }

    #[test]
    fn test_three_letter_language_matches_two_letter_locale() {
        assert!(language_matches("eng", "en"));
        assert!(!language_matches("fra", "en"));
        assert!(!language_matches("", "en"));
    }

    #[test]
    fn test_program_bucketing() {
        let mut program = Program::default();
        program.add_stream(Stream {
            stream_type: StreamType::Video,
            ..stream(0, "", 0, 0)
        });
        program.add_stream(stream(1, "en", 0, 2));
        program.add_stream(Stream {
            stream_type: StreamType::Unknown,
            ..stream(2, "", 0, 0)
        });

        assert_eq!(program.stream_count, 2);
        assert!(program.is_valid());
        assert_eq!(program.streams_of(StreamType::Audio).len(), 1);
        assert_eq!(program.streams_of(StreamType::Video).len(), 1);
        assert_eq!(program.streams_of(StreamType::Audio)[0].secondary_index, 0);
    }
}
