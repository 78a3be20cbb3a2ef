use super::segments::OutputTarget;
use crate::error::RequestError;
use crate::ports::encoder::ProcessHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Media time base used for positions and seek offsets (100ns ticks).
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Upper bound on the number of media segments a single stream is split
/// into. Runtimes that need more are rejected.
pub const MAX_SEGMENT_COUNT: u64 = 100_000;

/// Fixed look-ahead tolerated by the fragmented scheme before a restart.
const FRAGMENTED_GAP: u64 = 4;

/// Window, in seconds, the sequential scheme tolerates ahead of the encoder.
const SEQUENTIAL_GAP_SECONDS: u64 = 24;

/// Segment addressing scheme of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// `{base}.m3u8` playlist with `{base}{index}.ts` segments.
    #[default]
    Sequential,
    /// `{base}.mpd` manifest, `init-stream` at index 0 and numbered
    /// `chunk-stream` files from index 1.
    Fragmented,
}

impl JobKind {
    pub fn manifest_extension(&self) -> &'static str {
        match self {
            JobKind::Sequential => "m3u8",
            JobKind::Fragmented => "mpd",
        }
    }

    pub fn segment_extension(&self) -> &'static str {
        match self {
            JobKind::Sequential => "ts",
            JobKind::Fragmented => "m4s",
        }
    }

    /// Maximum number of segments a request may run ahead of the encoder
    /// before the job is restarted at the requested position.
    pub fn gap_threshold(&self, segment_length: u32) -> u64 {
        match self {
            JobKind::Sequential => SEQUENTIAL_GAP_SECONDS / u64::from(segment_length.max(1)),
            JobKind::Fragmented => FRAGMENTED_GAP,
        }
    }

    /// First index that carries media. Index 0 of the fragmented scheme is
    /// the initialization segment.
    pub fn first_media_index(&self) -> u64 {
        match self {
            JobKind::Sequential => 0,
            JobKind::Fragmented => 1,
        }
    }

    /// Playback position at which segment `index` starts. Fragmented media
    /// segments are shifted by one since index 0 holds no media.
    pub fn segment_start_ticks(&self, index: u64, segment_length: u32) -> u64 {
        let ordinal = index.saturating_sub(self.first_media_index());
        ordinal
            .saturating_mul(u64::from(segment_length.max(1)))
            .saturating_mul(TICKS_PER_SECOND)
    }
}

/// How subtitles reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleDeliveryMethod {
    /// Burned into the video.
    Encode,
    /// Muxed into the segments.
    Embed,
    /// Fetched out of band by the client.
    External,
    /// Advertised as a rendition group in the master playlist.
    #[default]
    Hls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleStream {
    pub index: u32,
    pub name: String,
    pub language: Option<String>,
    pub is_default: bool,
    pub is_forced: bool,
    /// Text formats (srt, vtt, ass) can be served as renditions, bitmap
    /// formats cannot.
    pub is_text: bool,
}

/// What a client asked to be streamed.
///
/// Deserialized from the query string of every manifest and segment URL so
/// that each request carries the full description of its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub media_source_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub play_session_id: String,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    pub video_bitrate: Option<u64>,
    pub audio_bitrate: Option<u64>,
    #[serde(default)]
    pub start_segment: u64,
    #[serde(default = "default_segment_length")]
    pub segment_length: u32,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default)]
    pub stream_id: u32,
    /// `None` for live or otherwise unbounded sources.
    pub runtime_ticks: Option<u64>,
    #[serde(default)]
    pub enable_adaptive_bitrate: bool,
    /// Filled by library callers that resolve the source's subtitle
    /// streams. Never read from the query string, so manifests served by
    /// the HTTP adapter carry no subtitle group.
    #[serde(skip)]
    pub subtitles: Vec<SubtitleStream>,
    #[serde(default)]
    pub subtitle_method: SubtitleDeliveryMethod,
}

fn default_video_codec() -> String {
    String::from("h264")
}

fn default_audio_codec() -> String {
    String::from("aac")
}

fn default_segment_length() -> u32 {
    6
}

impl StreamRequest {
    pub fn new(media_source_id: impl Into<String>) -> Self {
        Self {
            media_source_id: media_source_id.into(),
            device_id: String::new(),
            play_session_id: String::new(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            video_bitrate: None,
            audio_bitrate: None,
            start_segment: 0,
            segment_length: default_segment_length(),
            kind: JobKind::default(),
            stream_id: 0,
            runtime_ticks: None,
            enable_adaptive_bitrate: false,
            subtitles: Vec::new(),
            subtitle_method: SubtitleDeliveryMethod::default(),
        }
    }

    /// Combined video and audio bitrate.
    pub fn total_bitrate(&self) -> u64 {
        self.video_bitrate.unwrap_or(0) + self.audio_bitrate.unwrap_or(0)
    }

    pub fn start_ticks(&self, index: u64) -> u64 {
        self.kind.segment_start_ticks(index, self.segment_length)
    }

    pub fn segment_ticks(&self) -> u64 {
        u64::from(self.segment_length.max(1)) * TICKS_PER_SECOND
    }

    /// Number of media segments covering the runtime, `None` when the
    /// runtime is unknown.
    pub fn segment_count(&self) -> Result<Option<u64>, RequestError> {
        let runtime_ticks = match self.runtime_ticks {
            Some(ticks) if ticks > 0 => ticks,
            _ => return Ok(None),
        };
        let count = runtime_ticks.div_ceil(self.segment_ticks());
        if count > MAX_SEGMENT_COUNT {
            return Err(RequestError::TooManySegments {
                count,
                max: MAX_SEGMENT_COUNT,
            });
        }
        Ok(Some(count))
    }

    /// Highest index a client may ask for.
    pub fn last_segment_index(&self) -> Result<u64, RequestError> {
        let count = self.segment_count()?.unwrap_or(MAX_SEGMENT_COUNT);
        Ok(self.kind.first_media_index() + count - 1)
    }

    pub fn check_segment_index(&self, index: u64) -> Result<(), RequestError> {
        let last = self.last_segment_index()?;
        if index > last {
            return Err(RequestError::SegmentOutOfRange { index, last });
        }
        Ok(())
    }

    /// Copy of this request repositioned at segment `index`.
    pub fn starting_at(&self, index: u64) -> Self {
        Self {
            start_segment: index,
            ..self.clone()
        }
    }
}

pub fn is_copy_codec(codec: &str) -> bool {
    codec.eq_ignore_ascii_case("copy")
}

/// One running encoder process producing segments for one output target.
///
/// Jobs are never restarted in place: a restart registers a new job with the
/// next generation number for the same target.
pub struct TranscodeJob {
    pub target: OutputTarget,
    pub kind: JobKind,
    pub stream_id: u32,
    pub device_id: String,
    pub play_session_id: String,
    pub generation: u64,
    pub started_at: SystemTime,
    process: Box<dyn ProcessHandle>,
    download_watermark: AtomicU64,
}

impl TranscodeJob {
    pub fn new(
        target: OutputTarget,
        request: &StreamRequest,
        generation: u64,
        process: Box<dyn ProcessHandle>,
    ) -> Self {
        Self {
            target,
            kind: request.kind,
            stream_id: request.stream_id,
            device_id: request.device_id.clone(),
            play_session_id: request.play_session_id.clone(),
            generation,
            started_at: SystemTime::now(),
            process,
            download_watermark: AtomicU64::new(0),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.process.has_exited()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    pub async fn kill(&self) {
        self.process.kill().await
    }

    pub fn download_watermark(&self) -> u64 {
        self.download_watermark.load(Ordering::Acquire)
    }

    /// Raises the watermark to `ticks` unless it is already higher and
    /// returns the stored value.
    pub fn advance_watermark(&self, ticks: u64) -> u64 {
        let previous = self.download_watermark.fetch_max(ticks, Ordering::AcqRel);
        previous.max(ticks)
    }

    /// Whether this job was started for the given device/session pair.
    /// Empty identifiers never match.
    pub fn belongs_to(&self, device_id: &str, play_session_id: &str) -> bool {
        if device_id.is_empty() && play_session_id.is_empty() {
            return false;
        }
        self.device_id == device_id && self.play_session_id == play_session_id
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            manifest: self.target.to_string(),
            kind: self.kind,
            device_id: self.device_id.clone(),
            play_session_id: self.play_session_id.clone(),
            generation: self.generation,
            pid: self.pid(),
            download_watermark: self.download_watermark(),
            has_exited: self.has_exited(),
        }
    }
}

impl fmt::Debug for TranscodeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeJob")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("play_session_id", &self.play_session_id)
            .field("generation", &self.generation)
            .field("download_watermark", &self.download_watermark())
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot of a job for listing active encodings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub manifest: String,
    pub kind: JobKind,
    pub device_id: String,
    pub play_session_id: String,
    pub generation: u64,
    pub pid: Option<u32>,
    pub download_watermark: u64,
    pub has_exited: bool,
}
