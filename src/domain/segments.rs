//! On-disk naming of manifests and segment files.
//!
//! The waiter, the stale-index scanner and the encoder launcher all rebuild
//! file names through this module, so the layout below is load-bearing:
//!
//! - Sequential: `{root}/{base}.m3u8` and `{root}/{base}{index}.ts`
//! - Fragmented: `{root}/{base}/{base}.mpd`, `init-stream{id}.m4s` for index 0
//!   and `chunk-stream{id}-{index:05}.m4s` for later indices

use super::jobs::{JobKind, StreamRequest};
use regex::Regex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Canonical manifest path a job writes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OutputTarget {
    manifest: PathBuf,
}

impl OutputTarget {
    pub fn new(manifest: impl Into<PathBuf>) -> Self {
        Self {
            manifest: manifest.into(),
        }
    }

    /// Derives the target for `request` under `root`. Requests that differ
    /// only in their start position map to the same target.
    pub fn for_request(root: &Path, request: &StreamRequest) -> Self {
        let mut hasher = DefaultHasher::new();
        request.media_source_id.hash(&mut hasher);
        request.device_id.hash(&mut hasher);
        request.play_session_id.hash(&mut hasher);
        request.video_codec.hash(&mut hasher);
        request.audio_codec.hash(&mut hasher);
        request.video_bitrate.hash(&mut hasher);
        request.audio_bitrate.hash(&mut hasher);
        request.segment_length.hash(&mut hasher);
        request.kind.hash(&mut hasher);
        request.stream_id.hash(&mut hasher);
        let base = format!("{:016x}", hasher.finish());

        let manifest_name = format!("{}.{}", base, request.kind.manifest_extension());
        let manifest = match request.kind {
            JobKind::Sequential => root.join(manifest_name),
            // The dash muxer writes its chunks next to the manifest with fixed
            // names, so every fragmented job gets a directory of its own.
            JobKind::Fragmented => root.join(&base).join(manifest_name),
        };
        Self { manifest }
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest
    }

    /// Directory holding the manifest and its segments.
    pub fn directory(&self) -> &Path {
        self.manifest.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Manifest file name without its extension.
    pub fn base_name(&self) -> &str {
        self.manifest
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
    }

    pub fn segment(&self, kind: JobKind, stream_id: u32, index: u64) -> SegmentDescriptor {
        let file_name = segment_file_name(kind, self.base_name(), stream_id, index);
        SegmentDescriptor {
            index,
            path: self.directory().join(file_name),
            extension: kind.segment_extension(),
        }
    }

    /// Inverse of [`OutputTarget::segment`]: the index encoded in
    /// `file_name`, if it names a segment of this target.
    pub fn parse_segment_index(&self, kind: JobKind, stream_id: u32, file_name: &str) -> Option<u64> {
        let extension = kind.segment_extension();
        let stem = file_name.strip_suffix(extension)?.strip_suffix('.')?;

        let digits = match kind {
            JobKind::Sequential => stem.strip_prefix(self.base_name())?,
            JobKind::Fragmented => {
                if stem == format!("init-stream{}", stream_id) {
                    return Some(0);
                }
                stem.strip_prefix(&format!("chunk-stream{}-", stream_id))?
            }
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.manifest.display())
    }
}

pub fn segment_file_name(kind: JobKind, base_name: &str, stream_id: u32, index: u64) -> String {
    let extension = kind.segment_extension();
    match kind {
        JobKind::Sequential => format!("{}{}.{}", base_name, index, extension),
        JobKind::Fragmented if index == 0 => format!("init-stream{}.{}", stream_id, extension),
        JobKind::Fragmented => format!("chunk-stream{}-{:05}.{}", stream_id, index, extension),
    }
}

/// A segment location derived from target, scheme and index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub index: u64,
    pub path: PathBuf,
    pub extension: &'static str,
}

impl SegmentDescriptor {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }
}

fn timeline_entry() -> &'static Regex {
    static ENTRY: OnceLock<Regex> = OnceLock::new();
    ENTRY.get_or_init(|| Regex::new(r"<S\s[^>]*>").expect("valid regex"))
}

fn repeat_count() -> &'static Regex {
    static REPEAT: OnceLock<Regex> = OnceLock::new();
    REPEAT.get_or_init(|| Regex::new(r#"\br="(-?\d+)""#).expect("valid regex"))
}

fn chunk_reference() -> &'static Regex {
    static CHUNK: OnceLock<Regex> = OnceLock::new();
    CHUNK.get_or_init(|| Regex::new(r"chunk-stream\d+-\d+\.\w+").expect("valid regex"))
}

/// Number of segments an encoder manifest reports as written.
///
/// Playlists list one `#EXTINF` per segment. Dash manifests either list
/// `<S>` timeline entries that may repeat through `r`, or name each chunk.
pub fn count_committed_segments(kind: JobKind, manifest: &str) -> usize {
    match kind {
        JobKind::Sequential => manifest
            .lines()
            .filter(|line| line.trim_start().starts_with("#EXTINF:"))
            .count(),
        JobKind::Fragmented => {
            let timeline: usize = timeline_entry()
                .find_iter(manifest)
                .map(|entry| {
                    let repeats = repeat_count()
                        .captures(entry.as_str())
                        .and_then(|caps| caps[1].parse::<i64>().ok())
                        .unwrap_or(0);
                    1 + repeats.max(0) as usize
                })
                .sum();
            timeline + chunk_reference().find_iter(manifest).count()
        }
    }
}
