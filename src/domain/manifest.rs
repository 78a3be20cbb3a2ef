//! Master and media playlists served to adaptive-streaming clients.
//!
//! URL layout, relative to the stream root:
//! - `master.m3u8?{query}` lists `{variant}.m3u8?{query}` variants
//! - `{variant}.m3u8?{query}` lists `hls/{variant}/{index}.{ext}?{query}` segments

use super::hls::{MasterPlaylist, MediaPlaylist, SubtitleRendition, VariantStream};
use super::jobs::{is_copy_codec, JobKind, StreamRequest, SubtitleDeliveryMethod, TICKS_PER_SECOND};
use super::ladder;
use crate::error::RequestError;
use regex::Regex;
use std::sync::OnceLock;

pub const MAIN_VARIANT: &str = "main";

const SUBTITLE_GROUP: &str = "subs";

/// Whether lower renditions should be advertised next to the nominal one.
pub fn adaptive_streaming_enabled(request: &StreamRequest, is_local_network: bool) -> bool {
    if is_local_network || !request.enable_adaptive_bitrate {
        return false;
    }
    // Live and unknown-length sources are never laddered.
    if request.runtime_ticks.unwrap_or(0) == 0 {
        return false;
    }
    if is_copy_codec(&request.video_codec) || is_copy_codec(&request.audio_codec) {
        return false;
    }
    request.video_bitrate.is_some()
}

/// Query string describing `request`, carried by every manifest and
/// segment URL.
pub fn stream_query(request: &StreamRequest) -> String {
    let mut params: Vec<(&str, String)> = vec![
        ("mediaSourceId", request.media_source_id.clone()),
        ("deviceId", request.device_id.clone()),
        ("playSessionId", request.play_session_id.clone()),
        ("videoCodec", request.video_codec.clone()),
        ("audioCodec", request.audio_codec.clone()),
    ];
    if let Some(bitrate) = request.video_bitrate {
        params.push(("videoBitrate", bitrate.to_string()));
    }
    if let Some(bitrate) = request.audio_bitrate {
        params.push(("audioBitrate", bitrate.to_string()));
    }
    params.push(("segmentLength", request.segment_length.to_string()));
    params.push((
        "kind",
        match request.kind {
            JobKind::Sequential => "sequential",
            JobKind::Fragmented => "fragmented",
        }
        .to_string(),
    ));
    if request.kind == JobKind::Fragmented {
        params.push(("streamId", request.stream_id.to_string()));
    }
    if let Some(ticks) = request.runtime_ticks {
        params.push(("runtimeTicks", ticks.to_string()));
    }

    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn video_bitrate_param() -> &'static Regex {
    static PARAM: OnceLock<Regex> = OnceLock::new();
    PARAM.get_or_init(|| Regex::new(r"(?i)videobitrate=\d+").expect("valid regex"))
}

/// Rewrites the `videoBitrate` parameter of `url`.
pub fn replace_video_bitrate(url: &str, bitrate: u64) -> String {
    video_bitrate_param()
        .replace(url, format!("videoBitrate={}", bitrate).as_str())
        .into_owned()
}

fn codecs(request: &StreamRequest) -> Option<String> {
    let video = match request.video_codec.to_ascii_lowercase().as_str() {
        "h264" => "avc1.640028",
        "hevc" | "h265" => "hvc1.1.4.L120",
        "av1" => "av01.0.08M.08",
        _ => return None,
    };
    let audio = match request.audio_codec.to_ascii_lowercase().as_str() {
        "aac" => "mp4a.40.2",
        "ac3" => "ac-3",
        "eac3" => "ec-3",
        "mp3" => "mp4a.40.34",
        "opus" => "opus",
        "flac" => "fLaC",
        _ => return None,
    };
    Some(format!("{},{}", video, audio))
}

/// Renditions for text subtitles the caller resolved into the request. The
/// playlists behind these URIs are produced outside this crate.
fn subtitle_renditions(request: &StreamRequest, query: &str) -> Vec<SubtitleRendition> {
    if request.subtitle_method != SubtitleDeliveryMethod::Hls {
        return Vec::new();
    }
    request
        .subtitles
        .iter()
        .filter(|subtitle| subtitle.is_text)
        .map(|subtitle| SubtitleRendition {
            group_id: SUBTITLE_GROUP.to_string(),
            name: subtitle.name.clone(),
            language: subtitle.language.clone(),
            is_default: subtitle.is_default,
            is_forced: subtitle.is_forced,
            uri: format!("subtitles/{}.m3u8?{}", subtitle.index, query),
        })
        .collect()
}

pub fn master_manifest(request: &StreamRequest, is_local_network: bool) -> String {
    let query = stream_query(request);
    let playlist_url = format!("{}.m3u8?{}", MAIN_VARIANT, query);
    let subtitles = subtitle_renditions(request, &query);
    let subtitles_group = (!subtitles.is_empty()).then(|| SUBTITLE_GROUP.to_string());
    let codecs = codecs(request);
    let nominal = request.total_bitrate();

    let mut master = MasterPlaylist {
        subtitles,
        variants: vec![VariantStream {
            bandwidth: nominal,
            codecs: codecs.clone(),
            subtitles_group: subtitles_group.clone(),
            uri: playlist_url.clone(),
        }],
    };

    if adaptive_streaming_enabled(request, is_local_network) {
        let requested_video = request.video_bitrate.unwrap_or(0);
        for rendition in ladder::renditions(nominal) {
            master.variants.push(VariantStream {
                bandwidth: rendition.bitrate,
                codecs: codecs.clone(),
                subtitles_group: subtitles_group.clone(),
                uri: replace_video_bitrate(
                    &playlist_url,
                    requested_video.saturating_sub(rendition.step),
                ),
            });
        }
    }

    master.to_string()
}

/// Fixed-duration segment list covering the whole runtime. The last entry
/// carries the remainder.
pub fn media_manifest(request: &StreamRequest, variant: &str) -> Result<String, RequestError> {
    let query = stream_query(request);
    let segment_ticks = request.segment_ticks();
    let extension = request.kind.segment_extension();
    let first = request.kind.first_media_index();

    let mut playlist = MediaPlaylist::new(u64::from(request.segment_length.max(1)));
    playlist.media_sequence = first;
    // Keyframes are forced on every boundary unless the video is copied.
    playlist.independent_segments = !is_copy_codec(&request.video_codec);
    if request.kind == JobKind::Fragmented {
        playlist.version = 7;
        playlist.init_segment = Some(format!("hls/{}/0.{}?{}", variant, extension, query));
    }

    let count = match request.segment_count()? {
        Some(count) => count,
        None => {
            playlist.playlist_type = Some("EVENT".to_string());
            playlist.end_list = false;
            return Ok(playlist.to_string());
        }
    };
    playlist.playlist_type = Some("VOD".to_string());

    let runtime_ticks = request.runtime_ticks.unwrap_or_default();
    for ordinal in 0..count {
        let remaining = runtime_ticks - ordinal * segment_ticks;
        let duration = remaining.min(segment_ticks) as f64 / TICKS_PER_SECOND as f64;
        playlist.add_segment(
            duration,
            format!("hls/{}/{}.{}?{}", variant, first + ordinal, extension, query),
        );
    }

    Ok(playlist.to_string())
}
