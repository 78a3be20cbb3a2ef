//! `ffmpeg` child processes writing HLS playlists or DASH manifests.

use crate::domain::jobs::{is_copy_codec, JobKind, StreamRequest, TICKS_PER_SECOND};
use crate::domain::segments::{segment_file_name, OutputTarget};
use crate::ports::encoder::{EncoderLauncher, ProcessHandle};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CHUNK_NAME: &str = "chunk-stream$RepresentationID$-$Number%05d$.m4s";
const PART_NAME: &str = "part-stream$RepresentationID$-$Number%05d$.m4s";

const RENUMBER_INTERVAL: Duration = Duration::from_millis(200);

fn part_file() -> &'static Regex {
    static PART: OnceLock<Regex> = OnceLock::new();
    PART.get_or_init(|| Regex::new(r"^part-stream(\d+)-(\d+)\.m4s$").expect("valid regex"))
}

/// The dash muxer always numbers chunks from 1. An encoder started at a
/// later index writes `part-stream` files instead, and each finished part
/// is renamed to the chunk name of the index it holds.
#[derive(Debug, Clone)]
pub struct ChunkRenumbering {
    directory: PathBuf,
    first_index: u64,
}

impl ChunkRenumbering {
    pub fn new(directory: impl Into<PathBuf>, first_index: u64) -> Self {
        Self {
            directory: directory.into(),
            first_index,
        }
    }

    /// Part numbers per representation, ascending.
    async fn parts(&self) -> io::Result<BTreeMap<u32, Vec<u64>>> {
        let mut parts: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(caps) = name.to_str().and_then(|name| part_file().captures(name)) else {
                continue;
            };
            if let (Ok(stream), Ok(number)) = (caps[1].parse(), caps[2].parse()) {
                parts.entry(stream).or_default().push(number);
            }
        }
        for numbers in parts.values_mut() {
            numbers.sort_unstable();
        }
        Ok(parts)
    }

    fn part_path(&self, stream: u32, number: u64) -> PathBuf {
        self.directory
            .join(format!("part-stream{}-{:05}.m4s", stream, number))
    }

    fn chunk_path(&self, stream: u32, number: u64) -> PathBuf {
        let index = self.first_index + number.saturating_sub(1);
        self.directory
            .join(segment_file_name(JobKind::Fragmented, "", stream, index))
    }

    /// Renames every finished part. While the encoder runs, the newest part
    /// of each representation is still being written. After an unclean exit
    /// it is incomplete and gets deleted.
    pub async fn renumber(&self, state: EncoderState) -> io::Result<usize> {
        let mut renamed = 0;
        for (stream, numbers) in self.parts().await? {
            let newest = numbers.last().copied();
            for number in numbers {
                let part = self.part_path(stream, number);
                if Some(number) == newest {
                    match state {
                        EncoderState::Running => continue,
                        EncoderState::Failed => {
                            tokio::fs::remove_file(&part).await?;
                            continue;
                        }
                        EncoderState::Finished => {}
                    }
                }
                tokio::fs::rename(&part, self.chunk_path(stream, number)).await?;
                renamed += 1;
            }
        }
        Ok(renamed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Running,
    Finished,
    Failed,
}

/// Running `ffmpeg` process. A background task owns the child and reaps it;
/// the handle only observes and signals it.
pub struct ChildProcess {
    pid: Option<u32>,
    stop: CancellationToken,
    exited: watch::Receiver<bool>,
}

impl ChildProcess {
    pub fn spawn(child: Child) -> Self {
        Self::supervise(child, None)
    }

    pub fn supervise(mut child: Child, renumbering: Option<ChunkRenumbering>) -> Self {
        let pid = child.id();
        let stop = CancellationToken::new();
        let (exited_tx, exited) = watch::channel(false);

        let token = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RENUMBER_INTERVAL);
            let state = loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if let Err(e) = child.kill().await {
                            warn!(pid = ?pid, "Could not kill encoder: {}", e);
                        }
                        break EncoderState::Failed;
                    }
                    status = child.wait() => break match status {
                        Ok(status) if status.success() => {
                            debug!(pid = ?pid, "Encoder finished");
                            EncoderState::Finished
                        }
                        Ok(status) => {
                            warn!(pid = ?pid, "Encoder exited with {}", status);
                            EncoderState::Failed
                        }
                        Err(e) => {
                            error!(pid = ?pid, "Error waiting for encoder: {}", e);
                            EncoderState::Failed
                        }
                    },
                    _ = ticker.tick(), if renumbering.is_some() => {
                        if let Some(renumbering) = &renumbering {
                            if let Err(e) = renumbering.renumber(EncoderState::Running).await {
                                warn!(pid = ?pid, "Could not renumber chunks: {}", e);
                            }
                        }
                    }
                }
            };
            if let Some(renumbering) = &renumbering {
                if let Err(e) = renumbering.renumber(state).await {
                    warn!(pid = ?pid, "Could not renumber final chunks: {}", e);
                }
            }
            let _ = exited_tx.send(true);
        });

        Self { pid, stop, exited }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        if self.has_exited() {
            None
        } else {
            self.pid
        }
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    async fn kill(&self) {
        self.stop.cancel();
        let mut exited = self.exited.clone();
        // Err means the reaper task is gone, which only happens after exit.
        let _ = exited.wait_for(|exited| *exited).await;
    }
}

fn path_is_valid(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn video_encoder(codec: &str) -> &str {
    match codec.to_ascii_lowercase().as_str() {
        "h264" => "libx264",
        "hevc" | "h265" => "libx265",
        "av1" => "libsvtav1",
        "vp9" => "libvpx-vp9",
        _ if is_copy_codec(codec) => "copy",
        _ => codec,
    }
}

fn format_seconds(ticks: u64) -> String {
    format!(
        "{}.{:03}",
        ticks / TICKS_PER_SECOND,
        (ticks % TICKS_PER_SECOND) / (TICKS_PER_SECOND / 1000)
    )
}

/// Chunk template for a dash encoder whose first media segment is
/// `first_index`.
fn media_seg_name(first_index: u64) -> &'static str {
    if first_index > JobKind::Fragmented.first_media_index() {
        PART_NAME
    } else {
        CHUNK_NAME
    }
}

pub struct FfmpegLauncher {
    ffmpeg_path: PathBuf,
    media_root: PathBuf,
}

impl FfmpegLauncher {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, media_root: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            media_root: media_root.into(),
        }
    }

    /// Source file for `request`, which must stay inside the media root.
    pub fn source_path(&self, request: &StreamRequest) -> io::Result<PathBuf> {
        let relative = Path::new(&request.media_source_id);
        if !path_is_valid(relative) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid media source {:?}", request.media_source_id),
            ));
        }
        Ok(self.media_root.join(relative))
    }

    pub fn build_args(
        &self,
        request: &StreamRequest,
        target: &OutputTarget,
        start_ticks: u64,
    ) -> io::Result<Vec<String>> {
        let source = self.source_path(request)?;
        let segment_length = request.segment_length.max(1).to_string();

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y"]
            .map(String::from)
            .to_vec();
        if start_ticks > 0 {
            args.push("-ss".into());
            args.push(format_seconds(start_ticks));
        }
        args.push("-i".into());
        args.push(source.to_string_lossy().into_owned());
        args.extend(["-map", "0:v:0?", "-map", "0:a:0?"].map(String::from));

        args.push("-c:v".into());
        args.push(video_encoder(&request.video_codec).to_string());
        if !is_copy_codec(&request.video_codec) {
            if let Some(bitrate) = request.video_bitrate {
                args.push("-b:v".into());
                args.push(bitrate.to_string());
            }
            // Keyframe at every segment boundary.
            args.push("-force_key_frames".into());
            args.push(format!("expr:gte(t,n_forced*{})", segment_length));
        }
        args.push("-c:a".into());
        args.push(request.audio_codec.clone());
        if let Some(bitrate) = request.audio_bitrate.filter(|_| !is_copy_codec(&request.audio_codec)) {
            args.push("-b:a".into());
            args.push(bitrate.to_string());
        }

        let first_index = request.start_segment.max(request.kind.first_media_index());
        let start_number = first_index.to_string();
        match request.kind {
            JobKind::Sequential => {
                let pattern = target
                    .directory()
                    .join(format!("{}%d.{}", target.base_name(), request.kind.segment_extension()));
                args.extend(
                    [
                        "-f",
                        "hls",
                        "-hls_time",
                        segment_length.as_str(),
                        "-hls_list_size",
                        "0",
                        "-hls_playlist_type",
                        "event",
                        "-start_number",
                        start_number.as_str(),
                        "-hls_segment_filename",
                    ]
                    .map(String::from),
                );
                args.push(pattern.to_string_lossy().into_owned());
            }
            JobKind::Fragmented => {
                args.extend(
                    [
                        "-f",
                        "dash",
                        "-seg_duration",
                        segment_length.as_str(),
                        "-use_template",
                        "1",
                        "-use_timeline",
                        "1",
                        "-init_seg_name",
                        "init-stream$RepresentationID$.m4s",
                        "-media_seg_name",
                    ]
                    .map(String::from),
                );
                args.push(media_seg_name(first_index).to_string());
            }
        }
        args.push(target.manifest_path().to_string_lossy().into_owned());
        Ok(args)
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(
        &self,
        request: &StreamRequest,
        target: &OutputTarget,
        start_ticks: u64,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let args = self.build_args(request, target, start_ticks)?;
        debug!("{} {}", self.ffmpeg_path.display(), args.join(" "));

        let child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        info!(pid = ?child.id(), start_ticks, "Spawned ffmpeg for {}", target);

        let first_index = request.start_segment.max(request.kind.first_media_index());
        let renumbering = (request.kind == JobKind::Fragmented
            && media_seg_name(first_index) == PART_NAME)
            .then(|| ChunkRenumbering::new(target.directory(), first_index));
        Ok(Box::new(ChildProcess::supervise(child, renumbering)))
    }
}
