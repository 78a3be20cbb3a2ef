//! Cooperative polling until a segment written by a running encoder is
//! complete.
//!
//! A segment counts as complete once its file name shows up in the job's
//! manifest, or once its size has stopped changing for a number of polls.
//! Every loop observes the request's cancellation token and an optional
//! overall timeout.

use crate::domain::jobs::{JobKind, TranscodeJob};
use crate::domain::segments::{count_committed_segments, OutputTarget, SegmentDescriptor};
use crate::error::StreamError;
use crate::ports::filesystem::FileSystem;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct PollSettings {
    /// Interval between checks for a segment file to appear.
    pub existence_interval: Duration,
    /// Interval between manifest reads and size samples.
    pub poll_interval: Duration,
    /// Consecutive unchanged size samples that mark a segment complete.
    pub stable_polls: u32,
    /// Upper bound for any single wait; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            existence_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(100),
            stable_polls: 10,
            timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

pub struct SegmentAvailabilityWaiter {
    fs: Arc<dyn FileSystem>,
    settings: PollSettings,
}

impl SegmentAvailabilityWaiter {
    pub fn new(fs: Arc<dyn FileSystem>, settings: PollSettings) -> Self {
        Self { fs, settings }
    }

    fn deadline(&self) -> Option<Instant> {
        self.settings.timeout.map(|timeout| Instant::now() + timeout)
    }

    /// Sleeps for `interval` unless the request is cancelled or the deadline
    /// has passed.
    async fn pause(
        &self,
        interval: Duration,
        deadline: Option<Instant>,
        waiting_for: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!("Timed out waiting for {}", waiting_for.display());
            return Err(StreamError::SegmentNeverArrived {
                path: waiting_for.to_path_buf(),
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(StreamError::Cancelled),
            _ = tokio::time::sleep(interval) => Ok(()),
        }
    }

    async fn wait_for_existence(
        &self,
        path: &Path,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            if self.fs.exists(path).await {
                return Ok(());
            }
            self.pause(self.settings.existence_interval, deadline, path, cancel)
                .await?;
        }
    }

    async fn manifest_lists(&self, target: &OutputTarget, kind: JobKind, file_name: &str) -> bool {
        let text = match self.fs.read_shared(target.manifest_path()).await {
            Ok(text) => text,
            Err(e) => {
                debug!("Manifest {} not readable yet: {}", target, e);
                return false;
            }
        };
        match kind {
            JobKind::Sequential => text.lines().any(|line| line.contains(file_name)),
            JobKind::Fragmented => text.contains(file_name),
        }
    }

    /// Blocks until `segment` is complete.
    ///
    /// With no job, or a job that already exited, the manifest will not
    /// change any more and only size stability is used.
    pub async fn wait_for_segment(
        &self,
        segment: &SegmentDescriptor,
        target: &OutputTarget,
        kind: JobKind,
        job: Option<&TranscodeJob>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let deadline = self.deadline();
        self.wait_for_existence(&segment.path, deadline, cancel)
            .await?;

        let check_manifest = job.is_some_and(|job| !job.has_exited());
        let file_name = segment.file_name();
        let mut last_size = None;
        let mut stable = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            if check_manifest && self.manifest_lists(target, kind, file_name).await {
                debug!(index = segment.index, "Segment listed in {}", target);
                return Ok(());
            }

            match self.fs.size(&segment.path).await {
                Ok(size) if last_size == Some(size) => stable += 1,
                Ok(size) => {
                    last_size = Some(size);
                    stable = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Segment {} disappeared while waiting", segment.path.display());
                    return Err(StreamError::SegmentNeverArrived {
                        path: segment.path.clone(),
                    });
                }
                Err(e) => debug!("Could not stat {}: {}", segment.path.display(), e),
            }

            if stable >= self.settings.stable_polls {
                debug!(index = segment.index, "Segment size settled");
                return Ok(());
            }

            self.pause(self.settings.poll_interval, deadline, &segment.path, cancel)
                .await?;
        }
    }

    /// Blocks until `target`'s manifest lists at least `minimum` segments.
    /// Fails once the job has exited without getting there.
    pub async fn wait_for_minimum_segments(
        &self,
        target: &OutputTarget,
        kind: JobKind,
        minimum: usize,
        job: &TranscodeJob,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let deadline = self.deadline();
        let manifest = target.manifest_path();

        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            // Sampled before reading so a job that exits right after its
            // last write is still given credit for it.
            let exited = job.has_exited();
            let committed = match self.fs.read_shared(manifest).await {
                Ok(text) => count_committed_segments(kind, &text),
                Err(_) => 0,
            };
            if committed >= minimum {
                debug!(committed, "Manifest {} is ready", target);
                return Ok(());
            }
            if exited {
                warn!(committed, minimum, "Encoder for {} exited early", target);
                return Err(StreamError::SegmentNeverArrived {
                    path: manifest.to_path_buf(),
                });
            }
            self.pause(self.settings.poll_interval, deadline, manifest, cancel)
                .await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::local::fs::LocalFs;
    use crate::domain::jobs::StreamRequest;
    use crate::ports::encoder::MockProcessHandle;
    use crate::ports::filesystem::MockFileSystem;
    use std::io::Write;
    use tempfile::tempdir;

    fn fast() -> PollSettings {
        PollSettings {
            existence_interval: Duration::from_millis(5),
            poll_interval: Duration::from_millis(5),
            stable_polls: 3,
            timeout: Some(Duration::from_secs(5)),
        }
    }

    fn job(target: &OutputTarget, exited: bool) -> TranscodeJob {
        let mut process = MockProcessHandle::new();
        process.expect_has_exited().return_const(exited);
        TranscodeJob::new(
            target.clone(),
            &StreamRequest::new("movie.mkv"),
            1,
            Box::new(process),
        )
    }

    #[tokio::test]
    async fn test_listed_segment_skips_size_checks() {
        let target = OutputTarget::new("/t/abc.m3u8");
        let segment = target.segment(JobKind::Sequential, 0, 3);

        let mut fs = MockFileSystem::new();
        fs.expect_exists().returning(|_| true);
        fs.expect_read_shared()
            .returning(|_| Ok("#EXTM3U\n#EXTINF:6.000000,\nabc2.ts\n#EXTINF:6.000000,\nabc3.ts\n".to_string()));
        fs.expect_size().times(0);

        let waiter = SegmentAvailabilityWaiter::new(Arc::new(fs), fast());
        let job = job(&target, false);
        waiter
            .wait_for_segment(&segment, &target, JobKind::Sequential, Some(&job), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exited_job_uses_size_stability_only() {
        let dir = tempdir().unwrap();
        let target = OutputTarget::new(dir.path().join("abc.m3u8"));
        let segment = target.segment(JobKind::Sequential, 0, 0);
        std::fs::write(&segment.path, vec![0u8; 376]).unwrap();

        let mut fs = MockFileSystem::new();
        fs.expect_exists().returning(|_| true);
        fs.expect_read_shared().times(0);
        fs.expect_size().times(4).returning(|_| Ok(376));

        let waiter = SegmentAvailabilityWaiter::new(Arc::new(fs), fast());
        let job = job(&target, true);
        waiter
            .wait_for_segment(&segment, &target, JobKind::Sequential, Some(&job), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_growth_resets_stability() {
        let target = OutputTarget::new("/t/abc.m3u8");
        let segment = target.segment(JobKind::Sequential, 0, 0);

        let mut fs = MockFileSystem::new();
        fs.expect_exists().returning(|_| true);
        let mut seq = mockall::Sequence::new();
        for size in [100u64, 100, 200, 200, 200, 200] {
            fs.expect_size()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(size));
        }

        let waiter = SegmentAvailabilityWaiter::new(Arc::new(fs), fast());
        waiter
            .wait_for_segment(&segment, &target, JobKind::Sequential, None, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waits_for_file_to_appear() {
        let dir = tempdir().unwrap();
        let target = OutputTarget::new(dir.path().join("abc.m3u8"));
        let segment = target.segment(JobKind::Sequential, 0, 1);

        let path = segment.path.clone();
        let manifest = target.manifest_path().to_path_buf();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            std::fs::write(&path, b"segment").unwrap();
            let mut playlist = std::fs::File::create(&manifest).unwrap();
            writeln!(playlist, "#EXTM3U\n#EXTINF:6.000000,\nabc1.ts").unwrap();
        });

        let waiter = SegmentAvailabilityWaiter::new(Arc::new(LocalFs::new()), fast());
        let job = job(&target, false);
        waiter
            .wait_for_segment(&segment, &target, JobKind::Sequential, Some(&job), &CancellationToken::new())
            .await
            .unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_vanished_segment_never_arrives() {
        let target = OutputTarget::new("/t/abc.m3u8");
        let segment = target.segment(JobKind::Sequential, 0, 0);

        let mut fs = MockFileSystem::new();
        fs.expect_exists().returning(|_| true);
        fs.expect_size()
            .returning(|_| Err(io::Error::new(io::ErrorKind::NotFound, "deleted")));

        let waiter = SegmentAvailabilityWaiter::new(Arc::new(fs), fast());
        let result = waiter
            .wait_for_segment(&segment, &target, JobKind::Sequential, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StreamError::SegmentNeverArrived { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let target = OutputTarget::new("/t/abc.m3u8");
        let segment = target.segment(JobKind::Sequential, 0, 0);

        let mut fs = MockFileSystem::new();
        fs.expect_exists().returning(|_| false);
        let mut settings = fast();
        settings.timeout = None;
        let waiter = SegmentAvailabilityWaiter::new(Arc::new(fs), settings);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            waiter.wait_for_segment(&segment, &target, JobKind::Sequential, None, &cancel),
        )
        .await
        .expect("cancellation should end the wait");
        assert!(matches!(result, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn test_timeout_reports_never_arrived() {
        let target = OutputTarget::new("/t/abc.m3u8");
        let segment = target.segment(JobKind::Sequential, 0, 0);

        let mut fs = MockFileSystem::new();
        fs.expect_exists().returning(|_| false);
        let mut settings = fast();
        settings.timeout = Some(Duration::from_millis(30));
        let waiter = SegmentAvailabilityWaiter::new(Arc::new(fs), settings);

        let result = waiter
            .wait_for_segment(&segment, &target, JobKind::Sequential, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StreamError::SegmentNeverArrived { .. })));
    }

    #[tokio::test]
    async fn test_fragmented_manifest_read_whole() {
        let target = OutputTarget::new("/t/abc/abc.mpd");
        let segment = target.segment(JobKind::Fragmented, 0, 2);

        let mut fs = MockFileSystem::new();
        fs.expect_exists().returning(|_| true);
        fs.expect_read_shared().returning(|_| {
            Ok(r#"<MPD><SegmentURL media="chunk-stream0-00002.m4s"/></MPD>"#.to_string())
        });
        fs.expect_size().times(0);

        let waiter = SegmentAvailabilityWaiter::new(Arc::new(fs), fast());
        let job = job(&target, false);
        waiter
            .wait_for_segment(&segment, &target, JobKind::Fragmented, Some(&job), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_minimum_segments_reached() {
        let target = OutputTarget::new("/t/abc.m3u8");
        let mut fs = MockFileSystem::new();
        let mut seq = mockall::Sequence::new();
        fs.expect_read_shared()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(io::Error::new(io::ErrorKind::NotFound, "not yet")));
        fs.expect_read_shared()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("#EXTM3U\n#EXTINF:6.000000,\nabc0.ts\n".to_string()));

        let waiter = SegmentAvailabilityWaiter::new(Arc::new(fs), fast());
        let job = job(&target, false);
        waiter
            .wait_for_minimum_segments(&target, JobKind::Sequential, 1, &job, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_minimum_segments_job_exited() {
        let target = OutputTarget::new("/t/abc.m3u8");
        let mut fs = MockFileSystem::new();
        fs.expect_read_shared()
            .times(1)
            .returning(|_| Ok("#EXTM3U\n".to_string()));

        let waiter = SegmentAvailabilityWaiter::new(Arc::new(fs), fast());
        let job = job(&target, true);
        let result = waiter
            .wait_for_minimum_segments(&target, JobKind::Sequential, 1, &job, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StreamError::SegmentNeverArrived { .. })));
    }
}
