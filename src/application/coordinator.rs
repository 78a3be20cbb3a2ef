//! Decides, per segment request, whether the running encoder can serve it or
//! a new one has to be started at the requested position.
//!
//! Start decisions are made under a [`StartExclusion`] permit so that a
//! burst of requests for the same stream launches exactly one encoder. The
//! permit is dropped before the caller starts waiting for its segment.

use super::cleanup::{find_newest_segment, CleanupManager};
use super::lock::{GlobalStartLock, StartExclusion, StartPermit};
use super::registry::JobRegistry;
use super::waiter::{PollSettings, SegmentAvailabilityWaiter};
use crate::domain::jobs::{JobKind, StreamRequest, TranscodeJob};
use crate::domain::segments::{OutputTarget, SegmentDescriptor};
use crate::error::StreamError;
use crate::ports::encoder::EncoderLauncher;
use crate::ports::filesystem::FileSystem;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether a request for `requested` needs a fresh encoder given the newest
/// segment the current one has written.
pub fn restart_required(
    kind: JobKind,
    segment_length: u32,
    current: Option<u64>,
    requested: u64,
) -> bool {
    match current {
        None => true,
        Some(current) if requested < current => true,
        Some(current) => requested - current > kind.gap_threshold(segment_length),
    }
}

pub struct StartCoordinator {
    registry: Arc<JobRegistry>,
    launcher: Arc<dyn EncoderLauncher>,
    fs: Arc<dyn FileSystem>,
    cleanup: CleanupManager,
    waiter: SegmentAvailabilityWaiter,
    start_lock: Arc<dyn StartExclusion>,
    transcode_root: PathBuf,
}

impl StartCoordinator {
    pub fn new(
        registry: Arc<JobRegistry>,
        launcher: Arc<dyn EncoderLauncher>,
        fs: Arc<dyn FileSystem>,
        poll: PollSettings,
        transcode_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            launcher,
            cleanup: CleanupManager::new(fs.clone()),
            waiter: SegmentAvailabilityWaiter::new(fs.clone(), poll),
            fs,
            start_lock: Arc::new(GlobalStartLock::new()),
            transcode_root: transcode_root.into(),
        }
    }

    /// Replaces the default global lock, e.g. with a
    /// [`KeyedStartLock`](super::lock::KeyedStartLock).
    pub fn with_start_lock(mut self, start_lock: Arc<dyn StartExclusion>) -> Self {
        self.start_lock = start_lock;
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupManager) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn cleanup(&self) -> &CleanupManager {
        &self.cleanup
    }

    pub fn output_target(&self, request: &StreamRequest) -> OutputTarget {
        OutputTarget::for_request(&self.transcode_root, request)
    }

    /// Index of the newest segment written by the live job for `target`.
    /// `None` when there is no live job or it has written nothing yet.
    pub async fn current_encoded_index(
        &self,
        target: &OutputTarget,
        request: &StreamRequest,
    ) -> Option<u64> {
        let job = self.registry.lookup(target, request.kind)?;
        if job.has_exited() {
            return None;
        }
        find_newest_segment(self.fs.as_ref(), target, request.kind, request.stream_id)
            .await
            .map(|(index, _)| index)
    }

    /// Makes sure segment `index` of `request` is or will be produced and
    /// waits until it is complete on disk.
    pub async fn ensure_segment_servable(
        &self,
        request: &StreamRequest,
        index: u64,
        cancel: &CancellationToken,
    ) -> Result<(SegmentDescriptor, Option<Arc<TranscodeJob>>), StreamError> {
        let target = self.output_target(request);
        let segment = target.segment(request.kind, request.stream_id, index);

        let job = if self.fs.exists(&segment.path).await {
            debug!(index, "Segment already on disk for {}", target);
            self.registry.lookup(&target, request.kind)
        } else {
            let _permit = self.acquire(&target, cancel).await?;
            self.start_if_needed(request, &target, &segment, cancel)
                .await?
        };

        self.waiter
            .wait_for_segment(&segment, &target, request.kind, job.as_deref(), cancel)
            .await?;
        Ok((segment, job))
    }

    async fn acquire(
        &self,
        target: &OutputTarget,
        cancel: &CancellationToken,
    ) -> Result<StartPermit, StreamError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(StreamError::Cancelled),
            permit = self.start_lock.acquire(target) => Ok(permit),
        }
    }

    /// Runs with the start permit held.
    async fn start_if_needed(
        &self,
        request: &StreamRequest,
        target: &OutputTarget,
        segment: &SegmentDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<TranscodeJob>>, StreamError> {
        // Another request may have started the encoder while we queued.
        if self.fs.exists(&segment.path).await {
            return Ok(self.registry.lookup(target, request.kind));
        }

        let current = self.current_encoded_index(target, request).await;
        if !restart_required(request.kind, request.segment_length, current, segment.index) {
            debug!(
                requested = segment.index,
                current = ?current,
                "Encoder for {} is close enough",
                target
            );
            return Ok(self.registry.lookup(target, request.kind));
        }

        if let Some(current) = current {
            info!(
                requested = segment.index,
                current, "Seek outside encoder window for {}, restarting", target
            );
        }
        let job = self
            .start_job(request, target, segment.index, current.is_some(), cancel)
            .await?;
        Ok(Some(job))
    }

    async fn start_job(
        &self,
        request: &StreamRequest,
        target: &OutputTarget,
        index: u64,
        interrupted: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<TranscodeJob>, StreamError> {
        let terminated = self
            .registry
            .terminate_matching(
                |job| {
                    job.target == *target
                        || job.belongs_to(&request.device_id, &request.play_session_id)
                },
                None,
            )
            .await;
        if terminated > 0 {
            debug!(terminated, "Stopped previous encoders for {}", target);
        }

        if interrupted {
            self.cleanup
                .delete_newest_segment(target, request.kind, request.stream_id)
                .await;
        }
        // The old manifest would satisfy the readiness check below.
        self.cleanup.delete_stale_segment(target.manifest_path()).await;
        self.fs.create_dir_all(target.directory()).await?;

        let start_ticks = request.start_ticks(index);
        let positioned = request.starting_at(index);
        let process = match self.launcher.launch(&positioned, target, start_ticks).await {
            Ok(process) => process,
            Err(source) => {
                warn!("Encoder launch failed for {}: {}", target, source);
                self.cleanup.delete_stale_segment(target.manifest_path()).await;
                return Err(StreamError::LaunchFailed {
                    target: target.clone(),
                    source,
                });
            }
        };

        let generation = self.registry.next_generation(target, request.kind);
        let job = Arc::new(TranscodeJob::new(
            target.clone(),
            &positioned,
            generation,
            process,
        ));
        if let Err(conflict) = self.registry.register(job.clone()) {
            job.kill().await;
            return Err(conflict.into());
        }
        info!(
            generation,
            start_ticks,
            pid = ?job.pid(),
            "Started encoder for {}",
            target
        );

        match self
            .waiter
            .wait_for_minimum_segments(target, request.kind, 1, &job, cancel)
            .await
        {
            Ok(()) => Ok(job),
            // Other requests may still want this encoder.
            Err(StreamError::Cancelled) => Err(StreamError::Cancelled),
            Err(e) => {
                self.registry.remove(&job);
                job.kill().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::local::fs::LocalFs;
    use crate::domain::jobs::TICKS_PER_SECOND;
    use crate::ports::encoder::{MockEncoderLauncher, MockProcessHandle, ProcessHandle};
    use std::fs::File;
    use std::io;
    use std::path::Path;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn fast() -> PollSettings {
        PollSettings {
            existence_interval: Duration::from_millis(5),
            poll_interval: Duration::from_millis(5),
            stable_polls: 3,
            timeout: Some(Duration::from_secs(5)),
        }
    }

    fn request() -> StreamRequest {
        let mut request = StreamRequest::new("movie.mkv");
        request.device_id = "tv".to_string();
        request.play_session_id = "s1".to_string();
        request
    }

    fn running_process(kills: usize) -> Box<dyn ProcessHandle> {
        let mut process = MockProcessHandle::new();
        process.expect_has_exited().return_const(false);
        process.expect_id().return_const(None);
        process.expect_kill().times(kills).returning(|| ());
        Box::new(process)
    }

    /// Simulates an encoder that has produced segment `index`.
    fn write_segment(target: &OutputTarget, index: u64) {
        let segment = target.segment(JobKind::Sequential, 0, index);
        std::fs::write(&segment.path, vec![0u8; 188]).unwrap();
        std::fs::write(
            target.manifest_path(),
            format!("#EXTM3U\n#EXTINF:6.000000,\n{}\n", segment.file_name()),
        )
        .unwrap();
    }

    fn touch(path: &Path, age_secs: u64) {
        let file = File::create(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    fn coordinator(root: &Path, launcher: MockEncoderLauncher) -> StartCoordinator {
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFs::new());
        StartCoordinator::new(
            Arc::new(JobRegistry::new()),
            Arc::new(launcher),
            fs.clone(),
            fast(),
            root,
        )
        .with_cleanup(CleanupManager::new(fs).with_retry_delay(Duration::from_millis(1)))
    }

    /// Registers a live job that has written `indices` (oldest first).
    fn seed_running_job(coordinator: &StartCoordinator, indices: &[u64], kills: usize) {
        let target = coordinator.output_target(&request());
        let count = indices.len() as u64;
        for (age, index) in (0..count).rev().zip(indices) {
            let segment = target.segment(JobKind::Sequential, 0, *index);
            touch(&segment.path, age + 1);
        }
        let generation = coordinator.registry.next_generation(&target, JobKind::Sequential);
        let job = TranscodeJob::new(target, &request(), generation, running_process(kills));
        coordinator.registry.register(Arc::new(job)).unwrap();
    }

    #[test]
    fn test_restart_thresholds() {
        assert!(restart_required(JobKind::Sequential, 6, None, 0));
        assert!(!restart_required(JobKind::Sequential, 6, Some(10), 10));
        assert!(!restart_required(JobKind::Sequential, 6, Some(10), 14));
        assert!(restart_required(JobKind::Sequential, 6, Some(10), 15));
        assert!(restart_required(JobKind::Sequential, 6, Some(10), 9));
        assert!(!restart_required(JobKind::Fragmented, 2, Some(3), 7));
        assert!(restart_required(JobKind::Fragmented, 2, Some(3), 8));
    }

    #[tokio::test]
    async fn test_concurrent_requests_start_one_encoder() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|_, target, start_ticks| {
                assert_eq!(start_ticks, 0);
                write_segment(target, 0);
                Ok(running_process(0))
            });
        let coordinator = Arc::new(coordinator(dir.path(), launcher));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .ensure_segment_servable(&request(), 0, &CancellationToken::new())
                    .await
            }));
        }
        for handle in handles {
            let (segment, _) = handle.await.unwrap().unwrap();
            assert_eq!(segment.index, 0);
        }
        assert_eq!(coordinator.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_small_gap_reuses_encoder() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher.expect_launch().times(0);
        let coordinator = coordinator(dir.path(), launcher);
        seed_running_job(&coordinator, &[0, 1, 2], 0);

        let target = coordinator.output_target(&request());
        let writer = {
            let target = target.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                write_segment(&target, 6);
            })
        };

        let (segment, job) = coordinator
            .ensure_segment_servable(&request(), 6, &CancellationToken::new())
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(segment.index, 6);
        assert_eq!(job.map(|job| job.generation), Some(1));
    }

    #[tokio::test]
    async fn test_large_gap_restarts_encoder() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|request, target, start_ticks| {
                assert_eq!(request.start_segment, 7);
                assert_eq!(start_ticks, 7 * 6 * TICKS_PER_SECOND);
                write_segment(target, 7);
                Ok(running_process(0))
            });
        let coordinator = coordinator(dir.path(), launcher);
        seed_running_job(&coordinator, &[0, 1, 2], 1);

        let (_, job) = coordinator
            .ensure_segment_servable(&request(), 7, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(job.map(|job| job.generation), Some(2));
        assert_eq!(coordinator.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_backward_seek_restarts_at_requested_position() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|_, target, start_ticks| {
                assert_eq!(start_ticks, 6 * TICKS_PER_SECOND);
                write_segment(target, 1);
                Ok(running_process(0))
            });
        let coordinator = coordinator(dir.path(), launcher);
        seed_running_job(&coordinator, &[3, 4, 5], 1);

        let target = coordinator.output_target(&request());
        let newest = target.segment(JobKind::Sequential, 0, 5).path;
        let older = target.segment(JobKind::Sequential, 0, 3).path;

        coordinator
            .ensure_segment_servable(&request(), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!newest.exists());
        assert!(older.exists());
    }

    #[tokio::test]
    async fn test_existing_segment_skips_start() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher.expect_launch().times(0);
        let coordinator = coordinator(dir.path(), launcher);
        let target = coordinator.output_target(&request());
        write_segment(&target, 3);

        let (segment, job) = coordinator
            .ensure_segment_servable(&request(), 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(segment.path, target.segment(JobKind::Sequential, 0, 3).path);
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn test_launch_failure_releases_lock() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|_, _, _| Err(io::Error::new(io::ErrorKind::NotFound, "no ffmpeg")));
        let coordinator = coordinator(dir.path(), launcher);

        let result = coordinator
            .ensure_segment_servable(&request(), 0, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StreamError::LaunchFailed { .. })));
        assert!(coordinator.registry.is_empty());

        let target = coordinator.output_target(&request());
        let permit = tokio::time::timeout(
            Duration::from_millis(100),
            coordinator.start_lock.acquire(&target),
        )
        .await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_while_queued_for_lock() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher.expect_launch().times(0);
        let coordinator = coordinator(dir.path(), launcher);
        let target = coordinator.output_target(&request());
        let _held = coordinator.start_lock.acquire(&target).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = coordinator
            .ensure_segment_servable(&request(), 0, &cancel)
            .await;
        assert!(matches!(result, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn test_encoder_exiting_early_is_unregistered() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher.expect_launch().times(1).returning(|_, _, _| {
            let mut process = MockProcessHandle::new();
            process.expect_has_exited().return_const(true);
            process.expect_id().return_const(None);
            process.expect_kill().returning(|| ());
            Ok(Box::new(process) as Box<dyn ProcessHandle>)
        });
        let coordinator = coordinator(dir.path(), launcher);

        let result = coordinator
            .ensure_segment_servable(&request(), 0, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StreamError::SegmentNeverArrived { .. })));
        assert!(coordinator.registry.is_empty());
    }

    #[tokio::test]
    async fn test_bitrate_switch_replaces_session_encoder() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .withf(|request, _, _| request.video_bitrate == Some(3_000_000))
            .returning(|_, target, _| {
                write_segment(target, 0);
                Ok(running_process(1))
            });
        launcher
            .expect_launch()
            .times(1)
            .withf(|request, _, _| request.video_bitrate == Some(1_500_000))
            .returning(|_, target, _| {
                write_segment(target, 0);
                Ok(running_process(0))
            });
        let coordinator = coordinator(dir.path(), launcher);

        let mut high = request();
        high.video_bitrate = Some(3_000_000);
        let mut low = request();
        low.video_bitrate = Some(1_500_000);
        let high_target = coordinator.output_target(&high);
        let low_target = coordinator.output_target(&low);
        assert_ne!(high_target, low_target);

        let cancel = CancellationToken::new();
        let (_, first) = coordinator
            .ensure_segment_servable(&high, 0, &cancel)
            .await
            .unwrap();
        let (_, second) = coordinator
            .ensure_segment_servable(&low, 0, &cancel)
            .await
            .unwrap();

        assert_eq!(first.map(|job| job.target.clone()), Some(high_target.clone()));
        assert_eq!(second.map(|job| job.target.clone()), Some(low_target.clone()));
        assert_eq!(coordinator.registry.len(), 1);
        assert!(coordinator.registry.lookup(&high_target, JobKind::Sequential).is_none());
        assert!(coordinator.registry.lookup(&low_target, JobKind::Sequential).is_some());
    }

    #[tokio::test]
    async fn test_fragmented_backward_seek_skips_init_segment() {
        let dir = tempdir().unwrap();
        let mut launcher = MockEncoderLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|request, target, start_ticks| {
                assert_eq!(request.start_segment, 5);
                // Media segment 5 covers [24s, 30s): index 0 is the init segment.
                assert_eq!(start_ticks, 4 * 6 * TICKS_PER_SECOND);
                let segment = target.segment(JobKind::Fragmented, 0, 5);
                std::fs::write(&segment.path, vec![0u8; 188]).unwrap();
                std::fs::write(
                    target.manifest_path(),
                    format!(r#"<SegmentList><SegmentURL media="{}" /></SegmentList>"#, segment.file_name()),
                )
                .unwrap();
                Ok(running_process(0))
            });
        let coordinator = coordinator(dir.path(), launcher);

        let mut fragmented = request();
        fragmented.kind = JobKind::Fragmented;
        let target = coordinator.output_target(&fragmented);
        std::fs::create_dir_all(target.directory()).unwrap();
        for (age, index) in [(3, 6), (2, 7), (1, 8)] {
            touch(&target.segment(JobKind::Fragmented, 0, index).path, age);
        }
        let generation = coordinator.registry.next_generation(&target, JobKind::Fragmented);
        let seeded = TranscodeJob::new(target.clone(), &fragmented, generation, running_process(1));
        coordinator.registry.register(Arc::new(seeded)).unwrap();

        let (segment, job) = coordinator
            .ensure_segment_servable(&fragmented, 5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(segment.file_name(), "chunk-stream0-00005.m4s");
        assert_eq!(job.map(|job| job.generation), Some(2));
        assert!(!target.segment(JobKind::Fragmented, 0, 8).path.exists());
    }
}
