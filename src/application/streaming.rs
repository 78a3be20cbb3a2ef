//! Entry points used by the HTTP layer.

use super::coordinator::StartCoordinator;
use super::registry::JobRegistry;
use crate::domain::jobs::{JobSummary, StreamRequest, TranscodeJob};
use crate::domain::manifest;
use crate::error::StreamError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A complete segment ready to be sent. Call [`SegmentDelivery::complete`]
/// once the client has received the whole file.
#[derive(Debug)]
pub struct SegmentDelivery {
    path: PathBuf,
    job: Option<Arc<TranscodeJob>>,
    registry: Arc<JobRegistry>,
    end_ticks: u64,
}

impl SegmentDelivery {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Playback position reached once this segment has been delivered.
    pub fn position_ticks(&self) -> u64 {
        self.end_ticks
    }

    /// Records the delivered position on the producing job, if any.
    pub fn complete(&self) {
        if let Some(job) = &self.job {
            let watermark = self.registry.advance_watermark(job, self.end_ticks);
            debug!(watermark, "Delivered {}", self.path.display());
        }
    }
}

pub struct StreamingService {
    coordinator: Arc<StartCoordinator>,
}

impl StreamingService {
    pub fn new(coordinator: Arc<StartCoordinator>) -> Self {
        Self { coordinator }
    }

    fn registry(&self) -> &JobRegistry {
        self.coordinator.registry()
    }

    pub fn master_manifest(&self, request: &StreamRequest, is_local_network: bool) -> String {
        manifest::master_manifest(request, is_local_network)
    }

    pub fn media_manifest(
        &self,
        request: &StreamRequest,
        variant: &str,
    ) -> Result<String, StreamError> {
        Ok(manifest::media_manifest(request, variant)?)
    }

    /// Waits until segment `index` can be served, starting or repositioning
    /// the encoder as needed.
    pub async fn segment(
        &self,
        request: &StreamRequest,
        index: u64,
        cancel: &CancellationToken,
    ) -> Result<SegmentDelivery, StreamError> {
        request.check_segment_index(index)?;

        for job in self.registry().prune_exited() {
            debug!(generation = job.generation, "Encoder for {} has finished", job.target);
        }

        let (segment, job) = self
            .coordinator
            .ensure_segment_servable(request, index, cancel)
            .await?;
        Ok(SegmentDelivery {
            path: segment.path,
            job,
            registry: self.coordinator.registry().clone(),
            end_ticks: request.start_ticks(index.saturating_add(1)),
        })
    }

    /// Stops every encoder started for the given device and play session,
    /// removing their output.
    pub async fn stop_session(&self, device_id: &str, play_session_id: &str) -> usize {
        let jobs: Vec<Arc<TranscodeJob>> = self
            .registry()
            .active_jobs()
            .into_iter()
            .filter(|job| job.belongs_to(device_id, play_session_id))
            .collect();
        if jobs.is_empty() {
            return 0;
        }

        let stopped = self
            .registry()
            .terminate_matching(|job| job.belongs_to(device_id, play_session_id), None)
            .await;
        for job in &jobs {
            let removed = self
                .coordinator
                .cleanup()
                .purge_target(&job.target, job.kind, job.stream_id)
                .await;
            debug!(removed, "Purged {}", job.target);
        }
        info!(stopped, device_id, play_session_id, "Stopped session");
        stopped
    }

    pub fn active_jobs(&self) -> Vec<JobSummary> {
        self.registry()
            .active_jobs()
            .iter()
            .map(|job| job.summary())
            .collect()
    }

    /// Kills every running encoder.
    pub async fn shutdown(&self) -> usize {
        let stopped = self.registry().terminate_all().await;
        info!(stopped, "Stopped all encoders");
        stopped
    }
}
