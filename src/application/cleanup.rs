//! Best-effort removal of stale segment files.

use crate::domain::jobs::JobKind;
use crate::domain::segments::OutputTarget;
use crate::ports::filesystem::FileSystem;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Total delete attempts before a stale file is abandoned.
pub const DELETE_ATTEMPTS: u32 = 5;

pub const DELETE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors worth retrying: the file is most likely still held open by the
/// encoder or a reader.
fn is_contention(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported
    )
}

/// Newest segment of `target` by last-write time, with its index.
pub async fn find_newest_segment(
    fs: &dyn FileSystem,
    target: &OutputTarget,
    kind: JobKind,
    stream_id: u32,
) -> Option<(u64, PathBuf)> {
    let entries = match fs.list_dir(target.directory()).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Could not list {}: {}", target.directory().display(), e);
            return None;
        }
    };

    let mut newest = None;
    for path in entries {
        let index = match path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| target.parse_segment_index(kind, stream_id, name))
        {
            Some(index) => index,
            None => continue,
        };
        let modified = match fs.last_write_time(&path).await {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        let is_newer = match &newest {
            Some((best_modified, best_index, _)) => (modified, index) > (*best_modified, *best_index),
            None => true,
        };
        if is_newer {
            newest = Some((modified, index, path));
        }
    }

    newest.map(|(_, index, path)| (index, path))
}

#[derive(Clone)]
pub struct CleanupManager {
    fs: Arc<dyn FileSystem>,
    retry_delay: Duration,
}

impl CleanupManager {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            retry_delay: DELETE_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Deletes `path`, retrying contended deletes. Never fails; returns
    /// whether a file was actually removed.
    pub async fn delete_stale_segment(&self, path: &Path) -> bool {
        for attempt in 1..=DELETE_ATTEMPTS {
            match self.fs.delete(path).await {
                Ok(()) => {
                    debug!("Deleted stale file {}", path.display());
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
                Err(e) if is_contention(&e) => {
                    warn!(
                        attempt,
                        "Could not delete {} yet: {}",
                        path.display(),
                        e
                    );
                    if attempt < DELETE_ATTEMPTS {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => {
                    error!("Error deleting {}: {}", path.display(), e);
                    return false;
                }
            }
        }

        error!(
            "Giving up on deleting {} after {} attempts",
            path.display(),
            DELETE_ATTEMPTS
        );
        false
    }

    /// Removes the most recently written segment of `target`, which is the
    /// one an interrupted encoder may have left half written.
    pub async fn delete_newest_segment(
        &self,
        target: &OutputTarget,
        kind: JobKind,
        stream_id: u32,
    ) -> Option<PathBuf> {
        let (index, path) = find_newest_segment(self.fs.as_ref(), target, kind, stream_id).await?;
        debug!(index, "Deleting last segment of {}", target);
        self.delete_stale_segment(&path).await.then_some(path)
    }

    /// Removes the manifest and every segment of `target`.
    pub async fn purge_target(&self, target: &OutputTarget, kind: JobKind, stream_id: u32) -> usize {
        let entries = self.fs.list_dir(target.directory()).await.unwrap_or_default();
        let mut removed = 0;
        for path in entries {
            let owned = path == target.manifest_path()
                || path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| target.parse_segment_index(kind, stream_id, name))
                    .is_some();
            if owned && self.delete_stale_segment(&path).await {
                removed += 1;
            }
        }
        removed
    }
}
