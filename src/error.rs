//! Errors surfaced to the request boundary.

use crate::domain::jobs::JobKind;
use crate::domain::segments::OutputTarget;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A live job already exists for the key being registered.
#[derive(Debug, Error)]
#[error("a live {kind:?} job is already registered for {target}")]
pub struct ConflictError {
    pub target: OutputTarget,
    pub kind: JobKind,
}

/// A request that can never be served, whatever the encoder state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("segment {index} is past the last segment {last}")]
    SegmentOutOfRange { index: u64, last: u64 },

    #[error("runtime splits into {count} segments, more than {max}")]
    TooManySegments { count: u64, max: u64 },
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("failed to launch encoder for {target}: {source}")]
    LaunchFailed {
        target: OutputTarget,
        #[source]
        source: io::Error,
    },

    #[error("segment {} never arrived", path.display())]
    SegmentNeverArrived { path: PathBuf },

    #[error(transparent)]
    Invalid(#[from] RequestError),

    #[error("request cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    /// Whether the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Conflict(_)
                | StreamError::LaunchFailed { .. }
                | StreamError::SegmentNeverArrived { .. }
        )
    }
}
