use crate::domain::jobs::StreamRequest;
use crate::domain::segments::OutputTarget;
use async_trait::async_trait;
use std::io;

/// Handle to a running encoder process.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if the process is still known to the OS.
    fn id(&self) -> Option<u32>;

    fn has_exited(&self) -> bool;

    /// Kills the process and waits for it to go away.
    async fn kill(&self);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    /// Starts an encoder writing `target`'s manifest and segments, seeking the
    /// source to `start_ticks` first.
    async fn launch(
        &self,
        request: &StreamRequest,
        target: &OutputTarget,
        start_ticks: u64,
    ) -> io::Result<Box<dyn ProcessHandle>>;
}
