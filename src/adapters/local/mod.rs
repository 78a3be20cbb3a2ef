//! Local adapters for monolith deployment.

#[cfg(feature = "local")]
pub mod ffmpeg;
pub mod fs;
#[cfg(feature = "local")]
pub mod http;

#[cfg(feature = "local")]
pub use ffmpeg::FfmpegLauncher;
pub use fs::LocalFs;
