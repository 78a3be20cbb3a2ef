//! Domain layer - Pure business logic.

// HLS playlist model
pub mod hls;

pub mod jobs;
pub mod ladder;
pub mod manifest;
pub mod segments;
