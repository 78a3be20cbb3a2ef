//! Configuration for the local/monolith deployment.

use crate::application::waiter::PollSettings;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration, read from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct StreamingConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Directory holding source media, resolved against `mediaSourceId`
    pub media_dir: String,
    /// Directory for manifests and segments written by the encoder
    pub transcode_dir: String,
    /// Encoder binary
    pub ffmpeg_path: String,
    /// Upper bound for a single segment wait; 0 disables it
    pub segment_wait_timeout_secs: u64,
    pub existence_poll_ms: u64,
    pub size_poll_ms: u64,
    /// Consecutive unchanged size samples before a segment counts as complete
    pub stable_polls: u32,
    /// One lock per output target instead of one for all starts
    pub per_target_start_lock: bool,
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl StreamingConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("127.0.0.1")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("3000")),
            media_dir: env::var("MEDIA_DIR").unwrap_or_else(|_| String::from("./")),
            transcode_dir: env::var("TRANSCODE_DIR")
                .unwrap_or_else(|_| String::from("./transcodes")),
            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| String::from("ffmpeg")),
            segment_wait_timeout_secs: parse_or("SEGMENT_WAIT_TIMEOUT_SECS", 30 * 60),
            existence_poll_ms: parse_or("EXISTENCE_POLL_MS", 50),
            size_poll_ms: parse_or("SIZE_POLL_MS", 100),
            stable_polls: parse_or("STABLE_POLLS", 10),
            per_target_start_lock: parse_or("PER_TARGET_START_LOCK", false),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            existence_interval: Duration::from_millis(self.existence_poll_ms),
            poll_interval: Duration::from_millis(self.size_poll_ms),
            stable_polls: self.stable_polls,
            timeout: (self.segment_wait_timeout_secs > 0)
                .then(|| Duration::from_secs(self.segment_wait_timeout_secs)),
        }
    }
}
