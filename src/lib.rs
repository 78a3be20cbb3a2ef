//! Crooner - on-demand segmented transcoding
//!
//! Starts an encoder when a client asks for a segment that does not exist
//! yet, keeps at most one encoder per output, and serves segments once they
//! are complete on disk.
//!
//! Hexagonal Architecture:
//! - domain/: Pure logic (jobs, segment naming, bitrate ladder, playlists)
//! - ports/: Trait definitions (encoder process, filesystem)
//! - adapters/: Concrete implementations (local filesystem, ffmpeg, HTTP)
//! - application/: Registry, start coordination, waiting, cleanup
//! - config: Environment configuration
//!
//! # Features
//! - `local`: ffmpeg launcher, HTTP adapter and the `monolith` binary

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

pub use application::{JobRegistry, StartCoordinator, StreamingService};
pub use config::StreamingConfig;
pub use error::{RequestError, StreamError};
