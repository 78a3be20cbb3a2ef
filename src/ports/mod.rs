//! Ports - Trait definitions for the collaborators the orchestration layer drives.

pub mod encoder;
pub mod filesystem;
