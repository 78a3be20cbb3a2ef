//! Application layer - services built on the ports.

pub mod cleanup;
pub mod coordinator;
pub mod lock;
pub mod registry;
pub mod streaming;
pub mod waiter;

pub use coordinator::StartCoordinator;
pub use registry::JobRegistry;
pub use streaming::{SegmentDelivery, StreamingService};
