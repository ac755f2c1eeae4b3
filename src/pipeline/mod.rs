//! The streaming pipeline: generation, synthesis and playback stages
//! joined by gated handoffs.

pub mod coordinator;
pub mod generation;
pub mod handoff;
pub mod messages;
pub mod playback;
pub mod synthesis;

pub use coordinator::PipelineCoordinator;
pub use messages::{Completion, EndpointReason};
