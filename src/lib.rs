pub mod config;
pub mod coordinator;
pub mod error;
pub mod matcher;
pub mod storage;

pub use coordinator::{Busy, Confirm, Coordinator, Job, Outcome, Phase, Workflow};
pub use error::{Error, Result};
pub use matcher::{Decision, DistanceReport, NoMatchReason, Ranked};
pub use storage::{DescriptorStore, Loaded};

// Re-export vision types for convenience
pub use fprint_vision::{capture, normalize, Capture, Captured, Descriptor, Pipeline, RawImage};
