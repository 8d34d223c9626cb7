//! Per-issue processing sessions and the publish/subscribe fabric that fans
//! agent events out to every connected viewer.

pub mod models;
pub mod registry;

pub use models::{
    Activity, ActivityStatus, ActivityType, ExecutionMetrics, ProcessingMode, ProcessingOptions,
    ProcessingSession, SessionStatus, SessionSummary, StreamEvent, StreamEventKind,
};
pub use registry::{RegistryConfig, SessionRegistry, Subscription};
