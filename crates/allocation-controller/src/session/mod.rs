//! The allocation session: state tables, quota rules, the single-consumer
//! admission pipeline, the connection registry, and the start-time scheduler.

pub mod pipeline;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use pipeline::{SessionActor, SessionHandle};
pub use registry::ConnectionRegistry;
pub use scheduler::SessionScheduler;
pub use state::{AllocationState, Phase};
