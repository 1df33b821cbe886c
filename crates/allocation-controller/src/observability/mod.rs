//! Health and metrics surface, served on its own listener so probes keep
//! working even when the client-facing API is saturated.

pub mod health;

pub use health::{health_router, HealthState};
