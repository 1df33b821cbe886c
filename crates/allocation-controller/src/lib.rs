//! Allocation Controller Service Library
//!
//! A real-time, first-come-first-served allocation service for a fixed
//! inventory of location-tagged resources. Claimants hold persistent
//! WebSocket connections, identified by opaque pre-issued tokens, and race to
//! claim resources the moment the session opens.
//!
//! # Architecture
//!
//! Every state-changing request flows through a single-consumer admission
//! pipeline:
//!
//! ```text
//! connection tasks ──┐
//!                    ├──> unbounded FIFO mailbox ──> SessionActor
//! scheduler ─────────┘                                │
//!                                                     │ owns AllocationState
//!                          ConnectionRegistry <───────┘ (replies, fan-outs)
//! ```
//!
//! The `SessionActor` exclusively owns the inventory, the claimant counters,
//! and the session phase, so admission decisions are serialized without a
//! lock and contended claims resolve purely by mailbox arrival order. The
//! scheduler's phase transitions travel through the same mailbox, which is
//! what gates early claims.
//!
//! # Key Design Decisions
//!
//! - **One connection per claimant**: a new connection for the same token
//!   replaces and closes the old one
//! - **Best-effort delivery**: offline or slow claimants lose messages;
//!   nothing ever blocks the pipeline on a socket
//! - **Fixed quota order**: already-claimed, then global cap, then off-home
//!   cap, then per-location cap
//! - **Static catalog**: locations, resources, and claimants are loaded once
//!   at boot and never change
//!
//! # Modules
//!
//! - [`catalog`] - Boot-time loading and validation of the two JSON documents
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types
//! - [`session`] - State tables, quota rules, pipeline, registry, scheduler
//! - [`server`] - WebSocket endpoint and operator HTTP endpoints
//! - [`observability`] - Health probes

pub mod catalog;
pub mod config;
pub mod errors;
pub mod observability;
pub mod server;
pub mod session;
