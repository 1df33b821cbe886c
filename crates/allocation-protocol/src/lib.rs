//! Wire protocol for the allocation controller.
//!
//! Messages are exchanged as JSON text frames over a persistent WebSocket,
//! tagged with a `type` field. The server speaks [`ServerMessage`], clients
//! speak [`ClientMessage`]. Both sides must treat unknown fields as ignorable;
//! an unknown message `type` from a client is a protocol error and is answered
//! with [`ServerMessage::ProtocolError`] on that connection only.
//!
//! Claimant identities (opaque secret tokens) never appear in any
//! server-to-client payload: resource views are claimant-stripped, and the
//! personalized parts of [`ServerMessage::Start`] describe only the receiving
//! claimant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Machine-readable reasons a claim is rejected.
///
/// The variants mirror the fixed evaluation order of the quota evaluator:
/// an already-claimed resource wins over a global-cap violation, which wins
/// over the off-home cap, which wins over the per-location cap. Clients can
/// rely on receiving the highest-priority applicable reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The resource is already held by some claimant (possibly the requester).
    AlreadyClaimed,
    /// The claimant already holds the maximum total number of resources.
    GlobalCapExceeded,
    /// The resource is off the home location and the claimant is at the
    /// off-home aggregate cap.
    OffsiteCapExceeded,
    /// The claimant is at the configured cap for the resource's location.
    LocationCapExceeded,
    /// The session is not in the open phase.
    NotOpen,
    /// The resource id does not exist in the inventory.
    UnknownResource,
    /// An unexpected server-side failure while processing the claim.
    Internal,
}

impl RejectReason {
    /// Human-readable message for this rejection, distinct from the
    /// machine-readable kind.
    #[must_use]
    pub fn human_message(self) -> &'static str {
        match self {
            RejectReason::AlreadyClaimed => "This resource has already been claimed.",
            RejectReason::GlobalCapExceeded => "You have reached your total claim limit.",
            RejectReason::OffsiteCapExceeded => {
                "You have reached your limit for resources outside your home location."
            }
            RejectReason::LocationCapExceeded => {
                "You have reached your limit for this location."
            }
            RejectReason::NotOpen => "The session is not open yet.",
            RejectReason::UnknownResource => "No such resource exists.",
            RejectReason::Internal => "An internal error occurred, please try again.",
        }
    }
}

/// A claimant's running counters, refreshed after every accepted claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimantCounters {
    /// Total resources claimed.
    pub total_claimed: u32,
    /// Claimed count per location. Invariant: values sum to `total_claimed`.
    pub claimed_by_location: BTreeMap<String, u32>,
    /// Claimed resources whose location differs from the home location.
    pub off_home_claimed: u32,
}

/// Claimant-stripped view of one resource, as shown in the start snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceView {
    pub id: String,
    pub name: String,
    pub claimed: bool,
}

/// All configured caps, sent once in the start snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCaps {
    /// Maximum total resources per claimant.
    pub global_cap: u32,
    /// Maximum resources per claimant outside the home location.
    pub off_home_cap: u32,
    /// The distinguished home location.
    pub home_location: String,
    /// Per-location cap, keyed by location name.
    pub location_caps: BTreeMap<String, u32>,
}

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges a successful connection registration.
    Connected,
    /// One countdown tick, sent once per second while counting down.
    Countdown {
        remaining_seconds: u64,
        claimant_display_name: String,
    },
    /// The session-open snapshot: every resource grouped by location with
    /// claimant identities stripped, plus the receiving claimant's own
    /// claimed ids and counters, plus all configured caps. Sent on the
    /// transition into the open phase and to any claimant that (re)connects
    /// while the session is already open.
    Start {
        resources_by_location: BTreeMap<String, Vec<ResourceView>>,
        claimed_resource_ids: Vec<String>,
        counters: ClaimantCounters,
        caps: SessionCaps,
    },
    /// The requesting claimant's claim was accepted.
    ClaimSuccess {
        resource_id: String,
        resource_name: String,
        counters: ClaimantCounters,
    },
    /// The requesting claimant's claim was rejected. Sent only to the
    /// requester; no state changed.
    ClaimFailure {
        resource_id: String,
        reason: RejectReason,
        message: String,
    },
    /// A resource was claimed by someone else and is no longer available.
    ResourceNowUnavailable { resource_id: String },
    /// The presented claimant token is unknown. The connection is closed
    /// immediately after this message.
    InvalidClaimant,
    /// The client sent a frame the server could not understand.
    ProtocolError { message: String },
}

/// Client-to-server messages. Currently a single command: claim a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Claim { resource_id: String },
}
