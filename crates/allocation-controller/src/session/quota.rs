//! Quota evaluator.
//!
//! A pure decision function over a candidate (claimant, resource) pair and
//! the session caps. The evaluation order is fixed and load-bearing: clients
//! see the first matching rejection, so reordering the checks changes the
//! observable protocol.

use super::state::{Claimant, Resource};
use allocation_protocol::{RejectReason, SessionCaps};

/// Outcome of evaluating one candidate claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(RejectReason),
}

/// Evaluate a candidate claim against the session caps.
///
/// Order of checks (first match wins):
/// 1. resource already claimed, by anyone including the requester
/// 2. claimant at the global cap
/// 3. resource off-home and claimant at the off-home cap
/// 4. claimant at the per-location cap for the resource's location
#[must_use]
pub fn evaluate(resource: &Resource, claimant: &Claimant, caps: &SessionCaps) -> Decision {
    if resource.is_claimed() {
        return Decision::Reject(RejectReason::AlreadyClaimed);
    }

    if claimant.counters.total_claimed >= caps.global_cap {
        return Decision::Reject(RejectReason::GlobalCapExceeded);
    }

    if resource.location != caps.home_location
        && claimant.counters.off_home_claimed >= caps.off_home_cap
    {
        return Decision::Reject(RejectReason::OffsiteCapExceeded);
    }

    let location_claimed = claimant
        .counters
        .claimed_by_location
        .get(&resource.location)
        .copied()
        .unwrap_or(0);
    let location_cap = caps
        .location_caps
        .get(&resource.location)
        .copied()
        .unwrap_or(0);
    if location_claimed >= location_cap {
        return Decision::Reject(RejectReason::LocationCapExceeded);
    }

    Decision::Accept
}
