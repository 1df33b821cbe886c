//! Allocation session state.
//!
//! [`AllocationState`] holds the inventory and claimant tables plus the
//! process-wide phase value. It is owned exclusively by the admission actor
//! ([`crate::session::pipeline`]); nothing else holds a reference to it, which
//! is what makes mutation safe without a lock. All reads reach it as actor
//! messages.

use crate::catalog::Catalog;
use allocation_protocol::{ClaimantCounters, ResourceView, SessionCaps};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Lifecycle phase of the one allocation session this process runs.
/// Transitions are monotonic: `Scheduled → CountingDown → Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Scheduled,
    CountingDown,
    Open,
}

/// One discrete, location-tagged item. Claimed at most once, never unclaimed.
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub location: String,
    /// Token of the owning claimant. `None` until claimed.
    pub claimed_by: Option<String>,
}

impl Resource {
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }
}

/// One claimant and its running counters.
#[derive(Debug, Clone)]
pub struct Claimant {
    pub token: String,
    pub display_name: String,
    /// Claimed resource ids, in claim order.
    pub claimed: Vec<String>,
    pub counters: ClaimantCounters,
}

/// Operator-facing view of one claimant's progress. Keyed by display name;
/// the secret token never leaves the process.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimantReport {
    pub display_name: String,
    pub claimed_resource_ids: Vec<String>,
    pub counters: ClaimantCounters,
}

/// Operator-facing view of the whole session.
#[derive(Debug, Clone, Serialize)]
pub struct StateReport {
    pub phase: Phase,
    pub claimants: Vec<ClaimantReport>,
    pub resources_by_location: BTreeMap<String, Vec<ResourceView>>,
}

/// The tables behind the one allocation session.
#[derive(Debug)]
pub struct AllocationState {
    resources: HashMap<String, Resource>,
    claimants: HashMap<String, Claimant>,
    caps: SessionCaps,
    phase: Phase,
}

impl AllocationState {
    /// Build the session tables from the validated boot catalog.
    #[must_use]
    pub fn from_catalog(catalog: &Catalog, global_cap: u32, off_home_cap: u32, home_location: &str) -> Self {
        let mut resources = HashMap::new();
        let mut location_caps = BTreeMap::new();
        for location in &catalog.locations {
            location_caps.insert(location.name.clone(), location.cap);
            for spec in &location.resources {
                resources.insert(
                    spec.id.clone(),
                    Resource {
                        id: spec.id.clone(),
                        name: spec.name.clone(),
                        location: location.name.clone(),
                        claimed_by: None,
                    },
                );
            }
        }

        let claimants = catalog
            .claimants
            .iter()
            .map(|spec| {
                (
                    spec.token.clone(),
                    Claimant {
                        token: spec.token.clone(),
                        display_name: spec.display_name.clone(),
                        claimed: Vec::new(),
                        counters: ClaimantCounters::default(),
                    },
                )
            })
            .collect();

        Self {
            resources,
            claimants,
            caps: SessionCaps {
                global_cap,
                off_home_cap,
                home_location: home_location.to_string(),
                location_caps,
            },
            phase: Phase::Scheduled,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// `Scheduled → CountingDown`. Returns false (and changes nothing) if the
    /// session is past that point already.
    pub fn begin_countdown(&mut self) -> bool {
        if self.phase == Phase::Scheduled {
            self.phase = Phase::CountingDown;
            true
        } else {
            false
        }
    }

    /// `CountingDown → Open` (also accepts `Scheduled → Open` when the
    /// configured start instant allows no countdown window). Returns false if
    /// already open.
    pub fn open(&mut self) -> bool {
        if self.phase == Phase::Open {
            false
        } else {
            self.phase = Phase::Open;
            true
        }
    }

    #[must_use]
    pub fn caps(&self) -> &SessionCaps {
        &self.caps
    }

    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    #[must_use]
    pub fn claimant(&self, token: &str) -> Option<&Claimant> {
        self.claimants.get(token)
    }

    /// Record an accepted claim: mark the resource, append to the claimant's
    /// set, and update all three counters together. Callers must have run the
    /// quota evaluator first; this only fails if the ids are unknown.
    ///
    /// Returns the resource display name and the claimant's refreshed
    /// counters for the `ClaimSuccess` reply.
    pub fn apply_claim(
        &mut self,
        claimant_token: &str,
        resource_id: &str,
    ) -> Option<(String, ClaimantCounters)> {
        let home = self.caps.home_location.clone();
        let resource = self.resources.get_mut(resource_id)?;
        let claimant = self.claimants.get_mut(claimant_token)?;

        resource.claimed_by = Some(claimant_token.to_string());
        claimant.claimed.push(resource_id.to_string());
        claimant.counters.total_claimed += 1;
        *claimant
            .counters
            .claimed_by_location
            .entry(resource.location.clone())
            .or_insert(0) += 1;
        if resource.location != home {
            claimant.counters.off_home_claimed += 1;
        }

        Some((resource.name.clone(), claimant.counters.clone()))
    }

    /// Claimant-stripped view of every resource, grouped by location.
    #[must_use]
    pub fn resources_by_location(&self) -> BTreeMap<String, Vec<ResourceView>> {
        let mut grouped: BTreeMap<String, Vec<ResourceView>> = self
            .caps
            .location_caps
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for resource in self.resources.values() {
            if let Some(views) = grouped.get_mut(&resource.location) {
                views.push(ResourceView {
                    id: resource.id.clone(),
                    name: resource.name.clone(),
                    claimed: resource.is_claimed(),
                });
            }
        }
        for views in grouped.values_mut() {
            views.sort_by(|a, b| a.id.cmp(&b.id));
        }
        grouped
    }

    /// The personalized half of a start snapshot for one claimant.
    #[must_use]
    pub fn claimant_view(&self, token: &str) -> Option<(Vec<String>, ClaimantCounters)> {
        self.claimants
            .get(token)
            .map(|c| (c.claimed.clone(), c.counters.clone()))
    }

    /// Full observable state for the operator endpoint.
    #[must_use]
    pub fn report(&self) -> StateReport {
        let mut claimants: Vec<ClaimantReport> = self
            .claimants
            .values()
            .map(|c| ClaimantReport {
                display_name: c.display_name.clone(),
                claimed_resource_ids: c.claimed.clone(),
                counters: c.counters.clone(),
            })
            .collect();
        claimants.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        StateReport {
            phase: self.phase,
            claimants,
            resources_by_location: self.resources_by_location(),
        }
    }

    /// Invariant check used by tests: every claimant's total equals the sum
    /// of its per-location counts, and the off-home count matches the claimed
    /// resources whose location differs from home.
    #[must_use]
    pub fn counters_consistent(&self) -> bool {
        self.claimants.values().all(|claimant| {
            let by_location_sum: u32 = claimant.counters.claimed_by_location.values().sum();
            let off_home_actual = claimant
                .claimed
                .iter()
                .filter_map(|id| self.resources.get(id))
                .filter(|r| r.location != self.caps.home_location)
                .count() as u32;
            claimant.counters.total_claimed == by_location_sum
                && claimant.counters.total_claimed == claimant.claimed.len() as u32
                && claimant.counters.off_home_claimed == off_home_actual
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn test_catalog() -> Catalog {
        Catalog::from_documents(
            r#"[
                {"name": "A", "cap": 2, "resources": [
                    {"id": "a1", "name": "Slot A1"},
                    {"id": "a2", "name": "Slot A2"}
                ]},
                {"name": "B", "cap": 1, "resources": [
                    {"id": "b1", "name": "Slot B1"}
                ]}
            ]"#,
            r#"[
                {"token": "tok-x", "display_name": "Team X"},
                {"token": "tok-y", "display_name": "Team Y"}
            ]"#,
            "A",
        )
        .unwrap()
    }

    fn test_state() -> AllocationState {
        AllocationState::from_catalog(&test_catalog(), 3, 1, "A")
    }

    #[test]
    fn initial_phase_is_scheduled() {
        let state = test_state();
        assert_eq!(state.phase(), Phase::Scheduled);
    }

    #[test]
    fn phase_transitions_are_monotonic() {
        let mut state = test_state();
        assert!(state.begin_countdown());
        assert!(!state.begin_countdown(), "second countdown must be a no-op");
        assert!(state.open());
        assert!(!state.open(), "second open must be a no-op");
        assert!(!state.begin_countdown(), "open never goes back");
        assert_eq!(state.phase(), Phase::Open);
    }

    #[test]
    fn apply_claim_updates_everything_together() {
        let mut state = test_state();
        let (name, counters) = state.apply_claim("tok-x", "b1").unwrap();

        assert_eq!(name, "Slot B1");
        assert_eq!(counters.total_claimed, 1);
        assert_eq!(counters.claimed_by_location.get("B"), Some(&1));
        assert_eq!(counters.off_home_claimed, 1, "B is off-home");

        let resource = state.resource("b1").unwrap();
        assert_eq!(resource.claimed_by.as_deref(), Some("tok-x"));
        assert!(state.counters_consistent());
    }

    #[test]
    fn home_claims_do_not_count_off_home() {
        let mut state = test_state();
        state.apply_claim("tok-x", "a1").unwrap();
        let (claimed, counters) = state.claimant_view("tok-x").unwrap();
        assert_eq!(claimed, vec!["a1".to_string()]);
        assert_eq!(counters.off_home_claimed, 0);
        assert!(state.counters_consistent());
    }

    #[test]
    fn snapshot_is_claimant_stripped_and_complete() {
        let mut state = test_state();
        state.apply_claim("tok-y", "a2").unwrap();

        let grouped = state.resources_by_location();
        assert_eq!(grouped.len(), 2);
        let a_views = grouped.get("A").unwrap();
        assert_eq!(a_views.len(), 2);
        let a2 = a_views.iter().find(|v| v.id == "a2").unwrap();
        assert!(a2.claimed);
        let a1 = a_views.iter().find(|v| v.id == "a1").unwrap();
        assert!(!a1.claimed);
    }

    #[test]
    fn report_uses_display_names_not_tokens() {
        let mut state = test_state();
        state.apply_claim("tok-x", "a1").unwrap();
        let report = state.report();
        let text = serde_json::to_string(&report).unwrap();
        assert!(text.contains("Team X"));
        assert!(!text.contains("tok-x"));
    }

    #[test]
    fn apply_claim_unknown_ids_yield_none() {
        let mut state = test_state();
        assert!(state.apply_claim("tok-x", "nope").is_none());
        assert!(state.apply_claim("ghost", "a1").is_none());
        assert!(state.counters_consistent());
    }
}
