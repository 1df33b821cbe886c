//! Boot-time catalog loader.
//!
//! Two static JSON documents are read exactly once at startup: the locations
//! document (locations, per-location caps, resource lists) and the claimants
//! document (opaque tokens and display names). A duplicate key in either
//! document is a fatal startup error; nothing is created or destroyed after
//! boot.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// One resource entry in the locations document.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSpec {
    pub id: String,
    pub name: String,
}

/// One location entry in the locations document.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationSpec {
    pub name: String,
    /// Per-claimant cap for this location.
    pub cap: u32,
    pub resources: Vec<ResourceSpec>,
}

/// One claimant entry in the claimants document.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimantSpec {
    /// Opaque secret token, also the connection key. Never logged.
    pub token: String,
    pub display_name: String,
}

/// The validated boot catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub locations: Vec<LocationSpec>,
    pub claimants: Vec<ClaimantSpec>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate location name: {0}")]
    DuplicateLocation(String),

    #[error("Duplicate resource id: {0}")]
    DuplicateResource(String),

    #[error("Duplicate claimant token in claimants document")]
    DuplicateClaimant,

    #[error("Home location {0:?} does not exist in the locations document")]
    UnknownHomeLocation(String),
}

impl Catalog {
    /// Read and validate both documents from disk.
    pub fn load(
        locations_path: &str,
        claimants_path: &str,
        home_location: &str,
    ) -> Result<Self, CatalogError> {
        let locations_raw = read(locations_path)?;
        let claimants_raw = read(claimants_path)?;
        Self::from_documents(&locations_raw, &claimants_raw, home_location)
    }

    /// Parse and validate both documents from their raw JSON text.
    pub fn from_documents(
        locations_json: &str,
        claimants_json: &str,
        home_location: &str,
    ) -> Result<Self, CatalogError> {
        let locations: Vec<LocationSpec> =
            serde_json::from_str(locations_json).map_err(|source| CatalogError::Parse {
                path: "locations".to_string(),
                source,
            })?;
        let claimants: Vec<ClaimantSpec> =
            serde_json::from_str(claimants_json).map_err(|source| CatalogError::Parse {
                path: "claimants".to_string(),
                source,
            })?;

        let mut location_names = HashSet::new();
        let mut resource_ids = HashSet::new();
        for location in &locations {
            if !location_names.insert(location.name.clone()) {
                return Err(CatalogError::DuplicateLocation(location.name.clone()));
            }
            for resource in &location.resources {
                if !resource_ids.insert(resource.id.clone()) {
                    return Err(CatalogError::DuplicateResource(resource.id.clone()));
                }
            }
        }

        let mut tokens = HashSet::new();
        for claimant in &claimants {
            // The token is a secret; the error deliberately omits it.
            if !tokens.insert(claimant.token.clone()) {
                return Err(CatalogError::DuplicateClaimant);
            }
        }

        if !location_names.contains(home_location) {
            return Err(CatalogError::UnknownHomeLocation(home_location.to_string()));
        }

        Ok(Catalog {
            locations,
            claimants,
        })
    }

    /// Total resource count across all locations.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.locations.iter().map(|l| l.resources.len()).sum()
    }
}

fn read(path: &str) -> Result<String, CatalogError> {
    std::fs::read_to_string(Path::new(path)).map_err(|source| CatalogError::Io {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const LOCATIONS: &str = r#"[
        {"name": "A", "cap": 2, "resources": [
            {"id": "a1", "name": "Slot A1"},
            {"id": "a2", "name": "Slot A2"}
        ]},
        {"name": "B", "cap": 1, "resources": [
            {"id": "b1", "name": "Slot B1"}
        ]}
    ]"#;

    const CLAIMANTS: &str = r#"[
        {"token": "tok-x", "display_name": "Team X"},
        {"token": "tok-y", "display_name": "Team Y"}
    ]"#;

    #[test]
    fn valid_documents_load() {
        let catalog = Catalog::from_documents(LOCATIONS, CLAIMANTS, "A").unwrap();
        assert_eq!(catalog.locations.len(), 2);
        assert_eq!(catalog.claimants.len(), 2);
        assert_eq!(catalog.resource_count(), 3);
    }

    #[test]
    fn duplicate_location_is_fatal() {
        let locations = r#"[
            {"name": "A", "cap": 1, "resources": []},
            {"name": "A", "cap": 2, "resources": []}
        ]"#;
        let result = Catalog::from_documents(locations, CLAIMANTS, "A");
        assert!(matches!(result, Err(CatalogError::DuplicateLocation(n)) if n == "A"));
    }

    #[test]
    fn duplicate_resource_across_locations_is_fatal() {
        let locations = r#"[
            {"name": "A", "cap": 1, "resources": [{"id": "x", "name": "X"}]},
            {"name": "B", "cap": 1, "resources": [{"id": "x", "name": "X again"}]}
        ]"#;
        let result = Catalog::from_documents(locations, CLAIMANTS, "A");
        assert!(matches!(result, Err(CatalogError::DuplicateResource(id)) if id == "x"));
    }

    #[test]
    fn duplicate_claimant_is_fatal_and_does_not_leak_the_token() {
        let claimants = r#"[
            {"token": "tok-x", "display_name": "Team X"},
            {"token": "tok-x", "display_name": "Imposter"}
        ]"#;
        let result = Catalog::from_documents(LOCATIONS, claimants, "A");
        let err = result.err().unwrap();
        assert!(matches!(err, CatalogError::DuplicateClaimant));
        assert!(!err.to_string().contains("tok-x"));
    }

    #[test]
    fn unknown_home_location_is_fatal() {
        let result = Catalog::from_documents(LOCATIONS, CLAIMANTS, "C");
        assert!(matches!(result, Err(CatalogError::UnknownHomeLocation(n)) if n == "C"));
    }

    #[test]
    fn malformed_json_is_fatal() {
        let result = Catalog::from_documents("[{", CLAIMANTS, "A");
        assert!(matches!(result, Err(CatalogError::Parse { .. })));
    }
}
