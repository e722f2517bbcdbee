use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CatalogError;
use crate::seal::BlobDecryptor;

/// Versioned list of remediation solutions, keyed by detection name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationCatalog {
    pub version: i64,
    #[serde(default)]
    pub solutions: Vec<Solution>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    pub name: String,
    #[serde(rename = "module", default)]
    pub destination_module: String,
    #[serde(default)]
    pub action: String,
    #[serde(rename = "mustHarden", default)]
    pub must_harden: bool,
    #[serde(rename = "allowRepeatedHarden", default)]
    pub allow_repeated_harden: bool,
    #[serde(rename = "hardenMeasures", default)]
    pub harden_measures: Vec<HardenMeasure>,
}

/// One filesystem hardening step: what to do, to what kind of target, where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardenMeasure {
    pub action: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(rename = "dest")]
    pub destination: String,
}

impl RemediationCatalog {
    /// Parse and validate a plaintext JSON catalog.
    pub fn from_json(bytes: &[u8]) -> Result<Self, CatalogError> {
        let catalog: Self = serde_json::from_slice(bytes)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Read a sealed catalog from disk, decrypt it and parse it.
    pub fn load_sealed(path: &Path, decryptor: &dyn BlobDecryptor) -> Result<Self, CatalogError> {
        let blob = std::fs::read(path)?;
        let plain = decryptor.decrypt(&blob)?;
        let catalog = Self::from_json(&plain)?;
        info!(
            "loaded remediation catalog v{} with {} solutions",
            catalog.version,
            catalog.solutions.len()
        );
        Ok(catalog)
    }

    /// Names must be non-empty and unique, and every measure needs a target.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for (idx, sol) in self.solutions.iter().enumerate() {
            if sol.name.trim().is_empty() {
                return Err(CatalogError::EmptyName(idx));
            }
            if !seen.insert(sol.name.as_str()) {
                return Err(CatalogError::DuplicateName(sol.name.clone()));
            }
            if sol
                .harden_measures
                .iter()
                .any(|m| m.destination.trim().is_empty())
            {
                return Err(CatalogError::EmptyDestination {
                    name: sol.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn find(&self, rule_id: &str) -> Option<&Solution> {
        self.solutions.iter().find(|s| s.name == rule_id)
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }
}
