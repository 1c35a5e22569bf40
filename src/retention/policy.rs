//! Retention policies
//!
//! Loaded from a YAML file and held behind an `ArcSwap` so the sweeper reads
//! the current set without locking while an operator reloads it.

use arc_swap::ArcSwap;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Tombstone every personal-data field
    Delete,
    /// Tombstone actor, origin and the configured personal diff fields
    Anonymize,
    /// Copy the current view to the archival sink
    Archive,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Delete => "delete",
            Disposition::Anonymize => "anonymize",
            Disposition::Archive => "archive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub entity_type: String,
    pub retention_days: u32,
    pub disposition: Disposition,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl RetentionPolicy {
    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }

    /// Identity used for at-most-once disposition tracking
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.entity_type,
            self.disposition.as_str(),
            self.retention_days
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<RetentionPolicy>,
}

/// Validated policy set: at most one active policy per entity type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    active: BTreeMap<String, RetentionPolicy>,
    inactive: Vec<RetentionPolicy>,
}

impl PolicySet {
    pub fn from_policies(policies: Vec<RetentionPolicy>) -> Result<Self> {
        let mut set = PolicySet::default();
        for policy in policies {
            if policy.entity_type.trim().is_empty() {
                return Err(LedgerError::Config(
                    "retention policy with empty entity_type".to_string(),
                ));
            }
            if !policy.active {
                set.inactive.push(policy);
                continue;
            }
            if set.active.contains_key(&policy.entity_type) {
                return Err(LedgerError::Config(format!(
                    "more than one active retention policy for {}",
                    policy.entity_type
                )));
            }
            set.active.insert(policy.entity_type.clone(), policy);
        }
        Ok(set)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(contents)
            .map_err(|e| LedgerError::Config(format!("Failed to parse retention policies: {}", e)))?;
        Self::from_policies(file.policies)
    }

    pub fn active(&self) -> impl Iterator<Item = &RetentionPolicy> {
        self.active.values()
    }

    pub fn for_entity_type(&self, entity_type: &str) -> Option<&RetentionPolicy> {
        self.active.get(entity_type)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Current retention policies, swappable without blocking readers
pub struct PolicyStore {
    policies: ArcSwap<PolicySet>,
    path: Option<PathBuf>,
}

impl PolicyStore {
    pub fn new(policies: PolicySet) -> Self {
        Self {
            policies: ArcSwap::from_pointee(policies),
            path: None,
        }
    }

    /// Load policies from a YAML file. A missing file yields an empty set
    /// that can be reloaded once the file exists.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let policies = if path.exists() {
            Self::read(path)?
        } else {
            info!("No retention policy file at {}, starting with none", path.display());
            PolicySet::default()
        };

        Ok(Self {
            policies: ArcSwap::from_pointee(policies),
            path: Some(path.to_path_buf()),
        })
    }

    fn read(path: &Path) -> Result<PolicySet> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        PolicySet::from_yaml(&contents)
    }

    #[inline]
    pub fn current(&self) -> Arc<PolicySet> {
        self.policies.load_full()
    }

    /// Re-read the policy file. On error the previous set stays in force.
    pub fn reload(&self) -> Result<usize> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| LedgerError::Config("no policy file path set".to_string()))?;

        let policies = Self::read(path)?;
        let count = policies.len();
        self.policies.store(Arc::new(policies));

        info!("Reloaded {} active retention policies", count);
        Ok(count)
    }

    pub fn replace(&self, policies: PolicySet) {
        self.policies.store(Arc::new(policies));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const POLICIES: &str = r#"
policies:
  - entity_type: Pet
    retention_days: 365
    disposition: anonymize
  - entity_type: billing.invoice
    retention_days: 3650
    disposition: archive
  - entity_type: Pet
    retention_days: 30
    disposition: delete
    active: false
"#;

    #[test]
    fn test_parse_policy_file() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        assert_eq!(set.len(), 2);

        let pet = set.for_entity_type("Pet").unwrap();
        assert_eq!(pet.disposition, Disposition::Anonymize);
        assert_eq!(pet.retention(), Duration::days(365));
    }

    #[test]
    fn test_duplicate_active_policy_rejected() {
        let yaml = r#"
policies:
  - { entity_type: Pet, retention_days: 1, disposition: delete }
  - { entity_type: Pet, retention_days: 2, disposition: archive }
"#;
        assert!(matches!(
            PolicySet::from_yaml(yaml),
            Err(LedgerError::Config(_))
        ));
    }

    #[test]
    fn test_reload_swaps_policies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("retention-policies.yml");
        std::fs::write(&path, "policies: []\n").unwrap();

        let store = PolicyStore::load_file(&path).unwrap();
        assert!(store.current().is_empty());

        std::fs::write(&path, POLICIES).unwrap();
        assert_eq!(store.reload().unwrap(), 2);
        assert!(store.current().for_entity_type("billing.invoice").is_some());

        // A broken file keeps the previous set
        std::fs::write(&path, "policies: [ {").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.current().len(), 2);
    }
}
