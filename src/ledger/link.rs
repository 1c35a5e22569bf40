//! Keyed actor pseudonyms.
//!
//! Redacting a record's actor drops the principal id, but the record still
//! belongs to that person for later subject requests. Before the actor is
//! scrubbed the store stamps the record with a keyed hash of the id. The
//! key lives beside the journals, so the link can be recomputed from a
//! subject id but not reversed from the journal alone.

use std::fs;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::ledger::canonical::sha256_tagged;

pub const LINK_KEY_FILE: &str = "link.key";

#[derive(Clone)]
pub struct SubjectLinker {
    key: String,
}

impl SubjectLinker {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Fresh key that only lives as long as the process
    pub fn ephemeral() -> Self {
        Self::new(Uuid::new_v4().simple().to_string())
    }

    /// Load the key from `dir`, creating it on first use
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(LINK_KEY_FILE);
        if path.exists() {
            let key = fs::read_to_string(&path).map_err(|e| {
                LedgerError::Journal(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(LedgerError::Journal(format!(
                    "{} is empty",
                    path.display()
                )));
            }
            return Ok(Self::new(key));
        }

        fs::create_dir_all(dir)?;
        let linker = Self::ephemeral();
        fs::write(&path, format!("{}\n", linker.key)).map_err(|e| {
            LedgerError::Journal(format!("Failed to write {}: {}", path.display(), e))
        })?;
        info!("Created actor link key at {}", path.display());
        Ok(linker)
    }

    pub fn link(&self, actor_id: &str) -> String {
        let mut bytes = Vec::with_capacity(self.key.len() + actor_id.len() + 16);
        bytes.extend_from_slice(b"actor-link\n");
        bytes.extend_from_slice(self.key.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(actor_id.as_bytes());
        sha256_tagged(&bytes)
    }
}

impl std::fmt::Debug for SubjectLinker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectLinker").finish_non_exhaustive()
    }
}
