//! Identity persistence
//!
//! The active identifier survives restarts through a small JSON document:
//!
//! ```json
//! { "uuid": "0f5a7c1e-...", "protocol": "vless" }
//! ```
//!
//! The value is stored as text and validated by the resolver, so a
//! hand-edited or corrupted file degrades to regeneration instead of a
//! startup failure.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Framing;

/// Persisted identity record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    /// Identifier in textual form (validated on load, not here)
    pub uuid: String,

    /// Framing selected for this identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Framing>,
}

/// Durable key-value collaborator for the identity.
///
/// Failures are reported to the resolver, which logs them and carries on.
pub trait IdentityStore: Send + Sync {
    /// Load the persisted record, `None` when nothing was saved yet
    fn load(&self) -> Result<Option<StoredIdentity>>;

    /// Persist a record, replacing any previous one
    fn save(&self, record: &StoredIdentity) -> Result<()>;
}

/// File-backed identity store
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileStore {
    fn load(&self) -> Result<Option<StoredIdentity>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Identity file {} does not exist", self.path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            Error::Persistence(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }

    fn save(&self, record: &StoredIdentity) -> Result<()> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| Error::Persistence(format!("Failed to encode identity: {}", e)))?;
        std::fs::write(&self.path, json).map_err(|e| {
            Error::Persistence(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }
}
