//! Identity Resolver
//!
//! Determines the single secret identifier (UUID) that authenticates clients,
//! together with the framing it is used with.
//!
//! Source priority:
//! 1. Explicit override (deployment configuration)
//! 2. Previously persisted value
//! 3. Freshly generated value (persisted for the next start)
//!
//! The resolved [`Identity`] is immutable and passed by reference to every
//! session; nothing mutates it after startup.

mod store;

pub use store::{FileStore, IdentityStore, StoredIdentity};

use std::fmt;

use tracing::{info, warn};
use uuid::{Uuid, Variant};

use crate::protocol::{vmess, Framing};

/// Length of a canonical hyphenated UUID
const CANONICAL_LEN: usize = 36;

/// Version nibble required of identifiers
const REQUIRED_VERSION: usize = 4;

/// The active identity: secret identifier plus framing
#[derive(Clone)]
pub struct Identity {
    id: Uuid,
    framing: Framing,
    /// VMess command key, derived once from the identifier
    cmd_key: [u8; 16],
}

impl Identity {
    pub fn new(id: Uuid, framing: Framing) -> Self {
        Self {
            id,
            framing,
            cmd_key: vmess::cmd_key(&id),
        }
    }

    /// Get the UUID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the UUID as raw bytes
    pub fn id_bytes(&self) -> &[u8; 16] {
        self.id.as_bytes()
    }

    /// Framing selected for this identity
    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub(crate) fn cmd_key(&self) -> &[u8; 16] {
        &self.cmd_key
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}

/// Deployment-time overrides, read once at startup
#[derive(Debug, Clone, Default)]
pub struct IdentityOverrides {
    pub uuid: Option<String>,
    pub protocol: Option<String>,
}

/// Parse an identifier, accepting only the canonical textual grammar.
///
/// 8-4-4-4-12 hex groups, version 4, RFC 4122 variant. Anything else
/// (braced, URN, simple form, other versions) is rejected.
pub fn parse_identifier(s: &str) -> Option<Uuid> {
    let s = s.trim();
    if s.len() != CANONICAL_LEN {
        return None;
    }
    let hyphens_ok = s
        .char_indices()
        .all(|(i, c)| matches!(i, 8 | 13 | 18 | 23) == (c == '-'));
    if !hyphens_ok {
        return None;
    }

    let id = Uuid::try_parse(s).ok()?;
    if id.get_version_num() != REQUIRED_VERSION || id.get_variant() != Variant::RFC4122 {
        return None;
    }
    Some(id)
}

/// Resolve the process identity from overrides, the store, or generation.
///
/// Never fails: invalid sources are logged and skipped, and a persistence
/// failure leaves the in-memory identity usable.
pub fn resolve(overrides: &IdentityOverrides, store: &dyn IdentityStore) -> Identity {
    let stored = match store.load() {
        Ok(stored) => stored,
        Err(e) => {
            warn!("Ignoring persisted identity: {}", e);
            None
        }
    };

    let framing = resolve_framing(overrides, stored.as_ref());

    if let Some(raw) = overrides.uuid.as_deref() {
        match parse_identifier(raw) {
            Some(id) => {
                info!("Using identity from override ({})", framing);
                return Identity::new(id, framing);
            }
            None => warn!("Override identifier is not a canonical v4 UUID, ignoring it"),
        }
    }

    if let Some(record) = &stored {
        match parse_identifier(&record.uuid) {
            Some(id) => {
                info!("Using persisted identity ({})", framing);
                return Identity::new(id, framing);
            }
            None => warn!("Persisted identifier is not a canonical v4 UUID, regenerating"),
        }
    }

    // Uuid::new_v4 draws from the OS CSPRNG
    let id = Uuid::new_v4();
    info!("Generated new identity ({})", framing);

    let record = StoredIdentity {
        uuid: id.to_string(),
        protocol: Some(framing),
    };
    if let Err(e) = store.save(&record) {
        warn!("Failed to persist generated identity, continuing in memory: {}", e);
    }

    Identity::new(id, framing)
}

fn resolve_framing(overrides: &IdentityOverrides, stored: Option<&StoredIdentity>) -> Framing {
    if let Some(raw) = overrides.protocol.as_deref() {
        match raw.parse::<Framing>() {
            Ok(framing) => return framing,
            Err(_) => warn!("Unknown protocol override '{}', ignoring it", raw),
        }
    }
    stored.and_then(|s| s.protocol).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use parking_lot::Mutex;

    const VALID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";
    const OTHER: &str = "8a1f3c5b-2e4d-4f6a-9b8c-7d6e5f4a3b2c";

    #[derive(Default)]
    struct MemoryStore {
        record: Mutex<Option<StoredIdentity>>,
        fail_load: bool,
        fail_save: bool,
    }

    impl MemoryStore {
        fn with(uuid: &str, protocol: Option<Framing>) -> Self {
            Self {
                record: Mutex::new(Some(StoredIdentity {
                    uuid: uuid.to_string(),
                    protocol,
                })),
                ..Default::default()
            }
        }
    }

    impl IdentityStore for MemoryStore {
        fn load(&self) -> Result<Option<StoredIdentity>> {
            if self.fail_load {
                return Err(Error::Persistence("load failed".into()));
            }
            Ok(self.record.lock().clone())
        }

        fn save(&self, record: &StoredIdentity) -> Result<()> {
            if self.fail_save {
                return Err(Error::Persistence("disk full".into()));
            }
            *self.record.lock() = Some(record.clone());
            Ok(())
        }
    }

    fn overrides(uuid: Option<&str>, protocol: Option<&str>) -> IdentityOverrides {
        IdentityOverrides {
            uuid: uuid.map(str::to_string),
            protocol: protocol.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_identifier_grammar() {
        assert!(parse_identifier(VALID).is_some());
        assert!(parse_identifier(&VALID.to_uppercase()).is_some());
        assert!(parse_identifier(&format!("  {}\n", VALID)).is_some());

        // Simple, braced and URN forms are not canonical
        assert!(parse_identifier("d342d11ed4244583b36e524ab1f0afa4").is_none());
        assert!(parse_identifier(&format!("{{{}}}", VALID)).is_none());
        assert!(parse_identifier(&format!("urn:uuid:{}", VALID)).is_none());

        // Version 1 and non-RFC4122 variant
        assert!(parse_identifier("d342d11e-d424-1583-b36e-524ab1f0afa4").is_none());
        assert!(parse_identifier("d342d11e-d424-4583-736e-524ab1f0afa4").is_none());

        // Misplaced hyphen and non-hex digit
        assert!(parse_identifier("d342d11ed-424-4583-b36e-524ab1f0afa4").is_none());
        assert!(parse_identifier("g342d11e-d424-4583-b36e-524ab1f0afa4").is_none());
    }

    #[test]
    fn test_override_wins_over_persisted() {
        let store = MemoryStore::with(OTHER, Some(Framing::Vmess));
        let identity = resolve(&overrides(Some(VALID), None), &store);

        assert_eq!(identity.id().to_string(), VALID);
        assert_eq!(identity.framing(), Framing::Vmess);
        // Overrides are not written back
        assert_eq!(store.record.lock().as_ref().unwrap().uuid, OTHER);
    }

    #[test]
    fn test_invalid_override_falls_through_to_persisted() {
        let store = MemoryStore::with(OTHER, None);
        let identity = resolve(&overrides(Some("not-a-uuid"), None), &store);

        assert_eq!(identity.id().to_string(), OTHER);
        assert_eq!(identity.framing(), Framing::Vless);
    }

    #[test]
    fn test_invalid_persisted_value_regenerates_and_saves() {
        let store = MemoryStore::with("12345", None);
        let identity = resolve(&IdentityOverrides::default(), &store);

        let saved = store.record.lock().clone().unwrap();
        assert_eq!(saved.uuid, identity.id().to_string());
        assert_eq!(saved.protocol, Some(Framing::Vless));
        assert!(parse_identifier(&saved.uuid).is_some());
    }

    #[test]
    fn test_generated_identity_survives_save_failure() {
        let store = MemoryStore {
            fail_load: true,
            fail_save: true,
            ..Default::default()
        };
        let identity = resolve(&overrides(None, Some("vmess")), &store);

        assert_eq!(identity.id().get_version_num(), 4);
        assert_eq!(identity.framing(), Framing::Vmess);
    }

    #[test]
    fn test_unknown_protocol_override_is_ignored() {
        let store = MemoryStore::with(VALID, Some(Framing::Vmess));
        let identity = resolve(&overrides(None, Some("trojan")), &store);
        assert_eq!(identity.framing(), Framing::Vmess);
    }

    #[test]
    fn test_debug_does_not_print_key() {
        let identity = Identity::new(parse_identifier(VALID).unwrap(), Framing::Vless);
        let debug = format!("{:?}", identity);
        assert!(debug.contains(VALID));
        assert!(!debug.contains("cmd_key"));
    }
}
