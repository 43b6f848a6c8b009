//! Keyed-Identity Resolver
//!
//! Maps human-facing principal names and certificate names to the stable
//! identifiers the appliance compares on. Lookups are memoised for the
//! lifetime of one reconciliation cycle.

use crate::domain::{
    Endpoint, ManagementApiRef, Principal, PrincipalQuery, PrincipalType, ResourceType, StableId,
};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

// =============================================================================
// Trustee
// =============================================================================

/// Principal reference as written by the operator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrusteeRef {
    pub name: String,
    #[serde(rename = "type", default = "default_principal_type")]
    pub kind: PrincipalType,
    #[serde(default)]
    pub provider: Option<String>,
}

fn default_principal_type() -> PrincipalType {
    PrincipalType::User
}

/// A resolved principal
///
/// Two trustees are the same principal iff their persona ids match, whatever
/// name or provider was used to find them.
#[derive(Debug, Clone)]
pub struct Trustee {
    pub name: String,
    pub kind: PrincipalType,
    pub provider: Option<String>,
    pub id: StableId,
    pub on_disk_id: Option<StableId>,
}

impl PartialEq for Trustee {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Trustee {}

impl Trustee {
    /// Wire form `{"id": "UID:2000", "name": ..., "type": ...}`
    pub fn persona(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::from(self.id.to_string()));
        obj.insert("name".into(), Value::from(self.name.clone()));
        obj.insert("type".into(), Value::from(self.kind.to_string()));
        Value::Object(obj)
    }

    /// Every id under which this principal may appear in an entry
    pub fn removal_ids(&self) -> Vec<StableId> {
        let mut ids = vec![self.id.clone()];
        if let Some(on_disk) = &self.on_disk_id {
            if on_disk != &self.id {
                ids.push(on_disk.clone());
            }
        }
        ids
    }
}

impl From<Principal> for Trustee {
    fn from(principal: Principal) -> Self {
        Self {
            name: principal.name,
            kind: principal.kind,
            provider: principal.provider,
            id: principal.id,
            on_disk_id: principal.on_disk_id,
        }
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Per-cycle principal and certificate resolver
pub struct IdentityResolver {
    api: ManagementApiRef,
    zone: String,
    principals: Mutex<HashMap<PrincipalQuery, Principal>>,
    certificates: Mutex<Option<HashMap<String, String>>>,
}

impl IdentityResolver {
    pub fn new(api: ManagementApiRef, zone: impl Into<String>) -> Self {
        Self {
            api,
            zone: zone.into(),
            principals: Mutex::new(HashMap::new()),
            certificates: Mutex::new(None),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Resolve a principal by name
    pub async fn resolve(
        &self,
        name: &str,
        kind: PrincipalType,
        provider: Option<&str>,
    ) -> Result<Trustee> {
        let query = PrincipalQuery {
            name: name.to_string(),
            kind,
            provider: provider.map(str::to_string),
            zone: self.zone.clone(),
        };

        let cached = self.principals.lock().get(&query).cloned();
        if let Some(principal) = cached {
            return Ok(principal.into());
        }

        debug!("Looking up {} '{}' in zone {}", kind, name, self.zone);
        let principal = self
            .api
            .lookup_principal(&query)
            .await?
            .ok_or_else(|| Error::IdentityNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                provider: query.provider.clone(),
            })?;

        self.principals.lock().insert(query, principal.clone());
        Ok(principal.into())
    }

    /// Resolve an operator-written reference
    pub async fn resolve_ref(&self, reference: &TrusteeRef) -> Result<Trustee> {
        self.resolve(&reference.name, reference.kind, reference.provider.as_deref())
            .await
    }

    /// Resolve a certificate name to its id
    ///
    /// The certificate store is listed once per cycle.
    pub async fn resolve_certificate(&self, name: &str) -> Result<String> {
        let cached = self.certificates.lock().as_ref().map(|certs| certs.get(name).cloned());
        let id = match cached {
            Some(id) => id,
            None => {
                let listed = self
                    .api
                    .list(&Endpoint::collection(ResourceType::Certificate))
                    .await?;
                let certs: HashMap<String, String> = listed
                    .iter()
                    .filter_map(|cert| {
                        let name = cert.get("name")?.as_str()?;
                        let id = cert.get("id")?.as_str()?;
                        Some((name.to_string(), id.to_string()))
                    })
                    .collect();
                let id = certs.get(name).cloned();
                *self.certificates.lock() = Some(certs);
                id
            }
        };

        id.ok_or_else(|| Error::IdentityNotFound {
            kind: "certificate".into(),
            name: name.to_string(),
            provider: None,
        })
    }

    /// Number of memoised principals
    pub fn cached(&self) -> usize {
        self.principals.lock().len()
    }
}
