//! Domain Ports - Core trait definitions for the convergence engine
//!
//! These traits define the boundary between the reconciliation logic and the
//! appliance's management API. Adapters implement them to provide the
//! concrete transport.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A live resource configuration as returned by the management API
pub type Snapshot = Map<String, Value>;

/// Zone used when the operator does not name one
pub const DEFAULT_ZONE: &str = "System";

// =============================================================================
// Resource Types
// =============================================================================

/// Endpoint families exposed by the management API
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    AdsProvider,
    ProvidersSummary,
    AccessZone,
    SmbZoneSettings,
    NfsZoneSettings,
    SmbShare,
    SmbOpenFile,
    NfsExport,
    FilePoolPolicy,
    Namespace,
    Quota,
    SyncIqPolicy,
    SyncIqJob,
    Certificate,
    Node,
}

impl ResourceType {
    /// Whether objects of this type live inside an access zone
    pub fn is_zoned(&self) -> bool {
        matches!(
            self,
            ResourceType::SmbZoneSettings
                | ResourceType::NfsZoneSettings
                | ResourceType::SmbShare
                | ResourceType::NfsExport
                | ResourceType::Quota
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::AdsProvider => "ads_provider",
            ResourceType::ProvidersSummary => "providers_summary",
            ResourceType::AccessZone => "access_zone",
            ResourceType::SmbZoneSettings => "smb_zone_settings",
            ResourceType::NfsZoneSettings => "nfs_zone_settings",
            ResourceType::SmbShare => "smb_share",
            ResourceType::SmbOpenFile => "smb_open_file",
            ResourceType::NfsExport => "nfs_export",
            ResourceType::FilePoolPolicy => "filepool_policy",
            ResourceType::Namespace => "filesystem",
            ResourceType::Quota => "quota",
            ResourceType::SyncIqPolicy => "synciq_policy",
            ResourceType::SyncIqJob => "synciq_job",
            ResourceType::Certificate => "certificate",
            ResourceType::Node => "node",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// Address of a collection or a single object on the management API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub resource: ResourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
}

impl Endpoint {
    /// Address a whole collection
    pub fn collection(resource: ResourceType) -> Self {
        Self {
            resource,
            id: None,
            query: BTreeMap::new(),
        }
    }

    /// Address a single object
    pub fn item(resource: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource,
            id: Some(id.into()),
            query: BTreeMap::new(),
        }
    }

    /// Scope the request to an access zone
    pub fn in_zone(self, zone: &str) -> Self {
        self.with("zone", zone)
    }

    /// Add a query parameter
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.insert(key.to_string(), value.into());
        self
    }

    pub fn zone(&self) -> &str {
        self.query.get("zone").map(String::as_str).unwrap_or(DEFAULT_ZONE)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}", self.resource, id)?,
            None => write!(f, "{}", self.resource)?,
        }
        if !self.query.is_empty() {
            let query: Vec<String> = self.query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            write!(f, "?{}", query.join("&"))?;
        }
        Ok(())
    }
}

// =============================================================================
// Lookup Result
// =============================================================================

/// Outcome of fetching a single object
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    /// Turn `NotFound` into an error for callers that require the object
    pub fn require(self, kind: &str, name: &str) -> Result<T> {
        self.found().ok_or_else(|| Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }
}

// =============================================================================
// Requested State
// =============================================================================

/// Operator-requested existence of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Present,
    Absent,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Present => write!(f, "present"),
            State::Absent => write!(f, "absent"),
        }
    }
}

// =============================================================================
// Principals
// =============================================================================

/// Kind of security principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    User,
    Group,
    Wellknown,
}

impl std::fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrincipalType::User => write!(f, "user"),
            PrincipalType::Group => write!(f, "group"),
            PrincipalType::Wellknown => write!(f, "wellknown"),
        }
    }
}

/// Stable identity of a principal, in the appliance's `TYPE:value` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StableId {
    Sid(String),
    Uid(u32),
    Gid(u32),
}

impl std::fmt::Display for StableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StableId::Sid(sid) => write!(f, "SID:{}", sid),
            StableId::Uid(uid) => write!(f, "UID:{}", uid),
            StableId::Gid(gid) => write!(f, "GID:{}", gid),
        }
    }
}

impl std::str::FromStr for StableId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, value) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid("persona id", format!("'{}' has no type prefix", s)))?;
        let numeric = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| Error::invalid("persona id", format!("'{}' is not numeric", s)))
        };
        match prefix.to_ascii_uppercase().as_str() {
            "SID" => Ok(StableId::Sid(value.to_string())),
            "UID" => Ok(StableId::Uid(numeric(value)?)),
            "GID" => Ok(StableId::Gid(numeric(value)?)),
            _ => Err(Error::invalid("persona id", format!("unknown id type in '{}'", s))),
        }
    }
}

impl Serialize for StableId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StableId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Query for a principal lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrincipalQuery {
    pub name: String,
    pub kind: PrincipalType,
    pub provider: Option<String>,
    pub zone: String,
}

/// A principal as known to the appliance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    pub kind: PrincipalType,
    pub provider: Option<String>,
    /// Persona identity used in share permissions and ACL entries
    pub id: StableId,
    /// Identity written on disk when it differs from the persona identity
    pub on_disk_id: Option<StableId>,
}

// =============================================================================
// Management API Port
// =============================================================================

/// Port for the appliance's management REST API
///
/// All payloads are plain JSON mappings. A missing object is reported as
/// `Lookup::NotFound` by `get`, never as an error.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Fetch a single object
    async fn get(&self, endpoint: &Endpoint) -> Result<Lookup<Snapshot>>;

    /// List a collection
    async fn list(&self, endpoint: &Endpoint) -> Result<Vec<Snapshot>>;

    /// Create an object, returning its id
    async fn create(&self, endpoint: &Endpoint, payload: &Snapshot) -> Result<String>;

    /// Apply a partial update to an object
    async fn update(&self, endpoint: &Endpoint, payload: &Snapshot) -> Result<()>;

    /// Delete an object
    async fn delete(&self, endpoint: &Endpoint) -> Result<()>;

    /// Look up a user, group or well-known principal
    async fn lookup_principal(&self, query: &PrincipalQuery) -> Result<Option<Principal>>;
}

pub type ManagementApiRef = Arc<dyn ManagementApi>;
