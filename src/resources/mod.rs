//! Resource Modules
//!
//! One module per appliance resource. Each owns its parameter schema, its
//! field rule table and its endpoint addressing; comparison and the converge
//! cycle come from [`crate::reconcile`].

pub mod access_zone;
pub mod ads;
pub mod filepool;
pub mod filesystem;
pub mod nfs;
pub mod open_files;
pub mod smb;
pub mod synciq;

pub use access_zone::AccessZone;
pub use ads::AdsProvider;
pub use filepool::FilePoolPolicy;
pub use filesystem::Filesystem;
pub use nfs::NfsExport;
pub use open_files::{OpenFiles, OpenFilesReport};
pub use smb::SmbShare;
pub use synciq::SyncIqPolicy;

use crate::config::TaskFile;
use crate::domain::DEFAULT_ZONE;
use crate::error::{Error, Result};
use crate::reconcile::{check, converge, MemberState, Resource, Session};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

// =============================================================================
// Resource Kinds
// =============================================================================

/// Resource named by a task file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    AdsProvider,
    AccessZone,
    SmbShare,
    NfsExport,
    FilepoolPolicy,
    Filesystem,
    SynciqPolicy,
    SmbOpenFiles,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::AdsProvider => "ads_provider",
            ResourceKind::AccessZone => "access_zone",
            ResourceKind::SmbShare => "smb_share",
            ResourceKind::NfsExport => "nfs_export",
            ResourceKind::FilepoolPolicy => "filepool_policy",
            ResourceKind::Filesystem => "filesystem",
            ResourceKind::SynciqPolicy => "synciq_policy",
            ResourceKind::SmbOpenFiles => "smb_open_files",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Task
// =============================================================================

enum Action {
    Converge(Box<dyn Resource>),
    OpenFiles(OpenFiles),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Converge(resource) => f
                .debug_tuple("Converge")
                .field(&format_args!("{}/{}", resource.kind(), resource.name()))
                .finish(),
            Action::OpenFiles(open_files) => f.debug_tuple("OpenFiles").field(open_files).finish(),
        }
    }
}

/// One parsed task, ready to validate or run
#[derive(Debug)]
pub struct Task {
    kind: ResourceKind,
    zone: String,
    action: Action,
}

impl Task {
    pub fn from_file(file: &TaskFile) -> Result<Self> {
        Self::new(file.resource, file.params.clone())
    }

    /// Parse resource parameters; `access_zone` selects the session zone
    pub fn new(kind: ResourceKind, mut params: Map<String, Value>) -> Result<Self> {
        let zone = match params.remove("access_zone") {
            None | Some(Value::Null) => DEFAULT_ZONE.to_string(),
            Some(Value::String(zone)) => zone,
            Some(other) => {
                return Err(Error::invalid(
                    "access_zone",
                    format!("expected a string, got {}", other),
                ))
            }
        };

        let action = match kind {
            ResourceKind::AdsProvider => Action::Converge(Box::new(AdsProvider::new(params)?)),
            ResourceKind::AccessZone => Action::Converge(Box::new(AccessZone::new(params)?)),
            ResourceKind::SmbShare => Action::Converge(Box::new(SmbShare::new(params)?)),
            ResourceKind::NfsExport => Action::Converge(Box::new(NfsExport::new(params)?)),
            ResourceKind::FilepoolPolicy => {
                Action::Converge(Box::new(FilePoolPolicy::new(params)?))
            }
            ResourceKind::Filesystem => Action::Converge(Box::new(Filesystem::new(params)?)),
            ResourceKind::SynciqPolicy => Action::Converge(Box::new(SyncIqPolicy::new(params)?)),
            ResourceKind::SmbOpenFiles => Action::OpenFiles(OpenFiles::new(params)?),
        };
        debug!("Parsed {} task in zone {}", kind, zone);

        Ok(Self { kind, zone, action })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Offline validation; makes no remote call
    pub fn check(&self) -> Result<()> {
        match &self.action {
            Action::Converge(resource) => check(resource.as_ref()),
            Action::OpenFiles(_) => Ok(()),
        }
    }

    /// Run the task and return the result mapping
    pub async fn run(&self, session: &Session) -> Result<Value> {
        match &self.action {
            Action::Converge(resource) => {
                let report = converge(resource.as_ref(), session).await?;
                Ok(serde_json::to_value(report)?)
            }
            Action::OpenFiles(files) => Ok(serde_json::to_value(files.run(session).await?)?),
        }
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Deserialize task parameters into a resource's schema
pub(crate) fn parse_params<T: DeserializeOwned>(
    kind: ResourceKind,
    params: &Map<String, Value>,
) -> Result<T> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| Error::Validation(format!("invalid {} parameters: {}", kind, e)))
}

/// Anchor `path` under the zone base path unless it is already inside it
pub(crate) fn absolute_path(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path == base || path.starts_with(&format!("{}/", base)) {
        path.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", base, path.trim_matches('/'))
    }
}

/// Object id as a string; the appliance returns some ids as numbers
pub(crate) fn object_id(id: &Value) -> Option<String> {
    match id {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Merge instruction in the diff engine's tagged form
pub(crate) fn tagged<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (Value, MemberState)>,
{
    Value::Array(
        entries
            .into_iter()
            .map(|(value, state)| {
                let mut entry = Map::new();
                entry.insert("value".into(), value);
                entry.insert("state".into(), Value::from(state.as_str()));
                Value::Object(entry)
            })
            .collect(),
    )
}

/// Replace instruction in the diff engine's form
pub(crate) fn replace_form(items: Vec<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("replace".into(), Value::Array(items));
    Value::Object(obj)
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::client::memory::InMemoryAppliance;
    use crate::domain::{Principal, PrincipalType, ResourceType, StableId};
    use crate::reconcile::Session;
    use serde_json::{json, Map, Value};
    use std::sync::Arc;

    /// Appliance with the System and sales zones and a few principals
    pub fn appliance() -> Arc<InMemoryAppliance> {
        let appliance = Arc::new(InMemoryAppliance::new());
        appliance.seed(
            ResourceType::AccessZone,
            None,
            "System",
            json!({"name": "System", "path": "/ifs"}),
        );
        appliance.seed(
            ResourceType::AccessZone,
            None,
            "sales",
            json!({"name": "sales", "path": "/ifs/sales/"}),
        );
        appliance.add_principal(Principal {
            name: "alice".into(),
            kind: PrincipalType::User,
            provider: Some("lsa-local-provider:System".into()),
            id: StableId::Uid(2000),
            on_disk_id: Some(StableId::Sid("S-1-22-1-2000".into())),
        });
        appliance.add_principal(Principal {
            name: "admins".into(),
            kind: PrincipalType::Group,
            provider: Some("lsa-local-provider:System".into()),
            id: StableId::Gid(3000),
            on_disk_id: None,
        });
        appliance.add_principal(Principal {
            name: "Everyone".into(),
            kind: PrincipalType::Wellknown,
            provider: None,
            id: StableId::Sid("S-1-1-0".into()),
            on_disk_id: None,
        });
        appliance
    }

    pub fn session(appliance: &Arc<InMemoryAppliance>, zone: &str, dry_run: bool) -> Session {
        Session::new(appliance.clone(), zone, dry_run)
    }

    pub fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }
}
