//! SMB Share
//!
//! Shares are addressed by name inside an access zone. Paths are anchored
//! under the zone base path, trustees in permission and run-as-root lists
//! are resolved to persona ids before comparison.

use crate::domain::{Endpoint, Lookup, ResourceType, Snapshot, State};
use crate::error::Result;
use crate::reconcile::normalize::{EnumTable, CREATE_PERMISSIONS, PERMISSION_TYPE, SMB_PERMISSION};
use crate::reconcile::{
    field, fixed, Desired, DesiredState, FieldDiff, FieldRule, FieldSpec, Identity, MemberState,
    Resource, Session, TrusteeRef, ValueKind,
};
use crate::resources::{absolute_path, parse_params, tagged, ResourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

static CA_WRITE_INTEGRITY: EnumTable = EnumTable {
    field: "ca_write_integrity",
    entries: &[
        ("none", "none"),
        ("write-read-coherent", "write-read-coherent"),
        ("write_read_coherent", "write-read-coherent"),
        ("full", "full"),
    ],
};

static CHANGE_NOTIFY: EnumTable = EnumTable {
    field: "change_notify",
    entries: &[("all", "all"), ("norecurse", "norecurse"), ("none", "none")],
};

static FILE_FILTER_TYPE: EnumTable = EnumTable {
    field: "file_filter_type",
    entries: &[("deny", "deny"), ("allow", "allow")],
};

static IMPERSONATE_GUEST: EnumTable = EnumTable {
    field: "impersonate_guest",
    entries: &[
        ("always", "always"),
        ("bad user", "bad user"),
        ("bad_user", "bad user"),
        ("never", "never"),
    ],
};

static RULES: &[FieldSpec] = &[
    field("name", FieldRule::Scalar(ValueKind::Plain)),
    fixed("path", FieldRule::Scalar(ValueKind::Plain)),
    field("description", FieldRule::Scalar(ValueKind::Plain)),
    field("access_based_enumeration", FieldRule::Scalar(ValueKind::Plain)),
    field("access_based_enumeration_root_only", FieldRule::Scalar(ValueKind::Plain)),
    field("allow_variable_expansion", FieldRule::Scalar(ValueKind::Plain)),
    field("auto_create_directory", FieldRule::Scalar(ValueKind::Plain)),
    field("browsable", FieldRule::Scalar(ValueKind::Plain)),
    field("ca_timeout", FieldRule::Scalar(ValueKind::Duration)),
    field("ca_write_integrity", FieldRule::Scalar(ValueKind::Enum(&CA_WRITE_INTEGRITY))),
    field("change_notify", FieldRule::Scalar(ValueKind::Enum(&CHANGE_NOTIFY))),
    field("continuously_available", FieldRule::Scalar(ValueKind::Plain)),
    field("create_permissions", FieldRule::Scalar(ValueKind::Enum(&CREATE_PERMISSIONS))),
    field("directory_create_mask", FieldRule::Scalar(ValueKind::OctalMode)),
    field("directory_create_mode", FieldRule::Scalar(ValueKind::OctalMode)),
    field("file_create_mask", FieldRule::Scalar(ValueKind::OctalMode)),
    field("file_create_mode", FieldRule::Scalar(ValueKind::OctalMode)),
    field("file_filtering_enabled", FieldRule::Scalar(ValueKind::Plain)),
    field(
        "file_filter_extensions",
        FieldRule::Merge {
            kind: ValueKind::Plain,
            identity: Identity::Whole,
        },
    ),
    field("file_filter_type", FieldRule::Scalar(ValueKind::Enum(&FILE_FILTER_TYPE))),
    field("hide_dot_files", FieldRule::Scalar(ValueKind::Plain)),
    field("host_acl", FieldRule::List(ValueKind::Plain)),
    field("impersonate_guest", FieldRule::Scalar(ValueKind::Enum(&IMPERSONATE_GUEST))),
    field("impersonate_user", FieldRule::Scalar(ValueKind::Plain)),
    field("inheritable_path_acl", FieldRule::Scalar(ValueKind::Plain)),
    field("mangle_byte_start", FieldRule::Scalar(ValueKind::Plain)),
    field("mangle_map", FieldRule::List(ValueKind::Plain)),
    field("ntfs_acl_support", FieldRule::Scalar(ValueKind::Plain)),
    field("oplocks", FieldRule::Scalar(ValueKind::Plain)),
    field("smb3_encryption_enabled", FieldRule::Scalar(ValueKind::Plain)),
    field("strict_ca_lockout", FieldRule::Scalar(ValueKind::Plain)),
    field(
        "permissions",
        FieldRule::Merge {
            kind: ValueKind::Trustee,
            identity: Identity::Keys(&["/trustee/id", "/permission_type"]),
        },
    ),
    field(
        "run_as_root",
        FieldRule::Merge {
            kind: ValueKind::Trustee,
            identity: Identity::Whole,
        },
    ),
];

// =============================================================================
// Parameters
// =============================================================================

/// Share-level permission entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionEntry {
    pub trustee: TrusteeRef,
    pub permission: String,
    pub permission_type: String,
    #[serde(default)]
    pub state: MemberState,
}

impl PermissionEntry {
    /// Wire entry with permission aliases resolved
    fn wire(&self, trustee: Value) -> Result<Value> {
        let mut entry = Map::new();
        entry.insert("trustee".into(), trustee);
        entry.insert(
            "permission".into(),
            Value::from(SMB_PERMISSION.resolve(&self.permission)?),
        );
        entry.insert(
            "permission_type".into(),
            Value::from(PERMISSION_TYPE.resolve(&self.permission_type)?),
        );
        Ok(Value::Object(entry))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunAsRootEntry {
    pub trustee: TrusteeRef,
    #[serde(default)]
    pub state: MemberState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileFilter {
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub state: MemberState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShareParams {
    pub share_name: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub new_share_name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub permissions: Desired<Vec<PermissionEntry>>,
    #[serde(default)]
    pub run_as_root: Desired<Vec<RunAsRootEntry>>,
    #[serde(default)]
    pub file_filter_extension: Option<FileFilter>,
    /// Share settings passed through under their wire names
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

// =============================================================================
// Resource
// =============================================================================

#[derive(Debug)]
pub struct SmbShare {
    params: ShareParams,
    raw: DesiredState,
}

impl SmbShare {
    pub fn new(params: Map<String, Value>) -> Result<Self> {
        Ok(Self {
            params: parse_params(ResourceKind::SmbShare, &params)?,
            raw: DesiredState::from_map(params),
        })
    }

    fn endpoint(&self, session: &Session, name: &str) -> Endpoint {
        Endpoint::item(ResourceType::SmbShare, name).in_zone(session.zone())
    }

    /// Name the live share is addressed by
    fn live_name(&self, current: &Snapshot) -> String {
        current
            .get("id")
            .or_else(|| current.get("name"))
            .and_then(Value::as_str)
            .unwrap_or(&self.params.share_name)
            .to_string()
    }
}

fn reference(trustee: &TrusteeRef) -> Result<Value> {
    Ok(serde_json::to_value(trustee)?)
}

#[async_trait]
impl Resource for SmbShare {
    fn kind(&self) -> &'static str {
        "smb_share"
    }

    fn name(&self) -> String {
        self.params.share_name.clone()
    }

    fn requested_state(&self) -> State {
        self.params.state
    }

    fn parameters(&self) -> &DesiredState {
        &self.raw
    }

    fn field_rules(&self) -> &'static [FieldSpec] {
        RULES
    }

    fn required_on_create(&self) -> &'static [&'static str] {
        &["path"]
    }

    /// Trustees stay unresolved references here; `desired` swaps in personas
    fn lower(&self) -> Result<DesiredState> {
        let params = &self.params;
        let mut desired = DesiredState::from_map(params.settings.clone());

        if let Some(name) = &params.new_share_name {
            desired.insert("name", Value::from(name.as_str()));
        }
        if let Some(path) = &params.path {
            desired.insert("path", Value::from(path.as_str()));
        }

        match &params.permissions {
            Desired::Unset => {}
            Desired::Clear => {
                desired.insert("permissions", Value::Null);
            }
            Desired::Set(entries) => {
                let mut lowered = Vec::with_capacity(entries.len());
                for entry in entries {
                    lowered.push((entry.wire(reference(&entry.trustee)?)?, entry.state));
                }
                desired.insert("permissions", tagged(lowered));
            }
        }

        match &params.run_as_root {
            Desired::Unset => {}
            Desired::Clear => {
                desired.insert("run_as_root", Value::Null);
            }
            Desired::Set(entries) => {
                let mut lowered = Vec::with_capacity(entries.len());
                for entry in entries {
                    lowered.push((reference(&entry.trustee)?, entry.state));
                }
                desired.insert("run_as_root", tagged(lowered));
            }
        }

        if let Some(filter) = &params.file_filter_extension {
            desired.insert(
                "file_filter_extensions",
                tagged(
                    filter
                        .extensions
                        .iter()
                        .map(|ext| (Value::from(ext.as_str()), filter.state)),
                ),
            );
            if let Some(kind) = &filter.kind {
                desired.insert("file_filter_type", Value::from(kind.as_str()));
            }
        }

        Ok(desired)
    }

    async fn desired(&self, session: &Session) -> Result<DesiredState> {
        let mut desired = self.lower()?;

        if let Some(path) = &self.params.path {
            let base = session.zone_base_path().await?;
            desired.insert("path", Value::from(absolute_path(&base, path)));
        }

        if let Desired::Set(entries) = &self.params.permissions {
            let mut resolved = Vec::with_capacity(entries.len());
            for entry in entries {
                let trustee = session.resolver().resolve_ref(&entry.trustee).await?;
                resolved.push((entry.wire(trustee.persona())?, entry.state));
            }
            desired.insert("permissions", tagged(resolved));
        }

        if let Desired::Set(entries) = &self.params.run_as_root {
            let mut resolved = Vec::with_capacity(entries.len());
            for entry in entries {
                let trustee = session.resolver().resolve_ref(&entry.trustee).await?;
                resolved.push((trustee.persona(), entry.state));
            }
            desired.insert("run_as_root", tagged(resolved));
        }

        Ok(desired)
    }

    async fn fetch(&self, session: &Session) -> Result<Lookup<Snapshot>> {
        let found = session
            .get(&self.endpoint(session, &self.params.share_name))
            .await?;
        match (&found, &self.params.new_share_name) {
            (Lookup::NotFound, Some(renamed)) => session.get(&self.endpoint(session, renamed)).await,
            _ => Ok(found),
        }
    }

    async fn create(&self, session: &Session, payload: &Snapshot) -> Result<()> {
        let mut body = payload.clone();
        body.entry("name")
            .or_insert_with(|| Value::from(self.params.share_name.as_str()));
        session
            .create(
                &Endpoint::collection(ResourceType::SmbShare).in_zone(session.zone()),
                &body,
            )
            .await?;
        Ok(())
    }

    async fn update(&self, session: &Session, current: &Snapshot, diff: &FieldDiff) -> Result<()> {
        let endpoint = self.endpoint(session, &self.live_name(current));
        session.update(&endpoint, &diff.to_payload()).await
    }

    async fn delete(&self, session: &Session, current: &Snapshot) -> Result<()> {
        session
            .delete(&self.endpoint(session, &self.live_name(current)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reconcile::{check, converge, Operation};
    use crate::resources::testing::{appliance, params, session};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn share(value: Value) -> SmbShare {
        SmbShare::new(params(value)).unwrap()
    }

    #[tokio::test]
    async fn test_create_in_zone_resolves_path_and_trustees() {
        let appliance = appliance();
        let data = share(json!({
            "share_name": "data",
            "path": "data",
            "description": "team data",
            "permissions": [
                {"trustee": {"name": "alice"}, "permission": "full", "permission_type": "allow"}
            ]
        }));

        let report = converge(&data, &session(&appliance, "sales", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Created);

        let stored = appliance.peek(ResourceType::SmbShare, Some("sales"), "data").unwrap();
        assert_eq!(stored["path"], json!("/ifs/sales/data"));
        assert_eq!(
            stored["permissions"],
            json!([{"trustee": {"id": "UID:2000"}, "permission": "full", "permission_type": "allow"}])
        );

        let again = converge(&data, &session(&appliance, "sales", false)).await.unwrap();
        assert!(!again.changed);
        assert!(again.mutations.is_empty());
    }

    #[tokio::test]
    async fn test_permission_merge_by_trustee_and_type() {
        let appliance = appliance();
        appliance.seed(
            ResourceType::SmbShare,
            None,
            "data",
            json!({
                "name": "data",
                "path": "/ifs/data",
                "permissions": [{
                    "trustee": {"id": "SID:S-1-1-0", "name": "Everyone", "type": "wellknown"},
                    "permission": "read",
                    "permission_type": "allow"
                }]
            }),
        );
        let data = share(json!({
            "share_name": "data",
            "permissions": [
                {"trustee": {"name": "Everyone", "type": "wellknown"}, "permission": "full",
                 "permission_type": "allow", "state": "absent"},
                {"trustee": {"name": "alice"}, "permission": "write", "permission_type": "allow"}
            ]
        }));

        let report = converge(&data, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Modified);
        assert_eq!(
            report.snapshot.unwrap()["permissions"],
            json!([{"trustee": {"id": "UID:2000"}, "permission": "change", "permission_type": "allow"}])
        );
    }

    #[tokio::test]
    async fn test_rename_then_idempotent() {
        let appliance = appliance();
        appliance.seed(
            ResourceType::SmbShare,
            None,
            "old",
            json!({"name": "old", "path": "/ifs/data"}),
        );
        let renamed = share(json!({"share_name": "old", "new_share_name": "new"}));

        let report = converge(&renamed, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Modified);
        assert!(appliance.peek(ResourceType::SmbShare, None, "old").is_none());
        assert!(appliance.peek(ResourceType::SmbShare, None, "new").is_some());

        let again = converge(&renamed, &session(&appliance, "System", false)).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_path_change_rejected() {
        let appliance = appliance();
        appliance.seed(ResourceType::SmbShare, None, "data", json!({"name": "data", "path": "/ifs/data"}));
        let moved = share(json!({"share_name": "data", "path": "/ifs/elsewhere"}));

        let err = converge(&moved, &session(&appliance, "System", false)).await.unwrap_err();
        assert_matches!(err, Error::UnsupportedModification { fields, .. } if fields == vec!["path".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_trustee() {
        let appliance = appliance();
        let data = share(json!({
            "share_name": "data",
            "path": "/ifs/data",
            "run_as_root": [{"trustee": {"name": "mallory"}}]
        }));
        let err = converge(&data, &session(&appliance, "System", false)).await.unwrap_err();
        assert_matches!(err, Error::IdentityNotFound { name, .. } if name == "mallory");
        assert_eq!(appliance.calls("get"), 1);
    }

    #[test]
    fn test_offline_check() {
        let data = share(json!({
            "share_name": "data",
            "permissions": [{"trustee": {"name": "alice"}, "permission": "admin", "permission_type": "allow"}]
        }));
        assert_matches!(check(&data), Err(Error::UnknownEnumValue { field, .. }) if field == "permission");

        let data = share(json!({
            "share_name": "data",
            "host_acl": ["deny:ALL"],
            "file_filter_extension": {"extensions": [".exe"], "type": "deny"},
            "ca_timeout": {"value": 2, "unit": "minutes"}
        }));
        assert!(check(&data).is_ok());
    }
}
