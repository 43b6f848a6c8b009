//! Filesystem Directory
//!
//! Manages a directory in the namespace: ownership, POSIX mode or ACL
//! entries, and its directory quota. The quota lives behind the quota
//! endpoint and is attached to the snapshot under `quota`.
//!
//! A directory still exported over NFS or shared over SMB is never deleted.

use crate::domain::{Endpoint, Lookup, PrincipalType, ResourceType, Snapshot, State};
use crate::error::{Error, Result};
use crate::reconcile::quota::QuotaParams;
use crate::reconcile::{
    field, Constraint, DesiredState, FieldDiff, FieldRule, FieldSpec, Identity, MemberState,
    Resource, Session, Trustee, TrusteeRef, ValueKind,
};
use crate::resources::{absolute_path, object_id, parse_params, tagged, ResourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Quota keys the appliance accepts on create and update
const QUOTA_SETTINGS: [&str; 5] = [
    "thresholds",
    "enforced",
    "include_snapshots",
    "thresholds_on",
    "container",
];

const THRESHOLDS: [&str; 4] = ["advisory", "soft", "hard", "soft_grace"];

static RULES: &[FieldSpec] = &[
    field("owner", FieldRule::Scalar(ValueKind::Trustee)),
    field("group", FieldRule::Scalar(ValueKind::Trustee)),
    field("mode", FieldRule::Scalar(ValueKind::OctalMode)),
    field(
        "acl",
        FieldRule::Merge {
            kind: ValueKind::Trustee,
            identity: Identity::Keys(&["/trustee/id", "/accesstype"]),
        },
    ),
    field("quota", FieldRule::Quota),
    field("recursive", FieldRule::CreateOnly),
];

static CONSTRAINTS: &[Constraint] = &[
    Constraint::MutuallyExclusive(&["access_control", "access_control_rights"]),
    Constraint::RequiredBy {
        field: "access_control_rights_state",
        requires: &["access_control_rights"],
    },
];

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalName {
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
}

/// One access control entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AceParams {
    pub trustee: TrusteeRef,
    pub access_type: AccessType,
    pub access_rights: Vec<String>,
    #[serde(default)]
    pub inherit_flags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Allow,
    Deny,
}

impl AccessType {
    fn as_str(&self) -> &'static str {
        match self {
            AccessType::Allow => "allow",
            AccessType::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AceState {
    #[default]
    Add,
    Remove,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemParams {
    pub path: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub owner: Option<PrincipalName>,
    #[serde(default)]
    pub group: Option<PrincipalName>,
    /// POSIX mode, octal
    #[serde(default)]
    pub access_control: Option<String>,
    #[serde(default)]
    pub access_control_rights: Option<AceParams>,
    #[serde(default)]
    pub access_control_rights_state: Option<AceState>,
    #[serde(default)]
    pub recursive: Option<bool>,
    #[serde(default)]
    pub quota: Option<QuotaParams>,
    #[serde(default)]
    pub quota_state: Option<State>,
}

impl AceParams {
    fn entry(&self, trustee: Value) -> Value {
        let mut obj = Map::new();
        obj.insert("trustee".into(), trustee);
        obj.insert("accesstype".into(), Value::from(self.access_type.as_str()));
        obj.insert(
            "accessrights".into(),
            Value::Array(self.access_rights.iter().map(|r| Value::from(r.as_str())).collect()),
        );
        obj.insert(
            "inherit_flags".into(),
            Value::Array(self.inherit_flags.iter().map(|f| Value::from(f.as_str())).collect()),
        );
        Value::Object(obj)
    }
}

fn by_name(name: &str) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), Value::from(name));
    Value::Object(obj)
}

fn by_id(id: String) -> Value {
    let mut obj = Map::new();
    obj.insert("id".into(), Value::from(id));
    Value::Object(obj)
}

/// Whether `path` is `root` or lies below it
fn is_within(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    path == root || path.starts_with(&format!("{}/", root))
}

// =============================================================================
// Resource
// =============================================================================

#[derive(Debug)]
pub struct Filesystem {
    params: FilesystemParams,
    raw: DesiredState,
}

impl Filesystem {
    pub fn new(params: Map<String, Value>) -> Result<Self> {
        Ok(Self {
            params: parse_params(ResourceKind::Filesystem, &params)?,
            raw: DesiredState::from_map(params),
        })
    }

    async fn absolute(&self, session: &Session) -> Result<String> {
        let base = session.zone_base_path().await?;
        Ok(absolute_path(&base, &self.params.path))
    }

    fn quota_removed(&self) -> bool {
        self.params.quota_state == Some(State::Absent)
    }

    /// ACL merge instruction for one entry
    ///
    /// Removal matches every id the principal may appear under on disk.
    fn acl_instruction(&self, ace: &AceParams, trustee: Option<&Trustee>) -> Value {
        let state = self.params.access_control_rights_state.unwrap_or_default();
        match (state, trustee) {
            (AceState::Add, Some(trustee)) => {
                tagged([(ace.entry(trustee.persona()), MemberState::Present)])
            }
            (AceState::Remove, Some(trustee)) => tagged(
                trustee
                    .removal_ids()
                    .into_iter()
                    .map(|id| (ace.entry(by_id(id.to_string())), MemberState::Absent)),
            ),
            (AceState::Add, None) => tagged([(ace.entry(by_name(&ace.trustee.name)), MemberState::Present)]),
            (AceState::Remove, None) => tagged([(ace.entry(by_name(&ace.trustee.name)), MemberState::Absent)]),
        }
    }

    async fn find_quota(&self, session: &Session, path: &str) -> Result<Option<Snapshot>> {
        let quotas = session
            .list(
                &Endpoint::collection(ResourceType::Quota)
                    .in_zone(session.zone())
                    .with("path", path)
                    .with("type", "directory"),
            )
            .await?;
        Ok(quotas.into_iter().next())
    }

    fn quota_endpoint(session: &Session, quota: &Value) -> Result<Endpoint> {
        let id = quota
            .get("id")
            .and_then(object_id)
            .ok_or_else(|| Error::Internal("quota without an id".into()))?;
        Ok(Endpoint::item(ResourceType::Quota, id).in_zone(session.zone()))
    }

    /// Settings part of a quota object, as the quota endpoint accepts it
    fn quota_settings(quota: &Map<String, Value>) -> Snapshot {
        let mut settings = Snapshot::new();
        for key in QUOTA_SETTINGS {
            let Some(value) = quota.get(key) else {
                continue;
            };
            let value = match (key, value) {
                ("thresholds", Value::Object(limits)) => Value::Object(
                    limits
                        .iter()
                        .filter(|(k, _)| THRESHOLDS.contains(&k.as_str()))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ),
                (_, other) => other.clone(),
            };
            settings.insert(key.to_string(), value);
        }
        settings
    }

    async fn apply_quota(&self, session: &Session, path: &str, current: Option<&Value>, quota: &Value) -> Result<()> {
        let existing = current.filter(|q| q.is_object());
        match (quota, existing) {
            (Value::Null, Some(existing)) => {
                session.delete(&Self::quota_endpoint(session, existing)?).await
            }
            (Value::Null, None) => Ok(()),
            (Value::Object(quota), Some(existing)) => {
                session
                    .update(&Self::quota_endpoint(session, existing)?, &Self::quota_settings(quota))
                    .await
            }
            (Value::Object(quota), None) => {
                let mut body = Self::quota_settings(quota);
                body.insert("path".into(), Value::from(path));
                body.insert("type".into(), Value::from("directory"));
                body.entry("include_snapshots").or_insert(Value::Bool(false));
                body.entry("enforced").or_insert(Value::Bool(false));
                session
                    .create(
                        &Endpoint::collection(ResourceType::Quota).in_zone(session.zone()),
                        &body,
                    )
                    .await?;
                Ok(())
            }
            (other, _) => Err(Error::invalid("quota", format!("expected a mapping, got {}", other))),
        }
    }

    /// Namespace part of a change set
    fn namespace_payload(changes: &FieldDiff) -> Snapshot {
        let mut payload = changes.to_payload();
        if payload.contains_key("acl") {
            payload.insert("authoritative".into(), Value::from("acl"));
            payload.insert("action".into(), Value::from("replace"));
        } else if payload.contains_key("mode") {
            payload.insert("authoritative".into(), Value::from("mode"));
        }
        payload
    }
}

#[async_trait]
impl Resource for Filesystem {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    fn name(&self) -> String {
        self.params.path.clone()
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

    fn constraints(&self) -> &'static [Constraint] {
        CONSTRAINTS
    }

    fn required_on_create(&self) -> &'static [&'static str] {
        &["owner"]
    }

    fn lower(&self) -> Result<DesiredState> {
        let params = &self.params;
        let mut desired = DesiredState::new();

        if let Some(owner) = &params.owner {
            desired.insert("owner", by_name(&owner.name));
        }
        if let Some(group) = &params.group {
            desired.insert("group", by_name(&group.name));
        }
        if let Some(mode) = &params.access_control {
            desired.insert("mode", Value::from(mode.as_str()));
        }
        if let Some(ace) = &params.access_control_rights {
            desired.insert("acl", self.acl_instruction(ace, None));
        }
        if let Some(recursive) = params.recursive {
            desired.insert("recursive", Value::from(recursive));
        }
        if self.quota_removed() {
            desired.insert("quota", Value::Null);
        } else if let Some(quota) = &params.quota {
            desired.insert("quota", quota.to_desired()?);
        }
        Ok(desired)
    }

    async fn desired(&self, session: &Session) -> Result<DesiredState> {
        let mut desired = self.lower()?;
        let resolver = session.resolver();

        if let Some(owner) = &self.params.owner {
            let owner = resolver
                .resolve(&owner.name, PrincipalType::User, owner.provider.as_deref())
                .await?;
            desired.insert("owner", owner.persona());
        }
        if let Some(group) = &self.params.group {
            let group = resolver
                .resolve(&group.name, PrincipalType::Group, group.provider.as_deref())
                .await?;
            desired.insert("group", group.persona());
        }
        if let Some(ace) = &self.params.access_control_rights {
            let trustee = resolver.resolve_ref(&ace.trustee).await?;
            desired.insert("acl", self.acl_instruction(ace, Some(&trustee)));
        }
        Ok(desired)
    }

    async fn fetch(&self, session: &Session) -> Result<Lookup<Snapshot>> {
        let path = self.absolute(session).await?;
        let Lookup::Found(mut snapshot) = session
            .get(&Endpoint::item(ResourceType::Namespace, path.as_str()))
            .await?
        else {
            return Ok(Lookup::NotFound);
        };

        if let Some(quota) = self.find_quota(session, &path).await? {
            debug!("Directory {} has quota {:?}", path, quota.get("id"));
            snapshot.insert("quota".into(), Value::Object(quota));
        }
        Ok(Lookup::Found(snapshot))
    }

    async fn create(&self, session: &Session, payload: &Snapshot) -> Result<()> {
        let path = self.absolute(session).await?;
        let mut changes = FieldDiff::from(payload.clone());
        let extra = changes.split(&["quota", "recursive"]);

        let mut endpoint = Endpoint::item(ResourceType::Namespace, path.as_str());
        if extra.get("recursive") == Some(&Value::Bool(true)) {
            endpoint = endpoint.with("recursive", "true");
        }
        session.create(&endpoint, &Self::namespace_payload(&changes)).await?;

        if let Some(quota) = extra.get("quota") {
            self.apply_quota(session, &path, None, quota).await?;
        }
        Ok(())
    }

    async fn update(&self, session: &Session, current: &Snapshot, diff: &FieldDiff) -> Result<()> {
        let path = self.absolute(session).await?;
        let mut changes = diff.clone();
        let quota = changes.remove("quota");

        if !changes.is_empty() {
            session
                .update(
                    &Endpoint::item(ResourceType::Namespace, path.as_str()),
                    &Self::namespace_payload(&changes),
                )
                .await?;
        }
        if let Some(quota) = quota {
            self.apply_quota(session, &path, current.get("quota"), &quota).await?;
        }
        Ok(())
    }

    async fn check_delete(&self, session: &Session, _current: &Snapshot) -> Result<()> {
        let path = self.absolute(session).await?;
        let mut dependents = Vec::new();

        let exports = session
            .list(&Endpoint::collection(ResourceType::NfsExport).in_zone(session.zone()))
            .await?;
        for export in &exports {
            let paths = export.get("paths").and_then(Value::as_array);
            if paths.is_some_and(|paths| paths.iter().filter_map(Value::as_str).any(|p| is_within(p, &path))) {
                let id = export.get("id").and_then(object_id).unwrap_or_default();
                dependents.push(format!("nfs_export {}", id));
            }
        }

        let shares = session
            .list(&Endpoint::collection(ResourceType::SmbShare).in_zone(session.zone()))
            .await?;
        for share in &shares {
            let share_path = share.get("path").and_then(Value::as_str).unwrap_or_default();
            if is_within(share_path, &path) {
                let name = share.get("name").and_then(Value::as_str).unwrap_or_default();
                dependents.push(format!("smb_share {}", name));
            }
        }

        if dependents.is_empty() {
            Ok(())
        } else {
            Err(Error::DependencyExists {
                kind: self.kind().to_string(),
                name: path,
                dependents,
            })
        }
    }

    async fn delete(&self, session: &Session, current: &Snapshot) -> Result<()> {
        let path = self.absolute(session).await?;
        if let Some(quota) = current.get("quota") {
            info!("Removing quota on {}", path);
            session.delete(&Self::quota_endpoint(session, quota)?).await?;
        }
        session
            .delete(&Endpoint::item(ResourceType::Namespace, path.as_str()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryAppliance;
    use crate::reconcile::{check, converge, Operation};
    use crate::resources::testing::{appliance, params, session};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;

    fn directory(value: Value) -> Filesystem {
        Filesystem::new(params(value)).unwrap()
    }

    fn seeded() -> Arc<InMemoryAppliance> {
        let appliance = appliance();
        appliance.seed(
            ResourceType::Namespace,
            None,
            "/ifs/data",
            json!({
                "owner": {"id": "UID:2000", "name": "alice", "type": "user"},
                "group": {"id": "GID:3000", "name": "admins", "type": "group"},
                "mode": "0755",
                "acl": [
                    {"trustee": {"id": "SID:S-1-22-1-2000"}, "accesstype": "allow",
                     "accessrights": ["file_read"], "inherit_flags": []},
                    {"trustee": {"id": "SID:S-1-1-0"}, "accesstype": "allow",
                     "accessrights": ["file_read"], "inherit_flags": []}
                ]
            }),
        );
        appliance
    }

    #[tokio::test]
    async fn test_create_with_quota() {
        let appliance = appliance();
        let data = directory(json!({
            "path": "projects",
            "owner": {"name": "alice"},
            "access_control": "0750",
            "recursive": true,
            "quota": {"hard_limit_size": 10, "cap_unit": "GB"}
        }));

        let report = converge(&data, &session(&appliance, "sales", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Created);

        let stored = appliance
            .peek(ResourceType::Namespace, None, "/ifs/sales/projects")
            .unwrap();
        assert_eq!(stored["owner"], json!({"id": "UID:2000"}));
        assert_eq!(stored["mode"], json!(488));
        assert!(!stored.contains_key("recursive"));

        let quotas = appliance.all(ResourceType::Quota);
        assert_eq!(quotas.len(), 1);
        assert_eq!(quotas[0]["path"], json!("/ifs/sales/projects"));
        assert_eq!(quotas[0]["thresholds"]["hard"], json!(10_737_418_240u64));
        assert_eq!(quotas[0]["enforced"], json!(true));

        let again = converge(&data, &session(&appliance, "sales", false)).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_remove_ace_matches_on_disk_identity() {
        let appliance = seeded();
        let data = directory(json!({
            "path": "/ifs/data",
            "access_control_rights": {
                "trustee": {"name": "alice"},
                "access_type": "allow",
                "access_rights": ["file_read"]
            },
            "access_control_rights_state": "remove"
        }));

        let report = converge(&data, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Modified);

        let payload = report.mutations[0].payload.clone().unwrap();
        assert_eq!(payload["authoritative"], json!("acl"));
        assert_eq!(payload["acl"].as_array().unwrap().len(), 1);
        assert_eq!(payload["acl"][0]["trustee"], json!({"id": "SID:S-1-1-0"}));

        let again = converge(&data, &session(&appliance, "System", false)).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_mode_and_quota_lifecycle() {
        let appliance = seeded();
        let session_for = |dry_run| session(&appliance, "System", dry_run);

        let unchanged = directory(json!({"path": "/ifs/data", "access_control": "755"}));
        assert!(!converge(&unchanged, &session_for(false)).await.unwrap().changed);

        let with_quota = directory(json!({
            "path": "/ifs/data",
            "quota": {"soft_limit_size": 1, "soft_grace_period": 7, "cap_unit": "TB"}
        }));
        let report = converge(&with_quota, &session_for(false)).await.unwrap();
        assert_eq!(report.operation, Operation::Modified);
        assert_eq!(appliance.all(ResourceType::Quota).len(), 1);

        let larger = directory(json!({
            "path": "/ifs/data",
            "quota": {"soft_limit_size": 2, "soft_grace_period": 7, "cap_unit": "TB"}
        }));
        converge(&larger, &session_for(false)).await.unwrap();
        let quotas = appliance.all(ResourceType::Quota);
        assert_eq!(quotas[0]["thresholds"]["soft"], json!(2u64 << 40));
        assert_eq!(quotas[0]["thresholds"]["soft_grace"], json!(7 * 86_400));

        let hard_only = directory(json!({
            "path": "/ifs/data",
            "quota": {"hard_limit_size": 3, "cap_unit": "TB"}
        }));
        converge(&hard_only, &session_for(false)).await.unwrap();
        let quotas = appliance.all(ResourceType::Quota);
        assert_eq!(quotas[0]["thresholds"]["hard"], json!(3u64 << 40));
        assert_eq!(quotas[0]["thresholds"]["soft"], json!(2u64 << 40));
        assert_eq!(quotas[0]["thresholds"]["soft_grace"], json!(7 * 86_400));
        assert!(!converge(&hard_only, &session_for(false)).await.unwrap().changed);

        let removed = directory(json!({"path": "/ifs/data", "quota_state": "absent"}));
        converge(&removed, &session_for(false)).await.unwrap();
        assert!(appliance.all(ResourceType::Quota).is_empty());
        assert!(!converge(&removed, &session_for(false)).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_delete_guard_and_quota_first() {
        let appliance = seeded();
        appliance.seed(
            ResourceType::SmbShare,
            None,
            "data",
            json!({"name": "data", "path": "/ifs/data/shared"}),
        );
        let data = directory(json!({"path": "/ifs/data", "state": "absent"}));

        let err = converge(&data, &session(&appliance, "System", false)).await.unwrap_err();
        assert_matches!(err, Error::DependencyExists { dependents, .. } if dependents == vec!["smb_share data".to_string()]);

        appliance.seed(ResourceType::SmbShare, None, "data", json!({"name": "data", "path": "/ifs/database"}));
        appliance.seed(
            ResourceType::Quota,
            None,
            "q1",
            json!({"path": "/ifs/data", "type": "directory"}),
        );
        let report = converge(&data, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Deleted);
        assert_eq!(report.mutations[0].endpoint, "quota/q1?zone=System");
        assert!(appliance.peek(ResourceType::Namespace, None, "/ifs/data").is_none());
    }

    #[test]
    fn test_offline_constraints() {
        let data = directory(json!({
            "path": "/ifs/data",
            "access_control": "0755",
            "access_control_rights": {"trustee": {"name": "alice"}, "access_type": "allow", "access_rights": []}
        }));
        assert_matches!(check(&data), Err(Error::Validation(msg)) if msg.contains("mutually exclusive"));

        let data = directory(json!({"path": "/ifs/data", "quota": {"soft_limit_size": 5}}));
        assert_matches!(check(&data), Err(Error::Validation(msg)) if msg.contains("soft_grace_period"));

        let data = directory(json!({"path": "/ifs/data", "access_control": "0999"}));
        assert_matches!(check(&data), Err(Error::InvalidValue { .. }));
    }
}
