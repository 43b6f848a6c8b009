//! NFS Export
//!
//! Exports carry no operator-facing name; one is identified by its path
//! within the access zone, and its numeric id is discovered by listing.
//! Client lists are merged or replaced according to `client_state`.

use crate::domain::{Endpoint, Lookup, PrincipalType, ResourceType, Snapshot, State};
use crate::error::{Error, Result};
use crate::reconcile::normalize::SECURITY_FLAVOR;
use crate::reconcile::{
    field, Constraint, Desired, DesiredState, FieldDiff, FieldRule, FieldSpec, Identity,
    MemberState, Resource, Session, ValueKind,
};
use crate::resources::{absolute_path, object_id, parse_params, replace_form, tagged, ResourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Client list fields, all governed by `client_state`
const CLIENT_LISTS: [&str; 4] = [
    "clients",
    "read_only_clients",
    "read_write_clients",
    "root_clients",
];

const CLIENT_MERGE: FieldRule = FieldRule::Merge {
    kind: ValueKind::Plain,
    identity: Identity::Whole,
};

static MAPPING: &[FieldSpec] = &[
    field("enabled", FieldRule::Scalar(ValueKind::Plain)),
    field("user", FieldRule::Scalar(ValueKind::Trustee)),
    field("primary_group", FieldRule::Scalar(ValueKind::Trustee)),
    field(
        "secondary_groups",
        FieldRule::Merge {
            kind: ValueKind::Trustee,
            identity: Identity::Whole,
        },
    ),
];

static RULES: &[FieldSpec] = &[
    field("paths", FieldRule::CreateOnly),
    field("description", FieldRule::Scalar(ValueKind::Plain)),
    field("clients", CLIENT_MERGE),
    field("read_only_clients", CLIENT_MERGE),
    field("read_write_clients", CLIENT_MERGE),
    field("root_clients", CLIENT_MERGE),
    field("read_only", FieldRule::Scalar(ValueKind::Plain)),
    field("sub_directories_mountable", FieldRule::Scalar(ValueKind::Plain)),
    field("all_dirs", FieldRule::Scalar(ValueKind::Plain)),
    field("security_flavors", FieldRule::Set(ValueKind::Enum(&SECURITY_FLAVOR))),
    field("map_root", FieldRule::Nested(MAPPING)),
    field("map_non_root", FieldRule::Nested(MAPPING)),
];

static CONSTRAINTS: &[Constraint] = &[
    Constraint::RequiredBy {
        field: "clients",
        requires: &["client_state"],
    },
    Constraint::RequiredBy {
        field: "read_only_clients",
        requires: &["client_state"],
    },
    Constraint::RequiredBy {
        field: "read_write_clients",
        requires: &["client_state"],
    },
    Constraint::RequiredBy {
        field: "root_clients",
        requires: &["client_state"],
    },
];

// =============================================================================
// Parameters
// =============================================================================

/// How the given client lists apply to the export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ClientState {
    #[serde(rename = "present-in-export")]
    PresentInExport,
    #[serde(rename = "absent-in-export")]
    AbsentInExport,
    #[serde(rename = "replace")]
    Replace,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupEntry {
    pub name: String,
    #[serde(default)]
    pub state: MemberState,
}

/// Root or non-root identity mapping
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingParams {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub primary_group: Option<String>,
    #[serde(default)]
    pub secondary_groups: Option<Vec<GroupEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportParams {
    pub path: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub client_state: Option<ClientState>,
    #[serde(default)]
    pub clients: Desired<Vec<String>>,
    #[serde(default)]
    pub read_only_clients: Desired<Vec<String>>,
    #[serde(default)]
    pub read_write_clients: Desired<Vec<String>>,
    #[serde(default)]
    pub root_clients: Desired<Vec<String>>,
    #[serde(default)]
    pub map_root: Option<MappingParams>,
    #[serde(default)]
    pub map_non_root: Option<MappingParams>,
    /// Export settings passed through under their wire names
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl ExportParams {
    fn client_list(&self, name: &str) -> &Desired<Vec<String>> {
        match name {
            "clients" => &self.clients,
            "read_only_clients" => &self.read_only_clients,
            "read_write_clients" => &self.read_write_clients,
            _ => &self.root_clients,
        }
    }
}

/// Principal reference as a placeholder until it is resolved
fn by_name(name: &str) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), Value::from(name));
    Value::Object(obj)
}

// =============================================================================
// Resource
// =============================================================================

#[derive(Debug)]
pub struct NfsExport {
    params: ExportParams,
    raw: DesiredState,
}

impl NfsExport {
    pub fn new(params: Map<String, Value>) -> Result<Self> {
        Ok(Self {
            params: parse_params(ResourceKind::NfsExport, &params)?,
            raw: DesiredState::from_map(params),
        })
    }

    async fn absolute(&self, session: &Session) -> Result<String> {
        let base = session.zone_base_path().await?;
        Ok(absolute_path(&base, &self.params.path))
    }

    fn endpoint(session: &Session, current: &Snapshot) -> Result<Endpoint> {
        let id = current
            .get("id")
            .and_then(object_id)
            .ok_or_else(|| Error::Internal("NFS export without an id".into()))?;
        Ok(Endpoint::item(ResourceType::NfsExport, id).in_zone(session.zone()))
    }

    /// Mapping block with principals left as name placeholders
    fn lower_mapping(mapping: &MappingParams) -> Value {
        let mut obj = Map::new();
        if let Some(enabled) = mapping.enabled {
            obj.insert("enabled".into(), Value::from(enabled));
        }
        if let Some(user) = &mapping.user {
            obj.insert("user".into(), by_name(user));
        }
        if let Some(group) = &mapping.primary_group {
            obj.insert("primary_group".into(), by_name(group));
        }
        if let Some(groups) = &mapping.secondary_groups {
            obj.insert(
                "secondary_groups".into(),
                tagged(groups.iter().map(|g| (by_name(&g.name), g.state))),
            );
        }
        Value::Object(obj)
    }

    async fn resolve_mapping(session: &Session, mapping: &MappingParams) -> Result<Value> {
        let resolver = session.resolver();
        let mut obj = Map::new();
        if let Some(enabled) = mapping.enabled {
            obj.insert("enabled".into(), Value::from(enabled));
        }
        if let Some(user) = &mapping.user {
            let user = resolver.resolve(user, PrincipalType::User, None).await?;
            obj.insert("user".into(), user.persona());
        }
        if let Some(group) = &mapping.primary_group {
            let group = resolver.resolve(group, PrincipalType::Group, None).await?;
            obj.insert("primary_group".into(), group.persona());
        }
        if let Some(groups) = &mapping.secondary_groups {
            let mut resolved = Vec::with_capacity(groups.len());
            for entry in groups {
                let group = resolver.resolve(&entry.name, PrincipalType::Group, None).await?;
                resolved.push((group.persona(), entry.state));
            }
            obj.insert("secondary_groups".into(), tagged(resolved));
        }
        Ok(Value::Object(obj))
    }
}

#[async_trait]
impl Resource for NfsExport {
    fn kind(&self) -> &'static str {
        "nfs_export"
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
        &["paths"]
    }

    fn lower(&self) -> Result<DesiredState> {
        let params = &self.params;
        let mut desired = DesiredState::from_map(params.settings.clone());
        desired.insert("paths", Value::Array(vec![Value::from(params.path.as_str())]));

        for name in CLIENT_LISTS {
            match (params.client_list(name), params.client_state) {
                (Desired::Unset, _) => {}
                (Desired::Clear, _) => {
                    desired.insert(name, Value::Null);
                }
                (Desired::Set(clients), Some(ClientState::Replace)) => {
                    desired.insert(
                        name,
                        replace_form(clients.iter().map(|c| Value::from(c.as_str())).collect()),
                    );
                }
                (Desired::Set(clients), state) => {
                    let state = match state {
                        Some(ClientState::AbsentInExport) => MemberState::Absent,
                        _ => MemberState::Present,
                    };
                    desired.insert(
                        name,
                        tagged(clients.iter().map(|c| (Value::from(c.as_str()), state))),
                    );
                }
            }
        }

        if let Some(mapping) = &params.map_root {
            desired.insert("map_root", Self::lower_mapping(mapping));
        }
        if let Some(mapping) = &params.map_non_root {
            desired.insert("map_non_root", Self::lower_mapping(mapping));
        }
        Ok(desired)
    }

    async fn desired(&self, session: &Session) -> Result<DesiredState> {
        let mut desired = self.lower()?;
        desired.insert(
            "paths",
            Value::Array(vec![Value::from(self.absolute(session).await?)]),
        );
        if let Some(mapping) = &self.params.map_root {
            desired.insert("map_root", Self::resolve_mapping(session, mapping).await?);
        }
        if let Some(mapping) = &self.params.map_non_root {
            desired.insert("map_non_root", Self::resolve_mapping(session, mapping).await?);
        }
        Ok(desired)
    }

    async fn fetch(&self, session: &Session) -> Result<Lookup<Snapshot>> {
        let path = self.absolute(session).await?;
        let exports = session
            .list(&Endpoint::collection(ResourceType::NfsExport).in_zone(session.zone()))
            .await?;

        let mut matching: Vec<Snapshot> = exports
            .into_iter()
            .filter(|export| {
                export
                    .get("paths")
                    .and_then(Value::as_array)
                    .is_some_and(|paths| paths.iter().any(|p| p.as_str() == Some(path.as_str())))
            })
            .collect();

        match matching.len() {
            0 => Ok(Lookup::NotFound),
            1 => Ok(matching.pop().map(Lookup::Found).unwrap_or(Lookup::NotFound)),
            n => Err(Error::invalid(
                "path",
                format!("{} exports in zone {} share path {}", n, session.zone(), path),
            )),
        }
    }

    async fn create(&self, session: &Session, payload: &Snapshot) -> Result<()> {
        session
            .create(
                &Endpoint::collection(ResourceType::NfsExport).in_zone(session.zone()),
                payload,
            )
            .await?;
        Ok(())
    }

    async fn update(&self, session: &Session, current: &Snapshot, diff: &FieldDiff) -> Result<()> {
        session
            .update(&Self::endpoint(session, current)?, &diff.to_payload())
            .await
    }

    async fn delete(&self, session: &Session, current: &Snapshot) -> Result<()> {
        session.delete(&Self::endpoint(session, current)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{check, converge, Operation};
    use crate::resources::testing::{appliance, params, session};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn export(value: Value) -> NfsExport {
        NfsExport::new(params(value)).unwrap()
    }

    #[tokio::test]
    async fn test_create_with_replace_and_flavors() {
        let appliance = appliance();
        let data = export(json!({
            "path": "/ifs/data",
            "clients": ["10.0.0.1", "10.0.0.2", "10.0.0.1"],
            "client_state": "replace",
            "security_flavors": ["kerberos", "unix"]
        }));

        let report = converge(&data, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Created);
        let snapshot = report.snapshot.unwrap();
        assert_eq!(snapshot["paths"], json!(["/ifs/data"]));
        assert_eq!(snapshot["clients"], json!(["10.0.0.1", "10.0.0.2"]));
        assert_eq!(snapshot["security_flavors"], json!(["krb5", "unix"]));

        let again = converge(&data, &session(&appliance, "System", false)).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_client_merge_and_clear() {
        let appliance = appliance();
        appliance.seed(
            ResourceType::NfsExport,
            None,
            "7",
            json!({"id": 7, "paths": ["/ifs/data"], "clients": ["a"], "root_clients": ["r"]}),
        );

        let add = export(json!({"path": "data", "clients": ["b"], "client_state": "present-in-export"}));
        let report = converge(&add, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.snapshot.unwrap()["clients"], json!(["a", "b"]));

        let remove = export(json!({"path": "data", "clients": ["a"], "client_state": "absent-in-export"}));
        let report = converge(&remove, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.snapshot.unwrap()["clients"], json!(["b"]));

        let clear = export(json!({"path": "data", "root_clients": null, "client_state": "replace"}));
        let report = converge(&clear, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.snapshot.unwrap()["root_clients"], json!([]));

        let again = converge(&clear, &session(&appliance, "System", false)).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_ambiguous_path() {
        let appliance = appliance();
        for id in ["1", "2"] {
            appliance.seed(ResourceType::NfsExport, None, id, json!({"paths": ["/ifs/data"]}));
        }
        let data = export(json!({"path": "/ifs/data", "description": "x"}));
        let err = converge(&data, &session(&appliance, "System", false)).await.unwrap_err();
        assert_matches!(err, Error::InvalidValue { field, .. } if field == "path");
    }

    #[tokio::test]
    async fn test_map_root_resolves_principals() {
        let appliance = appliance();
        appliance.seed(
            ResourceType::NfsExport,
            None,
            "3",
            json!({
                "paths": ["/ifs/data"],
                "map_root": {"enabled": true, "user": {"id": "UID:65534", "name": "nobody"}}
            }),
        );
        let data = export(json!({
            "path": "/ifs/data",
            "map_root": {"user": "alice", "secondary_groups": [{"name": "admins"}]}
        }));

        let report = converge(&data, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Modified);
        assert_eq!(
            report.snapshot.unwrap()["map_root"],
            json!({
                "enabled": true,
                "user": {"id": "UID:2000"},
                "secondary_groups": [{"id": "GID:3000"}]
            })
        );

        let again = converge(&data, &session(&appliance, "System", false)).await.unwrap();
        assert!(!again.changed);
    }

    #[test]
    fn test_client_list_needs_client_state() {
        let data = export(json!({"path": "/ifs/data", "clients": ["a"]}));
        assert_matches!(check(&data), Err(Error::Validation(msg)) if msg.contains("client_state"));

        let data = export(json!({"path": "/ifs/data", "security_flavors": ["ntlm"]}));
        assert_matches!(check(&data), Err(Error::UnknownEnumValue { .. }));
    }
}
