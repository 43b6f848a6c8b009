//! Access Zone
//!
//! Manages an access zone together with its per-zone SMB and NFS settings.
//! The zone and each settings block live behind separate endpoints, so the
//! diff is split per endpoint and each part is sent on its own.

use crate::domain::{Endpoint, Lookup, ResourceType, Snapshot, State, DEFAULT_ZONE};
use crate::error::{Error, Result};
use crate::reconcile::normalize::CREATE_PERMISSIONS;
use crate::reconcile::{
    field, fixed, DesiredState, FieldDiff, FieldRule, FieldSpec, Identity, MemberState, Resource,
    Session, ValueKind,
};
use crate::resources::{parse_params, tagged, ResourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

static SMB_SETTINGS: &[FieldSpec] = &[
    field("create_permissions", FieldRule::Scalar(ValueKind::Enum(&CREATE_PERMISSIONS))),
    field("directory_create_mask", FieldRule::Scalar(ValueKind::OctalMode)),
    field("directory_create_mode", FieldRule::Scalar(ValueKind::OctalMode)),
    field("file_create_mask", FieldRule::Scalar(ValueKind::OctalMode)),
    field("file_create_mode", FieldRule::Scalar(ValueKind::OctalMode)),
];

static NFS_SETTINGS: &[FieldSpec] = &[
    field("commit_asynchronous", FieldRule::Scalar(ValueKind::Plain)),
    field("nfsv4_allow_numeric_ids", FieldRule::Scalar(ValueKind::Plain)),
    field("nfsv4_domain", FieldRule::Scalar(ValueKind::CaseInsensitive)),
    field("nfsv4_no_domain", FieldRule::Scalar(ValueKind::Plain)),
    field("nfsv4_no_domain_uids", FieldRule::Scalar(ValueKind::Plain)),
    field("nfsv4_no_names", FieldRule::Scalar(ValueKind::Plain)),
    field("nfsv4_replace_domain", FieldRule::Scalar(ValueKind::Plain)),
];

static RULES: &[FieldSpec] = &[
    fixed("name", FieldRule::Scalar(ValueKind::Plain)),
    field("path", FieldRule::Scalar(ValueKind::Plain)),
    fixed("groupnet", FieldRule::Scalar(ValueKind::Plain)),
    field("create_path", FieldRule::CreateOnly),
    field(
        "auth_providers",
        FieldRule::Merge {
            kind: ValueKind::Plain,
            identity: Identity::Whole,
        },
    ),
    field("smb", FieldRule::Nested(SMB_SETTINGS)),
    field("nfs", FieldRule::Nested(NFS_SETTINGS)),
];

/// Settings blocks and the endpoints they live behind
const SETTINGS: [(&str, ResourceType); 2] = [
    ("smb", ResourceType::SmbZoneSettings),
    ("nfs", ResourceType::NfsZoneSettings),
];

// =============================================================================
// Parameters
// =============================================================================

/// Authentication provider attached to the zone
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderRef {
    pub provider_name: String,
    pub provider_type: String,
    #[serde(default)]
    pub state: MemberState,
}

impl ProviderRef {
    /// `lsa-<type>-provider:<name>`
    pub fn wire_id(&self) -> String {
        format!(
            "lsa-{}-provider:{}",
            self.provider_type.to_lowercase(),
            self.provider_name
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneParams {
    pub name: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub create_path: Option<bool>,
    #[serde(default)]
    pub groupnet: Option<String>,
    #[serde(default)]
    pub auth_providers: Option<Vec<ProviderRef>>,
    #[serde(default)]
    pub smb: Option<Map<String, Value>>,
    #[serde(default)]
    pub nfs: Option<Map<String, Value>>,
}

// =============================================================================
// Resource
// =============================================================================

#[derive(Debug)]
pub struct AccessZone {
    params: ZoneParams,
    raw: DesiredState,
}

impl AccessZone {
    pub fn new(params: Map<String, Value>) -> Result<Self> {
        Ok(Self {
            params: parse_params(ResourceKind::AccessZone, &params)?,
            raw: DesiredState::from_map(params),
        })
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::item(ResourceType::AccessZone, self.params.name.as_str())
    }

    fn settings_endpoint(&self, resource: ResourceType) -> Endpoint {
        Endpoint::collection(resource).in_zone(&self.params.name)
    }

    /// Every present provider must be known to the appliance
    async fn check_providers(&self, session: &Session, providers: &[ProviderRef]) -> Result<()> {
        let known = session
            .list(&Endpoint::collection(ResourceType::ProvidersSummary))
            .await?;

        for provider in providers.iter().filter(|p| p.state == MemberState::Present) {
            let wire = provider.wire_id();
            let exists = known.iter().any(|entry| {
                text(entry, "id") == wire
                    || (text(entry, "type").eq_ignore_ascii_case(&provider.provider_type)
                        && text(entry, "name") == provider.provider_name)
            });
            if !exists {
                return Err(Error::IdentityNotFound {
                    kind: "auth provider".into(),
                    name: provider.provider_name.clone(),
                    provider: Some(provider.provider_type.clone()),
                });
            }
        }
        Ok(())
    }

    /// Send the settings blocks that changed, one endpoint each
    async fn update_settings(
        &self,
        session: &Session,
        current: &Snapshot,
        changes: &FieldDiff,
    ) -> Result<()> {
        for (block, resource) in SETTINGS {
            let Some(Value::Object(wanted)) = changes.get(block) else {
                continue;
            };
            let live = current.get(block).and_then(Value::as_object);
            let payload: Snapshot = wanted
                .iter()
                .filter(|(k, v)| live.and_then(|live| live.get(k.as_str())) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !payload.is_empty() {
                session.update(&self.settings_endpoint(resource), &payload).await?;
            }
        }
        Ok(())
    }
}

fn text<'a>(entry: &'a Snapshot, key: &str) -> &'a str {
    entry.get(key).and_then(Value::as_str).unwrap_or_default()
}

#[async_trait]
impl Resource for AccessZone {
    fn kind(&self) -> &'static str {
        "access_zone"
    }

    fn name(&self) -> String {
        self.params.name.clone()
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

    fn lower(&self) -> Result<DesiredState> {
        let params = &self.params;
        let mut desired = DesiredState::new();
        desired.insert("name", Value::from(params.name.as_str()));
        if let Some(path) = &params.path {
            desired.insert("path", Value::from(path.as_str()));
        }
        if let Some(groupnet) = &params.groupnet {
            desired.insert("groupnet", Value::from(groupnet.as_str()));
        }
        if let Some(create_path) = params.create_path {
            desired.insert("create_path", Value::from(create_path));
        }
        if let Some(providers) = &params.auth_providers {
            desired.insert(
                "auth_providers",
                tagged(providers.iter().map(|p| (Value::from(p.wire_id()), p.state))),
            );
        }
        if let Some(smb) = &params.smb {
            desired.insert("smb", Value::Object(smb.clone()));
        }
        if let Some(nfs) = &params.nfs {
            desired.insert("nfs", Value::Object(nfs.clone()));
        }
        Ok(desired)
    }

    async fn desired(&self, session: &Session) -> Result<DesiredState> {
        if let Some(providers) = &self.params.auth_providers {
            self.check_providers(session, providers).await?;
        }
        self.lower()
    }

    async fn fetch(&self, session: &Session) -> Result<Lookup<Snapshot>> {
        let Lookup::Found(mut zone) = session.get(&self.endpoint()).await? else {
            return Ok(Lookup::NotFound);
        };
        if self.params.state == State::Present {
            for (block, resource) in SETTINGS {
                if !self.raw.contains(block) {
                    continue;
                }
                debug!("Fetching {} settings for zone {}", block, self.params.name);
                let settings = session
                    .get(&self.settings_endpoint(resource))
                    .await?
                    .found()
                    .unwrap_or_default();
                zone.insert(block.to_string(), Value::Object(settings));
            }
        }
        Ok(Lookup::Found(zone))
    }

    async fn create(&self, session: &Session, payload: &Snapshot) -> Result<()> {
        let mut changes = FieldDiff::from(payload.clone());
        let settings = changes.split(&["smb", "nfs"]);
        session
            .create(&Endpoint::collection(ResourceType::AccessZone), &changes.to_payload())
            .await?;
        self.update_settings(session, &Snapshot::new(), &settings).await
    }

    async fn update(&self, session: &Session, current: &Snapshot, diff: &FieldDiff) -> Result<()> {
        let mut changes = diff.clone();
        let settings = changes.split(&["smb", "nfs"]);
        if !changes.is_empty() {
            session.update(&self.endpoint(), &changes.to_payload()).await?;
        }
        self.update_settings(session, current, &settings).await
    }

    async fn check_delete(&self, _session: &Session, _current: &Snapshot) -> Result<()> {
        if self.params.name.eq_ignore_ascii_case(DEFAULT_ZONE) {
            return Err(Error::Validation(format!(
                "the {} access zone cannot be deleted",
                DEFAULT_ZONE
            )));
        }
        Ok(())
    }

    async fn delete(&self, session: &Session, _current: &Snapshot) -> Result<()> {
        session.delete(&self.endpoint()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{converge, Operation};
    use crate::resources::testing::{appliance, params, session};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn zone(value: Value) -> AccessZone {
        AccessZone::new(params(value)).unwrap()
    }

    fn with_providers() -> std::sync::Arc<crate::client::InMemoryAppliance> {
        let appliance = appliance();
        appliance.seed(
            ResourceType::ProvidersSummary,
            None,
            "lsa-ads-provider:CORP",
            json!({"id": "lsa-ads-provider:CORP", "name": "CORP", "type": "ads"}),
        );
        appliance
    }

    #[tokio::test]
    async fn test_create_zone_with_settings() {
        let appliance = with_providers();
        let zone = zone(json!({
            "name": "eng",
            "path": "/ifs/eng",
            "create_path": true,
            "auth_providers": [{"provider_name": "CORP", "provider_type": "ads"}],
            "smb": {"create_permissions": "inherit_mode_bits", "file_create_mask": "0700"},
            "nfs": {"nfsv4_domain": "Example.COM"}
        }));

        let report = converge(&zone, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Created);

        let stored = appliance.peek(ResourceType::AccessZone, None, "eng").unwrap();
        assert_eq!(stored["auth_providers"], json!(["lsa-ads-provider:CORP"]));
        assert!(!stored.contains_key("smb"));
        let smb = appliance.peek(ResourceType::SmbZoneSettings, Some("eng"), "").unwrap();
        assert_eq!(smb["create_permissions"], json!("inherit mode bits"));
        assert_eq!(smb["file_create_mask"], json!(448));

        let again = converge(&zone, &session(&appliance, "System", false)).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_only_changed_settings_are_sent() {
        let appliance = with_providers();
        appliance.seed(ResourceType::AccessZone, None, "eng", json!({"name": "eng", "path": "/ifs/eng"}));
        appliance.seed(
            ResourceType::SmbZoneSettings,
            Some("eng"),
            "",
            json!({"file_create_mask": 448, "directory_create_mask": 448}),
        );
        let zone = zone(json!({
            "name": "eng",
            "smb": {"file_create_mask": "0700", "directory_create_mask": "0755"}
        }));

        let report = converge(&zone, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Modified);
        assert_eq!(report.mutations.len(), 1);
        assert_eq!(
            report.mutations[0].payload,
            Some(json!({"directory_create_mask": 493}).as_object().unwrap().clone())
        );
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let appliance = with_providers();
        let zone = zone(json!({
            "name": "eng",
            "path": "/ifs/eng",
            "auth_providers": [{"provider_name": "corp-ldap", "provider_type": "ldap"}]
        }));
        let err = converge(&zone, &session(&appliance, "System", false)).await.unwrap_err();
        assert_matches!(err, Error::IdentityNotFound { name, .. } if name == "corp-ldap");
        assert_eq!(appliance.calls("create"), 0);
    }

    #[tokio::test]
    async fn test_system_zone_cannot_be_deleted() {
        let appliance = appliance();
        let zone = zone(json!({"name": "System", "state": "absent"}));
        let err = converge(&zone, &session(&appliance, "System", false)).await.unwrap_err();
        assert_matches!(err, Error::Validation(_));
        assert_eq!(appliance.calls("delete"), 0);
    }
}
