//! File Pool Policy
//!
//! Policies are created once and never modified in place: every field is
//! immutable, so any drift on an existing policy is reported instead of
//! applied. Storage actions are lowered to the appliance's
//! `{action_type, action_param}` pairs.

use crate::domain::{Endpoint, Lookup, ResourceType, Snapshot, State};
use crate::error::{Error, Result};
use crate::reconcile::normalize::{EnumTable, REQUESTED_PROTECTION};
use crate::reconcile::{fixed, DesiredState, FieldDiff, FieldRule, FieldSpec, Resource, Session, ValueKind};
use crate::resources::{parse_params, ResourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Storage pool used when a policy names none
const ANY_POOL: &str = "anywhere";

static SSD_STRATEGY: EnumTable = EnumTable {
    field: "ssd_strategy",
    entries: &[
        ("metadata", "metadata"),
        ("metadata_read", "metadata"),
        ("metadata-write", "metadata-write"),
        ("metadata_write", "metadata-write"),
        ("data", "data"),
        ("avoid", "avoid"),
        ("avoid_ssd", "avoid"),
    ],
};

static DATA_ACCESS_PATTERN: EnumTable = EnumTable {
    field: "set_data_access_pattern",
    entries: &[
        ("random", "random"),
        ("concurrency", "concurrency"),
        ("streaming", "streaming"),
    ],
};

static RULES: &[FieldSpec] = &[
    fixed("name", FieldRule::Scalar(ValueKind::Plain)),
    fixed("description", FieldRule::Scalar(ValueKind::Plain)),
    fixed("apply_order", FieldRule::Scalar(ValueKind::Plain)),
    fixed("file_matching_pattern", FieldRule::Criteria),
    fixed("actions", FieldRule::Set(ValueKind::Plain)),
];

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoragePolicy {
    #[serde(default)]
    pub ssd_strategy: Option<String>,
    #[serde(default)]
    pub storagepool: Option<String>,
}

impl StoragePolicy {
    /// JSON-encoded `action_param`
    fn param(&self) -> Result<String> {
        let mut obj = Map::new();
        let strategy = match &self.ssd_strategy {
            Some(strategy) => SSD_STRATEGY.resolve(strategy)?,
            None => "metadata",
        };
        obj.insert("ssd_strategy".into(), Value::from(strategy));
        obj.insert(
            "storagepool".into(),
            Value::from(self.storagepool.as_deref().unwrap_or(ANY_POOL)),
        );
        Ok(serde_json::to_string(&obj)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOptimization {
    EnableSmartcache,
    DisableSmartcache,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyParams {
    pub policy_name: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub apply_order: Option<u32>,
    #[serde(default)]
    pub file_matching_pattern: Option<Value>,
    #[serde(default)]
    pub apply_data_storage_policy: Option<StoragePolicy>,
    #[serde(default)]
    pub apply_snapshot_storage_policy: Option<StoragePolicy>,
    #[serde(default)]
    pub set_requested_protection: Option<String>,
    #[serde(default)]
    pub set_data_access_pattern: Option<String>,
    #[serde(default)]
    pub set_write_performance_optimization: Option<WriteOptimization>,
}

impl PolicyParams {
    fn has_actions(&self) -> bool {
        self.apply_data_storage_policy.is_some()
            || self.apply_snapshot_storage_policy.is_some()
            || self.set_requested_protection.is_some()
            || self.set_data_access_pattern.is_some()
            || self.set_write_performance_optimization.is_some()
    }

    /// Wire actions in the appliance's fixed order
    fn actions(&self) -> Result<Vec<Value>> {
        let mut actions = Vec::new();
        if let Some(policy) = &self.apply_data_storage_policy {
            actions.push(action("apply_data_storage_policy", policy.param()?));
        }
        if let Some(policy) = &self.apply_snapshot_storage_policy {
            actions.push(action("apply_snapshot_storage_policy", policy.param()?));
        }
        if let Some(level) = &self.set_requested_protection {
            actions.push(action(
                "set_requested_protection",
                REQUESTED_PROTECTION.resolve(level)?.to_string(),
            ));
        }
        if let Some(pattern) = &self.set_data_access_pattern {
            actions.push(action(
                "set_data_access_pattern",
                DATA_ACCESS_PATTERN.resolve(pattern)?.to_string(),
            ));
        }
        if let Some(optimization) = self.set_write_performance_optimization {
            let enabled = optimization == WriteOptimization::EnableSmartcache;
            actions.push(action("enable_coalescer", enabled.to_string()));
        }
        Ok(actions)
    }
}

fn action(action_type: &str, action_param: String) -> Value {
    let mut obj = Map::new();
    obj.insert("action_type".into(), Value::from(action_type));
    obj.insert("action_param".into(), Value::from(action_param));
    Value::Object(obj)
}

// =============================================================================
// Resource
// =============================================================================

#[derive(Debug)]
pub struct FilePoolPolicy {
    params: PolicyParams,
    raw: DesiredState,
}

impl FilePoolPolicy {
    pub fn new(params: Map<String, Value>) -> Result<Self> {
        Ok(Self {
            params: parse_params(ResourceKind::FilepoolPolicy, &params)?,
            raw: DesiredState::from_map(params),
        })
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::item(ResourceType::FilePoolPolicy, self.params.policy_name.as_str())
    }
}

#[async_trait]
impl Resource for FilePoolPolicy {
    fn kind(&self) -> &'static str {
        "filepool_policy"
    }

    fn name(&self) -> String {
        self.params.policy_name.clone()
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
        &["file_matching_pattern"]
    }

    fn lower(&self) -> Result<DesiredState> {
        let params = &self.params;
        let mut desired = DesiredState::new();
        desired.insert("name", Value::from(params.policy_name.as_str()));
        if let Some(description) = &params.description {
            desired.insert("description", Value::from(description.as_str()));
        }
        if let Some(order) = params.apply_order {
            desired.insert("apply_order", Value::from(order));
        }
        if let Some(pattern) = &params.file_matching_pattern {
            desired.insert("file_matching_pattern", pattern.clone());
        }
        if params.has_actions() {
            desired.insert("actions", Value::Array(params.actions()?));
        }
        Ok(desired)
    }

    async fn fetch(&self, session: &Session) -> Result<Lookup<Snapshot>> {
        session.get(&self.endpoint()).await
    }

    async fn create(&self, session: &Session, payload: &Snapshot) -> Result<()> {
        session
            .create(&Endpoint::collection(ResourceType::FilePoolPolicy), payload)
            .await?;
        Ok(())
    }

    async fn update(&self, _session: &Session, _current: &Snapshot, diff: &FieldDiff) -> Result<()> {
        Err(Error::UnsupportedModification {
            kind: self.kind().to_string(),
            name: self.name(),
            fields: diff.names().map(str::to_string).collect(),
        })
    }

    async fn delete(&self, session: &Session, _current: &Snapshot) -> Result<()> {
        session.delete(&self.endpoint()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{check, converge, Operation};
    use crate::resources::testing::{appliance, params, session};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn policy(value: Value) -> FilePoolPolicy {
        FilePoolPolicy::new(params(value)).unwrap()
    }

    fn archive() -> Value {
        json!({
            "policy_name": "archive",
            "description": "cold data",
            "file_matching_pattern": {"or_criteria": [{"and_criteria": [
                {"type": "file_path", "condition": "contains", "value": "archive"},
                {"type": "accessed", "condition": "is_older_than",
                 "relative_datetime_count": {"time_value": 90, "time_unit": "days"}}
            ]}]},
            "apply_data_storage_policy": {"ssd_strategy": "avoid_ssd", "storagepool": "archive_pool"},
            "set_requested_protection": "n_plus_2d_1n",
            "set_write_performance_optimization": "disable_smartcache"
        })
    }

    #[tokio::test]
    async fn test_create_lowers_actions() {
        let appliance = appliance();
        let report = converge(&policy(archive()), &session(&appliance, "System", false))
            .await
            .unwrap();
        assert_eq!(report.operation, Operation::Created);

        let stored = appliance.peek(ResourceType::FilePoolPolicy, None, "archive").unwrap();
        assert_eq!(
            stored["actions"],
            json!([
                {"action_type": "apply_data_storage_policy",
                 "action_param": "{\"ssd_strategy\":\"avoid\",\"storagepool\":\"archive_pool\"}"},
                {"action_type": "set_requested_protection", "action_param": "+2d:1n"},
                {"action_type": "enable_coalescer", "action_param": "false"}
            ])
        );
        assert_eq!(
            stored["file_matching_pattern"]["or_criteria"][0]["and_criteria"][0]["value"],
            json!("*archive*")
        );

        let again = converge(&policy(archive()), &session(&appliance, "System", false))
            .await
            .unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_existing_policy_is_never_modified() {
        let appliance = appliance();
        converge(&policy(archive()), &session(&appliance, "System", false))
            .await
            .unwrap();

        let mut changed = archive();
        changed["description"] = json!("colder data");
        let err = converge(&policy(changed), &session(&appliance, "System", false))
            .await
            .unwrap_err();
        assert_matches!(err, Error::UnsupportedModification { fields, .. } if fields == vec!["description".to_string()]);
        assert_eq!(appliance.calls("update"), 0);
    }

    #[test]
    fn test_offline_validation() {
        let mut too_wide = archive();
        too_wide["file_matching_pattern"] = json!({"or_criteria": [
            {"and_criteria": [{"type": "file_type", "condition": "matches", "value": "file"}]},
            {"and_criteria": [{"type": "file_type", "condition": "matches", "value": "file"}]},
            {"and_criteria": [{"type": "file_type", "condition": "matches", "value": "file"}]},
            {"and_criteria": [{"type": "file_type", "condition": "matches", "value": "file"}]}
        ]});
        assert_matches!(check(&policy(too_wide)), Err(Error::InvalidCriteria(_)));

        let mut bad_level = archive();
        bad_level["set_requested_protection"] = json!("n_plus_9");
        assert_matches!(check(&policy(bad_level)), Err(Error::UnknownEnumValue { .. }));

        assert!(check(&policy(archive())).is_ok());
    }
}
