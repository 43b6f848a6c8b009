//! SyncIQ Replication Policy
//!
//! Policies are addressed by name and can be renamed. The peer certificate
//! is given by name and resolved to its id. Once the policy has converged
//! an optional job can be started against it.

use crate::domain::{Endpoint, Lookup, ResourceType, Snapshot, State};
use crate::error::{Error, Result};
use crate::reconcile::normalize::EnumTable;
use crate::reconcile::{
    field, Desired, DesiredState, FieldDiff, FieldRule, FieldSpec, FollowUp, Resource, Session,
    ValueKind,
};
use crate::resources::{absolute_path, parse_params, ResourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

static SYNC_ACTION: EnumTable = EnumTable {
    field: "action",
    entries: &[("copy", "copy"), ("sync", "sync")],
};

static NETWORK: &[FieldSpec] = &[
    field("pool", FieldRule::Scalar(ValueKind::Plain)),
    field("subnet", FieldRule::Scalar(ValueKind::Plain)),
];

static RULES: &[FieldSpec] = &[
    field("name", FieldRule::Scalar(ValueKind::Plain)),
    field("action", FieldRule::Scalar(ValueKind::Enum(&SYNC_ACTION))),
    field("description", FieldRule::Scalar(ValueKind::Plain)),
    field("enabled", FieldRule::Scalar(ValueKind::Plain)),
    field("schedule", FieldRule::Scalar(ValueKind::Plain)),
    field("source_root_path", FieldRule::Scalar(ValueKind::Plain)),
    field("source_include_directories", FieldRule::Set(ValueKind::Plain)),
    field("source_exclude_directories", FieldRule::Set(ValueKind::Plain)),
    field("source_network", FieldRule::Nested(NETWORK)),
    field("target_host", FieldRule::Scalar(ValueKind::CaseInsensitive)),
    field("target_path", FieldRule::Scalar(ValueKind::Plain)),
    field("target_certificate_id", FieldRule::Scalar(ValueKind::Plain)),
    field("job_delay", FieldRule::Scalar(ValueKind::Duration)),
    field("rpo_alert", FieldRule::Scalar(ValueKind::Duration)),
    field("target_snapshot_expiration", FieldRule::Scalar(ValueKind::Duration)),
    field("skip_when_source_unmodified", FieldRule::Scalar(ValueKind::Plain)),
    field("target_snapshot_archive", FieldRule::Scalar(ValueKind::Plain)),
    field("target_snapshot_pattern", FieldRule::Scalar(ValueKind::Plain)),
    field("target_snapshot_alias", FieldRule::Scalar(ValueKind::Plain)),
    field("target_detect_modifications", FieldRule::Scalar(ValueKind::Plain)),
    field("accelerated_failback", FieldRule::Scalar(ValueKind::Plain)),
    field("restrict_target_network", FieldRule::Scalar(ValueKind::Plain)),
];

/// Job states during which another job must not be started
const BUSY_STATES: [&str; 3] = ["running", "scheduled", "paused"];

// =============================================================================
// Parameters
// =============================================================================

/// Job started against the policy after it converges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Run,
    Test,
    ResyncPrep,
    AllowWrite,
    AllowWriteRevert,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Run => "run",
            JobAction::Test => "test",
            JobAction::ResyncPrep => "resync_prep",
            JobAction::AllowWrite => "allow_write",
            JobAction::AllowWriteRevert => "allow_write_revert",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyParams {
    pub policy_name: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub new_policy_name: Option<String>,
    #[serde(default)]
    pub source_root_path: Option<String>,
    #[serde(default)]
    pub source_include_directories: Desired<Vec<String>>,
    #[serde(default)]
    pub source_exclude_directories: Desired<Vec<String>>,
    /// Peer certificate name
    #[serde(default)]
    pub target_certificate: Desired<String>,
    #[serde(default)]
    pub run_job: Option<JobAction>,
    /// Policy settings passed through under their wire names
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

// =============================================================================
// Resource
// =============================================================================

#[derive(Debug)]
pub struct SyncIqPolicy {
    params: PolicyParams,
    raw: DesiredState,
}

impl SyncIqPolicy {
    pub fn new(params: Map<String, Value>) -> Result<Self> {
        Ok(Self {
            params: parse_params(ResourceKind::SynciqPolicy, &params)?,
            raw: DesiredState::from_map(params),
        })
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::item(ResourceType::SyncIqPolicy, name)
    }

    /// Name the live policy is addressed by
    fn live_name(&self, current: &Snapshot) -> String {
        current
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&self.params.policy_name)
            .to_string()
    }

    async fn busy_job(&self, session: &Session, policy: &str) -> Result<Option<Snapshot>> {
        let jobs = session
            .list(&Endpoint::collection(ResourceType::SyncIqJob))
            .await?;
        Ok(jobs.into_iter().find(|job| {
            let owner = job
                .get("policy_name")
                .or_else(|| job.get("policy").and_then(|policy| policy.get("name")))
                .and_then(Value::as_str);
            let state = job.get("state").and_then(Value::as_str).unwrap_or_default();
            owner == Some(policy) && BUSY_STATES.contains(&state)
        }))
    }
}

fn directories(dirs: &Desired<Vec<String>>, base: Option<&str>) -> Desired<Value> {
    dirs.as_ref().map(|dirs| {
        Value::Array(
            dirs.iter()
                .map(|dir| match base {
                    Some(base) => Value::from(absolute_path(base, dir)),
                    None => Value::from(dir.as_str()),
                })
                .collect(),
        )
    })
}

#[async_trait]
impl Resource for SyncIqPolicy {
    fn kind(&self) -> &'static str {
        "synciq_policy"
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
        &["action", "source_root_path", "target_host", "target_path"]
    }

    /// The certificate stays a name here; `desired` swaps in its id
    fn lower(&self) -> Result<DesiredState> {
        let params = &self.params;
        let mut desired = DesiredState::from_map(params.settings.clone());

        if let Some(name) = &params.new_policy_name {
            desired.insert("name", Value::from(name.as_str()));
        }
        if let Some(path) = &params.source_root_path {
            desired.insert("source_root_path", Value::from(path.as_str()));
        }
        desired.put(
            "source_include_directories",
            &directories(&params.source_include_directories, None),
        )?;
        desired.put(
            "source_exclude_directories",
            &directories(&params.source_exclude_directories, None),
        )?;
        desired.put("target_certificate_id", &params.target_certificate)?;
        Ok(desired)
    }

    async fn desired(&self, session: &Session) -> Result<DesiredState> {
        let mut desired = self.lower()?;
        let params = &self.params;

        let base = session.zone_base_path().await?;
        if let Some(path) = &params.source_root_path {
            desired.insert("source_root_path", Value::from(absolute_path(&base, path)));
        }
        desired.put(
            "source_include_directories",
            &directories(&params.source_include_directories, Some(&base)),
        )?;
        desired.put(
            "source_exclude_directories",
            &directories(&params.source_exclude_directories, Some(&base)),
        )?;

        if let Desired::Set(certificate) = &params.target_certificate {
            let id = session.resolver().resolve_certificate(certificate).await?;
            desired.insert("target_certificate_id", Value::from(id));
        }
        Ok(desired)
    }

    async fn fetch(&self, session: &Session) -> Result<Lookup<Snapshot>> {
        let found = session.get(&Self::endpoint(&self.params.policy_name)).await?;
        match (&found, &self.params.new_policy_name) {
            (Lookup::NotFound, Some(renamed)) => session.get(&Self::endpoint(renamed)).await,
            _ => Ok(found),
        }
    }

    async fn create(&self, session: &Session, payload: &Snapshot) -> Result<()> {
        let mut body = payload.clone();
        body.entry("name")
            .or_insert_with(|| Value::from(self.params.policy_name.as_str()));
        session
            .create(&Endpoint::collection(ResourceType::SyncIqPolicy), &body)
            .await?;
        Ok(())
    }

    async fn update(&self, session: &Session, current: &Snapshot, diff: &FieldDiff) -> Result<()> {
        session
            .update(&Self::endpoint(&self.live_name(current)), &diff.to_payload())
            .await
    }

    async fn delete(&self, session: &Session, current: &Snapshot) -> Result<()> {
        session.delete(&Self::endpoint(&self.live_name(current))).await
    }

    async fn follow_up(&self, session: &Session, snapshot: &Snapshot) -> Result<FollowUp> {
        let Some(action) = self.params.run_job else {
            return Ok(FollowUp::default());
        };
        let policy = self.live_name(snapshot);

        if snapshot.get("enabled") == Some(&Value::Bool(false)) {
            return Err(Error::Validation(format!(
                "cannot {} policy {}: policy is disabled",
                action.as_str(),
                policy
            )));
        }

        let mut details = Map::new();
        if let Some(job) = self.busy_job(session, &policy).await? {
            warn!("Job already active for policy {}, skipping {}", policy, action.as_str());
            details.insert("job_skipped".into(), Value::Bool(true));
            details.insert("job".into(), job.get("id").cloned().unwrap_or(Value::Null));
            return Ok(FollowUp {
                changed: false,
                details,
            });
        }

        info!("Starting {} job for policy {}", action.as_str(), policy);
        let mut body = Snapshot::new();
        body.insert("id".into(), Value::from(policy.as_str()));
        body.insert("action".into(), Value::from(action.as_str()));
        session
            .create(&Endpoint::collection(ResourceType::SyncIqJob), &body)
            .await?;

        details.insert("job_started".into(), Value::from(action.as_str()));
        Ok(FollowUp {
            changed: true,
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{check, converge, MutationKind, Operation};
    use crate::resources::testing::{appliance, params, session};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn policy(value: Value) -> SyncIqPolicy {
        SyncIqPolicy::new(params(value)).unwrap()
    }

    fn nightly() -> Value {
        json!({
            "policy_name": "nightly",
            "action": "sync",
            "source_root_path": "/ifs/data",
            "source_exclude_directories": ["/ifs/data/tmp"],
            "target_host": "DR.example.com",
            "target_path": "/ifs/dr/data",
            "target_certificate": "dr-peer",
            "job_delay": {"value": 2, "unit": "hours"},
            "source_network": {"pool": "pool1", "subnet": "subnet0"}
        })
    }

    #[tokio::test]
    async fn test_create_resolves_certificate() {
        let appliance = appliance();
        appliance.seed(ResourceType::Certificate, None, "cert-7", json!({"name": "dr-peer"}));

        let report = converge(&policy(nightly()), &session(&appliance, "System", false))
            .await
            .unwrap();
        assert_eq!(report.operation, Operation::Created);

        let stored = appliance.peek(ResourceType::SyncIqPolicy, None, "nightly").unwrap();
        assert_eq!(stored["target_certificate_id"], json!("cert-7"));
        assert_eq!(stored["job_delay"], json!(7200));
        assert_eq!(stored["target_host"], json!("DR.example.com"));

        let mut lowered = nightly();
        lowered["target_host"] = json!("dr.example.com");
        let again = converge(&policy(lowered), &session(&appliance, "System", false))
            .await
            .unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_unknown_certificate() {
        let appliance = appliance();
        let err = converge(&policy(nightly()), &session(&appliance, "System", false))
            .await
            .unwrap_err();
        assert_matches!(err, Error::IdentityNotFound { kind, .. } if kind == "certificate");
        assert_eq!(appliance.calls("create"), 0);
    }

    #[tokio::test]
    async fn test_rename() {
        let appliance = appliance();
        appliance.seed(
            ResourceType::SyncIqPolicy,
            None,
            "nightly",
            json!({"name": "nightly", "action": "sync", "enabled": true}),
        );

        let renamed = policy(json!({"policy_name": "nightly", "new_policy_name": "hourly"}));
        let report = converge(&renamed, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Modified);
        assert!(appliance.peek(ResourceType::SyncIqPolicy, None, "hourly").is_some());

        let again = converge(&renamed, &session(&appliance, "System", false)).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_run_job() {
        let appliance = appliance();
        appliance.seed(
            ResourceType::SyncIqPolicy,
            None,
            "nightly",
            json!({"name": "nightly", "action": "sync", "enabled": true}),
        );
        let run = policy(json!({"policy_name": "nightly", "run_job": "run"}));

        let report = converge(&run, &session(&appliance, "System", false)).await.unwrap();
        assert_eq!(report.operation, Operation::Unchanged);
        assert!(report.changed);
        assert_eq!(report.details["job_started"], json!("run"));
        assert_eq!(report.mutations.len(), 1);
        assert_eq!(report.mutations[0].kind, MutationKind::Create);

        appliance.seed(
            ResourceType::SyncIqJob,
            None,
            "busy",
            json!({"policy_name": "nightly", "state": "running"}),
        );
        let report = converge(&run, &session(&appliance, "System", false)).await.unwrap();
        assert!(!report.changed);
        assert_eq!(report.details["job_skipped"], json!(true));
        assert_eq!(report.details["job"], json!("busy"));
    }

    #[tokio::test]
    async fn test_run_job_skipped_for_nested_policy_reference() {
        let appliance = appliance();
        appliance.seed(
            ResourceType::SyncIqPolicy,
            None,
            "nightly",
            json!({"name": "nightly", "action": "sync", "enabled": true}),
        );
        appliance.seed(
            ResourceType::SyncIqJob,
            None,
            "paused",
            json!({"policy": {"id": "p7", "name": "nightly"}, "state": "paused"}),
        );
        let run = policy(json!({"policy_name": "nightly", "run_job": "test"}));

        let report = converge(&run, &session(&appliance, "System", false)).await.unwrap();
        assert!(!report.changed);
        assert_eq!(report.details["job_skipped"], json!(true));
        assert_eq!(report.details["job"], json!("paused"));
        assert_eq!(appliance.calls("create"), 0);
    }

    #[tokio::test]
    async fn test_run_job_on_disabled_policy() {
        let appliance = appliance();
        appliance.seed(
            ResourceType::SyncIqPolicy,
            None,
            "nightly",
            json!({"name": "nightly", "enabled": false}),
        );
        let run = policy(json!({"policy_name": "nightly", "run_job": "resync_prep"}));
        assert_matches!(
            converge(&run, &session(&appliance, "System", false)).await,
            Err(Error::Validation(msg)) if msg.contains("disabled")
        );
        assert_eq!(appliance.calls("create"), 0);
    }

    #[test]
    fn test_offline_validation() {
        let mut bad = nightly();
        bad["action"] = json!("mirror");
        assert_matches!(check(&policy(bad)), Err(Error::UnknownEnumValue { .. }));

        let mut bad = nightly();
        bad["rpo_alert"] = json!({"value": 1, "unit": "fortnights"});
        assert_matches!(check(&policy(bad)), Err(Error::UnknownEnumValue { .. }));

        assert!(check(&policy(nightly())).is_ok());
    }
}
