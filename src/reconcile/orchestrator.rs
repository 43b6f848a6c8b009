//! Reconciliation Orchestrator
//!
//! Drives one converge cycle for any resource:
//! - Validates the operator's parameters before any remote call
//! - Fetches the live object and picks create, modify, delete or no-op
//! - Rejects changes to immutable fields
//! - Runs follow-up operations and assembles the report
//!
//! All per-cycle state (identity memo, dry-run journal) lives in [`Session`].

use crate::domain::{Endpoint, Lookup, ManagementApiRef, ResourceType, Snapshot, State};
use crate::error::{Error, Result};
use crate::reconcile::desired::{self, Constraint, DesiredState};
use crate::reconcile::diff::{self, FieldDiff, FieldSpec};
use crate::reconcile::identity::IdentityResolver;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

// =============================================================================
// Mutation Journal
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A mutating call, made or (in dry-run) only planned
#[derive(Debug, Clone, Serialize)]
pub struct Mutation {
    pub kind: MutationKind,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Snapshot>,
    pub applied: bool,
    pub at: DateTime<Utc>,
}

// =============================================================================
// Session
// =============================================================================

/// State shared by every step of one cycle
pub struct Session {
    api: ManagementApiRef,
    resolver: IdentityResolver,
    zone: String,
    dry_run: bool,
    journal: Mutex<Vec<Mutation>>,
    base_path: Mutex<Option<String>>,
}

impl Session {
    pub fn new(api: ManagementApiRef, zone: impl Into<String>, dry_run: bool) -> Self {
        let zone = zone.into();
        Self {
            resolver: IdentityResolver::new(api.clone(), zone.clone()),
            api,
            zone,
            dry_run,
            journal: Mutex::new(Vec::new()),
            base_path: Mutex::new(None),
        }
    }

    pub fn api(&self) -> &ManagementApiRef {
        &self.api
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Base directory of the session's access zone, fetched once
    pub async fn zone_base_path(&self) -> Result<String> {
        let cached = self.base_path.lock().clone();
        if let Some(path) = cached {
            return Ok(path);
        }
        let zone = self
            .get(&Endpoint::item(ResourceType::AccessZone, self.zone.as_str()))
            .await?
            .require("access_zone", &self.zone)?;
        let path = zone
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::transport("get access_zone", None, "zone has no path"))?
            .trim_end_matches('/')
            .to_string();
        *self.base_path.lock() = Some(path.clone());
        Ok(path)
    }

    pub async fn get(&self, endpoint: &Endpoint) -> Result<Lookup<Snapshot>> {
        self.api.get(endpoint).await
    }

    pub async fn list(&self, endpoint: &Endpoint) -> Result<Vec<Snapshot>> {
        self.api.list(endpoint).await
    }

    /// Create an object; `None` in dry-run
    pub async fn create(&self, endpoint: &Endpoint, payload: &Snapshot) -> Result<Option<String>> {
        self.record(MutationKind::Create, endpoint, Some(payload.clone()));
        if self.dry_run {
            info!("[dry-run] Would create {}", endpoint);
            return Ok(None);
        }
        info!("Creating {}", endpoint);
        self.api.create(endpoint, payload).await.map(Some)
    }

    pub async fn update(&self, endpoint: &Endpoint, payload: &Snapshot) -> Result<()> {
        self.record(MutationKind::Update, endpoint, Some(payload.clone()));
        if self.dry_run {
            info!("[dry-run] Would update {}", endpoint);
            return Ok(());
        }
        info!("Updating {}", endpoint);
        self.api.update(endpoint, payload).await
    }

    pub async fn delete(&self, endpoint: &Endpoint) -> Result<()> {
        self.record(MutationKind::Delete, endpoint, None);
        if self.dry_run {
            info!("[dry-run] Would delete {}", endpoint);
            return Ok(());
        }
        info!("Deleting {}", endpoint);
        self.api.delete(endpoint).await
    }

    fn record(&self, kind: MutationKind, endpoint: &Endpoint, payload: Option<Snapshot>) {
        self.journal.lock().push(Mutation {
            kind,
            endpoint: endpoint.to_string(),
            payload,
            applied: !self.dry_run,
            at: Utc::now(),
        });
    }

    /// Mutations so far, in call order
    pub fn mutations(&self) -> Vec<Mutation> {
        self.journal.lock().clone()
    }
}

// =============================================================================
// Resource Trait
// =============================================================================

/// Outcome of a follow-up operation
#[derive(Debug, Clone, Default)]
pub struct FollowUp {
    pub changed: bool,
    pub details: Map<String, Value>,
}

/// A resource type the orchestrator can converge
#[async_trait]
pub trait Resource: Send + Sync {
    /// Resource type name for messages
    fn kind(&self) -> &'static str;

    /// Identity of this instance for messages
    fn name(&self) -> String;

    fn requested_state(&self) -> State;

    /// Operator parameters as given, for constraint checks
    fn parameters(&self) -> &DesiredState;

    fn field_rules(&self) -> &'static [FieldSpec];

    fn constraints(&self) -> &'static [Constraint] {
        &[]
    }

    fn required_on_create(&self) -> &'static [&'static str] {
        &[]
    }

    /// Lower parameters to wire-named desired state without remote calls
    fn lower(&self) -> Result<DesiredState>;

    /// Complete the lowered state with values that need the appliance
    async fn desired(&self, _session: &Session) -> Result<DesiredState> {
        self.lower()
    }

    async fn fetch(&self, session: &Session) -> Result<Lookup<Snapshot>>;

    async fn create(&self, session: &Session, payload: &Snapshot) -> Result<()>;

    async fn update(&self, session: &Session, current: &Snapshot, diff: &FieldDiff) -> Result<()>;

    async fn delete(&self, session: &Session, current: &Snapshot) -> Result<()>;

    /// Refuse deletion while something still depends on the object
    async fn check_delete(&self, _session: &Session, _current: &Snapshot) -> Result<()> {
        Ok(())
    }

    /// Extra operation run after the present state has converged
    async fn follow_up(&self, _session: &Session, _snapshot: &Snapshot) -> Result<FollowUp> {
        Ok(FollowUp::default())
    }
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Created,
    Modified,
    Deleted,
    Unchanged,
}

/// Result of one converge cycle
#[derive(Debug, Clone, Serialize)]
pub struct ConvergeReport {
    pub changed: bool,
    pub operation: Operation,
    pub diff: FieldDiff,
    pub snapshot: Option<Snapshot>,
    pub mutations: Vec<Mutation>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

// =============================================================================
// Converge
// =============================================================================

/// Offline validation: constraint table, then normalization of every given field
pub fn check(resource: &dyn Resource) -> Result<()> {
    desired::validate(resource.parameters(), resource.constraints())?;
    if resource.requested_state() == State::Present {
        diff::payload(&resource.lower()?, resource.field_rules())?;
    }
    Ok(())
}

/// Run one full converge cycle
pub async fn converge(resource: &dyn Resource, session: &Session) -> Result<ConvergeReport> {
    let kind = resource.kind();
    let name = resource.name();
    check(resource)?;
    let desired = match resource.requested_state() {
        State::Present => Some(resource.desired(session).await?),
        State::Absent => None,
    };

    debug!("Fetching {}: {}", kind, name);
    let current = resource.fetch(session).await?;

    let (operation, diff, snapshot) = match (current, desired) {
        (Lookup::NotFound, Some(desired)) => {
            desired::require(&desired, resource.required_on_create(), &format!("to create {}", kind))?;
            let payload = diff::payload(&desired, resource.field_rules())?;
            info!("Creating {}: {}", kind, name);
            resource.create(session, &payload).await?;

            let snapshot = if session.is_dry_run() {
                payload.clone()
            } else {
                resource.fetch(session).await?.require(kind, &name)?
            };
            (Operation::Created, FieldDiff::from(payload), Some(snapshot))
        }
        (Lookup::Found(current), Some(desired)) => {
            let diff = diff::diff(&current, &desired, resource.field_rules())?;
            if diff.is_empty() {
                debug!("{} {} is up to date", kind, name);
                (Operation::Unchanged, diff, Some(current))
            } else {
                let immutable = diff.immutable(resource.field_rules());
                if !immutable.is_empty() {
                    return Err(Error::UnsupportedModification {
                        kind: kind.to_string(),
                        name,
                        fields: immutable,
                    });
                }

                info!(
                    "Modifying {}: {} ({})",
                    kind,
                    name,
                    diff.names().collect::<Vec<_>>().join(", ")
                );
                resource.update(session, &current, &diff).await?;

                let snapshot = if session.is_dry_run() {
                    let mut projected = current;
                    diff.apply(&mut projected);
                    projected
                } else {
                    resource.fetch(session).await?.require(kind, &name)?
                };
                (Operation::Modified, diff, Some(snapshot))
            }
        }
        (Lookup::Found(current), None) => {
            resource.check_delete(session, &current).await?;
            info!("Deleting {}: {}", kind, name);
            resource.delete(session, &current).await?;
            (Operation::Deleted, FieldDiff::new(), None)
        }
        (Lookup::NotFound, None) => {
            debug!("{} {} already absent", kind, name);
            (Operation::Unchanged, FieldDiff::new(), None)
        }
    };

    let mut changed = operation != Operation::Unchanged;
    let mut details = Map::new();
    if let Some(snapshot) = &snapshot {
        let follow_up = resource.follow_up(session, snapshot).await?;
        changed |= follow_up.changed;
        details = follow_up.details;
    }

    Ok(ConvergeReport {
        changed,
        operation,
        diff,
        snapshot,
        mutations: session.mutations(),
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryAppliance;
    use crate::domain::ResourceType;
    use crate::reconcile::diff::{field, fixed, FieldRule};
    use crate::reconcile::normalize::ValueKind;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;

    static RULES: [FieldSpec; 3] = [
        fixed("path", FieldRule::Scalar(ValueKind::Plain)),
        field("description", FieldRule::Scalar(ValueKind::Plain)),
        field("browsable", FieldRule::Scalar(ValueKind::Plain)),
    ];

    /// Minimal share-like resource addressed by name
    struct Share {
        name: String,
        state: State,
        params: DesiredState,
    }

    impl Share {
        fn new(name: &str, state: State, params: Value) -> Self {
            Self {
                name: name.into(),
                state,
                params: DesiredState::from_map(params.as_object().cloned().unwrap_or_default()),
            }
        }

        fn endpoint(&self) -> Endpoint {
            Endpoint::item(ResourceType::SmbShare, &self.name)
        }
    }

    #[async_trait]
    impl Resource for Share {
        fn kind(&self) -> &'static str {
            "smb_share"
        }

        fn name(&self) -> String {
            self.name.clone()
        }

        fn requested_state(&self) -> State {
            self.state
        }

        fn parameters(&self) -> &DesiredState {
            &self.params
        }

        fn field_rules(&self) -> &'static [FieldSpec] {
            &RULES
        }

        fn required_on_create(&self) -> &'static [&'static str] {
            &["path"]
        }

        fn lower(&self) -> Result<DesiredState> {
            Ok(self.params.clone())
        }

        async fn fetch(&self, session: &Session) -> Result<Lookup<Snapshot>> {
            session.get(&self.endpoint()).await
        }

        async fn create(&self, session: &Session, payload: &Snapshot) -> Result<()> {
            let mut body = payload.clone();
            body.insert("name".into(), json!(self.name));
            session
                .create(&Endpoint::collection(ResourceType::SmbShare), &body)
                .await?;
            Ok(())
        }

        async fn update(&self, session: &Session, _current: &Snapshot, diff: &FieldDiff) -> Result<()> {
            session.update(&self.endpoint(), &diff.to_payload()).await
        }

        async fn delete(&self, session: &Session, _current: &Snapshot) -> Result<()> {
            session.delete(&self.endpoint()).await
        }
    }

    fn session(appliance: &Arc<InMemoryAppliance>, dry_run: bool) -> Session {
        Session::new(appliance.clone(), "System", dry_run)
    }

    #[tokio::test]
    async fn test_create_then_refetch() {
        let appliance = Arc::new(InMemoryAppliance::new());
        let share = Share::new("data", State::Present, json!({"path": "/ifs/data", "description": "d"}));

        let report = converge(&share, &session(&appliance, false)).await.unwrap();

        assert!(report.changed);
        assert_eq!(report.operation, Operation::Created);
        assert_eq!(appliance.calls("create"), 1);
        assert_eq!(appliance.calls("get"), 2);
        let snapshot = report.snapshot.unwrap();
        assert_eq!(snapshot["name"], json!("data"));
        assert_eq!(snapshot["description"], json!("d"));
    }

    #[tokio::test]
    async fn test_modify_sends_only_diff_and_is_idempotent() {
        let appliance = Arc::new(InMemoryAppliance::new());
        appliance.seed(
            ResourceType::SmbShare,
            None,
            "data",
            json!({"name": "data", "path": "/ifs/data", "description": "old", "browsable": true}),
        );
        let share = Share::new("data", State::Present, json!({"description": "new", "browsable": true}));

        let report = converge(&share, &session(&appliance, false)).await.unwrap();
        assert_eq!(report.operation, Operation::Modified);
        assert_eq!(report.mutations.len(), 1);
        assert_eq!(report.mutations[0].payload, Some(json!({"description": "new"}).as_object().unwrap().clone()));

        let again = converge(&share, &session(&appliance, false)).await.unwrap();
        assert!(!again.changed);
        assert_eq!(again.operation, Operation::Unchanged);
        assert!(again.mutations.is_empty());
    }

    #[tokio::test]
    async fn test_immutable_field_is_rejected_before_update() {
        let appliance = Arc::new(InMemoryAppliance::new());
        appliance.seed(ResourceType::SmbShare, None, "data", json!({"name": "data", "path": "/ifs/data"}));
        let share = Share::new("data", State::Present, json!({"path": "/ifs/other"}));

        let err = converge(&share, &session(&appliance, false)).await.unwrap_err();
        assert_matches!(err, Error::UnsupportedModification { fields, .. } if fields == vec!["path".to_string()]);
        assert_eq!(appliance.calls("update"), 0);
    }

    #[tokio::test]
    async fn test_create_requires_mandatory_fields() {
        let appliance = Arc::new(InMemoryAppliance::new());
        let share = Share::new("data", State::Present, json!({"description": "d"}));

        let err = converge(&share, &session(&appliance, false)).await.unwrap_err();
        assert_matches!(err, Error::Validation(msg) if msg.contains("path"));
        assert_eq!(appliance.calls("create"), 0);
    }

    #[tokio::test]
    async fn test_delete_and_absent_noop() {
        let appliance = Arc::new(InMemoryAppliance::new());
        appliance.seed(ResourceType::SmbShare, None, "data", json!({"name": "data"}));
        let share = Share::new("data", State::Absent, json!({}));

        let report = converge(&share, &session(&appliance, false)).await.unwrap();
        assert_eq!(report.operation, Operation::Deleted);
        assert!(report.snapshot.is_none());

        let report = converge(&share, &session(&appliance, false)).await.unwrap();
        assert!(!report.changed);
        assert_eq!(appliance.calls("delete"), 1);
    }

    #[tokio::test]
    async fn test_dry_run_journals_without_mutating() {
        let appliance = Arc::new(InMemoryAppliance::new());
        appliance.seed(ResourceType::SmbShare, None, "data", json!({"name": "data", "description": "old"}));
        let share = Share::new("data", State::Present, json!({"description": "new"}));

        let report = converge(&share, &session(&appliance, true)).await.unwrap();

        assert!(report.changed);
        assert_eq!(report.snapshot.unwrap()["description"], json!("new"));
        assert_eq!(report.mutations.len(), 1);
        assert!(!report.mutations[0].applied);
        assert_eq!(appliance.calls("update"), 0);
        assert_eq!(
            appliance.peek(ResourceType::SmbShare, None, "data").unwrap()["description"],
            json!("old")
        );
    }
}
