//! Active Directory Provider
//!
//! Joins, tunes and leaves an ADS authentication provider. Credentials and
//! the organizational unit are only used on join. The `spn_command`
//! follow-up checks or repairs the provider's HOST service principal names.

use crate::domain::{Endpoint, Lookup, ResourceType, Snapshot, State};
use crate::error::{Error, Result};
use crate::reconcile::normalize::EnumTable;
use crate::reconcile::{
    field, fixed, Constraint, DesiredState, FieldDiff, FieldRule, FieldSpec, FollowUp, Identity,
    MemberState, Resource, Session, ValueKind,
};
use crate::resources::{parse_params, tagged, ResourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

static SFU_SUPPORT: EnumTable = EnumTable {
    field: "sfu_support",
    entries: &[("none", "none"), ("rfc2307", "rfc2307")],
};

static RULES: &[FieldSpec] = &[
    fixed("name", FieldRule::Scalar(ValueKind::CaseInsensitive)),
    field("user", FieldRule::CreateOnly),
    field("password", FieldRule::CreateOnly),
    field("organizational_unit", FieldRule::CreateOnly),
    field("instance", FieldRule::CreateOnly),
    fixed("groupnet", FieldRule::Scalar(ValueKind::Plain)),
    fixed("machine_account", FieldRule::Scalar(ValueKind::CaseInsensitive)),
    field("allocate_gids", FieldRule::Scalar(ValueKind::Plain)),
    field("allocate_uids", FieldRule::Scalar(ValueKind::Plain)),
    field("assume_default_domain", FieldRule::Scalar(ValueKind::Plain)),
    field("check_online_interval", FieldRule::Scalar(ValueKind::Duration)),
    field("create_home_directory", FieldRule::Scalar(ValueKind::Plain)),
    field("domain_offline_alerts", FieldRule::Scalar(ValueKind::Plain)),
    field("home_directory_template", FieldRule::Scalar(ValueKind::Plain)),
    field("ignore_all_trusts", FieldRule::Scalar(ValueKind::Plain)),
    field("ignored_trusted_domains", FieldRule::Set(ValueKind::CaseInsensitive)),
    field("include_trusted_domains", FieldRule::Set(ValueKind::CaseInsensitive)),
    field("ldap_sign_and_seal", FieldRule::Scalar(ValueKind::Plain)),
    field("login_shell", FieldRule::Scalar(ValueKind::Plain)),
    field("lookup_domains", FieldRule::Set(ValueKind::CaseInsensitive)),
    field("lookup_groups", FieldRule::Scalar(ValueKind::Plain)),
    field("lookup_normalize_groups", FieldRule::Scalar(ValueKind::Plain)),
    field("lookup_normalize_users", FieldRule::Scalar(ValueKind::Plain)),
    field("lookup_users", FieldRule::Scalar(ValueKind::Plain)),
    field("machine_password_changes", FieldRule::Scalar(ValueKind::Plain)),
    field("machine_password_lifespan", FieldRule::Scalar(ValueKind::Duration)),
    field("node_dc_affinity", FieldRule::Scalar(ValueKind::Plain)),
    field("node_dc_affinity_timeout", FieldRule::Scalar(ValueKind::Plain)),
    field("nss_enumeration", FieldRule::Scalar(ValueKind::Plain)),
    field("rpc_call_timeout", FieldRule::Scalar(ValueKind::Plain)),
    field("server_retry_limit", FieldRule::Scalar(ValueKind::Plain)),
    field("sfu_support", FieldRule::Scalar(ValueKind::Enum(&SFU_SUPPORT))),
    field("store_sfu_mappings", FieldRule::Scalar(ValueKind::Plain)),
    field(
        "spns",
        FieldRule::Merge {
            kind: ValueKind::Plain,
            identity: Identity::Whole,
        },
    ),
];

static CONSTRAINTS: &[Constraint] = &[Constraint::RequiredTogether(&["ads_user", "ads_password"])];

// =============================================================================
// Parameters
// =============================================================================

/// What `spn_command` should do after convergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpnCommand {
    Check,
    Fix,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpnEntry {
    pub spn: String,
    #[serde(default)]
    pub state: MemberState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdsParams {
    #[serde(default)]
    pub domain_name: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub ads_user: Option<String>,
    #[serde(default)]
    pub ads_password: Option<String>,
    #[serde(default)]
    pub organizational_unit: Option<String>,
    #[serde(default)]
    pub spns: Option<Vec<SpnEntry>>,
    #[serde(default)]
    pub spn_command: Option<SpnCommand>,
    /// Provider settings passed through under their wire names
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

// =============================================================================
// Resource
// =============================================================================

#[derive(Debug)]
pub struct AdsProvider {
    params: AdsParams,
    raw: DesiredState,
    identity: String,
}

impl AdsProvider {
    pub fn new(params: Map<String, Value>) -> Result<Self> {
        let parsed: AdsParams = parse_params(ResourceKind::AdsProvider, &params)?;
        let identity = parsed
            .instance_name
            .clone()
            .or_else(|| parsed.domain_name.clone())
            .ok_or_else(|| {
                Error::Validation("one of domain_name or instance_name is required".into())
            })?;
        Ok(Self {
            params: parsed,
            raw: DesiredState::from_map(params),
            identity,
        })
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::item(ResourceType::AdsProvider, self.identity.as_str())
    }

    /// `HOST/<fqdn>` and `HOST/<short name>` absent from the provider
    fn missing_spns(snapshot: &Snapshot) -> Vec<String> {
        let Some(hostname) = snapshot.get("hostname").and_then(Value::as_str) else {
            return Vec::new();
        };
        let mut expected = vec![format!("HOST/{}", hostname)];
        if let Some((short, _)) = hostname.split_once('.') {
            expected.push(format!("HOST/{}", short));
        }

        let current: Vec<&str> = snapshot
            .get("spns")
            .and_then(Value::as_array)
            .map(|spns| spns.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        expected
            .into_iter()
            .filter(|spn| !current.iter().any(|have| have.eq_ignore_ascii_case(spn)))
            .collect()
    }
}

#[async_trait]
impl Resource for AdsProvider {
    fn kind(&self) -> &'static str {
        "ads_provider"
    }

    fn name(&self) -> String {
        self.identity.clone()
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
        &["name", "user", "password"]
    }

    fn lower(&self) -> Result<DesiredState> {
        let params = &self.params;
        let mut desired = DesiredState::from_map(params.settings.clone());

        // The live provider is named after its instance when it has one
        desired.insert("name", Value::from(self.identity.as_str()));
        let renamed = [
            ("instance", &params.instance_name),
            ("user", &params.ads_user),
            ("password", &params.ads_password),
            ("organizational_unit", &params.organizational_unit),
        ];
        for (wire, value) in renamed {
            if let Some(value) = value {
                desired.insert(wire, Value::from(value.as_str()));
            }
        }

        if let Some(spns) = &params.spns {
            desired.insert(
                "spns",
                tagged(spns.iter().map(|e| (Value::from(e.spn.as_str()), e.state))),
            );
        }
        Ok(desired)
    }

    async fn fetch(&self, session: &Session) -> Result<Lookup<Snapshot>> {
        session.get(&self.endpoint()).await
    }

    async fn create(&self, session: &Session, payload: &Snapshot) -> Result<()> {
        let mut payload = payload.clone();
        // Joining always names the domain; `instance` carries the provider name
        if self.params.instance_name.is_some() {
            let domain = self.params.domain_name.as_deref().ok_or_else(|| {
                Error::Validation(format!("domain_name is required to create {}", self.identity))
            })?;
            payload.insert("name".into(), Value::from(domain));
        }
        session
            .create(&Endpoint::collection(ResourceType::AdsProvider), &payload)
            .await?;
        Ok(())
    }

    async fn update(&self, session: &Session, _current: &Snapshot, diff: &FieldDiff) -> Result<()> {
        session.update(&self.endpoint(), &diff.to_payload()).await
    }

    async fn delete(&self, session: &Session, _current: &Snapshot) -> Result<()> {
        session.delete(&self.endpoint()).await
    }

    async fn follow_up(&self, session: &Session, snapshot: &Snapshot) -> Result<FollowUp> {
        let Some(command) = self.params.spn_command else {
            return Ok(FollowUp::default());
        };

        let missing = Self::missing_spns(snapshot);
        let mut follow_up = FollowUp::default();
        follow_up.details.insert(
            "missing_spns".into(),
            Value::Array(missing.iter().map(|s| Value::from(s.as_str())).collect()),
        );

        if command == SpnCommand::Fix && !missing.is_empty() {
            info!("Adding {} missing SPNs to {}", missing.len(), self.identity);
            let mut spns: Vec<Value> = snapshot
                .get("spns")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            spns.extend(missing.into_iter().map(Value::from));

            let mut payload = Map::new();
            payload.insert("spns".into(), Value::Array(spns));
            session.update(&self.endpoint(), &payload).await?;
            follow_up.changed = true;
        }
        Ok(follow_up)
    }
}
