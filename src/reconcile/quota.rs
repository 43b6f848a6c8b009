//! Directory Quota Rule
//!
//! Converts the operator's quota parameters into the appliance's quota
//! shape once, then compares thresholds, enforcement and accounting flags
//! against the live quota.

use crate::error::{Error, Result};
use crate::reconcile::normalize::{duration_to_seconds, size_to_bytes, DurationUnit, SizeUnit};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Limits whose presence makes a quota enforced
const ENFORCING_KEYS: [&str; 2] = ["soft", "hard"];

/// Quota parameters as written by the operator
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaParams {
    #[serde(default)]
    pub advisory_limit_size: Option<u64>,
    #[serde(default)]
    pub soft_limit_size: Option<u64>,
    #[serde(default)]
    pub hard_limit_size: Option<u64>,
    #[serde(default)]
    pub cap_unit: Option<SizeUnit>,
    #[serde(default)]
    pub soft_grace_period: Option<u64>,
    #[serde(default)]
    pub period_unit: Option<DurationUnit>,
    #[serde(default, alias = "include_snap_data")]
    pub include_snapshots: Option<bool>,
    #[serde(default)]
    pub include_data_protection_overhead: Option<bool>,
    #[serde(default)]
    pub container: Option<bool>,
}

/// Limits in bytes and grace in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaThresholds {
    pub advisory: Option<u64>,
    pub soft: Option<u64>,
    pub hard: Option<u64>,
    pub soft_grace: Option<u64>,
}

impl QuotaThresholds {
    /// A quota is enforced once it carries a soft or hard limit
    pub fn enforced(&self) -> bool {
        self.soft.is_some() || self.hard.is_some()
    }

    /// Only the thresholds that are set; the rest are left to the live quota
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        let limits = [
            ("advisory", self.advisory),
            ("soft", self.soft),
            ("hard", self.hard),
            ("soft_grace", self.soft_grace),
        ];
        for (key, limit) in limits {
            if let Some(limit) = limit {
                obj.insert(key.into(), limit.into());
            }
        }
        Value::Object(obj)
    }
}

impl QuotaParams {
    fn has_limits(&self) -> bool {
        self.advisory_limit_size.is_some()
            || self.soft_limit_size.is_some()
            || self.hard_limit_size.is_some()
    }

    /// Convert limits to bytes and grace to seconds
    pub fn thresholds(&self) -> Result<QuotaThresholds> {
        let unit = self.cap_unit.unwrap_or(SizeUnit::GB);
        let bytes = |field: &str, value: Option<u64>| -> Result<Option<u64>> {
            value.map(|v| size_to_bytes(field, v, unit)).transpose()
        };

        let soft = bytes("soft_limit_size", self.soft_limit_size)?;
        let soft_grace = match (soft, self.soft_grace_period) {
            (Some(_), None) => {
                return Err(Error::Validation(
                    "soft_grace_period is required with soft_limit_size".into(),
                ))
            }
            (_, Some(grace)) => Some(duration_to_seconds(
                "soft_grace_period",
                grace,
                self.period_unit.unwrap_or(DurationUnit::Days),
            )?),
            (None, None) => None,
        };

        Ok(QuotaThresholds {
            advisory: bytes("advisory_limit_size", self.advisory_limit_size)?,
            soft,
            hard: bytes("hard_limit_size", self.hard_limit_size)?,
            soft_grace,
        })
    }

    /// Sparse wire form; only what the operator gave is present
    ///
    /// `enforced` is left out: it follows from the thresholds after they are
    /// merged onto the live quota.
    pub fn to_desired(&self) -> Result<Value> {
        let mut obj = Map::new();
        if self.has_limits() || self.soft_grace_period.is_some() {
            obj.insert("thresholds".into(), self.thresholds()?.to_value());
        }
        if let Some(include) = self.include_snapshots {
            obj.insert("include_snapshots".into(), include.into());
        }
        if let Some(overhead) = self.include_data_protection_overhead {
            obj.insert("thresholds_on".into(), thresholds_on(overhead).into());
        }
        if let Some(container) = self.container {
            obj.insert("container".into(), container.into());
        }
        Ok(Value::Object(obj))
    }
}

fn thresholds_on(include_overhead: bool) -> &'static str {
    if include_overhead {
        "physicalsize"
    } else {
        "fslogicalsize"
    }
}

/// Compare a desired wire-form quota with the live one
///
/// Thresholds are merged one by one, so limits the operator left out keep
/// their live values. Returns the full merged quota when anything differs,
/// or when no quota exists yet.
pub fn diff(current: &Value, desired: &Value) -> Result<Option<Value>> {
    let desired = desired
        .as_object()
        .ok_or_else(|| Error::invalid("quota", "expected a mapping"))?;

    let live = current.as_object();
    let mut merged = live.cloned().unwrap_or_default();
    let mut changed = live.is_none();

    for (key, want) in desired {
        if key == "thresholds" {
            let wanted = want
                .as_object()
                .ok_or_else(|| Error::invalid("quota.thresholds", "expected a mapping"))?;
            let mut thresholds = merged
                .get("thresholds")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            for (limit, value) in wanted {
                if thresholds.get(limit) != Some(value) {
                    thresholds.insert(limit.clone(), value.clone());
                    changed = true;
                }
            }

            let enforced = ENFORCING_KEYS
                .iter()
                .any(|limit| thresholds.get(*limit).is_some_and(|v| !v.is_null()));
            merged.insert(key.clone(), Value::Object(thresholds));
            if merged.get("enforced") != Some(&Value::Bool(enforced)) {
                merged.insert("enforced".into(), Value::Bool(enforced));
                changed = true;
            }
        } else if merged.get(key) != Some(want) {
            merged.insert(key.clone(), want.clone());
            changed = true;
        }
    }

    Ok(changed.then_some(Value::Object(merged)))
}
