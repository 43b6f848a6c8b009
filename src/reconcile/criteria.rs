//! File Matching Criteria
//!
//! Validates the operator's OR-of-AND criteria tree and lowers it to the
//! appliance's `file_matching_pattern` form. Validation runs before any
//! comparison so that a malformed tree never reaches the appliance.

use crate::error::{Error, Result};
use crate::reconcile::normalize::{duration_to_seconds, size_to_bytes, DurationUnit, SizeUnit};
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum OR branches in one pattern
pub const MAX_OR_CRITERIA: usize = 3;

/// Maximum AND leaves in one branch
pub const MAX_AND_CRITERIA: usize = 5;

// =============================================================================
// Operator Form
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileMatchCriteria {
    pub or_criteria: Vec<AndCriteria>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AndCriteria {
    pub and_criteria: Vec<Criterion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionType {
    FileName,
    FilePath,
    FileType,
    FileAttribute,
    Size,
    Accessed,
    Created,
    Modified,
    MetadataChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Matches,
    DoesNotMatch,
    Contains,
    DoesNotContain,
    Exists,
    DoesNotExist,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanEqualTo,
    LessThan,
    LessThanEqualTo,
    After,
    Before,
    IsNewerThan,
    IsOlderThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SizeInfo {
    pub size_value: u64,
    pub size_unit: SizeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelativeTime {
    pub time_value: u64,
    pub time_unit: DurationUnit,
}

/// One leaf of the tree
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Criterion {
    #[serde(rename = "type")]
    pub kind: CriterionType,
    pub condition: Condition,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub case_sensitive: Option<bool>,
    #[serde(default)]
    pub size_info: Option<SizeInfo>,
    #[serde(default)]
    pub datetime_value: Option<String>,
    #[serde(default)]
    pub relative_datetime_count: Option<RelativeTime>,
}

impl CriterionType {
    /// Conditions legal for this leaf type
    pub fn conditions(&self) -> &'static [Condition] {
        use Condition::*;
        match self {
            CriterionType::FileName | CriterionType::FilePath => {
                &[Matches, DoesNotMatch, Contains, DoesNotContain]
            }
            CriterionType::FileType => &[Matches, DoesNotMatch],
            CriterionType::FileAttribute => &[Matches, DoesNotMatch, Exists, DoesNotExist],
            CriterionType::Size => &[
                Equal,
                NotEqual,
                GreaterThan,
                GreaterThanEqualTo,
                LessThan,
                LessThanEqualTo,
            ],
            CriterionType::Accessed
            | CriterionType::Created
            | CriterionType::Modified
            | CriterionType::MetadataChanged => &[After, Before, IsNewerThan, IsOlderThan],
        }
    }

    fn wire_type(&self) -> &'static str {
        match self {
            CriterionType::FileName => "name",
            CriterionType::FilePath => "path",
            CriterionType::FileType => "file_type",
            CriterionType::FileAttribute => "custom_attribute",
            CriterionType::Size => "size",
            CriterionType::Accessed => "accessed_time",
            CriterionType::Created => "birth_time",
            CriterionType::Modified => "changed_time",
            CriterionType::MetadataChanged => "metadata_changed_time",
        }
    }

    fn is_time(&self) -> bool {
        self.conditions().contains(&Condition::After)
    }
}

impl Condition {
    fn operator(&self) -> &'static str {
        match self {
            Condition::Matches | Condition::Contains | Condition::Exists | Condition::Equal => "==",
            Condition::DoesNotMatch | Condition::DoesNotContain | Condition::NotEqual => "!=",
            Condition::DoesNotExist => "!",
            Condition::GreaterThan | Condition::After | Condition::IsNewerThan => ">",
            Condition::GreaterThanEqualTo => ">=",
            Condition::LessThan | Condition::Before | Condition::IsOlderThan => "<",
            Condition::LessThanEqualTo => "<=",
        }
    }
}

fn invalid(position: (usize, usize), reason: impl std::fmt::Display) -> Error {
    Error::InvalidCriteria(format!(
        "or_criteria[{}].and_criteria[{}]: {}",
        position.0, position.1, reason
    ))
}

// =============================================================================
// Validation
// =============================================================================

impl FileMatchCriteria {
    /// Parse and validate the operator form
    pub fn from_value(raw: &Value) -> Result<Self> {
        let criteria: FileMatchCriteria = serde_json::from_value(raw.clone())
            .map_err(|e| Error::InvalidCriteria(e.to_string()))?;
        criteria.validate()?;
        Ok(criteria)
    }

    pub fn validate(&self) -> Result<()> {
        if self.or_criteria.is_empty() {
            return Err(Error::InvalidCriteria("or_criteria must not be empty".into()));
        }
        if self.or_criteria.len() > MAX_OR_CRITERIA {
            return Err(Error::InvalidCriteria(format!(
                "at most {} or_criteria are allowed, got {}",
                MAX_OR_CRITERIA,
                self.or_criteria.len()
            )));
        }
        for (i, branch) in self.or_criteria.iter().enumerate() {
            if branch.and_criteria.is_empty() {
                return Err(Error::InvalidCriteria(format!(
                    "or_criteria[{}].and_criteria must not be empty",
                    i
                )));
            }
            if branch.and_criteria.len() > MAX_AND_CRITERIA {
                return Err(Error::InvalidCriteria(format!(
                    "or_criteria[{}] allows at most {} and_criteria, got {}",
                    i,
                    MAX_AND_CRITERIA,
                    branch.and_criteria.len()
                )));
            }
            for (j, leaf) in branch.and_criteria.iter().enumerate() {
                leaf.validate((i, j))?;
            }
        }
        Ok(())
    }

    /// Lower to the appliance's wire form
    pub fn to_wire(&self) -> Result<Value> {
        let mut or_criteria = Vec::with_capacity(self.or_criteria.len());
        for (i, branch) in self.or_criteria.iter().enumerate() {
            let mut and_criteria = Vec::with_capacity(branch.and_criteria.len());
            for (j, leaf) in branch.and_criteria.iter().enumerate() {
                and_criteria.push(leaf.to_wire((i, j))?);
            }
            let mut obj = Map::new();
            obj.insert("and_criteria".into(), Value::Array(and_criteria));
            or_criteria.push(Value::Object(obj));
        }
        let mut obj = Map::new();
        obj.insert("or_criteria".into(), Value::Array(or_criteria));
        Ok(Value::Object(obj))
    }
}

impl Criterion {
    fn validate(&self, at: (usize, usize)) -> Result<()> {
        if !self.kind.conditions().contains(&self.condition) {
            return Err(invalid(
                at,
                format!("condition {:?} is not valid for {:?}", self.condition, self.kind),
            ));
        }

        if self.case_sensitive.is_some()
            && !matches!(self.kind, CriterionType::FileName | CriterionType::FilePath)
        {
            return Err(invalid(at, "case_sensitive applies only to file_name and file_path"));
        }

        match self.kind {
            CriterionType::FileName | CriterionType::FilePath => {
                self.require_value(at)?;
            }
            CriterionType::FileType => {
                let value = self.require_value(at)?;
                if !["file", "directory", "other"].contains(&value) {
                    return Err(invalid(
                        at,
                        format!("file_type must be file, directory or other, got '{}'", value),
                    ));
                }
            }
            CriterionType::FileAttribute => {
                if self.field.is_none() {
                    return Err(invalid(at, "file_attribute requires field"));
                }
                if matches!(self.condition, Condition::Matches | Condition::DoesNotMatch) {
                    self.require_value(at)?;
                }
            }
            CriterionType::Size => {
                if self.size_info.is_none() {
                    return Err(invalid(at, "size requires size_info"));
                }
            }
            _ => {
                let absolute = matches!(self.condition, Condition::After | Condition::Before);
                match (&self.datetime_value, &self.relative_datetime_count, absolute) {
                    (Some(raw), None, true) => {
                        parse_datetime(raw).map_err(|reason| invalid(at, reason))?;
                    }
                    (None, Some(_), false) => {}
                    (Some(_), Some(_), _) => {
                        return Err(invalid(
                            at,
                            "datetime_value and relative_datetime_count are mutually exclusive",
                        ))
                    }
                    (_, _, true) => {
                        return Err(invalid(at, "after/before require datetime_value"));
                    }
                    (_, _, false) => {
                        return Err(invalid(
                            at,
                            "is_newer_than/is_older_than require relative_datetime_count",
                        ));
                    }
                }
            }
        }

        if !self.kind.is_time()
            && (self.datetime_value.is_some() || self.relative_datetime_count.is_some())
        {
            return Err(invalid(at, "time values apply only to time criteria"));
        }
        Ok(())
    }

    fn require_value(&self, at: (usize, usize)) -> Result<&str> {
        self.value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| invalid(at, format!("{:?} requires value", self.kind)))
    }

    fn to_wire(&self, at: (usize, usize)) -> Result<Value> {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::from(self.kind.wire_type()));
        obj.insert("operator".into(), Value::from(self.condition.operator()));

        match self.kind {
            CriterionType::FileName | CriterionType::FilePath => {
                let value = self.require_value(at)?;
                let value = match self.condition {
                    Condition::Contains | Condition::DoesNotContain => format!("*{}*", value),
                    _ => value.to_string(),
                };
                obj.insert("value".into(), Value::from(value));
                obj.insert(
                    "case_sensitive".into(),
                    Value::from(self.case_sensitive.unwrap_or(true)),
                );
            }
            CriterionType::FileType => {
                obj.insert("value".into(), Value::from(self.require_value(at)?));
            }
            CriterionType::FileAttribute => {
                obj.insert("field".into(), Value::from(self.field.clone()));
                if let Some(value) = &self.value {
                    obj.insert("value".into(), Value::from(value.clone()));
                }
            }
            CriterionType::Size => {
                let info = self
                    .size_info
                    .ok_or_else(|| invalid(at, "size requires size_info"))?;
                let bytes = size_to_bytes("size_info", info.size_value, info.size_unit)?;
                obj.insert("value".into(), Value::from(bytes.to_string()));
                obj.insert("units".into(), Value::from("B"));
            }
            _ => match (&self.datetime_value, &self.relative_datetime_count) {
                (Some(raw), _) => {
                    let epoch = parse_datetime(raw).map_err(|reason| invalid(at, reason))?;
                    obj.insert("use_relative_time".into(), Value::from(false));
                    obj.insert("value".into(), Value::from(epoch.to_string()));
                }
                (None, Some(relative)) => {
                    let seconds = duration_to_seconds(
                        "relative_datetime_count",
                        relative.time_value,
                        relative.time_unit,
                    )?;
                    obj.insert("use_relative_time".into(), Value::from(true));
                    obj.insert("value".into(), Value::from(seconds.to_string()));
                }
                (None, None) => return Err(invalid(at, "missing time value")),
            },
        }
        Ok(Value::Object(obj))
    }
}

/// Parse `YYYY-MM-DD HH:MM` (or a bare date) to epoch seconds, UTC
fn parse_datetime(raw: &str) -> std::result::Result<i64, String> {
    let raw = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M") {
        return Ok(dt.and_utc().timestamp());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc().timestamp());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| format!("'{}' is not a YYYY-MM-DD HH:MM datetime", raw))
}

/// Validate and lower a raw criteria value in one step
pub fn translate(raw: &Value) -> Result<Value> {
    FileMatchCriteria::from_value(raw)?.to_wire()
}

/// Compare a lowered pattern with the live one
///
/// Live leaves may carry extra keys the appliance fills in; only the keys
/// of the lowered leaf are compared.
pub fn matches_live(wire: &Value, live: &Value) -> bool {
    fn branches(pattern: &Value) -> &[Value] {
        pattern
            .get("or_criteria")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
    fn leaves(branch: &Value) -> &[Value] {
        branch
            .get("and_criteria")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    let (want, have) = (branches(wire), branches(live));
    want.len() == have.len()
        && want.iter().zip(have).all(|(want, have)| {
            let (want, have) = (leaves(want), leaves(have));
            want.len() == have.len()
                && want.iter().zip(have).all(|(want, have)| match want.as_object() {
                    Some(keys) => keys.iter().all(|(k, v)| have.get(k) == Some(v)),
                    None => want == have,
                })
        })
}
