//! Field Diff Engine
//!
//! Compares a live snapshot with a sparse desired state under a static
//! per-resource rule table and produces the minimal set of fields to send.
//!
//! # Rules
//!
//! - `Scalar`: sent when the normalized values differ
//! - `Set` / `List`: full replacement, order-insensitive or ordered
//! - `Merge`: per-element add/remove, or `{"replace": [...]}`
//! - `Nested`: a sub-object compared field by field
//! - `Quota`, `Criteria`: delegated to their own modules
//! - `CreateOnly`: only ever sent on create

use crate::error::{Error, Result};
use crate::reconcile::collection::{self, MemberState, Members, Sequence, Tagged};
use crate::reconcile::desired::DesiredState;
use crate::reconcile::normalize::{normalize, ValueKind};
use crate::reconcile::{criteria, quota};
use crate::domain::Snapshot;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

// =============================================================================
// Rule Tables
// =============================================================================

/// How elements of a merge collection are matched
#[derive(Debug, Clone, Copy)]
pub enum Identity {
    /// The whole normalized element
    Whole,
    /// The tuple of values at these JSON pointers
    Keys(&'static [&'static str]),
}

/// Comparison rule for one field
#[derive(Debug, Clone, Copy)]
pub enum FieldRule {
    Scalar(ValueKind),
    Set(ValueKind),
    List(ValueKind),
    Merge { kind: ValueKind, identity: Identity },
    Nested(&'static [FieldSpec]),
    Quota,
    Criteria,
    CreateOnly,
}

/// A field and its rule
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub rule: FieldRule,
    pub mutable: bool,
}

/// Mutable field
pub const fn field(name: &'static str, rule: FieldRule) -> FieldSpec {
    FieldSpec {
        name,
        rule,
        mutable: true,
    }
}

/// Field that cannot change once the resource exists
pub const fn fixed(name: &'static str, rule: FieldRule) -> FieldSpec {
    FieldSpec {
        name,
        rule,
        mutable: false,
    }
}

fn rule_for<'a>(rules: &'a [FieldSpec], name: &str) -> Result<&'a FieldSpec> {
    rules
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| Error::Validation(format!("unsupported parameter: {}", name)))
}

// =============================================================================
// FieldDiff
// =============================================================================

/// Ordered field -> new value; empty means nothing to do
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FieldDiff {
    fields: IndexMap<String, Value>,
}

impl FieldDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.shift_remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Fields of this diff that the rule table marks immutable
    pub fn immutable(&self, rules: &[FieldSpec]) -> Vec<String> {
        self.names()
            .filter(|name| rules.iter().any(|s| s.name == *name && !s.mutable))
            .map(str::to_string)
            .collect()
    }

    /// Split off the named fields into their own diff
    pub fn split(&mut self, names: &[&str]) -> FieldDiff {
        let mut part = FieldDiff::new();
        for name in names {
            if let Some(value) = self.remove(name) {
                part.insert(*name, value);
            }
        }
        part
    }

    /// Update payload carrying only the changed fields
    pub fn to_payload(&self) -> Snapshot {
        self.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Overlay this diff onto a snapshot
    pub fn apply(&self, snapshot: &mut Snapshot) {
        for (name, value) in &self.fields {
            snapshot.insert(name.clone(), value.clone());
        }
    }
}

impl From<Snapshot> for FieldDiff {
    fn from(map: Snapshot) -> Self {
        Self {
            fields: map.into_iter().collect(),
        }
    }
}

// =============================================================================
// Diff
// =============================================================================

/// Minimal change set turning `current` into `desired`
pub fn diff(current: &Snapshot, desired: &DesiredState, rules: &[FieldSpec]) -> Result<FieldDiff> {
    let mut out = FieldDiff::new();

    for (name, want) in desired.iter() {
        let spec = rule_for(rules, name)?;
        let have = current.get(name.as_str()).unwrap_or(&Value::Null);
        if let Some(value) = diff_field(name, spec.rule, have, want)? {
            out.insert(name.clone(), value);
        }
    }

    Ok(out)
}

fn diff_field(name: &str, rule: FieldRule, have: &Value, want: &Value) -> Result<Option<Value>> {
    match rule {
        FieldRule::CreateOnly => Ok(None),
        FieldRule::Scalar(kind) => {
            let want_norm = normalize(name, kind, want)?;
            let have_norm = lenient(name, kind, have);
            if want_norm == have_norm {
                Ok(None)
            } else {
                Ok(Some(outgoing(kind, want, want_norm)))
            }
        }
        FieldRule::Set(kind) | FieldRule::List(kind) => {
            let sequence = match rule {
                FieldRule::List(_) => Sequence::Ordered,
                _ => Sequence::Unordered,
            };
            let current = lenient_items(name, kind, have);
            let desired = items(name, kind, want)?;
            let result = collection::replace(&current, Some(desired.as_slice()), sequence);
            Ok(result.changed.then(|| Value::Array(result.items)))
        }
        FieldRule::Merge { kind, identity } => {
            let current = lenient_items(name, kind, have);
            let members = members(name, kind, want)?;
            let result = collection::reconcile(&current, Some(&members), Sequence::Unordered, |item| {
                key(identity, item)
            });
            Ok(result.changed.then(|| Value::Array(result.items)))
        }
        FieldRule::Nested(specs) => nested(name, specs, have, want),
        FieldRule::Quota => {
            if want.is_null() {
                Ok((!have.is_null()).then_some(Value::Null))
            } else {
                quota::diff(have, want)
            }
        }
        FieldRule::Criteria => {
            if want.is_null() {
                return Err(Error::InvalidCriteria(format!("{} cannot be cleared", name)));
            }
            let wire = criteria::translate(want)?;
            Ok((!criteria::matches_live(&wire, have)).then_some(wire))
        }
    }
}

fn nested(name: &str, specs: &[FieldSpec], have: &Value, want: &Value) -> Result<Option<Value>> {
    let Some(want_obj) = want.as_object() else {
        if want.is_null() {
            return Ok((!have.is_null()).then_some(Value::Null));
        }
        return Err(Error::invalid(name, "expected a mapping"));
    };
    let have_obj = have.as_object().cloned().unwrap_or_default();

    // A disabled block ignores every other sub-field
    if want_obj.get("enabled") == Some(&Value::Bool(false)) {
        if have_obj.get("enabled") == Some(&Value::Bool(false)) {
            return Ok(None);
        }
        let mut merged = have_obj;
        merged.insert("enabled".into(), Value::Bool(false));
        return Ok(Some(Value::Object(merged)));
    }

    let sub = diff(&have_obj, &DesiredState::from_map(want_obj.clone()), specs)
        .map_err(|e| scoped(name, e))?;
    if sub.is_empty() {
        return Ok(None);
    }
    let mut merged = have_obj;
    sub.apply(&mut merged);
    Ok(Some(Value::Object(merged)))
}

fn scoped(parent: &str, err: Error) -> Error {
    match err {
        Error::InvalidValue { field, reason } => Error::InvalidValue {
            field: format!("{}.{}", parent, field),
            reason,
        },
        other => other,
    }
}

/// Normalize a live value; it came from the appliance so failures keep it raw
fn lenient(name: &str, kind: ValueKind, have: &Value) -> Value {
    normalize(name, kind, have).unwrap_or_else(|_| have.clone())
}

fn lenient_items(name: &str, kind: ValueKind, have: &Value) -> Vec<Value> {
    match have {
        Value::Array(items) => items.iter().map(|item| lenient(name, kind, item)).collect(),
        _ => Vec::new(),
    }
}

/// Desired collection elements; `null` clears
fn items(name: &str, kind: ValueKind, want: &Value) -> Result<Vec<Value>> {
    match want {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(|item| normalize(name, kind, item)).collect(),
        other => Err(Error::invalid(name, format!("expected a list, got {}", other))),
    }
}

/// Merge instruction: tagged entries, `{"replace": [...]}`, or `null`
fn members(name: &str, kind: ValueKind, want: &Value) -> Result<Members<Value>> {
    match want {
        Value::Null => Ok(Members::Replace(Vec::new())),
        Value::Object(obj) if obj.contains_key("replace") => {
            let mut replaced: Vec<Value> = Vec::new();
            for item in items(name, kind, &obj["replace"])? {
                if !replaced.contains(&item) {
                    replaced.push(item);
                }
            }
            Ok(Members::Replace(replaced))
        }
        Value::Array(entries) => {
            let mut tagged = Vec::with_capacity(entries.len());
            for entry in entries {
                let state: MemberState = match entry.get("state") {
                    Some(state) => serde_json::from_value(state.clone())
                        .map_err(|e| Error::invalid(name, e.to_string()))?,
                    None => MemberState::Present,
                };
                let value = entry
                    .get("value")
                    .ok_or_else(|| Error::invalid(name, "merge entry without value"))?;
                tagged.push(Tagged {
                    item: normalize(name, kind, value)?,
                    state,
                });
            }
            Ok(Members::Merge(tagged))
        }
        other => Err(Error::invalid(name, format!("expected a list, got {}", other))),
    }
}

fn key(identity: Identity, item: &Value) -> Vec<Value> {
    match identity {
        Identity::Whole => vec![item.clone()],
        Identity::Keys(pointers) => pointers
            .iter()
            .map(|p| item.pointer(p).cloned().unwrap_or(Value::Null))
            .collect(),
    }
}

/// Value to send; case-insensitive fields keep the operator's spelling
fn outgoing(kind: ValueKind, raw: &Value, normalized: Value) -> Value {
    match kind {
        ValueKind::CaseInsensitive => raw.clone(),
        _ => normalized,
    }
}

// =============================================================================
// Create Payload
// =============================================================================

/// Normalize every explicitly set field for a create request
pub fn payload(desired: &DesiredState, rules: &[FieldSpec]) -> Result<Snapshot> {
    let mut out = Map::new();

    for (name, want) in desired.iter() {
        let spec = rule_for(rules, name)?;
        if want.is_null() {
            continue;
        }
        if let Some(value) = create_value(name, spec.rule, want)? {
            out.insert(name.clone(), value);
        }
    }

    Ok(out)
}

fn create_value(name: &str, rule: FieldRule, want: &Value) -> Result<Option<Value>> {
    match rule {
        FieldRule::CreateOnly => Ok(Some(want.clone())),
        FieldRule::Scalar(kind) => Ok(Some(outgoing(kind, want, normalize(name, kind, want)?))),
        FieldRule::Set(_) | FieldRule::List(_) | FieldRule::Merge { .. } => {
            diff_field(name, rule, &Value::Array(Vec::new()), want)
                .map(|v| Some(v.unwrap_or_else(|| Value::Array(Vec::new()))))
        }
        FieldRule::Nested(specs) => {
            let obj = want
                .as_object()
                .ok_or_else(|| Error::invalid(name, "expected a mapping"))?;
            let sub = payload(&DesiredState::from_map(obj.clone()), specs).map_err(|e| scoped(name, e))?;
            Ok(Some(Value::Object(sub)))
        }
        FieldRule::Quota => quota::diff(&Value::Null, want),
        FieldRule::Criteria => criteria::translate(want).map(Some),
    }
}
