//! Desired State
//!
//! The operator's sparse description of a resource. A field that was not
//! given is `Unset` and must never be touched; an explicit `null` is `Clear`.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Desired<T>
// =============================================================================

/// One operator-supplied field
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Desired<T> {
    /// Not specified, leave unchanged
    #[default]
    Unset,
    /// Explicit null, clear the field
    Clear,
    /// Explicit value
    Set(T),
}

impl<T> Desired<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Desired::Unset)
    }

    pub fn is_specified(&self) -> bool {
        !self.is_unset()
    }

    /// The explicit value, if any
    pub fn value(&self) -> Option<&T> {
        match self {
            Desired::Set(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Desired<&T> {
        match self {
            Desired::Unset => Desired::Unset,
            Desired::Clear => Desired::Clear,
            Desired::Set(value) => Desired::Set(value),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Desired<U> {
        match self {
            Desired::Unset => Desired::Unset,
            Desired::Clear => Desired::Clear,
            Desired::Set(value) => Desired::Set(f(value)),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Desired<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Only reached when the key is present; absence is handled by `#[serde(default)]`
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Desired::Set(value),
            None => Desired::Clear,
        })
    }
}

impl<T: Serialize> Serialize for Desired<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Desired::Set(value) => value.serialize(serializer),
            _ => serializer.serialize_none(),
        }
    }
}

// =============================================================================
// DesiredState
// =============================================================================

/// Sparse field map in wire names, as consumed by the diff engine
///
/// A key holding `Value::Null` is a clear instruction; a missing key is unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DesiredState {
    fields: IndexMap<String, Value>,
}

impl DesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object, keeping explicit nulls
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            fields: map.into_iter().collect(),
        }
    }

    /// Record a typed field under its wire name
    pub fn put<T: Serialize>(&mut self, name: &str, field: &Desired<T>) -> Result<&mut Self> {
        match field {
            Desired::Unset => {}
            Desired::Clear => {
                self.fields.insert(name.to_string(), Value::Null);
            }
            Desired::Set(value) => {
                self.fields.insert(name.to_string(), serde_json::to_value(value)?);
            }
        }
        Ok(self)
    }

    /// Record an already-lowered value
    pub fn insert(&mut self, name: &str, value: Value) -> &mut Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.shift_remove(name)
    }

    /// Field lookup preserving the unset/clear distinction
    pub fn field(&self, name: &str) -> Desired<&Value> {
        match self.fields.get(name) {
            None => Desired::Unset,
            Some(Value::Null) => Desired::Clear,
            Some(value) => Desired::Set(value),
        }
    }

    /// Deserialize an explicit field
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.fields.get(name) {
            Some(value) if !value.is_null() => Ok(Some(serde_json::from_value(value.clone())
                .map_err(|e| Error::invalid(name, e.to_string()))?)),
            _ => Ok(None),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// =============================================================================
// Constraint Table
// =============================================================================

/// Declarative parameter constraint, checked before any remote call
#[derive(Debug, Clone, Copy)]
pub enum Constraint {
    /// All or none of these fields
    RequiredTogether(&'static [&'static str]),
    /// At most one of these fields
    MutuallyExclusive(&'static [&'static str]),
    /// If `field` is given, every one of `requires` must be too
    RequiredBy {
        field: &'static str,
        requires: &'static [&'static str],
    },
    /// If `field` equals `value`, every one of `requires` must be given
    RequiredIf {
        field: &'static str,
        value: &'static str,
        requires: &'static [&'static str],
    },
}

/// Check a desired state against a constraint table
///
/// Cleared fields count as given: clearing is an explicit instruction.
pub fn validate(desired: &DesiredState, constraints: &[Constraint]) -> Result<()> {
    for constraint in constraints {
        match constraint {
            Constraint::RequiredTogether(fields) => {
                let given: Vec<&str> = fields.iter().copied().filter(|f| desired.contains(f)).collect();
                if !given.is_empty() && given.len() != fields.len() {
                    return Err(Error::Validation(format!(
                        "parameters are required together: {}",
                        fields.join(", ")
                    )));
                }
            }
            Constraint::MutuallyExclusive(fields) => {
                let given: Vec<&str> = fields.iter().copied().filter(|f| desired.contains(f)).collect();
                if given.len() > 1 {
                    return Err(Error::Validation(format!(
                        "parameters are mutually exclusive: {}",
                        given.join(", ")
                    )));
                }
            }
            Constraint::RequiredBy { field, requires } => {
                if desired.contains(field) {
                    missing(desired, requires, &format!("when {} is given", field))?;
                }
            }
            Constraint::RequiredIf {
                field,
                value,
                requires,
            } => {
                if desired.field(field).value().and_then(|v| v.as_str()) == Some(*value) {
                    missing(desired, requires, &format!("when {} is {}", field, value))?;
                }
            }
        }
    }
    Ok(())
}

/// Fail if any of `fields` is not given
pub fn require(desired: &DesiredState, fields: &[&str], context: &str) -> Result<()> {
    missing(desired, fields, context)
}

fn missing(desired: &DesiredState, fields: &[&str], context: &str) -> Result<()> {
    let absent: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|f| desired.field(f).value().is_none())
        .collect();
    if absent.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "missing required parameters {}: {}",
            context,
            absent.join(", ")
        )))
    }
}
