//! Comparable Value Normalizer
//!
//! Converts heterogeneous wire-format values (octal permission strings,
//! quantities with units, enum aliases, persona references) into canonical
//! values that can be compared with plain equality. Everything here is pure
//! and uses integer arithmetic only.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

// =============================================================================
// Value Kinds
// =============================================================================

/// How a field's value is canonicalized before comparison
#[derive(Debug, Clone, Copy)]
pub enum ValueKind {
    /// Compared as-is
    Plain,
    /// Strings compared without regard to ASCII case
    CaseInsensitive,
    /// Octal permission bits, `"0755"` or `493`
    OctalMode,
    /// Byte count, or `{value, unit}` with a size unit
    Size,
    /// Seconds, or `{value, unit}` with a duration unit
    Duration,
    /// Human-facing choice mapped through a static alias table
    Enum(&'static EnumTable),
    /// Persona reference or an entry carrying one under `trustee`
    Trustee,
}

/// Static alias table for an enum-valued field
#[derive(Debug)]
pub struct EnumTable {
    pub field: &'static str,
    /// `(accepted input, wire value)`; wire values must also appear as inputs
    pub entries: &'static [(&'static str, &'static str)],
}

impl EnumTable {
    /// Map an input to its wire value
    pub fn resolve(&self, input: &str) -> Result<&'static str> {
        self.entries
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(input))
            .map(|(_, wire)| *wire)
            .ok_or_else(|| Error::UnknownEnumValue {
                field: self.field.to_string(),
                value: input.to_string(),
                allowed: self.choices(),
            })
    }

    /// Distinct accepted inputs, for error messages
    pub fn choices(&self) -> Vec<String> {
        let mut choices: Vec<String> = Vec::new();
        for (alias, _) in self.entries {
            if !choices.iter().any(|c| c == alias) {
                choices.push(alias.to_string());
            }
        }
        choices
    }
}

// =============================================================================
// Units
// =============================================================================

/// Size units, binary multiples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeUnit {
    #[serde(alias = "b")]
    B,
    #[serde(alias = "kb")]
    KB,
    #[serde(alias = "mb")]
    MB,
    #[serde(alias = "gb")]
    GB,
    #[serde(alias = "tb")]
    TB,
    #[serde(alias = "pb")]
    PB,
}

impl SizeUnit {
    pub const ALL: [SizeUnit; 6] = [
        SizeUnit::B,
        SizeUnit::KB,
        SizeUnit::MB,
        SizeUnit::GB,
        SizeUnit::TB,
        SizeUnit::PB,
    ];

    /// Bytes per unit
    pub fn multiplier(&self) -> u64 {
        match self {
            SizeUnit::B => 1,
            SizeUnit::KB => 1 << 10,
            SizeUnit::MB => 1 << 20,
            SizeUnit::GB => 1 << 30,
            SizeUnit::TB => 1 << 40,
            SizeUnit::PB => 1 << 50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeUnit::B => "B",
            SizeUnit::KB => "KB",
            SizeUnit::MB => "MB",
            SizeUnit::GB => "GB",
            SizeUnit::TB => "TB",
            SizeUnit::PB => "PB",
        }
    }
}

impl FromStr for SizeUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SizeUnit::ALL
            .iter()
            .find(|u| u.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| Error::UnknownEnumValue {
                field: "size unit".into(),
                value: s.to_string(),
                allowed: SizeUnit::ALL.iter().map(|u| u.as_str().to_string()).collect(),
            })
    }
}

/// Duration units; a month is 30 days and a year 365 days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl DurationUnit {
    pub const ALL: [DurationUnit; 7] = [
        DurationUnit::Seconds,
        DurationUnit::Minutes,
        DurationUnit::Hours,
        DurationUnit::Days,
        DurationUnit::Weeks,
        DurationUnit::Months,
        DurationUnit::Years,
    ];

    /// Seconds per unit
    pub fn multiplier(&self) -> u64 {
        match self {
            DurationUnit::Seconds => 1,
            DurationUnit::Minutes => 60,
            DurationUnit::Hours => 3_600,
            DurationUnit::Days => 86_400,
            DurationUnit::Weeks => 7 * 86_400,
            DurationUnit::Months => 30 * 86_400,
            DurationUnit::Years => 365 * 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Seconds => "seconds",
            DurationUnit::Minutes => "minutes",
            DurationUnit::Hours => "hours",
            DurationUnit::Days => "days",
            DurationUnit::Weeks => "weeks",
            DurationUnit::Months => "months",
            DurationUnit::Years => "years",
        }
    }
}

impl FromStr for DurationUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_ascii_lowercase();
        let singular = lowered.trim_end_matches('s');
        DurationUnit::ALL
            .iter()
            .find(|u| u.as_str().trim_end_matches('s') == singular)
            .copied()
            .ok_or_else(|| Error::UnknownEnumValue {
                field: "duration unit".into(),
                value: s.to_string(),
                allowed: DurationUnit::ALL.iter().map(|u| u.as_str().to_string()).collect(),
            })
    }
}

/// Scale `value` by `multiplier`, failing on overflow
pub fn to_base(field: &str, value: u64, multiplier: u64) -> Result<u64> {
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::invalid(field, format!("{} x {} overflows", value, multiplier)))
}

/// Inverse of [`to_base`]; `None` unless the division is exact
pub fn from_base(base: u64, multiplier: u64) -> Option<u64> {
    if multiplier == 0 || base % multiplier != 0 {
        None
    } else {
        Some(base / multiplier)
    }
}

/// Convert a size to bytes
pub fn size_to_bytes(field: &str, value: u64, unit: SizeUnit) -> Result<u64> {
    to_base(field, value, unit.multiplier())
}

/// Convert a duration to seconds
pub fn duration_to_seconds(field: &str, value: u64, unit: DurationUnit) -> Result<u64> {
    to_base(field, value, unit.multiplier())
}

// =============================================================================
// Octal Modes
// =============================================================================

/// Largest permission value accepted (setuid/setgid/sticky + rwx for all)
pub const MAX_MODE: u32 = 0o7777;

/// Parse an octal permission string such as `"0755"`
pub fn parse_octal(field: &str, raw: &str) -> Result<u32> {
    let digits = raw.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    if digits.is_empty() {
        return Err(Error::invalid(field, "empty octal value"));
    }
    if let Some(bad) = digits.chars().find(|c| !('0'..='7').contains(c)) {
        return Err(Error::invalid(
            field,
            format!("'{}' contains non-octal digit '{}'", raw, bad),
        ));
    }
    let value = u32::from_str_radix(digits, 8)
        .map_err(|e| Error::invalid(field, format!("'{}': {}", raw, e)))?;
    if value > MAX_MODE {
        return Err(Error::invalid(field, format!("'{}' exceeds {:o}", raw, MAX_MODE)));
    }
    Ok(value)
}

/// Render permission bits back to their octal display form
pub fn format_octal(mode: u32) -> String {
    format!("{:o}", mode)
}

// =============================================================================
// Normalize
// =============================================================================

/// Canonicalize `raw` according to `kind`
///
/// `null` always normalizes to `null` so that an explicit clear survives.
pub fn normalize(field: &str, kind: ValueKind, raw: &Value) -> Result<Value> {
    if raw.is_null() {
        return Ok(Value::Null);
    }

    match kind {
        ValueKind::Plain => Ok(raw.clone()),
        ValueKind::CaseInsensitive => Ok(lowercase(raw)),
        ValueKind::OctalMode => match raw {
            Value::String(s) => Ok(Value::from(parse_octal(field, s)?)),
            Value::Number(n) => match n.as_u64() {
                Some(v) if v <= MAX_MODE as u64 => Ok(Value::from(v)),
                _ => Err(Error::invalid(field, format!("{} is not a permission mode", n))),
            },
            other => Err(Error::invalid(field, format!("expected octal string, got {}", other))),
        },
        ValueKind::Size => quantity(field, raw, |unit| Ok(unit.parse::<SizeUnit>()?.multiplier())),
        ValueKind::Duration => {
            quantity(field, raw, |unit| Ok(unit.parse::<DurationUnit>()?.multiplier()))
        }
        ValueKind::Enum(table) => match raw {
            Value::String(s) => Ok(Value::from(table.resolve(s)?)),
            other => Err(Error::invalid(field, format!("expected a string, got {}", other))),
        },
        ValueKind::Trustee => Ok(canonical_trustee(raw)),
    }
}

fn lowercase(raw: &Value) -> Value {
    match raw {
        Value::String(s) => Value::from(s.to_lowercase()),
        Value::Array(items) => Value::Array(items.iter().map(lowercase).collect()),
        other => other.clone(),
    }
}

/// `{value, unit}` object or a plain base-unit integer
fn quantity<F>(field: &str, raw: &Value, multiplier: F) -> Result<Value>
where
    F: Fn(&str) -> Result<u64>,
{
    match raw {
        Value::Number(n) => n
            .as_u64()
            .map(Value::from)
            .ok_or_else(|| Error::invalid(field, format!("{} is not a non-negative integer", n))),
        Value::Object(obj) => {
            let value = obj
                .get("value")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::invalid(field, "missing integer 'value'"))?;
            let unit = obj
                .get("unit")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::invalid(field, "missing 'unit'"))?;
            Ok(Value::from(to_base(field, value, multiplier(unit)?)?))
        }
        other => Err(Error::invalid(field, format!("expected a quantity, got {}", other))),
    }
}

/// Reduce persona references to `{"id": ...}`
///
/// ACE-like objects keep their other keys; their string lists are sorted
/// because rights and inherit flags carry no order.
fn canonical_trustee(raw: &Value) -> Value {
    match raw {
        Value::String(id) => persona(id),
        Value::Object(obj) if obj.contains_key("trustee") => {
            let mut entry = Map::new();
            for (key, value) in obj {
                let canonical = if key == "trustee" {
                    canonical_trustee(value)
                } else {
                    sorted_strings(value)
                };
                entry.insert(key.clone(), canonical);
            }
            Value::Object(entry)
        }
        Value::Object(obj) => match obj.get("id") {
            Some(Value::String(id)) => persona(id),
            _ => raw.clone(),
        },
        other => other.clone(),
    }
}

fn persona(id: &str) -> Value {
    let mut obj = Map::new();
    obj.insert("id".into(), Value::from(id));
    Value::Object(obj)
}

fn sorted_strings(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.iter().all(Value::is_string) => {
            let mut strings: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            strings.sort_unstable();
            strings.dedup();
            Value::Array(strings.into_iter().map(Value::from).collect())
        }
        other => other.clone(),
    }
}

// =============================================================================
// Shared Enum Tables
// =============================================================================

pub static CREATE_PERMISSIONS: EnumTable = EnumTable {
    field: "create_permissions",
    entries: &[
        ("default acl", "default acl"),
        ("default_acl", "default acl"),
        ("inherit mode bits", "inherit mode bits"),
        ("inherit_mode_bits", "inherit mode bits"),
        ("use create mask and mode", "use create mask and mode"),
        ("use_create_mask_and_mode", "use create mask and mode"),
    ],
};

pub static SMB_PERMISSION: EnumTable = EnumTable {
    field: "permission",
    entries: &[("full", "full"), ("read", "read"), ("write", "change"), ("change", "change")],
};

pub static PERMISSION_TYPE: EnumTable = EnumTable {
    field: "permission_type",
    entries: &[("allow", "allow"), ("deny", "deny")],
};

pub static SECURITY_FLAVOR: EnumTable = EnumTable {
    field: "security_flavors",
    entries: &[
        ("unix", "unix"),
        ("kerberos", "krb5"),
        ("krb5", "krb5"),
        ("kerberos_integrity", "krb5i"),
        ("krb5i", "krb5i"),
        ("kerberos_privacy", "krb5p"),
        ("krb5p", "krb5p"),
    ],
};

pub static REQUESTED_PROTECTION: EnumTable = EnumTable {
    field: "set_requested_protection",
    entries: &[
        ("default", "default"),
        ("n_plus_1", "+1n"),
        ("+1n", "+1n"),
        ("n_plus_2d_1n", "+2d:1n"),
        ("+2d:1n", "+2d:1n"),
        ("n_plus_2", "+2n"),
        ("+2n", "+2n"),
        ("n_plus_3d_1n", "+3d:1n"),
        ("+3d:1n", "+3d:1n"),
        ("n_plus_3d_1n1d", "+3d:1n1d"),
        ("+3d:1n1d", "+3d:1n1d"),
        ("n_plus_3", "+3n"),
        ("+3n", "+3n"),
        ("n_plus_4d_1n", "+4d:1n"),
        ("+4d:1n", "+4d:1n"),
        ("n_plus_4d_2n", "+4d:2n"),
        ("+4d:2n", "+4d:2n"),
        ("n_plus_4", "+4n"),
        ("+4n", "+4n"),
        ("mirrored_2x", "2x"),
        ("2x", "2x"),
        ("mirrored_3x", "3x"),
        ("3x", "3x"),
        ("mirrored_4x", "4x"),
        ("4x", "4x"),
        ("mirrored_5x", "5x"),
        ("5x", "5x"),
        ("mirrored_6x", "6x"),
        ("6x", "6x"),
        ("mirrored_7x", "7x"),
        ("7x", "7x"),
        ("mirrored_8x", "8x"),
        ("8x", "8x"),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_octal_round_trip() {
        let mode = normalize("directory_create_mask", ValueKind::OctalMode, &json!("777")).unwrap();
        assert_eq!(mode, json!(511));
        assert_eq!(format_octal(511), "777");

        assert_eq!(parse_octal("mode", "0755").unwrap(), 0o755);
        assert_eq!(
            normalize("mode", ValueKind::OctalMode, &json!(493)).unwrap(),
            normalize("mode", ValueKind::OctalMode, &json!("0755")).unwrap()
        );
    }

    #[test]
    fn test_octal_rejects_bad_digits() {
        assert_matches!(
            parse_octal("file_create_mask", "0789"),
            Err(Error::InvalidValue { field, .. }) if field == "file_create_mask"
        );
        assert_matches!(parse_octal("mode", ""), Err(Error::InvalidValue { .. }));
        assert_matches!(parse_octal("mode", "17777"), Err(Error::InvalidValue { .. }));
    }

    #[test]
    fn test_size_units_round_trip_exactly() {
        for unit in SizeUnit::ALL {
            for n in [0u64, 1, 7, 10, 1023] {
                let bytes = size_to_bytes("size", n, unit).unwrap();
                assert_eq!(from_base(bytes, unit.multiplier()), Some(n));
            }
        }
        assert_eq!(size_to_bytes("hard", 10, SizeUnit::GB).unwrap(), 10_737_418_240);
    }

    #[test]
    fn test_duration_units_round_trip_exactly() {
        for unit in DurationUnit::ALL {
            let seconds = duration_to_seconds("grace", 3, unit).unwrap();
            assert_eq!(from_base(seconds, unit.multiplier()), Some(3));
        }
        assert_eq!("Weeks".parse::<DurationUnit>().unwrap(), DurationUnit::Weeks);
        assert_eq!("day".parse::<DurationUnit>().unwrap(), DurationUnit::Days);
    }

    #[test]
    fn test_quantity_overflow() {
        assert_matches!(
            size_to_bytes("hard", u64::MAX, SizeUnit::KB),
            Err(Error::InvalidValue { .. })
        );
    }

    #[test]
    fn test_quantity_normalization() {
        let raw = json!({"value": 2, "unit": "hours"});
        assert_eq!(normalize("ca_timeout", ValueKind::Duration, &raw).unwrap(), json!(7200));
        assert_eq!(normalize("ca_timeout", ValueKind::Duration, &json!(120)).unwrap(), json!(120));
        assert_matches!(
            normalize("ca_timeout", ValueKind::Duration, &json!({"value": 2, "unit": "fortnights"})),
            Err(Error::UnknownEnumValue { .. })
        );
    }

    #[test]
    fn test_enum_aliases() {
        assert_eq!(SMB_PERMISSION.resolve("write").unwrap(), "change");
        assert_eq!(SMB_PERMISSION.resolve("change").unwrap(), "change");
        assert_eq!(SECURITY_FLAVOR.resolve("kerberos").unwrap(), "krb5");
        assert_eq!(REQUESTED_PROTECTION.resolve("n_plus_2d_1n").unwrap(), "+2d:1n");
        assert_matches!(
            SMB_PERMISSION.resolve("admin"),
            Err(Error::UnknownEnumValue { value, .. }) if value == "admin"
        );
    }

    #[test]
    fn test_case_insensitive_only_when_requested() {
        let raw = json!("EXAMPLE.com");
        assert_eq!(
            normalize("domain_name", ValueKind::CaseInsensitive, &raw).unwrap(),
            json!("example.com")
        );
        assert_eq!(normalize("description", ValueKind::Plain, &raw).unwrap(), raw);
    }

    #[test]
    fn test_trustee_canonical_forms() {
        let persona = json!({"id": "SID:S-1-1-0", "name": "Everyone", "type": "wellknown"});
        assert_eq!(
            normalize("run_as_root", ValueKind::Trustee, &persona).unwrap(),
            json!({"id": "SID:S-1-1-0"})
        );
        assert_eq!(
            normalize("owner", ValueKind::Trustee, &json!("UID:0")).unwrap(),
            json!({"id": "UID:0"})
        );

        let ace = json!({
            "trustee": {"id": "UID:2000", "name": "alice"},
            "accesstype": "allow",
            "accessrights": ["file_write", "file_read", "file_read"]
        });
        assert_eq!(
            normalize("acl", ValueKind::Trustee, &ace).unwrap(),
            json!({
                "trustee": {"id": "UID:2000"},
                "accesstype": "allow",
                "accessrights": ["file_read", "file_write"]
            })
        );
    }

    #[test]
    fn test_null_survives_normalization() {
        assert_eq!(normalize("mode", ValueKind::OctalMode, &Value::Null).unwrap(), Value::Null);
    }
}
