//! Identifier and record types shared by the allocator and its stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::AllocatorError;

/// Largest sequential id that survives a round trip through an IEEE-754 double
pub const MAX_SAFE_SEQUENTIAL_ID: u64 = (1 << 53) - 1;

/// ObjectId-shaped tenant references are 24 hex characters
const TENANT_ID_LEN: usize = 24;
const MAX_RESOURCE_CLASS_LEN: usize = 64;
const MAX_DISPLAY_NAME_LEN: usize = 128;

/// Reference to the tenant (school/admin account) owning a sequence.
///
/// Only the shape is checked; whether the tenant exists is the caller's concern.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, AllocatorError> {
        if raw.len() != TENANT_ID_LEN || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AllocatorError::InvalidTenant(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = AllocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Name of an independent sequence namespace within a tenant ("house", "invoice", ...)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ResourceClass(String);

impl ResourceClass {
    pub fn parse(raw: &str) -> Result<Self, AllocatorError> {
        let normalized = raw.trim().to_ascii_lowercase();
        let mut chars = normalized.chars();
        let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
        let valid = starts_with_letter
            && normalized.len() <= MAX_RESOURCE_CLASS_LEN
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

        if !valid {
            return Err(AllocatorError::InvalidResourceClass(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceClass {
    type Err = AllocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Human-facing, tenant-local identifier. Always in `1..=MAX_SAFE_SEQUENTIAL_ID`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SequentialId(u64);

impl SequentialId {
    pub const FIRST: SequentialId = SequentialId(1);

    pub fn new(value: u64) -> Option<Self> {
        (1..=MAX_SAFE_SEQUENTIAL_ID)
            .contains(&value)
            .then_some(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Candidate following the highest id issued so far (0 when none)
    pub fn next_after(max: u64) -> Option<Self> {
        max.checked_add(1).and_then(Self::new)
    }

    /// Interpret a stored value from a document-style store.
    ///
    /// Legacy rows may hold strings, nulls, floats or negative numbers; anything that is
    /// not a whole number in the valid range is rejected instead of being coerced.
    pub fn from_raw(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(v) = n.as_u64() {
                    Self::new(v)
                } else if n.is_i64() {
                    None
                } else {
                    let f = n.as_f64()?;
                    if f.fract() == 0.0 && f >= 1.0 && f <= MAX_SAFE_SEQUENTIAL_ID as f64 {
                        Self::new(f as u64)
                    } else {
                        None
                    }
                }
            }
            Value::String(s) => s.trim().parse::<u64>().ok().and_then(Self::new),
            _ => None,
        }
    }
}

impl fmt::Display for SequentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Highest valid sequential id among raw stored values, 0 if there is none
pub fn max_valid_sequential_id<'a>(values: impl IntoIterator<Item = &'a Value>) -> u64 {
    values
        .into_iter()
        .filter_map(SequentialId::from_raw)
        .map(SequentialId::get)
        .max()
        .unwrap_or(0)
}

/// Trimmed display label plus its case-insensitive uniqueness key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayName {
    name: String,
    key: String,
}

impl DisplayName {
    pub fn parse(raw: &str) -> Result<Self, AllocatorError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(AllocatorError::InvalidDisplayName(
                "display name must not be empty".to_string(),
            ));
        }
        if name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(AllocatorError::InvalidDisplayName(format!(
                "display name exceeds {} characters",
                MAX_DISPLAY_NAME_LEN
            )));
        }
        Ok(Self {
            name: name.to_string(),
            key: name.to_lowercase(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Caller-supplied fields for a record about to be created
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
    pub display_name: String,
    #[serde(default)]
    pub payload: Value,
}

impl NewRecord {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A persisted business entity carrying its assigned sequential id
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedRecord {
    /// Storage primary key, unrelated to `sequential_id`
    pub record_key: i64,
    pub tenant_id: TenantId,
    pub resource_class: ResourceClass,
    pub sequential_id: SequentialId,
    pub display_name: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tenant_id_shape() {
        let tenant = TenantId::parse("64F1C2A9E4B0A1B2C3D4E5F6").unwrap();
        assert_eq!(tenant.as_str(), "64f1c2a9e4b0a1b2c3d4e5f6");

        for bad in ["", "64f1c2a9", "64f1c2a9e4b0a1b2c3d4e5fz", " 64f1c2a9e4b0a1b2c3d4e5f6", "64f1c2a9e4b0a1b2c3d4e5f6a"] {
            assert!(
                matches!(TenantId::parse(bad), Err(AllocatorError::InvalidTenant(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_resource_class_normalization() {
        assert_eq!(ResourceClass::parse(" House ").unwrap().as_str(), "house");
        assert_eq!(ResourceClass::parse("fee_invoice-2").unwrap().as_str(), "fee_invoice-2");
        assert!(ResourceClass::parse("").is_err());
        assert!(ResourceClass::parse("2house").is_err());
        assert!(ResourceClass::parse("house room").is_err());
        assert!(ResourceClass::parse(&"h".repeat(65)).is_err());
    }

    #[test]
    fn test_display_name_key_is_case_insensitive() {
        let a = DisplayName::parse("  North House ").unwrap();
        let b = DisplayName::parse("north HOUSE").unwrap();
        assert_eq!(a.as_str(), "North House");
        assert_eq!(a.key(), b.key());
        assert!(DisplayName::parse("   ").is_err());
        assert!(DisplayName::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_sequential_id_bounds() {
        assert_eq!(SequentialId::new(0), None);
        assert_eq!(SequentialId::next_after(0), Some(SequentialId::FIRST));
        assert_eq!(SequentialId::next_after(MAX_SAFE_SEQUENTIAL_ID), None);
        assert_eq!(SequentialId::next_after(u64::MAX), None);
    }

    #[test]
    fn test_from_raw_rejects_corrupt_values() {
        assert_eq!(SequentialId::from_raw(&json!(4)).map(SequentialId::get), Some(4));
        assert_eq!(SequentialId::from_raw(&json!(4.0)).map(SequentialId::get), Some(4));
        assert_eq!(SequentialId::from_raw(&json!(" 12 ")).map(SequentialId::get), Some(12));

        for corrupt in [
            json!(null),
            json!("abc"),
            json!(""),
            json!(-3),
            json!(0),
            json!(2.5),
            json!(1e300),
            json!(true),
            json!([1]),
            json!({ "id": 1 }),
            json!(MAX_SAFE_SEQUENTIAL_ID + 1),
        ] {
            assert_eq!(SequentialId::from_raw(&corrupt), None, "{corrupt} accepted");
        }
    }

    #[test]
    fn test_max_valid_ignores_corrupt_entries() {
        let values = [json!(3), json!("abc"), json!(null), json!(-9), json!(2.5), json!(1)];
        assert_eq!(max_valid_sequential_id(values.iter()), 3);
        assert_eq!(max_valid_sequential_id(std::iter::empty()), 0);
    }
}
