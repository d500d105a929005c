//! Operator parameter descriptors and values.
//!
//! Operators describe the parameters they accept as [`ParamDesc`] lists;
//! callers provide flat string maps ([`ParamValues`]) that are routed to
//! operators by key prefix (`<operator-name>.<key>`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Type hint for a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TypeHint {
    #[default]
    String,
    Bool,
    Int,
    Uint,
}

/// Describes a single parameter an operator accepts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParamDesc {
    /// Key the value is looked up under (without operator prefix).
    pub key: String,
    /// Human-readable title.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Description shown in help output.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Default used when no value is provided.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_value: String,
    #[serde(default)]
    pub type_hint: TypeHint,
    /// Closed set of accepted values, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_values: Vec<String>,
}

impl ParamDesc {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = value.into();
        self
    }

    pub fn with_type_hint(mut self, hint: TypeHint) -> Self {
        self.type_hint = hint;
        self
    }

    pub fn with_possible_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.possible_values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Returns a copy of this descriptor with the key prefixed `<prefix>.<key>`.
    pub fn prefixed(&self, prefix: &str) -> Self {
        let mut desc = self.clone();
        desc.key = format!("{}.{}", prefix, self.key);
        desc
    }
}

/// Flat string map of parameter values.
///
/// Values for a specific operator are addressed as `<operator>.<key>` and
/// extracted with [`ParamValues::extract_prefixed`].
#[derive(Debug, Clone, Default)]
pub struct ParamValues(HashMap<String, String>);

impl ParamValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the values whose keys start with `<prefix>.`, with the prefix
    /// stripped. Used to route `wasm.allow-host-fs` to the `wasm` operator.
    pub fn extract_prefixed(&self, prefix: &str) -> ParamValues {
        let full = format!("{}.", prefix);
        let inner = self
            .0
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&full)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect();
        ParamValues(inner)
    }

    /// Resolves `key` against the provided descriptors: explicit value first,
    /// descriptor default second, empty string last.
    pub fn resolve<'a>(&'a self, key: &str, descs: &'a [ParamDesc]) -> &'a str {
        if let Some(v) = self.get(key) {
            return v;
        }
        descs
            .iter()
            .find(|d| d.key == key)
            .map(|d| d.default_value.as_str())
            .unwrap_or("")
    }

    /// Resolves a boolean parameter. Only `"true"` and `"false"` are accepted.
    pub fn resolve_bool(&self, key: &str, descs: &[ParamDesc]) -> Result<bool> {
        match self.resolve(key, descs) {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            other => Err(Error::InvalidParam {
                key: key.to_string(),
                reason: format!("expected 'true' or 'false', got '{}'", other),
            }),
        }
    }

    /// Validates a value against a descriptor's closed value set.
    pub fn resolve_enum<'a>(&'a self, key: &str, descs: &'a [ParamDesc]) -> Result<&'a str> {
        let value = self.resolve(key, descs);
        let Some(desc) = descs.iter().find(|d| d.key == key) else {
            return Ok(value);
        };
        if desc.possible_values.is_empty() || desc.possible_values.iter().any(|p| p == value) {
            Ok(value)
        } else {
            Err(Error::UnsupportedValue {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
    }
}

impl FromIterator<(String, String)> for ParamValues {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
