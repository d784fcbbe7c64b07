//! Chart option trees whose leaves may be live callbacks.
//!
//! Option documents arrive as JSON. Revival swaps selected string leaves for
//! [`RevivedCallback`]s, so the tree needs one variant JSON does not have.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_json::{Number, Value};

use crate::revive::RevivedCallback;

/// A JSON-shaped option document that can also hold revived callbacks.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ConfigTree {
    /// JSON `null`.
    #[default]
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(Number),
    /// JSON string. Callback sources stay in this form until revived.
    String(String),
    /// JSON array.
    Array(Vec<ConfigTree>),
    /// JSON object.
    Object(BTreeMap<String, ConfigTree>),
    /// A string leaf that was revived into a sandboxed callable.
    Callback(RevivedCallback),
}

impl ConfigTree {
    /// Returns the string if this node is a string leaf.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the callback if this node was revived.
    pub fn as_callback(&self) -> Option<&RevivedCallback> {
        match self {
            Self::Callback(cb) => Some(cb),
            _ => None,
        }
    }

    /// Whether this node is a revived callback.
    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }

    /// Returns the number as `f64` if this node is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Returns the elements if this node is an array.
    pub fn as_array(&self) -> Option<&Vec<ConfigTree>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries if this node is an object.
    pub fn as_object(&self) -> Option<&BTreeMap<String, ConfigTree>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Render back to JSON. Callbacks have no JSON form and become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null | Self::Callback(_) => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Count the revived callbacks anywhere in the tree.
    pub fn callback_count(&self) -> usize {
        match self {
            Self::Callback(_) => 1,
            Self::Array(items) => items.iter().map(Self::callback_count).sum(),
            Self::Object(map) => map.values().map(Self::callback_count).sum(),
            _ => 0,
        }
    }
}

impl From<Value> for ConfigTree {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl<'de> Deserialize<'de> for ConfigTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from)
    }
}
