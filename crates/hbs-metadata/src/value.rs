//! Tagged metadata values.
//!
//! Metadata documents are YAML with mixed shapes: scalars, lists, and
//! mappings whose keys are either names or years. [`MetaValue`] keeps them
//! as a closed variant so the resolver can walk them with a single match.

use std::fmt;

use hbs_model::{HbsError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered mapping of metadata entries.
pub type MetaMap = IndexMap<MetaKey, MetaValue>;

/// Key of a metadata mapping: a year/code or a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetaKey {
    Int(i64),
    Str(String),
}

impl MetaKey {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Int(_) => None,
        }
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetaKey {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetaKey {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for MetaKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// A metadata node.
///
/// Mapping equality ignores entry order; lookups and iteration keep it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MetaValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<MetaValue>),
    Map(MetaMap),
}

impl MetaValue {
    /// Parses a YAML document. `document` names the source in errors.
    pub fn from_yaml_str(text: &str, document: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| HbsError::metadata(document, e.to_string()))?;
        Ok(Self::from(value))
    }

    /// Serializes to YAML text.
    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| HbsError::metadata("<yaml>", e.to_string()))
    }

    /// An empty mapping.
    pub fn empty_map() -> Self {
        Self::Map(MetaMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Seq(_) => "list",
            Self::Map(_) => "mapping",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; integral floats are accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[MetaValue]> {
        match self {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MetaMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut MetaMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<MetaMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a named entry of a mapping.
    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.as_map()
            .and_then(|map| map.get(&MetaKey::Str(key.to_string())))
    }

    /// Looks up an entry by key of either kind.
    pub fn get_key(&self, key: &MetaKey) -> Option<&MetaValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Whether the mapping has a named entry.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Scalar rendered as text: strings as-is, numbers and booleans formatted.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// A string or a list of strings as an owned list.
    pub fn to_str_list(&self) -> Option<Vec<String>> {
        match self {
            Self::Str(s) => Some(vec![s.clone()]),
            Self::Seq(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }
}

impl From<serde_yaml::Value> for MetaValue {
    fn from(value: serde_yaml::Value) -> Self {
        use serde_yaml::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Self::Str(s),
            Value::Sequence(items) => Self::Seq(items.into_iter().map(Self::from).collect()),
            Value::Mapping(mapping) => Self::Map(
                mapping
                    .into_iter()
                    .map(|(k, v)| (yaml_key(k), Self::from(v)))
                    .collect(),
            ),
            Value::Tagged(tagged) => Self::from(tagged.value),
        }
    }
}

fn yaml_key(key: serde_yaml::Value) -> MetaKey {
    use serde_yaml::Value;
    match key {
        Value::Number(n) => match n.as_i64() {
            Some(i) => MetaKey::Int(i),
            None => MetaKey::Str(n.to_string()),
        },
        Value::String(s) => MetaKey::Str(s),
        Value::Bool(b) => MetaKey::Str(b.to_string()),
        Value::Null => MetaKey::Str("null".to_string()),
        Value::Tagged(tagged) => yaml_key(tagged.value),
        other => MetaKey::Str(format!("{other:?}")),
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<MetaValue>> for MetaValue {
    fn from(value: Vec<MetaValue>) -> Self {
        Self::Seq(value)
    }
}

impl From<MetaMap> for MetaValue {
    fn from(value: MetaMap) -> Self {
        Self::Map(value)
    }
}

impl Serialize for MetaKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Str(s) => serializer.serialize_str(s),
        }
    }
}

impl Serialize for MetaValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::Str(s) => serializer.serialize_str(s),
            Self::Seq(items) => serializer.collect_seq(items),
            Self::Map(map) => serializer.collect_map(map),
        }
    }
}

impl<'de> Deserialize<'de> for MetaValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_yaml::Value::deserialize(deserializer).map(Self::from)
    }
}
