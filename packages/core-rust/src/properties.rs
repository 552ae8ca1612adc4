use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Property key producers use to carry a correlation identifier.
pub const CORRELATION_ID_KEY: &str = "correlationId";

/// Diagnostic header set by tracing-aware producers. Used as a fallback
/// correlation identifier.
pub const DIAGNOSTIC_ID_KEY: &str = "Diagnostic-Id";

/// Scalar value attached to a message as an application property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// Returns the string content, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer value.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Producer-attached key/value metadata that travels alongside a message body.
///
/// Keys are unique; iteration order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationProperties(HashMap<String, PropertyValue>);

impl ApplicationProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a property, replacing any previous value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    /// Correlation id set by the producer, falling back to the diagnostic id.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID_KEY)
            .and_then(PropertyValue::as_str)
            .or_else(|| self.get(DIAGNOSTIC_ID_KEY).and_then(PropertyValue::as_str))
    }
}

impl From<HashMap<String, PropertyValue>> for ApplicationProperties {
    fn from(map: HashMap<String, PropertyValue>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for ApplicationProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_existing_key() {
        let mut props = ApplicationProperties::new();
        props.insert("retry", 1);
        props.insert("retry", 2);
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("retry").and_then(PropertyValue::as_i64), Some(2));
    }

    #[test]
    fn correlation_id_prefers_explicit_key() {
        let props = ApplicationProperties::new()
            .with(DIAGNOSTIC_ID_KEY, "00-abc-01")
            .with(CORRELATION_ID_KEY, "corr-7");
        assert_eq!(props.correlation_id(), Some("corr-7"));
    }

    #[test]
    fn correlation_id_falls_back_to_diagnostic_id() {
        let props: ApplicationProperties = [(DIAGNOSTIC_ID_KEY, "00-abc-01")].into_iter().collect();
        assert_eq!(props.correlation_id(), Some("00-abc-01"));
    }

    #[test]
    fn correlation_id_ignores_non_string_values() {
        let props = ApplicationProperties::new().with(CORRELATION_ID_KEY, 42);
        assert_eq!(props.correlation_id(), None);
    }

    #[test]
    fn deserializes_mixed_scalar_values() {
        let props: ApplicationProperties =
            serde_json::from_str(r#"{"a":"x","b":3,"c":true,"d":null,"e":1.5}"#).unwrap();
        assert_eq!(props.get("a"), Some(&PropertyValue::String("x".into())));
        assert_eq!(props.get("b"), Some(&PropertyValue::Int(3)));
        assert_eq!(props.get("c"), Some(&PropertyValue::Bool(true)));
        assert_eq!(props.get("d"), Some(&PropertyValue::Null));
        assert_eq!(props.get("e"), Some(&PropertyValue::Float(1.5)));
    }
}
