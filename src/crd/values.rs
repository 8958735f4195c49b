//! # Chart Values
//!
//! Schema-less override tree passed to the chart. Its shape is defined by the
//! chart and supplied by the user, so it is modelled as a tagged union of
//! scalar, sequence and mapping nodes rather than a fixed struct.

use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// A node of the values tree
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Values {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Seq(Vec<Values>),
    Map(BTreeMap<String, Values>),
}

impl Default for Values {
    fn default() -> Self {
        Values::Map(BTreeMap::new())
    }
}

impl Values {
    /// Look up a dotted path such as `service.port`
    pub fn get_path(&self, path: &str) -> Option<&Values> {
        path.split('.').try_fold(self, |node, key| match node {
            Values::Map(map) => map.get(key),
            Values::Seq(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Values::Null => true,
            Values::Map(map) => map.is_empty(),
            Values::Seq(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Render as a YAML document suitable for `helm --values`
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

impl JsonSchema for Values {
    fn schema_name() -> Cow<'static, str> {
        Cow::Borrowed("Values")
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        // Structural schema for Kubernetes: accept any object and keep unknown fields
        let schema_value = serde_json::json!({
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
            "description": "Values passed to the chart. Arbitrary nested mapping."
        });
        Schema::try_from(schema_value).expect("Failed to create Schema for Values")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_from_nested_json() {
        let values: Values = serde_json::from_value(serde_json::json!({
            "replicaCount": 2,
            "ratio": 0.5,
            "enabled": true,
            "image": { "tag": "1.25", "pullSecrets": ["a", "b"] },
            "empty": null
        }))
        .unwrap();

        assert_eq!(values.get_path("replicaCount"), Some(&Values::Int(2)));
        assert_eq!(values.get_path("ratio"), Some(&Values::Float(0.5)));
        assert_eq!(values.get_path("enabled"), Some(&Values::Bool(true)));
        assert_eq!(
            values.get_path("image.tag"),
            Some(&Values::String("1.25".to_string()))
        );
        assert_eq!(
            values.get_path("image.pullSecrets.1"),
            Some(&Values::String("b".to_string()))
        );
        assert_eq!(values.get_path("empty"), Some(&Values::Null));
        assert_eq!(values.get_path("image.missing"), None);
    }

    #[test]
    fn test_values_render_yaml() {
        let values: Values = serde_json::from_value(serde_json::json!({
            "service": { "port": 8080 }
        }))
        .unwrap();
        let yaml = values.to_yaml().unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["service"]["port"], serde_yaml::Value::from(8080));
    }

    #[test]
    fn test_empty_values() {
        assert!(Values::default().is_empty());
        assert!(Values::Null.is_empty());
        assert!(!Values::Int(0).is_empty());
    }
}
