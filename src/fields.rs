//! Field sets: the flat key→value maps that carry one entity's editable data.
//!
//! A field set holds scalars, arrays, or (for expanded relations) nested
//! field sets. Keys are unique; `BTreeMap` keeps iteration deterministic,
//! which the mapper and differ rely on.

use std::collections::BTreeMap;

/// One entity's data, partially (from a document) or fully (from the graph).
pub type FieldSet = BTreeMap<String, FieldValue>;

/// Identity field, owned by the graph.
pub const FIELD_UID: &str = "uid";
/// Version field, owned by the graph.
pub const FIELD_VERSION: &str = "version";
/// Declared entity type. Carried on changesets explicitly, never diffed.
pub const FIELD_TYPE: &str = "type";
/// General child-block container.
pub const CHILD_CONTAINER: &str = "children";
/// Query-bound data container (also the list wrapper key in YAML files).
pub const DATA_CONTAINER: &str = "items";

/// Fields that never appear as plain changed values in a changeset.
pub fn is_system_field(key: &str) -> bool {
    key == FIELD_UID
        || key == FIELD_VERSION
        || key == FIELD_TYPE
        || key == CHILD_CONTAINER
        || key == DATA_CONTAINER
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<FieldValue>),
    /// An expanded relation: a nested field set instead of a bare reference.
    Entity(FieldSet),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value the way it would appear in a document.
    pub fn to_display_string(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            FieldValue::String(s) => s.clone(),
            FieldValue::List(values) => values
                .iter()
                .map(FieldValue::to_display_string)
                .collect::<Vec<_>>()
                .join(", "),
            FieldValue::Entity(fields) => fields
                .get("title")
                .or_else(|| fields.get(FIELD_UID))
                .map(FieldValue::to_display_string)
                .unwrap_or_default(),
        }
    }

    /// Parse a bare scalar the way YAML plain style reads it.
    pub fn from_scalar_text(text: &str) -> FieldValue {
        match text {
            "" | "~" | "null" | "Null" | "NULL" => FieldValue::Null,
            "true" | "True" | "TRUE" => FieldValue::Bool(true),
            "false" | "False" | "FALSE" => FieldValue::Bool(false),
            _ => {
                if let Ok(n) = text.parse::<f64>() {
                    FieldValue::Number(n)
                } else {
                    FieldValue::String(text.to_string())
                }
            }
        }
    }

    pub fn from_yaml(value: &serde_yaml::Value) -> FieldValue {
        match value {
            serde_yaml::Value::Null => FieldValue::Null,
            serde_yaml::Value::Bool(b) => FieldValue::Bool(*b),
            serde_yaml::Value::Number(n) => FieldValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_yaml::Value::String(s) => FieldValue::String(s.clone()),
            serde_yaml::Value::Sequence(seq) => {
                FieldValue::List(seq.iter().map(FieldValue::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => {
                let mut fields = FieldSet::new();
                for (k, v) in map {
                    if let serde_yaml::Value::String(key) = k {
                        fields.insert(key.clone(), FieldValue::from_yaml(v));
                    }
                }
                FieldValue::Entity(fields)
            }
            serde_yaml::Value::Tagged(tagged) => FieldValue::from_yaml(&tagged.value),
        }
    }
}

/// Treat absent and null identically when reading a field set.
pub fn field_or_null<'a>(fields: &'a FieldSet, key: &str) -> &'a FieldValue {
    fields.get(key).unwrap_or(&FieldValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_fields() {
        assert!(is_system_field("uid"));
        assert!(is_system_field("version"));
        assert!(is_system_field("children"));
        assert!(is_system_field("items"));
        assert!(is_system_field("type"));
        assert!(!is_system_field("title"));
        assert!(!is_system_field("status"));
    }

    #[test]
    fn test_scalar_parsing() {
        assert_eq!(FieldValue::from_scalar_text(""), FieldValue::Null);
        assert_eq!(FieldValue::from_scalar_text("null"), FieldValue::Null);
        assert_eq!(FieldValue::from_scalar_text("true"), FieldValue::Bool(true));
        assert_eq!(FieldValue::from_scalar_text("42"), FieldValue::Number(42.0));
        assert_eq!(
            FieldValue::from_scalar_text("done"),
            FieldValue::String("done".into())
        );
    }

    #[test]
    fn test_display_round_trip_for_scalars() {
        for text in ["done", "true", "42", "1.5"] {
            let value = FieldValue::from_scalar_text(text);
            assert_eq!(value.to_display_string(), text);
        }
    }

    #[test]
    fn test_from_yaml_mapping() {
        let value: serde_yaml::Value =
            serde_yaml::from_str("title: Hello\ncount: 3\ndone: false").unwrap();
        let FieldValue::Entity(fields) = FieldValue::from_yaml(&value) else {
            panic!("expected nested field set");
        };
        assert_eq!(fields.get("title"), Some(&FieldValue::String("Hello".into())));
        assert_eq!(fields.get("count"), Some(&FieldValue::Number(3.0)));
        assert_eq!(fields.get("done"), Some(&FieldValue::Bool(false)));
    }

    #[test]
    fn test_field_or_null_treats_absent_as_null() {
        let fields = FieldSet::new();
        assert!(field_or_null(&fields, "missing").is_null());
    }
}
