//! Entity type schema: which fields each entity type declares, and of what
//! kind. Loaded from `.notegraph/schema.yaml` for the content namespace; the
//! config namespace ships a built-in schema.
//!
//! Schema lookups are total: unknown types or fields return `None` and the
//! calling feature degrades, they never fail the request.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub types: BTreeMap<String, EntityType>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityType {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub kind: FieldKind,
    /// Choices for `option` fields.
    #[serde(default)]
    pub choices: Vec<String>,
    /// Target entity type for `relation` fields.
    #[serde(default)]
    pub target: Option<String>,
    /// Element kind for `list` fields.
    #[serde(default)]
    pub of: Option<FieldKind>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Number,
    Boolean,
    Date,
    Option,
    Relation,
    List,
}

impl FieldKind {
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Option => "option",
            FieldKind::Relation => "relation",
            FieldKind::List => "list",
        }
    }
}

impl Schema {
    pub fn parse(source: &str) -> CoreResult<Schema> {
        serde_yaml::from_str(source)
            .map_err(|e| CoreError::ParseFailed(format!("schema: {e}")))
    }

    pub fn entity_type(&self, name: &str) -> Option<&EntityType> {
        self.types.get(name)
    }

    /// Resolve a field path against a type, following relation targets for
    /// nested segments. Numeric segments (sequence indices) are skipped.
    pub fn resolve_field(&self, type_name: &str, path: &[String]) -> Option<&FieldDef> {
        let mut current_type = self.entity_type(type_name)?;
        let mut resolved: Option<&FieldDef> = None;

        for segment in path {
            if segment.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let def = current_type.fields.get(segment)?;
            resolved = Some(def);
            if let (FieldKind::Relation, Some(target)) = (def.kind, def.target.as_deref()) {
                if let Some(next) = self.entity_type(target) {
                    current_type = next;
                }
            }
        }

        resolved
    }

    /// Schema governing the workspace configuration namespace itself.
    pub fn builtin_config() -> Schema {
        let source = r#"
types:
  NavigationItem:
    fields:
      path:
        kind: text
        description: Path template with {field} placeholders
        required: true
      query:
        kind: text
        description: Entity selection query for list documents
      template:
        kind: text
        description: Markdown template id
  Template:
    fields:
      title:
        kind: text
"#;
        // The built-in source is a compile-time constant; a parse failure
        // here is a programming error caught by tests.
        Schema::parse(source).unwrap_or_default()
    }
}
