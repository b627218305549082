//! Navigation rules: the declarative tree that maps file paths to the
//! entities they edit.
//!
//! Each item carries a path template over `{field}` placeholders; at most one
//! of `query` (list/document files) or `includes` (a single embedded entity)
//! may be set, otherwise the item governs one document by path alone.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

/// Character class a path placeholder may capture. Excludes `/`, so captured
/// values round-trip through `resolve_path`.
const FIELD_PATTERN: &str = r"[\w.\-]+";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NavigationConfig {
    #[serde(default)]
    pub navigation: Vec<NavigationItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NavigationItem {
    pub path: String,
    #[serde(default)]
    pub query: Option<QuerySpec>,
    #[serde(default)]
    pub includes: Option<BTreeMap<String, String>>,
    /// Markdown template id for document-kind files.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub children: Vec<NavigationItem>,
}

/// A query is either a raw filter string or a structured filter map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QuerySpec {
    Text(String),
    Filters(BTreeMap<String, String>),
}

impl QuerySpec {
    /// Normalize to the string grammar (`key=value` joined by `AND`).
    pub fn as_text(&self) -> String {
        match self {
            QuerySpec::Text(text) => text.clone(),
            QuerySpec::Filters(map) => map
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }
}

// ============================================================================
// Path templates
// ============================================================================

/// A compiled path template: the anchored pattern plus the placeholder names
/// in capture order.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    pattern: regex::Regex,
    field_names: Vec<String>,
}

impl PathTemplate {
    pub fn compile(template: &str) -> CoreResult<PathTemplate> {
        let mut pattern = String::from("^");
        let mut field_names = Vec::new();
        let mut chars = template.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            match c {
                '\\' => match chars.peek() {
                    Some((_, '{')) | Some((_, '}')) => {
                        let (_, escaped) = chars.next().unwrap();
                        pattern.push_str(&regex::escape(&escaped.to_string()));
                    }
                    _ => pattern.push_str(&regex::escape("\\")),
                },
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, inner) in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        name.push(inner);
                    }
                    if !closed {
                        return Err(CoreError::UnclosedBracket(template.to_string()));
                    }
                    if name.is_empty()
                        || !name
                            .chars()
                            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
                    {
                        return Err(CoreError::InvalidPlaceholder(name));
                    }
                    pattern.push('(');
                    pattern.push_str(FIELD_PATTERN);
                    pattern.push(')');
                    field_names.push(name);
                }
                _ => pattern.push_str(&regex::escape(&c.to_string())),
            }
        }
        pattern.push('$');

        let pattern = regex::Regex::new(&pattern)
            .map_err(|e| CoreError::ParseFailed(format!("path template '{template}': {e}")))?;
        Ok(PathTemplate {
            raw: template.to_string(),
            pattern,
            field_names,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    /// Invert a match: recover the field values a path was resolved from.
    pub fn extract_fields(&self, path: &str) -> CoreResult<BTreeMap<String, String>> {
        let caps = self
            .pattern
            .captures(path)
            .ok_or_else(|| CoreError::PathTemplateMismatch {
                path: path.to_string(),
                template: self.raw.clone(),
            })?;

        let mut fields = BTreeMap::new();
        for (i, name) in self.field_names.iter().enumerate() {
            if let Some(value) = caps.get(i + 1) {
                fields.insert(name.clone(), value.as_str().to_string());
            }
        }
        Ok(fields)
    }

    /// Substitute field values into the template, producing a concrete path.
    pub fn resolve(&self, fields: &BTreeMap<String, String>) -> CoreResult<String> {
        let mut out = String::with_capacity(self.raw.len());
        let mut chars = self.raw.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            match c {
                '\\' => match chars.peek() {
                    Some((_, '{')) | Some((_, '}')) => {
                        let (_, escaped) = chars.next().unwrap();
                        out.push(escaped);
                    }
                    _ => out.push('\\'),
                },
                '{' => {
                    let mut name = String::new();
                    for (_, inner) in chars.by_ref() {
                        if inner == '}' {
                            break;
                        }
                        name.push(inner);
                    }
                    let value = fields
                        .get(&name)
                        .ok_or_else(|| CoreError::FieldNotFound(name.clone()))?;
                    out.push_str(value);
                }
                _ => out.push(c),
            }
        }
        Ok(out)
    }
}

/// Convenience wrappers matching the operation names used elsewhere.
pub fn extract_fields_from_path(
    path: &str,
    template: &str,
) -> CoreResult<BTreeMap<String, String>> {
    PathTemplate::compile(template)?.extract_fields(path)
}

pub fn resolve_path(template: &str, fields: &BTreeMap<String, String>) -> CoreResult<String> {
    PathTemplate::compile(template)?.resolve(fields)
}

// ============================================================================
// Navigation tree
// ============================================================================

/// One navigation item paired with its compiled path template.
#[derive(Debug, Clone)]
pub struct ResolvedItem {
    pub item: NavigationItem,
    pub template: PathTemplate,
}

#[derive(Debug, Clone, Default)]
pub struct NavigationTree {
    pub roots: Vec<NavigationItem>,
    flat: Vec<ResolvedItem>,
}

impl NavigationTree {
    /// Parse and validate a navigation configuration source.
    pub fn load(source: &str) -> CoreResult<NavigationTree> {
        let config: NavigationConfig = serde_yaml::from_str(source)
            .map_err(|e| CoreError::ParseFailed(format!("navigation: {e}")))?;
        NavigationTree::from_items(config.navigation)
    }

    pub fn from_items(roots: Vec<NavigationItem>) -> CoreResult<NavigationTree> {
        let mut flat = Vec::new();
        for item in &roots {
            flatten(item, &mut flat)?;
        }
        Ok(NavigationTree { roots, flat })
    }

    /// Depth-first flattening search; the first item whose template matches
    /// wins. No match is an explicit "not found", not an error.
    pub fn find_item_by_path(&self, relative_path: &str) -> Option<&ResolvedItem> {
        self.flat
            .iter()
            .find(|resolved| resolved.template.matches(relative_path))
    }

    /// Find the file a single-entity item would place the given fields at.
    /// Used by go-to-definition to locate a relation target's document.
    pub fn resolve_path_for_fields(
        &self,
        entity_type: Option<&str>,
        fields: &BTreeMap<String, String>,
    ) -> Option<String> {
        for resolved in &self.flat {
            if resolved.item.query.is_some() {
                continue;
            }
            if let Some(entity_type) = entity_type {
                let declared = resolved
                    .item
                    .includes
                    .as_ref()
                    .and_then(|inc| inc.get("type"));
                if let Some(declared) = declared {
                    if declared != entity_type {
                        continue;
                    }
                }
            }
            if let Ok(path) = resolved.template.resolve(fields) {
                return Some(path);
            }
        }
        None
    }

    pub fn items(&self) -> &[ResolvedItem] {
        &self.flat
    }
}

fn flatten(item: &NavigationItem, out: &mut Vec<ResolvedItem>) -> CoreResult<()> {
    if item.query.is_some() && item.includes.is_some() {
        return Err(CoreError::ParseFailed(format!(
            "navigation item '{}' sets both query and includes",
            item.path
        )));
    }
    let template = PathTemplate::compile(&item.path)?;
    out.push(ResolvedItem {
        item: item.clone(),
        template,
    });
    for child in &item.children {
        flatten(child, out)?;
    }
    Ok(())
}
