//! Query interpolation: `{name}` placeholders inside query and path
//! templates, resolved against the local field set and the ancestor chain.
//!
//! Grammar per placeholder: a plain local field name, or `parent<N>.<field>`
//! where `N` is a 1-indexed ancestor depth and bare `parent` means depth 1.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CoreError, CoreResult};
use crate::fields::{FieldSet, FieldValue};

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:parent(?<depth>[0-9]*)\.(?<pfield>[A-Za-z_][A-Za-z0-9_-]*)|(?<field>[A-Za-z_][A-Za-z0-9_-]*))$")
        .expect("placeholder grammar regex")
});

/// One parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PlaceholderRef {
    Local(String),
    Ancestor { depth: usize, field: String },
}

fn parse_placeholder(name: &str) -> CoreResult<PlaceholderRef> {
    let caps = PLACEHOLDER_RE
        .captures(name)
        .ok_or_else(|| CoreError::InvalidPlaceholder(name.to_string()))?;

    if let Some(field) = caps.name("field") {
        return Ok(PlaceholderRef::Local(field.as_str().to_string()));
    }

    let depth_text = caps.name("depth").map(|m| m.as_str()).unwrap_or("");
    let depth = if depth_text.is_empty() {
        1
    } else {
        depth_text
            .parse::<usize>()
            .map_err(|_| CoreError::InvalidPlaceholder(name.to_string()))?
    };
    if depth == 0 {
        return Err(CoreError::InvalidPlaceholder(name.to_string()));
    }
    let field = caps
        .name("pfield")
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Ok(PlaceholderRef::Ancestor { depth, field })
}

fn lookup(fields: &FieldSet, field: &str) -> Option<String> {
    match fields.get(field) {
        None | Some(FieldValue::Null) => None,
        Some(value) => Some(value.to_display_string()),
    }
}

/// Resolve every placeholder in `template`. `ancestors[0]` is the nearest
/// enclosing context (depth 1). A template with no placeholders passes
/// through untouched without consulting context.
pub fn interpolate(
    template: &str,
    local: &FieldSet,
    ancestors: &[&FieldSet],
) -> CoreResult<String> {
    if !template.contains('{') {
        return Ok(template.to_string());
    }

    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

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

                let value = match parse_placeholder(&name)? {
                    PlaceholderRef::Local(field) => lookup(local, &field)
                        .ok_or(CoreError::FieldNotFound(field))?,
                    PlaceholderRef::Ancestor { depth, field } => {
                        let ancestor = ancestors
                            .get(depth - 1)
                            .ok_or(CoreError::ContextNotFound { depth })?;
                        lookup(ancestor, &field).ok_or(CoreError::FieldNotFound(field))?
                    }
                };
                out.push_str(&value);
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// Split a composite filter string of `key=value` pairs joined by `AND` or
/// commas into a filter map. Malformed pairs (missing key or value) are
/// silently dropped.
pub fn split_filters(filters: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for group in filters.split(',') {
        for pair in group.split(" AND ") {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                continue;
            }
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Interpolate a query template, then split it into a filter map.
pub fn interpolate_filters(
    template: &str,
    local: &FieldSet,
    ancestors: &[&FieldSet],
) -> CoreResult<BTreeMap<String, String>> {
    Ok(split_filters(&interpolate(template, local, ancestors)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FieldSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_no_placeholders_pass_through() {
        let local = FieldSet::new();
        assert_eq!(
            interpolate("type=Task", &local, &[]).unwrap(),
            "type=Task"
        );
    }

    #[test]
    fn test_local_field() {
        let local = fields(&[("key", "proj-1")]);
        assert_eq!(
            interpolate("project={key}", &local, &[]).unwrap(),
            "project=proj-1"
        );
    }

    #[test]
    fn test_parent_depth_one() {
        let local = FieldSet::new();
        let project = fields(&[("key", "proj-1"), ("name", "Acme")]);
        let chain: Vec<&FieldSet> = vec![&project];
        assert_eq!(
            interpolate("{parent.key}", &local, &chain).unwrap(),
            "proj-1"
        );
    }

    #[test]
    fn test_parent_depth_two() {
        let local = FieldSet::new();
        let project = fields(&[("key", "proj-1")]);
        let user = fields(&[("name", "ada")]);
        let chain: Vec<&FieldSet> = vec![&project, &user];
        assert_eq!(
            interpolate("{parent2.name}", &local, &chain).unwrap(),
            "ada"
        );
    }

    #[test]
    fn test_chain_shorter_than_depth() {
        let local = FieldSet::new();
        let project = fields(&[("key", "proj-1")]);
        let chain: Vec<&FieldSet> = vec![&project];
        let err = interpolate("{parent2.name}", &local, &chain).unwrap_err();
        assert_eq!(err, CoreError::ContextNotFound { depth: 2 });
    }

    #[test]
    fn test_absent_and_null_fields_fail_alike() {
        let local = FieldSet::new();
        let mut project = fields(&[("key", "proj-1")]);
        project.insert("name".into(), FieldValue::Null);
        let chain: Vec<&FieldSet> = vec![&project];
        assert_eq!(
            interpolate("{parent.name}", &local, &chain).unwrap_err(),
            CoreError::FieldNotFound("name".into())
        );
        assert_eq!(
            interpolate("{parent.missing}", &local, &chain).unwrap_err(),
            CoreError::FieldNotFound("missing".into())
        );
    }

    #[test]
    fn test_invalid_placeholder_grammar() {
        let local = FieldSet::new();
        assert!(matches!(
            interpolate("{parent..x}", &local, &[]).unwrap_err(),
            CoreError::InvalidPlaceholder(_)
        ));
        assert!(matches!(
            interpolate("{9bad}", &local, &[]).unwrap_err(),
            CoreError::InvalidPlaceholder(_)
        ));
        assert!(matches!(
            interpolate("{parent0.key}", &local, &[]).unwrap_err(),
            CoreError::InvalidPlaceholder(_)
        ));
    }

    #[test]
    fn test_unclosed_bracket() {
        let local = FieldSet::new();
        assert!(matches!(
            interpolate("type={key", &local, &[]).unwrap_err(),
            CoreError::UnclosedBracket(_)
        ));
    }

    #[test]
    fn test_escaped_braces_are_literal() {
        let local = FieldSet::new();
        assert_eq!(
            interpolate(r"literal \{not-a-field\}", &local, &[]).unwrap(),
            "literal {not-a-field}"
        );
    }

    #[test]
    fn test_split_filters_and_and_commas() {
        let map = split_filters("type=Task AND status=todo, project=proj-1");
        assert_eq!(map["type"], "Task");
        assert_eq!(map["status"], "todo");
        assert_eq!(map["project"], "proj-1");
    }

    #[test]
    fn test_split_filters_drops_malformed_pairs() {
        let map = split_filters("type=Task AND =oops AND broken= AND noequals");
        assert_eq!(map.len(), 1);
        assert_eq!(map["type"], "Task");
    }

    #[test]
    fn test_scenario_c() {
        // query `type=Task AND project={parent.key}` against ancestor
        // {key: proj-1} yields {type: Task, project: proj-1}
        let local = FieldSet::new();
        let project = fields(&[("key", "proj-1")]);
        let chain: Vec<&FieldSet> = vec![&project];
        let map =
            interpolate_filters("type=Task AND project={parent.key}", &local, &chain).unwrap();
        assert_eq!(map["type"], "Task");
        assert_eq!(map["project"], "proj-1");
    }
}
