//! Per-document context: everything a feature request needs, assembled once.
//!
//! Building a context resolves the navigation rule, extracts the document,
//! fetches graph candidates and computes mappings. Cursor resolution then
//! turns a byte offset into the field key or value under the cursor, which
//! is the common entry point for hover, completion and go-to-definition.

use std::ops::Range;
use std::sync::Arc;

use tower_lsp::lsp_types::Url;
use tracing::debug;
use tree_sitter::{Node, Tree};

use crate::diff::compute_changesets;
use crate::error::{CoreError, CoreResult};
use crate::extract::{extract_document, ExtractedContent};
use crate::fields::{FieldSet, FieldValue, CHILD_CONTAINER, DATA_CONTAINER, FIELD_TYPE};
use crate::interpolate::split_filters;
use crate::mapping::{
    compute_mappings, fetch_entity_context, fetch_projection_context, DocumentMappings,
    EntityContext, ProjectionContext,
};
use crate::navigation::ResolvedItem;
use crate::parser::{
    is_scalar, node_at_offset, root_content, scalar_text, unwrap_node, DocFormat, ParsedDocument,
};
use crate::schema::Schema;
use crate::store::{Changeset, GraphStore};
use crate::template::{BoundSlot, Template};
use crate::workspace::Workspace;

/// What sits under the cursor. Ranges are byte offsets in the full document.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorContext {
    None,
    /// On a mapping key (or at a position where a new key would go; `key` is
    /// then the partial or empty text typed so far).
    FieldKey {
        parent_path: Vec<String>,
        key: String,
        range: Range<usize>,
    },
    /// On (or right after the colon of) a field's value.
    FieldValue {
        path: Vec<String>,
        range: Range<usize>,
        text: String,
    },
    /// In the templated body of a Markdown document, outside frontmatter and
    /// outside any bound slot.
    Template { id: String },
}

/// A raw cursor path resolved against the document's shape: the entity type
/// that governs the field, the field path within that entity, and which list
/// entity the cursor sits in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    pub entity_type: Option<String>,
    pub field_path: Vec<String>,
    pub entity_index: Option<usize>,
}

pub struct DocumentContext {
    pub uri: Url,
    pub namespace: &'static str,
    pub rule: ResolvedItem,
    pub path_fields: std::collections::BTreeMap<String, String>,
    pub schema: Arc<Schema>,
    pub doc: Arc<ParsedDocument>,
    pub template: Option<Template>,
    /// Template slots bound to document regions; empty when binding failed
    /// (the error is then in `extraction`).
    pub slots: Vec<BoundSlot>,
    pub extraction: CoreResult<ExtractedContent>,
    pub mappings: Option<DocumentMappings>,
    pub entity_context: Arc<EntityContext>,
    pub projection_contexts: Arc<Vec<ProjectionContext>>,
}

/// Assemble the context for one document. Fails only when the document is
/// outside the workspace's governance; extraction problems are carried in
/// `extraction` so diagnostics can report them.
pub async fn build_document_context(
    workspace: &Workspace,
    store: &dyn GraphStore,
    uri: &Url,
    doc: Arc<ParsedDocument>,
) -> CoreResult<DocumentContext> {
    build_document_context_with(workspace, store, uri, doc, None).await
}

/// Like [`build_document_context`], but reuses graph contexts the caller
/// already fetched for this document and graph version, skipping the store
/// round trips.
pub async fn build_document_context_with(
    workspace: &Workspace,
    store: &dyn GraphStore,
    uri: &Url,
    doc: Arc<ParsedDocument>,
    cached: Option<(Arc<EntityContext>, Arc<Vec<ProjectionContext>>)>,
) -> CoreResult<DocumentContext> {
    let path = uri
        .to_file_path()
        .map_err(|_| CoreError::NavigationItemNotFound(uri.to_string()))?;
    let relative = workspace
        .relative_path(&path)
        .ok_or_else(|| CoreError::NavigationItemNotFound(uri.to_string()))?;
    let (namespace, rule) = workspace
        .find_rule(&relative)
        .ok_or_else(|| CoreError::NavigationItemNotFound(relative.clone()))?;
    let rule = rule.clone();
    let path_fields = rule.template.extract_fields(&relative)?;

    let schema = store.get_schema(namespace).await?;
    let template = rule
        .item
        .template
        .as_deref()
        .and_then(|id| workspace.template(id))
        .cloned();

    let slots = match (&template, doc.format) {
        (Some(template), DocFormat::Markdown) => {
            template.bind(doc.body(), doc.body_offset).unwrap_or_default()
        }
        _ => Vec::new(),
    };

    let extraction = extract_document(&doc, &rule.item, template.as_ref());
    let (entity_context, projection_contexts) = match cached {
        Some(cached) => cached,
        None => {
            let entity_context =
                Arc::new(fetch_entity_context(store, namespace, &rule.item, &path_fields).await?);

            let mut projection_contexts = Vec::new();
            if let Ok(ExtractedContent::Document { root, projections }) = &extraction {
                let mut local: FieldSet = root.fields.clone();
                for (key, value) in &path_fields {
                    local
                        .entry(key.clone())
                        .or_insert_with(|| FieldValue::String(value.clone()));
                }
                for projection in projections {
                    match fetch_projection_context(store, namespace, projection, &local, &[]).await
                    {
                        Ok(ctx) => projection_contexts.push(ctx),
                        Err(err) => {
                            debug!(projection = %projection.name, %err, "projection fetch failed");
                        }
                    }
                }
            }
            (entity_context, Arc::new(projection_contexts))
        }
    };

    let mappings = extraction
        .as_ref()
        .ok()
        .map(|extracted| compute_mappings(extracted, &entity_context, &projection_contexts));

    Ok(DocumentContext {
        uri: uri.clone(),
        namespace,
        rule,
        path_fields,
        schema,
        doc,
        template,
        slots,
        extraction,
        mappings,
        entity_context,
        projection_contexts,
    })
}

impl DocumentContext {
    /// The changesets this document currently implies.
    pub fn changesets(&self) -> CoreResult<Vec<Changeset>> {
        let extracted = self.extraction.as_ref().map_err(CoreError::clone)?;
        let mappings = self
            .mappings
            .as_ref()
            .ok_or_else(|| CoreError::ParseFailed("no mappings".into()))?;
        compute_changesets(extracted, mappings, &self.entity_context, &self.projection_contexts)
    }

    pub fn cursor(&self, offset: usize) -> CursorContext {
        match self.doc.format {
            DocFormat::Yaml => match &self.doc.yaml {
                Some(tree) => yaml_cursor(tree, &self.doc.text, offset, 0),
                None => CursorContext::None,
            },
            DocFormat::Markdown => self.markdown_cursor(offset),
        }
    }

    fn markdown_cursor(&self, offset: usize) -> CursorContext {
        if let Some(fm) = &self.doc.frontmatter {
            if offset >= fm.byte_range.start && offset <= fm.byte_range.end {
                return yaml_cursor(
                    &fm.tree,
                    &fm.source,
                    offset - fm.byte_range.start,
                    fm.byte_range.start,
                );
            }
        }
        for slot in &self.slots {
            if offset >= slot.range.start && offset <= slot.range.end {
                return CursorContext::FieldValue {
                    path: vec![slot.field.clone()],
                    range: slot.range.clone(),
                    text: slot.text.clone(),
                };
            }
        }
        // Fixed template text and prose between slots point at the template
        // itself.
        if let Some(id) = &self.rule.item.template {
            return CursorContext::Template { id: id.clone() };
        }
        CursorContext::None
    }

    /// The entity type of the document's root, before any nesting.
    pub fn root_entity_type(&self) -> Option<String> {
        if let Ok(ExtractedContent::Single(entity)) = &self.extraction {
            if let Some(t) = &entity.entity_type {
                return Some(t.clone());
            }
        }
        if let Ok(ExtractedContent::Document { root, .. }) = &self.extraction {
            if let Some(t) = &root.entity_type {
                return Some(t.clone());
            }
        }
        self.entity_context.filters.get(FIELD_TYPE).cloned()
    }

    /// Resolve a raw cursor path against the document shape: strip list
    /// wrappers and indices, follow projection names to their query type,
    /// and keep type inheritance through `children`.
    pub fn resolve_field_path(&self, raw: &[String]) -> ResolvedPath {
        let mut entity_type = self.root_entity_type();
        let mut entity_index = None;
        let mut i = 0;

        while i < raw.len() {
            let segment = raw[i].as_str();
            if segment == DATA_CONTAINER || segment == CHILD_CONTAINER {
                i += 1;
                if i < raw.len() && raw[i].chars().all(|c| c.is_ascii_digit()) {
                    if entity_index.is_none() {
                        entity_index = raw[i].parse().ok();
                    }
                    i += 1;
                }
                continue;
            }
            if i == 0 && segment.chars().all(|c| c.is_ascii_digit()) {
                // Top-level sequence document.
                entity_index = segment.parse().ok();
                i += 1;
                continue;
            }
            if let Some(query) = self.projection_query(segment) {
                entity_type = split_filters(&query).get(FIELD_TYPE).cloned();
                i += 1;
                continue;
            }
            break;
        }

        ResolvedPath {
            entity_type,
            field_path: raw[i..].to_vec(),
            entity_index,
        }
    }

    fn projection_query(&self, name: &str) -> Option<String> {
        if let Ok(ExtractedContent::Document { projections, .. }) = &self.extraction {
            return projections
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.query.clone());
        }
        None
    }
}

// ============================================================================
// YAML cursor resolution
// ============================================================================

fn row_of(source: &str, offset: usize) -> usize {
    source[..offset].bytes().filter(|&b| b == b'\n').count()
}

fn is_pair(node: Node<'_>) -> bool {
    matches!(node.kind(), "block_mapping_pair" | "flow_pair")
}

/// The deepest mapping pair governing the offset. Direct containment finds
/// the pair when the cursor sits on a key or a value; the line scan finds the
/// last pair ending on the cursor's line with only whitespace in between (the
/// "status: ‸" case, where the value does not exist yet). Inside a nested
/// block the containing ancestor pair spans the cursor too, so a line-scan
/// pair that lies within the containment pair is the more specific one and
/// wins.
fn find_pair_at<'a>(tree: &'a Tree, source: &str, offset: usize) -> Option<Node<'a>> {
    let mut containing = None;
    if let Some(mut node) = node_at_offset(tree, offset) {
        loop {
            if is_pair(node) {
                containing = Some(node);
                break;
            }
            match node.parent() {
                Some(parent) => node = parent,
                None => break,
            }
        }
    }

    let row = row_of(source, offset);
    let mut line_pair: Option<Node<'a>> = None;
    collect_line_pairs(tree.root_node(), source, offset, row, &mut line_pair);

    match (containing, line_pair) {
        (Some(pair), Some(line)) => {
            let deeper = line.id() != pair.id()
                && line.start_byte() >= pair.start_byte()
                && line.end_byte() <= pair.end_byte();
            Some(if deeper { line } else { pair })
        }
        (Some(pair), None) => Some(pair),
        (None, line) => line,
    }
}

fn collect_line_pairs<'a>(
    node: Node<'a>,
    source: &str,
    offset: usize,
    row: usize,
    best: &mut Option<Node<'a>>,
) {
    if is_pair(node)
        && node.end_byte() <= offset
        && node.end_position().row == row
        && source[node.end_byte()..offset].chars().all(|c| c == ' ')
    {
        if best.map(|b| node.end_byte() > b.end_byte()).unwrap_or(true) {
            *best = Some(node);
        }
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_line_pairs(child, source, offset, row, best);
    }
}

/// Mapping keys and sequence indices above a pair, outermost first.
fn path_above(pair: Node<'_>, source: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = pair;
    while let Some(parent) = current.parent() {
        if is_pair(parent) {
            if let Some(key) = parent.child_by_field_name("key") {
                segments.push(scalar_text(unwrap_node(key), source));
            }
        } else if parent.kind() == "block_sequence_item" {
            if let Some(sequence) = parent.parent() {
                let mut index = 0;
                let mut cursor = sequence.walk();
                for sibling in sequence.named_children(&mut cursor) {
                    if sibling.id() == parent.id() {
                        break;
                    }
                    if sibling.kind() == "block_sequence_item" {
                        index += 1;
                    }
                }
                segments.push(index.to_string());
            }
        }
        current = parent;
    }
    segments.reverse();
    segments
}

/// Resolve a cursor inside a YAML source. `base` translates ranges back into
/// the host document (0 for standalone YAML, the frontmatter start for
/// Markdown).
pub fn yaml_cursor(tree: &Tree, source: &str, offset: usize, base: usize) -> CursorContext {
    let offset = offset.min(source.len());
    let Some(pair) = find_pair_at(tree, source, offset) else {
        // A document with no content at all resolves to nothing.
        if root_content(tree).is_none() {
            return CursorContext::None;
        }
        // No pair anywhere near the cursor: a fresh key position at the
        // document's top level.
        return CursorContext::FieldKey {
            parent_path: Vec::new(),
            key: String::new(),
            range: base + offset..base + offset,
        };
    };

    let parent_path = path_above(pair, source);
    let key_node = pair.child_by_field_name("key");
    let value_node = pair.child_by_field_name("value");

    if let Some(key) = key_node {
        if offset >= key.start_byte() && offset <= key.end_byte() {
            return CursorContext::FieldKey {
                parent_path,
                key: scalar_text(unwrap_node(key), source),
                range: base + key.start_byte()..base + key.end_byte(),
            };
        }
    }

    let mut path = parent_path;
    if let Some(key) = key_node {
        path.push(scalar_text(unwrap_node(key), source));
    }

    match value_node {
        Some(value) if offset >= value.start_byte() => {
            let unwrapped = unwrap_node(value);
            if is_scalar(unwrapped) {
                CursorContext::FieldValue {
                    path,
                    range: base + unwrapped.start_byte()..base + unwrapped.end_byte(),
                    text: scalar_text(unwrapped, source),
                }
            } else {
                // Inside a nested structure but not on any pair of it, e.g.
                // a blank line within a nested mapping.
                CursorContext::FieldKey {
                    parent_path: path,
                    key: String::new(),
                    range: base + offset..base + offset,
                }
            }
        }
        _ => CursorContext::FieldValue {
            path,
            range: base + offset..base + offset,
            text: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_yaml;

    fn cursor_at(source: &str, needle: &str) -> CursorContext {
        let offset = source.find(needle).unwrap() + needle.len();
        let tree = parse_yaml(source).unwrap();
        yaml_cursor(&tree, source, offset, 0)
    }

    #[test]
    fn test_cursor_on_key() {
        let source = "title: Hello\nstatus: todo\n";
        let tree = parse_yaml(source).unwrap();
        let ctx = yaml_cursor(&tree, source, source.find("status").unwrap() + 3, 0);
        assert_eq!(
            ctx,
            CursorContext::FieldKey {
                parent_path: Vec::new(),
                key: "status".into(),
                range: 13..19,
            }
        );
    }

    #[test]
    fn test_cursor_on_value() {
        let source = "title: Hello\nstatus: todo\n";
        let ctx = cursor_at(source, "status: to");
        let CursorContext::FieldValue { path, text, range } = ctx else {
            panic!("expected value context");
        };
        assert_eq!(path, vec!["status"]);
        assert_eq!(text, "todo");
        assert_eq!(&source[range], "todo");
    }

    #[test]
    fn test_cursor_after_colon_without_value() {
        // The "status: ‸" position: the pair has no value node yet.
        let source = "title: Hello\nstatus: \n";
        let ctx = cursor_at(source, "status: ");
        let CursorContext::FieldValue { path, text, .. } = ctx else {
            panic!("expected value context, got {ctx:?}");
        };
        assert_eq!(path, vec!["status"]);
        assert_eq!(text, "");
    }

    #[test]
    fn test_cursor_in_nested_sequence() {
        let source = "items:\n  - title: First\n  - title: Second\n";
        let ctx = cursor_at(source, "Seco");
        let CursorContext::FieldValue { path, text, .. } = ctx else {
            panic!("expected value context");
        };
        assert_eq!(path, vec!["items", "1", "title"]);
        assert_eq!(text, "Second");
    }

    #[test]
    fn test_cursor_in_nested_mapping() {
        let source = "project:\n  name: Acme\n";
        let ctx = cursor_at(source, "Ac");
        let CursorContext::FieldValue { path, .. } = ctx else {
            panic!("expected value context");
        };
        assert_eq!(path, vec!["project", "name"]);
    }

    #[test]
    fn test_cursor_after_colon_in_nested_list_item() {
        // The "status: ‸" position inside a list item: the ancestor pair for
        // the whole list spans the cursor, but the empty status field is the
        // one the cursor is on.
        let source = "items:\n  - title: T\n    status: \n";
        let ctx = cursor_at(source, "status: ");
        let CursorContext::FieldValue { path, text, .. } = ctx else {
            panic!("expected a value cursor, got {ctx:?}");
        };
        assert_eq!(path, vec!["items", "0", "status"]);
        assert_eq!(text, "");
    }

    #[test]
    fn test_cursor_in_empty_document_is_none() {
        let source = "";
        let tree = parse_yaml(source).unwrap();
        assert_eq!(yaml_cursor(&tree, source, 0, 0), CursorContext::None);
    }

    #[test]
    fn test_base_offset_translates_ranges() {
        let source = "title: Hello\n";
        let tree = parse_yaml(source).unwrap();
        let ctx = yaml_cursor(&tree, source, 8, 100);
        let CursorContext::FieldValue { range, .. } = ctx else {
            panic!("expected value context");
        };
        assert_eq!(range, 107..112);
    }
}
