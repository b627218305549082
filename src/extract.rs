//! Extraction: parsed documents to entity trees.
//!
//! The navigation rule decides the document shape. An `includes` rule (or a
//! bare YAML mapping) yields a single entity; a `query` rule over YAML yields
//! the entity list under the `items` wrapper; a Markdown file with a template
//! yields a document entity plus any embedded query projections. Spans on
//! extracted entities are byte ranges in the source document, which is what
//! the inlay hint and hover features key on.

use std::ops::Range;

use tree_sitter::Node;

use crate::error::{CoreError, CoreResult};
use crate::fields::{
    FieldValue, CHILD_CONTAINER, DATA_CONTAINER, FIELD_TYPE, FIELD_UID,
};
use crate::navigation::NavigationItem;
use crate::parser::{
    first_named_child, markdown_blocks, parse_yaml, root_content, scalar_text, unwrap_node,
    yaml_node_value, DocFormat, MdBlock, ParsedDocument,
};
use crate::store::Entity;
use crate::template::Template;

/// A query projection embedded in a document: a read-only rendering of graph
/// entities selected by the query. Sync diffs its items like any other list.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub name: String,
    pub query: String,
    pub entities: Vec<Entity>,
    /// Byte span of the projection in the source document.
    pub span: Option<Range<usize>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedContent {
    /// One entity, from an `includes` rule or a bare YAML mapping.
    Single(Entity),
    /// An ordered entity list, from a `query` rule over YAML.
    List(Vec<Entity>),
    /// A root entity plus embedded projections.
    Document {
        root: Entity,
        projections: Vec<Projection>,
    },
}

impl ExtractedContent {
    /// The uid the document claims for its root entity, when single-shaped.
    pub fn claimed_uid(&self) -> Option<&str> {
        match self {
            ExtractedContent::Single(entity) => entity.uid.as_deref(),
            ExtractedContent::Document { root, .. } => root.uid.as_deref(),
            ExtractedContent::List(_) => None,
        }
    }
}

/// Extract a document according to its navigation rule. `template` is the
/// resolved Markdown template when the rule names one.
pub fn extract_document(
    doc: &ParsedDocument,
    rule: &NavigationItem,
    template: Option<&Template>,
) -> CoreResult<ExtractedContent> {
    match doc.format {
        DocFormat::Yaml => extract_yaml(doc, rule),
        DocFormat::Markdown => extract_markdown(doc, template),
    }
}

// ============================================================================
// YAML extraction
// ============================================================================

fn extract_yaml(doc: &ParsedDocument, rule: &NavigationItem) -> CoreResult<ExtractedContent> {
    let tree = doc
        .yaml
        .as_ref()
        .ok_or_else(|| CoreError::ParseFailed("yaml document without tree".into()))?;
    let Some(root) = root_content(tree) else {
        // An empty file is an empty entity, not an error.
        return Ok(if rule.query.is_some() {
            ExtractedContent::List(Vec::new())
        } else {
            ExtractedContent::Single(Entity::default())
        });
    };

    if rule.query.is_some() {
        return Ok(ExtractedContent::List(extract_yaml_list(root, &doc.text)?));
    }

    let (entity, projections) = entity_from_mapping(root, &doc.text, true)?;
    if projections.is_empty() {
        Ok(ExtractedContent::Single(entity))
    } else {
        Ok(ExtractedContent::Document {
            root: entity,
            projections,
        })
    }
}

/// A list document is either a top-level sequence or a mapping with the
/// entity list under the `items` wrapper key.
fn extract_yaml_list(root: Node<'_>, source: &str) -> CoreResult<Vec<Entity>> {
    let root = unwrap_node(root);
    match root.kind() {
        "block_sequence" | "flow_sequence" => sequence_entities(root, source),
        "block_mapping" | "flow_mapping" => {
            let mut cursor = root.walk();
            for pair in root.named_children(&mut cursor) {
                let Some(key_node) = pair.child_by_field_name("key") else {
                    continue;
                };
                if scalar_text(unwrap_node(key_node), source) == DATA_CONTAINER {
                    let Some(value) = pair.child_by_field_name("value") else {
                        return Ok(Vec::new());
                    };
                    return sequence_entities(unwrap_node(value), source);
                }
            }
            Err(CoreError::ParseFailed(format!(
                "list document needs a top-level sequence or an '{DATA_CONTAINER}' key"
            )))
        }
        other => Err(CoreError::ParseFailed(format!(
            "list document has unexpected root '{other}'"
        ))),
    }
}

fn sequence_entities(node: Node<'_>, source: &str) -> CoreResult<Vec<Entity>> {
    let mut entities = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        let item = if child.kind() == "block_sequence_item" {
            match first_named_child(child) {
                Some(inner) => inner,
                None => continue,
            }
        } else if child.kind() == "comment" {
            continue;
        } else {
            child
        };
        let (entity, _) = entity_from_mapping(unwrap_node(item), source, false)?;
        entities.push(entity);
    }
    Ok(entities)
}

/// Read one entity from a mapping node. System keys are lifted onto the
/// entity; nested mappings carrying a `query` key become projections when
/// `allow_projections` is set, otherwise plain entity-valued fields.
fn entity_from_mapping(
    node: Node<'_>,
    source: &str,
    allow_projections: bool,
) -> CoreResult<(Entity, Vec<Projection>)> {
    let node = unwrap_node(node);
    if node.kind() != "block_mapping" && node.kind() != "flow_mapping" {
        return Err(CoreError::ParseFailed(format!(
            "expected a mapping, found '{}'",
            node.kind()
        )));
    }

    let mut entity = Entity {
        span: Some(node.byte_range()),
        ..Entity::default()
    };
    let mut projections = Vec::new();

    let mut cursor = node.walk();
    for pair in node.named_children(&mut cursor) {
        if pair.kind() != "block_mapping_pair" && pair.kind() != "flow_pair" {
            continue;
        }
        let Some(key_node) = pair.child_by_field_name("key") else {
            continue;
        };
        let key = scalar_text(unwrap_node(key_node), source);
        let value_node = pair.child_by_field_name("value");

        match key.as_str() {
            FIELD_UID => {
                if let Some(value) = value_node {
                    entity.uid = Some(scalar_text(unwrap_node(value), source));
                }
            }
            FIELD_TYPE => {
                if let Some(value) = value_node {
                    entity.entity_type = Some(scalar_text(unwrap_node(value), source));
                }
            }
            CHILD_CONTAINER => {
                if let Some(value) = value_node {
                    entity.children = sequence_entities(unwrap_node(value), source)?;
                }
            }
            DATA_CONTAINER => {
                if let Some(value) = value_node {
                    entity.items = sequence_entities(unwrap_node(value), source)?;
                }
            }
            "query" => {
                if let Some(value) = value_node {
                    entity.query = Some(scalar_text(unwrap_node(value), source));
                }
            }
            _ => {
                let value = match value_node {
                    Some(value) => {
                        let unwrapped = unwrap_node(value);
                        if allow_projections && mapping_has_query(unwrapped, source) {
                            let (nested, _) = entity_from_mapping(unwrapped, source, false)?;
                            projections.push(Projection {
                                name: key,
                                query: nested.query.clone().unwrap_or_default(),
                                entities: nested.items,
                                span: Some(pair.byte_range()),
                            });
                            continue;
                        }
                        yaml_node_value(value, source)?
                    }
                    None => FieldValue::Null,
                };
                if let Some(existing) = entity.fields.get(&key) {
                    if *existing != value {
                        return Err(CoreError::FieldConflict { path: key });
                    }
                    continue;
                }
                entity.fields.insert(key, value);
            }
        }
    }

    Ok((entity, projections))
}

fn mapping_has_query(node: Node<'_>, source: &str) -> bool {
    if node.kind() != "block_mapping" && node.kind() != "flow_mapping" {
        return false;
    }
    let mut cursor = node.walk();
    let has_query = node.named_children(&mut cursor).any(|pair| {
        pair.child_by_field_name("key")
            .map(|key| scalar_text(unwrap_node(key), source) == "query")
            .unwrap_or(false)
    });
    has_query
}

// ============================================================================
// Markdown extraction
// ============================================================================

fn extract_markdown(
    doc: &ParsedDocument,
    template: Option<&Template>,
) -> CoreResult<ExtractedContent> {
    let mut root = Entity::default();
    let frontmatter = doc.frontmatter_fields()?;
    for (key, value) in frontmatter {
        match key.as_str() {
            FIELD_UID => root.uid = value.as_str().map(str::to_string),
            FIELD_TYPE => root.entity_type = value.as_str().map(str::to_string),
            _ => {
                root.fields.insert(key, value);
            }
        }
    }

    let body = doc.body();
    if let Some(template) = template {
        for slot in template.bind(body, doc.body_offset)? {
            let value = if slot.text.is_empty() {
                FieldValue::Null
            } else {
                FieldValue::String(slot.text)
            };
            if let Some(existing) = root.fields.get(&slot.field) {
                if *existing != value {
                    return Err(CoreError::FieldConflict { path: slot.field });
                }
                continue;
            }
            root.fields.insert(slot.field, value);
        }
    }

    let mut projections = Vec::new();
    for block in markdown_blocks(body) {
        if block.fence_info.as_deref() == Some("query") {
            projections.extend(projections_from_fence(body, doc.body_offset, &block)?);
        }
    }

    Ok(ExtractedContent::Document { root, projections })
}

/// Parse the YAML inside a ```query fence. Each top-level key is a
/// projection; entity spans stay document-absolute so hints land on the
/// right lines.
fn projections_from_fence(
    body: &str,
    body_offset: usize,
    block: &MdBlock,
) -> CoreResult<Vec<Projection>> {
    let raw = &body[block.range.clone()];
    let Some(open_end) = raw.find('\n') else {
        return Ok(Vec::new());
    };
    let content_start = open_end + 1;
    let content_end = raw[content_start..]
        .rfind("\n```")
        .map(|i| content_start + i + 1)
        .unwrap_or(raw.len());
    let content = &raw[content_start..content_end];
    let content_offset = body_offset + block.range.start + content_start;

    let tree = parse_yaml(content)?;
    let Some(root) = root_content(&tree) else {
        return Ok(Vec::new());
    };
    let (holder, mut projections) = entity_from_mapping(root, content, true)?;
    if !holder.fields.is_empty() {
        return Err(CoreError::ParseFailed(
            "query fence may only contain named projections".into(),
        ));
    }
    for projection in &mut projections {
        shift_span(&mut projection.span, content_offset);
        for entity in &mut projection.entities {
            shift_entity_spans(entity, content_offset);
        }
    }
    Ok(projections)
}

fn shift_span(span: &mut Option<Range<usize>>, by: usize) {
    if let Some(range) = span {
        *span = Some(range.start + by..range.end + by);
    }
}

fn shift_entity_spans(entity: &mut Entity, by: usize) {
    shift_span(&mut entity.span, by);
    for child in entity.children.iter_mut().chain(entity.items.iter_mut()) {
        shift_entity_spans(child, by);
    }
}
