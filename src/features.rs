//! Editor features computed from a document context.
//!
//! Every function here is total over its inputs: missing schema entries,
//! unresolvable cursors or failed extractions degrade to an empty response,
//! never to an error that would surface in the editor.

use std::collections::HashMap;
use std::ops::Range as ByteRange;

use tower_lsp::lsp_types::{
    CodeAction, CodeActionKind, CodeActionOrCommand, CompletionItem, CompletionItemKind,
    Diagnostic, DiagnosticSeverity, Hover, HoverContents, InlayHint, InlayHintKind,
    InlayHintLabel, Location, MarkupContent, MarkupKind, Position, Range, TextEdit, Url,
    WorkspaceEdit,
};
use tracing::debug;

use crate::context::{CursorContext, DocumentContext};
use crate::error::CoreError;
use crate::extract::ExtractedContent;
use crate::fields::{is_system_field, FieldValue};
use crate::mapping::{DocumentMappings, EntityMapping};
use crate::schema::{FieldDef, FieldKind};
use crate::store::{Entity, GraphStore, SearchQuery};
use crate::workspace::{Workspace, CONFIG_NAMESPACE};

// ============================================================================
// Offset / position conversion
// ============================================================================

/// LSP positions count UTF-16 code units per line.
pub fn offset_to_position(text: &str, offset: usize) -> Position {
    let offset = offset.min(text.len());
    let mut line = 0u32;
    let mut line_start = 0usize;
    for (i, b) in text.bytes().enumerate() {
        if i >= offset {
            break;
        }
        if b == b'\n' {
            line += 1;
            line_start = i + 1;
        }
    }
    let character = text[line_start..offset]
        .chars()
        .map(char::len_utf16)
        .sum::<usize>() as u32;
    Position { line, character }
}

pub fn position_to_offset(text: &str, position: Position) -> usize {
    let mut line = 0u32;
    let mut offset = 0usize;
    if position.line > 0 {
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line += 1;
                if line == position.line {
                    offset = i + 1;
                    break;
                }
            }
        }
        if line < position.line {
            return text.len();
        }
    }
    let mut units = 0u32;
    for (i, c) in text[offset..].char_indices() {
        if units >= position.character || c == '\n' {
            return offset + i;
        }
        units += c.len_utf16() as u32;
    }
    text.len()
}

pub fn byte_range_to_lsp(text: &str, range: &ByteRange<usize>) -> Range {
    Range {
        start: offset_to_position(text, range.start),
        end: offset_to_position(text, range.end),
    }
}

// ============================================================================
// Hover
// ============================================================================

fn field_doc(name: &str, def: &FieldDef) -> String {
    let mut out = format!("**{name}** `{}`", def.kind.label());
    if def.required {
        out.push_str(" *(required)*");
    }
    if let Some(description) = &def.description {
        out.push_str("\n\n");
        out.push_str(description);
    }
    match def.kind {
        FieldKind::Option if !def.choices.is_empty() => {
            out.push_str("\n\nOne of: ");
            out.push_str(&def.choices.join(", "));
        }
        FieldKind::Relation => {
            if let Some(target) = &def.target {
                out.push_str(&format!("\n\nReferences a `{target}`"));
            }
        }
        FieldKind::List => {
            if let Some(of) = def.of {
                out.push_str(&format!("\n\nList of `{}`", of.label()));
            }
        }
        _ => {}
    }
    out
}

/// Which projection, in extraction order, a cursor path starts in.
fn projection_position(ctx: &DocumentContext, name: &str) -> Option<usize> {
    if let Ok(ExtractedContent::Document { projections, .. }) = &ctx.extraction {
        return projections.iter().position(|p| p.name == name);
    }
    None
}

/// The graph identity of the entity the cursor sits in: the uid its block
/// resolved to, or the fact that it is new.
fn identity_line(
    ctx: &DocumentContext,
    raw_path: &[String],
    index: Option<usize>,
) -> Option<String> {
    let mapping = match ctx.mappings.as_ref()? {
        DocumentMappings::Single(mapping) => mapping,
        DocumentMappings::List(list) => list.get(index?)?,
        DocumentMappings::Document { root, projections } => {
            match raw_path
                .first()
                .and_then(|name| projection_position(ctx, name))
            {
                Some(p) => projections.get(p)?.get(index?)?,
                None => root,
            }
        }
    };
    Some(match mapping {
        EntityMapping::Matched { uid, .. } => format!("\n\n---\nMatched `{uid}`"),
        EntityMapping::New { .. } => "\n\n---\nNew entity".to_string(),
    })
}

pub fn hover(ctx: &DocumentContext, offset: usize) -> Option<Hover> {
    let (full_path, range) = match ctx.cursor(offset) {
        CursorContext::FieldKey {
            parent_path,
            key,
            range,
        } if !key.is_empty() => {
            let mut path = parent_path;
            path.push(key);
            (path, range)
        }
        CursorContext::FieldValue { path, range, .. } => (path, range),
        _ => return None,
    };

    let resolved = ctx.resolve_field_path(&full_path);
    let entity_type = resolved.entity_type?;
    let def = ctx
        .schema
        .resolve_field(&entity_type, &resolved.field_path)?;
    let name = resolved.field_path.last()?;

    let mut value = field_doc(name, def);
    if let Some(line) = identity_line(ctx, &full_path, resolved.entity_index) {
        value.push_str(&line);
    }

    Some(Hover {
        contents: HoverContents::Markup(MarkupContent {
            kind: MarkupKind::Markdown,
            value,
        }),
        range: Some(byte_range_to_lsp(&ctx.doc.text, &range)),
    })
}

// ============================================================================
// Completion
// ============================================================================

fn key_item(name: &str, def: &FieldDef) -> CompletionItem {
    CompletionItem {
        label: name.to_string(),
        kind: Some(CompletionItemKind::FIELD),
        detail: Some(def.kind.label().to_string()),
        documentation: def.description.clone().map(|d| {
            tower_lsp::lsp_types::Documentation::String(d)
        }),
        insert_text: Some(format!("{name}: ")),
        ..CompletionItem::default()
    }
}

fn value_item(value: &str) -> CompletionItem {
    CompletionItem {
        label: value.to_string(),
        kind: Some(CompletionItemKind::ENUM_MEMBER),
        ..CompletionItem::default()
    }
}

/// Identity a relation value uses to name its target.
fn relation_key(entity: &Entity) -> Option<String> {
    entity
        .fields
        .get("key")
        .and_then(FieldValue::as_str)
        .map(str::to_string)
        .or_else(|| entity.content_key().map(str::to_string))
        .or_else(|| entity.uid.clone())
}

pub async fn completions(
    ctx: &DocumentContext,
    store: &dyn GraphStore,
    offset: usize,
) -> Vec<CompletionItem> {
    match ctx.cursor(offset) {
        CursorContext::FieldKey { parent_path, .. } => {
            let resolved = ctx.resolve_field_path(&parent_path);
            let Some(entity_type) = resolved.entity_type else {
                return Vec::new();
            };
            // A non-empty remainder means the cursor is nested under a field
            // rather than directly in an entity mapping.
            let fields = if resolved.field_path.is_empty() {
                ctx.schema
                    .entity_type(&entity_type)
                    .map(|t| &t.fields)
            } else {
                ctx.schema
                    .resolve_field(&entity_type, &resolved.field_path)
                    .and_then(|def| def.target.as_deref())
                    .and_then(|target| ctx.schema.entity_type(target))
                    .map(|t| &t.fields)
            };
            fields
                .map(|fields| fields.iter().map(|(n, d)| key_item(n, d)).collect())
                .unwrap_or_default()
        }
        CursorContext::FieldValue { path, .. } => {
            let resolved = ctx.resolve_field_path(&path);
            let Some(entity_type) = resolved.entity_type else {
                return Vec::new();
            };
            let Some(def) = ctx.schema.resolve_field(&entity_type, &resolved.field_path)
            else {
                return Vec::new();
            };
            match def.kind {
                FieldKind::Option => def.choices.iter().map(|c| value_item(c)).collect(),
                FieldKind::Boolean => vec![value_item("true"), value_item("false")],
                FieldKind::Relation => {
                    let Some(target) = def.target.clone() else {
                        return Vec::new();
                    };
                    let mut filters = std::collections::BTreeMap::new();
                    filters.insert("type".to_string(), target);
                    let candidates = store
                        .search(&SearchQuery::from_filters(filters), Some(ctx.namespace))
                        .await
                        .unwrap_or_default();
                    candidates
                        .iter()
                        .filter_map(|entity| {
                            let key = relation_key(entity)?;
                            Some(CompletionItem {
                                label: key.clone(),
                                kind: Some(CompletionItemKind::REFERENCE),
                                detail: entity
                                    .content_key()
                                    .filter(|title| **title != *key)
                                    .map(str::to_string),
                                ..CompletionItem::default()
                            })
                        })
                        .collect()
                }
                _ => Vec::new(),
            }
        }
        CursorContext::None | CursorContext::Template { .. } => Vec::new(),
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Locate `key:` textually within a span, for diagnostics that only know the
/// field name. `skip` occurrences are passed over (duplicate-key reports
/// point at the second copy).
fn key_range(text: &str, region: &ByteRange<usize>, key: &str, skip: usize) -> ByteRange<usize> {
    let needle = format!("{key}:");
    let slice = &text[region.clone()];
    let mut from = 0;
    let mut found = 0;
    while let Some(at) = slice[from..].find(&needle) {
        let start = from + at;
        let at_line_start = start == 0
            || slice[..start].ends_with('\n')
            || slice[..start].ends_with(' ')
            || slice[..start].ends_with('-');
        if at_line_start {
            if found == skip {
                return region.start + start..region.start + start + key.len();
            }
            found += 1;
        }
        from = start + needle.len();
    }
    region.start..region.start
}

fn whole_region(ctx: &DocumentContext) -> ByteRange<usize> {
    0..ctx.doc.text.len()
}

fn extraction_error_diagnostic(ctx: &DocumentContext, err: &CoreError) -> Diagnostic {
    let text = &ctx.doc.text;
    let (range, message) = match err {
        CoreError::FieldConflict { path } => (
            key_range(text, &whole_region(ctx), path, 1),
            format!("'{path}' is defined more than once with different values"),
        ),
        other => (
            0..text.lines().next().map(str::len).unwrap_or(0),
            other.to_string(),
        ),
    };
    Diagnostic {
        range: byte_range_to_lsp(text, &range),
        severity: Some(DiagnosticSeverity::ERROR),
        source: Some("notegraph".to_string()),
        message,
        ..Diagnostic::default()
    }
}

fn collect_typed_entities<'a>(
    entity: &'a Entity,
    entity_type: Option<String>,
    out: &mut Vec<(&'a Entity, String)>,
) {
    let own_type = entity.entity_type.clone().or(entity_type);
    if let Some(t) = own_type.clone() {
        out.push((entity, t));
    }
    for child in &entity.children {
        collect_typed_entities(child, own_type.clone(), out);
    }
    let item_type = entity
        .query
        .as_deref()
        .and_then(|q| crate::interpolate::split_filters(q).get("type").cloned())
        .or(own_type);
    for item in &entity.items {
        collect_typed_entities(item, item_type.clone(), out);
    }
}

pub fn diagnostics(ctx: &DocumentContext) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    let text = &ctx.doc.text;

    let extracted = match &ctx.extraction {
        Ok(extracted) => extracted,
        Err(err) => {
            out.push(extraction_error_diagnostic(ctx, err));
            return out;
        }
    };

    let mut entities: Vec<(&Entity, String)> = Vec::new();
    let root_type = ctx.root_entity_type();
    match extracted {
        ExtractedContent::Single(entity) => {
            collect_typed_entities(entity, root_type, &mut entities)
        }
        ExtractedContent::Document { root, projections } => {
            collect_typed_entities(root, root_type, &mut entities);
            for projection in projections {
                let item_type = crate::interpolate::split_filters(&projection.query)
                    .get("type")
                    .cloned();
                for entity in &projection.entities {
                    collect_typed_entities(entity, item_type.clone(), &mut entities);
                }
            }
        }
        ExtractedContent::List(list) => {
            for entity in list {
                collect_typed_entities(entity, root_type.clone(), &mut entities);
            }
        }
    }

    for (entity, entity_type) in entities {
        let Some(declared) = ctx.schema.entity_type(&entity_type) else {
            // An unknown type is itself worth flagging once, on the root.
            continue;
        };
        let region = entity
            .span
            .clone()
            .or_else(|| ctx.doc.frontmatter.as_ref().map(|f| f.byte_range.clone()))
            .unwrap_or_else(|| whole_region(ctx));
        for key in entity.fields.keys() {
            if is_system_field(key) || declared.fields.contains_key(key) {
                continue;
            }
            // Template-bound body fields live outside the searchable region.
            let range = key_range(text, &region, key, 0);
            if range.is_empty() {
                continue;
            }
            out.push(Diagnostic {
                range: byte_range_to_lsp(text, &range),
                severity: Some(DiagnosticSeverity::WARNING),
                source: Some("notegraph".to_string()),
                message: format!("unknown field '{key}' on type '{entity_type}'"),
                ..Diagnostic::default()
            });
        }
    }

    debug!(count = out.len(), uri = %ctx.uri, "computed diagnostics");
    out
}

// ============================================================================
// Go to definition
// ============================================================================

pub async fn goto_definition(
    ctx: &DocumentContext,
    store: &dyn GraphStore,
    workspace: &Workspace,
    offset: usize,
) -> Option<Location> {
    let cursor = ctx.cursor(offset);

    // In a templated body, prose and fixed text jump to the template file.
    if let CursorContext::Template { id } = &cursor {
        let uri = Url::from_file_path(workspace.template_path(id)).ok()?;
        return Some(Location::new(uri, Range::default()));
    }

    let CursorContext::FieldValue { path, text, .. } = cursor else {
        return None;
    };
    if text.is_empty() {
        return None;
    }

    // In configuration files, a `template:` value jumps to the template.
    if ctx.namespace == CONFIG_NAMESPACE && path.last().map(String::as_str) == Some("template")
    {
        let template_path = workspace.template_path(&text);
        let uri = Url::from_file_path(&template_path).ok()?;
        return Some(Location::new(uri, Range::default()));
    }

    let resolved = ctx.resolve_field_path(&path);
    let entity_type = resolved.entity_type?;
    let def = ctx.schema.resolve_field(&entity_type, &resolved.field_path)?;
    if def.kind != FieldKind::Relation {
        return None;
    }
    let target = def.target.clone()?;

    let mut filters = std::collections::BTreeMap::new();
    filters.insert("type".to_string(), target.clone());
    let candidates = store
        .search(&SearchQuery::from_filters(filters), Some(ctx.namespace))
        .await
        .ok()?;
    let entity = candidates.iter().find(|candidate| {
        relation_key(candidate).as_deref() == Some(text.as_str())
            || candidate.uid.as_deref() == Some(text.as_str())
    })?;

    let display_fields: std::collections::BTreeMap<String, String> = entity
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.to_display_string()))
        .collect();
    let tree = workspace.navigation(ctx.namespace)?;
    let relative = tree.resolve_path_for_fields(Some(&target), &display_fields)?;
    let uri = Url::from_file_path(workspace.absolute_path(&relative)).ok()?;
    Some(Location::new(uri, Range::default()))
}

// ============================================================================
// Code actions
// ============================================================================

fn delete_line_edit(range: &Range) -> TextEdit {
    let start = Position {
        line: range.start.line,
        character: 0,
    };
    let end = Position {
        line: range.start.line + 1,
        character: 0,
    };
    TextEdit {
        range: Range { start, end },
        new_text: String::new(),
    }
}

fn quickfix(
    uri: &Url,
    title: &str,
    diagnostic: &Diagnostic,
    at: &Range,
) -> CodeActionOrCommand {
    let mut changes = HashMap::new();
    changes.insert(uri.clone(), vec![delete_line_edit(at)]);
    CodeActionOrCommand::CodeAction(CodeAction {
        title: title.to_string(),
        kind: Some(CodeActionKind::QUICKFIX),
        diagnostics: Some(vec![diagnostic.clone()]),
        edit: Some(WorkspaceEdit {
            changes: Some(changes),
            ..WorkspaceEdit::default()
        }),
        ..CodeAction::default()
    })
}

/// Quick fixes for the diagnostics intersecting the requested range: remove
/// an unknown field, or drop either copy of a conflicting one.
pub fn code_actions(ctx: &DocumentContext, requested: &Range) -> Vec<CodeActionOrCommand> {
    let mut out = Vec::new();
    for diagnostic in diagnostics(ctx) {
        if diagnostic.range.end.line < requested.start.line
            || diagnostic.range.start.line > requested.end.line
        {
            continue;
        }
        if diagnostic.message.contains("more than once") {
            out.push(quickfix(
                &ctx.uri,
                "Remove the duplicate definition",
                &diagnostic,
                &diagnostic.range,
            ));
            if let Err(CoreError::FieldConflict { path }) = &ctx.extraction {
                let earlier = key_range(&ctx.doc.text, &whole_region(ctx), path, 0);
                if !earlier.is_empty() {
                    let range = byte_range_to_lsp(&ctx.doc.text, &earlier);
                    out.push(quickfix(
                        &ctx.uri,
                        "Remove the earlier definition",
                        &diagnostic,
                        &range,
                    ));
                }
            }
        } else if diagnostic.message.starts_with("unknown field") {
            out.push(quickfix(
                &ctx.uri,
                "Remove this field",
                &diagnostic,
                &diagnostic.range,
            ));
        }
    }
    out
}

// ============================================================================
// Inlay hints
// ============================================================================

fn entity_hint(text: &str, entity: &Entity, mapping: &EntityMapping) -> Option<InlayHint> {
    let span = entity.span.clone()?;
    let line_end = text[span.start..]
        .find('\n')
        .map(|i| span.start + i)
        .unwrap_or(text.len());
    let label = match mapping {
        EntityMapping::Matched { uid, .. } => format!("= {uid}"),
        EntityMapping::New { .. } => "new".to_string(),
    };
    Some(InlayHint {
        position: offset_to_position(text, line_end),
        label: InlayHintLabel::String(label),
        kind: Some(InlayHintKind::TYPE),
        text_edits: None,
        tooltip: None,
        padding_left: Some(true),
        padding_right: None,
        data: None,
    })
}

/// One hint per list or projection entity, showing the graph identity each
/// block resolved to.
pub fn inlay_hints(ctx: &DocumentContext) -> Vec<InlayHint> {
    let text = &ctx.doc.text;
    let (Ok(extracted), Some(mappings)) = (&ctx.extraction, &ctx.mappings) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    match (extracted, mappings) {
        (ExtractedContent::List(entities), DocumentMappings::List(list)) => {
            for (entity, mapping) in entities.iter().zip(list) {
                out.extend(entity_hint(text, entity, mapping));
            }
        }
        (
            ExtractedContent::Document { projections, .. },
            DocumentMappings::Document {
                projections: projection_mappings,
                ..
            },
        ) => {
            for (projection, mappings) in projections.iter().zip(projection_mappings) {
                for (entity, mapping) in projection.entities.iter().zip(mappings) {
                    out.extend(entity_hint(text, entity, mapping));
                }
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_position_round_trip() {
        let text = "first line\nsecond line\nthird\n";
        for offset in [0, 5, 11, 15, text.len()] {
            let position = offset_to_position(text, offset);
            assert_eq!(position_to_offset(text, position), offset);
        }
    }

    #[test]
    fn test_position_counts_utf16_units() {
        let text = "emoji 😀 here\n";
        let offset = text.find("here").unwrap();
        let position = offset_to_position(text, offset);
        // "emoji " is 6 units, the emoji is 2, the space 1.
        assert_eq!(position, Position { line: 0, character: 9 });
        assert_eq!(position_to_offset(text, position), offset);
    }

    #[test]
    fn test_position_past_end_clamps() {
        let text = "short\n";
        assert_eq!(
            position_to_offset(text, Position { line: 9, character: 9 }),
            text.len()
        );
        assert_eq!(position_to_offset(text, Position { line: 0, character: 99 }), 5);
    }

    #[test]
    fn test_key_range_finds_second_occurrence() {
        let text = "title: One\nstatus: x\ntitle: Two\n";
        let range = key_range(text, &(0..text.len()), "title", 1);
        assert_eq!(&text[range], "title");
        let first = key_range(text, &(0..text.len()), "title", 0);
        assert_eq!(first.start, 0);
    }

    #[test]
    fn test_key_range_requires_key_position() {
        // "status:" inside a value must not match.
        let text = "note: 'status: odd'\nstatus: x\n";
        let range = key_range(text, &(0..text.len()), "status", 0);
        assert_eq!(range.start, text.rfind("status").unwrap());
    }

    #[test]
    fn test_field_doc_mentions_choices() {
        let def = FieldDef {
            kind: FieldKind::Option,
            choices: vec!["todo".into(), "done".into()],
            target: None,
            of: None,
            description: Some("Where the work stands".into()),
            required: true,
        };
        let doc = field_doc("status", &def);
        assert!(doc.contains("**status**"));
        assert!(doc.contains("required"));
        assert!(doc.contains("todo, done"));
    }
}
