//! Parsing plumbing shared by extraction and cursor resolution.
//!
//! YAML goes through tree-sitter so cursor features get byte-accurate CST
//! nodes; Markdown goes through pulldown-cmark for block structure. A parsed
//! document keeps the trees it needs for its format: a whole-file YAML tree,
//! or a frontmatter sub-tree plus the body offset for Markdown.

use std::ops::Range;

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser as MdParser, Tag};
use tree_sitter::{Language, Node, Parser, Tree};

use crate::error::{CoreError, CoreResult};
use crate::fields::{FieldSet, FieldValue};

pub fn language_yaml() -> Language {
    tree_sitter_yaml::LANGUAGE.into()
}

pub fn create_yaml_parser() -> CoreResult<Parser> {
    let mut parser = Parser::new();
    parser
        .set_language(&language_yaml())
        .map_err(|e| CoreError::ParseFailed(format!("yaml grammar: {e:?}")))?;
    Ok(parser)
}

pub fn parse_yaml(source: &str) -> CoreResult<Tree> {
    let mut parser = create_yaml_parser()?;
    parser
        .parse(source, None)
        .ok_or_else(|| CoreError::ParseFailed("yaml parse returned no tree".into()))
}

// ============================================================================
// CST helpers
// ============================================================================

/// Descend through the wrapper kinds (`stream`, `document`, `block_node`,
/// `flow_node`) to the substantive node underneath.
pub fn unwrap_node(node: Node<'_>) -> Node<'_> {
    let mut current = node;
    loop {
        match current.kind() {
            "stream" | "document" | "block_node" | "flow_node" => {
                let mut next = None;
                let mut cursor = current.walk();
                for child in current.named_children(&mut cursor) {
                    if child.kind() != "comment" && child.kind() != "anchor" {
                        next = Some(child);
                        break;
                    }
                }
                match next {
                    Some(child) => current = child,
                    None => return current,
                }
            }
            _ => return current,
        }
    }
}

/// The substantive root of a parsed YAML document, if the document is
/// non-empty.
pub fn root_content(tree: &Tree) -> Option<Node<'_>> {
    let root = unwrap_node(tree.root_node());
    match root.kind() {
        "stream" | "document" | "block_node" | "flow_node" => None,
        _ => Some(root),
    }
}

/// Decode a scalar node to its string content (quote stripping, basic
/// escapes, block scalar dedenting).
pub fn scalar_text(node: Node<'_>, source: &str) -> String {
    let raw = &source[node.byte_range()];
    match node.kind() {
        "single_quote_scalar" => raw.trim_matches('\'').replace("''", "'"),
        "double_quote_scalar" => {
            let inner = raw.trim_matches('"');
            inner
                .replace("\\\"", "\"")
                .replace("\\n", "\n")
                .replace("\\t", "\t")
                .replace("\\\\", "\\")
        }
        "block_scalar" => {
            let mut lines = raw.lines();
            lines.next(); // the `|`/`>` indicator line
            let body: Vec<&str> = lines.collect();
            let indent = body
                .iter()
                .filter(|l| !l.trim().is_empty())
                .map(|l| l.len() - l.trim_start().len())
                .min()
                .unwrap_or(0);
            body.iter()
                .map(|l| if l.len() >= indent { &l[indent..] } else { "" })
                .collect::<Vec<_>>()
                .join("\n")
        }
        _ => raw.trim().to_string(),
    }
}

/// Whether a node is one of the scalar kinds.
pub fn is_scalar(node: Node<'_>) -> bool {
    matches!(
        node.kind(),
        "plain_scalar"
            | "single_quote_scalar"
            | "double_quote_scalar"
            | "block_scalar"
            | "string_scalar"
            | "integer_scalar"
            | "float_scalar"
            | "boolean_scalar"
            | "null_scalar"
    )
}

/// Convert a YAML CST node into a field value. Duplicate mapping keys with
/// differing values fail with a field conflict carrying the key.
pub fn yaml_node_value(node: Node<'_>, source: &str) -> CoreResult<FieldValue> {
    let node = unwrap_node(node);
    match node.kind() {
        "block_mapping" | "flow_mapping" => {
            let mut fields = FieldSet::new();
            let mut cursor = node.walk();
            for pair in node.named_children(&mut cursor) {
                if pair.kind() != "block_mapping_pair" && pair.kind() != "flow_pair" {
                    continue;
                }
                let Some(key_node) = pair.child_by_field_name("key") else {
                    continue;
                };
                let key = scalar_text(unwrap_node(key_node), source);
                let value = match pair.child_by_field_name("value") {
                    Some(value_node) => yaml_node_value(value_node, source)?,
                    None => FieldValue::Null,
                };
                if let Some(existing) = fields.get(&key) {
                    if *existing != value {
                        return Err(CoreError::FieldConflict { path: key });
                    }
                    continue;
                }
                fields.insert(key, value);
            }
            Ok(FieldValue::Entity(fields))
        }
        "block_sequence" | "flow_sequence" => {
            let mut values = Vec::new();
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if child.kind() == "block_sequence_item" {
                    match first_named_child(child) {
                        Some(inner) => values.push(yaml_node_value(inner, source)?),
                        None => values.push(FieldValue::Null),
                    }
                } else if child.kind() != "comment" {
                    values.push(yaml_node_value(child, source)?);
                }
            }
            Ok(FieldValue::List(values))
        }
        "plain_scalar" => {
            // Typed scalar children carry the resolved kind.
            if let Some(typed) = first_named_child(node) {
                return yaml_node_value(typed, source);
            }
            Ok(FieldValue::from_scalar_text(&scalar_text(node, source)))
        }
        "string_scalar" => Ok(FieldValue::String(scalar_text(node, source))),
        "integer_scalar" | "float_scalar" => {
            let text = scalar_text(node, source);
            Ok(text
                .parse::<f64>()
                .map(FieldValue::Number)
                .unwrap_or(FieldValue::String(text)))
        }
        "boolean_scalar" => {
            let text = scalar_text(node, source);
            Ok(FieldValue::Bool(matches!(
                text.as_str(),
                "true" | "True" | "TRUE"
            )))
        }
        "null_scalar" => Ok(FieldValue::Null),
        "single_quote_scalar" | "double_quote_scalar" | "block_scalar" => {
            Ok(FieldValue::String(scalar_text(node, source)))
        }
        other => Err(CoreError::ParseFailed(format!(
            "unexpected yaml node kind '{other}'"
        ))),
    }
}

pub fn first_named_child(node: Node<'_>) -> Option<Node<'_>> {
    let mut cursor = node.walk();
    let first = node
        .named_children(&mut cursor)
        .find(|c| c.kind() != "comment");
    first
}

/// The deepest named node containing the byte offset.
pub fn node_at_offset<'a>(tree: &'a Tree, offset: usize) -> Option<Node<'a>> {
    tree.root_node()
        .named_descendant_for_byte_range(offset, offset)
}

// ============================================================================
// Frontmatter
// ============================================================================

#[derive(Debug, Clone)]
pub struct ParsedFrontmatter {
    /// The YAML source between the fences.
    pub source: String,
    /// Parsed tree over `source`.
    pub tree: Tree,
    /// Byte range of `source` within the full document text.
    pub byte_range: Range<usize>,
    /// Line of the full document where `source` begins, for translating
    /// ranges back into the host document.
    pub line_offset: usize,
}

/// Split `---` fenced frontmatter off a Markdown document. Returns the byte
/// range between the fences and the offset where the body starts.
pub fn split_frontmatter(text: &str) -> Option<(Range<usize>, usize)> {
    let after_open = if text.starts_with("---\n") {
        4
    } else if text.starts_with("---\r\n") {
        5
    } else {
        return None;
    };

    let mut offset = after_open;
    for line in text[after_open..].split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            let inner = after_open..offset;
            let body_start = offset + line.len();
            return Some((inner, body_start));
        }
        offset += line.len();
    }
    None
}

// ============================================================================
// Markdown blocks
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MdBlock {
    /// Byte range within the scanned body text.
    pub range: Range<usize>,
    pub text: String,
    /// Info string for fenced code blocks.
    pub fence_info: Option<String>,
}

/// Top-level block segmentation of a Markdown body.
pub fn markdown_blocks(body: &str) -> Vec<MdBlock> {
    let parser = MdParser::new_ext(body, Options::empty());
    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut end = 0usize;
    let mut fence_info: Option<String> = None;

    for (event, range) in parser.into_offset_iter() {
        match event {
            Event::Start(tag) => {
                if depth == 0 {
                    start = range.start;
                    end = range.end;
                    fence_info = match &tag {
                        Tag::CodeBlock(CodeBlockKind::Fenced(info)) => Some(info.to_string()),
                        _ => None,
                    };
                }
                depth += 1;
                end = end.max(range.end);
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                end = end.max(range.end);
                if depth == 0 {
                    blocks.push(MdBlock {
                        range: start..end,
                        text: body[start..end].trim_end().to_string(),
                        fence_info: fence_info.take(),
                    });
                }
            }
            Event::Rule if depth == 0 => {
                blocks.push(MdBlock {
                    range: range.clone(),
                    text: body[range].trim_end().to_string(),
                    fence_info: None,
                });
            }
            _ => {
                end = end.max(range.end);
            }
        }
    }

    blocks
}

/// The content of a fenced block, without the fences themselves.
pub fn fenced_content(block: &MdBlock) -> String {
    let mut lines: Vec<&str> = block.text.lines().collect();
    if lines
        .first()
        .map(|l| l.trim_start().starts_with("```") || l.trim_start().starts_with("~~~"))
        .unwrap_or(false)
    {
        lines.remove(0);
    }
    if lines
        .last()
        .map(|l| l.trim() == "```" || l.trim() == "~~~")
        .unwrap_or(false)
    {
        lines.pop();
    }
    lines.join("\n")
}

// ============================================================================
// Parsed documents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Yaml,
    Markdown,
}

/// Format by file extension; anything else is not ours to govern.
pub fn format_for_path(path: &str) -> Option<DocFormat> {
    if path.ends_with(".yaml") || path.ends_with(".yml") {
        Some(DocFormat::Yaml)
    } else if path.ends_with(".md") || path.ends_with(".markdown") {
        Some(DocFormat::Markdown)
    } else {
        None
    }
}

/// A document parsed once per `uri + version`, shared by every feature.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    pub version: i32,
    pub format: DocFormat,
    /// Whole-file tree for YAML documents.
    pub yaml: Option<Tree>,
    /// Frontmatter sub-document for Markdown.
    pub frontmatter: Option<ParsedFrontmatter>,
    /// Where the Markdown body starts (0 for YAML).
    pub body_offset: usize,
}

impl ParsedDocument {
    pub fn parse(format: DocFormat, text: String, version: i32) -> CoreResult<ParsedDocument> {
        match format {
            DocFormat::Yaml => {
                let tree = parse_yaml(&text)?;
                Ok(ParsedDocument {
                    text,
                    version,
                    format,
                    yaml: Some(tree),
                    frontmatter: None,
                    body_offset: 0,
                })
            }
            DocFormat::Markdown => {
                let mut frontmatter = None;
                let mut body_offset = 0;
                if let Some((inner, body_start)) = split_frontmatter(&text) {
                    let source = text[inner.clone()].to_string();
                    let tree = parse_yaml(&source)?;
                    let line_offset = text[..inner.start].lines().count();
                    frontmatter = Some(ParsedFrontmatter {
                        source,
                        tree,
                        byte_range: inner,
                        line_offset,
                    });
                    body_offset = body_start;
                }
                Ok(ParsedDocument {
                    text,
                    version,
                    format,
                    yaml: None,
                    frontmatter,
                    body_offset,
                })
            }
        }
    }

    pub fn body(&self) -> &str {
        &self.text[self.body_offset..]
    }

    /// Frontmatter fields as a field set, if any.
    pub fn frontmatter_fields(&self) -> CoreResult<FieldSet> {
        let Some(fm) = &self.frontmatter else {
            return Ok(FieldSet::new());
        };
        match root_content(&fm.tree) {
            Some(node) => match yaml_node_value(node, &fm.source)? {
                FieldValue::Entity(fields) => Ok(fields),
                _ => Err(CoreError::ParseFailed("frontmatter must be a mapping".into())),
            },
            None => Ok(FieldSet::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_language_loads() {
        let lang = language_yaml();
        assert!(lang.node_kind_count() > 0);
    }

    #[test]
    fn test_parse_simple_mapping() {
        let src = "title: Hello\nstatus: todo\n";
        let tree = parse_yaml(src).unwrap();
        let root = root_content(&tree).unwrap();
        assert_eq!(root.kind(), "block_mapping");

        let FieldValue::Entity(fields) = yaml_node_value(root, src).unwrap() else {
            panic!("expected mapping");
        };
        assert_eq!(fields["title"], FieldValue::String("Hello".into()));
        assert_eq!(fields["status"], FieldValue::String("todo".into()));
    }

    #[test]
    fn test_scalar_kinds() {
        let src = "count: 3\nratio: 1.5\ndone: true\nempty: null\nname: 'quoted'\n";
        let tree = parse_yaml(src).unwrap();
        let FieldValue::Entity(fields) = yaml_node_value(root_content(&tree).unwrap(), src).unwrap()
        else {
            panic!("expected mapping");
        };
        assert_eq!(fields["count"], FieldValue::Number(3.0));
        assert_eq!(fields["ratio"], FieldValue::Number(1.5));
        assert_eq!(fields["done"], FieldValue::Bool(true));
        assert_eq!(fields["empty"], FieldValue::Null);
        assert_eq!(fields["name"], FieldValue::String("quoted".into()));
    }

    #[test]
    fn test_sequence_value() {
        let src = "tags:\n  - a\n  - b\n";
        let tree = parse_yaml(src).unwrap();
        let FieldValue::Entity(fields) = yaml_node_value(root_content(&tree).unwrap(), src).unwrap()
        else {
            panic!("expected mapping");
        };
        assert_eq!(
            fields["tags"],
            FieldValue::List(vec![
                FieldValue::String("a".into()),
                FieldValue::String("b".into())
            ])
        );
    }

    #[test]
    fn test_duplicate_key_conflict() {
        let src = "title: One\ntitle: Two\n";
        let tree = parse_yaml(src).unwrap();
        let err = yaml_node_value(root_content(&tree).unwrap(), src).unwrap_err();
        assert_eq!(
            err,
            CoreError::FieldConflict {
                path: "title".into()
            }
        );
    }

    #[test]
    fn test_duplicate_key_same_value_is_tolerated() {
        let src = "title: One\ntitle: One\n";
        let tree = parse_yaml(src).unwrap();
        assert!(yaml_node_value(root_content(&tree).unwrap(), src).is_ok());
    }

    #[test]
    fn test_empty_document_has_no_content() {
        let tree = parse_yaml("").unwrap();
        assert!(root_content(&tree).is_none());
    }

    #[test]
    fn test_split_frontmatter() {
        let text = "---\ntitle: Hello\n---\n\n# Body\n";
        let (inner, body_start) = split_frontmatter(text).unwrap();
        assert_eq!(&text[inner], "title: Hello\n");
        assert_eq!(&text[body_start..], "\n# Body\n");
    }

    #[test]
    fn test_no_frontmatter() {
        assert!(split_frontmatter("# Just a heading\n").is_none());
        assert!(split_frontmatter("---\nnever closed\n").is_none());
    }

    #[test]
    fn test_markdown_blocks_top_level() {
        let body = "# Title\n\nFirst paragraph.\n\n```query\nname: x\n```\n";
        let blocks = markdown_blocks(body);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].text, "# Title");
        assert_eq!(blocks[1].text, "First paragraph.");
        assert_eq!(blocks[2].fence_info.as_deref(), Some("query"));
        assert_eq!(fenced_content(&blocks[2]), "name: x");
    }

    #[test]
    fn test_markdown_block_ranges_cover_source() {
        let body = "# Title\n\nBody text here.\n";
        let blocks = markdown_blocks(body);
        assert_eq!(body[blocks[0].range.clone()].trim_end(), "# Title");
        assert!(body[blocks[1].range.clone()].starts_with("Body text"));
    }

    #[test]
    fn test_parsed_markdown_document() {
        let text = "---\ntitle: Hello\nstatus: todo\n---\n\n# Hello\n".to_string();
        let doc = ParsedDocument::parse(DocFormat::Markdown, text, 1).unwrap();
        let fm = doc.frontmatter.as_ref().unwrap();
        assert_eq!(fm.line_offset, 1);
        let fields = doc.frontmatter_fields().unwrap();
        assert_eq!(fields["title"], FieldValue::String("Hello".into()));
        assert!(doc.body().contains("# Hello"));
    }

    #[test]
    fn test_format_for_path() {
        assert_eq!(format_for_path("a/b.yaml"), Some(DocFormat::Yaml));
        assert_eq!(format_for_path("a/b.yml"), Some(DocFormat::Yaml));
        assert_eq!(format_for_path("a/b.md"), Some(DocFormat::Markdown));
        assert_eq!(format_for_path("a/b.txt"), None);
    }

    #[test]
    fn test_block_scalar_dedents() {
        let src = "text: |\n  line one\n  line two\n";
        let tree = parse_yaml(src).unwrap();
        let FieldValue::Entity(fields) = yaml_node_value(root_content(&tree).unwrap(), src).unwrap()
        else {
            panic!("expected mapping");
        };
        assert_eq!(
            fields["text"],
            FieldValue::String("line one\nline two".into())
        );
    }
}
