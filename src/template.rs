//! Markdown document templates.
//!
//! A template is itself a Markdown file under `.notegraph/templates/`. Its
//! frontmatter may declare `preamble` fields (fields the document carries in
//! its own frontmatter); its body is a sequence of blocks where `{field}`
//! placeholders mark where entity content lives:
//!
//! - a block with text around the placeholder is a slot: it binds exactly one
//!   document block, with the surrounding text as fixed prefix/suffix,
//! - a block that is nothing but the placeholder is a free section: it binds
//!   every document block up to the next literal template block,
//! - a block without placeholders must appear verbatim in the document.

use std::ops::Range;

use crate::error::{CoreError, CoreResult};
use crate::parser::{markdown_blocks, split_frontmatter, MdBlock};

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateBlock {
    /// Fixed text the document must reproduce verbatim.
    Literal(String),
    /// One document block shaped `prefix + value + suffix`.
    Slot {
        field: String,
        prefix: String,
        suffix: String,
    },
    /// Consecutive document blocks until the next literal.
    Free { field: String },
}

#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    /// Fields the document declares in frontmatter rather than the body.
    pub preamble: Vec<String>,
    pub blocks: Vec<TemplateBlock>,
}

/// A template slot bound to a concrete region of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundSlot {
    pub field: String,
    /// Byte range of the captured value within the full document text.
    pub range: Range<usize>,
    pub text: String,
}

impl Template {
    pub fn parse(id: &str, source: &str) -> CoreResult<Template> {
        let (preamble, body) = match split_frontmatter(source) {
            Some((inner, body_start)) => {
                let fm: serde_yaml::Value = serde_yaml::from_str(&source[inner])
                    .map_err(|e| CoreError::ParseFailed(format!("template '{id}': {e}")))?;
                let names = match fm.get("preamble") {
                    Some(serde_yaml::Value::Sequence(seq)) => seq
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                    _ => Vec::new(),
                };
                (names, &source[body_start..])
            }
            None => (Vec::new(), source),
        };

        let mut blocks = Vec::new();
        for block in markdown_blocks(body) {
            blocks.push(parse_block(id, &block.text)?);
        }
        Ok(Template {
            id: id.to_string(),
            preamble,
            blocks,
        })
    }

    /// Every field the template binds, preamble first, in declaration order.
    pub fn fields(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.preamble.iter().map(String::as_str).collect();
        for block in &self.blocks {
            match block {
                TemplateBlock::Slot { field, .. } | TemplateBlock::Free { field } => {
                    out.push(field)
                }
                TemplateBlock::Literal(_) => {}
            }
        }
        out
    }

    /// Align the template against a document body, binding each slot to the
    /// region of text it captures. `body_offset` translates block ranges into
    /// full-document byte offsets. Fenced `query` blocks belong to the
    /// projection layer and are skipped during alignment.
    pub fn bind(&self, body: &str, body_offset: usize) -> CoreResult<Vec<BoundSlot>> {
        let doc_blocks: Vec<MdBlock> = markdown_blocks(body)
            .into_iter()
            .filter(|b| b.fence_info.as_deref() != Some("query"))
            .collect();

        let mut bound = Vec::new();
        let mut doc_index = 0usize;

        for (block_index, block) in self.blocks.iter().enumerate() {
            match block {
                TemplateBlock::Literal(expected) => {
                    let Some(doc_block) = doc_blocks.get(doc_index) else {
                        return Err(self.shape_error(format!(
                            "missing block '{expected}'"
                        )));
                    };
                    if doc_block.text.trim() != expected.trim() {
                        return Err(self.shape_error(format!(
                            "expected '{expected}', found '{}'",
                            doc_block.text
                        )));
                    }
                    doc_index += 1;
                }
                TemplateBlock::Slot {
                    field,
                    prefix,
                    suffix,
                } => {
                    let Some(doc_block) = doc_blocks.get(doc_index) else {
                        return Err(self.shape_error(format!("missing block for '{field}'")));
                    };
                    let text = doc_block.text.as_str();
                    if !text.starts_with(prefix.as_str()) || !text.ends_with(suffix.as_str()) {
                        return Err(self.shape_error(format!(
                            "block for '{field}' does not match '{prefix}…{suffix}'"
                        )));
                    }
                    let value = &text[prefix.len()..text.len() - suffix.len()];
                    let start = body_offset + doc_block.range.start + prefix.len();
                    bound.push(BoundSlot {
                        field: field.clone(),
                        range: start..start + value.len(),
                        text: value.to_string(),
                    });
                    doc_index += 1;
                }
                TemplateBlock::Free { field } => {
                    let stop = self.blocks[block_index + 1..].iter().find_map(|b| {
                        if let TemplateBlock::Literal(text) = b {
                            Some(text.trim())
                        } else {
                            None
                        }
                    });

                    let first = doc_index;
                    while doc_index < doc_blocks.len() {
                        if let Some(stop) = stop {
                            if doc_blocks[doc_index].text.trim() == stop {
                                break;
                            }
                        }
                        doc_index += 1;
                    }

                    let (range, text) = if first < doc_index {
                        let start = body_offset + doc_blocks[first].range.start;
                        let end = body_offset + doc_blocks[doc_index - 1].range.end;
                        let raw = &body[doc_blocks[first].range.start
                            ..doc_blocks[doc_index - 1].range.end];
                        (start..end, raw.trim_end().to_string())
                    } else {
                        // An empty section still gets a caret position.
                        let at = body_offset
                            + doc_blocks
                                .get(first)
                                .map(|b| b.range.start)
                                .unwrap_or(body.len());
                        (at..at, String::new())
                    };
                    bound.push(BoundSlot {
                        field: field.clone(),
                        range,
                        text,
                    });
                }
            }
        }

        if doc_index < doc_blocks.len() {
            return Err(self.shape_error(format!(
                "unexpected trailing block '{}'",
                doc_blocks[doc_index].text
            )));
        }
        Ok(bound)
    }

    fn shape_error(&self, detail: String) -> CoreError {
        CoreError::ParseFailed(format!("template '{}': {detail}", self.id))
    }
}

/// Classify one template block by its placeholders. At most one `{field}`
/// placeholder per block; `\{`/`\}` escape literal braces.
fn parse_block(id: &str, text: &str) -> CoreResult<TemplateBlock> {
    let mut literal = String::new();
    let mut placeholder: Option<(String, usize)> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some((_, '{')) | Some((_, '}')) => {
                    let (_, escaped) = chars.next().unwrap();
                    literal.push(escaped);
                }
                _ => literal.push('\\'),
            },
            '{' => {
                if placeholder.is_some() {
                    return Err(CoreError::ParseFailed(format!(
                        "template '{id}': multiple placeholders in one block"
                    )));
                }
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
                    return Err(CoreError::UnclosedBracket(text.to_string()));
                }
                if name.is_empty()
                    || !name
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(CoreError::InvalidPlaceholder(name));
                }
                placeholder = Some((name, literal.len()));
            }
            _ => literal.push(c),
        }
    }

    match placeholder {
        None => Ok(TemplateBlock::Literal(literal)),
        Some((field, split)) => {
            let prefix = literal[..split].to_string();
            let suffix = literal[split..].to_string();
            if prefix.is_empty() && suffix.is_empty() {
                Ok(TemplateBlock::Free { field })
            } else {
                Ok(TemplateBlock::Slot {
                    field,
                    prefix,
                    suffix,
                })
            }
        }
    }
}
