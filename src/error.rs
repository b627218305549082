//! Typed error values for the sync and language-service core.
//!
//! Errors are carried as values up the call chain, never as panics. The
//! taxonomy groups into document-shape mistakes (surfaced as diagnostics),
//! context gaps (logged low, features degrade to empty), ambiguity (blocks
//! one file's sync) and collaborator failures (passed through unchanged).

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    /// Configuration or document source does not match the expected shape.
    #[error("parse failed: {0}")]
    ParseFailed(String),

    /// A path did not match the template it is governed by.
    #[error("path '{path}' does not match template '{template}'")]
    PathTemplateMismatch { path: String, template: String },

    /// A `{` in a template has no matching `}`.
    #[error("unclosed '{{' in template '{0}'")]
    UnclosedBracket(String),

    /// A placeholder name matches neither the field nor the parent grammar.
    #[error("invalid placeholder '{{{0}}}'")]
    InvalidPlaceholder(String),

    /// The same field path is written in two locations with differing values.
    #[error("conflicting values for field '{path}'")]
    FieldConflict { path: String },

    /// No navigation item governs the given path.
    #[error("no navigation item matches '{0}'")]
    NavigationItemNotFound(String),

    /// The ancestor chain is shorter than a placeholder's referenced depth.
    #[error("no ancestor context at depth {depth}")]
    ContextNotFound { depth: usize },

    /// A referenced field is absent or null on its entity.
    #[error("field '{0}' not found")]
    FieldNotFound(String),

    /// The file's location belongs to no known namespace.
    #[error("unknown namespace '{0}'")]
    NamespaceNotFound(String),

    /// Path fields resolve to more than one candidate entity.
    #[error("path fields resolve to {count} entities, expected at most one")]
    InvalidNodeCount { count: usize },

    /// Graph store or file system failure, passed through unchanged.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// User-document mistakes that belong in diagnostics, never fatal.
    pub fn is_document_shape(&self) -> bool {
        matches!(
            self,
            CoreError::ParseFailed(_)
                | CoreError::PathTemplateMismatch { .. }
                | CoreError::UnclosedBracket(_)
                | CoreError::InvalidPlaceholder(_)
                | CoreError::FieldConflict { .. }
        )
    }

    /// Missing configuration or an as-yet-untracked file; handlers degrade
    /// to `None`/empty instead of raising.
    pub fn is_context(&self) -> bool {
        matches!(
            self,
            CoreError::NavigationItemNotFound(_)
                | CoreError::ContextNotFound { .. }
                | CoreError::FieldNotFound(_)
                | CoreError::NamespaceNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_errors_are_classified() {
        assert!(CoreError::ParseFailed("bad".into()).is_document_shape());
        assert!(CoreError::FieldConflict { path: "title".into() }.is_document_shape());
        assert!(!CoreError::FieldConflict { path: "title".into() }.is_context());
    }

    #[test]
    fn test_context_errors_are_classified() {
        assert!(CoreError::ContextNotFound { depth: 2 }.is_context());
        assert!(CoreError::NavigationItemNotFound("notes/x.md".into()).is_context());
        assert!(!CoreError::Collaborator("down".into()).is_context());
        assert!(!CoreError::InvalidNodeCount { count: 2 }.is_document_shape());
    }

    #[test]
    fn test_messages_name_the_offender() {
        let err = CoreError::PathTemplateMismatch {
            path: "notes/a.md".into(),
            template: "tasks/{key}.md".into(),
        };
        let text = err.to_string();
        assert!(text.contains("notes/a.md"));
        assert!(text.contains("tasks/{key}.md"));
    }
}
