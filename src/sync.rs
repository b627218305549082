//! Sync: push a document's state into the graph on save.
//!
//! The changesets come straight from the document context; sync only adds
//! the safety gate for single-entity documents and skips the store write
//! entirely when nothing changed, which is what makes saving twice in a row
//! a no-op.

use tracing::info;

use crate::context::DocumentContext;
use crate::error::{CoreError, CoreResult};
use crate::extract::ExtractedContent;
use crate::store::{GraphStore, Transaction};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub creates: usize,
    pub updates: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.creates == 0 && self.updates == 0
    }
}

/// Apply one document to the graph.
///
/// A single-entity document whose path selects several graph candidates and
/// which claims no uid of its own is refused: writing through it could hit
/// the wrong entity, and the fix (adding a uid, or tightening the query) is
/// the author's call.
pub async fn sync_document(
    ctx: &DocumentContext,
    store: &dyn GraphStore,
) -> CoreResult<SyncReport> {
    let extracted = ctx.extraction.as_ref().map_err(CoreError::clone)?;

    let single_shaped = matches!(
        extracted,
        ExtractedContent::Single(_) | ExtractedContent::Document { .. }
    );
    if single_shaped
        && ctx.rule.item.query.is_none()
        && extracted.claimed_uid().is_none()
        && ctx.entity_context.entities.len() > 1
    {
        return Err(CoreError::InvalidNodeCount {
            count: ctx.entity_context.entities.len(),
        });
    }

    let changes = ctx.changesets()?;
    if changes.is_empty() {
        return Ok(SyncReport::default());
    }

    let report = SyncReport {
        creates: changes.iter().filter(|c| c.uid().is_none()).count(),
        updates: changes.iter().filter(|c| c.uid().is_some()).count(),
    };
    info!(
        uri = %ctx.uri,
        creates = report.creates,
        updates = report.updates,
        "syncing document"
    );
    store.update(Transaction { changes }).await?;
    Ok(report)
}
