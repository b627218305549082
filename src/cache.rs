//! Version-keyed caches for per-document derived state.
//!
//! Parsing and context fetching are the expensive steps behind every
//! request, so both are cached per document and keyed by the versions they
//! were derived from: the editor's document version for parses, plus the
//! graph version for entity contexts. A lookup with a newer version evicts
//! the superseded entry instead of serving it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tower_lsp::lsp_types::Url;
use tracing::trace;

use crate::mapping::{EntityContext, ProjectionContext};
use crate::parser::ParsedDocument;

pub const DOCUMENT_CACHE_CAPACITY: usize = 64;
pub const CONTEXT_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

struct CachedDocument {
    version: i32,
    doc: Arc<ParsedDocument>,
}

/// Parsed documents per uri, valid for exactly one document version.
pub struct DocumentCache {
    entries: LruCache<Url, CachedDocument>,
    stats: CacheStats,
}

impl DocumentCache {
    pub fn new() -> DocumentCache {
        DocumentCache {
            entries: LruCache::new(
                NonZeroUsize::new(DOCUMENT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, uri: &Url, version: i32) -> Option<Arc<ParsedDocument>> {
        match self.entries.get(uri) {
            Some(entry) if entry.version == version => {
                self.stats.hits += 1;
                trace!(%uri, version, "document cache hit");
                Some(Arc::clone(&entry.doc))
            }
            Some(_) => {
                // Superseded by a newer edit.
                self.entries.pop(uri);
                self.stats.misses += 1;
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, uri: Url, version: i32, doc: Arc<ParsedDocument>) {
        self.entries.put(uri, CachedDocument { version, doc });
    }

    pub fn invalidate(&mut self, uri: &Url) {
        self.entries.pop(uri);
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

impl Default for DocumentCache {
    fn default() -> Self {
        DocumentCache::new()
    }
}

struct CachedContext {
    doc_version: i32,
    graph_version: u64,
    context: Arc<EntityContext>,
    projections: Arc<Vec<ProjectionContext>>,
}

/// Fetched entity contexts per uri, invalidated by either a document edit or
/// any graph write.
pub struct EntityContextCache {
    entries: LruCache<Url, CachedContext>,
    stats: CacheStats,
}

impl EntityContextCache {
    pub fn new() -> EntityContextCache {
        EntityContextCache {
            entries: LruCache::new(
                NonZeroUsize::new(CONTEXT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            stats: CacheStats::default(),
        }
    }

    pub fn get(
        &mut self,
        uri: &Url,
        doc_version: i32,
        graph_version: u64,
    ) -> Option<(Arc<EntityContext>, Arc<Vec<ProjectionContext>>)> {
        match self.entries.get(uri) {
            Some(entry)
                if entry.doc_version == doc_version && entry.graph_version == graph_version =>
            {
                self.stats.hits += 1;
                trace!(%uri, doc_version, graph_version, "context cache hit");
                Some((Arc::clone(&entry.context), Arc::clone(&entry.projections)))
            }
            Some(_) => {
                self.entries.pop(uri);
                self.stats.misses += 1;
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(
        &mut self,
        uri: Url,
        doc_version: i32,
        graph_version: u64,
        context: Arc<EntityContext>,
        projections: Arc<Vec<ProjectionContext>>,
    ) {
        self.entries.put(
            uri,
            CachedContext {
                doc_version,
                graph_version,
                context,
                projections,
            },
        );
    }

    pub fn invalidate(&mut self, uri: &Url) {
        self.entries.pop(uri);
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

impl Default for EntityContextCache {
    fn default() -> Self {
        EntityContextCache::new()
    }
}
