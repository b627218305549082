//! Collaborator ports: the graph store and the file system, consumed behind
//! traits so the core never binds to a concrete backend. `InMemoryGraph`
//! backs the server binary until a remote store is wired in, and every test.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tower_lsp::async_trait;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::fields::{field_or_null, FieldSet, FieldValue, FIELD_TYPE, FIELD_UID};
use crate::schema::Schema;

/// Candidate lookups are bounded to cap latency; they are not cancellable
/// mid-flight.
pub const SEARCH_PAGE_SIZE: usize = 50;

/// One entity's data as a tree: its own fields plus the two nested-collection
/// containers. Used both for extracted document content (uid usually absent,
/// spans present) and for graph-fetched candidates (uid always present).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    pub uid: Option<String>,
    pub entity_type: Option<String>,
    pub fields: FieldSet,
    /// General child-block container.
    pub children: Vec<Entity>,
    /// Query-bound data container.
    pub items: Vec<Entity>,
    /// Query template of a parameterized block, when the entity carries one.
    pub query: Option<String>,
    /// Byte span in the source document, extracted side only.
    pub span: Option<Range<usize>>,
}

impl Entity {
    /// The content key used for similarity: title, then text content, then
    /// the query string.
    pub fn content_key(&self) -> Option<&str> {
        if let Some(title) = self.fields.get("title").and_then(FieldValue::as_str) {
            return Some(title);
        }
        if let Some(text) = self.fields.get("text").and_then(FieldValue::as_str) {
            return Some(text);
        }
        self.query.as_deref()
    }

    /// Total size of the nested collections, for structural similarity.
    pub fn nested_len(&self) -> usize {
        self.children.len() + self.items.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub filters: BTreeMap<String, String>,
    pub limit: usize,
}

impl SearchQuery {
    pub fn from_filters(filters: BTreeMap<String, String>) -> SearchQuery {
        SearchQuery {
            filters,
            limit: SEARCH_PAGE_SIZE,
        }
    }
}

/// A minimal create/update instruction derived from a diff. Never carries
/// system fields as plain changed values.
#[derive(Debug, Clone, PartialEq)]
pub enum Changeset {
    Create { entity_type: String, fields: FieldSet },
    Update { uid: String, fields: FieldSet },
}

impl Changeset {
    pub fn uid(&self) -> Option<&str> {
        match self {
            Changeset::Update { uid, .. } => Some(uid),
            Changeset::Create { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub changes: Vec<Changeset>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn search(
        &self,
        query: &SearchQuery,
        namespace: Option<&str>,
    ) -> CoreResult<Vec<Entity>>;

    async fn get_schema(&self, namespace: &str) -> CoreResult<Arc<Schema>>;

    async fn update(&self, tx: Transaction) -> CoreResult<()>;

    async fn version(&self) -> CoreResult<u64>;
}

/// File-system port for workspace configuration reads.
#[async_trait]
pub trait Vfs: Send + Sync {
    async fn read_to_string(&self, path: &Path) -> CoreResult<String>;
    async fn exists(&self, path: &Path) -> bool;
}

pub struct StdVfs;

#[async_trait]
impl Vfs for StdVfs {
    async fn read_to_string(&self, path: &Path) -> CoreResult<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoreError::Collaborator(format!("read {}: {e}", path.display())))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

// ============================================================================
// In-memory graph store
// ============================================================================

struct GraphState {
    /// Entity trees per namespace. Nested entities live inside their parent.
    entities: BTreeMap<String, Vec<Entity>>,
    schemas: BTreeMap<String, Arc<Schema>>,
    version: u64,
    next_uid: u64,
}

pub struct InMemoryGraph {
    state: RwLock<GraphState>,
}

pub const DEFAULT_NAMESPACE: &str = "content";

impl InMemoryGraph {
    pub fn new() -> InMemoryGraph {
        let mut schemas = BTreeMap::new();
        schemas.insert("config".to_string(), Arc::new(Schema::builtin_config()));
        InMemoryGraph {
            state: RwLock::new(GraphState {
                entities: BTreeMap::new(),
                schemas,
                version: 0,
                next_uid: 1,
            }),
        }
    }

    pub async fn set_schema(&self, namespace: &str, schema: Schema) {
        let mut state = self.state.write().await;
        state.schemas.insert(namespace.to_string(), Arc::new(schema));
    }

    /// Seed an entity tree, assigning uids where missing. Returns the root uid.
    pub async fn insert(&self, namespace: &str, mut entity: Entity) -> String {
        let mut state = self.state.write().await;
        assign_uids(&mut entity, &mut state.next_uid);
        let uid = entity.uid.clone().unwrap_or_default();
        state
            .entities
            .entry(namespace.to_string())
            .or_default()
            .push(entity);
        state.version += 1;
        uid
    }

    pub async fn get(&self, namespace: &str, uid: &str) -> Option<Entity> {
        let state = self.state.read().await;
        let roots = state.entities.get(namespace)?;
        for root in roots {
            if let Some(found) = find_by_uid(root, uid) {
                return Some(found.clone());
            }
        }
        None
    }
}

impl Default for InMemoryGraph {
    fn default() -> Self {
        InMemoryGraph::new()
    }
}

fn assign_uids(entity: &mut Entity, next: &mut u64) {
    if entity.uid.is_none() {
        entity.uid = Some(format!("e{next}"));
        *next += 1;
    }
    for child in entity.children.iter_mut().chain(entity.items.iter_mut()) {
        assign_uids(child, next);
    }
}

fn find_by_uid<'a>(entity: &'a Entity, uid: &str) -> Option<&'a Entity> {
    if entity.uid.as_deref() == Some(uid) {
        return Some(entity);
    }
    entity
        .children
        .iter()
        .chain(entity.items.iter())
        .find_map(|child| find_by_uid(child, uid))
}

fn find_by_uid_mut<'a>(entity: &'a mut Entity, uid: &str) -> Option<&'a mut Entity> {
    if entity.uid.as_deref() == Some(uid) {
        return Some(entity);
    }
    entity
        .children
        .iter_mut()
        .chain(entity.items.iter_mut())
        .find_map(|child| find_by_uid_mut(child, uid))
}

fn matches_filters(entity: &Entity, filters: &BTreeMap<String, String>) -> bool {
    filters.iter().all(|(key, expected)| {
        if key == FIELD_TYPE {
            entity.entity_type.as_deref() == Some(expected.as_str())
        } else if key == FIELD_UID {
            entity.uid.as_deref() == Some(expected.as_str())
        } else {
            field_or_null(&entity.fields, key).to_display_string() == *expected
        }
    })
}

fn collect_matches<'a>(
    entity: &'a Entity,
    filters: &BTreeMap<String, String>,
    out: &mut Vec<&'a Entity>,
) {
    if matches_filters(entity, filters) {
        out.push(entity);
    }
    for child in entity.children.iter().chain(entity.items.iter()) {
        collect_matches(child, filters, out);
    }
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    async fn search(
        &self,
        query: &SearchQuery,
        namespace: Option<&str>,
    ) -> CoreResult<Vec<Entity>> {
        let state = self.state.read().await;
        let ns = namespace.unwrap_or(DEFAULT_NAMESPACE);
        let mut matched = Vec::new();
        if let Some(roots) = state.entities.get(ns) {
            for root in roots {
                collect_matches(root, &query.filters, &mut matched);
            }
        }
        let limit = if query.limit == 0 { SEARCH_PAGE_SIZE } else { query.limit };
        Ok(matched.into_iter().take(limit).cloned().collect())
    }

    async fn get_schema(&self, namespace: &str) -> CoreResult<Arc<Schema>> {
        let state = self.state.read().await;
        state
            .schemas
            .get(namespace)
            .cloned()
            .ok_or_else(|| CoreError::NamespaceNotFound(namespace.to_string()))
    }

    async fn update(&self, tx: Transaction) -> CoreResult<()> {
        let mut state = self.state.write().await;
        for change in tx.changes {
            match change {
                Changeset::Create { entity_type, fields } => {
                    let uid = format!("e{}", state.next_uid);
                    state.next_uid += 1;
                    debug!(uid, entity_type, "creating entity");
                    state
                        .entities
                        .entry(DEFAULT_NAMESPACE.to_string())
                        .or_default()
                        .push(Entity {
                            uid: Some(uid),
                            entity_type: Some(entity_type),
                            fields,
                            ..Entity::default()
                        });
                }
                Changeset::Update { uid, fields } => {
                    let mut applied = false;
                    for roots in state.entities.values_mut() {
                        for root in roots.iter_mut() {
                            if let Some(target) = find_by_uid_mut(root, &uid) {
                                for (key, value) in &fields {
                                    if value.is_null() {
                                        target.fields.remove(key);
                                    } else {
                                        target.fields.insert(key.clone(), value.clone());
                                    }
                                }
                                applied = true;
                                break;
                            }
                        }
                        if applied {
                            break;
                        }
                    }
                    if !applied {
                        return Err(CoreError::Collaborator(format!(
                            "update references unknown entity '{uid}'"
                        )));
                    }
                }
            }
        }
        state.version += 1;
        Ok(())
    }

    async fn version(&self) -> CoreResult<u64> {
        Ok(self.state.read().await.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(title: &str) -> Entity {
        let mut fields = FieldSet::new();
        fields.insert("title".into(), FieldValue::String(title.into()));
        Entity {
            entity_type: Some("Task".into()),
            fields,
            ..Entity::default()
        }
    }

    #[tokio::test]
    async fn test_search_by_type_filter() {
        let graph = InMemoryGraph::new();
        graph.insert("content", task("One")).await;
        graph.insert("content", task("Two")).await;

        let mut filters = BTreeMap::new();
        filters.insert("type".into(), "Task".into());
        let found = graph
            .search(&SearchQuery::from_filters(filters), None)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_search_empty_result_is_not_an_error() {
        let graph = InMemoryGraph::new();
        let mut filters = BTreeMap::new();
        filters.insert("type".into(), "Task".into());
        let found = graph
            .search(&SearchQuery::from_filters(filters), None)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_search_descends_into_nested_collections() {
        let graph = InMemoryGraph::new();
        let mut root = task("Root");
        root.children.push(task("Nested"));
        graph.insert("content", root).await;

        let mut filters = BTreeMap::new();
        filters.insert("title".into(), "Nested".into());
        let found = graph
            .search(&SearchQuery::from_filters(filters), None)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].uid.is_some());
    }

    #[tokio::test]
    async fn test_update_merges_fields_and_null_removes() {
        let graph = InMemoryGraph::new();
        let uid = graph.insert("content", task("Old")).await;

        let mut fields = FieldSet::new();
        fields.insert("title".into(), FieldValue::String("New".into()));
        fields.insert("status".into(), FieldValue::String("done".into()));
        graph
            .update(Transaction {
                changes: vec![Changeset::Update { uid: uid.clone(), fields }],
            })
            .await
            .unwrap();

        let entity = graph.get("content", &uid).await.unwrap();
        assert_eq!(entity.fields["title"], FieldValue::String("New".into()));

        let mut clear = FieldSet::new();
        clear.insert("status".into(), FieldValue::Null);
        graph
            .update(Transaction {
                changes: vec![Changeset::Update { uid: uid.clone(), fields: clear }],
            })
            .await
            .unwrap();
        let entity = graph.get("content", &uid).await.unwrap();
        assert!(!entity.fields.contains_key("status"));
    }

    #[tokio::test]
    async fn test_update_unknown_uid_is_collaborator_error() {
        let graph = InMemoryGraph::new();
        let mut fields = FieldSet::new();
        fields.insert("title".into(), FieldValue::String("X".into()));
        let err = graph
            .update(Transaction {
                changes: vec![Changeset::Update { uid: "nope".into(), fields }],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Collaborator(_)));
    }

    #[tokio::test]
    async fn test_version_advances_on_update() {
        let graph = InMemoryGraph::new();
        let before = graph.version().await.unwrap();
        graph.insert("content", task("One")).await;
        let after = graph.version().await.unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_content_key_preference_order() {
        let mut entity = task("Title");
        entity.fields.insert("text".into(), FieldValue::String("Body".into()));
        entity.query = Some("type=Task".into());
        assert_eq!(entity.content_key(), Some("Title"));

        entity.fields.remove("title");
        assert_eq!(entity.content_key(), Some("Body"));

        entity.fields.remove("text");
        assert_eq!(entity.content_key(), Some("type=Task"));
    }
}
