//! Diffing: extracted entity trees against graph candidates, down to the
//! minimal create/update set.
//!
//! Matching is two-pass. Pass one trusts document order: an extracted entity
//! strongly similar to the candidate at the same index keeps its position.
//! Pass two greedily pairs what remains, in document order, taking the best
//! candidate above the fallback threshold and breaking score ties toward the
//! earliest candidate so repeated runs agree.

use std::collections::{BTreeMap, VecDeque};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::extract::ExtractedContent;
use crate::fields::{is_system_field, FieldSet, FieldValue, FIELD_TYPE};
use crate::interpolate::split_filters;
use crate::mapping::{DocumentMappings, EntityContext, EntityMapping, ProjectionContext};
use crate::store::{Changeset, Entity};

pub const TYPE_WEIGHT: f64 = 0.2;
pub const CONTENT_WEIGHT: f64 = 0.5;
pub const STRUCTURE_WEIGHT: f64 = 0.3;

/// Pass one: same-index candidates above this keep their position.
pub const POSITION_MATCH_THRESHOLD: f64 = 0.5;
/// Pass two: best remaining candidate must clear this to pair at all.
pub const FALLBACK_MATCH_THRESHOLD: f64 = 0.3;

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j] + cost)
                .min(prev[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

fn content_score(new: &Entity, old: &Entity) -> f64 {
    match (new.content_key(), old.content_key()) {
        (None, None) => 1.0,
        (None, _) | (_, None) => 0.0,
        (Some(a), Some(b)) => {
            let max = a.chars().count().max(b.chars().count());
            if max == 0 {
                1.0
            } else {
                1.0 - levenshtein(a, b) as f64 / max as f64
            }
        }
    }
}

fn structure_score(new: &Entity, old: &Entity) -> f64 {
    let a = new.nested_len();
    let b = old.nested_len();
    if a == 0 && b == 0 {
        1.0
    } else {
        a.min(b) as f64 / a.max(b) as f64
    }
}

/// Weighted similarity in `[0, 1]`. Two entities with declared, differing
/// types never match, whatever their content looks like.
pub fn similarity(new: &Entity, old: &Entity) -> f64 {
    let type_score = match (new.entity_type.as_deref(), old.entity_type.as_deref()) {
        (Some(a), Some(b)) if a != b => return 0.0,
        _ => 1.0,
    };
    TYPE_WEIGHT * type_score
        + CONTENT_WEIGHT * content_score(new, old)
        + STRUCTURE_WEIGHT * structure_score(new, old)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListMatch {
    /// `(new_index, old_index)` pairs.
    pub pairs: Vec<(usize, usize)>,
    pub unmatched_new: Vec<usize>,
    pub unmatched_old: Vec<usize>,
}

pub fn match_entities(new: &[Entity], old: &[Entity]) -> ListMatch {
    let mut new_taken = vec![false; new.len()];
    let mut old_taken = vec![false; old.len()];
    let mut pairs = Vec::new();

    for i in 0..new.len().min(old.len()) {
        if similarity(&new[i], &old[i]) > POSITION_MATCH_THRESHOLD {
            pairs.push((i, i));
            new_taken[i] = true;
            old_taken[i] = true;
        }
    }

    for (i, entity) in new.iter().enumerate() {
        if new_taken[i] {
            continue;
        }
        let mut best: Option<(usize, f64)> = None;
        for (j, candidate) in old.iter().enumerate() {
            if old_taken[j] {
                continue;
            }
            let score = similarity(entity, candidate);
            if score <= FALLBACK_MATCH_THRESHOLD {
                continue;
            }
            // Strictly-better keeps ties on the earliest candidate.
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((j, score));
            }
        }
        if let Some((j, _)) = best {
            pairs.push((i, j));
            new_taken[i] = true;
            old_taken[j] = true;
        }
    }

    pairs.sort_unstable();
    ListMatch {
        pairs,
        unmatched_new: (0..new.len()).filter(|&i| !new_taken[i]).collect(),
        unmatched_old: (0..old.len()).filter(|&j| !old_taken[j]).collect(),
    }
}

/// The minimal field delta the graph needs to look like the document.
///
/// Only keys the document actually carries are compared: the document is a
/// partial view, so graph fields it never mentions are left alone. An
/// explicit null over a present graph value is a removal; null over
/// null-or-absent is nothing at all.
pub fn diff_fields(new: &FieldSet, old: &FieldSet) -> FieldSet {
    let mut delta = FieldSet::new();
    for (key, new_value) in new {
        if is_system_field(key) {
            continue;
        }
        let old_value = old.get(key).unwrap_or(&FieldValue::Null);
        if new_value.is_null() && old_value.is_null() {
            continue;
        }
        if new_value == old_value {
            continue;
        }
        delta.insert(key.clone(), new_value.clone());
    }
    delta
}

// ============================================================================
// Changeset computation
// ============================================================================

struct ChangeAccumulator {
    changes: Vec<Changeset>,
    /// Index into `changes` per updated uid, so repeated deltas merge.
    update_index: BTreeMap<String, usize>,
}

impl ChangeAccumulator {
    fn new() -> ChangeAccumulator {
        ChangeAccumulator {
            changes: Vec::new(),
            update_index: BTreeMap::new(),
        }
    }

    fn update(&mut self, uid: &str, delta: FieldSet) {
        if delta.is_empty() {
            return;
        }
        match self.update_index.get(uid) {
            Some(&at) => {
                if let Changeset::Update { fields, .. } = &mut self.changes[at] {
                    fields.extend(delta);
                }
            }
            None => {
                self.update_index
                    .insert(uid.to_string(), self.changes.len());
                self.changes.push(Changeset::Update {
                    uid: uid.to_string(),
                    fields: delta,
                });
            }
        }
    }

    fn create(&mut self, entity_type: String, fields: FieldSet) {
        self.changes.push(Changeset::Create {
            entity_type,
            fields,
        });
    }
}

fn inherited_type_for_items(entity: &Entity, fallback: Option<&str>) -> Option<String> {
    entity
        .query
        .as_deref()
        .and_then(|q| split_filters(q).get(FIELD_TYPE).cloned())
        .or_else(|| fallback.map(str::to_string))
}

/// Fields a create carries: path-derived filters first, overlaid with the
/// entity's own non-null fields. Nulls are omitted; creating a field as null
/// and not creating it are the same thing.
fn create_fields(entity: &Entity, filters: &BTreeMap<String, String>) -> FieldSet {
    let mut fields = FieldSet::new();
    for (key, value) in filters {
        if is_system_field(key) {
            continue;
        }
        fields.insert(key.clone(), FieldValue::String(value.clone()));
    }
    for (key, value) in &entity.fields {
        if is_system_field(key) || value.is_null() {
            continue;
        }
        fields.insert(key.clone(), value.clone());
    }
    fields
}

/// One step of the walk over nested collections. The queue drains
/// breadth-first, so entities are reconciled level by level, parents before
/// any of their children.
enum WorkItem<'a> {
    Pair {
        new: &'a Entity,
        old: &'a Entity,
    },
    Create {
        entity: &'a Entity,
        inherited_type: Option<String>,
        filters: BTreeMap<String, String>,
    },
}

/// Stand-in for a matched candidate the context no longer holds; diffing
/// against it treats every document field as changed.
static MISSING_CANDIDATE: Lazy<Entity> = Lazy::new(Entity::default);

fn find_candidate<'a>(context: &'a EntityContext, uid: &str) -> Option<&'a Entity> {
    context.entities.iter().find(|e| e.uid.as_deref() == Some(uid))
}

fn queue_mapped<'a>(
    queue: &mut VecDeque<WorkItem<'a>>,
    entity: &'a Entity,
    mapping: &EntityMapping,
    context: &'a EntityContext,
) {
    match mapping {
        EntityMapping::Matched { uid, .. } => {
            let old = find_candidate(context, uid).unwrap_or(&*MISSING_CANDIDATE);
            queue.push_back(WorkItem::Pair { new: entity, old });
        }
        EntityMapping::New { entity_type } => {
            queue.push_back(WorkItem::Create {
                entity,
                inherited_type: entity_type.clone(),
                filters: context.filters.clone(),
            });
        }
    }
}

fn queue_nested<'a>(
    queue: &mut VecDeque<WorkItem<'a>>,
    new: &'a [Entity],
    old: &'a [Entity],
    inherited_type: Option<String>,
) {
    let matched = match_entities(new, old);
    for (i, j) in matched.pairs {
        queue.push_back(WorkItem::Pair {
            new: &new[i],
            old: &old[j],
        });
    }
    for i in matched.unmatched_new {
        queue.push_back(WorkItem::Create {
            entity: &new[i],
            inherited_type: inherited_type.clone(),
            filters: BTreeMap::new(),
        });
    }
    // Entities that left the document are not deleted from the graph; the
    // document is a view, not the owner.
}

fn drain_queue<'a>(
    acc: &mut ChangeAccumulator,
    mut queue: VecDeque<WorkItem<'a>>,
) -> CoreResult<()> {
    while let Some(item) = queue.pop_front() {
        match item {
            WorkItem::Pair { new, old } => {
                if let Some(uid) = old.uid.as_deref().or(new.uid.as_deref()) {
                    acc.update(uid, diff_fields(&new.fields, &old.fields));
                }
                let pair_type = old
                    .entity_type
                    .clone()
                    .or_else(|| new.entity_type.clone());
                queue_nested(&mut queue, &new.children, &old.children, pair_type.clone());
                let item_type = inherited_type_for_items(new, pair_type.as_deref());
                queue_nested(&mut queue, &new.items, &old.items, item_type);
            }
            WorkItem::Create {
                entity,
                inherited_type,
                filters,
            } => {
                let entity_type = entity
                    .entity_type
                    .clone()
                    .or(inherited_type)
                    .ok_or_else(|| CoreError::FieldNotFound(FIELD_TYPE.to_string()))?;
                acc.create(entity_type.clone(), create_fields(entity, &filters));

                for child in &entity.children {
                    queue.push_back(WorkItem::Create {
                        entity: child,
                        inherited_type: Some(entity_type.clone()),
                        filters: BTreeMap::new(),
                    });
                }
                let item_type = inherited_type_for_items(entity, Some(&entity_type));
                for item in &entity.items {
                    queue.push_back(WorkItem::Create {
                        entity: item,
                        inherited_type: item_type.clone(),
                        filters: BTreeMap::new(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Compute the changesets that reconcile the graph with one document.
pub fn compute_changesets(
    extracted: &ExtractedContent,
    mappings: &DocumentMappings,
    context: &EntityContext,
    projection_contexts: &[ProjectionContext],
) -> CoreResult<Vec<Changeset>> {
    let mut acc = ChangeAccumulator::new();
    let mut queue = VecDeque::new();
    let mut projection_holder: Vec<EntityContext> = Vec::new();

    match (extracted, mappings) {
        (ExtractedContent::Single(entity), DocumentMappings::Single(mapping)) => {
            queue_mapped(&mut queue, entity, mapping, context);
        }
        (ExtractedContent::List(entities), DocumentMappings::List(list)) => {
            for (entity, mapping) in entities.iter().zip(list) {
                queue_mapped(&mut queue, entity, mapping, context);
            }
        }
        (
            ExtractedContent::Document { root, projections },
            DocumentMappings::Document {
                root: root_mapping,
                projections: projection_mappings,
            },
        ) => {
            queue_mapped(&mut queue, root, root_mapping, context);
            for projection in projections {
                let ctx = projection_contexts
                    .iter()
                    .find(|c| c.name == projection.name)
                    .cloned()
                    .unwrap_or_default();
                projection_holder.push(EntityContext {
                    entities: ctx.entities,
                    filters: ctx.filters,
                });
            }
            for ((projection, mappings), ctx) in projections
                .iter()
                .zip(projection_mappings)
                .zip(&projection_holder)
            {
                for (entity, mapping) in projection.entities.iter().zip(mappings) {
                    queue_mapped(&mut queue, entity, mapping, ctx);
                }
            }
        }
        _ => {
            return Err(CoreError::ParseFailed(
                "mappings do not match extraction shape".into(),
            ))
        }
    }

    drain_queue(&mut acc, queue)?;

    debug!(changes = acc.changes.len(), "computed changesets");
    Ok(acc.changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{compute_list_mappings, compute_mappings, compute_single_mapping};

    fn entity(uid: Option<&str>, entity_type: Option<&str>, title: &str) -> Entity {
        let mut fields = FieldSet::new();
        fields.insert("title".into(), FieldValue::String(title.into()));
        Entity {
            uid: uid.map(str::to_string),
            entity_type: entity_type.map(str::to_string),
            fields,
            ..Entity::default()
        }
    }

    fn context(entities: Vec<Entity>, filters: &[(&str, &str)]) -> EntityContext {
        EntityContext {
            entities,
            filters: filters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_similarity_bounds() {
        let a = entity(None, Some("Task"), "Write the report");
        let b = entity(None, Some("Task"), "Write that report");
        let score = similarity(&a, &b);
        assert!((0.0..=1.0).contains(&score));
        assert!(score > POSITION_MATCH_THRESHOLD);
        assert_eq!(similarity(&a, &a), 1.0);
    }

    #[test]
    fn test_type_disagreement_is_zero() {
        let a = entity(None, Some("Task"), "Same title");
        let b = entity(None, Some("Bug"), "Same title");
        assert_eq!(similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_missing_type_does_not_gate() {
        let a = entity(None, None, "Same title");
        let b = entity(None, Some("Task"), "Same title");
        assert_eq!(similarity(&a, &b), 1.0);
    }

    #[test]
    fn test_content_fallback_when_neither_has_key() {
        let a = Entity::default();
        let b = Entity::default();
        assert_eq!(similarity(&a, &b), 1.0);
    }

    #[test]
    fn test_structure_score_uses_nested_sizes() {
        let mut a = entity(None, None, "X");
        let mut b = entity(None, None, "X");
        a.children = vec![Entity::default(); 2];
        b.children = vec![Entity::default(); 4];
        let score = similarity(&a, &b);
        // 0.2 + 0.5 + 0.3 * (2/4)
        assert!((score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_match_pass_one_keeps_positions() {
        let new = vec![
            entity(None, None, "Alpha"),
            entity(None, None, "Beta"),
        ];
        let old = vec![
            entity(Some("e1"), None, "Alpha"),
            entity(Some("e2"), None, "Beta"),
        ];
        let matched = match_entities(&new, &old);
        assert_eq!(matched.pairs, vec![(0, 0), (1, 1)]);
        assert!(matched.unmatched_new.is_empty());
    }

    #[test]
    fn test_match_pass_two_recovers_reorder() {
        // Disjoint titles so the positional pass cannot claim either index.
        let new = vec![
            entity(None, None, "BBBB"),
            entity(None, None, "AAAA"),
        ];
        let old = vec![
            entity(Some("e1"), None, "AAAA"),
            entity(Some("e2"), None, "BBBB"),
        ];
        let matched = match_entities(&new, &old);
        assert!(matched.pairs.contains(&(0, 1)));
        assert!(matched.pairs.contains(&(1, 0)));
    }

    #[test]
    fn test_match_tie_breaks_to_earliest_candidate() {
        let new = vec![entity(None, None, "Same")];
        let mut decoy = entity(Some("e1"), None, "Other entirely");
        decoy.children = vec![Entity::default(); 2];
        let old = vec![
            decoy,
            entity(Some("e2"), None, "Same"),
            entity(Some("e3"), None, "Same"),
        ];
        // Pass one fails (index 0 is dissimilar); pass two finds e2 and e3
        // at equal score and must take the earliest.
        let matched = match_entities(&new, &old);
        assert_eq!(matched.pairs, vec![(0, 1)]);
        assert_eq!(matched.unmatched_old, vec![0, 2]);
    }

    #[test]
    fn test_matching_stability() {
        let new = vec![
            entity(None, None, "Aaa"),
            entity(None, None, "Bbb"),
            entity(None, None, "Ccc"),
        ];
        let old = vec![
            entity(Some("e1"), None, "Bbb"),
            entity(Some("e2"), None, "Aaa"),
            entity(Some("e3"), None, "Ccc"),
        ];
        let first = match_entities(&new, &old);
        for _ in 0..10 {
            assert_eq!(match_entities(&new, &old), first);
        }
    }

    #[test]
    fn test_diff_fields_minimal() {
        let mut new = FieldSet::new();
        new.insert("title".into(), FieldValue::String("New title".into()));
        new.insert("status".into(), FieldValue::String("todo".into()));
        let mut old = FieldSet::new();
        old.insert("title".into(), FieldValue::String("Old title".into()));
        old.insert("status".into(), FieldValue::String("todo".into()));
        old.insert("owner".into(), FieldValue::String("ada".into()));

        let delta = diff_fields(&new, &old);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta["title"], FieldValue::String("New title".into()));
    }

    #[test]
    fn test_diff_null_over_absent_is_noop() {
        let mut new = FieldSet::new();
        new.insert("status".into(), FieldValue::Null);
        let old = FieldSet::new();
        assert!(diff_fields(&new, &old).is_empty());
    }

    #[test]
    fn test_diff_null_over_present_is_removal() {
        let mut new = FieldSet::new();
        new.insert("status".into(), FieldValue::Null);
        let mut old = FieldSet::new();
        old.insert("status".into(), FieldValue::String("todo".into()));
        let delta = diff_fields(&new, &old);
        assert_eq!(delta["status"], FieldValue::Null);
    }

    #[test]
    fn test_diff_never_carries_system_fields() {
        let mut new = FieldSet::new();
        new.insert("uid".into(), FieldValue::String("e1".into()));
        new.insert("version".into(), FieldValue::Number(3.0));
        new.insert("title".into(), FieldValue::String("X".into()));
        let old = FieldSet::new();
        let delta = diff_fields(&new, &old);
        assert_eq!(delta.len(), 1);
        assert!(delta.contains_key("title"));
    }

    #[test]
    fn test_changesets_update_only_changed_entity() {
        let old = vec![
            entity(Some("e1"), Some("Task"), "Write the report"),
            entity(Some("e2"), Some("Task"), "File expenses"),
        ];
        let new = vec![
            entity(None, None, "Write the report, v2"),
            entity(None, None, "File expenses"),
        ];
        let ctx = context(old, &[("type", "Task")]);
        let extracted = ExtractedContent::List(new.clone());
        let mappings = DocumentMappings::List(compute_list_mappings(&new, &ctx));

        let changes = compute_changesets(&extracted, &mappings, &ctx, &[]).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0],
            Changeset::Update {
                uid: "e1".into(),
                fields: {
                    let mut f = FieldSet::new();
                    f.insert(
                        "title".into(),
                        FieldValue::String("Write the report, v2".into()),
                    );
                    f
                }
            }
        );
    }

    #[test]
    fn test_changesets_create_for_unmatched_new() {
        let ctx = context(Vec::new(), &[("type", "Task"), ("project", "acme")]);
        let new = vec![entity(None, None, "Fresh task")];
        let extracted = ExtractedContent::List(new.clone());
        let mappings = DocumentMappings::List(compute_list_mappings(&new, &ctx));

        let changes = compute_changesets(&extracted, &mappings, &ctx, &[]).unwrap();
        assert_eq!(changes.len(), 1);
        let Changeset::Create { entity_type, fields } = &changes[0] else {
            panic!("expected create");
        };
        assert_eq!(entity_type, "Task");
        assert_eq!(fields["title"], FieldValue::String("Fresh task".into()));
        assert_eq!(fields["project"], FieldValue::String("acme".into()));
        assert!(!fields.contains_key("type"));
    }

    #[test]
    fn test_creates_emitted_level_by_level() {
        // Both parents come out before either of their children.
        let mut a = entity(None, Some("Task"), "A");
        a.children = vec![entity(None, None, "A child")];
        let mut b = entity(None, Some("Task"), "B");
        b.children = vec![entity(None, None, "B child")];
        let ctx = context(Vec::new(), &[("type", "Task")]);
        let new = vec![a, b];
        let extracted = ExtractedContent::List(new.clone());
        let mappings = DocumentMappings::List(compute_list_mappings(&new, &ctx));

        let changes = compute_changesets(&extracted, &mappings, &ctx, &[]).unwrap();
        let titles: Vec<&FieldValue> = changes
            .iter()
            .map(|c| match c {
                Changeset::Create { fields, .. } => &fields["title"],
                other => panic!("expected create, got {other:?}"),
            })
            .collect();
        assert_eq!(
            titles,
            vec![
                &FieldValue::String("A".into()),
                &FieldValue::String("B".into()),
                &FieldValue::String("A child".into()),
                &FieldValue::String("B child".into()),
            ]
        );
    }

    #[test]
    fn test_create_without_resolvable_type_fails() {
        let ctx = context(Vec::new(), &[]);
        let new = vec![entity(None, None, "No type anywhere")];
        let extracted = ExtractedContent::List(new.clone());
        let mappings = DocumentMappings::List(compute_list_mappings(&new, &ctx));
        let err = compute_changesets(&extracted, &mappings, &ctx, &[]).unwrap_err();
        assert_eq!(err, CoreError::FieldNotFound("type".into()));
    }

    #[test]
    fn test_unchanged_document_yields_no_changes() {
        let graph = entity(Some("e1"), Some("Project"), "Acme");
        let ctx = context(vec![graph], &[("type", "Project"), ("key", "acme")]);
        let doc = entity(None, None, "Acme");
        let extracted = ExtractedContent::Single(doc.clone());
        let mappings = DocumentMappings::Single(compute_single_mapping(&doc, &ctx));
        let changes = compute_changesets(&extracted, &mappings, &ctx, &[]).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_nested_children_diffed_recursively() {
        let mut old_root = entity(Some("e1"), Some("Note"), "Root");
        old_root.children = vec![entity(Some("e2"), None, "Old child title")];
        let ctx = context(vec![old_root], &[("type", "Note")]);

        let mut new_root = entity(Some("e1"), None, "Root");
        new_root.children = vec![entity(None, None, "Old child title, edited")];
        let extracted = ExtractedContent::Single(new_root.clone());
        let mappings = DocumentMappings::Single(compute_single_mapping(&new_root, &ctx));

        let changes = compute_changesets(&extracted, &mappings, &ctx, &[]).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].uid(), Some("e2"));
    }

    #[test]
    fn test_projection_items_diff_against_their_context() {
        let root = entity(Some("e1"), Some("Project"), "Acme");
        let ctx = context(vec![root], &[("type", "Project"), ("key", "acme")]);
        let projection_ctx = ProjectionContext {
            name: "open_tasks".into(),
            entities: vec![entity(Some("e3"), Some("Task"), "Fix the bug")],
            filters: [("type".to_string(), "Task".to_string())].into_iter().collect(),
        };

        let extracted = ExtractedContent::Document {
            root: entity(None, None, "Acme"),
            projections: vec![crate::extract::Projection {
                name: "open_tasks".into(),
                query: "type=Task".into(),
                entities: vec![entity(Some("e3"), None, "Fix the bug, properly")],
                span: None,
            }],
        };
        let mappings = compute_mappings(&extracted, &ctx, std::slice::from_ref(&projection_ctx));
        let changes =
            compute_changesets(&extracted, &mappings, &ctx, &[projection_ctx]).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].uid(), Some("e3"));
    }

    #[test]
    fn test_repeated_updates_merge_per_uid() {
        let mut acc = ChangeAccumulator::new();
        let mut first = FieldSet::new();
        first.insert("title".into(), FieldValue::String("A".into()));
        let mut second = FieldSet::new();
        second.insert("status".into(), FieldValue::String("done".into()));
        acc.update("e1", first);
        acc.update("e1", second);
        assert_eq!(acc.changes.len(), 1);
        let Changeset::Update { fields, .. } = &acc.changes[0] else {
            panic!("expected update");
        };
        assert_eq!(fields.len(), 2);
    }
}
