//! Entity resolution: deciding which graph entity each extracted entity is.
//!
//! The context fetch turns a navigation rule plus path fields into a bounded
//! candidate search; the mapping step then pairs extracted entities with
//! candidates, by claimed uid first and by similarity matching after.

use std::collections::BTreeMap;

use tracing::debug;

use crate::diff::match_entities;
use crate::error::CoreResult;
use crate::extract::{ExtractedContent, Projection};
use crate::fields::{FieldSet, FieldValue, FIELD_TYPE};
use crate::interpolate::{interpolate, interpolate_filters};
use crate::navigation::NavigationItem;
use crate::store::{Entity, GraphStore, SearchQuery};

/// How one extracted entity maps onto the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityMapping {
    Matched {
        uid: String,
        entity_type: Option<String>,
    },
    New {
        entity_type: Option<String>,
    },
}

impl EntityMapping {
    pub fn uid(&self) -> Option<&str> {
        match self {
            EntityMapping::Matched { uid, .. } => Some(uid),
            EntityMapping::New { .. } => None,
        }
    }
}

/// Mappings for a whole document, shaped like its extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentMappings {
    Single(EntityMapping),
    List(Vec<EntityMapping>),
    Document {
        root: EntityMapping,
        projections: Vec<Vec<EntityMapping>>,
    },
}

/// Graph candidates for one document, with the filters that selected them.
/// The filters double as the path-derived fields a created entity inherits.
#[derive(Debug, Clone, Default)]
pub struct EntityContext {
    pub entities: Vec<Entity>,
    pub filters: BTreeMap<String, String>,
}

/// Candidates for one embedded projection.
#[derive(Debug, Clone, Default)]
pub struct ProjectionContext {
    pub name: String,
    pub entities: Vec<Entity>,
    pub filters: BTreeMap<String, String>,
}

fn path_field_set(path_fields: &BTreeMap<String, String>) -> FieldSet {
    path_fields
        .iter()
        .map(|(k, v)| (k.clone(), FieldValue::String(v.clone())))
        .collect()
}

/// Resolve the document's selection filters from its navigation rule and the
/// fields captured from its path.
pub fn document_filters(
    rule: &NavigationItem,
    path_fields: &BTreeMap<String, String>,
) -> CoreResult<BTreeMap<String, String>> {
    let local = path_field_set(path_fields);
    if let Some(includes) = &rule.includes {
        let mut filters = BTreeMap::new();
        for (key, template) in includes {
            filters.insert(key.clone(), interpolate(template, &local, &[])?);
        }
        return Ok(filters);
    }
    if let Some(query) = &rule.query {
        return interpolate_filters(&query.as_text(), &local, &[]);
    }
    Ok(path_fields.clone())
}

/// Fetch the graph candidates a document resolves against. An empty result
/// is a valid context: everything in the document is new.
pub async fn fetch_entity_context(
    store: &dyn GraphStore,
    namespace: &str,
    rule: &NavigationItem,
    path_fields: &BTreeMap<String, String>,
) -> CoreResult<EntityContext> {
    let filters = document_filters(rule, path_fields)?;
    let entities = store
        .search(&SearchQuery::from_filters(filters.clone()), Some(namespace))
        .await?;
    debug!(candidates = entities.len(), ?filters, "fetched entity context");
    Ok(EntityContext { entities, filters })
}

/// Fetch candidates for one embedded projection. The projection query may
/// reference fields of the enclosing document (`{key}`) or of ancestor
/// contexts (`{parent.field}`).
pub async fn fetch_projection_context(
    store: &dyn GraphStore,
    namespace: &str,
    projection: &Projection,
    local: &FieldSet,
    ancestors: &[&FieldSet],
) -> CoreResult<ProjectionContext> {
    let filters = interpolate_filters(&projection.query, local, ancestors)?;
    let entities = store
        .search(&SearchQuery::from_filters(filters.clone()), Some(namespace))
        .await?;
    Ok(ProjectionContext {
        name: projection.name.clone(),
        entities,
        filters,
    })
}

/// Map a single-shaped document onto its candidates.
///
/// A claimed uid is adopted only while the graph still has that entity; a
/// stale uid falls through to the positional rules below. Without a live
/// claim, exactly one candidate means the document is that entity; zero or
/// several mean the document describes a new entity rather than guessing
/// among look-alikes.
pub fn compute_single_mapping(extracted: &Entity, context: &EntityContext) -> EntityMapping {
    let default_type = extracted
        .entity_type
        .clone()
        .or_else(|| context.filters.get(FIELD_TYPE).cloned());

    if let Some(uid) = &extracted.uid {
        if let Some(candidate) = context
            .entities
            .iter()
            .find(|e| e.uid.as_deref() == Some(uid))
        {
            return EntityMapping::Matched {
                uid: uid.clone(),
                entity_type: candidate.entity_type.clone().or(default_type),
            };
        }
    }

    if context.entities.len() == 1 {
        if let Some(uid) = context.entities[0].uid.clone() {
            return EntityMapping::Matched {
                uid,
                entity_type: context.entities[0].entity_type.clone().or(default_type),
            };
        }
    }
    EntityMapping::New {
        entity_type: default_type,
    }
}

/// Map a list of extracted entities onto candidates: claimed uids first,
/// then similarity matching over what remains.
pub fn compute_list_mappings(
    extracted: &[Entity],
    context: &EntityContext,
) -> Vec<EntityMapping> {
    let default_type = context.filters.get(FIELD_TYPE).cloned();
    let own_or_default =
        |e: &Entity| e.entity_type.clone().or_else(|| default_type.clone());

    let mut mappings: Vec<Option<EntityMapping>> = vec![None; extracted.len()];
    let mut taken = vec![false; context.entities.len()];

    // A claimed uid is honored only while the graph still has it; a stale
    // claim falls through to similarity matching with the rest.
    for (i, entity) in extracted.iter().enumerate() {
        let Some(uid) = &entity.uid else { continue };
        let found = context
            .entities
            .iter()
            .position(|c| c.uid.as_deref() == Some(uid));
        if let Some(j) = found {
            taken[j] = true;
            mappings[i] = Some(EntityMapping::Matched {
                uid: uid.clone(),
                entity_type: context.entities[j]
                    .entity_type
                    .clone()
                    .or_else(|| own_or_default(entity)),
            });
        }
    }

    // Similarity matching over the unclaimed remainder, with original
    // indices preserved so determinism rules apply to document order.
    let new_indices: Vec<usize> = (0..extracted.len())
        .filter(|&i| mappings[i].is_none())
        .collect();
    let old_indices: Vec<usize> = (0..context.entities.len())
        .filter(|&j| !taken[j])
        .collect();
    let new_subset: Vec<Entity> = new_indices.iter().map(|&i| extracted[i].clone()).collect();
    let old_subset: Vec<Entity> = old_indices
        .iter()
        .map(|&j| context.entities[j].clone())
        .collect();

    let matched = match_entities(&new_subset, &old_subset);
    for (sub_new, sub_old) in matched.pairs {
        let i = new_indices[sub_new];
        let candidate = &context.entities[old_indices[sub_old]];
        if let Some(uid) = candidate.uid.clone() {
            mappings[i] = Some(EntityMapping::Matched {
                uid,
                entity_type: candidate
                    .entity_type
                    .clone()
                    .or_else(|| own_or_default(&extracted[i])),
            });
        }
    }

    mappings
        .into_iter()
        .enumerate()
        .map(|(i, m)| {
            m.unwrap_or_else(|| EntityMapping::New {
                entity_type: own_or_default(&extracted[i]),
            })
        })
        .collect()
}

/// Map a whole extraction, shaped like it.
pub fn compute_mappings(
    extracted: &ExtractedContent,
    context: &EntityContext,
    projection_contexts: &[ProjectionContext],
) -> DocumentMappings {
    match extracted {
        ExtractedContent::Single(entity) => {
            DocumentMappings::Single(compute_single_mapping(entity, context))
        }
        ExtractedContent::List(entities) => {
            DocumentMappings::List(compute_list_mappings(entities, context))
        }
        ExtractedContent::Document { root, projections } => {
            let root_mapping = compute_single_mapping(root, context);
            let projection_mappings = projections
                .iter()
                .map(|projection| {
                    let ctx = projection_contexts
                        .iter()
                        .find(|c| c.name == projection.name);
                    match ctx {
                        Some(ctx) => {
                            let list_ctx = EntityContext {
                                entities: ctx.entities.clone(),
                                filters: ctx.filters.clone(),
                            };
                            compute_list_mappings(&projection.entities, &list_ctx)
                        }
                        None => projection
                            .entities
                            .iter()
                            .map(|e| EntityMapping::New {
                                entity_type: e.entity_type.clone(),
                            })
                            .collect(),
                    }
                })
                .collect();
            DocumentMappings::Document {
                root: root_mapping,
                projections: projection_mappings,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGraph;

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
    fn test_single_mapping_claimed_uid_wins() {
        let ctx = context(
            vec![entity(Some("e1"), Some("Project"), "Acme")],
            &[("type", "Project")],
        );
        let doc = entity(Some("e1"), None, "Renamed");
        assert_eq!(
            compute_single_mapping(&doc, &ctx),
            EntityMapping::Matched {
                uid: "e1".into(),
                entity_type: Some("Project".into())
            }
        );
    }

    #[test]
    fn test_single_mapping_lone_candidate_assumed() {
        let ctx = context(
            vec![entity(Some("e1"), Some("Project"), "Acme")],
            &[("type", "Project"), ("key", "acme")],
        );
        let doc = entity(None, None, "Acme");
        assert!(matches!(
            compute_single_mapping(&doc, &ctx),
            EntityMapping::Matched { uid, .. } if uid == "e1"
        ));
    }

    #[test]
    fn test_single_mapping_ambiguous_is_new() {
        let ctx = context(
            vec![
                entity(Some("e1"), Some("Project"), "Acme"),
                entity(Some("e2"), Some("Project"), "Acme Two"),
            ],
            &[("type", "Project")],
        );
        let doc = entity(None, None, "Acme");
        assert_eq!(
            compute_single_mapping(&doc, &ctx),
            EntityMapping::New {
                entity_type: Some("Project".into())
            }
        );
    }

    #[test]
    fn test_list_mappings_mix_of_claimed_and_matched() {
        let ctx = context(
            vec![
                entity(Some("e1"), Some("Task"), "Write the report"),
                entity(Some("e2"), Some("Task"), "File expenses"),
            ],
            &[("type", "Task")],
        );
        let extracted = vec![
            entity(Some("e2"), None, "File expenses"),
            entity(None, None, "Write the report"),
            entity(None, None, "Totally new task"),
        ];
        let mappings = compute_list_mappings(&extracted, &ctx);
        assert_eq!(mappings[0].uid(), Some("e2"));
        assert_eq!(mappings[1].uid(), Some("e1"));
        assert_eq!(
            mappings[2],
            EntityMapping::New {
                entity_type: Some("Task".into())
            }
        );
    }

    #[test]
    fn test_list_mappings_empty_context_all_new() {
        let ctx = context(Vec::new(), &[("type", "Task")]);
        let extracted = vec![entity(None, None, "One"), entity(None, Some("Bug"), "Two")];
        let mappings = compute_list_mappings(&extracted, &ctx);
        assert_eq!(
            mappings[0],
            EntityMapping::New {
                entity_type: Some("Task".into())
            }
        );
        assert_eq!(
            mappings[1],
            EntityMapping::New {
                entity_type: Some("Bug".into())
            }
        );
    }

    #[test]
    fn test_list_mapping_stale_uid_falls_through_to_new() {
        let ctx = context(Vec::new(), &[("type", "Task")]);
        let extracted = vec![entity(Some("ghost-uid"), None, "Orphaned")];
        let mappings = compute_list_mappings(&extracted, &ctx);
        assert_eq!(
            mappings[0],
            EntityMapping::New {
                entity_type: Some("Task".into())
            }
        );
    }

    #[test]
    fn test_list_mapping_stale_uid_can_still_match_by_similarity() {
        let ctx = context(
            vec![entity(Some("e9"), Some("Task"), "File expenses")],
            &[("type", "Task")],
        );
        let extracted = vec![entity(Some("ghost-uid"), None, "File expenses")];
        let mappings = compute_list_mappings(&extracted, &ctx);
        assert_eq!(mappings[0].uid(), Some("e9"));
    }

    #[test]
    fn test_single_mapping_stale_uid_adopts_lone_candidate() {
        let ctx = context(
            vec![entity(Some("e1"), Some("Project"), "Acme")],
            &[("type", "Project"), ("key", "acme")],
        );
        let doc = entity(Some("ghost-uid"), None, "Acme");
        assert!(matches!(
            compute_single_mapping(&doc, &ctx),
            EntityMapping::Matched { uid, .. } if uid == "e1"
        ));
    }

    #[test]
    fn test_document_filters_from_includes() {
        let rule: NavigationItem = serde_yaml::from_str(
            r#"
path: projects/{key}.yaml
includes:
  type: Project
  key: "{key}"
"#,
        )
        .unwrap();
        let mut path_fields = BTreeMap::new();
        path_fields.insert("key".to_string(), "acme".to_string());
        let filters = document_filters(&rule, &path_fields).unwrap();
        assert_eq!(filters["type"], "Project");
        assert_eq!(filters["key"], "acme");
    }

    #[test]
    fn test_document_filters_from_query() {
        let rule: NavigationItem = serde_yaml::from_str(
            r#"
path: projects/{key}/tasks.yaml
query: "type=Task AND project={key}"
"#,
        )
        .unwrap();
        let mut path_fields = BTreeMap::new();
        path_fields.insert("key".to_string(), "acme".to_string());
        let filters = document_filters(&rule, &path_fields).unwrap();
        assert_eq!(filters["type"], "Task");
        assert_eq!(filters["project"], "acme");
    }

    #[tokio::test]
    async fn test_fetch_entity_context_empty_is_ok() {
        let graph = InMemoryGraph::new();
        let rule: NavigationItem =
            serde_yaml::from_str("path: x/{key}.yaml\nquery: \"type=Task\"").unwrap();
        let ctx = fetch_entity_context(&graph, "content", &rule, &BTreeMap::new())
            .await
            .unwrap();
        assert!(ctx.entities.is_empty());
        assert_eq!(ctx.filters["type"], "Task");
    }
}
