//! Eager loading of relationship paths for query results.
//!
//! One graph query per chunk of starting nodes returns every qualifying path
//! with the type label of its last node. Paths are walked shortest first; each
//! hop is matched to exactly one relationship descriptor of the current
//! model and recorded in both endpoints' relationship caches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::condition::LOOKUP_SEP;
use crate::cypher::{CypherBuilder, PathPattern, RelPattern, ReturnExpr};
use crate::error::{GraphOrmError, Result};
use crate::model::{Instance, Model, RelationshipDescriptor};
use crate::query::SelectRelated;
use crate::store::Store;
use crate::transport::{Direction, EdgeId, EdgeRecord, NodeId, Table, TypeSpec};
use crate::typegraph::{INSTANCE_REL, MARKER_ATTR};

/// One returned path: node ids from the start, the edges between them, and
/// the type of the last node.
#[derive(Debug)]
struct PathRow {
    nodes: Vec<NodeId>,
    edges: Vec<EdgeId>,
    label: TypeSpec,
}

/// Loads the relationships `mode` asks for into `instances`.
pub(crate) fn apply(store: &Store, alias: &str, instances: &[Instance], mode: &SelectRelated) -> Result<()> {
    if instances.is_empty() {
        return Ok(());
    }
    match mode {
        SelectRelated::None => Ok(()),
        SelectRelated::Depth(depth) => by_depth(store, alias, instances, *depth),
        SelectRelated::Fields(fields) => by_fields(store, alias, instances, fields),
    }
}

fn start_ids(instances: &[Instance]) -> Vec<NodeId> {
    let ids: BTreeSet<NodeId> = instances.iter().filter_map(Instance::id).collect();
    ids.into_iter().collect()
}

fn with_label(builder: CypherBuilder) -> CypherBuilder {
    builder
        .match_path(PathPattern::starting_at("m").step(RelPattern::single(INSTANCE_REL, Direction::In), Some("mt")))
        .returns(ReturnExpr::NodeIds("p".into()), Some("nodes"))
        .returns(ReturnExpr::RelIds("p".into()), Some("rels"))
        .returns(ReturnExpr::Property("mt".into(), "app_label".into()), Some("app_label"))
        .returns(ReturnExpr::Property("mt".into(), "model_name".into()), Some("model_name"))
}

fn by_depth(store: &Store, alias: &str, instances: &[Instance], depth: u32) -> Result<()> {
    let rel_types: Vec<String> = store.registry().rel_types().into_iter().collect();
    let transport = store.transport(alias)?;
    let mut rows = Vec::new();
    if !rel_types.is_empty() {
        for chunk in start_ids(instances).chunks(store.chunk_size()) {
            let builder = CypherBuilder::new().start_nodes("s", chunk.to_vec()).match_path(
                PathPattern::starting_at("s").named("p").step(
                    RelPattern::any_of(rel_types.iter().cloned(), Direction::Both).repeated(1, Some(depth)),
                    Some("m"),
                ),
            );
            let builder = with_label(builder).order_by(ReturnExpr::Length("p".into()), false);
            rows.extend(read_rows(&transport.cypher(&builder.build()?)?)?);
        }
    }
    rows.sort_by_key(|row| row.edges.len());
    let known = attach_rows(store, alias, instances, &rows)?;

    // Every edge of a node closer than `depth` lies on some returned path.
    let mut distance: BTreeMap<NodeId, usize> = start_ids(instances).into_iter().map(|id| (id, 0)).collect();
    for row in &rows {
        for (pos, node) in row.nodes.iter().enumerate() {
            let entry = distance.entry(*node).or_insert(pos);
            *entry = (*entry).min(pos);
        }
    }
    for (node, dist) in distance {
        if dist >= depth as usize {
            continue;
        }
        let Some(instance) = known.get(&node) else {
            continue;
        };
        for descriptor in instance.model().relationships() {
            instance.relation(&descriptor.attname)?.lock().mark_loaded();
        }
    }
    debug!(starts = instances.len(), paths = rows.len(), depth, "graphorm.select_related.depth");
    Ok(())
}

/// Descriptor a path segment names: an attribute-name match outranks a
/// relationship-type match.
fn best_match<'m>(model: &'m Model, segment: &str) -> Option<&'m RelationshipDescriptor> {
    let mut best: Option<(u8, &RelationshipDescriptor)> = None;
    for descriptor in model.relationships() {
        let score = 2 * u8::from(descriptor.attname == segment) + u8::from(descriptor.rel_type == segment);
        if score > 0 && best.map_or(true, |(top, _)| score > top) {
            best = Some((score, descriptor));
        }
    }
    best.map(|(_, descriptor)| descriptor)
}

fn resolve_field(store: &Store, model: &Arc<Model>, field: &str) -> Result<Vec<RelationshipDescriptor>> {
    let mut current = Arc::clone(model);
    let mut path = Vec::new();
    for segment in field.split(LOOKUP_SEP) {
        let descriptor = best_match(&current, segment).cloned().ok_or_else(|| {
            GraphOrmError::field(format!(
                "{} has no relationship named '{segment}' (select_related '{field}')",
                current.type_name()
            ))
        })?;
        current = store.model(&descriptor.target)?;
        path.push(descriptor);
    }
    Ok(path)
}

fn by_fields(store: &Store, alias: &str, instances: &[Instance], fields: &[String]) -> Result<()> {
    let Some(first) = instances.first() else {
        return Ok(());
    };
    let model = Arc::clone(first.model());
    let mut paths = Vec::new();
    for field in fields {
        paths.push(resolve_field(store, &model, field)?);
    }
    // Every prefix of every path, so intermediate hops are attached too.
    let mut prefixes: Vec<Vec<RelationshipDescriptor>> = Vec::new();
    for path in &paths {
        for len in 1..=path.len() {
            let prefix = path[..len].to_vec();
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
    }
    let transport = store.transport(alias)?;
    let mut rows = Vec::new();
    if !prefixes.is_empty() {
        for chunk in start_ids(instances).chunks(store.chunk_size()) {
            let mut builder = CypherBuilder::new();
            for (idx, prefix) in prefixes.iter().enumerate() {
                if idx > 0 {
                    builder = builder.union();
                }
                let mut pattern = PathPattern::starting_at("s").named("p");
                for (hop, descriptor) in prefix.iter().enumerate() {
                    let node = (hop + 1 == prefix.len()).then_some("m");
                    pattern = pattern.step(RelPattern::single(descriptor.rel_type.clone(), descriptor.direction), node);
                }
                builder = with_label(builder.start_nodes("s", chunk.to_vec()).match_path(pattern));
            }
            rows.extend(read_rows(&transport.cypher(&builder.build()?)?)?);
        }
    }
    rows.sort_by_key(|row| row.edges.len());
    attach_rows(store, alias, instances, &rows)?;

    for path in &paths {
        let mut frontier: Vec<Instance> = instances.to_vec();
        for descriptor in path {
            let mut next = Vec::new();
            for instance in &frontier {
                if instance.model().relationship(&descriptor.attname).is_none() {
                    continue;
                }
                let relation = instance.relation(&descriptor.attname)?;
                let mut state = relation.lock();
                state.mark_loaded();
                next.extend(state.targets());
            }
            frontier = next;
        }
    }
    debug!(starts = instances.len(), paths = rows.len(), fields = ?fields, "graphorm.select_related.fields");
    Ok(())
}

fn read_rows(table: &Table) -> Result<Vec<PathRow>> {
    let (nodes_col, rels_col) = (table.column("nodes")?, table.column("rels")?);
    let (app_col, model_col) = (table.column("app_label")?, table.column("model_name")?);
    let ids = |row: &[JsonValue], col: usize| -> Result<Vec<u64>> {
        row.get(col)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| GraphOrmError::transport("path row without id list"))?
            .iter()
            .map(|v| v.as_u64().ok_or_else(|| GraphOrmError::transport("non-numeric id in path")))
            .collect()
    };
    let text = |row: &[JsonValue], col: usize| -> Result<String> {
        row.get(col)
            .and_then(JsonValue::as_str)
            .map(str::to_owned)
            .ok_or_else(|| GraphOrmError::transport("path end without type label"))
    };
    table
        .data
        .iter()
        .map(|row| {
            Ok(PathRow {
                nodes: ids(row, nodes_col)?.into_iter().map(NodeId).collect(),
                edges: ids(row, rels_col)?.into_iter().map(EdgeId).collect(),
                label: TypeSpec {
                    app_label: text(row, app_col)?,
                    model_name: text(row, model_col)?,
                },
            })
        })
        .collect()
}

/// Materializes path endpoints, fetches their edges in one call, and records
/// each hop. Returns every instance involved, keyed by id.
fn attach_rows(
    store: &Store,
    alias: &str,
    instances: &[Instance],
    rows: &[PathRow],
) -> Result<BTreeMap<NodeId, Instance>> {
    let mut known: BTreeMap<NodeId, Instance> = instances
        .iter()
        .filter_map(|instance| Some((instance.id()?, instance.clone())))
        .collect();
    if rows.is_empty() {
        return Ok(known);
    }
    let mut labels: BTreeMap<NodeId, &TypeSpec> = BTreeMap::new();
    for row in rows {
        if let Some(end) = row.nodes.last() {
            labels.entry(*end).or_insert(&row.label);
        }
    }
    let transport = store.transport(alias)?;
    let missing: Vec<NodeId> = labels.keys().filter(|id| !known.contains_key(id)).copied().collect();
    for chunk in missing.chunks(store.chunk_size()) {
        for record in transport.get_nodes(chunk)? {
            let Some(model) = labels.get(&record.id).and_then(|label| store.registry().by_spec(label)) else {
                continue;
            };
            let id = record.id;
            known.insert(id, Instance::from_record(store.clone(), model, alias, record)?);
        }
    }
    let edge_ids: BTreeSet<EdgeId> = rows.iter().flat_map(|row| row.edges.iter().copied()).collect();
    let edge_ids: Vec<EdgeId> = edge_ids.into_iter().collect();
    let edges: BTreeMap<EdgeId, EdgeRecord> = transport
        .get_edges(&edge_ids)?
        .into_iter()
        .map(|edge| (edge.id, edge))
        .collect();
    for row in rows {
        for (hop, edge_id) in row.edges.iter().enumerate() {
            let (Some(current), Some(next), Some(edge)) = (
                row.nodes.get(hop).and_then(|id| known.get(id)),
                row.nodes.get(hop + 1).and_then(|id| known.get(id)),
                edges.get(edge_id),
            ) else {
                break;
            };
            if edge.properties.get(MARKER_ATTR) != Some(&JsonValue::Bool(true)) {
                break;
            }
            attach_edge(store, current, next, edge)?;
        }
    }
    Ok(known)
}

/// Records `edge` on the one descriptor of `current` it belongs to, and on
/// the reverse descriptor of `next` when exactly one matches.
fn attach_edge(store: &Store, current: &Instance, next: &Instance, edge: &EdgeRecord) -> Result<()> {
    let direction = edge.direction_from(current.pk()?);
    let forward = current.model().relationships_for(&edge.rel_type, direction);
    let [descriptor] = forward.as_slice() else {
        return Err(GraphOrmError::validation(format!(
            "{} has {} relationships for '{}' edges ({}), expected exactly one",
            current.model().type_name(),
            forward.len(),
            edge.rel_type,
            direction.as_str()
        )));
    };
    if !store.model(&descriptor.target)?.includes(&next.model().type_name()) {
        return Ok(());
    }
    current.relation(&descriptor.attname)?.lock().attach(edge.clone(), next.clone());
    let reverse = next.model().relationships_for(&edge.rel_type, direction.reverse());
    if let [back] = reverse.as_slice() {
        next.relation(&back.attname)?.lock().attach(edge.clone(), current.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, RegistryBuilder, Relationship};

    #[test]
    fn attribute_names_outrank_relationship_types() {
        let registry = RegistryBuilder::new()
            .register(
                ModelBuilder::new("tests", "Person")
                    .relationship("friends", Relationship::to("tests.Person", "knows").related_name("friend_of"))
                    .relationship("knows", Relationship::to("tests.Person", "friends").related_name("known_by")),
            )
            .build()
            .unwrap();
        let person = registry.get("tests.Person").unwrap();
        assert_eq!(best_match(&person, "friends").unwrap().attname, "friends");
        assert_eq!(best_match(&person, "knows").unwrap().attname, "knows");
        assert!(best_match(&person, "enemies").is_none());
    }
}
