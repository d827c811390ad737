//! Type nodes and the edges that tie instances to them.
//!
//! Every concrete model owns one type node carrying `{app_label, model_name}`.
//! Parent types point at child types over [`TYPE_REL`]; a type points at each of
//! its instances over [`INSTANCE_REL`]. Instance nodes are also indexed in their
//! family index under every ancestor type name, keyed by [`TYPE_INDEX_KEY`].

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::cypher::{CypherBuilder, PathPattern, RelPattern, ReturnExpr};
use crate::error::{GraphOrmError, Result};
use crate::transport::{Direction, GraphTransport, NodeId, NodeRecord, ScriptCall, TypeSpec};

/// Edge type from a parent type node to a child type node.
pub const TYPE_REL: &str = "<<TYPE>>";
/// Edge type from a type node to each of its instances.
pub const INSTANCE_REL: &str = "<<INSTANCE>>";
/// Index key under which instances are registered by type name.
pub const TYPE_INDEX_KEY: &str = "<<type>>";
/// Index holding every type node, keyed by [`TYPE_INDEX_KEY`].
pub const TYPE_NODE_INDEX: &str = "<<TYPE_NODES>>";
/// Marker attribute stamped on every edge the mapping layer creates.
pub const MARKER_ATTR: &str = "_graphorm";
/// Order attribute stamped on edges of ordered relationships.
pub const ORDER_ATTR: &str = "_graphorm_order";
/// Prefix of the per-family auto-id counters stored on root type nodes.
pub const AUTO_COUNTER_PREFIX: &str = "_graphorm_auto_";

/// Whether an edge type is one of the reserved structural types.
pub fn is_reserved_rel(rel_type: &str) -> bool {
    rel_type == TYPE_REL || rel_type == INSTANCE_REL
}

/// `"{app_label}.{model_name}"`.
pub fn type_name(app_label: &str, model_name: &str) -> String {
    format!("{app_label}.{model_name}")
}

/// Shared index name of a concrete-model family.
pub fn family_index_name(root_app_label: &str, root_model_name: &str) -> String {
    format!("{root_app_label}-{root_model_name}")
}

/// Ensures the type chain exists (root first) and returns the leaf type node.
pub fn type_node(transport: &dyn GraphTransport, chain: &[TypeSpec]) -> Result<NodeId> {
    let result = transport.run_script(&ScriptCall::GetTypeNode {
        types: chain.to_vec(),
    })?;
    let node = NodeRecord::from_json(&result)?;
    debug!(type_node = %node.id, depth = chain.len(), "graphorm.typegraph.resolved");
    Ok(node.id)
}

/// Concrete type of each instance node, fetched in batches of `chunk_size`.
///
/// Nodes without an instance edge (type nodes, foreign nodes) are absent from
/// the result.
pub fn type_labels(
    transport: &dyn GraphTransport,
    ids: &[NodeId],
    chunk_size: usize,
) -> Result<BTreeMap<NodeId, TypeSpec>> {
    let mut labels = BTreeMap::new();
    for chunk in ids.chunks(chunk_size.max(1)) {
        let query = CypherBuilder::new()
            .start_nodes("n", chunk.to_vec())
            .match_path(
                PathPattern::starting_at("n")
                    .step(RelPattern::single(INSTANCE_REL, Direction::In), Some("t")),
            )
            .returns(ReturnExpr::Id("n".into()), Some("id"))
            .returns(ReturnExpr::Property("t".into(), "app_label".into()), Some("app_label"))
            .returns(ReturnExpr::Property("t".into(), "model_name".into()), Some("model_name"))
            .build()?;
        let table = transport.cypher(&query)?;
        let (id_col, app_col, model_col) = (
            table.column("id")?,
            table.column("app_label")?,
            table.column("model_name")?,
        );
        for row in &table.data {
            let id = row
                .get(id_col)
                .and_then(JsonValue::as_u64)
                .ok_or_else(|| GraphOrmError::transport("type label row without id"))?;
            let text = |col: usize| {
                row.get(col)
                    .and_then(JsonValue::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| GraphOrmError::transport("type node without label"))
            };
            labels.insert(
                NodeId(id),
                TypeSpec {
                    app_label: text(app_col)?,
                    model_name: text(model_col)?,
                },
            );
        }
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryGraph;

    fn spec(app: &str, model: &str) -> TypeSpec {
        TypeSpec {
            app_label: app.into(),
            model_name: model.into(),
        }
    }

    #[test]
    fn family_index_uses_root_labels() {
        assert_eq!(family_index_name("tests", "Person"), "tests-Person");
        assert_eq!(type_name("tests", "Person"), "tests.Person");
        assert!(is_reserved_rel(TYPE_REL));
        assert!(!is_reserved_rel("chases"));
    }

    #[test]
    fn type_nodes_are_idempotent() {
        let graph = MemoryGraph::new();
        let chain = vec![spec("tests", "Animal"), spec("tests", "Dog")];
        let first = type_node(&graph, &chain).unwrap();
        let second = type_node(&graph, &chain).unwrap();
        assert_eq!(first, second);
        let root = type_node(&graph, &chain[..1]).unwrap();
        let children = graph.node_edges(root, Direction::Out, &[TYPE_REL]).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].end, first);
    }

    #[test]
    fn labels_come_from_instance_edges() {
        let graph = MemoryGraph::new();
        let chain = vec![spec("tests", "Dog")];
        let node = graph
            .run_script(&ScriptCall::CreateNodeWithTypes {
                types: chain.clone(),
                index_name: "tests-Dog".into(),
                properties: Default::default(),
            })
            .unwrap();
        let node = NodeRecord::from_json(&node).unwrap();
        let type_id = type_node(&graph, &chain).unwrap();
        let labels = type_labels(&graph, &[node.id, type_id], 10).unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[&node.id], spec("tests", "Dog"));
    }
}
