//! In-process graph backend.
//!
//! [`MemoryGraph`] keeps nodes, edges, and legacy-style key/value indexes in
//! ordered maps behind one lock. Helper-library calls and graph queries run
//! while holding that lock, which gives them the same all-or-nothing
//! behaviour a server-side transaction provides.

mod cypher_eval;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tracing::trace;

use crate::cypher::CypherQuery;
use crate::error::{GraphOrmError, Result};
use crate::index_query::{IndexEntries, IndexQuery};
use crate::transport::{
    Direction, EdgeId, EdgeRecord, GraphTransport, NodeId, NodeRecord, PropertyMap, ScriptCall,
    Table, TraversalPager, TraversalSpec, TypeSpec,
};
use crate::typegraph::{
    type_name, AUTO_COUNTER_PREFIX, INSTANCE_REL, TYPE_INDEX_KEY, TYPE_NODE_INDEX, TYPE_REL,
};

/// URL prefix used in node and edge payloads.
pub const MEMORY_BASE: &str = "memory://graph/db/data";

#[derive(Debug, Default)]
struct GraphState {
    next_node: u64,
    next_edge: u64,
    nodes: BTreeMap<NodeId, PropertyMap>,
    edges: BTreeMap<EdgeId, EdgeRecord>,
    incident: BTreeMap<NodeId, BTreeSet<EdgeId>>,
    indexes: BTreeMap<String, IndexEntries>,
}

impl GraphState {
    fn node(&self, id: NodeId) -> Result<&PropertyMap> {
        self.nodes
            .get(&id)
            .ok_or_else(|| GraphOrmError::NotFound(format!("node {id}")))
    }

    fn record(&self, id: NodeId) -> Option<NodeRecord> {
        self.nodes.get(&id).map(|properties| NodeRecord {
            id,
            properties: properties.clone(),
        })
    }

    fn create_node(&mut self, properties: &PropertyMap) -> NodeRecord {
        self.next_node += 1;
        let id = NodeId(self.next_node);
        let properties: PropertyMap = properties
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.nodes.insert(id, properties.clone());
        self.incident.insert(id, BTreeSet::new());
        NodeRecord { id, properties }
    }

    fn create_edge(
        &mut self,
        start: NodeId,
        end: NodeId,
        rel_type: &str,
        properties: &PropertyMap,
    ) -> Result<EdgeRecord> {
        self.node(start)?;
        self.node(end)?;
        self.next_edge += 1;
        let edge = EdgeRecord {
            id: EdgeId(self.next_edge),
            start,
            end,
            rel_type: rel_type.to_owned(),
            properties: properties
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        self.incident.entry(start).or_default().insert(edge.id);
        self.incident.entry(end).or_default().insert(edge.id);
        self.edges.insert(edge.id, edge.clone());
        Ok(edge)
    }

    fn delete_edge(&mut self, id: EdgeId) -> Result<()> {
        let edge = self
            .edges
            .remove(&id)
            .ok_or_else(|| GraphOrmError::NotFound(format!("relationship {id}")))?;
        for end in [edge.start, edge.end] {
            if let Some(set) = self.incident.get_mut(&end) {
                set.remove(&id);
            }
        }
        Ok(())
    }

    fn delete_node(&mut self, id: NodeId) -> Result<()> {
        self.node(id)?;
        if self.incident.get(&id).is_some_and(|edges| !edges.is_empty()) {
            return Err(GraphOrmError::transport(format!(
                "node {id} still has relationships and cannot be deleted"
            )));
        }
        self.nodes.remove(&id);
        self.incident.remove(&id);
        for entries in self.indexes.values_mut() {
            for values in entries.values_mut() {
                for holders in values.values_mut() {
                    holders.remove(&id);
                }
                values.retain(|_, holders| !holders.is_empty());
            }
        }
        Ok(())
    }

    fn set_property(&mut self, id: NodeId, key: &str, value: &JsonValue) -> Result<()> {
        let props = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| GraphOrmError::NotFound(format!("node {id}")))?;
        if value.is_null() {
            props.remove(key);
        } else {
            props.insert(key.to_owned(), value.clone());
        }
        Ok(())
    }

    fn edges_of(&self, id: NodeId, direction: Direction, types: &[&str]) -> Vec<&EdgeRecord> {
        let Some(ids) = self.incident.get(&id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|eid| self.edges.get(eid))
            .filter(|edge| types.is_empty() || types.contains(&edge.rel_type.as_str()))
            .filter(|edge| match direction {
                Direction::Out => edge.start == id,
                Direction::In => edge.end == id,
                Direction::Both => true,
            })
            .collect()
    }

    fn index_add(&mut self, index: &str, key: &str, value: &str, node: NodeId) {
        self.indexes
            .entry(index.to_owned())
            .or_default()
            .entry(key.to_owned())
            .or_default()
            .entry(value.to_owned())
            .or_default()
            .insert(node);
    }

    fn index_holders(&self, index: &str, key: &str, value: &str) -> BTreeSet<NodeId> {
        self.indexes
            .get(index)
            .and_then(|entries| entries.get(key))
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    fn index_remove(&mut self, index: &str, key: &str, value: Option<&str>, node: NodeId) {
        let Some(values) = self
            .indexes
            .get_mut(index)
            .and_then(|entries| entries.get_mut(key))
        else {
            return;
        };
        match value {
            Some(value) => {
                if let Some(holders) = values.get_mut(value) {
                    holders.remove(&node);
                }
            }
            None => {
                for holders in values.values_mut() {
                    holders.remove(&node);
                }
            }
        }
        values.retain(|_, holders| !holders.is_empty());
    }

    fn ensure_type_chain(&mut self, types: &[TypeSpec]) -> Result<NodeId> {
        let mut parent: Option<NodeId> = None;
        for spec in types {
            let name = type_name(&spec.app_label, &spec.model_name);
            let existing = self
                .index_holders(TYPE_NODE_INDEX, TYPE_INDEX_KEY, &name)
                .into_iter()
                .next();
            let node = match existing {
                Some(node) => node,
                None => {
                    let mut props = PropertyMap::new();
                    props.insert("app_label".into(), json!(spec.app_label));
                    props.insert("model_name".into(), json!(spec.model_name));
                    let node = self.create_node(&props).id;
                    self.index_add(TYPE_NODE_INDEX, TYPE_INDEX_KEY, &name, node);
                    if let Some(parent) = parent {
                        self.create_edge(parent, node, TYPE_REL, &PropertyMap::new())?;
                    }
                    node
                }
            };
            parent = Some(node);
        }
        parent.ok_or_else(|| GraphOrmError::validation("empty type chain"))
    }

    fn run_script(&mut self, call: &ScriptCall) -> Result<JsonValue> {
        match call {
            ScriptCall::GetTypeNode { types } => {
                let id = self.ensure_type_chain(types)?;
                Ok(self.node_json(id))
            }
            ScriptCall::CreateNodeWithTypes {
                types,
                index_name,
                properties,
            } => {
                let type_node = self.ensure_type_chain(types)?;
                let node = self.create_node(properties);
                self.create_edge(type_node, node.id, INSTANCE_REL, &PropertyMap::new())?;
                for spec in types {
                    let name = type_name(&spec.app_label, &spec.model_name);
                    self.index_add(index_name, TYPE_INDEX_KEY, &name, node.id);
                }
                Ok(node.to_json(MEMORY_BASE))
            }
            ScriptCall::NextAutoIds { types, key, count } => {
                let root = self.ensure_type_chain(&types[..types.len().min(1)])?;
                let attr = format!("{AUTO_COUNTER_PREFIX}{key}");
                let last = self
                    .node(root)?
                    .get(&attr)
                    .and_then(JsonValue::as_i64)
                    .unwrap_or(0);
                let ids: Vec<i64> = (1..=i64::from(*count)).map(|i| last + i).collect();
                self.set_property(root, &attr, &json!(last + i64::from(*count)))?;
                Ok(json!(ids))
            }
            ScriptCall::UpdateIndexed {
                index_name,
                key,
                nodes,
                value,
                index_keys,
                unique,
            } => {
                let targets: BTreeSet<NodeId> = nodes.iter().copied().map(NodeId).collect();
                if *unique {
                    for index_key in index_keys {
                        let holders = self.index_holders(index_name, key, index_key);
                        if let Some(other) = holders.iter().find(|h| !targets.contains(h)) {
                            return Ok(json!({"conflict": other.0}));
                        }
                    }
                }
                for node in &targets {
                    self.node(*node)?;
                }
                for node in &targets {
                    self.index_remove(index_name, key, None, *node);
                    self.set_property(*node, key, value)?;
                    for index_key in index_keys {
                        self.index_add(index_name, key, index_key, *node);
                    }
                }
                Ok(json!({"updated": targets.len()}))
            }
        }
    }

    fn node_json(&self, id: NodeId) -> JsonValue {
        self.record(id)
            .map(|record| record.to_json(MEMORY_BASE))
            .unwrap_or(JsonValue::Null)
    }

    fn traverse(&self, start: NodeId, spec: &TraversalSpec) -> Result<VecDeque<NodeRecord>> {
        self.node(start)?;
        let mut visited = BTreeSet::from([start]);
        let mut queue = VecDeque::from([(start, 0u32)]);
        let mut out = VecDeque::new();
        while let Some((node, depth)) = queue.pop_front() {
            if spec.max_depth.is_some_and(|max| depth >= max) {
                continue;
            }
            for (rel_type, direction) in &spec.relationships {
                for edge in self.edges_of(node, *direction, &[rel_type.as_str()]) {
                    let other = edge.other(node);
                    if !visited.insert(other) {
                        continue;
                    }
                    let props = self.node(other)?;
                    if spec.return_filter.evaluate(other, props, Some(&edge.rel_type)) {
                        out.push_back(NodeRecord {
                            id: other,
                            properties: props.clone(),
                        });
                    }
                    queue.push_back((other, depth + 1));
                }
            }
        }
        Ok(out)
    }
}

/// Thread-safe in-process graph.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: Mutex<GraphState>,
    requests: AtomicU64,
    queries: AtomicU64,
}

impl MemoryGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transport calls served so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Number of graph queries served so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Number of nodes, including type nodes.
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Number of edges, including structural edges.
    pub fn edge_count(&self) -> usize {
        self.state.lock().edges.len()
    }

    /// Total number of `(key, value, node)` entries held by an index.
    pub fn index_entry_count(&self, index: &str) -> usize {
        self.state
            .lock()
            .indexes
            .get(index)
            .map(|entries| {
                entries
                    .values()
                    .flat_map(|values| values.values())
                    .map(BTreeSet::len)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn tick(&self, op: &'static str) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        trace!(op, "graphorm.memory.request");
    }
}

impl GraphTransport for MemoryGraph {
    fn create_node(&self, properties: &PropertyMap) -> Result<NodeRecord> {
        self.tick("create_node");
        Ok(self.state.lock().create_node(properties))
    }

    fn get_node(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        self.tick("get_node");
        Ok(self.state.lock().record(id))
    }

    fn get_nodes(&self, ids: &[NodeId]) -> Result<Vec<NodeRecord>> {
        self.tick("get_nodes");
        let state = self.state.lock();
        Ok(ids.iter().filter_map(|id| state.record(*id)).collect())
    }

    fn set_node_property(&self, id: NodeId, key: &str, value: &JsonValue) -> Result<()> {
        self.tick("set_node_property");
        self.state.lock().set_property(id, key, value)
    }

    fn remove_node_property(&self, id: NodeId, key: &str) -> Result<()> {
        self.tick("remove_node_property");
        self.state.lock().set_property(id, key, &JsonValue::Null)
    }

    fn delete_node(&self, id: NodeId) -> Result<()> {
        self.tick("delete_node");
        self.state.lock().delete_node(id)
    }

    fn create_edge(
        &self,
        start: NodeId,
        end: NodeId,
        rel_type: &str,
        properties: &PropertyMap,
    ) -> Result<EdgeRecord> {
        self.tick("create_edge");
        self.state.lock().create_edge(start, end, rel_type, properties)
    }

    fn get_edges(&self, ids: &[EdgeId]) -> Result<Vec<EdgeRecord>> {
        self.tick("get_edges");
        let state = self.state.lock();
        Ok(ids.iter().filter_map(|id| state.edges.get(id).cloned()).collect())
    }

    fn node_edges(&self, id: NodeId, direction: Direction, types: &[&str]) -> Result<Vec<EdgeRecord>> {
        self.tick("node_edges");
        let state = self.state.lock();
        state.node(id)?;
        Ok(state
            .edges_of(id, direction, types)
            .into_iter()
            .cloned()
            .collect())
    }

    fn delete_edge(&self, id: EdgeId) -> Result<()> {
        self.tick("delete_edge");
        self.state.lock().delete_edge(id)
    }

    fn index_add(&self, index: &str, key: &str, value: &str, node: NodeId) -> Result<()> {
        self.tick("index_add");
        let mut state = self.state.lock();
        state.node(node)?;
        state.index_add(index, key, value, node);
        Ok(())
    }

    fn index_add_unique(
        &self,
        index: &str,
        key: &str,
        value: &str,
        node: NodeId,
    ) -> Result<Option<NodeId>> {
        self.tick("index_add_unique");
        let mut state = self.state.lock();
        state.node(node)?;
        let holders = state.index_holders(index, key, value);
        if let Some(other) = holders.into_iter().find(|h| *h != node) {
            return Ok(Some(other));
        }
        state.index_add(index, key, value, node);
        Ok(None)
    }

    fn index_remove(&self, index: &str, key: &str, value: Option<&str>, node: NodeId) -> Result<()> {
        self.tick("index_remove");
        self.state.lock().index_remove(index, key, value, node);
        Ok(())
    }

    fn index_lookup(&self, index: &str, key: &str, value: &str) -> Result<Vec<NodeRecord>> {
        self.tick("index_lookup");
        let state = self.state.lock();
        Ok(state
            .index_holders(index, key, value)
            .into_iter()
            .filter_map(|id| state.record(id))
            .collect())
    }

    fn index_query(&self, index: &str, query: &IndexQuery) -> Result<Vec<NodeRecord>> {
        self.tick("index_query");
        let state = self.state.lock();
        let Some(entries) = state.indexes.get(index) else {
            return Ok(Vec::new());
        };
        Ok(query
            .evaluate(entries)
            .into_iter()
            .filter_map(|id| state.record(id))
            .collect())
    }

    fn traverse(
        &self,
        start: NodeId,
        spec: &TraversalSpec,
        page_size: usize,
    ) -> Result<Box<dyn TraversalPager>> {
        self.tick("traverse");
        let pending = self.state.lock().traverse(start, spec)?;
        Ok(Box::new(MemoryPager {
            pending,
            page_size: page_size.max(1),
        }))
    }

    fn run_script(&self, call: &ScriptCall) -> Result<JsonValue> {
        self.tick("run_script");
        self.state.lock().run_script(call)
    }

    fn cypher(&self, query: &CypherQuery) -> Result<Table> {
        self.tick("cypher");
        self.queries.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        cypher_eval::execute(&mut state, query)
    }
}

/// Pages over a traversal result computed when the traversal started.
struct MemoryPager {
    pending: VecDeque<NodeRecord>,
    page_size: usize,
}

impl TraversalPager for MemoryPager {
    fn next_batch(&mut self, out: &mut Vec<NodeRecord>) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let take = self.page_size.min(self.pending.len());
        out.extend(self.pending.drain(..take));
        Ok(!self.pending.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterExpr, FilterOp};

    fn props(pairs: &[(&str, JsonValue)]) -> PropertyMap {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
    }

    #[test]
    fn node_ids_start_at_one() {
        let graph = MemoryGraph::new();
        let node = graph.create_node(&PropertyMap::new()).unwrap();
        assert_eq!(node.id, NodeId(1));
    }

    #[test]
    fn nodes_with_edges_cannot_be_deleted() {
        let graph = MemoryGraph::new();
        let a = graph.create_node(&PropertyMap::new()).unwrap().id;
        let b = graph.create_node(&PropertyMap::new()).unwrap().id;
        let edge = graph.create_edge(a, b, "knows", &PropertyMap::new()).unwrap();
        assert!(graph.delete_node(a).is_err());
        graph.delete_edge(edge.id).unwrap();
        graph.delete_node(a).unwrap();
        assert!(graph.get_node(a).unwrap().is_none());
    }

    #[test]
    fn unique_add_reports_existing_holder() {
        let graph = MemoryGraph::new();
        let a = graph.create_node(&PropertyMap::new()).unwrap().id;
        let b = graph.create_node(&PropertyMap::new()).unwrap().id;
        assert_eq!(graph.index_add_unique("idx", "name", "pete", a).unwrap(), None);
        assert_eq!(graph.index_add_unique("idx", "name", "pete", a).unwrap(), None);
        assert_eq!(graph.index_add_unique("idx", "name", "pete", b).unwrap(), Some(a));
        assert_eq!(graph.index_entry_count("idx"), 1);
    }

    #[test]
    fn traversal_pages_and_filters() {
        let graph = MemoryGraph::new();
        let root = graph.create_node(&PropertyMap::new()).unwrap().id;
        for age in 0..5 {
            let child = graph.create_node(&props(&[("age", json!(age))])).unwrap().id;
            graph.create_edge(root, child, INSTANCE_REL, &PropertyMap::new()).unwrap();
        }
        let spec = TraversalSpec {
            relationships: vec![(INSTANCE_REL.to_owned(), Direction::Out)],
            max_depth: None,
            return_filter: FilterExpr::all([
                FilterExpr::InstanceEdge,
                FilterExpr::compare("age", FilterOp::Gte, 1),
            ]),
        };
        let mut pager = graph.traverse(root, &spec, 3).unwrap();
        let mut seen = Vec::new();
        assert!(pager.next_batch(&mut seen).unwrap());
        assert_eq!(seen.len(), 3);
        assert!(!pager.next_batch(&mut seen).unwrap());
        assert_eq!(seen.len(), 4);
        assert!(!pager.next_batch(&mut seen).unwrap());
    }

    #[test]
    fn auto_ids_continue_across_calls() {
        let graph = MemoryGraph::new();
        let types = vec![TypeSpec {
            app_label: "tests".into(),
            model_name: "Ticket".into(),
        }];
        let call = |count| ScriptCall::NextAutoIds {
            types: types.clone(),
            key: "number".into(),
            count,
        };
        assert_eq!(graph.run_script(&call(2)).unwrap(), json!([1, 2]));
        assert_eq!(graph.run_script(&call(1)).unwrap(), json!([3]));
    }

    #[test]
    fn indexed_update_refuses_foreign_unique_key() {
        let graph = MemoryGraph::new();
        let a = graph.create_node(&PropertyMap::new()).unwrap().id;
        let b = graph.create_node(&PropertyMap::new()).unwrap().id;
        graph.index_add("idx", "name", "pete", a).unwrap();
        let result = graph
            .run_script(&ScriptCall::UpdateIndexed {
                index_name: "idx".into(),
                key: "name".into(),
                nodes: vec![b.0],
                value: json!("pete"),
                index_keys: vec!["pete".into()],
                unique: true,
            })
            .unwrap();
        assert_eq!(result, json!({"conflict": a.0}));
        assert!(graph.get_node(b).unwrap().unwrap().properties.is_empty());
    }
}
