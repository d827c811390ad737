//! Remote graph access.
//!
//! [`GraphTransport`] is the contract between the mapping layer and a graph
//! server. Two implementations ship with the crate:
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | `HttpTransport` | `http` | REST endpoints plus the scripting and graph-query extensions |
//! | `MemoryGraph` | `memory` | in-process graph for embedding and tests |

#[cfg(feature = "http")]
pub mod http;
pub mod library;
pub mod memory;
pub mod scripts;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cypher::CypherQuery;
use crate::error::{GraphOrmError, Result};
use crate::filter::FilterExpr;
use crate::index_query::IndexQuery;

pub use memory::MemoryGraph;
pub use scripts::{ScriptCall, TypeSpec};

/// Property map persisted on a node or edge.
pub type PropertyMap = BTreeMap<String, JsonValue>;

/// Opaque server id of a node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Opaque server id of an edge.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<NodeId> for crate::value::Value {
    fn from(id: NodeId) -> Self {
        crate::value::Value::Int(id.0 as i64)
    }
}

/// Direction of an edge relative to a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Direction {
    /// Edges starting at the node.
    Out,
    /// Edges ending at the node.
    In,
    /// Either.
    Both,
}

impl Direction {
    /// Direction as seen from the other end of the edge.
    pub fn reverse(self) -> Self {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
            Direction::Both => Direction::Both,
        }
    }

    /// REST path segment / traversal keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Out => "out",
            Direction::In => "in",
            Direction::Both => "all",
        }
    }
}

/// A node as returned by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    /// Server id.
    pub id: NodeId,
    /// Persisted properties.
    pub properties: PropertyMap,
}

impl NodeRecord {
    /// Parses the REST representation `{"self": ".../node/5", "data": {...}}`.
    pub fn from_json(json: &JsonValue) -> Result<Self> {
        let id = NodeId(id_from_url(json.get("self"), "node")?);
        Ok(Self {
            id,
            properties: data_map(json.get("data"))?,
        })
    }

    /// REST representation using `base` as URL prefix.
    pub fn to_json(&self, base: &str) -> JsonValue {
        serde_json::json!({
            "self": format!("{base}/node/{}", self.id),
            "data": self.properties,
        })
    }
}

/// An edge as returned by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeRecord {
    /// Server id.
    pub id: EdgeId,
    /// Start node.
    pub start: NodeId,
    /// End node.
    pub end: NodeId,
    /// Edge type name.
    pub rel_type: String,
    /// Persisted properties.
    pub properties: PropertyMap,
}

impl EdgeRecord {
    /// Parses the REST representation of a relationship.
    pub fn from_json(json: &JsonValue) -> Result<Self> {
        Ok(Self {
            id: EdgeId(id_from_url(json.get("self"), "relationship")?),
            start: NodeId(id_from_url(json.get("start"), "node")?),
            end: NodeId(id_from_url(json.get("end"), "node")?),
            rel_type: json
                .get("type")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| GraphOrmError::transport("relationship without type"))?
                .to_owned(),
            properties: data_map(json.get("data"))?,
        })
    }

    /// REST representation using `base` as URL prefix.
    pub fn to_json(&self, base: &str) -> JsonValue {
        serde_json::json!({
            "self": format!("{base}/relationship/{}", self.id),
            "start": format!("{base}/node/{}", self.start),
            "end": format!("{base}/node/{}", self.end),
            "type": self.rel_type,
            "data": self.properties,
        })
    }

    /// The endpoint opposite to `node`.
    pub fn other(&self, node: NodeId) -> NodeId {
        if self.start == node {
            self.end
        } else {
            self.start
        }
    }

    /// Direction of the edge as seen from `node`.
    pub fn direction_from(&self, node: NodeId) -> Direction {
        if self.start == node {
            Direction::Out
        } else {
            Direction::In
        }
    }
}

fn id_from_url(value: Option<&JsonValue>, kind: &str) -> Result<u64> {
    let text = value
        .and_then(JsonValue::as_str)
        .ok_or_else(|| GraphOrmError::transport(format!("{kind} payload without url")))?;
    text.rsplit('/')
        .next()
        .and_then(|segment| segment.parse::<u64>().ok())
        .ok_or_else(|| GraphOrmError::transport(format!("malformed {kind} url '{text}'")))
}

fn data_map(value: Option<&JsonValue>) -> Result<PropertyMap> {
    match value {
        None | Some(JsonValue::Null) => Ok(PropertyMap::new()),
        Some(JsonValue::Object(map)) => Ok(map.clone().into_iter().collect()),
        Some(other) => Err(GraphOrmError::transport(format!(
            "expected property object, got {other}"
        ))),
    }
}

/// Tabular graph-query result `{columns, data}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows, one value per column.
    pub data: Vec<Vec<JsonValue>>,
}

impl Table {
    /// Index of a column by name.
    pub fn column(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| GraphOrmError::transport(format!("result has no column '{name}'")))
    }
}

/// Paged traversal request.
#[derive(Clone, Debug, PartialEq)]
pub struct TraversalSpec {
    /// Relationship types and directions to follow.
    pub relationships: Vec<(String, Direction)>,
    /// Maximum depth; unlimited when `None`.
    pub max_depth: Option<u32>,
    /// Return filter applied to every visited node except the start.
    pub return_filter: FilterExpr,
}

/// Streaming interface over traversal pages.
pub trait TraversalPager: Send {
    /// Pushes the next page into `out`, returning `true` when additional pages
    /// may remain and `false` once the traversal is exhausted.
    fn next_batch(&mut self, out: &mut Vec<NodeRecord>) -> Result<bool>;
}

/// Remote graph operations used by the mapping layer.
///
/// Implementations must be usable from many threads at once; each call is a
/// self-contained request.
pub trait GraphTransport: Send + Sync + fmt::Debug {
    /// Creates a node with the given properties.
    fn create_node(&self, properties: &PropertyMap) -> Result<NodeRecord>;

    /// Fetches a node; `None` if it does not exist.
    fn get_node(&self, id: NodeId) -> Result<Option<NodeRecord>>;

    /// Fetches several nodes in one request, skipping missing ids.
    fn get_nodes(&self, ids: &[NodeId]) -> Result<Vec<NodeRecord>>;

    /// Sets one property on a node.
    fn set_node_property(&self, id: NodeId, key: &str, value: &JsonValue) -> Result<()>;

    /// Removes one property from a node.
    fn remove_node_property(&self, id: NodeId, key: &str) -> Result<()>;

    /// Deletes a node that has no remaining edges.
    fn delete_node(&self, id: NodeId) -> Result<()>;

    /// Creates an edge `start -[rel_type]-> end`.
    fn create_edge(
        &self,
        start: NodeId,
        end: NodeId,
        rel_type: &str,
        properties: &PropertyMap,
    ) -> Result<EdgeRecord>;

    /// Fetches several edges in one request, skipping missing ids.
    fn get_edges(&self, ids: &[EdgeId]) -> Result<Vec<EdgeRecord>>;

    /// Edges incident to a node, optionally restricted by type.
    fn node_edges(&self, id: NodeId, direction: Direction, types: &[&str]) -> Result<Vec<EdgeRecord>>;

    /// Deletes an edge.
    fn delete_edge(&self, id: EdgeId) -> Result<()>;

    /// Adds `(key, value) → node` to an index, creating the index on demand.
    fn index_add(&self, index: &str, key: &str, value: &str, node: NodeId) -> Result<()>;

    /// Adds the entry only if no other node holds `(key, value)`; returns the
    /// existing holder otherwise.
    fn index_add_unique(
        &self,
        index: &str,
        key: &str,
        value: &str,
        node: NodeId,
    ) -> Result<Option<NodeId>>;

    /// Removes index entries for a node: one value, or every value under `key`.
    fn index_remove(&self, index: &str, key: &str, value: Option<&str>, node: NodeId) -> Result<()>;

    /// Exact lookup.
    fn index_lookup(&self, index: &str, key: &str, value: &str) -> Result<Vec<NodeRecord>>;

    /// Structured index query.
    fn index_query(&self, index: &str, query: &IndexQuery) -> Result<Vec<NodeRecord>>;

    /// Starts a paged traversal from `start`. The pager owns whatever it
    /// needs to fetch later pages.
    fn traverse(
        &self,
        start: NodeId,
        spec: &TraversalSpec,
        page_size: usize,
    ) -> Result<Box<dyn TraversalPager>>;

    /// Runs a helper-library call inside one server-side transaction.
    fn run_script(&self, call: &ScriptCall) -> Result<JsonValue>;

    /// Executes a graph query.
    fn cypher(&self, query: &CypherQuery) -> Result<Table>;
}
