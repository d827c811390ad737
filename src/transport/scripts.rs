//! Calls into the server-side helper library.
//!
//! Each [`ScriptCall`] runs inside one server-side transaction. The HTTP
//! transport renders it as a script invocation against [`LIBRARY_SOURCE`]; the
//! memory backend executes the same semantics natively under its write lock.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::transport::PropertyMap;

/// Identity of one concrete model type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeSpec {
    /// Application label.
    pub app_label: String,
    /// Model name.
    pub model_name: String,
}

impl TypeSpec {
    /// `"app_label.model_name"`.
    pub fn type_name(&self) -> String {
        crate::typegraph::type_name(&self.app_label, &self.model_name)
    }
}

/// Helper-library invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptCall {
    /// Ensures the type chain, creates an instance node with `properties`,
    /// links it to the leaf type, and indexes it under every type name of the
    /// chain in `index_name`. Returns the node.
    CreateNodeWithTypes {
        /// Type chain, root first.
        types: Vec<TypeSpec>,
        /// Family index.
        index_name: String,
        /// Initial properties.
        properties: PropertyMap,
    },
    /// Ensures the type chain and returns the leaf type node.
    GetTypeNode {
        /// Type chain, root first.
        types: Vec<TypeSpec>,
    },
    /// Allocates `count` consecutive auto ids for `key` from the counter kept
    /// on the family root type node. Returns the ids.
    NextAutoIds {
        /// Type chain, root first.
        types: Vec<TypeSpec>,
        /// Property name.
        key: String,
        /// Number of ids.
        count: u32,
    },
    /// Writes `value` to `key` on every node and replaces their index entries
    /// with `index_keys`. Returns `{"updated": n}` or `{"conflict": id}` when a
    /// unique key is already held by another node.
    UpdateIndexed {
        /// Family index.
        index_name: String,
        /// Property name.
        key: String,
        /// Target nodes.
        nodes: Vec<u64>,
        /// Stored value; null removes the property.
        value: JsonValue,
        /// Index keys to register per node.
        index_keys: Vec<String>,
        /// Whether the keys must be unique within the index.
        unique: bool,
    },
}

impl ScriptCall {
    /// Library function name.
    pub fn function(&self) -> &'static str {
        match self {
            ScriptCall::CreateNodeWithTypes { .. } => "createNodeWithTypes",
            ScriptCall::GetTypeNode { .. } => "getTypeNode",
            ScriptCall::NextAutoIds { .. } => "nextAutoIds",
            ScriptCall::UpdateIndexed { .. } => "updateIndexed",
        }
    }

    /// Invocation snippet plus its parameters.
    pub fn to_script(&self) -> (String, JsonValue) {
        let types = |types: &[TypeSpec]| -> JsonValue {
            types
                .iter()
                .map(|t| json!([t.app_label, t.model_name]))
                .collect()
        };
        match self {
            ScriptCall::CreateNodeWithTypes {
                types: chain,
                index_name,
                properties,
            } => (
                "GraphOrm.createNodeWithTypes(g, types, indexName, properties)".to_owned(),
                json!({"types": types(chain), "indexName": index_name, "properties": properties}),
            ),
            ScriptCall::GetTypeNode { types: chain } => (
                "GraphOrm.getTypeNode(g, types)".to_owned(),
                json!({"types": types(chain)}),
            ),
            ScriptCall::NextAutoIds {
                types: chain,
                key,
                count,
            } => (
                "GraphOrm.nextAutoIds(g, types, key, count)".to_owned(),
                json!({"types": types(chain), "key": key, "count": count}),
            ),
            ScriptCall::UpdateIndexed {
                index_name,
                key,
                nodes,
                value,
                index_keys,
                unique,
            } => (
                "GraphOrm.updateIndexed(g, indexName, key, nodeIds, value, indexKeys, unique)"
                    .to_owned(),
                json!({
                    "indexName": index_name,
                    "key": key,
                    "nodeIds": nodes,
                    "value": value,
                    "indexKeys": index_keys,
                    "unique": unique,
                }),
            ),
        }
    }
}

/// Error text the server returns when the helper library has not been loaded.
pub const LIBRARY_MISSING_MARKER: &str = "No such property: GraphOrm";

/// Groovy source of the helper library, prepended to a script on retry.
pub const LIBRARY_SOURCE: &str = r#"
import org.neo4j.graphdb.DynamicRelationshipType

class GraphOrm {
    static final String TYPE_REL = '<<TYPE>>'
    static final String INSTANCE_REL = '<<INSTANCE>>'
    static final String TYPE_INDEX = '<<TYPE_NODES>>'
    static final String TYPE_KEY = '<<type>>'
    static final String AUTO_PREFIX = '_graphorm_auto_'

    static synchronized Object getTypeNode(g, types) {
        def db = g.getRawGraph()
        def tx = db.beginTx()
        try {
            def index = db.index().forNodes(TYPE_INDEX)
            def parent = null
            for (t in types) {
                def name = t[0] + '.' + t[1]
                def node = index.get(TYPE_KEY, name).getSingle()
                if (node == null) {
                    node = db.createNode()
                    node.setProperty('app_label', t[0])
                    node.setProperty('model_name', t[1])
                    index.add(node, TYPE_KEY, name)
                    if (parent != null) {
                        parent.createRelationshipTo(node, DynamicRelationshipType.withName(TYPE_REL))
                    }
                }
                parent = node
            }
            tx.success()
            return parent
        } finally {
            tx.finish()
        }
    }

    static Object indexNodeAsTypes(g, node, indexName, types) {
        def index = g.getRawGraph().index().forNodes(indexName)
        for (t in types) {
            index.add(node, TYPE_KEY, t[0] + '.' + t[1])
        }
        return node
    }

    static synchronized Object createNodeWithTypes(g, types, indexName, properties) {
        def db = g.getRawGraph()
        def tx = db.beginTx()
        try {
            def type = getTypeNode(g, types)
            def node = db.createNode()
            properties.each { k, v -> if (v != null) node.setProperty(k, v) }
            type.createRelationshipTo(node, DynamicRelationshipType.withName(INSTANCE_REL))
            indexNodeAsTypes(g, node, indexName, types)
            tx.success()
            return node
        } finally {
            tx.finish()
        }
    }

    static synchronized Object nextAutoIds(g, types, key, count) {
        def db = g.getRawGraph()
        def tx = db.beginTx()
        try {
            def root = getTypeNode(g, [types[0]])
            def attr = AUTO_PREFIX + key
            def last = root.hasProperty(attr) ? root.getProperty(attr) : 0
            def ids = []
            for (i in 1..count) {
                ids << last + i
            }
            root.setProperty(attr, last + count)
            tx.success()
            return ids
        } finally {
            tx.finish()
        }
    }

    static synchronized Object updateIndexed(g, indexName, key, nodeIds, value, indexKeys, unique) {
        def db = g.getRawGraph()
        def tx = db.beginTx()
        try {
            def index = db.index().forNodes(indexName)
            def ids = nodeIds.collect { it as long }
            if (unique) {
                for (k in indexKeys) {
                    for (hit in index.get(key, k)) {
                        if (!ids.contains(hit.getId())) {
                            return [conflict: hit.getId()]
                        }
                    }
                }
            }
            for (id in ids) {
                def node = db.getNodeById(id)
                index.remove(node, key)
                if (value == null) {
                    node.removeProperty(key)
                } else {
                    node.setProperty(key, value)
                }
                for (k in indexKeys) {
                    index.add(node, key, k)
                }
            }
            tx.success()
            return [updated: ids.size()]
        } finally {
            tx.finish()
        }
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_chains_render_as_pairs() {
        let call = ScriptCall::GetTypeNode {
            types: vec![TypeSpec {
                app_label: "tests".into(),
                model_name: "Dog".into(),
            }],
        };
        let (script, params) = call.to_script();
        assert!(script.starts_with("GraphOrm.getTypeNode"));
        assert_eq!(params["types"], json!([["tests", "Dog"]]));
    }

    #[test]
    fn indexed_update_compares_ids_as_longs() {
        let body = &LIBRARY_SOURCE[LIBRARY_SOURCE.find("Object updateIndexed(").unwrap()..];
        assert!(body.contains("def ids = nodeIds.collect { it as long }"));
        assert!(body.contains("!ids.contains(hit.getId())"));
        assert!(!body.contains("nodeIds.contains"));
    }

    #[test]
    fn library_defines_every_entry_point() {
        for name in ["createNodeWithTypes", "indexNodeAsTypes", "getTypeNode", "nextAutoIds", "updateIndexed"] {
            assert!(LIBRARY_SOURCE.contains(&format!("Object {name}(")), "{name}");
        }
    }
}
