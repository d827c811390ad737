//! REST transport over blocking HTTP.
//!
//! Talks to the server's `/db/data` REST surface: node, relationship, and
//! legacy index resources, paged traversals, the script extension, and the
//! graph-query endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::LOCATION;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::cypher::CypherQuery;
use crate::error::{GraphOrmError, Result};
use crate::index_query::IndexQuery;
use crate::transport::library::{LibraryLoader, ScriptEndpoint};
use crate::transport::{
    Direction, EdgeId, EdgeRecord, GraphTransport, NodeId, NodeRecord, PropertyMap, ScriptCall,
    Table, TraversalPager, TraversalSpec,
};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const TRAVERSAL_LEASE_SECS: u64 = 60;
const SCRIPT_PATH: &[&str] = &["ext", "GremlinPlugin", "graphdb", "execute_script"];

/// Blocking REST client bound to one server endpoint.
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    loader: LibraryLoader,
}

impl HttpTransport {
    /// Connects to `http://{host}:{port}{endpoint}`.
    ///
    /// Recognised options: `timeout_secs`.
    pub fn new(host: &str, port: u16, endpoint: &str, options: &BTreeMap<String, String>) -> Result<Self> {
        let timeout = match options.get("timeout_secs") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                GraphOrmError::configuration(format!("invalid timeout_secs '{raw}'"))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        let endpoint = endpoint.trim_matches('/');
        let base = Url::parse(&format!("http://{host}:{port}/{endpoint}"))
            .map_err(|err| GraphOrmError::configuration(format!("invalid endpoint: {err}")))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;
        info!(base = %base, timeout_secs = timeout, "graphorm.http.connected");
        Ok(Self {
            client,
            base,
            loader: LibraryLoader::new(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| GraphOrmError::configuration("endpoint URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn node_url(&self, id: NodeId) -> Result<Url> {
        self.url(&["node", &id.to_string()])
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.header("Accept", "application/json").send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        debug!(status = status.as_u16(), "graphorm.http.request_failed");
        Err(GraphOrmError::transport(format!("{status}: {}", error_message(&body))))
    }

    fn batch_get(&self, paths: Vec<String>) -> Result<Vec<JsonValue>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let jobs: Vec<JsonValue> = paths
            .iter()
            .enumerate()
            .map(|(idx, to)| json!({"method": "GET", "to": to, "id": idx}))
            .collect();
        let response = self.send(self.client.post(self.url(&["batch"])?).json(&jobs))?;
        let results: Vec<JsonValue> = response.json()?;
        Ok(results
            .into_iter()
            .filter_map(|mut result| result.get_mut("body").map(JsonValue::take))
            .collect())
    }

    fn nodes_from(&self, response: Response) -> Result<Vec<NodeRecord>> {
        let payload: Vec<JsonValue> = response.json()?;
        payload.iter().map(NodeRecord::from_json).collect()
    }
}

/// Like [`HttpTransport::send`] but maps 404 to `None`.
fn send_optional(request: RequestBuilder) -> Result<Option<Response>> {
    let response = request.header("Accept", "application/json").send()?;
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let status = response.status();
    if status.is_success() {
        return Ok(Some(response));
    }
    let body = response.text().unwrap_or_default();
    Err(GraphOrmError::transport(format!("{status}: {}", error_message(&body))))
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|json| {
            json.get("message")
                .and_then(JsonValue::as_str)
                .map(str::to_owned)
        })
        .unwrap_or_else(|| body.to_owned())
}

impl ScriptEndpoint for HttpTransport {
    fn execute(&self, script: &str, params: &JsonValue) -> Result<JsonValue> {
        let response = self.send(
            self.client
                .post(self.url(SCRIPT_PATH)?)
                .json(&json!({"script": script, "params": params})),
        )?;
        Ok(response.json()?)
    }
}

impl GraphTransport for HttpTransport {
    fn create_node(&self, properties: &PropertyMap) -> Result<NodeRecord> {
        let response = self.send(self.client.post(self.url(&["node"])?).json(properties))?;
        NodeRecord::from_json(&response.json()?)
    }

    fn get_node(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        match send_optional(self.client.get(self.node_url(id)?))? {
            Some(response) => Ok(Some(NodeRecord::from_json(&response.json()?)?)),
            None => Ok(None),
        }
    }

    fn get_nodes(&self, ids: &[NodeId]) -> Result<Vec<NodeRecord>> {
        match self.batch_get(ids.iter().map(|id| format!("/node/{id}")).collect()) {
            Ok(bodies) => bodies.iter().map(NodeRecord::from_json).collect(),
            // A batch fails as a whole when one id is gone; fall back to single reads.
            Err(_) => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    out.extend(self.get_node(*id)?);
                }
                Ok(out)
            }
        }
    }

    fn set_node_property(&self, id: NodeId, key: &str, value: &JsonValue) -> Result<()> {
        if value.is_null() {
            return self.remove_node_property(id, key);
        }
        let url = self.url(&["node", &id.to_string(), "properties", key])?;
        self.send(self.client.put(url).json(value))?;
        Ok(())
    }

    fn remove_node_property(&self, id: NodeId, key: &str) -> Result<()> {
        let url = self.url(&["node", &id.to_string(), "properties", key])?;
        send_optional(self.client.delete(url))?;
        Ok(())
    }

    fn delete_node(&self, id: NodeId) -> Result<()> {
        self.send(self.client.delete(self.node_url(id)?))?;
        Ok(())
    }

    fn create_edge(
        &self,
        start: NodeId,
        end: NodeId,
        rel_type: &str,
        properties: &PropertyMap,
    ) -> Result<EdgeRecord> {
        let url = self.url(&["node", &start.to_string(), "relationships"])?;
        let body = json!({
            "to": self.node_url(end)?.as_str(),
            "type": rel_type,
            "data": properties,
        });
        let response = self.send(self.client.post(url).json(&body))?;
        EdgeRecord::from_json(&response.json()?)
    }

    fn get_edges(&self, ids: &[EdgeId]) -> Result<Vec<EdgeRecord>> {
        let bodies = self.batch_get(ids.iter().map(|id| format!("/relationship/{id}")).collect())?;
        bodies.iter().map(EdgeRecord::from_json).collect()
    }

    fn node_edges(&self, id: NodeId, direction: Direction, types: &[&str]) -> Result<Vec<EdgeRecord>> {
        let id = id.to_string();
        let joined = types.join("&");
        let mut segments = vec!["node", id.as_str(), "relationships", direction.as_str()];
        if !types.is_empty() {
            segments.push(&joined);
        }
        let response = self.send(self.client.get(self.url(&segments)?))?;
        let payload: Vec<JsonValue> = response.json()?;
        payload.iter().map(EdgeRecord::from_json).collect()
    }

    fn delete_edge(&self, id: EdgeId) -> Result<()> {
        self.send(self.client.delete(self.url(&["relationship", &id.to_string()])?))?;
        Ok(())
    }

    fn index_add(&self, index: &str, key: &str, value: &str, node: NodeId) -> Result<()> {
        let body = json!({"key": key, "value": value, "uri": self.node_url(node)?.as_str()});
        self.send(self.client.post(self.url(&["index", "node", index])?).json(&body))?;
        Ok(())
    }

    fn index_add_unique(
        &self,
        index: &str,
        key: &str,
        value: &str,
        node: NodeId,
    ) -> Result<Option<NodeId>> {
        let body = json!({"key": key, "value": value, "uri": self.node_url(node)?.as_str()});
        let response = self.send(
            self.client
                .post(self.url(&["index", "node", index])?)
                .query(&[("uniqueness", "get_or_create")])
                .json(&body),
        )?;
        let holder = NodeRecord::from_json(&response.json()?)?;
        Ok((holder.id != node).then_some(holder.id))
    }

    fn index_remove(&self, index: &str, key: &str, value: Option<&str>, node: NodeId) -> Result<()> {
        let node = node.to_string();
        let url = match value {
            Some(value) => self.url(&["index", "node", index, key, value, &node])?,
            None => self.url(&["index", "node", index, key, &node])?,
        };
        send_optional(self.client.delete(url))?;
        Ok(())
    }

    fn index_lookup(&self, index: &str, key: &str, value: &str) -> Result<Vec<NodeRecord>> {
        match send_optional(self.client.get(self.url(&["index", "node", index, key, value])?))? {
            Some(response) => self.nodes_from(response),
            None => Ok(Vec::new()),
        }
    }

    fn index_query(&self, index: &str, query: &IndexQuery) -> Result<Vec<NodeRecord>> {
        let text = query.to_string();
        debug!(index, query = %text, "graphorm.http.index_query");
        let request = self
            .client
            .get(self.url(&["index", "node", index])?)
            .query(&[("query", text.as_str())]);
        match send_optional(request)? {
            Some(response) => self.nodes_from(response),
            None => Ok(Vec::new()),
        }
    }

    fn traverse(
        &self,
        start: NodeId,
        spec: &TraversalSpec,
        page_size: usize,
    ) -> Result<Box<dyn TraversalPager>> {
        let relationships: Vec<JsonValue> = spec
            .relationships
            .iter()
            .map(|(rel_type, dir)| json!({"type": rel_type, "direction": dir.as_str()}))
            .collect();
        let mut body = json!({
            "order": "breadth_first",
            "uniqueness": "node_global",
            "relationships": relationships,
            "return_filter": {"language": "javascript", "body": spec.return_filter.to_javascript()},
        });
        match spec.max_depth {
            Some(depth) => body["max_depth"] = json!(depth),
            None => body["prune_evaluator"] = json!({"language": "builtin", "name": "none"}),
        }
        let url = self.url(&["node", &start.to_string(), "paged", "traverse", "node"])?;
        let response = self.send(
            self.client
                .post(url)
                .query(&[
                    ("pageSize", page_size.max(1).to_string()),
                    ("leaseTime", TRAVERSAL_LEASE_SECS.to_string()),
                ])
                .json(&body),
        )?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| GraphOrmError::transport("paged traversal without Location header"))?;
        let first: Vec<JsonValue> = response.json()?;
        Ok(Box::new(HttpPager {
            client: self.client.clone(),
            location,
            first: Some(first),
        }))
    }

    fn run_script(&self, call: &ScriptCall) -> Result<JsonValue> {
        debug!(function = call.function(), "graphorm.http.script");
        self.loader.run(self, call)
    }

    fn cypher(&self, query: &CypherQuery) -> Result<Table> {
        let (text, params) = query.render();
        debug!(query = %text, "graphorm.http.cypher");
        let response = self.send(
            self.client
                .post(self.url(&["cypher"])?)
                .json(&json!({"query": text, "params": params})),
        )?;
        Ok(response.json()?)
    }
}

struct HttpPager {
    client: Client,
    location: String,
    first: Option<Vec<JsonValue>>,
}

impl TraversalPager for HttpPager {
    fn next_batch(&mut self, out: &mut Vec<NodeRecord>) -> Result<bool> {
        let page = match self.first.take() {
            Some(page) => page,
            None => {
                let request = self.client.get(self.location.as_str());
                match send_optional(request)? {
                    Some(response) => response.json()?,
                    None => return Ok(false),
                }
            }
        };
        if page.is_empty() {
            return Ok(false);
        }
        for node in &page {
            out.push(NodeRecord::from_json(node)?);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_escape_reserved_segments() {
        let transport = HttpTransport::new("localhost", 7474, "/db/data/", &BTreeMap::new()).unwrap();
        let url = transport
            .url(&["index", "node", "tests-Mouse", "<<type>>", "a b"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:7474/db/data/index/node/tests-Mouse/%3C%3Ctype%3E%3E/a%20b"
        );
    }

    #[test]
    fn bad_timeout_is_configuration_error() {
        let mut options = BTreeMap::new();
        options.insert("timeout_secs".to_owned(), "soon".to_owned());
        let err = HttpTransport::new("localhost", 7474, "db/data", &options).unwrap_err();
        assert_eq!(err.code(), "Configuration");
    }

    #[test]
    fn server_messages_are_extracted() {
        assert_eq!(error_message(r#"{"message": "boom"}"#), "boom");
        assert_eq!(error_message("plain"), "plain");
    }
}
