//! Declarative graph-query construction.
//!
//! Queries are assembled with [`CypherBuilder`], which tracks bound
//! identifiers and records the first misuse so that the error surfaces from
//! [`CypherBuilder::build`]:
//!
//! ```
//! use graphorm::cypher::{CypherBuilder, PathPattern, RelPattern, ReturnExpr};
//! use graphorm::transport::{Direction, NodeId};
//!
//! let query = CypherBuilder::new()
//!     .start_nodes("t", vec![NodeId(1)])
//!     .match_path(PathPattern::starting_at("t").step(RelPattern::single("<<INSTANCE>>", Direction::Out), Some("n")))
//!     .returns(ReturnExpr::Id("n".into()), Some("id"))
//!     .build()
//!     .unwrap();
//! assert_eq!(query.returns_names(), vec!["id".to_string()]);
//! ```

pub mod ast;

use std::collections::BTreeSet;

use serde_json::{Map, Value as JsonValue};

use crate::error::{GraphOrmError, Result};
use crate::filter::FilterExpr;
use crate::index_query::IndexQuery;
use crate::transport::NodeId;

pub use ast::{
    OrderItem, PathPattern, Predicate, QueryPart, RelPattern, ReturnExpr, ReturnItem, SetItem,
    StartClause, StartPoint, WithClause,
};

/// Positional query parameters `{p0}`, `{p1}`, ...
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params {
    values: Map<String, JsonValue>,
}

impl Params {
    /// Stores a value and returns its placeholder.
    pub fn push(&mut self, value: JsonValue) -> String {
        let name = format!("p{}", self.values.len());
        self.values.insert(name.clone(), value);
        format!("{{{name}}}")
    }

    /// Looks up a stored value by name.
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }

    /// Parameter object for the wire payload.
    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.values)
    }
}

/// A complete graph query: one or more parts joined by `UNION ALL`.
#[derive(Clone, Debug, PartialEq)]
pub struct CypherQuery {
    /// Parts in order.
    pub parts: Vec<QueryPart>,
}

impl CypherQuery {
    /// Query text plus parameters.
    pub fn render(&self) -> (String, JsonValue) {
        let mut params = Params::default();
        let text: Vec<String> = self.parts.iter().map(|p| p.render(&mut params)).collect();
        (text.join(" UNION ALL "), params.into_json())
    }

    /// Column names shared by every part.
    pub fn returns_names(&self) -> Vec<String> {
        self.parts
            .first()
            .map(QueryPart::returns_names)
            .unwrap_or_default()
    }
}

/// Fluent builder for [`CypherQuery`].
#[derive(Debug, Default)]
pub struct CypherBuilder {
    parts: Vec<QueryPart>,
    current: QueryPart,
    bound: BTreeSet<String>,
    error: Option<GraphOrmError>,
}

impl CypherBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(&mut self, msg: String) {
        if self.error.is_none() {
            self.error = Some(GraphOrmError::validation(msg));
        }
    }

    fn require_bound(&mut self, var: &str, clause: &str) -> bool {
        if self.bound.contains(var) {
            true
        } else {
            self.fail(format!("{clause} references unbound identifier '{var}'"));
            false
        }
    }

    fn bind_start(mut self, var: &str, point: StartPoint) -> Self {
        if self.error.is_some() {
            return self;
        }
        if !self.bound.insert(var.to_owned()) {
            self.fail(format!("identifier '{var}' is already bound"));
            return self;
        }
        self.current.starts.push(StartClause {
            var: var.to_owned(),
            point,
        });
        self
    }

    /// `START var=node(ids)`.
    pub fn start_nodes(self, var: &str, ids: Vec<NodeId>) -> Self {
        self.bind_start(var, StartPoint::Nodes(ids))
    }

    /// `START var=node:index(query)`.
    pub fn start_index(self, var: &str, index: &str, query: IndexQuery) -> Self {
        self.bind_start(
            var,
            StartPoint::IndexQuery {
                index: index.to_owned(),
                query,
            },
        )
    }

    /// `START var=node:index(key=value)`.
    pub fn start_lookup(self, var: &str, index: &str, key: &str, value: &str) -> Self {
        self.bind_start(
            var,
            StartPoint::IndexLookup {
                index: index.to_owned(),
                key: key.to_owned(),
                value: value.to_owned(),
            },
        )
    }

    /// Adds a `MATCH` pattern; its start identifier must already be bound.
    pub fn match_path(mut self, path: PathPattern) -> Self {
        if self.error.is_some() {
            return self;
        }
        if !self.require_bound(&path.start.clone(), "MATCH") {
            return self;
        }
        if let Some(name) = &path.name {
            if self.bound.contains(name) {
                self.fail(format!("path identifier '{name}' is already bound"));
                return self;
            }
        }
        self.bound.extend(path.names());
        self.current.matches.push(path);
        self
    }

    /// Adds a `WHERE` predicate (after `WITH` when one is present).
    pub fn where_(mut self, var: &str, expr: FilterExpr) -> Self {
        if self.error.is_some() || !self.require_bound(var, "WHERE") {
            return self;
        }
        if expr == FilterExpr::True {
            return self;
        }
        let predicate = Predicate {
            var: var.to_owned(),
            expr,
        };
        if self.current.with.is_some() {
            self.current.post_predicates.push(predicate);
        } else {
            self.current.predicates.push(predicate);
        }
        self
    }

    /// `WITH [DISTINCT] vars`; only the listed identifiers stay bound.
    pub fn with(mut self, distinct: bool, vars: &[&str]) -> Self {
        if self.error.is_some() {
            return self;
        }
        if self.current.with.is_some() {
            self.fail("only one WITH stage is supported per part".to_owned());
            return self;
        }
        for var in vars {
            if !self.require_bound(var, "WITH") {
                return self;
            }
        }
        self.bound = vars.iter().map(|v| (*v).to_owned()).collect();
        self.current.with = Some(WithClause {
            distinct,
            vars: vars.iter().map(|v| (*v).to_owned()).collect(),
        });
        self
    }

    /// `SET var.key = value`.
    pub fn set(mut self, var: &str, key: &str, value: JsonValue) -> Self {
        if self.error.is_some() || !self.require_bound(var, "SET") {
            return self;
        }
        self.current.sets.push(SetItem {
            var: var.to_owned(),
            key: key.to_owned(),
            value,
        });
        self
    }

    /// `DELETE var`.
    pub fn delete(mut self, var: &str) -> Self {
        if self.error.is_some() || !self.require_bound(var, "DELETE") {
            return self;
        }
        self.current.deletes.push(var.to_owned());
        self
    }

    /// Adds a projection column.
    pub fn returns(mut self, expr: ReturnExpr, alias: Option<&str>) -> Self {
        self.push_return(expr, alias);
        self
    }

    fn push_return(&mut self, expr: ReturnExpr, alias: Option<&str>) {
        if self.error.is_some() {
            return;
        }
        if let Some(var) = expr.var() {
            if !self.require_bound(&var.to_owned(), "RETURN") {
                return;
            }
        }
        self.current.returns.push(ReturnItem {
            expr,
            alias: alias.map(str::to_owned),
        });
    }

    /// Marks the projection distinct.
    pub fn distinct(mut self) -> Self {
        self.current.distinct = true;
        self
    }

    /// Adds a sort key.
    pub fn order_by(mut self, expr: ReturnExpr, descending: bool) -> Self {
        if self.error.is_some() {
            return self;
        }
        if let Some(var) = expr.var() {
            if !self.require_bound(&var.to_owned(), "ORDER BY") {
                return self;
            }
        }
        self.current.order_by.push(OrderItem { expr, descending });
        self
    }

    /// `SKIP n`.
    pub fn skip(mut self, skip: usize) -> Self {
        self.current.skip = Some(skip);
        self
    }

    /// `LIMIT n`.
    pub fn limit(mut self, limit: usize) -> Self {
        self.current.limit = Some(limit);
        self
    }

    /// Closes the current part and starts a new one joined by `UNION ALL`.
    pub fn union(mut self) -> Self {
        let part = std::mem::take(&mut self.current);
        self.parts.push(part);
        self.bound.clear();
        self
    }

    /// Validates and returns the query.
    pub fn build(mut self) -> Result<CypherQuery> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        let last = std::mem::take(&mut self.current);
        self.parts.push(last);
        for part in &self.parts {
            if part.starts.is_empty() {
                return Err(GraphOrmError::validation("query part without START clause"));
            }
            if part.returns.is_empty() && part.sets.is_empty() && part.deletes.is_empty() {
                return Err(GraphOrmError::validation(
                    "query part neither returns nor mutates anything",
                ));
            }
        }
        let columns = self.parts[0].returns_names();
        if self.parts.iter().any(|p| p.returns_names() != columns) {
            return Err(GraphOrmError::validation(
                "all UNION parts must return the same columns",
            ));
        }
        Ok(CypherQuery { parts: self.parts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOp;
    use crate::transport::Direction;

    fn instances_of(builder: CypherBuilder) -> CypherBuilder {
        builder.start_nodes("t", vec![NodeId(4)]).match_path(
            PathPattern::starting_at("t")
                .step(RelPattern::single("<<TYPE>>", Direction::Out).repeated(0, None), None)
                .step(RelPattern::single("<<INSTANCE>>", Direction::Out), Some("n")),
        )
    }

    #[test]
    fn renders_start_match_where_return() {
        let query = instances_of(CypherBuilder::new())
            .where_("n", FilterExpr::compare("age", FilterOp::Gt, 13))
            .returns(ReturnExpr::Id("n".into()), Some("id"))
            .order_by(ReturnExpr::Property("n".into(), "age".into()), true)
            .limit(2)
            .build()
            .unwrap();
        let (text, params) = query.render();
        assert_eq!(
            text,
            "START t=node({p0}) MATCH (t)-[:`<<TYPE>>`*0..]->()-[:`<<INSTANCE>>`]->(n) \
             WHERE (has(n.`age`) AND n.`age` > {p1}) RETURN id(n) AS id ORDER BY n.`age` DESC LIMIT 2"
        );
        assert_eq!(params["p0"], serde_json::json!([4]));
    }

    #[test]
    fn unbound_identifiers_surface_at_build() {
        let err = CypherBuilder::new()
            .start_nodes("t", vec![NodeId(1)])
            .where_("n", FilterExpr::True)
            .returns(ReturnExpr::Node("t".into()), None)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[test]
    fn with_restricts_bound_names() {
        let err = instances_of(CypherBuilder::new())
            .with(true, &["n"])
            .returns(ReturnExpr::Id("t".into()), None)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("'t'"));
    }

    #[test]
    fn union_parts_share_columns() {
        let ok = instances_of(CypherBuilder::new())
            .returns(ReturnExpr::Id("n".into()), Some("id"))
            .union();
        let err = instances_of(ok)
            .returns(ReturnExpr::Id("n".into()), Some("other"))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }
}
