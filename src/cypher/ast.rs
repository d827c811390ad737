//! Graph-query syntax tree.
//!
//! Each clause renders itself to text; operands are always passed as
//! parameters so user values never need escaping.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde_json::Value as JsonValue;

use crate::cypher::Params;
use crate::filter::FilterExpr;
use crate::index_query::IndexQuery;
use crate::transport::{Direction, NodeId};

/// Where a `START` binding comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum StartPoint {
    /// Explicit node ids.
    Nodes(Vec<NodeId>),
    /// Structured index query.
    IndexQuery {
        /// Index name.
        index: String,
        /// Query.
        query: IndexQuery,
    },
    /// Exact index lookup.
    IndexLookup {
        /// Index name.
        index: String,
        /// Key.
        key: String,
        /// Value.
        value: String,
    },
}

/// `var = <point>` in the `START` clause.
#[derive(Clone, Debug, PartialEq)]
pub struct StartClause {
    /// Bound identifier.
    pub var: String,
    /// Source of the binding.
    pub point: StartPoint,
}

/// One relationship hop in a path pattern.
#[derive(Clone, Debug, PartialEq)]
pub struct RelPattern {
    /// Optional identifier for the edge (or edge list when variable length).
    pub var: Option<String>,
    /// Allowed types; empty means any.
    pub types: Vec<String>,
    /// Direction relative to the left node.
    pub direction: Direction,
    /// Variable-length bounds `(min, max)`; `None` for a single hop.
    pub length: Option<(u32, Option<u32>)>,
}

impl RelPattern {
    /// Single hop over one type.
    pub fn single(rel_type: impl Into<String>, direction: Direction) -> Self {
        Self {
            var: None,
            types: vec![rel_type.into()],
            direction,
            length: None,
        }
    }

    /// Single hop over any of `types`; empty means any type.
    pub fn any_of<I, S>(types: I, direction: Direction) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            var: None,
            types: types.into_iter().map(Into::into).collect(),
            direction,
            length: None,
        }
    }

    /// Names the edge.
    pub fn named(mut self, var: impl Into<String>) -> Self {
        self.var = Some(var.into());
        self
    }

    /// Turns the hop into a variable-length expansion.
    pub fn repeated(mut self, min: u32, max: Option<u32>) -> Self {
        self.length = Some((min, max));
        self
    }

    fn render(&self, out: &mut String) {
        out.push_str(if self.direction == Direction::In { "<-[" } else { "-[" });
        if let Some(var) = &self.var {
            out.push_str(var);
        }
        for (idx, rel_type) in self.types.iter().enumerate() {
            out.push_str(if idx == 0 { ":" } else { "|" });
            let _ = write!(out, "`{rel_type}`");
        }
        if let Some((min, max)) = self.length {
            let _ = write!(out, "*{min}..");
            if let Some(max) = max {
                let _ = write!(out, "{max}");
            }
        }
        out.push_str(if self.direction == Direction::Out { "]->" } else { "]-" });
    }
}

/// `name=(start)-[..]->(n1)-[..]->(n2)`.
#[derive(Clone, Debug, PartialEq)]
pub struct PathPattern {
    /// Optional path identifier.
    pub name: Option<String>,
    /// Already-bound start node.
    pub start: String,
    /// Hops and the (optionally named) node each one reaches.
    pub steps: Vec<(RelPattern, Option<String>)>,
}

impl PathPattern {
    /// Path starting at a bound node.
    pub fn starting_at(start: impl Into<String>) -> Self {
        Self {
            name: None,
            start: start.into(),
            steps: Vec::new(),
        }
    }

    /// Names the path.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Appends a hop.
    pub fn step(mut self, rel: RelPattern, node: Option<&str>) -> Self {
        self.steps.push((rel, node.map(str::to_owned)));
        self
    }

    /// Identifiers introduced or referenced by the pattern.
    pub fn names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        names.insert(self.start.clone());
        names.extend(self.name.clone());
        for (rel, node) in &self.steps {
            names.extend(rel.var.clone());
            names.extend(node.clone());
        }
        names
    }

    fn render(&self, out: &mut String) {
        if let Some(name) = &self.name {
            let _ = write!(out, "{name}=");
        }
        let _ = write!(out, "({})", self.start);
        for (rel, node) in &self.steps {
            rel.render(out);
            let _ = write!(out, "({})", node.as_deref().unwrap_or(""));
        }
    }
}

/// Predicate on a bound identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    /// Identifier the expression inspects.
    pub var: String,
    /// Expression.
    pub expr: FilterExpr,
}

/// Projection expression.
#[derive(Clone, Debug, PartialEq)]
pub enum ReturnExpr {
    /// The bound node or edge itself.
    Node(String),
    /// `id(x)`.
    Id(String),
    /// `x.key`.
    Property(String, String),
    /// `type(r)`.
    TypeOf(String),
    /// `count(*)`.
    Count,
    /// `count(distinct x)`.
    CountDistinct(String),
    /// `min(x.key)`.
    Min(String, String),
    /// `max(x.key)`.
    Max(String, String),
    /// `sum(x.key)`.
    Sum(String, String),
    /// `avg(x.key)`.
    Avg(String, String),
    /// `length(p)`.
    Length(String),
    /// Ids of the nodes along a path.
    NodeIds(String),
    /// Ids of the edges along a path.
    RelIds(String),
}

impl ReturnExpr {
    /// Identifier the expression reads, if any.
    pub fn var(&self) -> Option<&str> {
        match self {
            ReturnExpr::Count => None,
            ReturnExpr::Node(v)
            | ReturnExpr::Id(v)
            | ReturnExpr::TypeOf(v)
            | ReturnExpr::CountDistinct(v)
            | ReturnExpr::Length(v)
            | ReturnExpr::NodeIds(v)
            | ReturnExpr::RelIds(v)
            | ReturnExpr::Property(v, _)
            | ReturnExpr::Min(v, _)
            | ReturnExpr::Max(v, _)
            | ReturnExpr::Sum(v, _)
            | ReturnExpr::Avg(v, _) => Some(v),
        }
    }

    /// Whether the expression folds rows.
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            ReturnExpr::Count
                | ReturnExpr::CountDistinct(_)
                | ReturnExpr::Min(..)
                | ReturnExpr::Max(..)
                | ReturnExpr::Sum(..)
                | ReturnExpr::Avg(..)
        )
    }

    /// Query text.
    pub fn render(&self) -> String {
        match self {
            ReturnExpr::Node(v) => v.clone(),
            ReturnExpr::Id(v) => format!("id({v})"),
            ReturnExpr::Property(v, k) => format!("{v}.`{k}`"),
            ReturnExpr::TypeOf(v) => format!("type({v})"),
            ReturnExpr::Count => "count(*)".to_owned(),
            ReturnExpr::CountDistinct(v) => format!("count(distinct {v})"),
            ReturnExpr::Min(v, k) => format!("min({v}.`{k}`)"),
            ReturnExpr::Max(v, k) => format!("max({v}.`{k}`)"),
            ReturnExpr::Sum(v, k) => format!("sum({v}.`{k}`)"),
            ReturnExpr::Avg(v, k) => format!("avg({v}.`{k}`)"),
            ReturnExpr::Length(v) => format!("length({v})"),
            ReturnExpr::NodeIds(v) => format!("extract(x IN nodes({v}) | id(x))"),
            ReturnExpr::RelIds(v) => format!("extract(x IN relationships({v}) | id(x))"),
        }
    }
}

/// Projection with an optional column alias.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnItem {
    /// Expression.
    pub expr: ReturnExpr,
    /// Column name override.
    pub alias: Option<String>,
}

impl ReturnItem {
    /// Column name in the result table.
    pub fn column(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.expr.render())
    }
}

/// Sort key.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderItem {
    /// Expression.
    pub expr: ReturnExpr,
    /// Descending when true.
    pub descending: bool,
}

/// `WITH [DISTINCT] a, b [WHERE ...]`.
#[derive(Clone, Debug, PartialEq)]
pub struct WithClause {
    /// Deduplicate carried rows.
    pub distinct: bool,
    /// Identifiers carried forward.
    pub vars: Vec<String>,
}

/// `SET x.key = value`; a null value removes the property.
#[derive(Clone, Debug, PartialEq)]
pub struct SetItem {
    /// Target identifier.
    pub var: String,
    /// Property name.
    pub key: String,
    /// New stored value.
    pub value: JsonValue,
}

/// One `START ... RETURN` block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryPart {
    /// `START` bindings.
    pub starts: Vec<StartClause>,
    /// `MATCH` patterns.
    pub matches: Vec<PathPattern>,
    /// `WHERE` conjunction.
    pub predicates: Vec<Predicate>,
    /// Optional `WITH` stage.
    pub with: Option<WithClause>,
    /// Predicates applied after `WITH`.
    pub post_predicates: Vec<Predicate>,
    /// `SET` assignments.
    pub sets: Vec<SetItem>,
    /// `DELETE` targets.
    pub deletes: Vec<String>,
    /// `RETURN DISTINCT` when true.
    pub distinct: bool,
    /// Projection.
    pub returns: Vec<ReturnItem>,
    /// Sort keys.
    pub order_by: Vec<OrderItem>,
    /// Rows to skip.
    pub skip: Option<usize>,
    /// Maximum rows.
    pub limit: Option<usize>,
}

impl QueryPart {
    /// Every identifier the part reads.
    pub fn required_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for path in &self.matches {
            names.insert(path.start.clone());
        }
        for pred in self.predicates.iter().chain(&self.post_predicates) {
            names.insert(pred.var.clone());
        }
        if let Some(with) = &self.with {
            names.extend(with.vars.iter().cloned());
        }
        for item in &self.returns {
            names.extend(item.expr.var().map(str::to_owned));
        }
        for item in &self.order_by {
            names.extend(item.expr.var().map(str::to_owned));
        }
        names.extend(self.sets.iter().map(|s| s.var.clone()));
        names.extend(self.deletes.iter().cloned());
        names
    }

    /// Column names of the projection.
    pub fn returns_names(&self) -> Vec<String> {
        self.returns.iter().map(ReturnItem::column).collect()
    }

    pub(crate) fn render(&self, params: &mut Params) -> String {
        let mut out = String::new();
        if !self.starts.is_empty() {
            out.push_str("START ");
            for (idx, start) in self.starts.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}=", start.var);
                match &start.point {
                    StartPoint::Nodes(ids) => {
                        let ids: Vec<u64> = ids.iter().map(|id| id.0).collect();
                        let slot = params.push(JsonValue::from(ids));
                        let _ = write!(out, "node({slot})");
                    }
                    StartPoint::IndexQuery { index, query } => {
                        let slot = params.push(JsonValue::from(query.to_string()));
                        let _ = write!(out, "node:`{index}`({slot})");
                    }
                    StartPoint::IndexLookup { index, key, value } => {
                        let slot = params.push(JsonValue::from(value.as_str()));
                        let _ = write!(out, "node:`{index}`(`{key}`={slot})");
                    }
                }
            }
        }
        if !self.matches.is_empty() {
            out.push_str(" MATCH ");
            for (idx, path) in self.matches.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                path.render(&mut out);
            }
        }
        render_predicates(&mut out, &self.predicates, params);
        if let Some(with) = &self.with {
            out.push_str(" WITH ");
            if with.distinct {
                out.push_str("DISTINCT ");
            }
            out.push_str(&with.vars.join(", "));
            render_predicates(&mut out, &self.post_predicates, params);
        }
        if !self.sets.is_empty() {
            out.push_str(" SET ");
            let rendered: Vec<String> = self
                .sets
                .iter()
                .map(|s| {
                    let slot = params.push(s.value.clone());
                    format!("{}.`{}` = {slot}", s.var, s.key)
                })
                .collect();
            out.push_str(&rendered.join(", "));
        }
        if !self.deletes.is_empty() {
            let _ = write!(out, " DELETE {}", self.deletes.join(", "));
        }
        if !self.returns.is_empty() {
            out.push_str(" RETURN ");
            if self.distinct {
                out.push_str("DISTINCT ");
            }
            let rendered: Vec<String> = self
                .returns
                .iter()
                .map(|item| match &item.alias {
                    Some(alias) => format!("{} AS {alias}", item.expr.render()),
                    None => item.expr.render(),
                })
                .collect();
            out.push_str(&rendered.join(", "));
        }
        if !self.order_by.is_empty() {
            out.push_str(" ORDER BY ");
            let rendered: Vec<String> = self
                .order_by
                .iter()
                .map(|o| {
                    if o.descending {
                        format!("{} DESC", o.expr.render())
                    } else {
                        o.expr.render()
                    }
                })
                .collect();
            out.push_str(&rendered.join(", "));
        }
        if let Some(skip) = self.skip {
            let _ = write!(out, " SKIP {skip}");
        }
        if let Some(limit) = self.limit {
            let _ = write!(out, " LIMIT {limit}");
        }
        out.trim_start().to_owned()
    }
}

fn render_predicates(out: &mut String, predicates: &[Predicate], params: &mut Params) {
    if predicates.is_empty() {
        return;
    }
    out.push_str(" WHERE ");
    let rendered: Vec<String> = predicates
        .iter()
        .map(|p| p.expr.to_cypher(&p.var, params))
        .collect();
    out.push_str(&rendered.join(" AND "));
}
