//! Query construction and execution.
//!
//! A [`QuerySet`] accumulates lookups into an immutable [`Query`]; iterating
//! it picks one of four plans:
//!
//! * **ids**: `id` / `id__in` lookups fetch nodes directly,
//! * **index**: indexed lookups run one structured query against the family
//!   index, anchored by the model's type key,
//! * **graph**: related lookups and related-manager scopes run one graph
//!   query,
//! * **traversal**: everything else walks the type graph from the model's type
//!   node with a server-side return filter.
//!
//! Every plan re-checks candidates in memory and verifies their type before
//! they are yielded.

mod aggregate;
mod engine;
mod queryset;
mod select_related;

use std::sync::Arc;

use crate::condition::Condition;
use crate::model::Model;
use crate::transport::{Direction, NodeId};

pub use aggregate::DateKind;
pub use engine::{PlanKind, QueryIter};
pub use queryset::QuerySet;

/// Which relationships to fetch alongside query results.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum SelectRelated {
    /// Relationships load lazily on first access.
    #[default]
    None,
    /// Every relationship path up to this many hops.
    Depth(u32),
    /// Named paths such as `"owner__home"`.
    Fields(Vec<String>),
}

/// Sort key of an ordered query.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderKey {
    /// Property name, or `id`.
    pub field: String,
    /// Largest first when true.
    pub descending: bool,
}

/// Restricts a query to nodes related to one owner node.
#[derive(Clone, Debug, PartialEq)]
pub struct StartScope {
    /// Owner node.
    pub owner: NodeId,
    /// Edge type.
    pub rel_type: String,
    /// Direction from the owner.
    pub direction: Direction,
}

/// Immutable description of a query over one model and its subtypes.
#[derive(Clone, Debug)]
pub struct Query {
    pub(crate) model: Arc<Model>,
    pub(crate) conditions: Vec<Condition>,
    pub(crate) max_depth: Option<u32>,
    pub(crate) select_related: SelectRelated,
    pub(crate) order_by: Vec<OrderKey>,
    pub(crate) offset: usize,
    pub(crate) limit: Option<usize>,
    pub(crate) start: Option<StartScope>,
}

impl Query {
    pub(crate) fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            conditions: Vec::new(),
            max_depth: None,
            select_related: SelectRelated::None,
            order_by: Vec::new(),
            offset: 0,
            limit: None,
            start: None,
        }
    }

    /// Queried model.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Resolved lookups, all of which must hold.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Sort keys.
    pub fn order_by(&self) -> &[OrderKey] {
        &self.order_by
    }

    /// `(offset, limit)` applied after ordering.
    pub fn window(&self) -> (usize, Option<usize>) {
        (self.offset, self.limit)
    }

    /// Related-manager scope, if any.
    pub fn start(&self) -> Option<&StartScope> {
        self.start.as_ref()
    }

    /// Relationships fetched with the results.
    pub fn select_related(&self) -> &SelectRelated {
        &self.select_related
    }

    /// Whether the query needs a graph query rather than an index or
    /// traversal plan.
    pub(crate) fn needs_graph(&self) -> bool {
        self.start.is_some() || self.conditions.iter().any(Condition::is_related)
    }

    /// Narrows the result window to `start..end` of the current window.
    pub(crate) fn narrow(&mut self, start: usize, end: usize) {
        let len = end.saturating_sub(start);
        let available = self.limit.map(|limit| limit.saturating_sub(start));
        self.offset += start;
        self.limit = Some(available.map_or(len, |available| available.min(len)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, RegistryBuilder};
    use crate::property::Property;

    fn query() -> Query {
        let registry = RegistryBuilder::new()
            .register(ModelBuilder::new("tests", "Person").property("name", Property::string()))
            .build()
            .unwrap();
        Query::new(registry.get("tests.Person").unwrap())
    }

    #[test]
    fn narrowing_composes_windows() {
        let mut q = query();
        q.narrow(2, 10);
        assert_eq!(q.window(), (2, Some(8)));
        q.narrow(1, 3);
        assert_eq!(q.window(), (3, Some(2)));
        q.narrow(5, 9);
        assert_eq!(q.window(), (8, Some(0)));
    }
}
