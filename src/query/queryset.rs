//! Fluent query builder and its terminal operations.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use tracing::info;

use crate::condition::{Condition, Q, LOOKUP_SEP};
use crate::config::DEFAULT_ALIAS;
use crate::cypher::CypherBuilder;
use crate::error::{GraphOrmError, Result};
use crate::model::{Instance, Model};
use crate::query::engine::{count_matches, QueryIter};
use crate::query::{OrderKey, Query, SelectRelated, StartScope};
use crate::store::Store;
use crate::transport::{Direction, NodeId, ScriptCall};
use crate::value::Value;

/// Lazily evaluated query over one model and its subtypes.
///
/// Builder methods never fail; a bad lookup is remembered and reported by the
/// first terminal operation.
#[derive(Clone, Debug)]
pub struct QuerySet {
    pub(super) store: Store,
    pub(super) alias: String,
    pub(super) query: Result<Query>,
}

impl QuerySet {
    pub(crate) fn new(store: Store, model: Result<Arc<Model>>) -> Self {
        Self {
            store,
            alias: DEFAULT_ALIAS.to_owned(),
            query: model.map(Query::new),
        }
    }

    fn edit(mut self, f: impl FnOnce(&Store, &mut Query) -> Result<()>) -> Self {
        if let Ok(query) = self.query.as_mut() {
            if let Err(err) = f(&self.store, query) {
                self.query = Err(err);
            }
        }
        self
    }

    /// Built query, or the first builder error.
    pub fn query(&self) -> Result<&Query> {
        self.query.as_ref().map_err(Clone::clone)
    }

    /// Database alias the query runs against.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Keeps instances matching `lookup`.
    pub fn filter(self, lookup: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.edit(|store, query| {
            let condition = Condition::parse(&query.model, store.registry(), lookup, value)?;
            query.conditions.push(condition);
            Ok(())
        })
    }

    /// Drops instances matching `lookup`.
    pub fn exclude(self, lookup: &str, value: impl Into<Value>) -> Self {
        self.exclude_q(Q::new(lookup, value))
    }

    /// Keeps instances matching every lookup of `q`.
    pub fn filter_q(self, q: Q) -> Self {
        self.edit(|store, query| {
            let conditions = q.resolve(&query.model, store.registry())?;
            query.conditions.extend(conditions);
            Ok(())
        })
    }

    /// Adds the negation of each lookup of `q`.
    pub fn exclude_q(self, q: Q) -> Self {
        self.filter_q(!q)
    }

    /// Sorts by properties (or `id`); a leading `-` sorts descending.
    pub fn order_by(self, fields: &[&str]) -> Self {
        self.edit(|_, query| {
            query.order_by.clear();
            for field in fields {
                let (name, descending) = match field.strip_prefix('-') {
                    Some(name) => (name, true),
                    None => (*field, false),
                };
                let known = matches!(name, "id" | "pk") || query.model.property(name).is_some();
                if !known {
                    return Err(GraphOrmError::field(format!(
                        "cannot order {} by unknown field '{name}'",
                        query.model.type_name()
                    )));
                }
                query.order_by.push(OrderKey {
                    field: name.to_owned(),
                    descending,
                });
            }
            Ok(())
        })
    }

    /// Fetches the named relationship paths along with the results.
    pub fn select_related(self, fields: &[&str]) -> Self {
        self.edit(|_, query| {
            query.select_related = SelectRelated::Fields(fields.iter().map(|f| (*f).to_owned()).collect());
            Ok(())
        })
    }

    /// Fetches every relationship path up to `depth` hops.
    pub fn select_related_depth(self, depth: u32) -> Self {
        self.edit(|_, query| {
            query.select_related = if depth == 0 {
                SelectRelated::None
            } else {
                SelectRelated::Depth(depth)
            };
            Ok(())
        })
    }

    /// Restricts the result window to `range` of the current window.
    pub fn slice(self, range: Range<usize>) -> Self {
        self.edit(|_, query| {
            query.narrow(range.start, range.end);
            Ok(())
        })
    }

    /// Runs against another database alias.
    pub fn using(mut self, alias: &str) -> Self {
        self.alias = alias.to_owned();
        self
    }

    /// Bounds the type-graph walk of traversal plans.
    pub fn max_depth(self, depth: u32) -> Self {
        self.edit(|_, query| {
            query.max_depth = Some(depth);
            Ok(())
        })
    }

    /// Restricts results to neighbours of `owner` over `rel_type`.
    pub(crate) fn related_to(self, owner: NodeId, rel_type: String, direction: Direction) -> Self {
        self.edit(|_, query| {
            query.start = Some(StartScope {
                owner,
                rel_type,
                direction,
            });
            Ok(())
        })
    }

    /// Lazy iterator over the results.
    pub fn iter(&self) -> QueryIter {
        QueryIter::new(self.store.clone(), self.alias.clone(), self.query.clone())
    }

    /// Every result.
    pub fn all(&self) -> Result<Vec<Instance>> {
        self.iter().collect()
    }

    /// The single matching instance.
    pub fn get(&self) -> Result<Instance> {
        let query = self.query()?;
        let mut matches = self.all()?;
        match matches.len() {
            0 => Err(GraphOrmError::DoesNotExist(query.model.name().to_owned())),
            1 => Ok(matches.remove(0)),
            count => Err(GraphOrmError::MultipleObjects {
                model: query.model.name().to_owned(),
                count,
            }),
        }
    }

    /// Shorthand for `filter(lookup, value).get()`.
    pub fn get_by(&self, lookup: &str, value: impl Into<Value>) -> Result<Instance> {
        self.clone().filter(lookup, value).get()
    }

    /// First result, if any.
    pub fn first(&self) -> Result<Option<Instance>> {
        self.clone().slice(0..1).iter().next().transpose()
    }

    /// Number of matches within the current window.
    pub fn count(&self) -> Result<usize> {
        let query = self.query()?;
        let transport = self.store.transport(&self.alias)?;
        let total = count_matches(transport.as_ref(), query)?;
        let remaining = total.saturating_sub(query.offset);
        Ok(query.limit.map_or(remaining, |limit| remaining.min(limit)))
    }

    /// Whether anything matches.
    pub fn exists(&self) -> Result<bool> {
        Ok(self.first()?.is_some())
    }

    /// Ids of the results, in iteration order.
    pub fn ids(&self) -> Result<Vec<NodeId>> {
        self.iter().map(|item| item.and_then(|instance| instance.pk())).collect()
    }

    /// Matching instances among `ids`, keyed by id.
    pub fn in_bulk(&self, ids: &[NodeId]) -> Result<BTreeMap<NodeId, Instance>> {
        let ids = Value::List(ids.iter().copied().map(Value::from).collect());
        self.clone()
            .filter("id__in", ids)
            .iter()
            .map(|item| item.and_then(|instance| Ok((instance.pk()?, instance))))
            .collect()
    }

    /// Creates and saves an instance of the queried model.
    ///
    /// Ids are assigned by the server; passing `id` or `pk` is a validation
    /// error.
    pub fn create<'a, I>(&self, values: I) -> Result<Instance>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let query = self.query()?;
        let values: Vec<(&str, Value)> = values.into_iter().collect();
        if let Some((name, _)) = values.iter().find(|(name, _)| matches!(*name, "id" | "pk")) {
            return Err(GraphOrmError::validation(format!(
                "'{name}' is assigned by the database and cannot be set on create"
            )));
        }
        let instance = Instance::new(self.store.clone(), Arc::clone(&query.model), &self.alias);
        instance.set_many(values)?;
        instance.save()?;
        Ok(instance)
    }

    /// The instance matching every lookup, created from the plain property
    /// lookups when there is none. Not race-free.
    pub fn get_or_create<'a, I>(&self, lookups: I) -> Result<(Instance, bool)>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let lookups: Vec<(&str, Value)> = lookups.into_iter().collect();
        let mut filtered = self.clone();
        for (lookup, value) in &lookups {
            filtered = filtered.filter(lookup, value.clone());
        }
        match filtered.get() {
            Ok(instance) => Ok((instance, false)),
            Err(GraphOrmError::DoesNotExist(_)) => {
                let values = lookups.into_iter().filter_map(|(lookup, value)| {
                    let name = lookup.strip_suffix("__exact").unwrap_or(lookup);
                    (!name.contains(LOOKUP_SEP)).then_some((name, value))
                });
                Ok((self.create(values)?, true))
            }
            Err(err) => Err(err),
        }
    }

    /// Assigns `values` to every match and returns how many were updated.
    ///
    /// Values are cleaned like a save. Indexed properties are rewritten
    /// together with their index entries in one server-side call; a unique
    /// key held elsewhere is a uniqueness error.
    pub fn update<'a, I>(&self, values: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let query = self.query()?;
        let model = Arc::clone(&query.model);
        let mut assignments = Vec::new();
        for (name, value) in values {
            let prop = model.property(name).ok_or_else(|| {
                if matches!(name, "id" | "pk") {
                    GraphOrmError::validation(format!("'{name}' cannot be updated"))
                } else {
                    GraphOrmError::field(format!("{} has no property '{name}'", model.type_name()))
                }
            })?;
            let coerced = prop.coerce(&value)?;
            prop.validate(&coerced)?;
            let stored = prop.to_stored(&coerced)?;
            assignments.push((prop.clone(), coerced, stored));
        }
        let ids = self.ids()?;
        if ids.is_empty() || assignments.is_empty() {
            return Ok(0);
        }
        let transport = self.store.transport(&self.alias)?;
        for (prop, value, stored) in assignments {
            if prop.is_indexed() {
                let index_keys = prop.index_keys(&value)?;
                if prop.is_unique() && ids.len() > 1 && !index_keys.is_empty() {
                    return Err(GraphOrmError::uniqueness(model.name(), prop.name(), value.to_string()));
                }
                let result = transport.run_script(&ScriptCall::UpdateIndexed {
                    index_name: model.index_name(),
                    key: prop.name().to_owned(),
                    nodes: ids.iter().map(|id| id.0).collect(),
                    value: stored,
                    index_keys,
                    unique: prop.is_unique(),
                })?;
                if result.get("conflict").is_some_and(|c| !c.is_null()) {
                    return Err(GraphOrmError::uniqueness(model.name(), prop.name(), value.to_string()));
                }
            } else {
                for chunk in ids.chunks(self.store.chunk_size()) {
                    let update = CypherBuilder::new()
                        .start_nodes("n", chunk.to_vec())
                        .set("n", prop.name(), stored.clone())
                        .build()?;
                    transport.cypher(&update)?;
                }
            }
        }
        info!(model = %model.type_name(), updated = ids.len(), "graphorm.query.updated");
        Ok(ids.len())
    }

    /// Deletes every match through the instance delete path.
    pub fn delete(&self) -> Result<usize> {
        let instances = self.all()?;
        for instance in &instances {
            instance.delete()?;
        }
        if let Ok(query) = self.query() {
            info!(model = %query.model.type_name(), deleted = instances.len(), "graphorm.query.deleted");
        }
        Ok(instances.len())
    }
}

impl<'a> IntoIterator for &'a QuerySet {
    type Item = Result<Instance>;
    type IntoIter = QueryIter;

    fn into_iter(self) -> QueryIter {
        self.iter()
    }
}
