//! Plan selection and lazy result streaming.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use tracing::debug;

use crate::condition::{Condition, ConditionField, Operator};
use crate::cypher::{CypherBuilder, PathPattern, RelPattern, ReturnExpr};
use crate::error::{GraphOrmError, Result};
use crate::filter::FilterExpr;
use crate::index_query::IndexQuery;
use crate::model::Instance;
use crate::query::select_related;
use crate::query::Query;
use crate::store::Store;
use crate::transport::{Direction, GraphTransport, NodeId, NodeRecord, TraversalPager, TraversalSpec};
use crate::typegraph::{type_node, INSTANCE_REL, TYPE_INDEX_KEY, TYPE_REL};
use crate::value::Value;

/// Strategy chosen for a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanKind {
    /// Provably empty; nothing is fetched.
    Empty,
    /// Direct fetch by node id.
    Ids,
    /// Structured query against the family index.
    Index,
    /// Paged walk of the type graph.
    Traversal,
    /// One graph query.
    Graph,
}

/// Candidate nodes of a plan, before re-checking.
pub(crate) struct Candidates {
    kind: PlanKind,
    buffer: VecDeque<NodeRecord>,
    pager: Option<Box<dyn TraversalPager>>,
}

impl Candidates {
    fn ready(kind: PlanKind, records: Vec<NodeRecord>) -> Self {
        Self {
            kind,
            buffer: records.into(),
            pager: None,
        }
    }

    fn paged(pager: Box<dyn TraversalPager>) -> Self {
        Self {
            kind: PlanKind::Traversal,
            buffer: VecDeque::new(),
            pager: Some(pager),
        }
    }

    pub(crate) fn kind(&self) -> PlanKind {
        self.kind
    }

    fn next_record(&mut self) -> Result<Option<NodeRecord>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            let Some(pager) = self.pager.as_mut() else {
                return Ok(None);
            };
            let mut page = Vec::new();
            if !pager.next_batch(&mut page)? {
                self.pager = None;
            }
            self.buffer.extend(page);
        }
    }
}

/// Picks a plan for `query` and fetches (or starts paging) its candidates.
pub(crate) fn plan(store: &Store, alias: &str, query: &Query) -> Result<Candidates> {
    let type_name = query.model.type_name();
    if query.conditions.iter().any(Condition::is_unsatisfiable) {
        debug!(model = %type_name, "graphorm.query.plan_empty");
        return Ok(Candidates::ready(PlanKind::Empty, Vec::new()));
    }
    let transport = store.transport(alias)?;
    let ids = id_candidates(&query.conditions)?;
    if query.needs_graph() {
        let builder = graph_builder(transport.as_ref(), query)?
            .returns(ReturnExpr::Node("n".into()), Some("n"));
        let records = run_node_query(transport.as_ref(), builder)?;
        debug!(model = %type_name, candidates = records.len(), "graphorm.query.plan_graph");
        return Ok(Candidates::ready(PlanKind::Graph, records));
    }
    if let Some(ids) = ids {
        let records = match ids.as_slice() {
            [] => Vec::new(),
            [id] => transport.get_node(*id)?.into_iter().collect(),
            ids => {
                let mut records = Vec::with_capacity(ids.len());
                for chunk in ids.chunks(store.chunk_size()) {
                    records.extend(transport.get_nodes(chunk)?);
                }
                records
            }
        };
        debug!(model = %type_name, candidates = records.len(), "graphorm.query.plan_ids");
        return Ok(Candidates::ready(PlanKind::Ids, records));
    }
    if let Some(index_query) = index_query(query)? {
        let index = query.model.index_name();
        let records = transport.index_query(&index, &index_query)?;
        debug!(
            model = %type_name,
            index = %index,
            query = %index_query,
            candidates = records.len(),
            "graphorm.query.plan_index"
        );
        return Ok(Candidates::ready(PlanKind::Index, records));
    }
    let start = type_node(transport.as_ref(), query.model.chain())?;
    let filters = query
        .conditions
        .iter()
        .map(Condition::filter_expr)
        .collect::<Result<Vec<_>>>()?;
    let spec = TraversalSpec {
        relationships: vec![
            (TYPE_REL.to_owned(), Direction::Out),
            (INSTANCE_REL.to_owned(), Direction::Out),
        ],
        max_depth: query.max_depth,
        return_filter: FilterExpr::all(std::iter::once(FilterExpr::InstanceEdge).chain(filters)),
    };
    let pager = transport.traverse(start, &spec, store.chunk_size())?;
    debug!(model = %type_name, type_node = %start, "graphorm.query.plan_traversal");
    Ok(Candidates::paged(pager))
}

/// Ids named by `id` / `id__in` lookups, or `None` when there are none.
///
/// Conflicting exact ids, and `id__in` sets with no common member, are
/// validation errors.
fn id_candidates(conditions: &[Condition]) -> Result<Option<Vec<NodeId>>> {
    let mut exact: Option<NodeId> = None;
    let mut merged: Option<BTreeSet<NodeId>> = None;
    let mut sets = 0;
    for condition in conditions {
        let Some(ids) = condition.id_set() else {
            continue;
        };
        if condition.op() == Operator::Exact {
            for id in ids {
                match exact {
                    Some(prev) if prev != id => {
                        return Err(GraphOrmError::validation(format!(
                            "conflicting id lookups: {prev} and {id}"
                        )))
                    }
                    _ => exact = Some(id),
                }
            }
        } else {
            let set: BTreeSet<NodeId> = ids.into_iter().collect();
            sets += 1;
            merged = Some(match merged {
                None => set,
                Some(acc) => acc.intersection(&set).copied().collect(),
            });
        }
    }
    if sets > 1 && merged.as_ref().is_some_and(BTreeSet::is_empty) {
        return Err(GraphOrmError::validation("id__in lookups have no id in common"));
    }
    Ok(match (exact, merged) {
        (None, None) => None,
        (Some(id), None) => Some(vec![id]),
        (Some(id), Some(set)) => Some(if set.contains(&id) { vec![id] } else { Vec::new() }),
        (None, Some(set)) => Some(set.into_iter().collect()),
    })
}

/// Conjunction of every index fragment, anchored by the model's type key.
fn index_query(query: &Query) -> Result<Option<IndexQuery>> {
    let mut fragments = Vec::new();
    for condition in &query.conditions {
        if let Some(fragment) = condition.index_fragment()? {
            fragments.push(fragment);
        }
    }
    if fragments.is_empty() {
        return Ok(None);
    }
    let mut parts = vec![IndexQuery::term(TYPE_INDEX_KEY, query.model.type_name())];
    parts.extend(fragments);
    Ok(Some(IndexQuery::and(parts)))
}

/// Graph query binding `n` to every match, up to `WITH DISTINCT n`.
///
/// Instances come from the family index when an index fragment exists and the
/// query is unscoped; otherwise from the model's type subtree, intersected
/// with the owner's neighbours for scoped queries. Each related lookup adds
/// its own path from `n`, with the predicate on the path's last node.
pub(crate) fn graph_builder(transport: &dyn GraphTransport, query: &Query) -> Result<CypherBuilder> {
    let mut builder = CypherBuilder::new();
    let indexed = match query.start {
        Some(_) => None,
        None => index_query(query)?,
    };
    if let Some(index_query) = indexed {
        builder = builder.start_index("n", &query.model.index_name(), index_query);
    } else {
        let type_node = type_node(transport, query.model.chain())?;
        builder = builder.start_nodes("t", vec![type_node]);
        if let Some(scope) = &query.start {
            builder = builder.start_nodes("o", vec![scope.owner]).match_path(
                PathPattern::starting_at("o")
                    .step(RelPattern::single(scope.rel_type.clone(), scope.direction), Some("n")),
            );
        }
        builder = builder.match_path(
            PathPattern::starting_at("t")
                .step(RelPattern::single(TYPE_REL, Direction::Out).repeated(0, None), None)
                .step(RelPattern::single(INSTANCE_REL, Direction::Out), Some("n")),
        );
    }
    let mut related = 0;
    for condition in &query.conditions {
        match condition.field() {
            ConditionField::Related { path, .. } => {
                let mut pattern = PathPattern::starting_at("n");
                let mut end = String::from("n");
                for (hop, step) in path.iter().enumerate() {
                    end = format!("r{related}_{hop}");
                    pattern = pattern.step(
                        RelPattern::single(step.rel_type.clone(), step.direction),
                        Some(&end),
                    );
                }
                builder = builder.match_path(pattern).where_(&end, condition.filter_expr()?);
                related += 1;
            }
            ConditionField::Id | ConditionField::Property(_) => {
                builder = builder.where_("n", condition.filter_expr()?);
            }
        }
    }
    Ok(builder.with(true, &["n"]))
}

/// Runs a query whose `n` column holds nodes.
pub(crate) fn run_node_query(transport: &dyn GraphTransport, builder: CypherBuilder) -> Result<Vec<NodeRecord>> {
    let table = transport.cypher(&builder.build()?)?;
    let col = table.column("n")?;
    table
        .data
        .iter()
        .filter_map(|row| row.get(col))
        .filter(|cell| !cell.is_null())
        .map(NodeRecord::from_json)
        .collect()
}

/// Lazy iterator over query results.
///
/// Nodes are fetched per plan and materialized one chunk at a time. Errors
/// surface as items; iteration stops after the first one.
pub struct QueryIter {
    store: Store,
    alias: String,
    query: Option<Query>,
    candidates: Option<Candidates>,
    seen: BTreeSet<NodeId>,
    skipped: usize,
    yielded: usize,
    ready: VecDeque<Result<Instance>>,
    done: bool,
}

impl QueryIter {
    pub(crate) fn new(store: Store, alias: String, query: Result<Query>) -> Self {
        let mut iter = Self {
            store,
            alias,
            query: None,
            candidates: None,
            seen: BTreeSet::new(),
            skipped: 0,
            yielded: 0,
            ready: VecDeque::new(),
            done: false,
        };
        match query {
            Ok(query) => iter.query = Some(query),
            Err(err) => iter.fail(err),
        }
        iter
    }

    /// Plan the iterator is running, once the first item was requested.
    pub fn plan_kind(&self) -> Option<PlanKind> {
        self.candidates.as_ref().map(Candidates::kind)
    }

    fn fail(&mut self, err: GraphOrmError) {
        self.ready.push_back(Err(err));
        self.done = true;
    }

    fn limit_reached(&self, query: &Query) -> bool {
        query.limit.is_some_and(|limit| self.yielded >= limit)
    }

    /// Next batch of re-checked, deduplicated candidates.
    fn next_chunk(&mut self, query: &Query, size: usize) -> Result<Vec<NodeRecord>> {
        if self.candidates.is_none() {
            self.candidates = Some(plan(&self.store, &self.alias, query)?);
        }
        let Some(candidates) = self.candidates.as_mut() else {
            return Ok(Vec::new());
        };
        let mut chunk = Vec::new();
        while chunk.len() < size {
            let Some(record) = candidates.next_record()? else {
                break;
            };
            if self.seen.contains(&record.id) {
                continue;
            }
            if !recheck(&query.conditions, &record)? {
                continue;
            }
            self.seen.insert(record.id);
            chunk.push(record);
        }
        Ok(chunk)
    }

    fn fill(&mut self) -> Result<()> {
        let Some(query) = self.query.take() else {
            self.done = true;
            return Ok(());
        };
        let result = if query.order_by.is_empty() {
            self.fill_streaming(&query)
        } else {
            self.fill_ordered(&query)
        };
        self.query = Some(query);
        result
    }

    fn fill_streaming(&mut self, query: &Query) -> Result<()> {
        if self.limit_reached(query) {
            self.done = true;
            return Ok(());
        }
        let size = self.store.chunk_size();
        let chunk = self.next_chunk(query, size)?;
        if chunk.len() < size {
            self.done = true;
        }
        let mut batch = Vec::with_capacity(chunk.len());
        for instance in self.store.materialize(&self.alias, chunk, Some(&query.model))? {
            if self.skipped < query.offset {
                self.skipped += 1;
                continue;
            }
            if self.limit_reached(query) {
                self.done = true;
                break;
            }
            self.yielded += 1;
            batch.push(instance);
        }
        select_related::apply(&self.store, &self.alias, &batch, &query.select_related)?;
        self.ready.extend(batch.into_iter().map(Ok));
        Ok(())
    }

    fn fill_ordered(&mut self, query: &Query) -> Result<()> {
        self.done = true;
        let size = self.store.chunk_size();
        let mut keyed = Vec::new();
        loop {
            let chunk = self.next_chunk(query, size)?;
            let exhausted = chunk.len() < size;
            for instance in self.store.materialize(&self.alias, chunk, Some(&query.model))? {
                let keys = query
                    .order_by
                    .iter()
                    .map(|key| instance.get(&key.field))
                    .collect::<Result<Vec<Value>>>()?;
                keyed.push((keys, instance));
            }
            if exhausted {
                break;
            }
        }
        keyed.sort_by(|(a, _), (b, _)| {
            a.iter()
                .zip(b)
                .zip(&query.order_by)
                .map(|((x, y), key)| {
                    let ord = x.sort_cmp(y);
                    if key.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                })
                .find(|ord| ord.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let batch: Vec<Instance> = keyed
            .into_iter()
            .map(|(_, instance)| instance)
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        self.yielded = batch.len();
        select_related::apply(&self.store, &self.alias, &batch, &query.select_related)?;
        self.ready.extend(batch.into_iter().map(Ok));
        Ok(())
    }
}

fn recheck(conditions: &[Condition], record: &NodeRecord) -> Result<bool> {
    for condition in conditions {
        if !condition.matches(record)? {
            return Ok(false);
        }
    }
    Ok(true)
}

impl Iterator for QueryIter {
    type Item = Result<Instance>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.fill() {
                self.fail(err);
            }
        }
    }
}

impl fmt::Debug for QueryIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIter")
            .field("alias", &self.alias)
            .field("plan", &self.plan_kind())
            .field("yielded", &self.yielded)
            .field("done", &self.done)
            .finish()
    }
}

/// Number of matches of `query`, ignoring its window.
pub(crate) fn count_matches(transport: &dyn GraphTransport, query: &Query) -> Result<usize> {
    if query.conditions.iter().any(Condition::is_unsatisfiable) {
        return Ok(0);
    }
    let builder = graph_builder(transport, query)?.returns(ReturnExpr::CountDistinct("n".into()), Some("count"));
    let table = transport.cypher(&builder.build()?)?;
    let col = table.column("count")?;
    Ok(table
        .data
        .first()
        .and_then(|row| row.get(col))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as usize)
}
