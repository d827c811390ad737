//! Graph-query evaluation over [`GraphState`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value as JsonValue};

use super::{GraphState, MEMORY_BASE};
use crate::cypher::{CypherQuery, PathPattern, Predicate, QueryPart, RelPattern, ReturnExpr, StartPoint};
use crate::error::{GraphOrmError, Result};
use crate::filter::cmp_json;
use crate::transport::{Direction, EdgeId, NodeId, Table};

#[derive(Clone, Debug, PartialEq)]
enum Binding {
    Node(NodeId),
    Edge(EdgeId),
    Edges(Vec<EdgeId>),
    Path { nodes: Vec<NodeId>, edges: Vec<EdgeId> },
}

type Row = BTreeMap<String, Binding>;

pub(super) fn execute(state: &mut GraphState, query: &CypherQuery) -> Result<Table> {
    let mut data = Vec::new();
    for part in &query.parts {
        data.extend(run_part(state, part)?);
    }
    Ok(Table {
        columns: query.returns_names(),
        data,
    })
}

fn run_part(state: &mut GraphState, part: &QueryPart) -> Result<Vec<Vec<JsonValue>>> {
    let mut rows = vec![Row::new()];
    for start in &part.starts {
        let ids = start_ids(state, &start.point)?;
        let mut next = Vec::with_capacity(rows.len() * ids.len());
        for row in &rows {
            for id in &ids {
                let mut row = row.clone();
                row.insert(start.var.clone(), Binding::Node(*id));
                next.push(row);
            }
        }
        rows = next;
    }
    for path in &part.matches {
        rows = rows
            .iter()
            .flat_map(|row| expand_path(state, row, path))
            .collect();
    }
    rows.retain(|row| holds(state, row, &part.predicates));
    if let Some(with) = &part.with {
        let mut projected: Vec<Row> = Vec::new();
        for row in rows {
            let kept: Row = row
                .into_iter()
                .filter(|(name, _)| with.vars.contains(name))
                .collect();
            if !with.distinct || !projected.contains(&kept) {
                projected.push(kept);
            }
        }
        rows = projected;
        rows.retain(|row| holds(state, row, &part.post_predicates));
    }
    apply_mutations(state, part, &rows)?;
    if part.returns.is_empty() {
        return Ok(Vec::new());
    }

    let mut output: Vec<(Vec<JsonValue>, Vec<JsonValue>)> = if part
        .returns
        .iter()
        .any(|item| item.expr.is_aggregate())
    {
        aggregate(state, part, &rows)
    } else {
        rows.iter()
            .map(|row| {
                let values = part.returns.iter().map(|i| eval(state, row, &i.expr)).collect();
                let keys = part.order_by.iter().map(|o| eval(state, row, &o.expr)).collect();
                (values, keys)
            })
            .collect()
    };

    if part.distinct {
        let mut seen: Vec<Vec<JsonValue>> = Vec::new();
        output.retain(|(values, _)| {
            if seen.contains(values) {
                false
            } else {
                seen.push(values.clone());
                true
            }
        });
    }
    if !part.order_by.is_empty() {
        output.sort_by(|(_, a), (_, b)| {
            for ((x, y), item) in a.iter().zip(b.iter()).zip(&part.order_by) {
                let ord = order_values(x, y);
                let ord = if item.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
    let skip = part.skip.unwrap_or(0);
    let limit = part.limit.unwrap_or(usize::MAX);
    Ok(output
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(|(values, _)| values)
        .collect())
}

fn start_ids(state: &GraphState, point: &StartPoint) -> Result<Vec<NodeId>> {
    match point {
        StartPoint::Nodes(ids) => {
            for id in ids {
                state.node(*id)?;
            }
            Ok(ids.clone())
        }
        StartPoint::IndexQuery { index, query } => Ok(state
            .indexes
            .get(index)
            .map(|entries| query.evaluate(entries).into_iter().collect())
            .unwrap_or_default()),
        StartPoint::IndexLookup { index, key, value } => {
            Ok(state.index_holders(index, key, value).into_iter().collect())
        }
    }
}

fn order_values(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => cmp_json(a, b).unwrap_or(Ordering::Equal),
    }
}

fn holds(state: &GraphState, row: &Row, predicates: &[Predicate]) -> bool {
    predicates.iter().all(|pred| match row.get(&pred.var) {
        Some(Binding::Node(id)) => state
            .nodes
            .get(id)
            .is_some_and(|props| pred.expr.evaluate(*id, props, None)),
        Some(Binding::Edge(id)) => state
            .edges
            .get(id)
            .is_some_and(|edge| pred.expr.evaluate(NodeId(id.0), &edge.properties, None)),
        _ => false,
    })
}

struct Walk {
    row: Row,
    at: NodeId,
    nodes: Vec<NodeId>,
    edges: Vec<EdgeId>,
}

fn expand_path(state: &GraphState, row: &Row, path: &PathPattern) -> Vec<Row> {
    let Some(Binding::Node(start)) = row.get(&path.start) else {
        return Vec::new();
    };
    let mut walks = vec![Walk {
        row: row.clone(),
        at: *start,
        nodes: vec![*start],
        edges: Vec::new(),
    }];
    for (rel, node_name) in &path.steps {
        let mut next = Vec::new();
        for walk in walks {
            for (hops, end) in hop_sequences(state, walk.at, rel, &walk.edges) {
                let mut row = walk.row.clone();
                if let Some(var) = &rel.var {
                    let binding = match rel.length {
                        None => Binding::Edge(hops[0]),
                        Some(_) => Binding::Edges(hops.clone()),
                    };
                    if !bind(&mut row, var, binding) {
                        continue;
                    }
                }
                if let Some(name) = node_name {
                    if !bind(&mut row, name, Binding::Node(end)) {
                        continue;
                    }
                }
                let mut nodes = walk.nodes.clone();
                let mut edges = walk.edges.clone();
                let mut at = walk.at;
                for hop in &hops {
                    at = state.edges[hop].other(at);
                    nodes.push(at);
                    edges.push(*hop);
                }
                next.push(Walk { row, at: end, nodes, edges });
            }
        }
        walks = next;
    }
    walks
        .into_iter()
        .filter_map(|mut walk| {
            if let Some(name) = &path.name {
                let binding = Binding::Path {
                    nodes: walk.nodes,
                    edges: walk.edges,
                };
                if !bind(&mut walk.row, name, binding) {
                    return None;
                }
            }
            Some(walk.row)
        })
        .collect()
}

fn bind(row: &mut Row, name: &str, binding: Binding) -> bool {
    match row.get(name) {
        Some(existing) => *existing == binding,
        None => {
            row.insert(name.to_owned(), binding);
            true
        }
    }
}

/// Every edge sequence the hop pattern can take from `from`, with its end node.
/// Edges already used by the enclosing path are skipped.
fn hop_sequences(
    state: &GraphState,
    from: NodeId,
    rel: &RelPattern,
    used: &[EdgeId],
) -> Vec<(Vec<EdgeId>, NodeId)> {
    let (min, max) = rel.length.unwrap_or((1, Some(1)));
    let types: Vec<&str> = rel.types.iter().map(String::as_str).collect();
    let mut out = Vec::new();
    let mut stack: Vec<(NodeId, Vec<EdgeId>)> = vec![(from, Vec::new())];
    while let Some((at, hops)) = stack.pop() {
        let depth = hops.len() as u32;
        if depth >= min {
            out.push((hops.clone(), at));
        }
        if max.is_some_and(|max| depth >= max) {
            continue;
        }
        for edge in state.edges_of(at, rel.direction, &types) {
            if hops.contains(&edge.id) || used.contains(&edge.id) {
                continue;
            }
            let mut next = hops.clone();
            next.push(edge.id);
            stack.push((edge.other(at), next));
        }
    }
    // Depth-first discovery; present shorter sequences first like the server does.
    out.sort_by_key(|(hops, _)| hops.len());
    out
}

fn apply_mutations(state: &mut GraphState, part: &QueryPart, rows: &[Row]) -> Result<()> {
    for row in rows {
        for set in &part.sets {
            match row.get(&set.var) {
                Some(Binding::Node(id)) => state.set_property(*id, &set.key, &set.value)?,
                Some(Binding::Edge(id)) => {
                    let edge = state
                        .edges
                        .get_mut(id)
                        .ok_or_else(|| GraphOrmError::NotFound(format!("relationship {id}")))?;
                    if set.value.is_null() {
                        edge.properties.remove(&set.key);
                    } else {
                        edge.properties.insert(set.key.clone(), set.value.clone());
                    }
                }
                _ => {
                    return Err(GraphOrmError::transport(format!(
                        "SET target '{}' is not a node or relationship",
                        set.var
                    )))
                }
            }
        }
    }
    if part.deletes.is_empty() {
        return Ok(());
    }
    let mut edges = BTreeSet::new();
    let mut nodes = BTreeSet::new();
    for row in rows {
        for var in &part.deletes {
            match row.get(var) {
                Some(Binding::Node(id)) => {
                    nodes.insert(*id);
                }
                Some(Binding::Edge(id)) => {
                    edges.insert(*id);
                }
                Some(Binding::Edges(ids)) => edges.extend(ids.iter().copied()),
                _ => {}
            }
        }
    }
    for edge in edges {
        if state.edges.contains_key(&edge) {
            state.delete_edge(edge)?;
        }
    }
    for node in nodes {
        if state.nodes.contains_key(&node) {
            state.delete_node(node)?;
        }
    }
    Ok(())
}

fn eval(state: &GraphState, row: &Row, expr: &ReturnExpr) -> JsonValue {
    let binding = expr.var().and_then(|var| row.get(var));
    match (expr, binding) {
        (ReturnExpr::Node(_), Some(Binding::Node(id))) => state
            .record(*id)
            .map(|r| r.to_json(MEMORY_BASE))
            .unwrap_or(JsonValue::Null),
        (ReturnExpr::Node(_), Some(Binding::Edge(id))) => state
            .edges
            .get(id)
            .map(|e| e.to_json(MEMORY_BASE))
            .unwrap_or(JsonValue::Null),
        (ReturnExpr::Id(_), Some(Binding::Node(id))) => json!(id.0),
        (ReturnExpr::Id(_), Some(Binding::Edge(id))) => json!(id.0),
        (ReturnExpr::Property(_, key), Some(Binding::Node(id))) => state
            .nodes
            .get(id)
            .and_then(|props| props.get(key))
            .cloned()
            .unwrap_or(JsonValue::Null),
        (ReturnExpr::Property(_, key), Some(Binding::Edge(id))) => state
            .edges
            .get(id)
            .and_then(|edge| edge.properties.get(key))
            .cloned()
            .unwrap_or(JsonValue::Null),
        (ReturnExpr::TypeOf(_), Some(Binding::Edge(id))) => state
            .edges
            .get(id)
            .map(|edge| json!(edge.rel_type))
            .unwrap_or(JsonValue::Null),
        (ReturnExpr::Length(_), Some(Binding::Path { edges, .. } | Binding::Edges(edges))) => {
            json!(edges.len())
        }
        (ReturnExpr::NodeIds(_), Some(Binding::Path { nodes, .. })) => {
            json!(nodes.iter().map(|n| n.0).collect::<Vec<_>>())
        }
        (ReturnExpr::RelIds(_), Some(Binding::Path { edges, .. } | Binding::Edges(edges))) => {
            json!(edges.iter().map(|e| e.0).collect::<Vec<_>>())
        }
        _ => JsonValue::Null,
    }
}

fn aggregate(state: &GraphState, part: &QueryPart, rows: &[Row]) -> Vec<(Vec<JsonValue>, Vec<JsonValue>)> {
    let mut groups: Vec<(Vec<JsonValue>, Vec<&Row>)> = Vec::new();
    for row in rows {
        let key: Vec<JsonValue> = part
            .returns
            .iter()
            .filter(|i| !i.expr.is_aggregate())
            .map(|i| eval(state, row, &i.expr))
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(row),
            None => groups.push((key, vec![row])),
        }
    }
    let has_keys = part.returns.iter().any(|i| !i.expr.is_aggregate());
    if groups.is_empty() && !has_keys {
        groups.push((Vec::new(), Vec::new()));
    }
    groups
        .into_iter()
        .map(|(key, members)| {
            let mut key_iter = key.into_iter();
            let values: Vec<JsonValue> = part
                .returns
                .iter()
                .map(|item| {
                    if item.expr.is_aggregate() {
                        fold(state, &members, &item.expr)
                    } else {
                        key_iter.next().unwrap_or(JsonValue::Null)
                    }
                })
                .collect();
            let order_keys = part
                .order_by
                .iter()
                .map(|o| {
                    part.returns
                        .iter()
                        .position(|item| item.expr == o.expr)
                        .map(|idx| values[idx].clone())
                        .unwrap_or(JsonValue::Null)
                })
                .collect();
            (values, order_keys)
        })
        .collect()
}

fn fold(state: &GraphState, rows: &[&Row], expr: &ReturnExpr) -> JsonValue {
    match expr {
        ReturnExpr::Count => json!(rows.len()),
        ReturnExpr::CountDistinct(var) => {
            let mut seen: Vec<&Binding> = Vec::new();
            for row in rows {
                if let Some(binding) = row.get(var) {
                    if !seen.contains(&binding) {
                        seen.push(binding);
                    }
                }
            }
            json!(seen.len())
        }
        ReturnExpr::Min(var, key) | ReturnExpr::Max(var, key) => {
            let want = if matches!(expr, ReturnExpr::Min(..)) {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let mut best: Option<JsonValue> = None;
            for value in property_values(state, rows, var, key) {
                best = match best {
                    Some(current) if cmp_json(&value, &current) != Some(want) => Some(current),
                    _ => Some(value),
                };
            }
            best.unwrap_or(JsonValue::Null)
        }
        ReturnExpr::Sum(var, key) | ReturnExpr::Avg(var, key) => {
            let values = property_values(state, rows, var, key);
            let all_int = values.iter().all(JsonValue::is_i64);
            let total: f64 = values.iter().filter_map(JsonValue::as_f64).sum();
            match expr {
                ReturnExpr::Sum(..) if all_int => {
                    json!(values.iter().filter_map(JsonValue::as_i64).sum::<i64>())
                }
                ReturnExpr::Sum(..) => json!(total),
                _ if values.is_empty() => JsonValue::Null,
                _ => json!(total / values.len() as f64),
            }
        }
        _ => JsonValue::Null,
    }
}

fn property_values(state: &GraphState, rows: &[&Row], var: &str, key: &str) -> Vec<JsonValue> {
    rows.iter()
        .filter_map(|row| match row.get(var) {
            Some(Binding::Node(id)) => state.nodes.get(id).and_then(|p| p.get(key)).cloned(),
            _ => None,
        })
        .filter(|v| !v.is_null())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cypher::CypherBuilder;
    use crate::filter::{FilterExpr, FilterOp};
    use crate::transport::PropertyMap;

    fn chain(state: &mut GraphState) -> (NodeId, NodeId, NodeId) {
        let mut named = |name: &str, age: i64| {
            let mut props = PropertyMap::new();
            props.insert("name".into(), json!(name));
            props.insert("age".into(), json!(age));
            state.create_node(&props).id
        };
        let (dog, cat, mouse) = (named("rex", 5), named("tom", 3), named("jerry", 2));
        state.create_edge(dog, cat, "chases", &PropertyMap::new()).unwrap();
        state.create_edge(cat, mouse, "chases", &PropertyMap::new()).unwrap();
        (dog, cat, mouse)
    }

    #[test]
    fn variable_length_paths_shortest_first() {
        let mut state = GraphState::default();
        let (dog, _, mouse) = chain(&mut state);
        let query = CypherBuilder::new()
            .start_nodes("s", vec![dog])
            .match_path(
                PathPattern::starting_at("s")
                    .named("p")
                    .step(RelPattern::single("chases", Direction::Both).repeated(1, Some(2)), Some("m")),
            )
            .returns(ReturnExpr::Length("p".into()), Some("len"))
            .returns(ReturnExpr::Id("m".into()), Some("end"))
            .order_by(ReturnExpr::Length("p".into()), false)
            .build()
            .unwrap();
        let table = execute(&mut state, &query).unwrap();
        assert_eq!(table.data.len(), 2);
        assert_eq!(table.data[1], vec![json!(2), json!(mouse.0)]);
    }

    #[test]
    fn where_on_path_end_and_distinct_with() {
        let mut state = GraphState::default();
        let (dog, _, _) = chain(&mut state);
        let query = CypherBuilder::new()
            .start_nodes("n", vec![dog])
            .match_path(
                PathPattern::starting_at("n")
                    .step(RelPattern::single("chases", Direction::Out), None)
                    .step(RelPattern::single("chases", Direction::Out), Some("m")),
            )
            .where_("m", FilterExpr::compare("name", FilterOp::Eq, "jerry"))
            .with(true, &["n"])
            .returns(ReturnExpr::Id("n".into()), Some("id"))
            .build()
            .unwrap();
        let table = execute(&mut state, &query).unwrap();
        assert_eq!(table.data, vec![vec![json!(dog.0)]]);
    }

    #[test]
    fn aggregates_without_rows_return_one_row() {
        let mut state = GraphState::default();
        let (dog, _, _) = chain(&mut state);
        let query = CypherBuilder::new()
            .start_nodes("n", vec![dog])
            .match_path(
                PathPattern::starting_at("n").step(RelPattern::single("owns", Direction::Out), Some("m")),
            )
            .returns(ReturnExpr::Count, Some("count"))
            .returns(ReturnExpr::Max("m".into(), "age".into()), Some("max"))
            .build()
            .unwrap();
        let table = execute(&mut state, &query).unwrap();
        assert_eq!(table.data, vec![vec![json!(0), JsonValue::Null]]);
    }

    #[test]
    fn sum_and_avg_over_matches() {
        let mut state = GraphState::default();
        let (dog, _, _) = chain(&mut state);
        let query = CypherBuilder::new()
            .start_nodes("n", vec![dog])
            .match_path(
                PathPattern::starting_at("n")
                    .step(RelPattern::single("chases", Direction::Out).repeated(0, None), Some("m")),
            )
            .returns(ReturnExpr::Sum("m".into(), "age".into()), Some("sum"))
            .returns(ReturnExpr::Avg("m".into(), "age".into()), Some("avg"))
            .build()
            .unwrap();
        let table = execute(&mut state, &query).unwrap();
        assert_eq!(table.data, vec![vec![json!(10), json!(10.0 / 3.0)]]);
    }

    #[test]
    fn set_updates_matched_nodes() {
        let mut state = GraphState::default();
        let (dog, cat, _) = chain(&mut state);
        let query = CypherBuilder::new()
            .start_nodes("n", vec![dog, cat])
            .set("n", "age", json!(9))
            .build()
            .unwrap();
        execute(&mut state, &query).unwrap();
        assert_eq!(state.nodes[&cat]["age"], json!(9));
    }
}
