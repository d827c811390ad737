//! Aggregates and single-value summaries computed by graph queries.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value as JsonValue;
use time::{Date, Month};

use crate::condition::LOOKUP_SEP;
use crate::cypher::ReturnExpr;
use crate::error::{GraphOrmError, Result};
use crate::filter::{FilterExpr, FilterOp};
use crate::model::Instance;
use crate::property::{Property, PropertyKind};
use crate::query::engine::{graph_builder, run_node_query};
use crate::query::{Query, QuerySet};
use crate::value::Value;

/// Truncation applied by [`QuerySet::dates`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateKind {
    /// First day of the year.
    Year,
    /// First day of the month.
    Month,
    /// The day itself.
    Day,
}

impl DateKind {
    fn truncate(self, date: Date) -> Result<Date> {
        let truncated = match self {
            DateKind::Year => Date::from_calendar_date(date.year(), Month::January, 1),
            DateKind::Month => Date::from_calendar_date(date.year(), date.month(), 1),
            DateKind::Day => Ok(date),
        };
        truncated.map_err(|err| GraphOrmError::validation(format!("cannot truncate {date}: {err}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AggregateOp {
    Count,
    Min,
    Max,
    Sum,
    Avg,
}

impl AggregateOp {
    fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "count" => AggregateOp::Count,
            "min" => AggregateOp::Min,
            "max" => AggregateOp::Max,
            "sum" => AggregateOp::Sum,
            "avg" => AggregateOp::Avg,
            _ => return None,
        })
    }
}

fn property<'q>(query: &'q Query, name: &str) -> Result<&'q Property> {
    query.model.property(name).ok_or_else(|| {
        GraphOrmError::field(format!("{} has no property '{name}'", query.model.type_name()))
    })
}

fn not_null(name: &str) -> FilterExpr {
    FilterExpr::compare(name, FilterOp::IsNull, false)
}

fn number(json: &JsonValue) -> Value {
    match (json.as_i64(), json.as_f64()) {
        (Some(int), _) => Value::Int(int),
        (None, Some(float)) => Value::Float(float),
        (None, None) => Value::Null,
    }
}

impl QuerySet {
    /// Computes `"field__op"` aggregates over the matches, keyed by the
    /// requested name. `op` is one of `count`, `min`, `max`, `sum`, `avg`;
    /// `count` counts matches with a non-null value.
    ///
    /// The result window is ignored.
    pub fn aggregate(&self, specs: &[&str]) -> Result<BTreeMap<String, Value>> {
        let query = self.query()?;
        let transport = self.store.transport(&self.alias)?;
        let mut out = BTreeMap::new();
        let mut folded = Vec::new();
        for spec in specs {
            let (name, op) = spec
                .rsplit_once(LOOKUP_SEP)
                .and_then(|(name, op)| AggregateOp::parse(op).map(|op| (name, op)))
                .ok_or_else(|| {
                    GraphOrmError::validation(format!(
                        "aggregate '{spec}' must look like 'field__count|min|max|sum|avg'"
                    ))
                })?;
            let prop = property(query, name)?;
            if op == AggregateOp::Count {
                let builder = graph_builder(transport.as_ref(), query)?
                    .where_("n", not_null(name))
                    .returns(ReturnExpr::CountDistinct("n".into()), Some(*spec));
                let table = transport.cypher(&builder.build()?)?;
                let count = table.data.first().and_then(|row| row.first()).map_or(Value::Int(0), number);
                out.insert((*spec).to_owned(), count);
            } else {
                folded.push((*spec, prop, op));
            }
        }
        if folded.is_empty() {
            return Ok(out);
        }
        let mut builder = graph_builder(transport.as_ref(), query)?;
        for (spec, prop, op) in &folded {
            let (var, key) = ("n".to_owned(), prop.name().to_owned());
            let expr = match op {
                AggregateOp::Min => ReturnExpr::Min(var, key),
                AggregateOp::Max => ReturnExpr::Max(var, key),
                AggregateOp::Sum => ReturnExpr::Sum(var, key),
                AggregateOp::Avg | AggregateOp::Count => ReturnExpr::Avg(var, key),
            };
            builder = builder.returns(expr, Some(*spec));
        }
        let table = transport.cypher(&builder.build()?)?;
        let row = table.data.first();
        for (spec, prop, op) in folded {
            let cell = row
                .and_then(|row| row.get(table.columns.iter().position(|c| c == spec)?))
                .cloned()
                .unwrap_or(JsonValue::Null);
            let value = match op {
                _ if cell.is_null() => Value::Null,
                AggregateOp::Min | AggregateOp::Max => prop.from_stored(&cell)?,
                AggregateOp::Avg => cell.as_f64().map_or(Value::Null, Value::Float),
                AggregateOp::Sum | AggregateOp::Count => number(&cell),
            };
            out.insert(spec.to_owned(), value);
        }
        Ok(out)
    }

    /// Match with the largest non-null `field`.
    pub fn latest(&self, field: &str) -> Result<Instance> {
        let query = self.query()?;
        property(query, field)?;
        let transport = self.store.transport(&self.alias)?;
        let builder = graph_builder(transport.as_ref(), query)?
            .where_("n", not_null(field))
            .returns(ReturnExpr::Node("n".into()), Some("n"))
            .order_by(ReturnExpr::Property("n".into(), field.to_owned()), true)
            .limit(1);
        let records = run_node_query(transport.as_ref(), builder)?;
        self.store
            .materialize(&self.alias, records, Some(&query.model))?
            .into_iter()
            .next()
            .ok_or_else(|| GraphOrmError::DoesNotExist(query.model.name().to_owned()))
    }

    /// Distinct values of a date or datetime `field`, truncated to `kind`,
    /// in ascending order.
    pub fn dates(&self, field: &str, kind: DateKind) -> Result<Vec<Value>> {
        let query = self.query()?;
        let prop = property(query, field)?;
        if !matches!(prop.kind(), PropertyKind::Date | PropertyKind::DateTime) {
            return Err(GraphOrmError::field(format!(
                "'{field}' is a {} property, not a date",
                prop.kind().name()
            )));
        }
        let transport = self.store.transport(&self.alias)?;
        let builder = graph_builder(transport.as_ref(), query)?
            .where_("n", not_null(field))
            .returns(ReturnExpr::Property("n".into(), field.to_owned()), Some("value"))
            .distinct();
        let table = transport.cypher(&builder.build()?)?;
        let mut dates = BTreeSet::new();
        for cell in table.data.iter().filter_map(|row| row.first()) {
            let date = match prop.from_stored(cell)? {
                Value::Date(date) => date,
                Value::DateTime(at) => at.date(),
                _ => continue,
            };
            dates.insert(kind.truncate(date)?);
        }
        Ok(dates.into_iter().map(Value::Date).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keeps_the_requested_precision() {
        let date = Date::from_calendar_date(2011, Month::August, 17).unwrap();
        assert_eq!(
            DateKind::Year.truncate(date).unwrap(),
            Date::from_calendar_date(2011, Month::January, 1).unwrap()
        );
        assert_eq!(
            DateKind::Month.truncate(date).unwrap(),
            Date::from_calendar_date(2011, Month::August, 1).unwrap()
        );
        assert_eq!(DateKind::Day.truncate(date).unwrap(), date);
    }

    #[test]
    fn aggregate_ops_parse_by_suffix() {
        assert_eq!(AggregateOp::parse("avg"), Some(AggregateOp::Avg));
        assert_eq!(AggregateOp::parse("median"), None);
    }
}
