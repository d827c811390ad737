//! Lookup conditions.
//!
//! A lookup string such as `"age__gte"` or `"chases__name__startswith"` is
//! resolved against a model into a [`Condition`]: the field it targets (the
//! node id, a property, or a property/id reached over relationships), the
//! operator, and the operand. Conditions lower into three forms:
//!
//! * an [`IndexQuery`] fragment when the target property is indexed and the
//!   operator can be answered by the index,
//! * a [`FilterExpr`] evaluated by the server (or natively by the memory
//!   backend) for everything else,
//! * a path pattern plus predicate for related lookups, assembled by the query
//!   engine.

use std::fmt;
use std::ops::{BitAnd, Bound, Not};
use std::sync::Arc;

use regex::Regex;
use serde_json::Value as JsonValue;

use crate::error::{GraphOrmError, Result};
use crate::filter::{FilterExpr, FilterOp};
use crate::index_query::IndexQuery;
use crate::model::{Model, Registry};
use crate::property::{ArrayStorage, Property, PropertyKind};
use crate::transport::{Direction, NodeId, NodeRecord};
use crate::value::Value;

/// Separator between lookup path segments.
pub const LOOKUP_SEP: &str = "__";

/// Comparison operator of a lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Operator {
    /// `exact` (the default).
    Exact,
    /// `iexact`.
    IExact,
    /// `lt`.
    Lt,
    /// `lte`.
    Lte,
    /// `gt`.
    Gt,
    /// `gte`.
    Gte,
    /// `in`.
    In,
    /// `range`, a two-element inclusive interval.
    Range,
    /// `contains`.
    Contains,
    /// `icontains`.
    IContains,
    /// `startswith`.
    StartsWith,
    /// `istartswith`.
    IStartsWith,
    /// `endswith`.
    EndsWith,
    /// `iendswith`.
    IEndsWith,
    /// `regex`.
    Regex,
    /// `iregex`.
    IRegex,
    /// `year`.
    Year,
    /// `month`.
    Month,
    /// `day`.
    Day,
    /// `isnull`.
    IsNull,
    /// `member`, array contains the operand.
    Member,
    /// `member_in`, array contains one of the operands.
    MemberIn,
}

impl Operator {
    const ALL: [Operator; 22] = [
        Operator::Exact,
        Operator::IExact,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
        Operator::In,
        Operator::Range,
        Operator::Contains,
        Operator::IContains,
        Operator::StartsWith,
        Operator::IStartsWith,
        Operator::EndsWith,
        Operator::IEndsWith,
        Operator::Regex,
        Operator::IRegex,
        Operator::Year,
        Operator::Month,
        Operator::Day,
        Operator::IsNull,
        Operator::Member,
        Operator::MemberIn,
    ];

    /// Lookup suffix of the operator.
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Exact => "exact",
            Operator::IExact => "iexact",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::In => "in",
            Operator::Range => "range",
            Operator::Contains => "contains",
            Operator::IContains => "icontains",
            Operator::StartsWith => "startswith",
            Operator::IStartsWith => "istartswith",
            Operator::EndsWith => "endswith",
            Operator::IEndsWith => "iendswith",
            Operator::Regex => "regex",
            Operator::IRegex => "iregex",
            Operator::Year => "year",
            Operator::Month => "month",
            Operator::Day => "day",
            Operator::IsNull => "isnull",
            Operator::Member => "member",
            Operator::MemberIn => "member_in",
        }
    }

    /// Parses a lookup suffix.
    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == text)
    }

    fn is_range(self) -> bool {
        matches!(
            self,
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte | Operator::Range
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hop of a related lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct PathStep {
    /// Edge type.
    pub rel_type: String,
    /// Direction from the current node.
    pub direction: Direction,
    /// Type name of the model reached.
    pub target: String,
}

/// What a condition compares.
#[derive(Clone, Debug)]
pub enum ConditionField {
    /// The node id.
    Id,
    /// A property of the queried model.
    Property(Property),
    /// The id or a property of a node reached over one or more relationships.
    Related {
        /// Hops from the queried node.
        path: Vec<PathStep>,
        /// Property at the end of the path; `None` compares the node id.
        property: Option<Property>,
    },
}

/// A resolved lookup.
#[derive(Clone, Debug)]
pub struct Condition {
    field: ConditionField,
    op: Operator,
    value: Value,
    negated: bool,
}

impl Condition {
    /// Resolves `lookup` against `model`.
    ///
    /// Unknown fields are field errors, unknown operators are not implemented,
    /// and malformed operands are validation errors.
    pub fn parse(model: &Arc<Model>, registry: &Registry, lookup: &str, value: Value) -> Result<Self> {
        let parts: Vec<&str> = lookup.split(LOOKUP_SEP).collect();
        let mut current = Arc::clone(model);
        let mut path = Vec::new();
        let mut idx = 0;
        let mut leaf: Option<Option<Property>> = None;
        while idx < parts.len() {
            let name = parts[idx];
            if name == "id" || name == "pk" {
                leaf = Some(None);
                idx += 1;
                break;
            }
            if let Some(prop) = current.property(name) {
                leaf = Some(Some(prop.clone()));
                idx += 1;
                break;
            }
            if let Some(rel) = current.relationship(name) {
                let step = PathStep {
                    rel_type: rel.rel_type.clone(),
                    direction: rel.direction,
                    target: rel.target.clone(),
                };
                let next = registry.get(&step.target)?;
                path.push(step);
                current = next;
                idx += 1;
                continue;
            }
            if path.is_empty() || idx + 1 < parts.len() || Operator::parse(name).is_none() {
                return Err(GraphOrmError::field(format!(
                    "{} has no field named '{name}' (lookup '{lookup}')",
                    current.type_name()
                )));
            }
            break;
        }
        // A lookup that ends on a relationship compares the related node id.
        let leaf = leaf.unwrap_or(None);
        let op = match &parts[idx..] {
            [] => Operator::Exact,
            [op] => Operator::parse(op).ok_or_else(|| {
                GraphOrmError::NotImplemented(format!("lookup type '{op}' (lookup '{lookup}')"))
            })?,
            [_, extra, ..] => {
                return Err(GraphOrmError::field(format!(
                    "unexpected segment '{extra}' in lookup '{lookup}'"
                )))
            }
        };
        let field = match (path.is_empty(), leaf) {
            (true, None) => ConditionField::Id,
            (true, Some(prop)) => ConditionField::Property(prop),
            (false, property) => ConditionField::Related { path, property },
        };
        let condition = Condition {
            field,
            op,
            value,
            negated: false,
        };
        condition.check_operand()?;
        Ok(condition)
    }

    /// The same condition with its outcome inverted.
    pub fn negated(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Target field.
    pub fn field(&self) -> &ConditionField {
        &self.field
    }

    /// Operator.
    pub fn op(&self) -> Operator {
        self.op
    }

    /// Operand.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether the condition is inverted.
    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Whether the condition needs a path from the queried node.
    pub fn is_related(&self) -> bool {
        matches!(self.field, ConditionField::Related { .. })
    }

    /// Ids named by a non-negated `id` / `id__in` lookup.
    pub fn id_set(&self) -> Option<Vec<NodeId>> {
        if self.negated || !matches!(self.field, ConditionField::Id) {
            return None;
        }
        match (self.op, &self.value) {
            (Operator::Exact, value) => value_to_id(value).map(|id| vec![id]),
            (Operator::In, Value::List(items)) => items.iter().map(value_to_id).collect(),
            _ => None,
        }
    }

    /// `true` when no node can satisfy the condition (an empty `in`).
    pub fn is_unsatisfiable(&self) -> bool {
        !self.negated
            && matches!(self.op, Operator::In | Operator::MemberIn)
            && matches!(&self.value, Value::List(items) if items.is_empty())
    }

    fn check_operand(&self) -> Result<()> {
        let shape = |msg: &str| {
            Err(GraphOrmError::validation(format!(
                "'{}' lookup {msg}, got {}",
                self.op, self.value
            )))
        };
        match self.op {
            Operator::Range => match &self.value {
                Value::List(items) if items.len() == 2 => {}
                _ => return shape("requires a two-element list"),
            },
            Operator::In | Operator::MemberIn => {
                if !matches!(self.value, Value::List(_)) {
                    return shape("requires a list");
                }
            }
            Operator::IsNull => {
                if !matches!(self.value, Value::Bool(_)) {
                    return shape("requires a boolean");
                }
            }
            Operator::Year | Operator::Month | Operator::Day => {
                if self.value.as_int().is_none() {
                    return shape("requires an integer");
                }
            }
            Operator::Regex | Operator::IRegex => {
                let pattern = self.value.as_str().unwrap_or_default();
                if let Err(err) = Regex::new(pattern) {
                    return Err(GraphOrmError::validation(format!(
                        "invalid regular expression '{pattern}': {err}"
                    )));
                }
            }
            _ => {}
        }
        match &self.field {
            ConditionField::Id => self.check_id_operand(),
            ConditionField::Related { property: None, .. } => self.check_id_operand(),
            ConditionField::Property(prop)
            | ConditionField::Related {
                property: Some(prop), ..
            } => {
                if matches!(self.op, Operator::Member | Operator::MemberIn) && !prop.kind().is_array() {
                    return Err(GraphOrmError::field(format!(
                        "'{}' lookup requires an array property, '{}' is {}",
                        self.op,
                        prop.name(),
                        prop.kind().name()
                    )));
                }
                Ok(())
            }
        }
    }

    fn check_id_operand(&self) -> Result<()> {
        match self.op {
            Operator::Exact | Operator::In | Operator::IsNull => {}
            other => {
                return Err(GraphOrmError::NotImplemented(format!(
                    "'{other}' lookup on node ids"
                )))
            }
        }
        let ok = match (&self.op, &self.value) {
            (Operator::Exact, value) => value_to_id(value).is_some(),
            (Operator::In, Value::List(items)) => items.iter().all(|v| value_to_id(v).is_some()),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(GraphOrmError::validation(format!(
                "node ids must be non-negative integers, got {}",
                self.value
            )))
        }
    }

    /// Index fragment answering the condition, if its property is indexed and
    /// the operator maps onto the index.
    ///
    /// Range operators on an indexed property whose keys are not ordered are a
    /// field error. Strict bounds stay exclusive; open ends use the kind's
    /// inclusive sentinels.
    pub fn index_fragment(&self) -> Result<Option<IndexQuery>> {
        let ConditionField::Property(prop) = &self.field else {
            return Ok(None);
        };
        if !prop.is_indexed() {
            return Ok(None);
        }
        let key = prop.name();
        let is_array = prop.kind().is_array();
        if self.op.is_range() && !prop.is_range_indexed() {
            return Err(GraphOrmError::field(format!(
                "'{key}' is indexed without range support and cannot answer '{}'",
                self.op
            )));
        }
        let fragment = match self.op {
            Operator::Exact if !is_array && !self.value.is_null() => {
                IndexQuery::term(key, prop.operand_index_key(&self.value)?)
            }
            Operator::In if !is_array => IndexQuery::Or(self.terms(prop, list(&self.value))?),
            Operator::Member => IndexQuery::term(key, prop.operand_index_key(&self.value)?),
            Operator::MemberIn => IndexQuery::Or(self.terms(prop, list(&self.value))?),
            Operator::StartsWith
                if !is_array
                    && matches!(
                        prop.kind(),
                        PropertyKind::String | PropertyKind::Email | PropertyKind::Url
                    ) =>
            {
                IndexQuery::Prefix {
                    key: key.to_owned(),
                    prefix: text_operand(&self.value),
                }
            }
            op if op.is_range() && !is_array => {
                let (low, high) = self.range_bounds(prop)?;
                IndexQuery::Range {
                    key: key.to_owned(),
                    low,
                    high,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(if self.negated { fragment.negate() } else { fragment }))
    }

    fn terms(&self, prop: &Property, values: &[Value]) -> Result<Vec<IndexQuery>> {
        values
            .iter()
            .map(|v| Ok(IndexQuery::term(prop.name(), prop.operand_index_key(v)?)))
            .collect()
    }

    fn range_bounds(&self, prop: &Property) -> Result<(Bound<String>, Bound<String>)> {
        let key = |v: &Value| prop.operand_index_key(v);
        Ok(match self.op {
            Operator::Lt => (Bound::Included(prop.min_key()), Bound::Excluded(key(&self.value)?)),
            Operator::Lte => (Bound::Included(prop.min_key()), Bound::Included(key(&self.value)?)),
            Operator::Gt => (Bound::Excluded(key(&self.value)?), Bound::Included(prop.max_key())),
            Operator::Gte => (Bound::Included(key(&self.value)?), Bound::Included(prop.max_key())),
            _ => {
                let bounds = list(&self.value);
                (Bound::Included(key(&bounds[0])?), Bound::Included(key(&bounds[1])?))
            }
        })
    }

    /// Server-side predicate over the queried node (or the last node of a
    /// related path).
    pub fn filter_expr(&self) -> Result<FilterExpr> {
        let expr = match &self.field {
            ConditionField::Id | ConditionField::Related { property: None, .. } => self.id_expr(),
            ConditionField::Property(prop)
            | ConditionField::Related {
                property: Some(prop), ..
            } => self.property_expr(prop)?,
        };
        Ok(if self.negated { expr.negate() } else { expr })
    }

    fn id_expr(&self) -> FilterExpr {
        match (self.op, &self.value) {
            (Operator::IsNull, Value::Bool(true)) => FilterExpr::IdIn(Vec::new()),
            (Operator::IsNull, _) => FilterExpr::True,
            (Operator::In, Value::List(items)) => {
                FilterExpr::IdIn(items.iter().filter_map(value_to_id).map(|id| id.0).collect())
            }
            (_, value) => FilterExpr::IdIn(value_to_id(value).map(|id| id.0).into_iter().collect()),
        }
    }

    fn property_expr(&self, prop: &Property) -> Result<FilterExpr> {
        let key = prop.name();
        let stored = |v: &Value| -> Result<JsonValue> { prop.to_stored(&prop.coerce(v)?) };
        let separator = match prop.kind() {
            PropertyKind::Array {
                storage: ArrayStorage::Joined(sep),
                ..
            } => Some(*sep),
            _ => None,
        };
        let element = prop.kind().element().clone();
        let element_stored = |v: &Value| -> Result<JsonValue> {
            let coerced = element.coerce(v)?;
            let json = element.to_stored(&coerced)?;
            // Joined arrays compare element text.
            Ok(match (separator, json) {
                (Some(_), JsonValue::String(s)) => JsonValue::String(s),
                (Some(_), other) => JsonValue::String(crate::filter::value_text(&other)),
                (None, other) => other,
            })
        };
        let compare = |op: FilterOp, value: JsonValue| FilterExpr::compare(key, op, value);
        Ok(match self.op {
            Operator::Exact if self.value.is_null() => compare(FilterOp::IsNull, JsonValue::Bool(true)),
            Operator::Exact => compare(FilterOp::Eq, stored(&self.value)?),
            Operator::IExact => compare(FilterOp::IEq, text_operand(&self.value).into()),
            Operator::Lt => compare(FilterOp::Lt, stored(&self.value)?),
            Operator::Lte => compare(FilterOp::Lte, stored(&self.value)?),
            Operator::Gt => compare(FilterOp::Gt, stored(&self.value)?),
            Operator::Gte => compare(FilterOp::Gte, stored(&self.value)?),
            Operator::Range => {
                let bounds = list(&self.value);
                FilterExpr::And(vec![
                    compare(FilterOp::Gte, stored(&bounds[0])?),
                    compare(FilterOp::Lte, stored(&bounds[1])?),
                ])
            }
            Operator::In => {
                let values = list(&self.value)
                    .iter()
                    .map(stored)
                    .collect::<Result<Vec<_>>>()?;
                compare(FilterOp::In, JsonValue::Array(values))
            }
            Operator::Contains => compare(FilterOp::Contains, text_operand(&self.value).into()),
            Operator::IContains => compare(FilterOp::IContains, text_operand(&self.value).into()),
            Operator::StartsWith => compare(FilterOp::StartsWith, text_operand(&self.value).into()),
            Operator::IStartsWith => compare(FilterOp::IStartsWith, text_operand(&self.value).into()),
            Operator::EndsWith => compare(FilterOp::EndsWith, text_operand(&self.value).into()),
            Operator::IEndsWith => compare(FilterOp::IEndsWith, text_operand(&self.value).into()),
            Operator::Regex => compare(FilterOp::Regex, text_operand(&self.value).into()),
            Operator::IRegex => compare(FilterOp::IRegex, text_operand(&self.value).into()),
            Operator::Year => compare(FilterOp::Year, self.value.as_int().unwrap_or_default().into()),
            Operator::Month => compare(FilterOp::Month, self.value.as_int().unwrap_or_default().into()),
            Operator::Day => compare(FilterOp::Day, self.value.as_int().unwrap_or_default().into()),
            Operator::IsNull => compare(FilterOp::IsNull, JsonValue::Bool(self.value == Value::Bool(true))),
            Operator::Member => compare(FilterOp::Member { separator }, element_stored(&self.value)?),
            Operator::MemberIn => {
                let values = list(&self.value)
                    .iter()
                    .map(&element_stored)
                    .collect::<Result<Vec<_>>>()?;
                compare(FilterOp::MemberIn { separator }, JsonValue::Array(values))
            }
        })
    }

    /// Re-checks a fetched node against the condition. Related conditions are
    /// answered by the graph query and always hold here.
    pub fn matches(&self, record: &NodeRecord) -> Result<bool> {
        if self.is_related() {
            return Ok(true);
        }
        Ok(self.filter_expr()?.evaluate(record.id, &record.properties, None))
    }
}

fn list(value: &Value) -> &[Value] {
    value.as_list().unwrap_or_default()
}

fn text_operand(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_to_id(value: &Value) -> Option<NodeId> {
    value.as_int().and_then(|v| u64::try_from(v).ok()).map(NodeId)
}

/// Unresolved conjunction of lookups, combinable with `&` and `!`.
///
/// ```
/// use graphorm::condition::Q;
///
/// let q = Q::new("age", 2) & !Q::new("name", "jerry");
/// assert_eq!(q.lookups().len(), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Q {
    lookups: Vec<(String, Value, bool)>,
}

impl Q {
    /// A single lookup.
    pub fn new(lookup: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            lookups: vec![(lookup.into(), value.into(), false)],
        }
    }

    /// `(lookup, value, negated)` triples in insertion order.
    pub fn lookups(&self) -> &[(String, Value, bool)] {
        &self.lookups
    }

    /// Resolves every lookup against `model`.
    pub fn resolve(&self, model: &Arc<Model>, registry: &Registry) -> Result<Vec<Condition>> {
        self.lookups
            .iter()
            .map(|(lookup, value, negated)| {
                let condition = Condition::parse(model, registry, lookup, value.clone())?;
                Ok(if *negated { condition.negated() } else { condition })
            })
            .collect()
    }
}

impl BitAnd for Q {
    type Output = Q;

    fn bitand(mut self, rhs: Q) -> Q {
        self.lookups.extend(rhs.lookups);
        self
    }
}

impl Not for Q {
    type Output = Q;

    fn not(mut self) -> Q {
        for (_, _, negated) in &mut self.lookups {
            *negated = !*negated;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, RegistryBuilder, Relationship};
    use crate::property::Property;
    use serde_json::json;

    fn registry() -> Registry {
        RegistryBuilder::new()
            .register(
                ModelBuilder::new("tests", "Mouse")
                    .property("name", Property::string().indexed())
                    .property("age", Property::integer().indexed())
                    .property("weight", Property::float().indexed())
                    .property("tags", Property::array(PropertyKind::String).indexed()),
            )
            .register(
                ModelBuilder::new("tests", "Cat")
                    .property("name", Property::string())
                    .relationship("chases", Relationship::to("tests.Mouse", "chases")),
            )
            .build()
            .unwrap()
    }

    fn parse(model: &str, lookup: &str, value: impl Into<Value>) -> Result<Condition> {
        let registry = registry();
        let model = registry.get(model).unwrap();
        Condition::parse(&model, &registry, lookup, value.into())
    }

    #[test]
    fn bare_lookup_defaults_to_exact() {
        let cond = parse("tests.Mouse", "name", "jerry").unwrap();
        assert_eq!(cond.op(), Operator::Exact);
        assert_eq!(
            cond.index_fragment().unwrap(),
            Some(IndexQuery::term("name", "jerry"))
        );
    }

    #[test]
    fn unknown_operator_is_not_implemented() {
        let err = parse("tests.Mouse", "name__soundslike", "x").unwrap_err();
        assert_eq!(err.code(), "NotImplemented");
    }

    #[test]
    fn unknown_field_is_field_error() {
        let err = parse("tests.Mouse", "colour", "grey").unwrap_err();
        assert_eq!(err.code(), "Field");
    }

    #[test]
    fn range_requires_two_bounds() {
        let err = parse("tests.Mouse", "age__range", vec![1]).unwrap_err();
        assert_eq!(err.code(), "Validation");
        assert!(parse("tests.Mouse", "age__range", (1, 3)).is_ok());
    }

    #[test]
    fn strict_bounds_stay_exclusive() {
        let cond = parse("tests.Mouse", "age__gt", 3).unwrap();
        let Some(IndexQuery::Range { low, high, .. }) = cond.index_fragment().unwrap() else {
            panic!("expected a range fragment");
        };
        assert!(matches!(low, Bound::Excluded(_)));
        assert!(matches!(high, Bound::Included(_)));
    }

    #[test]
    fn range_on_unordered_index_is_field_error() {
        let cond = parse("tests.Mouse", "weight__lt", 2.5).unwrap();
        assert_eq!(cond.index_fragment().unwrap_err().code(), "Field");
    }

    #[test]
    fn related_lookup_records_the_path() {
        let cond = parse("tests.Cat", "chases__name__startswith", "je").unwrap();
        let ConditionField::Related { path, property } = cond.field() else {
            panic!("expected a related field");
        };
        assert_eq!(path[0].rel_type, "chases");
        assert_eq!(path[0].target, "tests.Mouse");
        assert_eq!(property.as_ref().map(Property::name), Some("name"));
        assert!(cond.index_fragment().unwrap().is_none());
    }

    #[test]
    fn lookup_ending_on_relationship_compares_ids() {
        let cond = parse("tests.Cat", "chases", 4).unwrap();
        assert_eq!(cond.filter_expr().unwrap(), FilterExpr::IdIn(vec![4]));
        assert!(cond.id_set().is_none());
    }

    #[test]
    fn negation_wraps_filter_and_fragment() {
        let cond = parse("tests.Mouse", "name", "jerry").unwrap().negated();
        assert!(matches!(cond.filter_expr().unwrap(), FilterExpr::Not(_)));
        assert!(matches!(cond.index_fragment().unwrap(), Some(IndexQuery::Not(_))));
    }

    #[test]
    fn excluding_an_empty_set_matches_everything() {
        let cond = parse("tests.Mouse", "age__in", Value::List(Vec::new())).unwrap();
        assert!(cond.is_unsatisfiable());
        assert_eq!(cond.index_fragment().unwrap().unwrap().to_string(), "(*:* AND NOT *:*)");
        let cond = cond.negated();
        assert!(!cond.is_unsatisfiable());
        let fragment = cond.index_fragment().unwrap().unwrap();
        assert_eq!(fragment.to_string(), "*:*");
    }

    #[test]
    fn member_requires_array_property() {
        assert_eq!(parse("tests.Mouse", "name__member", "a").unwrap_err().code(), "Field");
        let cond = parse("tests.Mouse", "tags__member", "grey").unwrap();
        assert_eq!(
            cond.index_fragment().unwrap(),
            Some(IndexQuery::term("tags", "grey"))
        );
    }

    #[test]
    fn id_lookups_collect_ids() {
        let cond = parse("tests.Mouse", "id__in", vec![3, 5]).unwrap();
        assert_eq!(cond.id_set(), Some(vec![NodeId(3), NodeId(5)]));
        assert_eq!(parse("tests.Mouse", "pk__gt", 3).unwrap_err().code(), "NotImplemented");
    }

    #[test]
    fn recheck_uses_stored_forms() {
        let cond = parse("tests.Mouse", "age__lte", 4).unwrap();
        let mut record = NodeRecord {
            id: NodeId(1),
            properties: Default::default(),
        };
        record.properties.insert("age".into(), json!(4));
        assert!(cond.matches(&record).unwrap());
        record.properties.insert("age".into(), json!(5));
        assert!(!cond.matches(&record).unwrap());
    }

    #[test]
    fn q_objects_combine_and_negate() {
        let registry = registry();
        let model = registry.get("tests.Mouse").unwrap();
        let q = Q::new("age", 2) & !Q::new("name", "jerry");
        let conditions = q.resolve(&model, &registry).unwrap();
        assert!(!conditions[0].is_negated());
        assert!(conditions[1].is_negated());
        let flipped: Vec<bool> = (!q).lookups().iter().map(|(_, _, negated)| *negated).collect();
        assert_eq!(flipped, vec![true, false]);
    }
}
