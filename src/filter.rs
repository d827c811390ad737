//! Server-evaluated node predicates.
//!
//! A [`FilterExpr`] operates on stored property forms. It renders to a
//! JavaScript traversal return filter and to a graph-query `WHERE` fragment, and
//! is evaluated natively by the in-process backend.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::Value as JsonValue;

use crate::cypher::Params;
use crate::property::codec::split_escaped;
use crate::transport::{NodeId, PropertyMap};
use crate::typegraph::INSTANCE_REL;

/// Comparison applied to one stored property.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Case-insensitive string equality.
    IEq,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Equal to one element of the operand array.
    In,
    /// Substring.
    Contains,
    /// Case-insensitive substring.
    IContains,
    /// Prefix.
    StartsWith,
    /// Case-insensitive prefix.
    IStartsWith,
    /// Suffix.
    EndsWith,
    /// Case-insensitive suffix.
    IEndsWith,
    /// Regular expression search.
    Regex,
    /// Case-insensitive regular expression search.
    IRegex,
    /// Year component of a stored date/datetime.
    Year,
    /// Month component of a stored date/datetime.
    Month,
    /// Day component of a stored date/datetime.
    Day,
    /// Null test; the operand is a boolean.
    IsNull,
    /// Array contains the operand. Joined arrays carry their separator.
    Member {
        /// Separator of joined storage, `None` for native arrays.
        separator: Option<char>,
    },
    /// Array contains one of the operand elements.
    MemberIn {
        /// Separator of joined storage, `None` for native arrays.
        separator: Option<char>,
    },
}

/// Boolean predicate over a node.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterExpr {
    /// Always holds.
    True,
    /// All hold.
    And(Vec<FilterExpr>),
    /// Any holds.
    Or(Vec<FilterExpr>),
    /// Negation.
    Not(Box<FilterExpr>),
    /// Stored property comparison.
    Compare {
        /// Stored attribute name.
        key: String,
        /// Operator.
        op: FilterOp,
        /// Operand in stored form.
        value: JsonValue,
    },
    /// Node id is one of the listed ids.
    IdIn(Vec<u64>),
    /// Node was reached over an instance edge (rejects type nodes).
    InstanceEdge,
}

impl FilterExpr {
    /// Property comparison.
    pub fn compare(key: impl Into<String>, op: FilterOp, value: impl Into<JsonValue>) -> Self {
        FilterExpr::Compare {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    /// Conjunction that drops `True` members and flattens nesting.
    pub fn all(parts: impl IntoIterator<Item = FilterExpr>) -> Self {
        let mut flat = Vec::new();
        for part in parts {
            match part {
                FilterExpr::True => {}
                FilterExpr::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => FilterExpr::True,
            1 => flat.remove(0),
            _ => FilterExpr::And(flat),
        }
    }

    /// Negation.
    pub fn negate(self) -> Self {
        match self {
            FilterExpr::Not(inner) => *inner,
            other => FilterExpr::Not(Box::new(other)),
        }
    }

    /// Evaluates the predicate against stored properties.
    ///
    /// `last_rel` is the type of the edge the node was reached over, when known.
    pub fn evaluate(&self, id: NodeId, properties: &PropertyMap, last_rel: Option<&str>) -> bool {
        match self {
            FilterExpr::True => true,
            FilterExpr::And(parts) => parts.iter().all(|p| p.evaluate(id, properties, last_rel)),
            FilterExpr::Or(parts) => parts.iter().any(|p| p.evaluate(id, properties, last_rel)),
            FilterExpr::Not(inner) => !inner.evaluate(id, properties, last_rel),
            FilterExpr::IdIn(ids) => ids.contains(&id.0),
            FilterExpr::InstanceEdge => last_rel == Some(INSTANCE_REL),
            FilterExpr::Compare { key, op, value } => {
                compare(properties.get(key).unwrap_or(&JsonValue::Null), op, value)
            }
        }
    }

    /// Renders a JavaScript return-filter body evaluated per traversal position.
    pub fn to_javascript(&self) -> String {
        let mut out = String::from(JS_PRELUDE);
        self.write_js(&mut out);
        out
    }

    fn write_js(&self, out: &mut String) {
        match self {
            FilterExpr::True => out.push_str("true"),
            FilterExpr::And(parts) | FilterExpr::Or(parts) => {
                let joiner = if matches!(self, FilterExpr::And(_)) { " && " } else { " || " };
                out.push('(');
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(joiner);
                    }
                    part.write_js(out);
                }
                out.push(')');
            }
            FilterExpr::Not(inner) => {
                out.push_str("!(");
                inner.write_js(out);
                out.push(')');
            }
            FilterExpr::IdIn(ids) => {
                out.push_str(&format!("member({}, Number(n.getId()))", json_text(&JsonValue::from(ids.clone()))));
            }
            FilterExpr::InstanceEdge => out.push_str(&format!(
                "(position.lastRelationship() != null && String(position.lastRelationship().getType().name()) == {})",
                json_text(&JsonValue::from(INSTANCE_REL))
            )),
            FilterExpr::Compare { key, op, value } => {
                let prop = format!("p({})", json_text(&JsonValue::from(key.as_str())));
                let text = format!("String({prop})");
                let lit = json_text(value);
                let body = match op {
                    FilterOp::Eq => format!("eq({prop}, {lit})"),
                    FilterOp::IEq => format!("{text}.toLowerCase() == String({lit}).toLowerCase()"),
                    FilterOp::Lt => format!("{prop} < {lit}"),
                    FilterOp::Lte => format!("{prop} <= {lit}"),
                    FilterOp::Gt => format!("{prop} > {lit}"),
                    FilterOp::Gte => format!("{prop} >= {lit}"),
                    FilterOp::In => format!("member({lit}, {prop})"),
                    FilterOp::Contains => format!("{text}.indexOf({lit}) >= 0"),
                    FilterOp::IContains => {
                        format!("{text}.toLowerCase().indexOf(String({lit}).toLowerCase()) >= 0")
                    }
                    FilterOp::StartsWith => format!("{text}.indexOf({lit}) == 0"),
                    FilterOp::IStartsWith => {
                        format!("{text}.toLowerCase().indexOf(String({lit}).toLowerCase()) == 0")
                    }
                    FilterOp::EndsWith => format!("ends({text}, String({lit}))"),
                    FilterOp::IEndsWith => {
                        format!("ends({text}.toLowerCase(), String({lit}).toLowerCase())")
                    }
                    FilterOp::Regex => format!("new RegExp({lit}).test({text})"),
                    FilterOp::IRegex => format!("new RegExp({lit}, \"i\").test({text})"),
                    FilterOp::Year | FilterOp::Month | FilterOp::Day => {
                        let (start, end) = date_component_span(op);
                        format!("Number({text}.substring({start}, {end})) == {lit}")
                    }
                    FilterOp::IsNull => {
                        if value.as_bool().unwrap_or(true) {
                            out.push_str(&format!("({prop} == null)"));
                        } else {
                            out.push_str(&format!("({prop} != null)"));
                        }
                        return;
                    }
                    FilterOp::Member { separator } => {
                        format!("member({}, {lit})", js_array(&prop, &text, *separator))
                    }
                    FilterOp::MemberIn { separator } => {
                        format!("any({}, {lit})", js_array(&prop, &text, *separator))
                    }
                };
                out.push_str(&format!("({prop} != null && {body})"));
            }
        }
    }

    /// Renders a graph-query predicate over `var`, pushing operands into `params`.
    pub fn to_cypher(&self, var: &str, params: &mut Params) -> String {
        match self {
            FilterExpr::True => "true".to_owned(),
            FilterExpr::And(parts) | FilterExpr::Or(parts) => {
                let joiner = if matches!(self, FilterExpr::And(_)) { " AND " } else { " OR " };
                let rendered: Vec<String> = parts.iter().map(|p| p.to_cypher(var, params)).collect();
                format!("({})", rendered.join(joiner))
            }
            FilterExpr::Not(inner) => format!("NOT({})", inner.to_cypher(var, params)),
            FilterExpr::IdIn(ids) => {
                let slot = params.push(JsonValue::from(ids.clone()));
                format!("id({var}) IN {slot}")
            }
            FilterExpr::InstanceEdge => "true".to_owned(),
            FilterExpr::Compare { key, op, value } => {
                let prop = format!("{var}.`{key}`");
                let has = format!("has({prop})");
                let regex = |params: &mut Params, pattern: String| {
                    let slot = params.push(JsonValue::from(pattern));
                    format!("({has} AND str({prop}) =~ {slot})")
                };
                let text = value_text(value);
                match op {
                    FilterOp::Eq => {
                        let slot = params.push(value.clone());
                        format!("({has} AND {prop} = {slot})")
                    }
                    FilterOp::Lt | FilterOp::Lte | FilterOp::Gt | FilterOp::Gte => {
                        let symbol = match op {
                            FilterOp::Lt => "<",
                            FilterOp::Lte => "<=",
                            FilterOp::Gt => ">",
                            _ => ">=",
                        };
                        let slot = params.push(value.clone());
                        format!("({has} AND {prop} {symbol} {slot})")
                    }
                    FilterOp::In => {
                        let slot = params.push(value.clone());
                        format!("({has} AND {prop} IN {slot})")
                    }
                    FilterOp::IsNull => {
                        if value.as_bool().unwrap_or(true) {
                            format!("NOT({has})")
                        } else {
                            has
                        }
                    }
                    FilterOp::IEq => regex(params, format!("(?i){}", regex::escape(&text))),
                    FilterOp::Contains => regex(params, format!("(?s).*{}.*", regex::escape(&text))),
                    FilterOp::IContains => regex(params, format!("(?is).*{}.*", regex::escape(&text))),
                    FilterOp::StartsWith => regex(params, format!("(?s){}.*", regex::escape(&text))),
                    FilterOp::IStartsWith => regex(params, format!("(?is){}.*", regex::escape(&text))),
                    FilterOp::EndsWith => regex(params, format!("(?s).*{}", regex::escape(&text))),
                    FilterOp::IEndsWith => regex(params, format!("(?is).*{}", regex::escape(&text))),
                    FilterOp::Regex => regex(params, format!("(?s).*(?:{text}).*")),
                    FilterOp::IRegex => regex(params, format!("(?is).*(?:{text}).*")),
                    FilterOp::Year => regex(params, format!("0*{text}-.*")),
                    FilterOp::Month => regex(params, format!("[0-9]{{4}}-{:02}-.*", value.as_i64().unwrap_or(0))),
                    FilterOp::Day => regex(params, format!("[0-9]{{4}}-[0-9]{{2}}-{:02}.*", value.as_i64().unwrap_or(0))),
                    FilterOp::Member { separator: None } => {
                        let slot = params.push(value.clone());
                        format!("({has} AND ANY(x IN {prop} WHERE x = {slot}))")
                    }
                    FilterOp::MemberIn { separator: None } => {
                        let slot = params.push(value.clone());
                        format!("({has} AND ANY(x IN {prop} WHERE x IN {slot}))")
                    }
                    FilterOp::Member { separator: Some(sep) } => {
                        regex(params, joined_member_pattern(*sep, std::slice::from_ref(value)))
                    }
                    FilterOp::MemberIn { separator: Some(sep) } => {
                        let items = value.as_array().cloned().unwrap_or_default();
                        regex(params, joined_member_pattern(*sep, &items))
                    }
                }
            }
        }
    }
}

const JS_PRELUDE: &str = "var n = position.endNode(); \
function p(k) { return n.hasProperty(k) ? n.getProperty(k) : null; } \
function eq(a, b) { return a == b || String(a) == String(b); } \
function member(a, v) { for (var i = 0; i < a.length; i++) { if (eq(a[i], v)) return true; } return false; } \
function any(a, vs) { for (var i = 0; i < vs.length; i++) { if (member(a, vs[i])) return true; } return false; } \
function ends(s, t) { return s.length >= t.length && s.substring(s.length - t.length) == t; } \
function split(s, sep) { var out = []; var cur = ''; if (s.length == 0) return out; \
for (var i = 0; i < s.length; i++) { var c = s.charAt(i); \
if (c == '\\\\') { i++; cur += s.charAt(i); } else if (c == sep) { out.push(cur); cur = ''; } else { cur += c; } } \
out.push(cur); return out; } ";

fn js_array(prop: &str, text: &str, separator: Option<char>) -> String {
    match separator {
        None => prop.to_owned(),
        Some(sep) => format!("split({text}, {})", json_text(&JsonValue::from(sep.to_string()))),
    }
}

fn json_text(value: &JsonValue) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_owned())
}

fn joined_member_pattern(sep: char, items: &[JsonValue]) -> String {
    let sep_text = regex::escape(&sep.to_string());
    let alternatives: Vec<String> = items
        .iter()
        .map(|item| {
            let mut escaped = String::new();
            for ch in value_text(item).chars() {
                if ch == sep || ch == '\\' {
                    escaped.push('\\');
                }
                escaped.push(ch);
            }
            regex::escape(&escaped)
        })
        .collect();
    format!(
        "(?s)(.*{sep_text})?(?:{})({sep_text}.*)?",
        alternatives.join("|")
    )
}

fn date_component_span(op: &FilterOp) -> (usize, usize) {
    match op {
        FilterOp::Year => (0, 4),
        FilterOp::Month => (5, 7),
        _ => (8, 10),
    }
}

/// Text form of a stored scalar, as used by joined arrays and string operators.
pub(crate) fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => match n.as_i64() {
            Some(v) => v.to_string(),
            None => n.as_f64().map(|f| f.to_string()).unwrap_or_default(),
        },
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Orders two stored values of the same JSON shape.
pub(crate) fn cmp_json(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match cmp_json(a, b) {
        Some(ord) => ord == Ordering::Equal,
        None => a == b,
    }
}

fn regex_search(pattern: &str, text: &str, insensitive: bool) -> bool {
    RegexBuilder::new(pattern)
        .case_insensitive(insensitive)
        .build()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

fn stored_elements(stored: &JsonValue, separator: Option<char>) -> Vec<JsonValue> {
    match (stored, separator) {
        (JsonValue::Array(items), _) => items.clone(),
        (JsonValue::String(joined), Some(sep)) => split_escaped(joined, sep)
            .into_iter()
            .map(JsonValue::String)
            .collect(),
        _ => Vec::new(),
    }
}

fn element_matches(element: &JsonValue, operand: &JsonValue, joined: bool) -> bool {
    if joined {
        value_text(element) == value_text(operand)
    } else {
        json_eq(element, operand)
    }
}

fn compare(stored: &JsonValue, op: &FilterOp, operand: &JsonValue) -> bool {
    if stored.is_null() {
        return matches!(op, FilterOp::IsNull) && operand.as_bool().unwrap_or(true);
    }
    let text = || value_text(stored);
    let needle = || value_text(operand);
    match op {
        FilterOp::Eq => json_eq(stored, operand),
        FilterOp::IEq => text().to_lowercase() == needle().to_lowercase(),
        FilterOp::Lt => cmp_json(stored, operand) == Some(Ordering::Less),
        FilterOp::Lte => matches!(cmp_json(stored, operand), Some(Ordering::Less | Ordering::Equal)),
        FilterOp::Gt => cmp_json(stored, operand) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(
            cmp_json(stored, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::In => operand
            .as_array()
            .is_some_and(|items| items.iter().any(|item| json_eq(stored, item))),
        FilterOp::Contains => text().contains(&needle()),
        FilterOp::IContains => text().to_lowercase().contains(&needle().to_lowercase()),
        FilterOp::StartsWith => text().starts_with(&needle()),
        FilterOp::IStartsWith => text().to_lowercase().starts_with(&needle().to_lowercase()),
        FilterOp::EndsWith => text().ends_with(&needle()),
        FilterOp::IEndsWith => text().to_lowercase().ends_with(&needle().to_lowercase()),
        FilterOp::Regex => regex_search(&needle(), &text(), false),
        FilterOp::IRegex => regex_search(&needle(), &text(), true),
        FilterOp::Year | FilterOp::Month | FilterOp::Day => {
            let (start, end) = date_component_span(op);
            text()
                .get(start..end)
                .and_then(|part| part.parse::<i64>().ok())
                .zip(operand.as_i64())
                .is_some_and(|(have, want)| have == want)
        }
        FilterOp::Member { separator } => stored_elements(stored, *separator)
            .iter()
            .any(|element| element_matches(element, operand, separator.is_some())),
        FilterOp::MemberIn { separator } => {
            let wanted = operand.as_array().cloned().unwrap_or_default();
            stored_elements(stored, *separator).iter().any(|element| {
                wanted
                    .iter()
                    .any(|w| element_matches(element, w, separator.is_some()))
            })
        }
        FilterOp::IsNull => !operand.as_bool().unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: JsonValue) -> PropertyMap {
        value
            .as_object()
            .map(|map| map.clone().into_iter().collect())
            .unwrap_or_default()
    }

    #[test]
    fn string_operators() {
        let p = props(json!({"name": "Peter"}));
        let id = NodeId(1);
        let check = |op: FilterOp, v: &str| FilterExpr::compare("name", op, v).evaluate(id, &p, None);
        assert!(check(FilterOp::IStartsWith, "pete"));
        assert!(!check(FilterOp::StartsWith, "pete"));
        assert!(check(FilterOp::IContains, "ETE"));
        assert!(check(FilterOp::EndsWith, "ter"));
        assert!(check(FilterOp::IRegex, "^p.t"));
        assert!(check(FilterOp::IEq, "peter"));
    }

    #[test]
    fn missing_property_only_matches_isnull() {
        let p = PropertyMap::new();
        let id = NodeId(1);
        assert!(!FilterExpr::compare("age", FilterOp::Lt, 5).evaluate(id, &p, None));
        assert!(FilterExpr::compare("age", FilterOp::IsNull, true).evaluate(id, &p, None));
        assert!(!FilterExpr::compare("age", FilterOp::IsNull, false).evaluate(id, &p, None));
    }

    #[test]
    fn date_components_read_stored_prefix() {
        let p = props(json!({"born": "2012-03-04-05:06:07.000000"}));
        let id = NodeId(1);
        assert!(FilterExpr::compare("born", FilterOp::Year, 2012).evaluate(id, &p, None));
        assert!(FilterExpr::compare("born", FilterOp::Month, 3).evaluate(id, &p, None));
        assert!(!FilterExpr::compare("born", FilterOp::Day, 5).evaluate(id, &p, None));
    }

    #[test]
    fn joined_membership_respects_escapes() {
        let p = props(json!({"tags": "a\\,b,c"}));
        let id = NodeId(1);
        let member = |v: &str| {
            FilterExpr::compare("tags", FilterOp::Member { separator: Some(',') }, v)
                .evaluate(id, &p, None)
        };
        assert!(member("a,b"));
        assert!(member("c"));
        assert!(!member("a"));
    }

    #[test]
    fn instance_edge_rejects_type_nodes() {
        let p = PropertyMap::new();
        assert!(FilterExpr::InstanceEdge.evaluate(NodeId(1), &p, Some(INSTANCE_REL)));
        assert!(!FilterExpr::InstanceEdge.evaluate(NodeId(1), &p, Some("<<TYPE>>")));
    }

    #[test]
    fn cypher_rendering_uses_parameters() {
        let mut params = Params::default();
        let expr = FilterExpr::all([
            FilterExpr::compare("age", FilterOp::Gt, 13),
            FilterExpr::compare("name", FilterOp::Eq, "jerry").negate(),
        ]);
        let rendered = expr.to_cypher("n", &mut params);
        assert_eq!(
            rendered,
            "((has(n.`age`) AND n.`age` > {p0}) AND NOT((has(n.`name`) AND n.`name` = {p1})))"
        );
        assert_eq!(params.get("p1"), Some(&json!("jerry")));
    }

    #[test]
    fn javascript_rendering_guards_missing_properties() {
        let js = FilterExpr::compare("age", FilterOp::Gte, 10).to_javascript();
        assert!(js.ends_with("(p(\"age\") != null && p(\"age\") >= 10)"));
    }
}
