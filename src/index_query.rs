//! Structured full-text/range index queries.
//!
//! Queries are built from condition fragments, rendered to Lucene syntax for the
//! REST index endpoint, and evaluated directly by the in-process backend.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;

use crate::transport::NodeId;

const MATCH_ALL: &str = "*:*";

/// Index contents: key → index value → nodes.
pub type IndexEntries = BTreeMap<String, BTreeMap<String, BTreeSet<NodeId>>>;

/// One index query fragment.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexQuery {
    /// Exact value.
    Term {
        /// Index key (attribute name).
        key: String,
        /// Index value.
        value: String,
    },
    /// Values starting with the prefix.
    Prefix {
        /// Index key.
        key: String,
        /// Literal prefix; metacharacters are escaped on render.
        prefix: String,
    },
    /// Lexical range.
    Range {
        /// Index key.
        key: String,
        /// Lower end.
        low: Bound<String>,
        /// Upper end.
        high: Bound<String>,
    },
    /// Every fragment holds.
    And(Vec<IndexQuery>),
    /// At least one fragment holds.
    Or(Vec<IndexQuery>),
    /// The fragment does not hold.
    Not(Box<IndexQuery>),
}

impl IndexQuery {
    /// Exact term.
    pub fn term(key: impl Into<String>, value: impl Into<String>) -> Self {
        IndexQuery::Term {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Wraps in a negation. The empty disjunction (match nothing) and the
    /// empty conjunction (match everything) swap places.
    pub fn negate(self) -> Self {
        match self {
            IndexQuery::Not(inner) => *inner,
            IndexQuery::Or(parts) if parts.is_empty() => IndexQuery::And(parts),
            IndexQuery::And(parts) if parts.is_empty() => IndexQuery::Or(parts),
            other => IndexQuery::Not(Box::new(other)),
        }
    }

    /// Conjunction, flattening nested conjunctions.
    pub fn and(parts: Vec<IndexQuery>) -> Self {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                IndexQuery::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            IndexQuery::And(flat)
        }
    }

    /// Nodes matching the query.
    pub fn evaluate(&self, entries: &IndexEntries) -> BTreeSet<NodeId> {
        match self {
            IndexQuery::Term { key, value } => entries
                .get(key)
                .and_then(|values| values.get(value))
                .cloned()
                .unwrap_or_default(),
            IndexQuery::Prefix { key, prefix } => {
                let mut out = BTreeSet::new();
                if let Some(values) = entries.get(key) {
                    for (value, nodes) in values.range::<String, _>((Bound::Included(prefix), Bound::Unbounded)) {
                        if !value.starts_with(prefix.as_str()) {
                            break;
                        }
                        out.extend(nodes.iter().copied());
                    }
                }
                out
            }
            IndexQuery::Range { key, low, high } => {
                let mut out = BTreeSet::new();
                if let Some(values) = entries.get(key) {
                    if range_is_empty(low, high) {
                        return out;
                    }
                    for (_, nodes) in values.range::<String, _>((low.as_ref(), high.as_ref())) {
                        out.extend(nodes.iter().copied());
                    }
                }
                out
            }
            IndexQuery::And(parts) => {
                let mut iter = parts.iter();
                let Some(first) = iter.next() else {
                    return all_nodes(entries);
                };
                let mut acc = first.evaluate(entries);
                for part in iter {
                    let next = part.evaluate(entries);
                    acc.retain(|id| next.contains(id));
                }
                acc
            }
            IndexQuery::Or(parts) => parts.iter().flat_map(|p| p.evaluate(entries)).collect(),
            IndexQuery::Not(inner) => {
                let excluded = inner.evaluate(entries);
                all_nodes(entries)
                    .into_iter()
                    .filter(|id| !excluded.contains(id))
                    .collect()
            }
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, nested: bool) -> fmt::Result {
        match self {
            IndexQuery::Term { key, value } => {
                write!(f, "{}:\"{}\"", escape(key), escape_quoted(value))
            }
            IndexQuery::Prefix { key, prefix } => write!(f, "{}:{}*", escape(key), escape(prefix)),
            IndexQuery::Range { key, low, high } => {
                let (open, lo) = match low {
                    Bound::Included(v) => ('[', format!("\"{}\"", escape_quoted(v))),
                    Bound::Excluded(v) => ('{', format!("\"{}\"", escape_quoted(v))),
                    Bound::Unbounded => ('[', "*".to_owned()),
                };
                let (close, hi) = match high {
                    Bound::Included(v) => (']', format!("\"{}\"", escape_quoted(v))),
                    Bound::Excluded(v) => ('}', format!("\"{}\"", escape_quoted(v))),
                    Bound::Unbounded => (']', "*".to_owned()),
                };
                write!(f, "{}:{open}{lo} TO {hi}{close}", escape(key))
            }
            IndexQuery::And(parts) if parts.is_empty() => write!(f, "{MATCH_ALL}"),
            IndexQuery::Or(parts) if parts.is_empty() => write!(f, "({MATCH_ALL} AND NOT {MATCH_ALL})"),
            IndexQuery::And(parts) | IndexQuery::Or(parts) => {
                let joiner = if matches!(self, IndexQuery::And(_)) { " AND " } else { " OR " };
                if nested {
                    write!(f, "(")?;
                }
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        write!(f, "{joiner}")?;
                    }
                    part.render(f, true)?;
                }
                if nested {
                    write!(f, ")")?;
                }
                Ok(())
            }
            IndexQuery::Not(inner) => {
                write!(f, "({MATCH_ALL} AND NOT ")?;
                inner.render(f, true)?;
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for IndexQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, false)
    }
}

fn range_is_empty(low: &Bound<String>, high: &Bound<String>) -> bool {
    match (low, high) {
        (Bound::Included(l), Bound::Included(h)) => l > h,
        (Bound::Included(l), Bound::Excluded(h))
        | (Bound::Excluded(l), Bound::Included(h))
        | (Bound::Excluded(l), Bound::Excluded(h)) => l >= h,
        _ => false,
    }
}

fn all_nodes(entries: &IndexEntries) -> BTreeSet<NodeId> {
    entries
        .values()
        .flat_map(|values| values.values())
        .flat_map(|nodes| nodes.iter().copied())
        .collect()
}

const LUCENE_SPECIAL: &[char] = &[
    '+', '-', '&', '|', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~', '*', '?', ':', '\\', '/',
    ' ',
];

/// Escapes Lucene metacharacters (including wildcards and whitespace).
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if LUCENE_SPECIAL.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn escape_quoted(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
