//! Stored-form and index-key encodings for every property kind.
//!
//! Stored forms are what the graph persists on the node. Index keys are strings
//! whose lexical order matches the natural order of the value domain for every
//! kind that supports range lookups.

use serde_json::Value as JsonValue;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime};

use crate::error::{GraphOrmError, Result};
use crate::value::Value;

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const DATETIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]-[hour]:[minute]:[second].[subsecond digits:6]");
const DATETIME_INPUT_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Width of the zero-padded magnitude in integer index keys.
pub const INT_KEY_DIGITS: usize = 19;

/// How array properties are persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArrayStorage {
    /// Native JSON array on the node.
    Native,
    /// One string, elements joined with the separator; the separator and
    /// backslash are escaped with a backslash.
    Joined(char),
}

/// Logical type of a property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    /// Free text.
    String,
    /// E-mail address (string with shape validation).
    Email,
    /// URL (string with shape validation).
    Url,
    /// Signed 64-bit integer.
    Integer,
    /// Floating point number; equality-indexable only.
    Float,
    /// Boolean flag.
    Boolean,
    /// Calendar date.
    Date,
    /// Naive UTC timestamp.
    DateTime,
    /// Server-allocated, monotonically increasing integer.
    Auto,
    /// Ordered sequence of scalar elements.
    Array {
        /// Element kind.
        element: Box<PropertyKind>,
        /// Persistence layout.
        storage: ArrayStorage,
    },
}

impl PropertyKind {
    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            PropertyKind::String => "string",
            PropertyKind::Email => "email",
            PropertyKind::Url => "url",
            PropertyKind::Integer => "integer",
            PropertyKind::Float => "float",
            PropertyKind::Boolean => "boolean",
            PropertyKind::Date => "date",
            PropertyKind::DateTime => "datetime",
            PropertyKind::Auto => "auto",
            PropertyKind::Array { .. } => "array",
        }
    }

    /// Whether index keys of this kind are lex-monotone.
    pub fn supports_range(&self) -> bool {
        match self {
            PropertyKind::String
            | PropertyKind::Email
            | PropertyKind::Url
            | PropertyKind::Integer
            | PropertyKind::Date
            | PropertyKind::DateTime
            | PropertyKind::Auto => true,
            PropertyKind::Array { element, .. } => element.supports_range(),
            PropertyKind::Float | PropertyKind::Boolean => false,
        }
    }

    /// Whether the kind holds a sequence.
    pub fn is_array(&self) -> bool {
        matches!(self, PropertyKind::Array { .. })
    }

    /// Scalar element kind (the kind itself for scalars).
    pub fn element(&self) -> &PropertyKind {
        match self {
            PropertyKind::Array { element, .. } => element,
            other => other,
        }
    }

    /// Coerces a loosely-typed value into this kind.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = || {
            GraphOrmError::validation(format!(
                "expected {} value, got {} ({value})",
                self.name(),
                value.type_name()
            ))
        };
        match self {
            PropertyKind::String | PropertyKind::Email | PropertyKind::Url => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Int(v) => Ok(Value::String(v.to_string())),
                _ => Err(mismatch()),
            },
            PropertyKind::Integer | PropertyKind::Auto => match value {
                Value::Int(_) => Ok(value.clone()),
                Value::Float(f) => integral(*f).map(Value::Int).ok_or_else(mismatch),
                Value::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| mismatch()),
                _ => Err(mismatch()),
            },
            PropertyKind::Float => match value {
                Value::Float(_) => Ok(value.clone()),
                Value::Int(v) => Ok(Value::Float(*v as f64)),
                Value::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| mismatch()),
                _ => Err(mismatch()),
            },
            PropertyKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::Int(0) => Ok(Value::Bool(false)),
                Value::Int(1) => Ok(Value::Bool(true)),
                _ => Err(mismatch()),
            },
            PropertyKind::Date => match value {
                Value::Date(_) => Ok(value.clone()),
                Value::DateTime(dt) => Ok(Value::Date(dt.date())),
                Value::String(s) => parse_date(s).map(Value::Date),
                _ => Err(mismatch()),
            },
            PropertyKind::DateTime => match value {
                Value::DateTime(_) => Ok(value.clone()),
                Value::Date(d) => Ok(Value::DateTime(d.midnight())),
                Value::String(s) => parse_datetime(s).map(Value::DateTime),
                _ => Err(mismatch()),
            },
            PropertyKind::Array { element, .. } => match value {
                Value::List(items) => items
                    .iter()
                    .map(|item| element.coerce(item))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::List),
                _ => Err(mismatch()),
            },
        }
    }

    /// Converts a coerced value to the form persisted on the node.
    pub fn to_stored(&self, value: &Value) -> Result<JsonValue> {
        if value.is_null() {
            return Ok(JsonValue::Null);
        }
        let value = self.coerce(value)?;
        Ok(match (self, &value) {
            (PropertyKind::Array { element, storage }, Value::List(items)) => match storage {
                ArrayStorage::Native => JsonValue::Array(
                    items
                        .iter()
                        .map(|item| element.to_stored(item))
                        .collect::<Result<Vec<_>>>()?,
                ),
                ArrayStorage::Joined(sep) => {
                    let parts = items
                        .iter()
                        .map(|item| element.scalar_text(item))
                        .collect::<Result<Vec<_>>>()?;
                    JsonValue::String(join_escaped(&parts, *sep))
                }
            },
            (_, Value::String(s)) => JsonValue::String(s.clone()),
            (_, Value::Int(v)) => JsonValue::from(*v),
            (_, Value::Float(v)) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .ok_or_else(|| GraphOrmError::validation("non-finite floats cannot be stored"))?,
            (_, Value::Bool(v)) => JsonValue::Bool(*v),
            (_, Value::Date(d)) => JsonValue::String(format_date(*d)?),
            (_, Value::DateTime(dt)) => JsonValue::String(format_datetime(*dt)?),
            (_, other) => {
                return Err(GraphOrmError::validation(format!(
                    "cannot store {} as {}",
                    other.type_name(),
                    self.name()
                )))
            }
        })
    }

    /// Converts a stored form back to a typed value.
    pub fn from_stored(&self, stored: &JsonValue) -> Result<Value> {
        let bad = || {
            GraphOrmError::validation(format!("stored value {stored} is not a valid {}", self.name()))
        };
        Ok(match self {
            _ if stored.is_null() => Value::Null,
            PropertyKind::String | PropertyKind::Email | PropertyKind::Url => {
                Value::String(stored.as_str().ok_or_else(bad)?.to_owned())
            }
            PropertyKind::Integer | PropertyKind::Auto => Value::Int(stored.as_i64().ok_or_else(bad)?),
            PropertyKind::Float => Value::Float(stored.as_f64().ok_or_else(bad)?),
            PropertyKind::Boolean => Value::Bool(stored.as_bool().ok_or_else(bad)?),
            PropertyKind::Date => Value::Date(parse_date(stored.as_str().ok_or_else(bad)?)?),
            PropertyKind::DateTime => {
                Value::DateTime(parse_datetime(stored.as_str().ok_or_else(bad)?)?)
            }
            PropertyKind::Array { element, storage } => match (storage, stored) {
                (ArrayStorage::Native, JsonValue::Array(items)) => Value::List(
                    items
                        .iter()
                        .map(|item| element.from_stored(item))
                        .collect::<Result<Vec<_>>>()?,
                ),
                (ArrayStorage::Joined(sep), JsonValue::String(joined)) => Value::List(
                    split_escaped(joined, *sep)
                        .into_iter()
                        .map(|part| element.coerce(&Value::String(part)))
                        .collect::<Result<Vec<_>>>()?,
                ),
                _ => return Err(bad()),
            },
        })
    }

    /// Index keys for a value: one for scalars, one per element for arrays,
    /// none for null.
    pub fn index_keys(&self, value: &Value) -> Result<Vec<String>> {
        if value.is_null() {
            return Ok(Vec::new());
        }
        let value = self.coerce(value)?;
        match (self, &value) {
            (PropertyKind::Array { element, .. }, Value::List(items)) => items
                .iter()
                .filter(|item| !item.is_null())
                .map(|item| element.scalar_index_key(item))
                .collect(),
            _ => Ok(vec![self.scalar_index_key(&value)?]),
        }
    }

    /// Index key of one scalar (or array element) value.
    pub fn scalar_index_key(&self, value: &Value) -> Result<String> {
        let value = self.element().coerce(value)?;
        match value {
            Value::Int(v) => Ok(int_index_key(v)),
            Value::Date(d) => format_date(d),
            Value::DateTime(dt) => format_datetime(dt),
            Value::String(s) => Ok(s),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            other => Err(GraphOrmError::validation(format!(
                "{} values have no index key",
                other.type_name()
            ))),
        }
    }

    /// Smallest possible index key of the kind.
    pub fn min_key(&self) -> String {
        match self.element() {
            PropertyKind::Integer | PropertyKind::Auto => int_index_key(i64::MIN),
            PropertyKind::Date => "0000-01-01".to_owned(),
            PropertyKind::DateTime => "0000-01-01-00:00:00.000000".to_owned(),
            _ => String::new(),
        }
    }

    /// Largest possible index key of the kind.
    pub fn max_key(&self) -> String {
        match self.element() {
            PropertyKind::Integer | PropertyKind::Auto => int_index_key(i64::MAX),
            PropertyKind::Date => "9999-12-31".to_owned(),
            PropertyKind::DateTime => "9999-12-31-23:59:59.999999".to_owned(),
            _ => char::MAX.to_string(),
        }
    }

    fn scalar_text(&self, value: &Value) -> Result<String> {
        match self.coerce(value)? {
            Value::String(s) => Ok(s),
            Value::Int(v) => Ok(v.to_string()),
            Value::Float(v) => Ok(v.to_string()),
            Value::Bool(v) => Ok(v.to_string()),
            Value::Date(d) => format_date(d),
            Value::DateTime(dt) => format_datetime(dt),
            other => Err(GraphOrmError::validation(format!(
                "{} cannot be joined",
                other.type_name()
            ))),
        }
    }
}

/// `f` as an integer when it is whole and inside the `i64` range.
fn integral(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.is_finite() && f.fract() == 0.0 && in_range).then(|| f as i64)
}

/// Sign prefix plus a 19-digit zero-padded magnitude. Negative values store the
/// distance from `i64::MIN` so that lexical order follows numeric order.
pub fn int_index_key(value: i64) -> String {
    if value < 0 {
        let offset = i128::from(value) - i128::from(i64::MIN);
        format!("-{offset:0width$}", width = INT_KEY_DIGITS)
    } else {
        format!("0{value:0width$}", width = INT_KEY_DIGITS)
    }
}

/// Formats a date as `YYYY-MM-DD`.
pub fn format_date(date: Date) -> Result<String> {
    date.format(DATE_FORMAT)
        .map_err(|err| GraphOrmError::validation(format!("cannot format date: {err}")))
}

/// Formats a timestamp as `YYYY-MM-DD-HH:MM:SS.uuuuuu`.
pub fn format_datetime(dt: PrimitiveDateTime) -> Result<String> {
    dt.format(DATETIME_FORMAT)
        .map_err(|err| GraphOrmError::validation(format!("cannot format datetime: {err}")))
}

/// Parses `YYYY-MM-DD`.
pub fn parse_date(text: &str) -> Result<Date> {
    Date::parse(text.trim(), DATE_FORMAT)
        .map_err(|err| GraphOrmError::validation(format!("invalid date '{text}': {err}")))
}

/// Parses the stored timestamp form, or `YYYY-MM-DD HH:MM:SS`, or a bare date.
pub fn parse_datetime(text: &str) -> Result<PrimitiveDateTime> {
    let text = text.trim();
    PrimitiveDateTime::parse(text, DATETIME_FORMAT)
        .or_else(|_| PrimitiveDateTime::parse(text, DATETIME_INPUT_FORMAT))
        .or_else(|err| parse_date(text).map(|d| d.midnight()).map_err(|_| err))
        .map_err(|err| GraphOrmError::validation(format!("invalid datetime '{text}': {err}")))
}

/// Joins parts with `sep`, escaping `sep` and `\` with a backslash.
pub fn join_escaped(parts: &[String], sep: char) -> String {
    let mut out = String::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            out.push(sep);
        }
        for ch in part.chars() {
            if ch == sep || ch == '\\' {
                out.push('\\');
            }
            out.push(ch);
        }
    }
    out
}

/// Inverse of [`join_escaped`]. The empty string decodes to no elements.
pub fn split_escaped(joined: &str, sep: char) -> Vec<String> {
    if joined.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = joined.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if ch == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    parts.push(current);
    parts
}
