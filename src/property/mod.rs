//! Typed, validated, optionally indexed model attributes.
//!
//! A [`Property`] is declared with one of the kind constructors and refined with
//! builder flags, then attached to a model by name:
//!
//! ```
//! use graphorm::property::Property;
//!
//! let age = Property::integer().indexed().min_value(0);
//! assert!(age.is_range_indexed());
//! ```

pub mod codec;
pub mod validators;

use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::error::{GraphOrmError, Result};
use crate::value::Value;

pub use codec::{ArrayStorage, PropertyKind};
pub use validators::Validator;

/// Attribute names starting with this prefix are reserved for bookkeeping.
pub const RESERVED_PREFIX: &str = "_";

/// Declaration of one model attribute.
#[derive(Clone, Debug)]
pub struct Property {
    name: String,
    kind: PropertyKind,
    validators: Vec<Validator>,
    default: Option<Value>,
    indexed: bool,
    indexed_fulltext: bool,
    range_index: Option<bool>,
    unique: bool,
    null: bool,
    blank: bool,
    editable: bool,
    choices: Option<Vec<(Value, String)>>,
    auto_now: bool,
    auto_now_add: bool,
}

impl Property {
    /// Declares a property of the given kind with default flags.
    pub fn new(kind: PropertyKind) -> Self {
        let mut validators = Vec::new();
        match kind {
            PropertyKind::Email => validators.push(Validator::Email),
            PropertyKind::Url => validators.push(Validator::Url),
            _ => {}
        }
        let auto = kind == PropertyKind::Auto;
        Self {
            name: String::new(),
            kind,
            validators,
            default: None,
            indexed: auto,
            indexed_fulltext: false,
            range_index: None,
            unique: false,
            null: auto,
            blank: false,
            editable: !auto,
            choices: None,
            auto_now: false,
            auto_now_add: false,
        }
    }

    /// Free-text property.
    pub fn string() -> Self {
        Self::new(PropertyKind::String)
    }

    /// E-mail property.
    pub fn email() -> Self {
        Self::new(PropertyKind::Email)
    }

    /// URL property.
    pub fn url() -> Self {
        Self::new(PropertyKind::Url)
    }

    /// 64-bit integer property.
    pub fn integer() -> Self {
        Self::new(PropertyKind::Integer)
    }

    /// Floating point property.
    pub fn float() -> Self {
        Self::new(PropertyKind::Float)
    }

    /// Boolean property.
    pub fn boolean() -> Self {
        Self::new(PropertyKind::Boolean)
    }

    /// Date property.
    pub fn date() -> Self {
        Self::new(PropertyKind::Date)
    }

    /// Timestamp property.
    pub fn datetime() -> Self {
        Self::new(PropertyKind::DateTime)
    }

    /// Server-allocated increasing integer, indexed by default.
    pub fn auto() -> Self {
        Self::new(PropertyKind::Auto)
    }

    /// Array stored natively.
    pub fn array(element: PropertyKind) -> Self {
        Self::new(PropertyKind::Array {
            element: Box::new(element),
            storage: ArrayStorage::Native,
        })
    }

    /// Array stored as one string joined with `separator`.
    pub fn joined_array(element: PropertyKind, separator: char) -> Self {
        Self::new(PropertyKind::Array {
            element: Box::new(element),
            storage: ArrayStorage::Joined(separator),
        })
    }

    /// Registers the property in the model's shared index.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Marks the property for full-text indexing (implies `indexed`).
    pub fn fulltext(mut self) -> Self {
        self.indexed = true;
        self.indexed_fulltext = true;
        self
    }

    /// Disables range lookups on an indexed property.
    pub fn without_range_index(mut self) -> Self {
        self.range_index = Some(false);
        self
    }

    /// Requires the index key to be unique within the model family.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Allows null values.
    pub fn null(mut self) -> Self {
        self.null = true;
        self
    }

    /// Allows empty strings.
    pub fn blank(mut self) -> Self {
        self.blank = true;
        self
    }

    /// Excludes the property from bulk assignment.
    pub fn not_editable(mut self) -> Self {
        self.editable = false;
        self
    }

    /// Default applied to new instances.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Restricts values to the listed choices.
    pub fn choices<I, V, L>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = (V, L)>,
        V: Into<Value>,
        L: Into<String>,
    {
        self.choices = Some(
            choices
                .into_iter()
                .map(|(value, label)| (value.into(), label.into()))
                .collect(),
        );
        self
    }

    /// Adds a validator.
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Shorthand for [`Validator::MaxLength`].
    pub fn max_length(self, max: usize) -> Self {
        self.validator(Validator::MaxLength(max))
    }

    /// Shorthand for [`Validator::MinValue`].
    pub fn min_value(self, min: impl Into<Value>) -> Self {
        self.validator(Validator::MinValue(min.into()))
    }

    /// Shorthand for [`Validator::MaxValue`].
    pub fn max_value(self, max: impl Into<Value>) -> Self {
        self.validator(Validator::MaxValue(max.into()))
    }

    /// Stamps the current moment on every save.
    pub fn auto_now(mut self) -> Self {
        self.auto_now = true;
        self
    }

    /// Stamps the current moment on the first save.
    pub fn auto_now_add(mut self) -> Self {
        self.auto_now_add = true;
        self
    }

    pub(crate) fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    /// Attribute name on the owning model.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical type.
    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    /// Whether the property is registered in the family index.
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Whether the property is full-text indexed.
    pub fn is_fulltext(&self) -> bool {
        self.indexed_fulltext
    }

    /// Whether range lookups can be answered by the index.
    pub fn is_range_indexed(&self) -> bool {
        self.indexed && self.range_index.unwrap_or_else(|| self.kind.supports_range())
    }

    /// Whether the index key must be unique.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Whether null is accepted.
    pub fn is_nullable(&self) -> bool {
        self.null
    }

    /// Whether empty strings are accepted.
    pub fn is_blank_allowed(&self) -> bool {
        self.blank
    }

    /// Whether bulk assignment may touch the property.
    pub fn is_editable(&self) -> bool {
        self.editable
    }

    /// Whether the server allocates the value.
    pub fn is_auto(&self) -> bool {
        self.kind == PropertyKind::Auto
    }

    /// Declared choices, if any.
    pub fn choices_list(&self) -> Option<&[(Value, String)]> {
        self.choices.as_deref()
    }

    /// Default value for a fresh instance.
    pub fn default_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }

    /// Coerces a loosely-typed value into the property's kind.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        self.kind.coerce(value).map_err(|err| match err {
            GraphOrmError::Validation(msg) => {
                GraphOrmError::validation(format!("{}: {msg}", self.name))
            }
            other => other,
        })
    }

    /// Runs null/blank/choice checks and every declared validator.
    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if self.null {
                return Ok(());
            }
            return Err(GraphOrmError::validation(format!(
                "{}: this property cannot be null",
                self.name
            )));
        }
        if !self.blank {
            if let Value::String(s) = value {
                if s.is_empty() {
                    return Err(GraphOrmError::validation(format!(
                        "{}: this property cannot be blank",
                        self.name
                    )));
                }
            }
        }
        if let Some(choices) = &self.choices {
            let allowed = |v: &Value| choices.iter().any(|(choice, _)| choice == v);
            let ok = match value {
                Value::List(items) if self.kind.is_array() => items.iter().all(allowed),
                other => allowed(other),
            };
            if !ok {
                return Err(GraphOrmError::validation(format!(
                    "{}: value {value} is not a valid choice",
                    self.name
                )));
            }
        }
        for validator in &self.validators {
            validator.check(&self.name, value)?;
        }
        Ok(())
    }

    /// Coerces, validates, and returns the stored form.
    pub fn clean(&self, value: &Value) -> Result<JsonValue> {
        let coerced = self.coerce(value)?;
        self.validate(&coerced)?;
        self.to_stored(&coerced)
    }

    /// Value → stored form.
    pub fn to_stored(&self, value: &Value) -> Result<JsonValue> {
        self.kind.to_stored(value)
    }

    /// Stored form → value.
    pub fn from_stored(&self, stored: &JsonValue) -> Result<Value> {
        self.kind.from_stored(stored)
    }

    /// Index key of a scalar value (first key for arrays); `None` for null.
    pub fn to_index_key(&self, value: &Value) -> Result<Option<String>> {
        Ok(self.kind.index_keys(value)?.into_iter().next())
    }

    /// Every index key registered for the value.
    pub fn index_keys(&self, value: &Value) -> Result<Vec<String>> {
        self.kind.index_keys(value)
    }

    /// Index key for a single comparison operand (array element for arrays).
    pub fn operand_index_key(&self, value: &Value) -> Result<String> {
        self.kind.scalar_index_key(value)
    }

    /// Lower sentinel for open-ended range lookups.
    pub fn min_key(&self) -> String {
        self.kind.min_key()
    }

    /// Upper sentinel for open-ended range lookups.
    pub fn max_key(&self) -> String {
        self.kind.max_key()
    }

    /// Value to stamp before saving, if the property stamps one.
    pub fn pre_save(&self, current: &Value, created: bool) -> Option<Value> {
        if !(self.auto_now || (self.auto_now_add && (created || current.is_null()))) {
            return None;
        }
        let now = OffsetDateTime::now_utc();
        let now = time::PrimitiveDateTime::new(now.date(), now.time());
        match self.kind {
            PropertyKind::Date => Some(Value::Date(now.date())),
            PropertyKind::DateTime => Some(Value::DateTime(now)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_string_cleans_to_stored_form() {
        let p = Property::string().indexed().unique().max_length(5).with_name("name");
        assert_eq!(p.clean(&Value::from("pete")).unwrap(), JsonValue::from("pete"));
        assert!(p.clean(&Value::from("peterson")).is_err());
    }

    #[test]
    fn out_of_range_float_is_not_an_integer() {
        let p = Property::integer().with_name("age");
        assert_eq!(p.clean(&Value::Float(1e30)).unwrap_err().code(), "Validation");
        assert_eq!(p.clean(&Value::Float(7.0)).unwrap(), JsonValue::from(7));
    }

    #[test]
    fn null_rejected_only_when_not_nullable() {
        let strict = Property::integer().with_name("age");
        let lenient = Property::integer().null().with_name("age");
        assert!(strict.validate(&Value::Null).is_err());
        assert!(lenient.validate(&Value::Null).is_ok());
    }

    #[test]
    fn blank_strings_need_opt_in() {
        let p = Property::string().with_name("title");
        assert!(p.validate(&Value::from("")).is_err());
        assert!(p.clone().blank().validate(&Value::from("")).is_ok());
    }

    #[test]
    fn choices_are_enforced() {
        let p = Property::string()
            .choices([("m", "Male"), ("f", "Female")])
            .with_name("gender");
        assert!(p.validate(&Value::from("m")).is_ok());
        assert!(p.validate(&Value::from("x")).is_err());
    }

    #[test]
    fn range_index_follows_kind() {
        assert!(Property::date().indexed().is_range_indexed());
        assert!(!Property::boolean().indexed().is_range_indexed());
        assert!(!Property::integer().is_range_indexed());
        assert!(!Property::integer().indexed().without_range_index().is_range_indexed());
    }

    #[test]
    fn auto_now_add_stamps_only_on_creation() {
        let p = Property::datetime().auto_now_add().null().with_name("created");
        assert!(p.pre_save(&Value::Null, true).is_some());
        let stamped = p.pre_save(&Value::Null, true).unwrap();
        assert!(p.pre_save(&stamped, false).is_none());
    }

    #[test]
    fn auto_property_defaults() {
        let p = Property::auto();
        assert!(p.is_indexed());
        assert!(p.is_nullable());
        assert!(!p.is_editable());
    }
}
