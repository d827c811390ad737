use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::{GraphOrmError, Result};
use crate::value::Value;

type CustomCheck = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Declarative check run by [`super::Property::validate`].
#[derive(Clone)]
pub enum Validator {
    /// Maximum character (or element) count.
    MaxLength(usize),
    /// Minimum character (or element) count.
    MinLength(usize),
    /// Inclusive lower bound.
    MinValue(Value),
    /// Inclusive upper bound.
    MaxValue(Value),
    /// String must match the pattern.
    Pattern(Regex),
    /// String must look like an e-mail address.
    Email,
    /// String must look like an absolute http(s)/ftp URL.
    Url,
    /// Arbitrary check returning a message on failure.
    Custom(CustomCheck),
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::MaxLength(n) => write!(f, "MaxLength({n})"),
            Validator::MinLength(n) => write!(f, "MinLength({n})"),
            Validator::MinValue(v) => write!(f, "MinValue({v})"),
            Validator::MaxValue(v) => write!(f, "MaxValue({v})"),
            Validator::Pattern(re) => write!(f, "Pattern({})", re.as_str()),
            Validator::Email => write!(f, "Email"),
            Validator::Url => write!(f, "Url"),
            Validator::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Validator {
    /// Compiles a pattern validator.
    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Validator::Pattern)
            .map_err(|err| GraphOrmError::validation(format!("invalid pattern '{pattern}': {err}")))
    }

    /// Wraps a closure as a validator.
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Validator::Custom(Arc::new(check))
    }

    /// Runs the check against a non-null value.
    pub fn check(&self, property: &str, value: &Value) -> Result<()> {
        let fail = |msg: String| Err(GraphOrmError::validation(format!("{property}: {msg}")));
        match self {
            Validator::MaxLength(max) => match length_of(value) {
                Some(len) if len > *max => {
                    fail(format!("ensure this value has at most {max} characters (it has {len})"))
                }
                _ => Ok(()),
            },
            Validator::MinLength(min) => match length_of(value) {
                Some(len) if len < *min => {
                    fail(format!("ensure this value has at least {min} characters (it has {len})"))
                }
                _ => Ok(()),
            },
            Validator::MinValue(bound) => match value.partial_cmp_value(bound) {
                Some(std::cmp::Ordering::Less) => {
                    fail(format!("ensure this value is greater than or equal to {bound}"))
                }
                _ => Ok(()),
            },
            Validator::MaxValue(bound) => match value.partial_cmp_value(bound) {
                Some(std::cmp::Ordering::Greater) => {
                    fail(format!("ensure this value is less than or equal to {bound}"))
                }
                _ => Ok(()),
            },
            Validator::Pattern(re) => match value.as_str() {
                Some(s) if !re.is_match(s) => fail(format!("'{s}' does not match {}", re.as_str())),
                _ => Ok(()),
            },
            Validator::Email => match value.as_str() {
                Some(s) if !email_regex().is_match(s) => fail(format!("'{s}' is not a valid e-mail address")),
                _ => Ok(()),
            },
            Validator::Url => match value.as_str() {
                Some(s) if !url_regex().is_match(s) => fail(format!("'{s}' is not a valid URL")),
                _ => Ok(()),
            },
            Validator::Custom(check) => check(value).or_else(fail),
        }
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::List(items) => Some(items.len()),
        _ => None,
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
            .expect("static e-mail pattern compiles")
    })
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i)(https?|ftps?)://[^\s/$.?#][^\s]*$").expect("static url pattern compiles")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_length_counts_characters() {
        let v = Validator::MaxLength(3);
        assert!(v.check("name", &Value::from("abc")).is_ok());
        assert!(v.check("name", &Value::from("abcd")).is_err());
    }

    #[test]
    fn email_and_url_shapes() {
        assert!(Validator::Email.check("e", &Value::from("pete@example.com")).is_ok());
        assert!(Validator::Email.check("e", &Value::from("pete@")).is_err());
        assert!(Validator::Url.check("u", &Value::from("https://example.com/x")).is_ok());
        assert!(Validator::Url.check("u", &Value::from("example")).is_err());
    }

    #[test]
    fn custom_message_is_prefixed_with_property() {
        let v = Validator::custom(|_| Err("nope".into()));
        let err = v.check("age", &Value::Int(1)).unwrap_err();
        assert!(err.to_string().contains("age: nope"));
    }
}
