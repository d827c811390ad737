use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GraphOrmError>;

/// Errors surfaced by the mapping layer.
///
/// Transport failures carry the server message verbatim so callers can match on
/// the well-known markers the helper library emits.
#[derive(Debug, Error)]
pub enum GraphOrmError {
    /// Missing or malformed settings, or an endpoint that cannot be reached at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Bad value, bad lookup shape, or an ambiguous relationship.
    #[error("validation error: {0}")]
    Validation(String),
    /// A lookup targets a property that cannot answer it.
    #[error("field error: {0}")]
    Field(String),
    /// A second write would collide on an indexed unique property.
    #[error("uniqueness violation on <{model}>.{property}: value {value} already in use")]
    Uniqueness {
        /// Model label.
        model: String,
        /// Property name.
        property: String,
        /// Offending index key.
        value: String,
    },
    /// Id lookup with no match.
    #[error("{0} not found")]
    NotFound(String),
    /// `get` matched nothing.
    #[error("{0} matching query does not exist")]
    DoesNotExist(String),
    /// `get` matched more than one object.
    #[error("get() returned more than one {model} ({count} matches)")]
    MultipleObjects {
        /// Model label.
        model: String,
        /// Number of matches observed.
        count: usize,
    },
    /// Explicit refusal of a reserved API.
    #[error("unsupported operation: {0}")]
    NotSupported(String),
    /// Lookup operator or feature without an implementation.
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// The helper script library could not be loaded after one retry.
    #[error("server-side library not loaded: {0}")]
    LibraryNotLoaded(String),
    /// Remote call failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// JSON payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphOrmError {
    /// Shorthand for [`GraphOrmError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        GraphOrmError::Validation(msg.into())
    }

    /// Shorthand for [`GraphOrmError::Field`].
    pub fn field(msg: impl Into<String>) -> Self {
        GraphOrmError::Field(msg.into())
    }

    /// Shorthand for [`GraphOrmError::Configuration`].
    pub fn configuration(msg: impl Into<String>) -> Self {
        GraphOrmError::Configuration(msg.into())
    }

    /// Shorthand for [`GraphOrmError::Transport`].
    pub fn transport(msg: impl Into<String>) -> Self {
        GraphOrmError::Transport(msg.into())
    }

    /// Builds a uniqueness error naming `<model>.<property>`.
    pub fn uniqueness(
        model: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        GraphOrmError::Uniqueness {
            model: model.into(),
            property: property.into(),
            value: value.into(),
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            GraphOrmError::Configuration(_) => "Configuration",
            GraphOrmError::Validation(_) => "Validation",
            GraphOrmError::Field(_) => "Field",
            GraphOrmError::Uniqueness { .. } => "Uniqueness",
            GraphOrmError::NotFound(_) => "NotFound",
            GraphOrmError::DoesNotExist(_) => "DoesNotExist",
            GraphOrmError::MultipleObjects { .. } => "MultipleObjects",
            GraphOrmError::NotSupported(_) => "NotSupported",
            GraphOrmError::NotImplemented(_) => "NotImplemented",
            GraphOrmError::LibraryNotLoaded(_) => "LibraryNotLoaded",
            GraphOrmError::Transport(_) => "Transport",
            GraphOrmError::Serialization(_) => "Serialization",
        }
    }
}

impl Clone for GraphOrmError {
    fn clone(&self) -> Self {
        match self {
            GraphOrmError::Configuration(msg) => GraphOrmError::Configuration(msg.clone()),
            GraphOrmError::Validation(msg) => GraphOrmError::Validation(msg.clone()),
            GraphOrmError::Field(msg) => GraphOrmError::Field(msg.clone()),
            GraphOrmError::Uniqueness {
                model,
                property,
                value,
            } => GraphOrmError::uniqueness(model.clone(), property.clone(), value.clone()),
            GraphOrmError::NotFound(msg) => GraphOrmError::NotFound(msg.clone()),
            GraphOrmError::DoesNotExist(msg) => GraphOrmError::DoesNotExist(msg.clone()),
            GraphOrmError::MultipleObjects { model, count } => GraphOrmError::MultipleObjects {
                model: model.clone(),
                count: *count,
            },
            GraphOrmError::NotSupported(msg) => GraphOrmError::NotSupported(msg.clone()),
            GraphOrmError::NotImplemented(msg) => GraphOrmError::NotImplemented(msg.clone()),
            GraphOrmError::LibraryNotLoaded(msg) => GraphOrmError::LibraryNotLoaded(msg.clone()),
            GraphOrmError::Transport(msg) => GraphOrmError::Transport(msg.clone()),
            // serde_json errors are not Clone; keep the message and the variant.
            GraphOrmError::Serialization(err) => {
                GraphOrmError::Serialization(serde::de::Error::custom(err.to_string()))
            }
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for GraphOrmError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!(error = %err, "graphorm.transport.http_failure");
        GraphOrmError::Transport(err.to_string())
    }
}
