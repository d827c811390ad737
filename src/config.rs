//! Connection settings and the alias → transport registry.
//!
//! Settings are read from TOML:
//!
//! ```toml
//! chunk_size = 10
//! log_level = "graphorm=info"
//!
//! [databases.default]
//! host = "localhost"
//! port = 7474
//! endpoint = "/db/data"
//!
//! [databases.scratch]
//! client = "memory"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GraphOrmError, Result};
use crate::transport::{GraphTransport, MemoryGraph};

/// Alias every store falls back to.
pub const DEFAULT_ALIAS: &str = "default";
/// Batch size for node fetches and type-label lookups.
pub const DEFAULT_CHUNK_SIZE: usize = 10;
const DEFAULT_ENDPOINT: &str = "/db/data";

/// Backend behind an alias.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// REST server.
    #[default]
    Http,
    /// In-process graph.
    Memory,
}

/// One `[databases.<alias>]` table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Server host.
    pub host: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// REST root path.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Client options such as `timeout_secs`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Backend kind.
    #[serde(default)]
    pub client: ClientKind,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_owned()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// Top-level settings file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Databases by alias; `default` is required.
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,
    /// Batch size for node fetches and type-label lookups.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// `EnvFilter` directive for [`crate::logging::init_logging`].
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            databases: BTreeMap::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            log_level: None,
        }
    }
}

impl Settings {
    /// Loads and validates settings from `explicit`, or from the default path.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(default_config_path)
            .ok_or_else(|| GraphOrmError::configuration("no configuration directory available"))?;
        let contents = fs::read_to_string(&path).map_err(|err| {
            GraphOrmError::configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        let settings = Self::from_toml(&contents)?;
        info!(path = %path.display(), databases = settings.databases.len(), "graphorm.config.loaded");
        Ok(settings)
    }

    /// Parses and validates settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(text)
            .map_err(|err| GraphOrmError::configuration(format!("invalid settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks that `default` exists and that every server entry names a host
    /// and a port.
    pub fn validate(&self) -> Result<()> {
        if !self.databases.contains_key(DEFAULT_ALIAS) {
            return Err(GraphOrmError::configuration(
                "a 'default' database must be configured",
            ));
        }
        if self.chunk_size == 0 {
            return Err(GraphOrmError::configuration("chunk_size must be positive"));
        }
        if let Some(level) = &self.log_level {
            crate::logging::filter_for(level)?;
        }
        for (alias, db) in &self.databases {
            if db.client == ClientKind::Http && (db.host.is_none() || db.port.is_none()) {
                return Err(GraphOrmError::configuration(format!(
                    "database '{alias}' needs both host and port"
                )));
            }
        }
        Ok(())
    }

    /// Installs the tracing subscriber using `log_level`.
    pub fn init_logging(&self) -> Result<()> {
        crate::logging::init_logging(self.log_level.as_deref().unwrap_or_default())
    }

    /// Serializes the settings back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| GraphOrmError::configuration(format!("cannot serialize settings: {err}")))
    }
}

/// `<config dir>/graphorm/databases.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("graphorm").join("databases.toml"))
}

/// Transports by alias.
#[derive(Clone, Debug, Default)]
pub struct Connections {
    transports: BTreeMap<String, Arc<dyn GraphTransport>>,
}

impl Connections {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transport under `alias`.
    pub fn with(mut self, alias: impl Into<String>, transport: Arc<dyn GraphTransport>) -> Self {
        self.transports.insert(alias.into(), transport);
        self
    }

    /// A single in-process graph as `default`.
    pub fn memory(graph: Arc<MemoryGraph>) -> Self {
        Self::new().with(DEFAULT_ALIAS, graph)
    }

    /// Builds one transport per configured alias.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let mut connections = Self::new();
        for (alias, db) in &settings.databases {
            let transport: Arc<dyn GraphTransport> = match db.client {
                ClientKind::Memory => Arc::new(MemoryGraph::new()),
                ClientKind::Http => http_transport(alias, db)?,
            };
            connections = connections.with(alias.clone(), transport);
        }
        Ok(connections)
    }

    /// Transport registered under `alias`.
    pub fn get(&self, alias: &str) -> Result<Arc<dyn GraphTransport>> {
        self.transports
            .get(alias)
            .cloned()
            .ok_or_else(|| GraphOrmError::configuration(format!("unknown database alias '{alias}'")))
    }

    /// Registered aliases.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.transports.keys().map(String::as_str)
    }
}

#[cfg(feature = "http")]
fn http_transport(alias: &str, db: &DatabaseConfig) -> Result<Arc<dyn GraphTransport>> {
    let (Some(host), Some(port)) = (db.host.as_deref(), db.port) else {
        return Err(GraphOrmError::configuration(format!(
            "database '{alias}' needs both host and port"
        )));
    };
    let transport = crate::transport::http::HttpTransport::new(host, port, &db.endpoint, &db.options)?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "http"))]
fn http_transport(alias: &str, _db: &DatabaseConfig) -> Result<Arc<dyn GraphTransport>> {
    Err(GraphOrmError::configuration(format!(
        "database '{alias}' uses the http client, which this build does not include"
    )))
}

static GLOBAL: OnceLock<Connections> = OnceLock::new();

/// Installs the process-wide registry; fails if one is already installed.
pub fn install(connections: Connections) -> Result<&'static Connections> {
    GLOBAL
        .set(connections)
        .map_err(|_| GraphOrmError::configuration("connections already installed"))?;
    global()
}

/// The process-wide registry.
pub fn global() -> Result<&'static Connections> {
    GLOBAL
        .get()
        .ok_or_else(|| GraphOrmError::configuration("connections have not been installed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_endpoint_and_chunk_size() {
        let settings = Settings::from_toml(
            r#"
            [databases.default]
            host = "localhost"
            port = 7474
            "#,
        )
        .unwrap();
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.databases["default"].endpoint, "/db/data");
        assert_eq!(settings.databases["default"].client, ClientKind::Http);
    }

    #[test]
    fn missing_default_is_rejected() {
        let err = Settings::from_toml(
            r#"
            [databases.other]
            client = "memory"
            "#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "Configuration");
    }

    #[test]
    fn server_entries_need_host_and_port() {
        let err = Settings::from_toml(
            r#"
            [databases.default]
            host = "localhost"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("host and port"));
    }

    #[test]
    fn malformed_log_level_is_rejected() {
        let err = Settings::from_toml(
            r#"
            log_level = "graphorm=loud"
            [databases.default]
            client = "memory"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid log level"));
    }

    #[test]
    fn memory_aliases_build_without_a_server() {
        let settings = Settings::from_toml(
            r#"
            chunk_size = 3
            [databases.default]
            client = "memory"
            "#,
        )
        .unwrap();
        let connections = Connections::from_settings(&settings).unwrap();
        assert!(connections.get("default").is_ok());
        assert_eq!(connections.get("elsewhere").unwrap_err().code(), "Configuration");
    }

    #[test]
    fn settings_survive_a_toml_round_trip() {
        let mut settings = Settings::default();
        settings.databases.insert(
            DEFAULT_ALIAS.to_owned(),
            DatabaseConfig {
                host: Some("graph.local".into()),
                port: Some(7474),
                endpoint: default_endpoint(),
                ..DatabaseConfig::default()
            },
        );
        let text = settings.to_toml().unwrap();
        assert_eq!(Settings::from_toml(&text).unwrap(), settings);
    }
}
