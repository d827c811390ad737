//! Entry point tying models, connections, and signals together.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::config::{Connections, Settings, DEFAULT_ALIAS, DEFAULT_CHUNK_SIZE};
use crate::error::{GraphOrmError, Result};
use crate::model::{Instance, Model, Registry};
use crate::query::QuerySet;
use crate::signals::Signals;
use crate::transport::{GraphTransport, NodeId, NodeRecord};
use crate::typegraph::type_labels;
use crate::value::Value;

/// Cheaply clonable handle to a registry and its connections.
///
/// ```
/// use std::sync::Arc;
/// use graphorm::config::Connections;
/// use graphorm::model::{ModelBuilder, RegistryBuilder};
/// use graphorm::property::Property;
/// use graphorm::transport::MemoryGraph;
/// use graphorm::{Store, Value};
///
/// let registry = RegistryBuilder::new()
///     .register(ModelBuilder::new("tests", "Person").property("name", Property::string().indexed()))
///     .build()
///     .unwrap();
/// let store = Store::new(registry, Connections::memory(Arc::new(MemoryGraph::new())));
/// let pete = store.create("tests.Person", [("name", Value::from("Pete"))]).unwrap();
/// let found = store.objects("tests.Person").get_by("name", "Pete").unwrap();
/// assert_eq!(found, pete);
/// ```
#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    registry: Registry,
    connections: Connections,
    signals: Signals,
    chunk_size: usize,
}

impl Store {
    /// Store over `connections` with the default chunk size.
    pub fn new(registry: Registry, connections: Connections) -> Self {
        Self::with_chunk_size(registry, connections, DEFAULT_CHUNK_SIZE)
    }

    /// Store with an explicit batch size.
    pub fn with_chunk_size(registry: Registry, connections: Connections, chunk_size: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                registry,
                connections,
                signals: Signals::new(),
                chunk_size: chunk_size.max(1),
            }),
        }
    }

    /// Store built from settings; one transport per alias.
    pub fn from_settings(registry: Registry, settings: &Settings) -> Result<Self> {
        let connections = Connections::from_settings(settings)?;
        Ok(Self::with_chunk_size(registry, connections, settings.chunk_size))
    }

    /// Registered models.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Lifecycle hooks.
    pub fn signals(&self) -> &Signals {
        &self.inner.signals
    }

    /// Batch size for node fetches and type-label lookups.
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Transport for a database alias.
    pub fn transport(&self, alias: &str) -> Result<Arc<dyn GraphTransport>> {
        self.inner.connections.get(alias)
    }

    /// Model by `"app.Model"` name.
    pub fn model(&self, type_name: &str) -> Result<Arc<Model>> {
        self.inner.registry.get(type_name)
    }

    /// Fresh unsaved instance with defaults applied.
    pub fn instance(&self, type_name: &str) -> Result<Instance> {
        Ok(Instance::new(self.clone(), self.model(type_name)?, DEFAULT_ALIAS))
    }

    /// Creates and saves an instance.
    pub fn create<'a, I>(&self, type_name: &str, values: I) -> Result<Instance>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        self.objects(type_name).create(values)
    }

    /// Query over every instance of a model and its subtypes.
    pub fn objects(&self, type_name: &str) -> QuerySet {
        QuerySet::new(self.clone(), self.model(type_name))
    }

    /// Instances for fetched nodes, in input order.
    ///
    /// Nodes whose type is not registered, or falls outside `within`, are
    /// skipped.
    pub(crate) fn materialize(
        &self,
        alias: &str,
        records: Vec<NodeRecord>,
        within: Option<&Model>,
    ) -> Result<Vec<Instance>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let transport = self.transport(alias)?;
        let ids: Vec<NodeId> = records.iter().map(|r| r.id).collect();
        let labels = type_labels(transport.as_ref(), &ids, self.chunk_size())?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let Some(label) = labels.get(&record.id) else {
                continue;
            };
            let Some(model) = self.registry().by_spec(label) else {
                warn!(node = %record.id, label = %label.type_name(), "graphorm.store.unregistered_type");
                continue;
            };
            if within.is_some_and(|scope| !scope.includes(&model.type_name())) {
                continue;
            }
            out.push(Instance::from_record(self.clone(), model, alias, record)?);
        }
        Ok(out)
    }

    /// Fetches and materializes nodes by id in chunks, keyed by id.
    pub(crate) fn instances_by_id(
        &self,
        alias: &str,
        ids: &[NodeId],
        within: Option<&Model>,
    ) -> Result<BTreeMap<NodeId, Instance>> {
        let transport = self.transport(alias)?;
        let mut unique: Vec<NodeId> = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();
        let mut out = BTreeMap::new();
        for chunk in unique.chunks(self.chunk_size()) {
            let records = transport.get_nodes(chunk)?;
            for instance in self.materialize(alias, records, within)? {
                let id = instance
                    .id()
                    .ok_or_else(|| GraphOrmError::transport("materialized node without id"))?;
                out.insert(id, instance);
            }
        }
        Ok(out)
    }
}
