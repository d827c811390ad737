//! Model instances.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{GraphOrmError, Result};
use crate::model::definition::Model;
use crate::model::manager::{self, RelatedManager};
use crate::model::relationship::RelationshipState;
use crate::model::save;
use crate::store::Store;
use crate::transport::{NodeId, NodeRecord};
use crate::value::Value;

/// Handle to one model instance.
///
/// Clones share the same instance: values, persistence state, and
/// relationship caches. Two saved instances are equal when they hold the same
/// node id; unsaved instances are equal only to their own clones.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    store: Store,
    model: Arc<Model>,
    state: Mutex<InstanceState>,
}

pub(crate) struct InstanceState {
    pub(crate) alias: String,
    pub(crate) node: Option<NodeRecord>,
    pub(crate) values: BTreeMap<String, Value>,
    pub(crate) dirty: BTreeSet<String>,
    pub(crate) relations: BTreeMap<String, Arc<Mutex<RelationshipState>>>,
}

impl Instance {
    pub(crate) fn new(store: Store, model: Arc<Model>, alias: &str) -> Self {
        let mut values = BTreeMap::new();
        let mut dirty = BTreeSet::new();
        for prop in model.properties() {
            let default = prop.default_value();
            if !default.is_null() {
                dirty.insert(prop.name().to_owned());
            }
            values.insert(prop.name().to_owned(), default);
        }
        Self::with_state(
            store,
            model,
            InstanceState {
                alias: alias.to_owned(),
                node: None,
                values,
                dirty,
                relations: BTreeMap::new(),
            },
        )
    }

    pub(crate) fn from_record(store: Store, model: Arc<Model>, alias: &str, record: NodeRecord) -> Result<Self> {
        let mut values = BTreeMap::new();
        for prop in model.properties() {
            let value = match record.properties.get(prop.name()) {
                Some(stored) => prop.from_stored(stored)?,
                None => Value::Null,
            };
            values.insert(prop.name().to_owned(), value);
        }
        Ok(Self::with_state(
            store,
            model,
            InstanceState {
                alias: alias.to_owned(),
                node: Some(record),
                values,
                dirty: BTreeSet::new(),
                relations: BTreeMap::new(),
            },
        ))
    }

    fn with_state(store: Store, model: Arc<Model>, state: InstanceState) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                store,
                model,
                state: Mutex::new(state),
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, InstanceState> {
        self.inner.state.lock()
    }

    /// Store the instance belongs to.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Model of the instance.
    pub fn model(&self) -> &Arc<Model> {
        &self.inner.model
    }

    /// Node id once saved.
    pub fn id(&self) -> Option<NodeId> {
        self.state().node.as_ref().map(|node| node.id)
    }

    /// Node id, failing for unsaved instances.
    pub fn pk(&self) -> Result<NodeId> {
        self.id().ok_or_else(|| {
            GraphOrmError::validation(format!("unsaved {} has no id", self.model().name()))
        })
    }

    /// Whether the instance has a node.
    pub fn is_saved(&self) -> bool {
        self.state().node.is_some()
    }

    /// Persisted node as last read or written.
    pub fn node(&self) -> Option<NodeRecord> {
        self.state().node.clone()
    }

    /// Database alias used for saves and lazy loads.
    pub fn alias(&self) -> String {
        self.state().alias.clone()
    }

    /// Routes later saves and loads to another database alias.
    pub fn using(&self, alias: &str) {
        self.state().alias = alias.to_owned();
    }

    /// Value of a property (or `id`).
    pub fn get(&self, name: &str) -> Result<Value> {
        if name == "id" || name == "pk" {
            return Ok(self.id().map(Value::from).unwrap_or(Value::Null));
        }
        self.state()
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| self.no_field(name))
    }

    /// Sets a property; checked and converted on save.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        if name == "id" || name == "pk" {
            return Err(GraphOrmError::validation("node ids are assigned by the server"));
        }
        if self.model().property(name).is_none() {
            return Err(self.no_field(name));
        }
        let mut state = self.state();
        state.values.insert(name.to_owned(), value.into());
        state.dirty.insert(name.to_owned());
        Ok(())
    }

    /// Sets several properties.
    pub fn set_many<'a, I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        for (name, value) in values {
            self.set(name, value)?;
        }
        Ok(())
    }

    /// Snapshot of every property value.
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.state().values.clone()
    }

    /// Names of properties changed since the last save.
    pub fn dirty_fields(&self) -> BTreeSet<String> {
        self.state().dirty.clone()
    }

    fn no_field(&self, name: &str) -> GraphOrmError {
        GraphOrmError::field(format!("{} has no field named '{name}'", self.model().type_name()))
    }

    /// Relationship state for `attname`, created on first use.
    pub(crate) fn relation(&self, attname: &str) -> Result<Arc<Mutex<RelationshipState>>> {
        let descriptor = self
            .model()
            .relationship(attname)
            .cloned()
            .ok_or_else(|| self.no_field(attname))?;
        let mut state = self.state();
        if let Some(existing) = state.relations.get(attname) {
            return Ok(Arc::clone(existing));
        }
        let relation = Arc::new(Mutex::new(RelationshipState::new(descriptor)));
        state.relations.insert(attname.to_owned(), Arc::clone(&relation));
        drop(state);
        self.store().signals().track(&relation);
        Ok(relation)
    }

    /// Relationship states created so far.
    pub(crate) fn relations(&self) -> Vec<Arc<Mutex<RelationshipState>>> {
        self.state().relations.values().cloned().collect()
    }

    /// Manager of a many-valued relationship.
    pub fn related(&self, attname: &str) -> Result<RelatedManager> {
        let relation = self.relation(attname)?;
        if !relation.lock().descriptor().multi {
            return Err(GraphOrmError::validation(format!(
                "'{attname}' holds a single target; use single()"
            )));
        }
        Ok(RelatedManager::new(self.clone(), relation))
    }

    /// Target of a single-valued relationship, loading it on first access.
    ///
    /// Fails when the graph holds more than one qualifying edge.
    pub fn single(&self, attname: &str) -> Result<Option<Instance>> {
        let relation = self.single_relation(attname)?;
        manager::ensure_loaded(self, &relation)?;
        let targets = relation.lock().targets();
        match targets.len() {
            0 => Ok(None),
            1 => Ok(targets.into_iter().next()),
            n => Err(GraphOrmError::validation(format!(
                "{}.{attname} is single-valued but {n} edges were found",
                self.model().type_name()
            ))),
        }
    }

    /// Replaces the target of a single-valued relationship; written on save.
    pub fn set_single(&self, attname: &str, target: Option<&Instance>) -> Result<()> {
        let relation = self.single_relation(attname)?;
        manager::ensure_loaded(self, &relation)?;
        if let Some(target) = target {
            manager::check_target(&relation, target)?;
        }
        let mut state = relation.lock();
        state.clear();
        if let Some(target) = target {
            state.add(target);
        }
        Ok(())
    }

    fn single_relation(&self, attname: &str) -> Result<Arc<Mutex<RelationshipState>>> {
        let relation = self.relation(attname)?;
        if relation.lock().descriptor().multi {
            return Err(GraphOrmError::validation(format!(
                "'{attname}' holds many targets; use related()"
            )));
        }
        Ok(relation)
    }

    /// Persists property changes and queued relationship changes.
    pub fn save(&self) -> Result<()> {
        save::save(self)
    }

    /// Deletes the node and its edges; the instance becomes unsaved.
    pub fn delete(&self) -> Result<()> {
        save::delete(self)
    }

    pub(crate) fn same_handle(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        if self.same_handle(other) {
            return true;
        }
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("model", &self.model().type_name())
            .field("id", &self.id())
            .finish()
    }
}
