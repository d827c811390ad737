//! Lifecycle hooks.
//!
//! Handlers run synchronously around saves and deletes; an error returned by a
//! `PreSave` or `PreDelete` handler aborts the operation. The registry also
//! tracks live relationship states so a deleted node disappears from every
//! cache that still holds it.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::Result;
use crate::model::{Instance, RelationshipState};
use crate::transport::NodeId;

/// Lifecycle event.
#[derive(Debug)]
pub enum Signal<'a> {
    /// Before properties are cleaned and written.
    PreSave(&'a Instance),
    /// After properties and relationships were written.
    PostSave {
        /// Saved instance.
        instance: &'a Instance,
        /// Whether the save created the node.
        created: bool,
    },
    /// Before the node and its edges are removed.
    PreDelete(&'a Instance),
    /// After the node was removed.
    PostDelete {
        /// Deleted instance, now unsaved.
        instance: &'a Instance,
        /// Id the node had.
        id: NodeId,
    },
}

impl Signal<'_> {
    /// Instance the event is about.
    pub fn instance(&self) -> &Instance {
        match self {
            Signal::PreSave(instance) | Signal::PreDelete(instance) => instance,
            Signal::PostSave { instance, .. } | Signal::PostDelete { instance, .. } => instance,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Signal::PreSave(_) => "pre_save",
            Signal::PostSave { .. } => "post_save",
            Signal::PreDelete(_) => "pre_delete",
            Signal::PostDelete { .. } => "post_delete",
        }
    }
}

type Handler = Arc<dyn Fn(&Signal<'_>) -> Result<()> + Send + Sync>;

/// Handler registry shared by a store.
#[derive(Default)]
pub struct Signals {
    handlers: RwLock<Vec<(Option<String>, Handler)>>,
    relations: Mutex<Vec<Weak<Mutex<RelationshipState>>>>,
}

impl Signals {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for every model.
    pub fn connect<F>(&self, handler: F)
    where
        F: Fn(&Signal<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.write().push((None, Arc::new(handler)));
    }

    /// Registers a handler for instances of one model (`"app.Model"`, exact
    /// type).
    pub fn connect_for<F>(&self, type_name: &str, handler: F)
    where
        F: Fn(&Signal<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .push((Some(type_name.to_owned()), Arc::new(handler)));
    }

    /// Runs matching handlers in registration order.
    pub fn emit(&self, signal: &Signal<'_>) -> Result<()> {
        let type_name = signal.instance().model().type_name();
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .iter()
            .filter(|(filter, _)| filter.as_deref().map_or(true, |f| f == type_name))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        trace!(signal = signal.name(), model = %type_name, handlers = handlers.len(), "graphorm.signals.emit");
        for handler in handlers {
            handler(signal)?;
        }
        Ok(())
    }

    pub(crate) fn track(&self, relation: &Arc<Mutex<RelationshipState>>) {
        let mut relations = self.relations.lock();
        relations.retain(|weak| weak.strong_count() > 0);
        relations.push(Arc::downgrade(relation));
    }

    /// Drops a deleted node from every live relationship cache and pending
    /// addition.
    pub(crate) fn node_deleted(&self, id: NodeId) {
        let live: Vec<Arc<Mutex<RelationshipState>>> = {
            let mut relations = self.relations.lock();
            relations.retain(|weak| weak.strong_count() > 0);
            relations.iter().filter_map(Weak::upgrade).collect()
        };
        for relation in live {
            relation.lock().drop_node(id);
        }
    }
}

impl std::fmt::Debug for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signals")
            .field("handlers", &self.handlers.read().len())
            .field("relations", &self.relations.lock().len())
            .finish()
    }
}
