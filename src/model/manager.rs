//! Related-object managers and lazy relationship loading.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{GraphOrmError, Result};
use crate::model::instance::Instance;
use crate::model::relationship::RelationshipState;
use crate::query::QuerySet;
use crate::typegraph::MARKER_ATTR;
use crate::value::Value;

/// Fetches the persisted edges of a relationship unless already loaded.
///
/// Only edges carrying the marker attribute are considered, and only targets
/// whose type belongs to the declared target model.
pub(crate) fn ensure_loaded(owner: &Instance, relation: &Arc<Mutex<RelationshipState>>) -> Result<()> {
    let descriptor = {
        let state = relation.lock();
        if state.is_loaded() {
            return Ok(());
        }
        state.descriptor().clone()
    };
    let Some(id) = owner.id() else {
        relation.lock().mark_loaded();
        return Ok(());
    };
    let store = owner.store();
    let alias = owner.alias();
    let transport = store.transport(&alias)?;
    let edges: Vec<_> = transport
        .node_edges(id, descriptor.direction, &[descriptor.rel_type.as_str()])?
        .into_iter()
        .filter(|edge| edge.properties.get(MARKER_ATTR) == Some(&JsonValue::Bool(true)))
        .collect();
    let target_model = store.model(&descriptor.target)?;
    let ids: Vec<_> = edges.iter().map(|edge| edge.other(id)).collect();
    let targets = store.instances_by_id(&alias, &ids, Some(&target_model))?;
    debug!(
        owner = %id,
        attname = %descriptor.attname,
        edges = edges.len(),
        "graphorm.relationship.loaded"
    );
    let mut state = relation.lock();
    if state.is_loaded() {
        return Ok(());
    }
    for edge in edges {
        if let Some(target) = targets.get(&edge.other(id)) {
            state.attach(edge, target.clone());
        }
    }
    state.mark_loaded();
    Ok(())
}

/// Rejects targets outside the relationship's target model.
pub(crate) fn check_target(relation: &Arc<Mutex<RelationshipState>>, target: &Instance) -> Result<()> {
    let state = relation.lock();
    let descriptor = state.descriptor();
    let target_model = target.store().model(&descriptor.target)?;
    if target_model.includes(&target.model().type_name()) {
        Ok(())
    } else {
        Err(GraphOrmError::validation(format!(
            "{}.{} expects {} instances, got {}",
            descriptor.owner,
            descriptor.attname,
            descriptor.target,
            target.model().type_name()
        )))
    }
}

/// Manager of a many-valued relationship attribute.
///
/// Changes are queued on the owner and written by its next save.
#[derive(Clone)]
pub struct RelatedManager {
    owner: Instance,
    relation: Arc<Mutex<RelationshipState>>,
}

impl RelatedManager {
    pub(crate) fn new(owner: Instance, relation: Arc<Mutex<RelationshipState>>) -> Self {
        Self { owner, relation }
    }

    fn load(&self) -> Result<()> {
        ensure_loaded(&self.owner, &self.relation)
    }

    /// Current targets, including unsaved additions.
    pub fn all(&self) -> Result<Vec<Instance>> {
        self.load()?;
        Ok(self.relation.lock().targets())
    }

    /// Number of current targets.
    pub fn count(&self) -> Result<usize> {
        Ok(self.all()?.len())
    }

    /// Targets in `range` of the iteration order.
    pub fn slice(&self, range: Range<usize>) -> Result<Vec<Instance>> {
        Ok(self
            .all()?
            .into_iter()
            .skip(range.start)
            .take(range.end.saturating_sub(range.start))
            .collect())
    }

    /// Queues `targets`; already related targets are ignored.
    pub fn add(&self, targets: &[&Instance]) -> Result<()> {
        self.load()?;
        for target in targets {
            check_target(&self.relation, target)?;
            self.relation.lock().add(target);
        }
        Ok(())
    }

    /// Queues removal of `targets`.
    pub fn remove(&self, targets: &[&Instance]) -> Result<()> {
        self.load()?;
        let mut state = self.relation.lock();
        for target in targets {
            state.remove(target);
        }
        Ok(())
    }

    /// Queues removal of every target.
    pub fn clear(&self) -> Result<()> {
        self.load()?;
        self.relation.lock().clear();
        Ok(())
    }

    /// Creates and saves a target, then relates it. A saved owner is saved
    /// again so the edge is written immediately.
    pub fn create<'a, I>(&self, values: I) -> Result<Instance>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let target_name = self.relation.lock().descriptor().target.clone();
        let target = self.owner.store().instance(&target_name)?;
        target.using(&self.owner.alias());
        target.set_many(values)?;
        target.save()?;
        self.add(&[&target])?;
        if self.owner.is_saved() {
            self.owner.save()?;
        }
        Ok(target)
    }

    /// Query over the persisted targets.
    pub fn query(&self) -> Result<QuerySet> {
        let owner = self.owner.pk()?;
        let descriptor = self.relation.lock().descriptor().clone();
        Ok(self
            .owner
            .store()
            .objects(&descriptor.target)
            .using(&self.owner.alias())
            .related_to(owner, descriptor.rel_type, descriptor.direction))
    }

    /// Persisted targets matching `lookup`.
    pub fn filter(&self, lookup: &str, value: impl Into<Value>) -> Result<QuerySet> {
        Ok(self.query()?.filter(lookup, value))
    }
}
