//! Per-instance relationship state.

use serde_json::Value as JsonValue;

use crate::model::definition::RelationshipDescriptor;
use crate::model::instance::Instance;
use crate::transport::{EdgeRecord, NodeId};
use crate::typegraph::ORDER_ATTR;

/// Loaded targets and unsaved changes of one relationship attribute.
///
/// `pending_add` and `pending_remove` never name the same target: adding a
/// target whose removal is pending cancels the removal, and removing a target
/// whose addition is pending cancels the addition.
#[derive(Debug)]
pub struct RelationshipState {
    descriptor: RelationshipDescriptor,
    cache: Vec<(EdgeRecord, Instance)>,
    loaded: bool,
    pending_add: Vec<Instance>,
    pending_remove: Vec<(EdgeRecord, Instance)>,
}

impl RelationshipState {
    pub(crate) fn new(descriptor: RelationshipDescriptor) -> Self {
        Self {
            descriptor,
            cache: Vec::new(),
            loaded: false,
            pending_add: Vec::new(),
            pending_remove: Vec::new(),
        }
    }

    /// Attribute this state belongs to.
    pub fn descriptor(&self) -> &RelationshipDescriptor {
        &self.descriptor
    }

    /// Whether persisted edges have been fetched.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    /// Whether a save has edges to write or delete.
    pub fn is_dirty(&self) -> bool {
        !self.pending_add.is_empty() || !self.pending_remove.is_empty()
    }

    /// Current targets: persisted ones (by order attribute when ordered), then
    /// unsaved additions in insertion order.
    pub fn targets(&self) -> Vec<Instance> {
        let mut cached: Vec<&(EdgeRecord, Instance)> = self.cache.iter().collect();
        if self.descriptor.ordered {
            cached.sort_by_key(|(edge, _)| edge_order(edge));
        }
        cached
            .into_iter()
            .map(|(_, target)| target.clone())
            .chain(self.pending_add.iter().cloned())
            .collect()
    }

    /// Persisted edges currently cached.
    pub fn edges(&self) -> impl Iterator<Item = &EdgeRecord> {
        self.cache.iter().map(|(edge, _)| edge)
    }

    /// Records a persisted edge. Attaching the same edge twice is a no-op.
    pub(crate) fn attach(&mut self, edge: EdgeRecord, target: Instance) {
        if self.cache.iter().any(|(known, _)| known.id == edge.id)
            || self.pending_remove.iter().any(|(known, _)| known.id == edge.id)
        {
            return;
        }
        self.cache.push((edge, target));
    }

    /// Queues `target`; returns `false` when it is already related.
    pub(crate) fn add(&mut self, target: &Instance) -> bool {
        if let Some(pos) = self.pending_remove.iter().position(|(_, t)| t == target) {
            let restored = self.pending_remove.remove(pos);
            self.cache.push(restored);
            return true;
        }
        if self.cache.iter().any(|(_, t)| t == target) || self.pending_add.contains(target) {
            return false;
        }
        self.pending_add.push(target.clone());
        true
    }

    /// Queues removal of `target`; returns `false` when it was not related.
    pub(crate) fn remove(&mut self, target: &Instance) -> bool {
        if let Some(pos) = self.pending_add.iter().position(|t| t == target) {
            self.pending_add.remove(pos);
            return true;
        }
        let mut removed = false;
        let mut idx = 0;
        while idx < self.cache.len() {
            if &self.cache[idx].1 == target {
                let entry = self.cache.remove(idx);
                self.pending_remove.push(entry);
                removed = true;
            } else {
                idx += 1;
            }
        }
        removed
    }

    /// Queues removal of every target.
    pub(crate) fn clear(&mut self) {
        self.pending_add.clear();
        self.pending_remove.append(&mut self.cache);
    }

    /// Takes the queued changes for a save.
    pub(crate) fn take_pending(&mut self) -> (Vec<(EdgeRecord, Instance)>, Vec<Instance>) {
        (
            std::mem::take(&mut self.pending_remove),
            std::mem::take(&mut self.pending_add),
        )
    }

    /// Puts back additions a failed save could not write.
    pub(crate) fn restore_pending(&mut self, adds: Vec<Instance>) {
        for target in adds {
            if !self.pending_add.contains(&target) {
                self.pending_add.push(target);
            }
        }
    }

    /// Largest order attribute among cached edges.
    pub(crate) fn max_order(&self) -> i64 {
        self.cache.iter().map(|(edge, _)| edge_order(edge)).max().unwrap_or(0)
    }

    /// Forgets a deleted node.
    pub(crate) fn drop_node(&mut self, id: NodeId) {
        let gone = |target: &Instance| target.id() == Some(id);
        self.cache.retain(|(edge, target)| !gone(target) && edge.start != id && edge.end != id);
        self.pending_add.retain(|target| !gone(target));
        self.pending_remove.retain(|(_, target)| !gone(target));
    }
}

/// Order attribute of an edge; unordered edges sort first.
fn edge_order(edge: &EdgeRecord) -> i64 {
    edge.properties
        .get(ORDER_ATTR)
        .and_then(JsonValue::as_i64)
        .unwrap_or(0)
}
