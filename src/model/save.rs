//! Save and delete pipelines.
//!
//! A save runs, in order: pre-save signal, auto stamps, cleaning of every
//! property to be written, uniqueness pre-checks, node creation (type edge and
//! type index entries included) or property updates, index maintenance,
//! relationship writes, post-save signal. A uniqueness conflict detected after
//! a fresh node was created removes that node again.

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::error::{GraphOrmError, Result};
use crate::model::definition::RelationshipDescriptor;
use crate::model::instance::Instance;
use crate::model::relationship::RelationshipState;
use crate::property::Property;
use crate::signals::Signal;
use crate::transport::{
    Direction, EdgeRecord, GraphTransport, NodeId, NodeRecord, PropertyMap, ScriptCall,
};
use crate::typegraph::{MARKER_ATTR, ORDER_ATTR, TYPE_INDEX_KEY};
use crate::value::Value;

/// One property about to be written.
struct Pending {
    property: Property,
    value: Value,
    stored: JsonValue,
}

pub(crate) fn save(instance: &Instance) -> Result<()> {
    let store = instance.store().clone();
    store.signals().emit(&Signal::PreSave(instance))?;
    let transport = store.transport(&instance.alias())?;
    let model = instance.model().clone();
    let created = !instance.is_saved();

    for prop in model.properties() {
        let current = instance.get(prop.name())?;
        if let Some(stamp) = prop.pre_save(&current, created) {
            instance.set(prop.name(), stamp)?;
        }
    }

    if created {
        allocate_auto_ids(instance, transport.as_ref())?;
    }

    let (values, dirty) = {
        let state = instance.state();
        (state.values.clone(), state.dirty.clone())
    };
    let mut pending = Vec::new();
    for prop in model.properties() {
        if !created && !dirty.contains(prop.name()) {
            continue;
        }
        let raw = values.get(prop.name()).cloned().unwrap_or(Value::Null);
        let value = prop.coerce(&raw)?;
        let stored = prop.clean(&raw)?;
        pending.push(Pending {
            property: prop.clone(),
            value,
            stored,
        });
    }

    let own_id = instance.id();
    for item in pending.iter().filter(|p| p.property.is_unique()) {
        for key in item.property.index_keys(&item.value)? {
            let holders = transport.index_lookup(&model.index_name(), item.property.name(), &key)?;
            if holders.iter().any(|holder| Some(holder.id) != own_id) {
                return Err(GraphOrmError::uniqueness(model.name(), item.property.name(), key));
            }
        }
    }

    let node = if created {
        create_node(instance, transport.as_ref(), &pending)?
    } else {
        update_node(instance, transport.as_ref(), &pending)?
    };
    {
        let mut state = instance.state();
        for item in &pending {
            state.values.insert(item.property.name().to_owned(), item.value.clone());
        }
        state.node = Some(node);
        state.dirty.clear();
    }

    save_relationships(instance, transport.as_ref())?;
    store
        .signals()
        .emit(&Signal::PostSave { instance, created })?;
    Ok(())
}

fn allocate_auto_ids(instance: &Instance, transport: &dyn GraphTransport) -> Result<()> {
    let model = instance.model();
    for prop in model.properties().iter().filter(|p| p.is_auto()) {
        if !instance.get(prop.name())?.is_null() {
            continue;
        }
        let result = transport.run_script(&ScriptCall::NextAutoIds {
            types: model.chain().to_vec(),
            key: prop.name().to_owned(),
            count: 1,
        })?;
        let next = result
            .as_array()
            .and_then(|ids| ids.first())
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| GraphOrmError::transport(format!("unexpected auto id payload {result}")))?;
        instance.set(prop.name(), next)?;
    }
    Ok(())
}

fn create_node(instance: &Instance, transport: &dyn GraphTransport, pending: &[Pending]) -> Result<NodeRecord> {
    let model = instance.model();
    let index_name = model.index_name();
    let properties: PropertyMap = pending
        .iter()
        .filter(|item| !item.stored.is_null())
        .map(|item| (item.property.name().to_owned(), item.stored.clone()))
        .collect();
    let result = transport.run_script(&ScriptCall::CreateNodeWithTypes {
        types: model.chain().to_vec(),
        index_name: index_name.clone(),
        properties,
    })?;
    let node = NodeRecord::from_json(&result)?;
    info!(model = %model.type_name(), node = %node.id, "graphorm.save.created");

    for item in pending.iter().filter(|p| p.property.is_indexed()) {
        if let Err(err) = add_index_entries(transport, &index_name, model.name(), item, node.id) {
            warn!(node = %node.id, error = %err, "graphorm.save.rollback");
            discard_node(instance, transport, node.id)?;
            return Err(err);
        }
    }
    Ok(node)
}

fn add_index_entries(
    transport: &dyn GraphTransport,
    index_name: &str,
    model_name: &str,
    item: &Pending,
    node: NodeId,
) -> Result<()> {
    let key = item.property.name();
    for value in item.property.index_keys(&item.value)? {
        if item.property.is_unique() {
            if let Some(holder) = transport.index_add_unique(index_name, key, &value, node)? {
                debug!(holder = %holder, key, "graphorm.save.unique_conflict");
                return Err(GraphOrmError::uniqueness(model_name, key, value));
            }
        } else {
            transport.index_add(index_name, key, &value, node)?;
        }
    }
    Ok(())
}

/// Removes a node created by a save that could not finish.
fn discard_node(instance: &Instance, transport: &dyn GraphTransport, node: NodeId) -> Result<()> {
    for edge in transport.node_edges(node, Direction::Both, &[])? {
        transport.delete_edge(edge.id)?;
    }
    remove_index_entries(instance, transport, node)?;
    transport.delete_node(node)
}

fn remove_index_entries(instance: &Instance, transport: &dyn GraphTransport, node: NodeId) -> Result<()> {
    let model = instance.model();
    let index_name = model.index_name();
    transport.index_remove(&index_name, TYPE_INDEX_KEY, None, node)?;
    for prop in model.properties().iter().filter(|p| p.is_indexed()) {
        transport.index_remove(&index_name, prop.name(), None, node)?;
    }
    Ok(())
}

fn update_node(instance: &Instance, transport: &dyn GraphTransport, pending: &[Pending]) -> Result<NodeRecord> {
    let model = instance.model();
    let index_name = model.index_name();
    let mut node = instance.node().ok_or_else(|| GraphOrmError::validation("instance has no node"))?;
    for item in pending {
        let key = item.property.name();
        let old = node.properties.get(key).cloned().unwrap_or(JsonValue::Null);
        if old == item.stored {
            continue;
        }
        if item.property.is_indexed() {
            let old_keys = item.property.index_keys(&item.property.from_stored(&old)?)?;
            let new_keys = item.property.index_keys(&item.value)?;
            for stale in old_keys.iter().filter(|k| !new_keys.contains(k)) {
                transport.index_remove(&index_name, key, Some(stale), node.id)?;
            }
            let added: Vec<String> = new_keys.into_iter().filter(|k| !old_keys.contains(k)).collect();
            for value in &added {
                let conflict = if item.property.is_unique() {
                    transport.index_add_unique(&index_name, key, value, node.id)?
                } else {
                    transport.index_add(&index_name, key, value, node.id)?;
                    None
                };
                if conflict.is_some() {
                    for value in &added {
                        transport.index_remove(&index_name, key, Some(value), node.id)?;
                    }
                    for restored in &old_keys {
                        transport.index_add(&index_name, key, restored, node.id)?;
                    }
                    return Err(GraphOrmError::uniqueness(model.name(), key, value.clone()));
                }
            }
        }
        if item.stored.is_null() {
            transport.remove_node_property(node.id, key)?;
            node.properties.remove(key);
        } else {
            transport.set_node_property(node.id, key, &item.stored)?;
            node.properties.insert(key.to_owned(), item.stored.clone());
        }
        debug!(node = %node.id, key, "graphorm.save.property_written");
    }
    Ok(node)
}

fn save_relationships(instance: &Instance, transport: &dyn GraphTransport) -> Result<()> {
    let owner = instance.pk()?;
    for relation in instance.relations() {
        let (removes, adds, descriptor, mut next_order) = {
            let mut state = relation.lock();
            if !state.is_dirty() {
                continue;
            }
            let next_order = state.max_order();
            let (removes, adds) = state.take_pending();
            (removes, adds, state.descriptor().clone(), next_order)
        };
        for (edge, _) in &removes {
            transport.delete_edge(edge.id)?;
        }
        let mut added = 0;
        let mut remaining = adds.into_iter();
        while let Some(target) = remaining.next() {
            if let Err(err) = write_edge(instance, transport, &relation, &descriptor, &mut next_order, &target) {
                let mut unsaved = vec![target];
                unsaved.extend(remaining);
                relation.lock().restore_pending(unsaved);
                return Err(err);
            }
            added += 1;
        }
        info!(
            owner = %owner,
            attname = %descriptor.attname,
            added,
            removed = removes.len(),
            "graphorm.save.relationships"
        );
    }
    Ok(())
}

fn write_edge(
    instance: &Instance,
    transport: &dyn GraphTransport,
    relation: &Mutex<RelationshipState>,
    descriptor: &RelationshipDescriptor,
    next_order: &mut i64,
    target: &Instance,
) -> Result<()> {
    if !target.is_saved() {
        target.save()?;
    }
    let owner = instance.pk()?;
    let target_id = target.pk()?;
    let mut properties = PropertyMap::new();
    properties.insert(MARKER_ATTR.to_owned(), json!(true));
    if descriptor.ordered {
        *next_order += 1;
        properties.insert(ORDER_ATTR.to_owned(), json!(*next_order));
    }
    let (start, end) = match descriptor.direction {
        Direction::In => (target_id, owner),
        _ => (owner, target_id),
    };
    let edge = transport.create_edge(start, end, &descriptor.rel_type, &properties)?;
    relation.lock().attach(edge.clone(), target.clone());
    mirror_reverse(instance, target, &edge, descriptor.direction);
    Ok(())
}

/// Records a new edge on the target's loaded reverse attribute, if any.
fn mirror_reverse(owner: &Instance, target: &Instance, edge: &EdgeRecord, direction: Direction) {
    if owner.same_handle(target) {
        return;
    }
    let candidates = target.model().relationships_for(&edge.rel_type, direction.reverse());
    let [descriptor] = candidates.as_slice() else {
        return;
    };
    let existing = target.state().relations.get(&descriptor.attname).cloned();
    if let Some(reverse) = existing {
        let mut state = reverse.lock();
        if state.is_loaded() {
            state.attach(edge.clone(), owner.clone());
        }
    }
}

pub(crate) fn delete(instance: &Instance) -> Result<()> {
    let store = instance.store().clone();
    let id = instance.pk()?;
    store.signals().emit(&Signal::PreDelete(instance))?;
    let transport = store.transport(&instance.alias())?;
    let model = instance.model().clone();

    let edges = transport.node_edges(id, Direction::Both, &[])?;
    for edge in &edges {
        transport.delete_edge(edge.id)?;
    }
    remove_index_entries(instance, transport.as_ref(), id)?;
    transport.delete_node(id)?;
    info!(model = %model.type_name(), node = %id, edges = edges.len(), "graphorm.delete.node");

    store.signals().node_deleted(id);
    {
        let mut state = instance.state();
        state.node = None;
        let names: Vec<String> = state
            .values
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, _)| name.clone())
            .collect();
        state.dirty.extend(names);
        state.relations.clear();
    }
    store.signals().emit(&Signal::PostDelete { instance, id })?;
    Ok(())
}
