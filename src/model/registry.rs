//! Two-phase model registration.
//!
//! Declarations are collected first and resolved in one pass at
//! [`RegistryBuilder::build`], so relationship targets may name models that are
//! registered later, including the declaring model itself.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{GraphOrmError, Result};
use crate::model::definition::{Model, ModelBuilder, RelationshipDescriptor};
use crate::property::{Property, RESERVED_PREFIX};
use crate::transport::TypeSpec;
use crate::typegraph::is_reserved_rel;

const RESERVED_ATTRS: &[&str] = &["id", "pk"];

/// Collects model declarations.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    models: Vec<ModelBuilder>,
}

impl RegistryBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a declaration.
    pub fn register(mut self, model: ModelBuilder) -> Self {
        self.models.push(model);
        self
    }

    /// Resolves inheritance, relationship targets and reverse attributes.
    pub fn build(self) -> Result<Registry> {
        let mut by_name: BTreeMap<String, ModelBuilder> = BTreeMap::new();
        for model in self.models {
            let name = model.type_name();
            if by_name.insert(name.clone(), model).is_some() {
                return Err(GraphOrmError::validation(format!("model {name} registered twice")));
            }
        }

        let mut chains: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in by_name.keys() {
            chains.insert(name.clone(), ancestry(&by_name, name)?);
        }

        // Forward descriptors per declaring model, reverse ones per target.
        let mut forward: BTreeMap<String, Vec<RelationshipDescriptor>> = BTreeMap::new();
        let mut reverse: BTreeMap<String, Vec<RelationshipDescriptor>> = BTreeMap::new();
        for (name, model) in &by_name {
            for (attname, rel) in &model.relationships {
                check_attname(name, attname)?;
                if is_reserved_rel(&rel.rel_type) || rel.rel_type.is_empty() {
                    return Err(GraphOrmError::validation(format!(
                        "{name}.{attname}: '{}' is not a usable relationship type",
                        rel.rel_type
                    )));
                }
                let target = resolve(&by_name, &rel.target, &model.app_label)?;
                forward.entry(name.clone()).or_default().push(RelationshipDescriptor {
                    attname: attname.clone(),
                    rel_type: rel.rel_type.clone(),
                    direction: rel.direction,
                    owner: name.clone(),
                    target: target.clone(),
                    multi: rel.multi,
                    ordered: rel.ordered,
                    reverse: false,
                });
                let lower = model.name.to_lowercase();
                let related_name = rel.related_name.clone().unwrap_or_else(|| {
                    if rel.related_multi {
                        format!("{lower}_set")
                    } else {
                        lower
                    }
                });
                reverse.entry(target.clone()).or_default().push(RelationshipDescriptor {
                    attname: related_name,
                    rel_type: rel.rel_type.clone(),
                    direction: rel.direction.reverse(),
                    owner: target,
                    target: name.clone(),
                    multi: rel.related_multi,
                    ordered: false,
                    reverse: true,
                });
            }
        }

        let mut models = BTreeMap::new();
        for (name, chain) in &chains {
            let mut properties = Vec::new();
            let mut relationships: Vec<RelationshipDescriptor> = Vec::new();
            for ancestor in chain {
                let declared = &by_name[ancestor];
                for (prop_name, prop) in &declared.properties {
                    check_attname(name, prop_name)?;
                    if properties.iter().any(|p: &Property| p.name() == prop_name) {
                        return Err(GraphOrmError::validation(format!(
                            "{name}: property '{prop_name}' declared twice"
                        )));
                    }
                    if prop.is_unique() && !prop.is_indexed() {
                        return Err(GraphOrmError::validation(format!(
                            "{name}.{prop_name}: unique properties must be indexed"
                        )));
                    }
                    properties.push(prop.clone().with_name(prop_name));
                }
                let contributed = forward
                    .get(ancestor)
                    .into_iter()
                    .chain(reverse.get(ancestor))
                    .flatten();
                for descriptor in contributed {
                    if relationships.iter().any(|r| r.attname == descriptor.attname)
                        || properties.iter().any(|p| p.name() == descriptor.attname)
                    {
                        return Err(GraphOrmError::validation(format!(
                            "{name}: attribute '{}' clashes with another field",
                            descriptor.attname
                        )));
                    }
                    relationships.push(RelationshipDescriptor {
                        owner: name.clone(),
                        ..descriptor.clone()
                    });
                }
            }
            warn_ambiguous(name, &relationships);
            let descendants: BTreeSet<String> = chains
                .iter()
                .filter(|(_, other)| other.contains(name))
                .map(|(other, _)| other.clone())
                .collect();
            let spec_of = |type_name: &String| {
                let declared = &by_name[type_name];
                TypeSpec {
                    app_label: declared.app_label.clone(),
                    model_name: declared.name.clone(),
                }
            };
            let model = Model {
                spec: spec_of(name),
                chain: chain.iter().map(spec_of).collect(),
                properties,
                relationships,
                descendants,
            };
            debug!(
                model = %name,
                properties = model.properties.len(),
                relationships = model.relationships.len(),
                "graphorm.registry.model_resolved"
            );
            models.insert(name.clone(), Arc::new(model));
        }
        Ok(Registry { models })
    }
}

fn check_attname(model: &str, attname: &str) -> Result<()> {
    if attname.is_empty()
        || attname.starts_with(RESERVED_PREFIX)
        || attname.starts_with("<<")
        || attname.contains("__")
        || RESERVED_ATTRS.contains(&attname)
    {
        return Err(GraphOrmError::validation(format!(
            "{model}: '{attname}' is a reserved attribute name"
        )));
    }
    Ok(())
}

fn resolve(models: &BTreeMap<String, ModelBuilder>, name: &str, app_label: &str) -> Result<String> {
    let qualified = if name.contains('.') {
        name.to_owned()
    } else {
        format!("{app_label}.{name}")
    };
    if models.contains_key(&qualified) {
        Ok(qualified)
    } else {
        Err(GraphOrmError::validation(format!("unknown model '{name}'")))
    }
}

/// Type names from the root ancestor down to `name`.
fn ancestry(models: &BTreeMap<String, ModelBuilder>, name: &str) -> Result<Vec<String>> {
    let mut chain = vec![name.to_owned()];
    let mut current = &models[name];
    while let Some(parent) = &current.parent {
        let parent = resolve(models, parent, &current.app_label)?;
        if chain.contains(&parent) {
            return Err(GraphOrmError::validation(format!(
                "inheritance cycle through {parent}"
            )));
        }
        current = &models[&parent];
        chain.push(parent);
    }
    chain.reverse();
    Ok(chain)
}

/// Two descriptors sharing an edge type and direction cannot tell their edges
/// apart when loaded.
fn warn_ambiguous(model: &str, relationships: &[RelationshipDescriptor]) {
    let mut seen = BTreeMap::new();
    for rel in relationships {
        if let Some(previous) = seen.insert((rel.rel_type.as_str(), rel.direction), rel.attname.as_str()) {
            warn!(
                model,
                rel_type = %rel.rel_type,
                first = previous,
                second = %rel.attname,
                "graphorm.registry.ambiguous_relationship"
            );
        }
    }
}

/// Resolved models, keyed by type name.
#[derive(Debug, Default)]
pub struct Registry {
    models: BTreeMap<String, Arc<Model>>,
}

impl Registry {
    /// Model by `"app.Model"` name.
    pub fn get(&self, type_name: &str) -> Result<Arc<Model>> {
        self.models
            .get(type_name)
            .cloned()
            .ok_or_else(|| GraphOrmError::validation(format!("unknown model '{type_name}'")))
    }

    /// Model of a type node's labels, if registered.
    pub fn by_spec(&self, spec: &TypeSpec) -> Option<Arc<Model>> {
        self.models.get(&spec.type_name()).cloned()
    }

    /// Every registered model.
    pub fn models(&self) -> impl Iterator<Item = &Arc<Model>> {
        self.models.values()
    }

    /// Edge types used by any relationship attribute.
    pub fn rel_types(&self) -> BTreeSet<String> {
        self.models
            .values()
            .flat_map(|m| m.relationships().iter().map(|r| r.rel_type.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Relationship;
    use crate::transport::Direction;

    fn zoo() -> RegistryBuilder {
        RegistryBuilder::new()
            .register(
                ModelBuilder::new("tests", "Animal")
                    .property("name", Property::string().indexed()),
            )
            .register(
                ModelBuilder::new("tests", "Dog")
                    .parent("Animal")
                    .relationship("chases", Relationship::to("tests.Cat", "chases")),
            )
            .register(ModelBuilder::new("tests", "Cat").parent("tests.Animal"))
    }

    #[test]
    fn children_inherit_properties_and_share_family_index() {
        let registry = zoo().build().unwrap();
        let dog = registry.get("tests.Dog").unwrap();
        assert!(dog.property("name").is_some());
        assert_eq!(dog.index_name(), "tests-Animal");
        assert_eq!(dog.chain().len(), 2);
        let animal = registry.get("tests.Animal").unwrap();
        assert!(animal.includes("tests.Cat"));
        assert!(!dog.includes("tests.Animal"));
    }

    #[test]
    fn reverse_side_is_contributed_to_target() {
        let registry = zoo().build().unwrap();
        let cat = registry.get("tests.Cat").unwrap();
        let reverse = cat.relationship("dog_set").unwrap();
        assert_eq!(reverse.direction, Direction::In);
        assert_eq!(reverse.target, "tests.Dog");
        assert!(reverse.reverse);
    }

    #[test]
    fn forward_references_resolve_lazily() {
        let registry = RegistryBuilder::new()
            .register(
                ModelBuilder::new("tests", "Person")
                    .relationship("pet", Relationship::to("Pet", "owns").single().related_single()),
            )
            .register(ModelBuilder::new("tests", "Pet"))
            .build()
            .unwrap();
        let pet = registry.get("tests.Pet").unwrap();
        let owner = pet.relationship("person").unwrap();
        assert!(!owner.multi);
    }

    #[test]
    fn unique_requires_index() {
        let err = RegistryBuilder::new()
            .register(ModelBuilder::new("tests", "Bad").property("name", Property::string().unique()))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[test]
    fn reserved_names_are_rejected() {
        for name in ["id", "_secret", "a__b"] {
            let err = RegistryBuilder::new()
                .register(ModelBuilder::new("tests", "Bad").property(name, Property::string()))
                .build()
                .unwrap_err();
            assert_eq!(err.code(), "Validation", "{name}");
        }
    }

    #[test]
    fn unknown_targets_fail_at_build() {
        let err = RegistryBuilder::new()
            .register(
                ModelBuilder::new("tests", "Lonely")
                    .relationship("friend", Relationship::to("tests.Nobody", "knows")),
            )
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[test]
    fn self_relationships_get_both_sides() {
        let registry = RegistryBuilder::new()
            .register(
                ModelBuilder::new("tests", "Person")
                    .relationship("friends", Relationship::to("tests.Person", "friends_with")),
            )
            .build()
            .unwrap();
        let person = registry.get("tests.Person").unwrap();
        assert_eq!(person.relationships_for("friends_with", Direction::Out).len(), 1);
        assert_eq!(person.relationships_for("friends_with", Direction::In).len(), 1);
        assert_eq!(registry.rel_types().len(), 1);
    }
}
