//! Model and relationship declarations.

use std::collections::BTreeSet;

use crate::property::Property;
use crate::transport::{Direction, TypeSpec};
use crate::typegraph::{family_index_name, type_name};

/// Declaration of a relationship from one model to another.
///
/// ```
/// use graphorm::model::Relationship;
///
/// let owner = Relationship::to("tests.Person", "owned_by").single().related_name("pets");
/// assert_eq!(owner.rel_type(), "owned_by");
/// ```
#[derive(Clone, Debug)]
pub struct Relationship {
    pub(crate) target: String,
    pub(crate) rel_type: String,
    pub(crate) direction: Direction,
    pub(crate) multi: bool,
    pub(crate) related_multi: bool,
    pub(crate) ordered: bool,
    pub(crate) related_name: Option<String>,
}

impl Relationship {
    /// Many-valued outgoing relationship of type `rel_type` to `target`
    /// (`"app.Model"`, or a bare model name of the same app).
    pub fn to(target: impl Into<String>, rel_type: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            rel_type: rel_type.into(),
            direction: Direction::Out,
            multi: true,
            related_multi: true,
            ordered: false,
            related_name: None,
        }
    }

    /// At most one target.
    pub fn single(mut self) -> Self {
        self.multi = false;
        self
    }

    /// Any number of targets (the default).
    pub fn many(mut self) -> Self {
        self.multi = true;
        self
    }

    /// The reverse side holds at most one source.
    pub fn related_single(mut self) -> Self {
        self.related_multi = false;
        self
    }

    /// Keep insertion order of targets.
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Attribute name of the reverse side on the target model.
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    /// Edges point from the target at the declaring model.
    pub fn incoming(mut self) -> Self {
        self.direction = Direction::In;
        self
    }

    /// Edge type.
    pub fn rel_type(&self) -> &str {
        &self.rel_type
    }
}

/// Resolved relationship attribute of a model, forward or reverse.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipDescriptor {
    /// Attribute name on the owning model.
    pub attname: String,
    /// Edge type.
    pub rel_type: String,
    /// Edge direction seen from the owning model.
    pub direction: Direction,
    /// Type name of the model declaring the attribute.
    pub owner: String,
    /// Type name of the model on the other end.
    pub target: String,
    /// Holds many targets.
    pub multi: bool,
    /// Targets keep insertion order.
    pub ordered: bool,
    /// Contributed by the other side's declaration.
    pub reverse: bool,
}

/// Declaration of a model, resolved by [`crate::model::RegistryBuilder`].
#[derive(Clone, Debug)]
pub struct ModelBuilder {
    pub(crate) app_label: String,
    pub(crate) name: String,
    pub(crate) parent: Option<String>,
    pub(crate) properties: Vec<(String, Property)>,
    pub(crate) relationships: Vec<(String, Relationship)>,
}

impl ModelBuilder {
    /// Starts a model declaration.
    pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_label: app_label.into(),
            name: name.into(),
            parent: None,
            properties: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Inherits from another registered model.
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Adds a property.
    pub fn property(mut self, name: impl Into<String>, property: Property) -> Self {
        self.properties.push((name.into(), property));
        self
    }

    /// Adds a relationship attribute.
    pub fn relationship(mut self, attname: impl Into<String>, relationship: Relationship) -> Self {
        self.relationships.push((attname.into(), relationship));
        self
    }

    /// `"app.Model"`.
    pub fn type_name(&self) -> String {
        type_name(&self.app_label, &self.name)
    }
}

/// A registered model.
#[derive(Debug)]
pub struct Model {
    pub(crate) spec: TypeSpec,
    pub(crate) chain: Vec<TypeSpec>,
    pub(crate) properties: Vec<Property>,
    pub(crate) relationships: Vec<RelationshipDescriptor>,
    pub(crate) descendants: BTreeSet<String>,
}

impl Model {
    /// App label.
    pub fn app_label(&self) -> &str {
        &self.spec.app_label
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.spec.model_name
    }

    /// `"app.Model"`.
    pub fn type_name(&self) -> String {
        self.spec.type_name()
    }

    /// Labels of the type node.
    pub fn spec(&self) -> &TypeSpec {
        &self.spec
    }

    /// Ancestry, root first, ending with this model.
    pub fn chain(&self) -> &[TypeSpec] {
        &self.chain
    }

    /// Name of the index shared by the model's family.
    pub fn index_name(&self) -> String {
        let root = self.chain.first().unwrap_or(&self.spec);
        family_index_name(&root.app_label, &root.model_name)
    }

    /// All properties, inherited ones first.
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Property by name.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name() == name)
    }

    /// All relationship attributes.
    pub fn relationships(&self) -> &[RelationshipDescriptor] {
        &self.relationships
    }

    /// Relationship attribute by name.
    pub fn relationship(&self, attname: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.attname == attname)
    }

    /// Descriptors matching an edge of `rel_type` seen in `direction`.
    pub fn relationships_for(&self, rel_type: &str, direction: Direction) -> Vec<&RelationshipDescriptor> {
        self.relationships
            .iter()
            .filter(|r| r.rel_type == rel_type && r.direction == direction)
            .collect()
    }

    /// Type names of this model and every registered subtype.
    pub fn descendants(&self) -> &BTreeSet<String> {
        &self.descendants
    }

    /// Whether instances of `type_name` belong to this model's extent.
    pub fn includes(&self, type_name: &str) -> bool {
        self.descendants.contains(type_name)
    }
}
