//! Models, instances, and relationships.
//!
//! Models are declared with [`ModelBuilder`], resolved together by
//! [`RegistryBuilder`], and instantiated through a [`crate::Store`]:
//!
//! ```
//! use graphorm::model::{ModelBuilder, RegistryBuilder, Relationship};
//! use graphorm::property::Property;
//!
//! let registry = RegistryBuilder::new()
//!     .register(ModelBuilder::new("zoo", "Keeper").property("name", Property::string()))
//!     .register(
//!         ModelBuilder::new("zoo", "Lion")
//!             .property("name", Property::string().indexed())
//!             .relationship("keeper", Relationship::to("zoo.Keeper", "kept_by").single()),
//!     )
//!     .build()
//!     .unwrap();
//! let keeper = registry.get("zoo.Keeper").unwrap();
//! assert!(keeper.relationship("lion_set").is_some());
//! ```

mod definition;
mod instance;
mod manager;
mod registry;
mod relationship;
mod save;

pub use definition::{Model, ModelBuilder, Relationship, RelationshipDescriptor};
pub use instance::Instance;
pub use manager::RelatedManager;
pub use registry::{Registry, RegistryBuilder};
pub use relationship::RelationshipState;
