//! Object-graph mapping over a property-graph server.
//!
//! Models are declared with [`model::ModelBuilder`], resolved by
//! [`model::RegistryBuilder`], and stored through a [`Store`] that routes each
//! database alias to a [`transport::GraphTransport`]. Every concrete model
//! owns a type node; instances hang off it and are indexed in their family
//! index, so queries can answer from the index, walk the type graph, or run a
//! graph query.
//!
//! ```
//! use std::sync::Arc;
//! use graphorm::config::Connections;
//! use graphorm::model::{ModelBuilder, RegistryBuilder};
//! use graphorm::property::Property;
//! use graphorm::transport::MemoryGraph;
//! use graphorm::{Store, Value};
//!
//! let registry = RegistryBuilder::new()
//!     .register(
//!         ModelBuilder::new("tests", "Person")
//!             .property("name", Property::string().indexed())
//!             .property("age", Property::integer().indexed()),
//!     )
//!     .build()
//!     .unwrap();
//! let store = Store::new(registry, Connections::memory(Arc::new(MemoryGraph::new())));
//! store.create("tests.Person", [("name", Value::from("Pete")), ("age", Value::from(30))]).unwrap();
//! store.create("tests.Person", [("name", Value::from("Ann")), ("age", Value::from(12))]).unwrap();
//!
//! let adults = store.objects("tests.Person").filter("age__gte", 18);
//! assert_eq!(adults.count().unwrap(), 1);
//! ```

#![warn(missing_docs)]

pub mod condition;
pub mod config;
pub mod cypher;
pub mod error;
pub mod filter;
pub mod index_query;
pub mod logging;
pub mod model;
pub mod property;
pub mod query;
pub mod signals;
pub mod store;
pub mod transport;
pub mod typegraph;
pub mod value;

pub use condition::Q;
pub use error::{GraphOrmError, Result};
pub use model::{Instance, Model, ModelBuilder, Registry, RegistryBuilder, Relationship};
pub use property::Property;
pub use query::QuerySet;
pub use signals::{Signal, Signals};
pub use store::Store;
pub use value::Value;
