//! Schema layer: typed entities stored as trees of property blobs.
//!
//! # Layout
//!
//! ```text
//! <class-name>/<ident>/<property-name>        value, newline-terminated unless binary
//! <class-name>/<ident>/<child-class>/<ident>  nested typed children
//! <owner>/<class-name>/<ident>                proxy link: target path + "\n"
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gitds::db::Database;
//! use gitds::model::{Fields, Model, ModelClass, PropertyDef, Schema};
//!
//! let widget = ModelClass::builder("widget")
//!     .property(PropertyDef::text("color").default_value("red"))
//!     .build()?;
//! let model = Model::new(Database::open("./store")?, "shop", Schema::new().with(widget)?);
//!
//! let class = model.class("widget")?;
//! let path = class.create(&model.root(), &Fields::ident("w1"))?;
//! let mut w1 = class.open(&model, &path)?;
//! assert_eq!(w1.property("color")?.as_deref(), Some("red"));
//! ```

mod class;
mod error;
mod item;
mod list;
#[allow(clippy::module_inception)]
mod model;
mod property;
mod proxy;

pub use class::{FillContext, FillHook, Fields, IdentFn, ModelClass, ModelClassBuilder, Schema};
pub use error::{ModelError, ModelResult};
pub use item::{ModelItem, Node, Parent};
pub use list::ItemList;
pub use model::Model;
pub use property::{PropertyDef, PropertyKind, PropertyValue, Validator};
pub use proxy::{ItemRef, ProxyItemList};
