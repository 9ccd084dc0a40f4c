//! GitDS - a Git-backed transactional document store
//!
//! Typed entities are stored as trees of blobs in an ordinary git
//! repository. Every completed unit of work is one commit, branches give
//! optimistic isolation, and the whole history is kept in `.git/`.
//!
//! - `storage`: object store, staged index and repository (branches, merge, tags)
//! - `db`: the connection handle, subscriptions and repository settings
//! - `transaction`: commands, transactions, batch mode and branch-and-merge
//! - `model`: schema classes, typed properties, collections and links
//!
//! # Example
//!
//! ```no_run
//! use gitds::db::Database;
//! use gitds::model::{Fields, Model, ModelClass, PropertyDef, Schema};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let widget = ModelClass::builder("widget")
//!     .property(PropertyDef::text("color").default_value("red"))
//!     .build()?;
//! let db = Database::open("./my_store")?;
//! let model = Model::new(db, "shop", Schema::new().with(widget)?);
//!
//! let class = model.class("widget")?;
//! let path = class.create(&model.root(), &Fields::ident("w1"))?;
//! let mut w1 = class.open(&model, &path)?;
//! w1.set_property("color", "blue")?;
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod model;
pub mod storage;
pub mod transaction;

pub use db::{Database, DatabaseConfig, DatabaseError, DatabaseResult};
pub use model::{Model, ModelError, ModelResult};
pub use transaction::{Abort, Outcome};
