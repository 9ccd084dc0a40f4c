//! Connection layer: the `Database` handle.
//!
//! A `Database` owns the repository, tracks the open/closed lifecycle,
//! keeps the change-subscription registry and stores connection settings
//! in the repository's git config. Units of work (`exec`, `transaction`,
//! `batch`, `branch_and_merge`) are implemented in `crate::transaction`.

mod api;
mod config;
mod notify;

pub use api::{Database, DatabaseConfig, DatabaseError, DatabaseResult, STORE_VERSION, VERSION_PATH};
pub use config::{clean_key, RepoConfig};
pub use notify::CallbackResult;
